pub mod namespaces;
pub mod stream_parser;
pub mod stream_writer;

/// A node inside an [`Element`]'s child list.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
    CData(String),
    Comment(String),
    ProcessingInstruction(String),
}

/// The sole wire representation used throughout the server: every stanza is
/// an `Element` whose name is one of `iq`, `presence`, `message` (see
/// `crate::xmpp::stanza`).
///
/// Attributes and children are kept in insertion order; `set_attribute` is
/// last-write-wins.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub(crate) name: String,
    pub(crate) namespace: Option<String>,
    pub(crate) attributes: Vec<((String, Option<String>), String)>,
    pub(crate) children: Vec<Node>,
}

impl Element {
    pub fn new(name: &str, namespace: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.map(|s| s.to_string()),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn validate(&self, name: &str, namespace: Option<&str>) -> bool {
        self.name == name && self.namespace.as_deref() == namespace
    }

    pub fn attribute(&self, name: &str, namespace: Option<&str>) -> Option<&str> {
        self.attributes
            .iter()
            .rev()
            .find(|((attr_name, attr_ns), _)| attr_name == name && attr_ns.as_deref() == namespace)
            .map(|(_, value)| value.as_str())
    }

    /// Last-write-wins: an existing attribute with the same (name, namespace)
    /// key is overwritten in place so ordering is preserved for unrelated
    /// attributes.
    pub fn set_attribute(
        &mut self,
        name: impl Into<String>,
        namespace: Option<impl Into<String>>,
        value: impl Into<String>,
    ) {
        let name = name.into();
        let namespace = namespace.map(|ns| ns.into());
        let value = value.into();

        if let Some(existing) = self
            .attributes
            .iter_mut()
            .find(|((attr_name, attr_ns), _)| *attr_name == name && *attr_ns == namespace)
        {
            existing.1 = value;
        } else {
            self.attributes.push(((name, namespace), value));
        }
    }

    pub fn remove_attribute(&mut self, name: &str, namespace: Option<&str>) {
        self.attributes
            .retain(|((attr_name, attr_ns), _)| !(attr_name == name && attr_ns.as_deref() == namespace));
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, Option<&str>, &str)> {
        self.attributes
            .iter()
            .map(|((name, ns), value)| (name.as_str(), ns.as_deref(), value.as_str()))
    }

    pub fn find_child(&self, name: &str, namespace: Option<&str>) -> Option<&Element> {
        self.children.iter().find_map(|child| match child {
            Node::Element(element) if element.name == name && element.namespace.as_deref() == namespace => {
                Some(element)
            }
            _ => None,
        })
    }

    pub fn find_child_mut(&mut self, name: &str, namespace: Option<&str>) -> Option<&mut Element> {
        self.children.iter_mut().find_map(|child| match child {
            Node::Element(element) if element.name == name && element.namespace.as_deref() == namespace => {
                Some(element)
            }
            _ => None,
        })
    }

    /// All direct child elements with the given name, regardless of namespace.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter_map(move |child| match child {
            Node::Element(element) if element.name == name => Some(element),
            _ => None,
        })
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|child| match child {
            Node::Element(element) => Some(element),
            _ => None,
        })
    }

    pub fn text(&self) -> String {
        let mut text = String::new();
        for child in &self.children {
            match child {
                Node::Text(s) | Node::CData(s) => text.push_str(s),
                _ => {}
            }
        }
        text
    }

    /// Replaces any direct text content with `text`. Child elements are left
    /// untouched; stanzas never mix significant text with child elements at
    /// the same level.
    pub fn set_text(&mut self, text: impl Into<String>) {
        let text = text.into();
        self.children.retain(|c| !matches!(c, Node::Text(_) | Node::CData(_)));
        if !text.is_empty() {
            self.children.push(Node::Text(text));
        }
    }

    pub fn append_element(&mut self, element: Element) -> &mut Self {
        self.children.push(Node::Element(element));
        self
    }

    pub fn append_elements(&mut self, elements: impl IntoIterator<Item = Element>) -> &mut Self {
        self.children.extend(elements.into_iter().map(Node::Element));
        self
    }

    /// Removes only child elements; text/comment/PI nodes are preserved.
    pub fn clear_elements(&mut self) {
        self.children.retain(|c| !matches!(c, Node::Element(_)));
    }

    pub fn remove_elements(&mut self, name: &str) {
        self.children.retain(|c| !matches!(c, Node::Element(e) if e.name == name));
    }

    pub fn add_child(&mut self, element: Element) {
        self.children.push(Node::Element(element));
    }

    pub fn with_child<F>(&mut self, name: &str, namespace: Option<&str>, f: F) -> &mut Self
    where
        F: FnOnce(&mut Element),
    {
        let mut element = Element::new(name, namespace);
        f(&mut element);
        self.children.push(Node::Element(element));
        self
    }

    pub fn add_text(&mut self, text: impl Into<String>) {
        self.children.push(Node::Text(text.into()));
    }
}

/// Escapes text per the reserved-character set `" ' & < > \t \r`; `\n` is
/// left untouched. Out-of-range scalar values cannot occur in a Rust `str`,
/// so `U+FFFD` substitution is handled at decode time instead (see
/// `stream_parser`).
pub fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\t' => out.push_str("&#9;"),
            '\r' => out.push_str("&#13;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_simple() {
        let element = Element::new("foo", Some("bar"));
        assert!(element.validate("foo", Some("bar")));
    }

    #[test]
    fn validate_different_name() {
        let element = Element::new("foo", Some("bar"));
        assert!(!element.validate("baz", Some("bar")));
    }

    #[test]
    fn validate_different_namespace() {
        let element = Element::new("foo", Some("bar"));
        assert!(!element.validate("foo", Some("baz")));
    }

    #[test]
    fn attribute_last_write_wins() {
        let mut element = Element::new("foo", Some("bar"));
        element.set_attribute("baz", None::<String>, "qux");
        element.set_attribute("baz", None::<String>, "overwritten");
        assert_eq!(element.attribute("baz", None), Some("overwritten"));
        assert_eq!(element.attributes.len(), 1);
    }

    #[test]
    fn attribute_missing() {
        let element = Element::new("foo", Some("bar"));
        assert_eq!(element.attribute("baz", None), None);
    }

    #[test]
    fn remove_attribute() {
        let mut element = Element::new("foo", None);
        element.set_attribute("baz", None::<String>, "qux");
        element.remove_attribute("baz", None);
        assert_eq!(element.attribute("baz", None), None);
    }

    #[test]
    fn child_single() {
        let mut parent = Element::new("foo", Some("bar"));
        parent.add_child(Element::new("baz", Some("qux")));
        assert!(parent.find_child("baz", Some("qux")).is_some());
    }

    #[test]
    fn child_missing() {
        let parent = Element::new("foo", Some("bar"));
        assert!(parent.find_child("baz", Some("qux")).is_none());
    }

    #[test]
    fn child_helper() {
        let mut parent = Element::new("foo", Some("bar"));
        parent.with_child("baz", Some("qux"), |child| {
            child.set_attribute("quux", None::<String>, "corge");
        });
        assert_eq!(
            parent.find_child("baz", Some("qux")).unwrap().attribute("quux", None),
            Some("corge")
        );
    }

    #[test]
    fn children_named_ignores_namespace() {
        let mut parent = Element::new("foo", None);
        parent.add_child(Element::new("item", Some("ns1")));
        parent.add_child(Element::new("item", Some("ns2")));
        assert_eq!(parent.children_named("item").count(), 2);
    }

    #[test]
    fn remove_elements_by_name() {
        let mut parent = Element::new("foo", None);
        parent.add_child(Element::new("item", None));
        parent.add_child(Element::new("keep", None));
        parent.remove_elements("item");
        assert!(parent.find_child("item", None).is_none());
        assert!(parent.find_child("keep", None).is_some());
    }

    #[test]
    fn clear_elements_preserves_text() {
        let mut parent = Element::new("foo", None);
        parent.add_text("hello");
        parent.add_child(Element::new("item", None));
        parent.clear_elements();
        assert_eq!(parent.text(), "hello");
        assert!(parent.find_child("item", None).is_none());
    }

    #[test]
    fn text_simple() {
        let mut element = Element::new("foo", Some("bar"));
        element.add_text("baz");
        assert_eq!(element.text(), "baz");
    }

    #[test]
    fn text_nested_direct_children_only() {
        let mut parent = Element::new("foo", Some("bar"));
        parent.add_text("before");
        parent.with_child("baz", Some("qux"), |child| {
            child.add_text("inside");
        });
        parent.add_text("after");
        assert_eq!(parent.text(), "beforeafter");
    }

    #[test]
    fn set_text_replaces_existing_text() {
        let mut element = Element::new("foo", None);
        element.add_text("before");
        element.set_text("after");
        assert_eq!(element.text(), "after");
    }

    #[test]
    fn escape_reserved_characters() {
        assert_eq!(escape("<a>&'\"\t\r"), "&lt;a&gt;&amp;&apos;&quot;&#9;&#13;");
    }
}
