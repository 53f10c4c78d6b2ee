use std::fmt::{self, Display, Formatter};

use anyhow::{bail, Error};

use crate::xml::Element;

use super::jid::Jid;

/// The three top-level stanza kinds defined by RFC 6120 §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    Iq,
    Message,
    Presence,
}

impl Display for StanzaKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            StanzaKind::Iq => "iq",
            StanzaKind::Message => "message",
            StanzaKind::Presence => "presence",
        };
        write!(f, "{name}")
    }
}

/// A stanza is an `iq`, `message`, or `presence` top-level element routed
/// between streams. `from`/`to` are read from (and written back to) the
/// wrapped element's attributes so the two representations never diverge.
#[derive(Debug, Clone)]
pub struct Stanza {
    pub element: Element,
}

impl Stanza {
    pub fn kind(&self) -> Option<StanzaKind> {
        match self.element.name() {
            "iq" => Some(StanzaKind::Iq),
            "message" => Some(StanzaKind::Message),
            "presence" => Some(StanzaKind::Presence),
            _ => None,
        }
    }

    pub fn from_jid(&self) -> Option<Jid> {
        self.element.attribute("from", None)?.parse().ok()
    }

    pub fn to_jid(&self) -> Option<Jid> {
        self.element.attribute("to", None)?.parse().ok()
    }

    pub fn id(&self) -> Option<&str> {
        self.element.attribute("id", None)
    }

    pub fn set_from_jid(&mut self, jid: &Jid) {
        self.element.set_attribute("from", None::<String>, jid.to_string());
    }

    pub fn set_to_jid(&mut self, jid: &Jid) {
        self.element.set_attribute("to", None::<String>, jid.to_string());
    }

    /// Builds an `<iq type="error">` (or message/presence error) bounce for
    /// `original`, with the from/to pair reversed.
    pub fn error_reply(original: &Stanza, condition: &str, namespace: &str) -> Result<Stanza, Error> {
        let kind = original.kind().ok_or_else(|| anyhow::anyhow!("not a stanza"))?;
        let mut element = Element::new(&kind.to_string(), original.element.namespace());
        if let Some(id) = original.id() {
            element.set_attribute("id", None::<String>, id);
        }
        element.set_attribute("type", None::<String>, "error");
        if let Some(from) = original.to_jid() {
            element.set_attribute("from", None::<String>, from.to_string());
        }
        if let Some(to) = original.from_jid() {
            element.set_attribute("to", None::<String>, to.to_string());
        }
        element.with_child("error", None, |error| {
            error.set_attribute("type", None::<String>, "cancel");
            error.with_child(condition, Some(namespace), |_| {});
        });

        Ok(Stanza { element })
    }
}

impl Stanza {
    /// Builds an `<iq type="result">` reply for `original`, with the
    /// from/to pair reversed. `build` fills in the reply's children.
    pub fn result_reply(original: &Stanza, build: impl FnOnce(&mut Element)) -> Result<Stanza, Error> {
        if original.kind() != Some(StanzaKind::Iq) {
            bail!("result replies are only defined for iq stanzas");
        }

        let mut element = Element::new("iq", original.element.namespace());
        if let Some(id) = original.id() {
            element.set_attribute("id", None::<String>, id);
        }
        element.set_attribute("type", None::<String>, "result");
        if let Some(from) = original.to_jid() {
            element.set_attribute("from", None::<String>, from.to_string());
        }
        if let Some(to) = original.from_jid() {
            element.set_attribute("to", None::<String>, to.to_string());
        }
        build(&mut element);

        Ok(Stanza { element })
    }
}

impl TryFrom<Element> for Stanza {
    type Error = Error;

    fn try_from(element: Element) -> Result<Self, Self::Error> {
        match element.name() {
            "iq" | "message" | "presence" => Ok(Stanza { element }),
            other => bail!("element <{other}> is not a stanza"),
        }
    }
}

impl From<Stanza> for Element {
    fn from(stanza: Stanza) -> Self {
        stanza.element
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::namespaces;

    #[test]
    fn recognizes_stanza_kinds() {
        let element = Element::new("iq", Some(namespaces::XMPP_CLIENT));
        let stanza = Stanza::try_from(element).unwrap();
        assert_eq!(stanza.kind(), Some(StanzaKind::Iq));
    }

    #[test]
    fn rejects_non_stanza_elements() {
        let element = Element::new("features", Some(namespaces::XMPP_STREAMS));
        assert!(Stanza::try_from(element).is_err());
    }

    #[test]
    fn reads_from_and_to() {
        let mut element = Element::new("message", Some(namespaces::XMPP_CLIENT));
        element.set_attribute("from", None::<String>, "romeo@montague.lit/orchard");
        element.set_attribute("to", None::<String>, "juliet@capulet.lit");
        let stanza = Stanza::try_from(element).unwrap();
        assert_eq!(stanza.from_jid().unwrap().to_string(), "romeo@montague.lit/orchard");
        assert_eq!(stanza.to_jid().unwrap().to_string(), "juliet@capulet.lit");
    }

    #[test]
    fn error_reply_swaps_from_and_to() {
        let mut element = Element::new("iq", Some(namespaces::XMPP_CLIENT));
        element.set_attribute("id", None::<String>, "1");
        element.set_attribute("from", None::<String>, "romeo@montague.lit/orchard");
        element.set_attribute("to", None::<String>, "juliet@capulet.lit");
        let stanza = Stanza::try_from(element).unwrap();

        let reply = Stanza::error_reply(&stanza, "item-not-found", namespaces::XMPP_STREAM_ERRORS).unwrap();
        assert_eq!(reply.from_jid().unwrap().to_string(), "juliet@capulet.lit");
        assert_eq!(reply.to_jid().unwrap().to_string(), "romeo@montague.lit/orchard");
        assert_eq!(reply.element.attribute("type", None), Some("error"));
    }
}
