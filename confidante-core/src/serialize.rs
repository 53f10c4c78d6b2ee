//! Length-prefixed binary encoding for the handful of entities that cross a
//! process boundary as bytes (currently: persisted offline stanzas and
//! cached roster/presence rows in `confidante-backend`). Every value is
//! framed as `u32` big-endian length followed by its payload, recursively
//! for compound types, so a reader never has to guess where one field ends
//! and the next begins.

use anyhow::{bail, Error};

use crate::xml::{Element, Node};
use crate::xmpp::jid::Jid;

pub trait Encode {
    fn encode(&self, out: &mut Vec<u8>);
}

pub trait Decode: Sized {
    fn decode(input: &[u8]) -> Result<(Self, &[u8]), Error>;
}

impl Encode for str {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.len() as u32).to_be_bytes());
        out.extend_from_slice(self.as_bytes());
    }
}

impl Encode for String {
    fn encode(&self, out: &mut Vec<u8>) {
        self.as_str().encode(out);
    }
}

impl Decode for String {
    fn decode(input: &[u8]) -> Result<(Self, &[u8]), Error> {
        let (len, rest) = read_u32(input)?;
        let len = len as usize;
        if rest.len() < len {
            bail!("truncated string payload");
        }
        let (bytes, rest) = rest.split_at(len);
        let value = std::str::from_utf8(bytes)?.to_string();
        Ok((value, rest))
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Some(value) => {
                out.push(1);
                value.encode(out);
            }
            None => out.push(0),
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(input: &[u8]) -> Result<(Self, &[u8]), Error> {
        let (tag, rest) = read_u8(input)?;
        match tag {
            0 => Ok((None, rest)),
            1 => {
                let (value, rest) = T::decode(rest)?;
                Ok((Some(value), rest))
            }
            other => bail!("invalid Option tag {other}"),
        }
    }
}

fn read_u8(input: &[u8]) -> Result<(u8, &[u8]), Error> {
    input.split_first().map(|(b, rest)| (*b, rest)).ok_or_else(|| anyhow::anyhow!("truncated u8"))
}

fn read_u32(input: &[u8]) -> Result<(u32, &[u8]), Error> {
    if input.len() < 4 {
        bail!("truncated u32");
    }
    let (head, rest) = input.split_at(4);
    Ok((u32::from_be_bytes(head.try_into().unwrap()), rest))
}

impl Encode for Jid {
    fn encode(&self, out: &mut Vec<u8>) {
        self.to_string().encode(out);
    }
}

impl Decode for Jid {
    fn decode(input: &[u8]) -> Result<(Self, &[u8]), Error> {
        let (raw, rest) = String::decode(input)?;
        Ok((raw.parse()?, rest))
    }
}

impl Encode for Node {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Node::Element(element) => {
                out.push(0);
                element.encode(out);
            }
            Node::Text(text) => {
                out.push(1);
                text.encode(out);
            }
            Node::CData(text) => {
                out.push(2);
                text.encode(out);
            }
            Node::Comment(text) => {
                out.push(3);
                text.encode(out);
            }
            Node::ProcessingInstruction(text) => {
                out.push(4);
                text.encode(out);
            }
        }
    }
}

impl Decode for Node {
    fn decode(input: &[u8]) -> Result<(Self, &[u8]), Error> {
        let (tag, rest) = read_u8(input)?;
        match tag {
            0 => {
                let (element, rest) = Element::decode(rest)?;
                Ok((Node::Element(element), rest))
            }
            1 => {
                let (text, rest) = String::decode(rest)?;
                Ok((Node::Text(text), rest))
            }
            2 => {
                let (text, rest) = String::decode(rest)?;
                Ok((Node::CData(text), rest))
            }
            3 => {
                let (text, rest) = String::decode(rest)?;
                Ok((Node::Comment(text), rest))
            }
            4 => {
                let (text, rest) = String::decode(rest)?;
                Ok((Node::ProcessingInstruction(text), rest))
            }
            other => bail!("invalid Node tag {other}"),
        }
    }
}

impl Encode for Element {
    fn encode(&self, out: &mut Vec<u8>) {
        self.name().encode(out);
        self.namespace().map(|s| s.to_string()).encode(out);

        let attributes: Vec<_> = self.attributes().collect();
        out.extend_from_slice(&(attributes.len() as u32).to_be_bytes());
        for (name, namespace, value) in attributes {
            name.encode(out);
            namespace.map(|s| s.to_string()).encode(out);
            value.encode(out);
        }

        let children: Vec<_> = self.child_elements().map(Node::Element).collect();
        out.extend_from_slice(&(children.len() as u32).to_be_bytes());
        for child in &children {
            child.encode(out);
        }

        let text = self.text();
        text.encode(out);
    }
}

impl Decode for Element {
    fn decode(input: &[u8]) -> Result<(Self, &[u8]), Error> {
        let (name, rest) = String::decode(input)?;
        let (namespace, rest) = Option::<String>::decode(rest)?;
        let mut element = Element::new(&name, namespace.as_deref());

        let (attr_count, mut rest) = read_u32(rest)?;
        for _ in 0..attr_count {
            let (attr_name, r) = String::decode(rest)?;
            let (attr_ns, r) = Option::<String>::decode(r)?;
            let (attr_value, r) = String::decode(r)?;
            element.set_attribute(attr_name, attr_ns, attr_value);
            rest = r;
        }

        let (child_count, mut rest) = read_u32(rest)?;
        for _ in 0..child_count {
            let (node, r) = Node::decode(rest)?;
            if let Node::Element(child) = node {
                element.add_child(child);
            }
            rest = r;
        }

        let (text, rest) = String::decode(rest)?;
        if !text.is_empty() {
            element.add_text(text);
        }

        Ok((element, rest))
    }
}

/// Encodes `value` to an owned byte vector.
pub fn to_bytes<T: Encode>(value: &T) -> Vec<u8> {
    let mut out = Vec::new();
    value.encode(&mut out);
    out
}

/// Decodes a `T` from `input`, requiring the whole buffer to be consumed.
pub fn from_bytes<T: Decode>(input: &[u8]) -> Result<T, Error> {
    let (value, rest) = T::decode(input)?;
    if !rest.is_empty() {
        bail!("trailing bytes after decoding");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::namespaces;

    #[test]
    fn roundtrips_jid() {
        let jid: Jid = "romeo@montague.lit/orchard".parse().unwrap();
        let bytes = to_bytes(&jid);
        let decoded: Jid = from_bytes(&bytes).unwrap();
        assert_eq!(jid, decoded);
    }

    #[test]
    fn roundtrips_element_with_attributes_and_children() {
        let mut element = Element::new("iq", Some(namespaces::XMPP_CLIENT));
        element.set_attribute("id", None::<String>, "1");
        element.with_child("query", Some("jabber:iq:roster"), |_| {});

        let bytes = to_bytes(&element);
        let decoded: Element = from_bytes(&bytes).unwrap();
        assert_eq!(element, decoded);
    }

    #[test]
    fn roundtrips_element_text() {
        let mut element = Element::new("status", None);
        element.add_text("away");
        let bytes = to_bytes(&element);
        let decoded: Element = from_bytes(&bytes).unwrap();
        assert_eq!(decoded.text(), "away");
    }
}
