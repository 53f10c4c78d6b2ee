use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::anyhow;
use rustyxml::{Element as RustyXmlElement, ElementBuilder, Event, Parser, Xml};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_stream::Stream;
use tracing::trace;

use crate::xml::Element;
use crate::xml::Node;
use crate::xmpp::jid::Jid;
use crate::xmpp::stream_header::{LanguageTag, StreamHeader};

use super::{Frame, StreamParser};

const READ_CHUNK_SIZE: usize = 4096;

fn valid_stream_tag(name: &str, namespace: &Option<String>) -> bool {
    name == "stream" && namespace.as_deref() == Some(crate::xml::namespaces::XMPP_STREAMS)
}

impl From<Xml> for Node {
    fn from(xml: Xml) -> Self {
        match xml {
            Xml::ElementNode(element) => Node::Element(element.into()),
            Xml::CharacterNode(text) => Node::Text(text),
            Xml::CDATANode(text) => Node::CData(text),
            Xml::CommentNode(text) => Node::Comment(text),
            Xml::PINode(text) => Node::ProcessingInstruction(text),
        }
    }
}

impl From<RustyXmlElement> for Element {
    fn from(element: RustyXmlElement) -> Self {
        let attributes = element
            .attributes
            .into_iter()
            .map(|((name, namespace), value)| ((name, namespace), value))
            .collect();
        let children = element.children.into_iter().map(Node::from).collect();

        Element {
            name: element.name,
            namespace: element.ns,
            attributes,
            children,
        }
    }
}

/// An XML stream parser backed by `rustyxml`, feeding chunks read off an
/// `AsyncRead` into an incremental SAX-style parser and surfacing
/// `<stream:stream>` open/close and top-level child elements as `Frame`s.
pub struct RustyXmlStreamParser<R> {
    reader: R,
    parser: Parser,
    element_builder: ElementBuilder,
}

impl<R: AsyncRead + Unpin> StreamParser<R> for RustyXmlStreamParser<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            parser: Parser::new(),
            element_builder: ElementBuilder::new(),
        }
    }

    fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: AsyncRead + Unpin> Stream for RustyXmlStreamParser<R> {
    type Item = Result<Frame, anyhow::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            for parser_result in &mut this.parser {
                match parser_result {
                    Ok(Event::ElementStart(tag)) if valid_stream_tag(&tag.name, &tag.ns) => {
                        let header = StreamHeader {
                            from: tag
                                .attributes
                                .get(&("from".to_string(), None))
                                .and_then(|jid| jid.parse::<Jid>().ok()),
                            to: tag
                                .attributes
                                .get(&("to".to_string(), None))
                                .and_then(|jid| jid.parse::<Jid>().ok()),
                            id: None,
                            language: tag
                                .attributes
                                .get(&("lang".to_string(), Some("xml".to_string())))
                                .map(|lang| LanguageTag(lang.to_string())),
                        };
                        return Poll::Ready(Some(Ok(Frame::StreamStart(header))));
                    }
                    Ok(Event::ElementEnd(tag)) if valid_stream_tag(&tag.name, &tag.ns) => {
                        return Poll::Ready(Some(Ok(Frame::StreamEnd)));
                    }
                    Err(err) => {
                        return Poll::Ready(Some(Err(anyhow!(err))));
                    }
                    _ => {}
                }

                if let Some(builder_result) = this.element_builder.handle_event(parser_result) {
                    return match builder_result {
                        Ok(element) => Poll::Ready(Some(Ok(Frame::XmlFragment(element.into())))),
                        Err(err) => Poll::Ready(Some(Err(anyhow!(err)))),
                    };
                }
            }

            let mut raw = [0u8; READ_CHUNK_SIZE];
            let mut buf = ReadBuf::new(&mut raw);
            match Pin::new(&mut this.reader).poll_read(cx, &mut buf) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(err)) => return Poll::Ready(Some(Err(anyhow!(err)))),
                Poll::Pending => return Poll::Pending,
            }

            let filled = buf.filled();
            if filled.is_empty() {
                return Poll::Ready(None);
            }

            match std::str::from_utf8(filled) {
                Ok(text) => {
                    trace!(bytes = filled.len(), "fed bytes to xml parser");
                    this.parser.feed_str(text);
                }
                Err(err) => return Poll::Ready(Some(Err(anyhow!(err)))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn parses_stream_start() {
        use tokio_stream::StreamExt;

        let input = b"<stream:stream xmlns:stream='http://etherx.jabber.org/streams' to='example.com'>".to_vec();
        let mut parser = RustyXmlStreamParser::new(Cursor::new(input));
        let frame = parser.next().await.unwrap().unwrap();
        assert!(matches!(frame, Frame::StreamStart(_)));
    }

    #[tokio::test]
    async fn parses_child_fragment() {
        use tokio_stream::StreamExt;

        let input = b"<stream:stream xmlns:stream='http://etherx.jabber.org/streams'><iq id='1'/>"
            .to_vec();
        let mut parser = RustyXmlStreamParser::new(Cursor::new(input));
        let _ = parser.next().await.unwrap().unwrap();
        let frame = parser.next().await.unwrap().unwrap();
        match frame {
            Frame::XmlFragment(element) => assert_eq!(element.name(), "iq"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
