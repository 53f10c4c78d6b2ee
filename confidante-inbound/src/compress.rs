use anyhow::{bail, Error};
use tokio::io::ReadHalf;

use confidante_core::{
    xml::{Element, namespaces, stream_parser::StreamParser},
    xmpp::stream::{Connection, XmppStream},
};

pub(super) struct CompressNegotiator {
    _private: (),
}

impl CompressNegotiator {
    pub fn advertise_feature() -> Element {
        let mut compression = Element::new("compression", Some(namespaces::COMPRESS));
        compression.set_attribute("xmlns", None::<String>, namespaces::COMPRESS);

        let mut method = Element::new("method", Some(namespaces::COMPRESS));
        method.add_text("zlib");
        compression.add_child(method);

        compression
    }

    /// Returns whether compression was actually enabled. On `false` the
    /// stream continues uncompressed and unreset; the caller should not
    /// offer compression again.
    pub async fn negotiate_feature<C, P>(
        stream: &mut XmppStream<C, P>,
        element: &Element,
    ) -> Result<bool, Error>
    where
        C: Connection,
        P: StreamParser<ReadHalf<C>>,
    {
        if !element.validate("compress", Some(namespaces::COMPRESS)) {
            bail!("expected compress element");
        }

        let method = element.find_child("method", Some(namespaces::COMPRESS)).map(Element::text);

        match method.as_deref() {
            Some("zlib") => {
                let mut compressed = Element::new("compressed", Some(namespaces::COMPRESS));
                compressed.set_attribute("xmlns", None::<String>, namespaces::COMPRESS);
                stream.writer().write_xml_element(&compressed).await?;

                stream.enable_compression()?;

                Ok(true)
            }
            Some(_) => {
                Self::send_failure(stream, "unsupported-method").await?;
                Ok(false)
            }
            None => {
                Self::send_failure(stream, "setup-failed").await?;
                Ok(false)
            }
        }
    }

    async fn send_failure<C, P>(stream: &mut XmppStream<C, P>, reason: &str) -> Result<(), Error>
    where
        C: Connection,
        P: StreamParser<ReadHalf<C>>,
    {
        let mut failure = Element::new("failure", Some(namespaces::COMPRESS));
        failure.set_attribute("xmlns", None::<String>, namespaces::COMPRESS);
        failure.add_child(Element::new(reason, Some(namespaces::COMPRESS)));

        stream.writer().write_xml_element(&failure).await
    }
}
