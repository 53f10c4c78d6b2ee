use std::sync::Arc;

use anyhow::{Error, anyhow, bail};
use tokio::io::ReadHalf;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio_rustls::rustls::{ClientConfig, pki_types::ServerName};
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use confidante_core::xml::stream_parser::{Frame, StreamParser, rusty_xml::RustyXmlStreamParser};
use confidante_core::xml::{Element, namespaces};
use confidante_core::xmpp::jid::Jid;
use confidante_core::xmpp::stanza::Stanza;
use confidante_core::xmpp::stream::XmppStream;
use confidante_core::xmpp::stream_header::StreamHeader;
use confidante_services::router::RouterHandle;

use crate::connection::OutboundConnection;
use crate::dialback;
use crate::dialer;

pub(crate) const PENDING_BUFFER_SIZE: usize = 64;

#[derive(Clone)]
pub struct OutboundSettings {
    pub dialback_secret: String,
    pub timeout_secs: u64,
    pub max_stanza_size: usize,
}

enum AuthOutcome {
    External,
    Dialback,
}

/// Dials `remote_domain`, negotiates TLS/EXTERNAL/dialback, and spawns the
/// stream's driver task. Returns immediately; stanzas sent to the returned
/// sender are buffered until authentication completes, then flushed in
/// order.
pub fn spawn(
    local_domain: String,
    remote_domain: String,
    client_config: Arc<ClientConfig>,
    settings: OutboundSettings,
    router: RouterHandle,
) -> Sender<Stanza> {
    let (tx, rx) = mpsc::channel(PENDING_BUFFER_SIZE);

    tokio::spawn(async move {
        if let Err(err) = run(local_domain, remote_domain.clone(), client_config, settings, router, rx).await {
            warn!(%err, %remote_domain, "s2s out stream ended");
        }
    });

    tx
}

async fn run(
    local_domain: String,
    remote_domain: String,
    client_config: Arc<ClientConfig>,
    settings: OutboundSettings,
    router: RouterHandle,
    pending: Receiver<Stanza>,
) -> Result<(), Error> {
    let tcp = tokio::time::timeout(
        std::time::Duration::from_secs(settings.timeout_secs),
        dialer::dial(&remote_domain),
    )
    .await
    .map_err(|_| anyhow!("remote-connection-failed: timed out dialing {remote_domain}"))??;

    let server_name = ServerName::try_from(remote_domain.clone())
        .map_err(|_| anyhow!("invalid remote domain for TLS SNI: {remote_domain}"))?;
    let connection = OutboundConnection::new(tcp, client_config, server_name);
    let mut stream = XmppStream::<_, RustyXmlStreamParser<_>>::new(connection);

    let mut remote_stream_id = open_stream(&mut stream, &local_domain, &remote_domain).await?;
    let mut features = read_features(&mut stream).await?;

    if features.find_child("starttls", Some(namespaces::XMPP_STARTTLS)).is_some() {
        negotiate_starttls(&mut stream).await?;
        // a fresh stream open is required after any transport upgrade
        remote_stream_id = open_stream(&mut stream, &local_domain, &remote_domain).await?;
        features = read_features(&mut stream).await?;
    }

    let outcome = negotiate_auth(
        &mut stream,
        &features,
        &local_domain,
        &remote_domain,
        &remote_stream_id,
        &settings,
    )
    .await?;
    let via = match outcome {
        AuthOutcome::External => "external",
        AuthOutcome::Dialback => "dialback",
    };
    debug!(%remote_domain, via, "s2s out stream authenticated");

    drive(stream, pending, router).await
}

async fn open_stream<C, P>(stream: &mut XmppStream<C, P>, local_domain: &str, remote_domain: &str) -> Result<Option<String>, Error>
where
    C: confidante_core::xmpp::stream::Connection,
    P: StreamParser<ReadHalf<C>>,
{
    let header = StreamHeader {
        from: Some(local_domain.parse::<Jid>()?),
        to: Some(remote_domain.parse::<Jid>()?),
        id: None,
        language: None,
    };

    stream
        .writer()
        .write_stream_header(&header, namespaces::XMPP_SERVER, &[("db", namespaces::DIALBACK)], true)
        .await?;

    let frame = stream
        .reader()
        .next()
        .await
        .ok_or_else(|| anyhow!("remote closed stream before opening"))??;

    let Frame::StreamStart(remote_header) = frame else {
        bail!("expected remote stream header");
    };

    Ok(remote_header.id.map(|id| id.to_string()))
}

async fn read_features<C, P>(stream: &mut XmppStream<C, P>) -> Result<Element, Error>
where
    C: confidante_core::xmpp::stream::Connection,
    P: StreamParser<ReadHalf<C>>,
{
    let frame = stream
        .reader()
        .next()
        .await
        .ok_or_else(|| anyhow!("remote closed stream before sending features"))??;

    let Frame::XmlFragment(features) = frame else {
        bail!("expected stream features");
    };

    if !features.validate("features", Some(namespaces::XMPP_STREAMS)) {
        bail!("expected stream features element");
    }

    Ok(features)
}

async fn negotiate_starttls<C, P>(stream: &mut XmppStream<C, P>) -> Result<(), Error>
where
    C: confidante_core::xmpp::stream::Connection,
    P: StreamParser<ReadHalf<C>>,
{
    let mut starttls = Element::new("starttls", Some(namespaces::XMPP_STARTTLS));
    starttls.set_attribute("xmlns", None::<String>, namespaces::XMPP_STARTTLS);
    stream.writer().write_xml_element(&starttls).await?;

    let frame = stream
        .reader()
        .next()
        .await
        .ok_or_else(|| anyhow!("remote closed stream during starttls"))??;

    let Frame::XmlFragment(reply) = frame else {
        bail!("expected starttls reply");
    };

    if !reply.validate("proceed", Some(namespaces::XMPP_STARTTLS)) {
        bail!("remote refused starttls");
    }

    stream.upgrade_to_tls().await
}

async fn negotiate_auth<C, P>(
    stream: &mut XmppStream<C, P>,
    features: &Element,
    local_domain: &str,
    remote_domain: &str,
    remote_stream_id: &Option<String>,
    settings: &OutboundSettings,
) -> Result<AuthOutcome, Error>
where
    C: confidante_core::xmpp::stream::Connection,
    P: StreamParser<ReadHalf<C>>,
{
    let offers_external = features
        .find_child("mechanisms", Some(namespaces::XMPP_SASL))
        .map(|mechanisms| mechanisms.children_named("mechanism").any(|m| m.text() == "EXTERNAL"))
        .unwrap_or(false);

    if stream.is_secure() && offers_external {
        let mut auth = Element::new("auth", Some(namespaces::XMPP_SASL));
        auth.set_attribute("xmlns", None::<String>, namespaces::XMPP_SASL);
        auth.set_attribute("mechanism", None::<String>, "EXTERNAL");
        auth.add_text("=");
        stream.writer().write_xml_element(&auth).await?;

        let frame = stream
            .reader()
            .next()
            .await
            .ok_or_else(|| anyhow!("remote closed stream during EXTERNAL auth"))??;

        let Frame::XmlFragment(reply) = frame else {
            bail!("expected SASL reply");
        };

        if reply.validate("success", Some(namespaces::XMPP_SASL)) {
            return Ok(AuthOutcome::External);
        }

        debug!(remote_domain, "EXTERNAL rejected, falling back to dialback");
    }

    let Some(remote_stream_id) = remote_stream_id else {
        bail!("remote did not assign a stream id for dialback");
    };

    let key = dialback::generate_key(&settings.dialback_secret, local_domain, remote_domain, remote_stream_id)?;
    let result = dialback::build_result(local_domain, remote_domain, &key);
    stream.writer().write_xml_element(&result).await?;

    let frame = stream
        .reader()
        .next()
        .await
        .ok_or_else(|| anyhow!("remote closed stream during dialback"))??;

    let Frame::XmlFragment(reply) = frame else {
        bail!("expected dialback result");
    };

    if reply.attribute("from", None) != Some(remote_domain) || !dialback::result_is_valid(&reply) {
        bail!("dialback authentication failed for {remote_domain}");
    }

    Ok(AuthOutcome::Dialback)
}

async fn drive<C, P>(
    mut stream: XmppStream<C, P>,
    mut pending: Receiver<Stanza>,
    router: RouterHandle,
) -> Result<(), Error>
where
    C: confidante_core::xmpp::stream::Connection,
    P: StreamParser<ReadHalf<C>>,
{
    loop {
        tokio::select! {
            frame = stream.reader().next() => {
                match frame {
                    Some(Ok(Frame::XmlFragment(element))) => {
                        let Ok(stanza) = Stanza::try_from(element) else { continue };
                        if router.stanzas.send(stanza).await.is_err() {
                            bail!("router is gone");
                        }
                    }
                    _ => return Ok(()),
                }
            }
            Some(stanza) = pending.recv() => {
                stream.writer().write_xml_element(&stanza.element).await?;
            }
        }
    }
}
