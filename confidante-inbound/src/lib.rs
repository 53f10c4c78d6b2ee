use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Error, anyhow, bail};
use sasl::StoredPasswordLookup;
use tokio::io::ReadHalf;
use tokio::select;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use confidante_backend::settings::{KeepaliveSettings, ResourceConflictPolicy};
use confidante_core::xml::namespaces;
use confidante_core::xml::stream_parser::StreamParser;
use confidante_core::xml::{Element, stream_parser::Frame};
use confidante_core::xmpp::jid::Jid;
use confidante_core::xmpp::stanza::Stanza;
use confidante_core::xmpp::stream::Connection;
use confidante_core::xmpp::stream::StreamId;
use confidante_core::xmpp::stream::XmppStream;
use confidante_core::xmpp::stream_header::LanguageTag;
use confidante_core::xmpp::stream_header::StreamHeader;
use confidante_services::dispatch::DispatchHandle;
use confidante_services::presence::PresenceHandle;
use confidante_services::router::ManagementCommand;
use confidante_services::router::RouterHandle;

use self::sasl::SaslNegotiator;
use bind::ResourceBindingNegotiator;
use compress::CompressNegotiator;
use starttls::StarttlsNegotiator;

mod bind;
pub mod connection;
mod compress;
pub mod sasl;
mod starttls;

const STANZA_CHANNEL_BUFFER_SIZE: usize = 8;
const PING_NS: &str = "urn:xmpp:ping";

#[derive(Clone, Copy)]
pub enum ConnectionType {
    Client,
    Server,
}

#[derive(Debug, Hash, Eq, PartialEq)]
enum StreamFeatures {
    Tls,
    Authentication,
    Compression,
    ResourceBinding,
}

struct StreamInfo {
    stream_id: StreamId,
    jid: Option<Jid>,
    peer_jid: Option<Jid>,
    peer_language: Option<LanguageTag>,
    connection_type: Option<ConnectionType>,
    features: HashSet<StreamFeatures>,
}

impl Default for StreamInfo {
    fn default() -> Self {
        StreamInfo {
            stream_id: StreamId::new(),
            jid: None,
            peer_jid: None,
            peer_language: None,
            connection_type: None,
            features: HashSet::new(),
        }
    }
}

pub struct InboundStreamSettings {
    pub connection_type: ConnectionType,
    pub domain: Jid,
    pub tls_required: bool,
    pub compression_enabled: bool,
    pub resource_conflict: ResourceConflictPolicy,
    pub keepalive: KeepaliveSettings,
}

pub struct InboundStream<C, P, S>
where
    C: Connection,
    P: StreamParser<ReadHalf<C>>,
    S: StoredPasswordLookup + Send + Sync,
{
    stream: XmppStream<C, P>,
    info: StreamInfo,
    router: RouterHandle,
    dispatch: Option<DispatchHandle>,
    presence: Option<PresenceHandle>,
    stanza_tx: Sender<Stanza>,
    stanza_rx: Receiver<Stanza>,
    store: S,
    settings: InboundStreamSettings,
    pending_ping: Option<String>,
}

impl<C, P, S> InboundStream<C, P, S>
where
    C: Connection,
    P: StreamParser<ReadHalf<C>>,
    S: StoredPasswordLookup + Send + Sync,
{
    pub fn new(
        connection: C,
        router: RouterHandle,
        store: S,
        settings: InboundStreamSettings,
    ) -> Self {
        Self::with_modules(connection, router, None, None, store, settings)
    }

    /// `dispatch` receives iq stanzas addressed to the server itself or to
    /// the bound entity's own bare jid, the shape module IQ handlers expect;
    /// `presence` receives every presence stanza instead of the router, so
    /// it can apply the roster subscription state machine before
    /// broadcasting. Everything else goes straight to the router as before.
    pub fn with_modules(
        connection: C,
        router: RouterHandle,
        dispatch: Option<DispatchHandle>,
        presence: Option<PresenceHandle>,
        store: S,
        settings: InboundStreamSettings,
    ) -> Self {
        let stream = XmppStream::new(connection);
        let info = StreamInfo::default();
        let (stanza_tx, stanza_rx) = mpsc::channel(STANZA_CHANNEL_BUFFER_SIZE);

        InboundStream {
            stream,
            info,
            router,
            dispatch,
            presence,
            stanza_tx,
            stanza_rx,
            store,
            settings,
            pending_ping: None,
        }
    }

    pub async fn handle(&mut self) {
        match self.inner_handle().await {
            Ok(()) => (),
            Err(error) => {
                let _ = self.handle_unrecoverable_error(error).await;
            }
        }
    }

    async fn inner_handle(&mut self) -> Result<(), Error> {
        self.exchange_stream_headers().await?;
        self.advertise_features().await?;

        let keepalive = self.settings.keepalive.send.then_some(Duration::from_secs(self.settings.keepalive.send_interval_secs));
        let mut deadline = keepalive.map(|interval| Instant::now() + interval);

        loop {
            let timer = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));

            select! {
                frame = self.stream.reader().next() => {
                    match frame {
                        Some(Ok(Frame::XmlFragment(element))) => {
                            self.process_element(element).await?;
                            if let Some(interval) = keepalive
                                && self.pending_ping.is_none()
                            {
                                deadline = Some(Instant::now() + interval);
                            }
                        }
                        _ => {
                            // assume peer terminated stream
                            self.register_peer_jid(None).await;
                            let _ = self.stream.writer().write_stream_close().await;
                            return Ok(());
                        }
                    }
                }
                Some(Stanza { element }) = self.stanza_rx.recv() => {
                    self.stream.writer().write_xml_element(&element).await?;
                }
                () = tokio::time::sleep_until(timer), if keepalive.is_some() => {
                    let interval = keepalive.expect("guarded by keepalive.is_some()");
                    if self.pending_ping.take().is_some() {
                        self.close_stream_with_error("connection-timeout").await?;
                        return Ok(());
                    }

                    let id = uuid::Uuid::new_v4().to_string();
                    self.send_ping(&id).await?;
                    self.pending_ping = Some(id);
                    deadline = Some(Instant::now() + interval / 3);
                }
            }
        }
    }

    async fn process_element(&mut self, element: Element) -> Result<(), Error> {
        if self.is_pending_pong(&element) {
            self.pending_ping = None;
            return Ok(());
        }

        for feature in self.negotiable_features() {
            match self.negotiate_feature(feature, &element).await {
                Ok(()) => return Ok(()),
                Err(error) => debug!(%error, "feature negotiation did not apply to this element"),
            }
        }

        // element must be a stanza at this point
        let stanza = Stanza { element };

        if let Some(presence) = &self.presence
            && stanza.kind() == Some(confidante_core::xmpp::stanza::StanzaKind::Presence)
        {
            presence.presence(stanza).await;
            return Ok(());
        }

        if let Some(dispatch) = &self.dispatch
            && self.targets_own_modules(&stanza)
        {
            dispatch.dispatch(stanza).await;
            return Ok(());
        }

        self.router
            .stanzas
            .send(stanza)
            .await
            .map_err(|_| anyhow!("failed to route stanza"))
    }

    fn is_pending_pong(&self, element: &Element) -> bool {
        let Some(pending_id) = &self.pending_ping else { return false };
        element.name() == "iq"
            && element.attribute("type", None) == Some("result")
            && element.attribute("id", None) == Some(pending_id.as_str())
    }

    /// Module IQ handlers only ever answer requests addressed to the server
    /// domain itself or to the requester's own bare jid (disco, vcard,
    /// private storage, registration, and the rest never act on third-party
    /// destinations).
    fn targets_own_modules(&self, stanza: &Stanza) -> bool {
        if stanza.kind() != Some(confidante_core::xmpp::stanza::StanzaKind::Iq) {
            return false;
        }

        let Some(to) = stanza.to_jid() else { return true };

        if to.node().is_none() && to.domain() == self.settings.domain.domain() {
            return true;
        }

        self.info
            .peer_jid
            .as_ref()
            .is_some_and(|peer| peer.to_bare() == to.to_bare())
    }

    fn negotiable_features(&self) -> Vec<StreamFeatures> {
        let mut features = vec![];

        if self.stream.is_starttls_allowed() && !self.info.features.contains(&StreamFeatures::Tls) {
            features.push(StreamFeatures::Tls);
        }

        if (!self.settings.tls_required || self.info.features.contains(&StreamFeatures::Tls))
            && !self.info.features.contains(&StreamFeatures::Authentication)
        {
            features.push(StreamFeatures::Authentication);
        }

        if let Some(ConnectionType::Client) = self.info.connection_type
            && self.settings.compression_enabled
            && self.info.features.contains(&StreamFeatures::Authentication)
            && !self.info.features.contains(&StreamFeatures::Compression)
            && !self
                .info
                .features
                .contains(&StreamFeatures::ResourceBinding)
        {
            features.push(StreamFeatures::Compression);
        }

        if let Some(ConnectionType::Client) = self.info.connection_type
            && self.info.features.contains(&StreamFeatures::Authentication)
            && !self
                .info
                .features
                .contains(&StreamFeatures::ResourceBinding)
        {
            features.push(StreamFeatures::ResourceBinding);
        }

        features
    }

    async fn negotiate_feature(
        &mut self,
        feature: StreamFeatures,
        element: &Element,
    ) -> Result<(), Error> {
        match feature {
            StreamFeatures::Tls => {
                StarttlsNegotiator::negotiate_feature(&mut self.stream, element).await?;
                self.info.features.insert(StreamFeatures::Tls);
                self.stream.reset();
                self.exchange_stream_headers().await?;
                self.advertise_features().await?;
            }
            StreamFeatures::Authentication => {
                let peer_jid = Some(
                    SaslNegotiator::negotiate_feature(
                        &mut self.stream,
                        element,
                        self.store.clone(),
                    )
                    .await?,
                );
                debug!(?peer_jid, "stream authenticated");
                self.register_peer_jid(peer_jid).await;
                self.info.features.insert(StreamFeatures::Authentication);
                self.stream.reset();
                self.exchange_stream_headers().await?;
                self.advertise_features().await?;
            }
            StreamFeatures::Compression => {
                let compressed =
                    CompressNegotiator::negotiate_feature(&mut self.stream, element).await?;
                self.info.features.insert(StreamFeatures::Compression);
                if compressed {
                    self.stream.reset();
                    self.exchange_stream_headers().await?;
                    self.advertise_features().await?;
                }
            }
            StreamFeatures::ResourceBinding => {
                let bound = ResourceBindingNegotiator::negotiate_feature(
                    &mut self.stream,
                    element,
                    &self.info.peer_jid,
                    &self.router,
                    self.settings.resource_conflict,
                )
                .await?;

                if let Some(bound_entity) = bound {
                    self.register_peer_jid(Some(bound_entity)).await;
                }
                self.info.features.insert(StreamFeatures::ResourceBinding);
            }
        }

        Ok(())
    }

    async fn register_peer_jid(&mut self, peer_jid: Option<Jid>) {
        if let Some(entity) = self.info.peer_jid.take() {
            self.router
                .management
                .send(ManagementCommand::Unregister(entity.clone()))
                .await
                .unwrap();
            if let Some(presence) = &self.presence {
                presence.unbind(entity).await;
            }
        }

        self.info.peer_jid = peer_jid;

        if let Some(entity) = self.info.peer_jid.clone() {
            self.router
                .management
                .send(ManagementCommand::Register(entity.clone(), self.stanza_tx.clone()))
                .await
                .unwrap();
            if let Some(presence) = &self.presence {
                presence.bind(entity).await;
            }
        }
    }

    async fn advertise_features(&mut self) -> Result<(), Error> {
        let mut features = Element::new("features", Some(namespaces::XMPP_STREAMS));
        for feature in self.negotiable_features() {
            let feature = match feature {
                StreamFeatures::Tls => StarttlsNegotiator::advertise_feature(),
                StreamFeatures::Authentication => SaslNegotiator::advertise_feature(
                    self.stream.is_secure(),
                    self.stream.is_authenticated(),
                ),
                StreamFeatures::Compression => CompressNegotiator::advertise_feature(),
                StreamFeatures::ResourceBinding => ResourceBindingNegotiator::advertise_feature(),
            };
            features.add_child(feature);
        }

        self.stream.writer().write_xml_element(&features).await
    }

    async fn exchange_stream_headers(&mut self) -> Result<(), Error> {
        let Ok(frame) = self
            .stream
            .reader()
            .next()
            .await
            .ok_or(anyhow!("stream closed by peer"))?
        else {
            self.send_stream_header(None).await?;
            self.handle_unrecoverable_error(anyhow!("expected xml frame"))
                .await?;
            bail!("expected xml frame");
        };

        let Frame::StreamStart(inbound_header) = frame else {
            self.send_stream_header(None).await?;
            self.handle_unrecoverable_error(anyhow!("expected stream header"))
                .await?;
            bail!("expected stream header");
        };

        self.info.jid = inbound_header.to;
        self.info.peer_language = inbound_header.language;
        self.info.connection_type = Some(self.settings.connection_type);

        self.send_stream_header(self.info.peer_jid.clone()).await
    }

    async fn send_stream_header(&mut self, to: Option<Jid>) -> Result<(), Error> {
        let outbound_header = StreamHeader {
            from: Some(self.settings.domain.clone()),
            to,
            id: Some(self.info.stream_id.clone()),
            language: None,
        };

        self.stream
            .writer()
            .write_stream_header(&outbound_header, namespaces::XMPP_CLIENT, &[], true)
            .await
    }

    async fn handle_unrecoverable_error(&mut self, error: Error) -> Result<(), Error> {
        warn!(%error, "closing stream after unrecoverable error");
        self.close_stream_with_error("internal-server-error").await
    }

    async fn close_stream_with_error(&mut self, condition: &str) -> Result<(), Error> {
        let mut error = Element::new("error", Some(namespaces::XMPP_STREAMS));
        error.with_child(condition, Some(namespaces::XMPP_STREAM_ERRORS), |condition_el| {
            condition_el.set_attribute("xmlns", None::<String>, namespaces::XMPP_STREAM_ERRORS);
        });

        self.stream.writer().write_xml_element(&error).await?;
        self.stream.writer().write_stream_close().await
    }

    async fn send_ping(&mut self, id: &str) -> Result<(), Error> {
        let mut element = Element::new("iq", None);
        element.set_attribute("type", None::<String>, "get");
        element.set_attribute("id", None::<String>, id);
        element.with_child("ping", Some(PING_NS), |_| {});
        self.stream.writer().write_xml_element(&element).await
    }
}
