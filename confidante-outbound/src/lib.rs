use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::RwLock;
use tokio_rustls::rustls::ClientConfig;
use tracing::{info, warn};

use confidante_core::xmpp::stanza::Stanza;
use confidante_services::router::RouterHandle;

pub mod connection;
mod dialback;
mod dialer;
mod out;

pub use out::OutboundSettings;

/// Owns the shared `(localDomain, remoteDomain) -> stream` table and the
/// single task that drains stanzas the router couldn't deliver locally,
/// dialing (or reusing) the matching out stream for each one.
pub struct OutboundProvider {
    local_domain: String,
    client_config: Arc<ClientConfig>,
    settings: OutboundSettings,
    router: RouterHandle,
    connections: RwLock<HashMap<String, Sender<Stanza>>>,
}

impl OutboundProvider {
    pub fn new(
        local_domain: String,
        client_config: Arc<ClientConfig>,
        settings: OutboundSettings,
        router: RouterHandle,
    ) -> Arc<Self> {
        Arc::new(OutboundProvider {
            local_domain,
            client_config,
            settings,
            router,
            connections: RwLock::new(HashMap::new()),
        })
    }

    /// Spawns the dispatcher task draining `remote`. `remote` is the
    /// receiving end of the `Sender<Stanza>` passed to `RouterHandle::new`.
    pub fn spawn(self: Arc<Self>, mut remote: Receiver<Stanza>) {
        tokio::spawn(async move {
            while let Some(stanza) = remote.recv().await {
                self.dispatch(stanza).await;
            }
        });
    }

    async fn dispatch(&self, stanza: Stanza) {
        let Some(to) = stanza.to_jid() else {
            warn!("dropping outbound stanza with no destination");
            return;
        };
        let remote_domain = to.domain().to_string();

        let sender = self.get_out(&remote_domain).await;
        if sender.send(stanza).await.is_err() {
            warn!(%remote_domain, "s2s out stream is gone, dropping stanza");
            self.connections.write().await.remove(&remote_domain);
        }
    }

    /// Double-checked table lookup: cheap read lock on the common path,
    /// upgraded to a write lock only the first time a domain pair is seen.
    async fn get_out(&self, remote_domain: &str) -> Sender<Stanza> {
        if let Some(sender) = self.connections.read().await.get(remote_domain) {
            return sender.clone();
        }

        let mut connections = self.connections.write().await;
        if let Some(sender) = connections.get(remote_domain) {
            return sender.clone();
        }

        info!(%remote_domain, "dialing new s2s out stream");
        let sender = out::spawn(
            self.local_domain.clone(),
            remote_domain.to_string(),
            self.client_config.clone(),
            self.settings.clone(),
            self.router.clone(),
        );
        connections.insert(remote_domain.to_string(), sender.clone());

        sender
    }
}
