use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use confidante_backend::blocklist::BlockListHandle;
use confidante_backend::offline::OfflineHandle;
use confidante_backend::store::StoreHandle;
use confidante_core::xml::namespaces;
use confidante_core::xmpp::jid::Jid;
use confidante_core::xmpp::stanza::{Stanza, StanzaKind};

use crate::hosts::HostRegistry;

/// Commands streams use to announce themselves to the router, withdraw, or
/// report a presence priority change.
#[derive(Debug)]
pub enum ManagementCommand {
    Register(Jid, mpsc::Sender<Stanza>),
    Unregister(Jid),
    SetPriority(Jid, i8),
}

/// Read-only questions about the router's live registration table.
enum Query {
    IsBound { jid: Jid, result_tx: oneshot::Sender<bool> },
}

struct Resource {
    stanzas: mpsc::Sender<Stanza>,
    priority: i8,
}

/// Why a stanza addressed to this server couldn't reach a live resource:
/// distinguishes a nonexistent account from one that's merely offline, and a
/// bare-jid miss from a specific-resource miss, each of which bounces with a
/// different stanza condition.
enum DeliveryFailure {
    /// Bare jid's account does not exist in storage at all.
    NoSuchAccount,
    /// Account exists but has no bound resource.
    NotAuthenticated,
    /// Account exists and has other bound resources, but not this one.
    ResourceNotFound,
}

struct Router {
    stanzas: mpsc::Receiver<Stanza>,
    management: mpsc::Receiver<ManagementCommand>,
    queries: mpsc::Receiver<Query>,
    entities: HashMap<Jid, Resource>,
    hosts: HostRegistry,
    blocklist: BlockListHandle,
    offline: OfflineHandle,
    store: StoreHandle,
    remote: mpsc::Sender<Stanza>,
}

impl Router {
    async fn run(&mut self) {
        loop {
            tokio::select! {
                Some(stanza) = self.stanzas.recv() => self.route_stanza(stanza, true).await,
                Some(command) = self.management.recv() => self.handle_management(command),
                Some(query) = self.queries.recv() => self.handle_query(query).await,
                else => break,
            }
        }
    }

    fn handle_management(&mut self, command: ManagementCommand) {
        match command {
            ManagementCommand::Register(jid, sender) => {
                debug!(%jid, "registered entity");
                self.entities.insert(jid, Resource { stanzas: sender, priority: 0 });
            }
            ManagementCommand::Unregister(jid) => {
                debug!(%jid, "unregistered entity");
                self.entities.remove(&jid);
            }
            ManagementCommand::SetPriority(jid, priority) => {
                if let Some(resource) = self.entities.get_mut(&jid) {
                    resource.priority = priority;
                }
            }
        }
    }

    async fn handle_query(&mut self, query: Query) {
        match query {
            Query::IsBound { jid, result_tx } => {
                let _ = result_tx.send(self.entities.contains_key(&jid));
            }
        }
    }

    /// Routes one stanza. `check_blocklist` is false for bounces the router
    /// builds itself, so a blocked sender can't loop forever generating more
    /// bounces.
    async fn route_stanza(&mut self, stanza: Stanza, check_blocklist: bool) {
        let Some(to) = stanza.to_jid() else {
            warn!("dropping stanza with no destination");
            return;
        };

        if !self.hosts.is_local(to.domain()) {
            let _ = self.remote.send(stanza).await;
            return;
        }

        if check_blocklist && self.is_blocked(&stanza, &to).await {
            self.handle_blocked(stanza).await;
            return;
        }

        match to.resource() {
            Some(_) => self.route_to_full_jid(stanza, &to).await,
            None => self.route_to_bare_jid(stanza, &to).await,
        }
    }

    async fn route_to_full_jid(&mut self, stanza: Stanza, to: &Jid) {
        if let Some(resource) = self.entities.get(to) {
            if resource.stanzas.send(stanza).await.is_err() {
                warn!(%to, "resource channel closed while routing");
            }
            return;
        }

        let failure = if self.has_other_resources(&to.to_bare()) {
            DeliveryFailure::ResourceNotFound
        } else {
            self.classify_bare_miss(to).await
        };
        self.handle_undeliverable(stanza, to, failure).await;
    }

    async fn route_to_bare_jid(&mut self, stanza: Stanza, to: &Jid) {
        let bare = to.to_bare();
        let resources: Vec<Jid> = self
            .entities
            .keys()
            .filter(|jid| jid.to_bare() == bare)
            .cloned()
            .collect();

        if resources.is_empty() {
            let failure = self.classify_bare_miss(to).await;
            self.handle_undeliverable(stanza, to, failure).await;
            return;
        }

        let targets = match stanza.kind() {
            Some(StanzaKind::Message) => {
                let max_priority = resources
                    .iter()
                    .filter_map(|jid| self.entities.get(jid).map(|resource| resource.priority))
                    .filter(|priority| *priority >= 0)
                    .max();

                match max_priority {
                    Some(max) => resources
                        .into_iter()
                        .filter(|jid| self.entities.get(jid).map(|r| r.priority) == Some(max))
                        .collect(),
                    None => {
                        self.handle_undeliverable(stanza, to, DeliveryFailure::NotAuthenticated).await;
                        return;
                    }
                }
            }
            _ => resources,
        };

        for jid in targets {
            if let Some(resource) = self.entities.get(&jid) {
                let _ = resource.stanzas.send(stanza.clone()).await;
            }
        }
    }

    fn has_other_resources(&self, bare: &Jid) -> bool {
        self.entities.keys().any(|jid| jid.to_bare() == *bare)
    }

    /// A bare jid isn't in `entities` for one of two reasons: the account
    /// doesn't exist at all, or it exists but has nothing bound right now.
    async fn classify_bare_miss(&self, to: &Jid) -> DeliveryFailure {
        let bare = to.to_bare();
        match self.store.user_exists(bare).await {
            Ok(true) => DeliveryFailure::NotAuthenticated,
            Ok(false) => DeliveryFailure::NoSuchAccount,
            Err(err) => {
                warn!(%err, %to, "user existence lookup failed, assuming authenticated");
                DeliveryFailure::NotAuthenticated
            }
        }
    }

    async fn handle_undeliverable(&mut self, stanza: Stanza, to: &Jid, failure: DeliveryFailure) {
        match (stanza.kind(), failure) {
            (Some(StanzaKind::Message), DeliveryFailure::NoSuchAccount) => {
                self.bounce(stanza, "item-not-found").await;
            }
            (Some(StanzaKind::Message), DeliveryFailure::NotAuthenticated | DeliveryFailure::ResourceNotFound) => {
                let Some(node) = to.node() else { return };
                if self.offline.enqueue(node.to_string(), stanza.element.clone()).await.is_err() {
                    warn!(%to, "offline queue full, bouncing sender");
                    self.bounce(stanza, "service-unavailable").await;
                }
            }
            (Some(StanzaKind::Iq), DeliveryFailure::NoSuchAccount) => {
                self.bounce(stanza, "item-not-found").await;
            }
            (Some(StanzaKind::Iq), DeliveryFailure::ResourceNotFound) => {
                self.bounce(stanza, "item-not-found").await;
            }
            (Some(StanzaKind::Iq), DeliveryFailure::NotAuthenticated) => {
                self.bounce(stanza, "service-unavailable").await;
            }
            (Some(StanzaKind::Presence), _) | (None, _) => {}
        }
    }

    async fn is_blocked(&self, stanza: &Stanza, to: &Jid) -> bool {
        let Some(from) = stanza.from_jid() else { return false };
        let Some(node) = to.node() else { return false };

        match self.blocklist.list(node.to_string()).await {
            Ok(items) => items.iter().any(|item| item.jid_pattern.matches(&from)),
            Err(err) => {
                warn!(%err, "blocklist lookup failed, allowing delivery");
                false
            }
        }
    }

    async fn handle_blocked(&mut self, stanza: Stanza) {
        match stanza.kind() {
            Some(StanzaKind::Message) | Some(StanzaKind::Iq) => self.bounce(stanza, "service-unavailable").await,
            Some(StanzaKind::Presence) | None => {}
        }
    }

    async fn bounce(&mut self, stanza: Stanza, condition: &str) {
        match Stanza::error_reply(&stanza, condition, namespaces::XMPP_STANZA_ERRORS) {
            Ok(reply) => self.route_stanza(reply, false).await,
            Err(err) => warn!(%err, "failed to build error bounce"),
        }
    }
}

/// Handle to the single running router actor. Streams register/unregister
/// through `management` and hand stanzas to the router through `stanzas`.
#[derive(Debug, Clone)]
pub struct RouterHandle {
    pub stanzas: mpsc::Sender<Stanza>,
    pub management: mpsc::Sender<ManagementCommand>,
    queries: mpsc::Sender<Query>,
}

impl RouterHandle {
    /// `remote` receives stanzas addressed to a domain this server doesn't
    /// host; the s2s outbound dialer is the intended consumer. `store`
    /// backs bare-jid delivery failures with a real existence check instead
    /// of collapsing every miss into the same stanza error.
    pub fn new(
        hosts: HostRegistry,
        blocklist: BlockListHandle,
        offline: OfflineHandle,
        store: StoreHandle,
        remote: mpsc::Sender<Stanza>,
    ) -> Self {
        let (stanzas_tx, stanzas_rx) = mpsc::channel(128);
        let (management_tx, management_rx) = mpsc::channel(32);
        let (queries_tx, queries_rx) = mpsc::channel(32);
        let mut router = Router {
            stanzas: stanzas_rx,
            management: management_rx,
            queries: queries_rx,
            entities: HashMap::new(),
            hosts,
            blocklist,
            offline,
            store,
            remote,
        };
        tokio::spawn(async move {
            router.run().await;
        });

        RouterHandle {
            stanzas: stanzas_tx,
            management: management_tx,
            queries: queries_tx,
        }
    }

    /// Whether a full jid currently has a live, registered stream. Used to
    /// enforce resource-conflict policy before a new stream takes the name.
    pub async fn is_bound(&self, jid: &Jid) -> bool {
        let (result_tx, result_rx) = oneshot::channel();
        if self.queries.send(Query::IsBound { jid: jid.clone(), result_tx }).await.is_err() {
            return false;
        }
        result_rx.await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use confidante_backend::blocklist::fake::FakeBlockListBackend;
    use confidante_backend::model::BlockListItem;
    use confidante_backend::offline::fake::FakeOfflineBackend;
    use confidante_backend::store::fake::FakeStoreBackend;
    use confidante_core::xml::Element;

    use super::*;

    fn test_router() -> (RouterHandle, mpsc::Receiver<Stanza>) {
        let (remote_tx, remote_rx) = mpsc::channel(8);
        let handle = RouterHandle::new(
            HostRegistry::new(vec!["localhost".to_string()]),
            BlockListHandle::new(FakeBlockListBackend::default()),
            OfflineHandle::new(FakeOfflineBackend::default()),
            StoreHandle::new(FakeStoreBackend::default()),
            remote_tx,
        );
        (handle, remote_rx)
    }

    fn message(from: &str, to: &str) -> Stanza {
        let mut element = Element::new("message", Some(confidante_core::xml::namespaces::XMPP_CLIENT));
        element.set_attribute("from", None::<String>, from);
        element.set_attribute("to", None::<String>, to);
        Stanza { element }
    }

    #[tokio::test]
    async fn delivers_to_registered_full_jid() {
        let (router, _remote) = test_router();
        let bob = "bob@localhost/phone".parse::<Jid>().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        router
            .management
            .send(ManagementCommand::Register(bob.clone(), tx))
            .await
            .unwrap();

        router
            .stanzas
            .send(message("alice@localhost", "bob@localhost/phone"))
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.from_jid().unwrap().to_string(), "alice@localhost");
    }

    #[tokio::test]
    async fn forwards_remote_domain_stanzas() {
        let (router, mut remote_rx) = test_router();
        router
            .stanzas
            .send(message("alice@localhost", "juliet@capulet.lit"))
            .await
            .unwrap();

        let forwarded = remote_rx.recv().await.unwrap();
        assert_eq!(forwarded.to_jid().unwrap().to_string(), "juliet@capulet.lit");
    }

    #[tokio::test]
    async fn bare_jid_message_goes_to_highest_priority_resource() {
        let (router, _remote) = test_router();
        let phone = "bob@localhost/phone".parse::<Jid>().unwrap();
        let desktop = "bob@localhost/desktop".parse::<Jid>().unwrap();
        let (phone_tx, mut phone_rx) = mpsc::channel(8);
        let (desktop_tx, mut desktop_rx) = mpsc::channel(8);
        router.management.send(ManagementCommand::Register(phone.clone(), phone_tx)).await.unwrap();
        router.management.send(ManagementCommand::Register(desktop.clone(), desktop_tx)).await.unwrap();
        router.management.send(ManagementCommand::SetPriority(desktop, 5)).await.unwrap();

        router
            .stanzas
            .send(message("alice@localhost", "bob@localhost"))
            .await
            .unwrap();

        let received = desktop_rx.recv().await.unwrap();
        assert_eq!(received.from_jid().unwrap().to_string(), "alice@localhost");
        assert!(phone_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn blocked_sender_gets_bounced() {
        let bob = "bob@localhost/phone".parse::<Jid>().unwrap();
        let (tx, mut rx) = mpsc::channel(8);

        let blocklist = BlockListHandle::new(FakeBlockListBackend::default());
        blocklist
            .add(BlockListItem {
                owner: "bob".to_string(),
                jid_pattern: "alice@localhost".parse().unwrap(),
            })
            .await
            .unwrap();

        let (remote_tx, _remote_rx) = mpsc::channel(8);
        let router = RouterHandle::new(
            HostRegistry::new(vec!["localhost".to_string()]),
            blocklist,
            OfflineHandle::new(FakeOfflineBackend::default()),
            StoreHandle::new(FakeStoreBackend::default()),
            remote_tx,
        );
        router.management.send(ManagementCommand::Register(bob, tx)).await.unwrap();

        router
            .stanzas
            .send(message("alice@localhost", "bob@localhost/phone"))
            .await
            .unwrap();

        let bounce = rx.recv().await.unwrap();
        assert_eq!(bounce.element.attribute("type", None), Some("error"));
        assert_eq!(bounce.to_jid().unwrap().to_string(), "alice@localhost");
    }

    fn iq_get(from: &str, to: &str) -> Stanza {
        let mut element = Element::new("iq", Some(confidante_core::xml::namespaces::XMPP_CLIENT));
        element.set_attribute("type", None::<String>, "get");
        element.set_attribute("id", None::<String>, "1");
        element.set_attribute("from", None::<String>, from);
        element.set_attribute("to", None::<String>, to);
        Stanza { element }
    }

    #[tokio::test]
    async fn iq_to_nonexistent_account_bounces_item_not_found() {
        let (remote_tx, _remote_rx) = mpsc::channel(8);
        let router = RouterHandle::new(
            HostRegistry::new(vec!["localhost".to_string()]),
            BlockListHandle::new(FakeBlockListBackend::default()),
            OfflineHandle::new(FakeOfflineBackend::default()),
            StoreHandle::new(FakeStoreBackend::default()),
            remote_tx,
        );

        let alice = "alice@localhost/phone".parse::<Jid>().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        router.management.send(ManagementCommand::Register(alice, tx)).await.unwrap();
        router.stanzas.send(iq_get("alice@localhost/phone", "ghost@localhost")).await.unwrap();

        let bounce = rx.recv().await.unwrap();
        assert_eq!(bounce.element.attribute("type", None), Some("error"));
        let error = bounce.element.find_child("error", None).unwrap();
        assert!(error.find_child("item-not-found", Some(confidante_core::xml::namespaces::XMPP_STANZA_ERRORS)).is_some());
    }

    #[tokio::test]
    async fn iq_to_existing_but_offline_account_bounces_service_unavailable() {
        let store = StoreHandle::new(FakeStoreBackend::default());
        let bob = "bob@localhost".parse::<Jid>().unwrap();
        store.add_user(bob, "a".to_string(), "b".to_string(), "c".to_string()).await.unwrap();

        let (remote_tx, _remote_rx) = mpsc::channel(8);
        let router = RouterHandle::new(
            HostRegistry::new(vec!["localhost".to_string()]),
            BlockListHandle::new(FakeBlockListBackend::default()),
            OfflineHandle::new(FakeOfflineBackend::default()),
            store,
            remote_tx,
        );

        let alice = "alice@localhost/phone".parse::<Jid>().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        router.management.send(ManagementCommand::Register(alice, tx)).await.unwrap();
        router.stanzas.send(iq_get("alice@localhost/phone", "bob@localhost")).await.unwrap();

        let bounce = rx.recv().await.unwrap();
        let error = bounce.element.find_child("error", None).unwrap();
        assert!(error.find_child("service-unavailable", Some(confidante_core::xml::namespaces::XMPP_STANZA_ERRORS)).is_some());
    }
}
