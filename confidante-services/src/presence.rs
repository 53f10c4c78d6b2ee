use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use confidante_backend::last_activity::LastActivityHandle;
use confidante_backend::model::{RosterItem, RosterNotification, Subscription};
use confidante_backend::offline::OfflineHandle;
use confidante_backend::roster::RosterHandle;
use confidante_core::xml::namespaces;
use confidante_core::xml::Element;
use confidante_core::xmpp::jid::Jid;
use confidante_core::xmpp::stanza::Stanza;

use crate::hosts::HostRegistry;

enum Command {
    Directed(Stanza),
    Bind(Jid),
    Unbind(Jid),
}

/// Read-only questions about currently live presence, for modules that need
/// to synthesize or filter stanzas based on who's actually online right now
/// (blocking command, PEP notifications).
enum Query {
    LiveResources {
        bare: Jid,
        result_tx: oneshot::Sender<Vec<Jid>>,
    },
    PresencesOf {
        bare: Jid,
        result_tx: oneshot::Sender<Vec<Stanza>>,
    },
}

/// Presence rows and the roster subscription state machine (RFC 6121 §3,
/// XEP-0162). Presence rows are kept in memory only: they're tied to a live
/// stream and vanish with it, so there is nothing here to persist across a
/// restart.
struct PresenceHub {
    commands: mpsc::Receiver<Command>,
    queries: mpsc::Receiver<Query>,
    hosts: HostRegistry,
    roster: RosterHandle,
    last_activity: LastActivityHandle,
    offline: OfflineHandle,
    router: mpsc::Sender<Stanza>,
    presences: HashMap<Jid, Stanza>,
}

impl PresenceHub {
    async fn run(&mut self) {
        loop {
            tokio::select! {
                Some(command) = self.commands.recv() => {
                    match command {
                        Command::Bind(jid) => self.handle_bind(jid).await,
                        Command::Unbind(jid) => self.handle_unbind(jid).await,
                        Command::Directed(stanza) => self.handle_directed(stanza).await,
                    }
                }
                Some(query) = self.queries.recv() => self.handle_query(query),
                else => break,
            }
        }
    }

    fn handle_query(&mut self, query: Query) {
        match query {
            Query::LiveResources { bare, result_tx } => {
                let resources = self.presences.keys().filter(|jid| jid.to_bare() == bare).cloned().collect();
                let _ = result_tx.send(resources);
            }
            Query::PresencesOf { bare, result_tx } => {
                let presences = self
                    .presences
                    .iter()
                    .filter(|(jid, _)| jid.to_bare() == bare)
                    .map(|(_, stanza)| stanza.clone())
                    .collect();
                let _ = result_tx.send(presences);
            }
        }
    }

    async fn handle_directed(&mut self, stanza: Stanza) {
        match stanza.element.attribute("type", None) {
            None | Some("available") => self.handle_available(stanza).await,
            Some("unavailable") => self.handle_unavailable(stanza).await,
            Some(kind @ ("subscribe" | "subscribed" | "unsubscribe" | "unsubscribed")) => {
                self.handle_subscription(stanza, kind).await
            }
            _ => {
                let _ = self.router.send(stanza).await;
            }
        }
    }

    /// Stream bind: probe every contact the user already has a `to`/`both`
    /// subscription with, then deliver and clear anything stored while the
    /// account had no live resource (XEP-0160).
    async fn handle_bind(&mut self, jid: Jid) {
        let Some(username) = jid.node() else { return };
        let items = match self.roster.items(username.to_string()).await {
            Ok(items) => items,
            Err(err) => {
                warn!(%err, "failed to load roster on bind");
                return;
            }
        };

        for item in items {
            if matches!(item.subscription, Subscription::To | Subscription::Both) {
                self.send_probe(&jid, &item.contact).await;
            }
        }

        match self.offline.drain(username.to_string()).await {
            Ok(messages) => {
                for mut element in messages {
                    element.set_attribute("to", None::<String>, jid.to_string());
                    let _ = self.router.send(Stanza { element }).await;
                }
            }
            Err(err) => warn!(%err, "failed to drain offline messages on bind"),
        }
    }

    async fn handle_unbind(&mut self, jid: Jid) {
        self.presences.remove(&jid);
        self.touch_last_activity(&jid, None).await;

        let mut element = Element::new("presence", Some(namespaces::XMPP_CLIENT));
        element.set_attribute("type", None::<String>, "unavailable");
        self.broadcast_to_subscribers(&jid, element).await;
    }

    async fn handle_available(&mut self, stanza: Stanza) {
        let Some(from) = stanza.from_jid() else { return };
        self.presences.insert(from.clone(), stanza.clone());
        self.broadcast_to_subscribers(&from, stanza.element.clone()).await;
    }

    async fn handle_unavailable(&mut self, stanza: Stanza) {
        let Some(from) = stanza.from_jid() else { return };
        self.presences.remove(&from);
        let status = stanza.element.find_child("status", None).map(|s| s.text());
        self.touch_last_activity(&from, status).await;
        self.broadcast_to_subscribers(&from, stanza.element.clone()).await;
    }

    async fn touch_last_activity(&self, jid: &Jid, status: Option<String>) {
        let Some(username) = jid.node() else { return };
        if let Err(err) = self.last_activity.touch(username.to_string(), status).await {
            warn!(%err, "failed to record last activity");
        }
    }

    async fn broadcast_to_subscribers(&mut self, from: &Jid, element: Element) {
        let Some(username) = from.node() else { return };
        let items = match self.roster.items(username.to_string()).await {
            Ok(items) => items,
            Err(err) => {
                warn!(%err, "failed to load roster for presence broadcast");
                return;
            }
        };

        for item in items {
            if matches!(item.subscription, Subscription::From | Subscription::Both) {
                let mut copy = element.clone();
                copy.set_attribute("from", None::<String>, from.to_string());
                copy.set_attribute("to", None::<String>, item.contact.to_string());
                let _ = self.router.send(Stanza { element: copy }).await;
            }
        }
    }

    async fn send_probe(&self, owner: &Jid, contact: &Jid) {
        let mut element = Element::new("presence", Some(namespaces::XMPP_CLIENT));
        element.set_attribute("type", None::<String>, "probe");
        element.set_attribute("from", None::<String>, owner.to_string());
        element.set_attribute("to", None::<String>, contact.to_string());
        let _ = self.router.send(Stanza { element }).await;
    }

    /// A subscription directive updates up to two roster rows: the sender's,
    /// applying the outbound rules, and the recipient's, applying the mirror
    /// inbound rules. The stanza is forwarded to the router either way, since
    /// the peer still needs to see the directive.
    async fn handle_subscription(&mut self, stanza: Stanza, kind: &str) {
        let (Some(from), Some(to)) = (stanza.from_jid(), stanza.to_jid()) else {
            return;
        };

        if self.hosts.is_local_jid(&from) {
            self.apply_outbound(from.to_bare(), to.clone(), kind).await;
        }
        if self.hosts.is_local_jid(&to) {
            self.apply_inbound(to.to_bare(), from.clone(), kind, stanza.element.clone()).await;
        }

        let _ = self.router.send(stanza).await;
    }

    async fn find_item(&self, owner: &str, contact: &Jid) -> Option<RosterItem> {
        let items = self.roster.items(owner.to_string()).await.unwrap_or_default();
        items.into_iter().find(|item| item.contact.to_bare() == contact.to_bare())
    }

    /// Rules for the side that sent the directive: `subscribe` starts asking,
    /// `subscribed`/`unsubscribed` grant or revoke the contact's view of this
    /// user's presence, `unsubscribe` cancels this user's own view.
    async fn apply_outbound(&mut self, owner: Jid, contact: Jid, kind: &str) {
        let Some(owner_username) = owner.node().map(str::to_string) else { return };
        let existing = self.find_item(&owner_username, &contact).await;
        let current = existing.as_ref().map_or(Subscription::None, |item| item.subscription);

        let next = match (kind, current) {
            ("subscribe", Subscription::None) => Some((Subscription::None, true)),
            ("unsubscribe", Subscription::To) => Some((Subscription::None, false)),
            ("unsubscribe", Subscription::Both) => Some((Subscription::From, false)),
            ("subscribed", Subscription::None) => Some((Subscription::From, false)),
            ("subscribed", Subscription::To) => Some((Subscription::Both, false)),
            ("unsubscribed", Subscription::From) => Some((Subscription::None, false)),
            ("unsubscribed", Subscription::Both) => Some((Subscription::To, false)),
            _ => None,
        };

        if let Some((subscription, ask)) = next {
            self.save_item(&owner_username, &contact, subscription, ask, existing).await;
        }
    }

    /// Mirror of `apply_outbound` for the receiving side: an inbound
    /// `subscribe` only records a pending notification (the user must
    /// explicitly approve), while `subscribed`/`unsubscribe`/`unsubscribed`
    /// grant or revoke this user's own view of the contact.
    async fn apply_inbound(&mut self, owner: Jid, contact: Jid, kind: &str, presence: Element) {
        let Some(owner_username) = owner.node().map(str::to_string) else { return };
        let existing = self.find_item(&owner_username, &contact).await;
        let current = existing.as_ref().map_or(Subscription::None, |item| item.subscription);
        let ask = existing.as_ref().is_some_and(|item| item.ask);

        match kind {
            "subscribe" => self.record_notification(&owner, &contact, presence).await,
            "subscribed" if ask && current == Subscription::None => {
                self.save_item(&owner_username, &contact, Subscription::To, false, existing).await;
                self.send_probe(&owner, &contact).await;
            }
            "subscribed" if current == Subscription::From => {
                self.save_item(&owner_username, &contact, Subscription::Both, false, existing).await;
            }
            "unsubscribe" | "unsubscribed" if current == Subscription::To => {
                self.save_item(&owner_username, &contact, Subscription::None, false, existing).await;
            }
            "unsubscribe" | "unsubscribed" if current == Subscription::Both => {
                self.save_item(&owner_username, &contact, Subscription::From, false, existing).await;
            }
            _ => {}
        }

        if kind == "subscribed" || kind == "unsubscribed" {
            let _ = self.roster.remove_notification(owner_username, contact).await;
        }
    }

    async fn record_notification(&self, notified: &Jid, originator: &Jid, presence: Element) {
        let Some(contact_username) = notified.node() else { return };
        let _ = self
            .roster
            .add_notification(RosterNotification {
                contact_username: contact_username.to_string(),
                originator: originator.clone(),
                presence,
            })
            .await;
    }

    async fn save_item(
        &self,
        owner: &str,
        contact: &Jid,
        subscription: Subscription,
        ask: bool,
        existing: Option<RosterItem>,
    ) {
        let (name, groups) = match existing {
            Some(item) => (item.name, item.groups),
            None => (None, Vec::new()),
        };
        let item = RosterItem {
            owner: owner.to_string(),
            contact: contact.clone(),
            name,
            subscription,
            ask,
            groups,
        };
        let _ = self.roster.set_item(item).await;
    }
}

/// Handle to the running presence hub.
#[derive(Debug, Clone)]
pub struct PresenceHandle {
    commands: mpsc::Sender<Command>,
    queries: mpsc::Sender<Query>,
}

impl PresenceHandle {
    pub fn new(
        hosts: HostRegistry,
        roster: RosterHandle,
        last_activity: LastActivityHandle,
        offline: OfflineHandle,
        router: mpsc::Sender<Stanza>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(128);
        let (queries_tx, queries_rx) = mpsc::channel(32);
        let mut hub = PresenceHub {
            commands: commands_rx,
            queries: queries_rx,
            hosts,
            roster,
            last_activity,
            offline,
            router,
            presences: HashMap::new(),
        };
        tokio::spawn(async move {
            hub.run().await;
        });

        PresenceHandle { commands: commands_tx, queries: queries_tx }
    }

    pub async fn bind(&self, jid: Jid) {
        let _ = self.commands.send(Command::Bind(jid)).await;
    }

    pub async fn unbind(&self, jid: Jid) {
        let _ = self.commands.send(Command::Unbind(jid)).await;
    }

    pub async fn presence(&self, stanza: Stanza) {
        let _ = self.commands.send(Command::Directed(stanza)).await;
    }

    /// Full jids of a bare jid's currently live resources.
    pub async fn live_resources(&self, bare: Jid) -> Vec<Jid> {
        let (result_tx, result_rx) = oneshot::channel();
        if self.queries.send(Query::LiveResources { bare, result_tx }).await.is_err() {
            return Vec::new();
        }
        result_rx.await.unwrap_or_default()
    }

    /// The live presence stanzas currently held for a bare jid's resources.
    pub async fn presences_of(&self, bare: Jid) -> Vec<Stanza> {
        let (result_tx, result_rx) = oneshot::channel();
        if self.queries.send(Query::PresencesOf { bare, result_tx }).await.is_err() {
            return Vec::new();
        }
        result_rx.await.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use confidante_backend::last_activity::fake::FakeLastActivityBackend;
    use confidante_backend::offline::fake::FakeOfflineBackend;
    use confidante_backend::roster::fake::FakeRosterBackend;

    use super::*;

    fn presence_stanza(kind: &str, from: &str, to: &str) -> Stanza {
        let mut element = Element::new("presence", Some(namespaces::XMPP_CLIENT));
        element.set_attribute("type", None::<String>, kind);
        element.set_attribute("from", None::<String>, from);
        element.set_attribute("to", None::<String>, to);
        Stanza { element }
    }

    #[tokio::test]
    async fn subscribe_then_subscribed_reaches_to() {
        let (router_tx, mut router_rx) = mpsc::channel(16);
        let roster = RosterHandle::new(FakeRosterBackend::default());
        let hub = PresenceHandle::new(
            HostRegistry::new(vec!["localhost".to_string()]),
            roster.clone(),
            LastActivityHandle::new(FakeLastActivityBackend::default()),
            OfflineHandle::new(FakeOfflineBackend::default()),
            router_tx,
        );

        hub.presence(presence_stanza("subscribe", "alice@localhost", "bob@localhost")).await;
        router_rx.recv().await.unwrap();

        hub.presence(presence_stanza("subscribed", "bob@localhost", "alice@localhost")).await;
        router_rx.recv().await.unwrap();

        let items = roster.items("alice".to_string()).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].subscription, Subscription::To);
        assert!(!items[0].ask);
    }

    #[tokio::test]
    async fn available_presence_broadcasts_to_subscribed_contact() {
        let (router_tx, mut router_rx) = mpsc::channel(16);
        let roster = RosterHandle::new(FakeRosterBackend::default());
        roster
            .set_item(RosterItem {
                owner: "alice".to_string(),
                contact: "bob@localhost".parse().unwrap(),
                name: None,
                subscription: Subscription::From,
                ask: false,
                groups: vec![],
            })
            .await
            .unwrap();

        let hub = PresenceHandle::new(
            HostRegistry::new(vec!["localhost".to_string()]),
            roster,
            LastActivityHandle::new(FakeLastActivityBackend::default()),
            OfflineHandle::new(FakeOfflineBackend::default()),
            router_tx,
        );
        hub.presence(presence_stanza("available", "alice@localhost/phone", "")).await;

        let broadcast = router_rx.recv().await.unwrap();
        assert_eq!(broadcast.to_jid().unwrap().to_string(), "bob@localhost");
    }
}
