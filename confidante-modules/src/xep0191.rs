//! XEP-0191: Blocking Command.
//!
//! Manages the blocklist rows the router already consults on every inbound
//! delivery (`confidante_services::router`); this module is the IQ front-end
//! over `BlockListHandle` plus the presence side effects §3.3/§3.4 require: a
//! newly-blocked contact is told the owner went unavailable, and an
//! unblocked one gets the owner's current presence resent.

use confidante_backend::blocklist::BlockListHandle;
use confidante_backend::model::BlockListItem;
use confidante_core::xml::Element;
use confidante_core::xml::namespaces;
use confidante_core::xmpp::jid::Jid;
use confidante_core::xmpp::stanza::Stanza;
use confidante_services::dispatch::Route;
use confidante_services::presence::PresenceHandle;
use tokio::sync::mpsc;
use tracing::warn;

pub const BLOCKING: &str = "urn:xmpp:blocking";

pub fn spawn(router: mpsc::Sender<Stanza>, blocklist: BlockListHandle, presence: PresenceHandle) -> Route {
    let (inbox_tx, mut inbox_rx) = mpsc::channel(8);

    tokio::spawn(async move {
        while let Some(stanza) = inbox_rx.recv().await {
            match handle(&stanza, &blocklist, &presence, &router).await {
                Ok(reply) => {
                    let _ = router.send(reply).await;
                }
                Err(err) => warn!(%err, "failed to handle blocking command"),
            }
        }
    });

    Route { matches: Box::new(matches), inbox: inbox_tx }
}

fn matches(stanza: &Stanza) -> bool {
    let is_iq = matches!(stanza.element.attribute("type", None), Some("get") | Some("set"));
    is_iq
        && (stanza.element.find_child("blocklist", Some(BLOCKING)).is_some()
            || stanza.element.find_child("block", Some(BLOCKING)).is_some()
            || stanza.element.find_child("unblock", Some(BLOCKING)).is_some())
}

async fn handle(
    stanza: &Stanza,
    blocklist: &BlockListHandle,
    presence: &PresenceHandle,
    router: &mpsc::Sender<Stanza>,
) -> Result<Stanza, anyhow::Error> {
    let Some(owner) = stanza.from_jid().and_then(|jid| jid.node().map(str::to_string)) else {
        return Stanza::error_reply(stanza, "bad-request", namespaces::XMPP_STANZA_ERRORS);
    };
    let owner_bare: Jid = format!("{owner}@{}", owner_domain(stanza)).parse()?;

    if let Some(_list) = stanza.element.find_child("blocklist", Some(BLOCKING)) {
        let items = blocklist.list(owner).await?;
        return Stanza::result_reply(stanza, |iq| {
            iq.with_child("blocklist", Some(BLOCKING), |blocklist| {
                for item in &items {
                    blocklist.with_child("item", None, |e| {
                        e.set_attribute("jid", None::<String>, item.jid_pattern.to_string());
                    });
                }
            });
        });
    }

    if let Some(block) = stanza.element.find_child("block", Some(BLOCKING)) {
        let jids = jid_items(block)?;
        for jid in &jids {
            blocklist.add(BlockListItem { owner: owner.clone(), jid_pattern: jid.clone() }).await?;
        }
        send_unavailable(&owner_bare, &jids, presence, router).await;
        return Stanza::result_reply(stanza, |_| {});
    }

    if let Some(unblock) = stanza.element.find_child("unblock", Some(BLOCKING)) {
        let patterns = jid_items(unblock)?;
        let unblocked = if patterns.is_empty() {
            let all = blocklist.list(owner.clone()).await?;
            for item in &all {
                blocklist.remove(owner.clone(), item.jid_pattern.clone()).await?;
            }
            all.into_iter().map(|item| item.jid_pattern).collect()
        } else {
            for jid in &patterns {
                blocklist.remove(owner.clone(), jid.clone()).await?;
            }
            patterns
        };
        resend_presence(&owner_bare, &unblocked, presence, router).await;
        return Stanza::result_reply(stanza, |_| {});
    }

    Stanza::error_reply(stanza, "bad-request", namespaces::XMPP_STANZA_ERRORS)
}

fn owner_domain(stanza: &Stanza) -> String {
    stanza.from_jid().map(|jid| jid.domain().to_string()).unwrap_or_default()
}

/// Synthetic `unavailable` presence (XEP-0191 §3.3) from every one of the
/// owner's live resources to each newly-blocked contact.
async fn send_unavailable(owner_bare: &Jid, blocked: &[Jid], presence: &PresenceHandle, router: &mpsc::Sender<Stanza>) {
    let resources = presence.live_resources(owner_bare.clone()).await;
    for resource in &resources {
        for contact in blocked {
            let mut element = Element::new("presence", Some(namespaces::XMPP_CLIENT));
            element.set_attribute("type", None::<String>, "unavailable");
            element.set_attribute("from", None::<String>, resource.to_string());
            element.set_attribute("to", None::<String>, contact.to_string());
            let _ = router.send(Stanza { element }).await;
        }
    }
}

/// Resends the owner's current presence (XEP-0191 §3.4) from every live
/// resource to each now-unblocked contact. A resource with no tracked
/// presence is skipped: there's nothing to resend.
async fn resend_presence(owner_bare: &Jid, unblocked: &[Jid], presence: &PresenceHandle, router: &mpsc::Sender<Stanza>) {
    let presences = presence.presences_of(owner_bare.clone()).await;
    for current in &presences {
        for contact in unblocked {
            let mut element = current.element.clone();
            element.set_attribute("to", None::<String>, contact.to_string());
            let _ = router.send(Stanza { element }).await;
        }
    }
}

fn jid_items(element: &confidante_core::xml::Element) -> Result<Vec<Jid>, anyhow::Error> {
    element
        .children_named("item")
        .filter_map(|item| item.attribute("jid", None))
        .map(|jid| jid.parse::<Jid>().map_err(anyhow::Error::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use confidante_backend::blocklist::fake::FakeBlockListBackend;
    use confidante_backend::last_activity::LastActivityHandle;
    use confidante_backend::last_activity::fake::FakeLastActivityBackend;
    use confidante_backend::offline::OfflineHandle;
    use confidante_backend::offline::fake::FakeOfflineBackend;
    use confidante_backend::roster::RosterHandle;
    use confidante_backend::roster::fake::FakeRosterBackend;
    use confidante_core::xml::Element;
    use confidante_services::hosts::HostRegistry;

    use super::*;

    fn block(jids: &[&str]) -> Stanza {
        let mut element = Element::new("iq", None);
        element.set_attribute("type", None::<String>, "set");
        element.set_attribute("id", None::<String>, "1");
        element.set_attribute("from", None::<String>, "juliet@capulet.lit/balcony");
        element.with_child("block", Some(BLOCKING), |block| {
            for jid in jids {
                block.with_child("item", None, |item| {
                    item.set_attribute("jid", None::<String>, jid.to_string());
                });
            }
        });
        Stanza { element }
    }

    fn unblock(jids: &[&str]) -> Stanza {
        let mut element = Element::new("iq", None);
        element.set_attribute("type", None::<String>, "set");
        element.set_attribute("id", None::<String>, "2");
        element.set_attribute("from", None::<String>, "juliet@capulet.lit/balcony");
        element.with_child("unblock", Some(BLOCKING), |unblock| {
            for jid in jids {
                unblock.with_child("item", None, |item| {
                    item.set_attribute("jid", None::<String>, jid.to_string());
                });
            }
        });
        Stanza { element }
    }

    fn list() -> Stanza {
        let mut element = Element::new("iq", None);
        element.set_attribute("type", None::<String>, "get");
        element.set_attribute("id", None::<String>, "3");
        element.set_attribute("from", None::<String>, "juliet@capulet.lit/balcony");
        element.with_child("blocklist", Some(BLOCKING), |_| {});
        Stanza { element }
    }

    fn presence_handle() -> (PresenceHandle, mpsc::Receiver<Stanza>) {
        let (router_tx, router_rx) = mpsc::channel(16);
        let presence = PresenceHandle::new(
            HostRegistry::new(vec!["capulet.lit".to_string()]),
            RosterHandle::new(FakeRosterBackend::default()),
            LastActivityHandle::new(FakeLastActivityBackend::default()),
            OfflineHandle::new(FakeOfflineBackend::default()),
            router_tx,
        );
        (presence, router_rx)
    }

    #[tokio::test]
    async fn block_then_list_reports_the_blocked_jid() {
        let blocklist = BlockListHandle::new(FakeBlockListBackend::default());
        let (presence, _presence_router_rx) = presence_handle();
        let (router_tx, mut router_rx) = mpsc::channel(8);
        let route = spawn(router_tx, blocklist, presence);

        route.inbox.send(block(&["romeo@montague.lit"])).await.unwrap();
        router_rx.recv().await.unwrap();

        route.inbox.send(list()).await.unwrap();
        let reply = router_rx.recv().await.unwrap();
        let items: Vec<_> = reply
            .element
            .find_child("blocklist", Some(BLOCKING))
            .unwrap()
            .children_named("item")
            .collect();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].attribute("jid", None), Some("romeo@montague.lit"));
    }

    #[tokio::test]
    async fn unblock_with_no_items_clears_the_whole_list() {
        let blocklist = BlockListHandle::new(FakeBlockListBackend::default());
        let (presence, _presence_router_rx) = presence_handle();
        let (router_tx, mut router_rx) = mpsc::channel(8);
        let route = spawn(router_tx, blocklist, presence);

        route.inbox.send(block(&["romeo@montague.lit", "tybalt@capulet.lit"])).await.unwrap();
        router_rx.recv().await.unwrap();

        route.inbox.send(unblock(&[])).await.unwrap();
        router_rx.recv().await.unwrap();

        route.inbox.send(list()).await.unwrap();
        let reply = router_rx.recv().await.unwrap();
        let items: Vec<_> = reply
            .element
            .find_child("blocklist", Some(BLOCKING))
            .unwrap()
            .children_named("item")
            .collect();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn blocking_a_contact_sends_it_unavailable_from_every_live_resource() {
        let blocklist = BlockListHandle::new(FakeBlockListBackend::default());
        let (presence, _presence_router_rx) = presence_handle();

        let mut available = Element::new("presence", Some(namespaces::XMPP_CLIENT));
        available.set_attribute("from", None::<String>, "juliet@capulet.lit/balcony");
        presence.presence(Stanza { element: available }).await;

        let (router_tx, mut router_rx) = mpsc::channel(8);
        let route = spawn(router_tx, blocklist, presence);

        route.inbox.send(block(&["romeo@montague.lit"])).await.unwrap();
        router_rx.recv().await.unwrap();

        let unavailable = router_rx.recv().await.unwrap();
        assert_eq!(unavailable.element.attribute("type", None), Some("unavailable"));
        assert_eq!(unavailable.from_jid().unwrap().to_string(), "juliet@capulet.lit/balcony");
        assert_eq!(unavailable.to_jid().unwrap().to_string(), "romeo@montague.lit");
    }
}
