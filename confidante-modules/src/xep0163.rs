//! XEP-0163: Personal Eventing Protocol.
//!
//! Built on `PubSubHandle`'s bare mechanics (publish, subscribe, unsubscribe,
//! item retrieval), with a fixed access model and presence-borne
//! notification on top: no per-node configure form, since PEP nodes are
//! implicit and owned by the account they live under.

use confidante_backend::model::PubSubAffiliation;
use confidante_backend::model::{PubSubItem, Subscription};
use confidante_backend::pubsub::PubSubHandle;
use confidante_backend::roster::RosterHandle;
use confidante_core::xml::Element;
use confidante_core::xml::namespaces;
use confidante_core::xmpp::jid::Jid;
use confidante_core::xmpp::stanza::Stanza;
use confidante_services::dispatch::Route;
use confidante_services::presence::PresenceHandle;
use tokio::sync::mpsc;
use tracing::warn;

pub const PUBSUB: &str = "http://jabber.org/protocol/pubsub";
pub const EVENT: &str = "http://jabber.org/protocol/pubsub#event";

pub fn spawn(
    router: mpsc::Sender<Stanza>,
    pubsub: PubSubHandle,
    roster: RosterHandle,
    presence: PresenceHandle,
) -> Route {
    let (inbox_tx, mut inbox_rx) = mpsc::channel(16);

    tokio::spawn(async move {
        while let Some(stanza) = inbox_rx.recv().await {
            match handle(&stanza, &pubsub, &roster, &presence, &router).await {
                Ok(Some(reply)) => {
                    let _ = router.send(reply).await;
                }
                Ok(None) => {}
                Err(err) => warn!(%err, "failed to handle pubsub request"),
            }
        }
    });

    Route { matches: Box::new(matches), inbox: inbox_tx }
}

fn matches(stanza: &Stanza) -> bool {
    matches!(stanza.element.attribute("type", None), Some("get") | Some("set"))
        && stanza.element.find_child("pubsub", Some(PUBSUB)).is_some()
}

/// Can `requester` see `owner`'s PEP node? Owners always can. Otherwise an
/// explicit affiliation (granted on subscribe) or a roster subscription of
/// `to`/`both` stands in for the access model a full XEP-0060 deployment
/// would read from the node's configure form.
async fn is_authorized(owner: &str, requester: &Jid, pubsub: &PubSubHandle, roster: &RosterHandle) -> bool {
    if requester.node() == Some(owner) {
        return true;
    }

    let node = pubsub.node(owner.to_string()).await.unwrap_or_default();
    let affiliated = node
        .affiliations
        .iter()
        .any(|(jid, affiliation)| jid.to_bare() == requester.to_bare() && *affiliation != PubSubAffiliation::None);
    if affiliated {
        return true;
    }

    let items = roster.items(owner.to_string()).await.unwrap_or_default();
    items
        .into_iter()
        .any(|item| item.contact.to_bare() == requester.to_bare() && matches!(item.subscription, Subscription::To | Subscription::Both))
}

async fn handle(
    stanza: &Stanza,
    pubsub: &PubSubHandle,
    roster: &RosterHandle,
    presence: &PresenceHandle,
    router: &mpsc::Sender<Stanza>,
) -> Result<Option<Stanza>, anyhow::Error> {
    let Some(pubsub_el) = stanza.element.find_child("pubsub", Some(PUBSUB)) else {
        return Stanza::error_reply(stanza, "bad-request", namespaces::XMPP_STANZA_ERRORS).map(Some);
    };
    let Some(from) = stanza.from_jid() else {
        return Stanza::error_reply(stanza, "bad-request", namespaces::XMPP_STANZA_ERRORS).map(Some);
    };
    let owner = stanza
        .to_jid()
        .and_then(|to| to.node().map(str::to_string))
        .or_else(|| from.node().map(str::to_string));
    let Some(owner) = owner else {
        return Stanza::error_reply(stanza, "bad-request", namespaces::XMPP_STANZA_ERRORS).map(Some);
    };

    if !is_authorized(&owner, &from, pubsub, roster).await {
        return Stanza::error_reply(stanza, "forbidden", namespaces::XMPP_STANZA_ERRORS).map(Some);
    }

    if let Some(publish) = pubsub_el.find_child("publish", None) {
        let node = publish.attribute("node", None).unwrap_or_default().to_string();
        let Some(item) = publish.find_child("item", None) else {
            return Stanza::error_reply(stanza, "bad-request", namespaces::XMPP_STANZA_ERRORS).map(Some);
        };
        let id = item.attribute("id", None).unwrap_or_default().to_string();
        let payload = item.child_elements().next().cloned().unwrap_or_else(|| Element::new("item", None));
        pubsub.publish(owner.clone(), PubSubItem { id: id.clone(), payload: payload.clone() }).await?;
        notify(&owner, &node, &id, &payload, pubsub, presence, router).await;
        return Stanza::result_reply(stanza, |_| {}).map(Some);
    }

    if let Some(subscribe) = pubsub_el.find_child("subscribe", None) {
        let jid_str = subscribe.attribute("jid", None).map(str::to_string).unwrap_or_else(|| from.to_string());
        let jid = jid_str.parse()?;
        pubsub.subscribe(owner, jid).await?;
        return Stanza::result_reply(stanza, |_| {}).map(Some);
    }

    if let Some(unsubscribe) = pubsub_el.find_child("unsubscribe", None) {
        let jid_str = unsubscribe.attribute("jid", None).map(str::to_string).unwrap_or_else(|| from.to_string());
        let jid = jid_str.parse()?;
        pubsub.unsubscribe(owner, jid).await?;
        return Stanza::result_reply(stanza, |_| {}).map(Some);
    }

    if let Some(_items) = pubsub_el.find_child("items", None) {
        let node = pubsub.node(owner).await?;
        return Stanza::result_reply(stanza, |iq| {
            iq.with_child("pubsub", Some(PUBSUB), |pubsub| {
                pubsub.with_child("items", None, |items| {
                    for item in &node.items {
                        items.with_child("item", None, |e| {
                            e.set_attribute("id", None::<String>, item.id.clone());
                            e.append_element(item.payload.clone());
                        });
                    }
                });
            });
        })
        .map(Some);
    }

    Stanza::error_reply(stanza, "bad-request", namespaces::XMPP_STANZA_ERRORS).map(Some)
}

/// Pushes a published item to every subscriber that currently has a live
/// resource, as an event-borne `<message type="headline">` (XEP-0163 §4.3).
/// A subscriber with no live resource is simply skipped: PEP notifications
/// aren't queued for offline delivery.
async fn notify(
    owner: &str,
    node: &str,
    id: &str,
    payload: &Element,
    pubsub: &PubSubHandle,
    presence: &PresenceHandle,
    router: &mpsc::Sender<Stanza>,
) {
    let subscribers = pubsub.node(owner.to_string()).await.map(|n| n.subscribers).unwrap_or_default();

    for subscriber in subscribers {
        let resources = presence.live_resources(subscriber.to_bare()).await;
        for resource in resources {
            let mut element = Element::new("message", Some(namespaces::XMPP_CLIENT));
            element.set_attribute("from", None::<String>, owner.to_string());
            element.set_attribute("to", None::<String>, resource.to_string());
            element.set_attribute("type", None::<String>, "headline");
            element.with_child("event", Some(EVENT), |event| {
                event.with_child("items", None, |items| {
                    items.set_attribute("node", None::<String>, node.to_string());
                    items.with_child("item", None, |item_el| {
                        item_el.set_attribute("id", None::<String>, id.to_string());
                        item_el.append_element(payload.clone());
                    });
                });
            });
            let _ = router.send(Stanza { element }).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use confidante_backend::last_activity::LastActivityHandle;
    use confidante_backend::last_activity::fake::FakeLastActivityBackend;
    use confidante_backend::model::RosterItem;
    use confidante_backend::offline::OfflineHandle;
    use confidante_backend::offline::fake::FakeOfflineBackend;
    use confidante_backend::pubsub::fake::FakePubSubBackend;
    use confidante_backend::roster::fake::FakeRosterBackend;
    use confidante_services::hosts::HostRegistry;

    use super::*;

    fn publish(id: &str) -> Stanza {
        let mut element = Element::new("iq", None);
        element.set_attribute("type", None::<String>, "set");
        element.set_attribute("id", None::<String>, "1");
        element.set_attribute("from", None::<String>, "juliet@capulet.lit/balcony");
        element.with_child("pubsub", Some(PUBSUB), |pubsub| {
            pubsub.with_child("publish", None, |publish| {
                publish.with_child("item", None, |item| {
                    item.set_attribute("id", None::<String>, id.to_string());
                    item.append_element(Element::new("mood", Some("urn:example:mood")));
                });
            });
        });
        Stanza { element }
    }

    fn items() -> Stanza {
        let mut element = Element::new("iq", None);
        element.set_attribute("type", None::<String>, "get");
        element.set_attribute("id", None::<String>, "2");
        element.set_attribute("from", None::<String>, "juliet@capulet.lit/balcony");
        element.with_child("pubsub", Some(PUBSUB), |pubsub| {
            pubsub.with_child("items", None, |_| {});
        });
        Stanza { element }
    }

    fn presence_handle(roster: RosterHandle) -> (PresenceHandle, mpsc::Receiver<Stanza>) {
        let (router_tx, router_rx) = mpsc::channel(16);
        let presence = PresenceHandle::new(
            HostRegistry::new(vec!["capulet.lit".to_string()]),
            roster,
            LastActivityHandle::new(FakeLastActivityBackend::default()),
            OfflineHandle::new(FakeOfflineBackend::default()),
            router_tx,
        );
        (presence, router_rx)
    }

    #[tokio::test]
    async fn publish_then_fetch_items_returns_the_published_item() {
        let pubsub = PubSubHandle::new(FakePubSubBackend::default());
        let roster = RosterHandle::new(FakeRosterBackend::default());
        let (presence, _presence_router_rx) = presence_handle(roster.clone());
        let (router_tx, mut router_rx) = mpsc::channel(8);
        let route = spawn(router_tx, pubsub, roster, presence);

        route.inbox.send(publish("current")).await.unwrap();
        router_rx.recv().await.unwrap();

        route.inbox.send(items()).await.unwrap();
        let reply = router_rx.recv().await.unwrap();
        let items: Vec<_> = reply
            .element
            .find_child("pubsub", Some(PUBSUB))
            .unwrap()
            .find_child("items", None)
            .unwrap()
            .children_named("item")
            .collect();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].attribute("id", None), Some("current"));
    }

    #[tokio::test]
    async fn subscribe_defaults_to_the_requester_when_no_jid_given() {
        let pubsub = PubSubHandle::new(FakePubSubBackend::default());
        let roster = RosterHandle::new(FakeRosterBackend::default());
        let (presence, _presence_router_rx) = presence_handle(roster.clone());
        let (router_tx, mut router_rx) = mpsc::channel(8);
        let route = spawn(router_tx, pubsub.clone(), roster, presence);

        let mut element = Element::new("iq", None);
        element.set_attribute("type", None::<String>, "set");
        element.set_attribute("id", None::<String>, "3");
        element.set_attribute("from", None::<String>, "juliet@capulet.lit/balcony");
        element.with_child("pubsub", Some(PUBSUB), |pubsub| {
            pubsub.with_child("subscribe", None, |_| {});
        });

        route.inbox.send(Stanza { element }).await.unwrap();
        router_rx.recv().await.unwrap();

        let node = pubsub.node("juliet".to_string()).await.unwrap();
        assert_eq!(node.subscribers.len(), 1);
    }

    #[tokio::test]
    async fn a_stranger_without_subscription_or_affiliation_is_forbidden() {
        let pubsub = PubSubHandle::new(FakePubSubBackend::default());
        let roster = RosterHandle::new(FakeRosterBackend::default());
        let (presence, _presence_router_rx) = presence_handle(roster.clone());
        let (router_tx, mut router_rx) = mpsc::channel(8);
        let route = spawn(router_tx, pubsub, roster, presence);

        let mut element = Element::new("iq", None);
        element.set_attribute("type", None::<String>, "get");
        element.set_attribute("id", None::<String>, "4");
        element.set_attribute("from", None::<String>, "mercutio@capulet.lit/sword");
        element.set_attribute("to", None::<String>, "juliet@capulet.lit");
        element.with_child("pubsub", Some(PUBSUB), |pubsub| {
            pubsub.with_child("items", None, |_| {});
        });

        route.inbox.send(Stanza { element }).await.unwrap();
        let reply = router_rx.recv().await.unwrap();
        assert_eq!(reply.element.attribute("type", None), Some("error"));
        let error = reply.element.find_child("error", None).unwrap();
        assert!(error.find_child("forbidden", None).is_some());
    }

    #[tokio::test]
    async fn publish_notifies_a_subscriber_with_a_live_resource() {
        let pubsub = PubSubHandle::new(FakePubSubBackend::default());
        let roster = RosterHandle::new(FakeRosterBackend::default());
        roster
            .set_item(RosterItem {
                owner: "juliet".to_string(),
                contact: "romeo@capulet.lit".parse().unwrap(),
                name: None,
                subscription: Subscription::Both,
                ask: false,
                groups: vec![],
            })
            .await
            .unwrap();
        let (presence, _presence_router_rx) = presence_handle(roster.clone());
        let mut available = Element::new("presence", Some(namespaces::XMPP_CLIENT));
        available.set_attribute("from", None::<String>, "romeo@capulet.lit/orchard");
        presence.presence(Stanza { element: available }).await;
        pubsub.subscribe("juliet".to_string(), "romeo@capulet.lit".parse().unwrap()).await.unwrap();

        let (router_tx, mut router_rx) = mpsc::channel(8);
        let route = spawn(router_tx, pubsub, roster, presence);

        route.inbox.send(publish("current")).await.unwrap();
        router_rx.recv().await.unwrap();
        let notification = router_rx.recv().await.unwrap();
        assert_eq!(notification.to_jid().unwrap().to_string(), "romeo@capulet.lit/orchard");
        assert!(notification.element.find_child("event", Some(EVENT)).is_some());
    }
}
