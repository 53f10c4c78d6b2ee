//! `jabber:iq:roster` (RFC 6121 §2): fetch and edit a user's roster.
//!
//! Presence subscription transitions (`subscribe`/`subscribed`/`unsubscribe`/
//! `unsubscribed`) are applied by `confidante_services::presence` as they
//! come off the wire; this module only owns the IQ-set path — adding or
//! renaming a contact, and the `subscription="remove"` item delete, which is
//! the one roster transition presence directives alone can never produce.

use tokio::sync::mpsc;
use tracing::warn;

use confidante_backend::model::{RosterItem, Subscription};
use confidante_backend::roster::RosterHandle;
use confidante_core::xml::Element;
use confidante_core::xml::namespaces;
use confidante_core::xmpp::jid::Jid;
use confidante_core::xmpp::stanza::Stanza;
use confidante_services::dispatch::Route;

pub const ROSTER: &str = "jabber:iq:roster";

pub fn spawn(router: mpsc::Sender<Stanza>, roster: RosterHandle) -> Route {
    let (inbox_tx, mut inbox_rx) = mpsc::channel(16);

    tokio::spawn(async move {
        while let Some(stanza) = inbox_rx.recv().await {
            let reply = handle(&stanza, &roster, &router).await;
            match reply {
                Ok(reply) => {
                    let _ = router.send(reply).await;
                }
                Err(err) => warn!(%err, "failed to handle roster request"),
            }
        }
    });

    Route { matches: Box::new(matches), inbox: inbox_tx }
}

fn matches(stanza: &Stanza) -> bool {
    matches!(stanza.element.attribute("type", None), Some("get") | Some("set"))
        && stanza.element.find_child("query", Some(ROSTER)).is_some()
}

async fn handle(
    stanza: &Stanza,
    roster: &RosterHandle,
    router: &mpsc::Sender<Stanza>,
) -> Result<Stanza, anyhow::Error> {
    let Some(from) = stanza.from_jid() else {
        return Stanza::error_reply(stanza, "bad-request", namespaces::XMPP_STANZA_ERRORS);
    };
    let Some(owner) = from.node().map(str::to_string) else {
        return Stanza::error_reply(stanza, "bad-request", namespaces::XMPP_STANZA_ERRORS);
    };

    if stanza.element.attribute("type", None) == Some("set") {
        return handle_set(stanza, &owner, &from, roster, router).await;
    }

    let items = roster.items(owner).await?;
    Stanza::result_reply(stanza, |iq| {
        iq.with_child("query", Some(ROSTER), |query| {
            for item in &items {
                append_item(query, item);
            }
        });
    })
}

async fn handle_set(
    stanza: &Stanza,
    owner: &str,
    from: &Jid,
    roster: &RosterHandle,
    router: &mpsc::Sender<Stanza>,
) -> Result<Stanza, anyhow::Error> {
    let Some(query) = stanza.element.find_child("query", Some(ROSTER)) else {
        return Stanza::error_reply(stanza, "bad-request", namespaces::XMPP_STANZA_ERRORS);
    };
    let Some(item_el) = query.find_child("item", None) else {
        return Stanza::error_reply(stanza, "bad-request", namespaces::XMPP_STANZA_ERRORS);
    };
    let Some(jid_str) = item_el.attribute("jid", None) else {
        return Stanza::error_reply(stanza, "bad-request", namespaces::XMPP_STANZA_ERRORS);
    };
    let contact: Jid = jid_str.parse()?;
    let existing = roster
        .items(owner.to_string())
        .await?
        .into_iter()
        .find(|item| item.contact.to_bare() == contact.to_bare());

    if item_el.attribute("subscription", None) == Some("remove") {
        roster.remove_item(owner.to_string(), contact.clone()).await?;

        if let Some(existing) = existing {
            for kind in cancel_directives(existing.subscription) {
                send_directive(router, from, &contact, kind).await;
            }
        }

        push_removed(router, from, &contact).await;
        return Stanza::result_reply(stanza, |_| {});
    }

    let (subscription, ask) = existing.as_ref().map_or((Subscription::None, false), |item| (item.subscription, item.ask));
    let name = item_el.attribute("name", None).map(str::to_string);
    let groups = item_el.children_named("group").map(|group| group.text()).collect();

    let item = RosterItem {
        owner: owner.to_string(),
        contact: contact.clone(),
        name,
        subscription,
        ask,
        groups,
    };
    roster.set_item(item.clone()).await?;
    push(router, from, &item).await;

    Stanza::result_reply(stanza, |_| {})
}

/// Removing a roster item implicitly cancels whichever halves of the
/// subscription it had: a `to`/`both` item loses the user's own view of the
/// contact, a `from`/`both` item loses the contact's view of the user.
fn cancel_directives(subscription: Subscription) -> Vec<&'static str> {
    match subscription {
        Subscription::None => vec![],
        Subscription::To => vec!["unsubscribe"],
        Subscription::From => vec!["unsubscribed"],
        Subscription::Both => vec!["unsubscribe", "unsubscribed"],
    }
}

async fn send_directive(router: &mpsc::Sender<Stanza>, owner: &Jid, contact: &Jid, kind: &str) {
    let mut element = Element::new("presence", Some(namespaces::XMPP_CLIENT));
    element.set_attribute("type", None::<String>, kind);
    element.set_attribute("from", None::<String>, owner.to_bare().to_string());
    element.set_attribute("to", None::<String>, contact.to_string());
    let _ = router.send(Stanza { element }).await;
}

/// Roster pushes are sent to the owner's own bare jid; the router fans any
/// non-message stanza addressed to a bare jid out to every bound resource.
async fn push(router: &mpsc::Sender<Stanza>, owner: &Jid, item: &RosterItem) {
    send_push(router, owner, |query| append_item(query, item)).await;
}

async fn push_removed(router: &mpsc::Sender<Stanza>, owner: &Jid, contact: &Jid) {
    send_push(router, owner, |query| {
        query.with_child("item", None, |el| {
            el.set_attribute("jid", None::<String>, contact.to_string());
            el.set_attribute("subscription", None::<String>, "remove");
        });
    })
    .await;
}

async fn send_push(router: &mpsc::Sender<Stanza>, owner: &Jid, build_query: impl FnOnce(&mut Element)) {
    let mut element = Element::new("iq", Some(namespaces::XMPP_CLIENT));
    element.set_attribute("type", None::<String>, "set");
    element.set_attribute("id", None::<String>, "roster-push");
    element.set_attribute("from", None::<String>, owner.to_bare().to_string());
    element.set_attribute("to", None::<String>, owner.to_bare().to_string());
    element.with_child("query", Some(ROSTER), |query| build_query(query));
    let _ = router.send(Stanza { element }).await;
}

fn append_item(query: &mut Element, item: &RosterItem) {
    query.with_child("item", None, |el| {
        el.set_attribute("jid", None::<String>, item.contact.to_string());
        el.set_attribute("subscription", None::<String>, subscription_str(item.subscription));
        if item.ask {
            el.set_attribute("ask", None::<String>, "subscribe");
        }
        if let Some(name) = &item.name {
            el.set_attribute("name", None::<String>, name.clone());
        }
        for group in &item.groups {
            el.with_child("group", None, |g| g.add_text(group.clone()));
        }
    });
}

fn subscription_str(subscription: Subscription) -> &'static str {
    match subscription {
        Subscription::None => "none",
        Subscription::To => "to",
        Subscription::From => "from",
        Subscription::Both => "both",
    }
}

#[cfg(test)]
mod tests {
    use confidante_backend::roster::fake::FakeRosterBackend;
    use confidante_core::xml::Element;

    use super::*;

    fn roster_get() -> Stanza {
        let mut element = Element::new("iq", None);
        element.set_attribute("type", None::<String>, "get");
        element.set_attribute("id", None::<String>, "1");
        element.set_attribute("from", None::<String>, "juliet@capulet.lit/balcony");
        element.with_child("query", Some(ROSTER), |_| {});
        Stanza { element }
    }

    fn roster_set(jid: &str, name: Option<&str>) -> Stanza {
        let mut element = Element::new("iq", None);
        element.set_attribute("type", None::<String>, "set");
        element.set_attribute("id", None::<String>, "2");
        element.set_attribute("from", None::<String>, "juliet@capulet.lit/balcony");
        element.with_child("query", Some(ROSTER), |query| {
            query.with_child("item", None, |item| {
                item.set_attribute("jid", None::<String>, jid.to_string());
                if let Some(name) = name {
                    item.set_attribute("name", None::<String>, name.to_string());
                }
            });
        });
        Stanza { element }
    }

    fn roster_remove(jid: &str) -> Stanza {
        let mut element = Element::new("iq", None);
        element.set_attribute("type", None::<String>, "set");
        element.set_attribute("id", None::<String>, "3");
        element.set_attribute("from", None::<String>, "juliet@capulet.lit/balcony");
        element.with_child("query", Some(ROSTER), |query| {
            query.with_child("item", None, |item| {
                item.set_attribute("jid", None::<String>, jid.to_string());
                item.set_attribute("subscription", None::<String>, "remove");
            });
        });
        Stanza { element }
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let roster = RosterHandle::new(FakeRosterBackend::default());
        let (router_tx, mut router_rx) = mpsc::channel(8);
        let route = spawn(router_tx, roster);

        route.inbox.send(roster_set("romeo@montague.lit", Some("Romeo"))).await.unwrap();
        router_rx.recv().await.unwrap(); // result
        router_rx.recv().await.unwrap(); // push

        route.inbox.send(roster_get()).await.unwrap();
        let reply = router_rx.recv().await.unwrap();
        let item = reply
            .element
            .find_child("query", Some(ROSTER))
            .unwrap()
            .find_child("item", None)
            .unwrap();
        assert_eq!(item.attribute("jid", None), Some("romeo@montague.lit"));
        assert_eq!(item.attribute("name", None), Some("Romeo"));
    }

    #[tokio::test]
    async fn removing_a_to_item_sends_unsubscribe_and_push() {
        let roster = RosterHandle::new(FakeRosterBackend::default());
        roster
            .set_item(RosterItem {
                owner: "juliet".to_string(),
                contact: "romeo@montague.lit".parse().unwrap(),
                name: None,
                subscription: Subscription::To,
                ask: false,
                groups: vec![],
            })
            .await
            .unwrap();

        let (router_tx, mut router_rx) = mpsc::channel(8);
        let route = spawn(router_tx, roster.clone());

        route.inbox.send(roster_remove("romeo@montague.lit")).await.unwrap();

        let unsubscribe = router_rx.recv().await.unwrap();
        assert_eq!(unsubscribe.element.name(), "presence");
        assert_eq!(unsubscribe.element.attribute("type", None), Some("unsubscribe"));

        let result = router_rx.recv().await.unwrap();
        assert_eq!(result.element.attribute("type", None), Some("result"));

        let push = router_rx.recv().await.unwrap();
        let item = push.element.find_child("query", Some(ROSTER)).unwrap().find_child("item", None).unwrap();
        assert_eq!(item.attribute("subscription", None), Some("remove"));

        assert!(roster.items("juliet".to_string()).await.unwrap().is_empty());
    }
}
