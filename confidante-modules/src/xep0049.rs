//! XEP-0049: Private XML Storage.

use tokio::sync::mpsc;
use tracing::warn;

use confidante_backend::private_xml::PrivateXmlHandle;
use confidante_core::xml::namespaces;
use confidante_core::xmpp::stanza::Stanza;
use confidante_services::dispatch::Route;

pub const PRIVATE: &str = "jabber:iq:private";

pub fn spawn(router: mpsc::Sender<Stanza>, store: PrivateXmlHandle) -> Route {
    let (inbox_tx, mut inbox_rx) = mpsc::channel(16);

    tokio::spawn(async move {
        while let Some(stanza) = inbox_rx.recv().await {
            let reply = handle(&stanza, &store).await;
            match reply {
                Ok(reply) => {
                    let _ = router.send(reply).await;
                }
                Err(err) => warn!(%err, "failed to handle private xml request"),
            }
        }
    });

    Route { matches: Box::new(matches), inbox: inbox_tx }
}

fn matches(stanza: &Stanza) -> bool {
    matches!(stanza.element.attribute("type", None), Some("get") | Some("set"))
        && stanza.element.find_child("query", Some(PRIVATE)).is_some()
}

async fn handle(stanza: &Stanza, store: &PrivateXmlHandle) -> Result<Stanza, anyhow::Error> {
    let Some(owner) = stanza.from_jid().and_then(|jid| jid.node().map(str::to_string)) else {
        return Stanza::error_reply(stanza, "bad-request", namespaces::XMPP_STANZA_ERRORS);
    };
    let Some(query) = stanza.element.find_child("query", Some(PRIVATE)) else {
        return Stanza::error_reply(stanza, "bad-request", namespaces::XMPP_STANZA_ERRORS);
    };
    let Some(payload) = query.child_elements().next() else {
        return Stanza::error_reply(stanza, "bad-request", namespaces::XMPP_STANZA_ERRORS);
    };
    let Some(namespace) = payload.namespace().map(str::to_string) else {
        return Stanza::error_reply(stanza, "bad-request", namespaces::XMPP_STANZA_ERRORS);
    };

    if stanza.element.attribute("type", None) == Some("set") {
        store.set(owner, namespace, payload.clone()).await?;
        Stanza::result_reply(stanza, |_| {})
    } else {
        let name = payload.name().to_string();
        let stored = store.get(owner, namespace.clone()).await?;
        Stanza::result_reply(stanza, |iq| {
            iq.with_child("query", Some(PRIVATE), |query| {
                let element = stored.unwrap_or_else(|| {
                    let mut empty = confidante_core::xml::Element::new(&name, Some(&namespace));
                    empty.clear_elements();
                    empty
                });
                query.append_element(element);
            });
        })
    }
}

#[cfg(test)]
mod tests {
    use confidante_backend::private_xml::fake::FakePrivateXmlBackend;

    use super::*;
    use confidante_core::xml::Element;

    fn storage_set() -> Stanza {
        let mut element = Element::new("iq", None);
        element.set_attribute("type", None::<String>, "set");
        element.set_attribute("id", None::<String>, "1");
        element.set_attribute("from", None::<String>, "juliet@capulet.lit/balcony");
        element.with_child("query", Some(PRIVATE), |query| {
            query.with_child("storage", Some("storage:bookmarks"), |_| {});
        });
        Stanza { element }
    }

    fn storage_get() -> Stanza {
        let mut element = Element::new("iq", None);
        element.set_attribute("type", None::<String>, "get");
        element.set_attribute("id", None::<String>, "2");
        element.set_attribute("from", None::<String>, "juliet@capulet.lit/balcony");
        element.with_child("query", Some(PRIVATE), |query| {
            query.with_child("storage", Some("storage:bookmarks"), |_| {});
        });
        Stanza { element }
    }

    #[tokio::test]
    async fn set_then_get_round_trips_for_the_owner() {
        let store = PrivateXmlHandle::new(FakePrivateXmlBackend::default());
        let (router_tx, mut router_rx) = mpsc::channel(8);
        let route = spawn(router_tx, store);

        route.inbox.send(storage_set()).await.unwrap();
        let set_reply = router_rx.recv().await.unwrap();
        assert_eq!(set_reply.element.attribute("type", None), Some("result"));

        route.inbox.send(storage_get()).await.unwrap();
        let get_reply = router_rx.recv().await.unwrap();
        let query = get_reply.element.find_child("query", Some(PRIVATE)).unwrap();
        assert!(query.find_child("storage", Some("storage:bookmarks")).is_some());
    }

    #[tokio::test]
    async fn get_with_no_stored_fragment_returns_the_empty_shape() {
        let store = PrivateXmlHandle::new(FakePrivateXmlBackend::default());
        let (router_tx, mut router_rx) = mpsc::channel(8);
        let route = spawn(router_tx, store);

        route.inbox.send(storage_get()).await.unwrap();
        let reply = router_rx.recv().await.unwrap();
        let query = reply.element.find_child("query", Some(PRIVATE)).unwrap();
        let storage = query.find_child("storage", Some("storage:bookmarks")).unwrap();
        assert!(storage.child_elements().next().is_none());
    }
}
