//! XEP-0054: vcard-temp.

use tokio::sync::mpsc;
use tracing::warn;

use confidante_backend::vcard::VCardHandle;
use confidante_core::xml::Element;
use confidante_core::xml::namespaces;
use confidante_core::xmpp::stanza::Stanza;
use confidante_services::dispatch::Route;

pub const VCARD: &str = "vcard-temp";

pub fn spawn(router: mpsc::Sender<Stanza>, store: VCardHandle) -> Route {
    let (inbox_tx, mut inbox_rx) = mpsc::channel(16);

    tokio::spawn(async move {
        while let Some(stanza) = inbox_rx.recv().await {
            let reply = handle(&stanza, &store).await;
            match reply {
                Ok(reply) => {
                    let _ = router.send(reply).await;
                }
                Err(err) => warn!(%err, "failed to handle vcard request"),
            }
        }
    });

    Route { matches: Box::new(matches), inbox: inbox_tx }
}

fn matches(stanza: &Stanza) -> bool {
    matches!(stanza.element.attribute("type", None), Some("get") | Some("set"))
        && stanza.element.find_child("vCard", Some(VCARD)).is_some()
}

async fn handle(stanza: &Stanza, store: &VCardHandle) -> Result<Stanza, anyhow::Error> {
    let Some(from) = stanza.from_jid().and_then(|jid| jid.node().map(str::to_string)) else {
        return Stanza::error_reply(stanza, "bad-request", namespaces::XMPP_STANZA_ERRORS);
    };

    if stanza.element.attribute("type", None) == Some("set") {
        let Some(vcard) = stanza.element.find_child("vCard", Some(VCARD)) else {
            return Stanza::error_reply(stanza, "bad-request", namespaces::XMPP_STANZA_ERRORS);
        };
        store.set(from, vcard.clone()).await?;
        return Stanza::result_reply(stanza, |_| {});
    }

    let owner = stanza
        .to_jid()
        .and_then(|jid| jid.node().map(str::to_string))
        .unwrap_or(from);
    let vcard = store.get(owner).await?.unwrap_or_else(|| Element::new("vCard", Some(VCARD)));
    Stanza::result_reply(stanza, |iq| {
        iq.append_element(vcard);
    })
}

#[cfg(test)]
mod tests {
    use confidante_backend::vcard::fake::FakeVCardBackend;

    use super::*;

    fn vcard_set(nickname: &str) -> Stanza {
        let mut element = Element::new("iq", None);
        element.set_attribute("type", None::<String>, "set");
        element.set_attribute("id", None::<String>, "1");
        element.set_attribute("from", None::<String>, "juliet@capulet.lit/balcony");
        element.with_child("vCard", Some(VCARD), |vcard| {
            vcard.with_child("NICKNAME", None, |e| e.set_text(nickname.to_string()));
        });
        Stanza { element }
    }

    fn vcard_get(to: Option<&str>) -> Stanza {
        let mut element = Element::new("iq", None);
        element.set_attribute("type", None::<String>, "get");
        element.set_attribute("id", None::<String>, "2");
        element.set_attribute("from", None::<String>, "juliet@capulet.lit/balcony");
        if let Some(to) = to {
            element.set_attribute("to", None::<String>, to.to_string());
        }
        element.with_child("vCard", Some(VCARD), |_| {});
        Stanza { element }
    }

    #[tokio::test]
    async fn set_then_get_own_vcard_round_trips() {
        let store = VCardHandle::new(FakeVCardBackend::default());
        let (router_tx, mut router_rx) = mpsc::channel(8);
        let route = spawn(router_tx, store);

        route.inbox.send(vcard_set("Juliet")).await.unwrap();
        assert_eq!(router_rx.recv().await.unwrap().element.attribute("type", None), Some("result"));

        route.inbox.send(vcard_get(None)).await.unwrap();
        let reply = router_rx.recv().await.unwrap();
        let vcard = reply.element.find_child("vCard", Some(VCARD)).unwrap();
        assert_eq!(vcard.find_child("NICKNAME", None).unwrap().text(), "Juliet");
    }

    #[tokio::test]
    async fn get_for_another_account_reads_their_vcard() {
        let store = VCardHandle::new(FakeVCardBackend::default());
        store.set("romeo".to_string(), {
            let mut vcard = Element::new("vCard", Some(VCARD));
            vcard.with_child("NICKNAME", None, |e| e.set_text("Romeo"));
            vcard
        }).await.unwrap();
        let (router_tx, mut router_rx) = mpsc::channel(8);
        let route = spawn(router_tx, store);

        route.inbox.send(vcard_get(Some("romeo@capulet.lit"))).await.unwrap();
        let reply = router_rx.recv().await.unwrap();
        let vcard = reply.element.find_child("vCard", Some(VCARD)).unwrap();
        assert_eq!(vcard.find_child("NICKNAME", None).unwrap().text(), "Romeo");
    }
}
