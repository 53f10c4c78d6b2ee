//! XEP-0199: XMPP Ping.
//!
//! Only the passive responder half is implemented here: answering a peer's
//! `<ping/>` IQ. Server-initiated keepalive pings belong to the stream's own
//! idle-timeout handling, not to module dispatch.

use tokio::sync::mpsc;
use tracing::warn;

use confidante_core::xmpp::stanza::Stanza;
use confidante_services::dispatch::Route;

pub const PING: &str = "urn:xmpp:ping";

pub fn spawn(router: mpsc::Sender<Stanza>) -> Route {
    let (inbox_tx, mut inbox_rx) = mpsc::channel(8);

    tokio::spawn(async move {
        while let Some(stanza) = inbox_rx.recv().await {
            match Stanza::result_reply(&stanza, |_| {}) {
                Ok(reply) => {
                    let _ = router.send(reply).await;
                }
                Err(err) => warn!(%err, "failed to build ping reply"),
            }
        }
    });

    Route {
        matches: Box::new(|stanza| {
            stanza.element.attribute("type", None) == Some("get")
                && stanza.element.find_child("ping", Some(PING)).is_some()
        }),
        inbox: inbox_tx,
    }
}

#[cfg(test)]
mod tests {
    use confidante_core::xml::Element;

    use super::*;

    fn ping() -> Stanza {
        let mut element = Element::new("iq", None);
        element.set_attribute("type", None::<String>, "get");
        element.set_attribute("id", None::<String>, "1");
        element.set_attribute("from", None::<String>, "juliet@capulet.lit/balcony");
        element.set_attribute("to", None::<String>, "capulet.lit");
        element.with_child("ping", Some(PING), |_| {});
        Stanza { element }
    }

    #[tokio::test]
    async fn answers_empty_result() {
        let (router_tx, mut router_rx) = mpsc::channel(8);
        let route = spawn(router_tx);

        route.inbox.send(ping()).await.unwrap();

        let reply = router_rx.recv().await.unwrap();
        assert_eq!(reply.element.attribute("type", None), Some("result"));
        assert_eq!(reply.element.attribute("id", None), Some("1"));
    }
}
