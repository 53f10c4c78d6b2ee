//! XEP-0092: Software Version.

use tokio::sync::mpsc;
use tracing::warn;

use confidante_core::xmpp::stanza::Stanza;
use confidante_services::dispatch::Route;

pub const VERSION: &str = "jabber:iq:version";

pub fn spawn(router: mpsc::Sender<Stanza>, name: String, version: String, os: String) -> Route {
    let (inbox_tx, mut inbox_rx) = mpsc::channel(8);

    tokio::spawn(async move {
        while let Some(stanza) = inbox_rx.recv().await {
            let reply = Stanza::result_reply(&stanza, |iq| {
                iq.with_child("query", Some(VERSION), |query| {
                    query.with_child("name", None, |e| e.set_text(name.clone()));
                    query.with_child("version", None, |e| e.set_text(version.clone()));
                    query.with_child("os", None, |e| e.set_text(os.clone()));
                });
            });

            match reply {
                Ok(reply) => {
                    let _ = router.send(reply).await;
                }
                Err(err) => warn!(%err, "failed to build version reply"),
            }
        }
    });

    Route {
        matches: Box::new(|stanza| {
            stanza.element.attribute("type", None) == Some("get")
                && stanza.element.find_child("query", Some(VERSION)).is_some()
        }),
        inbox: inbox_tx,
    }
}

#[cfg(test)]
mod tests {
    use confidante_core::xml::Element;

    use super::*;

    fn version_get() -> Stanza {
        let mut element = Element::new("iq", None);
        element.set_attribute("type", None::<String>, "get");
        element.set_attribute("id", None::<String>, "1");
        element.set_attribute("from", None::<String>, "juliet@capulet.lit/balcony");
        element.set_attribute("to", None::<String>, "capulet.lit");
        element.with_child("query", Some(VERSION), |_| {});
        Stanza { element }
    }

    #[tokio::test]
    async fn answers_with_configured_identity() {
        let (router_tx, mut router_rx) = mpsc::channel(8);
        let route = spawn(
            router_tx,
            "confidante".to_string(),
            "0.1.0".to_string(),
            "linux".to_string(),
        );

        route.inbox.send(version_get()).await.unwrap();

        let reply = router_rx.recv().await.unwrap();
        assert_eq!(reply.element.attribute("type", None), Some("result"));
        let query = reply.element.find_child("query", Some(VERSION)).unwrap();
        assert_eq!(query.find_child("name", None).unwrap().text(), "confidante");
        assert_eq!(query.find_child("version", None).unwrap().text(), "0.1.0");
        assert_eq!(query.find_child("os", None).unwrap().text(), "linux");
    }

    #[test]
    fn matches_only_version_get() {
        let route = {
            let (router_tx, _router_rx) = mpsc::channel(8);
            spawn(router_tx, "name".to_string(), "1".to_string(), "os".to_string())
        };

        assert!((route.matches)(&version_get()));

        let mut set = version_get();
        set.element.set_attribute("type", None::<String>, "set");
        assert!(!(route.matches)(&set));
    }
}
