//! XEP-0030: Service Discovery.
//!
//! Feature and identity lists are computed once, from the set of modules a
//! deployment has enabled, rather than mutated at runtime through a
//! register/unregister API: the enabled-module set is fixed for the life of
//! the process.

use tokio::sync::mpsc;
use tracing::warn;

use confidante_core::xml::Element;
use confidante_core::xmpp::stanza::Stanza;
use confidante_services::dispatch::Route;

pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";

pub fn spawn(
    router: mpsc::Sender<Stanza>,
    domain: String,
    server_features: Vec<String>,
    account_features: Vec<String>,
) -> Route {
    let (inbox_tx, mut inbox_rx) = mpsc::channel(32);

    tokio::spawn(async move {
        while let Some(stanza) = inbox_rx.recv().await {
            let reply = if stanza.element.find_child("query", Some(DISCO_INFO)).is_some() {
                build_info_reply(&stanza, &domain, &server_features, &account_features)
            } else {
                build_items_reply(&stanza)
            };

            match reply {
                Ok(reply) => {
                    let _ = router.send(reply).await;
                }
                Err(err) => warn!(%err, "failed to build disco reply"),
            }
        }
    });

    Route { matches: Box::new(matches), inbox: inbox_tx }
}

fn matches(stanza: &Stanza) -> bool {
    is_get(stanza)
        && (stanza.element.find_child("query", Some(DISCO_INFO)).is_some()
            || stanza.element.find_child("query", Some(DISCO_ITEMS)).is_some())
}

fn is_get(stanza: &Stanza) -> bool {
    stanza.element.attribute("type", None) == Some("get")
}

fn build_info_reply(
    stanza: &Stanza,
    domain: &str,
    server_features: &[String],
    account_features: &[String],
) -> Result<Stanza, anyhow::Error> {
    let is_server = stanza.to_jid().map(|to| to.node().is_none()).unwrap_or(true);

    Stanza::result_reply(stanza, |iq| {
        iq.with_child("query", Some(DISCO_INFO), |query| {
            if is_server {
                query.with_child("identity", None, |identity| {
                    identity.set_attribute("category", None::<String>, "server");
                    identity.set_attribute("type", None::<String>, "im");
                    identity.set_attribute("name", None::<String>, domain.to_string());
                });
                append_features(query, server_features);
            } else {
                query.with_child("identity", None, |identity| {
                    identity.set_attribute("category", None::<String>, "account");
                    identity.set_attribute("type", None::<String>, "registered");
                });
                append_features(query, account_features);
            }
        });
    })
}

fn append_features(query: &mut Element, features: &[String]) {
    for feature in features {
        query.with_child("feature", None, |f| {
            f.set_attribute("var", None::<String>, feature.clone());
        });
    }
}

fn build_items_reply(stanza: &Stanza) -> Result<Stanza, anyhow::Error> {
    Stanza::result_reply(stanza, |iq| {
        iq.with_child("query", Some(DISCO_ITEMS), |_| {});
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_get(to: &str) -> Stanza {
        let mut element = Element::new("iq", None);
        element.set_attribute("type", None::<String>, "get");
        element.set_attribute("id", None::<String>, "1");
        element.set_attribute("from", None::<String>, "juliet@capulet.lit/balcony");
        element.set_attribute("to", None::<String>, to.to_string());
        element.with_child("query", Some(DISCO_INFO), |_| {});
        Stanza { element }
    }

    #[tokio::test]
    async fn server_query_reports_server_identity_and_features() {
        let (router_tx, mut router_rx) = mpsc::channel(8);
        let route = spawn(
            router_tx,
            "capulet.lit".to_string(),
            vec![DISCO_INFO.to_string(), "urn:xmpp:ping".to_string()],
            vec![],
        );

        route.inbox.send(info_get("capulet.lit")).await.unwrap();

        let reply = router_rx.recv().await.unwrap();
        let query = reply.element.find_child("query", Some(DISCO_INFO)).unwrap();
        let identity = query.find_child("identity", None).unwrap();
        assert_eq!(identity.attribute("category", None), Some("server"));
        let features: Vec<_> = query.children_named("feature").collect();
        assert_eq!(features.len(), 2);
    }

    #[tokio::test]
    async fn account_query_reports_account_identity_and_features() {
        let (router_tx, mut router_rx) = mpsc::channel(8);
        let route = spawn(
            router_tx,
            "capulet.lit".to_string(),
            vec![],
            vec!["jabber:iq:last".to_string()],
        );

        route.inbox.send(info_get("juliet@capulet.lit")).await.unwrap();

        let reply = router_rx.recv().await.unwrap();
        let query = reply.element.find_child("query", Some(DISCO_INFO)).unwrap();
        let identity = query.find_child("identity", None).unwrap();
        assert_eq!(identity.attribute("category", None), Some("account"));
        let features: Vec<_> = query.children_named("feature").collect();
        assert_eq!(features.len(), 1);
    }
}
