//! XEP-0012: Last Activity.
//!
//! Querying the server's own JID reports process uptime. Querying an
//! account reports seconds since that account's last resource went
//! unavailable; an account with no recorded activity yet (never logged
//! off, or never seen) answers `item-not-found` rather than guessing 0.

use std::time::Instant;

use tokio::sync::mpsc;
use tracing::warn;

use confidante_backend::last_activity::LastActivityHandle;
use confidante_core::xml::namespaces;
use confidante_core::xmpp::stanza::Stanza;
use confidante_services::dispatch::Route;

pub const LAST_ACTIVITY: &str = "jabber:iq:last";

pub fn spawn(router: mpsc::Sender<Stanza>, last_activity: LastActivityHandle, domain: String) -> Route {
    let (inbox_tx, mut inbox_rx) = mpsc::channel(8);
    let started_at = Instant::now();

    tokio::spawn(async move {
        while let Some(stanza) = inbox_rx.recv().await {
            let reply = handle(&stanza, &last_activity, &domain, started_at).await;
            match reply {
                Ok(reply) => {
                    let _ = router.send(reply).await;
                }
                Err(err) => warn!(%err, "failed to handle last activity request"),
            }
        }
    });

    Route {
        matches: Box::new(|stanza| {
            stanza.element.attribute("type", None) == Some("get")
                && stanza.element.find_child("query", Some(LAST_ACTIVITY)).is_some()
        }),
        inbox: inbox_tx,
    }
}

async fn handle(
    stanza: &Stanza,
    last_activity: &LastActivityHandle,
    domain: &str,
    started_at: Instant,
) -> Result<Stanza, anyhow::Error> {
    let is_server = stanza
        .to_jid()
        .map(|to| to.node().is_none() && to.domain() == domain)
        .unwrap_or(true);

    if is_server {
        return Stanza::result_reply(stanza, |iq| {
            iq.with_child("query", Some(LAST_ACTIVITY), |query| {
                query.set_attribute("seconds", None::<String>, started_at.elapsed().as_secs().to_string());
            });
        });
    }

    let Some(node) = stanza.to_jid().and_then(|to| to.node().map(str::to_string)) else {
        return Stanza::error_reply(stanza, "bad-request", namespaces::XMPP_STANZA_ERRORS);
    };

    match last_activity.seconds_idle(node).await? {
        Some((seconds, status)) => Stanza::result_reply(stanza, |iq| {
            iq.with_child("query", Some(LAST_ACTIVITY), |query| {
                query.set_attribute("seconds", None::<String>, seconds.to_string());
                if let Some(status) = &status {
                    query.set_text(status.clone());
                }
            });
        }),
        None => Stanza::error_reply(stanza, "item-not-found", namespaces::XMPP_STANZA_ERRORS),
    }
}

#[cfg(test)]
mod tests {
    use confidante_backend::last_activity::fake::FakeLastActivityBackend;
    use confidante_core::xml::Element;

    use super::*;

    fn last_activity_get(to: &str) -> Stanza {
        let mut element = Element::new("iq", None);
        element.set_attribute("type", None::<String>, "get");
        element.set_attribute("id", None::<String>, "1");
        element.set_attribute("from", None::<String>, "juliet@capulet.lit/balcony");
        element.set_attribute("to", None::<String>, to.to_string());
        element.with_child("query", Some(LAST_ACTIVITY), |_| {});
        Stanza { element }
    }

    #[tokio::test]
    async fn server_query_reports_uptime() {
        let last_activity = LastActivityHandle::new(FakeLastActivityBackend::default());
        let (router_tx, mut router_rx) = mpsc::channel(8);
        let route = spawn(router_tx, last_activity, "capulet.lit".to_string());

        route.inbox.send(last_activity_get("capulet.lit")).await.unwrap();

        let reply = router_rx.recv().await.unwrap();
        let query = reply.element.find_child("query", Some(LAST_ACTIVITY)).unwrap();
        assert!(query.attribute("seconds", None).is_some());
    }

    #[tokio::test]
    async fn account_query_with_no_recorded_touch_is_item_not_found() {
        let last_activity = LastActivityHandle::new(FakeLastActivityBackend::default());
        let (router_tx, mut router_rx) = mpsc::channel(8);
        let route = spawn(router_tx, last_activity, "capulet.lit".to_string());

        route.inbox.send(last_activity_get("romeo@capulet.lit")).await.unwrap();

        let reply = router_rx.recv().await.unwrap();
        assert_eq!(reply.element.attribute("type", None), Some("error"));
        let error = reply.element.find_child("error", None).unwrap();
        assert!(error.find_child("item-not-found", None).is_some());
    }

    #[tokio::test]
    async fn account_query_after_touch_reports_seconds_and_status() {
        let last_activity = LastActivityHandle::new(FakeLastActivityBackend::default());
        last_activity.touch("romeo".to_string(), Some("gone".to_string())).await.unwrap();
        let (router_tx, mut router_rx) = mpsc::channel(8);
        let route = spawn(router_tx, last_activity, "capulet.lit".to_string());

        route.inbox.send(last_activity_get("romeo@capulet.lit")).await.unwrap();

        let reply = router_rx.recv().await.unwrap();
        let query = reply.element.find_child("query", Some(LAST_ACTIVITY)).unwrap();
        assert!(query.attribute("seconds", None).is_some());
        assert_eq!(query.text(), "gone");
    }
}
