use tokio::sync::mpsc;
use tracing::warn;

use confidante_core::xml::namespaces;
use confidante_core::xmpp::stanza::{Stanza, StanzaKind};

/// One module's entry in the dispatch chain. `matches` decides whether this
/// module owns a given IQ; `inbox` is the module's own single-consumer
/// queue, so handing a stanza to it is fire-and-forget from here.
pub struct Route {
    pub matches: Box<dyn Fn(&Stanza) -> bool + Send>,
    pub inbox: mpsc::Sender<Stanza>,
}

enum Command {
    Dispatch(Stanza),
}

struct Dispatcher {
    commands: mpsc::Receiver<Command>,
    routes: Vec<Route>,
    router: mpsc::Sender<Stanza>,
}

impl Dispatcher {
    async fn run(&mut self) {
        while let Some(Command::Dispatch(stanza)) = self.commands.recv().await {
            self.dispatch(stanza).await;
        }
    }

    /// First matching route owns the stanza exclusively. An unmatched
    /// get/set IQ gets `service-unavailable`; everything else is dropped,
    /// since results/errors never invoke handlers directly.
    async fn dispatch(&mut self, stanza: Stanza) {
        for route in &self.routes {
            if (route.matches)(&stanza) {
                if route.inbox.send(stanza).await.is_err() {
                    warn!("module inbox closed, dropping stanza");
                }
                return;
            }
        }

        if matches!(stanza.kind(), Some(StanzaKind::Iq)) && is_get_or_set(&stanza) {
            match Stanza::error_reply(&stanza, "service-unavailable", namespaces::XMPP_STANZA_ERRORS) {
                Ok(reply) => {
                    let _ = self.router.send(reply).await;
                }
                Err(err) => warn!(%err, "failed to build service-unavailable reply"),
            }
        }
    }
}

fn is_get_or_set(stanza: &Stanza) -> bool {
    matches!(stanza.element.attribute("type", None), Some("get") | Some("set"))
}

/// Handle to the running dispatch chain.
#[derive(Clone)]
pub struct DispatchHandle {
    commands: mpsc::Sender<Command>,
}

impl DispatchHandle {
    pub fn new(routes: Vec<Route>, router: mpsc::Sender<Stanza>) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(128);
        let mut dispatcher = Dispatcher {
            commands: commands_rx,
            routes,
            router,
        };
        tokio::spawn(async move {
            dispatcher.run().await;
        });

        DispatchHandle { commands: commands_tx }
    }

    pub async fn dispatch(&self, stanza: Stanza) {
        let _ = self.commands.send(Command::Dispatch(stanza)).await;
    }
}

#[cfg(test)]
mod tests {
    use confidante_core::xml::Element;

    use super::*;

    fn iq_get(namespace: &'static str) -> Stanza {
        let mut element = Element::new("iq", Some(namespaces::XMPP_CLIENT));
        element.set_attribute("type", None::<String>, "get");
        element.set_attribute("id", None::<String>, "1");
        element.with_child("query", Some(namespace), |_| {});
        Stanza { element }
    }

    #[tokio::test]
    async fn routes_to_first_matching_module() {
        let (router_tx, mut router_rx) = mpsc::channel(8);
        let (module_tx, mut module_rx) = mpsc::channel(8);
        let routes = vec![Route {
            matches: Box::new(|stanza| {
                stanza
                    .element
                    .find_child("query", Some("jabber:iq:version"))
                    .is_some()
            }),
            inbox: module_tx,
        }];
        let dispatch = DispatchHandle::new(routes, router_tx);

        dispatch.dispatch(iq_get("jabber:iq:version")).await;

        assert!(module_rx.recv().await.is_some());
        assert!(router_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unmatched_get_iq_bounces_service_unavailable() {
        let (router_tx, mut router_rx) = mpsc::channel(8);
        let dispatch = DispatchHandle::new(vec![], router_tx);

        dispatch.dispatch(iq_get("urn:unknown")).await;

        let reply = router_rx.recv().await.unwrap();
        assert_eq!(reply.element.attribute("type", None), Some("error"));
    }
}
