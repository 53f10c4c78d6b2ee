use std::future::Future;

use anyhow::Error;
use tokio::{
    select,
    sync::{mpsc, oneshot},
};

use confidante_core::xmpp::jid::Jid;

use crate::model::{PubSubAffiliation, PubSubItem, PubSubNode};

enum Command {
    Publish {
        owner: String,
        item: PubSubItem,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
    Subscribe {
        owner: String,
        subscriber: Jid,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
    Unsubscribe {
        owner: String,
        subscriber: Jid,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
}

enum Query {
    Node {
        owner: String,
        result_tx: oneshot::Sender<Result<PubSubNode, Error>>,
    },
}

pub trait PubSubBackend {
    fn publish(
        &mut self,
        owner: String,
        item: PubSubItem,
    ) -> impl Future<Output = Result<(), Error>> + Send;
    fn subscribe(
        &mut self,
        owner: String,
        subscriber: Jid,
    ) -> impl Future<Output = Result<(), Error>> + Send;
    fn unsubscribe(
        &mut self,
        owner: String,
        subscriber: Jid,
    ) -> impl Future<Output = Result<(), Error>> + Send;
    fn node(&self, owner: String) -> impl Future<Output = Result<PubSubNode, Error>> + Send;
}

struct PubSubStore<B: PubSubBackend> {
    commands: mpsc::Receiver<Command>,
    queries: mpsc::Receiver<Query>,
    backend: B,
}

impl<B: PubSubBackend> PubSubStore<B> {
    async fn run(&mut self) {
        loop {
            select! {
                Some(command) = self.commands.recv() => self.handle_command(command).await,
                Some(Query::Node { owner, result_tx }) = self.queries.recv() => {
                    let _ = result_tx.send(self.backend.node(owner).await);
                }
                else => break,
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Publish {
                owner,
                item,
                result_tx,
            } => {
                let _ = result_tx.send(self.backend.publish(owner, item).await);
            }
            Command::Subscribe {
                owner,
                subscriber,
                result_tx,
            } => {
                let _ = result_tx.send(self.backend.subscribe(owner, subscriber).await);
            }
            Command::Unsubscribe {
                owner,
                subscriber,
                result_tx,
            } => {
                let _ = result_tx.send(self.backend.unsubscribe(owner, subscriber).await);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct PubSubHandle {
    commands: mpsc::Sender<Command>,
    queries: mpsc::Sender<Query>,
}

impl PubSubHandle {
    pub fn new<B>(backend: B) -> Self
    where
        B: PubSubBackend + Send + 'static,
    {
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let (queries_tx, queries_rx) = mpsc::channel(8);
        let mut store = PubSubStore {
            commands: commands_rx,
            queries: queries_rx,
            backend,
        };
        tokio::spawn(async move {
            store.run().await;
        });

        PubSubHandle {
            commands: commands_tx,
            queries: queries_tx,
        }
    }

    pub async fn publish(&self, owner: String, item: PubSubItem) -> Result<(), Error> {
        let (result_tx, result_rx) = oneshot::channel();
        let _ = self
            .commands
            .send(Command::Publish {
                owner,
                item,
                result_tx,
            })
            .await;
        result_rx.await.expect("pubsub store is gone")
    }

    pub async fn subscribe(&self, owner: String, subscriber: Jid) -> Result<(), Error> {
        let (result_tx, result_rx) = oneshot::channel();
        let _ = self
            .commands
            .send(Command::Subscribe {
                owner,
                subscriber,
                result_tx,
            })
            .await;
        result_rx.await.expect("pubsub store is gone")
    }

    pub async fn unsubscribe(&self, owner: String, subscriber: Jid) -> Result<(), Error> {
        let (result_tx, result_rx) = oneshot::channel();
        let _ = self
            .commands
            .send(Command::Unsubscribe {
                owner,
                subscriber,
                result_tx,
            })
            .await;
        result_rx.await.expect("pubsub store is gone")
    }

    pub async fn node(&self, owner: String) -> Result<PubSubNode, Error> {
        let (result_tx, result_rx) = oneshot::channel();
        let _ = self.queries.send(Query::Node { owner, result_tx }).await;
        result_rx.await.expect("pubsub store is gone")
    }
}

pub mod fake {
    use std::collections::HashMap;

    use super::*;

    #[derive(Default)]
    pub struct FakePubSubBackend {
        nodes: HashMap<String, PubSubNode>,
    }

    impl PubSubBackend for FakePubSubBackend {
        async fn publish(&mut self, owner: String, item: PubSubItem) -> Result<(), Error> {
            let node = self.nodes.entry(owner).or_default();
            node.items.retain(|existing| existing.id != item.id);
            node.items.push(item);
            Ok(())
        }

        async fn subscribe(&mut self, owner: String, subscriber: Jid) -> Result<(), Error> {
            let node = self.nodes.entry(owner).or_default();
            if !node.subscribers.contains(&subscriber) {
                node.subscribers.push(subscriber.clone());
            }
            node.affiliations.retain(|(jid, _)| jid != &subscriber);
            node.affiliations
                .push((subscriber, PubSubAffiliation::Member));
            Ok(())
        }

        async fn unsubscribe(&mut self, owner: String, subscriber: Jid) -> Result<(), Error> {
            if let Some(node) = self.nodes.get_mut(&owner) {
                node.subscribers.retain(|jid| jid != &subscriber);
            }
            Ok(())
        }

        async fn node(&self, owner: String) -> Result<PubSubNode, Error> {
            Ok(self.nodes.get(&owner).cloned().unwrap_or_default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakePubSubBackend;
    use super::*;

    #[tokio::test]
    async fn subscribe_then_publish_is_visible() {
        let store = PubSubHandle::new(FakePubSubBackend::default());
        let subscriber = "bob@localhost".parse::<Jid>().unwrap();
        store
            .subscribe("alice".to_string(), subscriber.clone())
            .await
            .unwrap();
        store
            .publish(
                "alice".to_string(),
                PubSubItem {
                    id: "current".to_string(),
                    payload: confidante_core::xml::Element::new("mood", None),
                },
            )
            .await
            .unwrap();

        let node = store.node("alice".to_string()).await.unwrap();
        assert_eq!(node.items.len(), 1);
        assert!(node.subscribers.contains(&subscriber));
    }
}
