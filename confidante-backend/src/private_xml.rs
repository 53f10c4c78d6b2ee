use std::future::Future;

use anyhow::Error;
use tokio::{
    select,
    sync::{mpsc, oneshot},
};

use confidante_core::xml::Element;

enum Command {
    Set {
        owner: String,
        namespace: String,
        element: Element,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
}

enum Query {
    Get {
        owner: String,
        namespace: String,
        result_tx: oneshot::Sender<Result<Option<Element>, Error>>,
    },
}

pub trait PrivateXmlBackend {
    fn set(
        &mut self,
        owner: String,
        namespace: String,
        element: Element,
    ) -> impl Future<Output = Result<(), Error>> + Send;
    fn get(
        &self,
        owner: String,
        namespace: String,
    ) -> impl Future<Output = Result<Option<Element>, Error>> + Send;
}

struct PrivateXmlStore<B: PrivateXmlBackend> {
    commands: mpsc::Receiver<Command>,
    queries: mpsc::Receiver<Query>,
    backend: B,
}

impl<B: PrivateXmlBackend> PrivateXmlStore<B> {
    async fn run(&mut self) {
        loop {
            select! {
                Some(Command::Set { owner, namespace, element, result_tx }) = self.commands.recv() => {
                    let _ = result_tx.send(self.backend.set(owner, namespace, element).await);
                }
                Some(Query::Get { owner, namespace, result_tx }) = self.queries.recv() => {
                    let _ = result_tx.send(self.backend.get(owner, namespace).await);
                }
                else => break,
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct PrivateXmlHandle {
    commands: mpsc::Sender<Command>,
    queries: mpsc::Sender<Query>,
}

impl PrivateXmlHandle {
    pub fn new<B>(backend: B) -> Self
    where
        B: PrivateXmlBackend + Send + 'static,
    {
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let (queries_tx, queries_rx) = mpsc::channel(8);
        let mut store = PrivateXmlStore {
            commands: commands_rx,
            queries: queries_rx,
            backend,
        };
        tokio::spawn(async move {
            store.run().await;
        });

        PrivateXmlHandle {
            commands: commands_tx,
            queries: queries_tx,
        }
    }

    pub async fn set(&self, owner: String, namespace: String, element: Element) -> Result<(), Error> {
        let (result_tx, result_rx) = oneshot::channel();
        let _ = self
            .commands
            .send(Command::Set {
                owner,
                namespace,
                element,
                result_tx,
            })
            .await;
        result_rx.await.expect("private xml store is gone")
    }

    pub async fn get(&self, owner: String, namespace: String) -> Result<Option<Element>, Error> {
        let (result_tx, result_rx) = oneshot::channel();
        let _ = self
            .queries
            .send(Query::Get {
                owner,
                namespace,
                result_tx,
            })
            .await;
        result_rx.await.expect("private xml store is gone")
    }
}

pub mod fake {
    use std::collections::HashMap;

    use super::*;

    #[derive(Default)]
    pub struct FakePrivateXmlBackend {
        entries: HashMap<(String, String), Element>,
    }

    impl PrivateXmlBackend for FakePrivateXmlBackend {
        async fn set(
            &mut self,
            owner: String,
            namespace: String,
            element: Element,
        ) -> Result<(), Error> {
            self.entries.insert((owner, namespace), element);
            Ok(())
        }

        async fn get(&self, owner: String, namespace: String) -> Result<Option<Element>, Error> {
            Ok(self.entries.get(&(owner, namespace)).cloned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakePrivateXmlBackend;
    use super::*;

    #[tokio::test]
    async fn set_and_get_is_namespaced() {
        let store = PrivateXmlHandle::new(FakePrivateXmlBackend::default());
        let element = Element::new("storage", Some("storage:bookmarks"));
        store
            .set(
                "alice".to_string(),
                "storage:bookmarks".to_string(),
                element,
            )
            .await
            .unwrap();

        assert!(store
            .get("alice".to_string(), "storage:bookmarks".to_string())
            .await
            .unwrap()
            .is_some());
        assert!(store
            .get("alice".to_string(), "storage:other".to_string())
            .await
            .unwrap()
            .is_none());
    }
}
