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
        vcard: Element,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
}

enum Query {
    Get {
        owner: String,
        result_tx: oneshot::Sender<Result<Option<Element>, Error>>,
    },
}

pub trait VCardBackend {
    fn set(&mut self, owner: String, vcard: Element) -> impl Future<Output = Result<(), Error>> + Send;
    fn get(&self, owner: String) -> impl Future<Output = Result<Option<Element>, Error>> + Send;
}

struct VCardStore<B: VCardBackend> {
    commands: mpsc::Receiver<Command>,
    queries: mpsc::Receiver<Query>,
    backend: B,
}

impl<B: VCardBackend> VCardStore<B> {
    async fn run(&mut self) {
        loop {
            select! {
                Some(Command::Set { owner, vcard, result_tx }) = self.commands.recv() => {
                    let _ = result_tx.send(self.backend.set(owner, vcard).await);
                }
                Some(Query::Get { owner, result_tx }) = self.queries.recv() => {
                    let _ = result_tx.send(self.backend.get(owner).await);
                }
                else => break,
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct VCardHandle {
    commands: mpsc::Sender<Command>,
    queries: mpsc::Sender<Query>,
}

impl VCardHandle {
    pub fn new<B>(backend: B) -> Self
    where
        B: VCardBackend + Send + 'static,
    {
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let (queries_tx, queries_rx) = mpsc::channel(8);
        let mut store = VCardStore {
            commands: commands_rx,
            queries: queries_rx,
            backend,
        };
        tokio::spawn(async move {
            store.run().await;
        });

        VCardHandle {
            commands: commands_tx,
            queries: queries_tx,
        }
    }

    pub async fn set(&self, owner: String, vcard: Element) -> Result<(), Error> {
        let (result_tx, result_rx) = oneshot::channel();
        let _ = self
            .commands
            .send(Command::Set {
                owner,
                vcard,
                result_tx,
            })
            .await;
        result_rx.await.expect("vcard store is gone")
    }

    pub async fn get(&self, owner: String) -> Result<Option<Element>, Error> {
        let (result_tx, result_rx) = oneshot::channel();
        let _ = self.queries.send(Query::Get { owner, result_tx }).await;
        result_rx.await.expect("vcard store is gone")
    }
}

pub mod fake {
    use std::collections::HashMap;

    use super::*;

    #[derive(Default)]
    pub struct FakeVCardBackend {
        vcards: HashMap<String, Element>,
    }

    impl VCardBackend for FakeVCardBackend {
        async fn set(&mut self, owner: String, vcard: Element) -> Result<(), Error> {
            self.vcards.insert(owner, vcard);
            Ok(())
        }

        async fn get(&self, owner: String) -> Result<Option<Element>, Error> {
            Ok(self.vcards.get(&owner).cloned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeVCardBackend;
    use super::*;

    #[tokio::test]
    async fn set_and_get() {
        let store = VCardHandle::new(FakeVCardBackend::default());
        let vcard = Element::new("vCard", Some("vcard-temp"));
        store.set("alice".to_string(), vcard.clone()).await.unwrap();

        let retrieved = store.get("alice".to_string()).await.unwrap();
        assert!(retrieved.is_some());
    }
}
