use std::future::Future;

use anyhow::Error;
use tokio::{
    select,
    sync::{mpsc, oneshot},
};

use confidante_core::xml::Element;

const MAX_QUEUED_MESSAGES: usize = 100;

enum Command {
    Enqueue {
        owner: String,
        stanza: Element,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
    Drain {
        owner: String,
        result_tx: oneshot::Sender<Result<Vec<Element>, Error>>,
    },
}

pub trait OfflineBackend {
    fn enqueue(
        &mut self,
        owner: String,
        stanza: Element,
    ) -> impl Future<Output = Result<(), Error>> + Send;
    fn drain(&mut self, owner: String) -> impl Future<Output = Result<Vec<Element>, Error>> + Send;
}

struct OfflineStore<B: OfflineBackend> {
    commands: mpsc::Receiver<Command>,
    backend: B,
}

impl<B: OfflineBackend> OfflineStore<B> {
    async fn run(&mut self) {
        loop {
            select! {
                Some(command) = self.commands.recv() => self.handle_command(command).await,
                else => break,
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Enqueue {
                owner,
                stanza,
                result_tx,
            } => {
                let _ = result_tx.send(self.backend.enqueue(owner, stanza).await);
            }
            Command::Drain { owner, result_tx } => {
                let _ = result_tx.send(self.backend.drain(owner).await);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct OfflineHandle {
    commands: mpsc::Sender<Command>,
}

impl OfflineHandle {
    pub fn new<B>(backend: B) -> Self
    where
        B: OfflineBackend + Send + 'static,
    {
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let mut store = OfflineStore {
            commands: commands_rx,
            backend,
        };
        tokio::spawn(async move {
            store.run().await;
        });

        OfflineHandle {
            commands: commands_tx,
        }
    }

    /// Stores a message for a user known to be unavailable. Overflow silently
    /// drops the new message; the queue length is bounded per user.
    pub async fn enqueue(&self, owner: String, stanza: Element) -> Result<(), Error> {
        let (result_tx, result_rx) = oneshot::channel();
        let _ = self
            .commands
            .send(Command::Enqueue {
                owner,
                stanza,
                result_tx,
            })
            .await;
        result_rx.await.expect("offline store is gone")
    }

    /// Returns and clears all stored messages for a user, in arrival order.
    pub async fn drain(&self, owner: String) -> Result<Vec<Element>, Error> {
        let (result_tx, result_rx) = oneshot::channel();
        let _ = self
            .commands
            .send(Command::Drain { owner, result_tx })
            .await;
        result_rx.await.expect("offline store is gone")
    }
}

pub mod fake {
    use std::collections::HashMap;

    use anyhow::bail;

    use super::*;

    #[derive(Default)]
    pub struct FakeOfflineBackend {
        queues: HashMap<String, Vec<Element>>,
    }

    impl OfflineBackend for FakeOfflineBackend {
        async fn enqueue(&mut self, owner: String, stanza: Element) -> Result<(), Error> {
            let queue = self.queues.entry(owner).or_default();
            if queue.len() >= MAX_QUEUED_MESSAGES {
                bail!("offline queue full");
            }
            queue.push(stanza);
            Ok(())
        }

        async fn drain(&mut self, owner: String) -> Result<Vec<Element>, Error> {
            Ok(self.queues.remove(&owner).unwrap_or_default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeOfflineBackend;
    use super::*;

    #[tokio::test]
    async fn enqueue_then_drain_is_fifo() {
        let store = OfflineHandle::new(FakeOfflineBackend::default());
        store
            .enqueue("alice".to_string(), Element::new("message", None))
            .await
            .unwrap();
        store
            .enqueue("alice".to_string(), Element::new("message", None))
            .await
            .unwrap();

        let drained = store.drain("alice".to_string()).await.unwrap();
        assert_eq!(drained.len(), 2);

        let drained_again = store.drain("alice".to_string()).await.unwrap();
        assert!(drained_again.is_empty());
    }
}
