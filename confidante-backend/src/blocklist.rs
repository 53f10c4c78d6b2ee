use std::future::Future;

use anyhow::Error;
use tokio::{
    select,
    sync::{mpsc, oneshot},
};

use confidante_core::xmpp::jid::Jid;

use crate::model::BlockListItem;

enum Command {
    Add {
        item: BlockListItem,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
    Remove {
        owner: String,
        jid_pattern: Jid,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
}

enum Query {
    List {
        owner: String,
        result_tx: oneshot::Sender<Result<Vec<BlockListItem>, Error>>,
    },
}

pub trait BlockListBackend {
    fn add(&mut self, item: BlockListItem) -> impl Future<Output = Result<(), Error>> + Send;
    fn remove(
        &mut self,
        owner: String,
        jid_pattern: Jid,
    ) -> impl Future<Output = Result<(), Error>> + Send;
    fn list(&self, owner: String) -> impl Future<Output = Result<Vec<BlockListItem>, Error>> + Send;
}

struct BlockList<B: BlockListBackend> {
    commands: mpsc::Receiver<Command>,
    queries: mpsc::Receiver<Query>,
    backend: B,
}

impl<B: BlockListBackend> BlockList<B> {
    async fn run(&mut self) {
        loop {
            select! {
                Some(command) = self.commands.recv() => match command {
                    Command::Add { item, result_tx } => {
                        let _ = result_tx.send(self.backend.add(item).await);
                    }
                    Command::Remove { owner, jid_pattern, result_tx } => {
                        let _ = result_tx.send(self.backend.remove(owner, jid_pattern).await);
                    }
                },
                Some(Query::List { owner, result_tx }) = self.queries.recv() => {
                    let _ = result_tx.send(self.backend.list(owner).await);
                }
                else => break,
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BlockListHandle {
    commands: mpsc::Sender<Command>,
    queries: mpsc::Sender<Query>,
}

impl BlockListHandle {
    pub fn new<B>(backend: B) -> Self
    where
        B: BlockListBackend + Send + 'static,
    {
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let (queries_tx, queries_rx) = mpsc::channel(8);
        let mut blocklist = BlockList {
            commands: commands_rx,
            queries: queries_rx,
            backend,
        };
        tokio::spawn(async move {
            blocklist.run().await;
        });

        BlockListHandle {
            commands: commands_tx,
            queries: queries_tx,
        }
    }

    pub async fn add(&self, item: BlockListItem) -> Result<(), Error> {
        let (result_tx, result_rx) = oneshot::channel();
        let _ = self.commands.send(Command::Add { item, result_tx }).await;
        result_rx.await.expect("blocklist store is gone")
    }

    pub async fn remove(&self, owner: String, jid_pattern: Jid) -> Result<(), Error> {
        let (result_tx, result_rx) = oneshot::channel();
        let _ = self
            .commands
            .send(Command::Remove {
                owner,
                jid_pattern,
                result_tx,
            })
            .await;
        result_rx.await.expect("blocklist store is gone")
    }

    pub async fn list(&self, owner: String) -> Result<Vec<BlockListItem>, Error> {
        let (result_tx, result_rx) = oneshot::channel();
        let _ = self.queries.send(Query::List { owner, result_tx }).await;
        result_rx.await.expect("blocklist store is gone")
    }
}

pub mod fake {
    use super::*;

    #[derive(Default)]
    pub struct FakeBlockListBackend {
        items: Vec<BlockListItem>,
    }

    impl BlockListBackend for FakeBlockListBackend {
        async fn add(&mut self, item: BlockListItem) -> Result<(), Error> {
            self.items.push(item);
            Ok(())
        }

        async fn remove(&mut self, owner: String, jid_pattern: Jid) -> Result<(), Error> {
            self.items
                .retain(|item| !(item.owner == owner && item.jid_pattern == jid_pattern));
            Ok(())
        }

        async fn list(&self, owner: String) -> Result<Vec<BlockListItem>, Error> {
            Ok(self
                .items
                .iter()
                .filter(|item| item.owner == owner)
                .cloned()
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeBlockListBackend;
    use super::*;

    #[tokio::test]
    async fn add_and_list() {
        let blocklist = BlockListHandle::new(FakeBlockListBackend::default());
        let pattern = "bob@localhost".parse::<Jid>().unwrap();
        blocklist
            .add(BlockListItem {
                owner: "alice".to_string(),
                jid_pattern: pattern.clone(),
            })
            .await
            .unwrap();

        let items = blocklist.list("alice".to_string()).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].jid_pattern, pattern);
    }
}
