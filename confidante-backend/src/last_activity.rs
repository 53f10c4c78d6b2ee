use std::future::Future;
use std::time::Instant;

use anyhow::Error;
use tokio::{
    select,
    sync::{mpsc, oneshot},
};

enum Command {
    Touch {
        owner: String,
        status: Option<String>,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
}

enum Query {
    Get {
        owner: String,
        result_tx: oneshot::Sender<Result<Option<(u64, Option<String>)>, Error>>,
    },
}

pub trait LastActivityBackend {
    fn touch(
        &mut self,
        owner: String,
        status: Option<String>,
    ) -> impl Future<Output = Result<(), Error>> + Send;
    /// Seconds elapsed since the owner's last touch, and the status they left
    /// with, if any touch has been recorded at all.
    fn seconds_idle(
        &self,
        owner: String,
    ) -> impl Future<Output = Result<Option<(u64, Option<String>)>, Error>> + Send;
}

struct LastActivityStore<B: LastActivityBackend> {
    commands: mpsc::Receiver<Command>,
    queries: mpsc::Receiver<Query>,
    backend: B,
}

impl<B: LastActivityBackend> LastActivityStore<B> {
    async fn run(&mut self) {
        loop {
            select! {
                Some(Command::Touch { owner, status, result_tx }) = self.commands.recv() => {
                    let _ = result_tx.send(self.backend.touch(owner, status).await);
                }
                Some(Query::Get { owner, result_tx }) = self.queries.recv() => {
                    let _ = result_tx.send(self.backend.seconds_idle(owner).await);
                }
                else => break,
            }
        }
    }
}

/// Tracks how long each account has been idle (XEP-0012). A touch is
/// recorded whenever a resource goes unavailable; querying an account that's
/// still online is the caller's responsibility to reject before asking here.
#[derive(Debug, Clone)]
pub struct LastActivityHandle {
    commands: mpsc::Sender<Command>,
    queries: mpsc::Sender<Query>,
}

impl LastActivityHandle {
    pub fn new<B>(backend: B) -> Self
    where
        B: LastActivityBackend + Send + 'static,
    {
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let (queries_tx, queries_rx) = mpsc::channel(8);
        let mut store = LastActivityStore {
            commands: commands_rx,
            queries: queries_rx,
            backend,
        };
        tokio::spawn(async move {
            store.run().await;
        });

        LastActivityHandle {
            commands: commands_tx,
            queries: queries_tx,
        }
    }

    pub async fn touch(&self, owner: String, status: Option<String>) -> Result<(), Error> {
        let (result_tx, result_rx) = oneshot::channel();
        let _ = self
            .commands
            .send(Command::Touch { owner, status, result_tx })
            .await;
        result_rx.await.expect("last activity store is gone")
    }

    pub async fn seconds_idle(&self, owner: String) -> Result<Option<(u64, Option<String>)>, Error> {
        let (result_tx, result_rx) = oneshot::channel();
        let _ = self.queries.send(Query::Get { owner, result_tx }).await;
        result_rx.await.expect("last activity store is gone")
    }
}

pub mod fake {
    use std::collections::HashMap;

    use super::*;

    #[derive(Default)]
    pub struct FakeLastActivityBackend {
        entries: HashMap<String, (Instant, Option<String>)>,
    }

    impl LastActivityBackend for FakeLastActivityBackend {
        async fn touch(&mut self, owner: String, status: Option<String>) -> Result<(), Error> {
            self.entries.insert(owner, (Instant::now(), status));
            Ok(())
        }

        async fn seconds_idle(&self, owner: String) -> Result<Option<(u64, Option<String>)>, Error> {
            Ok(self
                .entries
                .get(&owner)
                .map(|(seen, status)| (seen.elapsed().as_secs(), status.clone())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeLastActivityBackend;
    use super::*;

    #[tokio::test]
    async fn unknown_owner_has_no_recorded_activity() {
        let store = LastActivityHandle::new(FakeLastActivityBackend::default());
        assert!(store.seconds_idle("alice".to_string()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn touch_is_visible_with_zero_or_more_elapsed_seconds() {
        let store = LastActivityHandle::new(FakeLastActivityBackend::default());
        store
            .touch("alice".to_string(), Some("away".to_string()))
            .await
            .unwrap();

        let (seconds, status) = store.seconds_idle("alice".to_string()).await.unwrap().unwrap();
        assert_eq!(status.as_deref(), Some("away"));
        assert!(seconds < 5);
    }
}
