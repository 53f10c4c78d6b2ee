use std::future::Future;

use anyhow::Error;
use tokio::{
    select,
    sync::{mpsc, oneshot},
};

use confidante_core::xmpp::jid::Jid;

use crate::model::{RosterItem, RosterNotification, Subscription};

enum Command {
    SetItem {
        item: RosterItem,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
    RemoveItem {
        owner: String,
        contact: Jid,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
    AddNotification {
        notification: RosterNotification,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
    RemoveNotification {
        contact_username: String,
        originator: Jid,
        result_tx: oneshot::Sender<Result<(), Error>>,
    },
}

enum Query {
    Items {
        owner: String,
        result_tx: oneshot::Sender<Result<Vec<RosterItem>, Error>>,
    },
    Notifications {
        contact_username: String,
        result_tx: oneshot::Sender<Result<Vec<RosterNotification>, Error>>,
    },
}

pub trait RosterBackend {
    fn set_item(&mut self, item: RosterItem) -> impl Future<Output = Result<(), Error>> + Send;
    fn remove_item(
        &mut self,
        owner: String,
        contact: Jid,
    ) -> impl Future<Output = Result<(), Error>> + Send;
    fn items(&self, owner: String) -> impl Future<Output = Result<Vec<RosterItem>, Error>> + Send;
    fn add_notification(
        &mut self,
        notification: RosterNotification,
    ) -> impl Future<Output = Result<(), Error>> + Send;
    fn remove_notification(
        &mut self,
        contact_username: String,
        originator: Jid,
    ) -> impl Future<Output = Result<(), Error>> + Send;
    fn notifications(
        &self,
        contact_username: String,
    ) -> impl Future<Output = Result<Vec<RosterNotification>, Error>> + Send;
}

struct Roster<B: RosterBackend> {
    commands: mpsc::Receiver<Command>,
    queries: mpsc::Receiver<Query>,
    backend: B,
}

impl<B: RosterBackend> Roster<B> {
    async fn run(&mut self) {
        loop {
            select! {
                Some(command) = self.commands.recv() => self.handle_command(command).await,
                Some(query) = self.queries.recv() => self.handle_query(query).await,
                else => break,
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetItem { item, result_tx } => {
                let _ = result_tx.send(self.backend.set_item(item).await);
            }
            Command::RemoveItem {
                owner,
                contact,
                result_tx,
            } => {
                let _ = result_tx.send(self.backend.remove_item(owner, contact).await);
            }
            Command::AddNotification {
                notification,
                result_tx,
            } => {
                let _ = result_tx.send(self.backend.add_notification(notification).await);
            }
            Command::RemoveNotification {
                contact_username,
                originator,
                result_tx,
            } => {
                let _ = result_tx.send(
                    self.backend
                        .remove_notification(contact_username, originator)
                        .await,
                );
            }
        }
    }

    async fn handle_query(&mut self, query: Query) {
        match query {
            Query::Items { owner, result_tx } => {
                let _ = result_tx.send(self.backend.items(owner).await);
            }
            Query::Notifications {
                contact_username,
                result_tx,
            } => {
                let _ = result_tx.send(self.backend.notifications(contact_username).await);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RosterHandle {
    commands: mpsc::Sender<Command>,
    queries: mpsc::Sender<Query>,
}

impl RosterHandle {
    pub fn new<B>(backend: B) -> Self
    where
        B: RosterBackend + Send + 'static,
    {
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let (queries_tx, queries_rx) = mpsc::channel(8);
        let mut roster = Roster {
            commands: commands_rx,
            queries: queries_rx,
            backend,
        };
        tokio::spawn(async move {
            roster.run().await;
        });

        RosterHandle {
            commands: commands_tx,
            queries: queries_tx,
        }
    }

    pub async fn set_item(&self, item: RosterItem) -> Result<(), Error> {
        let (result_tx, result_rx) = oneshot::channel();
        let _ = self.commands.send(Command::SetItem { item, result_tx }).await;
        result_rx.await.expect("roster store is gone")
    }

    pub async fn remove_item(&self, owner: String, contact: Jid) -> Result<(), Error> {
        let (result_tx, result_rx) = oneshot::channel();
        let _ = self
            .commands
            .send(Command::RemoveItem {
                owner,
                contact,
                result_tx,
            })
            .await;
        result_rx.await.expect("roster store is gone")
    }

    pub async fn items(&self, owner: String) -> Result<Vec<RosterItem>, Error> {
        let (result_tx, result_rx) = oneshot::channel();
        let _ = self.queries.send(Query::Items { owner, result_tx }).await;
        result_rx.await.expect("roster store is gone")
    }

    pub async fn add_notification(&self, notification: RosterNotification) -> Result<(), Error> {
        let (result_tx, result_rx) = oneshot::channel();
        let _ = self
            .commands
            .send(Command::AddNotification {
                notification,
                result_tx,
            })
            .await;
        result_rx.await.expect("roster store is gone")
    }

    pub async fn remove_notification(
        &self,
        contact_username: String,
        originator: Jid,
    ) -> Result<(), Error> {
        let (result_tx, result_rx) = oneshot::channel();
        let _ = self
            .commands
            .send(Command::RemoveNotification {
                contact_username,
                originator,
                result_tx,
            })
            .await;
        result_rx.await.expect("roster store is gone")
    }

    pub async fn notifications(
        &self,
        contact_username: String,
    ) -> Result<Vec<RosterNotification>, Error> {
        let (result_tx, result_rx) = oneshot::channel();
        let _ = self
            .queries
            .send(Query::Notifications {
                contact_username,
                result_tx,
            })
            .await;
        result_rx.await.expect("roster store is gone")
    }
}

pub mod fake {
    use super::*;

    #[derive(Default)]
    pub struct FakeRosterBackend {
        items: Vec<RosterItem>,
        notifications: Vec<RosterNotification>,
    }

    impl RosterBackend for FakeRosterBackend {
        async fn set_item(&mut self, item: RosterItem) -> Result<(), Error> {
            self.items
                .retain(|existing| !(existing.owner == item.owner && existing.contact == item.contact));
            self.items.push(item);
            Ok(())
        }

        async fn remove_item(&mut self, owner: String, contact: Jid) -> Result<(), Error> {
            self.items
                .retain(|item| !(item.owner == owner && item.contact == contact));
            Ok(())
        }

        async fn items(&self, owner: String) -> Result<Vec<RosterItem>, Error> {
            Ok(self
                .items
                .iter()
                .filter(|item| item.owner == owner)
                .cloned()
                .collect())
        }

        async fn add_notification(&mut self, notification: RosterNotification) -> Result<(), Error> {
            self.notifications.push(notification);
            Ok(())
        }

        async fn remove_notification(
            &mut self,
            contact_username: String,
            originator: Jid,
        ) -> Result<(), Error> {
            self.notifications.retain(|notification| {
                !(notification.contact_username == contact_username
                    && notification.originator == originator)
            });
            Ok(())
        }

        async fn notifications(
            &self,
            contact_username: String,
        ) -> Result<Vec<RosterNotification>, Error> {
            Ok(self
                .notifications
                .iter()
                .filter(|notification| notification.contact_username == contact_username)
                .cloned()
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeRosterBackend;
    use super::*;

    #[tokio::test]
    async fn set_and_list_items() {
        let roster = RosterHandle::new(FakeRosterBackend::default());
        let contact = "bob@localhost".parse::<Jid>().unwrap();
        roster
            .set_item(RosterItem {
                owner: "alice".to_string(),
                contact: contact.clone(),
                name: None,
                subscription: Subscription::None,
                ask: true,
                groups: vec![],
            })
            .await
            .unwrap();

        let items = roster.items("alice".to_string()).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].contact, contact);
    }
}
