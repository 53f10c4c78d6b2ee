//! XEP-0077: In-Band Registration.
//!
//! Only username/password registration is supported, mirroring the
//! `add-user`/`remove-user` CLI path: a `set` with `<username/>` and
//! `<password/>` hashes the password the same three ways
//! (`StoredPasswordArgon2`, `StoredPasswordScram<Sha1>`,
//! `StoredPasswordScram<Sha256>`) and calls through to the same store. A
//! `set` with an empty `<remove/>` deletes the requester's own account.

use tokio::sync::mpsc;
use tracing::warn;

use confidante_backend::store::StoreHandle;
use confidante_core::xml::namespaces;
use confidante_core::xmpp::jid::Jid;
use confidante_core::xmpp::stanza::Stanza;
use confidante_inbound::sasl::{StoredPassword, StoredPasswordArgon2, StoredPasswordScram};
use confidante_services::dispatch::Route;
use sha1::Sha1;
use sha2::Sha256;

pub const REGISTER: &str = "jabber:iq:register";

pub fn spawn(router: mpsc::Sender<Stanza>, store: StoreHandle, domain: String) -> Route {
    let (inbox_tx, mut inbox_rx) = mpsc::channel(8);

    tokio::spawn(async move {
        while let Some(stanza) = inbox_rx.recv().await {
            let reply = handle(&stanza, &store, &domain).await;
            match reply {
                Ok(reply) => {
                    let _ = router.send(reply).await;
                }
                Err(err) => warn!(%err, "failed to handle registration request"),
            }
        }
    });

    Route {
        matches: Box::new(|stanza| {
            matches!(stanza.element.attribute("type", None), Some("get") | Some("set"))
                && stanza.element.find_child("query", Some(REGISTER)).is_some()
        }),
        inbox: inbox_tx,
    }
}

async fn handle(stanza: &Stanza, store: &StoreHandle, domain: &str) -> Result<Stanza, anyhow::Error> {
    if stanza.element.attribute("type", None) == Some("get") {
        return Stanza::result_reply(stanza, |iq| {
            iq.with_child("query", Some(REGISTER), |query| {
                query.with_child("instructions", None, |e| {
                    e.set_text("Choose a username and password to register.");
                });
                query.with_child("username", None, |_| {});
                query.with_child("password", None, |_| {});
            });
        });
    }

    let query = stanza.element.find_child("query", Some(REGISTER));
    let remove = query.and_then(|q| q.find_child("remove", None)).is_some();

    if remove {
        let Some(from) = stanza.from_jid() else {
            return Stanza::error_reply(stanza, "bad-request", namespaces::XMPP_STANZA_ERRORS);
        };
        store.remove_user(from.to_bare()).await?;
        return Stanza::result_reply(stanza, |_| {});
    }

    let username = query.and_then(|q| q.find_child("username", None)).map(|e| e.text());
    let password = query.and_then(|q| q.find_child("password", None)).map(|e| e.text());
    let (Some(username), Some(password)) = (username, password) else {
        return Stanza::error_reply(stanza, "bad-request", namespaces::XMPP_STANZA_ERRORS);
    };

    let jid = Jid::new(Some(&username), domain, None)?;
    let stored_password_argon2 = StoredPasswordArgon2::new(&password)?.to_string();
    let stored_password_scram_sha1 = StoredPasswordScram::<Sha1>::new(&password)?.to_string();
    let stored_password_scram_sha256 = StoredPasswordScram::<Sha256>::new(&password)?.to_string();

    store
        .add_user(
            jid,
            stored_password_argon2,
            stored_password_scram_sha1,
            stored_password_scram_sha256,
        )
        .await?;

    Stanza::result_reply(stanza, |_| {})
}

#[cfg(test)]
mod tests {
    use confidante_backend::store::fake::FakeStoreBackend;
    use confidante_core::xml::Element;

    use super::*;

    fn register_get() -> Stanza {
        let mut element = Element::new("iq", None);
        element.set_attribute("type", None::<String>, "get");
        element.set_attribute("id", None::<String>, "1");
        element.set_attribute("from", None::<String>, "juliet@capulet.lit");
        element.with_child("query", Some(REGISTER), |_| {});
        Stanza { element }
    }

    fn register_set(username: &str, password: &str) -> Stanza {
        let mut element = Element::new("iq", None);
        element.set_attribute("type", None::<String>, "set");
        element.set_attribute("id", None::<String>, "2");
        element.set_attribute("from", None::<String>, "newuser@capulet.lit");
        element.with_child("query", Some(REGISTER), |query| {
            query.with_child("username", None, |e| e.set_text(username.to_string()));
            query.with_child("password", None, |e| e.set_text(password.to_string()));
        });
        Stanza { element }
    }

    fn register_remove() -> Stanza {
        let mut element = Element::new("iq", None);
        element.set_attribute("type", None::<String>, "set");
        element.set_attribute("id", None::<String>, "3");
        element.set_attribute("from", None::<String>, "juliet@capulet.lit");
        element.with_child("query", Some(REGISTER), |query| {
            query.with_child("remove", None, |_| {});
        });
        Stanza { element }
    }

    #[tokio::test]
    async fn get_returns_registration_form() {
        let store = StoreHandle::new(FakeStoreBackend::default());
        let (router_tx, mut router_rx) = mpsc::channel(8);
        let route = spawn(router_tx, store, "capulet.lit".to_string());

        route.inbox.send(register_get()).await.unwrap();

        let reply = router_rx.recv().await.unwrap();
        let query = reply.element.find_child("query", Some(REGISTER)).unwrap();
        assert!(query.find_child("username", None).is_some());
        assert!(query.find_child("password", None).is_some());
    }

    #[tokio::test]
    async fn set_with_username_and_password_registers_the_account() {
        let store = StoreHandle::new(FakeStoreBackend::default());
        let (router_tx, mut router_rx) = mpsc::channel(8);
        let route = spawn(router_tx, store.clone(), "capulet.lit".to_string());

        route.inbox.send(register_set("newuser", "s3cr3t")).await.unwrap();

        let reply = router_rx.recv().await.unwrap();
        assert_eq!(reply.element.attribute("type", None), Some("result"));
        let jid = "newuser@capulet.lit".parse().unwrap();
        assert!(store.get_stored_password(jid, confidante_backend::store::StoredPasswordKind::Argon2).await.is_ok());
    }

    #[tokio::test]
    async fn set_with_remove_deletes_the_requesters_own_account() {
        let store = StoreHandle::new(FakeStoreBackend::default());
        store
            .add_user(
                "juliet@capulet.lit".parse().unwrap(),
                "argon2".to_string(),
                "sha1".to_string(),
                "sha256".to_string(),
            )
            .await
            .unwrap();
        let (router_tx, mut router_rx) = mpsc::channel(8);
        let route = spawn(router_tx, store.clone(), "capulet.lit".to_string());

        route.inbox.send(register_remove()).await.unwrap();

        let reply = router_rx.recv().await.unwrap();
        assert_eq!(reply.element.attribute("type", None), Some("result"));
        let jid = "juliet@capulet.lit".parse().unwrap();
        assert!(store.get_stored_password(jid, confidante_backend::store::StoredPasswordKind::Argon2).await.is_err());
    }
}
