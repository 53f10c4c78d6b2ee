use std::{fmt::Display, str::FromStr};

use anyhow::{anyhow, bail, Error};
use argon2::{
    password_hash::{self, rand_core::OsRng, PasswordHashString, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use confidante_core::xmpp::jid::Jid;

use super::{MechanismNegotiatorResult, StoredPassword, StoredPasswordLookup};

#[derive(Debug)]
pub struct StoredPasswordArgon2 {
    pub hash: PasswordHashString,
}

impl StoredPassword for StoredPasswordArgon2 {
    fn new(plaintext: &str) -> Result<Self, Error> {
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::default();
        let hash = argon2.hash_password(plaintext.as_bytes(), &salt)?.into();
        Ok(Self { hash })
    }
}

impl FromStr for StoredPasswordArgon2 {
    type Err = password_hash::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hash = PasswordHashString::new(s)?;
        Ok(Self { hash })
    }
}

impl Display for StoredPasswordArgon2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hash)
    }
}

pub struct PlainNegotiator<S> {
    resolved_domain: String,
    store: S,
    authentication_id: Option<Result<String, Error>>,
}

impl<S> PlainNegotiator<S>
where
    S: StoredPasswordLookup + Send + Sync,
{
    pub fn new(resolved_domain: String, store: S) -> Self {
        PlainNegotiator {
            resolved_domain,
            store,
            authentication_id: None,
        }
    }

    pub async fn process(&mut self, payload: Vec<u8>) -> MechanismNegotiatorResult {
        let outcome = self.verify(&payload).await;

        let result = match &outcome {
            Ok(_) => MechanismNegotiatorResult::Success(None),
            Err(err) => MechanismNegotiatorResult::Failure(anyhow!(err.to_string())),
        };
        self.authentication_id = Some(outcome);

        result
    }

    pub async fn authentication_id(self) -> Result<String, Error> {
        self.authentication_id
            .unwrap_or_else(|| Err(anyhow!("PLAIN authentication was never attempted")))
    }

    async fn verify(&self, payload: &[u8]) -> Result<String, Error> {
        // authzid NUL authcid NUL passwd, per RFC 4616.
        let mut parts = payload.splitn(3, |&b| b == 0);
        let _authzid = parts.next().ok_or_else(|| anyhow!("malformed PLAIN message"))?;
        let authcid = parts.next().ok_or_else(|| anyhow!("malformed PLAIN message"))?;
        let password = parts.next().ok_or_else(|| anyhow!("malformed PLAIN message"))?;

        let authcid = std::str::from_utf8(authcid)?;
        let password = std::str::from_utf8(password)?;
        if authcid.is_empty() {
            bail!("PLAIN message is missing an authentication identity");
        }

        let jid = Jid::new(Some(authcid), &self.resolved_domain, None)?;
        let stored = self.store.get_stored_password_argon2(jid).await?;
        let stored: StoredPasswordArgon2 = stored.parse().map_err(|err| anyhow!("{err}"))?;

        Argon2::default()
            .verify_password(password.as_bytes(), &stored.hash.password_hash())
            .map_err(|_| anyhow!("incorrect password"))?;

        Ok(authcid.to_string())
    }
}
