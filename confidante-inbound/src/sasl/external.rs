use anyhow::{anyhow, bail, Error};

use super::MechanismNegotiatorResult;

/// EXTERNAL relies on the TLS layer for authentication: by the time this
/// mechanism is offered, `is_secure() && is_authenticated()` already held, so
/// the only thing left to negotiate is which authorization identity the
/// already-verified certificate is allowed to act as.
pub struct ExternalNegotiator {
    authentication_id: Option<Result<String, Error>>,
}

impl ExternalNegotiator {
    pub fn new() -> Self {
        ExternalNegotiator {
            authentication_id: None,
        }
    }

    pub async fn process(&mut self, payload: Vec<u8>) -> MechanismNegotiatorResult {
        let outcome = Self::verify(&payload);

        let result = match &outcome {
            Ok(_) => MechanismNegotiatorResult::Success(None),
            Err(err) => MechanismNegotiatorResult::Failure(anyhow!(err.to_string())),
        };
        self.authentication_id = Some(outcome);

        result
    }

    pub async fn authentication_id(self) -> Result<String, Error> {
        self.authentication_id
            .unwrap_or_else(|| Err(anyhow!("EXTERNAL authentication was never attempted")))
    }

    fn verify(payload: &[u8]) -> Result<String, Error> {
        if payload.is_empty() {
            bail!("EXTERNAL requires an explicit authorization identity");
        }

        let authzid = std::str::from_utf8(payload)?;
        Ok(authzid.to_string())
    }
}
