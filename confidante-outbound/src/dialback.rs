use anyhow::{Error, anyhow};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use confidante_core::xml::{Element, namespaces};

type HmacSha256 = Hmac<Sha256>;

/// `KEY = HMAC-SHA256(secret, localDomain + " " + remoteDomain + " " + streamID)`,
/// rendered as lowercase hex.
pub fn generate_key(
    secret: &str,
    local_domain: &str,
    remote_domain: &str,
    stream_id: &str,
) -> Result<String, Error> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|err| anyhow!("invalid dialback secret: {err}"))?;
    mac.update(format!("{local_domain} {remote_domain} {stream_id}").as_bytes());

    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub fn build_result(from: &str, to: &str, key: &str) -> Element {
    let mut result = Element::new("result", Some(namespaces::DIALBACK));
    result.set_attribute("from", None::<String>, from);
    result.set_attribute("to", None::<String>, to);
    result.add_text(key);

    result
}

pub fn build_verify(from: &str, to: &str, id: &str, key: &str) -> Element {
    let mut verify = Element::new("verify", Some(namespaces::DIALBACK));
    verify.set_attribute("from", None::<String>, from);
    verify.set_attribute("to", None::<String>, to);
    verify.set_attribute("id", None::<String>, id);
    verify.add_text(key);

    verify
}

pub fn result_is_valid(element: &Element) -> bool {
    element.validate("result", Some(namespaces::DIALBACK))
        && element.attribute("type", None) == Some("valid")
}

pub fn verify_is_valid(element: &Element) -> bool {
    element.validate("verify", Some(namespaces::DIALBACK))
        && element.attribute("type", None) == Some("valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_deterministic_for_same_inputs() {
        let a = generate_key("s3cr3t", "localhost", "capulet.lit", "abc123").unwrap();
        let b = generate_key("s3cr3t", "localhost", "capulet.lit", "abc123").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn key_changes_with_stream_id() {
        let a = generate_key("s3cr3t", "localhost", "capulet.lit", "abc123").unwrap();
        let b = generate_key("s3cr3t", "localhost", "capulet.lit", "xyz789").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn result_validity_requires_matching_type() {
        let mut result = Element::new("result", Some(namespaces::DIALBACK));
        result.set_attribute("type", None::<String>, "valid");
        assert!(result_is_valid(&result));

        result.set_attribute("type", None::<String>, "failed");
        assert!(!result_is_valid(&result));
    }
}
