use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use anyhow::{bail, Error};
use stringprep::{nodeprep, resourceprep};

/// Bitmask selecting which parts of two JIDs must be equal for
/// [`Jid::matches`] / [`Jid::matches_with_options`] to hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchingOptions(u8);

impl MatchingOptions {
    pub const NODE: MatchingOptions = MatchingOptions(1);
    pub const DOMAIN: MatchingOptions = MatchingOptions(2);
    pub const RESOURCE: MatchingOptions = MatchingOptions(4);
    pub const BARE: MatchingOptions = MatchingOptions(1 | 2);
    pub const FULL: MatchingOptions = MatchingOptions(1 | 2 | 4);

    fn contains(self, other: MatchingOptions) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for MatchingOptions {
    type Output = MatchingOptions;

    fn bitor(self, rhs: Self) -> Self::Output {
        MatchingOptions(self.0 | rhs.0)
    }
}

/// An XMPP address, made up of an optional node (user part), a required
/// domain, and an optional resource.
///
/// Parsing applies nodeprep/resourceprep (RFC 7622 §3.2) to the node and
/// resource parts; the domain is lowercased and, for bracketed IPv6
/// literals, validated as an IP address rather than stringprep'd (this
/// server does not pull in a full IDNA implementation — see DESIGN.md).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    node: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    pub fn new(node: Option<&str>, domain: &str, resource: Option<&str>) -> Result<Self, Error> {
        let node = match node {
            Some(node) if !node.is_empty() => Some(prep_node(node)?),
            _ => None,
        };
        let domain = prep_domain(domain)?;
        let resource = match resource {
            Some(resource) if !resource.is_empty() => Some(prep_resource(resource)?),
            _ => None,
        };

        Ok(Jid {
            node,
            domain,
            resource,
        })
    }

    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    pub fn to_bare(&self) -> Jid {
        Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    pub fn with_resource(&self, resource: &str) -> Result<Jid, Error> {
        Jid::new(self.node.as_deref(), &self.domain, Some(resource))
    }

    pub fn is_server(&self) -> bool {
        self.node.is_none()
    }

    pub fn is_bare(&self) -> bool {
        self.node.is_some() && self.resource.is_none()
    }

    pub fn is_full(&self) -> bool {
        self.resource.is_some()
    }

    pub fn is_full_with_server(&self) -> bool {
        self.node.is_none() && self.resource.is_some()
    }

    pub fn is_full_with_user(&self) -> bool {
        self.node.is_some() && self.resource.is_some()
    }

    /// Matches `other` using the matching granularity implied by `self`'s
    /// own shape: a full-user JID requires node+domain+resource equality, a
    /// bare JID requires node+domain, a bare server JID requires domain
    /// only.
    pub fn matches(&self, other: &Jid) -> bool {
        let options = if self.is_full_with_user() {
            MatchingOptions::FULL
        } else if self.is_full_with_server() {
            MatchingOptions::DOMAIN | MatchingOptions::RESOURCE
        } else if self.is_bare() {
            MatchingOptions::BARE
        } else {
            MatchingOptions::DOMAIN
        };
        self.matches_with_options(other, options)
    }

    pub fn matches_with_options(&self, other: &Jid, options: MatchingOptions) -> bool {
        if options.contains(MatchingOptions::NODE) && self.node != other.node {
            return false;
        }
        if options.contains(MatchingOptions::DOMAIN) && self.domain != other.domain {
            return false;
        }
        if options.contains(MatchingOptions::RESOURCE) && self.resource != other.resource {
            return false;
        }
        true
    }
}

fn prep_node(node: &str) -> Result<String, Error> {
    if node.len() > 1023 {
        bail!("node must be smaller than 1024 bytes");
    }
    if node.contains(['"', '&', '\'', '/', ':', '<', '>', '@']) {
        bail!("node contains forbidden character");
    }
    nodeprep(node).map(|s| s.to_string()).map_err(|_| anyhow::anyhow!("node failed stringprep"))
}

fn prep_resource(resource: &str) -> Result<String, Error> {
    if resource.len() > 1023 {
        bail!("resource must be smaller than 1024 bytes");
    }
    resourceprep(resource)
        .map(|s| s.to_string())
        .map_err(|_| anyhow::anyhow!("resource failed stringprep"))
}

fn prep_domain(domain: &str) -> Result<String, Error> {
    if domain.is_empty() || domain.len() > 1023 {
        bail!("domain must be between 1 and 1023 bytes");
    }

    let domain = domain.to_lowercase();
    if domain.starts_with('[') && domain.ends_with(']') {
        let inner = &domain[1..domain.len() - 1];
        if inner.parse::<std::net::Ipv6Addr>().is_err() {
            bail!("domain is not a valid IPv6 address");
        }
    }

    Ok(domain)
}

impl FromStr for Jid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            bail!("JID must not be empty");
        }

        let at_index = s.find('@');
        let slash_index = s.find('/');

        let node = match at_index {
            Some(0) => bail!("JID node must not be empty"),
            Some(idx) => Some(&s[..idx]),
            None => None,
        };

        let domain_start = at_index.map(|i| i + 1).unwrap_or(0);
        let domain_end = slash_index.unwrap_or(s.len());
        if domain_start >= domain_end {
            bail!("JID with empty domain not valid");
        }
        let domain = &s[domain_start..domain_end];

        let resource = match slash_index {
            Some(idx) if idx + 1 < s.len() => Some(&s[idx + 1..]),
            Some(_) => bail!("JID resource must not be empty"),
            None => None,
        };

        Jid::new(node, domain, resource)
    }
}

impl Display for Jid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if let Some(node) = &self.node {
            write!(f, "{node}@")?;
        }
        write!(f, "{}", self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{resource}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_on_empty_string() {
        assert!("".parse::<Jid>().is_err());
    }

    #[test]
    fn parses_bare_jid() {
        let jid = "romeo@montague.lit".parse::<Jid>().unwrap();
        assert_eq!(jid.node(), Some("romeo"));
        assert_eq!(jid.domain(), "montague.lit");
        assert!(jid.resource().is_none());
        assert!(jid.is_bare());
    }

    #[test]
    fn parses_full_jid() {
        let jid = "romeo@montague.lit/orchard".parse::<Jid>().unwrap();
        assert_eq!(jid.resource(), Some("orchard"));
        assert!(jid.is_full_with_user());
    }

    #[test]
    fn parses_server_jid() {
        let jid = "montague.lit".parse::<Jid>().unwrap();
        assert!(jid.is_server());
        assert!(!jid.is_bare());
    }

    #[test]
    fn rejects_forbidden_node_character() {
        assert!("ro&meo@montague.lit".parse::<Jid>().is_err());
    }

    #[test]
    fn lowercases_domain() {
        let jid = "romeo@Montague.LIT".parse::<Jid>().unwrap();
        assert_eq!(jid.domain(), "montague.lit");
    }

    #[test]
    fn to_bare_drops_resource() {
        let jid = "romeo@montague.lit/orchard".parse::<Jid>().unwrap();
        assert_eq!(jid.to_bare(), "romeo@montague.lit".parse().unwrap());
    }

    #[test]
    fn matches_bare_ignores_resource() {
        let a = "romeo@montague.lit".parse::<Jid>().unwrap();
        let b = "romeo@montague.lit/orchard".parse::<Jid>().unwrap();
        assert!(a.matches(&b));
    }

    #[test]
    fn valid_ipv6_literal_domain() {
        let jid = "[::1]".parse::<Jid>().unwrap();
        assert_eq!(jid.domain(), "[::1]");
    }

    #[test]
    fn invalid_ipv6_literal_domain() {
        assert!("[not-an-ip]".parse::<Jid>().is_err());
    }

    #[test]
    fn display_roundtrip() {
        let jid = "romeo@montague.lit/orchard".parse::<Jid>().unwrap();
        assert_eq!(jid.to_string(), "romeo@montague.lit/orchard");
    }
}
