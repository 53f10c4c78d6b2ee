use confidante_core::xmpp::jid::Jid;

/// Ordered list of local domains the server answers for. The first entry is
/// the default, used when a stream does not name a target domain.
#[derive(Debug, Clone)]
pub struct HostRegistry {
    domains: Vec<String>,
}

impl HostRegistry {
    pub fn new(domains: Vec<String>) -> Self {
        let domains = if domains.is_empty() {
            vec!["localhost".to_string()]
        } else {
            domains
        };

        HostRegistry { domains }
    }

    pub fn is_local(&self, domain: &str) -> bool {
        self.domains.iter().any(|local| local == domain)
    }

    pub fn is_local_jid(&self, jid: &Jid) -> bool {
        self.is_local(jid.domain())
    }

    pub fn default_domain(&self) -> &str {
        &self.domains[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_localhost_when_unconfigured() {
        let hosts = HostRegistry::new(vec![]);
        assert!(hosts.is_local("localhost"));
    }

    #[test]
    fn recognizes_configured_domains() {
        let hosts = HostRegistry::new(vec!["example.org".to_string(), "example.com".to_string()]);
        assert!(hosts.is_local("example.org"));
        assert!(hosts.is_local("example.com"));
        assert!(!hosts.is_local("other.org"));
        assert_eq!(hosts.default_domain(), "example.org");
    }
}
