use crate::config::ConfigDomainName;
use crate::http_util::uri_host;

/// Domains that are never fetched on behalf of clients.
#[derive(Debug, Default)]
pub(crate) struct Blacklist {
    domains: Vec<ConfigDomainName>,
}

impl Blacklist {
    #[must_use]
    pub(crate) fn new(domains: Vec<ConfigDomainName>) -> Self {
        Self { domains }
    }

    /// Whether the host of `uri` matches a listed domain. URIs without a
    /// host are never listed.
    #[must_use]
    pub(crate) fn is_blacklisted(&self, uri: &str) -> bool {
        if self.domains.is_empty() {
            return false;
        }

        uri_host(uri).is_some_and(|host| self.domains.iter().any(|d| d.matches(&host)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blacklist(domains: &[&str]) -> Blacklist {
        Blacklist::new(
            domains
                .iter()
                .map(|d| ConfigDomainName::new((*d).to_string()).unwrap())
                .collect(),
        )
    }

    #[test]
    fn matches_hosts() {
        let list = blacklist(&["*.ads.example.com", "tracker.net"]);

        assert!(list.is_blacklisted("http://banner.ads.example.com/img.gif"));
        assert!(list.is_blacklisted("http://TRACKER.net/pixel"));
        assert!(!list.is_blacklisted("http://www.tracker.net/pixel"));
        assert!(!list.is_blacklisted("http://example.com/"));
        assert!(!list.is_blacklisted("not a uri"));
    }

    #[test]
    fn empty_list_allows_everything() {
        assert!(!Blacklist::default().is_blacklisted("http://tracker.net/"));
    }
}
