/// Configuration for domain checks to be performed on either the `Host`
/// or the `Origin` header.
#[derive(Debug, Clone)]
pub enum DomainCheck<Domain = String> {
    /// Allow any domain
    AllowAny,
    /// Allow a domain if it is one on the list
    AllowList(Vec<Domain>),
    /// Allow a domain if it is NOT on the list
    DenyList(Vec<Domain>)
}

impl<Domain> Default for DomainCheck<Domain> {
    fn default() -> Self {
        DomainCheck::AllowAny
    }
}

impl<Domain> DomainCheck<Domain>
where
    Domain: AsRef<str>
{
    /// Checks if a `domain` is allowed to complete the handshake.
    pub(crate) fn is_allowed(&self, domain: &[u8]) -> bool {
        match self {
            DomainCheck::AllowAny => true,
            DomainCheck::AllowList(list) => list.iter().any(|d| d.as_ref().as_bytes() == domain),
            DomainCheck::DenyList(list) => !list.iter().any(|d| d.as_ref().as_bytes() == domain)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_any_allows_everything() {
        let c: DomainCheck = DomainCheck::AllowAny;
        assert!(c.is_allowed(b"evil.example"));
    }

    #[test]
    fn allow_list_only_allows_listed_domains() {
        let c = DomainCheck::AllowList(vec!["example.com".to_string()]);
        assert!(c.is_allowed(b"example.com"));
        assert!(!c.is_allowed(b"evil.example"));
    }

    #[test]
    fn deny_list_blocks_listed_domains() {
        let c = DomainCheck::DenyList(vec!["evil.example".to_string()]);
        assert!(!c.is_allowed(b"evil.example"));
        assert!(c.is_allowed(b"example.com"));
    }
}
