//! Tenant identity extraction from the request Host header

use std::fmt;
use thiserror::Error;

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Why a Host header could not be turned into a tenant identity
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TenantError {
    #[error("missing Host header")]
    MissingHost,
    #[error("malformed Host header")]
    InvalidHost,
    #[error("host has {found} labels, at least {required} required")]
    TooFewLabels { found: usize, required: usize },
}

/// The key identifying which backend instance serves a request.
///
/// Always non-empty, lowercase, and restricted to `[a-z0-9-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantId(String);

impl TenantId {
    /// Build a tenant id from a single label, e.g. `"abc"`
    pub fn new(label: &str) -> Result<Self, TenantError> {
        let label = label.to_ascii_lowercase();
        let valid = !label.is_empty()
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(TenantError::InvalidHost);
        }
        Ok(Self(label))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derives tenant identities from Host header values
#[derive(Debug, Clone, Copy)]
pub struct TenantResolver {
    min_labels: usize,
}

impl TenantResolver {
    /// `min_labels` is clamped to 2 so a bare hostname never becomes a tenant
    pub fn new(min_labels: usize) -> Self {
        Self {
            min_labels: min_labels.max(2),
        }
    }

    pub fn min_labels(&self) -> usize {
        self.min_labels
    }

    /// Resolve the tenant from an optional Host header value
    pub fn resolve(&self, host: Option<&str>) -> Result<TenantId, TenantError> {
        let host = host.ok_or(TenantError::MissingHost)?;
        let hostname = normalize_hostname(host)?;

        let labels: Vec<&str> = hostname.split('.').collect();
        // IPv4 literals address the proxy itself, not a tenant
        if labels
            .iter()
            .all(|l| !l.is_empty() && l.bytes().all(|b| b.is_ascii_digit()))
        {
            return Err(TenantError::InvalidHost);
        }
        if labels.len() < self.min_labels {
            return Err(TenantError::TooFewLabels {
                found: labels.len(),
                required: self.min_labels,
            });
        }

        TenantId::new(labels[0])
    }
}

/// Strip the port, validate characters and lowercase
fn normalize_hostname(host: &str) -> Result<String, TenantError> {
    let hostname = host.split(':').next().unwrap_or_default().trim();

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return Err(TenantError::InvalidHost);
    }

    // Alphanumeric, hyphen and dot only; keeps tenant ids safe for logs and paths
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return Err(TenantError::InvalidHost);
    }

    Ok(hostname.trim_end_matches('.').to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_literal_is_not_a_tenant() {
        let resolver = TenantResolver::new(2);
        for host in ["10.0.0.5", "10.0.0.5:8080", "127.0.0.1", "192.168.1.1."] {
            assert_eq!(
                resolver.resolve(Some(host)),
                Err(TenantError::InvalidHost),
                "{host}"
            );
        }
        // Numeric tenant labels under a named domain are fine
        assert_eq!(resolver.resolve(Some("10.localhost")).unwrap().as_str(), "10");
        assert_eq!(resolver.resolve(Some("42.0.example")).unwrap().as_str(), "42");
    }

    #[test]
    fn test_resolve_leftmost_label() {
        let resolver = TenantResolver::new(2);
        let tenant = resolver.resolve(Some("abc.example.com")).unwrap();
        assert_eq!(tenant.as_str(), "abc");

        let tenant = resolver.resolve(Some("abc.localhost")).unwrap();
        assert_eq!(tenant.as_str(), "abc");
    }

    #[test]
    fn test_resolve_strips_port_and_lowercases() {
        let resolver = TenantResolver::new(2);
        let tenant = resolver.resolve(Some("ABC.Example.com:8080")).unwrap();
        assert_eq!(tenant.to_string(), "abc");
    }

    #[test]
    fn test_trailing_dot_is_not_a_label() {
        let resolver = TenantResolver::new(3);
        assert_eq!(
            resolver.resolve(Some("abc.lvh.me.")).unwrap().as_str(),
            "abc"
        );
        assert!(resolver.resolve(Some("lvh.me.")).is_err());
    }

    #[test]
    fn test_too_few_labels() {
        let resolver = TenantResolver::new(2);
        assert_eq!(
            resolver.resolve(Some("localhost")),
            Err(TenantError::TooFewLabels {
                found: 1,
                required: 2
            })
        );

        let hardened = TenantResolver::new(3);
        assert_eq!(
            hardened.resolve(Some("example.com")),
            Err(TenantError::TooFewLabels {
                found: 2,
                required: 3
            })
        );
        assert!(hardened.resolve(Some("abc.example.com")).is_ok());
    }

    #[test]
    fn test_missing_and_malformed_hosts() {
        let resolver = TenantResolver::new(2);
        assert_eq!(resolver.resolve(None), Err(TenantError::MissingHost));
        assert_eq!(resolver.resolve(Some("")), Err(TenantError::InvalidHost));
        assert_eq!(resolver.resolve(Some(":8080")), Err(TenantError::InvalidHost));
        assert_eq!(
            resolver.resolve(Some(".example.com")),
            Err(TenantError::InvalidHost)
        );
        assert_eq!(
            resolver.resolve(Some("a b.example.com")),
            Err(TenantError::InvalidHost)
        );
        assert_eq!(
            resolver.resolve(Some("../etc.example.com")),
            Err(TenantError::InvalidHost)
        );
        assert_eq!(
            resolver.resolve(Some("-abc.example.com")),
            Err(TenantError::InvalidHost)
        );

        let long = format!("{}.example.com", "a".repeat(MAX_HOSTNAME_LEN));
        assert_eq!(resolver.resolve(Some(&long)), Err(TenantError::InvalidHost));
    }

    #[test]
    fn test_tenant_id_new() {
        assert_eq!(TenantId::new("Tenant-1").unwrap().as_str(), "tenant-1");
        assert!(TenantId::new("").is_err());
        assert!(TenantId::new("a.b").is_err());
        assert!(TenantId::new("abc-").is_err());
    }

    #[test]
    fn test_min_labels_clamped() {
        assert_eq!(TenantResolver::new(0).min_labels(), 2);
        assert_eq!(TenantResolver::new(1).min_labels(), 2);
        assert_eq!(TenantResolver::new(4).min_labels(), 4);
    }

    #[test]
    fn test_same_host_same_tenant() {
        let resolver = TenantResolver::new(2);
        let a = resolver.resolve(Some("abc.example.com")).unwrap();
        let b = resolver.resolve(Some("ABC.example.com:443")).unwrap();
        assert_eq!(a, b);
    }
}
