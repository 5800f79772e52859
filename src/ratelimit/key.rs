//! Rate limit key derivation.

use std::fmt;
use std::net::IpAddr;

/// Namespace for keys derived from an authenticated subject.
const SUBJECT_NAMESPACE: &str = "user";
/// Namespace for keys derived from a network origin.
const ORIGIN_NAMESPACE: &str = "ip";

/// Who a request comes from, as far as authentication could tell.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// The caller authenticated as this subject id
    Identified(String),
    /// No authentication, or authentication failed
    Anonymous,
}

impl Identity {
    /// Build an identity from an optional subject id.
    ///
    /// Blank ids count as anonymous.
    pub fn from_subject(subject: Option<&str>) -> Self {
        match subject.map(str::trim) {
            Some(id) if !id.is_empty() => Identity::Identified(id.to_string()),
            _ => Identity::Anonymous,
        }
    }

    /// The subject id, if the caller authenticated.
    pub fn subject(&self) -> Option<&str> {
        match self {
            Identity::Identified(id) => Some(id),
            Identity::Anonymous => None,
        }
    }
}

/// The store key one request's quota is tracked against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    /// Derive the key for a request.
    ///
    /// Authenticated callers are keyed by subject, wherever they connect
    /// from. Everyone else is keyed by normalized origin address. The two
    /// live in separate namespaces under `prefix`, so a subject id that looks
    /// like an address cannot share a quota with that address.
    pub fn derive(prefix: &str, identity: &Identity, origin: IpAddr) -> Self {
        let key = match identity {
            Identity::Identified(subject) => {
                format!("{}:{}:{}", prefix, SUBJECT_NAMESPACE, subject)
            }
            Identity::Anonymous => {
                format!("{}:{}:{}", prefix, ORIGIN_NAMESPACE, normalize_origin(origin))
            }
        };
        Self(key)
    }

    /// The key as stored.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical form of an origin address.
///
/// IPv4-mapped IPv6 addresses collapse to plain IPv4 so dual-stack listeners
/// key a client the same way as IPv4 listeners.
pub fn normalize_origin(origin: IpAddr) -> IpAddr {
    match origin {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4),
        v4 => v4,
    }
}
