//! Caller identity and origin resolution.
//!
//! Authentication itself happens elsewhere. A resolver only reports which
//! subject, if any, the request was authenticated as; any failure on that
//! path downgrades the request to anonymous instead of failing it.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use axum::extract::{ConnectInfo, Request};
use axum::http::{HeaderMap, HeaderName};
use thiserror::Error;
use tracing::warn;

use crate::error::{Result, SlidegateError};
use crate::ratelimit::Identity;

/// Errors raised while resolving a caller's identity.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("malformed identity header {0}")]
    Malformed(String),
    #[error("identity provider failed: {0}")]
    Provider(String),
}

/// Resolves the authenticated subject of a request, if any.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// `Ok(None)` means the caller did not authenticate.
    async fn resolve(
        &self,
        headers: &HeaderMap,
    ) -> std::result::Result<Option<String>, IdentityError>;
}

/// Trusts a header set by an authenticating proxy in front of this service.
#[derive(Debug, Clone)]
pub struct HeaderIdentityResolver {
    header: HeaderName,
}

impl HeaderIdentityResolver {
    pub fn new(header: &str) -> Result<Self> {
        let header = HeaderName::try_from(header).map_err(|e| {
            SlidegateError::InvalidConfiguration(format!("identity header {:?}: {}", header, e))
        })?;
        Ok(Self { header })
    }
}

#[async_trait]
impl IdentityResolver for HeaderIdentityResolver {
    async fn resolve(
        &self,
        headers: &HeaderMap,
    ) -> std::result::Result<Option<String>, IdentityError> {
        match headers.get(&self.header) {
            None => Ok(None),
            Some(value) => value
                .to_str()
                .map(|v| Some(v.to_string()))
                .map_err(|_| IdentityError::Malformed(self.header.to_string())),
        }
    }
}

/// Treats every caller as anonymous.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousResolver;

#[async_trait]
impl IdentityResolver for AnonymousResolver {
    async fn resolve(
        &self,
        _headers: &HeaderMap,
    ) -> std::result::Result<Option<String>, IdentityError> {
        Ok(None)
    }
}

/// Resolve the request identity, falling back to anonymous on any error.
pub async fn resolve_identity(resolver: &dyn IdentityResolver, headers: &HeaderMap) -> Identity {
    match resolver.resolve(headers).await {
        Ok(subject) => Identity::from_subject(subject.as_deref()),
        Err(e) => {
            warn!(error = %e, "Identity resolution failed, continuing as anonymous");
            Identity::Anonymous
        }
    }
}

/// Network origin of the request.
///
/// With `trust_forwarded_for`, the first `X-Forwarded-For` hop wins when it
/// parses. Otherwise the peer address is used, or the unspecified address
/// when the server was not started with connect info.
pub fn extract_origin(req: &Request, trust_forwarded_for: bool) -> IpAddr {
    if trust_forwarded_for {
        let forwarded = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::HeaderValue;

    struct FailingResolver;

    #[async_trait]
    impl IdentityResolver for FailingResolver {
        async fn resolve(
            &self,
            _headers: &HeaderMap,
        ) -> std::result::Result<Option<String>, IdentityError> {
            Err(IdentityError::Provider("token service down".to_string()))
        }
    }

    fn request(forwarded: Option<&str>, peer: Option<&str>) -> Request {
        let mut builder = axum::http::Request::builder().uri("/");
        if let Some(xff) = forwarded {
            builder = builder.header("x-forwarded-for", xff);
        }
        let mut req = builder.body(Body::empty()).unwrap();
        if let Some(peer) = peer {
            req.extensions_mut().insert(ConnectInfo(peer.parse::<SocketAddr>().unwrap()));
        }
        req
    }

    #[tokio::test]
    async fn test_header_resolver() {
        let resolver = HeaderIdentityResolver::new("x-authenticated-user").unwrap();
        let mut headers = HeaderMap::new();

        assert_eq!(resolve_identity(&resolver, &headers).await, Identity::Anonymous);

        headers.insert("x-authenticated-user", HeaderValue::from_static("alice"));
        assert_eq!(
            resolve_identity(&resolver, &headers).await,
            Identity::Identified("alice".to_string())
        );
    }

    #[tokio::test]
    async fn test_malformed_header_is_anonymous() {
        let resolver = HeaderIdentityResolver::new("x-authenticated-user").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-authenticated-user", HeaderValue::from_bytes(&[0xff, 0xfe]).unwrap());

        assert!(resolver.resolve(&headers).await.is_err());
        assert_eq!(resolve_identity(&resolver, &headers).await, Identity::Anonymous);
    }

    #[tokio::test]
    async fn test_provider_failure_is_anonymous() {
        assert_eq!(
            resolve_identity(&FailingResolver, &HeaderMap::new()).await,
            Identity::Anonymous
        );
        assert_eq!(
            resolve_identity(&AnonymousResolver, &HeaderMap::new()).await,
            Identity::Anonymous
        );
    }

    #[test]
    fn test_invalid_header_name() {
        assert!(matches!(
            HeaderIdentityResolver::new("not a header"),
            Err(SlidegateError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_origin_from_peer() {
        let req = request(Some("203.0.113.9"), Some("10.0.0.1:5555"));
        assert_eq!(extract_origin(&req, false), "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_origin_from_forwarded_for() {
        let req = request(Some("203.0.113.9, 10.0.0.254"), Some("10.0.0.1:5555"));
        assert_eq!(extract_origin(&req, true), "203.0.113.9".parse::<IpAddr>().unwrap());

        let garbage = request(Some("unknown"), Some("10.0.0.1:5555"));
        assert_eq!(extract_origin(&garbage, true), "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_origin_without_connect_info() {
        let req = request(None, None);
        assert_eq!(extract_origin(&req, true), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }
}
