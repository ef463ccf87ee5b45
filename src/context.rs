use http::{HeaderMap, Method, Uri};
use std::{
    net::IpAddr,
    time::Instant,
};

use crate::ratelimit::service::RateLimitOutcome;

/// Authenticated caller, as resolved by the actor middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub tier: String,
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub client_ip: Option<IpAddr>,
    pub actor: Option<Actor>,
    /// An `x-api-key` was sent but matched no configured key.
    pub unknown_api_key: bool,
    pub started_at: Instant,
    pub rate_limit: Option<RateLimitOutcome>,
}

impl RequestContext {
    pub fn new(
        request_id: String,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        client_ip: Option<IpAddr>,
    ) -> Self {
        Self {
            request_id,
            method,
            uri,
            headers,
            client_ip,
            actor: None,
            unknown_api_key: false,
            started_at: Instant::now(),
            rate_limit: None,
        }
    }
}

/// Client address: `cf-connecting-ip`, then the first `x-forwarded-for` hop,
/// then `x-real-ip`, then the socket peer.
pub fn resolve_client_ip(
    headers: &HeaderMap,
    peer: Option<IpAddr>,
    trust_forwarded_headers: bool,
) -> Option<IpAddr> {
    if trust_forwarded_headers {
        let forwarded = ["cf-connecting-ip", "x-forwarded-for", "x-real-ip"]
            .iter()
            .filter_map(|name| headers.get(*name))
            .filter_map(|value| value.to_str().ok())
            .filter_map(|value| value.split(',').next())
            .find_map(|candidate| candidate.trim().parse::<IpAddr>().ok());

        if forwarded.is_some() {
            return forwarded;
        }
    }
    peer
}
