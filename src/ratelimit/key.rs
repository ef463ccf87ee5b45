use std::{fmt, net::IpAddr};

use http::Method;

/// Who a limit is tracked against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActorIdentity {
    User(String),
    Ip(IpAddr),
    Unknown,
}

impl ActorIdentity {
    /// Authenticated user first, then client IP.
    pub fn resolve(user_id: Option<&str>, client_ip: Option<IpAddr>) -> Self {
        match (user_id.filter(|id| !id.is_empty()), client_ip) {
            (Some(id), _) => Self::User(id.to_string()),
            (None, Some(ip)) => Self::Ip(ip),
            (None, None) => Self::Unknown,
        }
    }

    /// Raw identifier matched against the bypass list.
    pub fn id(&self) -> Option<String> {
        match self {
            Self::User(id) => Some(id.clone()),
            Self::Ip(ip) => Some(ip.to_string()),
            Self::Unknown => None,
        }
    }
}

impl fmt::Display for ActorIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Ip(ip) => write!(f, "ip:{ip}"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// Builds `rl:<scope>:<actor>[:<METHOD>][:<route>]`.
#[derive(Debug, Clone)]
pub struct KeyGenerator {
    scope: String,
    qualify_by_route: bool,
}

impl KeyGenerator {
    pub fn new(scope: impl Into<String>, qualify_by_route: bool) -> Self {
        Self {
            scope: scope.into(),
            qualify_by_route,
        }
    }

    pub fn generate(
        &self,
        actor: &ActorIdentity,
        method: Option<&Method>,
        route: Option<&str>,
    ) -> String {
        let mut key = format!("rl:{}:{}", self.scope, actor);
        if !self.qualify_by_route {
            return key;
        }

        if let Some(method) = method {
            key.push(':');
            key.push_str(method.as_str());
        }
        if let Some(route) = route.filter(|r| !r.is_empty()) {
            key.push(':');
            key.push_str(route);
        }
        key
    }
}
