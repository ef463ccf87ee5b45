use anyhow::{Context, Result, anyhow, bail};
use http::Method;
use std::{
    collections::{HashMap, HashSet},
    env,
    net::SocketAddr,
    str::FromStr,
};

use crate::ratelimit::RateLimitStrategy;

pub const ANONYMOUS_TIER: &str = "anonymous";

/// Longest window a policy may use (30 days).
pub const MAX_WINDOW_SECONDS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub log_level: String,
    pub log_format: LogFormat,
    pub api_keys: Vec<ApiKeyConfig>,
    pub trust_forwarded_headers: bool,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compact" | "text" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!("unsupported log format: {other}")),
        }
    }
}

/// Static credential standing in for the identity layer.
#[derive(Debug, Clone)]
pub struct ApiKeyConfig {
    pub key: String,
    pub user_id: String,
    pub tier: String,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub strategy: RateLimitStrategy,
    pub window_seconds: u64,
    pub tier_limits: HashMap<String, u32>,
    pub default_limit: u32,
    pub cache_ttl_secs: u64,
    pub bypass: HashSet<String>,
    pub routes: Vec<RouteRule>,
    pub scope: String,
    pub key_by_route: bool,
    pub backend: StoreBackendConfig,
    pub fallback_quota: bool,
}

#[derive(Debug, Clone)]
pub enum StoreBackendConfig {
    InMemory,
    Redis { url: String, key_prefix: String },
}

impl StoreBackendConfig {
    pub fn name(&self) -> &'static str {
        match self {
            Self::InMemory => "memory",
            Self::Redis { .. } => "redis",
        }
    }
}

/// Per-route overrides. `weight` multiplies the cost of each request.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteRule {
    pub method: Option<Method>,
    pub path_prefix: String,
    pub weight: u32,
    pub limit: Option<u32>,
    pub window_seconds: Option<u64>,
    pub strategy: Option<RateLimitStrategy>,
}

impl RouteRule {
    pub fn matches(&self, method: &Method, path: &str) -> bool {
        self.method.as_ref().is_none_or(|m| m == method) && path.starts_with(&self.path_prefix)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: RateLimitStrategy::TokenBucket,
            window_seconds: 60,
            tier_limits: parse_tiers("anonymous=30,free=60,pro=300,enterprise=1000")
                .unwrap_or_default(),
            default_limit: 60,
            cache_ttl_secs: 3_600,
            bypass: HashSet::new(),
            routes: Vec::new(),
            scope: "api".to_string(),
            key_by_route: true,
            backend: StoreBackendConfig::InMemory,
            fallback_quota: true,
        }
    }
}

impl RateLimitConfig {
    /// Deployment errors surface here, once, instead of per request.
    pub fn validate(&self) -> Result<()> {
        if self.window_seconds == 0 || self.window_seconds > MAX_WINDOW_SECONDS {
            bail!("RATE_LIMIT_WINDOW_SECONDS must be between 1 and {MAX_WINDOW_SECONDS}");
        }
        if self.default_limit == 0 {
            bail!("RATE_LIMIT_DEFAULT_LIMIT must be > 0");
        }
        if let Some((tier, _)) = self.tier_limits.iter().find(|(_, limit)| **limit == 0) {
            bail!("tier {tier} has a zero limit");
        }
        if self.scope.is_empty() || self.scope.contains(':') {
            bail!("RATE_LIMIT_SCOPE must be non-empty and must not contain ':'");
        }

        // Smallest limit a route without its own limit can resolve to.
        let smallest_tier_limit = self
            .tier_limits
            .values()
            .copied()
            .fold(self.default_limit, u32::min);

        let mut longest_window = self.window_seconds;
        for rule in &self.routes {
            if rule.weight == 0 {
                bail!("route {} has a zero weight", rule.path_prefix);
            }
            if rule.limit == Some(0) {
                bail!("route {} has a zero limit", rule.path_prefix);
            }
            let effective_limit = rule.limit.unwrap_or(smallest_tier_limit);
            if rule.weight > effective_limit {
                bail!(
                    "route {} weight {} exceeds its limit {effective_limit}; every request would be denied",
                    rule.path_prefix,
                    rule.weight
                );
            }
            match rule.window_seconds {
                Some(0) => bail!("route {} has a zero window", rule.path_prefix),
                Some(window) if window > MAX_WINDOW_SECONDS => bail!(
                    "route {} window exceeds {MAX_WINDOW_SECONDS} seconds",
                    rule.path_prefix
                ),
                Some(window) => longest_window = longest_window.max(window),
                None => {}
            }
        }

        if self.cache_ttl_secs < longest_window {
            bail!(
                "RATE_LIMIT_CACHE_TTL_SECONDS ({}) is shorter than the longest window ({longest_window}s)",
                self.cache_ttl_secs
            );
        }
        Ok(())
    }

    fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let strategy = match env::var("RATE_LIMIT_STRATEGY") {
            Ok(raw) => raw.parse::<RateLimitStrategy>().map_err(|e| anyhow!(e))?,
            Err(_) => defaults.strategy,
        };

        let tier_limits = match env::var("RATE_LIMIT_TIERS") {
            Ok(raw) => parse_tiers(&raw)?,
            Err(_) => defaults.tier_limits,
        };

        let routes = match env::var("RATE_LIMIT_ROUTES") {
            Ok(raw) => parse_routes(&raw)?,
            Err(_) => defaults.routes,
        };

        let backend = match env::var("RATE_LIMIT_BACKEND")
            .unwrap_or_else(|_| "memory".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "memory" | "in_memory" => StoreBackendConfig::InMemory,
            "redis" => {
                let url = env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
                let key_prefix = env::var("REDIS_KEY_PREFIX")
                    .unwrap_or_else(|_| "parsify".to_string());
                StoreBackendConfig::Redis { url, key_prefix }
            }
            other => return Err(anyhow!("unsupported RATE_LIMIT_BACKEND: {other}")),
        };

        Ok(Self {
            enabled: parse_env("RATE_LIMIT_ENABLED", defaults.enabled),
            strategy,
            window_seconds: parse_env("RATE_LIMIT_WINDOW_SECONDS", defaults.window_seconds),
            tier_limits,
            default_limit: parse_env("RATE_LIMIT_DEFAULT_LIMIT", defaults.default_limit),
            cache_ttl_secs: parse_env("RATE_LIMIT_CACHE_TTL_SECONDS", defaults.cache_ttl_secs),
            bypass: parse_csv("RATE_LIMIT_BYPASS", "").into_iter().collect(),
            routes,
            scope: env::var("RATE_LIMIT_SCOPE").unwrap_or(defaults.scope),
            key_by_route: parse_env("RATE_LIMIT_KEY_BY_ROUTE", defaults.key_by_route),
            backend,
            fallback_quota: parse_env("RATE_LIMIT_FALLBACK_QUOTA", defaults.fallback_quota),
        })
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse::<SocketAddr>()
            .context("invalid BIND_ADDR")?;

        let log_format = match env::var("LOG_FORMAT") {
            Ok(raw) => raw.parse::<LogFormat>().map_err(|e| anyhow!(e))?,
            Err(_) => LogFormat::default(),
        };

        let api_keys = parse_api_keys(&env::var("API_KEYS").unwrap_or_default())?;

        let rate_limit = RateLimitConfig::from_env().context("invalid rate limit settings")?;
        rate_limit.validate()?;

        Ok(Self {
            bind_addr,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format,
            api_keys,
            trust_forwarded_headers: parse_env("TRUST_FORWARDED_HEADERS", true),
            rate_limit,
        })
    }
}

/// `tier=limit,...`; tier names are case-insensitive.
pub fn parse_tiers(raw: &str) -> Result<HashMap<String, u32>> {
    let mut out = HashMap::new();
    for chunk in raw.split(',').map(str::trim).filter(|c| !c.is_empty()) {
        let (tier, limit) = chunk
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid tier entry: {chunk}"))?;
        let tier = tier.trim().to_ascii_lowercase();
        if tier.is_empty() {
            return Err(anyhow!("invalid tier entry: {chunk}"));
        }
        let limit = limit
            .trim()
            .parse::<u32>()
            .with_context(|| format!("invalid limit for tier {tier}"))?;
        out.insert(tier, limit);
    }
    Ok(out)
}

/// `[METHOD ]prefix=weight:N|limit:N|window:N|strategy:S,...`
pub fn parse_routes(raw: &str) -> Result<Vec<RouteRule>> {
    let mut out = Vec::new();
    for chunk in raw.split(',').map(str::trim).filter(|c| !c.is_empty()) {
        let (target, options) = chunk
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid route entry: {chunk}"))?;

        let target = target.trim();
        let (method, path_prefix) = match target.split_once(char::is_whitespace) {
            Some((method, path)) => {
                let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                    .with_context(|| format!("invalid method in route entry: {chunk}"))?;
                (Some(method), path.trim())
            }
            None => (None, target),
        };
        if !path_prefix.starts_with('/') {
            return Err(anyhow!("route prefix must start with '/': {chunk}"));
        }

        let mut rule = RouteRule {
            method,
            path_prefix: path_prefix.to_string(),
            weight: 1,
            limit: None,
            window_seconds: None,
            strategy: None,
        };

        for option in options.split('|').map(str::trim).filter(|o| !o.is_empty()) {
            let (name, value) = option
                .split_once(':')
                .ok_or_else(|| anyhow!("invalid route option {option} in {chunk}"))?;
            let value = value.trim();
            match name.trim() {
                "weight" => rule.weight = value.parse().context("invalid route weight")?,
                "limit" => rule.limit = Some(value.parse().context("invalid route limit")?),
                "window" => {
                    rule.window_seconds = Some(value.parse().context("invalid route window")?)
                }
                "strategy" => {
                    rule.strategy = Some(value.parse().map_err(|e: String| anyhow!(e))?)
                }
                other => return Err(anyhow!("unknown route option {other} in {chunk}")),
            }
        }

        out.push(rule);
    }
    Ok(out)
}

/// `key:user_id:tier,...`
fn parse_api_keys(raw: &str) -> Result<Vec<ApiKeyConfig>> {
    raw.split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(|chunk| {
            let mut parts = chunk.splitn(3, ':').map(str::trim);
            match (parts.next(), parts.next(), parts.next()) {
                (Some(key), Some(user_id), tier) if !key.is_empty() && !user_id.is_empty() => {
                    Ok(ApiKeyConfig {
                        key: key.to_string(),
                        user_id: user_id.to_string(),
                        tier: tier
                            .filter(|t| !t.is_empty())
                            .unwrap_or("free")
                            .to_ascii_lowercase(),
                    })
                }
                _ => Err(anyhow!("invalid API_KEYS entry")),
            }
        })
        .collect()
}

fn parse_csv(key: &str, default: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_env<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env::var(key)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tier_table() {
        let tiers = parse_tiers("Anonymous=10, pro = 500").unwrap();
        assert_eq!(tiers.get("anonymous"), Some(&10));
        assert_eq!(tiers.get("pro"), Some(&500));
        assert!(parse_tiers("free").is_err());
        assert!(parse_tiers("free=lots").is_err());
    }

    #[test]
    fn parses_route_rules_with_options() {
        let routes = parse_routes(
            "post /api/v1/files=weight:5|window:300|strategy:fixed_window, /api/v1/jobs=limit:100",
        )
        .unwrap();

        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].method, Some(Method::POST));
        assert_eq!(routes[0].path_prefix, "/api/v1/files");
        assert_eq!(routes[0].weight, 5);
        assert_eq!(routes[0].window_seconds, Some(300));
        assert_eq!(routes[0].strategy, Some(RateLimitStrategy::FixedWindow));

        assert_eq!(routes[1].method, None);
        assert_eq!(routes[1].limit, Some(100));
        assert_eq!(routes[1].weight, 1);
    }

    #[test]
    fn rejects_malformed_routes() {
        assert!(parse_routes("api=weight:2").is_err());
        assert!(parse_routes("/api=speed:2").is_err());
        assert!(parse_routes("/api=strategy:leaky").is_err());
    }

    #[test]
    fn parses_api_keys_with_default_tier() {
        let keys = parse_api_keys("k1:user-1:PRO,k2:user-2").unwrap();
        assert_eq!(keys[0].tier, "pro");
        assert_eq!(keys[1].user_id, "user-2");
        assert_eq!(keys[1].tier, "free");
        assert!(parse_api_keys("k3").is_err());
    }

    #[test]
    fn route_rule_matching_respects_method() {
        let rule = RouteRule {
            method: Some(Method::POST),
            path_prefix: "/api/v1/files".to_string(),
            weight: 2,
            limit: None,
            window_seconds: None,
            strategy: None,
        };
        assert!(rule.matches(&Method::POST, "/api/v1/files/upload"));
        assert!(!rule.matches(&Method::GET, "/api/v1/files/upload"));
        assert!(!rule.matches(&Method::POST, "/api/v1/jobs"));
    }

    #[test]
    fn validation_catches_deployment_errors() {
        assert!(RateLimitConfig::default().validate().is_ok());

        let zero_window = RateLimitConfig {
            window_seconds: 0,
            ..RateLimitConfig::default()
        };
        assert!(zero_window.validate().is_err());

        let short_ttl = RateLimitConfig {
            cache_ttl_secs: 30,
            ..RateLimitConfig::default()
        };
        assert!(short_ttl.validate().is_err());

        let long_route_window = RateLimitConfig {
            routes: parse_routes("/api/v1/files=window:7200").unwrap(),
            ..RateLimitConfig::default()
        };
        assert!(long_route_window.validate().is_err());
    }

    #[test]
    fn validation_rejects_weight_above_reachable_limit() {
        let heavy_for_anonymous = RateLimitConfig {
            tier_limits: [("anonymous".to_string(), 3), ("pro".to_string(), 300)].into(),
            routes: parse_routes("/api/v1/files=weight:5").unwrap(),
            ..RateLimitConfig::default()
        };
        assert!(heavy_for_anonymous.validate().is_err());

        let own_limit_too_small = RateLimitConfig {
            routes: parse_routes("/api/v1/files=weight:5|limit:4").unwrap(),
            ..RateLimitConfig::default()
        };
        assert!(own_limit_too_small.validate().is_err());

        let own_limit_fits = RateLimitConfig {
            routes: parse_routes("/api/v1/files=weight:5|limit:10").unwrap(),
            ..RateLimitConfig::default()
        };
        assert!(own_limit_fits.validate().is_ok());

        let default_limit_binds = RateLimitConfig {
            default_limit: 2,
            routes: parse_routes("/api/v1/files=weight:3").unwrap(),
            ..RateLimitConfig::default()
        };
        assert!(default_limit_binds.validate().is_err());
    }

    #[test]
    fn validation_caps_window_length() {
        let huge_window = RateLimitConfig {
            window_seconds: u64::MAX / 2,
            cache_ttl_secs: u64::MAX,
            ..RateLimitConfig::default()
        };
        assert!(huge_window.validate().is_err());

        let huge_route_window = RateLimitConfig {
            cache_ttl_secs: u64::MAX,
            routes: parse_routes(&format!("/api/v1/files=window:{}", MAX_WINDOW_SECONDS + 1)).unwrap(),
            ..RateLimitConfig::default()
        };
        assert!(huge_route_window.validate().is_err());

        let longest_allowed = RateLimitConfig {
            window_seconds: MAX_WINDOW_SECONDS,
            cache_ttl_secs: MAX_WINDOW_SECONDS,
            ..RateLimitConfig::default()
        };
        assert!(longest_allowed.validate().is_ok());
    }
}
