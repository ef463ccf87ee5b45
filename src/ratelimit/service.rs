use std::sync::Arc;

use http::Method;
use serde::Serialize;

use crate::{
    clock::Clock,
    config::{ANONYMOUS_TIER, RateLimitConfig, RouteRule},
    ratelimit::{
        LimiterDeps, RateLimitCheck, RateLimitStrategy, RateLimiter, window_millis,
        fixed_window::FixedWindowLimiter,
        key::{ActorIdentity, KeyGenerator},
        quota::{QuotaError, QuotaService},
        sliding_window::SlidingWindowLimiter,
        token_bucket::TokenBucketLimiter,
    },
    store::StoreResult,
};

/// What the dispatcher needs to know about one request.
#[derive(Debug, Clone)]
pub struct RateLimitSubject<'a> {
    pub actor: ActorIdentity,
    pub tier: Option<&'a str>,
    pub method: &'a Method,
    pub path: &'a str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectivePolicy {
    pub strategy: RateLimitStrategy,
    pub tier: String,
    pub limit: u32,
    pub window_seconds: u64,
    pub weight: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
}

/// Pipeline stage that produced the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Store,
    FallbackQuota,
    FailOpen,
}

impl DecisionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Store => "store",
            Self::FallbackQuota => "fallback_quota",
            Self::FailOpen => "fail_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub key: String,
    pub policy: EffectivePolicy,
    pub check: RateLimitCheck,
    pub source: DecisionSource,
}

#[derive(Debug, Clone)]
pub enum RateLimitOutcome {
    Bypassed,
    Decided(RateLimitDecision),
}

impl RateLimitOutcome {
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Decided(decision) if !decision.check.allowed)
    }
}

/// Routes each check to the configured limiter and degrades through the
/// fallback quota to fail-open when the store is unreachable.
pub struct RateLimitService {
    config: RateLimitConfig,
    keys: KeyGenerator,
    token_bucket: TokenBucketLimiter,
    sliding_window: SlidingWindowLimiter,
    fixed_window: FixedWindowLimiter,
    fallback: Option<Arc<dyn QuotaService>>,
    clock: Arc<dyn Clock>,
}

impl RateLimitService {
    pub fn new(
        config: RateLimitConfig,
        deps: LimiterDeps,
        fallback: Option<Arc<dyn QuotaService>>,
    ) -> Self {
        Self {
            keys: KeyGenerator::new(config.scope.clone(), config.key_by_route),
            token_bucket: TokenBucketLimiter::new(deps.clone()),
            sliding_window: SlidingWindowLimiter::new(deps.clone()),
            fixed_window: FixedWindowLimiter::new(deps.clone()),
            clock: deps.clock,
            fallback,
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn limiter(&self, strategy: RateLimitStrategy) -> &dyn RateLimiter {
        match strategy {
            RateLimitStrategy::TokenBucket => &self.token_bucket,
            RateLimitStrategy::SlidingWindow => &self.sliding_window,
            RateLimitStrategy::FixedWindow => &self.fixed_window,
        }
    }

    /// Longest matching prefix wins.
    fn match_route(&self, method: &Method, path: &str) -> Option<&RouteRule> {
        self.config
            .routes
            .iter()
            .filter(|rule| rule.matches(method, path))
            .max_by_key(|rule| (rule.path_prefix.len(), rule.method.is_some()))
    }

    fn tier_limit(&self, tier: Option<&str>) -> (String, u32) {
        let tier = tier
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| ANONYMOUS_TIER.to_string());
        let limit = self
            .config
            .tier_limits
            .get(&tier)
            .copied()
            .unwrap_or(self.config.default_limit);
        (tier, limit)
    }

    pub fn resolve_policy(&self, tier: Option<&str>, method: &Method, path: &str) -> EffectivePolicy {
        let (tier, tier_limit) = self.tier_limit(tier);
        let rule = self.match_route(method, path);

        EffectivePolicy {
            strategy: rule
                .and_then(|r| r.strategy)
                .unwrap_or(self.config.strategy),
            tier,
            limit: rule.and_then(|r| r.limit).unwrap_or(tier_limit),
            window_seconds: rule
                .and_then(|r| r.window_seconds)
                .unwrap_or(self.config.window_seconds),
            weight: rule.map(|r| r.weight).unwrap_or(1).max(1),
            route: rule.map(|r| r.path_prefix.clone()),
        }
    }

    pub fn key_for(&self, subject: &RateLimitSubject<'_>) -> String {
        match self.match_route(subject.method, subject.path) {
            Some(rule) => self.keys.generate(
                &subject.actor,
                rule.method.as_ref(),
                Some(&rule.path_prefix),
            ),
            None => self.keys.generate(&subject.actor, None, None),
        }
    }

    pub fn is_bypassed(&self, actor: &ActorIdentity) -> bool {
        actor
            .id()
            .is_some_and(|id| self.config.bypass.contains(&id))
    }

    pub async fn check(&self, subject: &RateLimitSubject<'_>) -> RateLimitOutcome {
        if self.is_bypassed(&subject.actor) {
            tracing::debug!(actor = %subject.actor, "actor is exempt from rate limiting");
            return RateLimitOutcome::Bypassed;
        }

        let key = self.key_for(subject);
        let policy = self.resolve_policy(subject.tier, subject.method, subject.path);

        let (check, source) = match self.store_stage(&key, &policy).await {
            Ok(check) => (check, DecisionSource::Store),
            Err(store_err) => {
                tracing::warn!(
                    key = %key,
                    strategy = %policy.strategy,
                    error = %store_err,
                    "rate limit store failed; consulting fallback quota"
                );
                match self.fallback_stage(&key, &policy).await {
                    Ok(check) => (check, DecisionSource::FallbackQuota),
                    Err(quota_err) => {
                        tracing::error!(
                            key = %key,
                            error = %quota_err,
                            "fallback quota failed; allowing request"
                        );
                        (self.fail_open_stage(&policy), DecisionSource::FailOpen)
                    }
                }
            }
        };

        if !check.allowed {
            tracing::info!(
                key = %key,
                strategy = %policy.strategy,
                limit = check.limit,
                retry_after_ms = ?check.retry_after_ms,
                "rate limit exceeded"
            );
        }

        RateLimitOutcome::Decided(RateLimitDecision {
            key,
            policy,
            check,
            source,
        })
    }

    async fn store_stage(&self, key: &str, policy: &EffectivePolicy) -> StoreResult<RateLimitCheck> {
        self.limiter(policy.strategy)
            .check(key, policy.limit, policy.window_seconds, policy.weight)
            .await
    }

    async fn fallback_stage(
        &self,
        key: &str,
        policy: &EffectivePolicy,
    ) -> Result<RateLimitCheck, QuotaError> {
        let quota = self.fallback.as_ref().ok_or(QuotaError::NotConfigured)?;
        quota
            .check(key, policy.limit, policy.window_seconds, policy.weight)
            .await
    }

    fn fail_open_stage(&self, policy: &EffectivePolicy) -> RateLimitCheck {
        let reset = self.clock.now_ms() + window_millis(policy.window_seconds);
        RateLimitCheck::allowed(policy.limit, policy.limit, reset)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr},
        sync::atomic::Ordering,
    };

    use async_trait::async_trait;

    use super::*;
    use crate::{
        config::parse_routes,
        ratelimit::{
            quota::LocalQuota,
            testing::{FailingStore, deps_at},
        },
        store::KvStore,
    };

    struct BrokenQuota;

    #[async_trait]
    impl QuotaService for BrokenQuota {
        async fn check(
            &self,
            _key: &str,
            _limit: u32,
            _window_seconds: u64,
            _weight: u32,
        ) -> Result<RateLimitCheck, QuotaError> {
            Err(QuotaError::Unavailable("down".to_string()))
        }
    }

    fn config() -> RateLimitConfig {
        RateLimitConfig {
            routes: parse_routes(
                "POST /api/v1/files=weight:3,/api/v1/files/preview=limit:2|strategy:fixed_window|window:10",
            )
            .unwrap(),
            bypass: ["admin-1".to_string(), "10.9.9.9".to_string()].into(),
            ..RateLimitConfig::default()
        }
    }

    fn subject<'a>(
        actor: ActorIdentity,
        tier: Option<&'a str>,
        method: &'a Method,
        path: &'a str,
    ) -> RateLimitSubject<'a> {
        RateLimitSubject {
            actor,
            tier,
            method,
            path,
        }
    }

    fn decided(outcome: RateLimitOutcome) -> RateLimitDecision {
        match outcome {
            RateLimitOutcome::Decided(decision) => decision,
            RateLimitOutcome::Bypassed => panic!("expected a decision"),
        }
    }

    #[test]
    fn resolves_tier_limits_with_fallbacks() {
        let (deps, _clock, _store) = deps_at(0);
        let service = RateLimitService::new(config(), deps, None);

        let pro = service.resolve_policy(Some("PRO"), &Method::GET, "/api/v1/jobs");
        assert_eq!((pro.tier.as_str(), pro.limit), ("pro", 300));

        let anon = service.resolve_policy(None, &Method::GET, "/api/v1/jobs");
        assert_eq!((anon.tier.as_str(), anon.limit), ("anonymous", 30));

        let unknown = service.resolve_policy(Some("platinum"), &Method::GET, "/api/v1/jobs");
        assert_eq!(unknown.limit, 60);
        assert_eq!(unknown.weight, 1);
        assert_eq!(unknown.route, None);
    }

    #[test]
    fn route_rules_override_policy_and_key() {
        let (deps, _clock, _store) = deps_at(0);
        let service = RateLimitService::new(config(), deps, None);

        let upload = service.resolve_policy(Some("free"), &Method::POST, "/api/v1/files/upload");
        assert_eq!(upload.weight, 3);
        assert_eq!(upload.limit, 60);
        assert_eq!(upload.strategy, RateLimitStrategy::TokenBucket);

        let preview = service.resolve_policy(Some("free"), &Method::POST, "/api/v1/files/preview/1");
        assert_eq!(preview.limit, 2);
        assert_eq!(preview.weight, 1);
        assert_eq!(preview.window_seconds, 10);
        assert_eq!(preview.strategy, RateLimitStrategy::FixedWindow);

        let actor = ActorIdentity::User("u1".to_string());
        let key = service.key_for(&subject(actor.clone(), None, &Method::POST, "/api/v1/files/a"));
        assert_eq!(key, "rl:api:user:u1:POST:/api/v1/files");
        let key = service.key_for(&subject(actor, None, &Method::GET, "/api/v1/other"));
        assert_eq!(key, "rl:api:user:u1");
    }

    #[tokio::test]
    async fn bypass_list_skips_checks() {
        let (deps, _clock, store) = deps_at(0);
        let service = RateLimitService::new(config(), deps, None);

        let user = service
            .check(&subject(ActorIdentity::User("admin-1".into()), None, &Method::GET, "/"))
            .await;
        assert!(matches!(user, RateLimitOutcome::Bypassed));

        let ip = IpAddr::V4(Ipv4Addr::new(10, 9, 9, 9));
        let by_ip = service
            .check(&subject(ActorIdentity::Ip(ip), None, &Method::GET, "/"))
            .await;
        assert!(matches!(by_ip, RateLimitOutcome::Bypassed));
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn dispatches_to_route_strategy() {
        let (deps, _clock, store) = deps_at(0);
        let service = RateLimitService::new(config(), deps, None);
        let method = Method::GET;
        let s = subject(
            ActorIdentity::User("u1".into()),
            Some("free"),
            &method,
            "/api/v1/files/preview",
        );

        assert!(!service.check(&s).await.is_denied());
        assert!(!service.check(&s).await.is_denied());
        let third = decided(service.check(&s).await);
        assert!(!third.check.allowed);
        assert_eq!(third.source, DecisionSource::Store);
        assert_eq!(third.policy.strategy, RateLimitStrategy::FixedWindow);

        let raw = store
            .get("rl:api:user:u1:/api/v1/files/preview:fixed_window")
            .await
            .unwrap();
        assert!(raw.is_some());
    }

    #[tokio::test]
    async fn store_failure_degrades_to_fallback_quota() {
        let (mut deps, clock, _store) = deps_at(0);
        let failing = Arc::new(FailingStore::default());
        deps.store = failing.clone();
        let quota: Arc<dyn QuotaService> = Arc::new(LocalQuota::new(clock));
        let service = RateLimitService::new(
            RateLimitConfig {
                tier_limits: [("anonymous".to_string(), 1)].into(),
                ..RateLimitConfig::default()
            },
            deps,
            Some(quota),
        );
        let method = Method::GET;
        let s = subject(ActorIdentity::Unknown, None, &method, "/");

        let first = decided(service.check(&s).await);
        assert!(first.check.allowed);
        assert_eq!(first.source, DecisionSource::FallbackQuota);

        let second = decided(service.check(&s).await);
        assert!(!second.check.allowed);
        assert_eq!(second.source, DecisionSource::FallbackQuota);
        assert!(failing.calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn store_and_quota_failure_fails_open() {
        let (mut deps, _clock, _store) = deps_at(0);
        deps.store = Arc::new(FailingStore::default());
        let service = RateLimitService::new(config(), deps, Some(Arc::new(BrokenQuota)));
        let method = Method::GET;

        let decision = decided(
            service
                .check(&subject(ActorIdentity::Unknown, None, &method, "/"))
                .await,
        );
        assert!(decision.check.allowed);
        assert_eq!(decision.source, DecisionSource::FailOpen);
        assert_eq!(decision.check.remaining, decision.check.limit);
        assert_eq!(decision.check.reset_time_ms, 60_000);
    }

    #[tokio::test]
    async fn store_failure_without_fallback_fails_open_for_every_strategy() {
        for strategy in [
            RateLimitStrategy::TokenBucket,
            RateLimitStrategy::SlidingWindow,
            RateLimitStrategy::FixedWindow,
        ] {
            let (mut deps, _clock, _store) = deps_at(0);
            deps.store = Arc::new(FailingStore::default());
            let service = RateLimitService::new(
                RateLimitConfig {
                    strategy,
                    ..RateLimitConfig::default()
                },
                deps,
                None,
            );
            let method = Method::GET;

            let decision = decided(
                service
                    .check(&subject(ActorIdentity::Unknown, None, &method, "/"))
                    .await,
            );
            assert!(decision.check.allowed, "{strategy} should fail open");
            assert_eq!(decision.source, DecisionSource::FailOpen);
        }
    }
}
