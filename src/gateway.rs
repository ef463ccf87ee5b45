use std::{
    convert::Infallible,
    net::IpAddr,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    Router,
    body::Body,
    http::{
        HeaderName,
        HeaderValue,
        Request,
    },
    response::{
        IntoResponse,
        Response,
    },
};
use tower::ServiceExt;
use uuid::Uuid;

use crate::{
    api::{self, Caller},
    clock::{Clock, SystemClock},
    config::{GatewayConfig, StoreBackendConfig},
    context::{RequestContext, resolve_client_ip},
    middleware::{
        ControlFlow,
        GatewayMiddleware,
        auth::{ActorResolutionMiddleware, ApiKeyEnforcementMiddleware},
        logging::RequestLoggingMiddleware,
        rate_limit::RateLimitMiddleware,
    },
    ratelimit::{
        LimiterDeps,
        quota::{LocalQuota, QuotaService},
        service::RateLimitService,
    },
    store::{
        KvStore,
        in_memory::InMemoryStore,
        redis_backend::RedisStore,
    },
};

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);

pub struct Gateway {
    middlewares: Vec<Arc<dyn GatewayMiddleware>>,
    api: Router,
    trust_forwarded_headers: bool,
}

impl Gateway {
    pub async fn from_config(config: GatewayConfig) -> anyhow::Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let store: Arc<dyn KvStore> = match &config.rate_limit.backend {
            StoreBackendConfig::InMemory => {
                let store = Arc::new(InMemoryStore::new(clock.clone()));
                let sweep = store.clone();
                spawn_housekeeping("store", move || sweep.purge_expired());
                store
            }
            StoreBackendConfig::Redis { url, key_prefix } => Arc::new(
                RedisStore::new(url.clone(), key_prefix.clone())
                    .await
                    .context("failed to connect to rate limit store")?,
            ),
        };

        let fallback: Option<Arc<dyn QuotaService>> = if config.rate_limit.fallback_quota {
            let quota = Arc::new(LocalQuota::new(clock.clone()));
            let sweep = quota.clone();
            spawn_housekeeping("fallback-quota", move || sweep.evict_stale());
            Some(quota)
        } else {
            None
        };

        Ok(Self::new(config, store, clock, fallback))
    }

    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        fallback: Option<Arc<dyn QuotaService>>,
    ) -> Self {
        let deps = LimiterDeps {
            store,
            clock,
            cache_ttl_secs: config.rate_limit.cache_ttl_secs,
        };
        let service = Arc::new(RateLimitService::new(
            config.rate_limit.clone(),
            deps,
            fallback,
        ));

        let mut middlewares: Vec<Arc<dyn GatewayMiddleware>> = vec![
            Arc::new(RequestLoggingMiddleware),
            Arc::new(ActorResolutionMiddleware::new(config.api_keys.clone())),
        ];

        if config.rate_limit.enabled {
            middlewares.push(Arc::new(RateLimitMiddleware::new(service.clone())));
        } else {
            tracing::warn!("rate limiting is disabled");
        }
        middlewares.push(Arc::new(ApiKeyEnforcementMiddleware));

        Self {
            middlewares,
            api: api::routes(service),
            trust_forwarded_headers: config.trust_forwarded_headers,
        }
    }

    pub async fn handle_http(&self, request: Request<Body>, peer: Option<IpAddr>) -> Response<Body> {
        let (parts, body) = request.into_parts();

        let request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let client_ip = resolve_client_ip(&parts.headers, peer, self.trust_forwarded_headers);
        let mut ctx = RequestContext::new(
            request_id,
            parts.method.clone(),
            parts.uri.clone(),
            parts.headers.clone(),
            client_ip,
        );

        let mut executed = Vec::new();

        for (idx, middleware) in self.middlewares.iter().enumerate() {
            match middleware.on_request(&mut ctx).await {
                Ok(ControlFlow::Continue) => executed.push(idx),
                Ok(ControlFlow::ShortCircuit(mut response)) => {
                    self.finish(&executed, &ctx, &mut response).await;
                    return response;
                }
                Err(err) => {
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        middleware = middleware.name(),
                        error = %err,
                        "middleware rejected request"
                    );
                    let mut response = err.into_response();
                    self.finish(&executed, &ctx, &mut response).await;
                    return response;
                }
            }
        }

        let mut request = Request::from_parts(parts, body);
        request.extensions_mut().insert(Caller {
            actor: ctx.actor.clone(),
            client_ip: ctx.client_ip,
        });

        let mut response = self
            .api
            .clone()
            .oneshot(request)
            .await
            .unwrap_or_else(|never: Infallible| match never {});
        self.finish(&executed, &ctx, &mut response).await;
        response
    }

    /// Runs response hooks in reverse order and stamps the request id.
    async fn finish(&self, executed: &[usize], ctx: &RequestContext, response: &mut Response<Body>) {
        for idx in executed.iter().rev() {
            let middleware = &self.middlewares[*idx];
            if let Err(err) = middleware.on_response(ctx, response).await {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    middleware = middleware.name(),
                    error = %err,
                    "middleware post-response hook failed"
                );
            }
        }

        if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
            response
                .headers_mut()
                .insert(HeaderName::from_static("x-request-id"), value);
        }
    }
}

fn spawn_housekeeping<F>(name: &'static str, task: F)
where
    F: Fn() + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        loop {
            ticker.tick().await;
            task();
            tracing::trace!(task = name, "housekeeping pass complete");
        }
    });
}
