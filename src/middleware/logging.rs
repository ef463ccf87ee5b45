use async_trait::async_trait;

use crate::{
    context::RequestContext,
    error::GatewayResult,
    middleware::{ControlFlow, GatewayMiddleware},
    ratelimit::service::RateLimitOutcome,
};

pub struct RequestLoggingMiddleware;

#[async_trait]
impl GatewayMiddleware for RequestLoggingMiddleware {
    fn name(&self) -> &'static str {
        "request-logging"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        tracing::info!(
            request_id = %ctx.request_id,
            method = %ctx.method,
            path = %ctx.uri.path(),
            client_ip = ?ctx.client_ip,
            "incoming request"
        );
        Ok(ControlFlow::Continue)
    }

    async fn on_response(
        &self,
        ctx: &RequestContext,
        response: &mut axum::response::Response,
    ) -> GatewayResult<()> {
        let latency_ms = ctx.started_at.elapsed().as_millis();
        let (rate_limit, key, remaining) = match &ctx.rate_limit {
            Some(RateLimitOutcome::Decided(decision)) => (
                decision.source.as_str(),
                Some(decision.key.as_str()),
                Some(decision.check.remaining),
            ),
            Some(RateLimitOutcome::Bypassed) => ("bypassed", None, None),
            None => ("skipped", None, None),
        };
        let throttled = ctx.rate_limit.as_ref().is_some_and(RateLimitOutcome::is_denied);

        tracing::info!(
            request_id = %ctx.request_id,
            method = %ctx.method,
            path = %ctx.uri.path(),
            status = %response.status(),
            actor = ?ctx.actor.as_ref().map(|a| a.id.as_str()),
            rate_limit,
            rate_limit_key = ?key,
            remaining = ?remaining,
            throttled,
            latency_ms = latency_ms,
            "request completed"
        );
        Ok(())
    }
}
