use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    response::Response,
};

use crate::{
    context::RequestContext,
    error::GatewayResult,
    middleware::{ControlFlow, GatewayMiddleware},
    ratelimit::{
        key::ActorIdentity,
        response::{apply_headers, limited_response},
        service::{RateLimitOutcome, RateLimitService, RateLimitSubject},
    },
};

/// Never fails the request: store trouble is absorbed by the service.
pub struct RateLimitMiddleware {
    service: Arc<RateLimitService>,
}

impl RateLimitMiddleware {
    pub fn new(service: Arc<RateLimitService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl GatewayMiddleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        let actor = ctx.actor.as_ref();
        let subject = RateLimitSubject {
            actor: ActorIdentity::resolve(actor.map(|a| a.id.as_str()), ctx.client_ip),
            tier: actor.map(|a| a.tier.as_str()),
            method: &ctx.method,
            path: ctx.uri.path(),
        };

        let outcome = self.service.check(&subject).await;
        let flow = match &outcome {
            RateLimitOutcome::Decided(decision) if !decision.check.allowed => {
                ControlFlow::ShortCircuit(limited_response(
                    &decision.check,
                    decision.policy.strategy,
                    Some(&ctx.request_id),
                ))
            }
            _ => ControlFlow::Continue,
        };

        ctx.rate_limit = Some(outcome);
        Ok(flow)
    }

    async fn on_response(
        &self,
        ctx: &RequestContext,
        response: &mut Response<Body>,
    ) -> GatewayResult<()> {
        if let Some(RateLimitOutcome::Decided(decision)) = &ctx.rate_limit {
            apply_headers(response.headers_mut(), &decision.check, decision.policy.strategy);
        }
        Ok(())
    }
}
