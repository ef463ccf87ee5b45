//! Request pipeline stages. The gateway runs them in order: logging, actor
//! resolution, rate limiting, then API key enforcement.

pub mod auth;
pub mod logging;
pub mod rate_limit;

use async_trait::async_trait;
use axum::{
    body::Body,
    response::Response,
};

use crate::{
    context::RequestContext,
    error::GatewayResult,
};

/// Result of a request hook.
pub enum ControlFlow {
    Continue,
    /// Answer now without calling the API router. The 429 from the rate
    /// limiter goes out this way.
    ShortCircuit(Response<Body>),
}

#[async_trait]
pub trait GatewayMiddleware: Send + Sync {
    fn name(&self) -> &'static str;

    /// An `Err` is rendered as the response; later stages are skipped.
    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow>;

    /// Runs in reverse order for every stage whose `on_request` returned
    /// `Continue`. A stage that short-circuits or fails does not get its own
    /// hook, so it must finish its response itself.
    async fn on_response(
        &self,
        _ctx: &RequestContext,
        _response: &mut Response<Body>,
    ) -> GatewayResult<()> {
        Ok(())
    }
}
