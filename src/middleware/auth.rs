use async_trait::async_trait;

use crate::{
    config::ApiKeyConfig,
    context::{Actor, RequestContext},
    error::{GatewayError, GatewayResult},
    middleware::{ControlFlow, GatewayMiddleware},
};

/// Attaches the caller's actor record. Requests without a key stay anonymous
/// and are limited by client IP. An unknown key is only flagged here, so the
/// request still counts against the IP before [`ApiKeyEnforcementMiddleware`]
/// rejects it.
pub struct ActorResolutionMiddleware {
    keys: Vec<(Vec<u8>, Actor)>,
}

impl ActorResolutionMiddleware {
    pub fn new(keys: Vec<ApiKeyConfig>) -> Self {
        Self {
            keys: keys
                .into_iter()
                .map(|k| {
                    (
                        k.key.into_bytes(),
                        Actor {
                            id: k.user_id,
                            tier: k.tier,
                        },
                    )
                })
                .collect(),
        }
    }

    fn lookup(&self, provided: &[u8]) -> Option<&Actor> {
        // Compare against every key so lookup time does not depend on position.
        let mut found = None;
        for (expected, actor) in &self.keys {
            if timing_safe_eq(expected, provided) && found.is_none() {
                found = Some(actor);
            }
        }
        found
    }
}

#[async_trait]
impl GatewayMiddleware for ActorResolutionMiddleware {
    fn name(&self) -> &'static str {
        "actor-resolution"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        let Some(provided) = ctx
            .headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        else {
            return Ok(ControlFlow::Continue);
        };

        match self.lookup(provided.as_bytes()) {
            Some(actor) => ctx.actor = Some(actor.clone()),
            None => ctx.unknown_api_key = true,
        }

        Ok(ControlFlow::Continue)
    }
}

/// Rejects requests flagged with an unknown API key. Runs after rate limiting.
pub struct ApiKeyEnforcementMiddleware;

#[async_trait]
impl GatewayMiddleware for ApiKeyEnforcementMiddleware {
    fn name(&self) -> &'static str {
        "api-key-enforcement"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        if ctx.unknown_api_key {
            return Err(GatewayError::Unauthorized);
        }
        Ok(ControlFlow::Continue)
    }
}

fn timing_safe_eq(a: &[u8], b: &[u8]) -> bool {
    let max = a.len().max(b.len());
    let mut diff = (a.len() ^ b.len()) as u8;

    for idx in 0..max {
        let av = *a.get(idx).unwrap_or(&0);
        let bv = *b.get(idx).unwrap_or(&0);
        diff |= av ^ bv;
    }

    diff == 0
}
