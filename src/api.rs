use std::{net::IpAddr, sync::Arc};

use axum::{
    Extension, Json, Router,
    extract::{Query, State},
    http::Method,
    routing::get,
};
use serde::{Deserialize, Serialize};

use crate::{
    context::Actor,
    error::GatewayError,
    ratelimit::{
        key::ActorIdentity,
        service::{EffectivePolicy, RateLimitService, RateLimitSubject},
    },
};

/// Caller details handed from the middleware chain to the handlers.
#[derive(Debug, Clone)]
pub struct Caller {
    pub actor: Option<Actor>,
    pub client_ip: Option<IpAddr>,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    path: Option<String>,
    method: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    actor: String,
    key: String,
    enabled: bool,
    bypassed: bool,
    policy: EffectivePolicy,
}

pub fn routes(service: Arc<RateLimitService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/ratelimit/status", get(status))
        .fallback(not_found)
        .with_state(service)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

/// Effective policy for the caller, optionally for another route.
async fn status(
    State(service): State<Arc<RateLimitService>>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<StatusQuery>,
) -> Json<StatusResponse> {
    let method = query
        .method
        .as_deref()
        .and_then(|m| Method::from_bytes(m.to_ascii_uppercase().as_bytes()).ok())
        .unwrap_or(Method::GET);
    let path = query.path.as_deref().unwrap_or("/");

    let actor = caller.actor.as_ref();
    let subject = RateLimitSubject {
        actor: ActorIdentity::resolve(actor.map(|a| a.id.as_str()), caller.client_ip),
        tier: actor.map(|a| a.tier.as_str()),
        method: &method,
        path,
    };

    Json(StatusResponse {
        actor: subject.actor.to_string(),
        key: service.key_for(&subject),
        enabled: service.config().enabled,
        bypassed: service.is_bypassed(&subject.actor),
        policy: service.resolve_policy(subject.tier, &method, path),
    })
}

async fn not_found() -> GatewayError {
    GatewayError::RouteNotFound
}
