use axum::{
    Json,
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::ratelimit::{RateLimitCheck, RateLimitStrategy};

pub const LIMIT_HEADER: HeaderName = HeaderName::from_static("x-rate-limit-limit");
pub const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-rate-limit-remaining");
pub const RESET_HEADER: HeaderName = HeaderName::from_static("x-rate-limit-reset");
pub const STRATEGY_HEADER: HeaderName = HeaderName::from_static("x-rate-limit-strategy");

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitExceededBody<'a> {
    pub error: &'static str,
    pub message: String,
    pub limit: u32,
    pub remaining: u32,
    pub reset_time: String,
    pub strategy: RateLimitStrategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

pub fn reset_epoch_secs(reset_time_ms: i64) -> i64 {
    reset_time_ms.div_euclid(1_000) + i64::from(reset_time_ms.rem_euclid(1_000) != 0)
}

/// Whole seconds, rounded up, never below one.
pub fn retry_after_secs(retry_after_ms: u64) -> u64 {
    retry_after_ms.div_ceil(1_000).max(1)
}

fn reset_rfc3339(reset_time_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(reset_time_ms)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn apply_headers(headers: &mut HeaderMap, check: &RateLimitCheck, strategy: RateLimitStrategy) {
    headers.insert(LIMIT_HEADER, HeaderValue::from(check.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(check.remaining));
    headers.insert(RESET_HEADER, HeaderValue::from(reset_epoch_secs(check.reset_time_ms)));
    headers.insert(STRATEGY_HEADER, HeaderValue::from_static(strategy.as_str()));

    match check.retry_after_ms {
        Some(ms) if !check.allowed => {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs(ms)));
        }
        _ => {
            headers.remove(header::RETRY_AFTER);
        }
    }
}

pub fn limited_response(
    check: &RateLimitCheck,
    strategy: RateLimitStrategy,
    request_id: Option<&str>,
) -> Response<Body> {
    let retry_after = check.retry_after_ms.map(retry_after_secs);
    let message = match retry_after {
        Some(secs) => format!("Too many requests. Retry after {secs} seconds."),
        None => "Too many requests.".to_string(),
    };

    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(RateLimitExceededBody {
            error: "rate_limit_exceeded",
            message,
            limit: check.limit,
            remaining: check.remaining,
            reset_time: reset_rfc3339(check.reset_time_ms),
            strategy,
            request_id,
            retry_after,
        }),
    )
        .into_response();

    apply_headers(response.headers_mut(), check, strategy);
    response
}
