use axum::body::Body;
use axum::http::{header::CONTENT_TYPE, HeaderValue, Response, StatusCode};
use governor::middleware::StateInformationMiddleware;
use std::sync::Arc;
use std::time::Duration;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::PeerIpKeyExtractor, GovernorError,
    GovernorLayer,
};

use crate::config::Config;

pub type AuthRateLimitLayer = GovernorLayer<PeerIpKeyExtractor, StateInformationMiddleware, Body>;

/// Per-IP throttle for the unauthenticated auth routes: a burst of
/// `RATE_LIMIT_IP_MAX_REQUESTS`, refilled evenly over the configured window.
pub fn create_auth_rate_limiter(config: &Config) -> anyhow::Result<AuthRateLimitLayer> {
    let burst_size = config.rate_limit_ip_max_requests.max(1);
    let window = Duration::from_secs(config.rate_limit_ip_window_seconds.max(1));
    let replenish = (window / burst_size).max(Duration::from_millis(1));
    let governor_conf = GovernorConfigBuilder::default()
        .period(replenish)
        .burst_size(burst_size)
        .key_extractor(PeerIpKeyExtractor)
        .use_headers()
        .finish()
        .ok_or_else(|| anyhow::anyhow!("Invalid auth rate limiter configuration"))?;

    Ok(GovernorLayer::new(Arc::new(governor_conf)).error_handler(rate_limit_error_handler))
}

fn rate_limit_error_handler(error: GovernorError) -> Response<Body> {
    match error {
        GovernorError::TooManyRequests { wait_time, headers } => {
            tracing::warn!(target: "security", wait_time, "Auth rate limit exceeded");
            let mut response = json_error_response(
                StatusCode::TOO_MANY_REQUESTS,
                "Too many requests. Please try again later.",
                "RATE_LIMIT_EXCEEDED",
                Some(wait_time),
            );
            if let Some(headers) = headers {
                response.headers_mut().extend(headers);
            }
            response
        }
        GovernorError::UnableToExtractKey => json_error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Unable to determine request identity.",
            "RATE_LIMIT_KEY_ERROR",
            None,
        ),
        GovernorError::Other { code, msg, headers } => {
            let mut response = json_error_response(
                code,
                &msg.unwrap_or_else(|| "Rate limit error".to_string()),
                "RATE_LIMIT_ERROR",
                None,
            );
            if let Some(headers) = headers {
                response.headers_mut().extend(headers);
            }
            response
        }
    }
}

/// Same `{error, code}` shape as every other API error.
fn json_error_response(
    status: StatusCode,
    message: &str,
    code: &str,
    retry_after: Option<u64>,
) -> Response<Body> {
    let mut body = serde_json::json!({
        "error": message,
        "code": code,
    });
    if let Some(retry_after) = retry_after {
        body["details"] = serde_json::json!({ "retry_after": retry_after });
    }

    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(retry_after) = retry_after {
        if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
            response.headers_mut().insert("retry-after", value);
        }
    }
    response
}
