use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashSet, convert::Infallible, sync::Arc};
use tracing::{info, warn};

/// Keys allowed to trigger administrative operations such as catalog sweeps.
#[derive(Clone)]
pub struct AdminAuth {
    keys: Arc<HashSet<String>>,
}

impl AdminAuth {
    pub fn new(keys: impl IntoIterator<Item = String>) -> Self {
        let keys: HashSet<String> = keys.into_iter().collect();
        if keys.is_empty() {
            warn!(
                target = "vsync.api",
                "SYNC_ADMIN_KEYS is empty; administrative routes will reject every request"
            );
        } else {
            info!(target = "vsync.api", key_count = keys.len(), "loaded admin keys");
        }
        Self {
            keys: Arc::new(keys),
        }
    }

    fn accepts(&self, presented: &str) -> bool {
        self.keys.contains(presented)
    }
}

pub async fn require_admin_key(
    State(auth): State<AdminAuth>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_key(request.headers()) else {
        return Ok(unauthorized_response(
            "missing_admin_key",
            "Provide X-Sync-Key or Bearer token",
        ));
    };
    if !auth.accepts(&presented) {
        warn!(target = "vsync.api", path = %request.uri().path(), "admin key rejected");
        return Ok(unauthorized_response("invalid_admin_key", "Key not recognized"));
    }
    Ok(next.run(request).await)
}

fn extract_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get("X-Sync-Key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized_response(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}
