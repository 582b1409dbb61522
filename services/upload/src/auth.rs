//! Shared-secret authentication for the admin endpoints.

use crate::api::AppState;
use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use tracing::debug;

/// Header carrying the shared secret
pub const SECRET_HEADER: &str = "X-Secret-Token";

/// Who a secret token belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal(pub String);

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn lookup(&self, token: &str) -> Option<Principal>;
}

/// Tokens fixed at startup from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticCredentialStore {
    tokens: HashMap<String, String>,
}

impl StaticCredentialStore {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl CredentialStore for StaticCredentialStore {
    async fn lookup(&self, token: &str) -> Option<Principal> {
        if token.is_empty() {
            return None;
        }
        self.tokens.get(token).cloned().map(Principal)
    }
}

/// Reject requests without a known secret token; the principal is added to
/// the request extensions otherwise
pub async fn require_secret(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    match state.credentials.lookup(token).await {
        Some(principal) => {
            debug!(principal = %principal.0, path = %request.uri().path(), "Authorized request");
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        None => {
            metrics::counter!("uploads.requests.unauthorized").increment(1);
            (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
        }
    }
}
