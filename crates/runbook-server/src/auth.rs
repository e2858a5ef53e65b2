use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Query, Request, State},
    http::{StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use runbook_core::config::OperatorConfig;
use serde::Deserialize;

use crate::coordinator::Caller;

/// Token → caller table built from the configured operators.
#[derive(Debug, Clone, Default)]
pub struct Operators {
    by_token: HashMap<String, Caller>,
}

impl Operators {
    pub fn from_config(operators: &[OperatorConfig]) -> Self {
        let by_token = operators
            .iter()
            .filter(|op| !op.token.is_empty())
            .map(|op| {
                (
                    op.token.clone(),
                    Caller {
                        name: op.name.clone(),
                        tier: op.tier,
                    },
                )
            })
            .collect();
        Self { by_token }
    }

    pub fn resolve(&self, token: &str) -> Option<&Caller> {
        self.by_token.get(token)
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }
}

/// Axum middleware that resolves the caller from an operator token.
///
/// The token is read from `Authorization: Bearer <token>` first, then from a
/// `?token=` query parameter (browsers cannot set headers on EventSource).
/// On success the [`Caller`] is inserted into request extensions; otherwise
/// the request is answered with a JSON 401.
pub async fn auth_middleware(
    State(operators): State<Arc<Operators>>,
    mut req: Request,
    next: Next,
) -> Response {
    let token = bearer_token(&req).or_else(|| query_token(req.uri()));

    let caller = token.and_then(|t| operators.resolve(&t).cloned());
    match caller {
        Some(caller) => {
            req.extensions_mut().insert(caller);
            next.run(req).await
        }
        None => {
            tracing::debug!(path = %req.uri().path(), "rejecting unauthenticated request");
            (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": "unauthorized" })),
            )
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn bearer_token(req: &Request) -> Option<String> {
    req.headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// The percent-decoded `?token=` value, if any.
fn query_token(uri: &Uri) -> Option<String> {
    let Query(query) = Query::<TokenQuery>::try_from_uri(uri).ok()?;
    query.token.filter(|t| !t.is_empty())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
