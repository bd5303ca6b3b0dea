//! Payer identity extractor.
//!
//! The surrounding application authenticates the occupant and forwards their
//! id in `X-User-ID`. Invoices are only ever looked up scoped to this id.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;

pub const PAYER_HEADER: &str = "X-User-ID";

/// The occupant on whose behalf the request is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayerContext {
    pub payer_id: i64,
}

#[async_trait]
impl<S> FromRequestParts<S> for PayerContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(PAYER_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::AuthError(anyhow::anyhow!("Missing X-User-ID header")))?;

        let payer_id = raw.trim().parse::<i64>().map_err(|_| {
            AppError::AuthError(anyhow::anyhow!("X-User-ID must be a numeric user id"))
        })?;

        tracing::Span::current().record("payer_id", payer_id);

        Ok(PayerContext { payer_id })
    }
}
