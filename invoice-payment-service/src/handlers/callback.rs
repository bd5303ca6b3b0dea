use crate::services::{metrics, CallbackAck};
use crate::startup::AppState;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;

/// Largest callback body handed to the reconciler. Real deliveries are a few
/// hundred bytes.
pub const MAX_CALLBACK_BYTES: usize = 64 * 1024;

/// Why a callback body never reached the reconciler.
enum UnreadableBody {
    TooLarge(usize),
    Interrupted(axum::Error),
}

/// Daraja STK result webhook.
///
/// The body is taken raw so that malformed deliveries still reach the
/// reconciler and get logged. Oversized or interrupted bodies are logged and
/// acknowledged as well.
pub async fn stk_callback(State(state): State<AppState>, body: Body) -> Json<CallbackAck> {
    match read_capped(body, MAX_CALLBACK_BYTES).await {
        Ok(body) => Json(state.reconciler.handle(&body).await),
        Err(UnreadableBody::TooLarge(size)) => {
            tracing::warn!(
                size,
                limit = MAX_CALLBACK_BYTES,
                "Callback body over size limit; acknowledging without processing"
            );
            metrics::record_callback("oversized");
            Json(CallbackAck::accepted())
        }
        Err(UnreadableBody::Interrupted(e)) => {
            tracing::warn!(error = %e, "Callback body could not be read; acknowledging delivery");
            metrics::record_callback("unreadable");
            Json(CallbackAck::accepted())
        }
    }
}

/// Buffer at most `limit` bytes. The rest of an oversized body is read and
/// discarded so the connection stays usable for the acknowledgement.
async fn read_capped(body: Body, limit: usize) -> Result<Bytes, UnreadableBody> {
    let mut stream = body.into_data_stream();
    let mut buffer = Vec::new();
    let mut size = 0usize;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(UnreadableBody::Interrupted)?;
        size = size.saturating_add(chunk.len());
        if size <= limit {
            buffer.extend_from_slice(&chunk);
        }
    }

    if size > limit {
        return Err(UnreadableBody::TooLarge(size));
    }
    Ok(Bytes::from(buffer))
}

/// Response for a callback whose processing panicked.
pub fn acknowledge_after_panic(_panic: Box<dyn std::any::Any + Send + 'static>) -> Response {
    tracing::error!("Callback handler panicked; acknowledging delivery");
    Json(CallbackAck::accepted()).into_response()
}
