use crate::dtos::{InitiatePaymentRequest, PaymentStatusResponse};
use crate::error::InitiationError;
use crate::middleware::PayerContext;
use crate::services::{InitiatePayment, PendingPayment};
use crate::startup::AppState;
use axum::extract::{Path, State};
use axum::Json;
use service_core::error::AppError;
use validator::Validate;

/// Send an STK push for one of the caller's unpaid invoices.
///
/// Success only means the prompt was sent; the invoice stays unpaid until the
/// gateway calls back.
pub async fn initiate(
    State(state): State<AppState>,
    payer: PayerContext,
    Json(payload): Json<InitiatePaymentRequest>,
) -> Result<Json<PendingPayment>, AppError> {
    payload.validate()?;

    let result = state
        .initiation
        .initiate(InitiatePayment {
            invoice_id: payload.invoice_id,
            payer_id: payer.payer_id,
            phone_number: payload.phone_number,
        })
        .await;

    // The result callback can beat this response; settle it now that the
    // handle is on the invoice or in a pending checkout.
    let sent = match &result {
        Ok(pending) => Some(pending.checkout_request_id.as_str()),
        Err(InitiationError::HandleNotRecorded {
            checkout_request_id,
            ..
        }) => Some(checkout_request_id.as_str()),
        Err(_) => None,
    };
    if let Some(checkout_request_id) = sent {
        state.reconciler.replay_unmatched(checkout_request_id).await;
    }

    Ok(Json(result?))
}

pub async fn payment_status(
    State(state): State<AppState>,
    payer: PayerContext,
    Path(invoice_id): Path<i64>,
) -> Result<Json<PaymentStatusResponse>, AppError> {
    let invoice = state
        .ledger
        .find_for_occupant(invoice_id, payer.payer_id)
        .await
        .map_err(|e| AppError::DatabaseError(e.into()))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice {} not found", invoice_id)))?;

    Ok(Json(invoice.into()))
}
