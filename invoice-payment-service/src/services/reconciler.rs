//! STK callback reconciliation.
//!
//! The only code path that marks an invoice paid. Deliveries may repeat, arrive
//! before the initiating request returns, or carry a handle that only exists
//! as a pending checkout. The gateway always gets an acknowledgement.

use super::metrics;
use super::repository::{InvoiceLedger, Settlement, SettlementRecord};
use crate::error::CallbackError;
use crate::models::{whole_units, Invoice, UnmatchedCallback};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const RECEIPT_ITEM: &str = "MpesaReceiptNumber";
pub const AMOUNT_ITEM: &str = "Amount";
pub const PHONE_ITEM: &str = "PhoneNumber";

/// Body the gateway expects back for every delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallbackAck {
    #[serde(rename = "ResultCode")]
    pub result_code: i32,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
}

impl CallbackAck {
    pub fn accepted() -> Self {
        Self {
            result_code: 0,
            result_desc: "Accepted".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CallbackEnvelope {
    #[serde(rename = "Body")]
    body: CallbackBody,
}

#[derive(Debug, Deserialize)]
struct CallbackBody {
    #[serde(rename = "stkCallback")]
    stk_callback: StkCallback,
}

/// The `stkCallback` object of a delivery.
#[derive(Debug, Clone, Deserialize)]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID", default)]
    pub merchant_request_id: Option<String>,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResultCode")]
    pub result_code: serde_json::Value,
    #[serde(rename = "ResultDesc", default)]
    pub result_desc: Option<String>,
    #[serde(rename = "CallbackMetadata", default)]
    pub callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    pub items: Vec<MetadataItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataItem {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value", default)]
    pub value: Option<serde_json::Value>,
}

impl StkCallback {
    /// Parse a raw delivery. Anything not shaped like a callback is malformed.
    pub fn parse(body: &[u8]) -> Result<Self, CallbackError> {
        let envelope: CallbackEnvelope = serde_json::from_slice(body)
            .map_err(|e| CallbackError::MalformedCallback(e.to_string()))?;
        let callback = envelope.body.stk_callback;
        if callback.checkout_request_id.trim().is_empty() {
            return Err(CallbackError::MalformedCallback(
                "empty CheckoutRequestID".to_string(),
            ));
        }
        callback.result_code()?;
        Ok(callback)
    }

    /// `ResultCode` as an integer; Daraja has sent both numbers and strings.
    pub fn result_code(&self) -> Result<i64, CallbackError> {
        match &self.result_code {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| {
            CallbackError::MalformedCallback(format!("unusable ResultCode {}", self.result_code))
        })
    }

    /// Metadata value by item name. Item order is not part of the contract.
    pub fn metadata(&self, name: &str) -> Option<String> {
        self.callback_metadata
            .as_ref()?
            .items
            .iter()
            .find(|item| item.name == name)
            .and_then(|item| match item.value.as_ref()? {
                serde_json::Value::String(s) => Some(s.trim().to_string()),
                serde_json::Value::Null => None,
                other => Some(other.to_string()),
            })
            .filter(|value| !value.is_empty())
    }
}

/// What a delivery did to the ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    Paid(Invoice),
    /// Non-zero result code (cancelled, timed out, insufficient funds).
    PaymentFailed { result_code: i64, reason: String },
}

#[derive(Clone)]
pub struct CallbackReconciler {
    ledger: Arc<dyn InvoiceLedger>,
}

impl CallbackReconciler {
    pub fn new(ledger: Arc<dyn InvoiceLedger>) -> Self {
        Self { ledger }
    }

    /// Process one delivery and produce the acknowledgement. Never fails.
    pub async fn handle(&self, body: &[u8]) -> CallbackAck {
        match self.reconcile(body).await {
            Ok(Reconciliation::Paid(invoice)) => {
                metrics::record_callback("paid");
                if let Some(units) = whole_units(invoice.amount) {
                    metrics::record_settled_amount(invoice.organization_id, units);
                }
            }
            Ok(Reconciliation::PaymentFailed { .. }) => metrics::record_callback("payment_failed"),
            Err(e) => {
                match &e {
                    CallbackError::AlreadyReconciled(_) => {
                        tracing::info!(error = %e, "Duplicate callback delivery ignored")
                    }
                    CallbackError::OrphanCallback(_) | CallbackError::MalformedCallback(_) => {
                        tracing::warn!(
                            error = %e,
                            payload = %String::from_utf8_lossy(body),
                            "Callback needs manual investigation"
                        )
                    }
                    CallbackError::Ledger(_) => {
                        tracing::error!(
                            error = %e,
                            payload = %String::from_utf8_lossy(body),
                            "Callback could not be applied"
                        )
                    }
                }
                metrics::record_callback(e.kind());
            }
        }
        CallbackAck::accepted()
    }

    /// Re-run a callback that arrived before its handle was recorded.
    ///
    /// Called once initiation has stored `checkout_request_id`.
    pub async fn replay_unmatched(&self, checkout_request_id: &str) {
        match self.ledger.take_unmatched_callback(checkout_request_id).await {
            Ok(Some(parked)) => {
                tracing::info!(checkout_request_id, "Replaying callback that beat its initiation");
                self.handle(parked.payload.as_bytes()).await;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(error = %e, checkout_request_id, "Failed to look up parked callback")
            }
        }
    }

    #[tracing::instrument(skip_all, fields(checkout_request_id))]
    pub async fn reconcile(&self, body: &[u8]) -> Result<Reconciliation, CallbackError> {
        let callback = StkCallback::parse(body)?;
        tracing::Span::current().record("checkout_request_id", callback.checkout_request_id.as_str());

        let result_code = callback.result_code()?;
        if result_code != 0 {
            let reason = callback
                .result_desc
                .clone()
                .unwrap_or_else(|| "no description".to_string());
            tracing::info!(result_code, reason = %reason, "Payment failed or cancelled by payer");
            return Ok(Reconciliation::PaymentFailed {
                result_code,
                reason,
            });
        }

        let receipt_code = callback.metadata(RECEIPT_ITEM).ok_or_else(|| {
            CallbackError::MalformedCallback(format!("success callback without {}", RECEIPT_ITEM))
        })?;
        let record = SettlementRecord {
            receipt_code,
            paid_at: Utc::now(),
        };

        let mut settlement = self.settle(&callback.checkout_request_id, &record).await?;

        if settlement == Settlement::NotFound {
            self.ledger
                .record_unmatched_callback(UnmatchedCallback {
                    checkout_request_id: callback.checkout_request_id.clone(),
                    merchant_request_id: callback.merchant_request_id.clone(),
                    receipt_code: Some(record.receipt_code.clone()),
                    amount: callback.metadata(AMOUNT_ITEM),
                    payload: String::from_utf8_lossy(body).into_owned(),
                    received_at: record.paid_at,
                })
                .await?;

            // Initiation may have stored the handle and looked for parked
            // callbacks between the first lookup and the park.
            settlement = self.settle(&callback.checkout_request_id, &record).await?;
            if settlement != Settlement::NotFound {
                if let Err(e) = self
                    .ledger
                    .take_unmatched_callback(&callback.checkout_request_id)
                    .await
                {
                    tracing::error!(error = %e, "Failed to clear parked callback after settling");
                }
            }
        }

        match settlement {
            Settlement::Applied(invoice) => {
                check_amount(&callback, &invoice);
                tracing::info!(
                    invoice_id = invoice.id,
                    receipt_code = %record.receipt_code,
                    "Invoice marked as paid"
                );
                Ok(Reconciliation::Paid(invoice))
            }
            Settlement::AlreadyPaid(invoice) => Err(CallbackError::AlreadyReconciled(invoice.id)),
            Settlement::NotFound => Err(CallbackError::OrphanCallback(callback.checkout_request_id)),
        }
    }

    /// Settle by the handle stored on the invoice, then by a pending checkout.
    async fn settle(
        &self,
        checkout_request_id: &str,
        record: &SettlementRecord,
    ) -> Result<Settlement, CallbackError> {
        let settlement = self
            .ledger
            .settle_by_checkout_request(checkout_request_id, record)
            .await?;
        if settlement != Settlement::NotFound {
            return Ok(settlement);
        }

        let Some(pending) = self.ledger.find_pending_checkout(checkout_request_id).await? else {
            return Ok(Settlement::NotFound);
        };
        let settlement = self
            .ledger
            .settle_by_account_reference(&pending.account_reference, record)
            .await?;
        if matches!(settlement, Settlement::Applied(_)) {
            tracing::warn!(
                invoice_id = pending.invoice_id,
                account_reference = %pending.account_reference,
                "Settled through pending checkout; handle was never stored on the invoice"
            );
        }
        Ok(settlement)
    }
}

/// The payment is recorded regardless; a mismatch is only reported.
fn check_amount(callback: &StkCallback, invoice: &Invoice) {
    let Some(reported) = callback.metadata(AMOUNT_ITEM) else {
        return;
    };
    let expected = whole_units(invoice.amount);
    let received = reported
        .parse::<rust_decimal::Decimal>()
        .ok()
        .and_then(whole_units);
    if expected != received {
        tracing::warn!(
            invoice_id = invoice.id,
            expected = ?expected,
            received = %reported,
            phone = ?callback.metadata(PHONE_ITEM),
            "Callback amount differs from invoice amount"
        );
    }
}
