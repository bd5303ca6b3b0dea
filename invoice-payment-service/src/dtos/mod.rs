use crate::models::{Invoice, InvoiceState};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct InitiatePaymentRequest {
    #[validate(range(min = 1))]
    pub invoice_id: i64,
    /// Number the payment prompt is sent to; there is no stored fallback.
    #[serde(default)]
    pub phone_number: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PaymentStatusResponse {
    pub invoice_id: i64,
    pub state: InvoiceState,
    pub amount: Decimal,
    pub receipt_code: Option<String>,
    pub payment_date: Option<DateTime<Utc>>,
}

impl From<Invoice> for PaymentStatusResponse {
    fn from(invoice: Invoice) -> Self {
        Self {
            invoice_id: invoice.id,
            state: invoice.state(),
            amount: invoice.amount,
            receipt_code: invoice.receipt_code,
            payment_date: invoice.payment_date,
        }
    }
}
