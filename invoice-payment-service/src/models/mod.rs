use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};

/// A billing obligation owed by the occupant of a unit.
///
/// Invoices are created by the property-management application; this service
/// only writes the payment-tracking fields.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Invoice {
    #[serde(rename = "_id")]
    pub id: i64,
    pub unit_id: i64,
    pub organization_id: i64,
    /// Current tenant of the unit, the only user allowed to pay.
    pub occupant_id: Option<i64>,
    pub amount: Decimal,
    pub due_date: NaiveDate,
    pub is_paid: bool,
    pub payment_date: Option<DateTime<Utc>>,
    /// M-Pesa receipt number from the success callback.
    pub receipt_code: Option<String>,
    /// Gateway-issued `CheckoutRequestID` of the latest accepted push.
    pub checkout_request_id: Option<String>,
    pub merchant_request_id: Option<String>,
    /// Written before the outbound call; a pending checkout for a push whose
    /// handle was never persisted settles through it.
    pub account_reference: Option<String>,
    /// Unix millis until which an initiation attempt owns this invoice.
    pub attempt_lease_until: Option<i64>,
    pub description: String,
    pub sender_role: SenderRole,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SenderRole {
    Organization,
    Landlord,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceState {
    Unpaid,
    Pending,
    Paid,
}

impl Invoice {
    pub fn state(&self) -> InvoiceState {
        if self.is_paid {
            InvoiceState::Paid
        } else if self.checkout_request_id.is_some() {
            InvoiceState::Pending
        } else {
            InvoiceState::Unpaid
        }
    }

    pub fn account_reference(&self) -> String {
        account_reference_for(self.id)
    }
}

pub fn account_reference_for(invoice_id: i64) -> String {
    format!("INV-{}", invoice_id)
}

/// Amount in whole currency units as the gateway accepts it.
///
/// Fractional units are truncated toward zero (15000.99 becomes 15000).
/// Returns `None` when nothing payable remains.
pub fn whole_units(amount: Decimal) -> Option<u64> {
    amount.trunc().to_u64().filter(|units| *units > 0)
}

/// Per-organization Daraja credential bundle.
#[derive(Debug, Deserialize, Clone)]
pub struct GatewayCredentials {
    pub organization_id: i64,
    pub consumer_key: String,
    pub consumer_secret: Secret<String>,
    pub shortcode: String,
    pub passkey: Secret<String>,
    /// Receiving paybill; the shortcode is used when empty.
    #[serde(default)]
    pub paybill_number: String,
    #[serde(default)]
    pub configured: bool,
}

impl GatewayCredentials {
    /// True when the organization finished setup and every field the push
    /// protocol needs is present.
    pub fn is_usable(&self) -> bool {
        self.configured
            && !self.consumer_key.trim().is_empty()
            && !self.consumer_secret.expose_secret().trim().is_empty()
            && !self.shortcode.trim().is_empty()
            && !self.passkey.expose_secret().trim().is_empty()
    }

    pub fn party_b(&self) -> &str {
        if self.paybill_number.trim().is_empty() {
            &self.shortcode
        } else {
            &self.paybill_number
        }
    }
}

/// One push-payment attempt. Never persisted.
#[derive(Debug, Clone)]
pub struct PushPaymentRequest {
    /// International format, digits only (`2547XXXXXXXX`).
    pub phone_number: String,
    pub amount: Decimal,
    pub account_reference: String,
    pub description: String,
    pub credentials: GatewayCredentials,
}

/// Push the gateway accepted whose handle could not be stored on the invoice.
///
/// Lets a later callback carrying that handle find its invoice.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PendingCheckout {
    pub checkout_request_id: String,
    pub merchant_request_id: Option<String>,
    pub invoice_id: i64,
    pub account_reference: String,
    pub accepted_at: DateTime<Utc>,
}

/// Successful callback delivery whose handle matched no invoice.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UnmatchedCallback {
    pub checkout_request_id: String,
    pub merchant_request_id: Option<String>,
    pub receipt_code: Option<String>,
    pub amount: Option<String>,
    pub payload: String,
    pub received_at: DateTime<Utc>,
}
