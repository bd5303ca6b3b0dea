//! Error taxonomy for the initiation and callback paths.
//!
//! Initiation errors reach the paying user through [`AppError`]. Callback errors
//! never leave the service: the webhook always acknowledges.

use service_core::error::AppError;
use thiserror::Error;

/// Why an invoice cannot start a payment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceRejection {
    /// Missing, or not billed to the caller's unit.
    NotFound,
    AlreadyPaid,
    /// Amount is below one whole currency unit.
    NothingPayable,
}

impl std::fmt::Display for InvoiceRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            InvoiceRejection::NotFound => "invoice not found",
            InvoiceRejection::AlreadyPaid => "invoice is already paid",
            InvoiceRejection::NothingPayable => "invoice has no payable amount",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway authentication failed: {0}")]
    AuthFailure(String),

    #[error("gateway rejected the payment request ({code}): {message}")]
    GatewayRejected { code: String, message: String },

    #[error("gateway unreachable: {0}")]
    NetworkFailure(String),
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] mongodb::bson::ser::Error),

    #[error("checkout request {0} is already recorded on another invoice")]
    DuplicateCheckoutRequest(String),
}

#[derive(Debug, Error)]
pub enum InitiationError {
    #[error("no phone number on file; add one to your profile to pay by M-Pesa")]
    MissingContact,

    #[error("phone number '{0}' is not a valid mobile number")]
    InvalidContact(String),

    #[error("invoice {invoice_id} cannot be paid: {reason}")]
    InvalidInvoiceState {
        invoice_id: i64,
        reason: InvoiceRejection,
    },

    #[error("a payment request for invoice {0} is already in progress")]
    AttemptInProgress(i64),

    #[error("M-Pesa payments are not configured for organization {0}")]
    ConfigurationMissing(i64),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// The payer has the prompt but the invoice does not know its handle.
    #[error("payment request {checkout_request_id} for invoice {invoice_id} was sent but could not be recorded")]
    HandleNotRecorded {
        invoice_id: i64,
        checkout_request_id: String,
        #[source]
        source: LedgerError,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl InitiationError {
    pub fn invalid_state(invoice_id: i64, reason: InvoiceRejection) -> Self {
        InitiationError::InvalidInvoiceState { invoice_id, reason }
    }

    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            InitiationError::MissingContact => "missing_contact",
            InitiationError::InvalidContact(_) => "invalid_contact",
            InitiationError::InvalidInvoiceState { .. } => "invalid_invoice_state",
            InitiationError::AttemptInProgress(_) => "attempt_in_progress",
            InitiationError::ConfigurationMissing(_) => "configuration_missing",
            InitiationError::Gateway(GatewayError::AuthFailure(_)) => "auth_failure",
            InitiationError::Gateway(GatewayError::GatewayRejected { .. }) => "gateway_rejected",
            InitiationError::Gateway(GatewayError::NetworkFailure(_)) => "network_failure",
            InitiationError::HandleNotRecorded { .. } => "handle_not_recorded",
            InitiationError::Ledger(_) => "ledger_error",
        }
    }
}

impl From<InitiationError> for AppError {
    fn from(err: InitiationError) -> Self {
        let message = err.to_string();
        match err {
            InitiationError::MissingContact | InitiationError::InvalidContact(_) => {
                AppError::BadRequest(anyhow::anyhow!(message))
            }
            InitiationError::InvalidInvoiceState {
                reason: InvoiceRejection::NotFound,
                ..
            } => AppError::NotFound(anyhow::anyhow!(message)),
            InitiationError::InvalidInvoiceState { .. } | InitiationError::AttemptInProgress(_) => {
                AppError::Conflict(anyhow::anyhow!(message))
            }
            InitiationError::ConfigurationMissing(_) => {
                AppError::UnprocessableEntity(anyhow::anyhow!(message))
            }
            InitiationError::Gateway(_) => AppError::BadGateway(message),
            InitiationError::HandleNotRecorded { source, .. } | InitiationError::Ledger(source) => {
                AppError::DatabaseError(source.into())
            }
        }
    }
}

/// Outcomes of a callback delivery that leave the ledger untouched.
#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("malformed callback: {0}")]
    MalformedCallback(String),

    #[error("no invoice matches checkout request {0}")]
    OrphanCallback(String),

    #[error("invoice {0} was already reconciled")]
    AlreadyReconciled(i64),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl CallbackError {
    pub fn kind(&self) -> &'static str {
        match self {
            CallbackError::MalformedCallback(_) => "malformed",
            CallbackError::OrphanCallback(_) => "orphan",
            CallbackError::AlreadyReconciled(_) => "already_reconciled",
            CallbackError::Ledger(_) => "ledger_error",
        }
    }
}
