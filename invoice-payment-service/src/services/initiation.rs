//! Payment initiation: one STK push attempt for one unpaid invoice.
//!
//! The only ledger writes made here are the attempt lease, the account
//! reference and the gateway handle. The paid flag is set exclusively by the
//! callback reconciler.

use super::credentials::CredentialRouter;
use super::daraja::{PushAccepted, PushGateway};
use super::metrics;
use super::repository::InvoiceLedger;
use crate::config::InitiationConfig;
use crate::error::{InitiationError, InvoiceRejection, LedgerError};
use crate::models::{whole_units, Invoice, PendingCheckout, PushPaymentRequest};
use crate::utils::normalize_phone;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct InitiatePayment {
    pub invoice_id: i64,
    /// Authenticated user asking to pay; must occupy the invoiced unit.
    pub payer_id: i64,
    pub phone_number: Option<String>,
}

/// A push accepted by the gateway and awaiting the callback.
#[derive(Debug, Clone, Serialize)]
pub struct PendingPayment {
    pub invoice_id: i64,
    pub checkout_request_id: String,
    pub merchant_request_id: Option<String>,
    pub customer_message: Option<String>,
}

#[derive(Clone)]
pub struct PaymentInitiationService {
    ledger: Arc<dyn InvoiceLedger>,
    router: CredentialRouter,
    gateway: Arc<dyn PushGateway>,
    config: InitiationConfig,
}

impl PaymentInitiationService {
    pub fn new(
        ledger: Arc<dyn InvoiceLedger>,
        router: CredentialRouter,
        gateway: Arc<dyn PushGateway>,
        config: InitiationConfig,
    ) -> Self {
        Self {
            ledger,
            router,
            gateway,
            config,
        }
    }

    #[tracing::instrument(
        skip(self, command),
        fields(invoice_id = command.invoice_id, payer_id = command.payer_id)
    )]
    pub async fn initiate(&self, command: InitiatePayment) -> Result<PendingPayment, InitiationError> {
        let result = self.try_initiate(&command).await;
        match &result {
            Ok(pending) => tracing::info!(
                checkout_request_id = %pending.checkout_request_id,
                "Payment initiated, awaiting callback"
            ),
            Err(e) => tracing::warn!(error = %e, kind = e.kind(), "Payment initiation failed"),
        }
        result
    }

    async fn try_initiate(&self, command: &InitiatePayment) -> Result<PendingPayment, InitiationError> {
        let phone_number = normalize_phone(command.phone_number.as_deref(), &self.config.country_code)?;

        let invoice = self.payable_invoice(command).await?;
        let organization_id = invoice.organization_id;

        let credentials = match self.router.resolve(organization_id).await {
            Ok(credentials) => credentials,
            Err(e) => {
                metrics::record_initiation(organization_id, e.kind());
                return Err(e);
            }
        };

        let account_reference = invoice.account_reference();
        self.claim(&invoice, &account_reference).await?;

        let request = PushPaymentRequest {
            phone_number,
            amount: invoice.amount,
            account_reference,
            description: format!("Payment for Invoice #{}", invoice.id),
            credentials,
        };

        let accepted = match self.push(&request).await {
            Ok(accepted) => accepted,
            Err(e) => {
                // The push may still have reached the payer's phone after a
                // timeout; the user decides whether to try again.
                if let Err(release_err) = self.ledger.release_attempt(invoice.id).await {
                    tracing::error!(error = %release_err, "Failed to release initiation lease");
                }
                metrics::record_initiation(organization_id, e.kind());
                return Err(e);
            }
        };

        let recorded = match self
            .ledger
            .record_checkout_request(
                invoice.id,
                &accepted.checkout_request_id,
                accepted.merchant_request_id.as_deref(),
            )
            .await
        {
            Ok(recorded) => recorded,
            Err(e) => {
                return Err(self
                    .park_unrecorded_push(&invoice, &request.account_reference, &accepted, e)
                    .await)
            }
        };

        if !recorded {
            tracing::error!(
                checkout_request_id = %accepted.checkout_request_id,
                "Invoice was settled while the push was in flight; handle not recorded"
            );
            metrics::record_initiation(organization_id, "settled_in_flight");
            return Err(InitiationError::invalid_state(
                invoice.id,
                InvoiceRejection::AlreadyPaid,
            ));
        }

        metrics::record_initiation(organization_id, "accepted");

        Ok(PendingPayment {
            invoice_id: invoice.id,
            checkout_request_id: accepted.checkout_request_id,
            merchant_request_id: accepted.merchant_request_id,
            customer_message: accepted.customer_message,
        })
    }

    async fn payable_invoice(&self, command: &InitiatePayment) -> Result<Invoice, InitiationError> {
        let invoice = self
            .ledger
            .find_for_occupant(command.invoice_id, command.payer_id)
            .await?
            .ok_or_else(|| {
                InitiationError::invalid_state(command.invoice_id, InvoiceRejection::NotFound)
            })?;

        if invoice.is_paid {
            return Err(InitiationError::invalid_state(
                invoice.id,
                InvoiceRejection::AlreadyPaid,
            ));
        }
        if whole_units(invoice.amount).is_none() {
            return Err(InitiationError::invalid_state(
                invoice.id,
                InvoiceRejection::NothingPayable,
            ));
        }
        Ok(invoice)
    }

    async fn claim(&self, invoice: &Invoice, account_reference: &str) -> Result<(), InitiationError> {
        let now_ms = Utc::now().timestamp_millis();
        let lease_ms = i64::try_from(self.config.attempt_lease.as_millis()).unwrap_or(i64::MAX);
        let lease_until_ms = now_ms.saturating_add(lease_ms);

        if self
            .ledger
            .claim_attempt(invoice.id, account_reference, now_ms, lease_until_ms)
            .await?
        {
            return Ok(());
        }

        // Lost the race: either a callback settled it or another attempt holds the lease.
        let paid = self
            .ledger
            .find_by_id(invoice.id)
            .await?
            .map_or(false, |current| current.is_paid);
        let err = if paid {
            InitiationError::invalid_state(invoice.id, InvoiceRejection::AlreadyPaid)
        } else {
            InitiationError::AttemptInProgress(invoice.id)
        };
        metrics::record_initiation(invoice.organization_id, err.kind());
        Err(err)
    }

    /// The payer already has the prompt. Leave the handle where the callback
    /// can find it and free the invoice for another attempt.
    async fn park_unrecorded_push(
        &self,
        invoice: &Invoice,
        account_reference: &str,
        accepted: &PushAccepted,
        source: LedgerError,
    ) -> InitiationError {
        tracing::error!(
            error = %source,
            checkout_request_id = %accepted.checkout_request_id,
            account_reference,
            "Push accepted but its handle could not be stored on the invoice"
        );

        if let Err(e) = self.ledger.release_attempt(invoice.id).await {
            tracing::error!(error = %e, "Failed to release initiation lease");
        }

        let pending = PendingCheckout {
            checkout_request_id: accepted.checkout_request_id.clone(),
            merchant_request_id: accepted.merchant_request_id.clone(),
            invoice_id: invoice.id,
            account_reference: account_reference.to_string(),
            accepted_at: Utc::now(),
        };
        if let Err(e) = self.ledger.record_pending_checkout(pending).await {
            tracing::error!(
                error = %e,
                checkout_request_id = %accepted.checkout_request_id,
                account_reference,
                "Failed to record pending checkout; its callback will be parked as an orphan"
            );
        }

        metrics::record_initiation(invoice.organization_id, "handle_not_recorded");
        InitiationError::HandleNotRecorded {
            invoice_id: invoice.id,
            checkout_request_id: accepted.checkout_request_id.clone(),
            source,
        }
    }

    async fn push(
        &self,
        request: &PushPaymentRequest,
    ) -> Result<PushAccepted, InitiationError> {
        let credentials = &request.credentials;
        let token = self
            .gateway
            .acquire_token(&credentials.consumer_key, &credentials.consumer_secret)
            .await?;
        Ok(self.gateway.initiate_push_payment(request, &token).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::models::{GatewayCredentials, SenderRole, UnmatchedCallback};
    use crate::services::daraja::AccessToken;
    use crate::services::memory::{InMemoryGatewayConfigStore, InMemoryInvoiceLedger};
    use crate::services::reconciler::{CallbackReconciler, Reconciliation};
    use crate::services::repository::{Settlement, SettlementRecord};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use secrecy::Secret;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Gateway double that records every call it receives.
    #[derive(Default)]
    struct RecordingGateway {
        token_calls: AtomicUsize,
        push_requests: Mutex<Vec<PushPaymentRequest>>,
        fail_push: Option<fn() -> GatewayError>,
    }

    impl RecordingGateway {
        fn calls(&self) -> usize {
            self.token_calls.load(Ordering::SeqCst) + self.push_requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PushGateway for RecordingGateway {
        async fn acquire_token(
            &self,
            _consumer_key: &str,
            _consumer_secret: &Secret<String>,
        ) -> Result<AccessToken, GatewayError> {
            self.token_calls.fetch_add(1, Ordering::SeqCst);
            Ok(AccessToken::new("tok"))
        }

        async fn initiate_push_payment(
            &self,
            request: &PushPaymentRequest,
            _token: &AccessToken,
        ) -> Result<PushAccepted, GatewayError> {
            let attempt = {
                let mut requests = self.push_requests.lock().unwrap();
                requests.push(request.clone());
                requests.len()
            };
            if let Some(fail) = self.fail_push {
                return Err(fail());
            }
            Ok(PushAccepted {
                checkout_request_id: format!("ws_CO_{}", attempt),
                merchant_request_id: Some(format!("mr-{}", attempt)),
                customer_message: Some("Success. Request accepted for processing".to_string()),
                raw_response: serde_json::json!({ "ResponseCode": "0" }),
            })
        }
    }

    fn invoice(id: i64) -> Invoice {
        Invoice {
            id,
            unit_id: 3,
            organization_id: 1,
            occupant_id: Some(9),
            amount: dec!(15000.00),
            due_date: NaiveDate::from_ymd_opt(2026, 11, 1).unwrap(),
            is_paid: false,
            payment_date: None,
            receipt_code: None,
            checkout_request_id: None,
            merchant_request_id: None,
            account_reference: None,
            attempt_lease_until: None,
            description: "Monthly Service Charge".to_string(),
            sender_role: SenderRole::Organization,
        }
    }

    fn credentials(organization_id: i64) -> GatewayCredentials {
        GatewayCredentials {
            organization_id,
            consumer_key: "ck".to_string(),
            consumer_secret: Secret::new("cs".to_string()),
            shortcode: "174379".to_string(),
            passkey: Secret::new("pk".to_string()),
            paybill_number: String::new(),
            configured: true,
        }
    }

    struct Fixture {
        ledger: Arc<InMemoryInvoiceLedger>,
        gateway: Arc<RecordingGateway>,
        service: PaymentInitiationService,
    }

    async fn fixture(gateway: RecordingGateway, configured: bool) -> Fixture {
        let ledger = Arc::new(InMemoryInvoiceLedger::new());
        ledger.insert(invoice(42)).await;

        let store = Arc::new(InMemoryGatewayConfigStore::new());
        if configured {
            store.insert(credentials(1)).await;
        }

        let gateway = Arc::new(gateway);
        let service = PaymentInitiationService::new(
            ledger.clone(),
            CredentialRouter::new(store),
            gateway.clone(),
            InitiationConfig {
                country_code: "254".to_string(),
                attempt_lease: Duration::from_secs(90),
            },
        );
        Fixture {
            ledger,
            gateway,
            service,
        }
    }

    fn command(phone: Option<&str>) -> InitiatePayment {
        InitiatePayment {
            invoice_id: 42,
            payer_id: 9,
            phone_number: phone.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn success_records_handle_without_paying() {
        let f = fixture(RecordingGateway::default(), true).await;

        let pending = f.service.initiate(command(Some("0712345678"))).await.unwrap();
        assert_eq!(pending.checkout_request_id, "ws_CO_1");

        let sent = f.gateway.push_requests.lock().unwrap()[0].clone();
        assert_eq!(sent.phone_number, "254712345678");
        assert_eq!(sent.account_reference, "INV-42");
        assert_eq!(sent.amount, dec!(15000.00));

        let stored = f.ledger.find_by_id(42).await.unwrap().unwrap();
        assert!(!stored.is_paid);
        assert!(stored.payment_date.is_none());
        assert_eq!(stored.checkout_request_id.as_deref(), Some("ws_CO_1"));
        assert_eq!(stored.account_reference.as_deref(), Some("INV-42"));
        assert!(stored.attempt_lease_until.is_none());
    }

    #[tokio::test]
    async fn empty_phone_makes_no_outbound_calls() {
        let f = fixture(RecordingGateway::default(), true).await;

        let result = f.service.initiate(command(Some(""))).await;
        assert!(matches!(result, Err(InitiationError::MissingContact)));
        let result = f.service.initiate(command(None)).await;
        assert!(matches!(result, Err(InitiationError::MissingContact)));
        assert_eq!(f.gateway.calls(), 0);
    }

    #[tokio::test]
    async fn paid_invoice_is_rejected_before_any_call() {
        let f = fixture(RecordingGateway::default(), true).await;
        let mut paid = invoice(42);
        paid.is_paid = true;
        paid.payment_date = Some(Utc::now());
        paid.receipt_code = Some("QGR7XYZ123".to_string());
        f.ledger.insert(paid).await;

        let result = f.service.initiate(command(Some("0712345678"))).await;
        assert!(matches!(
            result,
            Err(InitiationError::InvalidInvoiceState {
                reason: InvoiceRejection::AlreadyPaid,
                ..
            })
        ));
        assert_eq!(f.gateway.calls(), 0);
    }

    #[tokio::test]
    async fn invoice_of_another_tenant_is_not_found() {
        let f = fixture(RecordingGateway::default(), true).await;

        let mut foreign = command(Some("0712345678"));
        foreign.payer_id = 10;
        let result = f.service.initiate(foreign).await;
        assert!(matches!(
            result,
            Err(InitiationError::InvalidInvoiceState {
                reason: InvoiceRejection::NotFound,
                ..
            })
        ));
        assert_eq!(f.gateway.calls(), 0);
    }

    #[tokio::test]
    async fn missing_configuration_makes_no_outbound_calls() {
        let f = fixture(RecordingGateway::default(), false).await;

        let result = f.service.initiate(command(Some("0712345678"))).await;
        assert!(matches!(result, Err(InitiationError::ConfigurationMissing(1))));
        assert_eq!(f.gateway.calls(), 0);

        let stored = f.ledger.find_by_id(42).await.unwrap().unwrap();
        assert!(stored.account_reference.is_none());
    }

    #[tokio::test]
    async fn gateway_failure_releases_lease_and_keeps_invoice_unpaid() {
        let gateway = RecordingGateway {
            fail_push: Some(|| GatewayError::NetworkFailure("timed out".to_string())),
            ..Default::default()
        };
        let f = fixture(gateway, true).await;

        let result = f.service.initiate(command(Some("0712345678"))).await;
        assert!(matches!(
            result,
            Err(InitiationError::Gateway(GatewayError::NetworkFailure(_)))
        ));
        // Exactly one push, no automatic retry.
        assert_eq!(f.gateway.push_requests.lock().unwrap().len(), 1);

        let stored = f.ledger.find_by_id(42).await.unwrap().unwrap();
        assert!(!stored.is_paid);
        assert!(stored.checkout_request_id.is_none());
        assert!(stored.attempt_lease_until.is_none());
    }

    #[tokio::test]
    async fn live_lease_blocks_concurrent_attempt() {
        let f = fixture(RecordingGateway::default(), true).await;
        let now = Utc::now().timestamp_millis();
        f.ledger
            .claim_attempt(42, "INV-42", now, now + 60_000)
            .await
            .unwrap();

        let result = f.service.initiate(command(Some("0712345678"))).await;
        assert!(matches!(result, Err(InitiationError::AttemptInProgress(42))));
        assert_eq!(f.gateway.calls(), 0);
    }

    #[tokio::test]
    async fn retry_overwrites_previous_handle() {
        let f = fixture(RecordingGateway::default(), true).await;

        f.service.initiate(command(Some("0712345678"))).await.unwrap();
        let second = f.service.initiate(command(Some("0712345678"))).await.unwrap();

        assert_eq!(second.checkout_request_id, "ws_CO_2");
        let stored = f.ledger.find_by_id(42).await.unwrap().unwrap();
        assert_eq!(stored.checkout_request_id.as_deref(), Some("ws_CO_2"));
    }

    #[tokio::test]
    async fn concurrent_attempts_record_a_single_handle() {
        let f = fixture(RecordingGateway::default(), true).await;

        let (a, b) = tokio::join!(
            f.service.initiate(command(Some("0712345678"))),
            f.service.initiate(command(Some("0712345678")))
        );
        let succeeded = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
        assert!(succeeded >= 1);

        let stored = f.ledger.find_by_id(42).await.unwrap().unwrap();
        let handle = stored.checkout_request_id.unwrap();
        let winners: Vec<_> = [a, b]
            .into_iter()
            .filter_map(Result::ok)
            .map(|pending| pending.checkout_request_id)
            .collect();
        assert!(winners.contains(&handle));
    }

    /// Ledger whose handle writes always fail, as when the database drops
    /// between the push and the update.
    struct HandleWriteFails(Arc<InMemoryInvoiceLedger>);

    #[async_trait]
    impl InvoiceLedger for HandleWriteFails {
        async fn find_by_id(&self, invoice_id: i64) -> Result<Option<Invoice>, LedgerError> {
            self.0.find_by_id(invoice_id).await
        }

        async fn find_for_occupant(
            &self,
            invoice_id: i64,
            occupant_id: i64,
        ) -> Result<Option<Invoice>, LedgerError> {
            self.0.find_for_occupant(invoice_id, occupant_id).await
        }

        async fn claim_attempt(
            &self,
            invoice_id: i64,
            account_reference: &str,
            now_ms: i64,
            lease_until_ms: i64,
        ) -> Result<bool, LedgerError> {
            self.0
                .claim_attempt(invoice_id, account_reference, now_ms, lease_until_ms)
                .await
        }

        async fn release_attempt(&self, invoice_id: i64) -> Result<(), LedgerError> {
            self.0.release_attempt(invoice_id).await
        }

        async fn record_checkout_request(
            &self,
            _invoice_id: i64,
            checkout_request_id: &str,
            _merchant_request_id: Option<&str>,
        ) -> Result<bool, LedgerError> {
            Err(LedgerError::DuplicateCheckoutRequest(
                checkout_request_id.to_string(),
            ))
        }

        async fn settle_by_checkout_request(
            &self,
            checkout_request_id: &str,
            record: &SettlementRecord,
        ) -> Result<Settlement, LedgerError> {
            self.0.settle_by_checkout_request(checkout_request_id, record).await
        }

        async fn settle_by_account_reference(
            &self,
            account_reference: &str,
            record: &SettlementRecord,
        ) -> Result<Settlement, LedgerError> {
            self.0.settle_by_account_reference(account_reference, record).await
        }

        async fn record_unmatched_callback(
            &self,
            callback: UnmatchedCallback,
        ) -> Result<(), LedgerError> {
            self.0.record_unmatched_callback(callback).await
        }

        async fn take_unmatched_callback(
            &self,
            checkout_request_id: &str,
        ) -> Result<Option<UnmatchedCallback>, LedgerError> {
            self.0.take_unmatched_callback(checkout_request_id).await
        }

        async fn record_pending_checkout(
            &self,
            pending: PendingCheckout,
        ) -> Result<(), LedgerError> {
            self.0.record_pending_checkout(pending).await
        }

        async fn find_pending_checkout(
            &self,
            checkout_request_id: &str,
        ) -> Result<Option<PendingCheckout>, LedgerError> {
            self.0.find_pending_checkout(checkout_request_id).await
        }
    }

    #[tokio::test]
    async fn unrecorded_handle_releases_lease_and_stays_matchable() {
        let inner = Arc::new(InMemoryInvoiceLedger::new());
        inner.insert(invoice(42)).await;
        let store = Arc::new(InMemoryGatewayConfigStore::new());
        store.insert(credentials(1)).await;
        let ledger = Arc::new(HandleWriteFails(inner.clone()));
        let service = PaymentInitiationService::new(
            ledger.clone(),
            CredentialRouter::new(store),
            Arc::new(RecordingGateway::default()),
            InitiationConfig {
                country_code: "254".to_string(),
                attempt_lease: Duration::from_secs(90),
            },
        );

        let result = service.initiate(command(Some("0712345678"))).await;
        let Err(InitiationError::HandleNotRecorded {
            invoice_id,
            checkout_request_id,
            ..
        }) = result
        else {
            panic!("expected the unrecorded handle to be reported");
        };
        assert_eq!(invoice_id, 42);
        assert_eq!(checkout_request_id, "ws_CO_1");

        let stored = inner.find_by_id(42).await.unwrap().unwrap();
        assert!(stored.attempt_lease_until.is_none());
        assert!(stored.checkout_request_id.is_none());

        let pending = inner.find_pending_checkout("ws_CO_1").await.unwrap().unwrap();
        assert_eq!(pending.invoice_id, 42);
        assert_eq!(pending.account_reference, "INV-42");
        assert_eq!(pending.merchant_request_id.as_deref(), Some("mr-1"));

        let callback = serde_json::to_vec(&serde_json::json!({
            "Body": { "stkCallback": {
                "MerchantRequestID": "mr-1",
                "CheckoutRequestID": "ws_CO_1",
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": { "Item": [
                    { "Name": "Amount", "Value": 15000 },
                    { "Name": "MpesaReceiptNumber", "Value": "QGR7LOST01" }
                ]}
            }}
        }))
        .unwrap();
        let outcome = CallbackReconciler::new(ledger).reconcile(&callback).await;
        assert!(matches!(outcome, Ok(Reconciliation::Paid(_))));

        let settled = inner.find_by_id(42).await.unwrap().unwrap();
        assert!(settled.is_paid);
        assert_eq!(settled.receipt_code.as_deref(), Some("QGR7LOST01"));
        assert!(inner.unmatched_callbacks().await.is_empty());
    }
}
