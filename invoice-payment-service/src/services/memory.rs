//! In-process ledger and configuration store.
//!
//! Same conditional-update semantics as the MongoDB adapters; every operation
//! runs under one write lock, which stands in for single-document atomicity.

use super::repository::{
    GatewayConfigStore, InvoiceLedger, Settlement, SettlementRecord,
};
use crate::error::LedgerError;
use crate::models::{GatewayCredentials, Invoice, PendingCheckout, UnmatchedCallback};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct InMemoryInvoiceLedger {
    invoices: RwLock<HashMap<i64, Invoice>>,
    unmatched: RwLock<Vec<UnmatchedCallback>>,
    pending: RwLock<HashMap<String, PendingCheckout>>,
}

impl InMemoryInvoiceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, invoice: Invoice) {
        self.invoices.write().await.insert(invoice.id, invoice);
    }

    pub async fn unmatched_callbacks(&self) -> Vec<UnmatchedCallback> {
        self.unmatched.read().await.clone()
    }

    pub async fn pending_checkouts(&self) -> Vec<PendingCheckout> {
        self.pending.read().await.values().cloned().collect()
    }

    fn settle(invoice: &mut Invoice, record: &SettlementRecord) -> Settlement {
        invoice.is_paid = true;
        invoice.payment_date = Some(record.paid_at);
        invoice.receipt_code = Some(record.receipt_code.clone());
        invoice.attempt_lease_until = None;
        Settlement::Applied(invoice.clone())
    }
}

#[async_trait]
impl InvoiceLedger for InMemoryInvoiceLedger {
    async fn find_by_id(&self, invoice_id: i64) -> Result<Option<Invoice>, LedgerError> {
        Ok(self.invoices.read().await.get(&invoice_id).cloned())
    }

    async fn find_for_occupant(
        &self,
        invoice_id: i64,
        occupant_id: i64,
    ) -> Result<Option<Invoice>, LedgerError> {
        Ok(self
            .invoices
            .read()
            .await
            .get(&invoice_id)
            .filter(|invoice| invoice.occupant_id == Some(occupant_id))
            .cloned())
    }

    async fn claim_attempt(
        &self,
        invoice_id: i64,
        account_reference: &str,
        now_ms: i64,
        lease_until_ms: i64,
    ) -> Result<bool, LedgerError> {
        let mut invoices = self.invoices.write().await;
        let Some(invoice) = invoices.get_mut(&invoice_id) else {
            return Ok(false);
        };
        let lease_free = invoice
            .attempt_lease_until
            .map_or(true, |until| until < now_ms);
        if invoice.is_paid || !lease_free {
            return Ok(false);
        }
        invoice.attempt_lease_until = Some(lease_until_ms);
        invoice.account_reference = Some(account_reference.to_string());
        Ok(true)
    }

    async fn release_attempt(&self, invoice_id: i64) -> Result<(), LedgerError> {
        if let Some(invoice) = self.invoices.write().await.get_mut(&invoice_id) {
            if !invoice.is_paid {
                invoice.attempt_lease_until = None;
            }
        }
        Ok(())
    }

    async fn record_checkout_request(
        &self,
        invoice_id: i64,
        checkout_request_id: &str,
        merchant_request_id: Option<&str>,
    ) -> Result<bool, LedgerError> {
        let mut invoices = self.invoices.write().await;

        let taken = invoices.values().any(|other| {
            other.id != invoice_id
                && other.checkout_request_id.as_deref() == Some(checkout_request_id)
        });
        if taken {
            return Err(LedgerError::DuplicateCheckoutRequest(
                checkout_request_id.to_string(),
            ));
        }

        match invoices.get_mut(&invoice_id) {
            Some(invoice) if !invoice.is_paid => {
                invoice.checkout_request_id = Some(checkout_request_id.to_string());
                invoice.merchant_request_id = merchant_request_id.map(str::to_string);
                invoice.attempt_lease_until = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn settle_by_checkout_request(
        &self,
        checkout_request_id: &str,
        record: &SettlementRecord,
    ) -> Result<Settlement, LedgerError> {
        let mut invoices = self.invoices.write().await;
        let matched = invoices
            .values_mut()
            .find(|invoice| invoice.checkout_request_id.as_deref() == Some(checkout_request_id));

        Ok(match matched {
            Some(invoice) if invoice.is_paid => Settlement::AlreadyPaid(invoice.clone()),
            Some(invoice) => Self::settle(invoice, record),
            None => Settlement::NotFound,
        })
    }

    async fn settle_by_account_reference(
        &self,
        account_reference: &str,
        record: &SettlementRecord,
    ) -> Result<Settlement, LedgerError> {
        let mut invoices = self.invoices.write().await;
        let matched = invoices
            .values_mut()
            .find(|invoice| invoice.account_reference.as_deref() == Some(account_reference));

        Ok(match matched {
            Some(invoice) if invoice.is_paid => Settlement::AlreadyPaid(invoice.clone()),
            Some(invoice) => Self::settle(invoice, record),
            None => Settlement::NotFound,
        })
    }

    async fn record_unmatched_callback(
        &self,
        callback: UnmatchedCallback,
    ) -> Result<(), LedgerError> {
        let mut unmatched = self.unmatched.write().await;
        match unmatched
            .iter()
            .position(|parked| parked.checkout_request_id == callback.checkout_request_id)
        {
            Some(index) => unmatched[index] = callback,
            None => unmatched.push(callback),
        }
        Ok(())
    }

    async fn take_unmatched_callback(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<UnmatchedCallback>, LedgerError> {
        let mut unmatched = self.unmatched.write().await;
        Ok(unmatched
            .iter()
            .position(|callback| callback.checkout_request_id == checkout_request_id)
            .map(|index| unmatched.remove(index)))
    }

    async fn record_pending_checkout(&self, pending: PendingCheckout) -> Result<(), LedgerError> {
        self.pending
            .write()
            .await
            .insert(pending.checkout_request_id.clone(), pending);
        Ok(())
    }

    async fn find_pending_checkout(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<PendingCheckout>, LedgerError> {
        Ok(self.pending.read().await.get(checkout_request_id).cloned())
    }
}

#[derive(Default)]
pub struct InMemoryGatewayConfigStore {
    configs: RwLock<HashMap<i64, GatewayCredentials>>,
}

impl InMemoryGatewayConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, credentials: GatewayCredentials) {
        self.configs
            .write()
            .await
            .insert(credentials.organization_id, credentials);
    }
}

#[async_trait]
impl GatewayConfigStore for InMemoryGatewayConfigStore {
    async fn find_by_organization(
        &self,
        organization_id: i64,
    ) -> Result<Option<GatewayCredentials>, LedgerError> {
        Ok(self.configs.read().await.get(&organization_id).cloned())
    }
}
