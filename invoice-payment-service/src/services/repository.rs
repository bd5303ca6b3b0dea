//! Invoice ledger and gateway configuration storage.
//!
//! Every write is a single-document conditional update guarded by
//! `is_paid == false`, so a paid invoice can never be re-paid or un-paid and
//! concurrent initiations and callbacks cannot lose each other's updates.

use crate::error::LedgerError;
use crate::models::{GatewayCredentials, Invoice, PendingCheckout, UnmatchedCallback};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{FindOneAndUpdateOptions, IndexOptions, ReplaceOptions, ReturnDocument};
use mongodb::{
    bson::{doc, Document},
    Collection, Database, IndexModel,
};

/// Result of a conditional settle.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    /// This call flipped the invoice to paid.
    Applied(Invoice),
    /// The invoice was paid before this call; nothing was written.
    AlreadyPaid(Invoice),
    NotFound,
}

/// Fields written when an invoice is settled.
#[derive(Debug, Clone)]
pub struct SettlementRecord {
    pub receipt_code: String,
    pub paid_at: DateTime<Utc>,
}

#[async_trait]
pub trait InvoiceLedger: Send + Sync {
    async fn find_by_id(&self, invoice_id: i64) -> Result<Option<Invoice>, LedgerError>;

    /// Invoice billed to `occupant_id`'s unit.
    async fn find_for_occupant(
        &self,
        invoice_id: i64,
        occupant_id: i64,
    ) -> Result<Option<Invoice>, LedgerError>;

    /// Take the initiation lease on an unpaid invoice and record the account
    /// reference. Fails (returns `false`) while another live lease exists.
    async fn claim_attempt(
        &self,
        invoice_id: i64,
        account_reference: &str,
        now_ms: i64,
        lease_until_ms: i64,
    ) -> Result<bool, LedgerError>;

    async fn release_attempt(&self, invoice_id: i64) -> Result<(), LedgerError>;

    /// Store the gateway handle of an accepted push and drop the lease.
    /// Returns `false` when the invoice was paid in the meantime.
    async fn record_checkout_request(
        &self,
        invoice_id: i64,
        checkout_request_id: &str,
        merchant_request_id: Option<&str>,
    ) -> Result<bool, LedgerError>;

    async fn settle_by_checkout_request(
        &self,
        checkout_request_id: &str,
        record: &SettlementRecord,
    ) -> Result<Settlement, LedgerError>;

    /// Settle the invoice carrying `account_reference`, whatever handle it
    /// holds. Reached only through a [`PendingCheckout`].
    async fn settle_by_account_reference(
        &self,
        account_reference: &str,
        record: &SettlementRecord,
    ) -> Result<Settlement, LedgerError>;

    /// Park a callback, replacing any earlier delivery for the same handle.
    async fn record_unmatched_callback(
        &self,
        callback: UnmatchedCallback,
    ) -> Result<(), LedgerError>;

    /// Remove and return a parked callback for `checkout_request_id`.
    async fn take_unmatched_callback(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<UnmatchedCallback>, LedgerError>;

    /// Remember an accepted push whose handle could not be stored.
    async fn record_pending_checkout(&self, pending: PendingCheckout) -> Result<(), LedgerError>;

    async fn find_pending_checkout(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<PendingCheckout>, LedgerError>;
}

#[async_trait]
pub trait GatewayConfigStore: Send + Sync {
    async fn find_by_organization(
        &self,
        organization_id: i64,
    ) -> Result<Option<GatewayCredentials>, LedgerError>;
}

#[derive(Clone)]
pub struct MongoInvoiceLedger {
    invoice_collection: Collection<Invoice>,
    unmatched_collection: Collection<UnmatchedCallback>,
    pending_collection: Collection<PendingCheckout>,
}

impl MongoInvoiceLedger {
    pub fn new(db: &Database) -> Self {
        Self {
            invoice_collection: db.collection("invoices"),
            unmatched_collection: db.collection("unmatched_callbacks"),
            pending_collection: db.collection("pending_checkouts"),
        }
    }

    /// Initialize indexes backing the handle and reference lookups.
    pub async fn init_indexes(&self) -> Result<(), LedgerError> {
        // Unique only where a handle exists; unpaid invoices have none.
        let checkout_index = IndexModel::builder()
            .keys(doc! { "checkout_request_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("checkout_request_idx".to_string())
                    .unique(true)
                    .partial_filter_expression(doc! {
                        "checkout_request_id": { "$type": "string" }
                    })
                    .build(),
            )
            .build();

        let reference_index = IndexModel::builder()
            .keys(doc! { "account_reference": 1, "is_paid": 1 })
            .options(
                IndexOptions::builder()
                    .name("account_reference_idx".to_string())
                    .build(),
            )
            .build();

        let occupant_index = IndexModel::builder()
            .keys(doc! { "occupant_id": 1, "is_paid": 1 })
            .options(
                IndexOptions::builder()
                    .name("occupant_invoice_idx".to_string())
                    .build(),
            )
            .build();

        self.invoice_collection
            .create_indexes([checkout_index, reference_index, occupant_index], None)
            .await?;

        let unmatched_index = IndexModel::builder()
            .keys(doc! { "checkout_request_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("unmatched_checkout_idx".to_string())
                    .unique(true)
                    .build(),
            )
            .build();

        self.unmatched_collection
            .create_indexes([unmatched_index], None)
            .await?;

        let pending_index = IndexModel::builder()
            .keys(doc! { "checkout_request_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("pending_checkout_idx".to_string())
                    .unique(true)
                    .build(),
            )
            .build();

        self.pending_collection
            .create_indexes([pending_index], None)
            .await?;

        tracing::info!("Invoice ledger indexes initialized");
        Ok(())
    }

    async fn settle_where(
        &self,
        mut filter: Document,
        lookup: Document,
        record: &SettlementRecord,
    ) -> Result<Settlement, LedgerError> {
        filter.insert("is_paid", false);
        let update = doc! {
            "$set": {
                "is_paid": true,
                "payment_date": mongodb::bson::to_bson(&record.paid_at)?,
                "receipt_code": &record.receipt_code,
            },
            "$unset": { "attempt_lease_until": "" }
        };
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();

        if let Some(invoice) = self
            .invoice_collection
            .find_one_and_update(filter, update, options)
            .await?
        {
            return Ok(Settlement::Applied(invoice));
        }

        match self.invoice_collection.find_one(lookup, None).await? {
            Some(invoice) if invoice.is_paid => Ok(Settlement::AlreadyPaid(invoice)),
            _ => Ok(Settlement::NotFound),
        }
    }
}

#[async_trait]
impl InvoiceLedger for MongoInvoiceLedger {
    async fn find_by_id(&self, invoice_id: i64) -> Result<Option<Invoice>, LedgerError> {
        Ok(self
            .invoice_collection
            .find_one(doc! { "_id": invoice_id }, None)
            .await?)
    }

    async fn find_for_occupant(
        &self,
        invoice_id: i64,
        occupant_id: i64,
    ) -> Result<Option<Invoice>, LedgerError> {
        let filter = doc! { "_id": invoice_id, "occupant_id": occupant_id };
        Ok(self.invoice_collection.find_one(filter, None).await?)
    }

    async fn claim_attempt(
        &self,
        invoice_id: i64,
        account_reference: &str,
        now_ms: i64,
        lease_until_ms: i64,
    ) -> Result<bool, LedgerError> {
        let filter = doc! {
            "_id": invoice_id,
            "is_paid": false,
            "$or": [
                { "attempt_lease_until": null },
                { "attempt_lease_until": { "$lt": now_ms } }
            ]
        };
        let update = doc! {
            "$set": {
                "attempt_lease_until": lease_until_ms,
                "account_reference": account_reference,
            }
        };
        let result = self
            .invoice_collection
            .update_one(filter, update, None)
            .await?;
        Ok(result.matched_count == 1)
    }

    async fn release_attempt(&self, invoice_id: i64) -> Result<(), LedgerError> {
        self.invoice_collection
            .update_one(
                doc! { "_id": invoice_id, "is_paid": false },
                doc! { "$unset": { "attempt_lease_until": "" } },
                None,
            )
            .await?;
        Ok(())
    }

    async fn record_checkout_request(
        &self,
        invoice_id: i64,
        checkout_request_id: &str,
        merchant_request_id: Option<&str>,
    ) -> Result<bool, LedgerError> {
        let filter = doc! { "_id": invoice_id, "is_paid": false };
        let update = doc! {
            "$set": {
                "checkout_request_id": checkout_request_id,
                "merchant_request_id": merchant_request_id,
            },
            "$unset": { "attempt_lease_until": "" }
        };

        match self.invoice_collection.update_one(filter, update, None).await {
            Ok(result) => Ok(result.matched_count == 1),
            Err(e) if is_duplicate_key(&e) => Err(LedgerError::DuplicateCheckoutRequest(
                checkout_request_id.to_string(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn settle_by_checkout_request(
        &self,
        checkout_request_id: &str,
        record: &SettlementRecord,
    ) -> Result<Settlement, LedgerError> {
        self.settle_where(
            doc! { "checkout_request_id": checkout_request_id },
            doc! { "checkout_request_id": checkout_request_id },
            record,
        )
        .await
    }

    async fn settle_by_account_reference(
        &self,
        account_reference: &str,
        record: &SettlementRecord,
    ) -> Result<Settlement, LedgerError> {
        self.settle_where(
            doc! { "account_reference": account_reference },
            doc! { "account_reference": account_reference },
            record,
        )
        .await
    }

    async fn record_unmatched_callback(
        &self,
        callback: UnmatchedCallback,
    ) -> Result<(), LedgerError> {
        let filter = doc! { "checkout_request_id": &callback.checkout_request_id };
        let options = ReplaceOptions::builder().upsert(true).build();
        self.unmatched_collection
            .replace_one(filter, &callback, options)
            .await?;
        Ok(())
    }

    async fn take_unmatched_callback(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<UnmatchedCallback>, LedgerError> {
        Ok(self
            .unmatched_collection
            .find_one_and_delete(doc! { "checkout_request_id": checkout_request_id }, None)
            .await?)
    }

    async fn record_pending_checkout(&self, pending: PendingCheckout) -> Result<(), LedgerError> {
        let filter = doc! { "checkout_request_id": &pending.checkout_request_id };
        let options = ReplaceOptions::builder().upsert(true).build();
        self.pending_collection
            .replace_one(filter, &pending, options)
            .await?;
        Ok(())
    }

    async fn find_pending_checkout(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<PendingCheckout>, LedgerError> {
        Ok(self
            .pending_collection
            .find_one(doc! { "checkout_request_id": checkout_request_id }, None)
            .await?)
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(write_error)) if write_error.code == 11000
    )
}

#[derive(Clone)]
pub struct MongoGatewayConfigStore {
    collection: Collection<GatewayCredentials>,
}

impl MongoGatewayConfigStore {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection("gateway_configs"),
        }
    }

    pub async fn init_indexes(&self) -> Result<(), LedgerError> {
        let organization_index = IndexModel::builder()
            .keys(doc! { "organization_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("gateway_config_org_idx".to_string())
                    .unique(true)
                    .build(),
            )
            .build();

        self.collection
            .create_indexes([organization_index], None)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl GatewayConfigStore for MongoGatewayConfigStore {
    async fn find_by_organization(
        &self,
        organization_id: i64,
    ) -> Result<Option<GatewayCredentials>, LedgerError> {
        Ok(self
            .collection
            .find_one(doc! { "organization_id": organization_id }, None)
            .await?)
    }
}
