pub mod credentials;
pub mod daraja;
pub mod initiation;
pub mod memory;
pub mod metrics;
pub mod reconciler;
pub mod repository;

pub use credentials::CredentialRouter;
pub use daraja::{DarajaClient, PushGateway};
pub use initiation::{InitiatePayment, PaymentInitiationService, PendingPayment};
pub use memory::{InMemoryGatewayConfigStore, InMemoryInvoiceLedger};
pub use metrics::{get_metrics, init_metrics};
pub use reconciler::{CallbackAck, CallbackReconciler};
pub use repository::{
    GatewayConfigStore, InvoiceLedger, MongoGatewayConfigStore, MongoInvoiceLedger,
};
