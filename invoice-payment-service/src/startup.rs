//! Application startup and lifecycle management.

use crate::config::PaymentConfig;
use crate::handlers;
use crate::services::{
    CallbackReconciler, CredentialRouter, DarajaClient, GatewayConfigStore, InvoiceLedger,
    MongoGatewayConfigStore, MongoInvoiceLedger, PaymentInitiationService, PushGateway,
};
use axum::middleware::from_fn;
use axum::routing::{get, post};
use axum::Router;
use mongodb::{options::ClientOptions, Client};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::{
    metrics::metrics_middleware,
    tracing::{request_id_middleware, REQUEST_ID_HEADER},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn InvoiceLedger>,
    pub initiation: PaymentInitiationService,
    pub reconciler: CallbackReconciler,
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    listener: TcpListener,
    router: Router,
}

impl Application {
    /// Connect to MongoDB and the Daraja API and bind the HTTP listener.
    pub async fn build(config: PaymentConfig) -> Result<Self, AppError> {
        let mut client_options = ClientOptions::parse(config.database.url.expose_secret())
            .await
            .map_err(|e| {
                tracing::error!("Failed to parse MongoDB connection string: {}", e);
                AppError::DatabaseError(e.into())
            })?;
        client_options.app_name = Some(config.service_name.clone());

        let client = Client::with_options(client_options).map_err(|e| {
            tracing::error!("Failed to create MongoDB client: {}", e);
            AppError::DatabaseError(e.into())
        })?;
        let db = client.database(&config.database.db_name);

        let ledger = MongoInvoiceLedger::new(&db);
        let config_store = MongoGatewayConfigStore::new(&db);
        let index_error = |e: crate::error::LedgerError| {
            tracing::error!("Failed to initialize database indexes: {}", e);
            AppError::DatabaseError(e.into())
        };
        ledger.init_indexes().await.map_err(index_error)?;
        config_store.init_indexes().await.map_err(index_error)?;

        let gateway = DarajaClient::new(&config.gateway).map_err(AppError::ConfigError)?;
        tracing::info!(
            environment = ?config.gateway.environment,
            base_url = %gateway.base_url(),
            "Daraja client initialized"
        );

        Self::build_with_stores(
            config,
            Arc::new(ledger),
            Arc::new(config_store),
            Arc::new(gateway),
        )
        .await
    }

    /// Build around caller-supplied storage and gateway.
    pub async fn build_with_stores(
        config: PaymentConfig,
        ledger: Arc<dyn InvoiceLedger>,
        config_store: Arc<dyn GatewayConfigStore>,
        gateway: Arc<dyn PushGateway>,
    ) -> Result<Self, AppError> {
        let initiation = PaymentInitiationService::new(
            ledger.clone(),
            CredentialRouter::new(config_store),
            gateway,
            config.initiation.clone(),
        );
        let reconciler = CallbackReconciler::new(ledger.clone());

        let state = AppState {
            ledger,
            initiation,
            reconciler,
        };

        // Port 0 binds a random port for tests
        let addr = config.common.socket_addr();
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let http_port = listener.local_addr()?.port();
        tracing::info!("invoice-payment-service: HTTP on port {}", http_port);

        Ok(Self {
            http_port,
            listener,
            router: router(state),
        })
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        axum::serve(self.listener, self.router).await
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics))
        .route("/payments/initiate", post(handlers::payments::initiate))
        .route(
            "/invoices/:id/payment-status",
            get(handlers::payments::payment_status),
        )
        .route(
            "/webhooks/mpesa/stk-callback",
            post(handlers::callback::stk_callback).layer(CatchPanicLayer::custom(
                handlers::callback::acknowledge_after_panic,
            )),
        )
        .layer(from_fn(metrics_middleware))
        .layer(from_fn(request_id_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    payer_id = tracing::field::Empty,
                )
            }),
        )
        .with_state(state)
}
