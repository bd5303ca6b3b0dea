#![allow(dead_code)]

use chrono::NaiveDate;
use invoice_payment_service::config::{
    DatabaseConfig, GatewayConfig, GatewayEnvironment, InitiationConfig, PaymentConfig,
};
use invoice_payment_service::models::{GatewayCredentials, Invoice, SenderRole};
use invoice_payment_service::services::{
    init_metrics, DarajaClient, InMemoryGatewayConfigStore, InMemoryInvoiceLedger, InvoiceLedger,
};
use invoice_payment_service::startup::Application;
use rust_decimal::Decimal;
use secrecy::Secret;
use serde_json::{json, Value};
use service_core::config::Config as CoreConfig;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TEST_ORG_ID: i64 = 1;
pub const TEST_PAYER_ID: i64 = 9;
pub const TEST_PHONE: &str = "0712345678";
pub const TOKEN_PATH: &str = "/oauth/v1/generate";
pub const STK_PUSH_PATH: &str = "/mpesa/stkpush/v1/processrequest";

pub struct TestApp {
    pub http_address: String,
    pub http_port: u16,
    pub gateway: MockServer,
    pub ledger: Arc<InMemoryInvoiceLedger>,
    pub configs: Arc<InMemoryGatewayConfigStore>,
    pub client: reqwest::Client,
}

impl TestApp {
    pub async fn spawn() -> Self {
        init_metrics();

        let gateway = MockServer::start().await;
        let config = PaymentConfig {
            common: CoreConfig {
                host: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port: 0, // Random port
            },
            service_name: "invoice-payment-service-test".to_string(),
            log_level: "debug".to_string(),
            otlp_endpoint: None,
            database: DatabaseConfig {
                url: Secret::new("mongodb://unused".to_string()),
                db_name: "unused".to_string(),
            },
            gateway: GatewayConfig {
                environment: GatewayEnvironment::Sandbox,
                api_base_url: Some(gateway.uri()),
                callback_url: "https://pay.example.com/webhooks/mpesa/stk-callback".to_string(),
                timeout: Duration::from_secs(5),
                utc_offset_minutes: 180,
            },
            initiation: InitiationConfig {
                country_code: "254".to_string(),
                attempt_lease: Duration::from_secs(90),
            },
        };

        let ledger = Arc::new(InMemoryInvoiceLedger::new());
        let configs = Arc::new(InMemoryGatewayConfigStore::new());
        let daraja = DarajaClient::new(&config.gateway).expect("Failed to build Daraja client");

        let app = Application::build_with_stores(
            config,
            ledger.clone(),
            configs.clone(),
            Arc::new(daraja),
        )
        .await
        .expect("Failed to build test application");

        let http_port = app.http_port();
        let http_address = format!("http://127.0.0.1:{}", http_port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        let client = reqwest::Client::new();
        let health_url = format!("{}/health", http_address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        TestApp {
            http_address,
            http_port,
            gateway,
            ledger,
            configs,
            client,
        }
    }

    /// Unpaid invoice owned by the test payer in the test organization.
    pub async fn seed_invoice(&self, id: i64, amount: Decimal) -> Invoice {
        let invoice = Invoice {
            id,
            unit_id: 3,
            organization_id: TEST_ORG_ID,
            occupant_id: Some(TEST_PAYER_ID),
            amount,
            due_date: NaiveDate::from_ymd_opt(2026, 11, 1).expect("valid date"),
            is_paid: false,
            payment_date: None,
            receipt_code: None,
            checkout_request_id: None,
            merchant_request_id: None,
            account_reference: None,
            attempt_lease_until: None,
            description: "Monthly Service Charge".to_string(),
            sender_role: SenderRole::Organization,
        };
        self.ledger.insert(invoice.clone()).await;
        invoice
    }

    pub async fn seed_credentials(&self, organization_id: i64) {
        self.configs
            .insert(GatewayCredentials {
                organization_id,
                consumer_key: format!("key-{}", organization_id),
                consumer_secret: Secret::new(format!("secret-{}", organization_id)),
                shortcode: "174379".to_string(),
                passkey: Secret::new("test-passkey".to_string()),
                paybill_number: "600100".to_string(),
                configured: true,
            })
            .await;
    }

    pub async fn invoice(&self, id: i64) -> Invoice {
        self.ledger
            .find_by_id(id)
            .await
            .expect("ledger read failed")
            .expect("invoice missing")
    }

    /// Token endpoint answering `times` requests.
    pub async fn mock_token(&self, times: u64) {
        Mock::given(method("GET"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "test-access-token",
                "expires_in": "3599"
            })))
            .expect(times)
            .mount(&self.gateway)
            .await;
    }

    /// Push endpoint accepting `times` requests with the given handle.
    pub async fn mock_push_accepted(&self, checkout_request_id: &str, times: u64) {
        Mock::given(method("POST"))
            .and(path(STK_PUSH_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": checkout_request_id,
                "ResponseCode": "0",
                "ResponseDescription": "Success. Request accepted for processing",
                "CustomerMessage": "Success. Request accepted for processing"
            })))
            .expect(times)
            .mount(&self.gateway)
            .await;
    }

    /// Fails the test on drop if the gateway is contacted at all.
    pub async fn expect_no_gateway_calls(&self) {
        Mock::given(wiremock::matchers::any())
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&self.gateway)
            .await;
    }

    pub async fn initiate(&self, payer_id: Option<i64>, body: Value) -> reqwest::Response {
        let mut request = self
            .client
            .post(format!("{}/payments/initiate", self.http_address))
            .json(&body);
        if let Some(payer_id) = payer_id {
            request = request.header("X-User-ID", payer_id.to_string());
        }
        request.send().await.expect("Failed to execute request")
    }

    pub async fn payment_status(&self, invoice_id: i64) -> reqwest::Response {
        self.client
            .get(format!(
                "{}/invoices/{}/payment-status",
                self.http_address, invoice_id
            ))
            .header("X-User-ID", TEST_PAYER_ID.to_string())
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn deliver_callback(&self, body: impl Into<reqwest::Body>) -> reqwest::Response {
        self.client
            .post(format!("{}/webhooks/mpesa/stk-callback", self.http_address))
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .expect("Failed to execute request")
    }
}

/// A successful STK callback with metadata items in Daraja's usual order.
pub fn success_callback(checkout_request_id: &str, receipt: &str, amount: f64) -> Value {
    json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": checkout_request_id,
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": {
                    "Item": [
                        { "Name": "Amount", "Value": amount },
                        { "Name": "MpesaReceiptNumber", "Value": receipt },
                        { "Name": "Balance" },
                        { "Name": "TransactionDate", "Value": 20261016093000u64 },
                        { "Name": "PhoneNumber", "Value": 254712345678u64 }
                    ]
                }
            }
        }
    })
}

pub fn failed_callback(checkout_request_id: &str, result_code: i64, description: &str) -> Value {
    json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": checkout_request_id,
                "ResultCode": result_code,
                "ResultDesc": description
            }
        }
    })
}
