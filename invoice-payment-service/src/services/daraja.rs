//! M-Pesa Daraja STK Push client.
//!
//! Implements the two outbound steps of a push payment: OAuth token
//! acquisition and the `processrequest` call. Credentials are supplied per call;
//! the client holds no tenant state.

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::models::{whole_units, PushPaymentRequest};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, FixedOffset, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use service_core::observability::TracedClientExt;

const TOKEN_PATH: &str = "/oauth/v1/generate";
const STK_PUSH_PATH: &str = "/mpesa/stkpush/v1/processrequest";
const TRANSACTION_TYPE: &str = "CustomerPayBillOnline";

/// Bearer token returned by the OAuth endpoint.
#[derive(Clone)]
pub struct AccessToken(Secret<String>);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Secret::new(token.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessToken([REDACTED])")
    }
}

/// Gateway acknowledgement of an accepted push request.
#[derive(Debug, Clone)]
pub struct PushAccepted {
    pub checkout_request_id: String,
    pub merchant_request_id: Option<String>,
    pub customer_message: Option<String>,
    pub raw_response: serde_json::Value,
}

/// The two outbound calls of the push-payment protocol.
#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn acquire_token(
        &self,
        consumer_key: &str,
        consumer_secret: &Secret<String>,
    ) -> Result<AccessToken, GatewayError>;

    async fn initiate_push_payment(
        &self,
        request: &PushPaymentRequest,
        token: &AccessToken,
    ) -> Result<PushAccepted, GatewayError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

/// Body of the `processrequest` call.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StkPushBody {
    pub business_short_code: String,
    pub password: String,
    pub timestamp: String,
    pub transaction_type: &'static str,
    pub amount: u64,
    pub party_a: String,
    pub party_b: String,
    pub phone_number: String,
    #[serde(rename = "CallBackURL")]
    pub callback_url: String,
    pub account_reference: String,
    pub transaction_desc: String,
}

#[derive(Debug, Deserialize)]
struct StkPushResponse {
    #[serde(rename = "MerchantRequestID")]
    merchant_request_id: Option<String>,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: Option<String>,
    #[serde(rename = "ResponseCode")]
    response_code: Option<serde_json::Value>,
    #[serde(rename = "ResponseDescription")]
    response_description: Option<String>,
    #[serde(rename = "CustomerMessage")]
    customer_message: Option<String>,
}

/// Error body Daraja returns with 4xx/5xx responses.
#[derive(Debug, Deserialize)]
struct DarajaErrorBody {
    #[serde(rename = "errorCode")]
    error_code: Option<String>,
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

/// Daraja client for interacting with the M-Pesa API.
#[derive(Clone)]
pub struct DarajaClient {
    client: Client,
    base_url: String,
    callback_url: String,
    clock_offset: FixedOffset,
}

impl DarajaClient {
    /// Create a new client. Every request is bounded by `config.timeout`.
    pub fn new(config: &GatewayConfig) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        let clock_offset = FixedOffset::east_opt(config.utc_offset_minutes * 60)
            .ok_or_else(|| anyhow::anyhow!("invalid UTC offset: {} minutes", config.utc_offset_minutes))?;

        Ok(Self {
            client,
            base_url: config.base_url().trim_end_matches('/').to_string(),
            callback_url: config.callback_url.clone(),
            clock_offset,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build the request body at instant `now`.
    pub fn build_push_body(
        &self,
        request: &PushPaymentRequest,
        now: DateTime<Utc>,
    ) -> Result<StkPushBody, GatewayError> {
        let amount = whole_units(request.amount).ok_or_else(|| GatewayError::GatewayRejected {
            code: "local".to_string(),
            message: format!("amount {} is below one whole unit", request.amount),
        })?;

        let credentials = &request.credentials;
        let timestamp = stk_timestamp(now, self.clock_offset);
        let password = stk_password(
            &credentials.shortcode,
            credentials.passkey.expose_secret(),
            &timestamp,
        );

        Ok(StkPushBody {
            business_short_code: credentials.shortcode.clone(),
            password,
            timestamp,
            transaction_type: TRANSACTION_TYPE,
            amount,
            party_a: request.phone_number.clone(),
            party_b: credentials.party_b().to_string(),
            phone_number: request.phone_number.clone(),
            callback_url: self.callback_url.clone(),
            account_reference: request.account_reference.clone(),
            transaction_desc: request.description.clone(),
        })
    }
}

#[async_trait]
impl PushGateway for DarajaClient {
    async fn acquire_token(
        &self,
        consumer_key: &str,
        consumer_secret: &Secret<String>,
    ) -> Result<AccessToken, GatewayError> {
        let url = format!("{}{}", self.base_url, TOKEN_PATH);

        let response = self
            .client
            .traced_get(&url)
            .query(&[("grant_type", "client_credentials")])
            .basic_auth(consumer_key, Some(consumer_secret.expose_secret()))
            .send()
            .await
            .map_err(|e| GatewayError::AuthFailure(format!("token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %body, "Daraja token request rejected");
            return Err(GatewayError::AuthFailure(format!(
                "token endpoint returned {}",
                status
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::AuthFailure(format!("unreadable token response: {}", e)))?;

        body.access_token
            .filter(|token| !token.is_empty())
            .map(AccessToken::new)
            .ok_or_else(|| GatewayError::AuthFailure("token response has no access_token".to_string()))
    }

    async fn initiate_push_payment(
        &self,
        request: &PushPaymentRequest,
        token: &AccessToken,
    ) -> Result<PushAccepted, GatewayError> {
        let body = self.build_push_body(request, Utc::now())?;
        let url = format!("{}{}", self.base_url, STK_PUSH_PATH);

        tracing::debug!(
            account_reference = %body.account_reference,
            amount = body.amount,
            timestamp = %body.timestamp,
            "Sending STK push"
        );

        let response = self
            .client
            .traced_post(&url)
            .bearer_auth(token.expose())
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::NetworkFailure(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::NetworkFailure(e.to_string()))?;

        tracing::debug!(status = %status, body = %text, "Daraja processrequest response");

        if !status.is_success() {
            let error: Option<DarajaErrorBody> = serde_json::from_str(&text).ok();
            let (code, message) = match error {
                Some(e) => (
                    e.error_code.unwrap_or_else(|| status.as_u16().to_string()),
                    e.error_message.unwrap_or_else(|| text.clone()),
                ),
                None => (status.as_u16().to_string(), text.clone()),
            };
            tracing::error!(code = %code, message = %message, "STK push rejected");
            return Err(GatewayError::GatewayRejected { code, message });
        }

        let raw_response: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| GatewayError::GatewayRejected {
                code: "unparseable".to_string(),
                message: e.to_string(),
            })?;
        let parsed: StkPushResponse = serde_json::from_value(raw_response.clone()).map_err(|e| {
            GatewayError::GatewayRejected {
                code: "unparseable".to_string(),
                message: e.to_string(),
            }
        })?;

        let response_code = parsed.response_code.as_ref().map(code_as_string);
        if response_code.as_deref() != Some("0") {
            return Err(GatewayError::GatewayRejected {
                code: response_code.unwrap_or_else(|| "missing".to_string()),
                message: parsed
                    .response_description
                    .unwrap_or_else(|| "no response description".to_string()),
            });
        }

        let checkout_request_id = parsed
            .checkout_request_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| GatewayError::GatewayRejected {
                code: "0".to_string(),
                message: "accepted response has no CheckoutRequestID".to_string(),
            })?;

        tracing::info!(
            checkout_request_id = %checkout_request_id,
            account_reference = %body.account_reference,
            "STK push accepted"
        );

        Ok(PushAccepted {
            checkout_request_id,
            merchant_request_id: parsed.merchant_request_id,
            customer_message: parsed.customer_message,
            raw_response,
        })
    }
}

/// `YYYYMMDDHHmmss` on the gateway's reference clock.
pub fn stk_timestamp(now: DateTime<Utc>, offset: FixedOffset) -> String {
    now.with_timezone(&offset).format("%Y%m%d%H%M%S").to_string()
}

/// `base64(shortcode ∥ passkey ∥ timestamp)`, no separators.
pub fn stk_password(shortcode: &str, passkey: &str, timestamp: &str) -> String {
    let mut raw = String::with_capacity(shortcode.len() + passkey.len() + timestamp.len());
    raw.push_str(shortcode);
    raw.push_str(passkey);
    raw.push_str(timestamp);
    general_purpose::STANDARD.encode(raw.as_bytes())
}

/// Daraja sends codes as strings in some responses and numbers in others.
fn code_as_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}
