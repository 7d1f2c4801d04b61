// service/payment_provider.rs
use std::fmt::Debug;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    config::{MpesaConfig, PayPalConfig},
    service::error::ServiceError,
};

/// Smallest STK push amount the mobile-money gateway accepts.
pub const MIN_DEPOSIT_AMOUNT: i64 = 2;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gateway rejected the request: {0}")]
    Rejected(String),

    #[error("{0} is not configured")]
    NotConfigured(&'static str),
}

impl From<GatewayError> for ServiceError {
    fn from(error: GatewayError) -> Self {
        ServiceError::ExternalService(error.to_string())
    }
}

#[async_trait]
pub trait MobileMoneyGateway: Send + Sync + Debug {
    /// Starts a deposit prompt on the payer's phone. Returns the reference the
    /// gateway will echo back in its callback.
    async fn initiate_deposit(&self, phone: &str, amount: i64) -> Result<String, GatewayError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayoutStatus {
    Pending,
    Success,
    Denied,
}

#[async_trait]
pub trait PayoutGateway: Send + Sync + Debug {
    /// Returns the payout batch id.
    async fn create_payout(
        &self,
        destination: &str,
        amount: i64,
        note: &str,
    ) -> Result<String, GatewayError>;

    async fn payout_status(&self, batch_id: &str) -> Result<PayoutStatus, GatewayError>;
}

/// Local numbers are sent in international form: `0712…` becomes `254712…`.
pub fn format_phone_number(phone: &str) -> String {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    match digits.strip_prefix('0') {
        Some(rest) => format!("254{}", rest),
        None => digits,
    }
}

/// STK push password: base64 of shortcode, passkey and timestamp.
pub fn stk_password(shortcode: &str, passkey: &str, timestamp: &str) -> String {
    STANDARD.encode(format!("{}{}{}", shortcode, passkey, timestamp))
}

pub fn parse_batch_status(status: &str) -> PayoutStatus {
    match status {
        "PENDING" | "PROCESSING" | "NEW" => PayoutStatus::Pending,
        "SUCCESS" => PayoutStatus::Success,
        _ => PayoutStatus::Denied,
    }
}

#[derive(Debug, Deserialize)]
struct AccessToken {
    access_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StkPushResponse {
    #[serde(rename = "MerchantRequestID")]
    merchant_request_id: Option<String>,
    response_code: Option<String>,
    response_description: Option<String>,
}

/// M-Pesa Daraja STK push client.
#[derive(Debug, Clone)]
pub struct MpesaClient {
    http: reqwest::Client,
    config: MpesaConfig,
}

impl MpesaClient {
    pub fn new(config: MpesaConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    async fn access_token(&self) -> Result<String, GatewayError> {
        if self.config.consumer_key.is_empty() {
            return Err(GatewayError::NotConfigured("M-Pesa"));
        }

        let token = self
            .http
            .get(format!(
                "{}/oauth/v1/generate?grant_type=client_credentials",
                self.config.base_url
            ))
            .basic_auth(&self.config.consumer_key, Some(&self.config.consumer_secret))
            .send()
            .await?
            .error_for_status()?
            .json::<AccessToken>()
            .await?;

        Ok(token.access_token)
    }
}

#[async_trait]
impl MobileMoneyGateway for MpesaClient {
    async fn initiate_deposit(&self, phone: &str, amount: i64) -> Result<String, GatewayError> {
        let token = self.access_token().await?;
        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let phone = format_phone_number(phone);

        let payload = serde_json::json!({
            "BusinessShortCode": self.config.shortcode,
            "Password": stk_password(&self.config.shortcode, &self.config.passkey, &timestamp),
            "Timestamp": timestamp,
            "TransactionType": "CustomerPayBillOnline",
            "Amount": amount,
            "PartyA": phone,
            "PartyB": self.config.shortcode,
            "PhoneNumber": phone,
            "CallBackURL": self.config.callback_url,
            "AccountReference": "NisaClean",
            "TransactionDesc": "Deposit to User Account",
        });

        tracing::info!("initiating STK push of {} for {}", amount, phone);

        let response = self
            .http
            .post(format!("{}/mpesa/stkpush/v1/processrequest", self.config.base_url))
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!("STK push rejected ({}): {}", status, body);
            return Err(GatewayError::Rejected(format!("M-Pesa returned {}", status)));
        }

        let body = response.json::<StkPushResponse>().await?;
        match (body.response_code.as_deref(), body.merchant_request_id) {
            (Some("0"), Some(reference)) => Ok(reference),
            _ => Err(GatewayError::Rejected(
                body.response_description
                    .unwrap_or_else(|| "STK push was not accepted".to_string()),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BatchHeader {
    payout_batch_id: String,
    #[serde(default)]
    batch_status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PayoutBatch {
    batch_header: BatchHeader,
}

/// PayPal Payouts client.
#[derive(Debug, Clone)]
pub struct PayPalClient {
    http: reqwest::Client,
    config: PayPalConfig,
}

impl PayPalClient {
    pub fn new(config: PayPalConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    async fn access_token(&self) -> Result<String, GatewayError> {
        if self.config.client_id.is_empty() {
            return Err(GatewayError::NotConfigured("PayPal"));
        }

        let token = self
            .http
            .post(format!("{}/v1/oauth2/token", self.config.base_url))
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?
            .error_for_status()?
            .json::<AccessToken>()
            .await?;

        Ok(token.access_token)
    }
}

#[async_trait]
impl PayoutGateway for PayPalClient {
    async fn create_payout(
        &self,
        destination: &str,
        amount: i64,
        note: &str,
    ) -> Result<String, GatewayError> {
        let token = self.access_token().await?;
        let batch_id = format!("Withdrawal_{}", Utc::now().timestamp_millis());

        let payload = serde_json::json!({
            "sender_batch_header": {
                "sender_batch_id": batch_id,
                "email_subject": "You have a payout!",
                "email_message": format!("You have received a payout of {}", amount),
            },
            "items": [{
                "recipient_type": "EMAIL",
                "receiver": destination,
                "amount": { "currency": "USD", "value": amount.to_string() },
                "note": note,
                "sender_item_id": batch_id,
                "purpose": "SERVICES",
            }],
        });

        let batch = self
            .http
            .post(format!("{}/v1/payments/payouts", self.config.base_url))
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?
            .json::<PayoutBatch>()
            .await?;

        tracing::info!("payout batch {} created for {}", batch.batch_header.payout_batch_id, destination);
        Ok(batch.batch_header.payout_batch_id)
    }

    async fn payout_status(&self, batch_id: &str) -> Result<PayoutStatus, GatewayError> {
        let token = self.access_token().await?;
        let batch = self
            .http
            .get(format!("{}/v1/payments/payouts/{}", self.config.base_url, batch_id))
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?
            .json::<PayoutBatch>()
            .await?;

        Ok(parse_batch_status(
            batch.batch_header.batch_status.as_deref().unwrap_or("PENDING"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_numbers_get_country_code() {
        assert_eq!(format_phone_number("0712345678"), "254712345678");
        assert_eq!(format_phone_number("+254712345678"), "254712345678");
        assert_eq!(format_phone_number("254712345678"), "254712345678");
    }

    #[test]
    fn password_is_base64_of_parts() {
        let password = stk_password("174379", "key", "20240101120000");
        let decoded = STANDARD.decode(password).unwrap();
        assert_eq!(decoded, b"174379key20240101120000");
    }

    #[test]
    fn batch_statuses_map_to_three_outcomes() {
        assert_eq!(parse_batch_status("PENDING"), PayoutStatus::Pending);
        assert_eq!(parse_batch_status("PROCESSING"), PayoutStatus::Pending);
        assert_eq!(parse_batch_status("SUCCESS"), PayoutStatus::Success);
        assert_eq!(parse_batch_status("DENIED"), PayoutStatus::Denied);
        assert_eq!(parse_batch_status("CANCELED"), PayoutStatus::Denied);
    }

    #[tokio::test]
    async fn unconfigured_gateways_fail_without_network() {
        let mpesa = MpesaClient::new(MpesaConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            consumer_key: String::new(),
            consumer_secret: String::new(),
            shortcode: "174379".to_string(),
            passkey: String::new(),
            callback_url: String::new(),
        });
        let err = mpesa.initiate_deposit("0712345678", 10).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotConfigured("M-Pesa")));

        let service_error: ServiceError = err.into();
        assert_eq!(service_error.kind(), "ExternalServiceError");
    }
}
