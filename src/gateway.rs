// src/gateway.rs
//
// JSON client for the provider gateway. The gateway fronts the card
// provider and speaks one envelope for every call:
//   { "result": <T>, "sessionId": "<rotated token, optional>" }
//   { "error": { "code": <int>, "message": "<text>" } }
use async_trait::async_trait;
use chrono::{DateTime, Local};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use crate::models::TransactionPage;
use crate::provider::{AccountProvider, ProviderError, Reply};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GatewayResponse<T> {
    Success {
        result: T,
        #[serde(rename = "sessionId", default)]
        session_id: Option<String>,
    },
    Error {
        error: GatewayError,
    },
}

#[derive(Debug, Deserialize)]
struct GatewayError {
    code: i64,
    message: String,
}

#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: Client,
    base_url: String,
}

impl HttpProvider {
    pub fn new(base_url: &str) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn call<T: DeserializeOwned>(&self, path: &str, payload: &Value) -> Result<Reply<T>, ProviderError> {
        let url = format!("{}/{}", self.base_url, path);
        debug!("📡 Sending {} → {}", path, url);

        let resp = self.client.post(&url).json(payload).send().await?;
        if resp.status() != StatusCode::OK {
            return Err(ProviderError::Status(resp.status()));
        }
        let text = resp.text().await?;
        debug!("📩 Raw {} response: {}", path, text);

        match serde_json::from_str::<GatewayResponse<T>>(&text)? {
            GatewayResponse::Success { result, session_id } => Ok(Reply {
                value: result,
                session: session_id.filter(|s| !s.is_empty()),
            }),
            GatewayResponse::Error { error } => Err(ProviderError::Rejected {
                code: error.code,
                message: error.message,
            }),
        }
    }

    /// Read-only calls are retried on transport errors, up to 3 attempts
    async fn call_with_retry<T: DeserializeOwned>(&self, path: &str, payload: &Value) -> Result<Reply<T>, ProviderError> {
        let mut attempt = 1;
        loop {
            match self.call(path, payload).await {
                Err(ProviderError::Http(e)) if attempt < 3 => {
                    warn!("⚠️ {} failed (attempt {}): {}. Retrying...", path, attempt, e);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl AccountProvider for HttpProvider {
    async fn get_balance(&self, session: &str, account_id: &str) -> Result<Reply<String>, ProviderError> {
        let payload = json!({ "sessionId": session, "ymUserId": account_id });
        self.call_with_retry("card/balance", &payload).await
    }

    async fn get_recent_transactions(
        &self,
        session: &str,
        account_id: &str,
        as_of: DateTime<Local>,
    ) -> Result<Reply<TransactionPage>, ProviderError> {
        let payload = json!({
            "sessionId": session,
            "ymUserId": account_id,
            "queryTime": as_of.format("%Y-%m-%d %H:%M:%S").to_string(),
        });
        self.call_with_retry("card/transactions", &payload).await
    }

    async fn initiate_recharge(
        &self,
        amount: Decimal,
        open_id: &str,
        session: &str,
        account_id: &str,
    ) -> Result<String, ProviderError> {
        let payload = json!({
            "amount": format!("{:.2}", amount),
            "openId": open_id,
            "sessionId": session,
            "ymUserId": account_id,
        });
        let reply: Reply<String> = self.call("recharge/create", &payload).await?;
        Ok(reply.value)
    }

    async fn verify_signable(&self, tran_no: &str) -> Result<(), ProviderError> {
        let _: Reply<Value> = self.call("recharge/signpay-check", &json!({ "tranNo": tran_no })).await?;
        Ok(())
    }

    async fn select_payment_method(&self, tran_no: &str) -> Result<(), ProviderError> {
        let _: Reply<Value> = self.call("recharge/choose", &json!({ "tranNo": tran_no })).await?;
        Ok(())
    }

    async fn execute_payment(&self, tran_no: &str) -> Result<(), ProviderError> {
        let _: Reply<Value> = self.call("recharge/pay", &json!({ "tranNo": tran_no })).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_success_with_rotated_session() {
        let raw = r#"{"result":"42.50","sessionId":"new-sess"}"#;
        match serde_json::from_str::<GatewayResponse<String>>(raw).unwrap() {
            GatewayResponse::Success { result, session_id } => {
                assert_eq!(result, "42.50");
                assert_eq!(session_id.as_deref(), Some("new-sess"));
            }
            GatewayResponse::Error { .. } => panic!("expected success"),
        }
    }

    #[test]
    fn parses_error_envelope() {
        let raw = r#"{"error":{"code":401,"message":"session expired"}}"#;
        match serde_json::from_str::<GatewayResponse<String>>(raw).unwrap() {
            GatewayResponse::Error { error } => {
                assert_eq!(error.code, 401);
                assert_eq!(error.message, "session expired");
            }
            GatewayResponse::Success { .. } => panic!("expected error"),
        }
    }

    #[test]
    fn parses_transaction_page() {
        let raw = r#"{"result":{"total":1,"rows":[{"serialno":"105","feeName":"消费","money":"-12.50",
            "afterMon":"87.50","address":"Canteen 2","dealtime":"2024-01-01 12:00:00",
            "time":"2024-01-01 12:00:05"}]}}"#;
        match serde_json::from_str::<GatewayResponse<TransactionPage>>(raw).unwrap() {
            GatewayResponse::Success { result, session_id } => {
                assert!(session_id.is_none());
                assert_eq!(result.total, 1);
                assert_eq!(result.rows[0].serial().unwrap(), 105);
                assert_eq!(result.rows[0].address, "Canteen 2");
            }
            GatewayResponse::Error { .. } => panic!("expected success"),
        }
    }

    #[test]
    fn trims_trailing_slash() {
        let p = HttpProvider::new("http://127.0.0.1:9000/").unwrap();
        assert_eq!(p.base_url, "http://127.0.0.1:9000");
    }
}
