// src/provider.rs
use async_trait::async_trait;
use chrono::{DateTime, Local};
use reqwest::Url;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::TransactionPage;

/// Balance text the provider returns while the card system is unavailable
pub const UNAVAILABLE_BALANCE: &str = "- - -";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned HTTP {0}")]
    Status(reqwest::StatusCode),

    #[error("provider error {code}: {message}")]
    Rejected { code: i64, message: String },

    #[error("malformed provider response: {0}")]
    Malformed(String),

    #[error("pay url carries no transaction number: {0}")]
    MissingTransactionNumber(String),
}

impl From<serde_json::Error> for ProviderError {
    fn from(e: serde_json::Error) -> Self {
        ProviderError::Malformed(e.to_string())
    }
}

/// A provider answer plus the session token, if the provider rotated it
#[derive(Debug, Clone, PartialEq)]
pub struct Reply<T> {
    pub value: T,
    pub session: Option<String>,
}

impl<T> Reply<T> {
    pub fn new(value: T) -> Self {
        Self { value, session: None }
    }

    pub fn rotated(value: T, session: impl Into<String>) -> Self {
        Self { value, session: Some(session.into()) }
    }
}

#[async_trait]
pub trait AccountProvider: Send + Sync {
    /// Card balance as text; [`UNAVAILABLE_BALANCE`] means temporarily unknown
    async fn get_balance(&self, session: &str, account_id: &str) -> Result<Reply<String>, ProviderError>;

    /// Unpaginated recent window as of `as_of`, rows newest-first
    async fn get_recent_transactions(
        &self,
        session: &str,
        account_id: &str,
        as_of: DateTime<Local>,
    ) -> Result<Reply<TransactionPage>, ProviderError>;

    /// Start a card recharge; returns the pay url
    async fn initiate_recharge(
        &self,
        amount: Decimal,
        open_id: &str,
        session: &str,
        account_id: &str,
    ) -> Result<String, ProviderError>;

    async fn verify_signable(&self, tran_no: &str) -> Result<(), ProviderError>;

    async fn select_payment_method(&self, tran_no: &str) -> Result<(), ProviderError>;

    async fn execute_payment(&self, tran_no: &str) -> Result<(), ProviderError>;
}

/// Pull the `tran_no` query parameter out of a pay url
pub fn transaction_number(pay_url: &str) -> Result<String, ProviderError> {
    let url = Url::parse(pay_url)
        .map_err(|_| ProviderError::MissingTransactionNumber(pay_url.to_string()))?;
    url.query_pairs()
        .find(|(k, v)| k == "tran_no" && !v.is_empty())
        .map(|(_, v)| v.into_owned())
        .ok_or_else(|| ProviderError::MissingTransactionNumber(pay_url.to_string()))
}
