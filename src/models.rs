// src/models.rs
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An enrolled card holder, as stored locally
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagedAccount {
    pub id: i64,
    pub name: String,
    pub external_id: String,     // provider-side account id, stable
    pub open_id: String,         // provider open id, stable
    pub session_token: String,   // may rotate on any provider call
    pub auto_topup: bool,
    pub transaction_notify: bool,
    pub topup_threshold: Decimal,
    pub last_serial: i64,        // watermark, never decreases
    pub last_balance_checked_at: DateTime<Utc>,
    pub last_transaction_checked_at: DateTime<Utc>,
}

impl ManagedAccount {
    /// Force both automation flags off (breaker trip)
    pub fn disable_automation(&mut self) {
        self.auto_topup = false;
        self.transaction_notify = false;
    }
}

/// Delivery mechanism of a notification channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ChannelType {
    WeComBot,
    Unsupported(String),
}

impl ChannelType {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "WeComBot" => ChannelType::WeComBot,
            other => ChannelType::Unsupported(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ChannelType::WeComBot => "WeComBot",
            ChannelType::Unsupported(raw) => raw,
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationChannel {
    pub id: i64,
    pub account_id: i64,
    pub name: String,
    pub channel_type: ChannelType,
    pub params: String, // opaque delivery parameter, e.g. the bot webhook key
    pub enabled: bool,
}

/// One row of the provider's recent-transactions window.
/// Never persisted; only the watermark it produces is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    #[serde(rename = "serialno")]
    pub serial_no: String,
    #[serde(rename = "feeName")]
    pub fee_name: String,
    pub money: String, // signed decimal text
    #[serde(rename = "afterMon")]
    pub after_money: String,
    pub address: String,
    #[serde(rename = "dealtime")]
    pub deal_time: String,
    #[serde(rename = "time")]
    pub arrival_time: String,
}

impl TransactionRecord {
    pub fn serial(&self) -> Result<i64, std::num::ParseIntError> {
        self.serial_no.trim().parse()
    }
}

/// Recent transactions window, rows newest-first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionPage {
    pub total: i64,
    pub rows: Vec<TransactionRecord>,
}
