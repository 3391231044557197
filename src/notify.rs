// src/notify.rs
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::{ChannelType, ManagedAccount, NotificationChannel, TransactionRecord};
use crate::store::{AccountStore, StoreError};

/// WeCom group robot webhook
pub const WECOM_WEBHOOK_URL: &str = "https://qyapi.weixin.qq.com/cgi-bin/webhook/send";

const CARD_SOURCE: &str = "校园卡账单";
const ERROR_TITLE: &str = "请求错误";
const INVALID_AMOUNT: &str = "数据错误";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to load notification channels: {0}")]
    Channels(#[from] StoreError),

    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webhook returned HTTP {0}")]
    Status(StatusCode),

    #[error("webhook rejected message ({code}): {message}")]
    Rejected { code: i64, message: String },
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver `message` to the destination named by the channel parameter
    async fn deliver(&self, params: &str, message: &Value) -> Result<(), NotifyError>;
}

#[derive(Debug, Deserialize)]
struct WeComReply {
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

/// Posts messages to a WeCom robot; the channel parameter is the robot key
#[derive(Debug, Clone)]
pub struct WeComBotSink {
    client: Client,
    endpoint: String,
}

impl WeComBotSink {
    pub fn new() -> Result<Self, NotifyError> {
        Self::with_endpoint(WECOM_WEBHOOK_URL)
    }

    pub fn with_endpoint(endpoint: &str) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, endpoint: endpoint.to_string() })
    }
}

#[async_trait]
impl NotificationSink for WeComBotSink {
    async fn deliver(&self, params: &str, message: &Value) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .query(&[("key", params)])
            .json(message)
            .send()
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(NotifyError::Status(resp.status()));
        }
        let reply: WeComReply = resp.json().await?;
        if reply.errcode != 0 {
            return Err(NotifyError::Rejected { code: reply.errcode, message: reply.errmsg });
        }
        Ok(())
    }
}

/// Render a signed amount: spending shows without sign, income gets `+`
pub fn format_amount(raw: &str) -> String {
    match Decimal::from_str(raw.trim()) {
        Ok(v) if v.is_sign_negative() => format!("￥{:.2}", -v),
        Ok(v) => format!("+￥{:.2}", v),
        Err(e) => {
            warn!(raw, error = %e, "unparsable transaction amount");
            INVALID_AMOUNT.to_string()
        }
    }
}

pub fn transaction_card(t: &TransactionRecord, auth_endpoint: &str) -> Value {
    json!({
        "msgtype": "template_card",
        "template_card": {
            "card_type": "text_notice",
            "source": { "desc": CARD_SOURCE },
            "main_title": {
                "title": t.address,
                "desc": t.fee_name,
            },
            "emphasis_content": { "title": format_amount(&t.money) },
            "horizontal_content_list": [
                { "keyname": "余额", "value": t.after_money },
                { "keyname": "流水号", "value": t.serial_no },
                { "keyname": "交易时间", "value": t.deal_time },
                { "keyname": "到账时间", "value": t.arrival_time },
            ],
            "card_action": { "type": 1, "url": auth_endpoint },
        }
    })
}

pub fn error_card(account: &ManagedAccount, diagnostic: &str, auth_endpoint: &str) -> Value {
    json!({
        "msgtype": "template_card",
        "template_card": {
            "card_type": "text_notice",
            "source": { "desc": CARD_SOURCE },
            "main_title": {
                "title": ERROR_TITLE,
                "desc": account.name,
            },
            "sub_title_text": format!(
                "自动轮询已取消，点击重新授权\n{}",
                diagnostic
            ),
            "horizontal_content_list": [
                { "keyname": "ymId", "value": account.external_id },
            ],
            "card_action": { "type": 1, "url": auth_endpoint },
        }
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Accepted by this channel; later channels were not tried
    Delivered { channel_id: i64 },
    /// The account has no enabled channel of a supported type
    NoChannel,
}

/// Builds card messages and hands them to the sink, first success wins
#[derive(Clone)]
pub struct NotificationDispatcher {
    store: Arc<dyn AccountStore>,
    sink: Arc<dyn NotificationSink>,
    auth_endpoint: String,
}

impl NotificationDispatcher {
    pub fn new(store: Arc<dyn AccountStore>, sink: Arc<dyn NotificationSink>, auth_endpoint: &str) -> Self {
        Self { store, sink, auth_endpoint: auth_endpoint.to_string() }
    }

    pub async fn notify_transaction(
        &self,
        account: &ManagedAccount,
        t: &TransactionRecord,
    ) -> Result<Delivery, NotifyError> {
        let message = transaction_card(t, &self.auth_endpoint);
        self.dispatch(account, &message).await
    }

    pub async fn notify_error(
        &self,
        account: &ManagedAccount,
        diagnostic: &str,
    ) -> Result<Delivery, NotifyError> {
        let message = error_card(account, diagnostic, &self.auth_endpoint);
        self.dispatch(account, &message).await
    }

    async fn dispatch(&self, account: &ManagedAccount, message: &Value) -> Result<Delivery, NotifyError> {
        let channels = self.store.channels_for_account(account.id).await?;
        let mut last_err = None;

        for c in &channels {
            if !deliverable(c) {
                debug!(account = %account.name, channel = %c.name, kind = %c.channel_type, "channel skipped");
                continue;
            }
            match self.sink.deliver(&c.params, message).await {
                Ok(()) => {
                    debug!(account = %account.name, channel = %c.name, "notification delivered");
                    return Ok(Delivery::Delivered { channel_id: c.id });
                }
                Err(e) => {
                    warn!(account = %account.name, channel = %c.name, error = %e, "channel rejected notification");
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) => Err(e),
            None => Ok(Delivery::NoChannel),
        }
    }
}

fn deliverable(c: &NotificationChannel) -> bool {
    c.enabled && c.channel_type == ChannelType::WeComBot && !c.params.is_empty()
}
