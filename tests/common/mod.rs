//! Shared fixtures: an in-memory store, a scripted provider, a recording sink.
#![allow(dead_code)]

use async_trait::async_trait;
use card_broker::budget::{Breaker, ErrorBudget, TripPolicy};
use card_broker::db;
use card_broker::models::{ChannelType, ManagedAccount, TransactionPage, TransactionRecord};
use card_broker::notify::{NotificationDispatcher, NotificationSink, NotifyError};
use card_broker::provider::{AccountProvider, ProviderError, Reply};
use card_broker::store::{AccountStore, SqliteStore};
use card_broker::CycleContext;
use chrono::{DateTime, Local};
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

pub const AUTH_ENDPOINT: &str = "https://broker.test/_/xfb/auth";

fn rejected(message: &str) -> ProviderError {
    ProviderError::Rejected { code: 500, message: message.to_string() }
}

/// Provider whose answers are scripted per external account id
#[derive(Default)]
pub struct FakeProvider {
    balances: Mutex<HashMap<String, Result<Reply<String>, String>>>,
    transactions: Mutex<HashMap<String, Result<Reply<TransactionPage>, String>>>,
    failing_step: Mutex<Option<String>>,
    hanging: Mutex<HashSet<String>>,
    /// (call, session token) for every call that carries a session
    pub sessions: Mutex<Vec<(String, String)>>,
    pub recharges: Mutex<Vec<(String, Decimal)>>,
    pub steps: Mutex<Vec<String>>,
    pub balance_calls: Mutex<Vec<String>>,
    pub transaction_calls: Mutex<Vec<String>>,
}

impl FakeProvider {
    pub fn set_balance(&self, account: &str, balance: &str) {
        self.balances
            .lock()
            .unwrap()
            .insert(account.to_string(), Ok(Reply::new(balance.to_string())));
    }

    pub fn set_balance_reply(&self, account: &str, reply: Reply<String>) {
        self.balances.lock().unwrap().insert(account.to_string(), Ok(reply));
    }

    pub fn fail_balance(&self, account: &str, message: &str) {
        self.balances
            .lock()
            .unwrap()
            .insert(account.to_string(), Err(message.to_string()));
    }

    /// Rows are given newest-first, as the provider returns them
    pub fn set_rows(&self, account: &str, rows: Vec<TransactionRecord>) {
        let page = TransactionPage { total: rows.len() as i64, rows };
        self.transactions
            .lock()
            .unwrap()
            .insert(account.to_string(), Ok(Reply::new(page)));
    }

    pub fn set_rows_rotating(&self, account: &str, rows: Vec<TransactionRecord>, session: &str) {
        let page = TransactionPage { total: rows.len() as i64, rows };
        self.transactions
            .lock()
            .unwrap()
            .insert(account.to_string(), Ok(Reply::rotated(page, session)));
    }

    pub fn fail_transactions(&self, account: &str, message: &str) {
        self.transactions
            .lock()
            .unwrap()
            .insert(account.to_string(), Err(message.to_string()));
    }

    /// Make one recharge step ("create", "verify", "choose", "pay") fail
    pub fn fail_step(&self, step: &str) {
        *self.failing_step.lock().unwrap() = Some(step.to_string());
    }

    /// Make reads for `call` ("balance" or "transactions") on `account`
    /// never answer
    pub fn hang(&self, call: &str, account: &str) {
        self.hanging.lock().unwrap().insert(format!("{call}:{account}"));
    }

    /// Session tokens passed to `call`, in call order
    pub fn sessions_for(&self, call: &str) -> Vec<String> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == call)
            .map(|(_, s)| s.clone())
            .collect()
    }

    async fn answer(&self, call: &str, session: &str, account: &str) {
        self.sessions.lock().unwrap().push((call.to_string(), session.to_string()));
        let hang = self.hanging.lock().unwrap().contains(&format!("{call}:{account}"));
        if hang {
            std::future::pending::<()>().await;
        }
    }

    fn step(&self, name: &str) -> Result<(), ProviderError> {
        self.steps.lock().unwrap().push(name.to_string());
        if self.failing_step.lock().unwrap().as_deref() == Some(name) {
            return Err(rejected(&format!("{name} refused")));
        }
        Ok(())
    }

    pub fn recharge_amounts(&self) -> Vec<Decimal> {
        self.recharges.lock().unwrap().iter().map(|(_, a)| *a).collect()
    }

    pub fn step_names(&self) -> Vec<String> {
        self.steps.lock().unwrap().clone()
    }
}

#[async_trait]
impl AccountProvider for FakeProvider {
    async fn get_balance(&self, session: &str, account_id: &str) -> Result<Reply<String>, ProviderError> {
        self.balance_calls.lock().unwrap().push(account_id.to_string());
        self.answer("balance", session, account_id).await;
        match self.balances.lock().unwrap().get(account_id) {
            Some(Ok(reply)) => Ok(reply.clone()),
            Some(Err(message)) => Err(rejected(message)),
            None => Err(rejected("unknown account")),
        }
    }

    async fn get_recent_transactions(
        &self,
        session: &str,
        account_id: &str,
        _as_of: DateTime<Local>,
    ) -> Result<Reply<TransactionPage>, ProviderError> {
        self.transaction_calls.lock().unwrap().push(account_id.to_string());
        self.answer("transactions", session, account_id).await;
        match self.transactions.lock().unwrap().get(account_id) {
            Some(Ok(reply)) => Ok(reply.clone()),
            Some(Err(message)) => Err(rejected(message)),
            None => Ok(Reply::new(TransactionPage::default())),
        }
    }

    async fn initiate_recharge(
        &self,
        amount: Decimal,
        _open_id: &str,
        session: &str,
        account_id: &str,
    ) -> Result<String, ProviderError> {
        self.sessions.lock().unwrap().push(("create".to_string(), session.to_string()));
        self.step("create")?;
        self.recharges.lock().unwrap().push((account_id.to_string(), amount));
        Ok(format!("https://pay.test/cashier?tran_no=T-{account_id}&sign=x"))
    }

    async fn verify_signable(&self, _tran_no: &str) -> Result<(), ProviderError> {
        self.step("verify")
    }

    async fn select_payment_method(&self, _tran_no: &str) -> Result<(), ProviderError> {
        self.step("choose")
    }

    async fn execute_payment(&self, _tran_no: &str) -> Result<(), ProviderError> {
        self.step("pay")
    }
}

/// Sink that records accepted messages and refuses on demand
#[derive(Default)]
pub struct RecordingSink {
    pub delivered: Mutex<Vec<(String, Value)>>,
    refused_keys: Mutex<HashSet<String>>,
    refused_text: Mutex<Vec<String>>,
    pub attempts: Mutex<usize>,
}

impl RecordingSink {
    pub fn refuse_key(&self, key: &str) {
        self.refused_keys.lock().unwrap().insert(key.to_string());
    }

    /// Refuse any message whose JSON contains `text`
    pub fn refuse_containing(&self, text: &str) {
        self.refused_text.lock().unwrap().push(text.to_string());
    }

    pub fn accept_everything(&self) {
        self.refused_keys.lock().unwrap().clear();
        self.refused_text.lock().unwrap().clear();
    }

    pub fn messages(&self) -> Vec<Value> {
        self.delivered.lock().unwrap().iter().map(|(_, m)| m.clone()).collect()
    }

    /// Titles of delivered cards, in delivery order
    pub fn titles(&self) -> Vec<String> {
        self.messages()
            .iter()
            .map(|m| m["template_card"]["main_title"]["title"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    pub fn error_cards(&self) -> usize {
        self.titles().iter().filter(|t| *t == "请求错误").count()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver(&self, params: &str, message: &Value) -> Result<(), NotifyError> {
        *self.attempts.lock().unwrap() += 1;
        if self.refused_keys.lock().unwrap().contains(params) {
            return Err(NotifyError::Rejected { code: 93000, message: "invalid webhook key".into() });
        }
        let text = message.to_string();
        if self.refused_text.lock().unwrap().iter().any(|t| text.contains(t.as_str())) {
            return Err(NotifyError::Rejected { code: 45009, message: "rate limited".into() });
        }
        self.delivered.lock().unwrap().push((params.to_string(), message.clone()));
        Ok(())
    }
}

pub struct Harness {
    pub store: SqliteStore,
    pub provider: Arc<FakeProvider>,
    pub sink: Arc<RecordingSink>,
    pub budget: Arc<ErrorBudget>,
    pub ctx: CycleContext,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_policy(TripPolicy::AbandonBatch)
    }

    pub fn with_policy(policy: TripPolicy) -> Self {
        let store = SqliteStore::open_in_memory().unwrap();
        let provider = Arc::new(FakeProvider::default());
        let sink = Arc::new(RecordingSink::default());
        let budget = Arc::new(ErrorBudget::new());

        let shared: Arc<dyn AccountStore> = Arc::new(store.clone());
        let ctx = CycleContext {
            store: Arc::clone(&shared),
            provider: provider.clone(),
            breaker: Breaker::new(Arc::clone(&budget), Arc::clone(&shared), policy),
            notifier: NotificationDispatcher::new(shared, sink.clone(), AUTH_ENDPOINT),
            batch_size: 16,
        };
        Self { store, provider, sink, budget, ctx }
    }

    /// Enrol holder `n` (external id `ext{n}`, session `sess{n}`) with one
    /// enabled WeCom channel keyed `key{n}`
    pub async fn enrol(&self, n: u32, auto_topup: bool, notify: bool, threshold: Decimal) -> ManagedAccount {
        let account = self.enrol_bare(n, auto_topup, notify, threshold).await;
        self.add_channel(account.id, &format!("key{n}"), true).await;
        account
    }

    /// Enrol without any notification channel
    pub async fn enrol_bare(&self, n: u32, auto_topup: bool, notify: bool, threshold: Decimal) -> ManagedAccount {
        let id = self
            .store
            .with_conn(move |conn| {
                let a = db::create_account(
                    conn,
                    &format!("holder{n}"),
                    &format!("ext{n}"),
                    &format!("open{n}"),
                    &format!("sess{n}"),
                )?;
                db::set_automation(conn, a.id, auto_topup, notify, threshold)?;
                Ok(a.id)
            })
            .await
            .unwrap();
        self.account(id).await
    }

    pub async fn add_channel(&self, account_id: i64, key: &str, enabled: bool) {
        let key = key.to_string();
        self.store
            .with_conn(move |conn| {
                db::create_channel(conn, account_id, "bot", &ChannelType::WeComBot, &key, enabled)
            })
            .await
            .unwrap();
    }

    pub async fn set_watermark(&self, account_id: i64, serial: i64) {
        self.store
            .with_conn(move |conn| db::update_watermark_if_higher(conn, account_id, serial))
            .await
            .unwrap();
    }

    pub async fn account(&self, id: i64) -> ManagedAccount {
        self.store
            .with_conn(|conn| db::list_accounts(conn))
            .await
            .unwrap()
            .into_iter()
            .find(|a| a.id == id)
            .unwrap()
    }
}

/// A spending row at "Shop {serial}"
pub fn row(serial: &str) -> TransactionRecord {
    row_with_fee(serial, "消费")
}

pub fn row_with_fee(serial: &str, fee: &str) -> TransactionRecord {
    TransactionRecord {
        serial_no: serial.to_string(),
        fee_name: fee.to_string(),
        money: "-12.50".to_string(),
        after_money: "87.50".to_string(),
        address: format!("Shop {serial}"),
        deal_time: "2024-03-01 12:00:00".to_string(),
        arrival_time: "2024-03-01 12:00:05".to_string(),
    }
}
