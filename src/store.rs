//! Account store port and its SQLite adapter.
//!
//! The reconcilers only see [`AccountStore`]. [`SqliteStore`] runs the
//! blocking `db` queries on the blocking pool behind one shared connection.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::Connection;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::task;

use crate::db::{self, DueCheck};
use crate::models::{ManagedAccount, NotificationChannel};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("database task failed: {0}")]
    Join(#[from] task::JoinError),

    #[error("database connection lock poisoned")]
    Poisoned,
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Up to `batch_size` accounts with auto-topup on, oldest balance check
    /// first. Selected rows get their balance-check timestamp stamped.
    async fn select_due_for_balance_check(
        &self,
        batch_size: usize,
    ) -> Result<Vec<ManagedAccount>, StoreError>;

    /// Same as the balance variant, for transaction-notify accounts.
    async fn select_due_for_transaction_check(
        &self,
        batch_size: usize,
    ) -> Result<Vec<ManagedAccount>, StoreError>;

    async fn update_automation_flags(&self, account: &ManagedAccount) -> Result<(), StoreError>;

    async fn update_session_token(
        &self,
        account: &ManagedAccount,
        token: &str,
    ) -> Result<(), StoreError>;

    /// Conditional update: the stored watermark is only ever raised.
    async fn update_watermark_if_higher(
        &self,
        account: &ManagedAccount,
        serial: i64,
    ) -> Result<(), StoreError>;

    async fn channels_for_account(
        &self,
        account_id: i64,
    ) -> Result<Vec<NotificationChannel>, StoreError>;
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Fresh migrated in-memory database, used by tests and dry runs
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        db::run_migrations(&conn)?;
        Ok(Self::new(Arc::new(Mutex::new(conn))))
    }

    /// Run `f` against the shared connection on the blocking pool
    pub async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || -> Result<T, StoreError> {
            let mut db = conn.lock().map_err(|_| StoreError::Poisoned)?;
            Ok(f(&mut *db)?)
        })
        .await?
    }
}

#[async_trait]
impl AccountStore for SqliteStore {
    async fn select_due_for_balance_check(
        &self,
        batch_size: usize,
    ) -> Result<Vec<ManagedAccount>, StoreError> {
        self.with_conn(move |db| db::select_due(db, DueCheck::Balance, batch_size, Utc::now()))
            .await
    }

    async fn select_due_for_transaction_check(
        &self,
        batch_size: usize,
    ) -> Result<Vec<ManagedAccount>, StoreError> {
        self.with_conn(move |db| db::select_due(db, DueCheck::Transaction, batch_size, Utc::now()))
            .await
    }

    async fn update_automation_flags(&self, account: &ManagedAccount) -> Result<(), StoreError> {
        let account = account.clone();
        self.with_conn(move |db| db::update_automation_flags(db, &account))
            .await
    }

    async fn update_session_token(
        &self,
        account: &ManagedAccount,
        token: &str,
    ) -> Result<(), StoreError> {
        let (id, token) = (account.id, token.to_string());
        self.with_conn(move |db| db::update_session_token(db, id, &token))
            .await
    }

    async fn update_watermark_if_higher(
        &self,
        account: &ManagedAccount,
        serial: i64,
    ) -> Result<(), StoreError> {
        let id = account.id;
        self.with_conn(move |db| db::update_watermark_if_higher(db, id, serial).map(|_| ()))
            .await
    }

    async fn channels_for_account(
        &self,
        account_id: i64,
    ) -> Result<Vec<NotificationChannel>, StoreError> {
        self.with_conn(move |db| db::channels_for_account(db, account_id))
            .await
    }
}
