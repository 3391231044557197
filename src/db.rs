use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Result, Row};
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::models::{ChannelType, ManagedAccount, NotificationChannel};

const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
  id                          INTEGER PRIMARY KEY AUTOINCREMENT,
  name                        TEXT NOT NULL,
  external_id                 TEXT UNIQUE NOT NULL,
  open_id                     TEXT NOT NULL,
  session_token               TEXT UNIQUE NOT NULL,
  auto_topup                  INTEGER NOT NULL DEFAULT 0,
  transaction_notify          INTEGER NOT NULL DEFAULT 0,
  topup_threshold             TEXT NOT NULL DEFAULT '100', -- Decimal stored as string
  last_serial                 INTEGER NOT NULL DEFAULT 0,
  last_balance_checked_at     TEXT NOT NULL DEFAULT '1970-01-01T00:00:00.000Z',
  last_transaction_checked_at TEXT NOT NULL DEFAULT '1970-01-01T00:00:00.000Z',
  created_at                  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE IF NOT EXISTS notification_channels (
  id           INTEGER PRIMARY KEY AUTOINCREMENT,
  account_id   INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
  name         TEXT NOT NULL,
  channel_type TEXT NOT NULL,
  params       TEXT NOT NULL,
  enabled      INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_channels_account ON notification_channels(account_id);
"#;

const ACCOUNT_COLUMNS: &str = "id, name, external_id, open_id, session_token, auto_topup, \
     transaction_notify, topup_threshold, last_serial, last_balance_checked_at, \
     last_transaction_checked_at";

/// Which check timestamp a batch selection orders by and stamps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueCheck {
    Balance,
    Transaction,
}

impl DueCheck {
    fn flag_column(self) -> &'static str {
        match self {
            DueCheck::Balance => "auto_topup",
            DueCheck::Transaction => "transaction_notify",
        }
    }

    fn stamp_column(self) -> &'static str {
        match self {
            DueCheck::Balance => "last_balance_checked_at",
            DueCheck::Transaction => "last_transaction_checked_at",
        }
    }
}

/// Connect to SQLite (with WAL mode and foreign keys)
pub fn connect(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

/// Run schema migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(INIT_SQL)?;
    Ok(())
}

pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn conversion_error<E>(column: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e))
}

fn parse_timestamp(r: &Row<'_>, column: usize) -> Result<DateTime<Utc>> {
    let raw: String = r.get(column)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(column, e))
}

fn account_from_row(r: &Row<'_>) -> Result<ManagedAccount> {
    let threshold: String = r.get(7)?;
    Ok(ManagedAccount {
        id: r.get(0)?,
        name: r.get(1)?,
        external_id: r.get(2)?,
        open_id: r.get(3)?,
        session_token: r.get(4)?,
        auto_topup: r.get(5)?,
        transaction_notify: r.get(6)?,
        topup_threshold: Decimal::from_str(threshold.trim()).map_err(|e| conversion_error(7, e))?,
        last_serial: r.get(8)?,
        last_balance_checked_at: parse_timestamp(r, 9)?,
        last_transaction_checked_at: parse_timestamp(r, 10)?,
    })
}

/// Select a batch of due accounts, oldest-checked first, and stamp their
/// check timestamp in the same transaction.
pub fn select_due(
    conn: &mut Connection,
    check: DueCheck,
    batch_size: usize,
    now: DateTime<Utc>,
) -> Result<Vec<ManagedAccount>> {
    let tx = conn.transaction()?;
    let mut accounts = {
        let mut stmt = tx.prepare(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts
             WHERE {} = 1
             ORDER BY {} ASC, id ASC
             LIMIT ?1",
            check.flag_column(),
            check.stamp_column(),
        ))?;
        let rows = stmt.query_map([batch_size as i64], account_from_row)?;
        rows.collect::<Result<Vec<_>>>()?
    };

    let stamp = timestamp(now);
    for account in &mut accounts {
        tx.execute(
            &format!("UPDATE accounts SET {} = ?1 WHERE id = ?2", check.stamp_column()),
            params![stamp, account.id],
        )?;
        match check {
            DueCheck::Balance => account.last_balance_checked_at = now,
            DueCheck::Transaction => account.last_transaction_checked_at = now,
        }
    }
    tx.commit()?;
    Ok(accounts)
}

pub fn update_automation_flags(conn: &Connection, account: &ManagedAccount) -> Result<()> {
    conn.execute(
        "UPDATE accounts SET auto_topup = ?1, transaction_notify = ?2 WHERE id = ?3",
        params![account.auto_topup, account.transaction_notify, account.id],
    )?;
    Ok(())
}

pub fn update_session_token(conn: &Connection, account_id: i64, token: &str) -> Result<()> {
    conn.execute(
        "UPDATE accounts SET session_token = ?1 WHERE id = ?2",
        params![token, account_id],
    )?;
    Ok(())
}

/// Raise the stored watermark; a lower value than the stored one is a no-op.
/// Returns whether a row changed.
pub fn update_watermark_if_higher(conn: &Connection, account_id: i64, serial: i64) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE accounts SET last_serial = ?1 WHERE id = ?2 AND last_serial <= ?1",
        params![serial, account_id],
    )?;
    Ok(changed > 0)
}

pub fn channels_for_account(conn: &Connection, account_id: i64) -> Result<Vec<NotificationChannel>> {
    let mut stmt = conn.prepare(
        "SELECT id, account_id, name, channel_type, params, enabled
         FROM notification_channels
         WHERE account_id = ?1
         ORDER BY id ASC",
    )?;
    let rows = stmt.query_map([account_id], |r| {
        let channel_type: String = r.get(3)?;
        Ok(NotificationChannel {
            id: r.get(0)?,
            account_id: r.get(1)?,
            name: r.get(2)?,
            channel_type: ChannelType::parse(&channel_type),
            params: r.get(4)?,
            enabled: r.get(5)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>>>()?)
}

/// Enrol a card holder. New accounts start with automation off,
/// a threshold of 100 and watermark 0.
pub fn create_account(
    conn: &Connection,
    name: &str,
    external_id: &str,
    open_id: &str,
    session_token: &str,
) -> Result<ManagedAccount> {
    conn.execute(
        "INSERT INTO accounts (name, external_id, open_id, session_token) VALUES (?1, ?2, ?3, ?4)",
        params![name, external_id, open_id, session_token],
    )?;
    let id = conn.last_insert_rowid();
    let account = conn.query_row(
        &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
        [id],
        account_from_row,
    )?;
    Ok(account)
}

pub fn set_automation(
    conn: &Connection,
    account_id: i64,
    auto_topup: bool,
    transaction_notify: bool,
    threshold: Decimal,
) -> Result<()> {
    conn.execute(
        "UPDATE accounts SET auto_topup = ?1, transaction_notify = ?2, topup_threshold = ?3
         WHERE id = ?4",
        params![auto_topup, transaction_notify, threshold.to_string(), account_id],
    )?;
    Ok(())
}

pub fn list_accounts(conn: &Connection) -> Result<Vec<ManagedAccount>> {
    let mut stmt = conn.prepare(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY id ASC"))?;
    let rows = stmt.query_map([], account_from_row)?;
    Ok(rows.collect::<Result<Vec<_>>>()?)
}

pub fn delete_account(conn: &Connection, account_id: i64) -> Result<bool> {
    Ok(conn.execute("DELETE FROM accounts WHERE id = ?1", [account_id])? > 0)
}

pub fn create_channel(
    conn: &Connection,
    account_id: i64,
    name: &str,
    channel_type: &ChannelType,
    params: &str,
    enabled: bool,
) -> Result<NotificationChannel> {
    conn.execute(
        "INSERT INTO notification_channels (account_id, name, channel_type, params, enabled)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![account_id, name, channel_type.as_str(), params, enabled],
    )?;
    Ok(NotificationChannel {
        id: conn.last_insert_rowid(),
        account_id,
        name: name.to_string(),
        channel_type: channel_type.clone(),
        params: params.to_string(),
        enabled,
    })
}

pub fn delete_channel(conn: &Connection, channel_id: i64) -> Result<bool> {
    Ok(conn.execute("DELETE FROM notification_channels WHERE id = ?1", [channel_id])? > 0)
}
