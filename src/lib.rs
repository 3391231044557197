//! Background account maintenance for campus prepaid cards: periodic balance
//! top-ups and new-transaction notifications, guarded by a per-session
//! circuit breaker.

pub mod balance;
pub mod budget;
pub mod config;
pub mod cycle;
pub mod db;
pub mod gateway;
pub mod models;
pub mod notify;
pub mod provider;
pub mod store;
pub mod transactions;

pub use balance::{BalanceReconciler, BalanceTick};
pub use budget::{Breaker, ErrorBudget, TripPolicy};
pub use cycle::{shutdown_channel, CycleContext, Shutdown};
pub use models::{ChannelType, ManagedAccount, NotificationChannel, TransactionPage, TransactionRecord};
pub use notify::{NotificationDispatcher, NotificationSink};
pub use provider::{AccountProvider, ProviderError, Reply};
pub use store::{AccountStore, SqliteStore, StoreError};
pub use transactions::{TransactionReconciler, TransactionTick};
