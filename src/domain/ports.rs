use super::account::{Account, AccountId};
use super::address::{AllowedIp, PoolCursor};
use super::key::PublicKey;
use super::price::Satoshis;
use crate::error::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::collections::HashSet;

/// Durable account records plus the address-pool cursor.
///
/// Implementations maintain a `public key -> account id` index alongside the
/// records so key uniqueness can be checked without a scan.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Persists a new record. Fails with `AccountIdConflict` if the id is taken.
    async fn insert(&self, account: Account) -> Result<()>;
    /// Overwrites an existing record and updates the key index.
    async fn save(&self, account: Account) -> Result<()>;
    async fn get(&self, account_id: &AccountId) -> Result<Option<Account>>;
    async fn find_by_key(&self, key: &PublicKey) -> Result<Option<AccountId>>;
    /// Every record, in a stable order, read from one consistent view.
    async fn get_all(&self) -> Result<Vec<Account>>;
    async fn pool_cursor(&self) -> Result<PoolCursor>;
    async fn save_pool_cursor(&self, cursor: PoolCursor) -> Result<()>;
}

pub type AccountStoreBox = Box<dyn AccountStore>;

/// One update from the payment node's invoice feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementEvent {
    pub payment_request: String,
    pub settled: bool,
}

pub type SettlementStream = BoxStream<'static, Result<SettlementEvent>>;

/// The Lightning node that mints invoices and reports their settlement.
#[async_trait]
pub trait PaymentNode: Send + Sync {
    /// Creates an invoice and returns its payment request string.
    async fn issue_invoice(&self, amount: Satoshis, memo: &str) -> Result<String>;
    /// Opens the settlement feed. The stream ends or yields an error when the
    /// underlying connection drops.
    async fn subscribe_settlements(&self) -> Result<SettlementStream>;
}

pub type PaymentNodeBox = Box<dyn PaymentNode>;

/// A single peer change on the tunnel device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerChange {
    Add {
        key: PublicKey,
        allowed_ips: Vec<AllowedIp>,
    },
    Remove {
        key: PublicKey,
    },
}

/// Management interface of the tunnel device.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn device_peers(&self, device: &str) -> Result<HashSet<PublicKey>>;
    async fn configure_device(&self, device: &str, change: PeerChange) -> Result<()>;
}

pub type ControlPlaneBox = Box<dyn ControlPlane>;

/// Source of the USD per BTC exchange rate.
#[async_trait]
pub trait RateSource: Send + Sync {
    async fn fetch_rate(&self) -> Result<f64>;
}

pub type RateSourceBox = Box<dyn RateSource>;
