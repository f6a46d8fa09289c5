use crate::domain::account::{Account, AccountId};
use crate::domain::address::{AddressPool, Addresses};
use crate::domain::key::PublicKey;
use crate::domain::ports::AccountStoreBox;
use crate::error::{MeterError, Result};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Fresh tokens are retried this many times when the store reports an id collision.
const CREATE_ATTEMPTS: usize = 5;

/// The allowance and peer ledger.
///
/// `AllowanceLedger` owns every mutation of persisted accounts. Reads go straight
/// to the store; each read-modify-write runs under `write_lock`, so a settlement
/// credit and a reconciliation hint update on the same account never lose each
/// other's write. The lock is only held across store calls.
pub struct AllowanceLedger {
    store: AccountStoreBox,
    pool: AddressPool,
    write_lock: Mutex<()>,
}

impl AllowanceLedger {
    /// Creates a ledger over `store` using the default tunnel address pools.
    pub fn new(store: AccountStoreBox) -> Self {
        Self::with_pool(store, AddressPool::default())
    }

    pub fn with_pool(store: AccountStoreBox, pool: AddressPool) -> Self {
        Self {
            store,
            pool,
            write_lock: Mutex::new(()),
        }
    }

    /// Creates and persists an account with zero allowance (`expiry = now`).
    pub async fn create_account(&self) -> Result<Account> {
        let _guard = self.write_lock.lock().await;
        for _ in 0..CREATE_ATTEMPTS {
            let account = Account::new(AccountId::generate(), Utc::now());
            match self.store.insert(account.clone()).await {
                Ok(()) => {
                    info!(account_id = %account.account_id, "Account created");
                    return Ok(account);
                }
                Err(MeterError::AccountIdConflict) => {
                    warn!("Generated account id collided, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(MeterError::AccountIdConflict)
    }

    pub async fn get_account(&self, account_id: &AccountId) -> Result<Account> {
        self.store
            .get(account_id)
            .await?
            .ok_or(MeterError::AccountNotFound)
    }

    /// Registers the account's tunnel public key.
    ///
    /// The key text is validated before anything is stored. A key owned by a
    /// different account is rejected with `DuplicateKey`; setting the same key
    /// again is a no-op. Once bound, a key cannot be swapped for another one,
    /// because the old key would otherwise keep its tunnel peer.
    pub async fn set_public_key(&self, account_id: &AccountId, key_text: &str) -> Result<Account> {
        let key: PublicKey = key_text.parse()?;

        let _guard = self.write_lock.lock().await;
        let mut account = self.get_account(account_id).await?;

        if let Some(owner) = self.store.find_by_key(&key).await?
            && owner != *account_id
        {
            return Err(MeterError::DuplicateKey);
        }

        match account.public_key {
            Some(existing) if existing == key => return Ok(account),
            Some(_) => {
                return Err(MeterError::ValidationError(
                    "A different public key is already registered".to_string(),
                ));
            }
            None => {}
        }

        account.public_key = Some(key);
        self.store.save(account.clone()).await?;
        info!(account_id = %account_id, public_key = %key, "Public key registered");
        Ok(account)
    }

    /// Binds tunnel addresses to the account, once.
    ///
    /// Calling this again returns the addresses already bound. Otherwise the next
    /// value of each pool is taken; the advanced pool cursor is persisted before
    /// the account so a crash in between burns an address instead of reusing one.
    pub async fn allocate_addresses(&self, account_id: &AccountId) -> Result<Addresses> {
        let _guard = self.write_lock.lock().await;
        let mut account = self.get_account(account_id).await?;
        if let Some(addresses) = account.addresses() {
            return Ok(addresses);
        }

        let cursor = self.store.pool_cursor().await?;
        let (addresses, cursor) = self.pool.allocate(&cursor)?;
        self.store.save_pool_cursor(cursor).await?;

        account.bind_addresses(addresses);
        self.store.save(account).await?;
        info!(account_id = %account_id, v4 = %addresses.v4, v6 = ?addresses.v6, "Addresses allocated");
        Ok(addresses)
    }

    /// Credits `duration` of access and returns the new expiry.
    pub async fn add_allowance(
        &self,
        account_id: &AccountId,
        duration: Duration,
    ) -> Result<DateTime<Utc>> {
        let _guard = self.write_lock.lock().await;
        let mut account = self.get_account(account_id).await?;
        let expiry = account.add_allowance(duration, Utc::now())?;
        self.store.save(account).await?;
        info!(account_id = %account_id, expiry = %expiry, "Allowance extended");
        Ok(expiry)
    }

    /// Updates the `connected` hint. Skips the write if nothing changes.
    pub async fn set_connected(&self, account_id: &AccountId, connected: bool) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut account = self.get_account(account_id).await?;
        if account.connected != connected {
            account.connected = connected;
            self.store.save(account).await?;
            debug!(account_id = %account_id, connected, "Connected hint updated");
        }
        Ok(())
    }

    /// Every account with a registered public key.
    pub async fn list_keyed(&self) -> Result<Vec<Account>> {
        let accounts = self.store.get_all().await?;
        Ok(accounts
            .into_iter()
            .filter(|account| account.public_key.is_some())
            .collect())
    }

    pub async fn list_all(&self) -> Result<Vec<Account>> {
        self.store.get_all().await
    }
}
