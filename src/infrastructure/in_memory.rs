use crate::domain::account::{Account, AccountId};
use crate::domain::address::PoolCursor;
use crate::domain::key::PublicKey;
use crate::domain::ports::AccountStore;
use crate::error::{MeterError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct State {
    accounts: BTreeMap<AccountId, Account>,
    keys: HashMap<PublicKey, AccountId>,
    cursor: PoolCursor,
}

impl State {
    fn reindex(&mut self, account: &Account) {
        if let Some(previous) = self.accounts.get(&account.account_id)
            && let Some(old_key) = previous.public_key
            && previous.public_key != account.public_key
        {
            self.keys.remove(&old_key);
        }
        if let Some(key) = account.public_key {
            self.keys.insert(key, account.account_id.clone());
        }
    }
}

/// A thread-safe in-memory account store.
///
/// Everything lives behind one `Arc<RwLock<..>>`, so `Clone` shares the same data.
/// Nothing survives a restart; intended for tests and for running without a database.
#[derive(Default, Clone)]
pub struct InMemoryAccountStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryAccountStore {
    /// Creates a new, empty in-memory account store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn insert(&self, account: Account) -> Result<()> {
        let mut state = self.state.write().await;
        if state.accounts.contains_key(&account.account_id) {
            return Err(MeterError::AccountIdConflict);
        }
        state.reindex(&account);
        state.accounts.insert(account.account_id.clone(), account);
        Ok(())
    }

    async fn save(&self, account: Account) -> Result<()> {
        let mut state = self.state.write().await;
        state.reindex(&account);
        state.accounts.insert(account.account_id.clone(), account);
        Ok(())
    }

    async fn get(&self, account_id: &AccountId) -> Result<Option<Account>> {
        let state = self.state.read().await;
        Ok(state.accounts.get(account_id).cloned())
    }

    async fn find_by_key(&self, key: &PublicKey) -> Result<Option<AccountId>> {
        let state = self.state.read().await;
        Ok(state.keys.get(key).cloned())
    }

    async fn get_all(&self) -> Result<Vec<Account>> {
        let state = self.state.read().await;
        Ok(state.accounts.values().cloned().collect())
    }

    async fn pool_cursor(&self) -> Result<PoolCursor> {
        Ok(self.state.read().await.cursor)
    }

    async fn save_pool_cursor(&self, cursor: PoolCursor) -> Result<()> {
        self.state.write().await.cursor = cursor;
        Ok(())
    }
}
