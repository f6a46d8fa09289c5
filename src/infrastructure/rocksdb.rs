use crate::domain::account::{Account, AccountId};
use crate::domain::address::PoolCursor;
use crate::domain::key::PublicKey;
use crate::domain::ports::AccountStore;
use crate::error::{MeterError, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options, WriteBatch};
use std::path::Path;
use std::sync::Arc;

/// Column Family for account records, keyed by account id.
pub const CF_ACCOUNTS: &str = "accounts";
/// Column Family mapping raw 32-byte public keys to the owning account id.
pub const CF_PUBKEYS: &str = "pubkeys";
/// Column Family for singletons such as the address-pool cursor.
pub const CF_META: &str = "meta";

const POOL_CURSOR_KEY: &[u8] = b"pool_cursor";

/// A persistent account store using RocksDB.
///
/// Account records are stored as JSON. A record and its key-index entry are
/// written in one `WriteBatch`, so the index never points at a stale owner.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// Ensures that the required column families exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = [CF_ACCOUNTS, CF_PUBKEYS, CF_META]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, name: &'static str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| {
            MeterError::InternalError(Box::new(std::io::Error::other(format!(
                "{name} column family not found"
            ))))
        })
    }

    fn read_account(&self, account_id: &AccountId) -> Result<Option<Account>> {
        let cf = self.cf(CF_ACCOUNTS)?;
        match self.db.get_pinned_cf(cf, account_id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write_account(&self, account: &Account, previous: Option<&Account>) -> Result<()> {
        let accounts = self.cf(CF_ACCOUNTS)?;
        let pubkeys = self.cf(CF_PUBKEYS)?;
        let id = account.account_id.as_str().as_bytes();

        let mut batch = WriteBatch::default();
        batch.put_cf(accounts, id, serde_json::to_vec(account)?);
        if let Some(old_key) = previous.and_then(|p| p.public_key)
            && Some(old_key) != account.public_key
        {
            batch.delete_cf(pubkeys, old_key.as_bytes());
        }
        if let Some(key) = account.public_key {
            batch.put_cf(pubkeys, key.as_bytes(), id);
        }
        self.db.write(batch)?;
        Ok(())
    }
}

#[async_trait]
impl AccountStore for RocksDBStore {
    async fn insert(&self, account: Account) -> Result<()> {
        // Callers serialize writes, so check-then-put cannot race here.
        if self.read_account(&account.account_id)?.is_some() {
            return Err(MeterError::AccountIdConflict);
        }
        self.write_account(&account, None)
    }

    async fn save(&self, account: Account) -> Result<()> {
        let previous = self.read_account(&account.account_id)?;
        self.write_account(&account, previous.as_ref())
    }

    async fn get(&self, account_id: &AccountId) -> Result<Option<Account>> {
        self.read_account(account_id)
    }

    async fn find_by_key(&self, key: &PublicKey) -> Result<Option<AccountId>> {
        let cf = self.cf(CF_PUBKEYS)?;
        match self.db.get_pinned_cf(cf, key.as_bytes())? {
            Some(bytes) => {
                let id = String::from_utf8(bytes.to_vec())
                    .map_err(|e| MeterError::InternalError(Box::new(e)))?;
                Ok(Some(AccountId::from(id)))
            }
            None => Ok(None),
        }
    }

    async fn get_all(&self) -> Result<Vec<Account>> {
        let cf = self.cf(CF_ACCOUNTS)?;

        // The iterator reads from an implicit snapshot taken at creation.
        let mut accounts = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) = item?;
            accounts.push(serde_json::from_slice(&value)?);
        }

        Ok(accounts)
    }

    async fn pool_cursor(&self) -> Result<PoolCursor> {
        let cf = self.cf(CF_META)?;
        match self.db.get_pinned_cf(cf, POOL_CURSOR_KEY)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(PoolCursor::default()),
        }
    }

    async fn save_pool_cursor(&self, cursor: PoolCursor) -> Result<()> {
        let cf = self.cf(CF_META)?;
        self.db
            .put_cf(cf, POOL_CURSOR_KEY, serde_json::to_vec(&cursor)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::net::Ipv4Addr;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_rocksdb_open_cf() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).expect("Failed to open RocksDB");

        assert!(store.db.cf_handle(CF_ACCOUNTS).is_some());
        assert!(store.db.cf_handle(CF_PUBKEYS).is_some());
        assert!(store.db.cf_handle(CF_META).is_some());
    }

    #[tokio::test]
    async fn test_rocksdb_account_store() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).unwrap();

        let mut account = Account::new(AccountId::from("acct"), Utc::now());
        account.public_key = Some(PublicKey::from_bytes([7; 32]));

        store.insert(account.clone()).await.unwrap();
        assert!(matches!(
            store.insert(account.clone()).await,
            Err(MeterError::AccountIdConflict)
        ));

        let retrieved = store.get(&AccountId::from("acct")).await.unwrap().unwrap();
        assert_eq!(retrieved, account);
        assert_eq!(
            store
                .find_by_key(&PublicKey::from_bytes([7; 32]))
                .await
                .unwrap(),
            Some(AccountId::from("acct"))
        );

        let all = store.get_all().await.unwrap();
        assert_eq!(all, vec![account]);

        assert!(store.get(&AccountId::from("other")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rocksdb_replaced_key_leaves_index() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).unwrap();

        let mut account = Account::new(AccountId::from("acct"), Utc::now());
        account.public_key = Some(PublicKey::from_bytes([1; 32]));
        store.insert(account.clone()).await.unwrap();

        account.public_key = Some(PublicKey::from_bytes([2; 32]));
        store.save(account).await.unwrap();

        assert!(
            store
                .find_by_key(&PublicKey::from_bytes([1; 32]))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_rocksdb_pool_cursor() {
        let dir = tempdir().unwrap();
        let cursor = PoolCursor {
            last_v4: Some(Ipv4Addr::new(10, 0, 3, 4)),
            last_v6: None,
        };
        {
            let store = RocksDBStore::open(dir.path()).unwrap();
            assert_eq!(store.pool_cursor().await.unwrap(), PoolCursor::default());
            store.save_pool_cursor(cursor).await.unwrap();
        }

        let reopened = RocksDBStore::open(dir.path()).unwrap();
        assert_eq!(reopened.pool_cursor().await.unwrap(), cursor);
    }
}
