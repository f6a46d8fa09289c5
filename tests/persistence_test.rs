#![cfg(feature = "storage-rocksdb")]

mod common;

use common::key_text;
use meter_vpn::application::ledger::AllowanceLedger;
use meter_vpn::infrastructure::rocksdb::RocksDBStore;
use std::net::Ipv4Addr;
use std::time::Duration;
use tempfile::tempdir;

#[tokio::test]
async fn test_rocksdb_persistence_recovery() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test_db");

    // 1. First run: create, key, address and credit an account
    let first = {
        let ledger = AllowanceLedger::new(Box::new(RocksDBStore::open(&db_path).unwrap()));
        let account = ledger.create_account().await.unwrap();
        ledger
            .set_public_key(&account.account_id, &key_text(1))
            .await
            .unwrap();
        ledger.allocate_addresses(&account.account_id).await.unwrap();
        ledger
            .add_allowance(&account.account_id, Duration::from_secs(3600))
            .await
            .unwrap();
        ledger.get_account(&account.account_id).await.unwrap()
    };

    // 2. Second run on the same path: state and pool cursor are recovered
    let ledger = AllowanceLedger::new(Box::new(RocksDBStore::open(&db_path).unwrap()));
    let recovered = ledger.get_account(&first.account_id).await.unwrap();
    assert_eq!(recovered, first);

    let other = ledger.create_account().await.unwrap();
    let duplicate = ledger.set_public_key(&other.account_id, &key_text(1)).await;
    assert!(duplicate.is_err());

    let addresses = ledger.allocate_addresses(&other.account_id).await.unwrap();
    assert_eq!(addresses.v4, Ipv4Addr::new(10, 0, 0, 3));
}
