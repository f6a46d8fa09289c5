//! Adapters implementing the domain ports.

pub mod coindesk;
pub mod in_memory;
pub mod lnd;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
pub mod wireguard;
