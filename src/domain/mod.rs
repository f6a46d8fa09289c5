//! Domain types and the ports the application layer talks through.

pub mod account;
pub mod address;
pub mod key;
pub mod ports;
pub mod price;
