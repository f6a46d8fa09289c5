//! MeterVPN: time-limited WireGuard access paid for over Lightning.

pub mod application;
pub mod domain;
pub mod error;
pub mod infrastructure;
