use super::address::Addresses;
use super::key::PublicKey;
use crate::error::{MeterError, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, TimeDelta, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

/// Number of random bytes behind an account id.
pub const ACCOUNT_ID_BYTES: usize = 12;

/// Opaque, server-generated account token.
///
/// The id doubles as the purchaser's login cookie, so it is drawn from the OS
/// CSPRNG and encoded URL-safe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; ACCOUNT_ID_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AccountId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AccountId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One purchaser of tunnel time.
///
/// Allowance is stored as an absolute expiry: the account is active while
/// `now < expiry`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub account_id: AccountId,
    /// Unset until the client registers its tunnel identity.
    pub public_key: Option<PublicKey>,
    pub address_v4: Option<Ipv4Addr>,
    pub address_v6: Option<Ipv6Addr>,
    pub expiry: DateTime<Utc>,
    /// Last known control-plane state. Only a hint, never authoritative.
    #[serde(default)]
    pub connected: bool,
}

impl Account {
    /// A fresh account with zero allowance.
    pub fn new(account_id: AccountId, now: DateTime<Utc>) -> Self {
        Self {
            account_id,
            public_key: None,
            address_v4: None,
            address_v6: None,
            expiry: now,
            connected: false,
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expiry
    }

    /// Time left before the allowance runs out.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expiry - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Extends the allowance by `duration`.
    ///
    /// A lapsed allowance restarts from `now`: time that already passed is never
    /// banked, so the new expiry is `max(now, expiry) + duration`.
    pub fn add_allowance(&mut self, duration: Duration, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        self.expiry = extended_expiry(self.expiry, duration, now)?;
        Ok(self.expiry)
    }

    pub fn addresses(&self) -> Option<Addresses> {
        self.address_v4.map(|v4| Addresses {
            v4,
            v6: self.address_v6,
        })
    }

    pub fn bind_addresses(&mut self, addresses: Addresses) {
        self.address_v4 = Some(addresses.v4);
        self.address_v6 = addresses.v6;
    }
}

/// Expiry an account would have after buying `duration` at `now`.
pub fn extended_expiry(
    expiry: DateTime<Utc>,
    duration: Duration,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let delta = TimeDelta::from_std(duration)
        .map_err(|_| MeterError::ValidationError("Duration is too long".to_string()))?;
    expiry
        .max(now)
        .checked_add_signed(delta)
        .ok_or_else(|| MeterError::ValidationError("Duration is too long".to_string()))
}
