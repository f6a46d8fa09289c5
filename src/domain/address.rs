use crate::error::{MeterError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// First and last assignable host of the IPv4 tunnel pool (`10.0.0.0/8`).
/// `10.0.0.1` belongs to the server side of the tunnel.
pub const IPV4_POOL_FIRST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
pub const IPV4_POOL_LAST: Ipv4Addr = Ipv4Addr::new(10, 255, 255, 254);

/// First and last assignable host of the IPv6 tunnel pool (`fd00:6d65:7465:7276::/64`).
pub const IPV6_POOL_FIRST: Ipv6Addr = Ipv6Addr::new(0xfd00, 0x6d65, 0x7465, 0x7276, 0, 0, 0, 2);
pub const IPV6_POOL_LAST: Ipv6Addr = Ipv6Addr::new(
    0xfd00, 0x6d65, 0x7465, 0x7276, 0xffff, 0xffff, 0xffff, 0xfffe,
);

/// Tunnel addresses bound to one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addresses {
    pub v4: Ipv4Addr,
    pub v6: Option<Ipv6Addr>,
}

impl Addresses {
    /// Host routes the control plane accepts traffic from for this peer.
    pub fn allowed_ips(&self) -> Vec<AllowedIp> {
        let mut allowed = vec![AllowedIp::host(IpAddr::V4(self.v4))];
        if let Some(v6) = self.v6 {
            allowed.push(AllowedIp::host(IpAddr::V6(v6)));
        }
        allowed
    }
}

/// A single allowed-traffic prefix, e.g. `10.0.0.2/32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllowedIp {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl AllowedIp {
    pub fn host(addr: IpAddr) -> Self {
        let prefix_len = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Self { addr, prefix_len }
    }
}

impl fmt::Display for AllowedIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

/// High-water mark of the address pools. Persisted by the account store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolCursor {
    pub last_v4: Option<Ipv4Addr>,
    pub last_v6: Option<Ipv6Addr>,
}

/// Bounds of the sequential address pools.
///
/// Allocation only ever moves the cursor forward; addresses are never handed out
/// twice and never reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressPool {
    pub v4_first: Ipv4Addr,
    pub v4_last: Ipv4Addr,
    pub v6_first: Ipv6Addr,
    pub v6_last: Ipv6Addr,
}

impl Default for AddressPool {
    fn default() -> Self {
        Self {
            v4_first: IPV4_POOL_FIRST,
            v4_last: IPV4_POOL_LAST,
            v6_first: IPV6_POOL_FIRST,
            v6_last: IPV6_POOL_LAST,
        }
    }
}

impl AddressPool {
    /// Takes the next pair of addresses after `cursor`.
    ///
    /// Returns the addresses together with the advanced cursor. Fails with
    /// `PoolExhausted` instead of wrapping once either pool's upper bound is reached.
    pub fn allocate(&self, cursor: &PoolCursor) -> Result<(Addresses, PoolCursor)> {
        let v4 = next_in_range(
            cursor.last_v4.map(u32::from),
            u32::from(self.v4_first),
            u32::from(self.v4_last),
        )
        .map(Ipv4Addr::from)
        .ok_or(MeterError::PoolExhausted { family: "IPv4" })?;

        let v6 = next_in_range(
            cursor.last_v6.map(u128::from),
            u128::from(self.v6_first),
            u128::from(self.v6_last),
        )
        .map(Ipv6Addr::from)
        .ok_or(MeterError::PoolExhausted { family: "IPv6" })?;

        let addresses = Addresses { v4, v6: Some(v6) };
        let cursor = PoolCursor {
            last_v4: Some(v4),
            last_v6: Some(v6),
        };
        Ok((addresses, cursor))
    }
}

fn next_in_range<T>(last: Option<T>, first: T, upper: T) -> Option<T>
where
    T: Copy + Ord + CheckedIncrement,
{
    let next = match last {
        None => first,
        Some(last) if last < first => first,
        Some(last) => last.checked_increment()?,
    };
    (next <= upper).then_some(next)
}

trait CheckedIncrement: Sized {
    fn checked_increment(self) -> Option<Self>;
}

impl CheckedIncrement for u32 {
    fn checked_increment(self) -> Option<Self> {
        self.checked_add(1)
    }
}

impl CheckedIncrement for u128 {
    fn checked_increment(self) -> Option<Self> {
        self.checked_add(1)
    }
}
