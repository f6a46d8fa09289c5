use crate::error::{MeterError, Result};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

pub const SATS_PER_BTC: Decimal = dec!(100_000_000);
pub const DEFAULT_MONTHLY_USD: Decimal = dec!(4.00);

const DAYS_PER_MONTH: Decimal = dec!(30.5);
const HOURS_PER_DAY: Decimal = dec!(24);
const MILLIS_PER_HOUR: Decimal = dec!(3_600_000);

/// The single flat fiat tariff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tariff {
    monthly: Decimal,
}

impl Default for Tariff {
    fn default() -> Self {
        Self {
            monthly: DEFAULT_MONTHLY_USD,
        }
    }
}

impl Tariff {
    pub fn monthly(monthly: Decimal) -> Result<Self> {
        if monthly > Decimal::ZERO {
            Ok(Self { monthly })
        } else {
            Err(MeterError::ValidationError(
                "Monthly tariff must be positive".to_string(),
            ))
        }
    }

    pub fn month(&self) -> Decimal {
        self.monthly
    }

    pub fn day(&self) -> Decimal {
        self.monthly / DAYS_PER_MONTH
    }

    pub fn hour(&self) -> Decimal {
        self.day() / HOURS_PER_DAY
    }
}

/// Prices for one month, day and hour of access in a single unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PeriodPrices {
    pub month: Decimal,
    pub day: Decimal,
    pub hour: Decimal,
}

/// Tariff expressed in USD and satoshis at one observed BTC/USD rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriceSnapshot {
    pub usd: PeriodPrices,
    pub satoshi: PeriodPrices,
    /// USD per BTC the satoshi prices were derived from.
    pub rate: Decimal,
}

impl PriceSnapshot {
    /// Fails when the rate is so small that the satoshi prices leave `Decimal`'s range.
    pub fn at_rate(tariff: &Tariff, rate: Decimal) -> Result<Self> {
        let to_sats = |usd: Decimal| {
            usd.checked_div(rate)
                .and_then(|btc| btc.checked_mul(SATS_PER_BTC))
                .ok_or_else(|| {
                    MeterError::UpstreamError(format!("Exchange rate {rate} cannot price {usd} USD"))
                })
        };
        Ok(Self {
            usd: PeriodPrices {
                month: tariff.month(),
                day: tariff.day(),
                hour: tariff.hour(),
            },
            satoshi: PeriodPrices {
                month: to_sats(tariff.month())?,
                day: to_sats(tariff.day())?,
                hour: to_sats(tariff.hour())?,
            },
            rate,
        })
    }

    /// Amount to charge for `duration` of access, rounded up to the next whole satoshi.
    pub fn price_for(&self, duration: Duration) -> Result<Satoshis> {
        let hours = Decimal::from(duration.as_millis() as u64) / MILLIS_PER_HOUR;
        let amount = hours.checked_mul(self.satoshi.hour).ok_or_else(|| {
            MeterError::ValidationError(format!("Unpayable duration: {duration:?}"))
        })?;
        Satoshis::ceil_from(amount)
    }
}

/// A whole number of satoshis, the smallest payable unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Satoshis(u64);

impl Satoshis {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Never undercharges: any fractional satoshi is rounded up.
    pub fn ceil_from(amount: Decimal) -> Result<Self> {
        amount
            .ceil()
            .to_u64()
            .map(Self)
            .ok_or_else(|| MeterError::ValidationError(format!("Unpayable amount: {amount}")))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Satoshis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sat", self.0)
    }
}

/// Converts a raw rate from a rate source, refusing values that cannot price anything.
pub fn rate_from_f64(rate: f64) -> Result<Decimal> {
    let rate = Decimal::try_from(rate)
        .map_err(|e| MeterError::upstream("Invalid exchange rate", e))?;
    if rate <= Decimal::ZERO {
        return Err(MeterError::UpstreamError(format!(
            "Exchange rate must be positive, got {rate}"
        )));
    }
    Ok(rate)
}
