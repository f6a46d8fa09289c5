use crate::domain::price::{PriceSnapshot, Tariff, rate_from_f64};
use crate::domain::ports::RateSourceBox;
use crate::error::{MeterError, Result};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Converts the fiat tariff into satoshis at the latest known BTC/USD rate.
///
/// Every snapshot attempts a fresh rate. When the source fails the last observed
/// rate is reused, so pricing keeps working through rate-source outages.
pub struct PriceTracker {
    source: RateSourceBox,
    tariff: Tariff,
    last_rate: RwLock<Option<Decimal>>,
}

impl PriceTracker {
    /// `seed` stands in for the last observed rate until the first fetch succeeds.
    pub fn new(source: RateSourceBox, tariff: Tariff, seed: Option<Decimal>) -> Self {
        Self {
            source,
            tariff,
            last_rate: RwLock::new(seed),
        }
    }

    pub fn tariff(&self) -> &Tariff {
        &self.tariff
    }

    pub async fn snapshot(&self) -> Result<PriceSnapshot> {
        // Fetch before taking the lock.
        let fetched = self
            .source
            .fetch_rate()
            .await
            .and_then(rate_from_f64)
            .and_then(|rate| PriceSnapshot::at_rate(&self.tariff, rate));

        match fetched {
            Ok(snapshot) => {
                // Only a rate that priced successfully is remembered.
                *self.last_rate.write().await = Some(snapshot.rate);
                debug!(rate = %snapshot.rate, "Exchange rate refreshed");
                Ok(snapshot)
            }
            Err(e) => {
                let cached = *self.last_rate.read().await;
                match cached {
                    Some(rate) => {
                        warn!(error = %e, rate = %rate, "Rate lookup failed, using last known rate");
                        PriceSnapshot::at_rate(&self.tariff, rate)
                    }
                    None => Err(MeterError::upstream("No exchange rate available", e)),
                }
            }
        }
    }

    pub async fn last_rate(&self) -> Option<Decimal> {
        *self.last_rate.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::RateSource;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays a fixed script of rate lookups.
    struct ScriptedRates(Mutex<VecDeque<Option<f64>>>);

    impl ScriptedRates {
        fn boxed(script: &[Option<f64>]) -> RateSourceBox {
            Box::new(Self(Mutex::new(script.iter().copied().collect())))
        }
    }

    #[async_trait]
    impl RateSource for ScriptedRates {
        async fn fetch_rate(&self) -> Result<f64> {
            let next = self.0.lock().unwrap().pop_front().flatten();
            next.ok_or_else(|| MeterError::UpstreamError("rate source down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_snapshot_uses_fresh_rate() {
        let tracker = PriceTracker::new(ScriptedRates::boxed(&[Some(40_000.0)]), Tariff::default(), None);
        let snapshot = tracker.snapshot().await.unwrap();
        assert_eq!(snapshot.rate, dec!(40000));
        assert_eq!(snapshot.satoshi.month, dec!(10_000));
        assert_eq!(tracker.last_rate().await, Some(dec!(40000)));
    }

    #[tokio::test]
    async fn test_failed_lookup_reuses_last_rate() {
        let tracker = PriceTracker::new(
            ScriptedRates::boxed(&[Some(40_000.0), None]),
            Tariff::default(),
            None,
        );
        let first = tracker.snapshot().await.unwrap();
        let second = tracker.snapshot().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_seed_rate_covers_first_failure() {
        let tracker = PriceTracker::new(
            ScriptedRates::boxed(&[None]),
            Tariff::default(),
            Some(dec!(50_000)),
        );
        let snapshot = tracker.snapshot().await.unwrap();
        assert_eq!(snapshot.rate, dec!(50_000));
    }

    #[tokio::test]
    async fn test_no_rate_at_all_is_an_upstream_error() {
        let tracker = PriceTracker::new(ScriptedRates::boxed(&[None]), Tariff::default(), None);
        let result = tracker.snapshot().await;
        assert!(matches!(result, Err(MeterError::UpstreamError(_))));
    }

    #[tokio::test]
    async fn test_nonsense_rate_falls_back() {
        let tracker = PriceTracker::new(
            ScriptedRates::boxed(&[Some(40_000.0), Some(-3.0)]),
            Tariff::default(),
            None,
        );
        tracker.snapshot().await.unwrap();
        let snapshot = tracker.snapshot().await.unwrap();
        assert_eq!(snapshot.rate, dec!(40000));
    }

    #[tokio::test]
    async fn test_overflowing_rate_falls_back_and_is_not_cached() {
        let tracker = PriceTracker::new(
            ScriptedRates::boxed(&[Some(40_000.0), Some(1e-22), None]),
            Tariff::default(),
            None,
        );
        let first = tracker.snapshot().await.unwrap();

        let second = tracker.snapshot().await.unwrap();
        assert_eq!(second, first);
        assert_eq!(tracker.last_rate().await, Some(dec!(40000)));

        // The source is down now and the cached rate still prices.
        let third = tracker.snapshot().await.unwrap();
        assert_eq!(third.rate, dec!(40000));
    }
}
