use crate::application::ledger::AllowanceLedger;
use crate::application::price::PriceTracker;
use crate::domain::account::{AccountId, extended_expiry};
use crate::domain::ports::{PaymentNodeBox, SettlementEvent, SettlementStream};
use crate::domain::price::Satoshis;
use crate::error::{MeterError, Result};
use chrono::{TimeDelta, Utc};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub const DEFAULT_MAX_ALLOWANCE: Duration = Duration::from_secs(30 * 24 * 60 * 60);
pub const DEFAULT_SETTLEMENT_BACKOFF: Duration = Duration::from_secs(15);
/// Twice LND's default invoice expiry of one hour.
pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Furthest into the future an allowance may reach after a purchase.
    pub max_allowance: Duration,
    /// Pause before resubscribing after the settlement feed fails or ends.
    pub settlement_backoff: Duration,
    /// Age after which an unpaid invoice is forgotten. Must outlive the node's invoice expiry.
    pub pending_ttl: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_allowance: DEFAULT_MAX_ALLOWANCE,
            settlement_backoff: DEFAULT_SETTLEMENT_BACKOFF,
            pending_ttl: DEFAULT_PENDING_TTL,
        }
    }
}

/// An issued, unpaid invoice for more allowance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionInvoice {
    pub payment_request: String,
    pub amount: Satoshis,
    pub duration: Duration,
}

/// Outcome of waiting on a payment request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Completed,
    TimedOut,
    /// Unknown, already completed, or abandoned payment request.
    NotFound,
}

impl Completion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Completion::Completed => "completed",
            Completion::TimedOut => "timeout",
            Completion::NotFound => "not found",
        }
    }
}

struct PendingExtension {
    account_id: AccountId,
    duration: Duration,
    completed: watch::Sender<bool>,
    issued_at: Instant,
}

/// Sells allowance over Lightning.
///
/// Invoices are minted through the payment node and tracked in an in-memory
/// pending table keyed by payment request. A settlement consumer removes each
/// entry when its invoice settles, credits the account and wakes every waiter.
/// The pending table is lost on restart; invoices settled while the process is
/// down are never credited. Entries older than `pending_ttl` are dropped the next
/// time an invoice is issued, which wakes their waiters with `NotFound`.
pub struct PaymentGateway {
    ledger: Arc<AllowanceLedger>,
    node: PaymentNodeBox,
    prices: Arc<PriceTracker>,
    pending: Mutex<HashMap<String, PendingExtension>>,
    config: GatewayConfig,
}

impl PaymentGateway {
    pub fn new(
        ledger: Arc<AllowanceLedger>,
        node: PaymentNodeBox,
        prices: Arc<PriceTracker>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            ledger,
            node,
            prices,
            pending: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Issues an invoice for `duration` of additional access.
    ///
    /// The price is the hourly satoshi rate times the purchased hours, rounded up.
    /// The invoice is only returned once its pending entry is recorded; any
    /// failure along the way yields no payment request.
    pub async fn request_extension(
        &self,
        account_id: &AccountId,
        duration: Duration,
    ) -> Result<ExtensionInvoice> {
        if duration.is_zero() {
            return Err(MeterError::ValidationError(
                "Duration must be positive".to_string(),
            ));
        }

        let account = self.ledger.get_account(account_id).await?;
        let now = Utc::now();
        let projected = extended_expiry(account.expiry, duration, now)?;
        let horizon = TimeDelta::from_std(self.config.max_allowance)
            .ok()
            .and_then(|max| now.checked_add_signed(max));
        if horizon.is_some_and(|horizon| projected > horizon) {
            return Err(MeterError::ValidationError(format!(
                "Allowance cannot extend beyond {}",
                humanize(self.config.max_allowance)
            )));
        }

        let snapshot = self.prices.snapshot().await?;
        let amount = snapshot.price_for(duration)?;
        let memo = format!("Add {} to MeterVPN allowance", humanize(duration));

        let payment_request = self.node.issue_invoice(amount, &memo).await?;

        let mut pending = self.pending.lock().await;
        let dropped = retain_fresh(&mut pending, self.config.pending_ttl);
        if dropped > 0 {
            debug!(dropped, "Dropped unpaid invoices past their lifetime");
        }
        match pending.entry(payment_request.clone()) {
            Entry::Occupied(_) => {
                return Err(MeterError::UpstreamError(
                    "Payment node returned a payment request that is already pending".to_string(),
                ));
            }
            Entry::Vacant(slot) => {
                let (completed, _) = watch::channel(false);
                slot.insert(PendingExtension {
                    account_id: account_id.clone(),
                    duration,
                    completed,
                    issued_at: Instant::now(),
                });
            }
        }
        drop(pending);

        info!(account_id = %account_id, amount = %amount, ?duration, "Invoice issued");
        Ok(ExtensionInvoice {
            payment_request,
            amount,
            duration,
        })
    }

    /// Waits until `payment_request` is settled and credited, or `timeout` passes.
    ///
    /// Only the caller is suspended. Timing out leaves the invoice payable.
    pub async fn await_completion(&self, payment_request: &str, timeout: Duration) -> Completion {
        let mut receiver = {
            let pending = self.pending.lock().await;
            match pending.get(payment_request) {
                Some(entry) => entry.completed.subscribe(),
                None => return Completion::NotFound,
            }
        };

        let waited = tokio::time::timeout(timeout, async {
            receiver.wait_for(|completed| *completed).await.map(|_| ())
        })
        .await;

        match waited {
            Ok(Ok(())) => Completion::Completed,
            // The sender was dropped without completing.
            Ok(Err(_)) => Completion::NotFound,
            Err(_) => Completion::TimedOut,
        }
    }

    /// Applies one event from the settlement feed.
    ///
    /// Returns `true` if a pending extension was credited. Unsettled events and
    /// payment requests this process did not issue are ignored, which also makes
    /// redelivery harmless. If the credit fails the entry is restored so a later
    /// redelivery can apply it.
    pub async fn apply_settlement(&self, event: SettlementEvent) -> Result<bool> {
        if !event.settled {
            return Ok(false);
        }

        let entry = self.pending.lock().await.remove(&event.payment_request);
        let Some(entry) = entry else {
            debug!("Ignoring settlement for unknown payment request");
            return Ok(false);
        };

        match self.ledger.add_allowance(&entry.account_id, entry.duration).await {
            Ok(expiry) => {
                info!(account_id = %entry.account_id, expiry = %expiry, "Payment settled");
                entry.completed.send_replace(true);
                Ok(true)
            }
            Err(e) => {
                error!(account_id = %entry.account_id, error = %e, "Failed to credit settled payment");
                self.pending
                    .lock()
                    .await
                    .insert(event.payment_request, entry);
                Err(e)
            }
        }
    }

    /// Consumes the settlement feed forever, resubscribing after a fixed backoff
    /// whenever the subscription fails or the stream ends.
    pub async fn run_settlements(&self) {
        loop {
            match self.node.subscribe_settlements().await {
                Ok(stream) => {
                    info!("Subscribed to invoice settlements");
                    self.consume(stream).await;
                }
                Err(e) => error!(error = %e, "Could not subscribe to invoice settlements"),
            }
            tokio::time::sleep(self.config.settlement_backoff).await;
        }
    }

    async fn consume(&self, mut stream: SettlementStream) {
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => {
                    if let Err(e) = self.apply_settlement(event).await {
                        error!(error = %e, "Settlement not applied");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Settlement stream failed");
                    return;
                }
            }
        }
        warn!("Settlement stream ended");
    }

    /// Forgets unpaid invoices older than `pending_ttl` and returns how many were dropped.
    pub async fn prune_expired(&self) -> usize {
        let mut pending = self.pending.lock().await;
        retain_fresh(&mut pending, self.config.pending_ttl)
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }
}

fn retain_fresh(pending: &mut HashMap<String, PendingExtension>, ttl: Duration) -> usize {
    let before = pending.len();
    pending.retain(|_, entry| entry.issued_at.elapsed() < ttl);
    before - pending.len()
}

/// Renders a duration as e.g. `1 day 2 hours` for invoice memos.
pub fn humanize(duration: Duration) -> String {
    const UNITS: [(u64, &str); 4] = [(86_400, "day"), (3_600, "hour"), (60, "minute"), (1, "second")];

    let mut remaining = duration.as_secs();
    if remaining == 0 {
        return format!("{} ms", duration.as_millis());
    }

    let mut parts = Vec::new();
    for (size, name) in UNITS {
        let count = remaining / size;
        remaining %= size;
        match count {
            0 => {}
            1 => parts.push(format!("1 {name}")),
            n => parts.push(format!("{n} {name}s")),
        }
    }
    parts.join(" ")
}
