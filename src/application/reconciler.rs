use crate::application::ledger::AllowanceLedger;
use crate::domain::account::Account;
use crate::domain::key::PublicKey;
use crate::domain::ports::{ControlPlaneBox, PeerChange};
use crate::error::Result;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

pub const DEFAULT_DEVICE: &str = "wg0";
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(15);
const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Name of the tunnel device, e.g. `wg0`.
    pub device: String,
    pub interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            device: DEFAULT_DEVICE.to_string(),
            interval: DEFAULT_INTERVAL,
        }
    }
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub connected: usize,
    pub disconnected: usize,
    /// Active accounts that could not be connected because they have no addresses.
    pub skipped: usize,
    pub failed: usize,
}

impl TickReport {
    /// Number of commands sent to the control plane, successful or not.
    pub fn commands(&self) -> usize {
        self.connected + self.disconnected + self.failed
    }
}

enum Action {
    Connect,
    Disconnect,
}

/// Drives the tunnel device toward the ledger.
///
/// Each tick diffs the live peer set against every keyed account: active and
/// absent peers are added, expired and present peers are removed. Peers the
/// ledger does not know about are left alone.
pub struct Reconciler {
    ledger: Arc<AllowanceLedger>,
    control: ControlPlaneBox,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(ledger: Arc<AllowanceLedger>, control: ControlPlaneBox, config: ReconcilerConfig) -> Self {
        Self {
            ledger,
            control,
            config,
        }
    }

    /// Ticks forever. A slow tick delays the next one instead of overlapping it.
    pub async fn run(&self) {
        info!(device = %self.config.device, interval = ?self.config.interval, "Reconciliation loop started");
        // `interval` panics on a zero period.
        let mut interval = tokio::time::interval(self.config.interval.max(MIN_INTERVAL));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match self.tick().await {
                Ok(report) if report.commands() > 0 => {
                    info!(?report, "Reconciliation tick applied changes");
                }
                Ok(_) => debug!("Reconciliation tick found nothing to do"),
                Err(e) => error!(error = %e, "Reconciliation tick aborted"),
            }
        }
    }

    /// One reconciliation pass.
    ///
    /// Fails only when the live peer set or the account list cannot be read;
    /// failures on individual accounts are logged and counted.
    pub async fn tick(&self) -> Result<TickReport> {
        let now = Utc::now();
        let device = self.config.device.as_str();

        let live = self.control.device_peers(device).await?;
        let accounts = self.ledger.list_keyed().await?;

        let mut report = TickReport::default();
        for account in accounts {
            self.reconcile(&account, &live, now, &mut report).await;
        }
        Ok(report)
    }

    async fn reconcile(
        &self,
        account: &Account,
        live: &HashSet<PublicKey>,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) {
        let Some(key) = account.public_key else {
            return;
        };
        let present = live.contains(&key);
        let active = account.is_active(now);
        debug!(account_id = %account.account_id, public_key = %key, expiry = %account.expiry, active, present, "Checking peer");

        let (action, change) = match (active, present) {
            (true, false) => {
                let Some(addresses) = account.addresses() else {
                    warn!(account_id = %account.account_id, "Active peer has no addresses, not connecting");
                    report.skipped += 1;
                    return;
                };
                let change = PeerChange::Add {
                    key,
                    allowed_ips: addresses.allowed_ips(),
                };
                (Action::Connect, change)
            }
            (false, true) => (Action::Disconnect, PeerChange::Remove { key }),
            _ => {
                self.refresh_hint(account, present).await;
                return;
            }
        };

        if let Err(e) = self.control.configure_device(&self.config.device, change).await {
            error!(account_id = %account.account_id, public_key = %key, error = %e, "Control plane command failed");
            report.failed += 1;
            return;
        }

        let connected = match action {
            Action::Connect => {
                info!(account_id = %account.account_id, public_key = %key, "Peer connected");
                report.connected += 1;
                true
            }
            Action::Disconnect => {
                info!(account_id = %account.account_id, public_key = %key, "Peer out of allowance, disconnected");
                report.disconnected += 1;
                false
            }
        };
        self.refresh_hint(account, connected).await;
    }

    async fn refresh_hint(&self, account: &Account, connected: bool) {
        if account.connected == connected {
            return;
        }
        if let Err(e) = self.ledger.set_connected(&account.account_id, connected).await {
            warn!(account_id = %account.account_id, error = %e, "Could not update connected hint");
        }
    }
}
