use clap::Parser;
use meter_vpn::application::gateway::{GatewayConfig, PaymentGateway};
use meter_vpn::application::ledger::AllowanceLedger;
use meter_vpn::application::price::PriceTracker;
use meter_vpn::application::reconciler::{DEFAULT_DEVICE, Reconciler, ReconcilerConfig};
use meter_vpn::application::service::MeterService;
use meter_vpn::domain::ports::AccountStoreBox;
use meter_vpn::domain::price::Tariff;
use meter_vpn::infrastructure::coindesk::{CoindeskRateSource, DEFAULT_RATE_URL};
use meter_vpn::infrastructure::in_memory::InMemoryAccountStore;
use meter_vpn::infrastructure::lnd::{LndClient, LndConfig};
#[cfg(feature = "storage-rocksdb")]
use meter_vpn::infrastructure::rocksdb::RocksDBStore;
use meter_vpn::infrastructure::wireguard::WgCli;
use miette::{IntoDiagnostic, Result};
use rust_decimal::Decimal;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, env = "METERVPN_DB_PATH")]
    db_path: Option<PathBuf>,

    /// WireGuard device whose peers are managed
    #[arg(long, env = "METERVPN_DEVICE", default_value = DEFAULT_DEVICE)]
    device: String,

    /// The `wg` executable
    #[arg(long, env = "METERVPN_WG", default_value = "wg")]
    wg: String,

    /// Seconds between reconciliation ticks
    #[arg(
        long,
        env = "METERVPN_INTERVAL_SECS",
        default_value_t = 15,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    interval_secs: u64,

    /// LND REST endpoint
    #[arg(long, env = "METERVPN_LND_URL", default_value = "https://localhost:8080")]
    lnd_url: String,

    /// LND macaroon file
    #[arg(long, env = "METERVPN_MACAROON_PATH")]
    macaroon_path: PathBuf,

    /// LND TLS certificate (PEM)
    #[arg(long, env = "METERVPN_CERT_PATH")]
    cert_path: PathBuf,

    /// Seconds to wait before resubscribing to invoice settlements
    #[arg(
        long,
        env = "METERVPN_SETTLEMENT_BACKOFF_SECS",
        default_value_t = 15,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    settlement_backoff_secs: u64,

    /// BTC/USD rate endpoint
    #[arg(long, env = "METERVPN_RATE_URL", default_value = DEFAULT_RATE_URL)]
    rate_url: String,

    /// Price of one month of access in USD
    #[arg(long, env = "METERVPN_MONTHLY_USD", default_value = "4.00")]
    monthly_usd: Decimal,

    /// BTC/USD rate to price with until the first successful lookup
    #[arg(long, env = "METERVPN_SEED_RATE")]
    seed_rate: Option<Decimal>,

    /// Longest allowance a purchase may reach, in days (at most 100 years)
    #[arg(
        long,
        env = "METERVPN_MAX_ALLOWANCE_DAYS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..=36_500)
    )]
    max_allowance_days: u64,

    /// Longest a client may wait on a payment, in seconds
    #[arg(long, env = "METERVPN_AWAIT_TIMEOUT_SECS", default_value_t = 60)]
    await_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .init();

    let store = open_store(cli.db_path.as_deref()).into_diagnostic()?;
    let ledger = Arc::new(AllowanceLedger::new(store));

    let tariff = Tariff::monthly(cli.monthly_usd).into_diagnostic()?;
    let rates = CoindeskRateSource::new(cli.rate_url).into_diagnostic()?;
    let prices = Arc::new(PriceTracker::new(Box::new(rates), tariff, cli.seed_rate));

    let lnd = LndClient::connect(&LndConfig {
        url: cli.lnd_url,
        macaroon_path: cli.macaroon_path,
        cert_path: cli.cert_path,
    })
    .await
    .into_diagnostic()?;

    let gateway = Arc::new(PaymentGateway::new(
        ledger.clone(),
        Box::new(lnd),
        prices.clone(),
        GatewayConfig {
            max_allowance: Duration::from_secs(cli.max_allowance_days * 24 * 60 * 60),
            settlement_backoff: Duration::from_secs(cli.settlement_backoff_secs),
            ..GatewayConfig::default()
        },
    ));
    let reconciler = Reconciler::new(
        ledger.clone(),
        Box::new(WgCli::new(cli.wg)),
        ReconcilerConfig {
            device: cli.device,
            interval: Duration::from_secs(cli.interval_secs),
        },
    );

    let service = MeterService::new(
        ledger,
        gateway.clone(),
        prices,
        Duration::from_secs(cli.await_timeout_secs),
    );

    // Warm the rate cache so the first invoice does not wait on the lookup.
    match service.price().await {
        Ok(snapshot) => info!(rate = %snapshot.rate, hourly_sats = %snapshot.satoshi.hour, "Pricing ready"),
        Err(e) => warn!(error = %e, "No exchange rate yet, invoices fail until one is available"),
    }
    info!("MeterVPN daemon running");

    let settlements = tokio::spawn(async move { gateway.run_settlements().await });
    let reconciliation = tokio::spawn(async move { reconciler.run().await });

    tokio::signal::ctrl_c().await.into_diagnostic()?;
    info!("Shutting down");
    settlements.abort();
    reconciliation.abort();

    Ok(())
}

fn open_store(db_path: Option<&Path>) -> meter_vpn::error::Result<AccountStoreBox> {
    match db_path {
        #[cfg(feature = "storage-rocksdb")]
        Some(path) => {
            info!(path = %path.display(), "Opening RocksDB store");
            Ok(Box::new(RocksDBStore::open(path)?))
        }
        #[cfg(not(feature = "storage-rocksdb"))]
        Some(_) => {
            warn!(
                "Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to in-memory storage."
            );
            Ok(Box::new(InMemoryAccountStore::new()))
        }
        None => Ok(Box::new(InMemoryAccountStore::new())),
    }
}
