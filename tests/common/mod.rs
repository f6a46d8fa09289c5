#![allow(dead_code)]

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures_util::StreamExt;
use meter_vpn::application::gateway::{GatewayConfig, PaymentGateway};
use meter_vpn::application::ledger::AllowanceLedger;
use meter_vpn::application::price::PriceTracker;
use meter_vpn::application::reconciler::{Reconciler, ReconcilerConfig};
use meter_vpn::application::service::MeterService;
use meter_vpn::domain::key::PublicKey;
use meter_vpn::domain::ports::{
    ControlPlane, PaymentNode, PeerChange, RateSource, SettlementEvent, SettlementStream,
};
use meter_vpn::domain::price::{Satoshis, Tariff};
use meter_vpn::error::{MeterError, Result};
use meter_vpn::infrastructure::in_memory::InMemoryAccountStore;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const RATE: f64 = 50_000.0;

/// Base64 text of a public key made of `byte` repeated.
pub fn key_text(byte: u8) -> String {
    STANDARD.encode([byte; 32])
}

pub fn key(byte: u8) -> PublicKey {
    PublicKey::from_bytes([byte; 32])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedInvoice {
    pub payment_request: String,
    pub amount: Satoshis,
    pub memo: String,
}

#[derive(Default)]
struct NodeState {
    issued: Mutex<Vec<IssuedInvoice>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Result<SettlementEvent>>>>,
    subscriptions: AtomicUsize,
    fail_issue: AtomicBool,
}

/// Payment node whose settlement feed is driven by the test.
#[derive(Clone, Default)]
pub struct FakePaymentNode {
    state: Arc<NodeState>,
}

impl FakePaymentNode {
    pub fn issued(&self) -> Vec<IssuedInvoice> {
        self.state.issued.lock().unwrap().clone()
    }

    pub fn fail_issue(&self, fail: bool) {
        self.state.fail_issue.store(fail, Ordering::SeqCst);
    }

    pub fn subscriptions(&self) -> usize {
        self.state.subscriptions.load(Ordering::SeqCst)
    }

    pub fn send(&self, event: SettlementEvent) {
        let subscribers = self.state.subscribers.lock().unwrap();
        for subscriber in subscribers.iter() {
            let _ = subscriber.send(Ok(event.clone()));
        }
    }

    pub fn settle(&self, payment_request: &str) {
        self.send(SettlementEvent {
            payment_request: payment_request.to_string(),
            settled: true,
        });
    }

    /// Fails every open subscription.
    pub fn break_stream(&self) {
        let mut subscribers = self.state.subscribers.lock().unwrap();
        for subscriber in subscribers.drain(..) {
            let _ = subscriber.send(Err(MeterError::UpstreamError("connection reset".to_string())));
        }
    }

    /// Waits until at least `count` subscriptions have been opened.
    pub async fn wait_for_subscriptions(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.subscriptions() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("settlement consumer never subscribed");
    }
}

#[async_trait]
impl PaymentNode for FakePaymentNode {
    async fn issue_invoice(&self, amount: Satoshis, memo: &str) -> Result<String> {
        if self.state.fail_issue.load(Ordering::SeqCst) {
            return Err(MeterError::UpstreamError("node offline".to_string()));
        }
        let mut issued = self.state.issued.lock().unwrap();
        let payment_request = format!("lnbcrt{}n1fake{}", amount.value(), issued.len());
        issued.push(IssuedInvoice {
            payment_request: payment_request.clone(),
            amount,
            memo: memo.to_string(),
        });
        Ok(payment_request)
    }

    async fn subscribe_settlements(&self) -> Result<SettlementStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.subscribers.lock().unwrap().push(tx);
        self.state.subscriptions.fetch_add(1, Ordering::SeqCst);
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }
}

#[derive(Default)]
struct ControlState {
    peers: Mutex<HashSet<PublicKey>>,
    commands: Mutex<Vec<PeerChange>>,
    unreachable: AtomicBool,
    failing: Mutex<HashSet<PublicKey>>,
    reads: AtomicUsize,
    reads_in_flight: AtomicUsize,
    max_reads_in_flight: AtomicUsize,
    read_delay: Mutex<Duration>,
}

/// In-memory tunnel device that records every command it receives.
#[derive(Clone, Default)]
pub struct FakeControlPlane {
    state: Arc<ControlState>,
}

impl FakeControlPlane {
    pub fn add_live_peer(&self, key: PublicKey) {
        self.state.peers.lock().unwrap().insert(key);
    }

    pub fn live_peers(&self) -> HashSet<PublicKey> {
        self.state.peers.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<PeerChange> {
        self.state.commands.lock().unwrap().clone()
    }

    pub fn clear_commands(&self) {
        self.state.commands.lock().unwrap().clear();
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of times the live peer set was read.
    pub fn peer_reads(&self) -> usize {
        self.state.reads.load(Ordering::SeqCst)
    }

    /// Most peer-set reads ever running at the same time.
    pub fn max_reads_in_flight(&self) -> usize {
        self.state.max_reads_in_flight.load(Ordering::SeqCst)
    }

    /// Makes every peer-set read take `delay`.
    pub fn set_read_delay(&self, delay: Duration) {
        *self.state.read_delay.lock().unwrap() = delay;
    }

    /// Makes every command touching `key` fail.
    pub fn fail_key(&self, key: PublicKey) {
        self.state.failing.lock().unwrap().insert(key);
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn device_peers(&self, _device: &str) -> Result<HashSet<PublicKey>> {
        self.state.reads.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.state.reads_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state
            .max_reads_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);
        let delay = *self.state.read_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state.reads_in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.state.unreachable.load(Ordering::SeqCst) {
            return Err(MeterError::UpstreamError("no such device".to_string()));
        }
        Ok(self.live_peers())
    }

    async fn configure_device(&self, _device: &str, change: PeerChange) -> Result<()> {
        self.state.commands.lock().unwrap().push(change.clone());
        let key = match &change {
            PeerChange::Add { key, .. } | PeerChange::Remove { key } => *key,
        };
        if self.state.failing.lock().unwrap().contains(&key) {
            return Err(MeterError::UpstreamError("operation not permitted".to_string()));
        }
        let mut peers = self.state.peers.lock().unwrap();
        match change {
            PeerChange::Add { key, .. } => peers.insert(key),
            PeerChange::Remove { key } => peers.remove(&key),
        };
        Ok(())
    }
}

/// Rate source returning a settable rate, or failing while unset.
#[derive(Clone)]
pub struct StaticRateSource {
    rate: Arc<Mutex<Option<f64>>>,
}

impl StaticRateSource {
    pub fn new(rate: f64) -> Self {
        Self {
            rate: Arc::new(Mutex::new(Some(rate))),
        }
    }

    pub fn set(&self, rate: Option<f64>) {
        *self.rate.lock().unwrap() = rate;
    }
}

#[async_trait]
impl RateSource for StaticRateSource {
    async fn fetch_rate(&self) -> Result<f64> {
        let rate = *self.rate.lock().unwrap();
        rate.ok_or_else(|| MeterError::UpstreamError("rate source down".to_string()))
    }
}

/// Every component wired over in-memory fakes.
pub struct Harness {
    pub store: InMemoryAccountStore,
    pub ledger: Arc<AllowanceLedger>,
    pub node: FakePaymentNode,
    pub control: FakeControlPlane,
    pub rates: StaticRateSource,
    pub prices: Arc<PriceTracker>,
    pub gateway: Arc<PaymentGateway>,
    pub reconciler: Reconciler,
    pub service: MeterService,
}

impl Harness {
    pub fn new() -> Self {
        let store = InMemoryAccountStore::new();
        let ledger = Arc::new(AllowanceLedger::new(Box::new(store.clone())));
        let node = FakePaymentNode::default();
        let control = FakeControlPlane::default();
        let rates = StaticRateSource::new(RATE);
        let prices = Arc::new(PriceTracker::new(
            Box::new(rates.clone()),
            Tariff::default(),
            None,
        ));
        let gateway = Arc::new(PaymentGateway::new(
            ledger.clone(),
            Box::new(node.clone()),
            prices.clone(),
            GatewayConfig {
                settlement_backoff: Duration::from_millis(20),
                ..GatewayConfig::default()
            },
        ));
        let reconciler = Reconciler::new(
            ledger.clone(),
            Box::new(control.clone()),
            ReconcilerConfig::default(),
        );
        let service = MeterService::new(
            ledger.clone(),
            gateway.clone(),
            prices.clone(),
            Duration::from_millis(200),
        );
        Self {
            store,
            ledger,
            node,
            control,
            rates,
            prices,
            gateway,
            reconciler,
            service,
        }
    }

    /// Runs the settlement consumer in the background until the handle is aborted.
    pub fn spawn_settlements(&self) -> tokio::task::JoinHandle<()> {
        let gateway = self.gateway.clone();
        tokio::spawn(async move { gateway.run_settlements().await })
    }
}
