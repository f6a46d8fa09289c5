use crate::domain::ports::{PaymentNode, SettlementEvent, SettlementStream};
use crate::domain::price::Satoshis;
use crate::error::{MeterError, Result};
use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt, future};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tracing::{debug, info};

const MACAROON_HEADER: &str = "Grpc-Metadata-macaroon";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Idle-connection check interval, so a silently dropped invoice feed ends in an error.
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);
/// Upper bound on one JSON line of the invoice feed.
const MAX_LINE_LENGTH: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LndConfig {
    /// REST endpoint, e.g. `https://localhost:8080`.
    pub url: String,
    pub macaroon_path: PathBuf,
    pub cert_path: PathBuf,
}

#[derive(Serialize)]
struct AddInvoiceRequest<'a> {
    // int64 fields travel as strings over the REST gateway.
    value: String,
    memo: &'a str,
}

#[derive(Deserialize)]
struct AddInvoiceResponse {
    payment_request: String,
}

#[derive(Deserialize)]
struct GetInfoResponse {
    #[serde(default)]
    alias: String,
}

#[derive(Deserialize)]
struct StreamLine {
    result: Option<InvoiceUpdate>,
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct InvoiceUpdate {
    #[serde(default)]
    payment_request: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    settled: bool,
}

/// LND client over its REST gateway.
///
/// Authenticates with the hex-encoded macaroon header and trusts only the
/// node's own TLS certificate.
pub struct LndClient {
    http: reqwest::Client,
    base: String,
    macaroon: String,
}

impl LndClient {
    /// Loads the credentials and builds the HTTP client without contacting the node.
    pub async fn new(config: &LndConfig) -> Result<Self> {
        let macaroon = tokio::fs::read(&config.macaroon_path).await.map_err(|e| {
            MeterError::StartupError(format!(
                "Could not read macaroon {}: {e}",
                config.macaroon_path.display()
            ))
        })?;
        let cert_pem = tokio::fs::read(&config.cert_path).await.map_err(|e| {
            MeterError::StartupError(format!(
                "Could not read TLS certificate {}: {e}",
                config.cert_path.display()
            ))
        })?;
        let cert = reqwest::Certificate::from_pem(&cert_pem)
            .map_err(|e| MeterError::StartupError(format!("Invalid TLS certificate: {e}")))?;

        let http = http_client(Some(cert))?;

        Ok(Self {
            http,
            base: config.url.trim_end_matches('/').to_string(),
            macaroon: hex::encode(macaroon),
        })
    }

    /// Like [`LndClient::new`], then checks that the node answers.
    pub async fn connect(config: &LndConfig) -> Result<Self> {
        let client = Self::new(config).await?;
        let info: GetInfoResponse = client
            .get("/v1/getinfo")
            .await
            .map_err(|e| MeterError::StartupError(format!("LND node unreachable: {e}")))?;
        info!(url = %client.base, alias = %info.alias, "Connected to LND");
        Ok(client)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T> {
        let response = self
            .http
            .get(self.url(path))
            .header(MACAROON_HEADER, &self.macaroon)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| MeterError::upstream("LND request failed", e))?;
        response
            .json()
            .await
            .map_err(|e| MeterError::upstream("Malformed LND response", e))
    }
}

/// No overall timeout: the invoice subscription stays open indefinitely, and
/// TCP keepalive is what detects a peer that vanished mid-stream.
fn http_client(root: Option<reqwest::Certificate>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .tcp_keepalive(TCP_KEEPALIVE);
    if let Some(cert) = root {
        builder = builder.add_root_certificate(cert);
    }
    builder
        .build()
        .map_err(|e| MeterError::StartupError(format!("Could not build HTTP client: {e}")))
}

#[async_trait]
impl PaymentNode for LndClient {
    async fn issue_invoice(&self, amount: Satoshis, memo: &str) -> Result<String> {
        let body = AddInvoiceRequest {
            value: amount.value().to_string(),
            memo,
        };
        let response = self
            .http
            .post(self.url("/v1/invoices"))
            .header(MACAROON_HEADER, &self.macaroon)
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| MeterError::upstream("Could not add invoice", e))?;
        let invoice: AddInvoiceResponse = response
            .json()
            .await
            .map_err(|e| MeterError::upstream("Malformed add-invoice response", e))?;

        if invoice.payment_request.is_empty() {
            return Err(MeterError::UpstreamError(
                "LND returned an empty payment request".to_string(),
            ));
        }
        debug!(amount = %amount, "Invoice added");
        Ok(invoice.payment_request)
    }

    async fn subscribe_settlements(&self) -> Result<SettlementStream> {
        let response = self
            .http
            .get(self.url("/v1/invoices/subscribe"))
            .header(MACAROON_HEADER, &self.macaroon)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| MeterError::upstream("Could not subscribe to invoices", e))?;

        let bytes = response.bytes_stream().map_err(io::Error::other);
        let lines = FramedRead::new(
            StreamReader::new(bytes),
            LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        );

        let events = lines.filter_map(|line| {
            future::ready(match line {
                Ok(line) => parse_settlement_line(&line).transpose(),
                Err(e) => Some(Err(MeterError::upstream("Invoice stream broke", e))),
            })
        });
        Ok(events.boxed())
    }
}

/// Decodes one line of the invoice subscription.
///
/// Blank keep-alive lines yield `None`. An `error` object terminates the feed.
pub fn parse_settlement_line(line: &str) -> Result<Option<SettlementEvent>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let parsed: StreamLine = serde_json::from_str(line)
        .map_err(|e| MeterError::upstream("Malformed invoice update", e))?;
    if let Some(error) = parsed.error {
        return Err(MeterError::UpstreamError(format!(
            "Invoice stream error: {error}"
        )));
    }

    Ok(parsed.result.map(|invoice| SettlementEvent {
        settled: invoice.settled || invoice.state.as_deref() == Some("SETTLED"),
        payment_request: invoice.payment_request,
    }))
}
