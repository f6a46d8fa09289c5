use crate::domain::ports::RateSource;
use crate::error::{MeterError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_RATE_URL: &str = "https://api.coindesk.com/v1/bpi/currentprice/USD.json";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
struct CurrentPrice {
    bpi: Option<Bpi>,
}

#[derive(Deserialize)]
struct Bpi {
    #[serde(rename = "USD")]
    usd: Option<UsdRate>,
}

#[derive(Deserialize)]
struct UsdRate {
    rate_float: Option<f64>,
}

/// BTC/USD rate from a CoinDesk-style `currentprice` endpoint.
pub struct CoindeskRateSource {
    http: reqwest::Client,
    url: String,
}

impl CoindeskRateSource {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| MeterError::StartupError(format!("Could not build HTTP client: {e}")))?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl RateSource for CoindeskRateSource {
    async fn fetch_rate(&self) -> Result<f64> {
        let body = self
            .http
            .get(&self.url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| MeterError::upstream("Rate lookup failed", e))?
            .text()
            .await
            .map_err(|e| MeterError::upstream("Rate lookup failed", e))?;
        parse_rate(&body)
    }
}

/// Extracts `bpi.USD.rate_float`.
pub fn parse_rate(body: &str) -> Result<f64> {
    let price: CurrentPrice =
        serde_json::from_str(body).map_err(|e| MeterError::upstream("Malformed rate response", e))?;
    price
        .bpi
        .and_then(|bpi| bpi.usd)
        .and_then(|usd| usd.rate_float)
        .ok_or_else(|| MeterError::UpstreamError("Rate response has no bpi.USD.rate_float".to_string()))
}
