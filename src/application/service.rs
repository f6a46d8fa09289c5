//! The surface an HTTP layer binds to.
//!
//! Requests are identified by the account id carried in the `accountId` cookie.
//! Every call returns either a serializable outcome or a `MeterError`, whose
//! `http_status` gives the status code to answer with.

use crate::application::gateway::{Completion, ExtensionInvoice, PaymentGateway};
use crate::application::ledger::AllowanceLedger;
use crate::application::price::PriceTracker;
use crate::domain::account::{Account, AccountId};
use crate::domain::price::{PriceSnapshot, Satoshis};
use crate::error::{MeterError, Result};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

/// Name of the cookie that carries the account id.
pub const ACCOUNT_COOKIE: &str = "accountId";
pub const DEFAULT_AWAIT_TIMEOUT: Duration = Duration::from_secs(60);
/// Status answered together with a payment request.
pub const PAYMENT_REQUIRED: u16 = 402;

const EXPIRY_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IpView {
    pub v4: Option<Ipv4Addr>,
    pub v6: Option<Ipv6Addr>,
}

/// An account as shown to its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountView {
    pub account_id: String,
    pub public_key: Option<String>,
    pub ip: IpView,
    /// RFC 1123, e.g. `Mon, 02 Jan 2006 15:04:05 GMT`.
    pub expiry_date: String,
    pub connected: bool,
}

impl From<&Account> for AccountView {
    fn from(account: &Account) -> Self {
        Self {
            account_id: account.account_id.to_string(),
            public_key: account.public_key.map(|key| key.to_base64()),
            ip: IpView {
                v4: account.address_v4,
                v6: account.address_v6,
            },
            expiry_date: account.expiry.format(EXPIRY_FORMAT).to_string(),
            connected: account.connected,
        }
    }
}

/// Body of a `402 Payment Required` answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequired {
    pub payment_request: String,
    pub amount: Satoshis,
}

impl From<ExtensionInvoice> for PaymentRequired {
    fn from(invoice: ExtensionInvoice) -> Self {
        Self {
            payment_request: invoice.payment_request,
            amount: invoice.amount,
        }
    }
}

pub struct MeterService {
    ledger: Arc<AllowanceLedger>,
    gateway: Arc<PaymentGateway>,
    prices: Arc<PriceTracker>,
    await_timeout: Duration,
}

impl MeterService {
    pub fn new(
        ledger: Arc<AllowanceLedger>,
        gateway: Arc<PaymentGateway>,
        prices: Arc<PriceTracker>,
        await_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            gateway,
            prices,
            await_timeout,
        }
    }

    pub async fn create_account(&self) -> Result<AccountView> {
        let account = self.ledger.create_account().await?;
        Ok(AccountView::from(&account))
    }

    pub async fn account(&self, cookie: Option<&str>) -> Result<AccountView> {
        let account = self.ledger.get_account(&account_id(cookie)?).await?;
        Ok(AccountView::from(&account))
    }

    pub async fn set_public_key(&self, cookie: Option<&str>, key_text: &str) -> Result<AccountView> {
        let account = self
            .ledger
            .set_public_key(&account_id(cookie)?, key_text)
            .await?;
        Ok(AccountView::from(&account))
    }

    pub async fn allocate_addresses(&self, cookie: Option<&str>) -> Result<AccountView> {
        let id = account_id(cookie)?;
        self.ledger.allocate_addresses(&id).await?;
        let account = self.ledger.get_account(&id).await?;
        Ok(AccountView::from(&account))
    }

    /// Prices and issues an invoice for `seconds` of access. Answered with `402`.
    pub async fn request_extension(
        &self,
        cookie: Option<&str>,
        seconds: &str,
    ) -> Result<PaymentRequired> {
        let id = account_id(cookie)?;
        let duration = parse_seconds(seconds)?;
        let invoice = self.gateway.request_extension(&id, duration).await?;
        Ok(invoice.into())
    }

    /// Long-polls a payment request for up to the configured timeout.
    pub async fn await_extension(&self, payment_request: &str) -> Completion {
        self.gateway
            .await_completion(payment_request, self.await_timeout)
            .await
    }

    pub async fn price(&self) -> Result<PriceSnapshot> {
        self.prices.snapshot().await
    }
}

fn account_id(cookie: Option<&str>) -> Result<AccountId> {
    match cookie.map(str::trim) {
        Some(value) if !value.is_empty() => Ok(AccountId::from(value)),
        _ => Err(MeterError::ValidationError(format!(
            "Missing {ACCOUNT_COOKIE} cookie"
        ))),
    }
}

/// Parses a positive, possibly fractional, number of seconds.
pub fn parse_seconds(text: &str) -> Result<Duration> {
    let invalid = || MeterError::ValidationError(format!("Invalid duration: {text:?}"));

    let seconds: Decimal = text.trim().parse().map_err(|_| invalid())?;
    if seconds <= Decimal::ZERO {
        return Err(invalid());
    }
    let millis = seconds
        .checked_mul(Decimal::ONE_THOUSAND)
        .ok_or_else(invalid)?
        .round()
        .to_u64()
        .ok_or_else(invalid)?;
    if millis == 0 {
        return Err(invalid());
    }
    Ok(Duration::from_millis(millis))
}
