//! Application layer: the components that own MeterVPN's moving state.
//!
//! `AllowanceLedger` owns accounts, `PaymentGateway` owns pending invoices,
//! `PriceTracker` owns the last exchange rate and `Reconciler` owns nothing,
//! it only reads the ledger and drives the control plane. `MeterService`
//! bundles them for a request handler.

pub mod gateway;
pub mod ledger;
pub mod price;
pub mod reconciler;
pub mod service;
