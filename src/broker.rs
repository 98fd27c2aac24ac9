// ===============================
// src/broker.rs
// ===============================
//
// Capability surface of the brokerage API. The core consumes these traits;
// rest.rs / transport.rs provide the live implementations, tests plug in
// hand-built fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Instrument, InstrumentClass, OrderBook, Position, SubTrade};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("broker rejected request: {0}")]
    Api(String),
    #[error("empty {0} listing")]
    EmptyListing(&'static str),
}

/// An operation record exactly as the broker reports it, before
/// classification. `operation_type` and `status` stay raw strings so an
/// unknown kind can be logged and skipped instead of failing decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawOperation {
    pub figi: String,
    pub operation_type: String,
    pub status: String,
    pub instrument_type: String,
    pub currency: String,
    pub payment: f64,
    pub commission: f64,
    pub trades: Vec<SubTrade>,
    pub date: DateTime<Utc>,
}

#[async_trait]
pub trait BrokerApi: Send + Sync {
    async fn instruments(&self, class: InstrumentClass) -> Result<Vec<Instrument>, BrokerError>;

    async fn operations(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RawOperation>, BrokerError>;

    async fn order_book(&self, figi: &str) -> Result<OrderBook, BrokerError>;

    async fn positions(&self) -> Result<Vec<Position>, BrokerError>;

    /// Exact-ticker lookup, `None` when the broker knows no such instrument.
    async fn instrument_by_ticker(&self, ticker: &str) -> Result<Option<Instrument>, BrokerError>;
}
