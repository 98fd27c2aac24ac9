// ===============================
// src/rest.rs (broker REST adapter)
// ===============================
//
// reqwest client for the broker's OpenAPI REST surface. Every response is
// wrapped in a `{trackingId, status, payload}` envelope; wire payloads are
// decoded into their own structs here and converted to domain types at the
// edge.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::broker::{BrokerApi, BrokerError, RawOperation};
use crate::domain::{Currency, Instrument, InstrumentClass, OrderBook, Position, SubTrade};

pub struct RestBroker {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl RestBroker {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, BrokerError> {
        let resp = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BrokerError::Api(format!("{path} returned {status}")));
        }
        let envelope: Envelope<T> = resp.json().await?;
        Ok(envelope.payload)
    }

    async fn instrument_list(&self, path: &str) -> Result<Vec<WireInstrument>, BrokerError> {
        let list: WireInstrumentList = self.get_json(path, &[]).await?;
        Ok(list.instruments)
    }
}

#[async_trait]
impl BrokerApi for RestBroker {
    async fn instruments(&self, class: InstrumentClass) -> Result<Vec<Instrument>, BrokerError> {
        let (path, what) = match class {
            InstrumentClass::Stock => ("/market/stocks", "stocks"),
            InstrumentClass::Bond => ("/market/bonds", "bonds"),
            InstrumentClass::Etf => ("/market/etfs", "etfs"),
        };
        let wire = self.instrument_list(path).await?;
        let instruments: Vec<Instrument> = wire
            .into_iter()
            .filter_map(|w| to_instrument(w, class))
            .collect();
        if instruments.is_empty() {
            return Err(BrokerError::EmptyListing(what));
        }
        Ok(instruments)
    }

    async fn operations(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RawOperation>, BrokerError> {
        let payload: WireOperations = self
            .get_json(
                "/operations",
                &[
                    ("from", from.to_rfc3339()),
                    ("to", to.to_rfc3339()),
                    ("figi", String::new()),
                ],
            )
            .await?;
        Ok(payload.operations.into_iter().map(to_raw_operation).collect())
    }

    async fn order_book(&self, figi: &str) -> Result<OrderBook, BrokerError> {
        let wire: WireOrderBook = self
            .get_json(
                "/market/orderbook",
                &[("figi", figi.to_string()), ("depth", "1".to_string())],
            )
            .await?;
        Ok(to_order_book(wire))
    }

    async fn positions(&self) -> Result<Vec<Position>, BrokerError> {
        let payload: WirePortfolio = self.get_json("/portfolio", &[]).await?;
        Ok(payload.positions.into_iter().map(to_position).collect())
    }

    async fn instrument_by_ticker(&self, ticker: &str) -> Result<Option<Instrument>, BrokerError> {
        let list: WireInstrumentList = self
            .get_json("/market/search/by-ticker", &[("ticker", ticker.to_string())])
            .await?;
        for wire in list.instruments {
            if wire.ticker == ticker {
                // Class is unknown for a search hit; stocks dominate and the
                // class only matters for listing paths.
                return Ok(to_instrument(wire, InstrumentClass::Stock));
            }
        }
        Ok(None)
    }
}

// ---- Wire payloads ----

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[allow(dead_code)]
    #[serde(default, rename = "trackingId")]
    tracking_id: String,
    payload: T,
}

#[derive(Debug, Deserialize)]
struct WireInstrumentList {
    #[serde(default)]
    instruments: Vec<WireInstrument>,
}

#[derive(Debug, Deserialize)]
struct WireInstrument {
    figi: String,
    ticker: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    currency: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoneyAmount {
    #[allow(dead_code)]
    #[serde(default)]
    currency: String,
    value: f64,
}

#[derive(Debug, Deserialize)]
struct WirePortfolio {
    #[serde(default)]
    positions: Vec<WirePosition>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePosition {
    figi: String,
    #[serde(default)]
    lots: i64,
    #[serde(default)]
    expected_yield: Option<MoneyAmount>,
    #[serde(default)]
    average_position_price: Option<MoneyAmount>,
}

#[derive(Debug, Deserialize)]
struct WireOperations {
    #[serde(default)]
    operations: Vec<WireOperation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireOperation {
    #[serde(default)]
    figi: String,
    #[serde(default)]
    operation_type: String,
    status: String,
    #[serde(default)]
    instrument_type: String,
    #[serde(default)]
    currency: String,
    #[serde(default)]
    payment: f64,
    #[serde(default)]
    commission: Option<MoneyAmount>,
    #[serde(default)]
    trades: Vec<WireTrade>,
    date: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct WireTrade {
    quantity: i64,
    price: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireOrderBook {
    figi: String,
    #[serde(default)]
    bids: Vec<WireOrderBookEntry>,
    #[serde(default)]
    asks: Vec<WireOrderBookEntry>,
    #[serde(default)]
    last_price: f64,
    #[serde(default)]
    close_price: f64,
}

#[derive(Debug, Deserialize)]
struct WireOrderBookEntry {
    price: f64,
    quantity: i64,
}

// ---- Conversions ----

fn to_instrument(wire: WireInstrument, class: InstrumentClass) -> Option<Instrument> {
    let Some(currency) = Currency::parse(&wire.currency) else {
        debug!(figi = %wire.figi, currency = %wire.currency, "instrument in unsupported currency, skipping");
        return None;
    };
    Some(Instrument {
        figi: wire.figi,
        ticker: wire.ticker,
        name: wire.name,
        currency,
        class,
    })
}

fn to_position(wire: WirePosition) -> Position {
    Position {
        figi: wire.figi,
        lots: wire.lots,
        avg_price: wire.average_position_price.map(|m| m.value).unwrap_or(0.0),
        expected_yield: wire.expected_yield.map(|m| m.value).unwrap_or(0.0),
    }
}

fn to_raw_operation(wire: WireOperation) -> RawOperation {
    RawOperation {
        figi: wire.figi,
        operation_type: wire.operation_type,
        status: wire.status,
        instrument_type: wire.instrument_type,
        currency: wire.currency,
        payment: wire.payment,
        commission: wire.commission.map(|m| m.value).unwrap_or(0.0),
        trades: wire
            .trades
            .into_iter()
            .map(|t| SubTrade { quantity: t.quantity, price: t.price })
            .collect(),
        date: wire.date,
    }
}

fn to_order_book(wire: WireOrderBook) -> OrderBook {
    OrderBook {
        figi: wire.figi,
        last_price: wire.last_price,
        close_price: wire.close_price,
        bids: wire.bids.into_iter().map(|e| (e.price, e.quantity)).collect(),
        asks: wire.asks.into_iter().map(|e| (e.price, e.quantity)).collect(),
    }
}
