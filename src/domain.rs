// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Chat/session identifier of an interested watcher.
pub type WatcherId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency { Rub, Usd, Eur }

impl Currency {
    pub const ALL: [Currency; 3] = [Currency::Rub, Currency::Usd, Currency::Eur];

    pub fn sign(&self) -> &'static str {
        match self {
            Currency::Rub => "₽",
            Currency::Usd => "$",
            Currency::Eur => "€",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Currency::Rub => "RUB",
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
        }
    }

    pub fn parse(code: &str) -> Option<Currency> {
        match code.to_ascii_uppercase().as_str() {
            "RUB" => Some(Currency::Rub),
            "USD" => Some(Currency::Usd),
            "EUR" => Some(Currency::Eur),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstrumentClass { Stock, Bond, Etf }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub figi: String,
    pub ticker: String,
    pub name: String,
    pub currency: Currency,
    pub class: InstrumentClass,
}

/// Broker-reported open position balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub figi: String,
    pub lots: i64,
    pub avg_price: f64,
    pub expected_yield: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub figi: String,
    pub last_price: f64,
    pub close_price: f64,
    pub bids: Vec<(f64, i64)>,
    pub asks: Vec<(f64, i64)>,
}

// ---- Operations (accounting input) ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Buy,
    Sell,
    Dividend,
    Tax,
    TaxRefund,
    TaxOnDividend,
    Ignored,
}

/// One executed sub-trade of a buy/sell operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SubTrade { pub quantity: i64, pub price: f64 }

/// A classified broker operation record. Immutable once built; the ledger
/// requires records for one instrument to be sorted by `at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub at: DateTime<Utc>,
    pub kind: OperationKind,
    pub figi: String,
    pub currency: Currency,
    pub payment: f64,
    pub commission: f64,
    pub trades: Vec<SubTrade>,
}

// ---- Closed trades (ledger output) ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeKind { Sale, ShortClose }

impl TradeKind {
    pub fn label(&self) -> &'static str {
        match self {
            TradeKind::Sale => "sale",
            TradeKind::ShortClose => "short-close",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub at: DateTime<Utc>,
    pub kind: TradeKind,
    pub profit: f64,
    pub profit_pc: f64,
}

// ---- Streaming ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandleUpdate { pub figi: String, pub close: f64 }

/// Decoded event from the market-data connection. Unknown payloads map to
/// `Other` and take the log-and-ignore path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StreamEvent {
    Candle(CandleUpdate),
    Other(String),
}

/// Wire command for the market-data connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamCommand {
    SubscribeCandle { figi: String },
    UnsubscribeCandle { figi: String },
}

// ---- Price watch rules ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchMode {
    /// Recurring: fires on every move of `threshold` percent since the last
    /// fire, re-arms by advancing `last_value`.
    PercentMove,
    /// One-shot: fires when the price reaches or crosses the absolute
    /// `threshold`, then the rule is deleted.
    LevelCross,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchRule {
    pub id: i64,
    pub watcher: WatcherId,
    pub figi: String,
    pub ticker: String,
    pub mode: WatchMode,
    pub threshold: f64,
    pub last_value: f64,
    pub current_value: f64,
    pub currency: Currency,
    pub permanent: bool,
}

impl WatchRule {
    /// Percent change of `current_value` relative to the rule's reference:
    /// `last_value` for percent rules, the threshold level for level rules.
    pub fn pc(&self) -> f64 {
        let reference = match self.mode {
            WatchMode::PercentMove => self.last_value,
            WatchMode::LevelCross => self.threshold,
        };
        if reference != 0.0 && self.current_value != 0.0 {
            self.current_value * 100.0 / reference - 100.0
        } else {
            0.0
        }
    }

    /// One-line alert text, optionally with the watcher's portfolio gain.
    pub fn alert_text(&self, portfolio_gain: Option<f64>) -> String {
        let pc = self.pc();
        let gain = portfolio_gain
            .filter(|g| *g != 0.0)
            .map(|g| format!(" ({}{:.2}%)", num_sign(g), g))
            .unwrap_or_default();
        format!(
            "${}\n`     {}{:.2}% {}{:.2}{}`",
            self.ticker.to_uppercase(),
            num_sign(pc),
            pc,
            self.currency.sign(),
            self.current_value,
            gain,
        )
    }
}

// ---- Daily movers ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoverEntry {
    pub ticker: String,
    pub name: String,
    /// Signed percent change for the session.
    pub pct: f64,
    /// True when the entry came from a secondary (external) feed.
    pub external: bool,
}

// ---- Formatting helpers ----

pub fn num_sign(val: f64) -> &'static str {
    if val > 0.0 { "+" } else { "" }
}

pub fn format_money(currency: Currency, val: f64) -> String {
    let sign = if val > 0.0 {
        "+"
    } else if val < 0.0 {
        "-"
    } else {
        ""
    };
    format!("{}{}{:.2}", sign, currency.sign(), val.abs())
}
