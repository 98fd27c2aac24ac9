// ===============================
// src/ledger.rs (FIFO lot matching & portfolio rebuild)
// ===============================
//
// The ledger is rebuilt from scratch on every portfolio query: a linear,
// single-pass scan over the classified operation history. Nothing here is
// shared across tasks, so the lot queues need no locking.

use ahash::AHashMap as HashMap;
use std::collections::VecDeque;

use chrono::{Duration, Utc};
use thiserror::Error;

use crate::broker::{BrokerApi, BrokerError};
use crate::classify;
use crate::domain::{
    format_money, num_sign, ClosedTrade, Currency, Instrument, InstrumentClass, Operation,
    OperationKind, TradeKind,
};
use crate::metrics::{PORTFOLIO_REBUILDS, PORTFOLIO_REBUILD_ERRORS};

#[derive(Debug, Error)]
pub enum PortfolioError {
    #[error("failed to fetch {what}: {source}")]
    Fetch { what: &'static str, source: BrokerError },
    #[error("failed to get order book for {ticker}: {source}")]
    OrderBook { ticker: String, source: BrokerError },
}

/// Per-instrument accounting state. `long_lots`/`short_lots` hold one entry
/// per open unit; at most one of the two queues is non-empty at any time
/// because a closing unit always drains the opposite queue first.
#[derive(Debug, Clone, Default)]
pub struct InstrumentLedger {
    pub ticker: String,
    pub figi: String,
    pub currency: Option<Currency>,
    pub profit: f64,
    pub tax: f64,
    pub dividends: f64,
    pub fee: f64,
    pub holdings: f64,
    pub expected_yield: f64,
    pub expected_yield_pc: Option<f64>,
    pub trades: Vec<ClosedTrade>,
    pub long_lots: VecDeque<f64>,
    pub short_lots: VecDeque<f64>,
}

impl InstrumentLedger {
    fn new(ticker: &str, figi: &str, currency: Option<Currency>) -> Self {
        Self {
            ticker: ticker.to_string(),
            figi: figi.to_string(),
            currency,
            ..Default::default()
        }
    }

    /// Realized profit including dividends, commissions and taxes.
    pub fn total_profit(&self) -> f64 {
        self.profit + self.dividends + self.fee + self.tax
    }

    /// Open units, signed: long lots minus short lots.
    pub fn net_lots(&self) -> i64 {
        self.long_lots.len() as i64 - self.short_lots.len() as i64
    }

    /// Applies one classified operation in chronological order.
    /// `currency_tax` is the portfolio-level per-currency tax accumulator.
    pub fn apply(&mut self, op: &Operation, currency_tax: &mut HashMap<Currency, f64>) {
        self.fee += op.commission;
        match op.kind {
            OperationKind::Buy => self.apply_buy(op),
            OperationKind::Sell => self.apply_sell(op),
            OperationKind::Dividend => self.dividends += op.payment,
            OperationKind::Tax | OperationKind::TaxRefund | OperationKind::TaxOnDividend => {
                *currency_tax.entry(op.currency).or_default() -= op.payment;
                if !self.ticker.is_empty() {
                    self.profit += op.payment;
                    self.tax += op.payment;
                }
            }
            OperationKind::Ignored => {}
        }
    }

    fn apply_buy(&mut self, op: &Operation) {
        // A buy with no executed sub-trades only carries its commission.
        let mut profit = 0.0;
        let mut profit_pc = 0.0;
        let mut closed = 0u32;
        for trade in &op.trades {
            for _ in 0..trade.quantity {
                if let Some(short) = self.short_lots.pop_front() {
                    closed += 1;
                    profit_pc += short * 100.0 / trade.price - 100.0;
                    self.profit += short - trade.price;
                    profit += short - trade.price;
                } else {
                    self.long_lots.push_back(trade.price);
                }
            }
        }
        if closed > 0 {
            self.trades.push(ClosedTrade {
                at: op.at,
                kind: TradeKind::ShortClose,
                profit,
                profit_pc: profit_pc / closed as f64,
            });
        }
    }

    fn apply_sell(&mut self, op: &Operation) {
        let mut profit = 0.0;
        let mut profit_pc = 0.0;
        let mut closed = 0u32;
        for trade in &op.trades {
            for _ in 0..trade.quantity {
                if let Some(long) = self.long_lots.pop_front() {
                    closed += 1;
                    profit_pc += trade.price * 100.0 / long - 100.0;
                    self.profit += trade.price - long;
                    profit += trade.price - long;
                } else {
                    self.short_lots.push_back(trade.price);
                }
            }
        }
        if closed > 0 {
            self.trades.push(ClosedTrade {
                at: op.at,
                kind: TradeKind::Sale,
                profit,
                profit_pc: profit_pc / closed as f64,
            });
        }
    }

    /// Closed-trade log and running totals, one block per instrument.
    pub fn details(&self) -> String {
        let currency = self.currency.unwrap_or(Currency::Rub);
        let mut out = format!("*{}* ({})\n```\n", self.ticker, self.figi);
        for trade in &self.trades {
            out += &format!(
                "{} {} ({}{:.2}%)\n",
                trade.at.format("%Y/%m/%d"),
                format_money(currency, trade.profit),
                num_sign(trade.profit_pc),
                trade.profit_pc,
            );
        }
        if !self.trades.is_empty() {
            out += "\n";
        }
        out += &format!("Received: {}", format_money(currency, self.total_profit()));
        let mut parts = Vec::new();
        if self.dividends != 0.0 {
            parts.push(format!("div {}", format_money(currency, self.dividends)));
        }
        if self.fee != 0.0 {
            parts.push(format!("fee {}", format_money(currency, self.fee)));
        }
        if self.tax != 0.0 {
            parts.push(format!("tax {}", format_money(currency, self.tax)));
        }
        if parts.is_empty() {
            out += "\n";
        } else {
            out += &format!(" ({})\n", parts.join(", "));
        }
        if self.holdings.abs() > 0.00001 {
            out += &format!(
                "Holdings: {}{:.2}\nPotential: {}",
                currency.sign(),
                self.holdings,
                format_money(currency, self.expected_yield),
            );
            if let Some(pc) = self.expected_yield_pc {
                out += &format!(" ({}{:.2}%)", num_sign(pc), pc);
            }
            out += "\n";
        }
        out += "```\n";
        out
    }
}

/// One full portfolio snapshot, rebuilt per query.
#[derive(Debug, Clone, Default)]
pub struct Portfolio {
    pub total_fee: HashMap<Currency, f64>,
    pub total_profit: HashMap<Currency, f64>,
    pub total_potential_profit: HashMap<Currency, f64>,
    pub total_dividend: HashMap<Currency, f64>,
    pub total_tax: HashMap<Currency, f64>,
    pub items: Vec<InstrumentLedger>,
}

impl Portfolio {
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for currency in Currency::ALL {
            let profit = self.total_profit.get(&currency).copied().unwrap_or(0.0);
            let dividend = self.total_dividend.get(&currency).copied().unwrap_or(0.0);
            let fee = self.total_fee.get(&currency).copied().unwrap_or(0.0);
            let tax = self.total_tax.get(&currency).copied().unwrap_or(0.0);
            let potential = self
                .total_potential_profit
                .get(&currency)
                .copied()
                .unwrap_or(0.0);
            out += &format!(
                "\n{} realized profit: {} (div {:.2}, fee {:.2}, tax {:.2})\n",
                currency.code(),
                format_money(currency, profit),
                dividend,
                -1.0 * fee,
                tax,
            );
            out += &format!(
                "{} potential profit: {}\n",
                currency.code(),
                format_money(currency, potential),
            );
        }
        out
    }
}

/// Rebuilds the whole portfolio from the operation history and live broker
/// state. Any upstream fetch failure aborts the computation; no partial
/// ledger is ever returned.
pub async fn build_portfolio(
    broker: &dyn BrokerApi,
    window_days: i64,
) -> Result<Portfolio, PortfolioError> {
    let result = build_portfolio_inner(broker, window_days).await;
    match &result {
        Ok(_) => PORTFOLIO_REBUILDS.inc(),
        Err(_) => PORTFOLIO_REBUILD_ERRORS.inc(),
    }
    result
}

async fn build_portfolio_inner(
    broker: &dyn BrokerApi,
    window_days: i64,
) -> Result<Portfolio, PortfolioError> {
    let fetch = |what: &'static str| move |source: BrokerError| PortfolioError::Fetch { what, source };

    let positions = broker.positions().await.map_err(fetch("positions"))?;
    let positions: HashMap<String, _> =
        positions.into_iter().map(|p| (p.figi.clone(), p)).collect();

    let stocks = broker
        .instruments(InstrumentClass::Stock)
        .await
        .map_err(fetch("stocks"))?;
    let bonds_list = broker
        .instruments(InstrumentClass::Bond)
        .await
        .map_err(fetch("bonds"))?;
    let etfs = broker
        .instruments(InstrumentClass::Etf)
        .await
        .map_err(fetch("etfs"))?;

    let mut instruments: HashMap<String, Instrument> = HashMap::new();
    let mut bonds: std::collections::HashSet<String> = std::collections::HashSet::new();
    for inst in stocks.into_iter().chain(bonds_list).chain(etfs) {
        if inst.class == InstrumentClass::Bond {
            bonds.insert(inst.figi.clone());
        }
        instruments.insert(inst.figi.clone(), inst);
    }

    let now = Utc::now();
    let raw_ops = broker
        .operations(now - Duration::days(window_days), now)
        .await
        .map_err(fetch("operations"))?;

    // Group classified operations by ticker; records for instruments the
    // broker no longer lists land under the empty ticker and only feed the
    // currency-level tax totals.
    let mut by_ticker: HashMap<String, Vec<Operation>> = HashMap::new();
    for raw in &raw_ops {
        let Some(op) = classify::classify(raw) else { continue };
        let ticker = instruments
            .get(&op.figi)
            .map(|i| i.ticker.clone())
            .unwrap_or_default();
        by_ticker.entry(ticker).or_default().push(op);
    }

    let mut all_tickers: Vec<String> = by_ticker.keys().cloned().collect();
    all_tickers.sort();

    let mut portfolio = Portfolio::default();
    for ticker in all_tickers {
        let mut ops = by_ticker.remove(&ticker).unwrap_or_default();
        ops.sort_by_key(|op| op.at);

        let figi = ops.first().map(|op| op.figi.clone()).unwrap_or_default();
        let currency = if ticker.is_empty() {
            ops.first().map(|op| op.currency)
        } else {
            instruments.get(&figi).map(|i| i.currency)
        };
        let mut item = InstrumentLedger::new(&ticker, &figi, currency);
        for op in &ops {
            item.apply(op, &mut portfolio.total_tax);
        }
        portfolio.items.push(item);
    }

    for i in 0..portfolio.items.len() {
        let item = &portfolio.items[i];
        if item.ticker.is_empty() {
            continue;
        }
        let Some(currency) = item.currency else { continue };
        *portfolio.total_fee.entry(currency).or_default() += item.fee;
        *portfolio.total_profit.entry(currency).or_default() += item.total_profit();
        *portfolio.total_dividend.entry(currency).or_default() += item.dividends;

        let Some(position) = positions.get(&item.figi) else { continue };
        if position.lots <= 0 {
            continue;
        }
        let mut holdings = position.avg_price * position.lots as f64;
        let expected_yield;
        if !bonds.contains(&item.figi) && holdings == 0.0 {
            // Reconciliation gap: the broker reports the position without a
            // valuation, so reconstruct it from the local lot queues against
            // a fresh order book.
            holdings = item.long_lots.iter().sum::<f64>() - item.short_lots.iter().sum::<f64>();
            let orderbook =
                broker
                    .order_book(&item.figi)
                    .await
                    .map_err(|source| PortfolioError::OrderBook {
                        ticker: item.ticker.clone(),
                        source,
                    })?;
            expected_yield = item.net_lots() as f64 * orderbook.last_price - holdings;
        } else {
            expected_yield = position.expected_yield;
        }
        let expected_yield_pc = if holdings != 0.0 {
            Some(expected_yield * 100.0 / holdings)
        } else {
            None
        };
        *portfolio.total_potential_profit.entry(currency).or_default() += expected_yield;

        let item = &mut portfolio.items[i];
        item.holdings = holdings;
        item.expected_yield = expected_yield;
        item.expected_yield_pc = expected_yield_pc;
    }

    Ok(portfolio)
}
