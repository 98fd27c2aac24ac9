// ===============================
// src/lib.rs
// ===============================
//
// invest_watch_rust tracks a brokerage account's trade history and live
// market data: FIFO lot-matching P&L reports, a reconnecting candle stream
// with price-threshold alerts, and a daily top-movers notifier.

pub mod alerts;
pub mod broker;
pub mod cache;
pub mod classify;
pub mod config;
pub mod domain;
pub mod ledger;
pub mod metrics;
pub mod movers;
pub mod notify;
pub mod rest;
pub mod storage;
pub mod stream;
pub mod transport;
