// ===============================
// src/alerts.rs (price watch engine)
// ===============================
//
// Consumes the multiplexer's event queue and evaluates every watch rule
// registered for the updated instrument. The queue has a single consumer,
// so rule evaluations for one instrument are naturally serialized and a
// rule's last/current values never race.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::broker::{BrokerApi, BrokerError};
use crate::domain::{Position, StreamEvent, WatchMode, WatchRule, WatcherId};
use crate::metrics::ALERTS_FIRED;
use crate::notify::Notifier;
use crate::storage::{StorageError, WatchStore};
use crate::stream::StreamMux;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("unknown ticker {0}")]
    UnknownTicker(String),
    #[error("malformed threshold {0:?}, examples: 1.25% or =30")]
    BadThreshold(String),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Access to a watcher's own brokerage account, for enriching percent
/// alerts with the gain relative to the average position cost.
#[async_trait]
pub trait AccountContext: Send + Sync {
    /// Position map keyed by figi; `None` when the watcher runs on the
    /// shared credential and has no private account.
    async fn positions(&self, watcher: WatcherId) -> Option<HashMap<String, Position>>;
}

/// Shared-credential deployments: nobody has a private account.
pub struct SharedAccounts;

#[async_trait]
impl AccountContext for SharedAccounts {
    async fn positions(&self, _watcher: WatcherId) -> Option<HashMap<String, Position>> {
        None
    }
}

/// Private-credential deployments: every watcher sees the account behind
/// the configured token.
pub struct PrivateAccounts {
    broker: Arc<dyn BrokerApi>,
}

impl PrivateAccounts {
    pub fn new(broker: Arc<dyn BrokerApi>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl AccountContext for PrivateAccounts {
    async fn positions(&self, watcher: WatcherId) -> Option<HashMap<String, Position>> {
        match self.broker.positions().await {
            Ok(positions) => Some(
                positions
                    .into_iter()
                    .map(|p| (p.figi.clone(), p))
                    .collect(),
            ),
            Err(e) => {
                error!(error = %e, watcher, "failed to get positions for alert enrichment");
                None
            }
        }
    }
}

pub async fn run(
    mut events: mpsc::Receiver<StreamEvent>,
    store: Arc<dyn WatchStore>,
    accounts: Arc<dyn AccountContext>,
    notifier: Arc<dyn Notifier>,
) {
    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Candle(candle) => {
                handle_candle(&*store, &*accounts, &*notifier, &candle.figi, candle.close).await;
            }
            StreamEvent::Other(kind) => {
                warn!(%kind, "unsupported event type");
            }
        }
    }
}

async fn handle_candle(
    store: &dyn WatchStore,
    accounts: &dyn AccountContext,
    notifier: &dyn Notifier,
    figi: &str,
    close: f64,
) {
    let rules = match store.rules_by_figi(figi).await {
        Ok(rules) => rules,
        Err(e) => {
            error!(error = %e, figi, "failed to get price watch list");
            return;
        }
    };
    for mut rule in rules {
        if let Err(e) = evaluate(store, accounts, notifier, &mut rule, close).await {
            // One broken rule never blocks the rest.
            error!(error = %e, rule_id = rule.id, "failed to evaluate watch rule");
        }
    }
}

/// Applies one price update to one rule: persists the observed value,
/// decides fire/no-fire/delete, and notifies on fire.
pub async fn evaluate(
    store: &dyn WatchStore,
    accounts: &dyn AccountContext,
    notifier: &dyn Notifier,
    rule: &mut WatchRule,
    close: f64,
) -> Result<(), StorageError> {
    if rule.current_value != close {
        store.set_current_value(&rule.figi, close).await?;
        rule.current_value = close;
    }
    match rule.mode {
        WatchMode::PercentMove => {
            let pc = rule.pc();
            if pc.abs() >= rule.threshold {
                let gain = portfolio_gain(accounts, rule).await;
                store.set_last_value(rule.id, rule.current_value).await?;
                rule.last_value = rule.current_value;
                ALERTS_FIRED.with_label_values(&["percent"]).inc();
                info!(watcher = rule.watcher, ticker = %rule.ticker, pc, "sending price watch alarm");
                notifier.send(rule.watcher, &rule.alert_text(gain), true).await;
            }
        }
        WatchMode::LevelCross => {
            let rising = rule.threshold > rule.last_value && rule.current_value >= rule.threshold;
            let falling = rule.threshold < rule.last_value && rule.current_value <= rule.threshold;
            if rising || falling {
                // One-shot: the rule is gone before the notification leaves.
                store.delete_rule(rule.id).await?;
                ALERTS_FIRED.with_label_values(&["level"]).inc();
                info!(watcher = rule.watcher, ticker = %rule.ticker, threshold = rule.threshold, "sending price watch alarm");
                notifier.send(rule.watcher, &rule.alert_text(None), true).await;
            }
        }
    }
    Ok(())
}

async fn portfolio_gain(accounts: &dyn AccountContext, rule: &WatchRule) -> Option<f64> {
    let positions = accounts.positions(rule.watcher).await?;
    let position = positions.get(&rule.figi)?;
    (position.avg_price > 0.0)
        .then(|| rule.current_value * 100.0 / position.avg_price - 100.0)
}

// ---- Rule registration (resolves a ticker and seeds the rule) ----

/// Parses a user threshold: `=30` is an absolute level, `1.25%` (or bare
/// `1.25`) a percent move.
pub fn parse_threshold(arg: &str) -> Result<(WatchMode, f64), WatchError> {
    let bad = || WatchError::BadThreshold(arg.to_string());
    if let Some(level) = arg.strip_prefix('=') {
        let threshold: f64 = level.parse().map_err(|_| bad())?;
        Ok((WatchMode::LevelCross, threshold))
    } else {
        let threshold: f64 = arg.trim_end_matches('%').parse().map_err(|_| bad())?;
        Ok((WatchMode::PercentMove, threshold))
    }
}

/// Creates (or re-seeds) a watch rule: both reference values start at the
/// order-book last price, and the watcher joins the instrument's stream.
pub async fn register_watch(
    broker: &dyn BrokerApi,
    store: &dyn WatchStore,
    mux: &StreamMux,
    watcher: WatcherId,
    ticker: &str,
    mode: WatchMode,
    threshold: f64,
) -> Result<WatchRule, WatchError> {
    let ticker = ticker.to_uppercase();
    let instrument = broker
        .instrument_by_ticker(&ticker)
        .await?
        .ok_or_else(|| WatchError::UnknownTicker(ticker.clone()))?;
    let orderbook = broker.order_book(&instrument.figi).await?;

    let mut rule = WatchRule {
        id: 0,
        watcher,
        figi: instrument.figi.clone(),
        ticker: instrument.ticker,
        mode,
        threshold,
        last_value: orderbook.last_price,
        current_value: orderbook.last_price,
        currency: instrument.currency,
        permanent: true,
    };
    rule.id = store.upsert_rule(&rule).await?;
    mux.subscribe(&instrument.figi, watcher).await;
    Ok(rule)
}

/// Removes all of the watcher's rules for a ticker and leaves the stream.
pub async fn delete_watch(
    broker: &dyn BrokerApi,
    store: &dyn WatchStore,
    mux: &StreamMux,
    watcher: WatcherId,
    ticker: &str,
) -> Result<(), WatchError> {
    let ticker = ticker.to_uppercase();
    let instrument = broker
        .instrument_by_ticker(&ticker)
        .await?
        .ok_or_else(|| WatchError::UnknownTicker(ticker.clone()))?;
    store.delete_rules_by_figi(watcher, &instrument.figi).await?;
    mux.unsubscribe(&instrument.figi, watcher).await;
    Ok(())
}

/// Full stop for one watcher: clears every rule, every subscription and the
/// daily-movers threshold.
pub async fn stop_watcher(
    store: &dyn WatchStore,
    mux: &StreamMux,
    watcher: WatcherId,
) -> Result<(), WatchError> {
    for rule in store.rules_by_watcher(watcher).await? {
        mux.unsubscribe(&rule.figi, watcher).await;
    }
    store.delete_rules(watcher).await?;
    store.unsubscribe_daily(watcher).await?;
    Ok(())
}

/// Re-registers every persisted subscription on the stream, used at boot so
/// the multiplexer converges to the stored watch set.
pub async fn resubscribe_all(store: &dyn WatchStore, mux: &StreamMux) -> Result<(), WatchError> {
    for rule in store.rules().await? {
        mux.subscribe(&rule.figi, rule.watcher).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Currency;
    use crate::notify::testing::RecordingNotifier;
    use crate::storage::MemoryStore;

    async fn seed(
        store: &MemoryStore,
        mode: WatchMode,
        threshold: f64,
        last: f64,
    ) -> WatchRule {
        let mut rule = WatchRule {
            id: 0,
            watcher: 7,
            figi: "FIGI1".into(),
            ticker: "AAPL".into(),
            mode,
            threshold,
            last_value: last,
            current_value: last,
            currency: Currency::Usd,
            permanent: true,
        };
        rule.id = store.upsert_rule(&rule).await.unwrap();
        rule
    }

    async fn deliver(store: &MemoryStore, notifier: &RecordingNotifier, close: f64) {
        handle_candle(store, &SharedAccounts, notifier, "FIGI1", close).await;
    }

    #[tokio::test]
    async fn level_cross_fires_once_and_deletes_rule() {
        let store = MemoryStore::new();
        let notifier = RecordingNotifier::default();
        seed(&store, WatchMode::LevelCross, 30.0, 25.0).await;

        deliver(&store, &notifier, 31.0).await;
        assert_eq!(notifier.sent.lock().unwrap().len(), 1);
        assert!(store.rules_by_figi("FIGI1").await.unwrap().is_empty());

        // The next update finds no rule for that watcher.
        deliver(&store, &notifier, 35.0).await;
        assert_eq!(notifier.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn level_cross_fires_on_falling_threshold() {
        let store = MemoryStore::new();
        let notifier = RecordingNotifier::default();
        seed(&store, WatchMode::LevelCross, 20.0, 25.0).await;

        deliver(&store, &notifier, 21.0).await;
        assert!(notifier.sent.lock().unwrap().is_empty());

        deliver(&store, &notifier, 20.0).await;
        assert_eq!(notifier.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn percent_move_rearms_from_fired_value() {
        let store = MemoryStore::new();
        let notifier = RecordingNotifier::default();
        seed(&store, WatchMode::PercentMove, 1.0, 100.0).await;

        // |−1%| >= 1% fires and advances last_value to 99.
        deliver(&store, &notifier, 99.0).await;
        assert_eq!(notifier.sent.lock().unwrap().len(), 1);
        let rules = store.rules_by_figi("FIGI1").await.unwrap();
        assert_eq!(rules[0].last_value, 99.0);

        // From 99 to 99.5 is only ~0.505%: below threshold, no fire.
        deliver(&store, &notifier, 99.5).await;
        assert_eq!(notifier.sent.lock().unwrap().len(), 1);
        let rules = store.rules_by_figi("FIGI1").await.unwrap();
        assert_eq!(rules[0].last_value, 99.0);
        assert_eq!(rules[0].current_value, 99.5);

        // The rule survives fires: it is permanent and re-arms.
        deliver(&store, &notifier, 101.0).await;
        assert_eq!(notifier.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn current_value_is_persisted_even_without_fire() {
        let store = MemoryStore::new();
        let notifier = RecordingNotifier::default();
        seed(&store, WatchMode::PercentMove, 5.0, 100.0).await;

        deliver(&store, &notifier, 100.2).await;
        assert!(notifier.sent.lock().unwrap().is_empty());
        let rules = store.rules_by_figi("FIGI1").await.unwrap();
        assert_eq!(rules[0].current_value, 100.2);
        assert_eq!(rules[0].last_value, 100.0);
    }

    #[tokio::test]
    async fn percent_alert_carries_portfolio_gain_for_private_account() {
        struct OnePosition;

        #[async_trait]
        impl AccountContext for OnePosition {
            async fn positions(&self, _watcher: WatcherId) -> Option<HashMap<String, Position>> {
                let mut m = HashMap::new();
                m.insert(
                    "FIGI1".to_string(),
                    Position {
                        figi: "FIGI1".into(),
                        lots: 10,
                        avg_price: 80.0,
                        expected_yield: 0.0,
                    },
                );
                Some(m)
            }
        }

        let store = MemoryStore::new();
        let notifier = RecordingNotifier::default();
        seed(&store, WatchMode::PercentMove, 1.0, 100.0).await;

        handle_candle(&store, &OnePosition, &notifier, "FIGI1", 104.0).await;
        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        // 104 vs avg cost 80 = +30%.
        assert!(sent[0].1.contains("+30.00%"), "message: {}", sent[0].1);
    }

    #[tokio::test]
    async fn register_delete_stop_flow() {
        use crate::broker::RawOperation;
        use crate::domain::{Instrument, InstrumentClass, OrderBook};
        use crate::stream::{StreamMux, StreamTransport};
        use chrono::{DateTime, Utc};
        use tokio::time::Duration;

        struct OneInstrumentBroker;

        #[async_trait]
        impl BrokerApi for OneInstrumentBroker {
            async fn instruments(
                &self,
                _class: InstrumentClass,
            ) -> Result<Vec<Instrument>, BrokerError> {
                Ok(vec![])
            }

            async fn operations(
                &self,
                _from: DateTime<Utc>,
                _to: DateTime<Utc>,
            ) -> Result<Vec<RawOperation>, BrokerError> {
                Ok(vec![])
            }

            async fn order_book(&self, figi: &str) -> Result<OrderBook, BrokerError> {
                Ok(OrderBook {
                    figi: figi.to_string(),
                    last_price: 42.0,
                    close_price: 41.0,
                    bids: vec![],
                    asks: vec![],
                })
            }

            async fn positions(&self) -> Result<Vec<Position>, BrokerError> {
                Ok(vec![])
            }

            async fn instrument_by_ticker(
                &self,
                ticker: &str,
            ) -> Result<Option<Instrument>, BrokerError> {
                Ok((ticker == "AAPL").then(|| Instrument {
                    figi: "FIGI1".into(),
                    ticker: "AAPL".into(),
                    name: "Apple".into(),
                    currency: crate::domain::Currency::Usd,
                    class: InstrumentClass::Stock,
                }))
            }
        }

        // A transport that never connects; the flow only exercises the
        // subscription bookkeeping, not the wire.
        struct DeadTransport;

        #[async_trait]
        impl StreamTransport for DeadTransport {
            async fn connect(
                &self,
            ) -> Result<Box<dyn crate::stream::StreamConn>, crate::stream::StreamError> {
                Err(crate::stream::StreamError::Dial("dead".into()))
            }
        }

        let broker = OneInstrumentBroker;
        let store = MemoryStore::new();
        let (mux, _events) = StreamMux::new(Arc::new(DeadTransport), Duration::from_secs(3600));

        let rule = register_watch(&broker, &store, &mux, 7, "aapl", WatchMode::PercentMove, 1.5)
            .await
            .unwrap();
        assert_eq!(rule.figi, "FIGI1");
        assert_eq!(rule.last_value, 42.0);
        assert_eq!(rule.current_value, 42.0);
        assert_eq!(store.rules_by_watcher(7).await.unwrap().len(), 1);

        assert!(matches!(
            register_watch(&broker, &store, &mux, 7, "NOPE", WatchMode::PercentMove, 1.0).await,
            Err(WatchError::UnknownTicker(_))
        ));

        resubscribe_all(&store, &mux).await.unwrap();

        delete_watch(&broker, &store, &mux, 7, "AAPL").await.unwrap();
        assert!(store.rules_by_watcher(7).await.unwrap().is_empty());

        store.subscribe_daily(7, 5.0).await.unwrap();
        register_watch(&broker, &store, &mux, 7, "AAPL", WatchMode::LevelCross, 50.0)
            .await
            .unwrap();
        stop_watcher(&store, &mux, 7).await.unwrap();
        assert!(store.rules_by_watcher(7).await.unwrap().is_empty());
        assert!(store.daily_subscriptions().await.unwrap().is_empty());
    }

    #[test]
    fn threshold_parsing() {
        assert_eq!(parse_threshold("1.25%").unwrap(), (WatchMode::PercentMove, 1.25));
        assert_eq!(parse_threshold("2").unwrap(), (WatchMode::PercentMove, 2.0));
        assert_eq!(parse_threshold("=30").unwrap(), (WatchMode::LevelCross, 30.0));
        assert!(parse_threshold("abc").is_err());
        assert!(parse_threshold("=low").is_err());
    }
}
