// ===============================
// src/cache.rs (instrument registry snapshot)
// ===============================
//
// Process-wide instrument registry: a periodic task fetches stocks, bonds
// and etfs and publishes an immutable snapshot through a watch channel.
// Consumers only read; every refresh replaces the snapshot atomically, and
// a failed refresh keeps the previous one.

use ahash::AHashMap as HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

use crate::broker::{BrokerApi, BrokerError};
use crate::domain::{Instrument, InstrumentClass};
use crate::metrics::CACHE_INSTRUMENTS;

#[derive(Default)]
pub struct InstrumentSnapshot {
    by_ticker: HashMap<String, Instrument>,
    by_figi: HashMap<String, String>,
}

impl InstrumentSnapshot {
    fn insert(&mut self, instrument: Instrument) {
        self.by_figi
            .insert(instrument.figi.clone(), instrument.ticker.clone());
        self.by_ticker.insert(instrument.ticker.clone(), instrument);
    }

    pub fn by_ticker(&self, ticker: &str) -> Option<&Instrument> {
        self.by_ticker.get(ticker)
    }

    /// Exact ticker first, then figi, then (unless `exact`) a name
    /// substring scan.
    pub fn lookup(&self, query: &str, exact: bool) -> Option<&Instrument> {
        if let Some(instrument) = self.by_ticker.get(query) {
            return Some(instrument);
        }
        if let Some(ticker) = self.by_figi.get(query) {
            return self.by_ticker.get(ticker);
        }
        if exact {
            return None;
        }
        let needle = query.to_uppercase();
        self.by_ticker
            .values()
            .find(|i| i.name.to_uppercase().contains(&needle))
    }

    pub fn len(&self) -> usize {
        self.by_ticker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ticker.is_empty()
    }
}

#[derive(Clone)]
pub struct InstrumentCache {
    rx: watch::Receiver<Arc<InstrumentSnapshot>>,
}

impl InstrumentCache {
    /// Cache that never fills; lookups always miss.
    pub fn empty() -> Self {
        let (_tx, rx) = watch::channel(Arc::new(InstrumentSnapshot::default()));
        Self { rx }
    }

    pub fn snapshot(&self) -> Arc<InstrumentSnapshot> {
        self.rx.borrow().clone()
    }
}

pub fn instrument_url(instrument: &Instrument) -> String {
    let class = match instrument.class {
        InstrumentClass::Stock => "stocks",
        InstrumentClass::Bond => "bonds",
        InstrumentClass::Etf => "etfs",
    };
    format!("https://www.tinkoff.ru/invest/{}/{}/", class, instrument.ticker)
}

/// Spawns the refresh task and hands out the reading side.
pub fn spawn_refresh(broker: Arc<dyn BrokerApi>, every: Duration) -> InstrumentCache {
    let (tx, rx) = watch::channel(Arc::new(InstrumentSnapshot::default()));
    tokio::spawn(async move {
        let mut tick = interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            match refresh(&*broker).await {
                Ok(snapshot) => {
                    info!(instruments = snapshot.len(), "instrument cache refreshed");
                    let _ = tx.send(Arc::new(snapshot));
                }
                Err(e) => {
                    // Keep serving the previous snapshot.
                    error!(error = %e, "failed to refresh instrument cache");
                }
            }
        }
    });
    InstrumentCache { rx }
}

async fn refresh(broker: &dyn BrokerApi) -> Result<InstrumentSnapshot, BrokerError> {
    let mut snapshot = InstrumentSnapshot::default();
    for class in [InstrumentClass::Stock, InstrumentClass::Bond, InstrumentClass::Etf] {
        let instruments = broker.instruments(class).await?;
        let label = match class {
            InstrumentClass::Stock => "stocks",
            InstrumentClass::Bond => "bonds",
            InstrumentClass::Etf => "etfs",
        };
        CACHE_INSTRUMENTS
            .with_label_values(&[label])
            .set(instruments.len() as i64);
        for instrument in instruments {
            snapshot.insert(instrument);
        }
    }
    Ok(snapshot)
}
