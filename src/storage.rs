// ===============================
// src/storage.rs
// ===============================
//
// Narrow persistence surface for watch rules, daily subscriptions and the
// per-session notification markers. The production deployment puts a real
// database behind this trait; `MemoryStore` carries the same observable
// semantics in-process.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::domain::{WatchRule, WatcherId};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage failure: {0}")]
    Backend(String),
}

#[async_trait]
pub trait WatchStore: Send + Sync {
    /// Inserts or replaces the rule keyed by (watcher, figi, mode); returns
    /// the rule id. An upsert re-seeds threshold, last and current values.
    async fn upsert_rule(&self, rule: &WatchRule) -> Result<i64, StorageError>;

    async fn rules(&self) -> Result<Vec<WatchRule>, StorageError>;
    async fn rules_by_watcher(&self, watcher: WatcherId) -> Result<Vec<WatchRule>, StorageError>;
    async fn rules_by_figi(&self, figi: &str) -> Result<Vec<WatchRule>, StorageError>;

    async fn delete_rule(&self, id: i64) -> Result<(), StorageError>;
    async fn delete_rules_by_figi(&self, watcher: WatcherId, figi: &str) -> Result<(), StorageError>;
    async fn delete_rules(&self, watcher: WatcherId) -> Result<(), StorageError>;

    async fn set_current_value(&self, figi: &str, value: f64) -> Result<(), StorageError>;
    async fn set_last_value(&self, id: i64, value: f64) -> Result<(), StorageError>;

    async fn subscribe_daily(&self, watcher: WatcherId, threshold: f64) -> Result<(), StorageError>;
    async fn unsubscribe_daily(&self, watcher: WatcherId) -> Result<(), StorageError>;
    async fn daily_subscriptions(&self) -> Result<HashMap<WatcherId, f64>, StorageError>;

    /// Marks (watcher, ticker) as notified. Returns true when it was already
    /// marked after `session_start`, i.e. within the current session.
    async fn mark_notified(
        &self,
        watcher: WatcherId,
        ticker: &str,
        session_start: DateTime<Utc>,
    ) -> Result<bool, StorageError>;
}

/// Most recent session boundary in the past: today's cutoff hour, or
/// yesterday's when the cutoff has not happened yet.
pub fn session_start(cutoff_hour: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    let cutoff = NaiveTime::from_hms_opt(cutoff_hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    let start = now.date_naive().and_time(cutoff).and_utc();
    if now < start {
        start - Duration::days(1)
    } else {
        start
    }
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    rules: Vec<WatchRule>,
    daily: HashMap<WatcherId, f64>,
    notified: HashMap<(WatcherId, String), DateTime<Utc>>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WatchStore for MemoryStore {
    async fn upsert_rule(&self, rule: &WatchRule) -> Result<i64, StorageError> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.rules.iter_mut().find(|r| {
            r.watcher == rule.watcher
                && r.figi == rule.figi
                && r.mode == rule.mode
                && r.permanent == rule.permanent
        }) {
            existing.threshold = rule.threshold;
            existing.last_value = rule.last_value;
            existing.current_value = rule.current_value;
            return Ok(existing.id);
        }
        inner.next_id += 1;
        let id = inner.next_id;
        let mut rule = rule.clone();
        rule.id = id;
        inner.rules.push(rule);
        Ok(id)
    }

    async fn rules(&self) -> Result<Vec<WatchRule>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner.rules.iter().filter(|r| r.permanent).cloned().collect())
    }

    async fn rules_by_watcher(&self, watcher: WatcherId) -> Result<Vec<WatchRule>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rules
            .iter()
            .filter(|r| r.permanent && r.watcher == watcher)
            .cloned()
            .collect())
    }

    async fn rules_by_figi(&self, figi: &str) -> Result<Vec<WatchRule>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rules
            .iter()
            .filter(|r| r.permanent && r.figi == figi)
            .cloned()
            .collect())
    }

    async fn delete_rule(&self, id: i64) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.rules.retain(|r| r.id != id);
        Ok(())
    }

    async fn delete_rules_by_figi(&self, watcher: WatcherId, figi: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.rules.retain(|r| !(r.watcher == watcher && r.figi == figi));
        Ok(())
    }

    async fn delete_rules(&self, watcher: WatcherId) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.rules.retain(|r| r.watcher != watcher);
        Ok(())
    }

    async fn set_current_value(&self, figi: &str, value: f64) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        for rule in inner.rules.iter_mut().filter(|r| r.figi == figi) {
            rule.current_value = value;
        }
        Ok(())
    }

    async fn set_last_value(&self, id: i64, value: f64) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        for rule in inner.rules.iter_mut().filter(|r| r.id == id) {
            rule.last_value = value;
        }
        Ok(())
    }

    async fn subscribe_daily(&self, watcher: WatcherId, threshold: f64) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.daily.insert(watcher, threshold);
        Ok(())
    }

    async fn unsubscribe_daily(&self, watcher: WatcherId) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.daily.remove(&watcher);
        Ok(())
    }

    async fn daily_subscriptions(&self) -> Result<HashMap<WatcherId, f64>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner.daily.clone())
    }

    async fn mark_notified(
        &self,
        watcher: WatcherId,
        ticker: &str,
        session_start: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock().await;
        let key = (watcher, ticker.to_string());
        if let Some(ts) = inner.notified.get(&key) {
            if *ts > session_start {
                return Ok(true);
            }
        }
        inner.notified.insert(key, Utc::now());
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Currency, WatchMode};
    use chrono::TimeZone;

    fn rule(watcher: WatcherId, figi: &str, mode: WatchMode) -> WatchRule {
        WatchRule {
            id: 0,
            watcher,
            figi: figi.into(),
            ticker: "AAPL".into(),
            mode,
            threshold: 1.0,
            last_value: 100.0,
            current_value: 100.0,
            currency: Currency::Usd,
            permanent: true,
        }
    }

    #[test]
    fn session_start_steps_back_before_cutoff() {
        let cutoff = 7;
        let before = Utc.with_ymd_and_hms(2021, 3, 10, 5, 0, 0).unwrap();
        assert_eq!(
            session_start(cutoff, before),
            Utc.with_ymd_and_hms(2021, 3, 9, 7, 0, 0).unwrap()
        );
        let after = Utc.with_ymd_and_hms(2021, 3, 10, 9, 30, 0).unwrap();
        assert_eq!(
            session_start(cutoff, after),
            Utc.with_ymd_and_hms(2021, 3, 10, 7, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn upsert_replaces_by_watcher_figi_mode() {
        let store = MemoryStore::new();
        let id1 = store.upsert_rule(&rule(1, "F1", WatchMode::PercentMove)).await.unwrap();

        let mut updated = rule(1, "F1", WatchMode::PercentMove);
        updated.threshold = 5.0;
        let id2 = store.upsert_rule(&updated).await.unwrap();
        assert_eq!(id1, id2);

        let rules = store.rules_by_watcher(1).await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].threshold, 5.0);

        // Same figi, different mode: a separate rule.
        store.upsert_rule(&rule(1, "F1", WatchMode::LevelCross)).await.unwrap();
        assert_eq!(store.rules_by_watcher(1).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn mark_notified_resets_at_session_boundary() {
        let store = MemoryStore::new();
        let session = Utc::now() - Duration::hours(1);

        assert!(!store.mark_notified(1, "AAPL", session).await.unwrap());
        assert!(store.mark_notified(1, "AAPL", session).await.unwrap());
        // Different ticker and different watcher are independent.
        assert!(!store.mark_notified(1, "TWTR", session).await.unwrap());
        assert!(!store.mark_notified(2, "AAPL", session).await.unwrap());

        // A boundary in the future of the stored mark means a new session.
        let next_session = Utc::now() + Duration::hours(1);
        assert!(!store.mark_notified(1, "AAPL", next_session).await.unwrap());
    }

    #[tokio::test]
    async fn set_values_touch_expected_rules() {
        let store = MemoryStore::new();
        let id = store.upsert_rule(&rule(1, "F1", WatchMode::PercentMove)).await.unwrap();
        store.upsert_rule(&rule(2, "F1", WatchMode::PercentMove)).await.unwrap();

        // current_value is keyed by instrument, last_value by rule id.
        store.set_current_value("F1", 123.0).await.unwrap();
        store.set_last_value(id, 120.0).await.unwrap();

        let rules = store.rules_by_figi("F1").await.unwrap();
        assert!(rules.iter().all(|r| r.current_value == 123.0));
        assert!(rules.iter().any(|r| r.last_value == 120.0));
        assert!(rules.iter().any(|r| r.last_value == 100.0));
    }
}
