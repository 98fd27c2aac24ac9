// ===============================
// src/movers.rs (daily top movers)
// ===============================
//
// Periodic merge of the broker's own top-list feed with two external
// screener feeds (gainers and losers). The merged, ranked list is published
// as an atomically swapped snapshot; subscribers above their threshold get
// at most one notification per (watcher, ticker) per trading session.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Datelike, TimeZone, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

use crate::cache::InstrumentCache;
use crate::domain::{num_sign, MoverEntry, WatcherId};
use crate::metrics::{MOVER_CYCLES, MOVER_CYCLE_ERRORS, MOVER_NOTIFICATIONS};
use crate::notify::Notifier;
use crate::storage::{self, WatchStore};

#[derive(Debug, Error)]
pub enum MoversError {
    #[error("feed request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("feed returned no data")]
    Empty,
}

#[derive(Clone, Debug)]
pub struct MoversConfig {
    pub primary_url: String,
    pub screener_url: String,
    pub period: Duration,
    pub session_cutoff_hour: u32,
}

/// Screener query bodies: equities moved more than +3% / less than −2%,
/// US or RU region, liquid names only.
const SCREENER_GAINERS: &str = r#"{"offset":0,"size":100,"sortField":"percentchange","sortType":"DESC","quoteType":"EQUITY","query":{"operator":"AND","operands":[{"operator":"GT","operands":["percentchange",3]},{"operator":"or","operands":[{"operator":"EQ","operands":["region","us"]},{"operator":"EQ","operands":["region","ru"]}]},{"operator":"or","operands":[{"operator":"BTWN","operands":["intradaymarketcap",2000000000,10000000000]},{"operator":"BTWN","operands":["intradaymarketcap",10000000000,100000000000]},{"operator":"GT","operands":["intradaymarketcap",100000000000]}]},{"operator":"gt","operands":["dayvolume",15000]}]},"userId":"","userIdType":"guid"}"#;
const SCREENER_LOSERS: &str = r#"{"offset":0,"size":100,"sortField":"percentchange","sortType":"DESC","quoteType":"EQUITY","query":{"operator":"AND","operands":[{"operator":"LT","operands":["percentchange",-2]},{"operator":"or","operands":[{"operator":"EQ","operands":["region","us"]},{"operator":"EQ","operands":["region","ru"]}]},{"operator":"or","operands":[{"operator":"BTWN","operands":["intradaymarketcap",2000000000,10000000000]},{"operator":"BTWN","operands":["intradaymarketcap",10000000000,100000000000]},{"operator":"GT","operands":["intradaymarketcap",100000000000]}]},{"operator":"gt","operands":["dayvolume",15000]}]},"userId":"","userIdType":"guid"}"#;

pub async fn run(
    cfg: MoversConfig,
    store: Arc<dyn WatchStore>,
    notifier: Arc<dyn Notifier>,
    cache: InstrumentCache,
    snapshot_tx: watch::Sender<Arc<Vec<MoverEntry>>>,
) {
    let client = reqwest::Client::new();
    let mut tick = interval(cfg.period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        match fetch_cycle(&client, &cfg).await {
            Ok(movers) => {
                MOVER_CYCLES.inc();
                notify_subscribers(&cfg, &*store, &*notifier, &cache, &movers).await;
                let _ = snapshot_tx.send(Arc::new(movers));
            }
            Err(e) => {
                // This cycle only; the next tick starts fresh.
                MOVER_CYCLE_ERRORS.inc();
                error!(error = %e, "daily movers cycle failed");
            }
        }
    }
}

async fn fetch_cycle(
    client: &reqwest::Client,
    cfg: &MoversConfig,
) -> Result<Vec<MoverEntry>, MoversError> {
    let today = Utc::now().day();
    let primary = fetch_primary(client, &cfg.primary_url).await?;

    // A failed secondary feed is logged and skipped; the primary list alone
    // still makes a valid cycle.
    let mut secondary = Vec::new();
    for body in [SCREENER_GAINERS, SCREENER_LOSERS] {
        match fetch_screener(client, &cfg.screener_url, body, today).await {
            Ok(entries) => secondary.push(entries),
            Err(e) => error!(error = %e, "failed to get screener movers"),
        }
    }
    Ok(merge(primary, secondary))
}

// ---- Feed decoding ----

#[derive(serde::Deserialize)]
struct PrimaryFeed {
    payload: PrimaryPayload,
}

#[derive(serde::Deserialize)]
struct PrimaryPayload {
    values: Vec<PrimaryValue>,
}

#[derive(serde::Deserialize)]
struct PrimaryValue {
    earnings: PrimaryEarnings,
    symbol: PrimarySymbol,
}

#[derive(serde::Deserialize)]
struct PrimaryEarnings {
    relative: f64,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrimarySymbol {
    ticker: String,
    show_name: String,
}

async fn fetch_primary(
    client: &reqwest::Client,
    url: &str,
) -> Result<Vec<MoverEntry>, MoversError> {
    let feed: PrimaryFeed = client.get(url).send().await?.json().await?;
    if feed.payload.values.is_empty() {
        return Err(MoversError::Empty);
    }
    Ok(feed
        .payload
        .values
        .into_iter()
        .map(|v| MoverEntry {
            ticker: v.symbol.ticker,
            name: v.symbol.show_name,
            pct: v.earnings.relative * 100.0,
            external: false,
        })
        .collect())
}

#[derive(serde::Deserialize)]
struct ScreenerFeed {
    finance: ScreenerFinance,
}

#[derive(serde::Deserialize)]
struct ScreenerFinance {
    result: Vec<ScreenerResult>,
}

#[derive(serde::Deserialize)]
struct ScreenerResult {
    quotes: Vec<ScreenerQuote>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScreenerQuote {
    regular_market_change_percent: f64,
    regular_market_time: i64,
    symbol: String,
    #[serde(default, rename = "shortName")]
    short_name: String,
}

async fn fetch_screener(
    client: &reqwest::Client,
    url: &str,
    body: &'static str,
    today: u32,
) -> Result<Vec<MoverEntry>, MoversError> {
    let feed: ScreenerFeed = client
        .post(url)
        .header("Content-Type", "application/json")
        .body(body)
        .send()
        .await?
        .json()
        .await?;
    let result = feed.finance.result.into_iter().next().ok_or(MoversError::Empty)?;
    Ok(result
        .quotes
        .into_iter()
        .filter(|q| {
            // Entries not dated today in the feed's own clock are stale.
            match Utc.timestamp_opt(q.regular_market_time, 0).single() {
                Some(ts) => ts.day() == today,
                None => false,
            }
        })
        .map(|q| MoverEntry {
            ticker: q.symbol.trim_end_matches(".ME").to_string(),
            name: q.short_name,
            pct: q.regular_market_change_percent,
            external: true,
        })
        .collect())
}

/// Deduplicates by ticker preferring the primary feed, then ranks the whole
/// list by signed percent change, descending.
pub fn merge(primary: Vec<MoverEntry>, secondary: Vec<Vec<MoverEntry>>) -> Vec<MoverEntry> {
    let mut seen: HashSet<String> = primary.iter().map(|e| e.ticker.clone()).collect();
    let mut merged = primary;
    for feed in secondary {
        for entry in feed {
            if seen.insert(entry.ticker.clone()) {
                merged.push(entry);
            }
        }
    }
    merged.sort_by(|a, b| b.pct.partial_cmp(&a.pct).unwrap_or(std::cmp::Ordering::Equal));
    merged
}

// ---- Notifications ----

async fn notify_subscribers(
    cfg: &MoversConfig,
    store: &dyn WatchStore,
    notifier: &dyn Notifier,
    cache: &InstrumentCache,
    movers: &[MoverEntry],
) {
    let subs = match store.daily_subscriptions().await {
        Ok(subs) => subs,
        Err(e) => {
            error!(error = %e, "failed to get daily subscriptions");
            return;
        }
    };
    for (&watcher, &threshold) in &subs {
        if threshold <= 0.0 {
            continue;
        }
        for entry in movers.iter().filter(|e| e.pct.abs() >= threshold) {
            notify_one(cfg, store, notifier, cache, watcher, entry).await;
        }
    }
}

async fn notify_one(
    cfg: &MoversConfig,
    store: &dyn WatchStore,
    notifier: &dyn Notifier,
    cache: &InstrumentCache,
    watcher: WatcherId,
    entry: &MoverEntry,
) {
    let session = storage::session_start(cfg.session_cutoff_hour, Utc::now());
    match store.mark_notified(watcher, &entry.ticker, session).await {
        Ok(true) => return, // already notified this session
        Ok(false) => {}
        Err(e) => {
            error!(error = %e, watcher, ticker = %entry.ticker, "failed to mark mover notified");
        }
    }
    MOVER_NOTIFICATIONS.inc();
    info!(watcher, ticker = %entry.ticker, pct = entry.pct, "sending daily mover alarm");
    notifier.send(watcher, &format_entry(entry, cache), true).await;
}

/// `+5.40%   $TICKER Name (link)`, linking to the broker page when the
/// instrument is known locally.
pub fn format_entry(entry: &MoverEntry, cache: &InstrumentCache) -> String {
    let change = format!("{}{:.2}%", num_sign(entry.pct), entry.pct);
    let label = match cache.snapshot().by_ticker(&entry.ticker) {
        Some(instrument) => format!(
            "[${} {}]({})",
            entry.ticker,
            entry.name,
            crate::cache::instrument_url(instrument)
        ),
        None => format!(
            "[*{} {}](https://finance.yahoo.com/quote/{})",
            entry.ticker, entry.name, entry.ticker
        ),
    };
    format!("`{change:<8} `{label}")
}

// ---- Ranked list selections ----

/// Top gainers: the first `n` entries, or with `threshold > 0` every entry
/// that moved up at least that much.
pub fn gainers(movers: &[MoverEntry], n: usize, threshold: f64) -> Vec<MoverEntry> {
    if threshold > 0.0 {
        movers.iter().take_while(|e| e.pct >= threshold).cloned().collect()
    } else {
        movers.iter().take(n).cloned().collect()
    }
}

/// Worst losers from the tail of the ranked list, most negative last.
pub fn losers(movers: &[MoverEntry], n: usize, threshold: f64) -> Vec<MoverEntry> {
    let tail: Vec<MoverEntry> = if threshold > 0.0 {
        movers
            .iter()
            .rev()
            .take_while(|e| e.pct <= -threshold)
            .cloned()
            .collect()
    } else {
        movers.iter().rev().take(n).cloned().collect()
    };
    tail.into_iter().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::testing::RecordingNotifier;
    use crate::storage::MemoryStore;

    fn entry(ticker: &str, pct: f64, external: bool) -> MoverEntry {
        MoverEntry {
            ticker: ticker.into(),
            name: ticker.to_lowercase(),
            pct,
            external,
        }
    }

    #[test]
    fn merge_dedups_by_ticker_preferring_primary() {
        let primary = vec![entry("AAPL", 4.0, false), entry("SBER", -2.0, false)];
        let secondary = vec![
            vec![entry("AAPL", 4.5, true), entry("TSLA", 9.0, true)],
            vec![entry("TSLA", 9.0, true), entry("GE", -5.0, true)],
        ];
        let merged = merge(primary, secondary);

        let aapl: Vec<&MoverEntry> = merged.iter().filter(|e| e.ticker == "AAPL").collect();
        assert_eq!(aapl.len(), 1);
        assert!(!aapl[0].external, "primary feed wins");
        assert!((aapl[0].pct - 4.0).abs() < 1e-9);

        assert_eq!(merged.iter().filter(|e| e.ticker == "TSLA").count(), 1);

        // Ranked by signed percent, descending.
        let pcts: Vec<f64> = merged.iter().map(|e| e.pct).collect();
        assert_eq!(pcts, vec![9.0, 4.0, -2.0, -5.0]);
    }

    #[test]
    fn gainers_and_losers_selections() {
        let ranked = vec![
            entry("A", 9.0, false),
            entry("B", 5.0, false),
            entry("C", 1.0, false),
            entry("D", -3.0, false),
            entry("E", -8.0, false),
        ];
        let top: Vec<String> = gainers(&ranked, 2, 0.0).iter().map(|e| e.ticker.clone()).collect();
        assert_eq!(top, vec!["A", "B"]);

        let above: Vec<String> = gainers(&ranked, 0, 5.0).iter().map(|e| e.ticker.clone()).collect();
        assert_eq!(above, vec!["A", "B"]);

        let bottom: Vec<String> = losers(&ranked, 2, 0.0).iter().map(|e| e.ticker.clone()).collect();
        assert_eq!(bottom, vec!["D", "E"]);

        let below: Vec<String> = losers(&ranked, 0, 4.0).iter().map(|e| e.ticker.clone()).collect();
        assert_eq!(below, vec!["E"]);
    }

    #[tokio::test]
    async fn subscriber_notified_once_per_session() {
        let cfg = MoversConfig {
            primary_url: String::new(),
            screener_url: String::new(),
            period: Duration::from_secs(60),
            session_cutoff_hour: 7,
        };
        let store = MemoryStore::new();
        let notifier = RecordingNotifier::default();
        let cache = InstrumentCache::empty();
        store.subscribe_daily(1, 5.0).await.unwrap();
        store.subscribe_daily(2, 20.0).await.unwrap();

        let movers = vec![entry("TSLA", 9.0, true), entry("GE", -6.0, true), entry("C", 1.0, false)];
        notify_subscribers(&cfg, &store, &notifier, &cache, &movers).await;
        {
            let sent = notifier.sent.lock().unwrap();
            // Watcher 1 gets both 9% and −6%; watcher 2 (threshold 20) nothing.
            assert_eq!(sent.len(), 2);
            assert!(sent.iter().all(|(watcher, _)| *watcher == 1));
        }

        // Second cycle in the same session: no repeats.
        notify_subscribers(&cfg, &store, &notifier, &cache, &movers).await;
        assert_eq!(notifier.sent.lock().unwrap().len(), 2);
    }

    #[test]
    fn primary_feed_decodes() {
        let body = r#"{"payload":{"values":[
            {"earnings":{"relative":0.054},"symbol":{"ticker":"AAPL","showName":"Apple"}}
        ]}}"#;
        let feed: PrimaryFeed = serde_json::from_str(body).unwrap();
        assert_eq!(feed.payload.values.len(), 1);
        assert_eq!(feed.payload.values[0].symbol.ticker, "AAPL");
        assert!((feed.payload.values[0].earnings.relative - 0.054).abs() < 1e-12);
    }

    #[test]
    fn screener_feed_decodes() {
        let body = r#"{"finance":{"result":[{"quotes":[
            {"regularMarketChangePercent":5.4,"regularMarketTime":1614600000,
             "symbol":"SBER.ME","shortName":"Sberbank"}
        ]}]}}"#;
        let feed: ScreenerFeed = serde_json::from_str(body).unwrap();
        let quote = &feed.finance.result[0].quotes[0];
        assert_eq!(quote.symbol, "SBER.ME");
        assert!((quote.regular_market_change_percent - 5.4).abs() < 1e-12);
    }
}
