// ===============================
// src/config.rs
// ===============================
use dotenvy::dotenv;
use std::env;

/// Runtime configuration, loaded from the environment (.env supported).
#[derive(Clone, Debug)]
pub struct Config {
    /// Broker API token used when a watcher has no private token of its own.
    pub api_token: String,
    /// True when the token belongs to a private account: percent alerts get
    /// enriched with the position gain.
    pub private_account: bool,
    pub metrics_port: u16,

    /// Watch rules seeded at boot: `WATCHES=AAPL:1%,TWTR:=30`.
    pub watches: Vec<(String, String)>,
    /// Daily movers threshold for the default watcher, percent; 0 disables.
    pub daily_threshold: f64,

    // broker endpoints
    pub rest_base_url: String,
    pub stream_url: String,

    // candle stream
    pub candle_interval: String,
    /// Fixed delay between reconnect attempts, seconds.
    pub reconnect_interval_secs: u64,

    // daily movers
    pub movers_primary_url: String,
    pub movers_screener_url: String,
    pub movers_period_secs: u64,
    /// Daily cutoff hour (UTC) at which "already notified" markers reset.
    pub session_cutoff_hour: u32,

    // portfolio
    pub operations_window_days: i64,

    // instrument cache
    pub cache_refresh_secs: u64,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

pub fn load() -> Config {
    let _ = dotenv();

    // WATCHES=AAPL:1%,TWTR:=30
    let watches: Vec<(String, String)> = env::var("WATCHES")
        .ok()
        .map(|s| {
            s.split(',')
                .filter_map(|entry| {
                    let (ticker, threshold) = entry.trim().split_once(':')?;
                    Some((ticker.to_ascii_uppercase(), threshold.to_string()))
                })
                .collect()
        })
        .unwrap_or_default();

    Config {
        api_token: env::var("API_TOKEN").unwrap_or_default(),
        private_account: env_parse("PRIVATE_ACCOUNT", false),
        metrics_port: env_parse("METRICS_PORT", 9898),

        watches,
        daily_threshold: env_parse("DAILY_THRESHOLD", 0.0),

        rest_base_url: env_or("REST_BASE_URL", "https://api-invest.tinkoff.ru/openapi"),
        stream_url: env_or(
            "STREAM_URL",
            "wss://api-invest.tinkoff.ru/openapi/md/v1/md-openapi/ws",
        ),

        candle_interval: env_or("CANDLE_INTERVAL", "5min"),
        reconnect_interval_secs: env_parse("RECONNECT_INTERVAL_SECS", 1),

        movers_primary_url: env_or(
            "MOVERS_PRIMARY_URL",
            "https://api.tinkoff.ru/trading/stocks/list?sortType=ByName&orderType=Asc&country=All",
        ),
        movers_screener_url: env_or(
            "MOVERS_SCREENER_URL",
            "https://query2.finance.yahoo.com/v1/finance/screener?lang=en-US&formatted=false",
        ),
        movers_period_secs: env_parse("MOVERS_PERIOD_SECS", 60),
        session_cutoff_hour: env_parse("SESSION_CUTOFF_HOUR", 7),

        operations_window_days: env_parse("OPERATIONS_WINDOW_DAYS", 5 * 365),

        cache_refresh_secs: env_parse("CACHE_REFRESH_SECS", 3600),
    }
}
