// ===============================
// src/main.rs
// ===============================
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::time::Duration;
use tracing::{error, info};

use invest_watch_rust::alerts::AccountContext;
use invest_watch_rust::broker::BrokerApi;
use invest_watch_rust::domain::MoverEntry;
use invest_watch_rust::notify::Notifier;
use invest_watch_rust::storage::WatchStore;
use invest_watch_rust::{alerts, cache, config, ledger, metrics, movers, notify, rest, storage, stream, transport};

#[derive(Parser)]
#[command(name = "invest_watch_rust", about = "brokerage P&L tracker and price watch bot")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the watch workers: candle stream, alerts, daily movers
    Run,
    /// Print a one-shot portfolio report and exit
    Report {
        /// Include the per-instrument closed trade log
        #[arg(long)]
        full: bool,
    },
}

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt().with_env_filter("info").init();

    // ---- Load config ----
    let cfg = config::load();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Run) {
        Command::Report { full } => run_report(&cfg, full).await,
        Command::Run => run_bot(cfg).await,
    }
}

async fn run_report(cfg: &config::Config, full: bool) {
    let broker = rest::RestBroker::new(&cfg.rest_base_url, &cfg.api_token);
    match ledger::build_portfolio(&broker, cfg.operations_window_days).await {
        Ok(portfolio) => {
            println!("{}", portfolio.summary());
            if full {
                for item in portfolio.items.iter().filter(|i| !i.ticker.is_empty()) {
                    println!("{}", item.details());
                }
            }
        }
        Err(e) => {
            error!(error = %e, "portfolio report failed");
            std::process::exit(1);
        }
    }
}

async fn run_bot(cfg: config::Config) {
    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(cfg.metrics_port));

    info!(
        rest = %cfg.rest_base_url,
        stream = %cfg.stream_url,
        private = cfg.private_account,
        watches = cfg.watches.len(),
        "startup config"
    );

    // ---- Collaborators ----
    let broker: Arc<dyn BrokerApi> = Arc::new(rest::RestBroker::new(&cfg.rest_base_url, &cfg.api_token));
    let store: Arc<dyn WatchStore> = Arc::new(storage::MemoryStore::new());
    let notifier: Arc<dyn Notifier> = Arc::new(notify::LogNotifier);
    let accounts: Arc<dyn AccountContext> = if cfg.private_account {
        Arc::new(alerts::PrivateAccounts::new(broker.clone()))
    } else {
        Arc::new(alerts::SharedAccounts)
    };

    // ---- Instrument cache ----
    let cache = cache::spawn_refresh(broker.clone(), Duration::from_secs(cfg.cache_refresh_secs));

    // ---- Candle stream ----
    let transport = Arc::new(transport::CandleTransport::new(
        &cfg.stream_url,
        &cfg.api_token,
        &cfg.candle_interval,
    ));
    let (mux, event_rx) =
        stream::StreamMux::new(transport, Duration::from_secs(cfg.reconnect_interval_secs));

    // ---- Seed configured watches (watcher 0 = the operator) ----
    for (ticker, arg) in &cfg.watches {
        match alerts::parse_threshold(arg) {
            Ok((mode, threshold)) => {
                match alerts::register_watch(&*broker, &*store, &mux, 0, ticker, mode, threshold)
                    .await
                {
                    Ok(rule) => info!(ticker = %rule.ticker, ?mode, threshold, "watch registered"),
                    Err(e) => error!(error = %e, %ticker, "failed to register configured watch"),
                }
            }
            Err(e) => error!(error = %e, %ticker, "bad configured watch threshold"),
        }
    }
    if cfg.daily_threshold > 0.0 {
        if let Err(e) = store.subscribe_daily(0, cfg.daily_threshold).await {
            error!(error = %e, "failed to subscribe to daily movers");
        }
    }

    // Converge the stream to whatever the store already holds.
    if let Err(e) = alerts::resubscribe_all(&*store, &mux).await {
        error!(error = %e, "failed to restore subscriptions");
    }

    // ---- Alert engine ----
    tokio::spawn(alerts::run(event_rx, store.clone(), accounts, notifier.clone()));

    // ---- Daily movers ----
    let (snapshot_tx, snapshot_rx) =
        tokio::sync::watch::channel::<Arc<Vec<MoverEntry>>>(Arc::new(Vec::new()));
    let movers_cfg = movers::MoversConfig {
        primary_url: cfg.movers_primary_url.clone(),
        screener_url: cfg.movers_screener_url.clone(),
        period: Duration::from_secs(cfg.movers_period_secs),
        session_cutoff_hour: cfg.session_cutoff_hour,
    };
    tokio::spawn(movers::run(
        movers_cfg,
        store.clone(),
        notifier.clone(),
        cache.clone(),
        snapshot_tx,
    ));

    // ---- Heartbeat ----
    let mut tick = tokio::time::interval(Duration::from_secs(60));
    loop {
        tick.tick().await;
        info!(
            events = metrics::STREAM_EVENTS.get(),
            subscriptions = metrics::ACTIVE_SUBSCRIPTIONS.get(),
            movers = snapshot_rx.borrow().len(),
            "heartbeat"
        );
    }
}
