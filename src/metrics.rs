// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Streaming --------
pub static STREAM_EVENTS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("stream_events_total", "decoded market data events").unwrap());

pub static STREAM_CONNECTED: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("stream_connected", "1 if the market data connection is up").unwrap()
});

pub static STREAM_RECONNECTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("stream_reconnects_total", "market data connection attempts after the first").unwrap()
});

pub static STREAM_COMMANDS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("stream_commands_total", "wire commands sent (label: kind)"),
        &["kind"],
    )
    .unwrap()
});

pub static STREAM_COMMAND_ERRORS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("stream_command_errors_total", "wire commands that failed").unwrap());

pub static ACTIVE_SUBSCRIPTIONS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("active_subscriptions", "instrument subscriptions with at least one watcher").unwrap()
});

// -------- Alerts --------
pub static ALERTS_FIRED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("alerts_fired_total", "price watch alerts fired (label: mode)"),
        &["mode"],
    )
    .unwrap()
});

// -------- Daily movers --------
pub static MOVER_CYCLES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("mover_cycles_total", "completed daily mover refresh cycles").unwrap());

pub static MOVER_CYCLE_ERRORS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("mover_cycle_errors_total", "daily mover cycles aborted by feed errors").unwrap());

pub static MOVER_NOTIFICATIONS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("mover_notifications_total", "daily mover notifications sent").unwrap());

// -------- Portfolio --------
pub static PORTFOLIO_REBUILDS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("portfolio_rebuilds_total", "portfolio ledger rebuilds").unwrap());

pub static PORTFOLIO_REBUILD_ERRORS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("portfolio_rebuild_errors_total", "portfolio rebuilds aborted by upstream errors").unwrap());

// -------- Instrument cache --------
pub static CACHE_INSTRUMENTS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("cache_instruments", "instruments in the cache snapshot (label: class)"),
        &["class"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(STREAM_EVENTS.clone())),
        REGISTRY.register(Box::new(STREAM_CONNECTED.clone())),
        REGISTRY.register(Box::new(STREAM_RECONNECTS.clone())),
        REGISTRY.register(Box::new(STREAM_COMMANDS.clone())),
        REGISTRY.register(Box::new(STREAM_COMMAND_ERRORS.clone())),
        REGISTRY.register(Box::new(ACTIVE_SUBSCRIPTIONS.clone())),
        REGISTRY.register(Box::new(ALERTS_FIRED.clone())),
        REGISTRY.register(Box::new(MOVER_CYCLES.clone())),
        REGISTRY.register(Box::new(MOVER_CYCLE_ERRORS.clone())),
        REGISTRY.register(Box::new(MOVER_NOTIFICATIONS.clone())),
        REGISTRY.register(Box::new(PORTFOLIO_REBUILDS.clone())),
        REGISTRY.register(Box::new(PORTFOLIO_REBUILD_ERRORS.clone())),
        REGISTRY.register(Box::new(CACHE_INSTRUMENTS.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics) — tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub async fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = TcpListener::bind(&addr)
            .unwrap_or_else(|e| panic!("metrics bind {} failed: {}", addr, e));
        eprintln!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => eprintln!("metrics accept error: {}", e),
            }
        }
    });
}
