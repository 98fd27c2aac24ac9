// ===============================
// src/stream.rs (market data multiplexer)
// ===============================
//
// One StreamMux per credential owns one physical market-data connection.
// Watchers share a single logical subscription per instrument through
// reference counting; the wire commands flow through a single-consumer
// command queue so they are never sent concurrently. The worker dials
// lazily, retries on a fixed tick forever, and after every reconnect
// replays the commands of all still-active subscriptions.

use ahash::AHashMap as HashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::domain::{StreamCommand, StreamEvent, WatcherId};
use crate::metrics::{
    ACTIVE_SUBSCRIPTIONS, STREAM_COMMANDS, STREAM_COMMAND_ERRORS, STREAM_CONNECTED, STREAM_EVENTS,
    STREAM_RECONNECTS,
};

pub const EVENT_QUEUE_CAPACITY: usize = 1000;
pub const COMMAND_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("dial failed: {0}")]
    Dial(String),
    #[error("send failed: {0}")]
    Send(String),
}

/// An established physical connection: commands out, decoded events in.
#[async_trait]
pub trait StreamConn: Send {
    async fn send(&mut self, cmd: &StreamCommand) -> Result<(), StreamError>;

    /// Next decoded event; `None` once the connection is gone.
    async fn next_event(&mut self) -> Option<StreamEvent>;
}

#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn StreamConn>, StreamError>;
}

struct Subscription {
    cmd: StreamCommand,
    watchers: HashSet<WatcherId>,
}

type SubscriptionMap = HashMap<String, Subscription>;

pub struct StreamMux {
    subscriptions: Arc<Mutex<SubscriptionMap>>,
    cmd_tx: mpsc::Sender<StreamCommand>,
    shutdown: watch::Sender<bool>,
}

impl StreamMux {
    /// Spawns the connection worker and returns the mux together with the
    /// receiving end of the event queue.
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        reconnect_interval: Duration,
    ) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let subscriptions: Arc<Mutex<SubscriptionMap>> = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(run_worker(
            transport,
            subscriptions.clone(),
            cmd_rx,
            cmd_tx.clone(),
            event_tx,
            shutdown_rx,
            reconnect_interval,
        ));

        (
            Self { subscriptions, cmd_tx, shutdown },
            event_rx,
        )
    }

    /// Registers `watcher` on the instrument. Creates the subscription
    /// record on first interest; a watcher already registered is a no-op
    /// and sends nothing on the wire.
    pub async fn subscribe(&self, figi: &str, watcher: WatcherId) {
        let cmd = {
            let mut subs = self.subscriptions.lock().unwrap();
            let sub = subs.entry(figi.to_string()).or_insert_with(|| Subscription {
                cmd: StreamCommand::SubscribeCandle { figi: figi.to_string() },
                watchers: HashSet::new(),
            });
            let newly_added = sub.watchers.insert(watcher);
            let cmd = newly_added.then(|| sub.cmd.clone());
            ACTIVE_SUBSCRIPTIONS.set(active_count(&subs));
            cmd
        };
        if let Some(cmd) = cmd {
            self.enqueue(cmd).await;
        }
    }

    /// Drops `watcher` from the instrument; a watcher that never subscribed
    /// is a no-op. The physical unsubscribe goes out only when the member
    /// set empties; the record itself is retained for fast re-subscribe.
    pub async fn unsubscribe(&self, figi: &str, watcher: WatcherId) {
        let cmd = {
            let mut subs = self.subscriptions.lock().unwrap();
            let Some(sub) = subs.get_mut(figi) else { return };
            if !sub.watchers.remove(&watcher) {
                return;
            }
            let cmd = sub
                .watchers
                .is_empty()
                .then(|| StreamCommand::UnsubscribeCandle { figi: figi.to_string() });
            ACTIVE_SUBSCRIPTIONS.set(active_count(&subs));
            cmd
        };
        if let Some(cmd) = cmd {
            self.enqueue(cmd).await;
        }
    }

    /// Terminal cancellation: aborts the dial loop and any pending queue
    /// sends promptly. There is no resume.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn enqueue(&self, cmd: StreamCommand) {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            res = self.cmd_tx.send(cmd) => {
                if res.is_err() {
                    warn!("command queue closed, dropping command");
                }
            }
            _ = shutdown.changed() => {}
        }
    }
}

fn active_count(subs: &SubscriptionMap) -> i64 {
    subs.values().filter(|s| !s.watchers.is_empty()).count() as i64
}

async fn run_worker(
    transport: Arc<dyn StreamTransport>,
    subscriptions: Arc<Mutex<SubscriptionMap>>,
    mut cmd_rx: mpsc::Receiver<StreamCommand>,
    cmd_tx: mpsc::Sender<StreamCommand>,
    event_tx: mpsc::Sender<StreamEvent>,
    mut shutdown: watch::Receiver<bool>,
    reconnect_interval: Duration,
) {
    let mut conn: Option<Box<dyn StreamConn>> = None;
    let mut connected_before = false;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("stream worker cancelled");
                return;
            }
            maybe_cmd = cmd_rx.recv() => {
                let Some(cmd) = maybe_cmd else { return };
                // The first command on a cold connection pays the dial.
                if conn.is_none() {
                    match dial(&*transport, &mut shutdown, reconnect_interval).await {
                        Some(c) => {
                            conn = Some(c);
                            STREAM_CONNECTED.set(1);
                            if connected_before {
                                STREAM_RECONNECTS.inc();
                            }
                            connected_before = true;
                        }
                        None => return, // cancelled mid-dial
                    }
                }
                let kind = match &cmd {
                    StreamCommand::SubscribeCandle { .. } => "subscribe",
                    StreamCommand::UnsubscribeCandle { .. } => "unsubscribe",
                };
                let Some(c) = conn.as_mut() else { continue };
                match c.send(&cmd).await {
                    Ok(()) => {
                        STREAM_COMMANDS.with_label_values(&[kind]).inc();
                    }
                    Err(e) => {
                        // Fire-and-log: reconnect replay is the retry path.
                        STREAM_COMMAND_ERRORS.inc();
                        warn!(error = %e, ?cmd, "wire command failed");
                    }
                }
            }
            ev = next_event(&mut conn), if conn.is_some() => {
                match ev {
                    Some(event) => {
                        STREAM_EVENTS.inc();
                        tokio::select! {
                            res = event_tx.send(event) => {
                                if res.is_err() {
                                    info!("event queue closed, stopping worker");
                                    return;
                                }
                            }
                            _ = shutdown.changed() => return,
                        }
                    }
                    None => {
                        info!("read loop exited, scheduling subscription replay");
                        STREAM_CONNECTED.set(0);
                        conn = None;
                        // Re-enqueue from a separate task, like a detached
                        // read loop would: the worker must stay free to
                        // drain its own command queue.
                        let subs = subscriptions.clone();
                        let tx = cmd_tx.clone();
                        tokio::spawn(async move { replay(&subs, &tx).await });
                    }
                }
            }
        }
    }
}

async fn next_event(conn: &mut Option<Box<dyn StreamConn>>) -> Option<StreamEvent> {
    match conn.as_mut() {
        Some(c) => c.next_event().await,
        // Guarded out by `if conn.is_some()` on the select arm.
        None => std::future::pending().await,
    }
}

/// Dials with one attempt per tick, forever, until cancelled.
async fn dial(
    transport: &dyn StreamTransport,
    shutdown: &mut watch::Receiver<bool>,
    every: Duration,
) -> Option<Box<dyn StreamConn>> {
    let mut tick = interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut attempt: u64 = 0;
    loop {
        tokio::select! {
            _ = shutdown.changed() => return None,
            _ = tick.tick() => {
                attempt += 1;
                match transport.connect().await {
                    Ok(conn) => {
                        info!(attempt, "market data connection established");
                        return Some(conn);
                    }
                    Err(e) => {
                        error!(error = %e, attempt, "dial failed, will retry");
                    }
                }
            }
        }
    }
}

/// Snapshot of all still-active subscriptions, replayed through the same
/// command channel live commands use.
async fn replay(subscriptions: &Mutex<SubscriptionMap>, cmd_tx: &mpsc::Sender<StreamCommand>) {
    let commands: Vec<StreamCommand> = {
        let subs = subscriptions.lock().unwrap();
        subs.values()
            .filter(|s| !s.watchers.is_empty())
            .map(|s| s.cmd.clone())
            .collect()
    };
    info!(count = commands.len(), "replaying subscriptions");
    for cmd in commands {
        if cmd_tx.send(cmd).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::time::sleep;

    #[derive(Default)]
    struct MockState {
        dials: usize,
        fail_dials: usize,
        /// (connection index, command) in send order.
        sent: Vec<(usize, StreamCommand)>,
        /// Event feeds, one per established connection; dropping a sender
        /// terminates that connection's read side.
        event_txs: Vec<Option<mpsc::UnboundedSender<StreamEvent>>>,
    }

    #[derive(Clone, Default)]
    struct MockTransport {
        state: Arc<StdMutex<MockState>>,
    }

    impl MockTransport {
        fn sent(&self) -> Vec<(usize, StreamCommand)> {
            self.state.lock().unwrap().sent.clone()
        }

        fn push_event(&self, idx: usize, event: StreamEvent) {
            let state = self.state.lock().unwrap();
            if let Some(Some(tx)) = state.event_txs.get(idx) {
                let _ = tx.send(event);
            }
        }

        fn kill_connection(&self, idx: usize) {
            let mut state = self.state.lock().unwrap();
            if let Some(slot) = state.event_txs.get_mut(idx) {
                *slot = None;
            }
        }
    }

    struct MockConn {
        idx: usize,
        state: Arc<StdMutex<MockState>>,
        events: mpsc::UnboundedReceiver<StreamEvent>,
    }

    #[async_trait]
    impl StreamConn for MockConn {
        async fn send(&mut self, cmd: &StreamCommand) -> Result<(), StreamError> {
            self.state.lock().unwrap().sent.push((self.idx, cmd.clone()));
            Ok(())
        }

        async fn next_event(&mut self) -> Option<StreamEvent> {
            self.events.recv().await
        }
    }

    #[async_trait]
    impl StreamTransport for MockTransport {
        async fn connect(&self) -> Result<Box<dyn StreamConn>, StreamError> {
            let mut state = self.state.lock().unwrap();
            state.dials += 1;
            if state.dials <= state.fail_dials {
                return Err(StreamError::Dial("mock refused".into()));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let idx = state.event_txs.len();
            state.event_txs.push(Some(tx));
            Ok(Box::new(MockConn { idx, state: self.state.clone(), events: rx }))
        }
    }

    fn mux(transport: &MockTransport) -> (StreamMux, mpsc::Receiver<StreamEvent>) {
        StreamMux::new(Arc::new(transport.clone()), Duration::from_millis(5))
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn sub(figi: &str) -> StreamCommand {
        StreamCommand::SubscribeCandle { figi: figi.into() }
    }

    #[tokio::test]
    async fn subscribe_is_idempotent_per_watcher() {
        let transport = MockTransport::default();
        let (mux, _events) = mux(&transport);

        mux.subscribe("FIGI1", 1).await;
        mux.subscribe("FIGI1", 1).await;
        wait_until(|| !transport.sent().is_empty()).await;
        // Give a queued duplicate a chance to (wrongly) drain.
        sleep(Duration::from_millis(30)).await;
        assert_eq!(transport.sent(), vec![(0, sub("FIGI1"))]);

        // A second watcher on the same instrument re-announces interest.
        mux.subscribe("FIGI1", 2).await;
        wait_until(|| transport.sent().len() == 2).await;
    }

    #[tokio::test]
    async fn unsubscribe_for_unknown_watcher_is_noop() {
        let transport = MockTransport::default();
        let (mux, _events) = mux(&transport);

        mux.subscribe("FIGI1", 1).await;
        wait_until(|| transport.sent().len() == 1).await;

        mux.unsubscribe("FIGI1", 99).await;
        mux.unsubscribe("FIGI2", 1).await;
        sleep(Duration::from_millis(30)).await;
        assert_eq!(transport.sent().len(), 1);

        // Last watcher out sends the physical unsubscribe.
        mux.unsubscribe("FIGI1", 1).await;
        wait_until(|| transport.sent().len() == 2).await;
        assert_eq!(
            transport.sent()[1].1,
            StreamCommand::UnsubscribeCandle { figi: "FIGI1".into() }
        );
    }

    #[tokio::test]
    async fn events_are_forwarded_in_order() {
        let transport = MockTransport::default();
        let (mux, mut events) = mux(&transport);

        mux.subscribe("FIGI1", 1).await;
        wait_until(|| transport.sent().len() == 1).await;

        for close in [10.0, 11.0, 12.0] {
            transport.push_event(
                0,
                StreamEvent::Candle(crate::domain::CandleUpdate { figi: "FIGI1".into(), close }),
            );
        }
        for want in [10.0, 11.0, 12.0] {
            match events.recv().await {
                Some(StreamEvent::Candle(c)) => assert_eq!(c.close, want),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn reconnect_replays_every_active_subscription_once() {
        let transport = MockTransport::default();
        let (mux, _events) = mux(&transport);

        mux.subscribe("FIGI1", 1).await;
        mux.subscribe("FIGI2", 1).await;
        mux.subscribe("FIGI3", 2).await;
        wait_until(|| transport.sent().len() == 3).await;

        // One subscription goes inactive before the disconnect.
        mux.unsubscribe("FIGI3", 2).await;
        wait_until(|| transport.sent().len() == 4).await;

        transport.kill_connection(0);
        wait_until(|| transport.sent().iter().any(|(idx, _)| *idx == 1)).await;
        sleep(Duration::from_millis(50)).await;

        let replayed: Vec<StreamCommand> = transport
            .sent()
            .into_iter()
            .filter(|(idx, _)| *idx == 1)
            .map(|(_, cmd)| cmd)
            .collect();
        assert_eq!(replayed.len(), 2, "exactly N active subscriptions replayed");
        assert!(replayed.contains(&sub("FIGI1")));
        assert!(replayed.contains(&sub("FIGI2")));
    }

    #[tokio::test]
    async fn dial_retries_on_fixed_ticks_until_success() {
        let transport = MockTransport::default();
        transport.state.lock().unwrap().fail_dials = 3;
        let (mux, _events) = mux(&transport);

        mux.subscribe("FIGI1", 1).await;
        wait_until(|| transport.sent().len() == 1).await;
        assert_eq!(transport.state.lock().unwrap().dials, 4);
    }

    #[tokio::test]
    async fn close_is_terminal_and_drops_pending_work() {
        let transport = MockTransport::default();
        transport.state.lock().unwrap().fail_dials = usize::MAX;
        let (mux, _events) = mux(&transport);

        mux.subscribe("FIGI1", 1).await;
        mux.close();
        // Must return promptly even though the dial loop can never succeed.
        tokio::time::timeout(Duration::from_secs(1), mux.subscribe("FIGI2", 1))
            .await
            .expect("subscribe must not hang after close");
        sleep(Duration::from_millis(30)).await;
        assert!(transport.sent().is_empty());
    }
}
