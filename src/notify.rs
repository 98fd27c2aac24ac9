// ===============================
// src/notify.rs
// ===============================
//
// Outbound notification sink. The chat front-end owns real delivery; the
// core only requires fire-and-log semantics: a failed send is logged by the
// implementation and never retried.

use async_trait::async_trait;
use tracing::info;

use crate::domain::WatcherId;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, watcher: WatcherId, message: &str, rich: bool);
}

/// Default sink: writes every notification to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, watcher: WatcherId, message: &str, rich: bool) {
        info!(watcher, rich, %message, "notification");
    }
}
