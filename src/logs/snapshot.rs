//! Whole-resource tailing: re-fetch a resource and emit it only when it changed.

use crate::api::Fetched;
use crate::error::LiveError;
use crate::model::{ChangeFingerprint, ResourceSnapshot, StatusSet};
use crate::poller::PollSource;
use crate::worker::WorkerHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct SnapshotTailer {
    last: Option<ChangeFingerprint>,
}

impl SnapshotTailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the snapshot differs from the previous one.
    pub fn observe(&mut self, snapshot: &ResourceSnapshot) -> bool {
        let fp = snapshot.fingerprint();
        if self.last.as_ref() == Some(&fp) {
            return false;
        }
        self.last = Some(fp);
        true
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Changed(ResourceSnapshot),
    NotReady,
    /// Final snapshot; the resource reached a terminal status.
    Finished(ResourceSnapshot),
    Failed(LiveError),
}

pub fn spawn_watch(
    source: Arc<dyn PollSource>,
    interval: Duration,
    statuses: StatusSet,
    cancel: CancellationToken,
) -> WorkerHandle<WatchEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        let mut ticker = time::interval_at(Instant::now(), interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tailer = SnapshotTailer::new();
        let mut not_ready = false;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let fetched = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                r = source.fetch() => r,
            };

            let event = match fetched {
                Ok(Fetched::Ready(snap)) => {
                    not_ready = false;
                    if statuses.is_terminal(snap.status.as_deref()) {
                        let _ = tx.send(WatchEvent::Finished(snap));
                        break;
                    }
                    if !tailer.observe(&snap) {
                        continue;
                    }
                    WatchEvent::Changed(snap)
                }
                Ok(Fetched::NotReady) => {
                    if std::mem::replace(&mut not_ready, true) {
                        continue;
                    }
                    WatchEvent::NotReady
                }
                Err(e) if e.is_fatal() => {
                    tracing::warn!(resource = source.name(), error = %e, "watch stopped");
                    let _ = tx.send(WatchEvent::Failed(e));
                    break;
                }
                Err(e) => {
                    tracing::debug!(resource = source.name(), error = %e, "watch fetch failed");
                    continue;
                }
            };
            if tx.send(event).is_err() {
                break;
            }
        }
    });
    WorkerHandle::new(rx, cancel, task)
}
