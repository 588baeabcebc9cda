//! Background polling of a resource endpoint with fibonacci backoff.
//!
//! Each [`PollingWorker`] owns its own [`FibonacciBackoff`]; workers never
//! share retry state. The worker wakes once per tick and fetches only when the
//! backoff says a fetch is due, so consecutive not-ready answers spread the
//! requests out along `1, 1, 2, 3, 5, ...` ticks.

use crate::api::Fetched;
use crate::backoff::FibonacciBackoff;
use crate::config::PollerConfig;
use crate::error::{LiveError, Result};
use crate::model::{ResourceSnapshot, StatusSet};
use crate::worker::WorkerHandle;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// A resource that can be fetched repeatedly.
pub trait PollSource: Send + Sync {
    fn fetch(&self) -> BoxFuture<'_, Result<Fetched<ResourceSnapshot>>>;

    /// Short label for diagnostics.
    fn name(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    Update(ResourceSnapshot),
    /// Final snapshot; the worker has stopped.
    Terminal(ResourceSnapshot),
    Failed(LiveError),
}

enum Step {
    Continue,
    Emit(PollEvent),
    Stop(PollEvent),
}

pub struct PollingWorker {
    source: Arc<dyn PollSource>,
    backoff: FibonacciBackoff,
    statuses: StatusSet,
    tick: Duration,
    max_retries: Option<u32>,
    consecutive_retries: u32,
}

impl PollingWorker {
    pub fn new(source: Arc<dyn PollSource>, cfg: &PollerConfig, statuses: StatusSet) -> Self {
        Self {
            source,
            backoff: FibonacciBackoff::new(cfg.base_interval),
            statuses,
            tick: cfg.tick,
            max_retries: cfg.max_retries,
            consecutive_retries: 0,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> WorkerHandle<PollEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = cancel.clone();
        let task = tokio::spawn(self.run(tx, token));
        WorkerHandle::new(rx, cancel, task)
    }

    async fn run(mut self, tx: mpsc::UnboundedSender<PollEvent>, cancel: CancellationToken) {
        let mut ticker = time::interval_at(Instant::now() + self.tick, self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(resource = self.source.name(), "poller started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !self.backoff.tick() {
                continue;
            }

            let source = self.source.clone();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                r = source.fetch() => r,
            };
            match self.handle(outcome) {
                Step::Continue => {}
                Step::Emit(ev) => {
                    if tx.send(ev).is_err() {
                        break;
                    }
                }
                Step::Stop(ev) => {
                    let _ = tx.send(ev);
                    break;
                }
            }
        }
        tracing::debug!(resource = self.source.name(), "poller stopped");
    }

    fn handle(&mut self, outcome: Result<Fetched<ResourceSnapshot>>) -> Step {
        match outcome {
            Ok(Fetched::Ready(snap)) => {
                self.backoff.on_success();
                self.consecutive_retries = 0;
                if self.statuses.is_terminal(snap.status.as_deref()) {
                    tracing::info!(
                        resource = self.source.name(),
                        status = ?snap.status,
                        "resource reached terminal status"
                    );
                    Step::Stop(PollEvent::Terminal(snap))
                } else {
                    Step::Emit(PollEvent::Update(snap))
                }
            }
            Ok(Fetched::NotReady) => self.retry(None),
            Err(e) if e.is_transient() => self.retry(Some(e)),
            Err(LiveError::Malformed(msg)) => {
                tracing::warn!(resource = self.source.name(), error = %msg, "dropping undecodable body");
                Step::Continue
            }
            Err(e) => {
                tracing::warn!(resource = self.source.name(), error = %e, "poller stopped on fatal error");
                Step::Stop(PollEvent::Failed(e))
            }
        }
    }

    fn retry(&mut self, cause: Option<LiveError>) -> Step {
        self.consecutive_retries = self.consecutive_retries.saturating_add(1);
        if let Some(max) = self.max_retries {
            if self.consecutive_retries > max {
                return Step::Stop(PollEvent::Failed(LiveError::RetryBudgetExhausted(
                    self.consecutive_retries,
                )));
            }
        }
        self.backoff.on_retryable();
        tracing::debug!(
            resource = self.source.name(),
            error = cause.as_ref().map(tracing::field::display),
            wait = self.backoff.wait_interval(),
            "not ready; backing off"
        );
        Step::Continue
    }
}
