//! Incremental retrieval of append-only build logs.
//!
//! A [`LogTailer`] owns one stream's cursor and turns pages fetched from a
//! [`LogSource`] into newly delivered lines, never handing out a line twice.
//! [`spawn_tail`] drives a tailer from a timer or from a live event
//! subscription until the underlying step reaches a terminal status.

pub mod snapshot;

use crate::api::Fetched;
use crate::error::{LiveError, Result};
use crate::model::StatusSet;
use crate::multiplexer::Subscription;
use crate::poller::PollSource;
use crate::worker::WorkerHandle;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ItemType {
    StepLog,
    ServiceLog,
}

impl ItemType {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemType::StepLog => "step-log",
            ItemType::ServiceLog => "service-log",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogItemReference {
    pub item_type: ItemType,
    pub api_ref_hash: String,
}

impl LogItemReference {
    pub fn new(item_type: ItemType, api_ref_hash: impl Into<String>) -> Self {
        Self {
            item_type,
            api_ref_hash: api_ref_hash.into(),
        }
    }
}

/// Next unread range: `offset` is a line number, `count` the page size (0 = server default).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogCursor {
    pub offset: u64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub number: u64,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub api_ref_hash: String,
    #[serde(rename = "since", alias = "since_ms", default)]
    pub since_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogPage {
    pub lines: Vec<LogLine>,
    pub total_count: u64,
}

pub trait LogSource: Send + Sync {
    fn fetch_lines<'a>(
        &'a self,
        item: &'a LogItemReference,
        cursor: LogCursor,
    ) -> BoxFuture<'a, Result<Fetched<LogPage>>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum TailStep {
    /// The log just became unavailable (or has never been available).
    NotReady,
    /// Still unavailable; already reported.
    Pending,
    /// Lines not delivered before, possibly none.
    Lines { lines: Vec<LogLine>, total_count: u64 },
}

#[derive(Debug)]
pub struct LogTailer {
    item: LogItemReference,
    cursor: LogCursor,
    last_number: Option<u64>,
    total_count: u64,
    last_fetched: u64,
    not_ready: bool,
}

impl LogTailer {
    pub fn new(item: LogItemReference, cursor: LogCursor) -> Self {
        Self {
            item,
            cursor,
            last_number: None,
            total_count: 0,
            last_fetched: 0,
            not_ready: false,
        }
    }

    pub fn item(&self) -> &LogItemReference {
        &self.item
    }

    pub fn cursor(&self) -> LogCursor {
        self.cursor
    }

    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    pub fn last_number(&self) -> Option<u64> {
        self.last_number
    }

    /// Whether the last page filled the requested count, i.e. more may be waiting.
    pub fn page_was_full(&self) -> bool {
        self.cursor.count > 0 && self.last_fetched >= self.cursor.count
    }

    /// Fetch the next page and advance the cursor past the lines it delivered.
    ///
    /// Lines the server replays from an earlier page are dropped and do not
    /// move the cursor, so the next request starts right after the last
    /// delivered line.
    pub async fn poll(&mut self, source: &dyn LogSource) -> Result<TailStep> {
        let page = match source.fetch_lines(&self.item, self.cursor).await? {
            Fetched::NotReady => {
                self.last_fetched = 0;
                let first = !self.not_ready;
                self.not_ready = true;
                return Ok(if first {
                    TailStep::NotReady
                } else {
                    TailStep::Pending
                });
            }
            Fetched::Ready(page) => page,
        };
        self.not_ready = false;
        self.total_count = page.total_count;
        self.last_fetched = page.lines.len() as u64;

        let floor = self.last_number.map(|n| n + 1);
        let lines: Vec<LogLine> = page
            .lines
            .into_iter()
            .filter(|l| floor.map_or(true, |min| l.number >= min))
            .collect();
        self.cursor.offset += lines.len() as u64;
        if let Some(max) = lines.iter().map(|l| l.number).max() {
            self.last_number = Some(max);
        }
        Ok(TailStep::Lines {
            lines,
            total_count: self.total_count,
        })
    }
}

/// What wakes a spawned tailer up.
pub enum TailTrigger {
    /// Fixed refresh period.
    Interval(Duration),
    /// Every event on the subscription is a refresh. Tailing ends when an event
    /// reports a terminal status for the run, node run or operation the
    /// subscription's filter names.
    Events(Subscription),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TailEvent {
    NotReady,
    Lines(Vec<LogLine>),
    /// Step reached a terminal status and everything available was drained.
    Finished { total_count: u64 },
    Failed(LiveError),
}

pub struct TailOptions {
    pub start: LogCursor,
    pub statuses: StatusSet,
    /// Resource polled on each interval tick to detect the end of the step.
    pub status_probe: Option<Arc<dyn PollSource>>,
}

enum Wake {
    Refresh,
    Finish,
    Fail(LiveError),
}

enum Wakeup {
    Interval(Interval),
    Events(Subscription),
}

impl Wakeup {
    async fn wait(&mut self, probe: Option<&dyn PollSource>, statuses: &StatusSet) -> Wake {
        match self {
            Wakeup::Interval(ticker) => {
                ticker.tick().await;
                let Some(probe) = probe else {
                    return Wake::Refresh;
                };
                match probe.fetch().await {
                    Ok(Fetched::Ready(snap)) if statuses.is_terminal(snap.status.as_deref()) => {
                        tracing::debug!(status = ?snap.status, "status probe reports terminal");
                        Wake::Finish
                    }
                    Ok(_) => Wake::Refresh,
                    Err(e) if e.is_fatal() => Wake::Fail(e),
                    Err(e) => {
                        tracing::debug!(error = %e, "status probe failed; tailing continues");
                        Wake::Refresh
                    }
                }
            }
            Wakeup::Events(sub) => match sub.recv().await {
                Some(Ok(event))
                    if sub.filter().is_status_of(&event)
                        && statuses.is_terminal(event.status().as_deref()) =>
                {
                    Wake::Finish
                }
                Some(Ok(event)) => {
                    tracing::trace!(type_event = %event.type_event, "event refresh");
                    Wake::Refresh
                }
                Some(Err(e)) => Wake::Fail(e),
                None => Wake::Finish,
            },
        }
    }
}

/// Tail one log stream in the background until its step ends or the token is cancelled.
pub fn spawn_tail(
    source: Arc<dyn LogSource>,
    item: LogItemReference,
    trigger: TailTrigger,
    opts: TailOptions,
    cancel: CancellationToken,
) -> WorkerHandle<TailEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        let waker = match trigger {
            TailTrigger::Interval(period) => {
                // first fetch is immediate
                let mut ticker = time::interval_at(Instant::now(), period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                Wakeup::Interval(ticker)
            }
            TailTrigger::Events(sub) => Wakeup::Events(sub),
        };
        let tailer = LogTailer::new(item, opts.start);
        run_tail(tailer, source, waker, opts, tx, token).await;
    });
    WorkerHandle::new(rx, cancel, task)
}

async fn run_tail(
    mut tailer: LogTailer,
    source: Arc<dyn LogSource>,
    mut waker: Wakeup,
    opts: TailOptions,
    tx: mpsc::UnboundedSender<TailEvent>,
    cancel: CancellationToken,
) {
    let TailOptions {
        statuses,
        status_probe,
        ..
    } = opts;
    tracing::debug!(
        item_type = tailer.item().item_type.as_str(),
        api_ref = %tailer.item().api_ref_hash,
        offset = tailer.cursor().offset,
        "log tail started"
    );

    // event-driven tailers still need the lines already written
    let mut wake = if matches!(waker, Wakeup::Events(_)) {
        Wake::Refresh
    } else {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            w = waker.wait(status_probe.as_deref(), &statuses) => w,
        }
    };

    loop {
        let finishing = match wake {
            Wake::Refresh => false,
            Wake::Finish => true,
            Wake::Fail(e) => {
                let _ = tx.send(TailEvent::Failed(e));
                return;
            }
        };

        // drain while pages come back full
        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                r = tailer.poll(source.as_ref()) => r,
            };
            let sent = match step {
                Ok(TailStep::NotReady) => tx.send(TailEvent::NotReady).is_ok(),
                Ok(TailStep::Pending) => true,
                Ok(TailStep::Lines { lines, .. }) => {
                    let ok = lines.is_empty() || tx.send(TailEvent::Lines(lines)).is_ok();
                    if ok && tailer.page_was_full() {
                        continue;
                    }
                    ok
                }
                Err(e) if e.is_fatal() => {
                    tracing::warn!(error = %e, "log tail stopped");
                    let _ = tx.send(TailEvent::Failed(e));
                    return;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "log fetch failed; retrying on next trigger");
                    true
                }
            };
            if !sent {
                return;
            }
            break;
        }

        if finishing {
            tracing::debug!(
                total_count = tailer.total_count(),
                "log tail finished"
            );
            let _ = tx.send(TailEvent::Finished {
                total_count: tailer.total_count(),
            });
            return;
        }

        wake = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            w = waker.wait(status_probe.as_deref(), &statuses) => w,
        };
    }
}
