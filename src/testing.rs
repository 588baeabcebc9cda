//! In-memory sources for worker tests.

use crate::api::Fetched;
use crate::error::{LiveError, Result};
use crate::logs::{LogCursor, LogItemReference, LogLine, LogPage, LogSource};
use crate::model::ResourceSnapshot;
use crate::poller::PollSource;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::time::Instant;

/// Answers fetches from a queue; `NotReady` once the queue is empty.
pub struct ScriptedPollSource {
    name: String,
    script: Mutex<VecDeque<Result<Fetched<ResourceSnapshot>>>>,
    fetched_at: Mutex<Vec<Instant>>,
}

impl ScriptedPollSource {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            fetched_at: Mutex::new(Vec::new()),
        }
    }

    pub fn push_ready(&self, body: Value) {
        let snap = ResourceSnapshot::from_value(body).unwrap();
        self.script.lock().unwrap().push_back(Ok(Fetched::Ready(snap)));
    }

    pub fn push_not_ready(&self) {
        self.script.lock().unwrap().push_back(Ok(Fetched::NotReady));
    }

    pub fn push_err(&self, err: LiveError) {
        self.script.lock().unwrap().push_back(Err(err));
    }

    pub fn fetch_times(&self) -> Vec<Instant> {
        self.fetched_at.lock().unwrap().clone()
    }
}

impl PollSource for ScriptedPollSource {
    fn fetch(&self) -> BoxFuture<'_, Result<Fetched<ResourceSnapshot>>> {
        self.fetched_at.lock().unwrap().push(Instant::now());
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(Fetched::NotReady));
        Box::pin(async move { next })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Default)]
struct LogState {
    ready: bool,
    lines: Vec<LogLine>,
    rewind: u64,
    fail: Option<LiveError>,
    offsets: Vec<u64>,
}

/// Growing log served page by page, `NotReady` until marked ready.
pub struct FakeLog {
    state: Mutex<LogState>,
}

impl FakeLog {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LogState::default()),
        }
    }

    pub fn with_lines(n: u64) -> Self {
        let log = Self::new();
        log.append(n);
        log.set_ready();
        log
    }

    pub fn set_ready(&self) {
        self.state.lock().unwrap().ready = true;
    }

    pub fn append(&self, n: u64) {
        let mut s = self.state.lock().unwrap();
        let start = s.lines.len() as u64;
        for number in start..start + n {
            s.lines.push(LogLine {
                number,
                value: format!("line {number}\n"),
                api_ref_hash: "abc".into(),
                since_ms: number * 10,
            });
        }
    }

    /// Serve the next page starting `n` lines before the requested offset.
    pub fn rewind_next_page(&self, n: u64) {
        self.state.lock().unwrap().rewind = n;
    }

    pub fn fail_with(&self, err: LiveError) {
        self.state.lock().unwrap().fail = Some(err);
    }

    pub fn requested_offsets(&self) -> Vec<u64> {
        self.state.lock().unwrap().offsets.clone()
    }
}

impl LogSource for FakeLog {
    fn fetch_lines<'a>(
        &'a self,
        _item: &'a LogItemReference,
        cursor: LogCursor,
    ) -> BoxFuture<'a, Result<Fetched<LogPage>>> {
        let mut s = self.state.lock().unwrap();
        s.offsets.push(cursor.offset);
        let out = if let Some(err) = s.fail.take() {
            Err(err)
        } else if !s.ready {
            Ok(Fetched::NotReady)
        } else {
            let total = s.lines.len() as u64;
            let start = cursor.offset.saturating_sub(std::mem::take(&mut s.rewind)).min(total);
            let end = if cursor.count == 0 {
                total
            } else {
                (start + cursor.count).min(total)
            };
            Ok(Fetched::Ready(LogPage {
                lines: s.lines[start as usize..end as usize].to_vec(),
                total_count: total,
            }))
        };
        Box::pin(async move { out })
    }
}
