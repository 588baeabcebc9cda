//! Line-oriented output for the CLI.
//!
//! Payloads go to stdout, status messages to stderr. Both are written by a
//! dedicated blocking task so async workers never block on the terminal.

use crate::logs::LogLine;
use crate::model::{Event, Filter, ResourceSnapshot};
use serde::Serialize;
use serde_json::Value;
use std::io::Write;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
pub(crate) fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// One JSON line in `--json` mode.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Record<'a> {
    Event {
        ts: String,
        filter: &'a Filter,
        payload: &'a Value,
    },
    Snapshot {
        ts: String,
        terminal: bool,
        status: Option<&'a str>,
        body: &'a Value,
    },
    Line {
        number: u64,
        since: u64,
        value: &'a str,
    },
}

fn timestamp() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

fn event_scope(ev: &Event) -> String {
    let mut scope = String::new();
    if let Some(pk) = &ev.project_key {
        scope.push_str(pk);
    }
    for part in [
        ev.workflow_name.as_deref(),
        ev.pipeline_name.as_deref(),
        ev.application_name.as_deref(),
        ev.environment_name.as_deref(),
    ]
    .into_iter()
    .flatten()
    {
        scope.push('/');
        scope.push_str(part);
    }
    if let Some(num) = ev.workflow_run_num {
        scope.push_str(&format!(" #{num}"));
    }
    if scope.is_empty() {
        scope.push('-');
    }
    scope
}

pub(crate) fn event_text(ev: &Event) -> String {
    let kind = ev
        .type_event
        .strip_prefix("sdk.")
        .unwrap_or(&ev.type_event);
    match ev.status() {
        Some(status) => format!("{kind} {} {status}", event_scope(ev)),
        None => format!("{kind} {}", event_scope(ev)),
    }
}

pub(crate) fn snapshot_text(snap: &ResourceSnapshot, terminal: bool) -> String {
    let status = snap.status.as_deref().unwrap_or("-");
    let mut line = if terminal {
        format!("final status: {status}")
    } else {
        format!("status: {status}")
    };
    if let Some(id) = &snap.id {
        line.push_str(&format!(" (id {id})"));
    }
    if let Some(modified) = &snap.last_modified {
        line.push_str(&format!(" modified {modified}"));
    }
    line
}

/// Formats payloads for the selected output mode and hands them to the writer.
#[derive(Debug, Clone)]
pub(crate) struct Emitter {
    tx: mpsc::UnboundedSender<OutputLine>,
    format: OutputFormat,
}

impl Emitter {
    pub(crate) fn new(tx: mpsc::UnboundedSender<OutputLine>, format: OutputFormat) -> Self {
        Self { tx, format }
    }

    fn stdout(&self, line: String) {
        let _ = self.tx.send(OutputLine::Stdout(line));
    }

    fn json(&self, rec: &Record<'_>) {
        match serde_json::to_string(rec) {
            Ok(s) => self.stdout(s),
            Err(e) => tracing::error!(error = %e, "cannot encode output record"),
        }
    }

    pub(crate) fn status(&self, msg: impl Into<String>) {
        let _ = self.tx.send(OutputLine::Stderr(msg.into()));
    }

    pub(crate) fn event(&self, filter: &Filter, ev: &Event) {
        match self.format {
            OutputFormat::Json => self.json(&Record::Event {
                ts: timestamp(),
                filter,
                payload: &ev.payload,
            }),
            OutputFormat::Text => self.stdout(format!("{} {}", timestamp(), event_text(ev))),
        }
    }

    pub(crate) fn snapshot(&self, snap: &ResourceSnapshot, terminal: bool) {
        match self.format {
            OutputFormat::Json => self.json(&Record::Snapshot {
                ts: timestamp(),
                terminal,
                status: snap.status.as_deref(),
                body: &snap.body,
            }),
            OutputFormat::Text => {
                self.stdout(format!("{} {}", timestamp(), snapshot_text(snap, terminal)))
            }
        }
    }

    pub(crate) fn log_lines(&self, lines: &[LogLine]) {
        for l in lines {
            match self.format {
                OutputFormat::Json => self.json(&Record::Line {
                    number: l.number,
                    since: l.since_ms,
                    value: &l.value,
                }),
                OutputFormat::Text => {
                    self.stdout(l.value.trim_end_matches(['\r', '\n']).to_string())
                }
            }
        }
    }

    /// Unformatted text, e.g. a downloaded log.
    pub(crate) fn raw(&self, text: &str) {
        self.stdout(text.trim_end_matches('\n').to_string());
    }
}
