//! One session per subcommand. Each returns immediately with a [`Session`]; the
//! work runs on its own task until it finishes or its token is cancelled.

use super::controller::Session;
use crate::api::{ApiClient, Fetched, ResourceEndpoint};
use crate::config::{ClientConfig, Credential};
use crate::error::LiveError;
use crate::logs::snapshot::{spawn_watch, WatchEvent};
use crate::logs::{
    spawn_tail, LogCursor, LogItemReference, LogTailer, TailEvent, TailOptions, TailStep,
    TailTrigger,
};
use crate::model::{Event, Filter};
use crate::multiplexer::Multiplexer;
use crate::output::Emitter;
use crate::poller::{PollEvent, PollSource, PollingWorker};
use crate::transport::ws::WsConnector;
use anyhow::{Context as _, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Everything a session needs from the command line.
#[derive(Debug, Clone)]
pub(crate) struct SessionContext {
    pub(crate) cfg: ClientConfig,
    pub(crate) credential: Option<Credential>,
    pub(crate) emitter: Emitter,
}

impl SessionContext {
    fn multiplexer(&self) -> Result<Multiplexer> {
        let url = self.cfg.events_url()?;
        let connector = WsConnector::new(url, self.credential.clone(), &self.cfg.user_agent);
        Ok(Multiplexer::new(
            Arc::new(connector),
            self.cfg.transport.clone(),
        ))
    }

    fn client(&self) -> Result<ApiClient> {
        ApiClient::new(&self.cfg, self.credential.clone()).context("cannot build http client")
    }
}

#[derive(Debug, Clone)]
pub(crate) struct LogsRequest {
    pub(crate) item: LogItemReference,
    pub(crate) offset: u64,
    pub(crate) follow: bool,
    pub(crate) interval: Duration,
    pub(crate) status_path: Option<String>,
    /// Refresh on events matching this filter instead of on a timer.
    pub(crate) follow_events: Option<Filter>,
    pub(crate) download: bool,
}

/// Subscribe to every filter and print events until cancelled or the connection fails for good.
pub(crate) fn events(ctx: SessionContext, filters: Vec<Filter>) -> Result<Session> {
    let mux = ctx.multiplexer()?;
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let handle = tokio::spawn(async move {
        let res = relay_events(&mux, filters, &ctx.emitter, token).await;
        mux.close();
        mux.join().await;
        res
    });
    Ok(Session::new(cancel, handle))
}

async fn relay_events(
    mux: &Multiplexer,
    filters: Vec<Filter>,
    emitter: &Emitter,
    cancel: CancellationToken,
) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<(Filter, crate::error::Result<Event>)>();
    for filter in filters {
        let mut sub = mux
            .subscribe(filter.clone())
            .await
            .with_context(|| format!("cannot subscribe to {filter}"))?;
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(item) = sub.recv().await {
                if tx.send((sub.filter().clone(), item)).is_err() {
                    break;
                }
            }
        });
    }
    drop(tx);

    let mut state = mux.watch_state();
    let mut state_open = true;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            changed = state.changed(), if state_open => match changed {
                Ok(()) => {
                    let s = *state.borrow_and_update();
                    tracing::debug!(state = ?s, "connection state changed");
                    emitter.status(format!("connection {}", s.as_str()));
                }
                Err(_) => state_open = false,
            },
            item = rx.recv() => match item {
                Some((filter, Ok(event))) => emitter.event(&filter, &event),
                Some((_, Err(e))) => return Err(e).context("live updates stopped"),
                None => return Ok(()),
            },
        }
    }
}

/// Fibonacci-backoff polling of one resource until it reaches a terminal status.
pub(crate) fn poll(ctx: SessionContext, path: String) -> Result<Session> {
    let source: Arc<dyn PollSource> = Arc::new(ResourceEndpoint::new(ctx.client()?, path));
    let cancel = CancellationToken::new();
    let mut worker = PollingWorker::new(source, &ctx.cfg.poller, ctx.cfg.active_statuses.clone())
        .spawn(cancel.clone());
    let handle = tokio::spawn(async move {
        while let Some(ev) = worker.recv().await {
            match ev {
                PollEvent::Update(snap) => ctx.emitter.snapshot(&snap, false),
                PollEvent::Terminal(snap) => ctx.emitter.snapshot(&snap, true),
                PollEvent::Failed(e) => return Err(e).context("polling stopped"),
            }
        }
        Ok(())
    });
    Ok(Session::new(cancel, handle))
}

/// Fixed-interval snapshot tailing, printing only when the resource changed.
pub(crate) fn watch(ctx: SessionContext, path: String, interval: Duration) -> Result<Session> {
    let source: Arc<dyn PollSource> = Arc::new(ResourceEndpoint::new(ctx.client()?, path));
    let cancel = CancellationToken::new();
    let mut worker = spawn_watch(
        source,
        interval,
        ctx.cfg.active_statuses.clone(),
        cancel.clone(),
    );
    let handle = tokio::spawn(async move {
        while let Some(ev) = worker.recv().await {
            match ev {
                WatchEvent::Changed(snap) => ctx.emitter.snapshot(&snap, false),
                WatchEvent::NotReady => ctx.emitter.status("resource not available yet"),
                WatchEvent::Finished(snap) => ctx.emitter.snapshot(&snap, true),
                WatchEvent::Failed(e) => return Err(e).context("watch stopped"),
            }
        }
        Ok(())
    });
    Ok(Session::new(cancel, handle))
}

pub(crate) fn logs(ctx: SessionContext, req: LogsRequest) -> Result<Session> {
    let client = ctx.client()?;
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let handle = if req.download {
        tokio::spawn(async move {
            let fetched = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                r = client.download(&req.item) => r.context("log download failed")?,
            };
            match fetched {
                Fetched::Ready(text) => ctx.emitter.raw(&text),
                Fetched::NotReady => ctx.emitter.status("log not available yet"),
            }
            Ok(())
        })
    } else if req.follow || req.follow_events.is_some() {
        tokio::spawn(follow_log(ctx, client, req, token))
    } else {
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => Ok(()),
                r = read_log_once(&ctx, &client, req) => r,
            }
        })
    };
    Ok(Session::new(cancel, handle))
}

/// Read everything currently available and stop.
async fn read_log_once(ctx: &SessionContext, client: &ApiClient, req: LogsRequest) -> Result<()> {
    let cursor = LogCursor {
        offset: req.offset,
        count: ctx.cfg.tail.page_size,
    };
    let mut tailer = LogTailer::new(req.item, cursor);
    loop {
        match tailer.poll(client).await.context("cannot read log")? {
            TailStep::NotReady | TailStep::Pending => {
                ctx.emitter.status("log not available yet");
                return Ok(());
            }
            TailStep::Lines { lines, .. } => {
                ctx.emitter.log_lines(&lines);
                if !tailer.page_was_full() {
                    return Ok(());
                }
            }
        }
    }
}

async fn follow_log(
    ctx: SessionContext,
    client: ApiClient,
    req: LogsRequest,
    cancel: CancellationToken,
) -> Result<()> {
    // kept alive for as long as the subscription feeds the tailer
    let mut mux = None;
    let trigger = match &req.follow_events {
        Some(filter) => {
            let m = ctx.multiplexer()?;
            let sub = m
                .subscribe(filter.clone())
                .await
                .with_context(|| format!("cannot subscribe to {filter}"))?;
            mux = Some(m);
            TailTrigger::Events(sub)
        }
        None => TailTrigger::Interval(req.interval),
    };
    let status_probe = req.status_path.as_ref().map(|path| {
        Arc::new(ResourceEndpoint::new(client.clone(), path.clone())) as Arc<dyn PollSource>
    });
    let opts = TailOptions {
        start: LogCursor {
            offset: req.offset,
            count: ctx.cfg.tail.page_size,
        },
        statuses: ctx.cfg.active_statuses.clone(),
        status_probe,
    };

    let mut worker = spawn_tail(Arc::new(client), req.item, trigger, opts, cancel);
    let mut result: std::result::Result<(), LiveError> = Ok(());
    while let Some(ev) = worker.recv().await {
        match ev {
            TailEvent::NotReady => ctx.emitter.status("log not available yet"),
            TailEvent::Lines(lines) => ctx.emitter.log_lines(&lines),
            TailEvent::Finished { total_count } => {
                ctx.emitter
                    .status(format!("log complete: {total_count} lines"));
            }
            TailEvent::Failed(e) => {
                result = Err(e);
                break;
            }
        }
    }
    worker.join().await;
    if let Some(m) = mux {
        m.close();
        m.join().await;
    }
    result.context("log tail stopped")
}
