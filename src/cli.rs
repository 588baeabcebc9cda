use crate::config::{ClientConfig, Credential};
use crate::logging::{self, LogFormat, LogLevel};
use crate::logs::{ItemType, LogItemReference};
use crate::model::Filter;
use crate::orchestrator::{self, LogsRequest, Session, SessionCommand, SessionContext};
use crate::output::{spawn_output_writer, Emitter, OutputFormat};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "runwatch",
    version,
    about = "Follow CI/CD runs, job queues and build logs as they change"
)]
pub struct Cli {
    /// API base URL (also the websocket host)
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    /// Log-lines service URL; defaults to the API base URL
    #[arg(long, global = true)]
    pub cdn_url: Option<String>,

    /// Bearer token sent with every request and connection attempt
    #[arg(long, env = "RUNWATCH_TOKEN", hide_env_values = true, global = true)]
    pub token: Option<String>,

    /// Path to a JSON config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print one JSON object per line
    #[arg(long, global = true, conflicts_with = "text")]
    pub json: bool,

    /// Print human-readable lines (default)
    #[arg(long, global = true)]
    pub text: bool,

    /// Diagnostic log level (RUST_LOG takes precedence)
    #[arg(long, value_enum, global = true)]
    pub log_level: Option<LogLevel>,

    /// Diagnostic log format
    #[arg(long, value_enum, global = true)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Subscribe to live events, e.g. `--filter queue` or `--filter workflow:project=PRJ,workflow=build`
    Events {
        #[arg(long = "filter", short = 'f', required = true)]
        filters: Vec<Filter>,

        /// Give up after this many consecutive reconnects
        #[arg(long)]
        max_reconnect_attempts: Option<u32>,
    },

    /// Poll a resource with fibonacci backoff until it reaches a terminal status
    Poll {
        /// Resource path relative to the API base URL
        path: String,

        /// Ticks between fetches while the resource answers
        #[arg(long)]
        base_interval: Option<u64>,

        /// Length of one backoff tick
        #[arg(long)]
        tick: Option<humantime::Duration>,

        /// Give up after this many consecutive not-ready or failed fetches
        #[arg(long)]
        max_retries: Option<u32>,
    },

    /// Re-fetch a resource on a fixed interval and print it whenever it changes
    Watch {
        path: String,

        #[arg(long)]
        interval: Option<humantime::Duration>,
    },

    /// Read or tail a step or service log
    Logs {
        #[arg(long, value_enum, default_value = "step-log")]
        item_type: ItemType,

        /// Opaque reference of the log item
        #[arg(long)]
        api_ref: String,

        /// Keep tailing instead of stopping at the current end
        #[arg(long)]
        follow: bool,

        /// Resource whose terminal status ends the tail
        #[arg(long, requires = "follow")]
        status_path: Option<String>,

        /// Refresh on events matching this filter instead of on a timer. A
        /// workflow-run, node-run or operation filter also ends the tail once
        /// that entity reports a terminal status
        #[arg(long, conflicts_with = "status_path")]
        follow_events: Option<Filter>,

        /// First line offset to read
        #[arg(long, default_value_t = 0)]
        offset: u64,

        /// Refresh interval while following
        #[arg(long)]
        interval: Option<humantime::Duration>,

        /// Lines requested per page (0 lets the server decide)
        #[arg(long)]
        page_size: Option<u64>,

        /// Print the whole raw log once and exit
        #[arg(long, conflicts_with_all = ["follow", "follow_events"])]
        download: bool,
    },
}

/// Build the effective config: file (or defaults), then CLI overrides.
pub fn build_config(args: &Cli) -> Result<(ClientConfig, Option<Credential>)> {
    let mut cfg = ClientConfig::load(args.config.as_deref()).context("cannot load config")?;
    if let Some(url) = &args.base_url {
        cfg.base_url = url.clone();
    }
    if let Some(url) = &args.cdn_url {
        cfg.cdn_url = Some(url.clone());
    }
    if let Some(level) = args.log_level {
        cfg.log.level = level;
    }
    if let Some(format) = args.log_format {
        cfg.log.format = format;
    }

    match &args.command {
        Command::Events {
            max_reconnect_attempts,
            ..
        } => {
            if max_reconnect_attempts.is_some() {
                cfg.transport.max_reconnect_attempts = *max_reconnect_attempts;
            }
        }
        Command::Poll {
            base_interval,
            tick,
            max_retries,
            ..
        } => {
            if let Some(n) = base_interval {
                cfg.poller.base_interval = (*n).max(1);
            }
            if let Some(t) = tick {
                cfg.poller.tick = Duration::from(*t);
            }
            if max_retries.is_some() {
                cfg.poller.max_retries = *max_retries;
            }
        }
        Command::Watch { .. } => {}
        Command::Logs {
            interval,
            page_size,
            ..
        } => {
            if let Some(i) = interval {
                cfg.tail.interval = Duration::from(*i);
            }
            if let Some(n) = page_size {
                cfg.tail.page_size = *n;
            }
        }
    }

    cfg.validate().context("invalid configuration")?;
    let credential = args
        .token
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .map(Credential::new);
    Ok((cfg, credential))
}

fn start_session(args: Cli, ctx: SessionContext) -> Result<Session> {
    match args.command {
        Command::Events { filters, .. } => orchestrator::events(ctx, filters),
        Command::Poll { path, .. } => orchestrator::poll(ctx, path),
        Command::Watch { path, interval } => {
            let interval = interval.map(Duration::from).unwrap_or(ctx.cfg.tail.interval);
            orchestrator::watch(ctx, path, interval)
        }
        Command::Logs {
            item_type,
            api_ref,
            follow,
            status_path,
            follow_events,
            offset,
            download,
            ..
        } => {
            let req = LogsRequest {
                item: LogItemReference::new(item_type, api_ref),
                offset,
                follow,
                interval: ctx.cfg.tail.interval,
                status_path,
                follow_events,
                download,
            };
            orchestrator::logs(ctx, req)
        }
    }
}

pub async fn run(args: Cli) -> Result<()> {
    let (cfg, credential) = build_config(&args)?;
    logging::init(&cfg.log);
    tracing::debug!(base_url = %cfg.base_url, authenticated = credential.is_some(), "starting");

    let format = if args.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };
    let (out_tx, out_handle) = spawn_output_writer();
    let emitter = Emitter::new(out_tx, format);
    let ctx = SessionContext {
        cfg,
        credential,
        emitter: emitter.clone(),
    };
    let session = start_session(args, ctx)?;

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<SessionCommand>();
    let signals = tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if cmd_tx.send(SessionCommand::Quit).is_err() {
                break;
            }
        }
    });

    let res = orchestrator::run_controller(session, &emitter, cmd_rx).await;
    signals.abort();
    drop(emitter);
    let _ = out_handle.await;
    res
}
