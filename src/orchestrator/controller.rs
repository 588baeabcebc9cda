//! Session lifecycle controller.
//!
//! Owns cancellation of the running session and keeps the user informed while it winds down.

use crate::output::Emitter;
use anyhow::Result;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Commands from the signal listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionCommand {
    Quit,
}

/// A running subcommand: its cancel token and the task driving it.
pub(crate) struct Session {
    pub(crate) cancel: CancellationToken,
    pub(crate) handle: JoinHandle<Result<()>>,
}

impl Session {
    pub(crate) fn new(cancel: CancellationToken, handle: JoinHandle<Result<()>>) -> Self {
        Self { cancel, handle }
    }
}

const STALL_NOTICE: Duration = Duration::from_secs(3);

/// Drive `session` to completion. The first `Quit` cancels it, a second one aborts the task.
pub(crate) async fn run_controller(
    session: Session,
    emitter: &Emitter,
    mut cmd_rx: UnboundedReceiver<SessionCommand>,
) -> Result<()> {
    let Session { cancel, mut handle } = session;
    // Cancel watchdog: if a cancel takes too long, emit a status message.
    let mut cancel_deadline: Option<tokio::time::Instant> = None;
    let mut watchdog = tokio::time::interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            Some(cmd) = cmd_rx.recv() => {
                match cmd {
                    SessionCommand::Quit if !cancel.is_cancelled() => {
                        tracing::debug!("session cancel requested");
                        cancel.cancel();
                        emitter.status("Cancelling…");
                        cancel_deadline = Some(tokio::time::Instant::now() + STALL_NOTICE);
                    }
                    SessionCommand::Quit => {
                        tracing::warn!("second interrupt, aborting session");
                        handle.abort();
                    }
                }
            }
            joined = &mut handle => {
                return match joined {
                    Ok(res) => res,
                    Err(e) if e.is_cancelled() => Ok(()),
                    Err(e) => Err(anyhow::anyhow!("session task failed: {e}")),
                };
            }
            // If cancel stalls (e.g., request in flight), keep the user informed.
            _ = watchdog.tick() => {
                if let Some(deadline) = cancel_deadline {
                    if tokio::time::Instant::now() >= deadline {
                        emitter.status("Still cancelling…");
                        cancel_deadline = None;
                    }
                }
            }
        }
    }
}
