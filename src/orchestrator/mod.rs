//! Application-level orchestration.
//!
//! Builds one session per subcommand and drives it under the lifecycle controller,
//! so the CLI layer only parses flags and wires output.

mod controller;
mod sessions;

pub(crate) use controller::{run_controller, Session, SessionCommand};
pub(crate) use sessions::{events, logs, poll, watch, LogsRequest, SessionContext};
