//! Live updates for CI/CD run status, job queues and build logs.
//!
//! One websocket connection is shared by many typed subscriptions
//! ([`Multiplexer`]) and survives disconnects ([`transport`]). Resources without
//! a push channel are polled with fibonacci backoff ([`PollingWorker`]), and
//! logs are tailed incrementally with a cursor ([`LogTailer`]).

pub mod api;
pub mod backoff;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod logs;
pub mod model;
pub mod multiplexer;
mod orchestrator;
mod output;
pub mod poller;
pub mod transport;
pub mod worker;

#[cfg(test)]
mod testing;

pub use api::{ApiClient, Fetched, ResourceEndpoint};
pub use config::{ClientConfig, Credential};
pub use error::{LiveError, Result};
pub use logs::{LogCursor, LogItemReference, LogLine, LogSource, LogTailer, TailEvent};
pub use model::{Event, Filter, FilterType, ResourceSnapshot, StatusSet};
pub use multiplexer::{Multiplexer, Subscription, SubscriptionId};
pub use poller::{PollEvent, PollSource, PollingWorker};
pub use transport::{ConnectionState, ReconnectingTransport};
pub use worker::WorkerHandle;
