//! Reconnecting push-stream transport.
//!
//! A single background task owns the physical connection and walks the
//! lifecycle `Disconnected -> Connecting -> Connected -> Error -> (backoff) ->
//! Connecting`. Only one connection attempt is ever in flight.
//!
//! Every physical connection gets a new epoch number. Inbound frames are
//! tagged with the epoch they arrived on and outbound messages carry the epoch
//! they were written for; a message addressed to an older epoch is dropped, so
//! nothing crosses a reconnect boundary.

#[cfg(test)]
pub mod mock;
pub mod ws;

use crate::backoff::ReconnectBackoff;
use crate::config::TransportConfig;
use crate::error::{LiveError, Result};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

/// What a live connection yielded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    /// Control traffic (ping, pong). Counts as liveness, carries nothing to deliver.
    Activity,
    /// Peer closed the stream.
    Closed(Option<String>),
}

pub trait Connection: Send {
    fn send_text(&mut self, text: String) -> BoxFuture<'_, Result<()>>;
    fn next_frame(&mut self) -> BoxFuture<'_, Result<Inbound>>;
    fn ping(&mut self) -> BoxFuture<'_, Result<()>>;
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// Opens physical connections. A fatal error (401/403) stops the transport.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn Connection>>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected { epoch: u64 },
    Frame { epoch: u64, text: String },
    Disconnected { epoch: u64, reason: String },
    /// The transport has given up; no further events follow.
    Fatal(LiveError),
}

/// Publishes state changes, refusing to leave `Closed`.
fn set_state(state: &watch::Sender<ConnectionState>, next: ConnectionState) {
    state.send_if_modified(|cur| {
        if *cur == ConnectionState::Closed || *cur == next {
            return false;
        }
        *cur = next;
        true
    });
}

pub struct TransportHandle {
    outbound: mpsc::UnboundedSender<(u64, String)>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<ConnectionState>>,
    task: Option<JoinHandle<()>>,
}

impl TransportHandle {
    /// Queue a message for the connection identified by `epoch`.
    pub fn send(&self, epoch: u64, text: String) {
        let _ = self.outbound.send((epoch, text));
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Idempotent. Cancels any pending reconnect timer and moves to `Closed`.
    pub fn close(&self) {
        self.cancel.cancel();
        self.state.send_replace(ConnectionState::Closed);
    }

    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct ReconnectingTransport {
    connector: Arc<dyn Connector>,
    cfg: TransportConfig,
    events: mpsc::Sender<TransportEvent>,
    outbound: mpsc::UnboundedReceiver<(u64, String)>,
    state: Arc<watch::Sender<ConnectionState>>,
    cancel: CancellationToken,
    backoff: ReconnectBackoff,
}

enum SessionEnd {
    Cancelled,
    ReceiverGone,
    Lost(String),
}

impl ReconnectingTransport {
    pub fn spawn(
        connector: Arc<dyn Connector>,
        cfg: TransportConfig,
        events: mpsc::Sender<TransportEvent>,
        state: Arc<watch::Sender<ConnectionState>>,
    ) -> TransportHandle {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let backoff = ReconnectBackoff::new(
            cfg.reconnect_initial,
            cfg.reconnect_max,
            cfg.reconnect_jitter,
        );
        let transport = ReconnectingTransport {
            connector,
            cfg,
            events,
            outbound: out_rx,
            state: state.clone(),
            cancel: cancel.clone(),
            backoff,
        };
        let task = tokio::spawn(transport.run());
        TransportHandle {
            outbound: out_tx,
            cancel,
            state,
            task: Some(task),
        }
    }

    async fn emit(&self, ev: TransportEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            r = self.events.send(ev) => r.is_ok(),
        }
    }

    async fn run(mut self) {
        let mut epoch = 0u64;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            set_state(&self.state, ConnectionState::Connecting);
            epoch += 1;
            tracing::debug!(epoch, attempt = self.backoff.attempts(), "connecting");

            let connector = self.connector.clone();
            let attempt = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                r = time::timeout(self.cfg.connect_timeout, connector.connect()) => r,
            };

            let reason = match attempt {
                Ok(Ok(conn)) => {
                    self.backoff.reset();
                    set_state(&self.state, ConnectionState::Connected);
                    tracing::info!(epoch, "connected");
                    if !self.emit(TransportEvent::Connected { epoch }).await {
                        break;
                    }
                    match self.session(conn, epoch).await {
                        SessionEnd::Cancelled | SessionEnd::ReceiverGone => break,
                        SessionEnd::Lost(reason) => reason,
                    }
                }
                Ok(Err(e)) if e.is_fatal() => {
                    tracing::error!(epoch, error = %e, "connection refused; not retrying");
                    set_state(&self.state, ConnectionState::Error);
                    self.emit(TransportEvent::Fatal(e)).await;
                    return;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("connect timed out after {:?}", self.cfg.connect_timeout),
            };

            set_state(&self.state, ConnectionState::Error);
            tracing::warn!(epoch, %reason, "connection lost");
            if !self
                .emit(TransportEvent::Disconnected {
                    epoch,
                    reason: reason.clone(),
                })
                .await
            {
                break;
            }

            if let Some(max) = self.cfg.max_reconnect_attempts {
                if self.backoff.attempts() >= max {
                    tracing::error!(max, "max reconnect attempts reached");
                    self.emit(TransportEvent::Fatal(LiveError::RetryBudgetExhausted(max)))
                        .await;
                    return;
                }
            }

            let delay = self.backoff.next_delay();
            tracing::info!(
                delay_ms = delay.as_millis() as u64,
                attempt = self.backoff.attempts(),
                "reconnecting"
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = time::sleep(delay) => {}
            }
        }
        self.state.send_replace(ConnectionState::Closed);
        tracing::debug!("transport stopped");
    }

    async fn session(&mut self, mut conn: Box<dyn Connection>, epoch: u64) -> SessionEnd {
        let idle_timeout = self.cfg.idle_timeout;
        let idle = time::sleep(idle_timeout);
        tokio::pin!(idle);
        let keepalive_every = self.cfg.keepalive_interval.max(Duration::from_millis(1));
        let mut keepalive = time::interval_at(Instant::now() + keepalive_every, keepalive_every);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    set_state(&self.state, ConnectionState::Closing);
                    conn.close().await;
                    return SessionEnd::Cancelled;
                }

                msg = self.outbound.recv() => match msg {
                    Some((ep, text)) if ep == epoch => {
                        if let Err(e) = conn.send_text(text).await {
                            return SessionEnd::Lost(format!("send failed: {e}"));
                        }
                    }
                    Some((ep, _)) => {
                        tracing::debug!(epoch, stale = ep, "dropping message for an old connection");
                    }
                    None => {
                        conn.close().await;
                        return SessionEnd::Cancelled;
                    }
                },

                _ = &mut idle => {
                    return SessionEnd::Lost(format!("no inbound activity for {idle_timeout:?}"));
                }

                _ = keepalive.tick() => {
                    if let Err(e) = conn.ping().await {
                        return SessionEnd::Lost(format!("keepalive ping failed: {e}"));
                    }
                }

                frame = conn.next_frame() => {
                    idle.as_mut().reset(Instant::now() + idle_timeout);
                    match frame {
                        Ok(Inbound::Text(text)) => {
                            if !self.emit(TransportEvent::Frame { epoch, text }).await {
                                conn.close().await;
                                return if self.cancel.is_cancelled() {
                                    SessionEnd::Cancelled
                                } else {
                                    SessionEnd::ReceiverGone
                                };
                            }
                        }
                        Ok(Inbound::Activity) => {}
                        Ok(Inbound::Closed(reason)) => {
                            return SessionEnd::Lost(
                                reason.unwrap_or_else(|| "server closed connection".into()),
                            );
                        }
                        Err(e) => return SessionEnd::Lost(e.to_string()),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockConnector;
    use super::*;

    fn cfg() -> TransportConfig {
        TransportConfig {
            connect_timeout: Duration::from_secs(5),
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(8),
            reconnect_jitter: 0.0,
            max_reconnect_attempts: None,
            keepalive_interval: Duration::from_secs(20),
            idle_timeout: Duration::from_secs(45),
            event_buffer: 16,
        }
    }

    fn start(
        connector: Arc<MockConnector>,
        cfg: TransportConfig,
    ) -> (
        TransportHandle,
        mpsc::Receiver<TransportEvent>,
        watch::Receiver<ConnectionState>,
    ) {
        let (tx, rx) = mpsc::channel(16);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let handle = ReconnectingTransport::spawn(connector, cfg, tx, Arc::new(state_tx));
        (handle, rx, state_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn frames_are_tagged_with_epoch() {
        let (connector, mut peers) = MockConnector::new();
        let (handle, mut events, state) = start(connector, cfg());

        let mut peer = peers.recv().await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Connected { epoch: 1 }));
        assert_eq!(*state.borrow(), ConnectionState::Connected);

        peer.push_text("hello");
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Frame {
                epoch: 1,
                text: "hello".into()
            })
        );

        handle.send(1, "out".into());
        assert_eq!(peer.next_sent().await.as_deref(), Some("out"));
        handle.close();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_with_new_epoch_and_drops_stale_sends() {
        let (connector, mut peers) = MockConnector::new();
        let (handle, mut events, _state) = start(connector.clone(), cfg());

        let peer = peers.recv().await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Connected { epoch: 1 }));

        let started = Instant::now();
        peer.fail(LiveError::Network("reset by peer".into()));
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Disconnected { epoch: 1, .. })
        ));

        let mut peer2 = peers.recv().await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Connected { epoch: 2 }));
        // never retries immediately
        assert!(Instant::now() - started >= Duration::from_secs(1));

        handle.send(1, "stale".into());
        handle.send(2, "fresh".into());
        assert_eq!(peer2.next_sent().await.as_deref(), Some("fresh"));
        assert_eq!(connector.attempts(), 2);
        handle.close();
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_is_dropped() {
        let (connector, mut peers) = MockConnector::new();
        let (handle, mut events, _state) = start(connector, cfg());
        let _peer = peers.recv().await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Connected { epoch: 1 }));

        let started = Instant::now();
        match events.recv().await {
            Some(TransportEvent::Disconnected { epoch: 1, reason }) => {
                assert!(reason.contains("no inbound activity"), "{reason}");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(Instant::now() - started >= Duration::from_secs(45));
        handle.close();
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_is_fatal() {
        let (connector, _peers) = MockConnector::new();
        connector.refuse(LiveError::Unauthorized("ws".into()));
        let (handle, mut events, state) = start(connector.clone(), cfg());

        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Fatal(LiveError::Unauthorized("ws".into())))
        );
        assert!(events.recv().await.is_none());
        assert_eq!(*state.borrow(), ConnectionState::Error);
        assert_eq!(connector.attempts(), 1);
        handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_is_enforced() {
        let (connector, _peers) = MockConnector::new();
        for _ in 0..5 {
            connector.refuse(LiveError::Network("refused".into()));
        }
        let mut cfg = cfg();
        cfg.max_reconnect_attempts = Some(2);
        let (_handle, mut events, _state) = start(connector.clone(), cfg);

        let mut seen = Vec::new();
        while let Some(ev) = events.recv().await {
            seen.push(ev);
        }
        assert_eq!(seen.len(), 4);
        assert_eq!(
            seen.last(),
            Some(&TransportEvent::Fatal(LiveError::RetryBudgetExhausted(2)))
        );
        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_counts_as_failure() {
        let (connector, mut peers) = MockConnector::new();
        connector.hang_next();
        let (handle, mut events, _state) = start(connector, cfg());
        match events.recv().await {
            Some(TransportEvent::Disconnected { epoch: 1, reason }) => {
                assert!(reason.contains("timed out"), "{reason}")
            }
            other => panic!("unexpected {other:?}"),
        }
        let _peer = peers.recv().await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Connected { epoch: 2 }));
        handle.close();
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_idempotent_and_final() {
        let (connector, mut peers) = MockConnector::new();
        let (handle, mut events, state) = start(connector.clone(), cfg());
        let _peer = peers.recv().await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Connected { epoch: 1 }));

        handle.close();
        handle.close();
        assert_eq!(handle.state(), ConnectionState::Closed);
        handle.join().await;
        assert_eq!(*state.borrow(), ConnectionState::Closed);
        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 1);
    }
}
