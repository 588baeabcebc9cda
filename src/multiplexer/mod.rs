//! One shared push connection, many filtered consumers.
//!
//! The multiplexer is an actor: a single task owns the subscription registry,
//! the transport handle and the handshake state, and every mutation reaches it
//! as a command. The filter set pushed to the server is always the union of
//! the active subscriptions' filters, sent with `overwrite: true`.
//!
//! - Subscribe and unsubscribe re-push the set only when the union changed
//! - After every (re)connect the set is pushed once the new handshake arrives
//! - Data frames arriving before the handshake of their connection are dropped
//! - A fatal transport error reaches every consumer as `Err`, then the actor stops

mod frame;
mod registry;

pub use frame::{parse_frame, FilterUpdate, Frame};
pub use registry::{SubscriptionId, SubscriptionRegistry};

use crate::config::TransportConfig;
use crate::error::{LiveError, Result};
use crate::model::{Event, Filter};
use crate::transport::{
    ConnectionState, Connector, ReconnectingTransport, TransportEvent, TransportHandle,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

enum Command {
    Subscribe {
        filter: Filter,
        consumer: mpsc::UnboundedSender<Result<Event>>,
        reply: oneshot::Sender<SubscriptionId>,
    },
    Unsubscribe(SubscriptionId),
    ActiveFilters(oneshot::Sender<Vec<Filter>>),
}

pub struct Multiplexer {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Multiplexer {
    /// Start the actor. No connection is opened until the first subscription.
    pub fn new(connector: Arc<dyn Connector>, cfg: TransportConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, events_rx) = mpsc::channel(cfg.event_buffer.max(1));
        let cancel = CancellationToken::new();

        let actor = MuxActor {
            connector,
            cfg,
            registry: SubscriptionRegistry::default(),
            transport: None,
            state: Arc::new(state_tx),
            events_tx,
            epoch: None,
            connection_id: None,
            next_id: 0,
        };
        let task = tokio::spawn(actor.run(cmd_rx, events_rx, cancel.clone()));
        Self {
            cmd_tx,
            state: state_rx,
            cancel,
            task: Some(task),
        }
    }

    pub async fn subscribe(&self, filter: Filter) -> Result<Subscription> {
        filter.validate()?;
        let (consumer, rx) = mpsc::unbounded_channel();
        let (reply, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Subscribe {
                filter: filter.clone(),
                consumer,
                reply,
            })
            .map_err(|_| LiveError::Closed)?;
        let id = reply_rx.await.map_err(|_| LiveError::Closed)?;
        Ok(Subscription {
            id,
            filter,
            rx,
            cmd_tx: self.cmd_tx.clone(),
            active: true,
        })
    }

    /// Remove a subscription by id. Unknown or already removed ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let _ = self.cmd_tx.send(Command::Unsubscribe(id));
    }

    pub async fn active_filters(&self) -> Result<Vec<Filter>> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::ActiveFilters(reply))
            .map_err(|_| LiveError::Closed)?;
        rx.await.map_err(|_| LiveError::Closed)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Idempotent. Closes the transport and ends every subscription.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A consumer's registration. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriptionId,
    filter: Filter,
    rx: mpsc::UnboundedReceiver<Result<Event>>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    active: bool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("filter", &self.filter)
            .field("active", &self.active)
            .finish()
    }
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Next matching event in arrival order; `None` once unsubscribed or closed.
    pub async fn recv(&mut self) -> Option<Result<Event>> {
        self.rx.recv().await
    }

    /// Idempotent.
    pub fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.rx.close();
        let _ = self.cmd_tx.send(Command::Unsubscribe(self.id));
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

struct MuxActor {
    connector: Arc<dyn Connector>,
    cfg: TransportConfig,
    registry: SubscriptionRegistry,
    transport: Option<TransportHandle>,
    state: Arc<watch::Sender<ConnectionState>>,
    events_tx: mpsc::Sender<TransportEvent>,
    /// Epoch of the live connection, if any.
    epoch: Option<u64>,
    /// Handshake id of the live connection, once received.
    connection_id: Option<String>,
    next_id: u64,
}

impl MuxActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut events_rx: mpsc::Receiver<TransportEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd),
                    None => break,
                },
                Some(ev) = events_rx.recv() => {
                    if !self.on_transport(ev) {
                        break;
                    }
                }
            }
        }

        match self.transport.take() {
            Some(t) => {
                t.close();
                t.join().await;
            }
            None => {
                self.state.send_replace(ConnectionState::Closed);
            }
        }
        tracing::debug!(subscriptions = self.registry.len(), "multiplexer stopped");
    }

    fn ensure_transport(&mut self) {
        if self.transport.is_some() {
            return;
        }
        tracing::debug!("starting transport for first subscription");
        self.transport = Some(ReconnectingTransport::spawn(
            self.connector.clone(),
            self.cfg.clone(),
            self.events_tx.clone(),
            self.state.clone(),
        ));
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Subscribe {
                filter,
                consumer,
                reply,
            } => {
                self.next_id += 1;
                let id = SubscriptionId(self.next_id);
                tracing::debug!(%id, filter = %filter, "subscribe");
                let grew = self.registry.insert(id, filter, consumer);
                self.ensure_transport();
                if grew {
                    self.push_filters();
                }
                let _ = reply.send(id);
            }
            Command::Unsubscribe(id) => {
                if self.registry.remove(id) {
                    tracing::debug!(%id, "unsubscribe shrank filter set");
                    self.push_filters();
                }
            }
            Command::ActiveFilters(reply) => {
                let _ = reply.send(self.registry.active_filters());
            }
        }
    }

    /// Returns `false` when the multiplexer must stop.
    fn on_transport(&mut self, ev: TransportEvent) -> bool {
        match ev {
            TransportEvent::Connected { epoch } => {
                self.epoch = Some(epoch);
                self.connection_id = None;
            }
            TransportEvent::Disconnected { epoch, reason } => {
                if self.epoch == Some(epoch) {
                    self.epoch = None;
                    self.connection_id = None;
                }
                tracing::debug!(epoch, %reason, "awaiting reconnect");
            }
            TransportEvent::Frame { epoch, text } => {
                if self.epoch != Some(epoch) {
                    tracing::debug!(epoch, "dropping frame from a previous connection");
                    return true;
                }
                self.dispatch(&text);
            }
            TransportEvent::Fatal(err) => {
                tracing::error!(error = %err, "transport failed; closing subscriptions");
                self.registry.fail_all(err);
                return false;
            }
        }
        true
    }

    fn dispatch(&mut self, text: &str) {
        match parse_frame(text) {
            Ok(Frame::Handshake(id)) => {
                tracing::info!(epoch = ?self.epoch, connection_id = %id, "handshake");
                self.connection_id = Some(id);
                self.push_filters();
            }
            Ok(Frame::Data(_)) if self.connection_id.is_none() => {
                tracing::debug!("dropping data frame received before handshake");
            }
            Ok(Frame::Data(value)) => match Event::from_value(value) {
                Ok(event) => {
                    if self.registry.fan_out(&event) {
                        self.push_filters();
                    }
                }
                Err(e) => tracing::warn!(error = %e, "dropping event"),
            },
            Err(e) => tracing::warn!(error = %e, "dropping malformed frame"),
        }
    }

    fn push_filters(&self) {
        let (Some(transport), Some(epoch), Some(id)) =
            (&self.transport, self.epoch, self.connection_id.as_deref())
        else {
            return;
        };
        let filters = self.registry.active_filters();
        match FilterUpdate::replace(id, &filters).to_text() {
            Ok(text) => {
                tracing::debug!(epoch, count = filters.len(), "pushing filter set");
                transport.send(epoch, text);
            }
            Err(e) => tracing::error!(error = %e, "cannot encode filter update"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockConnector, MockPeer};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::time;

    fn cfg() -> TransportConfig {
        TransportConfig {
            connect_timeout: Duration::from_secs(5),
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(8),
            reconnect_jitter: 0.0,
            max_reconnect_attempts: None,
            keepalive_interval: Duration::from_secs(1800),
            idle_timeout: Duration::from_secs(3600),
            event_buffer: 16,
        }
    }

    async fn next_update(peer: &mut MockPeer) -> Value {
        let text = peer.next_sent().await.expect("peer closed");
        serde_json::from_str(&text).unwrap()
    }

    fn job_event() -> String {
        json!({
            "type_event": "sdk.EventRunWorkflowJob",
            "project_key": "PRJ",
            "workflow_name": "build",
            "status": "Building"
        })
        .to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn queue_subscription_end_to_end() {
        let (connector, mut peers) = MockConnector::new();
        let mux = Multiplexer::new(connector, cfg());
        let mut sub = mux.subscribe(Filter::queue()).await.unwrap();

        let mut peer = peers.recv().await.unwrap();
        peer.push_text("ACK: conn-1");
        assert_eq!(
            next_update(&mut peer).await,
            json!({"connection_id": "conn-1", "filters": [{"type": "queue"}], "overwrite": true})
        );

        peer.push_text(&job_event());
        let ev = sub.recv().await.unwrap().unwrap();
        assert_eq!(ev.type_event, "sdk.EventRunWorkflowJob");
        assert_eq!(mux.connection_state(), ConnectionState::Connected);

        // non-matching event is not delivered
        peer.push_text(&json!({"type_event": "sdk.EventProjectUpdate", "project_key": "PRJ"}).to_string());
        assert!(time::timeout(Duration::from_secs(1), sub.recv()).await.is_err());
        mux.close();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_resends_exact_filter_set() {
        let (connector, mut peers) = MockConnector::new();
        let mux = Multiplexer::new(connector, cfg());
        let mut a = mux.subscribe(Filter::queue()).await.unwrap();
        let _b = mux.subscribe(Filter::project("PRJ")).await.unwrap();
        let _c = mux.subscribe(Filter::queue()).await.unwrap();

        let mut peer = peers.recv().await.unwrap();
        peer.push_text("ACK: conn-1");
        let first = next_update(&mut peer).await;
        assert_eq!(first["connection_id"], "conn-1");
        assert_eq!(
            first["filters"],
            json!([{"type": "queue"}, {"type": "project", "project_key": "PRJ"}])
        );

        peer.fail(LiveError::Network("reset".into()));
        let mut peer2 = peers.recv().await.unwrap();

        // data before the new handshake is dropped
        peer2.push_text(&job_event());
        peer2.push_text("ACK: conn-2");
        let resent = next_update(&mut peer2).await;
        assert_eq!(
            resent,
            json!({
                "connection_id": "conn-2",
                "filters": [{"type": "queue"}, {"type": "project", "project_key": "PRJ"}],
                "overwrite": true
            })
        );
        assert!(peer2.try_next_sent().is_none());

        peer2.push_text(&job_event());
        let ev = a.recv().await.unwrap().unwrap();
        assert_eq!(ev.project_key.as_deref(), Some("PRJ"));
        // exactly one delivery: the pre-handshake frame never arrived
        assert!(time::timeout(Duration::from_secs(1), a.recv()).await.is_err());
        mux.close();
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_pushes_only_when_union_changes() {
        let (connector, mut peers) = MockConnector::new();
        let mux = Multiplexer::new(connector, cfg());
        let mut a = mux.subscribe(Filter::queue()).await.unwrap();
        let b = mux.subscribe(Filter::queue()).await.unwrap();

        let mut peer = peers.recv().await.unwrap();
        peer.push_text("ACK: c");
        assert_eq!(next_update(&mut peer).await["filters"], json!([{"type": "queue"}]));

        a.unsubscribe();
        a.unsubscribe();
        assert!(!a.is_active());
        assert_eq!(mux.active_filters().await.unwrap(), vec![Filter::queue()]);
        assert!(peer.try_next_sent().is_none());

        drop(b);
        assert!(mux.active_filters().await.unwrap().is_empty());
        assert_eq!(next_update(&mut peer).await["filters"], json!([]));
        assert!(a.recv().await.is_none());
        mux.close();
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frames_are_skipped() {
        let (connector, mut peers) = MockConnector::new();
        let mux = Multiplexer::new(connector, cfg());
        let mut sub = mux.subscribe(Filter::queue()).await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        peer.push_text("ACK: c");
        next_update(&mut peer).await;

        peer.push_text("{not json");
        peer.push_text("[1,2,3]");
        peer.push_text(&job_event());
        assert!(sub.recv().await.unwrap().is_ok());
        mux.close();
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_filter_is_rejected() {
        let (connector, _peers) = MockConnector::new();
        let mux = Multiplexer::new(connector.clone(), cfg());
        let mut bad = Filter::queue();
        bad.project_key = Some("PRJ".into());
        assert!(matches!(
            mux.subscribe(bad).await,
            Err(LiveError::InvalidFilter(_))
        ));
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_transport_error_reaches_every_consumer() {
        let (connector, mut peers) = MockConnector::new();
        let mux = Multiplexer::new(connector.clone(), cfg());
        let mut a = mux.subscribe(Filter::queue()).await.unwrap();
        let mut b = mux.subscribe(Filter::timeline()).await.unwrap();

        // credential revoked while reconnecting
        let peer = peers.recv().await.unwrap();
        connector.refuse(LiveError::Forbidden("ws".into()));
        peer.fail(LiveError::Network("reset".into()));

        assert_eq!(a.recv().await, Some(Err(LiveError::Forbidden("ws".into()))));
        assert_eq!(b.recv().await, Some(Err(LiveError::Forbidden("ws".into()))));
        assert!(a.recv().await.is_none());
        tokio_test::assert_err!(mux.subscribe(Filter::queue()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn close_ends_subscriptions() {
        let (connector, mut peers) = MockConnector::new();
        let mux = Multiplexer::new(connector.clone(), cfg());
        assert_eq!(mux.connection_state(), ConnectionState::Disconnected);
        let mut sub = mux.subscribe(Filter::queue()).await.unwrap();
        let _peer = peers.recv().await.unwrap();

        mux.close();
        mux.close();
        assert!(sub.recv().await.is_none());
        let mut state = mux.watch_state();
        state
            .wait_for(|s| *s == ConnectionState::Closed)
            .await
            .unwrap();
        mux.join().await;
        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.attempts(), 1);
    }
}
