//! In-memory connector: every accepted connection is handed to the test as a [`MockPeer`].

use super::{Connection, Connector, Inbound};
use crate::error::{LiveError, Result};
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

enum Scripted {
    Refuse(LiveError),
    Hang,
}

pub struct MockConnector {
    peers: mpsc::UnboundedSender<MockPeer>,
    script: Mutex<VecDeque<Scripted>>,
    attempts: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockPeer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            peers: tx,
            script: Mutex::new(VecDeque::new()),
            attempts: AtomicUsize::new(0),
        });
        (connector, rx)
    }

    /// Fail the next connection attempt with `err`.
    pub fn refuse(&self, err: LiveError) {
        self.script.lock().unwrap().push_back(Scripted::Refuse(err));
    }

    /// Never complete the next connection attempt.
    pub fn hang_next(&self) {
        self.script.lock().unwrap().push_back(Scripted::Hang);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for MockConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn Connection>>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let scripted = self.script.lock().unwrap().pop_front();
        Box::pin(async move {
            match scripted {
                Some(Scripted::Refuse(e)) => Err(e),
                Some(Scripted::Hang) => futures::future::pending().await,
                None => {
                    let (in_tx, in_rx) = mpsc::unbounded_channel();
                    let (out_tx, out_rx) = mpsc::unbounded_channel();
                    let _ = self.peers.send(MockPeer {
                        inbound: in_tx,
                        outbound: out_rx,
                    });
                    Ok(Box::new(MockConnection {
                        inbound: in_rx,
                        outbound: out_tx,
                    }) as Box<dyn Connection>)
                }
            }
        })
    }
}

/// Server side of a mock connection. Dropping it closes the stream.
pub struct MockPeer {
    inbound: mpsc::UnboundedSender<Result<Inbound>>,
    outbound: mpsc::UnboundedReceiver<String>,
}

impl MockPeer {
    pub fn push_text(&self, text: &str) {
        let _ = self.inbound.send(Ok(Inbound::Text(text.to_string())));
    }

    pub fn fail(&self, err: LiveError) {
        let _ = self.inbound.send(Err(err));
    }

    pub async fn next_sent(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    pub fn try_next_sent(&mut self) -> Option<String> {
        self.outbound.try_recv().ok()
    }
}

struct MockConnection {
    inbound: mpsc::UnboundedReceiver<Result<Inbound>>,
    outbound: mpsc::UnboundedSender<String>,
}

impl Connection for MockConnection {
    fn send_text(&mut self, text: String) -> BoxFuture<'_, Result<()>> {
        let res = self
            .outbound
            .send(text)
            .map_err(|_| LiveError::Network("peer gone".into()));
        Box::pin(async move { res })
    }

    fn next_frame(&mut self) -> BoxFuture<'_, Result<Inbound>> {
        Box::pin(async move {
            match self.inbound.recv().await {
                Some(frame) => frame,
                None => Ok(Inbound::Closed(None)),
            }
        })
    }

    fn ping(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        self.inbound.close();
        Box::pin(async {})
    }
}
