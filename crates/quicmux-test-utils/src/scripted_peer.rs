//! Demultiplexer peer with a scripted probe answer.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use quicmux_core::{DemuxPeer, InboundChannel, StreamOpenQuery};

use crate::TEST_TIMEOUT;

type Decide = Box<dyn Fn(&StreamOpenQuery) -> bool + Send + Sync>;

/// Answers probes with a fixed rule and hands linked channels to the test.
pub struct ScriptedPeer {
    decide: Decide,
    queries: Mutex<Vec<StreamOpenQuery>>,
    linked_tx: mpsc::UnboundedSender<InboundChannel>,
    linked_rx: Mutex<mpsc::UnboundedReceiver<InboundChannel>>,
}

impl ScriptedPeer {
    pub fn with(decide: impl Fn(&StreamOpenQuery) -> bool + Send + Sync + 'static) -> Arc<Self> {
        let (linked_tx, linked_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            decide: Box::new(decide),
            queries: Mutex::new(Vec::new()),
            linked_tx,
            linked_rx: Mutex::new(linked_rx),
        })
    }

    pub fn accepting() -> Arc<Self> {
        Self::with(|_| true)
    }

    pub fn rejecting() -> Arc<Self> {
        Self::with(|_| false)
    }

    pub fn peer(self: &Arc<Self>) -> Arc<dyn DemuxPeer> {
        Arc::clone(self) as Arc<dyn DemuxPeer>
    }

    /// Probes received so far.
    pub async fn queries(&self) -> Vec<StreamOpenQuery> {
        self.queries.lock().await.clone()
    }

    /// Next channel linked to this peer. Panics after [`TEST_TIMEOUT`].
    pub async fn next_channel(&self) -> InboundChannel {
        let mut rx = self.linked_rx.lock().await;
        tokio::time::timeout(TEST_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for a linked channel")
            .expect("peer dropped")
    }

    /// A channel linked so far, without waiting.
    pub async fn try_next_channel(&self) -> Option<InboundChannel> {
        self.linked_rx.lock().await.try_recv().ok()
    }
}

#[async_trait]
impl DemuxPeer for ScriptedPeer {
    async fn probe(&self, query: &StreamOpenQuery) -> bool {
        self.queries.lock().await.push(query.clone());
        (self.decide)(query)
    }

    async fn link(&self, channel: InboundChannel) {
        let _ = self.linked_tx.send(channel);
    }
}
