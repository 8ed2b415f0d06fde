//! Capability traits for the pool's external collaborators.
//!
//! The pool depends on two things it does not own: the P2P server that
//! dials and drops peers, and the topic discovery engine that finds
//! candidates. Each is abstracted behind a trait so the pool can be driven
//! by test doubles.
//!
//! | Collaborator | Trait | Purpose |
//! |--------------|-------|---------|
//! | P2P server | [`PeerServer`] | dial/drop requests, peer events, discovery handle |
//! | Discovery engine | [`TopicDiscovery`] | per-topic candidate search |
//!
//! ## Design
//!
//! `add_peer`/`remove_peer` are advisory requests: the server may ignore
//! them or act on them later, and the authoritative connection state arrives
//! solely through the subscribed [`PeerEvent`] stream. The discovery handle
//! lives on the server (it can be torn down and re-created while the pool
//! runs), so the trait carries accessor, installer and bring-up operations
//! rather than a fixed handle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::identity::{Identity, NodeRecord, Topic};

/// Connection state change reported by the P2P server.
#[derive(Clone, Debug)]
pub struct PeerEvent {
    pub kind: PeerEventKind,
    pub peer: Identity,
    /// Opaque drop reason, present on some [`PeerEventKind::Dropped`] events.
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerEventKind {
    Added,
    Dropped,
}

/// Operations the pool needs from the underlying P2P server.
#[async_trait]
pub trait PeerServer: Send + Sync + 'static {
    /// The server's own address record. Used to filter self-candidates.
    fn local_node(&self) -> NodeRecord;

    /// Ask the server to establish a connection. Advisory and idempotent;
    /// confirmation arrives as a [`PeerEventKind::Added`] event.
    async fn add_peer(&self, node: &NodeRecord);

    /// Ask the server to drop a connection. Advisory and idempotent; the
    /// server may already have dropped the peer.
    async fn remove_peer(&self, node: &NodeRecord);

    /// Register a sink for peer add/drop events. Events for a single peer
    /// are delivered in order. The subscription ends when the receiving side
    /// is dropped.
    fn subscribe_peer_events(&self, events: mpsc::Sender<PeerEvent>);

    /// Current topic discovery handle, if the engine is running.
    fn topic_search(&self) -> Option<Arc<dyn TopicDiscovery>>;

    /// Install or clear the topic discovery handle.
    fn install_topic_search(&self, discovery: Option<Arc<dyn TopicDiscovery>>);

    /// Bring up the discovery engine (bind its UDP listener). Does not
    /// install the handle; the caller decides when it becomes visible.
    async fn start_topic_search(&self) -> Result<Arc<dyn TopicDiscovery>>;
}

/// Per-topic candidate search on the discovery engine.
#[async_trait]
pub trait TopicDiscovery: Send + Sync {
    /// Run a topic search until the `period` channel is closed.
    ///
    /// `period` carries the inter-lookup delay and may be updated while the
    /// search runs. Every discovered candidate is sent on `found`; a unit is
    /// sent on `lookup` whenever a lookup round begins.
    async fn search_topic(
        &self,
        topic: Topic,
        period: mpsc::Receiver<Duration>,
        found: mpsc::Sender<NodeRecord>,
        lookup: mpsc::Sender<()>,
    );

    /// Shut the engine down, terminating all running searches.
    async fn close(&self);
}
