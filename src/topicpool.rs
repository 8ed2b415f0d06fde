//! Per-topic peer controller.
//!
//! A [`TopicPool`] keeps one topic's connection count inside its
//! [`Limits`]: it runs a discovery search for candidates, asks the P2P
//! server to dial them while below `max`, and throttles the search period
//! once `min` peers are confirmed. Connection state is authoritative only
//! via the server's event stream, delivered here as
//! [`confirm_added`](TopicPool::confirm_added) /
//! [`confirm_dropped`](TopicPool::confirm_dropped) by the owning peer pool.
//!
//! Two tasks cooperate while a search runs:
//! - the *search worker*, which drives
//!   [`TopicDiscovery::search_topic`] and lives until the period channel
//!   closes;
//! - the *consumer*, which drains found candidates, filters out our own
//!   node and feeds [`process_found_node`](TopicPool::process_found_node).
//!
//! The period channel is the feedback loop: transitions are edge-triggered
//! at `connected == min`, sending `slow` when the count reaches `min` and
//! `fast` when a drop pushes it below. No other counter change emits an
//! update.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::cache::PeerCache;
use crate::identity::{Identity, NodeRecord, Topic};
use crate::peerpool::{PoolError, EXPIRATION_PERIOD};
use crate::protocols::PeerServer;

/// Discovered candidates queued between the search worker and the consumer.
const FOUND_CHANNEL_CAPACITY: usize = 10;

/// Lookup-round notifications from the search worker.
const LOOKUP_CHANNEL_CAPACITY: usize = 100;

/// Period updates to the search worker. Capacity 2 so that back-to-back
/// min/min-1 transitions never block a sender holding the pool lock.
const PERIOD_CHANNEL_CAPACITY: usize = 2;

/// How many cached peers seed the found channel before a search starts.
const CACHE_SEED_COUNT: usize = 5;

/// Connection bounds for one topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    pub min: usize,
    pub max: usize,
}

impl Limits {
    pub fn new(min: usize, max: usize) -> Self {
        debug_assert!(min <= max, "limits require min <= max");
        Self { min, max }
    }
}

/// Everything the pool knows about one discovered node.
struct PeerInfo {
    node: NodeRecord,
    /// Last time discovery reported the node. Candidates older than
    /// [`EXPIRATION_PERIOD`] are not reused as replacements.
    discovered_at: Instant,
    /// True once the server confirmed the connection.
    connected: bool,
    /// True if we asked the server to drop this peer; the matching drop
    /// event is then ours and must not trigger replacement.
    requested: bool,
}

impl PeerInfo {
    fn discovered(node: NodeRecord) -> Self {
        Self {
            node,
            discovered_at: Instant::now(),
            connected: false,
            requested: false,
        }
    }
}

struct TopicState {
    connected: usize,
    peers: HashMap<Identity, PeerInfo>,
    period_tx: Option<mpsc::Sender<Duration>>,
    quit: Option<CancellationToken>,
    consumer_task: Option<JoinHandle<()>>,
    search_task: Option<JoinHandle<()>>,
}

/// Manages peers for a single topic.
pub struct TopicPool<S: PeerServer> {
    topic: Topic,
    limits: Limits,
    fast_sync: Duration,
    slow_sync: Duration,
    server: Arc<S>,
    cache: Option<Arc<PeerCache>>,
    running: AtomicBool,
    state: Mutex<TopicState>,
}

impl<S: PeerServer> TopicPool<S> {
    pub(crate) fn new(
        topic: Topic,
        limits: Limits,
        fast_sync: Duration,
        slow_sync: Duration,
        server: Arc<S>,
        cache: Option<Arc<PeerCache>>,
    ) -> Self {
        Self {
            topic,
            limits,
            fast_sync,
            slow_sync,
            server,
            cache,
            running: AtomicBool::new(false),
            state: Mutex::new(TopicState {
                connected: 0,
                peers: HashMap::new(),
                period_tx: None,
                quit: None,
                consumer_task: None,
                search_task: None,
            }),
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// True while the search worker and consumer are running.
    pub fn search_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// True if the topic is saturated.
    pub async fn max_reached(&self) -> bool {
        self.state.lock().await.connected == self.limits.max
    }

    /// True if the topic has fewer confirmed connections than its minimum.
    pub async fn below_min(&self) -> bool {
        self.state.lock().await.connected < self.limits.min
    }

    /// Number of confirmed connections.
    pub async fn connected(&self) -> usize {
        self.state.lock().await.connected
    }

    /// Start the discovery search for this topic.
    ///
    /// Seeds the found channel with up to [`CACHE_SEED_COUNT`] cached peers,
    /// then spawns the search worker and the consumer. A second call while
    /// running is a no-op. Fails with [`PoolError::DiscoveryDisabled`] when
    /// the server has no discovery engine.
    pub async fn start_search(self: &Arc<Self>) -> Result<(), PoolError> {
        if self.search_running() {
            debug!(topic = %self.topic, "search already running");
            return Ok(());
        }
        let Some(discovery) = self.server.topic_search() else {
            return Err(PoolError::DiscoveryDisabled);
        };

        let mut state = self.state.lock().await;
        if self.running.swap(true, Ordering::SeqCst) {
            // Lost a race against a concurrent start.
            return Ok(());
        }

        let quit = CancellationToken::new();
        let (period_tx, period_rx) = mpsc::channel(PERIOD_CHANNEL_CAPACITY);
        let (found_tx, found_rx) = mpsc::channel(FOUND_CHANNEL_CAPACITY);
        let (lookup_tx, lookup_rx) = mpsc::channel(LOOKUP_CHANNEL_CAPACITY);

        if let Some(cache) = &self.cache {
            for node in cache.peers_for_topic(&self.topic, CACHE_SEED_COUNT).await {
                debug!(
                    peer = %hex::encode(&node.id.as_bytes()[..8]),
                    topic = %self.topic,
                    "seeding peer from cache"
                );
                let _ = found_tx.try_send(node);
            }
        }

        let search_task = tokio::spawn({
            let discovery = Arc::clone(&discovery);
            let topic = self.topic.clone();
            async move {
                discovery.search_topic(topic, period_rx, found_tx, lookup_tx).await;
            }
        });
        let consumer_task = tokio::spawn(Arc::clone(self).consume_search_results(
            found_rx,
            lookup_rx,
            period_tx.clone(),
            quit.clone(),
        ));

        state.period_tx = Some(period_tx);
        state.quit = Some(quit);
        state.search_task = Some(search_task);
        state.consumer_task = Some(consumer_task);
        Ok(())
    }

    /// Stop the search and join both tasks. Idempotent.
    ///
    /// Join order matters: quit first so the consumer exits, then close the
    /// period channel so the search worker unblocks. Closing the period
    /// channel while the consumer could still send would race.
    pub async fn stop_search(&self) {
        if !self.search_running() {
            return;
        }
        let (quit, consumer_task, search_task, period_tx) = {
            let mut state = self.state.lock().await;
            (
                state.quit.take(),
                state.consumer_task.take(),
                state.search_task.take(),
                state.period_tx.take(),
            )
        };
        // A concurrent stop already took the tasks.
        let Some(quit) = quit else { return };
        debug!(topic = %self.topic, "stopping search");
        quit.cancel();
        if let Some(task) = consumer_task {
            let _ = task.await;
        }
        self.running.store(false, Ordering::SeqCst);
        drop(period_tx);
        if let Some(task) = search_task {
            let _ = task.await;
        }
    }

    /// Confirm that the server connected `node_id`.
    ///
    /// Unknown ids are inbound connections unrelated to this topic and are
    /// ignored. A confirmed peer is cached as viable. When the topic is
    /// already saturated the peer is marked `requested` and dropped again;
    /// otherwise it is counted, and reaching `min` throttles the search.
    pub async fn confirm_added(&self, node_id: Identity) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(info) = state.peers.get_mut(&node_id) else {
            // Inbound connection, or another topic's peer.
            return;
        };
        // An established connection proves the record is dialable; cache it
        // even if the capacity gate drops it right after.
        if let Some(cache) = &self.cache {
            if let Err(error) = cache.add_peer(&info.node, &self.topic).await {
                error!(%error, topic = %self.topic, "failed to persist peer");
            }
        }
        if state.connected == self.limits.max {
            debug!(
                peer = %hex::encode(&node_id.as_bytes()[..8]),
                topic = %self.topic,
                "max limit reached, dropping peer"
            );
            info.requested = true;
            let node = info.node.clone();
            self.server.remove_peer(&node).await;
            return;
        }
        if !info.connected {
            debug!(peer = %hex::encode(&node_id.as_bytes()[..8]), "marking as connected");
            info.connected = true;
            state.connected += 1;
        }
        if self.search_running() && state.connected == self.limits.min {
            if let Some(period) = &state.period_tx {
                let _ = period.try_send(self.slow_sync);
            }
        }
    }

    /// Confirm that the server dropped `node_id`.
    ///
    /// Returns the replacement candidate asked to connect, if any, and
    /// whether the drop was ignored. Ignored drops are those for nodes this
    /// topic does not track and those we requested ourselves.
    pub async fn confirm_dropped(
        &self,
        node_id: Identity,
        reason: &str,
    ) -> (Option<NodeRecord>, bool) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let (was_connected, requested) = match state.peers.get(&node_id) {
            Some(info) => (info.connected, info.requested),
            // Either inbound or connected on behalf of another topic.
            None => return (None, true),
        };
        debug!(
            peer = %hex::encode(&node_id.as_bytes()[..8]),
            %reason,
            "disconnect reason"
        );
        if requested {
            return (None, true);
        }
        // Only a counted peer moves the counter or the period; a candidate
        // that never connected here may still produce a drop event when it
        // was connected on behalf of another topic.
        if was_connected {
            if self.search_running() && state.connected == self.limits.min {
                if let Some(period) = &state.period_tx {
                    let _ = period.try_send(self.fast_sync);
                }
            }
            state.connected -= 1;
        }
        if let Some(info) = state.peers.remove(&node_id) {
            self.server.remove_peer(&info.node).await;
        }
        if let Some(cache) = &self.cache {
            if let Err(error) = cache.remove_peer(&node_id, &self.topic).await {
                error!(%error, topic = %self.topic, "failed to remove peer from cache");
            }
        }
        // Prefer a standby candidate that discovery has seen recently.
        let now = Instant::now();
        let replacement = state
            .peers
            .values()
            .find(|p| !p.connected && now.duration_since(p.discovered_at) < EXPIRATION_PERIOD)
            .map(|p| p.node.clone());
        if let Some(node) = &replacement {
            self.server.add_peer(node).await;
        }
        (replacement, false)
    }

    /// Handle one candidate reported by discovery.
    ///
    /// Re-discovery refreshes `discovered_at` so the node stays eligible as
    /// a replacement. While below `max`, unconnected candidates are handed
    /// to the server; the result arrives later as an add or drop event.
    async fn process_found_node(&self, node: NodeRecord) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        match state.peers.get_mut(&node.id) {
            Some(info) => info.discovered_at = Instant::now(),
            None => {
                state.peers.insert(node.id, PeerInfo::discovered(node.clone()));
            }
        }
        let already_connected = state
            .peers
            .get(&node.id)
            .map(|info| info.connected)
            .unwrap_or(false);
        if state.connected < self.limits.max && !already_connected {
            debug!(
                peer = %hex::encode(&node.id.as_bytes()[..8]),
                topic = %self.topic,
                "peer found"
            );
            self.server.add_peer(&node).await;
        }
    }

    /// Consumer task: drains the search worker's channels until quit.
    async fn consume_search_results(
        self: Arc<Self>,
        mut found: mpsc::Receiver<NodeRecord>,
        mut lookup: mpsc::Receiver<()>,
        period: mpsc::Sender<Duration>,
        quit: CancellationToken,
    ) {
        {
            let state = self.state.lock().await;
            let initial = if state.connected < self.limits.min {
                self.fast_sync
            } else {
                self.slow_sync
            };
            let _ = period.try_send(initial);
        }
        // From here on only the pool state's sender touches the channel, so
        // stop_search fully controls when it closes.
        drop(period);

        let self_id = self.server.local_node().id;
        loop {
            tokio::select! {
                _ = quit.cancelled() => return,
                signal = lookup.recv() => {
                    // A closed channel means the search worker exited early;
                    // nothing to consume until the pool is stopped.
                    if signal.is_none() {
                        quit.cancelled().await;
                        return;
                    }
                }
                node = found.recv() => match node {
                    Some(node) if node.id == self_id => {
                        // Never dial ourselves.
                    }
                    Some(node) => self.process_found_node(node).await,
                    None => {
                        quit.cancelled().await;
                        return;
                    }
                },
            }
        }
    }
}
