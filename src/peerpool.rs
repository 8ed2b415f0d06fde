//! Top-level peer pool.
//!
//! The [`PeerPool`] owns one [`TopicPool`] per configured topic and fans the
//! P2P server's add/drop events out to all of them. It is also the layer
//! that makes discovery cheap to run: with `stop_on_max` set it stops the
//! search of every saturated topic, closes the discovery engine entirely
//! once all topics are saturated, and brings the engine back up (with a
//! constant 2 s retry on bring-up failure) as soon as a drop opens a slot.
//!
//! Runtime errors inside the dispatch loop are logged and absorbed; the
//! loop exits only when the pool is stopped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::cache::PeerCache;
use crate::identity::Topic;
use crate::protocols::{PeerEvent, PeerEventKind, PeerServer};
use crate::topicpool::{Limits, TopicPool};

/// How long a discovered but unconnected candidate stays eligible for reuse
/// as a replacement.
pub(crate) const EXPIRATION_PERIOD: Duration = Duration::from_secs(60 * 60);

/// Recommended period for aggressive peer search.
pub const DEFAULT_FAST_SYNC: Duration = Duration::from_secs(3);

/// Recommended period for slow (background) peer search.
pub const DEFAULT_SLOW_SYNC: Duration = Duration::from_secs(30 * 60);

/// Backoff between attempts to bring the discovery engine back up.
const DISCOVERY_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Peer events buffered between the server and the dispatch task.
const EVENT_CHANNEL_CAPACITY: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The server has no running topic discovery engine.
    #[error("topic discovery is not running")]
    DiscoveryDisabled,
}

/// Pool configuration, fixed for the pool's lifetime.
#[derive(Clone, Debug)]
pub struct PeerPoolConfig {
    /// Connection bounds per topic.
    pub topics: HashMap<Topic, Limits>,
    /// Inter-lookup delay while a topic is below its minimum.
    pub fast_sync: Duration,
    /// Inter-lookup delay once a topic reached its minimum.
    pub slow_sync: Duration,
    /// Shut the discovery engine down when every topic is saturated.
    pub stop_on_max: bool,
}

impl Default for PeerPoolConfig {
    fn default() -> Self {
        Self {
            topics: HashMap::new(),
            fast_sync: DEFAULT_FAST_SYNC,
            slow_sync: DEFAULT_SLOW_SYNC,
            stop_on_max: false,
        }
    }
}

struct PoolState<S: PeerServer> {
    topics: Vec<Arc<TopicPool<S>>>,
    quit: CancellationToken,
    dispatch_task: JoinHandle<()>,
}

/// Keeps the node connected to a bounded number of peers per topic.
pub struct PeerPool<S: PeerServer> {
    config: PeerPoolConfig,
    cache: Option<Arc<PeerCache>>,
    state: Mutex<Option<PoolState<S>>>,
}

impl<S: PeerServer> PeerPool<S> {
    pub fn new(config: PeerPoolConfig, cache: Option<Arc<PeerCache>>) -> Self {
        Self {
            config,
            cache,
            state: Mutex::new(None),
        }
    }

    /// Create a topic pool per configured topic, start their searches and
    /// spawn the event dispatch task.
    ///
    /// Fails with [`PoolError::DiscoveryDisabled`] when the server has no
    /// discovery engine. Starting an already started pool is a no-op.
    pub async fn start(&self, server: Arc<S>) -> Result<(), PoolError> {
        if server.topic_search().is_none() {
            return Err(PoolError::DiscoveryDisabled);
        }
        let mut state = self.state.lock().await;
        if state.is_some() {
            warn!("peer pool already started");
            return Ok(());
        }

        let mut topics = Vec::with_capacity(self.config.topics.len());
        for (topic, limits) in &self.config.topics {
            let pool = Arc::new(TopicPool::new(
                topic.clone(),
                *limits,
                self.config.fast_sync,
                self.config.slow_sync,
                Arc::clone(&server),
                self.cache.clone(),
            ));
            pool.start_search().await?;
            topics.push(pool);
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        server.subscribe_peer_events(events_tx);
        let quit = CancellationToken::new();
        let dispatcher = EventDispatcher {
            server,
            topics: topics.clone(),
            stop_on_max: self.config.stop_on_max,
            to_search: Vec::new(),
        };
        let dispatch_task = tokio::spawn(dispatcher.run(events_rx, quit.clone()));

        *state = Some(PoolState {
            topics,
            quit,
            dispatch_task,
        });
        Ok(())
    }

    /// Stop every topic search and join the dispatch task. Idempotent.
    pub async fn stop(&self) {
        let state = self.state.lock().await.take();
        let Some(state) = state else {
            debug!("peer pool was not started");
            return;
        };
        debug!("stopping peer pool");
        state.quit.cancel();
        for pool in &state.topics {
            pool.stop_search().await;
        }
        let _ = state.dispatch_task.await;
    }
}

/// Long-lived task turning server events into topic pool updates.
struct EventDispatcher<S: PeerServer> {
    server: Arc<S>,
    topics: Vec<Arc<TopicPool<S>>>,
    stop_on_max: bool,
    /// Pools whose search must be restarted once discovery is back up.
    to_search: Vec<Arc<TopicPool<S>>>,
}

impl<S: PeerServer> EventDispatcher<S> {
    async fn run(mut self, mut events: mpsc::Receiver<PeerEvent>, quit: CancellationToken) {
        let mut retry_at: Option<Instant> = None;
        loop {
            tokio::select! {
                _ = quit.cancelled() => return,
                _ = async {
                    match retry_at {
                        Some(at) => time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    retry_at = None;
                    self.run_listener(&mut retry_at).await;
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event, &mut retry_at).await,
                    None => {
                        // Server dropped the subscription; only quit is left.
                        quit.cancelled().await;
                        return;
                    }
                },
            }
        }
    }

    async fn handle_event(&mut self, event: PeerEvent, retry_at: &mut Option<Instant>) {
        match event.kind {
            PeerEventKind::Dropped => {
                debug!(peer = %hex::encode(&event.peer.as_bytes()[..8]), "confirm peer dropped");
                let reason = event.error.as_deref().unwrap_or("");
                for pool in &self.topics {
                    // A drop one pool ignores must not restart its search.
                    let (_, ignored) = pool.confirm_dropped(event.peer, reason).await;
                    if !ignored && pool.below_min().await {
                        self.to_search.push(Arc::clone(pool));
                    }
                }
                if !self.to_search.is_empty() && self.stop_on_max {
                    self.run_listener(retry_at).await;
                }
            }
            PeerEventKind::Added => {
                debug!(peer = %hex::encode(&event.peer.as_bytes()[..8]), "confirm peer added");
                let mut saturated = 0;
                for pool in &self.topics {
                    pool.confirm_added(event.peer).await;
                    if self.stop_on_max && pool.max_reached().await {
                        saturated += 1;
                        pool.stop_search().await;
                    }
                }
                if self.stop_on_max && saturated == self.topics.len() {
                    if let Some(discovery) = self.server.topic_search() {
                        debug!("all topics saturated, closing topic discovery");
                        discovery.close().await;
                        self.server.install_topic_search(None);
                    }
                }
            }
        }
    }

    /// Bring discovery back if needed, then restart the queued searches.
    ///
    /// Bring-up failures arm a constant-interval retry; the queue survives
    /// until an attempt succeeds.
    async fn run_listener(&mut self, retry_at: &mut Option<Instant>) {
        if self.server.topic_search().is_none() {
            match self.server.start_topic_search().await {
                Ok(discovery) => {
                    debug!("restarted topic discovery from peer pool");
                    self.server.install_topic_search(Some(discovery));
                }
                Err(error) => {
                    error!(%error, "starting topic discovery failed");
                    *retry_at = Some(Instant::now() + DISCOVERY_RETRY_INTERVAL);
                    return;
                }
            }
        }
        for pool in self.to_search.drain(..) {
            let _ = pool.start_search().await;
        }
    }
}
