//! End-to-end lifecycle tests for the peer pool public API.
//!
//! Drives a pool against mock server/discovery implementations through a
//! full life cycle: discovery, confirmation, saturation with stop-on-max,
//! revival after a drop, shutdown, and a cache-backed warm restart.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time;

use peerpool::{
    Identity, Limits, NodeRecord, PeerCache, PeerEvent, PeerEventKind, PeerPool, PeerPoolConfig,
    PeerServer, Topic, TopicDiscovery,
};

/// Counter for unique cache files across parallel tests.
static CACHE_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn test_cache_path() -> PathBuf {
    let n = CACHE_COUNTER.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir().join(format!(
        "peerpool-lifecycle-{}-{}.bin",
        std::process::id(),
        n
    ))
}

fn make_identity(seed: u8) -> Identity {
    Identity::from_bytes([seed; 32])
}

fn make_node(seed: u8) -> NodeRecord {
    NodeRecord::new(make_identity(seed), "10.0.0.1".parse().unwrap(), 30303, 30303)
}

struct MockDiscovery {
    found_tx: Mutex<HashMap<Topic, mpsc::Sender<NodeRecord>>>,
    searches: AtomicUsize,
    closed: AtomicUsize,
}

impl MockDiscovery {
    fn new() -> Self {
        Self {
            found_tx: Mutex::new(HashMap::new()),
            searches: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        }
    }

    async fn inject_found(&self, topic: &Topic, node: NodeRecord) {
        let tx = self
            .found_tx
            .lock()
            .unwrap()
            .get(topic)
            .cloned()
            .expect("no search running for topic");
        tx.send(node).await.expect("found channel closed");
    }
}

#[async_trait]
impl TopicDiscovery for MockDiscovery {
    async fn search_topic(
        &self,
        topic: Topic,
        mut period: mpsc::Receiver<Duration>,
        found: mpsc::Sender<NodeRecord>,
        _lookup: mpsc::Sender<()>,
    ) {
        self.searches.fetch_add(1, Ordering::SeqCst);
        self.found_tx.lock().unwrap().insert(topic, found);
        while period.recv().await.is_some() {}
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockServer {
    local: NodeRecord,
    added: Mutex<Vec<Identity>>,
    removed: Mutex<Vec<Identity>>,
    discovery: Mutex<Option<Arc<dyn TopicDiscovery>>>,
    events: Mutex<Option<mpsc::Sender<PeerEvent>>>,
}

impl MockServer {
    fn new(initial: Arc<dyn TopicDiscovery>) -> Self {
        Self {
            local: make_node(0xEE),
            added: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            discovery: Mutex::new(Some(initial)),
            events: Mutex::new(None),
        }
    }

    fn added(&self) -> Vec<Identity> {
        self.added.lock().unwrap().clone()
    }

    async fn emit(&self, kind: PeerEventKind, peer: Identity, error: Option<&str>) {
        let tx = self
            .events
            .lock()
            .unwrap()
            .clone()
            .expect("no event subscriber");
        tx.send(PeerEvent {
            kind,
            peer,
            error: error.map(str::to_owned),
        })
        .await
        .expect("event channel closed");
    }
}

#[async_trait]
impl PeerServer for MockServer {
    fn local_node(&self) -> NodeRecord {
        self.local.clone()
    }

    async fn add_peer(&self, node: &NodeRecord) {
        self.added.lock().unwrap().push(node.id);
    }

    async fn remove_peer(&self, node: &NodeRecord) {
        self.removed.lock().unwrap().push(node.id);
    }

    fn subscribe_peer_events(&self, events: mpsc::Sender<PeerEvent>) {
        *self.events.lock().unwrap() = Some(events);
    }

    fn topic_search(&self) -> Option<Arc<dyn TopicDiscovery>> {
        self.discovery.lock().unwrap().clone()
    }

    fn install_topic_search(&self, discovery: Option<Arc<dyn TopicDiscovery>>) {
        *self.discovery.lock().unwrap() = discovery;
    }

    async fn start_topic_search(&self) -> anyhow::Result<Arc<dyn TopicDiscovery>> {
        Ok(Arc::new(MockDiscovery::new()))
    }
}

fn single_topic_config(min: usize, max: usize, stop_on_max: bool) -> PeerPoolConfig {
    let mut topics = HashMap::new();
    topics.insert(Topic::from("whisper"), Limits::new(min, max));
    PeerPoolConfig {
        topics,
        stop_on_max,
        ..PeerPoolConfig::default()
    }
}

#[tokio::test]
async fn discovered_peers_are_dialed_and_confirmed() {
    let discovery = Arc::new(MockDiscovery::new());
    let server = Arc::new(MockServer::new(discovery.clone()));
    let pool = PeerPool::new(single_topic_config(1, 2, false), None);

    pool.start(Arc::clone(&server)).await.unwrap();
    time::sleep(Duration::from_millis(20)).await;

    let topic = Topic::from("whisper");
    discovery.inject_found(&topic, make_node(1)).await;
    discovery.inject_found(&topic, make_node(2)).await;
    time::sleep(Duration::from_millis(20)).await;

    let added = server.added();
    assert!(added.contains(&make_identity(1)));
    assert!(added.contains(&make_identity(2)));

    server.emit(PeerEventKind::Added, make_identity(1), None).await;
    server.emit(PeerEventKind::Added, make_identity(2), None).await;
    time::sleep(Duration::from_millis(20)).await;

    pool.stop().await;
}

#[tokio::test]
async fn saturation_stops_discovery_and_a_drop_revives_it() {
    let discovery = Arc::new(MockDiscovery::new());
    let server = Arc::new(MockServer::new(discovery.clone()));
    let pool = PeerPool::new(single_topic_config(1, 1, true), None);

    pool.start(Arc::clone(&server)).await.unwrap();
    time::sleep(Duration::from_millis(20)).await;

    let topic = Topic::from("whisper");
    discovery.inject_found(&topic, make_node(1)).await;
    time::sleep(Duration::from_millis(20)).await;
    server.emit(PeerEventKind::Added, make_identity(1), None).await;
    time::sleep(Duration::from_millis(20)).await;

    assert_eq!(discovery.closed.load(Ordering::SeqCst), 1);
    assert!(server.topic_search().is_none());

    server
        .emit(PeerEventKind::Dropped, make_identity(1), Some("read timeout"))
        .await;
    time::sleep(Duration::from_millis(20)).await;

    // A fresh engine was brought up and installed on the server.
    assert!(server.topic_search().is_some());

    pool.stop().await;
}

#[tokio::test]
async fn cache_warm_starts_the_next_search() {
    let cache_path = test_cache_path();
    let topic = Topic::from("whisper");

    // First run: two peers confirmed, one of them dropped again.
    {
        let discovery = Arc::new(MockDiscovery::new());
        let server = Arc::new(MockServer::new(discovery.clone()));
        let cache = Arc::new(PeerCache::open(&cache_path).await);
        let pool = PeerPool::new(single_topic_config(1, 2, false), Some(cache));

        pool.start(Arc::clone(&server)).await.unwrap();
        time::sleep(Duration::from_millis(20)).await;

        discovery.inject_found(&topic, make_node(1)).await;
        discovery.inject_found(&topic, make_node(2)).await;
        time::sleep(Duration::from_millis(20)).await;
        server.emit(PeerEventKind::Added, make_identity(1), None).await;
        server.emit(PeerEventKind::Added, make_identity(2), None).await;
        server
            .emit(PeerEventKind::Dropped, make_identity(1), Some("remote close"))
            .await;
        time::sleep(Duration::from_millis(20)).await;

        pool.stop().await;
    }

    // Second run: the cached peer is dialed before discovery finds anything.
    {
        let discovery = Arc::new(MockDiscovery::new());
        let server = Arc::new(MockServer::new(discovery.clone()));
        let cache = Arc::new(PeerCache::open(&cache_path).await);
        assert_eq!(cache.peers_for_topic(&topic, 10).await.len(), 1);

        let pool = PeerPool::new(single_topic_config(1, 2, false), Some(cache));
        pool.start(Arc::clone(&server)).await.unwrap();
        time::sleep(Duration::from_millis(20)).await;

        assert_eq!(server.added(), vec![make_identity(2)]);

        pool.stop().await;
    }
}
