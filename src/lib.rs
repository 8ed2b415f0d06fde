//! Topic-based peer pool for a P2P node.
//!
//! Keeps the node connected to a configurable number of peers per discovery
//! topic, within min/max bounds, while spending as little discovery
//! bandwidth as possible. The underlying P2P server and the topic discovery
//! engine are abstracted behind the [`PeerServer`] and [`TopicDiscovery`]
//! capability traits so the pool can be driven by test doubles.

mod cache;
mod identity;
mod peerpool;
mod protocols;
mod topicpool;

pub use cache::{CacheError, PeerCache};
pub use identity::{Identity, NodeRecord, Topic};
pub use peerpool::{PeerPool, PeerPoolConfig, PoolError, DEFAULT_FAST_SYNC, DEFAULT_SLOW_SYNC};
pub use protocols::{PeerEvent, PeerEventKind, PeerServer, TopicDiscovery};
pub use topicpool::{Limits, TopicPool};
