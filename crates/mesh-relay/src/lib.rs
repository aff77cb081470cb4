//! Store-and-forward mesh relay
//!
//! Messages are flooded between directly connected peers with a hop budget
//! (TTL). Each node accepts a message at most once, persists it, and passes
//! it on with the TTL decremented until the budget runs out.

pub mod dedup;
pub mod engine;
pub mod error;
pub mod frame;
pub mod node;
pub mod peers;
pub mod retention;
pub mod stats;
pub mod tcp;
pub mod transport;

pub use dedup::DedupLedger;
pub use engine::{RelayEngine, RelayEvent, RelayOutcome};
pub use error::{MeshError, MeshResult};
pub use node::RelayNode;
pub use peers::{is_valid_transition, PeerRegistry};
pub use retention::{RetentionPolicy, SweepReport};
pub use stats::{RelayStats, RelayStatsSnapshot};
pub use tcp::{NodeHello, TcpTransport};
pub use transport::{Transport, TransportEvent};
