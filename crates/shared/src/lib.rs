pub mod models;
pub mod error;
pub mod config;

pub use config::Config;
pub use error::{Error, Result};
pub use models::{ConnectionStatus, Message, MessageId, Peer, PeerId, SeenMessageId};
