//! resumer - response recording and resumable replay for AI agent conversations
//!
//! A node records streamed responses into durable spool files, advertises
//! itself as the owner in a shared locator directory and redirects requests
//! that land on the wrong node.

pub mod address;
pub mod client;
pub mod config;
pub mod error;
pub mod locator;
pub mod node;
pub mod paths;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod store;
pub mod wire;

pub use address::NodeAddress;
pub use error::ResumerError;
pub use node::{Node, NodeHandle};
pub use router::{Routed, Router};
pub use session::{FinalStatus, RecordingState};
