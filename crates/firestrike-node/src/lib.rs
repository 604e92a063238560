//! FireStrike node
//!
//! Runs the distribution protocol on top of a transport: serves `ping`,
//! `store`, `find` and `get_peers` requests, keeps the peer directory
//! fresh, and exposes upload and download of encrypted files addressed by
//! magnet links.

pub mod client;
pub mod config;
pub mod error;
mod handler;
mod liveness;
pub mod node;
mod transfer;

pub use client::{FindReply, PeerClient};
pub use config::Config;
pub use error::{NodeError, Result};
pub use liveness::SweepReport;
pub use node::Node;
