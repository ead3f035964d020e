//! L2CAP (Logical Link Control and Adaptation Protocol) implementation
//!
//! This module provides the L2CAP signaling engine, which is responsible for:
//! - Bringing up links to remote devices on demand
//! - Opening, configuring and closing channels over those links
//! - Matching signaling responses to outstanding requests
//! - Retransmitting unanswered requests and timing out dead ones

pub mod constants;
pub mod types;
pub mod psm;
pub mod packet;
pub mod signaling;
pub mod ident;
pub mod timer;
pub mod command;
pub mod connection;
pub mod channel;
pub mod config;
pub mod lower;
pub mod core;
#[cfg(test)]
mod tests;

// Re-export the public API
pub use self::types::*;
pub use self::core::{ChannelEvent, ChannelEventCallback, L2capManager};
pub use self::channel::{ChannelInfo, L2capChannel};
pub use self::command::{CommandInfo, CommandTarget};
pub use self::config::L2capConfig;
pub use self::connection::ConnectionId;
pub use self::lower::LowerLayer;
pub use self::psm::PSM;
