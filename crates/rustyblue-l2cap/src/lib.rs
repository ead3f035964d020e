//! RustyBlue L2CAP - the Bluetooth L2CAP signaling layer
//!
//! This library implements the connection-oriented part of L2CAP on top of
//! any link layer that can open ACL links and carry frames. It keeps track
//! of links, channels and outstanding signaling requests, and reports
//! channel events to registered protocols.

pub mod error;
pub mod gap;
pub mod l2cap;

// Re-export common types for convenience
pub use error::LinkError;
pub use gap::BdAddr;
pub use l2cap::{
    ChannelEvent, L2capConfig, L2capError, L2capManager, L2capResult, LowerLayer, PSM,
};
