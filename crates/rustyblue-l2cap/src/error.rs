//! Error types for the lower (link) layer
//!
//! The L2CAP engine never talks to a controller directly. Whatever sits
//! below it reports failures through this type.

use thiserror::Error;

/// Errors reported by the link layer underneath L2CAP
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Link I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown connection handle: 0x{0:04X}")]
    UnknownHandle(u16),

    #[error("Link establishment failed with status 0x{0:02X}")]
    ConnectFailed(u8),

    #[error("Link is down")]
    LinkDown,

    #[error("Unsupported operation")]
    Unsupported,
}
