//! Type definitions for L2CAP operations
//!
//! This module contains core data structures used in L2CAP operations.

use std::fmt;
use bitflags::bitflags;
use thiserror::Error;

use crate::error::LinkError;
use super::constants::*;

/// Local or remote L2CAP channel identifier
pub type ChannelId = u16;

/// Opaque value supplied with a connection-scoped request and handed back
/// with its result
pub type Token = u32;

/// Error types specific to L2CAP operations
#[derive(Debug, Error)]
pub enum L2capError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Signaling timeout")]
    Timeout,

    #[error("Remote device rejected request: 0x{0:04X}")]
    ConnectionRejected(u16),

    #[error("Channel not found")]
    ChannelNotFound,

    #[error("Invalid state for operation")]
    InvalidState,

    #[error("MTU exceeded")]
    MtuExceeded,

    #[error("Resource limit reached")]
    ResourceLimitReached,

    #[error("PSM not registered")]
    PsmNotRegistered,

    #[error("Connection terminated")]
    ConnectionTerminated,

    #[error("Connection not established")]
    NotConnected,

    #[error("Timer already armed")]
    TimerAlreadyArmed,

    #[error("Link error: {0}")]
    Link(#[from] LinkError),
}

/// Result type for L2CAP operations
pub type L2capResult<T> = std::result::Result<T, L2capError>;

/// Quality of Service (QoS) Flow Specification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosFlowSpec {
    /// QoS service type
    pub service_type: u8,
    /// Token rate (bytes/second)
    pub token_rate: u32,
    /// Token bucket size (bytes)
    pub token_bucket_size: u32,
    /// Peak bandwidth (bytes/second)
    pub peak_bandwidth: u32,
    /// Latency (microseconds)
    pub latency: u32,
    /// Delay variation (microseconds)
    pub delay_variation: u32,
}

impl Default for QosFlowSpec {
    fn default() -> Self {
        Self {
            service_type: L2CAP_QOS_BEST_EFFORT,
            token_rate: 0,
            token_bucket_size: 0,
            peak_bandwidth: 0,
            latency: 0xFFFFFFFF,
            delay_variation: 0xFFFFFFFF,
        }
    }
}

/// L2CAP Configuration Options carried in configure requests and responses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOptions {
    /// Maximum Transmission Unit
    pub mtu: Option<u16>,
    /// Flush Timeout
    pub flush_timeout: Option<u16>,
    /// Quality of Service
    pub qos: Option<QosFlowSpec>,
}

impl ConfigOptions {
    pub fn is_empty(&self) -> bool {
        self.mtu.is_none() && self.flush_timeout.is_none() && self.qos.is_none()
    }
}

/// L2CAP Channel State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2capChannelState {
    /// Channel is closed
    Closed,
    /// Local connection request issued, waiting for the peer's response
    WaitConnect,
    /// Remote connection request received, waiting for the local decision
    WaitConnectRsp,
    /// Connected, configuration in progress
    Config,
    /// Channel is open and ready for data transfer
    Open,
    /// Disconnection request issued, waiting for the peer's response
    WaitDisconnect,
}

impl fmt::Display for L2capChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::WaitConnect => write!(f, "Waiting for connection response"),
            Self::WaitConnectRsp => write!(f, "Waiting for local connection decision"),
            Self::Config => write!(f, "Configuring"),
            Self::Open => write!(f, "Open"),
            Self::WaitDisconnect => write!(f, "Waiting for disconnection"),
        }
    }
}

/// State of the link-level connection underneath a set of channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    WaitLowerConfirm,
    Open,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::WaitLowerConfirm => write!(f, "Waiting for link confirmation"),
            Self::Open => write!(f, "Open"),
        }
    }
}

/// Which side started a connection or channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

/// Why a channel (or a pending request) ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed on local request
    LocalRequest,
    /// Closed by the peer
    RemoteRequest,
    /// A signaling command ran out of retransmissions
    Timeout,
    /// The peer refused the request with this result code
    Rejected(u16),
    /// Configuration refused with this result code
    ConfigRejected(u16),
    /// The link could not be established (link status code)
    LinkFailed(u8),
    /// The link went away (link reason code)
    LinkLost(u8),
    /// Identifier space exhausted
    NoResources,
    /// Abandoned before completion
    Cancelled,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalRequest => write!(f, "local request"),
            Self::RemoteRequest => write!(f, "remote request"),
            Self::Timeout => write!(f, "signaling timeout"),
            Self::Rejected(code) => write!(f, "rejected (0x{:04X})", code),
            Self::ConfigRejected(code) => write!(f, "configuration rejected (0x{:04X})", code),
            Self::LinkFailed(status) => write!(f, "link failed (0x{:02X})", status),
            Self::LinkLost(reason) => write!(f, "link lost (0x{:02X})", reason),
            Self::NoResources => write!(f, "no resources"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

bitflags! {
    /// Directions of a channel that have finished configuration
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConfigFlags: u8 {
        /// Peer's configure request accepted
        const IN = 0x01;
        /// Our configure request accepted
        const OUT = 0x02;
        const BOTH = Self::IN.bits() | Self::OUT.bits();
    }
}

bitflags! {
    /// Extended feature mask reported in information responses
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ExtendedFeatures: u32 {
        const FLOW_CONTROL = 0x0000_0001;
        const RETRANSMISSION = 0x0000_0002;
        const BIDIRECTIONAL_QOS = 0x0000_0004;
        const ENHANCED_RETRANSMISSION = 0x0000_0008;
        const STREAMING = 0x0000_0010;
        const FCS = 0x0000_0020;
        const EXTENDED_FLOW_SPEC = 0x0000_0040;
        const FIXED_CHANNELS = 0x0000_0080;
        const EXTENDED_WINDOW = 0x0000_0100;
        const UNICAST_CONNECTIONLESS = 0x0000_0200;
    }
}

/// Policy applied to incoming connection requests for a registered PSM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionPolicy {
    /// Accept without asking the upper layer
    pub auto_accept: bool,
}
