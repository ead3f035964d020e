//! L2CAP Channel implementation
//!
//! This module provides the L2CAP channel abstraction which represents
//! a logical connection between two devices for a specific protocol or service.

use std::fmt;

use super::config::L2capConfig;
use super::connection::ConnectionId;
use super::constants::*;
use super::psm::PSM;
use super::signaling::SignalId;
use super::types::*;

/// L2CAP Channel structure
pub struct L2capChannel {
    /// Local Channel Identifier (CID)
    local_cid: ChannelId,
    /// Remote Channel Identifier (CID), zero until the peer tells us
    remote_cid: ChannelId,
    /// Connection carrying this channel
    connection: ConnectionId,
    /// Protocol/Service Multiplexer for this channel
    psm: PSM,
    /// Channel state
    state: L2capChannelState,
    /// Which directions finished configuration
    config_state: ConfigFlags,
    /// Who asked for the channel
    origin: Origin,
    /// Whether the upper layer has been told the channel is open
    open_reported: bool,
    /// Identifier of the remote connection request awaiting our decision
    pending_ident: Option<SignalId>,
    /// Reason reported once a disconnect we started completes
    close_reason: Option<CloseReason>,
    /// MTU we are willing to receive
    incoming_mtu: u16,
    /// MTU the peer is willing to receive
    outgoing_mtu: u16,
    /// Flow spec for traffic we receive
    incoming_flow: QosFlowSpec,
    /// Flow spec for traffic we send
    outgoing_flow: QosFlowSpec,
    /// Flush timeout (in milliseconds)
    flush_timeout: u16,
    /// Link supervision timeout
    link_timeout: u16,
}

impl L2capChannel {
    /// Create a new dynamic channel with the node's default parameters
    pub fn new(
        local_cid: ChannelId,
        connection: ConnectionId,
        psm: PSM,
        origin: Origin,
        config: &L2capConfig,
    ) -> Self {
        Self {
            local_cid,
            remote_cid: L2CAP_NULL_CID,
            connection,
            psm,
            state: L2capChannelState::Closed,
            config_state: ConfigFlags::empty(),
            origin,
            open_reported: false,
            pending_ident: None,
            close_reason: None,
            incoming_mtu: config.incoming_mtu,
            outgoing_mtu: L2CAP_DEFAULT_MTU,
            incoming_flow: config.incoming_flow,
            outgoing_flow: QosFlowSpec::default(),
            flush_timeout: config.flush_timeout,
            link_timeout: config.link_timeout,
        }
    }

    /// Get the local Channel Identifier (CID)
    pub fn local_cid(&self) -> ChannelId {
        self.local_cid
    }

    /// Get the remote Channel Identifier (CID)
    pub fn remote_cid(&self) -> ChannelId {
        self.remote_cid
    }

    /// Set the remote Channel Identifier (CID)
    pub fn set_remote_cid(&mut self, remote_cid: ChannelId) {
        self.remote_cid = remote_cid;
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Get the Protocol/Service Multiplexer (PSM)
    pub fn psm(&self) -> PSM {
        self.psm
    }

    /// Get the channel state
    pub fn state(&self) -> L2capChannelState {
        self.state
    }

    /// Set the channel state
    pub fn set_state(&mut self, state: L2capChannelState) {
        self.state = state;
        if state == L2capChannelState::Config {
            self.config_state = ConfigFlags::empty();
        }
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn config_state(&self) -> ConfigFlags {
        self.config_state
    }

    /// Record that one direction finished configuration. Returns true once
    /// both have.
    pub fn mark_configured(&mut self, direction: ConfigFlags) -> bool {
        self.config_state |= direction;
        self.config_state.contains(ConfigFlags::BOTH)
    }

    pub fn open_reported(&self) -> bool {
        self.open_reported
    }

    pub fn set_open_reported(&mut self) {
        self.open_reported = true;
    }

    pub fn pending_ident(&self) -> Option<SignalId> {
        self.pending_ident
    }

    pub fn set_pending_ident(&mut self, ident: Option<SignalId>) {
        self.pending_ident = ident;
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub fn set_close_reason(&mut self, reason: CloseReason) {
        self.close_reason = Some(reason);
    }

    pub fn incoming_mtu(&self) -> u16 {
        self.incoming_mtu
    }

    pub fn outgoing_mtu(&self) -> u16 {
        self.outgoing_mtu
    }

    pub fn incoming_flow(&self) -> QosFlowSpec {
        self.incoming_flow
    }

    pub fn outgoing_flow(&self) -> QosFlowSpec {
        self.outgoing_flow
    }

    pub fn flush_timeout(&self) -> u16 {
        self.flush_timeout
    }

    pub fn link_timeout(&self) -> u16 {
        self.link_timeout
    }

    /// Options describing what we want for the incoming direction
    pub fn local_options(&self) -> ConfigOptions {
        ConfigOptions {
            mtu: Some(self.incoming_mtu),
            flush_timeout: (self.flush_timeout != L2CAP_DEFAULT_FLUSH_TIMEOUT)
                .then_some(self.flush_timeout),
            qos: (self.incoming_flow != QosFlowSpec::default()).then_some(self.incoming_flow),
        }
    }

    /// Check options received in the peer's configure request.
    ///
    /// On refusal returns the option values we would accept instead.
    pub fn check_remote_options(&self, options: &ConfigOptions) -> Result<(), ConfigOptions> {
        match options.mtu {
            Some(mtu) if mtu < L2CAP_MIN_MTU => Err(ConfigOptions {
                mtu: Some(L2CAP_MIN_MTU),
                ..Default::default()
            }),
            _ => Ok(()),
        }
    }

    /// Apply the peer's configure request to the outgoing direction
    pub fn apply_remote_options(&mut self, options: &ConfigOptions) {
        if let Some(mtu) = options.mtu {
            self.outgoing_mtu = mtu;
        }
        if let Some(flush_timeout) = options.flush_timeout {
            self.flush_timeout = flush_timeout;
        }
        if let Some(qos) = options.qos {
            self.outgoing_flow = qos;
        }
    }

    /// Apply options the peer accepted for our incoming direction
    pub fn apply_local_options(&mut self, options: &ConfigOptions) {
        if let Some(mtu) = options.mtu {
            self.incoming_mtu = mtu;
        }
        if let Some(flush_timeout) = options.flush_timeout {
            self.flush_timeout = flush_timeout;
        }
        if let Some(qos) = options.qos {
            self.incoming_flow = qos;
        }
    }

    /// Check that an SDU of `len` bytes may be sent now
    pub fn check_send(&self, len: usize) -> L2capResult<()> {
        if self.state != L2capChannelState::Open {
            return Err(L2capError::InvalidState);
        }

        if self.remote_cid == L2CAP_NULL_CID {
            return Err(L2capError::NotConnected);
        }

        if len > self.outgoing_mtu as usize {
            return Err(L2capError::MtuExceeded);
        }

        Ok(())
    }

    /// Snapshot for callers outside the engine
    pub fn info(&self) -> ChannelInfo {
        ChannelInfo {
            local_cid: self.local_cid,
            remote_cid: self.remote_cid,
            psm: self.psm,
            state: self.state,
            incoming_mtu: self.incoming_mtu,
            outgoing_mtu: self.outgoing_mtu,
            flush_timeout: self.flush_timeout,
            link_timeout: self.link_timeout,
            incoming_flow: self.incoming_flow,
            outgoing_flow: self.outgoing_flow,
        }
    }
}

/// Read-only view of a channel's negotiated parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub local_cid: ChannelId,
    pub remote_cid: ChannelId,
    pub psm: PSM,
    pub state: L2capChannelState,
    pub incoming_mtu: u16,
    pub outgoing_mtu: u16,
    pub flush_timeout: u16,
    pub link_timeout: u16,
    pub incoming_flow: QosFlowSpec,
    pub outgoing_flow: QosFlowSpec,
}

impl fmt::Debug for L2capChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("L2capChannel")
            .field("local_cid", &self.local_cid)
            .field("remote_cid", &self.remote_cid)
            .field("connection", &self.connection)
            .field("psm", &self.psm)
            .field("state", &self.state)
            .field("config_state", &self.config_state)
            .field("origin", &self.origin)
            .field("incoming_mtu", &self.incoming_mtu)
            .field("outgoing_mtu", &self.outgoing_mtu)
            .finish()
    }
}
