//! Engine configuration
//!
//! Timeouts, retry bound and the default channel parameters a node offers.

use std::time::Duration;

use super::constants::*;
use super::types::*;

/// Tunables of one L2CAP node
#[derive(Debug, Clone)]
pub struct L2capConfig {
    /// Response timeout of a signaling command
    pub rtx_timeout: Duration,
    /// Response timeout after the peer answered "pending"
    pub ertx_timeout: Duration,
    /// How long the lower layer may take to bring a link up
    pub connect_timeout: Duration,
    /// Retransmissions of an unanswered command before it fails
    pub max_retransmits: u8,
    /// Keep an idle link this long before closing it; `None` closes at once
    pub idle_disconnect_timeout: Option<Duration>,
    /// MTU we offer for incoming traffic
    pub incoming_mtu: u16,
    /// Flush timeout we ask for
    pub flush_timeout: u16,
    /// Link supervision timeout recorded on new channels
    pub link_timeout: u16,
    /// Flow spec we ask for on incoming traffic
    pub incoming_flow: QosFlowSpec,
    /// Run a configuration exchange before a channel opens
    pub auto_configure: bool,
    /// Reported in information responses
    pub connectionless_mtu: u16,
    /// Reported in information responses
    pub extended_features: ExtendedFeatures,
}

impl Default for L2capConfig {
    fn default() -> Self {
        Self {
            rtx_timeout: L2CAP_RTX_TIMEOUT,
            ertx_timeout: L2CAP_ERTX_TIMEOUT,
            connect_timeout: L2CAP_CONNECT_TIMEOUT,
            max_retransmits: L2CAP_MAX_RETRANSMITS,
            idle_disconnect_timeout: None,
            incoming_mtu: L2CAP_DEFAULT_MTU,
            flush_timeout: L2CAP_DEFAULT_FLUSH_TIMEOUT,
            link_timeout: L2CAP_DEFAULT_LINK_TIMEOUT,
            incoming_flow: QosFlowSpec::default(),
            auto_configure: false,
            connectionless_mtu: L2CAP_DEFAULT_MTU,
            extended_features: ExtendedFeatures::FIXED_CHANNELS,
        }
    }
}

impl L2capConfig {
    pub fn with_rtx_timeout(mut self, timeout: Duration) -> Self {
        self.rtx_timeout = timeout;
        self
    }

    pub fn with_ertx_timeout(mut self, timeout: Duration) -> Self {
        self.ertx_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_retransmits(mut self, retransmits: u8) -> Self {
        self.max_retransmits = retransmits;
        self
    }

    pub fn with_idle_disconnect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_disconnect_timeout = timeout;
        self
    }

    pub fn with_incoming_mtu(mut self, mtu: u16) -> Self {
        self.incoming_mtu = mtu;
        self
    }

    pub fn with_auto_configure(mut self, enabled: bool) -> Self {
        self.auto_configure = enabled;
        self
    }

    /// Check that the values make sense
    pub fn validate(&self) -> L2capResult<()> {
        if self.incoming_mtu < L2CAP_MIN_MTU {
            return Err(L2capError::InvalidParameter(format!(
                "incoming MTU {} below minimum {}",
                self.incoming_mtu, L2CAP_MIN_MTU
            )));
        }

        let timeouts = [
            ("rtx_timeout", Some(self.rtx_timeout)),
            ("ertx_timeout", Some(self.ertx_timeout)),
            ("connect_timeout", Some(self.connect_timeout)),
            ("idle_disconnect_timeout", self.idle_disconnect_timeout),
        ];
        for (name, timeout) in timeouts {
            let Some(timeout) = timeout else {
                continue;
            };
            if timeout.is_zero() {
                return Err(L2capError::InvalidParameter(format!("{} must not be zero", name)));
            }
            if timeout > L2CAP_MAX_TIMEOUT {
                return Err(L2capError::InvalidParameter(format!(
                    "{} of {:?} exceeds {:?}",
                    name, timeout, L2CAP_MAX_TIMEOUT
                )));
            }
        }

        Ok(())
    }
}
