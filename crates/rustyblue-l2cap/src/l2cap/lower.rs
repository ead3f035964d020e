//! Interface to the link layer underneath L2CAP
//!
//! Whatever implements [`LowerLayer`] establishes ACL links and moves
//! complete L2CAP frames. Results of asynchronous operations come back
//! through the `on_lower_*` methods of
//! [`L2capManager`](super::core::L2capManager).

use crate::error::LinkError;
use crate::gap::BdAddr;

pub trait LowerLayer: Send + Sync {
    /// Start bringing up a link to `peer`. Completion is reported with
    /// `on_lower_connected` or `on_lower_connect_failed`.
    fn open_connection(&self, peer: BdAddr) -> Result<(), LinkError>;

    /// Accept a link the peer started. Completion is reported like
    /// [`open_connection`](Self::open_connection).
    fn accept_connection(&self, peer: BdAddr) -> Result<(), LinkError> {
        self.open_connection(peer)
    }

    /// Tear down an established link
    fn close_connection(&self, handle: u16) -> Result<(), LinkError>;

    /// Transmit one complete L2CAP frame
    fn send_pdu(&self, handle: u16, pdu: &[u8]) -> Result<(), LinkError>;
}
