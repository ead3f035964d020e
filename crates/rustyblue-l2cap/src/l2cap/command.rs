//! Outstanding signaling commands

use super::constants::L2CAP_COMMAND_REJECT;
use super::signaling::{SignalId, SignalingMessage};
use super::timer::TimerHandle;
use super::types::{ChannelId, Token};

/// What a command is about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandTarget {
    /// Connect, configure or disconnect of one channel
    Channel { cid: ChannelId },
    /// Echo or information request issued for the link as a whole
    Connection { token: Token },
}

impl CommandTarget {
    pub fn channel(&self) -> Option<ChannelId> {
        match self {
            CommandTarget::Channel { cid } => Some(*cid),
            CommandTarget::Connection { .. } => None,
        }
    }
}

/// A signaling request we sent (or will send once the link is up) and for
/// which we expect a response
#[derive(Debug)]
pub struct Command {
    /// Identifier, unique among the commands of one connection
    pub ident: SignalId,
    /// Request code
    pub code: u8,
    pub target: CommandTarget,
    /// Sent and waiting for the response
    pub pending: bool,
    /// Retransmissions done so far
    pub retransmits: u8,
    /// Response timer, armed while pending
    pub timer: Option<TimerHandle>,
    /// The request itself, kept for retransmission
    pub request: SignalingMessage,
}

impl Command {
    pub fn new(request: SignalingMessage, target: CommandTarget) -> Self {
        Self {
            ident: request.identifier(),
            code: request.command_code(),
            target,
            pending: false,
            retransmits: 0,
            timer: None,
            request,
        }
    }

    /// Encoded signaling frame carrying the request
    pub fn pdu(&self) -> Vec<u8> {
        self.request.to_packet().to_bytes()
    }

    /// Whether `message` is the response this command waits for
    pub fn is_answered_by(&self, message: &SignalingMessage) -> bool {
        message.identifier() == self.ident
            && (message.command_code() == L2CAP_COMMAND_REJECT
                || SignalingMessage::response_code_for(self.code) == Some(message.command_code()))
    }

    pub fn info(&self) -> CommandInfo {
        CommandInfo {
            ident: self.ident,
            code: self.code,
            target: self.target,
            pending: self.pending,
            retransmits: self.retransmits,
        }
    }
}

/// Read-only view of a queued command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandInfo {
    pub ident: SignalId,
    pub code: u8,
    pub target: CommandTarget,
    pub pending: bool,
    pub retransmits: u8,
}
