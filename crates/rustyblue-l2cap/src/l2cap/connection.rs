//! Link-level connections and their command queues
//!
//! A connection owns the signaling commands issued on it. Channels refer to
//! their connection by [`ConnectionId`] and are looked up through the node
//! tables, never through a stored reference.

use std::fmt;

use crate::gap::BdAddr;

use super::command::{Command, CommandTarget};
use super::ident::IdAllocator;
use super::signaling::SignalId;
use super::timer::TimerHandle;
use super::types::{ChannelId, ConnectionState, Origin};

/// Stable key of a connection inside one node. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "con#{}", self.0)
    }
}

/// A link to one remote device
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer: BdAddr,
    state: ConnectionState,
    origin: Origin,
    /// Lower-layer handle, known once the link is confirmed
    handle: Option<u16>,
    idents: IdAllocator,
    commands: Vec<Command>,
    /// Link establishment or idle timer
    pub(crate) timer: Option<TimerHandle>,
}

impl Connection {
    pub fn new(id: ConnectionId, peer: BdAddr, origin: Origin) -> Self {
        Self {
            id,
            peer,
            state: ConnectionState::Closed,
            origin,
            handle: None,
            idents: IdAllocator::command_idents(),
            commands: Vec::new(),
            timer: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> BdAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn handle(&self) -> Option<u16> {
        self.handle
    }

    pub fn set_handle(&mut self, handle: u16) {
        self.handle = Some(handle);
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Next free command identifier on this connection
    pub fn next_command_ident(&mut self) -> Option<SignalId> {
        let commands = &self.commands;
        self.idents
            .next(|ident| commands.iter().any(|cmd| cmd.ident as u16 == ident))
            .map(|ident| ident as SignalId)
    }

    pub fn last_ident(&self) -> SignalId {
        self.idents.last_used() as SignalId
    }

    /// Append a command; issue order is kept
    pub fn enqueue(&mut self, command: Command) {
        debug_assert!(self.find_by_ident(command.ident).is_none());
        self.commands.push(command);
    }

    pub fn find_by_ident(&self, ident: SignalId) -> Option<&Command> {
        self.commands.iter().find(|cmd| cmd.ident == ident)
    }

    pub fn find_by_ident_mut(&mut self, ident: SignalId) -> Option<&mut Command> {
        self.commands.iter_mut().find(|cmd| cmd.ident == ident)
    }

    /// Detach a command. The caller disarms its timer.
    pub fn remove(&mut self, ident: SignalId) -> Option<Command> {
        let index = self.commands.iter().position(|cmd| cmd.ident == ident)?;
        Some(self.commands.remove(index))
    }

    /// Detach every command about `cid`
    pub fn purge_all_for_channel(&mut self, cid: ChannelId) -> Vec<Command> {
        let (purged, kept): (Vec<Command>, Vec<Command>) = std::mem::take(&mut self.commands)
            .into_iter()
            .partition(|cmd| cmd.target == CommandTarget::Channel { cid });
        self.commands = kept;
        purged
    }

    /// Detach every command
    pub fn purge_all(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }

    pub fn commands(&self) -> impl Iterator<Item = &Command> {
        self.commands.iter()
    }

    pub fn commands_mut(&mut self) -> impl Iterator<Item = &mut Command> {
        self.commands.iter_mut()
    }

    pub fn has_commands(&self) -> bool {
        !self.commands.is_empty()
    }
}
