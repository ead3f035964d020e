//! L2CAP Core Manager implementation
//!
//! This module provides the core L2CAP manager that handles:
//! - Link connections and their signaling command queues
//! - Channel setup, configuration and teardown
//! - Data routing between the link and the upper protocols
//! - Retransmission and link timers
//!
//! All node state sits behind one lock. Handlers record lower-layer
//! requests and upper-layer events in an outbox while holding it; the
//! outbox is flushed once the lock is released, so callbacks may call back
//! into the manager.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, trace, warn};

use crate::error::LinkError;
use crate::gap::BdAddr;
use crate::l2cap::channel::{ChannelInfo, L2capChannel};
use crate::l2cap::command::{Command, CommandInfo, CommandTarget};
use crate::l2cap::config::L2capConfig;
use crate::l2cap::connection::{Connection, ConnectionId};
use crate::l2cap::constants::*;
use crate::l2cap::ident::IdAllocator;
use crate::l2cap::lower::LowerLayer;
use crate::l2cap::packet::L2capPacket;
use crate::l2cap::psm::PSM;
use crate::l2cap::signaling::{SignalId, SignalingMessage};
use crate::l2cap::timer::{TimerHandle, TimerQueue, TimerTarget};
use crate::l2cap::types::*;

/// Callback for channel events like connect, disconnect, etc.
pub type ChannelEventCallback =
    Arc<Mutex<dyn FnMut(ChannelEvent) -> L2capResult<()> + Send + 'static>>;

/// Channel events for callbacks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The peer asks for a channel; answer with `channel_accept` or
    /// `channel_reject`
    ConnectionRequest {
        /// Local CID reserved for the channel
        cid: ChannelId,
        /// Protocol/Service Multiplexer
        psm: PSM,
        /// Remote device
        peer: BdAddr,
    },
    /// Channel open
    Connected {
        /// Channel ID
        cid: ChannelId,
        /// Protocol/Service Multiplexer
        psm: PSM,
    },
    /// A locally requested channel never opened
    OpenFailed {
        cid: ChannelId,
        psm: PSM,
        reason: CloseReason,
    },
    /// Our configure request was accepted
    ConfigChanged {
        /// Channel ID
        cid: ChannelId,
        /// Options now in effect for the incoming direction
        config: ConfigOptions,
    },
    /// Our configure request was refused or timed out
    ConfigFailed {
        cid: ChannelId,
        reason: CloseReason,
    },
    /// Inbound SDU
    Data {
        cid: ChannelId,
        data: Vec<u8>,
    },
    /// Channel disconnected
    Disconnected {
        /// Channel ID
        cid: ChannelId,
        /// Protocol/Service Multiplexer
        psm: PSM,
        /// Reason for disconnection
        reason: CloseReason,
    },
    /// Answer to `ping`
    EchoResponse { token: Token, data: Vec<u8> },
    /// Answer to `get_info`
    InfoResponse {
        token: Token,
        info_type: u16,
        result: u16,
        data: Vec<u8>,
    },
    /// A `ping` or `get_info` that got no usable answer
    RequestFailed { token: Token, reason: CloseReason },
}

/// Represents a registration for a specific PSM.
#[derive(Clone)]
struct PsmRegistration {
    /// PSM value
    psm: PSM,
    /// Event callback for this PSM
    event_callback: Option<ChannelEventCallback>,
    /// What to do with incoming connection requests
    policy: ConnectionPolicy,
}

/// Side effects collected while the node lock is held
enum Action {
    OpenLink(BdAddr),
    AcceptLink(BdAddr),
    CloseLink(u16),
    Send(u16, Vec<u8>),
    Notify(Option<ChannelEventCallback>, ChannelEvent),
}

/// How a command ended
enum Outcome {
    Response(SignalingMessage),
    Failed(CloseReason),
}

/// Everything the engine knows, guarded by one lock
struct NodeState {
    config: L2capConfig,
    connections: BTreeMap<ConnectionId, Connection>,
    next_connection_id: u32,
    /// Channels mapped by local CID
    channels: BTreeMap<ChannelId, L2capChannel>,
    cids: IdAllocator,
    timers: TimerQueue,
    /// Registered PSMs
    psm_registrations: HashMap<u16, PsmRegistration>,
    outbox: Vec<Action>,
}

/// L2CAP Manager responsible for handling L2CAP operations
pub struct L2capManager {
    node: Mutex<NodeState>,
    lower: Arc<dyn LowerLayer>,
    /// Event callback for all channels
    global_event_callback: Mutex<Option<ChannelEventCallback>>,
    events: Mutex<VecDeque<(Option<ChannelEventCallback>, ChannelEvent)>>,
    dispatching: AtomicBool,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn disarm(timers: &mut TimerQueue, slot: &mut Option<TimerHandle>) {
    if let Some(handle) = slot.take() {
        timers.disarm(handle);
    }
}

fn deadline(now: Instant, timeout: Duration) -> L2capResult<Instant> {
    now.checked_add(timeout)
        .ok_or_else(|| L2capError::InvalidParameter(format!("timeout {:?} out of range", timeout)))
}

fn link_status(err: &LinkError) -> u8 {
    match err {
        LinkError::ConnectFailed(status) => *status,
        _ => LINK_REASON_LOCAL_HOST,
    }
}

impl L2capManager {
    /// Create a new L2CAP Manager on top of `lower`
    pub fn new(config: L2capConfig, lower: Arc<dyn LowerLayer>) -> L2capResult<Self> {
        config.validate()?;

        Ok(Self {
            node: Mutex::new(NodeState {
                config,
                connections: BTreeMap::new(),
                next_connection_id: 1,
                channels: BTreeMap::new(),
                cids: IdAllocator::channel_ids(),
                timers: TimerQueue::new(),
                psm_registrations: HashMap::new(),
                outbox: Vec::new(),
            }),
            lower,
            global_event_callback: Mutex::new(None),
            events: Mutex::new(VecDeque::new()),
            dispatching: AtomicBool::new(false),
        })
    }

    /// Register a PSM for handling incoming connections
    pub fn register_psm(
        &self,
        psm: PSM,
        event_callback: Option<ChannelEventCallback>,
        policy: ConnectionPolicy,
    ) -> L2capResult<()> {
        if !psm.is_valid() {
            return Err(L2capError::InvalidParameter("Invalid PSM".into()));
        }

        let mut node = lock(&self.node);

        if node.psm_registrations.contains_key(&psm.value()) {
            return Err(L2capError::InvalidParameter(format!("PSM {} already registered", psm)));
        }

        node.psm_registrations.insert(
            psm.value(),
            PsmRegistration {
                psm,
                event_callback,
                policy,
            },
        );
        debug!("Registered {}", psm);

        Ok(())
    }

    /// Unregister a PSM. Open channels on it are not affected.
    pub fn unregister_psm(&self, psm: PSM) -> L2capResult<()> {
        let mut node = lock(&self.node);

        let registration = node
            .psm_registrations
            .remove(&psm.value())
            .ok_or(L2capError::PsmNotRegistered)?;
        debug!("Unregistered {}", registration.psm);

        Ok(())
    }

    /// Set the event callback used for PSMs without their own
    pub fn set_global_event_callback<F>(&self, callback: F)
    where
        F: FnMut(ChannelEvent) -> L2capResult<()> + Send + 'static,
    {
        *lock(&self.global_event_callback) = Some(Arc::new(Mutex::new(callback)));
    }

    /// Replace (or clear) the event callback of a registered PSM
    pub fn set_event_callback(
        &self,
        psm: PSM,
        callback: Option<ChannelEventCallback>,
    ) -> L2capResult<()> {
        let mut node = lock(&self.node);
        let registration = node
            .psm_registrations
            .get_mut(&psm.value())
            .ok_or(L2capError::PsmNotRegistered)?;
        registration.event_callback = callback;
        Ok(())
    }

    /// Ask for a channel to `psm` on `peer`. Brings the link up first when
    /// needed. The outcome arrives as `Connected` or `OpenFailed`.
    pub fn channel_open_request(&self, psm: PSM, peer: BdAddr) -> L2capResult<ChannelId> {
        self.run(|node| node.open_channel(psm, peer, Instant::now()))
    }

    /// Close a channel. Completion arrives as `Disconnected` (or
    /// `OpenFailed` when the channel never opened).
    pub fn channel_close(&self, cid: ChannelId) -> L2capResult<()> {
        self.run(|node| node.close_channel(cid, Instant::now()))
    }

    /// Send one SDU on an open channel
    pub fn channel_send(&self, cid: ChannelId, data: &[u8]) -> L2capResult<()> {
        self.run(|node| node.send_data(cid, data))
    }

    /// Accept a channel announced by `ConnectionRequest`
    pub fn channel_accept(&self, cid: ChannelId) -> L2capResult<()> {
        self.run(|node| node.accept_channel(cid, Instant::now()))
    }

    /// Refuse a channel announced by `ConnectionRequest` with `result`
    pub fn channel_reject(&self, cid: ChannelId, result: u16) -> L2capResult<()> {
        if result == L2CAP_RESULT_SUCCESS || result == L2CAP_RESULT_PENDING {
            return Err(L2capError::InvalidParameter(format!(
                "0x{:04X} is not a refusal",
                result
            )));
        }
        self.run(|node| node.reject_channel(cid, result, Instant::now()))
    }

    /// Send a configure request with `options` on a channel being
    /// configured or already open
    pub fn channel_configure(&self, cid: ChannelId, options: ConfigOptions) -> L2capResult<()> {
        self.run(|node| node.configure_channel(cid, options, Instant::now()))
    }

    /// Send an echo request over the link to `peer`
    pub fn ping(&self, peer: BdAddr, data: &[u8], token: Token) -> L2capResult<()> {
        if data.len() > L2CAP_MAX_ECHO_DATA {
            return Err(L2capError::InvalidParameter(format!(
                "echo data of {} bytes exceeds {}",
                data.len(),
                L2CAP_MAX_ECHO_DATA
            )));
        }
        let message = |identifier| SignalingMessage::EchoRequest {
            identifier,
            data: data.to_vec(),
        };
        self.run(|node| node.request_on_link(peer, token, message, Instant::now()))
    }

    /// Send an information request over the link to `peer`
    pub fn get_info(&self, peer: BdAddr, info_type: u16, token: Token) -> L2capResult<()> {
        let message = |identifier| SignalingMessage::InformationRequest {
            identifier,
            info_type,
        };
        self.run(|node| node.request_on_link(peer, token, message, Instant::now()))
    }

    /// The lower layer brought the link to `peer` up
    pub fn on_lower_connected(&self, peer: BdAddr, handle: u16) {
        self.run(|node| node.link_connected(peer, handle, Instant::now()))
    }

    /// The link to `peer` could not be brought up
    pub fn on_lower_connect_failed(&self, peer: BdAddr, status: u8) {
        self.run(|node| node.link_connect_failed(peer, status))
    }

    /// `peer` is bringing a link up towards us
    pub fn on_lower_connection_indication(&self, peer: BdAddr) {
        self.run(|node| node.link_indication(peer, Instant::now()))
    }

    /// An established link went down
    pub fn on_lower_disconnected(&self, handle: u16, reason: u8) {
        self.run(|node| node.link_disconnected(handle, reason))
    }

    /// A complete L2CAP frame arrived on `handle`
    pub fn on_lower_pdu_received(&self, handle: u16, pdu: &[u8]) {
        self.run(|node| node.pdu_received(handle, pdu, Instant::now()))
    }

    /// Fire every timer due at `now`
    pub fn process_timeouts_at(&self, now: Instant) {
        self.run(|node| node.process_timeouts(now))
    }

    /// Fire every timer due now
    pub fn process_timeouts(&self) {
        self.process_timeouts_at(Instant::now())
    }

    /// When the earliest armed timer is due
    pub fn next_timeout(&self) -> Option<Instant> {
        lock(&self.node).timers.next_deadline()
    }

    pub fn connection_state(&self, peer: BdAddr) -> Option<ConnectionState> {
        let node = lock(&self.node);
        node.connection_by_addr(peer)
            .and_then(|id| node.connections.get(&id))
            .map(Connection::state)
    }

    pub fn channel_state(&self, cid: ChannelId) -> Option<L2capChannelState> {
        lock(&self.node).channels.get(&cid).map(L2capChannel::state)
    }

    pub fn channel_info(&self, cid: ChannelId) -> Option<ChannelInfo> {
        lock(&self.node).channels.get(&cid).map(L2capChannel::info)
    }

    /// Commands queued on the link to `peer`, in issue order
    pub fn pending_commands(&self, peer: BdAddr) -> Vec<CommandInfo> {
        let node = lock(&self.node);
        node.connection_by_addr(peer)
            .and_then(|id| node.connections.get(&id))
            .map(|con| con.commands().map(Command::info).collect())
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.node).connections.len()
    }

    pub fn channel_count(&self) -> usize {
        lock(&self.node).channels.len()
    }

    /// Number of armed timers
    pub fn timer_count(&self) -> usize {
        lock(&self.node).timers.len()
    }

    fn run<R>(&self, f: impl FnOnce(&mut NodeState) -> R) -> R {
        let (result, actions) = {
            let mut node = lock(&self.node);
            let result = f(&mut node);
            (result, std::mem::take(&mut node.outbox))
        };
        self.flush(actions);
        result
    }

    fn flush(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::OpenLink(peer) => {
                    if let Err(err) = self.lower.open_connection(peer) {
                        warn!("Failed to open link to {}: {}", peer, err);
                        self.on_lower_connect_failed(peer, link_status(&err));
                    }
                }
                Action::AcceptLink(peer) => {
                    if let Err(err) = self.lower.accept_connection(peer) {
                        warn!("Failed to accept link from {}: {}", peer, err);
                        self.on_lower_connect_failed(peer, link_status(&err));
                    }
                }
                Action::CloseLink(handle) => {
                    if let Err(err) = self.lower.close_connection(handle) {
                        warn!("Failed to close link 0x{:04X}: {}", handle, err);
                    }
                }
                Action::Send(handle, pdu) => {
                    trace!("TX 0x{:04X}: {}", handle, hex::encode(&pdu));
                    if let Err(err) = self.lower.send_pdu(handle, &pdu) {
                        warn!("Failed to send on link 0x{:04X}: {}", handle, err);
                    }
                }
                Action::Notify(callback, event) => {
                    lock(&self.events).push_back((callback, event));
                }
            }
        }
        self.dispatch_events();
    }

    /// Deliver queued events. A callback that re-enters the manager only
    /// queues; the outermost dispatcher delivers.
    fn dispatch_events(&self) {
        loop {
            if self.dispatching.swap(true, Ordering::AcqRel) {
                return;
            }

            loop {
                let next = lock(&self.events).pop_front();
                match next {
                    Some((callback, event)) => self.notify_event_handlers(callback, event),
                    None => break,
                }
            }

            self.dispatching.store(false, Ordering::Release);
            if lock(&self.events).is_empty() {
                return;
            }
        }
    }

    /// Notify event handlers of a channel event
    fn notify_event_handlers(&self, callback: Option<ChannelEventCallback>, event: ChannelEvent) {
        // Fall back to global event callback
        let callback = callback.or_else(|| lock(&self.global_event_callback).clone());

        match callback {
            Some(callback) => {
                let mut callback = lock(&callback);
                if let Err(err) = (*callback)(event) {
                    warn!("Event callback failed: {}", err);
                }
            }
            None => debug!("No handler for {:?}", event),
        }
    }
}

impl NodeState {
    fn notify(&mut self, psm: Option<PSM>, event: ChannelEvent) {
        let callback = psm
            .and_then(|psm| self.psm_registrations.get(&psm.value()))
            .and_then(|registration| registration.event_callback.clone());
        self.outbox.push(Action::Notify(callback, event));
    }

    fn connection_by_addr(&self, peer: BdAddr) -> Option<ConnectionId> {
        self.connections
            .values()
            .find(|con| con.peer() == peer)
            .map(Connection::id)
    }

    fn connection_by_handle(&self, handle: u16) -> Option<ConnectionId> {
        self.connections
            .values()
            .find(|con| con.handle() == Some(handle))
            .map(Connection::id)
    }

    fn has_channels(&self, con_id: ConnectionId) -> bool {
        self.channels.values().any(|ch| ch.connection() == con_id)
    }

    /// Create a connection waiting for the lower layer. The caller asks for
    /// the link with [`request_link`](Self::request_link).
    fn new_connection(&mut self, peer: BdAddr, origin: Origin, now: Instant) -> ConnectionId {
        let id = ConnectionId(self.next_connection_id);
        self.next_connection_id += 1;

        let mut con = Connection::new(id, peer, origin);
        con.set_state(ConnectionState::WaitLowerConfirm);
        self.connections.insert(id, con);
        debug!("{} to {}: {} -> {}", id, peer, ConnectionState::Closed, ConnectionState::WaitLowerConfirm);

        let timeout = self.config.connect_timeout;
        if let Err(err) = self.arm_connection_timer(id, timeout, now) {
            warn!("{}: {}", id, err);
        }

        id
    }

    fn request_link(&mut self, con_id: ConnectionId) {
        if let Some(con) = self.connections.get(&con_id) {
            self.outbox.push(match con.origin() {
                Origin::Local => Action::OpenLink(con.peer()),
                Origin::Remote => Action::AcceptLink(con.peer()),
            });
        }
    }

    /// Drop a connection and everything on it, reporting `reason`
    fn destroy_connection(&mut self, con_id: ConnectionId, reason: CloseReason) {
        let Some(mut con) = self.connections.remove(&con_id) else {
            return;
        };
        disarm(&mut self.timers, &mut con.timer);

        for mut cmd in con.purge_all() {
            disarm(&mut self.timers, &mut cmd.timer);
            if let CommandTarget::Connection { token } = cmd.target {
                self.notify(None, ChannelEvent::RequestFailed { token, reason });
            }
        }

        let cids: Vec<ChannelId> = self
            .channels
            .values()
            .filter(|ch| ch.connection() == con_id)
            .map(L2capChannel::local_cid)
            .collect();
        for cid in cids {
            self.drop_channel(cid, Some(reason));
        }

        info!("Connection {} to {} closed: {}", con_id, con.peer(), reason);
    }

    /// Close a link we no longer need
    fn close_connection(&mut self, con_id: ConnectionId) {
        if let Some(handle) = self.connections.get(&con_id).and_then(Connection::handle) {
            self.outbox.push(Action::CloseLink(handle));
        }
        self.destroy_connection(con_id, CloseReason::LocalRequest);
    }

    /// Close an open connection without channels or commands, or start its
    /// idle timer when one is configured
    fn release_if_idle(&mut self, con_id: ConnectionId, now: Instant) {
        let Some(con) = self.connections.get(&con_id) else {
            return;
        };
        if !con.is_open() || con.has_commands() || self.has_channels(con_id) {
            return;
        }

        match self.config.idle_disconnect_timeout {
            Some(timeout) => {
                if con.timer.is_none() {
                    debug!("{} idle, closing in {:?}", con_id, timeout);
                    if let Err(err) = self.arm_connection_timer(con_id, timeout, now) {
                        warn!("{}: {}", con_id, err);
                    }
                }
            }
            None => self.close_connection(con_id),
        }
    }

    fn cancel_idle_timer(&mut self, con_id: ConnectionId) {
        if let Some(con) = self.connections.get_mut(&con_id) {
            if con.is_open() {
                disarm(&mut self.timers, &mut con.timer);
            }
        }
    }

    fn arm_connection_timer(
        &mut self,
        con_id: ConnectionId,
        timeout: Duration,
        now: Instant,
    ) -> L2capResult<()> {
        let con = self
            .connections
            .get_mut(&con_id)
            .ok_or(L2capError::NotConnected)?;
        if con.timer.is_some() {
            return Err(L2capError::TimerAlreadyArmed);
        }
        let deadline = deadline(now, timeout)?;
        con.timer = Some(self.timers.arm(TimerTarget::Connection(con_id), deadline));
        Ok(())
    }

    fn arm_command_timer(
        &mut self,
        con_id: ConnectionId,
        ident: SignalId,
        timeout: Duration,
        now: Instant,
    ) -> L2capResult<()> {
        let cmd = self
            .connections
            .get_mut(&con_id)
            .and_then(|con| con.find_by_ident_mut(ident))
            .ok_or(L2capError::InvalidState)?;
        if cmd.timer.is_some() {
            return Err(L2capError::TimerAlreadyArmed);
        }
        let deadline = deadline(now, timeout)?;
        cmd.timer = Some(self.timers.arm(TimerTarget::Command(con_id, ident), deadline));
        Ok(())
    }

    /// Queue a request on a connection. It goes out now if the link is up,
    /// otherwise once it comes up.
    fn issue_command(
        &mut self,
        con_id: ConnectionId,
        target: CommandTarget,
        build: impl FnOnce(SignalId) -> SignalingMessage,
        now: Instant,
    ) -> L2capResult<SignalId> {
        let con = self
            .connections
            .get_mut(&con_id)
            .ok_or(L2capError::NotConnected)?;
        let ident = con
            .next_command_ident()
            .ok_or(L2capError::ResourceLimitReached)?;
        con.enqueue(Command::new(build(ident), target));
        let open = con.is_open();

        self.cancel_idle_timer(con_id);
        if open {
            self.transmit_command(con_id, ident, now);
        }

        Ok(ident)
    }

    fn transmit_command(&mut self, con_id: ConnectionId, ident: SignalId, now: Instant) {
        let Some(con) = self.connections.get_mut(&con_id) else {
            return;
        };
        let Some(handle) = con.handle() else {
            return;
        };
        let Some(cmd) = con.find_by_ident_mut(ident) else {
            return;
        };

        cmd.pending = true;
        self.outbox.push(Action::Send(handle, cmd.pdu()));

        let timeout = self.config.rtx_timeout;
        if let Err(err) = self.arm_command_timer(con_id, ident, timeout, now) {
            warn!("{} command 0x{:02X}: {}", con_id, ident, err);
        }
    }

    /// Send a response or reject; those are not tracked
    fn send_signal(&mut self, con_id: ConnectionId, message: SignalingMessage) {
        match self.connections.get(&con_id).and_then(Connection::handle) {
            Some(handle) => self.outbox.push(Action::Send(handle, message.to_packet().to_bytes())),
            None => warn!("{} has no link for {:?}", con_id, message),
        }
    }

    fn new_channel(
        &mut self,
        con_id: ConnectionId,
        psm: PSM,
        origin: Origin,
    ) -> L2capResult<ChannelId> {
        let channels = &self.channels;
        let cid = self
            .cids
            .next(|cid| channels.contains_key(&cid))
            .ok_or(L2capError::ResourceLimitReached)?;

        let channel = L2capChannel::new(cid, con_id, psm, origin, &self.config);
        self.channels.insert(cid, channel);
        self.cancel_idle_timer(con_id);

        Ok(cid)
    }

    fn set_channel_state(&mut self, cid: ChannelId, state: L2capChannelState) {
        if let Some(channel) = self.channels.get_mut(&cid) {
            debug!("Channel 0x{:04X}: {} -> {}", cid, channel.state(), state);
            channel.set_state(state);
        }
    }

    /// Remove a channel and its commands. With a reason the upper layer is
    /// told.
    fn drop_channel(&mut self, cid: ChannelId, reason: Option<CloseReason>) -> Option<ConnectionId> {
        let channel = self.channels.remove(&cid)?;
        let con_id = channel.connection();

        if let Some(con) = self.connections.get_mut(&con_id) {
            for mut cmd in con.purge_all_for_channel(cid) {
                disarm(&mut self.timers, &mut cmd.timer);
            }
        }

        if let Some(reason) = reason {
            let psm = channel.psm();
            let event = if channel.origin() == Origin::Local && !channel.open_reported() {
                ChannelEvent::OpenFailed { cid, psm, reason }
            } else {
                ChannelEvent::Disconnected { cid, psm, reason }
            };
            self.notify(Some(psm), event);
        }

        info!("Channel 0x{:04X} ({}) closed: {:?}", cid, channel.psm(), reason);
        Some(con_id)
    }

    fn destroy_channel(&mut self, cid: ChannelId, reason: Option<CloseReason>, now: Instant) {
        if let Some(con_id) = self.drop_channel(cid, reason) {
            self.release_if_idle(con_id, now);
        }
    }

    fn report_open(&mut self, cid: ChannelId) {
        let Some(channel) = self.channels.get_mut(&cid) else {
            return;
        };
        if channel.open_reported() {
            return;
        }
        channel.set_open_reported();
        let psm = channel.psm();
        info!("Channel 0x{:04X} ({}) open, remote 0x{:04X}", cid, psm, channel.remote_cid());
        self.notify(Some(psm), ChannelEvent::Connected { cid, psm });
    }

    /// Both sides agreed on the channel; configure it or open it directly
    fn enter_connected(&mut self, cid: ChannelId, now: Instant) {
        if !self.config.auto_configure {
            self.set_channel_state(cid, L2capChannelState::Open);
            self.report_open(cid);
            return;
        }

        self.set_channel_state(cid, L2capChannelState::Config);
        let Some(options) = self.channels.get(&cid).map(L2capChannel::local_options) else {
            return;
        };
        if let Err(err) = self.configure_channel(cid, options, now) {
            warn!("Channel 0x{:04X}: configure request failed: {}", cid, err);
            self.destroy_channel(cid, Some(CloseReason::NoResources), now);
        }
    }

    fn open_channel(&mut self, psm: PSM, peer: BdAddr, now: Instant) -> L2capResult<ChannelId> {
        if !psm.is_valid() {
            return Err(L2capError::InvalidParameter("Invalid PSM".into()));
        }

        let (con_id, created) = match self.connection_by_addr(peer) {
            Some(id) => (id, false),
            None => (self.new_connection(peer, Origin::Local, now), true),
        };

        let cid = match self.new_channel(con_id, psm, Origin::Local) {
            Ok(cid) => cid,
            Err(err) => {
                if created {
                    self.destroy_connection(con_id, CloseReason::NoResources);
                }
                return Err(err);
            }
        };
        self.set_channel_state(cid, L2capChannelState::WaitConnect);

        let request = |identifier| SignalingMessage::ConnectionRequest {
            identifier,
            psm,
            source_cid: cid,
        };
        if let Err(err) = self.issue_command(con_id, CommandTarget::Channel { cid }, request, now) {
            self.drop_channel(cid, None);
            self.release_if_idle(con_id, now);
            return Err(err);
        }

        if created {
            self.request_link(con_id);
        }

        debug!("Channel 0x{:04X} requested for {} on {}", cid, psm, peer);
        Ok(cid)
    }

    fn close_channel(&mut self, cid: ChannelId, now: Instant) -> L2capResult<()> {
        let channel = self.channels.get(&cid).ok_or(L2capError::ChannelNotFound)?;

        match channel.state() {
            L2capChannelState::Closed | L2capChannelState::WaitConnect => {
                let reason = if channel.open_reported() {
                    CloseReason::LocalRequest
                } else {
                    CloseReason::Cancelled
                };
                self.destroy_channel(cid, Some(reason), now);
            }
            L2capChannelState::WaitConnectRsp => {
                self.refuse_request(cid, L2CAP_RESULT_NO_RESOURCES);
                self.destroy_channel(cid, Some(CloseReason::LocalRequest), now);
            }
            L2capChannelState::Config | L2capChannelState::Open => {
                self.start_disconnect(cid, CloseReason::LocalRequest, now);
            }
            L2capChannelState::WaitDisconnect => return Err(L2capError::InvalidState),
        }

        Ok(())
    }

    /// Send a disconnect request and wait for the answer. Earlier commands of
    /// the channel are abandoned.
    fn start_disconnect(&mut self, cid: ChannelId, reason: CloseReason, now: Instant) {
        let Some(channel) = self.channels.get_mut(&cid) else {
            return;
        };
        channel.set_close_reason(reason);
        let con_id = channel.connection();
        let (local, remote) = (channel.local_cid(), channel.remote_cid());

        if let Some(con) = self.connections.get_mut(&con_id) {
            for mut cmd in con.purge_all_for_channel(cid) {
                disarm(&mut self.timers, &mut cmd.timer);
            }
        }
        self.set_channel_state(cid, L2capChannelState::WaitDisconnect);

        let request = |identifier| SignalingMessage::DisconnectionRequest {
            identifier,
            destination_cid: remote,
            source_cid: local,
        };
        if let Err(err) = self.issue_command(con_id, CommandTarget::Channel { cid }, request, now) {
            warn!("Channel 0x{:04X}: disconnect request failed: {}", cid, err);
            self.destroy_channel(cid, Some(reason), now);
        }
    }

    fn send_data(&mut self, cid: ChannelId, data: &[u8]) -> L2capResult<()> {
        let channel = self.channels.get(&cid).ok_or(L2capError::ChannelNotFound)?;
        channel.check_send(data.len())?;

        let handle = self
            .connections
            .get(&channel.connection())
            .and_then(Connection::handle)
            .ok_or(L2capError::NotConnected)?;
        let packet = L2capPacket::new(channel.remote_cid(), data.to_vec());
        self.outbox.push(Action::Send(handle, packet.to_bytes()));

        Ok(())
    }

    /// Answer a held connection request with a refusal
    fn refuse_request(&mut self, cid: ChannelId, result: u16) {
        let Some(channel) = self.channels.get_mut(&cid) else {
            return;
        };
        let Some(identifier) = channel.pending_ident() else {
            return;
        };
        channel.set_pending_ident(None);
        let (con_id, remote) = (channel.connection(), channel.remote_cid());

        self.send_signal(
            con_id,
            SignalingMessage::ConnectionResponse {
                identifier,
                destination_cid: L2CAP_NULL_CID,
                source_cid: remote,
                result,
                status: L2CAP_STATUS_NO_INFO,
            },
        );
    }

    fn accept_channel(&mut self, cid: ChannelId, now: Instant) -> L2capResult<()> {
        let channel = self.channels.get_mut(&cid).ok_or(L2capError::ChannelNotFound)?;
        if channel.state() != L2capChannelState::WaitConnectRsp {
            return Err(L2capError::InvalidState);
        }
        let identifier = channel.pending_ident().ok_or(L2capError::InvalidState)?;
        channel.set_pending_ident(None);
        let (con_id, remote) = (channel.connection(), channel.remote_cid());

        self.send_signal(
            con_id,
            SignalingMessage::ConnectionResponse {
                identifier,
                destination_cid: cid,
                source_cid: remote,
                result: L2CAP_RESULT_SUCCESS,
                status: L2CAP_STATUS_NO_INFO,
            },
        );
        self.enter_connected(cid, now);

        Ok(())
    }

    fn reject_channel(&mut self, cid: ChannelId, result: u16, now: Instant) -> L2capResult<()> {
        let channel = self.channels.get(&cid).ok_or(L2capError::ChannelNotFound)?;
        if channel.state() != L2capChannelState::WaitConnectRsp {
            return Err(L2capError::InvalidState);
        }

        self.refuse_request(cid, result);
        self.destroy_channel(cid, None, now);

        Ok(())
    }

    fn configure_channel(
        &mut self,
        cid: ChannelId,
        options: ConfigOptions,
        now: Instant,
    ) -> L2capResult<()> {
        let channel = self.channels.get(&cid).ok_or(L2capError::ChannelNotFound)?;
        if !matches!(
            channel.state(),
            L2capChannelState::Config | L2capChannelState::Open
        ) {
            return Err(L2capError::InvalidState);
        }
        if let Some(mtu) = options.mtu {
            if mtu < L2CAP_MIN_MTU {
                return Err(L2capError::InvalidParameter(format!("MTU {} below minimum", mtu)));
            }
        }

        let (con_id, remote) = (channel.connection(), channel.remote_cid());
        let request = |identifier| SignalingMessage::ConfigureRequest {
            identifier,
            destination_cid: remote,
            flags: 0,
            options,
        };
        self.issue_command(con_id, CommandTarget::Channel { cid }, request, now)?;

        Ok(())
    }

    fn request_on_link(
        &mut self,
        peer: BdAddr,
        token: Token,
        build: impl FnOnce(SignalId) -> SignalingMessage,
        now: Instant,
    ) -> L2capResult<()> {
        let con_id = self
            .connection_by_addr(peer)
            .filter(|id| self.connections.get(id).is_some_and(Connection::is_open))
            .ok_or(L2capError::NotConnected)?;

        self.issue_command(con_id, CommandTarget::Connection { token }, build, now)?;
        Ok(())
    }

    fn link_connected(&mut self, peer: BdAddr, handle: u16, now: Instant) {
        let Some(con_id) = self.connection_by_addr(peer) else {
            warn!("Link 0x{:04X} up for unknown peer {}", handle, peer);
            return;
        };
        let Some(con) = self.connections.get_mut(&con_id) else {
            return;
        };
        if con.state() != ConnectionState::WaitLowerConfirm {
            warn!("{}: unexpected link confirmation in {}", con_id, con.state());
            return;
        }

        disarm(&mut self.timers, &mut con.timer);
        con.set_handle(handle);
        con.set_state(ConnectionState::Open);
        let origin = con.origin();
        let unsent: Vec<SignalId> = con
            .commands()
            .filter(|cmd| !cmd.pending)
            .map(|cmd| cmd.ident)
            .collect();
        info!("Connection {} to {} open, handle 0x{:04X}", con_id, peer, handle);

        for ident in unsent {
            self.transmit_command(con_id, ident, now);
        }

        match origin {
            Origin::Local => self.release_if_idle(con_id, now),
            // The peer opened the link; give it time to ask for a channel
            Origin::Remote => {
                if let Some(timeout) = self.config.idle_disconnect_timeout {
                    if !self.has_channels(con_id) {
                        if let Err(err) = self.arm_connection_timer(con_id, timeout, now) {
                            warn!("{}: {}", con_id, err);
                        }
                    }
                }
            }
        }
    }

    fn link_connect_failed(&mut self, peer: BdAddr, status: u8) {
        match self.connection_by_addr(peer) {
            Some(con_id)
                if self.connections.get(&con_id).map(Connection::state)
                    == Some(ConnectionState::WaitLowerConfirm) =>
            {
                warn!("Link to {} failed: 0x{:02X}", peer, status);
                self.destroy_connection(con_id, CloseReason::LinkFailed(status));
            }
            _ => warn!("Link failure for {} without pending connection", peer),
        }
    }

    fn link_indication(&mut self, peer: BdAddr, now: Instant) {
        if let Some(con_id) = self.connection_by_addr(peer) {
            warn!("Ignoring link indication from {}: {} exists", peer, con_id);
            return;
        }

        let con_id = self.new_connection(peer, Origin::Remote, now);
        self.request_link(con_id);
        debug!("Accepting link from {} as {}", peer, con_id);
    }

    fn link_disconnected(&mut self, handle: u16, reason: u8) {
        match self.connection_by_handle(handle) {
            Some(con_id) => self.destroy_connection(con_id, CloseReason::LinkLost(reason)),
            None => warn!("Disconnect for unknown link 0x{:04X}", handle),
        }
    }

    fn pdu_received(&mut self, handle: u16, pdu: &[u8], now: Instant) {
        trace!("RX 0x{:04X}: {}", handle, hex::encode(pdu));

        let Some(con_id) = self
            .connection_by_handle(handle)
            .filter(|id| self.connections.get(id).is_some_and(Connection::is_open))
        else {
            warn!("Dropping PDU on unknown link 0x{:04X}", handle);
            return;
        };

        let packet = match L2capPacket::parse(pdu) {
            Ok(packet) => packet,
            Err(err) => {
                warn!("Dropping malformed PDU on 0x{:04X}: {}", handle, err);
                return;
            }
        };

        match packet.header.channel_id {
            L2CAP_SIGNALING_CID => {
                for message in SignalingMessage::parse_frame(&packet.payload) {
                    match message {
                        Ok(message) => self.handle_signal(con_id, message, now),
                        Err(err) => warn!("{}: bad signaling command: {}", con_id, err),
                    }
                }
            }
            L2CAP_CONNECTIONLESS_CID => {
                debug!("{}: connectionless data not supported, dropped", con_id);
            }
            cid if cid >= L2CAP_DYNAMIC_CID_MIN => self.handle_data(con_id, cid, packet.payload),
            cid => warn!("{}: PDU for reserved CID 0x{:04X} dropped", con_id, cid),
        }
    }

    fn handle_data(&mut self, con_id: ConnectionId, cid: ChannelId, data: Vec<u8>) {
        let Some(channel) = self
            .channels
            .get(&cid)
            .filter(|ch| ch.connection() == con_id)
        else {
            warn!("{}: data for unknown channel 0x{:04X}", con_id, cid);
            return;
        };
        if channel.state() != L2capChannelState::Open {
            warn!("Channel 0x{:04X}: data in {} dropped", cid, channel.state());
            return;
        }
        if data.len() > channel.incoming_mtu() as usize {
            warn!(
                "Channel 0x{:04X}: {} bytes exceed MTU {}",
                cid,
                data.len(),
                channel.incoming_mtu()
            );
            return;
        }

        let psm = channel.psm();
        self.notify(Some(psm), ChannelEvent::Data { cid, data });
    }

    fn handle_signal(&mut self, con_id: ConnectionId, message: SignalingMessage, now: Instant) {
        if message.is_response() {
            self.handle_response(con_id, message, now);
            return;
        }

        match message {
            SignalingMessage::ConnectionRequest {
                identifier,
                psm,
                source_cid,
            } => self.handle_connection_request(con_id, identifier, psm, source_cid, now),
            SignalingMessage::ConfigureRequest {
                identifier,
                destination_cid,
                flags,
                options,
            } => self.handle_configure_request(con_id, identifier, destination_cid, flags, options),
            SignalingMessage::DisconnectionRequest {
                identifier,
                destination_cid,
                source_cid,
            } => self.handle_disconnection_request(
                con_id,
                identifier,
                destination_cid,
                source_cid,
                now,
            ),
            SignalingMessage::EchoRequest { identifier, data } => {
                self.send_signal(con_id, SignalingMessage::EchoResponse { identifier, data });
            }
            SignalingMessage::InformationRequest {
                identifier,
                info_type,
            } => self.handle_information_request(con_id, identifier, info_type),
            other => {
                debug!("{}: rejecting command 0x{:02X}", con_id, other.command_code());
                self.send_signal(
                    con_id,
                    SignalingMessage::CommandReject {
                        identifier: other.identifier(),
                        reason: L2CAP_REJECT_NOT_UNDERSTOOD,
                        data: Vec::new(),
                    },
                );
            }
        }
    }

    fn handle_connection_request(
        &mut self,
        con_id: ConnectionId,
        identifier: SignalId,
        psm: PSM,
        source_cid: ChannelId,
        now: Instant,
    ) {
        let refuse = |result| SignalingMessage::ConnectionResponse {
            identifier,
            destination_cid: L2CAP_NULL_CID,
            source_cid,
            result,
            status: L2CAP_STATUS_NO_INFO,
        };

        let Some(policy) = self
            .psm_registrations
            .get(&psm.value())
            .map(|registration| registration.policy)
        else {
            debug!("{}: connection request for unregistered {}", con_id, psm);
            self.send_signal(con_id, refuse(L2CAP_RESULT_PSM_NOT_SUPPORTED));
            return;
        };

        if source_cid < L2CAP_DYNAMIC_CID_MIN {
            self.send_signal(con_id, refuse(L2CAP_RESULT_INVALID_SOURCE_CID));
            return;
        }
        if self
            .channels
            .values()
            .any(|ch| ch.connection() == con_id && ch.remote_cid() == source_cid)
        {
            self.send_signal(con_id, refuse(L2CAP_RESULT_SOURCE_CID_IN_USE));
            return;
        }

        let cid = match self.new_channel(con_id, psm, Origin::Remote) {
            Ok(cid) => cid,
            Err(err) => {
                warn!("{}: cannot take channel for {}: {}", con_id, psm, err);
                self.send_signal(con_id, refuse(L2CAP_RESULT_NO_RESOURCES));
                return;
            }
        };
        if let Some(channel) = self.channels.get_mut(&cid) {
            channel.set_remote_cid(source_cid);
            channel.set_pending_ident(Some(identifier));
        }
        self.set_channel_state(cid, L2capChannelState::WaitConnectRsp);

        if policy.auto_accept {
            if let Err(err) = self.accept_channel(cid, now) {
                warn!("Channel 0x{:04X}: accept failed: {}", cid, err);
            }
            return;
        }

        self.send_signal(
            con_id,
            SignalingMessage::ConnectionResponse {
                identifier,
                destination_cid: cid,
                source_cid,
                result: L2CAP_RESULT_PENDING,
                status: L2CAP_STATUS_AUTHORIZATION_PENDING,
            },
        );
        let peer = match self.connections.get(&con_id) {
            Some(con) => con.peer(),
            None => return,
        };
        self.notify(Some(psm), ChannelEvent::ConnectionRequest { cid, psm, peer });
    }

    fn handle_configure_request(
        &mut self,
        con_id: ConnectionId,
        identifier: SignalId,
        cid: ChannelId,
        flags: u16,
        options: ConfigOptions,
    ) {
        let Some(channel) = self
            .channels
            .get_mut(&cid)
            .filter(|ch| ch.connection() == con_id)
        else {
            self.reject_invalid_cid(con_id, identifier, cid, L2CAP_NULL_CID);
            return;
        };
        let remote = channel.remote_cid();
        let respond = |result, options| SignalingMessage::ConfigureResponse {
            identifier,
            source_cid: remote,
            flags: 0,
            result,
            options,
        };

        let state = channel.state();
        if !matches!(state, L2capChannelState::Config | L2capChannelState::Open) {
            debug!("Channel 0x{:04X}: configure request in {}", cid, state);
            self.send_signal(con_id, respond(L2CAP_CONF_REJECTED, ConfigOptions::default()));
            return;
        }

        if let Err(counter) = channel.check_remote_options(&options) {
            debug!("Channel 0x{:04X}: unacceptable options {:?}", cid, options);
            self.send_signal(con_id, respond(L2CAP_CONF_UNACCEPTABLE_PARAMS, counter));
            return;
        }

        channel.apply_remote_options(&options);
        let continued = flags & L2CAP_CONF_FLAG_CONTINUATION != 0;
        let done = state == L2capChannelState::Config
            && !continued
            && channel.mark_configured(ConfigFlags::IN);
        self.send_signal(con_id, respond(L2CAP_CONF_SUCCESS, ConfigOptions::default()));

        if done {
            self.set_channel_state(cid, L2capChannelState::Open);
            self.report_open(cid);
        }
    }

    fn handle_disconnection_request(
        &mut self,
        con_id: ConnectionId,
        identifier: SignalId,
        destination_cid: ChannelId,
        source_cid: ChannelId,
        now: Instant,
    ) {
        let known = self.channels.get(&destination_cid).is_some_and(|ch| {
            ch.connection() == con_id && ch.remote_cid() == source_cid
        });
        if !known {
            self.reject_invalid_cid(con_id, identifier, destination_cid, source_cid);
            return;
        }

        self.send_signal(
            con_id,
            SignalingMessage::DisconnectionResponse {
                identifier,
                destination_cid,
                source_cid,
            },
        );
        self.destroy_channel(destination_cid, Some(CloseReason::RemoteRequest), now);
    }

    fn handle_information_request(&mut self, con_id: ConnectionId, identifier: SignalId, info_type: u16) {
        let data = match info_type {
            L2CAP_INFO_CONNECTIONLESS_MTU => {
                let mut data = vec![0; 2];
                LittleEndian::write_u16(&mut data, self.config.connectionless_mtu);
                Some(data)
            }
            L2CAP_INFO_EXTENDED_FEATURES => {
                let mut data = vec![0; 4];
                LittleEndian::write_u32(&mut data, self.config.extended_features.bits());
                Some(data)
            }
            L2CAP_INFO_FIXED_CHANNELS => {
                let mut data = vec![0; 8];
                LittleEndian::write_u64(&mut data, L2CAP_FIXED_CHANNELS_MASK);
                Some(data)
            }
            _ => None,
        };

        let (result, data) = match data {
            Some(data) => (L2CAP_INFO_SUCCESS, data),
            None => (L2CAP_INFO_NOT_SUPPORTED, Vec::new()),
        };
        self.send_signal(
            con_id,
            SignalingMessage::InformationResponse {
                identifier,
                info_type,
                result,
                data,
            },
        );
    }

    fn reject_invalid_cid(
        &mut self,
        con_id: ConnectionId,
        identifier: SignalId,
        local: ChannelId,
        remote: ChannelId,
    ) {
        warn!("{}: request for invalid CID 0x{:04X}", con_id, local);
        let mut data = vec![0; 4];
        LittleEndian::write_u16(&mut data[0..2], local);
        LittleEndian::write_u16(&mut data[2..4], remote);
        self.send_signal(
            con_id,
            SignalingMessage::CommandReject {
                identifier,
                reason: L2CAP_REJECT_INVALID_CID,
                data,
            },
        );
    }

    fn handle_response(&mut self, con_id: ConnectionId, message: SignalingMessage, now: Instant) {
        let ident = message.identifier();
        let Some(con) = self.connections.get_mut(&con_id) else {
            return;
        };
        let Some(cmd) = con.find_by_ident_mut(ident) else {
            warn!("{}: unsolicited response {:?}", con_id, message);
            return;
        };
        if !cmd.pending || !cmd.is_answered_by(&message) {
            warn!(
                "{}: response {:?} does not match command 0x{:02X}",
                con_id, message, cmd.code
            );
            return;
        }

        if let SignalingMessage::ConnectionResponse {
            result: L2CAP_RESULT_PENDING,
            ..
        } = message
        {
            debug!("{}: connection request 0x{:02X} pending", con_id, ident);
            disarm(&mut self.timers, &mut cmd.timer);
            let timeout = self.config.ertx_timeout;
            if let Err(err) = self.arm_command_timer(con_id, ident, timeout, now) {
                warn!("{}: {}", con_id, err);
            }
            return;
        }

        let Some(mut cmd) = con.remove(ident) else {
            return;
        };
        disarm(&mut self.timers, &mut cmd.timer);
        self.complete_command(con_id, cmd, Outcome::Response(message), now);
    }

    /// Finish a command removed from its queue
    fn complete_command(&mut self, con_id: ConnectionId, cmd: Command, outcome: Outcome, now: Instant) {
        match cmd.target {
            CommandTarget::Channel { cid } => match cmd.code {
                L2CAP_CONNECTION_REQUEST => self.connect_done(cid, outcome, now),
                L2CAP_CONFIGURE_REQUEST => self.configure_done(cid, cmd.request, outcome, now),
                L2CAP_DISCONNECTION_REQUEST => {
                    let reason = match outcome {
                        Outcome::Failed(reason) => reason,
                        Outcome::Response(_) => self
                            .channels
                            .get(&cid)
                            .and_then(L2capChannel::close_reason)
                            .unwrap_or(CloseReason::LocalRequest),
                    };
                    self.destroy_channel(cid, Some(reason), now);
                }
                code => warn!("Channel 0x{:04X}: stray command 0x{:02X}", cid, code),
            },
            CommandTarget::Connection { token } => {
                let event = match outcome {
                    Outcome::Response(SignalingMessage::EchoResponse { data, .. }) => {
                        ChannelEvent::EchoResponse { token, data }
                    }
                    Outcome::Response(SignalingMessage::InformationResponse {
                        info_type,
                        result,
                        data,
                        ..
                    }) => ChannelEvent::InfoResponse {
                        token,
                        info_type,
                        result,
                        data,
                    },
                    Outcome::Response(SignalingMessage::CommandReject { reason, .. }) => {
                        ChannelEvent::RequestFailed {
                            token,
                            reason: CloseReason::Rejected(reason),
                        }
                    }
                    Outcome::Response(other) => {
                        warn!("{}: unexpected answer {:?}", con_id, other);
                        ChannelEvent::RequestFailed {
                            token,
                            reason: CloseReason::Rejected(L2CAP_REJECT_NOT_UNDERSTOOD),
                        }
                    }
                    Outcome::Failed(reason) => ChannelEvent::RequestFailed { token, reason },
                };
                self.notify(None, event);
            }
        }

        self.release_if_idle(con_id, now);
    }

    fn connect_done(&mut self, cid: ChannelId, outcome: Outcome, now: Instant) {
        let Some(channel) = self.channels.get_mut(&cid) else {
            return;
        };
        if channel.state() != L2capChannelState::WaitConnect {
            debug!("Channel 0x{:04X}: connect answer in {}", cid, channel.state());
            return;
        }

        match outcome {
            Outcome::Response(SignalingMessage::ConnectionResponse {
                destination_cid,
                result: L2CAP_RESULT_SUCCESS,
                ..
            }) => {
                channel.set_remote_cid(destination_cid);
                self.enter_connected(cid, now);
            }
            Outcome::Response(SignalingMessage::ConnectionResponse { result, .. })
            | Outcome::Response(SignalingMessage::CommandReject { reason: result, .. }) => {
                debug!("Channel 0x{:04X}: connection refused 0x{:04X}", cid, result);
                self.destroy_channel(cid, Some(CloseReason::Rejected(result)), now);
            }
            Outcome::Response(other) => warn!("Channel 0x{:04X}: unexpected {:?}", cid, other),
            Outcome::Failed(reason) => self.destroy_channel(cid, Some(reason), now),
        }
    }

    fn configure_done(
        &mut self,
        cid: ChannelId,
        request: SignalingMessage,
        outcome: Outcome,
        now: Instant,
    ) {
        let Some(channel) = self.channels.get_mut(&cid) else {
            return;
        };
        let state = channel.state();
        if !matches!(state, L2capChannelState::Config | L2capChannelState::Open) {
            debug!("Channel 0x{:04X}: configure answer in {}", cid, state);
            return;
        }
        let psm = channel.psm();

        let reason = match outcome {
            Outcome::Response(SignalingMessage::ConfigureResponse {
                result: L2CAP_CONF_SUCCESS,
                ..
            }) => {
                let SignalingMessage::ConfigureRequest { options, .. } = request else {
                    return;
                };
                channel.apply_local_options(&options);
                let done = state == L2capChannelState::Config
                    && channel.mark_configured(ConfigFlags::OUT);
                self.notify(Some(psm), ChannelEvent::ConfigChanged { cid, config: options });
                if done {
                    self.set_channel_state(cid, L2capChannelState::Open);
                    self.report_open(cid);
                }
                return;
            }
            Outcome::Response(SignalingMessage::ConfigureResponse { result, .. })
            | Outcome::Response(SignalingMessage::CommandReject { reason: result, .. }) => {
                CloseReason::ConfigRejected(result)
            }
            Outcome::Response(other) => {
                warn!("Channel 0x{:04X}: unexpected {:?}", cid, other);
                return;
            }
            Outcome::Failed(reason) => reason,
        };

        self.notify(Some(psm), ChannelEvent::ConfigFailed { cid, reason });
        match (state, reason) {
            (_, CloseReason::Timeout) => self.destroy_channel(cid, Some(reason), now),
            (L2capChannelState::Config, _) => self.start_disconnect(cid, reason, now),
            _ => {}
        }
    }

    fn process_timeouts(&mut self, now: Instant) {
        for (handle, target) in self.timers.expired(now) {
            match target {
                TimerTarget::Connection(con_id) => self.connection_timeout(con_id, handle),
                TimerTarget::Command(con_id, ident) => self.command_timeout(con_id, ident, handle, now),
            }
        }
    }

    fn connection_timeout(&mut self, con_id: ConnectionId, handle: TimerHandle) {
        let Some(con) = self.connections.get_mut(&con_id) else {
            return;
        };
        if con.timer != Some(handle) {
            return;
        }
        con.timer = None;

        match con.state() {
            ConnectionState::WaitLowerConfirm => {
                warn!("{}: link to {} not confirmed in time", con_id, con.peer());
                self.destroy_connection(con_id, CloseReason::LinkFailed(LINK_REASON_TIMEOUT));
            }
            ConnectionState::Open => {
                debug!("{}: idle timer expired", con_id);
                if !con.has_commands() && !self.has_channels(con_id) {
                    self.close_connection(con_id);
                }
            }
            ConnectionState::Closed => {}
        }
    }

    fn command_timeout(
        &mut self,
        con_id: ConnectionId,
        ident: SignalId,
        handle: TimerHandle,
        now: Instant,
    ) {
        let max_retransmits = self.config.max_retransmits;
        let Some(con) = self.connections.get_mut(&con_id) else {
            return;
        };
        let Some(link) = con.handle() else {
            return;
        };
        let Some(cmd) = con.find_by_ident_mut(ident) else {
            return;
        };
        if cmd.timer != Some(handle) {
            return;
        }
        cmd.timer = None;

        if cmd.retransmits < max_retransmits {
            cmd.retransmits += 1;
            debug!(
                "{}: command 0x{:02X} timed out, retransmission {}",
                con_id, ident, cmd.retransmits
            );
            self.outbox.push(Action::Send(link, cmd.pdu()));
            let timeout = self.config.rtx_timeout;
            if let Err(err) = self.arm_command_timer(con_id, ident, timeout, now) {
                warn!("{}: {}", con_id, err);
            }
            return;
        }

        warn!("{}: command 0x{:02X} failed after {} retransmissions", con_id, ident, cmd.retransmits);
        if let Some(cmd) = con.remove(ident) {
            self.complete_command(con_id, cmd, Outcome::Failed(CloseReason::Timeout), now);
        }
    }
}
