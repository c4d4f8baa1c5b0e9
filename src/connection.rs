use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace};
use crate::ack_engine::AckEngine;
use crate::buffers::buffer_pool::{BufferPool, PooledBuf};
use crate::config::PeerConfig;
use crate::control_messages::{ControlMessage, DisconnectReason};
use crate::handshake::ConnectKeyValidator;
use crate::metrics::ConnectionMetrics;
use crate::peer_events::{Channel, NotifyResolution, NotifyToken};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// client side, waiting for the server to accept
    Connecting,
    Connected,
    /// terminal
    Disconnected,
}

/// A session with a single remote endpoint.
///
/// Application traffic sent while the connection is still `Connecting` is held back until the
///  server accepts. Command packets bypass the reliability engine and go out regardless of state.
pub struct Connection {
    config: Arc<PeerConfig>,
    addr: SocketAddr,
    state: ConnectionState,
    engine: AckEngine,
    buffer_pool: BufferPool,
    control_outbox: VecDeque<PooledBuf>,

    /// for the disconnect timeout
    last_received: Instant,

    connect_attempts: u32,
    last_connect_attempt: Option<Instant>,
}

impl Connection {
    fn new(config: Arc<PeerConfig>, buffer_pool: BufferPool, addr: SocketAddr, state: ConnectionState, now: Instant) -> Connection {
        Connection {
            engine: AckEngine::new(config.clone(), buffer_pool.clone(), now),
            config,
            addr,
            state,
            buffer_pool,
            control_outbox: Default::default(),
            last_received: now,
            connect_attempts: 0,
            last_connect_attempt: None,
        }
    }

    pub fn new_connecting(config: Arc<PeerConfig>, buffer_pool: BufferPool, addr: SocketAddr, now: Instant) -> Connection {
        Self::new(config, buffer_pool, addr, ConnectionState::Connecting, now)
    }

    pub fn new_connected(config: Arc<PeerConfig>, buffer_pool: BufferPool, addr: SocketAddr, now: Instant) -> Connection {
        Self::new(config, buffer_pool, addr, ConnectionState::Connected, now)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn metrics(&self) -> &ConnectionMetrics {
        self.engine.metrics()
    }

    pub fn num_unacked_reliable_messages(&self) -> usize {
        self.engine.num_unacked_reliable_messages()
    }

    pub fn send_unreliable(&mut self, payload: &[u8], now: Instant) -> anyhow::Result<()> {
        if self.state == ConnectionState::Disconnected {
            trace!("unreliable send on disconnected connection to {:?} - ignoring", self.addr);
            return Ok(());
        }
        self.engine.send_unreliable(payload, now)
    }

    /// returns `None` if the connection is disconnected
    pub fn send_notify(&mut self, payload: &[u8], now: Instant) -> anyhow::Result<Option<NotifyToken>> {
        if self.state == ConnectionState::Disconnected {
            trace!("notify send on disconnected connection to {:?} - ignoring", self.addr);
            return Ok(None);
        }
        self.engine.send_notify(payload, now)
            .map(Some)
    }

    pub fn send_reliable(&mut self, payload: &[u8], now: Instant) -> anyhow::Result<()> {
        if self.state == ConnectionState::Disconnected {
            trace!("reliable send on disconnected connection to {:?} - ignoring", self.addr);
            return Ok(());
        }
        self.engine.send_reliable(payload, now)
    }

    pub(crate) fn send_control(&mut self, msg: &ControlMessage) {
        let mut buf = self.buffer_pool.get_from_pool();
        msg.ser(buf.buf_mut());
        self.control_outbox.push_back(buf);
    }

    pub(crate) fn send_connect_request(&mut self, validator: &ConnectKeyValidator, now: Instant) {
        self.connect_attempts += 1;
        self.last_connect_attempt = Some(now);
        debug!("sending connect request #{} to {:?}", self.connect_attempts, self.addr);

        let mut buf = self.buffer_pool.get_from_pool();
        validator.write_connect_request(buf.buf_mut());
        self.control_outbox.push_back(buf);
    }

    pub(crate) fn is_connect_attempt_due(&self, now: Instant) -> bool {
        match self.last_connect_attempt {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.config.connect_attempt_interval,
        }
    }

    pub(crate) fn connect_attempts(&self) -> u32 {
        self.connect_attempts
    }

    pub(crate) fn on_accepted(&mut self, now: Instant) {
        if self.state == ConnectionState::Connecting {
            info!("connection to {:?} was accepted", self.addr);
            self.state = ConnectionState::Connected;
            self.last_received = now;
        }
    }

    /// Sends a best-effort `Disconnect` to the remote peer and moves to `Disconnected`. All
    ///  queued traffic is discarded, and pending notifies resolve as lost.
    ///
    /// Applications disconnect through [crate::peer::Peer::disconnect], which also removes the
    ///  connection and raises the event.
    pub(crate) fn disconnect(&mut self, reason: DisconnectReason) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        info!("disconnecting from {:?}: {:?}", self.addr, reason);
        self.engine.shutdown();
        self.send_control(&ControlMessage::Disconnect(reason));
        self.state = ConnectionState::Disconnected;
    }

    /// Moves to `Disconnected` without notifying the remote peer, e.g. because the remote peer
    ///  disconnected or went silent
    pub(crate) fn terminate(&mut self) {
        self.engine.shutdown();
        self.state = ConnectionState::Disconnected;
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_received = now;
    }

    pub(crate) fn receive(&mut self, packet: &[u8], now: Instant) {
        self.last_received = now;
        if self.state == ConnectionState::Disconnected {
            trace!("packet for disconnected connection to {:?} - dropping", self.addr);
            return;
        }
        self.engine.receive(packet, now);
    }

    pub(crate) fn is_timed_out(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_received) > self.config.disconnect_timeout
    }

    pub(crate) fn update(&mut self, now: Instant) {
        if self.state == ConnectionState::Connected {
            self.engine.update(now);
        }
    }

    pub fn next_message(&mut self) -> Option<(Channel, PooledBuf)> {
        self.engine.next_message()
    }

    pub fn poll_notify_resolution(&mut self) -> Option<NotifyResolution> {
        self.engine.poll_notify_resolution()
    }

    /// the next packet to go on the wire
    pub(crate) fn pop_outgoing(&mut self) -> Option<PooledBuf> {
        if let Some(buf) = self.control_outbox.pop_front() {
            return Some(buf);
        }
        if self.state == ConnectionState::Connecting {
            return None;
        }
        self.engine.pop_outgoing()
    }
}
