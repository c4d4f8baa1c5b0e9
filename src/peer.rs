use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use anyhow::{anyhow, bail};
use rustc_hash::FxHashMap;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, span, trace, warn, Level};
use crate::buffers::buffer_pool::BufferPool;
use crate::config::PeerConfig;
use crate::connection::{Connection, ConnectionState};
use crate::control_messages::{ControlMessage, DisconnectReason, RejectReason};
use crate::handshake::ConnectKeyValidator;
use crate::packet_header::PacketType;
use crate::peer_events::{NotifyToken, PeerEvent};
use crate::socket::DatagramSocket;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PeerRole {
    /// bound to a well-known address, accepting connections
    Server,
    /// a single outbound connection
    Client,
}

/// Peer is where everything comes together: it owns the socket and the connections, runs the
///  connect handshake, and pumps datagrams between the socket and the connections.
///
/// A peer is driven by calling [Peer::update] (or [Peer::update_receive] and [Peer::update_sent])
///  periodically, or by [Peer::run]. Everything that happens is reported as a [PeerEvent] and
///  can be fetched with [Peer::poll_event].
///
/// Sends use the timestamp of the most recent update.
pub struct Peer {
    config: Arc<PeerConfig>,
    socket: Box<dyn DatagramSocket>,
    role: Option<PeerRole>,
    connections: FxHashMap<SocketAddr, Connection>,
    key_validator: ConnectKeyValidator,
    buffer_pool: BufferPool,
    /// one byte more than the MTU to detect oversized datagrams
    receive_buf: Vec<u8>,
    events: VecDeque<PeerEvent>,
    now: Instant,
}

impl Peer {
    pub fn new(config: PeerConfig, socket: Box<dyn DatagramSocket>) -> anyhow::Result<Peer> {
        config.validate()?;

        Ok(Peer {
            key_validator: ConnectKeyValidator::new(&config.key),
            buffer_pool: BufferPool::new(config.mtu, config.buffer_pool_size),
            receive_buf: vec![0; config.mtu + 1],
            config: Arc::new(config),
            socket,
            role: None,
            connections: Default::default(),
            events: Default::default(),
            now: Instant::now(),
        })
    }

    pub fn role(&self) -> Option<PeerRole> {
        self.role
    }

    /// a peer is active between `bind` or `connect` and `close`
    pub fn is_active(&self) -> bool {
        self.role.is_some()
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// Starts accepting connections on the given address
    pub fn bind(&mut self, addr: SocketAddr) -> anyhow::Result<()> {
        if let Some(role) = self.role {
            bail!("peer is already active as {:?}", role);
        }
        self.socket.bind(addr)?;
        info!("server listening on {:?}", addr);
        self.role = Some(PeerRole::Server);
        Ok(())
    }

    /// Starts connecting to a server. The outcome is reported as either [PeerEvent::Connected]
    ///  or [PeerEvent::ConnectionFailed].
    pub fn connect(&mut self, server_addr: SocketAddr) -> anyhow::Result<()> {
        if let Some(role) = self.role {
            bail!("peer is already active as {:?}", role);
        }

        let unspecified: IpAddr = if server_addr.is_ipv4() {
            Ipv4Addr::UNSPECIFIED.into()
        }
        else {
            Ipv6Addr::UNSPECIFIED.into()
        };
        self.socket.bind(SocketAddr::new(unspecified, 0))?;
        self.role = Some(PeerRole::Client);

        info!("connecting to {:?}", server_addr);
        let mut connection = Connection::new_connecting(self.config.clone(), self.buffer_pool.clone(), server_addr, self.now);
        connection.send_connect_request(&self.key_validator, self.now);
        self.connections.insert(server_addr, connection);
        self.flush(server_addr);
        Ok(())
    }

    /// Disconnects all connections and releases the socket. Calling this on an inactive peer
    ///  does nothing.
    pub fn close(&mut self) {
        if self.role.is_none() {
            info!("close() called on a peer that is not active - ignoring");
            return;
        }
        info!("closing peer");

        let addrs = self.connections.keys().copied().collect::<Vec<_>>();
        for addr in addrs {
            self.disconnect_locally(addr);
        }

        self.socket.close();
        self.role = None;
    }

    /// Disconnects from a remote peer, notifying it on a best-effort basis
    pub fn disconnect(&mut self, addr: SocketAddr) -> anyhow::Result<()> {
        if !self.connections.contains_key(&addr) {
            bail!("no connection to {:?}", addr);
        }
        self.disconnect_locally(addr);
        Ok(())
    }

    fn disconnect_locally(&mut self, addr: SocketAddr) {
        let Some(connection) = self.connections.get_mut(&addr) else {
            return;
        };
        let state = connection.state();
        connection.disconnect(DisconnectReason::RequestedByRemotePeer);
        self.remove_connection(addr);

        match state {
            ConnectionState::Connecting => self.events.push_back(PeerEvent::ConnectionFailed { addr, reason: RejectReason::ClosedByPeer }),
            ConnectionState::Connected => self.events.push_back(PeerEvent::Disconnected { addr, reason: DisconnectReason::RequestedByLocalPeer }),
            ConnectionState::Disconnected => {}
        }
    }

    pub fn connection(&self, addr: SocketAddr) -> Option<&Connection> {
        self.connections.get(&addr)
    }

    /// Direct access to a connection. Packets sent through it go out with the next update.
    pub fn connection_mut(&mut self, addr: SocketAddr) -> Option<&mut Connection> {
        self.connections.get_mut(&addr)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connected_addrs(&self) -> Vec<SocketAddr> {
        self.connections.values()
            .filter(|c| c.is_connected())
            .map(|c| c.addr())
            .collect()
    }

    fn connection_for_send(&mut self, addr: SocketAddr) -> anyhow::Result<&mut Connection> {
        self.connections.get_mut(&addr)
            .ok_or_else(|| anyhow!("no connection to {:?}", addr))
    }

    pub fn send_unreliable(&mut self, addr: SocketAddr, payload: &[u8]) -> anyhow::Result<()> {
        let now = self.now;
        self.connection_for_send(addr)?
            .send_unreliable(payload, now)?;
        self.flush(addr);
        Ok(())
    }

    pub fn send_notify(&mut self, addr: SocketAddr, payload: &[u8]) -> anyhow::Result<NotifyToken> {
        let now = self.now;
        let token = self.connection_for_send(addr)?
            .send_notify(payload, now)?
            .ok_or_else(|| anyhow!("connection to {:?} is disconnected", addr))?;
        self.flush(addr);
        Ok(token)
    }

    pub fn send_reliable(&mut self, addr: SocketAddr, payload: &[u8]) -> anyhow::Result<()> {
        let now = self.now;
        self.connection_for_send(addr)?
            .send_reliable(payload, now)?;
        self.flush(addr);
        Ok(())
    }

    pub fn poll_event(&mut self) -> Option<PeerEvent> {
        self.events.pop_front()
    }

    pub fn update(&mut self, now: Instant) {
        self.update_receive(now);
        self.update_sent(now);
    }

    /// Receives and handles all datagrams that are waiting in the socket
    pub fn update_receive(&mut self, now: Instant) {
        self.now = now;

        while self.role.is_some() && self.socket.poll() {
            let (len, from) = match self.socket.receive(&mut self.receive_buf) {
                Ok(x) => x,
                Err(e) => {
                    warn!("error receiving datagram: {}", e);
                    break;
                }
            };

            let span = span!(Level::TRACE, "packet_received", ?from);
            let _entered = span.enter();

            if len > self.config.mtu {
                debug!("datagram of {} bytes exceeds the MTU of {} - dropping", len, self.config.mtu);
                continue;
            }

            let packet = self.buffer_pool.copy_from_slice(&self.receive_buf[..len]);
            trace!("received datagram: {:?}", packet);
            self.on_packet(from, &packet, now);
            self.flush(from);
        }

        self.collect_connection_events();
    }

    /// Drives connect attempts, resends, acks and keep-alives, and disconnects connections that
    ///  went silent
    pub fn update_sent(&mut self, now: Instant) {
        self.now = now;
        if self.role.is_none() {
            return;
        }

        let addrs = self.connections.keys().copied().collect::<Vec<_>>();
        for addr in addrs {
            let Some(connection) = self.connections.get_mut(&addr) else {
                continue;
            };

            match connection.state() {
                ConnectionState::Connecting => {
                    if connection.is_connect_attempt_due(now) {
                        if connection.connect_attempts() >= self.config.max_connect_attempts {
                            info!("no reply from {:?} after {} connect attempts", addr, connection.connect_attempts());
                            connection.terminate();
                            self.remove_connection(addr);
                            self.events.push_back(PeerEvent::ConnectionFailed { addr, reason: RejectReason::Timeout });
                            continue;
                        }
                        connection.send_connect_request(&self.key_validator, now);
                    }
                }
                ConnectionState::Connected => {
                    if connection.is_timed_out(now) {
                        info!("connection to {:?} timed out", addr);
                        connection.terminate();
                        self.remove_connection(addr);
                        self.events.push_back(PeerEvent::Disconnected { addr, reason: DisconnectReason::Timeout });
                        continue;
                    }
                    connection.update(now);
                }
                ConnectionState::Disconnected => {
                    self.reap_disconnected(addr);
                    continue;
                }
            }

            self.flush(addr);
        }

        self.collect_connection_events();
    }

    /// Runs the peer on a tokio interval until it is closed, passing all events to a callback.
    ///  The callback gets access to the peer, so it can send or close.
    ///
    /// Returns immediately if the peer is not active.
    pub async fn run(&mut self, tick_interval: Duration, mut on_event: impl FnMut(&mut Peer, PeerEvent)) {
        let mut interval = tokio::time::interval(tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while self.is_active() {
            interval.tick().await;
            let now = tokio::time::Instant::now().into_std();

            self.update_receive(now);
            self.dispatch_events(&mut on_event);
            if !self.is_active() {
                break;
            }

            self.update_sent(now);
            self.dispatch_events(&mut on_event);
        }
        debug!("peer is closed - leaving run loop");
    }

    /// Removes a connection that was moved to `Disconnected` directly rather than through
    ///  [Peer::disconnect], sending its final `Disconnect` and raising the local event
    fn reap_disconnected(&mut self, addr: SocketAddr) {
        debug!("removing disconnected connection to {:?}", addr);
        self.remove_connection(addr);
        self.events.push_back(PeerEvent::Disconnected { addr, reason: DisconnectReason::RequestedByLocalPeer });
    }

    fn dispatch_events(&mut self, on_event: &mut impl FnMut(&mut Peer, PeerEvent)) {
        while let Some(event) = self.poll_event() {
            on_event(self, event);
        }
    }

    fn on_packet(&mut self, from: SocketAddr, packet: &[u8], now: Instant) {
        let Some(&raw_type) = packet.first() else {
            debug!("empty datagram - dropping");
            return;
        };

        if raw_type == u8::from(PacketType::Command) {
            self.on_command(from, packet, now);
            return;
        }

        match self.connections.get_mut(&from) {
            Some(connection) => connection.receive(packet, now),
            None => debug!("packet from {:?} without a connection - dropping", from),
        }
    }

    fn on_command(&mut self, from: SocketAddr, packet: &[u8], now: Instant) {
        let msg = match ControlMessage::deser(&mut &packet[1..]) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("malformed command: {} - dropping", e);
                return;
            }
        };
        trace!("received command {:?}", msg);

        match msg {
            ControlMessage::ConnectRequest => self.on_connect_request(from, packet, now),
            ControlMessage::ConnectionAccepted => self.on_connection_accepted(from, now),
            ControlMessage::ConnectionRejected(reason) => self.on_connection_rejected(from, reason),
            ControlMessage::Disconnect(reason) => self.on_disconnect(from, reason),
        }
    }

    fn on_connect_request(&mut self, from: SocketAddr, packet: &[u8], now: Instant) {
        if self.role != Some(PeerRole::Server) {
            debug!("connect request to a client - dropping");
            return;
        }

        if self.connections.get(&from).is_some_and(|c| c.state() == ConnectionState::Disconnected) {
            self.reap_disconnected(from);
        }

        if let Some(connection) = self.connections.get_mut(&from) {
            debug!("repeated connect request from {:?} - accepting again", from);
            connection.touch(now);
            connection.send_control(&ControlMessage::ConnectionAccepted);
            return;
        }

        if !self.key_validator.validate(packet) {
            info!("connect request from {:?} with an invalid key - rejecting", from);
            self.send_command(from, &ControlMessage::ConnectionRejected(RejectReason::KeyInvalid));
            return;
        }

        if self.connections.len() >= self.config.max_connections {
            info!("connect request from {:?}, but there are already {} connections - rejecting", from, self.connections.len());
            self.send_command(from, &ControlMessage::ConnectionRejected(RejectReason::ServerFull));
            return;
        }

        info!("accepting connection from {:?}", from);
        let mut connection = Connection::new_connected(self.config.clone(), self.buffer_pool.clone(), from, now);
        connection.send_control(&ControlMessage::ConnectionAccepted);
        self.connections.insert(from, connection);
        self.events.push_back(PeerEvent::Connected(from));
    }

    fn on_connection_accepted(&mut self, from: SocketAddr, now: Instant) {
        match self.connections.get_mut(&from) {
            Some(connection) if connection.state() == ConnectionState::Connecting => {
                connection.on_accepted(now);
                self.events.push_back(PeerEvent::Connected(from));
            }
            Some(connection) => {
                trace!("repeated acceptance from {:?}", from);
                connection.touch(now);
            }
            None => debug!("acceptance from {:?} without a pending connection - dropping", from),
        }
    }

    fn on_connection_rejected(&mut self, from: SocketAddr, reason: RejectReason) {
        match self.connections.get_mut(&from) {
            Some(connection) if connection.state() == ConnectionState::Connecting => {
                info!("connection to {:?} was rejected: {:?}", from, reason);
                connection.terminate();
                self.remove_connection(from);
                self.events.push_back(PeerEvent::ConnectionFailed { addr: from, reason });
            }
            _ => debug!("rejection from {:?} without a pending connection - dropping", from),
        }
    }

    fn on_disconnect(&mut self, from: SocketAddr, reason: DisconnectReason) {
        let Some(connection) = self.connections.get_mut(&from) else {
            debug!("disconnect from {:?} without a connection - dropping", from);
            return;
        };

        info!("remote peer {:?} disconnected: {:?}", from, reason);
        let state = connection.state();
        connection.terminate();
        self.remove_connection(from);

        match state {
            ConnectionState::Connecting => self.events.push_back(PeerEvent::ConnectionFailed { addr: from, reason: RejectReason::ClosedByPeer }),
            ConnectionState::Connected => self.events.push_back(PeerEvent::Disconnected { addr: from, reason }),
            ConnectionState::Disconnected => {}
        }
    }

    fn send_command(&mut self, to: SocketAddr, msg: &ControlMessage) {
        let mut buf = self.buffer_pool.get_from_pool();
        msg.ser(buf.buf_mut());
        if let Err(e) = self.socket.send(to, &buf) {
            error!("error sending command to {:?}: {}", to, e);
        }
    }

    /// sends all of a connection's queued packets
    fn flush(&mut self, addr: SocketAddr) {
        let Some(connection) = self.connections.get_mut(&addr) else {
            return;
        };
        while let Some(buf) = connection.pop_outgoing() {
            if let Err(e) = self.socket.send(addr, &buf) {
                error!("error sending datagram to {:?}: {}", addr, e);
            }
        }
    }

    /// Sends what is left in the connection's outbox, and moves remaining messages and notify
    ///  resolutions to the event queue before the connection is dropped
    fn remove_connection(&mut self, addr: SocketAddr) {
        self.flush(addr);
        if let Some(mut connection) = self.connections.remove(&addr) {
            Self::collect_events_from(&mut connection, &mut self.events);
        }
    }

    fn collect_connection_events(&mut self) {
        for connection in self.connections.values_mut() {
            Self::collect_events_from(connection, &mut self.events);
        }
    }

    fn collect_events_from(connection: &mut Connection, events: &mut VecDeque<PeerEvent>) {
        let addr = connection.addr();
        while let Some((channel, payload)) = connection.next_message() {
            events.push_back(PeerEvent::Message { addr, channel, payload });
        }
        while let Some(resolution) = connection.poll_notify_resolution() {
            events.push_back(PeerEvent::for_notify_resolution(addr, resolution));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use crate::packet_header::{FRAGMENT_HEADER_LEN, ACK_HEADER_LEN};
    use crate::peer_events::Channel;
    use crate::socket::MockDatagramSocket;
    use crate::test_util::loopback::{LinkConditions, LoopbackNetwork, WirePacket};
    use crate::test_util::test_addr_from_number;

    const KEY: &[u8] = b"scenario-key";
    const TICK: Duration = Duration::from_millis(10);

    fn server_addr() -> SocketAddr {
        test_addr_from_number(7000)
    }

    fn config() -> PeerConfig {
        PeerConfig::new(KEY)
    }

    fn server(network: &LoopbackNetwork, config: PeerConfig) -> Peer {
        let mut peer = Peer::new(config, Box::new(network.socket())).unwrap();
        peer.bind(server_addr()).unwrap();
        peer
    }

    fn client(network: &LoopbackNetwork, config: PeerConfig, now: Instant) -> Peer {
        let mut peer = Peer::new(config, Box::new(network.socket())).unwrap();
        peer.update(now);
        peer.connect(server_addr()).unwrap();
        peer
    }

    /// a simulated clock advancing one tick per step, updating all peers each step
    struct Sim {
        now: Instant,
    }

    impl Sim {
        fn new() -> Sim {
            Sim { now: Instant::now() }
        }

        fn step(&mut self, peers: &mut [&mut Peer]) {
            self.now += TICK;
            for peer in peers.iter_mut() {
                peer.update(self.now);
            }
        }

        fn run_for(&mut self, duration: Duration, peers: &mut [&mut Peer]) {
            let end = self.now + duration;
            while self.now < end {
                self.step(peers);
            }
        }
    }

    fn drain_events(peer: &mut Peer) -> Vec<PeerEvent> {
        let mut result = Vec::new();
        while let Some(e) = peer.poll_event() {
            result.push(e);
        }
        result
    }

    fn messages(events: &[PeerEvent]) -> Vec<(Channel, Vec<u8>)> {
        events.iter()
            .filter_map(|e| match e {
                PeerEvent::Message { channel, payload, .. } => Some((*channel, payload.to_vec())),
                _ => None,
            })
            .collect()
    }

    fn is_connected_event(event: &PeerEvent) -> bool {
        matches!(event, PeerEvent::Connected(_))
    }

    fn connected_pair(network: &LoopbackNetwork, sim: &mut Sim) -> (Peer, Peer) {
        let mut server = server(network, config());
        let mut client = client(network, config(), sim.now);
        sim.step(&mut [&mut server, &mut client]);
        sim.step(&mut [&mut server, &mut client]);

        let server_events = drain_events(&mut server);
        assert!(matches!(server_events.as_slice(), [PeerEvent::Connected(_)]), "{:?}", server_events);
        let client_events = drain_events(&mut client);
        assert!(matches!(client_events.as_slice(), [PeerEvent::Connected(addr)] if *addr == server_addr()), "{:?}", client_events);
        (server, client)
    }

    fn client_addr(server: &Peer) -> SocketAddr {
        server.connected_addrs()[0]
    }

    fn packets_to(network: &LoopbackNetwork, to: SocketAddr) -> Vec<WirePacket> {
        network.wire_log().into_iter()
            .filter(|p| p.to == to)
            .collect()
    }

    #[test]
    fn test_handshake() {
        let network = LoopbackNetwork::new();
        let mut sim = Sim::new();
        let (server, client) = connected_pair(&network, &mut sim);

        assert_eq!(server.connection_count(), 1);
        assert_eq!(client.connection_count(), 1);
        assert_eq!(server.role(), Some(PeerRole::Server));
        assert_eq!(client.role(), Some(PeerRole::Client));
        assert!(client.connection(server_addr()).unwrap().is_connected());

        let mut expected_request = vec![1, 1];
        expected_request.extend_from_slice(KEY);
        assert_eq!(packets_to(&network, server_addr())[0].data, expected_request);
        assert_eq!(packets_to(&network, client_addr(&server))[0].data, vec![1, 2]);
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let network = LoopbackNetwork::new();
        let mut sim = Sim::new();
        let mut server = server(&network, config());
        let mut client = client(&network, PeerConfig::new(b"other-key"), sim.now);

        sim.run_for(Duration::from_millis(100), &mut [&mut server, &mut client]);

        assert!(drain_events(&mut server).is_empty());
        assert_eq!(server.connection_count(), 0);
        let client_events = drain_events(&mut client);
        assert!(matches!(client_events.as_slice(), [PeerEvent::ConnectionFailed { reason: RejectReason::KeyInvalid, .. }]), "{:?}", client_events);
        assert_eq!(client.connection_count(), 0);

        let replies = network.wire_log().into_iter()
            .filter(|p| p.from == server_addr())
            .map(|p| p.data)
            .collect::<Vec<_>>();
        assert_eq!(replies, vec![vec![1, 3, 3]]);
    }

    #[test]
    fn test_server_full() {
        let network = LoopbackNetwork::new();
        let mut sim = Sim::new();
        let mut server = server(&network, PeerConfig { max_connections: 5, ..config() });

        let mut clients = (0..5)
            .map(|_| client(&network, config(), sim.now))
            .collect::<Vec<_>>();
        {
            let mut peers = vec![&mut server];
            peers.extend(clients.iter_mut());
            sim.run_for(Duration::from_millis(50), &mut peers);
        }
        assert_eq!(server.connection_count(), 5);
        assert_eq!(drain_events(&mut server).iter().filter(|e| is_connected_event(e)).count(), 5);

        let mut sixth = client(&network, config(), sim.now);
        sim.run_for(Duration::from_millis(50), &mut [&mut server, &mut sixth]);

        let events = drain_events(&mut sixth);
        assert!(matches!(events.as_slice(), [PeerEvent::ConnectionFailed { reason: RejectReason::ServerFull, .. }]), "{:?}", events);
        assert_eq!(server.connection_count(), 5);
        assert!(drain_events(&mut server).is_empty());
    }

    #[test]
    fn test_repeated_connect_request_is_idempotent() {
        let network = LoopbackNetwork::new();
        let mut sim = Sim::new();
        let mut server = server(&network, config());
        let mut client = client(&network, config(), sim.now);

        let request = packets_to(&network, server_addr()).remove(0);
        network.inject(request.from, request.to, &request.data);
        sim.step(&mut [&mut server]);

        assert_eq!(server.connection_count(), 1);
        assert_eq!(drain_events(&mut server).iter().filter(|e| is_connected_event(e)).count(), 1);

        let accepts = packets_to(&network, request.from).into_iter()
            .filter(|p| p.data == vec![1, 2])
            .count();
        assert_eq!(accepts, 2);

        sim.step(&mut [&mut client]);
        assert_eq!(drain_events(&mut client).iter().filter(|e| is_connected_event(e)).count(), 1);
    }

    #[test]
    fn test_fragmented_message_on_the_wire() {
        let network = LoopbackNetwork::new();
        let mut sim = Sim::new();
        let (mut server, mut client) = connected_pair(&network, &mut sim);
        network.clear_wire_log();

        let message = (0..1800).map(|i| (i % 256) as u8).collect::<Vec<_>>();
        client.send_reliable(server_addr(), &message).unwrap();

        let fragments = packets_to(&network, server_addr());
        assert_eq!(fragments.len(), 2);
        for (packet, index) in fragments.iter().zip([1u8, 0]) {
            assert_eq!(packet.data[0], u8::from(PacketType::ReliableFragment));
            assert_eq!(packet.data[FRAGMENT_HEADER_LEN - 2], index);
        }

        sim.step(&mut [&mut server, &mut client]);
        assert_eq!(messages(&drain_events(&mut server)), vec![(Channel::Reliable, message)]);
    }

    #[test]
    fn test_notifies_all_delivered() {
        let network = LoopbackNetwork::new();
        let mut sim = Sim::new();
        let (mut server, mut client) = connected_pair(&network, &mut sim);

        let tokens = (0..5u8)
            .map(|i| client.send_notify(server_addr(), &[i]).unwrap())
            .collect::<Vec<_>>();

        sim.run_for(Duration::from_millis(200), &mut [&mut server, &mut client]);

        assert_eq!(messages(&drain_events(&mut server)).len(), 5);
        let client_events = drain_events(&mut client);
        let delivered = client_events.iter()
            .filter_map(|e| match e {
                PeerEvent::NotifyDelivered { token, .. } => Some(*token),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(delivered, tokens);
        assert!(!client_events.iter().any(|e| matches!(e, PeerEvent::NotifyLost { .. })));
    }

    #[test]
    fn test_keep_alive_when_idle() {
        let network = LoopbackNetwork::new();
        let mut sim = Sim::new();
        let (mut server, mut client) = connected_pair(&network, &mut sim);
        network.clear_wire_log();

        sim.run_for(Duration::from_millis(1100), &mut [&mut server, &mut client]);

        let keep_alives = packets_to(&network, server_addr()).into_iter()
            .filter(|p| p.data[0] == u8::from(PacketType::KeepAlive) || p.data[0] == u8::from(PacketType::Ack))
            .collect::<Vec<_>>();
        assert!(!keep_alives.is_empty());
        assert!(keep_alives.iter().all(|p| p.data.len() == ACK_HEADER_LEN));
        assert!(client.connection(server_addr()).unwrap().is_connected());
    }

    #[test]
    fn test_reliable_order_over_lossy_network() {
        let network = LoopbackNetwork::new();
        let mut sim = Sim::new();
        let (mut server, mut client) = connected_pair(&network, &mut sim);
        network.set_conditions(LinkConditions { loss: 0.2, duplication: 0.1, reordering: 0.3 });

        let sent = (0..50u32)
            .map(|i| {
                let msg = vec![i as u8; 1 + (i as usize * 97) % 2500];
                client.send_reliable(server_addr(), &msg).unwrap();
                msg
            })
            .collect::<Vec<_>>();

        let mut received = Vec::new();
        for _ in 0..1000 {
            sim.step(&mut [&mut server, &mut client]);
            received.extend(messages(&drain_events(&mut server)).into_iter().map(|(_, msg)| msg));
            if received.len() == sent.len() {
                break;
            }
        }
        assert_eq!(received, sent);
    }

    #[test]
    fn test_disconnect() {
        let network = LoopbackNetwork::new();
        let mut sim = Sim::new();
        let (mut server, mut client) = connected_pair(&network, &mut sim);
        let client_addr = client_addr(&server);

        client.disconnect(server_addr()).unwrap();
        let events = drain_events(&mut client);
        assert!(matches!(events.as_slice(), [PeerEvent::Disconnected { reason: DisconnectReason::RequestedByLocalPeer, .. }]), "{:?}", events);
        assert_eq!(client.connection_count(), 0);
        assert!(client.disconnect(server_addr()).is_err());
        assert!(client.send_reliable(server_addr(), &[1]).is_err());

        sim.step(&mut [&mut server]);
        let events = drain_events(&mut server);
        assert!(matches!(events.as_slice(), [PeerEvent::Disconnected { addr, reason: DisconnectReason::RequestedByRemotePeer }] if *addr == client_addr), "{:?}", events);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_connection_disconnected_directly_is_removed() {
        let network = LoopbackNetwork::new();
        let mut sim = Sim::new();
        let mut server = server(&network, PeerConfig { max_connections: 1, ..config() });
        let mut client = client(&network, config(), sim.now);
        sim.step(&mut [&mut server, &mut client]);
        drain_events(&mut server);
        drain_events(&mut client);
        let client_addr = client_addr(&server);

        server.connection_mut(client_addr).unwrap()
            .disconnect(DisconnectReason::RequestedByRemotePeer);
        sim.step(&mut [&mut server, &mut client]);

        let events = drain_events(&mut server);
        assert!(matches!(events.as_slice(), [PeerEvent::Disconnected { addr, reason: DisconnectReason::RequestedByLocalPeer }] if *addr == client_addr), "{:?}", events);
        assert_eq!(server.connection_count(), 0);
        let events = drain_events(&mut client);
        assert!(matches!(events.as_slice(), [PeerEvent::Disconnected { reason: DisconnectReason::RequestedByRemotePeer, .. }]), "{:?}", events);

        // the slot is free for a new client
        let mut other = self::client(&network, config(), sim.now);
        sim.run_for(Duration::from_millis(50), &mut [&mut server, &mut other]);
        assert_eq!(drain_events(&mut other).iter().filter(|e| is_connected_event(e)).count(), 1);
        assert_eq!(server.connection_count(), 1);
    }

    #[test]
    fn test_connect_request_replaces_disconnected_connection() {
        let network = LoopbackNetwork::new();
        let mut sim = Sim::new();
        let (mut server, client) = connected_pair(&network, &mut sim);
        let client_addr = client_addr(&server);
        drop(client);

        server.connection_mut(client_addr).unwrap()
            .disconnect(DisconnectReason::RequestedByRemotePeer);
        let mut request = vec![1, 1];
        request.extend_from_slice(KEY);
        network.inject(client_addr, server_addr(), &request);
        sim.step(&mut [&mut server]);

        let events = drain_events(&mut server);
        assert!(matches!(events.as_slice(), [
            PeerEvent::Disconnected { reason: DisconnectReason::RequestedByLocalPeer, .. },
            PeerEvent::Connected(addr),
        ] if *addr == client_addr), "{:?}", events);
        assert!(server.connection(client_addr).unwrap().is_connected());
    }

    #[test]
    fn test_notify_resolved_exactly_once_over_lossy_network() {
        let network = LoopbackNetwork::new();
        let mut sim = Sim::new();
        let (mut server, mut client) = connected_pair(&network, &mut sim);
        network.set_conditions(LinkConditions { loss: 0.3, duplication: 0.1, reordering: 0.3 });

        let mut resolutions: FxHashMap<NotifyToken, Vec<bool>> = FxHashMap::default();
        let collect = |events: Vec<PeerEvent>, resolutions: &mut FxHashMap<NotifyToken, Vec<bool>>| {
            for event in events {
                match event {
                    PeerEvent::NotifyDelivered { token, .. } => resolutions.entry(token).or_default().push(true),
                    PeerEvent::NotifyLost { token, .. } => resolutions.entry(token).or_default().push(false),
                    _ => {}
                }
            }
        };

        let mut lossy_tokens = Vec::new();
        for i in 0..1000u32 {
            lossy_tokens.push(client.send_notify(server_addr(), &i.to_be_bytes()).unwrap());
            sim.step(&mut [&mut server, &mut client]);
            collect(drain_events(&mut client), &mut resolutions);
        }

        // lossless traffic afterwards moves the ack window past every token sent so far
        network.set_conditions(LinkConditions::default());
        for i in 0..40u32 {
            client.send_notify(server_addr(), &i.to_be_bytes()).unwrap();
            sim.step(&mut [&mut server, &mut client]);
            collect(drain_events(&mut client), &mut resolutions);
        }
        sim.run_for(Duration::from_millis(500), &mut [&mut server, &mut client]);
        collect(drain_events(&mut client), &mut resolutions);

        for token in &lossy_tokens {
            assert_eq!(resolutions.get(token).map(|r| r.len()), Some(1), "token {}", token);
        }
        assert!(resolutions.values().all(|r| r.len() == 1));

        let num_delivered = lossy_tokens.iter()
            .filter(|t| resolutions[*t][0])
            .count();
        assert!(num_delivered > 0);
        assert!(num_delivered < lossy_tokens.len());
    }

    #[test]
    fn test_timeout() {
        let network = LoopbackNetwork::new();
        let mut sim = Sim::new();
        let (mut server, mut client) = connected_pair(&network, &mut sim);
        network.set_conditions(LinkConditions { loss: 1.0, ..Default::default() });

        sim.run_for(Duration::from_secs(29), &mut [&mut server, &mut client]);
        assert_eq!(server.connection_count(), 1);

        sim.run_for(Duration::from_secs(2), &mut [&mut server, &mut client]);
        for peer in [&mut server, &mut client] {
            let events = drain_events(peer);
            assert!(matches!(events.as_slice(), [PeerEvent::Disconnected { reason: DisconnectReason::Timeout, .. }]), "{:?}", events);
            assert_eq!(peer.connection_count(), 0);
        }
    }

    #[test]
    fn test_connect_attempts_exhausted() {
        let network = LoopbackNetwork::new();
        let mut sim = Sim::new();
        let mut client = client(&network, config(), sim.now);

        sim.run_for(Duration::from_millis(2240), &mut [&mut client]);
        assert!(drain_events(&mut client).is_empty());
        assert_eq!(packets_to(&network, server_addr()).len(), 9);

        sim.run_for(Duration::from_millis(300), &mut [&mut client]);
        let events = drain_events(&mut client);
        assert!(matches!(events.as_slice(), [PeerEvent::ConnectionFailed { reason: RejectReason::Timeout, .. }]), "{:?}", events);
        assert_eq!(packets_to(&network, server_addr()).len(), 10);
        assert_eq!(client.connection_count(), 0);
    }

    #[test]
    fn test_close() {
        let network = LoopbackNetwork::new();
        let mut sim = Sim::new();
        let (mut server, mut client) = connected_pair(&network, &mut sim);

        server.close();
        assert!(!server.is_active());
        assert_eq!(server.connection_count(), 0);
        let events = drain_events(&mut server);
        assert!(matches!(events.as_slice(), [PeerEvent::Disconnected { reason: DisconnectReason::RequestedByLocalPeer, .. }]), "{:?}", events);

        // closing twice does nothing
        server.close();
        assert!(drain_events(&mut server).is_empty());

        sim.step(&mut [&mut client]);
        let events = drain_events(&mut client);
        assert!(matches!(events.as_slice(), [PeerEvent::Disconnected { reason: DisconnectReason::RequestedByRemotePeer, .. }]), "{:?}", events);
    }

    #[test]
    fn test_close_while_connecting() {
        let network = LoopbackNetwork::new();
        let sim = Sim::new();
        let mut client = client(&network, config(), sim.now);

        client.close();
        let events = drain_events(&mut client);
        assert!(matches!(events.as_slice(), [PeerEvent::ConnectionFailed { reason: RejectReason::ClosedByPeer, .. }]), "{:?}", events);
    }

    #[test]
    fn test_pending_notify_lost_on_disconnect() {
        let network = LoopbackNetwork::new();
        let mut sim = Sim::new();
        let (_server, mut client) = connected_pair(&network, &mut sim);

        let token = client.send_notify(server_addr(), &[1]).unwrap();
        client.disconnect(server_addr()).unwrap();
        let events = drain_events(&mut client);
        assert!(matches!(events.as_slice(), [
            PeerEvent::NotifyLost { token: t, .. },
            PeerEvent::Disconnected { .. },
        ] if *t == token), "{:?}", events);
    }

    #[test]
    fn test_local_misuse() {
        let network = LoopbackNetwork::new();
        let mut sim = Sim::new();
        let (mut server, mut client) = connected_pair(&network, &mut sim);

        assert!(server.bind(test_addr_from_number(7001)).is_err());
        assert!(client.connect(test_addr_from_number(7001)).is_err());
        assert!(client.bind(test_addr_from_number(7001)).is_err());
        assert!(client.send_unreliable(test_addr_from_number(7001), &[1]).is_err());
        assert!(client.send_reliable(server_addr(), &vec![0; 1_000_000]).is_err());
        assert!(client.send_notify(server_addr(), &[0; 1200]).is_err());

        assert!(Peer::new(PeerConfig { mtu: 10, ..config() }, Box::new(network.socket())).is_err());
    }

    #[test]
    fn test_oversized_and_garbage_datagrams_are_dropped() {
        let network = LoopbackNetwork::new();
        let mut sim = Sim::new();
        let (mut server, client) = connected_pair(&network, &mut sim);
        let client_addr = client_addr(&server);
        drop(client);

        network.inject(client_addr, server_addr(), &[2; 1201]);
        network.inject(client_addr, server_addr(), &[]);
        network.inject(client_addr, server_addr(), &[1, 99]);
        network.inject(client_addr, server_addr(), &[42, 1, 2, 3]);
        network.inject(test_addr_from_number(9999), server_addr(), &[2, 1]);
        sim.step(&mut [&mut server]);

        assert!(drain_events(&mut server).is_empty());
        assert_eq!(server.connection_count(), 1);

        network.inject(client_addr, server_addr(), &[2; 1200]);
        sim.step(&mut [&mut server]);
        assert_eq!(messages(&drain_events(&mut server)), vec![(Channel::Unreliable, vec![2; 1199])]);
    }

    #[test]
    fn test_receive_stops_when_closed_and_send_errors_are_swallowed() {
        let mut socket = MockDatagramSocket::new();
        socket.expect_bind()
            .times(1)
            .returning(|_| Ok(()));
        let mut num_polls = 0;
        socket.expect_poll()
            .returning(move || {
                num_polls += 1;
                num_polls == 1
            });
        socket.expect_receive()
            .times(1)
            .returning(|buf| {
                buf[..3].copy_from_slice(&[1, 1, 0]);
                Ok((3, test_addr_from_number(1)))
            });
        socket.expect_send()
            .times(1)
            .returning(|_, _| Err(anyhow!("network unreachable")));
        socket.expect_close()
            .times(1)
            .return_const(());

        let mut peer = Peer::new(config(), Box::new(socket)).unwrap();
        peer.bind(server_addr()).unwrap();
        // the request carries an invalid key, and sending the rejection fails
        peer.update_receive(Instant::now());
        assert_eq!(peer.connection_count(), 0);

        peer.close();
        peer.update_receive(Instant::now());
    }

    #[test]
    fn test_oversized_datagram_from_socket() {
        let mut socket = MockDatagramSocket::new();
        socket.expect_bind()
            .returning(|_| Ok(()));
        let mut num_polls = 0;
        socket.expect_poll()
            .returning(move || {
                num_polls += 1;
                num_polls == 1
            });
        socket.expect_receive()
            .times(1)
            .returning(|buf| {
                buf.fill(2);
                Ok((5000, test_addr_from_number(1)))
            });
        socket.expect_send()
            .never();

        let mut peer = Peer::new(config(), Box::new(socket)).unwrap();
        peer.bind(server_addr()).unwrap();
        peer.update_receive(Instant::now());
        assert!(peer.poll_event().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_echo() {
        let network = LoopbackNetwork::new();
        let mut server = server(&network, config());
        let mut client = Peer::new(config(), Box::new(network.socket())).unwrap();
        client.connect(server_addr()).unwrap();

        let mut server_events = Vec::new();
        let mut client_messages = Vec::new();

        let server_run = server.run(TICK, |peer, event| {
            match &event {
                PeerEvent::Message { addr, payload, .. } => {
                    peer.send_reliable(*addr, payload).unwrap();
                }
                PeerEvent::Disconnected { .. } => peer.close(),
                _ => {}
            }
            server_events.push(format!("{:?}", event));
        });

        let client_run = client.run(TICK, |peer, event| {
            match event {
                PeerEvent::Connected(addr) => {
                    peer.send_reliable(addr, b"hello").unwrap();
                }
                PeerEvent::Message { payload, .. } => {
                    client_messages.push(payload.to_vec());
                    peer.close();
                }
                _ => {}
            }
        });

        tokio::join!(server_run, client_run);

        assert_eq!(client_messages, vec![b"hello".to_vec()]);
        assert_eq!(server_events.len(), 3, "{:?}", server_events);
        assert!(server_events[0].starts_with("Connected"));
        assert!(server_events[1].starts_with("Message"));
        assert!(server_events[2].contains("RequestedByRemotePeer"));
        assert!(!server.is_active());
        assert!(!client.is_active());
    }
}
