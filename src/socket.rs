use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use anyhow::bail;
#[cfg(test)] use mockall::automock;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, trace, warn};

/// The datagram substrate a [crate::peer::Peer] runs on. All calls are non-blocking.
#[cfg_attr(test, automock)]
pub trait DatagramSocket {
    fn bind(&mut self, addr: SocketAddr) -> anyhow::Result<()>;

    fn send(&mut self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()>;

    /// returns `true` if a datagram is available for [DatagramSocket::receive]
    fn poll(&mut self) -> bool;

    /// Copies the next datagram into `buf`, returning its *full* length and its sender. A length
    ///  exceeding the buffer means that the datagram was truncated.
    fn receive(&mut self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)>;

    fn close(&mut self);
}

/// A datagram socket is limited to 64K by UDP's length field
const MAX_DATAGRAM_SIZE: usize = 65536;

/// Upper bound for consecutive receive errors in a single poll, so a broken socket can not stall
///  the caller
const MAX_RECEIVE_ERRORS: usize = 64;

/// Calls `recv` until it returns a datagram or `WouldBlock`. Other errors refer to a single
///  datagram (e.g. `ConnectionReset` for an ICMP port unreachable on some platforms) and are
///  skipped.
fn next_datagram(mut recv: impl FnMut() -> std::io::Result<(usize, SocketAddr)>) -> Option<(usize, SocketAddr)> {
    for _ in 0..MAX_RECEIVE_ERRORS {
        match recv() {
            Ok(received) => return Some(received),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return None,
            Err(e) => warn!("error receiving from UDP socket: {} - skipping", e),
        }
    }
    warn!("{} consecutive errors receiving from UDP socket - giving up for now", MAX_RECEIVE_ERRORS);
    None
}

pub struct UdpDatagramSocket {
    socket: Option<UdpSocket>,
    staging_buf: Vec<u8>,
    staged: Option<(usize, SocketAddr)>,
}

impl Default for UdpDatagramSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpDatagramSocket {
    pub fn new() -> UdpDatagramSocket {
        UdpDatagramSocket {
            socket: None,
            staging_buf: vec![0; MAX_DATAGRAM_SIZE],
            staged: None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref()
            .and_then(|s| s.local_addr().ok())
    }
}

impl DatagramSocket for UdpDatagramSocket {
    fn bind(&mut self, addr: SocketAddr) -> anyhow::Result<()> {
        if self.socket.is_some() {
            bail!("UDP socket is already bound");
        }

        let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        if addr.is_ipv6() {
            socket.set_only_v6(false)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let socket: UdpSocket = socket.into();
        info!("bound UDP socket to {:?}", socket.local_addr()?);
        self.socket = Some(socket);
        Ok(())
    }

    fn send(&mut self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        let Some(socket) = &self.socket else {
            bail!("sending on an unbound UDP socket");
        };
        trace!("UDP socket: sending {} bytes to {:?}", buf.len(), to);
        socket.send_to(buf, to)?;
        Ok(())
    }

    fn poll(&mut self) -> bool {
        if self.staged.is_some() {
            return true;
        }
        let Some(socket) = &self.socket else {
            return false;
        };

        let staging_buf = &mut self.staging_buf;
        self.staged = next_datagram(|| socket.recv_from(&mut staging_buf[..]));
        self.staged.is_some()
    }

    fn receive(&mut self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)> {
        if !self.poll() {
            bail!("no datagram available");
        }
        let Some((len, from)) = self.staged.take() else {
            bail!("no datagram available");
        };

        let copied = len.min(buf.len());
        buf[..copied].copy_from_slice(&self.staging_buf[..copied]);
        Ok((len, from))
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            debug!("closed UDP socket");
        }
        self.staged = None;
    }
}
