use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use anyhow::bail;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use tracing::trace;
use crate::socket::DatagramSocket;

/// Probabilities of datagram mishaps, each between 0.0 and 1.0
#[derive(Clone, Debug, Default)]
pub struct LinkConditions {
    pub loss: f64,
    pub duplication: f64,
    /// probability that a datagram overtakes datagrams that are already waiting for the receiver
    pub reordering: f64,
}

/// a datagram as it was handed to the network, before loss or duplication
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WirePacket {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub data: Vec<u8>,
}

/// An in-memory datagram network. Sockets created from the same network can reach each other by
///  address, and every datagram that is sent is recorded for inspection.
#[derive(Clone)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

struct NetworkInner {
    mailboxes: FxHashMap<SocketAddr, VecDeque<(SocketAddr, Vec<u8>)>>,
    conditions: LinkConditions,
    rng: StdRng,
    wire_log: Vec<WirePacket>,
    next_port: u16,
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackNetwork {
    /// a network without loss, duplication or reordering
    pub fn new() -> LoopbackNetwork {
        Self::with_conditions(LinkConditions::default(), 0)
    }

    /// a lossy network with a seeded, i.e. reproducible, random sequence of mishaps
    pub fn with_conditions(conditions: LinkConditions, seed: u64) -> LoopbackNetwork {
        LoopbackNetwork {
            inner: Arc::new(Mutex::new(NetworkInner {
                mailboxes: Default::default(),
                conditions,
                rng: StdRng::seed_from_u64(seed),
                wire_log: Vec::new(),
                next_port: 10000,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NetworkInner> {
        self.inner.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn socket(&self) -> LoopbackSocket {
        LoopbackSocket {
            network: self.clone(),
            addr: None,
        }
    }

    pub fn set_conditions(&self, conditions: LinkConditions) {
        self.lock().conditions = conditions;
    }

    pub fn wire_log(&self) -> Vec<WirePacket> {
        self.lock().wire_log.clone()
    }

    pub fn clear_wire_log(&self) {
        self.lock().wire_log.clear();
    }

    /// number of datagrams waiting to be received by a given address
    pub fn num_pending(&self, addr: SocketAddr) -> usize {
        self.lock().mailboxes.get(&addr)
            .map(|mailbox| mailbox.len())
            .unwrap_or(0)
    }

    /// injects a datagram as if it had been sent by `from`, bypassing link conditions
    pub fn inject(&self, from: SocketAddr, to: SocketAddr, data: &[u8]) {
        let mut inner = self.lock();
        inner.wire_log.push(WirePacket { from, to, data: data.to_vec() });
        if let Some(mailbox) = inner.mailboxes.get_mut(&to) {
            mailbox.push_back((from, data.to_vec()));
        }
    }
}

pub struct LoopbackSocket {
    network: LoopbackNetwork,
    addr: Option<SocketAddr>,
}

impl LoopbackSocket {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.addr
    }
}

impl DatagramSocket for LoopbackSocket {
    fn bind(&mut self, addr: SocketAddr) -> anyhow::Result<()> {
        if self.addr.is_some() {
            bail!("loopback socket is already bound");
        }

        let mut inner = self.network.lock();

        let mut addr = addr;
        if addr.ip().is_unspecified() {
            let ip = if addr.is_ipv4() { IpAddr::V4(Ipv4Addr::LOCALHOST) } else { IpAddr::V6(Ipv6Addr::LOCALHOST) };
            addr.set_ip(ip);
        }
        if addr.port() == 0 {
            while inner.mailboxes.contains_key(&SocketAddr::new(addr.ip(), inner.next_port)) {
                inner.next_port = inner.next_port.wrapping_add(1);
            }
            addr.set_port(inner.next_port);
            inner.next_port = inner.next_port.wrapping_add(1);
        }

        if inner.mailboxes.contains_key(&addr) {
            bail!("address {:?} is in use", addr);
        }
        inner.mailboxes.insert(addr, VecDeque::new());
        self.addr = Some(addr);
        Ok(())
    }

    fn send(&mut self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        let Some(from) = self.addr else {
            bail!("sending on an unbound loopback socket");
        };

        let mut inner = self.network.lock();
        inner.wire_log.push(WirePacket { from, to, data: buf.to_vec() });

        let conditions = inner.conditions.clone();
        if inner.rng.random_bool(conditions.loss) {
            trace!("loopback: dropping datagram from {:?} to {:?}", from, to);
            return Ok(());
        }
        let num_copies = if inner.rng.random_bool(conditions.duplication) { 2 } else { 1 };
        let overtakes = inner.rng.random_bool(conditions.reordering);

        let NetworkInner { mailboxes, rng, .. } = &mut *inner;
        let Some(mailbox) = mailboxes.get_mut(&to) else {
            trace!("loopback: no socket bound to {:?}", to);
            return Ok(());
        };
        for _ in 0..num_copies {
            if overtakes && !mailbox.is_empty() {
                let pos = rng.random_range(0..mailbox.len());
                mailbox.insert(pos, (from, buf.to_vec()));
            }
            else {
                mailbox.push_back((from, buf.to_vec()));
            }
        }
        Ok(())
    }

    fn poll(&mut self) -> bool {
        let Some(addr) = self.addr else {
            return false;
        };
        self.network.num_pending(addr) > 0
    }

    fn receive(&mut self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)> {
        let Some(addr) = self.addr else {
            bail!("receiving on an unbound loopback socket");
        };

        let mut inner = self.network.lock();
        let Some((from, data)) = inner.mailboxes.get_mut(&addr).and_then(|m| m.pop_front()) else {
            bail!("no datagram available");
        };

        let copied = data.len().min(buf.len());
        buf[..copied].copy_from_slice(&data[..copied]);
        Ok((data.len(), from))
    }

    fn close(&mut self) {
        if let Some(addr) = self.addr.take() {
            self.network.lock().mailboxes.remove(&addr);
        }
    }
}
