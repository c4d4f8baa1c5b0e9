use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use crate::buffers::buffer_pool::PooledBuf;
use crate::control_messages::{DisconnectReason, RejectReason};

/// Identifies a single notify send. Tokens are unique per connection and resolve exactly once,
///  either as [PeerEvent::NotifyDelivered] or as [PeerEvent::NotifyLost].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct NotifyToken(pub u64);

impl Display for NotifyToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Channel {
    Unreliable,
    Notify,
    Reliable,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NotifyResolution {
    Delivered(NotifyToken),
    Lost(NotifyToken),
}

#[derive(Debug)]
pub enum PeerEvent {
    Connected(SocketAddr),
    /// a client's connection attempt did not succeed. The connection is gone when this event is
    ///  raised.
    ConnectionFailed {
        addr: SocketAddr,
        reason: RejectReason,
    },
    Disconnected {
        addr: SocketAddr,
        reason: DisconnectReason,
    },
    /// An application message. The payload is a pooled buffer that goes back to the pool when
    ///  it is dropped.
    Message {
        addr: SocketAddr,
        channel: Channel,
        payload: PooledBuf,
    },
    NotifyDelivered {
        addr: SocketAddr,
        token: NotifyToken,
    },
    NotifyLost {
        addr: SocketAddr,
        token: NotifyToken,
    },
}

impl PeerEvent {
    pub fn addr(&self) -> SocketAddr {
        match self {
            PeerEvent::Connected(addr) => *addr,
            PeerEvent::ConnectionFailed { addr, .. } |
            PeerEvent::Disconnected { addr, .. } |
            PeerEvent::Message { addr, .. } |
            PeerEvent::NotifyDelivered { addr, .. } |
            PeerEvent::NotifyLost { addr, .. } => *addr,
        }
    }

    pub(crate) fn for_notify_resolution(addr: SocketAddr, resolution: NotifyResolution) -> PeerEvent {
        match resolution {
            NotifyResolution::Delivered(token) => PeerEvent::NotifyDelivered { addr, token },
            NotifyResolution::Lost(token) => PeerEvent::NotifyLost { addr, token },
        }
    }
}
