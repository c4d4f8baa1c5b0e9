use anyhow::anyhow;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::packet_header::PacketType;

#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CommandKind {
    ConnectRequest = 1,
    ConnectionAccepted = 2,
    ConnectionRejected = 3,
    Disconnect = 4,
}

/// Why a connection attempt failed, sent as part of `ConnectionRejected` and reported to the
///  application with `PeerEvent::ConnectionFailed`
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum RejectReason {
    /// no reply from the server after all connect attempts
    Timeout = 1,
    ServerFull = 2,
    KeyInvalid = 3,
    /// the attempt was abandoned, either because the local peer was closed or because the
    ///  server sent a disconnect before accepting
    ClosedByPeer = 4,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DisconnectReason {
    /// nothing was received for the configured disconnect timeout
    Timeout = 1,
    RequestedByRemotePeer = 2,
    RequestedByLocalPeer = 3,
}

/// The control messages of `Command` packets. `ConnectRequest` carries the shared key, which is
///  written and checked by [crate::handshake::ConnectKeyValidator] on the raw packet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ControlMessage {
    ConnectRequest,
    ConnectionAccepted,
    ConnectionRejected(RejectReason),
    Disconnect(DisconnectReason),
}

impl ControlMessage {
    pub fn kind(&self) -> CommandKind {
        match self {
            ControlMessage::ConnectRequest => CommandKind::ConnectRequest,
            ControlMessage::ConnectionAccepted => CommandKind::ConnectionAccepted,
            ControlMessage::ConnectionRejected(_) => CommandKind::ConnectionRejected,
            ControlMessage::Disconnect(_) => CommandKind::Disconnect,
        }
    }

    /// serializes the complete packet including the type tag. For `ConnectRequest`, the key
    ///  needs to be appended by the caller.
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(PacketType::Command.into());
        buf.put_u8(self.kind().into());
        match self {
            ControlMessage::ConnectRequest | ControlMessage::ConnectionAccepted => {}
            ControlMessage::ConnectionRejected(reason) => buf.put_u8((*reason).into()),
            ControlMessage::Disconnect(reason) => buf.put_u8((*reason).into()),
        }
    }

    /// parses a command, starting *after* the packet type tag
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ControlMessage> {
        let raw_kind = buf.try_get_u8()?;
        let kind = CommandKind::try_from(raw_kind)
            .map_err(|_| anyhow!("invalid command {}", raw_kind))?;

        let result = match kind {
            CommandKind::ConnectRequest => ControlMessage::ConnectRequest,
            CommandKind::ConnectionAccepted => ControlMessage::ConnectionAccepted,
            CommandKind::ConnectionRejected => {
                let raw_reason = buf.try_get_u8()?;
                let reason = RejectReason::try_from(raw_reason)
                    .map_err(|_| anyhow!("invalid reject reason {}", raw_reason))?;
                ControlMessage::ConnectionRejected(reason)
            }
            CommandKind::Disconnect => {
                let raw_reason = buf.try_get_u8()?;
                let reason = DisconnectReason::try_from(raw_reason)
                    .map_err(|_| anyhow!("invalid disconnect reason {}", raw_reason))?;
                ControlMessage::Disconnect(reason)
            }
        };
        Ok(result)
    }
}
