use anyhow::anyhow;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::sequence::Sequence;

pub const TYPE_LEN: usize = 1;
pub const COMMAND_LEN: usize = 1;
pub const SEQUENCE_LEN: usize = 2;
pub const SHORT_ACK_MASK_LEN: usize = 4;
pub const LONG_ACK_MASK_LEN: usize = 8;
pub const ORDER_LEN: usize = 2;
pub const FRAGMENT_INDEX_LEN: usize = 1;
pub const FRAGMENT_COUNT_LEN: usize = 1;

pub const COMMAND_HEADER_LEN: usize = TYPE_LEN + COMMAND_LEN;
pub const UNRELIABLE_HEADER_LEN: usize = TYPE_LEN;
pub const ACK_HEADER_LEN: usize = TYPE_LEN + SEQUENCE_LEN + SHORT_ACK_MASK_LEN;
pub const NOTIFY_HEADER_LEN: usize = TYPE_LEN + SEQUENCE_LEN + SEQUENCE_LEN + SHORT_ACK_MASK_LEN;
pub const RELIABLE_HEADER_LEN: usize = TYPE_LEN + SEQUENCE_LEN + SEQUENCE_LEN + LONG_ACK_MASK_LEN + ORDER_LEN;
pub const FRAGMENT_HEADER_LEN: usize = RELIABLE_HEADER_LEN + FRAGMENT_INDEX_LEN + FRAGMENT_COUNT_LEN;

/// number of valid bits in the ack mask of Notify, Ack and KeepAlive packets
pub const SHORT_ACK_WINDOW: u32 = (SHORT_ACK_MASK_LEN * 8) as u32;
/// number of valid bits in the ack mask of Reliable and ReliableFragment packets, and the size
///  of the receive window that is tracked locally
pub const LONG_ACK_WINDOW: u32 = (LONG_ACK_MASK_LEN * 8) as u32;

#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Command = 1,
    Unreliable = 2,
    Notify = 3,
    Ack = 4,
    Reliable = 5,
    ReliableFragment = 6,
    KeepAlive = 7,
}

/// A summary of the sequence numbers received from the peer: the newest sequence number, and a
///  bit mask where bit `i` is set if `latest - i` was received.
///
/// NB: Bit 0 stands for `latest` itself, so an all-zero mask means that nothing was received yet
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct AckState {
    pub latest: Sequence,
    pub mask: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AckStatus {
    Acked,
    /// the peer may still receive (or report) the packet
    Pending,
    /// the packet is older than the window covered by the mask and was not reported as received
    Expired,
}

impl AckState {
    pub fn status_of(&self, sequence: Sequence, window_bits: u32) -> AckStatus {
        let distance = self.latest.distance(sequence);
        if distance < 0 {
            return AckStatus::Pending;
        }

        let distance = distance as u32;
        if distance >= window_bits {
            AckStatus::Expired
        }
        else if self.mask & (1u64 << distance) != 0 {
            AckStatus::Acked
        }
        else {
            AckStatus::Pending
        }
    }

    fn ser_short(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.latest.to_raw());
        buf.put_u32(self.mask as u32);
    }

    fn ser_long(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.latest.to_raw());
        buf.put_u64(self.mask);
    }

    fn deser_short(buf: &mut impl Buf) -> anyhow::Result<AckState> {
        let latest = Sequence::from_raw(buf.try_get_u16()?);
        let mask = buf.try_get_u32()? as u64;
        Ok(AckState { latest, mask })
    }

    fn deser_long(buf: &mut impl Buf) -> anyhow::Result<AckState> {
        let latest = Sequence::from_raw(buf.try_get_u16()?);
        let mask = buf.try_get_u64()?;
        Ok(AckState { latest, mask })
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FragmentHeader {
    /// counts down to 0, which is the last fragment of a message
    pub index: u8,
    pub count: u8,
}

/// The header of a datagram, everything before the payload. For `Command` packets this is only
///  the type tag, see [crate::control_messages] for the rest.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PacketHeader {
    Command,
    Unreliable,
    Notify { sequence: Sequence, ack: AckState },
    Ack { ack: AckState },
    KeepAlive { ack: AckState },
    Reliable { sequence: Sequence, ack: AckState, order: Sequence },
    ReliableFragment { sequence: Sequence, ack: AckState, order: Sequence, fragment: FragmentHeader },
}

impl PacketHeader {
    pub fn packet_type(&self) -> PacketType {
        match self {
            PacketHeader::Command => PacketType::Command,
            PacketHeader::Unreliable => PacketType::Unreliable,
            PacketHeader::Notify { .. } => PacketType::Notify,
            PacketHeader::Ack { .. } => PacketType::Ack,
            PacketHeader::KeepAlive { .. } => PacketType::KeepAlive,
            PacketHeader::Reliable { .. } => PacketType::Reliable,
            PacketHeader::ReliableFragment { .. } => PacketType::ReliableFragment,
        }
    }

    pub fn serialized_len(&self) -> usize {
        match self {
            PacketHeader::Command => TYPE_LEN,
            PacketHeader::Unreliable => UNRELIABLE_HEADER_LEN,
            PacketHeader::Notify { .. } => NOTIFY_HEADER_LEN,
            PacketHeader::Ack { .. } | PacketHeader::KeepAlive { .. } => ACK_HEADER_LEN,
            PacketHeader::Reliable { .. } => RELIABLE_HEADER_LEN,
            PacketHeader::ReliableFragment { .. } => FRAGMENT_HEADER_LEN,
        }
    }

    /// the peer's ack state carried by this packet, together with the number of valid mask bits
    pub fn ack_state(&self) -> Option<(AckState, u32)> {
        match self {
            PacketHeader::Command | PacketHeader::Unreliable => None,
            PacketHeader::Notify { ack, .. } |
            PacketHeader::Ack { ack } |
            PacketHeader::KeepAlive { ack } => Some((*ack, SHORT_ACK_WINDOW)),
            PacketHeader::Reliable { ack, .. } |
            PacketHeader::ReliableFragment { ack, .. } => Some((*ack, LONG_ACK_WINDOW)),
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.packet_type().into());

        match self {
            PacketHeader::Command | PacketHeader::Unreliable => {}
            PacketHeader::Notify { sequence, ack } => {
                buf.put_u16(sequence.to_raw());
                ack.ser_short(buf);
            }
            PacketHeader::Ack { ack } | PacketHeader::KeepAlive { ack } => {
                ack.ser_short(buf);
            }
            PacketHeader::Reliable { sequence, ack, order } => {
                buf.put_u16(sequence.to_raw());
                ack.ser_long(buf);
                buf.put_u16(order.to_raw());
            }
            PacketHeader::ReliableFragment { sequence, ack, order, fragment } => {
                buf.put_u16(sequence.to_raw());
                ack.ser_long(buf);
                buf.put_u16(order.to_raw());
                buf.put_u8(fragment.index);
                buf.put_u8(fragment.count);
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        let raw_type = buf.try_get_u8()?;
        let packet_type = PacketType::try_from(raw_type)
            .map_err(|_| anyhow!("invalid packet type {}", raw_type))?;

        let header = match packet_type {
            PacketType::Command => PacketHeader::Command,
            PacketType::Unreliable => PacketHeader::Unreliable,
            PacketType::Notify => {
                let sequence = Sequence::from_raw(buf.try_get_u16()?);
                let ack = AckState::deser_short(buf)?;
                PacketHeader::Notify { sequence, ack }
            }
            PacketType::Ack => PacketHeader::Ack { ack: AckState::deser_short(buf)? },
            PacketType::KeepAlive => PacketHeader::KeepAlive { ack: AckState::deser_short(buf)? },
            PacketType::Reliable => {
                let sequence = Sequence::from_raw(buf.try_get_u16()?);
                let ack = AckState::deser_long(buf)?;
                let order = Sequence::from_raw(buf.try_get_u16()?);
                PacketHeader::Reliable { sequence, ack, order }
            }
            PacketType::ReliableFragment => {
                let sequence = Sequence::from_raw(buf.try_get_u16()?);
                let ack = AckState::deser_long(buf)?;
                let order = Sequence::from_raw(buf.try_get_u16()?);
                let index = buf.try_get_u8()?;
                let count = buf.try_get_u8()?;
                PacketHeader::ReliableFragment { sequence, ack, order, fragment: FragmentHeader { index, count } }
            }
        };
        Ok(header)
    }
}
