//! Reliable messaging over UDP: a peer runs connections to remote peers, each offering three
//!  channels with different delivery guarantees.
//!
//! * *unreliable*: fire and forget, no ordering, no duplicate detection
//! * *notify*: unordered and deduplicated, and the sender learns whether a message was
//!   delivered or lost
//! * *reliable*: ordered and deduplicated, with resends until acknowledged. Messages that do
//!   not fit into a single datagram are split into fragments.
//!
//! Every packet starts with a one-byte type tag. All numbers are big-endian:
//!
//! ```text
//! Command:          type(1) command(1) [body]
//! Unreliable:       type(1) payload
//! Notify:           type(1) sequence(2) ack(2) ack mask(4) payload
//! Ack / KeepAlive:  type(1) ack(2) ack mask(4)
//! Reliable:         type(1) sequence(2) ack(2) ack mask(8) order(2) payload
//! ReliableFragment: type(1) sequence(2) ack(2) ack mask(8) order(2) index(1) count(1) payload
//! ```
//!
//! Bit `i` of an ack mask means that sequence number `ack - i` was received.

pub mod ack_engine;
pub mod buffers;
pub mod config;
pub mod connection;
pub mod control_messages;
pub mod handshake;
pub mod metrics;
pub mod packet_header;
pub mod peer;
pub mod peer_events;
pub mod receive_stream;
pub mod send_stream;
pub mod sequence;
pub mod socket;
pub mod test_util;
pub mod util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
