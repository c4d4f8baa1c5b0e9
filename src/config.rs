use std::time::Duration;
use anyhow::bail;
use crate::packet_header::{COMMAND_HEADER_LEN, FRAGMENT_HEADER_LEN, RELIABLE_HEADER_LEN};

pub struct PeerConfig {
    /// This is the shared key that every `ConnectRequest` carries. A server rejects requests with
    ///  a different key, which keeps peers of different applications apart. It is *not* a
    ///  security feature.
    pub key: Vec<u8>,

    /// This is the maximum size of a datagram, including all protocol headers. Every packet the
    ///  peer builds fits into this, and received datagrams exceeding it are dropped.
    ///
    /// With full Ethernet frames and no optional IP headers, the UDP payload can be up to
    ///  `1500 - 20 - 8 = 1472` bytes for IPV4 and `1500 - 40 - 8 = 1452` for IPV6. The default
    ///  is lower than that to leave room for tunnels and VPNs on the route.
    pub mtu: usize,

    /// Maximum number of pieces a reliable message can be split into. This bounds the maximum
    ///  reliable message size to `max_fragments * fragment capacity`. At most 255 since the
    ///  fragment index is a single byte on the wire.
    pub max_fragments: usize,

    /// Server side: the number of live connections beyond which new requests are rejected
    pub max_connections: usize,

    pub connect_attempt_interval: Duration,
    pub max_connect_attempts: u32,

    /// A connection that did not receive anything for this long is disconnected with
    ///  `DisconnectReason::Timeout`
    pub disconnect_timeout: Duration,

    /// If sequenced packets were received and nothing carrying an ack went out for this long,
    ///  an `Ack` packet is sent
    pub time_before_empty_ack: Duration,
    /// If nothing at all was sent for this long, a `KeepAlive` is sent to keep the remote's
    ///  timeout clock current.
    ///
    /// Independent of `time_before_empty_ack`, which only applies while an ack is owed. Set
    ///  both to the same value for a single idle timer.
    pub keep_alive_interval: Duration,

    /// fixed retransmission timer for reliable packets
    pub resend_interval: Duration,

    /// This is the maximum number of reliable *messages* (not packets) that can be unacknowledged
    ///  at any given time. The receiver uses the same value to bound its reorder buffer. It must
    ///  stay well below half the order id range.
    pub max_reliable_in_flight: u16,

    /// This is the number of buffers that will be pooled at a given time - buffers in excess of
    ///  this number are discarded when they are returned.
    pub buffer_pool_size: usize,

    /// number of samples for the exponential moving average of RTT
    pub rtt_sample_count: u32,
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig {
            key: b"ackpeer".to_vec(),
            mtu: 1200,
            max_fragments: 16,
            max_connections: 4,
            connect_attempt_interval: Duration::from_millis(250),
            max_connect_attempts: 10,
            disconnect_timeout: Duration::from_secs(30),
            time_before_empty_ack: Duration::from_millis(100),
            keep_alive_interval: Duration::from_secs(1),
            resend_interval: Duration::from_millis(200),
            max_reliable_in_flight: 512,
            buffer_pool_size: 1024,
            rtt_sample_count: 10,
        }
    }
}

impl PeerConfig {
    pub fn new(key: impl Into<Vec<u8>>) -> PeerConfig {
        PeerConfig {
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu < FRAGMENT_HEADER_LEN + 16 {
            bail!("MTU of {} is too small", self.mtu);
        }
        if COMMAND_HEADER_LEN + self.key.len() > self.mtu {
            bail!("key of {} bytes does not fit into a connect request with an MTU of {}", self.key.len(), self.mtu);
        }
        if self.max_fragments == 0 || self.max_fragments > u8::MAX as usize {
            bail!("max_fragments must be between 1 and 255, was {}", self.max_fragments);
        }
        if self.max_connections == 0 {
            bail!("max_connections must be positive");
        }
        if self.max_connect_attempts == 0 {
            bail!("max_connect_attempts must be positive");
        }
        if self.max_reliable_in_flight == 0 || self.max_reliable_in_flight >= i16::MAX as u16 {
            bail!("max_reliable_in_flight must be between 1 and {}, was {}", i16::MAX - 1, self.max_reliable_in_flight);
        }
        if self.resend_interval.is_zero() || self.connect_attempt_interval.is_zero() {
            bail!("resend and connect attempt intervals must be positive");
        }
        if self.disconnect_timeout <= self.keep_alive_interval {
            bail!("disconnect timeout {:?} must be longer than the keep-alive interval {:?}", self.disconnect_timeout, self.keep_alive_interval);
        }
        if self.rtt_sample_count == 0 {
            bail!("rtt_sample_count must be positive");
        }
        Ok(())
    }

    /// payload capacity of a single `Reliable` packet
    pub fn reliable_capacity(&self) -> usize {
        self.mtu - RELIABLE_HEADER_LEN
    }

    /// payload capacity of a single `ReliableFragment` packet
    pub fn fragment_capacity(&self) -> usize {
        self.mtu - FRAGMENT_HEADER_LEN
    }

    pub fn max_reliable_message_size(&self) -> usize {
        if self.max_fragments == 1 {
            self.reliable_capacity()
        }
        else {
            self.max_fragments * self.fragment_capacity()
        }
    }
}
