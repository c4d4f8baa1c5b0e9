//! The per-connection reliability engine, turning a lossy, unordered datagram channel into the
//!  three delivery semantics of the protocol.
//!
//! The engine is sans-io: outgoing packets are queued in an outbox that the connection drains,
//!  and received packets are passed in by the caller. All timing is based on `now` values that
//!  are passed in, so the engine never reads a clock.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use anyhow::bail;
use tracing::{debug, trace};
use crate::buffers::buffer_pool::{BufferPool, PooledBuf};
use crate::config::PeerConfig;
use crate::metrics::ConnectionMetrics;
use crate::packet_header::{PacketHeader, NOTIFY_HEADER_LEN, UNRELIABLE_HEADER_LEN};
use crate::peer_events::{Channel, NotifyResolution, NotifyToken};
use crate::receive_stream::{ReceiveStream, RecordOutcome};
use crate::send_stream::{SendStream, Transmission};

pub struct AckEngine {
    config: Arc<PeerConfig>,
    buffer_pool: BufferPool,

    send_stream: SendStream,
    receive_stream: ReceiveStream,

    outbox: VecDeque<PooledBuf>,
    /// received unreliable and notify payloads; reliable messages wait in the receive stream
    received: VecDeque<(Channel, PooledBuf)>,

    /// Set when the first sequenced packet arrives after the last packet carrying our ack state
    ///  went out. An empty `Ack` is sent if nothing else carries the ack state in time.
    ack_pending_since: Option<Instant>,
    last_send: Instant,

    metrics: ConnectionMetrics,
}

impl AckEngine {
    pub fn new(config: Arc<PeerConfig>, buffer_pool: BufferPool, now: Instant) -> AckEngine {
        AckEngine {
            send_stream: SendStream::new(config.clone()),
            receive_stream: ReceiveStream::new(config.clone(), buffer_pool.clone()),
            metrics: ConnectionMetrics::new(config.rtt_sample_count),
            config,
            buffer_pool,
            outbox: Default::default(),
            received: Default::default(),
            ack_pending_since: None,
            last_send: now,
        }
    }

    pub fn send_unreliable(&mut self, payload: &[u8], now: Instant) -> anyhow::Result<()> {
        if UNRELIABLE_HEADER_LEN + payload.len() > self.config.mtu {
            bail!("unreliable payload of {} bytes exceeds the capacity of {} bytes", payload.len(), self.config.mtu - UNRELIABLE_HEADER_LEN);
        }

        let mut buf = self.buffer_pool.get_from_pool();
        PacketHeader::Unreliable.ser(buf.buf_mut());
        buf.buf_mut().extend_from_slice(payload);
        self.enqueue_packet(buf, now);
        Ok(())
    }

    pub fn send_notify(&mut self, payload: &[u8], now: Instant) -> anyhow::Result<NotifyToken> {
        if NOTIFY_HEADER_LEN + payload.len() > self.config.mtu {
            bail!("notify payload of {} bytes exceeds the capacity of {} bytes", payload.len(), self.config.mtu - NOTIFY_HEADER_LEN);
        }

        let (sequence, token) = self.send_stream.send_notify(now);

        let mut buf = self.buffer_pool.get_from_pool();
        PacketHeader::Notify {
            sequence,
            ack: self.receive_stream.ack_state(),
        }.ser(buf.buf_mut());
        buf.buf_mut().extend_from_slice(payload);
        self.enqueue_ack_bearing(buf, now);
        Ok(token)
    }

    pub fn send_reliable(&mut self, payload: &[u8], now: Instant) -> anyhow::Result<()> {
        for id in self.send_stream.enqueue_reliable(payload)? {
            self.transmit(id, now);
        }
        Ok(())
    }

    fn transmit(&mut self, id: u64, now: Instant) {
        let Some(transmission) = self.send_stream.transmit(id, now) else {
            return;
        };
        let Transmission { sequence, order, fragment, payload, is_resend } = transmission;

        if is_resend {
            trace!("resending reliable packet for order id {} as {}", order, sequence);
            self.metrics.reliable_resends += 1;
        }

        let ack = self.receive_stream.ack_state();
        let header = match fragment {
            None => PacketHeader::Reliable { sequence, ack, order },
            Some(fragment) => PacketHeader::ReliableFragment { sequence, ack, order, fragment },
        };

        let mut buf = self.buffer_pool.get_from_pool();
        header.ser(buf.buf_mut());
        buf.buf_mut().extend_from_slice(&payload);
        self.enqueue_ack_bearing(buf, now);
    }

    /// queues a complete packet that the engine does not track, e.g. a command
    pub fn enqueue_packet(&mut self, buf: PooledBuf, now: Instant) {
        self.metrics.packets_sent += 1;
        self.last_send = now;
        self.outbox.push_back(buf);
    }

    fn enqueue_ack_bearing(&mut self, buf: PooledBuf, now: Instant) {
        self.ack_pending_since = None;
        self.enqueue_packet(buf, now);
    }

    fn mark_ack_pending(&mut self, now: Instant) {
        if self.ack_pending_since.is_none() {
            self.ack_pending_since = Some(now);
        }
    }

    /// Handles a received datagram. Malformed or duplicate packets are dropped, they never cause
    ///  an error.
    pub fn receive(&mut self, packet: &[u8], now: Instant) {
        self.metrics.packets_received += 1;

        let mut parse_buf = packet;
        let header = match PacketHeader::deser(&mut parse_buf) {
            Ok(header) => header,
            Err(e) => {
                debug!("dropping malformed packet: {}", e);
                return;
            }
        };
        let payload = parse_buf;

        if let Some((ack, window_bits)) = header.ack_state() {
            for rtt in self.send_stream.on_ack(ack, window_bits, now) {
                self.metrics.on_rtt_sample(rtt);
            }
        }

        match header {
            PacketHeader::Command => {
                debug!("command packet passed to the reliability engine - ignoring");
            }
            PacketHeader::Unreliable => {
                self.received.push_back((Channel::Unreliable, self.buffer_pool.copy_from_slice(payload)));
            }
            PacketHeader::Notify { sequence, .. } => {
                self.mark_ack_pending(now);
                match self.receive_stream.record_sequence(sequence) {
                    RecordOutcome::New => {
                        self.received.push_back((Channel::Notify, self.buffer_pool.copy_from_slice(payload)));
                    }
                    RecordOutcome::Duplicate => trace!("duplicate notify packet {} - dropping", sequence),
                    RecordOutcome::TooOld => debug!("notify packet {} is too old to check for duplicates - dropping", sequence),
                }
            }
            PacketHeader::Ack { .. } | PacketHeader::KeepAlive { .. } => {}
            PacketHeader::Reliable { sequence, order, .. } => {
                self.mark_ack_pending(now);
                // packets too old for the ack window are still deduplicated by their order id
                if self.receive_stream.record_sequence(sequence) == RecordOutcome::Duplicate {
                    trace!("duplicate reliable packet {} - dropping", sequence);
                    return;
                }
                self.receive_stream.on_reliable(order, None, payload);
            }
            PacketHeader::ReliableFragment { sequence, order, fragment, .. } => {
                self.mark_ack_pending(now);
                if self.receive_stream.record_sequence(sequence) == RecordOutcome::Duplicate {
                    trace!("duplicate reliable fragment {} - dropping", sequence);
                    return;
                }
                self.receive_stream.on_reliable(order, Some(fragment), payload);
            }
        }
    }

    /// Resends reliable packets that were not acked within the resend interval, and sends an
    ///  `Ack` or `KeepAlive` if nothing else went out for long enough.
    pub fn update(&mut self, now: Instant) {
        for id in self.send_stream.due_for_transmission(now) {
            self.transmit(id, now);
        }

        let ack_due = match self.ack_pending_since {
            Some(since) => now.saturating_duration_since(since) >= self.config.time_before_empty_ack,
            None => false,
        };

        if ack_due {
            trace!("sending empty ack");
            self.send_ack_only(PacketHeader::Ack { ack: self.receive_stream.ack_state() }, now);
        }
        else if now.saturating_duration_since(self.last_send) >= self.config.keep_alive_interval {
            trace!("sending keep-alive");
            self.send_ack_only(PacketHeader::KeepAlive { ack: self.receive_stream.ack_state() }, now);
        }
    }

    fn send_ack_only(&mut self, header: PacketHeader, now: Instant) {
        let mut buf = self.buffer_pool.get_from_pool();
        header.ser(buf.buf_mut());
        self.enqueue_ack_bearing(buf, now);
    }

    /// The next received application message. Unreliable and notify payloads come first, then
    ///  reliable messages in order.
    pub fn next_message(&mut self) -> Option<(Channel, PooledBuf)> {
        self.received.pop_front()
            .or_else(|| self.receive_stream.next_reliable_message().map(|msg| (Channel::Reliable, msg)))
    }

    pub fn poll_notify_resolution(&mut self) -> Option<NotifyResolution> {
        let resolution = self.send_stream.poll_resolution()?;
        match resolution {
            NotifyResolution::Delivered(_) => self.metrics.notify_delivered += 1,
            NotifyResolution::Lost(_) => self.metrics.notify_lost += 1,
        }
        Some(resolution)
    }

    pub fn pop_outgoing(&mut self) -> Option<PooledBuf> {
        self.outbox.pop_front()
    }

    /// Discards all queues. Pending notifies resolve as lost and can still be polled afterwards.
    pub fn shutdown(&mut self) {
        self.send_stream.shutdown();
        self.outbox.clear();
        self.received.clear();
        self.ack_pending_since = None;
    }

    pub fn metrics(&self) -> &ConnectionMetrics {
        &self.metrics
    }

    pub fn num_unacked_reliable_messages(&self) -> usize {
        self.send_stream.num_unacked_messages()
    }
}
