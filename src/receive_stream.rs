use std::sync::Arc;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};
use crate::buffers::buffer_pool::{BufferPool, PooledBuf};
use crate::config::PeerConfig;
use crate::packet_header::{AckState, FragmentHeader, LONG_ACK_WINDOW};
use crate::sequence::Sequence;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RecordOutcome {
    New,
    Duplicate,
    /// too far behind the newest received sequence number to tell whether it is a duplicate
    TooOld,
}

/// The sequence numbers received from the peer, as the newest one plus a bit mask for the
///  preceding ones. This is what goes out as the local ack state.
#[derive(Clone, Debug, Default)]
pub struct ReceiveWindow {
    latest: Sequence,
    mask: u64,
}

impl ReceiveWindow {
    pub fn record(&mut self, sequence: Sequence) -> RecordOutcome {
        if self.mask == 0 {
            self.latest = sequence;
            self.mask = 1;
            return RecordOutcome::New;
        }

        let distance = sequence.distance(self.latest);
        if distance > 0 {
            let shift = distance as u32;
            self.mask = if shift >= LONG_ACK_WINDOW { 0 } else { self.mask << shift };
            self.mask |= 1;
            self.latest = sequence;
            return RecordOutcome::New;
        }

        let age = (-distance) as u32;
        if age >= LONG_ACK_WINDOW {
            return RecordOutcome::TooOld;
        }
        let bit = 1u64 << age;
        if self.mask & bit != 0 {
            return RecordOutcome::Duplicate;
        }
        self.mask |= bit;
        RecordOutcome::New
    }

    pub fn ack_state(&self) -> AckState {
        AckState {
            latest: self.latest,
            mask: self.mask,
        }
    }
}

/// Fragments received so far for a single order id
struct FragmentAssembly {
    count: u8,
    num_received: usize,
    /// indexed by fragment index, i.e. in reverse message order
    fragments: Vec<Option<PooledBuf>>,
}

/// The inbound half of a connection's reliability engine for reliable messages: it deduplicates
///  by order id, reassembles fragmented messages and releases messages strictly in order.
///
/// Order ids are accepted in the window `[next_order, next_order + max_reliable_in_flight)`,
///  which is the window the sender is bound to. Everything before it was released already,
///  and everything after it is malformed.
pub struct ReceiveStream {
    config: Arc<PeerConfig>,
    buffer_pool: BufferPool,
    window: ReceiveWindow,
    next_order: Sequence,
    partial: FxHashMap<u16, FragmentAssembly>,
    complete: FxHashMap<u16, PooledBuf>,
}

impl ReceiveStream {
    pub fn new(config: Arc<PeerConfig>, buffer_pool: BufferPool) -> ReceiveStream {
        ReceiveStream {
            config,
            buffer_pool,
            window: Default::default(),
            next_order: Sequence::ZERO,
            partial: Default::default(),
            complete: Default::default(),
        }
    }

    pub fn record_sequence(&mut self, sequence: Sequence) -> RecordOutcome {
        self.window.record(sequence)
    }

    pub fn ack_state(&self) -> AckState {
        self.window.ack_state()
    }

    /// Handles the payload of a reliable packet (a complete message or one fragment). The packet
    ///  may have been received before, anything that is not new is silently dropped.
    pub fn on_reliable(&mut self, order: Sequence, fragment: Option<FragmentHeader>, payload: &[u8]) {
        let offset = order.distance(self.next_order);
        if offset < 0 {
            trace!("order id {} was released already - dropping", order);
            return;
        }
        if offset >= self.config.max_reliable_in_flight as i32 {
            debug!("order id {} is beyond the receive window starting at {} - dropping", order, self.next_order);
            return;
        }
        if self.complete.contains_key(&order.to_raw()) {
            trace!("order id {} is complete already - dropping", order);
            return;
        }

        match fragment {
            None => {
                if self.partial.contains_key(&order.to_raw()) {
                    debug!("unfragmented packet for order id {} that has fragments - dropping", order);
                    return;
                }
                trace!("received reliable message {}", order);
                self.complete.insert(order.to_raw(), self.buffer_pool.copy_from_slice(payload));
            }
            Some(fragment) => self.on_fragment(order, fragment, payload),
        }
    }

    fn on_fragment(&mut self, order: Sequence, fragment: FragmentHeader, payload: &[u8]) {
        if fragment.count as usize > self.config.max_fragments {
            debug!("fragment count {} exceeds the configured maximum {} - dropping", fragment.count, self.config.max_fragments);
            return;
        }
        if fragment.index >= fragment.count {
            debug!("fragment index {} out of range for a count of {} - dropping", fragment.index, fragment.count);
            return;
        }

        let assembly = self.partial.entry(order.to_raw())
            .or_insert_with(|| FragmentAssembly {
                count: fragment.count,
                num_received: 0,
                fragments: (0..fragment.count).map(|_| None).collect(),
            });

        if assembly.count != fragment.count {
            debug!("fragment count {} for order id {} differs from the previously received {} - dropping", fragment.count, order, assembly.count);
            return;
        }

        let slot = &mut assembly.fragments[fragment.index as usize];
        if slot.is_some() {
            trace!("duplicate fragment {} for order id {} - dropping", fragment.index, order);
            return;
        }
        *slot = Some(self.buffer_pool.copy_from_slice(payload));
        assembly.num_received += 1;
        trace!("received fragment {} of {} for order id {}", fragment.index, fragment.count, order);

        if assembly.num_received < assembly.count as usize {
            return;
        }

        if let Some(assembly) = self.partial.remove(&order.to_raw()) {
            let mut message = self.buffer_pool.get_from_pool();
            // highest index first: index 0 is the end of the message
            for fragment in assembly.fragments.iter().rev().flatten() {
                message.buf_mut().extend_from_slice(fragment);
            }
            trace!("reassembled message {} of {} bytes", order, message.len());
            self.complete.insert(order.to_raw(), message);
        }
    }

    /// the next message in order, if it is complete
    pub fn next_reliable_message(&mut self) -> Option<PooledBuf> {
        let message = self.complete.remove(&self.next_order.to_raw())?;
        self.next_order = self.next_order.next();
        Some(message)
    }

    pub fn num_buffered_messages(&self) -> usize {
        self.complete.len() + self.partial.len()
    }
}
