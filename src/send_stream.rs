use std::cmp::min;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};
use crate::config::PeerConfig;
use crate::packet_header::{AckState, AckStatus, FragmentHeader};
use crate::peer_events::{NotifyResolution, NotifyToken};
use crate::sequence::Sequence;

/// A reliable packet that was not acknowledged yet, i.e. a complete small message or a single
///  fragment of a large one.
struct InFlight {
    order: Sequence,
    fragment: Option<FragmentHeader>,
    payload: Bytes,
    /// `None` until the first transmission
    last_sent: Option<Instant>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum SequenceOwner {
    Notify(NotifyToken),
    /// key into the in-flight buffer
    Reliable(u64),
}

struct SentSequence {
    owner: SequenceOwner,
    sent_at: Instant,
}

/// Everything needed to put a reliable packet on the wire
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transmission {
    pub sequence: Sequence,
    pub order: Sequence,
    pub fragment: Option<FragmentHeader>,
    pub payload: Bytes,
    pub is_resend: bool,
}

/// The outbound half of a connection's reliability engine. It hands out sequence numbers, keeps
///  reliable packets until they are acknowledged, and tracks notify tokens until they resolve.
///
/// Every transmission of a reliable packet gets its own sequence number, resends included. So an
///  ack always refers to one specific transmission, and a reliable packet is done as soon as any
///  of its transmissions is acked.
pub struct SendStream {
    config: Arc<PeerConfig>,

    next_sequence: Sequence,
    next_order: Sequence,
    next_in_flight_id: u64,
    next_notify_token: u64,

    /// Unacknowledged reliable packets, keyed by a local id that increases monotonically. So the
    ///  first entry always belongs to the oldest unacknowledged message.
    in_flight: BTreeMap<u64, InFlight>,

    /// sequence numbers that were sent and neither acked nor expired yet, and what they were used for
    sequence_owners: FxHashMap<u16, SentSequence>,

    resolutions: VecDeque<NotifyResolution>,
}

impl SendStream {
    pub fn new(config: Arc<PeerConfig>) -> SendStream {
        SendStream {
            config,
            next_sequence: Sequence::ZERO,
            next_order: Sequence::ZERO,
            next_in_flight_id: 0,
            next_notify_token: 0,
            in_flight: Default::default(),
            sequence_owners: Default::default(),
            resolutions: Default::default(),
        }
    }

    fn allocate_sequence(&mut self, owner: SequenceOwner, now: Instant) -> Sequence {
        let sequence = self.next_sequence;
        self.next_sequence = sequence.next();

        let previous = self.sequence_owners.insert(sequence.to_raw(), SentSequence { owner, sent_at: now });
        if let Some(previous) = previous {
            // the counter went all the way around without the peer ever acking this
            debug!("sequence number {} was reused while still unresolved", sequence);
            if let SequenceOwner::Notify(token) = previous.owner {
                self.resolutions.push_back(NotifyResolution::Lost(token));
            }
        }
        sequence
    }

    /// registers a new notify send, returning the sequence number for its packet
    pub fn send_notify(&mut self, now: Instant) -> (Sequence, NotifyToken) {
        let token = NotifyToken(self.next_notify_token);
        self.next_notify_token += 1;

        let sequence = self.allocate_sequence(SequenceOwner::Notify(token), now);
        trace!("notify {} gets sequence number {}", token, sequence);
        (sequence, token)
    }

    /// Splits a reliable message into packets and adds them to the in-flight buffer. Nothing is
    ///  transmitted here, the returned ids are due for transmission immediately.
    pub fn enqueue_reliable(&mut self, payload: &[u8]) -> anyhow::Result<Vec<u64>> {
        if let Some(oldest) = self.in_flight.values().next() {
            let num_unacked = self.next_order.distance(oldest.order);
            if num_unacked >= self.config.max_reliable_in_flight as i32 {
                bail!("reliable send window is full: {} messages are unacknowledged", num_unacked);
            }
        }

        if payload.len() > self.config.max_reliable_message_size() {
            bail!("reliable message of {} bytes exceeds the maximum of {} bytes", payload.len(), self.config.max_reliable_message_size());
        }

        let order = self.next_order;
        self.next_order = order.next();
        let payload = Bytes::copy_from_slice(payload);

        if payload.len() <= self.config.reliable_capacity() {
            trace!("reliable message {} goes out as a single packet", order);
            return Ok(vec![self.add_in_flight(order, None, payload)]);
        }

        let fragment_capacity = self.config.fragment_capacity();
        let count = u8::try_from(payload.len().div_ceil(fragment_capacity))?;
        trace!("reliable message {} of {} bytes is split into {} fragments", order, payload.len(), count);

        let mut ids = Vec::with_capacity(count as usize);
        for i in 0..count {
            let start = i as usize * fragment_capacity;
            let end = min(start + fragment_capacity, payload.len());
            let fragment = FragmentHeader {
                index: count - 1 - i,
                count,
            };
            ids.push(self.add_in_flight(order, Some(fragment), payload.slice(start..end)));
        }
        Ok(ids)
    }

    fn add_in_flight(&mut self, order: Sequence, fragment: Option<FragmentHeader>, payload: Bytes) -> u64 {
        let id = self.next_in_flight_id;
        self.next_in_flight_id += 1;
        self.in_flight.insert(id, InFlight {
            order,
            fragment,
            payload,
            last_sent: None,
        });
        id
    }

    /// in-flight packets that were never sent, or not within the resend interval
    pub fn due_for_transmission(&self, now: Instant) -> Vec<u64> {
        self.in_flight.iter()
            .filter(|(_, entry)| match entry.last_sent {
                None => true,
                Some(last_sent) => now.saturating_duration_since(last_sent) >= self.config.resend_interval,
            })
            .map(|(&id, _)| id)
            .collect()
    }

    /// assigns a fresh sequence number to an in-flight packet and marks it as sent
    pub fn transmit(&mut self, id: u64, now: Instant) -> Option<Transmission> {
        if !self.in_flight.contains_key(&id) {
            return None;
        }

        let sequence = self.allocate_sequence(SequenceOwner::Reliable(id), now);
        let entry = self.in_flight.get_mut(&id)?;
        let is_resend = entry.last_sent.is_some();
        entry.last_sent = Some(now);

        Some(Transmission {
            sequence,
            order: entry.order,
            fragment: entry.fragment,
            payload: entry.payload.clone(),
            is_resend,
        })
    }

    /// Processes the peer's ack state: acked notifies resolve as delivered, and acked reliable
    ///  packets leave the in-flight buffer. Notifies that fell out of the window covered by the
    ///  mask resolve as lost.
    ///
    /// Returns the round trip times of all acked transmissions.
    pub fn on_ack(&mut self, ack: AckState, window_bits: u32, now: Instant) -> Vec<Duration> {
        if ack.mask == 0 {
            // the peer did not receive anything yet, so `latest` is meaningless
            return Vec::new();
        }

        let mut rtt_samples = Vec::new();
        let mut resolved = Vec::new();
        let in_flight = &mut self.in_flight;

        self.sequence_owners.retain(|&raw, sent| {
            match ack.status_of(Sequence::from_raw(raw), window_bits) {
                AckStatus::Pending => true,
                AckStatus::Acked => {
                    match sent.owner {
                        SequenceOwner::Notify(token) => {
                            resolved.push(NotifyResolution::Delivered(token));
                        }
                        SequenceOwner::Reliable(id) => {
                            if in_flight.remove(&id).is_some() {
                                trace!("reliable packet acked with sequence number {}", raw);
                            }
                        }
                    }
                    rtt_samples.push(now.saturating_duration_since(sent.sent_at));
                    false
                }
                AckStatus::Expired => {
                    // expired reliable transmissions are simply forgotten, the resend timer
                    //  takes care of the packet
                    if let SequenceOwner::Notify(token) = sent.owner {
                        resolved.push(NotifyResolution::Lost(token));
                    }
                    false
                }
            }
        });

        resolved.sort_by_key(|r| r.token());
        self.resolutions.extend(resolved);
        rtt_samples
    }

    /// Resolves all pending notifies as lost and discards all in-flight packets. This is for
    ///  connection teardown.
    pub fn shutdown(&mut self) {
        let mut lost = self.sequence_owners.drain()
            .filter_map(|(_, sent)| match sent.owner {
                SequenceOwner::Notify(token) => Some(token),
                SequenceOwner::Reliable(_) => None,
            })
            .collect::<Vec<_>>();
        lost.sort();

        if !self.in_flight.is_empty() {
            debug!("discarding {} unacknowledged reliable packets", self.in_flight.len());
        }
        self.in_flight.clear();
        self.resolutions.extend(lost.into_iter().map(NotifyResolution::Lost));
    }

    pub fn poll_resolution(&mut self) -> Option<NotifyResolution> {
        self.resolutions.pop_front()
    }

    /// number of reliable messages with at least one unacknowledged packet
    pub fn num_unacked_messages(&self) -> usize {
        match self.in_flight.values().next() {
            None => 0,
            Some(oldest) => self.next_order.distance(oldest.order) as usize,
        }
    }

    pub fn num_in_flight_packets(&self) -> usize {
        self.in_flight.len()
    }

    pub fn num_pending_notifies(&self) -> usize {
        self.sequence_owners.values()
            .filter(|s| matches!(s.owner, SequenceOwner::Notify(_)))
            .count()
    }
}

impl NotifyResolution {
    pub fn token(&self) -> NotifyToken {
        match self {
            NotifyResolution::Delivered(token) | NotifyResolution::Lost(token) => *token,
        }
    }
}
