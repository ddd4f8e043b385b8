//! Per-channel reliability state.
//!
//! Each connection carries [`NUM_CHANNELS`](super::wire::NUM_CHANNELS)
//! independent lanes. A channel turns the lossy datagram flow into ordered,
//! deduplicated, arbitrarily-sized delivery:
//!
//! - outgoing reliable packets get a wrapping sequence number and sit in
//!   `pending_acks` until acknowledged, retransmitted on a fixed interval
//!   up to the retry ceiling;
//! - oversized payloads are split into chunks sharing a split id and
//!   reassembled only when every chunk is present;
//! - incoming reliable packets are deduplicated against the expected-
//!   sequence window and released strictly in order through a reorder
//!   buffer bounded to a fixed window ahead of the expected sequence; a
//!   gap blocks later packets until filled or the bounded reorder timeout
//!   forces a skip (a skip abandons the missing packet, it does not
//!   reorder past it).
//!
//! Timers here are logical: the owner calls the `due_*`/`maintain` scans
//! each poll cycle with the current instant.

use super::wire::{seq_before, SplitHeader, WirePacket};
use crate::error::{ProtocolError, Result};
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Furthest a buffered sequence may run ahead of `expected_seq`. Anything
/// beyond is dropped unacked, so the sender retransmits it once the window
/// has advanced; without the bound a remote could park close to half the
/// sequence space in the reorder buffer.
const REORDER_WINDOW: u16 = 256;

/// Fixed per-datagram header overhead: peer id, channel, flags
const BASE_OVERHEAD: usize = 4;
/// Sequence number bytes on reliable packets
const SEQ_OVERHEAD: usize = 2;
/// Split sub-header bytes
const SPLIT_OVERHEAD: usize = 6;

/// One reliable packet awaiting acknowledgment
struct PendingReliable {
    packet: WirePacket,
    sent_at: Instant,
    retries: u32,
}

/// One payload unit after sequencing: possibly a chunk of a split
struct DataUnit {
    split: Option<SplitHeader>,
    payload: Bytes,
}

/// Partially reassembled split payload
struct SplitBuffer {
    chunks: Vec<Option<Bytes>>,
    received: u16,
    created_at: Instant,
}

/// One ordered delivery lane of a peer connection
pub struct Channel {
    id: u8,
    /// Next outgoing reliable sequence number (wraps at the modulus)
    out_seq: u16,
    next_split_id: u16,
    pending_acks: BTreeMap<u16, PendingReliable>,
    /// Next incoming sequence number owed to the application
    expected_seq: u16,
    reorder: BTreeMap<u16, DataUnit>,
    /// When the current head-of-line gap was first observed
    gap_since: Option<Instant>,
    splits: HashMap<u16, SplitBuffer>,
}

impl Channel {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            out_seq: 0,
            next_split_id: 0,
            pending_acks: BTreeMap::new(),
            expected_seq: 0,
            reorder: BTreeMap::new(),
            gap_since: None,
            splits: HashMap::new(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.pending_acks.len()
    }

    /// Frame an outbound payload into one or more wire packets, splitting
    /// above the datagram limit. Reliable packets are recorded for
    /// retransmission.
    pub fn send(
        &mut self,
        peer_id: u16,
        reliable: bool,
        payload: Bytes,
        datagram_limit: usize,
        now: Instant,
    ) -> Result<Vec<WirePacket>> {
        let plain_cap = datagram_limit
            .saturating_sub(BASE_OVERHEAD + if reliable { SEQ_OVERHEAD } else { 0 });
        if plain_cap == 0 {
            return Err(ProtocolError::ConfigError(
                "datagram limit smaller than packet header".into(),
            ));
        }

        let mut packets = Vec::new();
        if payload.len() <= plain_cap {
            packets.push(self.frame(peer_id, reliable, None, payload, now));
            return Ok(packets);
        }

        let chunk_cap = plain_cap.saturating_sub(SPLIT_OVERHEAD);
        if chunk_cap == 0 {
            return Err(ProtocolError::ConfigError(
                "datagram limit smaller than split header".into(),
            ));
        }
        let chunk_count = payload.len().div_ceil(chunk_cap);
        if chunk_count > u16::MAX as usize {
            return Err(ProtocolError::FieldOutOfRange { field: "payload" });
        }

        let split_id = self.next_split_id;
        self.next_split_id = self.next_split_id.wrapping_add(1);

        for (index, chunk) in payload.chunks(chunk_cap).enumerate() {
            let header = SplitHeader {
                split_id,
                chunk_count: chunk_count as u16,
                chunk_index: index as u16,
            };
            packets.push(self.frame(
                peer_id,
                reliable,
                Some(header),
                payload.slice_ref(chunk),
                now,
            ));
        }
        debug!(
            channel = self.id,
            split_id,
            chunks = chunk_count,
            bytes = payload.len(),
            "split oversized payload"
        );
        Ok(packets)
    }

    fn frame(
        &mut self,
        peer_id: u16,
        reliable: bool,
        split: Option<SplitHeader>,
        payload: Bytes,
        now: Instant,
    ) -> WirePacket {
        let seq = if reliable {
            let seq = self.out_seq;
            self.out_seq = self.out_seq.wrapping_add(1);
            seq
        } else {
            0
        };
        let mut packet = WirePacket::data(peer_id, self.id, reliable, seq, payload);
        packet.split = split;
        if reliable {
            self.pending_acks.insert(
                seq,
                PendingReliable {
                    packet: packet.clone(),
                    sent_at: now,
                    retries: 0,
                },
            );
        }
        packet
    }

    /// Feed one received data packet through dedup, ordering, and
    /// reassembly.
    ///
    /// Returns the sequence number to acknowledge (for reliable packets,
    /// duplicates included) and any logical payloads that became
    /// deliverable, in channel order.
    pub fn receive(
        &mut self,
        packet: WirePacket,
        now: Instant,
    ) -> (Option<u16>, Vec<Bytes>) {
        let super::wire::PacketBody::Data(payload) = packet.body else {
            return (None, Vec::new());
        };
        let unit = DataUnit {
            split: packet.split,
            payload,
        };

        if !packet.reliable {
            // Unreliable lane: no sequencing, deliver (or buffer the chunk)
            // immediately
            let mut out = Vec::new();
            if let Some(done) = self.assemble(unit, now) {
                out.push(done);
            }
            return (None, out);
        }

        let ack = Some(packet.seq);

        if seq_before(packet.seq, self.expected_seq) {
            trace!(channel = self.id, seq = packet.seq, "stale duplicate dropped");
            return (ack, Vec::new());
        }
        if packet.seq.wrapping_sub(self.expected_seq) >= REORDER_WINDOW {
            debug!(
                channel = self.id,
                seq = packet.seq,
                expected = self.expected_seq,
                "sequence beyond reorder window dropped"
            );
            return (None, Vec::new());
        }
        if packet.seq != self.expected_seq && self.reorder.contains_key(&packet.seq) {
            trace!(channel = self.id, seq = packet.seq, "buffered duplicate dropped");
            return (ack, Vec::new());
        }

        self.reorder.insert(packet.seq, unit);
        let released = self.release_in_order(now);
        (ack, released)
    }

    /// Pop the contiguous run starting at `expected_seq` out of the reorder
    /// buffer and assemble it
    fn release_in_order(&mut self, now: Instant) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Some(unit) = self.reorder.remove(&self.expected_seq) {
            self.expected_seq = self.expected_seq.wrapping_add(1);
            if let Some(done) = self.assemble(unit, now) {
                out.push(done);
            }
        }
        self.gap_since = if self.reorder.is_empty() {
            None
        } else {
            Some(self.gap_since.unwrap_or(now))
        };
        out
    }

    /// Next buffered sequence number in wrapping order relative to
    /// `expected_seq`
    fn oldest_buffered(&self) -> Option<u16> {
        self.reorder
            .range(self.expected_seq..)
            .map(|(seq, _)| *seq)
            .next()
            .or_else(|| self.reorder.keys().next().copied())
    }

    /// Feed a sequenced unit into split reassembly, or pass it through
    fn assemble(&mut self, unit: DataUnit, now: Instant) -> Option<Bytes> {
        let Some(header) = unit.split else {
            return Some(unit.payload);
        };

        let buffer = self
            .splits
            .entry(header.split_id)
            .or_insert_with(|| SplitBuffer {
                chunks: vec![None; header.chunk_count as usize],
                received: 0,
                created_at: now,
            });
        if buffer.chunks.len() != header.chunk_count as usize {
            warn!(
                channel = self.id,
                split_id = header.split_id,
                "split chunk count mismatch, dropping chunk"
            );
            return None;
        }
        let slot = &mut buffer.chunks[header.chunk_index as usize];
        if slot.is_none() {
            *slot = Some(unit.payload);
            buffer.received += 1;
        }
        if buffer.received as usize != buffer.chunks.len() {
            return None;
        }

        let buffer = self.splits.remove(&header.split_id)?;
        let mut whole = BytesMut::new();
        for chunk in buffer.chunks.into_iter().flatten() {
            whole.extend_from_slice(&chunk);
        }
        Some(whole.freeze())
    }

    /// Remove the acknowledged packet from the retransmit buffer. Unknown
    /// sequence numbers are late or duplicate ACKs and are ignored.
    pub fn acknowledge(&mut self, seq: u16) {
        if self.pending_acks.remove(&seq).is_none() {
            trace!(channel = self.id, seq, "ack for unknown sequence ignored");
        }
    }

    /// Collect reliable packets due for retransmission.
    ///
    /// # Errors
    /// `PeerUnresponsive` once any packet exhausts the retry ceiling.
    pub fn due_retransmits(
        &mut self,
        now: Instant,
        interval: std::time::Duration,
        ceiling: u32,
    ) -> Result<Vec<WirePacket>> {
        let mut due = Vec::new();
        for (seq, pending) in self.pending_acks.iter_mut() {
            if now.duration_since(pending.sent_at) < interval {
                continue;
            }
            if pending.retries >= ceiling {
                warn!(
                    channel = self.id,
                    seq = *seq,
                    retries = pending.retries,
                    "retry ceiling exceeded"
                );
                return Err(ProtocolError::PeerUnresponsive);
            }
            pending.retries += 1;
            pending.sent_at = now;
            due.push(pending.packet.clone());
        }
        Ok(due)
    }

    /// Run the bounded-wait policies: skip a head-of-line gap older than
    /// `reorder_timeout` (returning whatever becomes deliverable) and evict
    /// split buffers older than `split_ttl` with no delivery.
    pub fn maintain(
        &mut self,
        now: Instant,
        reorder_timeout: std::time::Duration,
        split_ttl: std::time::Duration,
    ) -> Vec<Bytes> {
        let before = self.splits.len();
        self.splits
            .retain(|_, buffer| now.duration_since(buffer.created_at) < split_ttl);
        if self.splits.len() < before {
            debug!(
                channel = self.id,
                evicted = before - self.splits.len(),
                "evicted stale split buffers"
            );
        }

        let expired = matches!(self.gap_since, Some(since)
            if now.duration_since(since) >= reorder_timeout);
        if !expired {
            return Vec::new();
        }
        let Some(next) = self.oldest_buffered() else {
            self.gap_since = None;
            return Vec::new();
        };
        debug!(
            channel = self.id,
            from = self.expected_seq,
            to = next,
            "reorder timeout, skipping gap"
        );
        self.expected_seq = next;
        self.release_in_order(now)
    }
}
