//! Inbound reordering and loss-tolerant delivery
//!
//! Audio frames arrive over UDP out of order or not at all. Each peer runs
//! one jitter buffer: arriving packets sit in a priority queue for a fixed
//! dwell time, then come out strictly ordered by sequence number. Frames
//! that never show up are skipped rather than waited for, trading a small
//! fixed delay for in-order delivery without retransmission.

use crate::buffer::packet::PacketBuffer;
use crate::codec::errors::TransportError;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

/// Dwell time before a buffered packet becomes eligible for release
///
/// Out-of-order arrivals get this long to show up and slot in ahead.
pub const PACKET_DELAY: Duration = Duration::from_millis(50);

/// Pending-queue depth above which the oldest packet is discarded
///
/// Caps latency growth when the network runs consistently ahead of the
/// consumer.
pub const OVERFLOW_THRESHOLD: usize = 10;

/// Min-heap entry ordered by ascending sequence number
struct Pending(PacketBuffer);

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.sequence().cmp(&self.0.sequence())
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.0.sequence() == other.0.sequence()
    }
}

impl Eq for Pending {}

/// Per-peer reordering buffer for inbound audio
///
/// `last_delivered` never decreases, and no buffer is released twice. Loss
/// accounting belongs to the caller: the gap between the sequence numbers of
/// two consecutive releases, minus one, is the number of frames lost between
/// them.
pub struct JitterBuffer {
    pending: BinaryHeap<Pending>,
    last_delivered: u32,
}

impl JitterBuffer {
    pub fn new() -> Self {
        JitterBuffer {
            pending: BinaryHeap::new(),
            last_delivered: 0,
        }
    }

    /// Accept an arriving packet, stamping its arrival time
    ///
    /// Fails with `EmptyPayload` if the packet carries no data; the packet
    /// is consumed either way.
    pub fn admit(&mut self, mut packet: PacketBuffer) -> crate::Result<()> {
        if packet.is_empty() {
            return Err(TransportError::EmptyPayload.into());
        }
        packet.stamp_received();
        self.pending.push(Pending(packet));
        Ok(())
    }

    /// Release the next in-order packet, if one has aged past the dwell time
    ///
    /// Stale packets, those with sequence numbers below the last release,
    /// arrived too late to matter and are discarded. When the queue
    /// grows past `OVERFLOW_THRESHOLD` the oldest entries are discarded
    /// first to bound latency.
    pub fn try_release(&mut self) -> Option<PacketBuffer> {
        loop {
            while self.pending.len() > OVERFLOW_THRESHOLD {
                if let Some(evicted) = self.pending.pop() {
                    tracing::trace!(sequence = evicted.0.sequence(), "jitter queue overflow, dropping oldest");
                }
            }

            let front = self.pending.peek()?;
            match front.0.received_at() {
                Some(arrived) if arrived.elapsed() < PACKET_DELAY => return None,
                _ => {}
            }

            let Some(Pending(packet)) = self.pending.pop() else {
                return None;
            };
            if packet.sequence() < self.last_delivered {
                continue;
            }
            self.last_delivered = packet.sequence();
            return Some(packet);
        }
    }

    /// Sequence number of the most recent release, 0 before any delivery
    pub fn last_delivered(&self) -> u32 {
        self.last_delivered
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for JitterBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn packet(sequence: u32) -> PacketBuffer {
        let mut packet = PacketBuffer::new();
        packet.set_sequence(sequence);
        packet.set_payload(b"frame").unwrap();
        packet
    }

    fn aged() -> Duration {
        PACKET_DELAY + Duration::from_millis(15)
    }

    #[test]
    fn test_out_of_order_arrivals_release_in_order() {
        let mut jitter = JitterBuffer::new();
        for sequence in [3, 1, 5, 2, 4] {
            jitter.admit(packet(sequence)).unwrap();
        }
        sleep(aged());

        let mut released = Vec::new();
        while let Some(packet) = jitter.try_release() {
            released.push(packet.sequence());
        }
        assert_eq!(released, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_nothing_released_before_dwell_time() {
        let mut jitter = JitterBuffer::new();
        jitter.admit(packet(1)).unwrap();
        assert!(jitter.try_release().is_none());
        assert_eq!(jitter.len(), 1);

        sleep(aged());
        assert_eq!(jitter.try_release().unwrap().sequence(), 1);
    }

    #[test]
    fn test_loss_is_visible_in_sequence_gaps() {
        let mut jitter = JitterBuffer::new();
        for sequence in [1, 2, 4] {
            jitter.admit(packet(sequence)).unwrap();
        }
        sleep(aged());

        let mut previous = 0u32;
        let mut losses = Vec::new();
        while let Some(packet) = jitter.try_release() {
            losses.push(packet.sequence().saturating_sub(previous + 1));
            previous = packet.sequence();
        }
        assert_eq!(losses, vec![0, 0, 1]);
    }

    #[test]
    fn test_stale_packet_is_never_redelivered() {
        let mut jitter = JitterBuffer::new();
        for sequence in [4, 5] {
            jitter.admit(packet(sequence)).unwrap();
        }
        sleep(aged());
        assert_eq!(jitter.try_release().unwrap().sequence(), 4);
        assert_eq!(jitter.try_release().unwrap().sequence(), 5);

        jitter.admit(packet(3)).unwrap();
        sleep(aged());
        assert!(jitter.try_release().is_none());
        assert!(jitter.is_empty());
        assert_eq!(jitter.last_delivered(), 5);
    }

    #[test]
    fn test_overflow_discards_oldest_first() {
        let mut jitter = JitterBuffer::new();
        for sequence in 1..=(OVERFLOW_THRESHOLD as u32 + 2) {
            jitter.admit(packet(sequence)).unwrap();
        }

        // Fresh packets: overflow eviction runs, dwell gate still holds.
        assert!(jitter.try_release().is_none());
        assert_eq!(jitter.len(), OVERFLOW_THRESHOLD);

        sleep(aged());
        assert_eq!(jitter.try_release().unwrap().sequence(), 3);
    }

    #[test]
    fn test_empty_packet_rejected() {
        let mut jitter = JitterBuffer::new();
        let mut empty = PacketBuffer::new();
        empty.set_sequence(1);
        assert!(jitter.admit(empty).is_err());
        assert!(jitter.is_empty());
    }
}
