//! # Packet Queue
//!
//! Strict FIFO of media packets awaiting transmission. The congestion-paced
//! sender is the only consumer; the sender task is also the only producer, so
//! no internal locking is needed.
//!
//! The queue keeps a running byte count so that [`PacketQueue::total_bytes`]
//! is O(1) on the pacing hot path.

use std::collections::VecDeque;

use crate::clock::ntp_to_secs;
use crate::media::MediaPacket;

/// A queued packet plus its enqueue time (NTP units).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub packet: MediaPacket,
    pub enqueued_at: u32,
}

impl QueueItem {
    pub fn new(packet: MediaPacket, enqueued_at: u32) -> Self {
        QueueItem {
            packet,
            enqueued_at,
        }
    }

    /// Encoded size of the packet.
    pub fn size(&self) -> usize {
        self.packet.wire_len()
    }
}

/// Read-only view of queue occupancy offered to the congestion engine.
pub trait QueueStatus {
    fn len(&self) -> usize;
    fn total_bytes(&self) -> usize;
    fn peek_size(&self) -> usize;
    fn peek_seq(&self) -> Option<u16>;
    /// Queuing delay of the head packet in seconds.
    fn delay(&self, now: u32) -> f64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// FIFO packet queue.
#[derive(Debug, Default)]
pub struct PacketQueue {
    items: VecDeque<QueueItem>,
    bytes: usize,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        PacketQueue {
            items: VecDeque::with_capacity(capacity),
            bytes: 0,
        }
    }

    /// Append an item.
    pub fn push(&mut self, item: QueueItem) {
        self.bytes += item.size();
        self.items.push_back(item);
    }

    /// Remove and return the oldest item, or `None` when empty.
    pub fn pop(&mut self) -> Option<QueueItem> {
        let item = self.items.pop_front()?;
        self.bytes -= item.size();
        Some(item)
    }

    /// Size of the head packet, or 0 when empty.
    pub fn peek_size(&self) -> usize {
        self.items.front().map(QueueItem::size).unwrap_or(0)
    }

    /// Sequence number of the head packet.
    pub fn peek_seq(&self) -> Option<u16> {
        self.items.front().map(|i| i.packet.seq)
    }

    /// Sum of the encoded sizes of all queued packets.
    pub fn total_bytes(&self) -> usize {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop every queued packet. Returns how many were discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.items.len();
        self.items.clear();
        self.bytes = 0;
        n
    }

    /// Queuing delay of the head packet at `now`, in seconds.
    pub fn delay(&self, now: u32) -> f64 {
        match self.items.front() {
            Some(item) => ntp_to_secs(now.wrapping_sub(item.enqueued_at)),
            None => 0.0,
        }
    }
}

impl QueueStatus for PacketQueue {
    fn len(&self) -> usize {
        PacketQueue::len(self)
    }

    fn total_bytes(&self) -> usize {
        PacketQueue::total_bytes(self)
    }

    fn peek_size(&self) -> usize {
        PacketQueue::peek_size(self)
    }

    fn peek_seq(&self) -> Option<u16> {
        PacketQueue::peek_seq(self)
    }

    fn delay(&self, now: u32) -> f64 {
        PacketQueue::delay(self, now)
    }
}
