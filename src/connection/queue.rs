//! Outbound queue with certified-message tracking, and the receive-side
//! reorder buffer.
//!
//! Capacity counts every pending message: queued ones not yet written plus
//! certified ones written but not yet acknowledged. An uncertified message
//! stops counting once written.
//!
//! Each certified frame leaves with the channel's floor, the lowest sequence
//! still unresolved on the sender. Once a message is acknowledged, fails, or
//! is abandoned, its sequence stops holding the floor down, and the receiver
//! moves past gaps that will never fill.

use crate::config::RetryConfig;
use crate::connection::{MessageHeader, SendOptions};
use crate::error::{ProtocolError, Result};
use crate::protocol::frame::{Frame, FrameKind, MessageId};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Instant;
use tracing::debug;

#[derive(Debug)]
pub(crate) struct Outgoing {
    pub header: MessageHeader,
    pub frame: Frame,
}

#[derive(Debug)]
struct InFlight {
    header: MessageHeader,
    sequence: u32,
    /// Encoded frame, before translators
    encoded: Vec<u8>,
    /// Transmissions so far
    attempts: u32,
    next_due: Instant,
}

/// Work found by [`OutboundQueue::due`]
#[derive(Debug, Default)]
pub(crate) struct DueWork {
    pub retransmit: Vec<Vec<u8>>,
    pub failed: Vec<MessageHeader>,
}

#[derive(Debug)]
pub(crate) struct OutboundQueue {
    capacity: usize,
    queued: VecDeque<Outgoing>,
    in_flight: BTreeMap<MessageId, InFlight>,
    next_id: u32,
    sequences: HashMap<u8, u32>,
    /// Certified sequences neither acknowledged nor given up on, per channel
    unresolved: HashMap<u8, BTreeSet<u32>>,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queued: VecDeque::new(),
            in_flight: BTreeMap::new(),
            next_id: 1,
            sequences: HashMap::new(),
            unresolved: HashMap::new(),
        }
    }

    pub fn pending(&self) -> usize {
        self.queued.len() + self.in_flight.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.queued.is_empty() && self.in_flight.is_empty()
    }

    fn allocate_id(&mut self) -> MessageId {
        loop {
            let id = MessageId(self.next_id);
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if !self.in_flight.contains_key(&id) {
                return id;
            }
        }
    }

    /// Queue a message body, or refuse with `QueueFull`
    pub fn enqueue(&mut self, options: SendOptions, tag: u16, body: Vec<u8>) -> Result<MessageHeader> {
        if self.pending() >= self.capacity {
            return Err(ProtocolError::QueueFull {
                capacity: self.capacity,
            });
        }
        let id = self.allocate_id();
        let sequence = if options.certified {
            let next = self.sequences.entry(options.channel).or_insert(0);
            let seq = *next;
            *next = next.wrapping_add(1);
            self.unresolved.entry(options.channel).or_default().insert(seq);
            seq
        } else {
            0
        };
        let header = MessageHeader {
            id,
            channel: options.channel,
            certified: options.certified,
            type_tag: tag,
            origin: options.origin,
        };
        self.queued.push_back(Outgoing {
            header: header.clone(),
            frame: Frame {
                id,
                channel: options.channel,
                certified: options.certified,
                sequence,
                floor: 0,
                origin: options.origin,
                kind: FrameKind::Message { tag, body },
            },
        });
        Ok(header)
    }

    /// Next message to write, with its floor filled in
    pub fn pop_queued(&mut self) -> Option<Outgoing> {
        let mut outgoing = self.queued.pop_front()?;
        if outgoing.frame.certified {
            outgoing.frame.floor = self.floor(outgoing.frame.channel);
        }
        Some(outgoing)
    }

    /// Lowest unresolved sequence on `channel`, or the next one to be assigned
    pub fn floor(&self, channel: u8) -> u32 {
        let next = self.sequences.get(&channel).copied().unwrap_or(0);
        self.unresolved
            .get(&channel)
            .and_then(|open| open.iter().copied().max_by_key(|s| next.wrapping_sub(*s)))
            .unwrap_or(next)
    }

    fn resolve(&mut self, channel: u8, sequence: u32) {
        if let Some(open) = self.unresolved.get_mut(&channel) {
            open.remove(&sequence);
        }
    }

    /// Give up on a popped message that could not be written
    pub fn abandon(&mut self, outgoing: &Outgoing) {
        if outgoing.frame.certified {
            self.resolve(outgoing.frame.channel, outgoing.frame.sequence);
        }
    }

    /// Put a message back at the head after a failed write
    pub fn requeue_front(&mut self, outgoing: Outgoing) {
        self.queued.push_front(outgoing);
    }

    /// Start retry tracking after the first transmission
    pub fn track(
        &mut self,
        header: MessageHeader,
        sequence: u32,
        encoded: Vec<u8>,
        now: Instant,
        retry: &RetryConfig,
    ) {
        let next_due = now + retry.backoff(0);
        self.in_flight.insert(
            header.id,
            InFlight {
                header,
                sequence,
                encoded,
                attempts: 1,
                next_due,
            },
        );
    }

    /// Stop tracking an acknowledged message; `None` if it was not in flight
    pub fn acknowledge(&mut self, id: MessageId) -> Option<MessageHeader> {
        let flight = self.in_flight.remove(&id)?;
        self.resolve(flight.header.channel, flight.sequence);
        Some(flight.header)
    }

    /// Collect retransmissions that are due and messages that ran out of attempts
    pub fn due(&mut self, now: Instant, retry: &RetryConfig) -> DueWork {
        let mut work = DueWork::default();
        let mut exhausted = Vec::new();
        for (id, flight) in self.in_flight.iter_mut() {
            if flight.next_due > now {
                continue;
            }
            if flight.attempts >= retry.max_attempts {
                exhausted.push(*id);
                continue;
            }
            work.retransmit.push(flight.encoded.clone());
            flight.next_due = now + retry.backoff(flight.attempts);
            flight.attempts += 1;
        }
        for id in exhausted {
            if let Some(flight) = self.in_flight.remove(&id) {
                self.resolve(flight.header.channel, flight.sequence);
                work.failed.push(flight.header);
            }
        }
        work
    }

    /// Empty the queue; returns the headers of certified messages never acknowledged
    pub fn drain_unresolved(&mut self) -> Vec<MessageHeader> {
        let queued = self
            .queued
            .drain(..)
            .map(|o| o.header)
            .filter(|h| h.certified);
        let flying = std::mem::take(&mut self.in_flight)
            .into_values()
            .map(|f| f.header);
        let mut unresolved: Vec<_> = flying.chain(queued).collect();
        unresolved.sort_by_key(|h| h.id);
        self.unresolved.clear();
        unresolved
    }
}

/// What happened to an arriving certified frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Arrival {
    /// In order; appended to the ready list
    Delivered,
    /// Ahead of a gap; held until the gap fills or is skipped
    Held,
    /// Already delivered, already held, or below a skipped gap
    Stale,
    /// Hold limit reached; the frame must not be acknowledged
    Refused,
}

/// Per-channel sequence tracking for certified messages
#[derive(Debug)]
pub(crate) struct ReorderBuffer {
    /// Most frames held per channel
    limit: usize,
    expected: HashMap<u8, u32>,
    held: HashMap<u8, BTreeMap<u32, Frame>>,
}

impl ReorderBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            expected: HashMap::new(),
            held: HashMap::new(),
        }
    }

    /// Place a certified frame. Frames that became deliverable, the new one
    /// included, are appended to `ready` oldest first.
    pub fn accept(&mut self, frame: Frame, ready: &mut Vec<Frame>) -> Arrival {
        let channel = frame.channel;
        self.skip_to(channel, frame.floor, ready);

        let expected = self.expected.get(&channel).copied().unwrap_or(0);
        let distance = frame.sequence.wrapping_sub(expected) as i32;
        if distance < 0 {
            return Arrival::Stale;
        }
        if distance > 0 {
            let held = self.held.entry(channel).or_default();
            if held.contains_key(&frame.sequence) {
                return Arrival::Stale;
            }
            if held.len() >= self.limit {
                return Arrival::Refused;
            }
            held.insert(frame.sequence, frame);
            return Arrival::Held;
        }

        ready.push(frame);
        self.expected.insert(channel, expected.wrapping_add(1));
        self.release(channel, ready);
        Arrival::Delivered
    }

    /// Stop waiting for sequences below `floor` on `channel`. Held frames
    /// below it are released in sequence order.
    pub fn skip_to(&mut self, channel: u8, floor: u32, ready: &mut Vec<Frame>) {
        let expected = self.expected.get(&channel).copied().unwrap_or(0);
        if floor.wrapping_sub(expected) as i32 <= 0 {
            return;
        }
        if let Some(held) = self.held.get_mut(&channel) {
            let mut below: Vec<u32> = held
                .keys()
                .copied()
                .filter(|s| floor.wrapping_sub(*s) as i32 > 0)
                .collect();
            below.sort_by_key(|s| s.wrapping_sub(expected));
            ready.extend(below.into_iter().filter_map(|s| held.remove(&s)));
        }
        debug!(channel, from = expected, to = floor, "Skipping abandoned sequences");
        self.expected.insert(channel, floor);
        self.release(channel, ready);
    }

    fn release(&mut self, channel: u8, ready: &mut Vec<Frame>) {
        let Some(held) = self.held.get_mut(&channel) else {
            return;
        };
        let expected = self.expected.entry(channel).or_insert(0);
        while let Some(next) = held.remove(expected) {
            ready.push(next);
            *expected = expected.wrapping_add(1);
        }
    }

    pub fn held(&self) -> usize {
        self.held.values().map(BTreeMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::time::Duration;

    fn retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            initial_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(300),
            max_attempts,
        }
    }

    #[test]
    fn test_capacity_counts_queued_and_in_flight() {
        let mut q = OutboundQueue::new(2);
        let a = q.enqueue(SendOptions::certified(), 1, vec![]).unwrap();
        q.enqueue(SendOptions::unreliable(), 1, vec![]).unwrap();
        assert!(matches!(
            q.enqueue(SendOptions::certified(), 1, vec![]),
            Err(ProtocolError::QueueFull { capacity: 2 })
        ));

        let now = Instant::now();
        let first = q.pop_queued().unwrap();
        q.track(first.header, first.frame.sequence, vec![], now, &retry(3));
        // Uncertified message leaves the count once written
        q.pop_queued().unwrap();
        assert_eq!(q.pending(), 1);

        q.enqueue(SendOptions::certified(), 1, vec![]).unwrap();
        assert!(q.enqueue(SendOptions::certified(), 1, vec![]).is_err());
        assert_eq!(q.acknowledge(a.id).unwrap().id, a.id);
        assert!(q.enqueue(SendOptions::certified(), 1, vec![]).is_ok());
    }

    #[test]
    fn test_sequences_are_per_channel() {
        let mut q = OutboundQueue::new(8);
        q.enqueue(SendOptions::certified().on_channel(1), 0, vec![]).unwrap();
        q.enqueue(SendOptions::certified().on_channel(2), 0, vec![]).unwrap();
        q.enqueue(SendOptions::certified().on_channel(1), 0, vec![]).unwrap();
        let seqs: Vec<_> = std::iter::from_fn(|| q.pop_queued())
            .map(|o| (o.frame.channel, o.frame.sequence))
            .collect();
        assert_eq!(seqs, vec![(1, 0), (2, 0), (1, 1)]);
    }

    #[test]
    fn test_backoff_then_failure() {
        let mut q = OutboundQueue::new(4);
        let header = q.enqueue(SendOptions::certified(), 0, vec![]).unwrap();
        let start = Instant::now();
        let out = q.pop_queued().unwrap();
        q.track(out.header, out.frame.sequence, vec![7], start, &retry(3));

        let policy = retry(3);
        assert!(q.due(start + Duration::from_millis(50), &policy).retransmit.is_empty());
        let work = q.due(start + Duration::from_millis(100), &policy);
        assert_eq!(work.retransmit, vec![vec![7]]);
        // second retry waits 200ms
        assert!(q.due(start + Duration::from_millis(250), &policy).retransmit.is_empty());
        let work = q.due(start + Duration::from_millis(300), &policy);
        assert_eq!(work.retransmit.len(), 1);
        // third transmission was the last; next deadline fails it
        let work = q.due(start + Duration::from_millis(600), &policy);
        assert!(work.retransmit.is_empty());
        assert_eq!(work.failed, vec![header]);
        assert!(q.is_idle());
        assert!(q.acknowledge(work.failed[0].id).is_none());
    }

    #[test]
    fn test_drain_reports_certified_only() {
        let mut q = OutboundQueue::new(4);
        let c = q.enqueue(SendOptions::certified(), 0, vec![]).unwrap();
        q.enqueue(SendOptions::unreliable(), 0, vec![]).unwrap();
        assert_eq!(q.drain_unresolved(), vec![c]);
        assert!(q.is_idle());
    }

    fn frame(channel: u8, sequence: u32) -> Frame {
        floored(channel, sequence, 0)
    }

    fn floored(channel: u8, sequence: u32, floor: u32) -> Frame {
        Frame {
            id: MessageId(sequence + 1),
            channel,
            certified: true,
            sequence,
            floor,
            origin: None,
            kind: FrameKind::KeepAlive,
        }
    }

    fn sequences(frames: &[Frame]) -> Vec<u32> {
        frames.iter().map(|f| f.sequence).collect()
    }

    #[test]
    fn test_reorder_holds_until_gap_fills() {
        let mut buf = ReorderBuffer::new(16);
        let mut ready = Vec::new();
        assert_eq!(buf.accept(frame(0, 1), &mut ready), Arrival::Held);
        assert_eq!(buf.accept(frame(0, 2), &mut ready), Arrival::Held);
        assert_eq!(buf.accept(frame(0, 2), &mut ready), Arrival::Stale);
        assert_eq!(buf.held(), 2);
        assert!(ready.is_empty());

        assert_eq!(buf.accept(frame(0, 0), &mut ready), Arrival::Delivered);
        assert_eq!(sequences(&ready), vec![0, 1, 2]);
        ready.clear();
        assert_eq!(buf.accept(frame(0, 1), &mut ready), Arrival::Stale);
        assert_eq!(buf.accept(frame(5, 0), &mut ready), Arrival::Delivered);
    }

    #[test]
    fn test_floor_moves_past_abandoned_sequence() {
        let mut buf = ReorderBuffer::new(16);
        let mut ready = Vec::new();
        // 0 never arrives; 1 is held behind it
        assert_eq!(buf.accept(floored(0, 1, 0), &mut ready), Arrival::Held);
        assert_eq!(buf.accept(floored(0, 2, 1), &mut ready), Arrival::Delivered);
        assert_eq!(sequences(&ready), vec![1, 2]);
        assert_eq!(buf.held(), 0);

        ready.clear();
        assert_eq!(buf.accept(floored(0, 0, 0), &mut ready), Arrival::Stale);
        assert!(ready.is_empty());
    }

    #[test]
    fn test_skip_releases_held_frames() {
        let mut buf = ReorderBuffer::new(16);
        let mut ready = Vec::new();
        buf.accept(frame(3, 2), &mut ready);
        buf.accept(frame(3, 4), &mut ready);
        buf.skip_to(3, 3, &mut ready);
        assert_eq!(sequences(&ready), vec![2]);

        ready.clear();
        // A stale skip changes nothing
        buf.skip_to(3, 1, &mut ready);
        assert!(ready.is_empty());
        assert_eq!(buf.accept(frame(3, 3), &mut ready), Arrival::Delivered);
        assert_eq!(sequences(&ready), vec![3, 4]);
    }

    #[test]
    fn test_hold_limit_refuses() {
        let mut buf = ReorderBuffer::new(2);
        let mut ready = Vec::new();
        assert_eq!(buf.accept(frame(0, 1), &mut ready), Arrival::Held);
        assert_eq!(buf.accept(frame(0, 2), &mut ready), Arrival::Held);
        assert_eq!(buf.accept(frame(0, 3), &mut ready), Arrival::Refused);
        assert_eq!(buf.accept(frame(0, 0), &mut ready), Arrival::Delivered);
        assert_eq!(sequences(&ready), vec![0, 1, 2]);
    }

    #[test]
    fn test_floor_tracks_unresolved_sequences() {
        let policy = retry(1);
        let now = Instant::now();
        let mut q = OutboundQueue::new(8);
        for _ in 0..3 {
            q.enqueue(SendOptions::certified().on_channel(2), 0, vec![]).unwrap();
        }
        let first = q.pop_queued().unwrap();
        assert_eq!(first.frame.floor, 0);
        q.track(first.header.clone(), first.frame.sequence, vec![], now, &policy);

        let second = q.pop_queued().unwrap();
        q.abandon(&second);
        assert_eq!(q.floor(2), 0);

        // The first runs out of attempts; only the third is still open
        let work = q.due(now + Duration::from_millis(100), &policy);
        assert_eq!(work.failed, vec![first.header]);
        let third = q.pop_queued().unwrap();
        assert_eq!(third.frame.floor, 2);
        assert_eq!(q.floor(5), 0);
    }
}
