// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-peer ordered message queue.
//!
//! Entries are ordered by `(timestamp, sender)`, timestamps coming from a
//! Lamport-style logical clock per queue. An entry is *staged* first (odd
//! timestamp) and *committed* later (even timestamp); only committed entries
//! are deliverable, and only once no staged entry could still order before
//! them. The next deliverable entry is published in `front`, which readers
//! may load without the queue lock.
//!
//! The clock only moves forward: `tick` for local commits, `sync` to absorb
//! a remote timestamp. A staged entry therefore always orders after every
//! entry already committed here, which is what makes "the leftmost entry, if
//! committed" the correct front.

use crate::message::Message;
use crate::peer::PeerId;
use crate::sync::WaitQueue;
use core::sync::atomic::{AtomicU64, Ordering};
use rcucell::RcuCell;
use spin::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Kind of a queue entry. Queue ordering only ever looks at timestamp and
/// sender; the kind rides along for the consumer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub(crate) enum NodeKind {
    /// A message delivery.
    Message = 0b0,
    /// A capability handle owned by the receiving peer lost its last
    /// reference.
    HandleRelease = 0b1,
}

impl mycelium_bitfield::FromBits<u64> for NodeKind {
    const BITS: u32 = 1;
    type Error = core::convert::Infallible;

    fn try_from_bits(bits: u64) -> Result<Self, Self::Error> {
        Ok(match bits {
            bits if bits == Self::Message as u64 => Self::Message,
            _ => Self::HandleRelease,
        })
    }

    fn into_bits(self) -> u64 {
        self as u64
    }
}

mycelium_bitfield::bitfield! {
    /// Packed timestamp-and-type word of a queue node.
    struct Stamp<u64> {
        /// Logical timestamp: zero while unlinked, odd while staging, even
        /// once committed.
        const TIMESTAMP = 62;
        /// Kind tag.
        const KIND: NodeKind;
    }
}

// The staging parity must be bit 0 of the packed word.
static_assertions::const_assert_eq!(Stamp::TIMESTAMP.first_bit(), 1);

/// Kind-specific payload of a queue node.
#[derive(Debug)]
pub(crate) enum Payload {
    Message(Message),
    HandleRelease { handle: u64 },
}

/// One entry in a peer queue.
///
/// A node is created by its owning transaction with a single reference. The
/// queue takes its own reference when the node is linked, so a linked node
/// has at least two owners; unlinking drops the queue's share, never the
/// last one.
#[derive(Debug)]
pub(crate) struct QueueNode {
    stamp: AtomicU64,
    /// Insertion cookie, disambiguating entries that tie on
    /// `(timestamp, sender)`. Zero while unlinked.
    link: AtomicU64,
    sender: PeerId,
    payload: Payload,
}

impl QueueNode {
    pub(crate) fn new(sender: PeerId, payload: Payload) -> Arc<Self> {
        let kind = match &payload {
            Payload::Message(_) => NodeKind::Message,
            Payload::HandleRelease { .. } => NodeKind::HandleRelease,
        };
        Arc::new(Self {
            stamp: AtomicU64::new(Stamp::new().with(Stamp::KIND, kind).0),
            link: AtomicU64::new(0),
            sender,
            payload,
        })
    }

    fn stamp(&self) -> Stamp {
        Stamp(self.stamp.load(Ordering::Acquire))
    }

    /// Current logical timestamp; zero if unlinked.
    pub(crate) fn timestamp(&self) -> u64 {
        self.stamp().get(Stamp::TIMESTAMP)
    }

    pub(crate) fn kind(&self) -> NodeKind {
        self.stamp().get(Stamp::KIND)
    }

    /// Whether the node is linked into a queue.
    pub(crate) fn is_queued(&self) -> bool {
        self.timestamp() != 0
    }

    pub(crate) fn is_staging(&self) -> bool {
        self.timestamp() & 1 == 1
    }

    pub(crate) fn is_committed(&self) -> bool {
        let ts = self.timestamp();
        ts != 0 && ts & 1 == 0
    }

    pub(crate) fn message(&self) -> Option<&Message> {
        match &self.payload {
            Payload::Message(message) => Some(message),
            Payload::HandleRelease { .. } => None,
        }
    }

    pub(crate) fn release_handle(&self) -> Option<u64> {
        match self.payload {
            Payload::HandleRelease { handle } => Some(handle),
            Payload::Message(_) => None,
        }
    }

    /// Attached descriptor count, cached here so receivers can plan their
    /// descriptor preallocation from a lock-free peek.
    pub(crate) fn n_files(&self) -> usize {
        self.message().map_or(0, Message::n_files)
    }

    /// Only the owning queue restamps a node, under its lock.
    fn set_timestamp(&self, timestamp: u64) {
        let stamp = self.stamp().with(Stamp::TIMESTAMP, timestamp);
        self.stamp.store(stamp.0, Ordering::Release);
    }
}

/// Ordering key of a linked node.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct NodeKey {
    timestamp: u64,
    sender: PeerId,
    link: u64,
}

impl NodeKey {
    fn of(node: &QueueNode) -> Self {
        Self {
            timestamp: node.timestamp(),
            sender: node.sender,
            link: node.link.load(Ordering::Relaxed),
        }
    }

    fn is_staging(&self) -> bool {
        self.timestamp & 1 == 1
    }

    fn same_group(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp && self.sender == other.sender
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    /// Logical clock; always even.
    clock: u64,
    next_link: u64,
    messages: BTreeMap<NodeKey, Arc<QueueNode>>,
}

impl QueueInner {
    fn tick(&mut self) -> u64 {
        self.clock += 2;
        self.clock
    }

    fn sync(&mut self, timestamp: u64) -> u64 {
        debug_assert_eq!(timestamp & 1, 0);
        self.clock = self.clock.max(timestamp);
        self.clock
    }

    /// Links `node` at `timestamp`, or re-keys it if it is already staged
    /// here with a lower timestamp.
    fn link_node(&mut self, node: &Arc<QueueNode>, timestamp: u64) {
        let ts = node.timestamp();

        debug_assert_ne!(timestamp, 0);
        debug_assert!(timestamp <= self.clock + 1);
        // If stamped it must carry a staging timestamp from an earlier stage
        // on this queue, and timestamps only ever grow.
        debug_assert!(ts == 0 || (ts & 1 == 1 && timestamp > ts));
        if ts == timestamp {
            return;
        }

        let owned = if ts == 0 {
            // The queue takes its own reference.
            Arc::clone(node)
        } else {
            let owned = self.messages.remove(&NodeKey::of(node));
            debug_assert!(owned.is_some(), "staged node missing from its queue");
            owned.unwrap_or_else(|| Arc::clone(node))
        };

        self.next_link += 1;
        node.link.store(self.next_link, Ordering::Relaxed);
        node.set_timestamp(timestamp);

        let prev = self.messages.insert(NodeKey::of(node), owned);
        debug_assert!(prev.is_none());
    }

    /// Unlinks `node` if it is still linked; drops the queue's reference.
    fn unlink(&mut self, node: &Arc<QueueNode>) -> bool {
        if !node.is_queued() {
            return false;
        }
        let owned = self.messages.remove(&NodeKey::of(node));
        debug_assert!(owned.is_some());
        node.set_timestamp(0);
        node.link.store(0, Ordering::Relaxed);
        true
    }

    /// The deliverable front: the leftmost entry, if it is committed.
    fn front_node(&self) -> Option<&Arc<QueueNode>> {
        let (key, node) = self.messages.first_key_value()?;
        (!key.is_staging()).then_some(node)
    }
}

/// A per-peer ordered queue with a lock-free front pointer.
#[derive(Debug)]
pub(crate) struct Queue {
    inner: Mutex<QueueInner>,
    front: RcuCell<QueueNode>,
    waitq: Arc<WaitQueue>,
}

impl Queue {
    pub(crate) fn new(waitq: Arc<WaitQueue>) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            front: RcuCell::empty(),
            waitq,
        }
    }

    /// Runs `f` under the queue lock and republishes `front` afterwards,
    /// waking the wait queue if the queue became readable.
    fn with_inner<R>(&self, f: impl FnOnce(&mut QueueInner) -> R) -> R {
        let mut inner = self.inner.lock();
        let was_readable = self.front.is_set();
        let r = f(&mut inner);
        self.refresh_front(&inner, was_readable);
        r
    }

    fn refresh_front(&self, inner: &QueueInner, was_readable: bool) {
        let front = inner.front_node();
        let changed = self.front.with(|current| match (current, front) {
            (None, None) => false,
            (Some(current), Some(front)) => !core::ptr::eq(current, Arc::as_ptr(front)),
            _ => true,
        });
        if changed {
            self.front.replace(front.cloned());
        }
        if !was_readable && front.is_some() {
            self.waitq.wake();
        }
    }

    /// Advances the clock to at least `timestamp`. Returns the new value.
    pub(crate) fn sync(&self, timestamp: u64) -> u64 {
        self.inner.lock().sync(timestamp)
    }

    /// Stages `node` with a fresh staging timestamp at least as new as
    /// `timestamp`.
    ///
    /// The staged entry blocks delivery of any entry that would order after
    /// it, but none already committed here. Returns the synced (even)
    /// timestamp so the transaction can combine staging timestamps across
    /// destinations.
    pub(crate) fn stage(&self, node: &Arc<QueueNode>, timestamp: u64) -> u64 {
        debug_assert!(!node.is_queued());
        debug_assert_eq!(timestamp & 1, 0);

        self.with_inner(|inner| {
            let timestamp = inner.sync(timestamp);
            inner.link_node(node, timestamp + 1);
            timestamp
        })
    }

    /// Commits a previously staged `node` at `timestamp`.
    ///
    /// The clock must have been synced with `timestamp` beforehand, on every
    /// destination of the owning transaction. Returns false if the node was
    /// flushed from the queue in the meantime; the commit then counts as
    /// aborted and the caller keeps sole ownership of the node.
    pub(crate) fn commit_staged(&self, node: &Arc<QueueNode>, timestamp: u64) -> bool {
        debug_assert_eq!(timestamp & 1, 0);

        self.with_inner(|inner| {
            if !node.is_queued() {
                return false;
            }
            debug_assert!(node.is_staging());
            inner.link_node(node, timestamp);
            true
        })
    }

    /// Commits an unstaged `node` directly, at a fresh tick of this queue's
    /// clock. The single-destination fast path. Returns the timestamp used.
    pub(crate) fn commit_unstaged(&self, node: &Arc<QueueNode>) -> u64 {
        self.with_inner(|inner| {
            debug_assert!(!node.is_queued());
            let timestamp = inner.tick();
            inner.link_node(node, timestamp);
            timestamp
        })
    }

    /// Unlinks `node`. Returns whether this call removed it.
    ///
    /// Removing a staged entry can uncover a new front and thus make the
    /// queue readable.
    pub(crate) fn remove(&self, node: &Arc<QueueNode>) -> bool {
        self.with_inner(|inner| inner.unlink(node))
    }

    /// Flushes the queue.
    ///
    /// Committed entries are handed to the caller, ownership included, as if
    /// dequeued. Staged entries are forcibly unlinked in place: their owning
    /// transactions still hold a reference each, will find the node unlinked
    /// at commit time, and treat the commit as aborted.
    pub(crate) fn flush(&self) -> Vec<Arc<QueueNode>> {
        let mut inner = self.inner.lock();
        let mut flushed = Vec::new();
        for (key, node) in core::mem::take(&mut inner.messages) {
            node.set_timestamp(0);
            node.link.store(0, Ordering::Relaxed);
            if key.is_staging() {
                debug_assert!(
                    Arc::strong_count(&node) >= 2,
                    "staged node not owned by a transaction"
                );
            } else {
                flushed.push(node);
            }
        }
        self.front.replace(None);
        drop(inner);
        flushed
    }

    /// Locks the queue for a compound peek-then-remove section.
    pub(crate) fn lock(&self) -> QueueGuard<'_> {
        QueueGuard {
            queue: self,
            inner: self.inner.lock(),
        }
    }

    /// Lock-free read of the front entry.
    ///
    /// May observe a stale `None`, but never returns an entry that was not
    /// committed at the time it was published. Callers must re-validate
    /// under the lock before any user-visible side effect.
    pub(crate) fn peek_unlocked(&self) -> Option<Arc<QueueNode>> {
        self.front.get()
    }

    pub(crate) fn is_readable(&self) -> bool {
        self.front.is_set()
    }
}

/// Exclusive access to a queue.
pub(crate) struct QueueGuard<'a> {
    queue: &'a Queue,
    inner: MutexGuard<'a, QueueInner>,
}

impl QueueGuard<'_> {
    /// Returns a reference to the first deliverable entry, plus whether the
    /// entry after it belongs to the same transaction (equal timestamp and
    /// sender).
    pub(crate) fn peek(&self) -> Option<(Arc<QueueNode>, bool)> {
        let mut iter = self.inner.messages.iter();
        let (key, node) = iter.next()?;
        if key.is_staging() {
            return None;
        }
        debug_assert!(node.is_committed());
        let cont = iter.next().is_some_and(|(next, _)| key.same_group(next));
        Some((Arc::clone(node), cont))
    }

    /// Unlinks `node` under the held lock; see [`Queue::remove`].
    pub(crate) fn remove(&mut self, node: &Arc<QueueNode>) -> bool {
        let was_readable = self.queue.front.is_set();
        let removed = self.inner.unlink(node);
        self.queue.refresh_front(&self.inner, was_readable);
        removed
    }
}
