// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The multi-destination send protocol.
//!
//! One transaction carries one logical message to 1..N destinations. Every
//! destination queue is visited one lock at a time, never two together:
//!
//! 1. *Stage* a node in each destination queue, feeding the running maximum
//!    of the returned timestamps back in as the hint for the next one.
//! 2. Pick the final timestamp `T`, strictly above every staging timestamp,
//!    and *sync* every destination clock (and the sender's) to `T`.
//! 3. *Commit* each staged node at `T`. A destination whose queue was
//!    flushed in the meantime drops out individually; the survivors still
//!    deliver at exactly `T`, so the multicast stays totally ordered.
//!
//! A transaction dropped before commit rolls its staged entries back; no
//! reader can have observed them.

use crate::bus::Bus;
use crate::cmd::{SendParams, SendResult};
use crate::error::Error;
use crate::message::Resource;
use crate::peer::{ActiveRef, PeerId, PeerInfo};
use crate::queue::{Payload, QueueNode};
use smallvec::SmallVec;
use std::sync::Arc;

/// Per-destination state: the staged node and the pinned destination info.
///
/// Holding the info keeps the destination queue's memory alive even if the
/// peer disconnects mid-transaction; the commit then simply finds the node
/// unlinked.
struct Entry {
    info: Arc<PeerInfo>,
    node: Arc<QueueNode>,
}

pub(crate) struct Transaction {
    src: Arc<PeerInfo>,
    sender: PeerId,
    payload: Vec<u8>,
    handles: Box<[u64]>,
    files: Box<[Arc<Resource>]>,
    /// Running maximum of staging timestamps; seeded from the sender's
    /// clock so consecutive sends from one peer can never tie.
    ts_hint: u64,
    entries: SmallVec<[Entry; 4]>,
}

impl Transaction {
    pub(crate) fn new(src: &ActiveRef, param: &SendParams<'_>) -> Self {
        let mut payload = Vec::with_capacity(param.vecs.iter().map(|v| v.len()).sum());
        for vec in param.vecs {
            payload.extend_from_slice(vec);
        }
        Self {
            src: src.info_arc(),
            sender: src.info().id(),
            payload,
            handles: param.handles.into(),
            files: param.fds.into(),
            ts_hint: 0,
            entries: SmallVec::new(),
        }
    }

    /// Copies the message into `dst`'s pool and stages a queue node for it.
    ///
    /// Fails if the destination does not resolve, is shut down, or is out of
    /// pool space or quota; the caller then drops the transaction, rolling
    /// back every destination staged so far.
    pub(crate) fn instantiate(&mut self, bus: &Bus, dst: PeerId) -> Result<(), Error> {
        let peer = bus.peer(dst).ok_or(Error::NoSuchPeer)?;
        // Held only while we allocate and stage; the pinned info keeps the
        // queue valid beyond it.
        let dest = peer.acquire()?;
        let info = dest.info_arc();

        let message = {
            let mut inner = info.inner.lock();
            inner.allocate_message(&self.payload, &self.handles, &self.files)?
        };
        let node = QueueNode::new(self.sender, Payload::Message(message));

        if self.ts_hint == 0 {
            self.ts_hint = self.src.queue.sync(0) + 2;
        }
        let staged = info.queue.stage(&node, self.ts_hint);
        self.ts_hint = self.ts_hint.max(staged);

        self.entries.push(Entry { info, node });
        Ok(())
    }

    /// Commits every staged entry at one final timestamp.
    pub(crate) fn commit(&mut self) -> SendResult {
        if self.entries.is_empty() {
            return SendResult {
                delivered: 0,
                lost: 0,
            };
        }

        // Strictly above every staging timestamp handed out in phase 1.
        let timestamp = self.ts_hint + 2;
        debug_assert_eq!(timestamp & 1, 0);

        for entry in &self.entries {
            entry.info.queue.sync(timestamp);
        }
        self.src.queue.sync(timestamp);

        let mut delivered = 0;
        let mut lost = 0;
        for entry in self.entries.drain(..) {
            if entry.info.queue.commit_staged(&entry.node, timestamp) {
                delivered += 1;
            } else {
                // Flushed while staged; we still own the message, so give
                // its slice back to the destination pool.
                if let Some(message) = entry.node.message() {
                    entry.info.inner.lock().deallocate(message);
                }
                lost += 1;
            }
        }

        tracing::trace!(
            sender = self.sender.as_raw(),
            timestamp,
            delivered,
            lost,
            "transaction committed"
        );
        SendResult { delivered, lost }
    }

    /// The unicast fast path: no staging round, just a direct commit at a
    /// fresh tick of the destination clock. Observationally identical to
    /// staging and committing on one destination.
    pub(crate) fn commit_for(&mut self, bus: &Bus, dst: PeerId) -> Result<SendResult, Error> {
        debug_assert!(self.entries.is_empty());

        let peer = bus.peer(dst).ok_or(Error::NoSuchPeer)?;
        let dest = peer.acquire()?;
        let info = dest.info_arc();

        let message = {
            let mut inner = info.inner.lock();
            inner.allocate_message(&self.payload, &self.handles, &self.files)?
        };
        let node = QueueNode::new(self.sender, Payload::Message(message));
        let timestamp = info.queue.commit_unstaged(&node);
        self.src.queue.sync(timestamp);

        tracing::trace!(
            sender = self.sender.as_raw(),
            dst = dst.as_raw(),
            timestamp,
            "unicast committed"
        );
        Ok(SendResult {
            delivered: 1,
            lost: 0,
        })
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // Entries still present were never committed; unlink them and give
        // their slices back. Readers cannot have observed a staged entry.
        for entry in self.entries.drain(..) {
            entry.info.queue.remove(&entry.node);
            if let Some(message) = entry.node.message() {
                entry.info.inner.lock().deallocate(message);
            }
        }
    }
}
