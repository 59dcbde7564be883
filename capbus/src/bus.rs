// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The peer registry.
//!
//! Destinations are addressed by opaque [`PeerId`]s; the bus resolves them
//! to live peers. This is the in-crate stand-in for the capability handle
//! table that owns addressing in the full system.

use crate::peer::{Peer, PeerId};
use core::sync::atomic::{AtomicU64, Ordering};
use hashbrown::HashMap;
use spin::Mutex;
use std::sync::Arc;

#[derive(Debug)]
pub struct Bus {
    peers: Mutex<HashMap<PeerId, Arc<Peer>>>,
    ids: AtomicU64,
}

impl Bus {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(HashMap::new()),
            ids: AtomicU64::new(1),
        })
    }

    /// Creates a new, inactive peer and registers it under a fresh id.
    pub fn create_peer(self: &Arc<Self>) -> Arc<Peer> {
        let id = PeerId::from_raw(self.ids.fetch_add(1, Ordering::Relaxed));
        let peer = Peer::new(Arc::downgrade(self), id);
        self.peers.lock().insert(id, Arc::clone(&peer));
        tracing::debug!(peer = id.as_raw(), "peer created");
        peer
    }

    /// Resolves a destination id to a live peer.
    #[must_use]
    pub fn peer(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.lock().get(&id).cloned()
    }

    /// Drops a peer from the registry; called by the teardown winner.
    pub(crate) fn forget(&self, id: PeerId) {
        self.peers.lock().remove(&id);
    }
}
