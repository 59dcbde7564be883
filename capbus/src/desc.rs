// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Receiver-side descriptor table.
//!
//! Delivery must not fail halfway because the receiver ran out of descriptor
//! numbers, so `recv` reserves slots up front, installs resources into them
//! once the message is dequeued, and cancels whatever it over-reserved.

use crate::error::Error;
use crate::message::Resource;
use std::sync::Arc;

/// Upper bound on descriptor numbers per peer.
const DESC_MAX: usize = 4096;

#[derive(Debug, Default)]
pub(crate) struct DescTable {
    slots: Vec<Option<Arc<Resource>>>,
    free: Vec<u32>,
}

impl DescTable {
    pub(crate) const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Reserves an unused descriptor number.
    pub(crate) fn reserve(&mut self) -> Result<u32, Error> {
        if let Some(id) = self.free.pop() {
            return Ok(id);
        }
        if self.slots.len() >= DESC_MAX {
            return Err(Error::OutOfMemory);
        }
        let id = u32::try_from(self.slots.len()).map_err(|_| Error::OutOfMemory)?;
        self.slots.push(None);
        Ok(id)
    }

    /// Installs `resource` into a previously reserved slot.
    pub(crate) fn install(&mut self, id: u32, resource: Arc<Resource>) {
        let slot = &mut self.slots[id as usize];
        debug_assert!(slot.is_none(), "descriptor slot installed twice");
        *slot = Some(resource);
    }

    /// Returns an unused reservation.
    pub(crate) fn cancel(&mut self, id: u32) {
        debug_assert!(self.slots[id as usize].is_none());
        self.free.push(id);
    }

    /// Looks up an installed descriptor.
    pub(crate) fn get(&self, id: u32) -> Option<&Arc<Resource>> {
        self.slots.get(id as usize).and_then(Option::as_ref)
    }
}
