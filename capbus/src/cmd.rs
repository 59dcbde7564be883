// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fixed-size argument records for the control verbs.
//!
//! Every public operation takes one of these records; validation happens here,
//! before any peer state is touched, so a rejected call has no effect.

use crate::error::Error;
use crate::message::Resource;
use crate::peer::PeerId;
use std::sync::Arc;

/// Maximum number of payload vectors per message.
pub const VEC_MAX: usize = 512;
/// Maximum number of resource descriptors per message.
pub const FD_MAX: usize = 256;
/// Maximum number of capability handles per message.
pub const HANDLE_MAX: usize = 256;
/// Pool sizes must be multiples of this.
pub const PAGE_SIZE: u64 = 4096;
/// Marker for "no pool slice" in receive records.
pub const OFFSET_INVALID: u64 = u64::MAX;

bitflags::bitflags! {
    /// Mode flags for CONNECT. Exactly one mode must be set.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct ConnectFlags: u64 {
        /// Set up a new client peer.
        const CLIENT = 1 << 0;
        /// Flush the queue and pool of a connected peer.
        const RESET = 1 << 1;
        /// Query the pool size of a connected peer.
        const QUERY = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Flags for SEND.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct SendFlags: u64 {
        /// More transactions follow; reserved, currently without effect.
        const CONTINUE = 1 << 0;
        /// Do not deliver to the sender itself on loopback.
        const SILENT = 1 << 1;
        /// Release the slice named by [`SendParams::release`] after a
        /// successful send.
        const RELEASE = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Flags for RECV.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct RecvFlags: u64 {
        /// Read the front entry but leave it queued.
        const PEEK = 1 << 0;
    }
}

/// Credentials captured at connect time.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Creds {
    pub uid: u32,
    pub pid: u32,
}

/// Argument record for CONNECT.
///
/// `pool_size` is an input for `CLIENT` (the requested pool size, nonzero and
/// page-aligned) and an output for `RESET` and `QUERY` (the actual pool
/// size). For the latter two it must be zero on entry.
#[derive(Debug, Copy, Clone)]
pub struct ConnectParams {
    pub flags: ConnectFlags,
    pub pool_size: u64,
}

impl ConnectParams {
    pub(crate) fn validate(&self) -> Result<ConnectFlags, Error> {
        // Only one mode can be specified.
        let mode = self.flags & (ConnectFlags::CLIENT | ConnectFlags::RESET | ConnectFlags::QUERY);
        if mode.bits().count_ones() != 1 {
            return Err(Error::InvalidArgument);
        }
        Ok(mode)
    }
}

/// Argument record for SEND.
#[derive(Debug, Clone)]
pub struct SendParams<'a> {
    pub flags: SendFlags,
    /// Destination peer ids; the message is committed to all of them at a
    /// single timestamp.
    pub destinations: &'a [PeerId],
    /// Payload vectors, gathered in order.
    pub vecs: &'a [&'a [u8]],
    /// Capability handles attached to the message.
    pub handles: &'a [u64],
    /// Resource descriptors attached to the message.
    pub fds: &'a [Arc<Resource>],
    /// Slice to release after the send; must be `Some` exactly when
    /// [`SendFlags::RELEASE`] is set.
    pub release: Option<u64>,
}

impl SendParams<'_> {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.destinations.is_empty() {
            return Err(Error::InvalidArgument);
        }
        if self.release.is_some() != self.flags.contains(SendFlags::RELEASE) {
            return Err(Error::InvalidArgument);
        }
        // Basic limits; avoids overflows in the size computations later on.
        if self.vecs.len() > VEC_MAX || self.fds.len() > FD_MAX || self.handles.len() > HANDLE_MAX {
            return Err(Error::MessageTooLarge);
        }
        Ok(())
    }
}

/// Result record for SEND.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SendResult {
    /// Destinations the message was committed to.
    pub delivered: u32,
    /// Destinations whose queue vanished between staging and commit.
    pub lost: u32,
}

/// What kind of entry a RECV returned.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RecvKind {
    /// A message; `offset`/`size` name its pool slice.
    Message,
    /// A capability handle owned by this peer lost its last reference.
    HandleRelease { handle: u64 },
}

/// Result record for RECV.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RecvMsg {
    pub kind: RecvKind,
    /// Pool offset of the message slice, or [`OFFSET_INVALID`].
    pub offset: u64,
    /// Size of the message slice in bytes.
    pub size: u64,
    /// Number of attached capability handles.
    pub n_handles: u32,
    /// Number of attached resource descriptors. Their installed descriptor
    /// numbers are written to the tail of the slice.
    pub n_fds: u32,
}

impl RecvMsg {
    pub(crate) fn release(handle: u64) -> Self {
        Self {
            kind: RecvKind::HandleRelease { handle },
            offset: OFFSET_INVALID,
            size: 0,
            n_handles: 0,
            n_fds: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_modes_are_exclusive() {
        let mut param = ConnectParams {
            flags: ConnectFlags::CLIENT | ConnectFlags::QUERY,
            pool_size: 0,
        };
        assert_eq!(param.validate(), Err(Error::InvalidArgument));

        param.flags = ConnectFlags::empty();
        assert_eq!(param.validate(), Err(Error::InvalidArgument));

        param.flags = ConnectFlags::RESET;
        assert_eq!(param.validate(), Ok(ConnectFlags::RESET));
    }

    #[test]
    fn send_limits() {
        let dest = [PeerId::from_raw(1)];
        let vecs: Vec<&[u8]> = vec![b"x"; VEC_MAX + 1];
        let param = SendParams {
            flags: SendFlags::empty(),
            destinations: &dest,
            vecs: &vecs,
            handles: &[],
            fds: &[],
            release: None,
        };
        assert_eq!(param.validate(), Err(Error::MessageTooLarge));
    }

    #[test]
    fn release_flag_needs_operand() {
        let dest = [PeerId::from_raw(1)];
        let param = SendParams {
            flags: SendFlags::RELEASE,
            destinations: &dest,
            vecs: &[],
            handles: &[],
            fds: &[],
            release: None,
        };
        assert_eq!(param.validate(), Err(Error::InvalidArgument));

        let param = SendParams {
            flags: SendFlags::empty(),
            release: Some(0),
            ..param
        };
        assert_eq!(param.validate(), Err(Error::InvalidArgument));
    }
}
