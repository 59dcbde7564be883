// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

/// Errors surfaced at the public bus API.
///
/// Internal impossible states are `debug_assert!`s, not variants; everything
/// here is a condition a well-behaved caller can run into.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed flags, misaligned pool size, or mutually exclusive modes.
    #[error("invalid argument")]
    InvalidArgument,
    /// CONNECT on an already-active peer.
    #[error("peer is already connected")]
    AlreadyConnected,
    /// Operation requires a prior successful CONNECT.
    #[error("peer is not connected")]
    NotConnected,
    /// Operation raced with DISCONNECT.
    #[error("peer was shut down")]
    Shutdown,
    /// RECV with no deliverable front entry.
    #[error("no message ready for delivery")]
    Empty,
    /// Vector, handle, or descriptor count exceeds the fixed limits.
    #[error("message exceeds transfer limits")]
    MessageTooLarge,
    /// Allocation failure; the operation had no partial effect.
    #[error("out of memory")]
    OutOfMemory,
    /// Buffer access failed; fatal to the current operation.
    #[error("buffer access failed")]
    Fault,
    /// The per-peer resource quota is exhausted.
    #[error("peer quota exhausted")]
    QuotaExceeded,
    /// A destination id did not resolve to a live peer.
    #[error("no such peer")]
    NoSuchPeer,
    /// A dequeued message was lost while publishing it to the receiver.
    ///
    /// Requeuing would break delivery ordering, so the message is gone; the
    /// queue itself is intact and later messages are unaffected.
    #[error("message was dropped during delivery")]
    MessageDropped,
}
