// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! # A capability-based, low-latency message bus between local processes.
//!
//! Peers exchange messages carrying payload bytes, capability handles, and
//! transferable resource descriptors. The bus guarantees a global multicast
//! order: one logical send to several destinations is observed by every
//! destination at the same logical timestamp, and a receiver that has seen
//! message `M` from sender `S` will never afterwards see an older message
//! from `S`.
//!
//! The moving parts:
//!
//! - Each connected peer owns an ordered queue of timestamped entries with
//!   a lock-free front pointer, and a pool that message payloads are copied
//!   into and read back from by offset.
//! - A send runs as a transaction: stage a node in each destination queue,
//!   agree on one commit timestamp, commit everywhere.
//! - Peer lifetime is guarded by an active barrier, so no operation ever
//!   observes a torn-down peer.
//!
//! Everything is addressed through a [`Bus`], which hands out [`Peer`]s; the
//! per-peer verbs are [`Peer::connect`], [`Peer::disconnect`],
//! [`Peer::send`], [`Peer::recv`], and [`Peer::slice_release`].
//!
//! ## Example
//!
//! ```rust
//! use capbus::{Bus, ConnectFlags, ConnectParams, Creds, RecvFlags, SendFlags, SendParams};
//!
//! let bus = Bus::new();
//! let sender = bus.create_peer();
//! let receiver = bus.create_peer();
//!
//! let creds = Creds { uid: 0, pid: 1 };
//! let mut params = ConnectParams { flags: ConnectFlags::CLIENT, pool_size: 4096 };
//! sender.connect(creds, &mut params).unwrap();
//! receiver.connect(creds, &mut params).unwrap();
//!
//! sender
//!     .send(&SendParams {
//!         flags: SendFlags::empty(),
//!         destinations: &[receiver.id()],
//!         vecs: &[b"hello"],
//!         handles: &[],
//!         fds: &[],
//!         release: None,
//!     })
//!     .unwrap();
//!
//! let msg = receiver.recv(RecvFlags::empty()).unwrap();
//! let mut payload = vec![0; 5];
//! receiver.pool_read(msg.offset, &mut payload).unwrap();
//! assert_eq!(&payload, b"hello");
//! receiver.slice_release(msg.offset).unwrap();
//! ```

mod active;
mod bus;
mod cmd;
mod desc;
mod error;
mod message;
mod peer;
mod pool;
mod queue;
mod sync;
mod transaction;

pub use crate::bus::Bus;
pub use crate::cmd::{
    ConnectFlags, ConnectParams, Creds, FD_MAX, HANDLE_MAX, OFFSET_INVALID, PAGE_SIZE, RecvFlags,
    RecvKind, RecvMsg, SendFlags, SendParams, SendResult, VEC_MAX,
};
pub use crate::error::Error;
pub use crate::message::Resource;
pub use crate::peer::{Peer, PeerId};
