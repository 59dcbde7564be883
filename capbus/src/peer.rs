// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Peers: the endpoints of the bus.
//!
//! A peer is created inactive. CONNECT installs its info object (queue,
//! pool, quota, descriptor table) and flips the activation latch; from then
//! on every operation runs under an active reference, and DISCONNECT tears
//! the peer down by deactivating, draining those references, and destroying
//! the info object.
//!
//! The info pointer is read-mostly: it is published exactly once and
//! retracted exactly once, both under the wait-queue lock, and dereferenced
//! through a lock-free cell whose readers keep the backing memory alive.

use crate::active::Active;
use crate::bus::Bus;
use crate::cmd::{
    ConnectFlags, ConnectParams, Creds, OFFSET_INVALID, PAGE_SIZE, RecvFlags, RecvKind, RecvMsg,
    SendFlags, SendParams, SendResult,
};
use crate::desc::DescTable;
use crate::error::Error;
use crate::message::{Message, Resource};
use crate::pool::Pool;
use crate::queue::{Payload, Queue, QueueNode};
use crate::sync::WaitQueue;
use crate::transaction::Transaction;
use rcucell::RcuCell;
use smallvec::SmallVec;
use spin::Mutex;
use std::sync::{Arc, Weak};

/// Messages a single peer may have in flight in its queue.
const QUOTA_MESSAGES_MAX: u32 = 1024;
/// Handles a single peer may have attached to queued messages.
const QUOTA_HANDLES_MAX: u32 = 4096;

/// Opaque identifier of a peer, unique per bus for the lifetime of the bus.
///
/// Doubles as the tiebreaker for queue ordering, so two entries committed at
/// the same timestamp by different senders order the same way everywhere.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(u64);

impl PeerId {
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

/// The mutable half of a peer's info object, behind the info mutex: pool,
/// quota counters, and the descriptor table.
#[derive(Debug)]
pub(crate) struct PeerInner {
    pub(crate) pool: Pool,
    pub(crate) descs: DescTable,
    n_allocated: u64,
    n_messages: u32,
    n_handles: u32,
}

impl PeerInner {
    /// Allocates and fills the slice for one message copy: payload bytes,
    /// then handle ids, with room for the descriptor numbers at the tail.
    pub(crate) fn allocate_message(
        &mut self,
        payload: &[u8],
        handles: &[u64],
        files: &[Arc<Resource>],
    ) -> Result<Message, Error> {
        let n_handles = u32::try_from(handles.len()).map_err(|_| Error::MessageTooLarge)?;
        if self.n_messages >= QUOTA_MESSAGES_MAX
            || self.n_handles + n_handles > QUOTA_HANDLES_MAX
        {
            return Err(Error::QuotaExceeded);
        }

        let payload_len = payload.len() as u64;
        let size = payload_len + 8 * handles.len() as u64 + 4 * files.len() as u64;
        let slice = self.pool.allocate(size)?;

        self.pool.write(&slice, 0, payload)?;
        let mut at = payload_len;
        for handle in handles {
            self.pool.write(&slice, at, &handle.to_le_bytes())?;
            at += 8;
        }

        self.n_allocated += slice.size;
        self.n_messages += 1;
        self.n_handles += n_handles;

        Ok(Message::new(handles.into(), files.into(), slice))
    }

    /// Releases the queue-side ownership of a message's slice and gives the
    /// quota back. Idempotent per message; a no-op if the pool was flushed
    /// underneath the message.
    pub(crate) fn deallocate(&mut self, message: &Message) {
        let Some(slice) = message.take_slice() else {
            return;
        };
        if self.pool.free(&slice) {
            self.n_allocated = self.n_allocated.saturating_sub(slice.size);
            self.n_messages = self.n_messages.saturating_sub(1);
            let n_handles = u32::try_from(message.n_handles()).unwrap_or(u32::MAX);
            self.n_handles = self.n_handles.saturating_sub(n_handles);
        }
    }

    fn reset_quota(&mut self) {
        self.n_allocated = 0;
        self.n_messages = 0;
        self.n_handles = 0;
    }
}

/// Everything a connected peer owns. Installed at CONNECT, destroyed at
/// DISCONNECT; reachable only through the peer's info cell.
#[derive(Debug)]
pub(crate) struct PeerInfo {
    id: PeerId,
    creds: Creds,
    pool_size: u64,
    pub(crate) queue: Queue,
    pub(crate) inner: Mutex<PeerInner>,
}

impl PeerInfo {
    fn new(
        id: PeerId,
        creds: Creds,
        waitq: Arc<WaitQueue>,
        pool_size: u64,
    ) -> Result<Arc<Self>, Error> {
        if pool_size == 0 || pool_size % PAGE_SIZE != 0 {
            return Err(Error::InvalidArgument);
        }
        Ok(Arc::new(Self {
            id,
            creds,
            pool_size,
            queue: Queue::new(waitq),
            inner: Mutex::new(PeerInner {
                pool: Pool::new(pool_size)?,
                descs: DescTable::new(),
                n_allocated: 0,
                n_messages: 0,
                n_handles: 0,
            }),
        }))
    }

    pub(crate) fn id(&self) -> PeerId {
        self.id
    }

    pub(crate) fn creds(&self) -> Creds {
        self.creds
    }

    /// Flushes the queue and the pool, keeping the peer connected.
    ///
    /// Committed entries are deallocated; staged entries are force-unlinked
    /// and their transactions will observe the commit as aborted.
    pub(crate) fn reset(&self) {
        let mut inner = self.inner.lock();
        let allocated = inner.n_allocated;
        let flushed = self.queue.flush();
        let n = flushed.len();
        for node in flushed {
            if let Some(message) = node.message() {
                inner.deallocate(message);
            }
        }
        inner.pool.flush();
        inner.reset_quota();
        drop(inner);
        tracing::debug!(
            peer = self.id.as_raw(),
            dropped = n,
            reclaimed = allocated,
            "reset"
        );
    }

    /// Queues a handle release notification for this peer's consumer.
    pub(crate) fn post_release(&self, handle: u64) {
        let node = QueueNode::new(self.id, Payload::HandleRelease { handle });
        self.queue.commit_unstaged(&node);
    }
}

/// One endpoint of the bus.
///
/// All operations are callable from any thread concurrently; the peer
/// serializes what it must internally.
#[derive(Debug)]
pub struct Peer {
    id: PeerId,
    bus: Weak<Bus>,
    waitq: Arc<WaitQueue>,
    active: Active,
    info: RcuCell<PeerInfo>,
}

/// An in-flight operation's hold on a peer: the active reference plus the
/// pinned info object.
pub(crate) struct ActiveRef {
    peer: Arc<Peer>,
    info: Arc<PeerInfo>,
}

impl ActiveRef {
    pub(crate) fn info(&self) -> &PeerInfo {
        &self.info
    }

    pub(crate) fn info_arc(&self) -> Arc<PeerInfo> {
        Arc::clone(&self.info)
    }
}

impl Drop for ActiveRef {
    fn drop(&mut self) {
        self.peer.active.release(&self.peer.waitq);
    }
}

impl Peer {
    pub(crate) fn new(bus: Weak<Bus>, id: PeerId) -> Arc<Self> {
        Arc::new(Self {
            id,
            bus,
            waitq: Arc::new(WaitQueue::new()),
            active: Active::new(),
            info: RcuCell::empty(),
        })
    }

    #[must_use]
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Acquires an active reference, pinning the peer against teardown for
    /// the duration of one operation.
    pub(crate) fn acquire(self: &Arc<Self>) -> Result<ActiveRef, Error> {
        if !self.active.acquire() {
            return Err(Error::Shutdown);
        }
        let Some(info) = self.info.get() else {
            self.active.release(&self.waitq);
            return Err(Error::Shutdown);
        };
        Ok(ActiveRef {
            peer: Arc::clone(self),
            info,
        })
    }

    /// CONNECT: set up (`CLIENT`), flush (`RESET`), or query (`QUERY`) the
    /// peer, per the mode flag in `param`.
    pub fn connect(self: &Arc<Self>, creds: Creds, param: &mut ConnectParams) -> Result<(), Error> {
        let mode = param.validate()?;
        if mode == ConnectFlags::CLIENT {
            self.connect_client(creds, param)
        } else if mode == ConnectFlags::RESET {
            self.connect_reset(param)
        } else {
            self.connect_query(param)
        }
    }

    fn connect_client(self: &Arc<Self>, creds: Creds, param: &ConnectParams) -> Result<(), Error> {
        let info = PeerInfo::new(self.id, creds, Arc::clone(&self.waitq), param.pool_size)?;

        // Installing the info pointer and flipping the activation latch must
        // be one step from the point of view of concurrent connects and
        // disconnects; the wait-queue lock serializes all three parties.
        let serializer = self.waitq.serialize();
        let result = if self.active.is_deactivated() {
            Err(Error::Shutdown)
        } else if self.info.is_set() {
            Err(Error::AlreadyConnected)
        } else {
            self.info.replace(Some(info));
            if self.active.activate() {
                Ok(())
            } else {
                self.info.replace(None);
                Err(Error::Shutdown)
            }
        };
        drop(serializer);

        if result.is_ok() {
            tracing::debug!(
                peer = self.id.as_raw(),
                uid = creds.uid,
                pool_size = param.pool_size,
                "connected"
            );
        }
        result
    }

    fn connect_reset(self: &Arc<Self>, param: &mut ConnectParams) -> Result<(), Error> {
        if self.active.is_new() {
            return Err(Error::NotConnected);
        }
        if param.pool_size != 0 {
            return Err(Error::InvalidArgument);
        }
        let this = self.acquire()?;
        param.pool_size = this.info().pool_size;
        this.info().reset();
        Ok(())
    }

    fn connect_query(&self, param: &mut ConnectParams) -> Result<(), Error> {
        if self.active.is_new() {
            return Err(Error::NotConnected);
        }
        if param.pool_size != 0 {
            return Err(Error::InvalidArgument);
        }
        self.info.with(|info| match info {
            Some(info) => {
                param.pool_size = info.pool_size;
                Ok(())
            }
            None => Err(Error::Shutdown),
        })
    }

    /// DISCONNECT: deactivate, drain in-flight operations, then destroy the
    /// info object.
    ///
    /// Safe to call multiple times and from multiple threads; every caller
    /// blocks until the peer is fully torn down, and exactly one of them is
    /// told it did the teardown.
    pub fn disconnect(self: &Arc<Self>) -> Result<(), Error> {
        self.active.deactivate();
        self.active.drain(&self.waitq);

        let cleaned = self.active.cleanup(&self.waitq, || {
            let info = {
                let _serializer = self.waitq.serialize();
                self.info.take()
            };
            // Might be missing if the peer was never connected.
            if let Some(info) = info {
                info.reset();
                tracing::debug!(peer = self.id.as_raw(), "disconnected");
            }
        });
        if !cleaned {
            return Err(Error::Shutdown);
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.forget(self.id);
        }
        Ok(())
    }

    /// SEND: deliver one logical message to every destination in `param`,
    /// all at the same timestamp.
    pub fn send(self: &Arc<Self>, param: &SendParams<'_>) -> Result<SendResult, Error> {
        param.validate()?;
        if self.active.is_new() {
            return Err(Error::NotConnected);
        }
        let this = self.acquire()?;
        let bus = self.bus.upgrade().ok_or(Error::Shutdown)?;

        let silent = param.flags.contains(SendFlags::SILENT);
        let targets: SmallVec<[PeerId; 4]> = param
            .destinations
            .iter()
            .copied()
            .filter(|dst| !(silent && *dst == self.id))
            .collect();

        let mut transaction = Transaction::new(&this, param);
        let result = if targets.len() == 1 {
            transaction.commit_for(&bus, targets[0])?
        } else {
            for dst in &targets {
                transaction.instantiate(&bus, *dst)?;
            }
            transaction.commit()
        };

        if let Some(offset) = param.release {
            let mut inner = this.info().inner.lock();
            inner.pool.release_user(offset)?;
        }
        Ok(result)
    }

    /// RECV: dequeue (or, with [`RecvFlags::PEEK`], inspect) the front
    /// entry.
    ///
    /// The delivered message's slice is published at the returned offset;
    /// the installed descriptor numbers sit in the last `4 * n_fds` bytes of
    /// the slice. Fails with [`Error::Empty`] when nothing is deliverable.
    pub fn recv(self: &Arc<Self>, flags: RecvFlags) -> Result<RecvMsg, Error> {
        if self.active.is_new() {
            return Err(Error::NotConnected);
        }
        let this = self.acquire()?;
        let info = this.info();

        // Racy peek, to bail out early and to size the descriptor
        // preallocation. Anyone might race us for the entry, so everything
        // below re-checks under the lock.
        let Some(front) = info.queue.peek_unlocked() else {
            return Err(Error::Empty);
        };
        let mut wanted_fds = front.n_files();
        drop(front);

        if flags.contains(RecvFlags::PEEK) {
            return Self::recv_peek(info);
        }

        // Preallocate descriptor numbers, then dequeue the front entry iff
        // they suffice; otherwise grow the preallocation and retry.
        let mut reserved: SmallVec<[u32; 8]> = SmallVec::new();
        let node = loop {
            while reserved.len() < wanted_fds {
                let id = info.inner.lock().descs.reserve();
                match id {
                    Ok(id) => reserved.push(id),
                    Err(e) => {
                        Self::cancel_reserved(info, &mut reserved);
                        return Err(e);
                    }
                }
            }

            let mut queue = info.queue.lock();
            match queue.peek() {
                None => {
                    drop(queue);
                    Self::cancel_reserved(info, &mut reserved);
                    return Err(Error::Empty);
                }
                Some((node, _cont)) => {
                    let n_files = node.n_files();
                    if n_files > reserved.len() {
                        drop(queue);
                        wanted_fds = n_files;
                        continue;
                    }
                    queue.remove(&node);
                    break node;
                }
            }
        };

        let Some(message) = node.message() else {
            Self::cancel_reserved(info, &mut reserved);
            let handle = node.release_handle().unwrap_or(0);
            return Ok(RecvMsg::release(handle));
        };

        // Give back the over-reservation.
        while reserved.len() > message.n_files() {
            if let Some(id) = reserved.pop() {
                info.inner.lock().descs.cancel(id);
            }
        }

        let mut inner = info.inner.lock();
        let result = Self::publish_message(&mut inner, message, &reserved);
        drop(inner);

        match result {
            Ok(msg) => Ok(msg),
            Err(e) => {
                // The entry is already off the queue and requeuing it would
                // break ordering; the message is lost.
                Self::cancel_reserved(info, &mut reserved);
                tracing::warn!(peer = self.id.as_raw(), "message dropped during delivery");
                Err(e)
            }
        }
    }

    /// Publishes a dequeued message: hand the slice to user space, write the
    /// descriptor numbers into its tail, install the descriptors, release
    /// the queue-side slice ownership.
    fn publish_message(
        inner: &mut PeerInner,
        message: &Message,
        reserved: &[u32],
    ) -> Result<RecvMsg, Error> {
        let Some(slice) = message.slice() else {
            return Err(Error::MessageDropped);
        };
        let Ok((offset, size)) = inner.pool.publish(&slice) else {
            inner.deallocate(message);
            return Err(Error::MessageDropped);
        };

        if !reserved.is_empty() {
            let mut tail = Vec::with_capacity(4 * reserved.len());
            for id in reserved {
                tail.extend_from_slice(&id.to_le_bytes());
            }
            let at = slice.size - tail.len() as u64;
            if inner.pool.write(&slice, at, &tail).is_err() {
                inner.deallocate(message);
                return Err(Error::MessageDropped);
            }
            for (id, file) in reserved.iter().zip(message.files()) {
                inner.descs.install(*id, Arc::clone(file));
            }
        }
        inner.deallocate(message);

        Ok(RecvMsg {
            kind: RecvKind::Message,
            offset,
            size,
            n_handles: u32::try_from(message.n_handles()).unwrap_or(u32::MAX),
            n_fds: u32::try_from(message.n_files()).unwrap_or(u32::MAX),
        })
    }

    fn recv_peek(info: &PeerInfo) -> Result<RecvMsg, Error> {
        // The info lock spans the peek and the publish so the slice cannot
        // be deallocated in between; the queue lock nests inside.
        let mut inner = info.inner.lock();
        let front = info.queue.lock().peek();
        let Some((node, _cont)) = front else {
            return Err(Error::Empty);
        };

        let Some(message) = node.message() else {
            return Ok(RecvMsg::release(node.release_handle().unwrap_or(0)));
        };
        let Some(slice) = message.slice() else {
            return Err(Error::Empty);
        };
        let (offset, size) = inner.pool.publish(&slice).map_err(|_| Error::Empty)?;
        Ok(RecvMsg {
            kind: RecvKind::Message,
            offset,
            size,
            n_handles: u32::try_from(message.n_handles()).unwrap_or(u32::MAX),
            n_fds: u32::try_from(message.n_files()).unwrap_or(u32::MAX),
        })
    }

    fn cancel_reserved(info: &PeerInfo, reserved: &mut SmallVec<[u32; 8]>) {
        if reserved.is_empty() {
            return;
        }
        let mut inner = info.inner.lock();
        for id in reserved.drain(..) {
            inner.descs.cancel(id);
        }
    }

    /// SLICE_RELEASE: give up user-space ownership of a published slice.
    pub fn slice_release(self: &Arc<Self>, offset: u64) -> Result<(), Error> {
        if self.active.is_new() {
            return Err(Error::NotConnected);
        }
        let this = self.acquire()?;
        let mut inner = this.info().inner.lock();
        inner.pool.release_user(offset)
    }

    /// Reads pool memory; the stand-in for the receiver's mapped view of its
    /// pool.
    pub fn pool_read(self: &Arc<Self>, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        if offset == OFFSET_INVALID {
            return Err(Error::InvalidArgument);
        }
        let this = self.acquire()?;
        let inner = this.info().inner.lock();
        inner.pool.read(offset, buf)
    }

    /// Looks up a descriptor installed by a prior [`Peer::recv`].
    pub fn descriptor(self: &Arc<Self>, id: u32) -> Result<Arc<Resource>, Error> {
        let this = self.acquire()?;
        let inner = this.info().inner.lock();
        inner.descs.get(id).cloned().ok_or(Error::InvalidArgument)
    }

    /// Credentials the peer connected with.
    pub fn creds(&self) -> Result<Creds, Error> {
        if self.active.is_new() {
            return Err(Error::NotConnected);
        }
        self.info.with(|info| match info {
            Some(info) => Ok(info.creds()),
            None => Err(Error::Shutdown),
        })
    }

    /// Whether a RECV would find a deliverable entry. Lock-free.
    #[must_use]
    pub fn is_readable(&self) -> bool {
        self.info
            .with(|info| info.is_some_and(|info| info.queue.is_readable()))
    }

    /// Number of wake-ups this peer's wait channel has seen. Each edge from
    /// "nothing deliverable" to "readable" accounts for exactly one.
    #[must_use]
    pub fn wakeups(&self) -> u64 {
        self.waitq.wakeups()
    }

    /// Polls until the peer is readable or torn down.
    pub fn wait_readable(&self) -> Result<(), Error> {
        self.waitq
            .wait_until(|| self.is_readable() || self.active.is_deactivated());
        if self.is_readable() {
            Ok(())
        } else {
            Err(Error::Shutdown)
        }
    }
}
