// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end ordering and lifecycle scenarios over the public API.

use capbus::{
    Bus, ConnectFlags, ConnectParams, Creds, Error, PAGE_SIZE, Peer, RecvFlags, Resource,
    SendFlags, SendParams,
};
use rand::Rng;
use std::sync::Arc;
use std::thread;

const CREDS: Creds = Creds { uid: 1000, pid: 1 };

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn connect(bus: &Arc<Bus>, pool_size: u64) -> Arc<Peer> {
    let peer = bus.create_peer();
    let mut param = ConnectParams {
        flags: ConnectFlags::CLIENT,
        pool_size,
    };
    peer.connect(CREDS, &mut param).unwrap();
    peer
}

fn send_tag(src: &Arc<Peer>, dst: &[capbus::PeerId], tag: u64) -> Result<(), Error> {
    src.send(&SendParams {
        flags: SendFlags::empty(),
        destinations: dst,
        vecs: &[&tag.to_le_bytes()],
        handles: &[],
        fds: &[],
        release: None,
    })
    .map(|_| ())
}

/// Sends with backpressure: the destination pool or quota filling up just
/// means the receiver has not caught up yet.
fn send_tag_blocking(src: &Arc<Peer>, dst: &[capbus::PeerId], tag: u64) {
    loop {
        match send_tag(src, dst, tag) {
            Ok(()) => return,
            Err(Error::OutOfMemory | Error::QuotaExceeded) => thread::yield_now(),
            Err(e) => panic!("send failed: {e:?}"),
        }
    }
}

/// Receives one message and returns its tag, releasing the slice.
fn recv_tag(peer: &Arc<Peer>) -> Result<u64, Error> {
    let msg = peer.recv(RecvFlags::empty())?;
    let mut tag = [0_u8; 8];
    peer.pool_read(msg.offset, &mut tag).unwrap();
    peer.slice_release(msg.offset).unwrap();
    Ok(u64::from_le_bytes(tag))
}

/// Unicast delivery preserves send order.
#[test]
fn unicast_order() {
    init_tracing();
    let bus = Bus::new();
    let sender = connect(&bus, PAGE_SIZE);
    let receiver = connect(&bus, PAGE_SIZE);

    for tag in 0..3 {
        send_tag(&sender, &[receiver.id()], tag).unwrap();
    }
    for tag in 0..3 {
        assert_eq!(recv_tag(&receiver), Ok(tag));
    }
    assert_eq!(recv_tag(&receiver), Err(Error::Empty));
}

/// A multicast is observed before a later unicast from the same sender, and
/// only by its own destinations.
#[test]
fn multicast_then_unicast() {
    let bus = Bus::new();
    let sender = connect(&bus, PAGE_SIZE);
    let d1 = connect(&bus, PAGE_SIZE);
    let d2 = connect(&bus, PAGE_SIZE);
    let d3 = connect(&bus, PAGE_SIZE);

    send_tag(&sender, &[d1.id(), d2.id(), d3.id()], 1).unwrap();
    send_tag(&sender, &[d1.id()], 2).unwrap();

    assert_eq!(recv_tag(&d1), Ok(1));
    assert_eq!(recv_tag(&d1), Ok(2));
    assert_eq!(recv_tag(&d2), Ok(1));
    assert_eq!(recv_tag(&d3), Ok(1));
    assert_eq!(recv_tag(&d2), Err(Error::Empty));
    assert_eq!(recv_tag(&d3), Err(Error::Empty));
}

/// Two peers multicasting to the same pair of destinations concurrently:
/// both destinations observe the messages in the same relative order.
#[test]
fn concurrent_multicast_destinations_agree() {
    const ROUNDS: u64 = 64;

    let bus = Bus::new();
    let s1 = connect(&bus, PAGE_SIZE);
    let s2 = connect(&bus, PAGE_SIZE);
    let d1 = connect(&bus, PAGE_SIZE);
    let d2 = connect(&bus, PAGE_SIZE);

    let senders: Vec<_> = [(s1, 1_u64), (s2, 2_u64)]
        .into_iter()
        .map(|(sender, id)| {
            let dests = [d1.id(), d2.id()];
            thread::spawn(move || {
                for seq in 0..ROUNDS {
                    send_tag_blocking(&sender, &dests, (id << 32) | seq);
                }
            })
        })
        .collect();
    for handle in senders {
        handle.join().unwrap();
    }

    let drain = |peer: &Arc<Peer>| {
        let mut tags = Vec::new();
        loop {
            match recv_tag(peer) {
                Ok(tag) => tags.push(tag),
                Err(Error::Empty) => break,
                Err(e) => panic!("recv failed: {e:?}"),
            }
        }
        tags
    };
    let order1 = drain(&d1);
    let order2 = drain(&d2);

    assert_eq!(order1.len(), 2 * ROUNDS as usize);
    assert_eq!(order1, order2);

    // Per-sender FIFO holds within the agreed order.
    for sender_id in [1_u64, 2] {
        let seqs: Vec<_> = order1
            .iter()
            .filter(|tag| *tag >> 32 == sender_id)
            .map(|tag| *tag & 0xffff_ffff)
            .collect();
        assert_eq!(seqs, (0..ROUNDS).collect::<Vec<_>>());
    }
}

/// A reset drops everything queued but leaves the connection usable.
#[test]
fn reset_then_resend() {
    let bus = Bus::new();
    let sender = connect(&bus, 4 * PAGE_SIZE);
    let receiver = connect(&bus, 4 * PAGE_SIZE);

    for tag in 0..100 {
        send_tag(&sender, &[receiver.id()], tag).unwrap();
    }

    let mut param = ConnectParams {
        flags: ConnectFlags::RESET,
        pool_size: 0,
    };
    receiver.connect(CREDS, &mut param).unwrap();
    assert_eq!(param.pool_size, 4 * PAGE_SIZE);
    assert_eq!(recv_tag(&receiver), Err(Error::Empty));

    for tag in 200..203 {
        send_tag(&sender, &[receiver.id()], tag).unwrap();
    }
    for tag in 200..203 {
        assert_eq!(recv_tag(&receiver), Ok(tag));
    }
}

/// Ten blocked readers, one delivery: everyone unblocks, but the readability
/// edge is signalled exactly once.
#[test]
fn readability_edge_wakes_once() {
    let bus = Bus::new();
    let sender = connect(&bus, PAGE_SIZE);
    let receiver = connect(&bus, PAGE_SIZE);

    let wakeups_before = receiver.wakeups();
    let readers: Vec<_> = (0..10)
        .map(|_| {
            let receiver = Arc::clone(&receiver);
            thread::spawn(move || receiver.wait_readable())
        })
        .collect();

    send_tag(&sender, &[receiver.id()], 7).unwrap();
    for reader in readers {
        assert_eq!(reader.join().unwrap(), Ok(()));
    }
    assert_eq!(receiver.wakeups(), wakeups_before + 1);
}

/// Messages from several senders, with descriptors attached, delivered to
/// one receiver under contention: per-sender FIFO holds and every
/// descriptor resolves.
#[test]
fn contended_delivery_keeps_fifo() {
    const SENDERS: u64 = 3;
    const PER_SENDER: u64 = 100;

    init_tracing();
    let bus = Bus::new();
    let receiver = connect(&bus, 16 * PAGE_SIZE);

    let handles: Vec<_> = (0..SENDERS)
        .map(|sender_id| {
            let sender = connect(&bus, PAGE_SIZE);
            let dst = [receiver.id()];
            thread::spawn(move || {
                let mut rng = rand::rng();
                for seq in 0..PER_SENDER {
                    let tag = (sender_id << 32) | seq;
                    // Vary the payload size so the destination pool sees a
                    // mix of slice shapes; the tag always leads.
                    let mut payload = tag.to_le_bytes().to_vec();
                    payload.resize(8 + rng.random_range(0..64), 0xa5);
                    let vecs: &[&[u8]] = &[&payload];
                    let fds = if seq % 4 == 0 {
                        vec![Arc::new(Resource::new(tag))]
                    } else {
                        Vec::new()
                    };
                    loop {
                        let r = sender.send(&SendParams {
                            flags: SendFlags::empty(),
                            destinations: &dst,
                            vecs,
                            handles: &[],
                            fds: &fds,
                            release: None,
                        });
                        match r {
                            Ok(_) => break,
                            Err(Error::OutOfMemory | Error::QuotaExceeded) => {
                                thread::yield_now();
                            }
                            Err(e) => panic!("send failed: {e:?}"),
                        }
                    }
                }
            })
        })
        .collect();

    let mut expected = vec![0_u64; SENDERS as usize];
    let mut received = 0;
    while received < SENDERS * PER_SENDER {
        let msg = match receiver.recv(RecvFlags::empty()) {
            Ok(msg) => msg,
            Err(Error::Empty) => {
                thread::yield_now();
                continue;
            }
            Err(e) => panic!("recv failed: {e:?}"),
        };
        let mut tag = [0_u8; 8];
        receiver.pool_read(msg.offset, &mut tag).unwrap();
        let tag = u64::from_le_bytes(tag);
        let (sender_id, seq) = (tag >> 32, tag & 0xffff_ffff);

        assert_eq!(seq, expected[sender_id as usize], "per-sender FIFO broken");
        expected[sender_id as usize] += 1;

        if seq % 4 == 0 {
            assert_eq!(msg.n_fds, 1);
            let mut id = [0_u8; 4];
            receiver
                .pool_read(msg.offset + msg.size - 4, &mut id)
                .unwrap();
            let resource = receiver.descriptor(u32::from_le_bytes(id)).unwrap();
            assert_eq!(resource.tag(), tag);
        } else {
            assert_eq!(msg.n_fds, 0);
        }

        receiver.slice_release(msg.offset).unwrap();
        received += 1;
    }

    for handle in handles {
        handle.join().unwrap();
    }
}

/// Concurrent disconnects: everyone blocks until teardown, exactly one call
/// reports having done it.
#[test]
fn concurrent_disconnects_have_one_winner() {
    let bus = Bus::new();
    let peer = connect(&bus, PAGE_SIZE);

    let results: Vec<_> = (0..4)
        .map(|_| {
            let peer = Arc::clone(&peer);
            thread::spawn(move || peer.disconnect())
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(bus.peer(peer.id()).is_none());
}

/// Senders racing a disconnect either deliver or fail cleanly; a blocked
/// reader is woken and told the peer is gone.
#[test]
fn disconnect_races_with_senders() {
    let bus = Bus::new();
    let sender = connect(&bus, PAGE_SIZE);
    let victim = connect(&bus, PAGE_SIZE);
    let victim_id = victim.id();

    let reader = {
        let victim = Arc::clone(&victim);
        thread::spawn(move || victim.wait_readable())
    };

    let writer = thread::spawn(move || {
        let mut delivered = 0_u64;
        loop {
            match send_tag(&sender, &[victim_id], delivered) {
                Ok(()) => delivered += 1,
                Err(Error::NoSuchPeer | Error::Shutdown) => return delivered,
                Err(Error::OutOfMemory | Error::QuotaExceeded) => thread::yield_now(),
                Err(e) => panic!("send failed: {e:?}"),
            }
        }
    });

    while victim.wakeups() == 0 {
        thread::yield_now();
    }
    victim.disconnect().unwrap();

    // The writer stops once the peer is unresolvable.
    writer.join().unwrap();
    // The reader either saw a message before the teardown or the shutdown
    // itself.
    let _ = reader.join().unwrap();
    assert_eq!(victim.recv(RecvFlags::empty()), Err(Error::Shutdown));
}
