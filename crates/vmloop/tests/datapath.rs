// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 vmloop contributors

//! Packet diversion over an established channel: ordering, backpressure,
//! oversize fallback, counters.

mod common;

use common::{connect_pair, quick_config, spawn_node, wait_until, Fabric};
use std::time::{Duration, Instant};
use vmloop::types::Verdict;

#[test]
fn test_stream_survives_backpressure_in_order() {
    let fabric = Fabric::new();
    let a = spawn_node(&fabric, 5, 1, quick_config());
    let b = spawn_node(&fabric, 9, 2, quick_config());
    connect_pair(&fabric, &a, &b);

    const COUNT: u32 = 200;
    let b_end = b.vm.channel_of(a.mac).expect("channel missing");
    let reader = std::thread::spawn(move || {
        let mut seqs = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        while seqs.len() < COUNT as usize && Instant::now() < deadline {
            match b_end.recv() {
                Some(payload) => {
                    let seq = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                    seqs.push(seq);
                }
                None => std::thread::sleep(Duration::from_millis(1)),
            }
        }
        seqs
    });

    // Random payload sizes against an 8-slot ring force the queue and the
    // retry thread to do real work. A QueueFull fallback would lose the
    // sequence number to the "network", so resubmit until consumed.
    for seq in 0..COUNT {
        let mut payload = seq.to_le_bytes().to_vec();
        payload.resize(4 + fastrand::usize(..300), 0xab);
        loop {
            match a.vm.outbound_hook(b.mac, &payload) {
                Verdict::Consumed => break,
                Verdict::PassThrough => std::thread::sleep(Duration::from_millis(1)),
            }
        }
    }

    let seqs = reader.join().expect("reader panicked");
    let expected: Vec<u32> = (0..COUNT).collect();
    assert_eq!(seqs, expected, "payloads reordered or lost");
    assert_eq!(a.vm.stats().dropped, 0);

    a.vm.shutdown();
    b.vm.shutdown();
}

#[test]
fn test_oversize_packet_falls_back_to_network() {
    let fabric = Fabric::new();
    let a = spawn_node(&fabric, 5, 1, quick_config());
    let b = spawn_node(&fabric, 9, 2, quick_config());
    connect_pair(&fabric, &a, &b);

    // 8 slots of 64 bytes can never carry 64 * 8 payload bytes (one slot
    // always goes to the descriptor).
    let oversize = vec![0u8; 64 * 8];
    assert_eq!(a.vm.outbound_hook(b.mac, &oversize), Verdict::PassThrough);
    let stats = a.vm.stats();
    assert_eq!(stats.oversize, 1);

    // The channel stays usable for sane packets.
    assert_eq!(a.vm.outbound_hook(b.mac, b"small"), Verdict::Consumed);

    a.vm.shutdown();
    b.vm.shutdown();
}

#[test]
fn test_counters_track_diversion() {
    let fabric = Fabric::new();
    let a = spawn_node(&fabric, 5, 1, quick_config());
    let b = spawn_node(&fabric, 9, 2, quick_config());
    connect_pair(&fabric, &a, &b);
    let base = a.vm.stats();

    assert_eq!(a.vm.outbound_hook(b.mac, b"one"), Verdict::Consumed);
    assert_eq!(a.vm.outbound_hook(b.mac, b"two"), Verdict::Consumed);
    // Unknown destination: counted as seen, not as diverted.
    assert_eq!(
        a.vm.outbound_hook(common::mac(42), b"three"),
        Verdict::PassThrough
    );

    let stats = a.vm.stats();
    assert_eq!(stats.total - base.total, 3);
    assert_eq!(stats.fast_path - base.fast_path, 2);

    a.vm.shutdown();
    b.vm.shutdown();
}

#[test]
fn test_peer_suspend_flag_disables_diversion() {
    let fabric = Fabric::new();
    let a = spawn_node(&fabric, 5, 1, quick_config());
    let b = spawn_node(&fabric, 9, 2, quick_config());
    connect_pair(&fabric, &a, &b);

    // The peer flags the shared descriptor (cooperative shutdown). The
    // next diversion attempt must fall back and suspend the record.
    b.vm.channel_of(a.mac)
        .expect("channel missing")
        .set_suspend();
    assert_eq!(a.vm.outbound_hook(b.mac, b"pkt"), Verdict::PassThrough);
    wait_until("record purged by sweep", || a.vm.peer_state(b.mac).is_none());

    // The other side notices through its own staleness scan.
    wait_until("peer side purged too", || b.vm.peer_state(a.mac).is_none());

    a.vm.shutdown();
    b.vm.shutdown();
}
