// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 vmloop contributors

//! Shared harness: an in-process fabric standing in for the host network.
//!
//! Nodes register their addresses with the [`Fabric`]; control messages a
//! node emits are routed to the owner of the destination address and fed
//! through its `control_frame` entry point. The fabric can drop frames by
//! kind to exercise the retry paths. All nodes share one channel factory,
//! mirroring a single physical host.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use vmloop::config::LoopConfig;
use vmloop::context::VmLoop;
use vmloop::discovery::ControlPlane;
use vmloop::migration::StatusSink;
use vmloop::transport::{ChannelFactory, MemChannelFactory};
use vmloop::types::{LocalIdentity, MacAddr, PeerId};
use vmloop::wire::ControlMessage;
use vmloop::Result;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn mac(last: u8) -> MacAddr {
    MacAddr::new([0x00, 0x16, 0x3e, 0x00, 0x00, last])
}

/// Shrunk timeouts and an 8-slot ring so retry and backpressure paths run
/// inside a test's lifetime.
pub fn quick_config() -> LoopConfig {
    LoopConfig {
        ring_order: 3,
        ack_timeout: Duration::from_millis(40),
        max_retries: 3,
        sweep_interval: Duration::from_millis(30),
        stale_after: Duration::from_secs(10),
        retry_busy: Duration::from_millis(5),
        retry_idle: Duration::from_millis(40),
        max_queue_depth: 64,
    }
}

pub struct Fabric {
    pub factory: Arc<MemChannelFactory>,
    nodes: Mutex<HashMap<MacAddr, Weak<VmLoop>>>,
    counts: Mutex<HashMap<&'static str, usize>>,
    drop_kind: Mutex<Option<&'static str>>,
    lost: Mutex<usize>,
}

impl Fabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            factory: Arc::new(MemChannelFactory::new()),
            nodes: Mutex::new(HashMap::new()),
            counts: Mutex::new(HashMap::new()),
            drop_kind: Mutex::new(None),
            lost: Mutex::new(0),
        })
    }

    /// Messages of `kind` offered to the fabric so far (delivered or lost).
    pub fn sent(&self, kind: &'static str) -> usize {
        self.counts.lock().get(kind).copied().unwrap_or(0)
    }

    /// Silently lose every message of `kind` until cleared with `None`.
    pub fn set_drop(&self, kind: Option<&'static str>) {
        *self.drop_kind.lock() = kind;
    }

    /// Messages lost to `set_drop` so far.
    pub fn lost(&self) -> usize {
        *self.lost.lock()
    }

    fn route(&self, src: MacAddr, dest: MacAddr, msg: &ControlMessage) {
        let kind = msg.kind_name();
        *self.counts.lock().entry(kind).or_insert(0) += 1;
        if *self.drop_kind.lock() == Some(kind) {
            *self.lost.lock() += 1;
            return;
        }
        let node = self.nodes.lock().get(&dest).and_then(Weak::upgrade);
        if let Some(node) = node {
            let _ = node.control_frame(src, &msg.encode());
        }
    }

    /// Gossip the given entries to every registered node, as the host
    /// discovery agent would.
    pub fn announce_all(&self, entries: &[(MacAddr, PeerId)]) {
        let msg = ControlMessage::Announce {
            sender: PeerId(0),
            peers: entries.to_vec(),
        };
        let frame = msg.encode();
        let nodes: Vec<_> = self
            .nodes
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for node in nodes {
            let _ = node.control_frame(mac(0), &frame);
        }
    }
}

struct Port {
    fabric: Arc<Fabric>,
    src: MacAddr,
}

impl ControlPlane for Port {
    fn send(&self, dest: MacAddr, msg: &ControlMessage) -> Result<()> {
        self.fabric.route(self.src, dest, msg);
        Ok(())
    }
}

/// Status sink recording every availability transition.
#[derive(Default)]
pub struct FlagSink {
    pub history: Mutex<Vec<bool>>,
}

impl StatusSink for FlagSink {
    fn publish(&self, active: bool) {
        self.history.lock().push(active);
    }
}

pub struct TestNode {
    pub vm: Arc<VmLoop>,
    pub mac: MacAddr,
    pub id: PeerId,
    pub sink: Arc<FlagSink>,
}

pub fn spawn_node(fabric: &Arc<Fabric>, id: u16, mac_last: u8, config: LoopConfig) -> TestNode {
    init_logging();
    let mac = mac(mac_last);
    let sink = Arc::new(FlagSink::default());
    let port = Arc::new(Port {
        fabric: Arc::clone(fabric),
        src: mac,
    });
    let vm = Arc::new(
        VmLoop::new(
            LocalIdentity::new(PeerId(id), vec![mac]),
            config,
            Arc::clone(&fabric.factory) as Arc<dyn ChannelFactory>,
            port as Arc<dyn ControlPlane>,
            Arc::clone(&sink) as Arc<dyn StatusSink>,
        )
        .expect("activation failed"),
    );
    fabric.nodes.lock().insert(mac, Arc::downgrade(&vm));
    TestNode {
        vm,
        mac,
        id: PeerId(id),
        sink,
    }
}

pub fn wait_until(what: &str, mut ok: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !ok() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Announce both nodes to each other and drive the handshake to CONNECTED
/// on both sides.
pub fn connect_pair(fabric: &Arc<Fabric>, a: &TestNode, b: &TestNode) {
    use vmloop::PeerState;

    fabric.announce_all(&[(a.mac, a.id), (b.mac, b.id)]);
    wait_until("both nodes learn each other", || {
        a.vm.peer_state(b.mac).is_some() && b.vm.peer_state(a.mac).is_some()
    });

    // Traffic from the smaller id kicks off negotiation.
    let (initiator, other) = if a.id < b.id { (a, b) } else { (b, a) };
    initiator.vm.outbound_hook(other.mac, b"boot");
    wait_until("handshake completes", || {
        initiator.vm.peer_state(other.mac) == Some(PeerState::Connected)
            && other.vm.peer_state(initiator.mac) == Some(PeerState::Connected)
    });
}
