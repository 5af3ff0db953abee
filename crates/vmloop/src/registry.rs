// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 vmloop contributors

//! Concurrent peer table: hardware address -> peer record.
//!
//! Safe to call from the interception path, the retry task, and the sweep.
//! Closures passed to `lookup`/`with_mut` run under a shard lock and must
//! stay short and must not re-enter the table.

use crate::transport::Channel;
use crate::types::{MacAddr, PeerId, PeerState, Role};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Bookkeeping for one remote guest, keyed by its hardware address.
pub struct PeerRecord {
    /// Peer hardware address.
    pub mac: MacAddr,
    /// Host-assigned peer identifier.
    pub peer_id: PeerId,
    /// Connection state; transitions only along the legal graph.
    pub state: PeerState,
    /// Handshake role once negotiation starts.
    pub role: Role,
    /// Established or provisional channel; present iff state is
    /// LISTEN or CONNECTED.
    pub channel: Option<Arc<dyn Channel>>,
    /// Create-requests sent so far for the current LISTEN episode.
    pub retries: u32,
    /// Last time this peer showed activity (announce refresh).
    pub last_seen: Instant,
}

impl PeerRecord {
    fn new(mac: MacAddr, peer_id: PeerId) -> Self {
        Self {
            mac,
            peer_id,
            state: PeerState::Init,
            role: Role::Acceptor,
            channel: None,
            retries: 0,
            last_seen: Instant::now(),
        }
    }
}

/// Concurrent MAC -> peer record table.
pub struct MacTable {
    peers: DashMap<MacAddr, PeerRecord>,
}

impl MacTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
        }
    }

    /// Number of known peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// No peers known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Insert a fresh INIT record for a newly learned peer.
    ///
    /// A re-announced address mapping to a different id is a caller-input
    /// error: it is logged and the first mapping kept. Re-announcing the
    /// same mapping refreshes the activity timestamp.
    pub fn insert(&self, mac: MacAddr, peer_id: PeerId) -> bool {
        match self.peers.entry(mac) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(PeerRecord::new(mac, peer_id));
                log::debug!("[registry] added guest mac={mac} id={peer_id}");
                true
            }
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                if record.peer_id != peer_id {
                    log::warn!(
                        "[registry] id collision for {mac}: known {}, announced {peer_id}",
                        record.peer_id
                    );
                    return false;
                }
                record.last_seen = Instant::now();
                true
            }
        }
    }

    /// Run `f` against the record for `mac`, if any.
    pub fn lookup<R>(&self, mac: MacAddr, f: impl FnOnce(&PeerRecord) -> R) -> Option<R> {
        self.peers.get(&mac).map(|record| f(record.value()))
    }

    /// Run `f` against the record for `mac` with mutable access, if any.
    pub fn with_mut<R>(&self, mac: MacAddr, f: impl FnOnce(&mut PeerRecord) -> R) -> Option<R> {
        self.peers.get_mut(&mac).map(|mut record| f(record.value_mut()))
    }

    /// Current state of a peer.
    #[must_use]
    pub fn peer_state(&self, mac: MacAddr) -> Option<PeerState> {
        self.lookup(mac, |record| record.state)
    }

    /// Batch activity refresh from a gossip set.
    pub fn update(&self, entries: &[(MacAddr, PeerId)]) {
        let now = Instant::now();
        for (mac, _) in entries {
            if let Some(mut record) = self.peers.get_mut(mac) {
                record.last_seen = now;
            }
        }
    }

    /// Force every record to SUSPEND and flag its channel descriptor.
    ///
    /// Called by the migration coordinator before the memory image is
    /// captured, and by final teardown.
    pub fn mark_all_suspended(&self) -> usize {
        let mut marked = 0;
        for mut entry in self.peers.iter_mut() {
            let record = entry.value_mut();
            if record.state != PeerState::Suspend {
                record.state = PeerState::Suspend;
                marked += 1;
            }
            if let Some(channel) = &record.channel {
                channel.set_suspend();
            }
        }
        marked
    }

    /// Any record currently in SUSPEND.
    #[must_use]
    pub fn has_suspended(&self) -> bool {
        self.peers
            .iter()
            .any(|entry| entry.value().state == PeerState::Suspend)
    }

    /// Remove every SUSPEND record, handing its channel (if any) to the
    /// caller for release. Only the sweep calls this; teardown never runs
    /// inline on the packet path.
    pub fn clean_suspended(
        &self,
        mut on_release: impl FnMut(MacAddr, Option<Arc<dyn Channel>>),
    ) -> usize {
        let mut torn_down = Vec::new();
        self.peers.retain(|mac, record| {
            if record.state == PeerState::Suspend {
                torn_down.push((*mac, record.channel.take()));
                false
            } else {
                true
            }
        });
        let count = torn_down.len();
        for (mac, channel) in torn_down {
            log::debug!("[registry] purging suspended guest {mac}");
            on_release(mac, channel);
        }
        count
    }

    /// Staleness scan: suspend peers idle past `stale_after` and peers
    /// whose shared descriptor already shows suspend flags.
    ///
    /// Returns the addresses moved to SUSPEND by this pass.
    pub fn check_timeouts(&self, stale_after: Duration) -> Vec<MacAddr> {
        let now = Instant::now();
        let mut suspended = Vec::new();
        for mut entry in self.peers.iter_mut() {
            let record = entry.value_mut();
            if record.state == PeerState::Suspend {
                continue;
            }
            let stale = now.duration_since(record.last_seen) > stale_after;
            let peer_flagged = record
                .channel
                .as_ref()
                .is_some_and(|channel| channel.suspended());
            if stale || peer_flagged {
                record.state = PeerState::Suspend;
                if let Some(channel) = &record.channel {
                    channel.set_suspend();
                }
                suspended.push(record.mac);
            }
        }
        suspended
    }

    /// Snapshot of (address, state) pairs, unordered.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(MacAddr, PeerState)> {
        self.peers
            .iter()
            .map(|entry| (*entry.key(), entry.value().state))
            .collect()
    }
}

impl Default for MacTable {
    fn default() -> Self {
        Self::new()
    }
}
