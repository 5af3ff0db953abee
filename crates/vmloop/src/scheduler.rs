// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 vmloop contributors

//! Transmit scheduler: channel fast path with a bounded pending queue.
//!
//! One FIFO queue is shared across all peers and guarded by a single mutex
//! that also covers every transmit attempt; critical sections never block,
//! so the queue is safe to touch from the interception path. A packet leaves
//! the queue only after a full all-or-nothing ring write or after being
//! declared undeliverable.
//!
//! Draining stops at the first packet whose ring lacks space, even when
//! later packets target other peers with room: global FIFO order is kept
//! and the transient full-ring condition self-heals via the retry task
//! (short poll interval while packets are pending, long while idle).

use crate::error::{Error, Result};
use crate::registry::MacTable;
use crate::sweep::SweepSignal;
use crate::transport::{slots_for, TransportError, SLOT_SIZE};
use crate::types::{MacAddr, PeerState};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Pending {
    dest: MacAddr,
    payload: Vec<u8>,
}

/// Shared outbound queue plus the retry wait condition.
pub struct TxScheduler {
    queue: Mutex<VecDeque<Pending>>,
    retry: Condvar,
    table: Arc<MacTable>,
    sweep: Arc<SweepSignal>,
    retry_busy: Duration,
    retry_idle: Duration,
    max_depth: usize,
    shutdown: AtomicBool,
    dropped: AtomicU64,
}

impl TxScheduler {
    #[must_use]
    pub fn new(
        table: Arc<MacTable>,
        sweep: Arc<SweepSignal>,
        retry_busy: Duration,
        retry_idle: Duration,
        max_depth: usize,
    ) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            retry: Condvar::new(),
            table,
            sweep,
            retry_busy,
            retry_idle,
            max_depth,
            shutdown: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Hand a packet to the channel fast path.
    ///
    /// On `Ok(())` the packet was consumed (written or enqueued for retry).
    ///
    /// # Errors
    ///
    /// - [`Error::NoChannel`]: destination unknown, not CONNECTED, or its
    ///   channel is cooperatively suspended; caller uses the normal path.
    /// - [`Error::PacketTooLarge`]: payload exceeds the ring's total
    ///   capacity; never enqueued.
    /// - [`Error::QueueFull`]: pending queue at its bound; caller falls
    ///   back to the normal path.
    pub fn submit(&self, payload: &[u8], dest: MacAddr) -> Result<()> {
        let channel = match self.table.lookup(dest, |r| (r.state, r.channel.clone())) {
            Some((PeerState::Connected, Some(channel))) => channel,
            _ => return Err(Error::NoChannel),
        };

        if channel.suspended() {
            // Cooperative shutdown observed on the shared descriptor.
            self.table
                .with_mut(dest, |r| r.state = PeerState::Suspend);
            self.sweep.signal();
            return Err(Error::NoChannel);
        }

        let capacity = channel.capacity_slots();
        if slots_for(payload.len()) > capacity {
            return Err(Error::PacketTooLarge {
                size: payload.len(),
                capacity: capacity * SLOT_SIZE,
            });
        }

        let mut queue = self.queue.lock();
        if queue.len() >= self.max_depth {
            return Err(Error::QueueFull);
        }
        queue.push_back(Pending {
            dest,
            payload: payload.to_vec(),
        });
        self.drain_locked(&mut queue);
        Ok(())
    }

    /// Drain whatever the rings will take right now.
    pub fn drain_pending(&self) {
        let mut queue = self.queue.lock();
        self.drain_locked(&mut queue);
    }

    fn drain_locked(&self, queue: &mut VecDeque<Pending>) {
        while let Some(head) = queue.front() {
            let dest = head.dest;
            let channel = match self.table.lookup(dest, |r| (r.state, r.channel.clone())) {
                Some((PeerState::Connected, Some(channel))) => channel,
                _ => {
                    // Peer vanished or lost its channel while queued.
                    log::debug!("[scheduler] dropping undeliverable packet for {dest}");
                    queue.pop_front();
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            match channel.write_bulk(&head.payload) {
                Ok(()) => {
                    channel.notify_peer();
                    queue.pop_front();
                }
                Err(TransportError::InsufficientSpace { .. }) => {
                    // Ring full: kick the peer so it drains, keep FIFO
                    // order, and let the retry task pick this up.
                    channel.notify_peer();
                    self.retry.notify_one();
                    break;
                }
                Err(err) => {
                    log::warn!("[scheduler] dropping packet for {dest}: {err}");
                    queue.pop_front();
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Packets currently awaiting a ring write.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Packets declared undeliverable and discarded.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Ask the retry thread to exit and discard whatever is still queued.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _queue = self.queue.lock();
        self.retry.notify_all();
    }

    /// Retry loop; runs on a dedicated thread until [`TxScheduler::stop`].
    pub fn run(&self) {
        loop {
            let mut queue = self.queue.lock();
            if self.shutdown.load(Ordering::Relaxed) {
                queue.clear();
                return;
            }
            let timeout = if queue.is_empty() {
                self.retry_idle
            } else {
                self.retry_busy
            };
            self.retry.wait_for(&mut queue, timeout);
            if self.shutdown.load(Ordering::Relaxed) {
                queue.clear();
                return;
            }
            self.drain_locked(&mut queue);
        }
    }
}
