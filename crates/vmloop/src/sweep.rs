// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 vmloop contributors

//! Suspend monitor: the only path that frees channel resources.
//!
//! A background thread wakes on an explicit suspend signal or on a fixed
//! period. A signalled wake (or any wake finding suspended records) tears
//! down suspended peers' channels and purges their records; a pure timeout
//! wake runs the staleness scan instead. Teardown never happens inline on
//! the packet path, so a concurrent drain can never observe a freed ring.

use crate::registry::MacTable;
use crate::timer::AckTimers;
use crate::transport::ChannelFactory;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Wait condition the sweep thread sleeps on.
///
/// `signal` is callable from any context, including ack-timeout handling
/// and the interception path (it only takes a short uncontended lock).
pub struct SweepSignal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl SweepSignal {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Request a sweep pass.
    pub fn signal(&self) {
        let mut pending = self.pending.lock();
        *pending = true;
        self.cond.notify_one();
    }

    /// Wait for a signal or until `timeout` elapses.
    ///
    /// Returns `true` when an explicit signal was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            self.cond.wait_for(&mut pending, timeout);
        }
        let signaled = *pending;
        *pending = false;
        signaled
    }
}

impl Default for SweepSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Background sweep tearing down suspended peers.
pub struct SuspendMonitor {
    table: Arc<MacTable>,
    factory: Arc<dyn ChannelFactory>,
    timers: Arc<AckTimers>,
    signal: Arc<SweepSignal>,
    shutdown: AtomicBool,
    sweep_interval: Duration,
    stale_after: Duration,
}

impl SuspendMonitor {
    #[must_use]
    pub fn new(
        table: Arc<MacTable>,
        factory: Arc<dyn ChannelFactory>,
        timers: Arc<AckTimers>,
        signal: Arc<SweepSignal>,
        sweep_interval: Duration,
        stale_after: Duration,
    ) -> Self {
        Self {
            table,
            factory,
            timers,
            signal,
            shutdown: AtomicBool::new(false),
            sweep_interval,
            stale_after,
        }
    }

    /// Ask the sweep thread to run one final pass and exit.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.signal.signal();
    }

    /// Sweep loop; runs on a dedicated thread until [`SuspendMonitor::stop`].
    pub fn run(&self) {
        loop {
            let signaled = self.signal.wait_timeout(self.sweep_interval);
            if self.shutdown.load(Ordering::Relaxed) {
                self.clean();
                return;
            }
            if signaled || self.table.has_suspended() {
                self.clean();
            } else {
                let suspended = self.table.check_timeouts(self.stale_after);
                if !suspended.is_empty() {
                    log::info!("[sweep] suspended {} stale peer(s)", suspended.len());
                    self.clean();
                }
            }
        }
    }

    fn clean(&self) {
        let removed = self.table.clean_suspended(|mac, channel| {
            self.timers.cancel(mac);
            if let Some(channel) = &channel {
                self.factory.release(channel);
            }
        });
        if removed > 0 {
            log::info!("[sweep] released {removed} suspended peer(s)");
        }
    }
}
