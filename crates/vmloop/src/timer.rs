// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 vmloop contributors

//! Per-peer ack timers.
//!
//! One alarm thread serves all peers. Expiry does not mutate peer records
//! directly: it invokes the fire callback, which posts an event into the
//! discovery engine's mutation boundary. Arm and cancel are synchronous;
//! a fire that races a cancel is benign because the engine re-checks the
//! peer's state before acting on the timeout.

use crate::types::MacAddr;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::time::Instant;

struct TimerState {
    deadlines: HashMap<MacAddr, Instant>,
    shutdown: bool,
}

/// Deadline table plus the condvar the alarm thread sleeps on.
pub struct AckTimers {
    state: Mutex<TimerState>,
    cond: Condvar,
}

impl AckTimers {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TimerState {
                deadlines: HashMap::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Arm (or re-arm) the ack timer for a peer.
    pub fn arm(&self, mac: MacAddr, deadline: Instant) {
        let mut state = self.state.lock();
        state.deadlines.insert(mac, deadline);
        self.cond.notify_one();
    }

    /// Cancel a peer's timer. Takes effect immediately; an already-posted
    /// expiry event is neutralized by the engine's state re-check.
    pub fn cancel(&self, mac: MacAddr) {
        let mut state = self.state.lock();
        state.deadlines.remove(&mac);
        self.cond.notify_one();
    }

    /// Number of currently armed timers.
    #[must_use]
    pub fn armed_count(&self) -> usize {
        self.state.lock().deadlines.len()
    }

    /// Ask the alarm thread to exit.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.cond.notify_all();
    }

    /// Alarm loop; runs on a dedicated thread until [`AckTimers::stop`].
    ///
    /// `fire` is called outside the deadline lock, once per expired peer.
    pub fn run(&self, fire: impl Fn(MacAddr)) {
        loop {
            let mut expired = Vec::new();
            {
                let mut state = self.state.lock();
                if state.shutdown {
                    return;
                }
                let now = Instant::now();
                state.deadlines.retain(|mac, deadline| {
                    if *deadline <= now {
                        expired.push(*mac);
                        false
                    } else {
                        true
                    }
                });
                if expired.is_empty() {
                    match state.deadlines.values().min().copied() {
                        Some(next) => {
                            self.cond.wait_until(&mut state, next);
                        }
                        None => {
                            self.cond.wait(&mut state);
                        }
                    }
                    continue;
                }
            }
            for mac in expired {
                log::debug!("[timer] ack timeout fired for {mac}");
                fire(mac);
            }
        }
    }
}

impl Default for AckTimers {
    fn default() -> Self {
        Self::new()
    }
}
