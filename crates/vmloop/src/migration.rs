// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 vmloop contributors

//! Migration coordination: freeze before the memory image is captured,
//! thaw after arrival.
//!
//! Shared-memory channels do not survive a guest migration, so on the
//! suspend notice every peer is forced to SUSPEND, the sweep reclaims the
//! channels, and discovery is frozen so no half-built channel can leak
//! into the captured image. On resume the freeze lifts and peers are
//! re-learned from scratch through the normal announce flow.

use crate::registry::MacTable;
use crate::sweep::SweepSignal;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Host-side lifecycle notice delivered to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationSignal {
    /// The guest is about to be checkpointed or migrated.
    Suspending,
    /// The guest is running again, possibly on another host.
    Resumed,
}

/// Where the "fast path available" advertisement is written.
///
/// The reference deployment writes a flag into the host-visible config
/// store; embedders plug in their own sink.
pub trait StatusSink: Send + Sync {
    /// Advertise (or retract) fast-path availability.
    fn publish(&self, active: bool);
}

/// Sink that only logs the transition.
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn publish(&self, active: bool) {
        log::info!(
            "[migration] fast-path advertisement: {}",
            if active { "active" } else { "inactive" }
        );
    }
}

/// Serialized handler for migration signals.
///
/// `deliver` is idempotent per phase: repeated Suspending notices after
/// the first, or a Resumed notice while already running, are no-ops.
pub struct MigrationCoordinator {
    frozen: Arc<AtomicBool>,
    table: Arc<MacTable>,
    sweep: Arc<SweepSignal>,
    status: Arc<dyn StatusSink>,
    // Serializes deliver() against itself; signals can arrive from
    // arbitrary host callback contexts.
    phase: Mutex<()>,
}

impl MigrationCoordinator {
    #[must_use]
    pub fn new(
        frozen: Arc<AtomicBool>,
        table: Arc<MacTable>,
        sweep: Arc<SweepSignal>,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            frozen,
            table,
            sweep,
            status,
            phase: Mutex::new(()),
        }
    }

    /// Whether discovery is currently frozen.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn deliver(&self, signal: MigrationSignal) {
        let _guard = self.phase.lock();
        match signal {
            MigrationSignal::Suspending => {
                if self.frozen.swap(true, Ordering::AcqRel) {
                    return;
                }
                log::info!("[migration] suspend notice: freezing discovery");
                self.status.publish(false);
                let marked = self.table.mark_all_suspended();
                if marked > 0 {
                    log::info!("[migration] suspended {marked} peer(s) ahead of checkpoint");
                }
                self.sweep.signal();
            }
            MigrationSignal::Resumed => {
                if !self.frozen.swap(false, Ordering::AcqRel) {
                    return;
                }
                log::info!("[migration] resume notice: thawing discovery");
                self.status.publish(true);
            }
        }
    }
}
