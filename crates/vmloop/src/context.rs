// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 vmloop contributors

//! The assembled subsystem: one [`VmLoop`] per guest.
//!
//! `VmLoop::new` wires the peer table, transmit scheduler, discovery
//! engine, ack timers, and suspend monitor together and starts their four
//! background threads:
//!
//! ```text
//!   hooks / host glue --events--> engine thread  (peer-record mutation)
//!   ack timers        --events-->
//!   retry thread      ---------> rings           (queued packet drain)
//!   sweep thread      ---------> factory.release (channel teardown)
//! ```
//!
//! The interception hooks are synchronous and non-blocking; everything
//! stateful happens on the background threads. `shutdown` (also run on
//! drop) retracts the availability flag, freezes discovery, suspends every
//! peer, and joins all four threads.

use crate::config::LoopConfig;
use crate::discovery::{ControlPlane, Engine, Event};
use crate::error::{Error, Result};
use crate::migration::{MigrationCoordinator, MigrationSignal, StatusSink};
use crate::registry::MacTable;
use crate::scheduler::TxScheduler;
use crate::sweep::{SuspendMonitor, SweepSignal};
use crate::timer::AckTimers;
use crate::transport::{Channel, ChannelFactory};
use crate::types::{LocalIdentity, MacAddr, PeerState, Verdict};
use crate::wire::ControlMessage;
use crossbeam::channel::{unbounded, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

/// Interception counters. Monotonic; read via [`VmLoop::stats`].
#[derive(Default)]
struct Counters {
    total: AtomicU64,
    fast_path: AtomicU64,
    oversize: AtomicU64,
}

/// Point-in-time view of the interception counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoopStats {
    /// Outbound packets offered to the hook.
    pub total: u64,
    /// Packets taken over by a channel (written or queued).
    pub fast_path: u64,
    /// Packets rejected for exceeding their channel's ring capacity.
    pub oversize: u64,
    /// Queued packets later dropped as undeliverable.
    pub dropped: u64,
}

/// One guest's channel subsystem.
pub struct VmLoop {
    identity: LocalIdentity,
    table: Arc<MacTable>,
    scheduler: Arc<TxScheduler>,
    timers: Arc<AckTimers>,
    monitor: Arc<SuspendMonitor>,
    coordinator: MigrationCoordinator,
    events: Sender<Event>,
    status: Arc<dyn StatusSink>,
    frozen: Arc<AtomicBool>,
    counters: Counters,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

fn spawn(
    name: &str,
    body: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("vmloop-{name}"))
        .spawn(body)
        .map_err(|e| Error::Setup(format!("spawning {name} thread: {e}")))
}

impl VmLoop {
    /// Assemble the subsystem and start its background threads.
    ///
    /// Publishes the availability flag through `status` once everything is
    /// running.
    ///
    /// # Errors
    ///
    /// [`Error::Setup`] when a thread cannot be spawned; anything already
    /// started is stopped and joined before returning.
    pub fn new(
        identity: LocalIdentity,
        config: LoopConfig,
        factory: Arc<dyn ChannelFactory>,
        control: Arc<dyn ControlPlane>,
        status: Arc<dyn StatusSink>,
    ) -> Result<Self> {
        let table = Arc::new(MacTable::new());
        let timers = Arc::new(AckTimers::new());
        let sweep = Arc::new(SweepSignal::new());
        let frozen = Arc::new(AtomicBool::new(false));
        let (events, events_rx) = unbounded();

        let scheduler = Arc::new(TxScheduler::new(
            Arc::clone(&table),
            Arc::clone(&sweep),
            config.retry_busy,
            config.retry_idle,
            config.max_queue_depth,
        ));
        let monitor = Arc::new(SuspendMonitor::new(
            Arc::clone(&table),
            Arc::clone(&factory),
            Arc::clone(&timers),
            Arc::clone(&sweep),
            config.sweep_interval,
            config.stale_after,
        ));
        let engine = Arc::new(Engine::new(
            identity.clone(),
            Arc::clone(&table),
            Arc::clone(&factory),
            control,
            Arc::clone(&timers),
            Arc::clone(&sweep),
            Arc::clone(&frozen),
            config.clone(),
        ));
        let coordinator = MigrationCoordinator::new(
            Arc::clone(&frozen),
            Arc::clone(&table),
            Arc::clone(&sweep),
            Arc::clone(&status),
        );

        let mut threads = Vec::with_capacity(4);
        let started = (|| -> Result<()> {
            {
                let engine = Arc::clone(&engine);
                threads.push(spawn("engine", move || engine.run(&events_rx))?);
            }
            {
                let timers = Arc::clone(&timers);
                let tx = events.clone();
                threads.push(spawn("timer", move || {
                    timers.run(move |mac| {
                        // Send can only fail during teardown.
                        let _ = tx.send(Event::AckTimeout(mac));
                    });
                })?);
            }
            {
                let scheduler = Arc::clone(&scheduler);
                threads.push(spawn("retry", move || scheduler.run())?);
            }
            {
                let monitor = Arc::clone(&monitor);
                threads.push(spawn("sweep", move || monitor.run())?);
            }
            Ok(())
        })();
        if let Err(err) = started {
            let _ = events.send(Event::Shutdown);
            timers.stop();
            scheduler.stop();
            monitor.stop();
            for handle in threads {
                let _ = handle.join();
            }
            return Err(err);
        }

        log::info!(
            "[context] guest {} up with {} local address(es)",
            identity.peer_id,
            identity.macs.len()
        );
        status.publish(true);

        Ok(Self {
            identity,
            table,
            scheduler,
            timers,
            monitor,
            coordinator,
            events,
            status,
            frozen,
            counters: Counters::default(),
            threads: Mutex::new(threads),
            stopped: AtomicBool::new(false),
        })
    }

    /// This guest's identity.
    #[must_use]
    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    /// Outbound interception: try to divert a packet onto a channel.
    ///
    /// Non-blocking. [`Verdict::Consumed`] means the packet was written or
    /// queued; on [`Verdict::PassThrough`] the caller sends it on the
    /// ordinary network path. Seeing traffic for an INIT peer kicks off
    /// negotiation as a side effect.
    pub fn outbound_hook(&self, dest: MacAddr, payload: &[u8]) -> Verdict {
        if self.stopped.load(Ordering::Acquire) {
            return Verdict::PassThrough;
        }
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        match self.table.peer_state(dest) {
            Some(PeerState::Connected) => match self.scheduler.submit(payload, dest) {
                Ok(()) => {
                    self.counters.fast_path.fetch_add(1, Ordering::Relaxed);
                    Verdict::Consumed
                }
                Err(Error::PacketTooLarge { .. }) => {
                    self.counters.oversize.fetch_add(1, Ordering::Relaxed);
                    Verdict::PassThrough
                }
                Err(_) => Verdict::PassThrough,
            },
            Some(PeerState::Init) => {
                let _ = self.events.send(Event::StartListen(dest));
                Verdict::PassThrough
            }
            _ => Verdict::PassThrough,
        }
    }

    /// Inbound interception: account peer activity and kick off negotiation
    /// for INIT peers. Always passes the packet through.
    pub fn inbound_hook(&self, src: MacAddr) -> Verdict {
        if self.stopped.load(Ordering::Acquire) {
            return Verdict::PassThrough;
        }
        if let Some(state) = self.table.with_mut(src, |r| {
            r.last_seen = Instant::now();
            r.state
        }) {
            if state == PeerState::Init {
                let _ = self.events.send(Event::StartListen(src));
            }
        }
        Verdict::PassThrough
    }

    /// Hand a received control frame (already stripped to its payload) to
    /// the engine.
    ///
    /// # Errors
    ///
    /// [`Error::Wire`] when the frame does not decode; the engine never
    /// sees it.
    pub fn control_frame(&self, src: MacAddr, frame: &[u8]) -> Result<()> {
        let msg = ControlMessage::decode(frame).map_err(|err| {
            log::debug!("[context] undecodable control frame from {src}: {err}");
            err
        })?;
        let _ = self.events.send(Event::Control { src, msg });
        Ok(())
    }

    /// Deliver a host lifecycle notice.
    pub fn migration_signal(&self, signal: MigrationSignal) {
        self.coordinator.deliver(signal);
    }

    /// Interception counters.
    #[must_use]
    pub fn stats(&self) -> LoopStats {
        LoopStats {
            total: self.counters.total.load(Ordering::Relaxed),
            fast_path: self.counters.fast_path.load(Ordering::Relaxed),
            oversize: self.counters.oversize.load(Ordering::Relaxed),
            dropped: self.scheduler.dropped(),
        }
    }

    /// Current state of a peer, if known.
    #[must_use]
    pub fn peer_state(&self, mac: MacAddr) -> Option<PeerState> {
        self.table.peer_state(mac)
    }

    /// Unordered (address, state) snapshot of the peer table.
    #[must_use]
    pub fn peers(&self) -> Vec<(MacAddr, PeerState)> {
        self.table.snapshot()
    }

    /// The peer's channel end, for draining received payloads.
    #[must_use]
    pub fn channel_of(&self, mac: MacAddr) -> Option<Arc<dyn Channel>> {
        self.table.lookup(mac, |r| r.channel.clone()).flatten()
    }

    /// Currently armed handshake timers (test introspection).
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.timers.armed_count()
    }

    /// Packets waiting in the outbound queue.
    #[must_use]
    pub fn pending_packets(&self) -> usize {
        self.scheduler.pending()
    }

    /// Stop the subsystem: retract the availability flag, suspend every
    /// peer, release all channels, and join the background threads.
    /// Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("[context] guest {} shutting down", self.identity.peer_id);

        self.status.publish(false);
        self.frozen.store(true, Ordering::Release);
        self.scheduler.stop();
        self.table.mark_all_suspended();
        // The sweep's final pass releases every channel.
        self.monitor.stop();
        let _ = self.events.send(Event::Shutdown);
        self.timers.stop();

        let handles = std::mem::take(&mut *self.threads.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for VmLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}
