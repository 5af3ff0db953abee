// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 vmloop contributors

//! Peer discovery and channel negotiation.
//!
//! All peer-record mutation funnels through one engine thread draining a
//! single event channel, so handshake transitions never race each other.
//! Hooks, the timer thread, and the host glue only post events.
//!
//! Negotiation is asymmetric: for any pair, the side with the smaller peer
//! id allocates the rings and sends the create-request; the larger side
//! attaches and acks. A crossed handshake (a request arriving while our own
//! attempt is in flight) is resolved by dropping the local provisional
//! channel and accepting the peer's.

use crate::config::LoopConfig;
use crate::error::Result;
use crate::registry::MacTable;
use crate::sweep::SweepSignal;
use crate::timer::AckTimers;
use crate::transport::{ChannelFactory, ChannelGrants};
use crate::types::{LocalIdentity, MacAddr, PeerState, Role};
use crate::wire::{AddrEntry, ControlMessage};
use crossbeam::channel::Receiver;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Where outgoing control messages go.
///
/// The reference deployment frames them with
/// [`crate::config::CONTROL_ETHERTYPE`] and injects them into the ordinary
/// network path; tests wire engines to each other directly.
pub trait ControlPlane: Send + Sync {
    /// Deliver one control message to the guest owning `dest`.
    ///
    /// # Errors
    ///
    /// [`crate::Error::ControlSend`] when the network path refuses the
    /// frame. Handshake sends are retried by the ack timer; a lost ack is
    /// recovered by the peer re-requesting.
    fn send(&self, dest: MacAddr, msg: &ControlMessage) -> Result<()>;
}

/// Work item for the engine thread.
#[derive(Debug)]
pub enum Event {
    /// A decoded control frame, with the frame-level source address.
    Control { src: MacAddr, msg: ControlMessage },
    /// A hook saw traffic for an INIT peer; consider negotiating.
    StartListen(MacAddr),
    /// The ack timer expired for a peer in LISTEN.
    AckTimeout(MacAddr),
    /// Drain no further events and exit the engine thread.
    Shutdown,
}

/// The discovery state machine. Runs on a single thread; see module docs.
pub struct Engine {
    identity: LocalIdentity,
    table: Arc<MacTable>,
    factory: Arc<dyn ChannelFactory>,
    control: Arc<dyn ControlPlane>,
    timers: Arc<AckTimers>,
    sweep: Arc<SweepSignal>,
    frozen: Arc<AtomicBool>,
    config: LoopConfig,
}

impl Engine {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: LocalIdentity,
        table: Arc<MacTable>,
        factory: Arc<dyn ChannelFactory>,
        control: Arc<dyn ControlPlane>,
        timers: Arc<AckTimers>,
        sweep: Arc<SweepSignal>,
        frozen: Arc<AtomicBool>,
        config: LoopConfig,
    ) -> Self {
        Self {
            identity,
            table,
            factory,
            control,
            timers,
            sweep,
            frozen,
            config,
        }
    }

    /// Event loop; runs on a dedicated thread until [`Event::Shutdown`].
    pub fn run(&self, events: &Receiver<Event>) {
        while let Ok(event) = events.recv() {
            if matches!(event, Event::Shutdown) {
                log::debug!("[discovery] engine stopping");
                return;
            }
            self.handle(event);
        }
    }

    /// Process one event. Public for direct-drive tests.
    pub fn handle(&self, event: Event) {
        match event {
            Event::Control { src, msg } => {
                if self.frozen.load(Ordering::Acquire) {
                    log::debug!("[discovery] frozen: dropping {} from {src}", msg.kind_name());
                    return;
                }
                match msg {
                    ControlMessage::Announce { peers, .. } => self.on_announce(&peers),
                    ControlMessage::CreateRequest {
                        sender,
                        addrs,
                        grants,
                    } => self.on_create_request(src, sender, &addrs, grants),
                    ControlMessage::CreateAck { addrs, .. } => self.on_create_ack(&addrs),
                }
            }
            Event::StartListen(mac) => {
                if !self.frozen.load(Ordering::Acquire) {
                    self.start_listen(mac);
                }
            }
            Event::AckTimeout(mac) => self.on_ack_timeout(mac),
            Event::Shutdown => {}
        }
    }

    /// Gossip intake: learn addresses, refresh activity. Never changes the
    /// state of an existing record.
    ///
    /// An announce that does not name one of our own addresses is meant
    /// for some other segment and is ignored wholesale.
    fn on_announce(&self, peers: &[AddrEntry]) {
        if !peers.iter().any(|&(mac, _)| self.identity.owns(mac)) {
            log::debug!("[discovery] announce names none of our addresses; ignored");
            return;
        }
        for &(mac, peer_id) in peers {
            if self.identity.owns(mac) {
                continue;
            }
            self.table.insert(mac, peer_id);
        }
        self.table.update(peers);
    }

    /// Begin negotiation with an INIT peer, if the tie-break says we lead.
    fn start_listen(&self, mac: MacAddr) {
        let Some((state, peer_id)) = self.table.lookup(mac, |r| (r.state, r.peer_id)) else {
            return;
        };
        if state != PeerState::Init {
            return;
        }
        if self.identity.peer_id >= peer_id {
            // The smaller id initiates; we wait for the peer's request.
            return;
        }

        let channel = match self.factory.create(peer_id, self.config.ring_order) {
            Ok(channel) => channel,
            Err(err) => {
                log::warn!("[discovery] channel create for {mac} failed: {err}");
                return;
            }
        };
        let grants = channel.grants();
        let installed = self
            .table
            .with_mut(mac, |r| {
                if r.state != PeerState::Init {
                    return false;
                }
                r.state = PeerState::Listen;
                r.role = Role::Initiator;
                r.channel = Some(Arc::clone(&channel));
                r.retries = 1;
                true
            })
            .unwrap_or(false);
        if !installed {
            // Record changed underneath us; the channel was never
            // advertised, so inline release is safe.
            self.factory.release(&channel);
            return;
        }

        log::info!("[discovery] negotiating with {mac} (peer id {peer_id})");
        self.send_request(mac, grants);
        self.timers.arm(mac, Instant::now() + self.config.ack_timeout);
    }

    fn on_create_request(
        &self,
        src: MacAddr,
        sender: crate::types::PeerId,
        addrs: &[AddrEntry],
        grants: ChannelGrants,
    ) {
        if addrs.len() > 1 {
            log::warn!(
                "[discovery] create-request from peer {sender} lists {} addresses; keying on the first",
                addrs.len()
            );
        }
        let Some(&(mac, _)) = addrs.first() else {
            log::debug!("[discovery] create-request without addresses; dropped");
            return;
        };
        if src != mac {
            log::debug!("[discovery] create-request frame source {src} differs from claimed {mac}");
        }
        if self.identity.owns(mac) {
            log::warn!("[discovery] dropping create-request claiming our own address {mac}");
            return;
        }

        let Some((state, peer_id, prior)) =
            self.table
                .lookup(mac, |r| (r.state, r.peer_id, r.channel.clone()))
        else {
            log::debug!("[discovery] create-request from unannounced {mac}; dropped");
            return;
        };
        match state {
            PeerState::Connected => {
                // Duplicate request: our ack was lost, send it again.
                self.send_ack(mac);
                return;
            }
            PeerState::Suspend => {
                log::debug!("[discovery] create-request for suspended {mac}; dropped");
                return;
            }
            PeerState::Init | PeerState::Listen => {}
        }
        if !grants.is_valid() {
            log::warn!("[discovery] create-request from {mac} carries invalid grants; dropped");
            return;
        }

        let channel = match self.factory.connect(peer_id, grants) {
            Ok(channel) => channel,
            Err(err) => {
                log::warn!("[discovery] attach to {mac} failed: {err}");
                return;
            }
        };
        if state == PeerState::Listen {
            // Crossed handshake: abandon our provisional attempt. The
            // provisional rings were never attached, so inline release
            // cannot race a drain.
            self.timers.cancel(mac);
            if let Some(provisional) = prior {
                self.factory.release(&provisional);
            }
        }
        self.table.with_mut(mac, |r| {
            r.state = PeerState::Connected;
            r.role = Role::Acceptor;
            r.channel = Some(channel);
            r.retries = 0;
            r.last_seen = Instant::now();
        });
        self.send_ack(mac);
        log::info!("[discovery] channel established with {mac} (accept side)");
    }

    fn on_create_ack(&self, addrs: &[AddrEntry]) {
        let Some(&(mac, _)) = addrs.first() else {
            log::debug!("[discovery] create-ack without addresses; dropped");
            return;
        };
        match self.table.peer_state(mac) {
            Some(PeerState::Listen) => {
                self.timers.cancel(mac);
                self.table.with_mut(mac, |r| {
                    r.state = PeerState::Connected;
                    r.retries = 0;
                    r.last_seen = Instant::now();
                });
                log::info!("[discovery] channel established with {mac} (initiate side)");
            }
            Some(PeerState::Connected) => {
                // Duplicate ack; the handshake already completed.
            }
            _ => log::debug!("[discovery] stray create-ack keyed on {mac}; dropped"),
        }
    }

    fn on_ack_timeout(&self, mac: MacAddr) {
        let Some((state, retries, grants)) = self.table.lookup(mac, |r| {
            (r.state, r.retries, r.channel.as_ref().map(|c| c.grants()))
        }) else {
            return;
        };
        if state != PeerState::Listen {
            // Fire raced a cancel or a completed handshake.
            return;
        }

        if retries < self.config.max_retries {
            let Some(grants) = grants else {
                return;
            };
            self.table.with_mut(mac, |r| r.retries += 1);
            log::debug!(
                "[discovery] create-request to {mac} unacked; resending (attempt {})",
                retries + 1
            );
            self.send_request(mac, grants);
            self.timers.arm(mac, Instant::now() + self.config.ack_timeout);
        } else {
            log::warn!("[discovery] {mac} never acked after {retries} attempts; suspending");
            self.table.with_mut(mac, |r| {
                if let Some(channel) = &r.channel {
                    channel.set_suspend();
                }
                r.state = PeerState::Suspend;
            });
            self.sweep.signal();
        }
    }

    fn send_request(&self, mac: MacAddr, grants: ChannelGrants) {
        let msg = ControlMessage::CreateRequest {
            sender: self.identity.peer_id,
            addrs: self.identity.addr_entries(),
            grants,
        };
        if let Err(err) = self.control.send(mac, &msg) {
            // Not fatal: the ack timer drives the resend.
            log::warn!("[discovery] create-request to {mac} not sent: {err}");
        }
    }

    fn send_ack(&self, mac: MacAddr) {
        let msg = ControlMessage::CreateAck {
            sender: self.identity.peer_id,
            addrs: self.identity.addr_entries(),
        };
        if let Err(err) = self.control.send(mac, &msg) {
            // Not fatal: the peer re-requests and we ack again.
            log::warn!("[discovery] create-ack to {mac} not sent: {err}");
        }
    }
}
