// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 vmloop contributors

//! Channel transport contract: the paired shared-memory rings.
//!
//! A channel is a bidirectional pair of bounded slotted rings shared between
//! two peers. Each write occupies one descriptor slot plus enough data slots
//! for the payload; writes are all-or-nothing (no partial writes). The ring
//! internals (memory grants, event signalling) are a collaborator concern;
//! this module fixes the observable contract and provides [`mem`], a
//! process-local reference implementation used by the tests.
//!
//! ```text
//! +-----------+    out ring (slots)    +-----------+
//! |  guest A  | ---------------------> |  guest B  |
//! |           | <--------------------- |           |
//! +-----------+    in ring (slots)     +-----------+
//!        shared descriptor: suspend flags (A side, B side)
//! ```

pub mod mem;

pub use mem::{MemChannel, MemChannelFactory};

use std::fmt;
use std::sync::Arc;

/// Fixed slot size in bytes. A payload of `n` bytes occupies
/// `1 + ceil(n / SLOT_SIZE)` slots (one descriptor slot plus data slots).
pub const SLOT_SIZE: usize = 64;

/// Slots required to carry `len` payload bytes.
#[must_use]
pub const fn slots_for(len: usize) -> usize {
    1 + len.div_ceil(SLOT_SIZE)
}

/// Opaque references a peer needs to attach to the other side's rings:
/// two memory grants and one event-signal reference.
///
/// All three must be non-zero in a valid create-request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelGrants {
    /// Grant for the initiator's outbound ring.
    pub grant_out: u32,
    /// Grant for the initiator's inbound ring.
    pub grant_in: u32,
    /// Event-signal reference for cross-peer wakes.
    pub event_ref: u32,
}

impl ChannelGrants {
    /// All handle fields are positive.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.grant_out != 0 && self.grant_in != 0 && self.event_ref != 0
    }
}

/// Transport operation failure.
#[derive(Debug)]
pub enum TransportError {
    /// Not enough free slots for an all-or-nothing write.
    InsufficientSpace { needed: usize, free: usize },
    /// Payload cannot fit the ring even when empty.
    PayloadTooLarge { size: usize, capacity: usize },
    /// Channel allocation failed.
    CreateFailed(String),
    /// Attaching to an advertised channel failed.
    ConnectFailed(String),
    /// No channel registered under the given grant reference.
    UnknownGrant(u32),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientSpace { needed, free } => {
                write!(f, "insufficient ring space: need {needed} slots, {free} free")
            }
            Self::PayloadTooLarge { size, capacity } => {
                write!(f, "payload too large: {size} bytes, ring holds {capacity}")
            }
            Self::CreateFailed(msg) => write!(f, "channel create failed: {msg}"),
            Self::ConnectFailed(msg) => write!(f, "channel connect failed: {msg}"),
            Self::UnknownGrant(g) => write!(f, "unknown grant reference {g}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// One attached end of an established (or provisional) channel.
///
/// Write operations address this side's outbound ring; `recv` drains this
/// side's inbound ring. Implementations must be safe to call concurrently
/// from the interception path, the retry task, and the sweep.
pub trait Channel: Send + Sync {
    /// Total slot count of the outbound ring.
    fn capacity_slots(&self) -> usize;

    /// Currently free slots in the outbound ring.
    fn free_slots(&self) -> usize;

    /// Write one payload as a string of slots, all-or-nothing.
    ///
    /// # Errors
    ///
    /// [`TransportError::InsufficientSpace`] when free slots do not cover
    /// the required count; the ring is left untouched.
    fn write_bulk(&self, payload: &[u8]) -> Result<(), TransportError>;

    /// Signal the peer so it can poll its inbound ring.
    fn notify_peer(&self);

    /// Either side's suspend flag is set on the shared descriptor.
    fn suspended(&self) -> bool;

    /// Set both suspend flags (cooperative shutdown signal, not a crash
    /// detector); observed by the peer on its next hook or sweep pass.
    fn set_suspend(&self);

    /// Grant/event references to advertise in a create-request.
    fn grants(&self) -> ChannelGrants;

    /// Pop one payload from the inbound ring, if any.
    fn recv(&self) -> Option<Vec<u8>>;
}

/// Creates, attaches, and releases channels.
///
/// `release` is only ever called by the suspend sweep (or final teardown),
/// never inline on the packet path.
pub trait ChannelFactory: Send + Sync {
    /// Allocate a fresh channel pair sized `1 << ring_order` slots per
    /// direction, all slots free, and register its grants for the peer.
    ///
    /// # Errors
    ///
    /// [`TransportError::CreateFailed`] when allocation fails.
    fn create(
        &self,
        peer: crate::types::PeerId,
        ring_order: u8,
    ) -> Result<Arc<dyn Channel>, TransportError>;

    /// Attach to a peer's advertised rings, forming the other half of the
    /// channel.
    ///
    /// # Errors
    ///
    /// [`TransportError::ConnectFailed`] or
    /// [`TransportError::UnknownGrant`] when the grants cannot be mapped.
    fn connect(
        &self,
        peer: crate::types::PeerId,
        grants: ChannelGrants,
    ) -> Result<Arc<dyn Channel>, TransportError>;

    /// Tear down a channel end and unregister its grants.
    fn release(&self, channel: &Arc<dyn Channel>);
}
