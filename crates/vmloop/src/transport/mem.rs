// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 vmloop contributors

//! Process-local reference channel.
//!
//! Implements the [`Channel`]/[`ChannelFactory`] contract over plain memory
//! shared between two ends in the same process: slot accounting identical to
//! the real ring (descriptor slot + data slots, all-or-nothing writes), a
//! shared descriptor with per-side suspend flags, and wake counters standing
//! in for the event-signal mechanism. Grant references are keys into the
//! factory's registration table, mirroring how a real backend would map an
//! advertised grant.

use super::{slots_for, Channel, ChannelFactory, ChannelGrants, TransportError, SLOT_SIZE};
use crate::types::PeerId;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

struct RingState {
    queue: VecDeque<Vec<u8>>,
    used_slots: usize,
}

/// One direction: a bounded slotted ring.
struct Ring {
    slots: usize,
    state: Mutex<RingState>,
}

impl Ring {
    fn new(slots: usize) -> Self {
        Self {
            slots,
            state: Mutex::new(RingState {
                queue: VecDeque::new(),
                used_slots: 0,
            }),
        }
    }

    fn free(&self) -> usize {
        self.slots - self.state.lock().used_slots
    }

    /// All-or-nothing write; the ring is untouched on failure.
    fn try_push(&self, payload: &[u8]) -> Result<(), TransportError> {
        let needed = slots_for(payload.len());
        if needed > self.slots {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                capacity: self.slots * SLOT_SIZE,
            });
        }
        let mut state = self.state.lock();
        let free = self.slots - state.used_slots;
        if needed > free {
            return Err(TransportError::InsufficientSpace { needed, free });
        }
        state.used_slots += needed;
        state.queue.push_back(payload.to_vec());
        Ok(())
    }

    fn pop(&self) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        let payload = state.queue.pop_front()?;
        state.used_slots -= slots_for(payload.len());
        Some(payload)
    }
}

/// Shared descriptor: cooperative suspend flags, one per side.
struct Descriptor {
    suspend_a: AtomicBool,
    suspend_b: AtomicBool,
}

struct Shared {
    a_to_b: Ring,
    b_to_a: Ring,
    descriptor: Descriptor,
    /// Wake counters standing in for the event channel, one per side.
    wake_a: AtomicU64,
    wake_b: AtomicU64,
    grants: ChannelGrants,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    /// Creator end.
    A,
    /// Connector end.
    B,
}

/// One end of a process-local channel.
pub struct MemChannel {
    shared: Arc<Shared>,
    side: Side,
}

impl MemChannel {
    fn out_ring(&self) -> &Ring {
        match self.side {
            Side::A => &self.shared.a_to_b,
            Side::B => &self.shared.b_to_a,
        }
    }

    fn in_ring(&self) -> &Ring {
        match self.side {
            Side::A => &self.shared.b_to_a,
            Side::B => &self.shared.a_to_b,
        }
    }

    /// Number of wake signals delivered to this side.
    #[must_use]
    pub fn notifications(&self) -> u64 {
        match self.side {
            Side::A => self.shared.wake_a.load(Ordering::Relaxed),
            Side::B => self.shared.wake_b.load(Ordering::Relaxed),
        }
    }
}

impl Channel for MemChannel {
    fn capacity_slots(&self) -> usize {
        self.out_ring().slots
    }

    fn free_slots(&self) -> usize {
        self.out_ring().free()
    }

    fn write_bulk(&self, payload: &[u8]) -> Result<(), TransportError> {
        self.out_ring().try_push(payload)
    }

    fn notify_peer(&self) {
        let counter = match self.side {
            Side::A => &self.shared.wake_b,
            Side::B => &self.shared.wake_a,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn suspended(&self) -> bool {
        self.shared.descriptor.suspend_a.load(Ordering::Acquire)
            || self.shared.descriptor.suspend_b.load(Ordering::Acquire)
    }

    fn set_suspend(&self) {
        self.shared.descriptor.suspend_a.store(true, Ordering::Release);
        self.shared.descriptor.suspend_b.store(true, Ordering::Release);
    }

    fn grants(&self) -> ChannelGrants {
        self.shared.grants
    }

    fn recv(&self) -> Option<Vec<u8>> {
        self.in_ring().pop()
    }
}

/// Factory handing out process-local channel pairs.
///
/// Grant references are allocated from a monotonically increasing counter
/// and resolved through an internal registration table; they stay
/// registered until [`ChannelFactory::release`] so a retried create-request
/// can still be attached by a slow peer.
pub struct MemChannelFactory {
    next_ref: AtomicU32,
    registered: DashMap<u32, Arc<Shared>>,
}

impl MemChannelFactory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            // Zero is reserved: a zero handle marks an invalid grant.
            next_ref: AtomicU32::new(1),
            registered: DashMap::new(),
        }
    }

    /// Number of channels currently registered (test introspection).
    #[must_use]
    pub fn registered_count(&self) -> usize {
        self.registered.len()
    }

    /// Typed variant of [`ChannelFactory::create`].
    ///
    /// # Errors
    ///
    /// Same contract as the trait method.
    pub fn create_mem(&self, ring_order: u8) -> Result<Arc<MemChannel>, TransportError> {
        if ring_order > 20 {
            return Err(TransportError::CreateFailed(format!(
                "ring order {ring_order} too large"
            )));
        }
        let slots = 1usize << ring_order;
        let base = self.next_ref.fetch_add(3, Ordering::Relaxed);
        let grants = ChannelGrants {
            grant_out: base,
            grant_in: base + 1,
            event_ref: base + 2,
        };
        let shared = Arc::new(Shared {
            a_to_b: Ring::new(slots),
            b_to_a: Ring::new(slots),
            descriptor: Descriptor {
                suspend_a: AtomicBool::new(false),
                suspend_b: AtomicBool::new(false),
            },
            wake_a: AtomicU64::new(0),
            wake_b: AtomicU64::new(0),
            grants,
        });
        self.registered.insert(grants.grant_out, Arc::clone(&shared));
        Ok(Arc::new(MemChannel {
            shared,
            side: Side::A,
        }))
    }

    /// Typed variant of [`ChannelFactory::connect`].
    ///
    /// # Errors
    ///
    /// Same contract as the trait method.
    pub fn connect_mem(&self, grants: ChannelGrants) -> Result<Arc<MemChannel>, TransportError> {
        if !grants.is_valid() {
            return Err(TransportError::ConnectFailed(
                "non-positive grant/event reference".to_string(),
            ));
        }
        let shared = self
            .registered
            .get(&grants.grant_out)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(TransportError::UnknownGrant(grants.grant_out))?;
        Ok(Arc::new(MemChannel {
            shared,
            side: Side::B,
        }))
    }
}

impl Default for MemChannelFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelFactory for MemChannelFactory {
    fn create(&self, _peer: PeerId, ring_order: u8) -> Result<Arc<dyn Channel>, TransportError> {
        Ok(self.create_mem(ring_order)? as Arc<dyn Channel>)
    }

    fn connect(
        &self,
        _peer: PeerId,
        grants: ChannelGrants,
    ) -> Result<Arc<dyn Channel>, TransportError> {
        Ok(self.connect_mem(grants)? as Arc<dyn Channel>)
    }

    fn release(&self, channel: &Arc<dyn Channel>) {
        self.registered.remove(&channel.grants().grant_out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(order: u8) -> (Arc<dyn Channel>, Arc<dyn Channel>, MemChannelFactory) {
        let factory = MemChannelFactory::new();
        let a = factory.create(PeerId(9), order).expect("create failed");
        let b = factory.connect(PeerId(5), a.grants()).expect("connect failed");
        (a, b, factory)
    }

    #[test]
    fn test_create_connect_and_transfer() {
        let (a, b, _f) = pair(4);
        a.write_bulk(b"hello").expect("write failed");
        a.notify_peer();
        assert_eq!(b.recv().as_deref(), Some(&b"hello"[..]));
        assert_eq!(b.recv(), None);

        b.write_bulk(b"reply").expect("write failed");
        assert_eq!(a.recv().as_deref(), Some(&b"reply"[..]));
    }

    #[test]
    fn test_slot_accounting() {
        let (a, b, _f) = pair(3); // 8 slots per direction
        assert_eq!(a.capacity_slots(), 8);
        assert_eq!(a.free_slots(), 8);

        // 3 * SLOT_SIZE bytes -> 1 descriptor + 3 data slots.
        let payload = vec![0u8; 3 * SLOT_SIZE];
        a.write_bulk(&payload).expect("write failed");
        assert_eq!(a.free_slots(), 4);

        // Popping releases the slots again.
        b.recv().expect("payload missing");
        assert_eq!(a.free_slots(), 8);
    }

    #[test]
    fn test_all_or_nothing_write() {
        let (a, _b, _f) = pair(3); // 8 slots
        a.write_bulk(&vec![0u8; 4 * SLOT_SIZE]).expect("write failed"); // 5 slots
        let before = a.free_slots();
        // Needs 4 slots, only 3 free: must fail without consuming anything.
        let err = a.write_bulk(&vec![0u8; 3 * SLOT_SIZE]).unwrap_err();
        assert!(matches!(err, TransportError::InsufficientSpace { .. }));
        assert_eq!(a.free_slots(), before);
    }

    #[test]
    fn test_payload_larger_than_ring() {
        let (a, _b, _f) = pair(3);
        let err = a.write_bulk(&vec![0u8; 9 * SLOT_SIZE]).unwrap_err();
        assert!(matches!(err, TransportError::PayloadTooLarge { .. }));
    }

    #[test]
    fn test_suspend_flags_visible_to_both_ends() {
        let (a, b, _f) = pair(4);
        assert!(!a.suspended());
        assert!(!b.suspended());
        b.set_suspend();
        assert!(a.suspended());
        assert!(b.suspended());
    }

    #[test]
    fn test_notify_counters_are_per_side() {
        let factory = MemChannelFactory::new();
        let a = factory.create_mem(4).expect("create failed");
        let b = factory.connect_mem(a.grants()).expect("connect failed");
        a.notify_peer();
        a.notify_peer();
        b.notify_peer();
        assert_eq!(b.notifications(), 2);
        assert_eq!(a.notifications(), 1);
    }

    #[test]
    fn test_connect_unknown_grant() {
        let factory = MemChannelFactory::new();
        let err = factory
            .connect(
                PeerId(5),
                ChannelGrants {
                    grant_out: 999,
                    grant_in: 1000,
                    event_ref: 1001,
                },
            )
            .err()
            .expect("connect unexpectedly succeeded");
        assert!(matches!(err, TransportError::UnknownGrant(999)));
    }

    #[test]
    fn test_connect_invalid_grants() {
        let factory = MemChannelFactory::new();
        let err = factory
            .connect(
                PeerId(5),
                ChannelGrants {
                    grant_out: 0,
                    grant_in: 0,
                    event_ref: 0,
                },
            )
            .err()
            .expect("connect unexpectedly succeeded");
        assert!(matches!(err, TransportError::ConnectFailed(_)));
    }

    #[test]
    fn test_release_unregisters() {
        let factory = MemChannelFactory::new();
        let a = factory.create(PeerId(9), 4).expect("create failed");
        let grants = a.grants();
        assert_eq!(factory.registered_count(), 1);
        factory.release(&a);
        assert_eq!(factory.registered_count(), 0);
        assert!(factory.connect(PeerId(5), grants).is_err());
    }
}
