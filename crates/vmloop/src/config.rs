// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 vmloop contributors

//! Global configuration - single source of truth.
//!
//! All protocol constants live here; runtime tunables live in [`LoopConfig`].
//! Never hardcode these values elsewhere.

use std::time::Duration;

/// Reserved link-layer protocol identifier carried by control frames.
///
/// Frames with this ethertype bypass the IP stack and are dispatched to
/// [`crate::context::VmLoop::control_frame`] by the host glue.
pub const CONTROL_ETHERTYPE: u16 = 0x1DC0;

/// Default ring size order: each direction holds `1 << order` slots.
pub const DEFAULT_RING_ORDER: u8 = 9;

/// Default ack timeout for the create-request/create-ack handshake.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Default maximum number of create-requests sent before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default suspend-monitor period (pure-timeout wake).
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Default inactivity threshold after which a peer is suspended.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30);

/// Retry-thread poll interval while the outbound queue is non-empty.
pub const DEFAULT_RETRY_BUSY: Duration = Duration::from_millis(10);

/// Retry-thread poll interval while the outbound queue is empty.
pub const DEFAULT_RETRY_IDLE: Duration = Duration::from_secs(1);

/// Default bound on the shared outbound queue.
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 512;

/// Maximum number of (address, id) entries accepted in one control message.
pub const MAX_MESSAGE_ENTRIES: usize = 32;

/// Runtime tunables for one [`crate::context::VmLoop`] instance.
///
/// Every field has a production default; tests shrink the timeouts and the
/// ring to exercise retry and backpressure paths quickly.
#[derive(Clone, Debug)]
pub struct LoopConfig {
    /// Ring size order (`1 << ring_order` slots per direction).
    pub ring_order: u8,
    /// Handshake ack timeout.
    pub ack_timeout: Duration,
    /// Maximum create-requests sent (initial send included) before SUSPEND.
    pub max_retries: u32,
    /// Suspend-monitor wake period.
    pub sweep_interval: Duration,
    /// Peers idle longer than this are suspended by the sweep.
    pub stale_after: Duration,
    /// Retry poll interval while packets are pending.
    pub retry_busy: Duration,
    /// Retry poll interval while the queue is idle.
    pub retry_idle: Duration,
    /// Outbound queue bound; submissions beyond it fall back to the network.
    pub max_queue_depth: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            ring_order: DEFAULT_RING_ORDER,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
            retry_busy: DEFAULT_RETRY_BUSY,
            retry_idle: DEFAULT_RETRY_IDLE,
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
        }
    }
}
