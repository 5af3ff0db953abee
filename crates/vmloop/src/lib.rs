// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 vmloop contributors

//! vmloop - inter-guest shared-memory network loopback.
//!
//! Guests co-located on one physical host can skip the full network path
//! for traffic between them: packets are diverted onto bidirectional
//! shared-memory ring channels negotiated on demand. This crate implements
//! the guest-side subsystem behind that diversion:
//!
//! - **Discovery and negotiation** ([`discovery`]): peers are learned from
//!   gossip announces; the side with the smaller host-assigned id allocates
//!   rings and advertises them in a create-request, the other side attaches
//!   and acks. Unacked requests retry on a timer, then the peer is
//!   suspended.
//! - **Transmit scheduling** ([`scheduler`]): a non-blocking hook diverts
//!   packets for connected peers into all-or-nothing ring writes, with a
//!   single bounded FIFO absorbing transient ring backpressure.
//! - **Suspend and sweep** ([`sweep`]): suspended peers are torn down by a
//!   dedicated thread, never inline on the packet path.
//! - **Migration** ([`migration`]): a suspend notice freezes discovery and
//!   reclaims every channel before the guest's memory image is captured;
//!   after resume, peers are re-learned from scratch.
//!
//! The host-specific pieces (real ring mapping, event signalling, control
//! frame injection, the availability flag store) enter through the
//! [`transport::ChannelFactory`], [`discovery::ControlPlane`], and
//! [`migration::StatusSink`] seams. [`transport::mem`] provides an
//! in-process reference transport used throughout the tests.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use vmloop::{LoopConfig, VmLoop};
//! use vmloop::migration::LogStatusSink;
//! use vmloop::transport::MemChannelFactory;
//! use vmloop::types::{LocalIdentity, MacAddr, PeerId};
//!
//! # struct Glue;
//! # impl vmloop::discovery::ControlPlane for Glue {
//! #     fn send(&self, _: MacAddr, _: &vmloop::wire::ControlMessage) -> vmloop::Result<()> { Ok(()) }
//! # }
//! # fn main() -> vmloop::Result<()> {
//! let mac = MacAddr::parse("00:16:3e:0a:0b:0c").ok_or_else(|| {
//!     vmloop::Error::Setup("bad address".into())
//! })?;
//! let vm = VmLoop::new(
//!     LocalIdentity::new(PeerId(5), vec![mac]),
//!     LoopConfig::default(),
//!     Arc::new(MemChannelFactory::new()),
//!     Arc::new(Glue),
//!     Arc::new(LogStatusSink),
//! )?;
//! // Host glue calls vm.outbound_hook / vm.inbound_hook / vm.control_frame.
//! vm.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod discovery;
pub mod error;
pub mod migration;
pub mod registry;
pub mod scheduler;
pub mod sweep;
pub mod timer;
pub mod transport;
pub mod types;
pub mod wire;

pub use config::LoopConfig;
pub use context::{LoopStats, VmLoop};
pub use error::{Error, Result};
pub use migration::MigrationSignal;
pub use types::{MacAddr, PeerId, PeerState, Verdict};
