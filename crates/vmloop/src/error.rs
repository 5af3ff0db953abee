// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 vmloop contributors

//! Crate-wide error type.
//!
//! Error taxonomy:
//!
//! - Resource exhaustion (ring/queue full) is recoverable: the caller falls
//!   back to the ordinary network path or the retry task picks the packet up.
//! - Protocol violations (malformed control frames) are logged and dropped
//!   without touching peer records.
//! - Setup failures are fatal to activation; the context unwinds whatever it
//!   already started.

use crate::transport::TransportError;
use crate::wire::WireError;
use std::fmt;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for the channel subsystem.
#[derive(Debug)]
pub enum Error {
    /// Context activation failed (thread spawn, collaborator init).
    Setup(String),
    /// Channel transport operation failed.
    Transport(TransportError),
    /// Control frame could not be decoded.
    Wire(WireError),
    /// A control message could not be handed to the network path.
    ControlSend(String),
    /// No usable channel for the destination; use the ordinary path.
    NoChannel,
    /// Packet exceeds the channel's total ring capacity; never enqueued.
    PacketTooLarge {
        /// Payload size in bytes.
        size: usize,
        /// Total ring capacity in bytes.
        capacity: usize,
    },
    /// The shared outbound queue is at its bound.
    QueueFull,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup(msg) => write!(f, "subsystem setup failed: {msg}"),
            Self::Transport(e) => write!(f, "channel transport error: {e}"),
            Self::Wire(e) => write!(f, "control frame error: {e}"),
            Self::ControlSend(msg) => write!(f, "control message send failed: {msg}"),
            Self::NoChannel => write!(f, "no usable channel for destination"),
            Self::PacketTooLarge { size, capacity } => {
                write!(
                    f,
                    "packet too large: {size} bytes exceeds ring capacity {capacity}"
                )
            }
            Self::QueueFull => write!(f, "outbound queue full"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Wire(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<WireError> for Error {
    fn from(e: WireError) -> Self {
        Self::Wire(e)
    }
}
