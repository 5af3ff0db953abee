// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 vmloop contributors

//! Fundamental identifiers and enums shared across the crate.

use std::fmt;

/// A 6-byte link-layer hardware address identifying a peer guest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    /// Construct from raw octets.
    #[must_use]
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Raw octets.
    #[must_use]
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Parse a colon-separated hex string (`"aa:bb:cc:dd:ee:ff"`).
    ///
    /// Returns `None` on malformed input.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in &mut octets {
            let part = parts.next()?;
            if part.len() != 2 {
                return None;
            }
            *octet = u8::from_str_radix(part, 16).ok()?;
        }
        if parts.next().is_some() {
            return None;
        }
        Some(Self(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddr({self})")
    }
}

/// Host-assigned guest identifier, unique per physical host.
///
/// The numeric ordering is load-bearing: for any peer pair, only the side
/// with the smaller identifier initiates channel negotiation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct PeerId(pub u16);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-peer connection state.
///
/// Legal transitions:
///
/// ```text
/// Init -> Listen -> Connected -> Suspend -> (removed by sweep)
/// Init -----------> Connected    (accept side)
/// any  -----------> Suspend      (migration / cooperative shutdown / retry exhaustion)
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PeerState {
    /// Peer known by address only; no negotiation started.
    Init,
    /// Create-request sent, waiting for the ack; provisional channel exists.
    Listen,
    /// A usable channel exists on both ends.
    Connected,
    /// Channel flagged unusable, pending teardown by the sweep.
    Suspend,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "INIT",
            Self::Listen => "LISTEN",
            Self::Connected => "CONNECTED",
            Self::Suspend => "SUSPEND",
        };
        f.write_str(s)
    }
}

/// Which side of the handshake this record played.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Role {
    /// Sent the create-request (smaller peer id).
    Initiator,
    /// Attached to the initiator's buffers and acked.
    Acceptor,
}

/// Identity of the local guest: its host-assigned id and the hardware
/// addresses it answers for.
#[derive(Clone, Debug)]
pub struct LocalIdentity {
    /// This guest's host-assigned identifier.
    pub peer_id: PeerId,
    /// Addresses owned by this guest; gossip entries matching one of
    /// these are filtered out instead of becoming peer records.
    pub macs: Vec<MacAddr>,
}

impl LocalIdentity {
    #[must_use]
    pub fn new(peer_id: PeerId, macs: Vec<MacAddr>) -> Self {
        Self { peer_id, macs }
    }

    /// Whether `mac` belongs to this guest.
    #[must_use]
    pub fn owns(&self, mac: MacAddr) -> bool {
        self.macs.contains(&mac)
    }

    /// Gossip entries advertising this guest's addresses.
    #[must_use]
    pub fn addr_entries(&self) -> Vec<(MacAddr, PeerId)> {
        self.macs.iter().map(|m| (*m, self.peer_id)).collect()
    }
}

/// Verdict returned by the interception hooks to the host stack.
///
/// The hooks never suspend; this is a plain tagged result, not a future.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Verdict {
    /// Let the packet continue on the ordinary network path.
    PassThrough,
    /// The packet was taken over (enqueued or written to a channel).
    Consumed,
}
