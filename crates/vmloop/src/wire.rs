// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 vmloop contributors

//! Control-message codec for the bootstrap side channel.
//!
//! Control messages travel over the ordinary network path (tagged with
//! [`crate::config::CONTROL_ETHERTYPE`]), never over the shared-memory
//! channel. Three kinds exist: the discovery announce (gossip), the
//! create-request carrying the grant/event handles, and the create-ack.
//!
//! # Wire layout (little-endian)
//!
//! ```text
//! +--------+---------+------+--------+-------+----------------------+
//! | magic  | version | kind | sender | count | count x (mac, id)    |
//! | u16    | u8      | u8   | u16    | u8    | 6 bytes + u16        |
//! +--------+---------+------+--------+-------+----------------------+
//! | create-request only: grant_out u32 | grant_in u32 | event u32   |
//! +-------------------------------------------------------------+
//! ```

use crate::config::MAX_MESSAGE_ENTRIES;
use crate::transport::ChannelGrants;
use crate::types::{MacAddr, PeerId};
use std::fmt;

/// Frame magic ("VL").
pub const WIRE_MAGIC: u16 = 0x564C;

/// Codec version.
pub const WIRE_VERSION: u8 = 1;

const KIND_ANNOUNCE: u8 = 1;
const KIND_CREATE_REQUEST: u8 = 2;
const KIND_CREATE_ACK: u8 = 3;

const HEADER_LEN: usize = 7;
const ENTRY_LEN: usize = 8;
const GRANTS_LEN: usize = 12;

/// Decode failure for a control frame.
#[derive(Debug, PartialEq, Eq)]
pub enum WireError {
    /// Frame shorter than its declared layout.
    Truncated { expected: usize, got: usize },
    /// Magic bytes did not match.
    BadMagic(u16),
    /// Unsupported codec version.
    BadVersion(u8),
    /// Unknown message kind byte.
    UnknownKind(u8),
    /// Entry count exceeds the protocol bound.
    TooManyEntries(usize),
    /// A message kind that requires entries carried none.
    NoEntries,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { expected, got } => {
                write!(f, "truncated frame: expected {expected} bytes, got {got}")
            }
            Self::BadMagic(m) => write!(f, "bad magic 0x{m:04x}"),
            Self::BadVersion(v) => write!(f, "unsupported version {v}"),
            Self::UnknownKind(k) => write!(f, "unknown message kind {k}"),
            Self::TooManyEntries(n) => write!(f, "too many address entries: {n}"),
            Self::NoEntries => write!(f, "message carries no address entries"),
        }
    }
}

impl std::error::Error for WireError {}

/// One gossip entry: a peer's hardware address and its host-assigned id.
pub type AddrEntry = (MacAddr, PeerId);

/// Control message exchanged on the plain network path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlMessage {
    /// Gossip advertising known peer addresses. Informational only; never
    /// forces a state change on the receiver.
    Announce {
        /// Identifier of the announcing host agent.
        sender: PeerId,
        /// Known (address, id) pairs, including the sender's own guests.
        peers: Vec<AddrEntry>,
    },
    /// First half of the handshake: advertises the initiator's ring grants
    /// and event-signal reference so the acceptor can attach.
    CreateRequest {
        /// Initiator's peer id.
        sender: PeerId,
        /// Initiator's own addresses (first entry keys the peer record).
        addrs: Vec<AddrEntry>,
        /// Opaque grant/event references for attaching to the rings.
        grants: ChannelGrants,
    },
    /// Second half of the handshake: the channel is attached and usable.
    CreateAck {
        /// Acceptor's peer id.
        sender: PeerId,
        /// Acceptor's own addresses (first entry keys the peer record).
        addrs: Vec<AddrEntry>,
    },
}

impl ControlMessage {
    /// Sender id regardless of kind.
    #[must_use]
    pub fn sender(&self) -> PeerId {
        match self {
            Self::Announce { sender, .. }
            | Self::CreateRequest { sender, .. }
            | Self::CreateAck { sender, .. } => *sender,
        }
    }

    /// Short kind name for logging.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Announce { .. } => "announce",
            Self::CreateRequest { .. } => "create-request",
            Self::CreateAck { .. } => "create-ack",
        }
    }

    /// Serialize into a frame payload.
    ///
    /// Entry lists beyond the protocol bound are truncated (with a
    /// warning) so the emitted frame always decodes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let (kind, sender, entries) = match self {
            Self::Announce { sender, peers } => (KIND_ANNOUNCE, *sender, peers),
            Self::CreateRequest { sender, addrs, .. } => (KIND_CREATE_REQUEST, *sender, addrs),
            Self::CreateAck { sender, addrs } => (KIND_CREATE_ACK, *sender, addrs),
        };

        let count = entries.len().min(MAX_MESSAGE_ENTRIES);
        if entries.len() > count {
            log::warn!(
                "[wire] truncating {} address entries to the protocol bound of {MAX_MESSAGE_ENTRIES}",
                entries.len()
            );
        }
        let mut buf = Vec::with_capacity(HEADER_LEN + count * ENTRY_LEN + GRANTS_LEN);
        buf.extend_from_slice(&WIRE_MAGIC.to_le_bytes());
        buf.push(WIRE_VERSION);
        buf.push(kind);
        buf.extend_from_slice(&sender.0.to_le_bytes());
        buf.push(count as u8);
        for (mac, id) in &entries[..count] {
            buf.extend_from_slice(&mac.octets());
            buf.extend_from_slice(&id.0.to_le_bytes());
        }
        if let Self::CreateRequest { grants, .. } = self {
            buf.extend_from_slice(&grants.grant_out.to_le_bytes());
            buf.extend_from_slice(&grants.grant_in.to_le_bytes());
            buf.extend_from_slice(&grants.event_ref.to_le_bytes());
        }
        buf
    }

    /// Parse a frame payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] on truncated, mistagged, or oversized frames.
    /// Grant handle values are not validated here; the discovery engine
    /// rejects non-positive handles without touching the peer record.
    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        if frame.len() < HEADER_LEN {
            return Err(WireError::Truncated {
                expected: HEADER_LEN,
                got: frame.len(),
            });
        }

        let magic = u16::from_le_bytes([frame[0], frame[1]]);
        if magic != WIRE_MAGIC {
            return Err(WireError::BadMagic(magic));
        }
        if frame[2] != WIRE_VERSION {
            return Err(WireError::BadVersion(frame[2]));
        }
        let kind = frame[3];
        let sender = PeerId(u16::from_le_bytes([frame[4], frame[5]]));
        let count = frame[6] as usize;
        if count > MAX_MESSAGE_ENTRIES {
            return Err(WireError::TooManyEntries(count));
        }

        let entries_end = HEADER_LEN + count * ENTRY_LEN;
        let expected = match kind {
            KIND_CREATE_REQUEST => entries_end + GRANTS_LEN,
            _ => entries_end,
        };
        if frame.len() < expected {
            return Err(WireError::Truncated {
                expected,
                got: frame.len(),
            });
        }

        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let off = HEADER_LEN + i * ENTRY_LEN;
            let mut mac = [0u8; 6];
            mac.copy_from_slice(&frame[off..off + 6]);
            let id = u16::from_le_bytes([frame[off + 6], frame[off + 7]]);
            entries.push((MacAddr::new(mac), PeerId(id)));
        }

        match kind {
            KIND_ANNOUNCE => Ok(Self::Announce {
                sender,
                peers: entries,
            }),
            KIND_CREATE_REQUEST => {
                if entries.is_empty() {
                    return Err(WireError::NoEntries);
                }
                let g = &frame[entries_end..entries_end + GRANTS_LEN];
                let grants = ChannelGrants {
                    grant_out: u32::from_le_bytes([g[0], g[1], g[2], g[3]]),
                    grant_in: u32::from_le_bytes([g[4], g[5], g[6], g[7]]),
                    event_ref: u32::from_le_bytes([g[8], g[9], g[10], g[11]]),
                };
                Ok(Self::CreateRequest {
                    sender,
                    addrs: entries,
                    grants,
                })
            }
            KIND_CREATE_ACK => {
                if entries.is_empty() {
                    return Err(WireError::NoEntries);
                }
                Ok(Self::CreateAck {
                    sender,
                    addrs: entries,
                })
            }
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(last: u8) -> MacAddr {
        MacAddr::new([0x00, 0x16, 0x3e, 0x00, 0x00, last])
    }

    #[test]
    fn test_announce_roundtrip() {
        let msg = ControlMessage::Announce {
            sender: PeerId(0),
            peers: vec![(mac(1), PeerId(5)), (mac(2), PeerId(9))],
        };
        let decoded = ControlMessage::decode(&msg.encode()).expect("decode failed");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_create_request_roundtrip() {
        let msg = ControlMessage::CreateRequest {
            sender: PeerId(5),
            addrs: vec![(mac(1), PeerId(5))],
            grants: ChannelGrants {
                grant_out: 100,
                grant_in: 101,
                event_ref: 102,
            },
        };
        let decoded = ControlMessage::decode(&msg.encode()).expect("decode failed");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let msg = ControlMessage::CreateAck {
            sender: PeerId(9),
            addrs: vec![(mac(2), PeerId(9))],
        };
        let mut frame = msg.encode();
        frame[0] ^= 0xff;
        assert!(matches!(
            ControlMessage::decode(&frame),
            Err(WireError::BadMagic(_))
        ));
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let msg = ControlMessage::CreateRequest {
            sender: PeerId(5),
            addrs: vec![(mac(1), PeerId(5))],
            grants: ChannelGrants {
                grant_out: 1,
                grant_in: 2,
                event_ref: 3,
            },
        };
        let frame = msg.encode();
        // Every strict prefix must fail cleanly.
        for cut in 0..frame.len() {
            assert!(
                ControlMessage::decode(&frame[..cut]).is_err(),
                "prefix of {cut} bytes decoded"
            );
        }
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let msg = ControlMessage::Announce {
            sender: PeerId(0),
            peers: vec![(mac(1), PeerId(5))],
        };
        let mut frame = msg.encode();
        frame[3] = 77;
        assert_eq!(ControlMessage::decode(&frame), Err(WireError::UnknownKind(77)));
    }

    #[test]
    fn test_decode_rejects_empty_handshake() {
        let msg = ControlMessage::CreateAck {
            sender: PeerId(9),
            addrs: vec![(mac(2), PeerId(9))],
        };
        let mut frame = msg.encode();
        frame[6] = 0; // entry count
        let frame = &frame[..7];
        assert_eq!(ControlMessage::decode(frame), Err(WireError::NoEntries));
    }

    #[test]
    fn test_encode_caps_entry_count() {
        let peers: Vec<AddrEntry> = (0..300u16).map(|i| (mac(i as u8), PeerId(i))).collect();
        let frame = ControlMessage::Announce {
            sender: PeerId(0),
            peers,
        }
        .encode();
        match ControlMessage::decode(&frame).expect("decode failed") {
            ControlMessage::Announce { peers, .. } => {
                assert_eq!(peers.len(), MAX_MESSAGE_ENTRIES);
            }
            other => panic!("unexpected kind: {}", other.kind_name()),
        }
    }

    #[test]
    fn test_zero_grants_decode_but_flag_invalid() {
        // The codec passes zero handles through; rejection is the engine's
        // job so the peer record stays untouched.
        let msg = ControlMessage::CreateRequest {
            sender: PeerId(5),
            addrs: vec![(mac(1), PeerId(5))],
            grants: ChannelGrants {
                grant_out: 0,
                grant_in: 0,
                event_ref: 0,
            },
        };
        match ControlMessage::decode(&msg.encode()).expect("decode failed") {
            ControlMessage::CreateRequest { grants, .. } => assert!(!grants.is_valid()),
            other => panic!("unexpected kind: {}", other.kind_name()),
        }
    }
}
