//! Opcode table for the mesh protocol
//!
//! Every message on either plane starts with a single opcode byte. Control
//! messages travel over short-lived TCP connections; the one data-plane
//! opcode, `Voice`, prefixes every UDP audio datagram.
//!
//! Opcodes that carry a payload after the tag set the high bit.
//!
//! # Control messages
//! ```text
//! CONNECT     0x01  [port:u16]                      candidate -> target
//! REQP        0x03  -                               joiner -> target
//! DENY        0x04  -                               responder -> asker
//! PROPOSE     0x05  [ip:4][port:u16]                initiator -> member
//! DISCONNECT  0x06  [port:u16]                      leaver -> member
//! CLOSE       0x07  -                               initiator -> member
//! REQN        0x08  [port:u16]                      requester -> peer
//! SENDP       0x82  [len:u32][N x (ip:4, port:u16)] target -> joiner
//! ACCEPT      0x84  -                               responder -> asker
//! SENDN       0x85  [len:u8][name bytes]            peer -> requester
//! ```
//!
//! # Data plane
//! ```text
//! SENDV       0x83  [sequence:u32][length:u32][payload]   over UDP
//! ```
//!
//! All multi-byte integers are big-endian.

use crate::codec::errors::TransportError;

/// Protocol opcode, the first byte of every message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Request to join the call the target belongs to
    Connect = 0x01,
    /// Ask the target for its current peer list
    RequestPeers = 0x03,
    /// Negative verdict on a join or proposal
    Deny = 0x04,
    /// Ask an existing member whether a candidate may join
    Propose = 0x05,
    /// The sender is leaving the call
    Disconnect = 0x06,
    /// Abort the current exchange; close the connection
    Close = 0x07,
    /// Ask a peer for its display name
    RequestName = 0x08,
    /// Peer list reply to `RequestPeers`
    SendPeers = 0x82,
    /// Encoded audio frame (UDP data plane)
    Voice = 0x83,
    /// Positive verdict on a join or proposal
    Accept = 0x84,
    /// Display name reply to `RequestName`
    SendName = 0x85,
}

impl TryFrom<u8> for Opcode {
    type Error = TransportError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x01 => Ok(Opcode::Connect),
            0x03 => Ok(Opcode::RequestPeers),
            0x04 => Ok(Opcode::Deny),
            0x05 => Ok(Opcode::Propose),
            0x06 => Ok(Opcode::Disconnect),
            0x07 => Ok(Opcode::Close),
            0x08 => Ok(Opcode::RequestName),
            0x82 => Ok(Opcode::SendPeers),
            0x83 => Ok(Opcode::Voice),
            0x84 => Ok(Opcode::Accept),
            0x85 => Ok(Opcode::SendName),
            _ => Err(TransportError::ProtocolViolation("unknown opcode")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_round_trip() {
        for byte in [0x01u8, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x82, 0x83, 0x84, 0x85] {
            let opcode = Opcode::try_from(byte).unwrap();
            assert_eq!(opcode as u8, byte);
        }
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        assert!(Opcode::try_from(0x00).is_err());
        assert!(Opcode::try_from(0x81).is_err());
        assert!(Opcode::try_from(0xff).is_err());
    }
}
