//! Transport and wire-format errors
//!
//! This module defines the single error type used across the packet queuing,
//! jitter-buffer, and control-protocol code. All failure modes of the
//! subsystem collapse into one enum so callers can match on the category
//! without chasing per-module error structs.

use std::fmt;
use std::fmt::Display;

/// Transport subsystem errors
///
/// Covers buffer contract violations (empty or oversized payloads), malformed
/// wire data, and control-exchange failures. Admission denial is not an error
/// and is reported through ordinary return values.
#[derive(Debug, PartialEq, Eq)]
pub enum TransportError {
    /// A packet with a zero-length payload was handed to a queue
    ///
    /// Empty packets are a caller bug, not a network condition. The packet
    /// is consumed and dropped.
    EmptyPayload,

    /// A payload exceeds the fixed packet buffer capacity
    ///
    /// Carries the offending length in bytes.
    BufferTooLarge(usize),

    /// A peer address field could not be decoded
    ///
    /// Occurs when:
    /// - An address record is not exactly 6 bytes (IPv4 + port)
    /// - The port field is zero
    /// - A peer presented an IPv6 source address (the wire format is IPv4)
    MalformedAddress,

    /// The remote side broke the control protocol
    ///
    /// Unexpected opcode, short read, or an out-of-range length field. The
    /// current exchange is aborted; the mesh itself is unaffected.
    ProtocolViolation(&'static str),

    /// A control read or write did not complete within the socket timeout
    Timeout,

    /// The mesh already holds the maximum number of peers
    PeerLimit,

    /// A display name is empty, too long, or uses characters outside
    /// alphanumerics, `-` and `_`
    InvalidName,
}

impl std::error::Error for TransportError {}

impl Display for TransportError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransportError::EmptyPayload => "packet payload is empty".fmt(fmt),
            TransportError::BufferTooLarge(len) => {
                write!(fmt, "payload of {} bytes exceeds buffer capacity", len)
            }
            TransportError::MalformedAddress => "malformed peer address".fmt(fmt),
            TransportError::ProtocolViolation(what) => {
                write!(fmt, "protocol violation: {}", what)
            }
            TransportError::Timeout => "control exchange timed out".fmt(fmt),
            TransportError::PeerLimit => "peer limit reached".fmt(fmt),
            TransportError::InvalidName => "invalid display name".fmt(fmt),
        }
    }
}
