use crate::buffer::packet::BUFFER_CAPACITY;
use crate::codec::errors::TransportError;
use crate::codec::opcode::Opcode;
use bytes::{Buf, BufMut};
use std::net::{Ipv4Addr, SocketAddrV4};

/// Voice datagram header: opcode(1) + sequence(4) + length(4)
pub const VOICE_HEADER_LEN: usize = 9;

/// Largest datagram the data plane will produce or accept
pub const MAX_DATAGRAM_LEN: usize = VOICE_HEADER_LEN + BUFFER_CAPACITY;

/// Wire size of one peer address record: IPv4 octets + port
pub const ADDRESS_LEN: usize = 6;

pub const MIN_NAME_LEN: usize = 1;
pub const MAX_NAME_LEN: usize = 18;

/// Frame an encoded audio payload into `out`, replacing its contents
pub fn encode_voice(sequence: u32, payload: &[u8], out: &mut Vec<u8>) {
    out.clear();
    out.put_u8(Opcode::Voice as u8);
    out.put_u32(sequence);
    out.put_u32(payload.len() as u32);
    out.extend_from_slice(payload);
}

/// Parse a voice datagram, returning the sequence number and payload slice
///
/// Rejects short datagrams, non-voice opcodes, empty or oversized payloads,
/// and length fields that disagree with the datagram size.
pub fn decode_voice(datagram: &[u8]) -> crate::Result<(u32, &[u8])> {
    if datagram.len() < VOICE_HEADER_LEN {
        return Err(TransportError::ProtocolViolation("voice datagram shorter than header").into());
    }
    let mut header = &datagram[..VOICE_HEADER_LEN];
    if header.get_u8() != Opcode::Voice as u8 {
        return Err(TransportError::ProtocolViolation("datagram is not a voice frame").into());
    }
    let sequence = header.get_u32();
    let length = header.get_u32() as usize;
    if length == 0 {
        return Err(TransportError::EmptyPayload.into());
    }
    if length > BUFFER_CAPACITY {
        return Err(TransportError::BufferTooLarge(length).into());
    }
    if VOICE_HEADER_LEN + length != datagram.len() {
        return Err(TransportError::ProtocolViolation("length field does not match datagram").into());
    }
    Ok((sequence, &datagram[VOICE_HEADER_LEN..]))
}

/// Append one 6-byte peer address record
pub fn encode_address(addr: &SocketAddrV4, out: &mut Vec<u8>) {
    out.extend_from_slice(&addr.ip().octets());
    out.put_u16(addr.port());
}

/// Decode one 6-byte peer address record
pub fn decode_address(record: &[u8]) -> crate::Result<SocketAddrV4> {
    if record.len() != ADDRESS_LEN {
        return Err(TransportError::MalformedAddress.into());
    }
    let ip = Ipv4Addr::new(record[0], record[1], record[2], record[3]);
    let port = u16::from_be_bytes([record[4], record[5]]);
    if port == 0 {
        return Err(TransportError::MalformedAddress.into());
    }
    Ok(SocketAddrV4::new(ip, port))
}

/// Check a display name against the roster rules: 1 to 18 characters, each
/// alphanumeric, `-`, or `_`
pub fn valid_display_name(name: &str) -> bool {
    (MIN_NAME_LEN..=MAX_NAME_LEN).contains(&name.len())
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voice_round_trip() {
        let mut frame = Vec::new();
        encode_voice(7, b"encoded opus bytes", &mut frame);
        assert_eq!(frame.len(), VOICE_HEADER_LEN + 18);

        let (sequence, payload) = decode_voice(&frame).unwrap();
        assert_eq!(sequence, 7);
        assert_eq!(payload, b"encoded opus bytes");
    }

    #[test]
    fn test_voice_rejects_short_datagram() {
        assert!(decode_voice(&[0x83, 0, 0]).is_err());
    }

    #[test]
    fn test_voice_rejects_wrong_opcode() {
        let mut frame = Vec::new();
        encode_voice(1, b"x", &mut frame);
        frame[0] = Opcode::Connect as u8;
        assert!(decode_voice(&frame).is_err());
    }

    #[test]
    fn test_voice_rejects_length_mismatch() {
        let mut frame = Vec::new();
        encode_voice(1, b"abcd", &mut frame);
        frame.truncate(frame.len() - 1);
        assert!(decode_voice(&frame).is_err());
    }

    #[test]
    fn test_voice_rejects_oversized_length() {
        let mut frame = Vec::new();
        frame.put_u8(Opcode::Voice as u8);
        frame.put_u32(1);
        frame.put_u32((BUFFER_CAPACITY + 1) as u32);
        frame.resize(VOICE_HEADER_LEN + BUFFER_CAPACITY + 1, 0);
        assert!(decode_voice(&frame).is_err());
    }

    #[test]
    fn test_address_round_trip() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 20), 8421);
        let mut out = Vec::new();
        encode_address(&addr, &mut out);
        assert_eq!(out.len(), ADDRESS_LEN);
        assert_eq!(decode_address(&out).unwrap(), addr);
    }

    #[test]
    fn test_address_rejects_zero_port() {
        let record = [10, 0, 0, 1, 0, 0];
        assert!(decode_address(&record).is_err());
    }

    #[test]
    fn test_display_name_rules() {
        assert!(valid_display_name("alice"));
        assert!(valid_display_name("peer_1-a"));
        assert!(valid_display_name("a"));
        assert!(valid_display_name("eighteen_chars_ab1"));
        assert!(!valid_display_name(""));
        assert!(!valid_display_name("nineteen_characters"));
        assert!(!valid_display_name("has space"));
        assert!(!valid_display_name("dot.name"));
    }
}
