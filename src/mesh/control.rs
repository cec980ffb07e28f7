//! Socket-level control exchanges
//!
//! Every control operation is a short sequence of reads and writes on a TCP
//! connection the initiator opens for that one exchange. Each read and write
//! is individually bounded by the mesh's control timeout so a stalled peer
//! can never wedge the accept loop.
//!
//! Functions are generic over the stream so exchanges can be unit tested
//! against mock streams.

use crate::codec::errors::TransportError;
use crate::codec::opcode::Opcode;
use crate::codec::wire;
use crate::mesh::MAX_PEERS;
use bytes::BufMut;
use std::net::SocketAddrV4;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

async fn read_exact<S>(stream: &mut S, limit: Duration, buf: &mut [u8]) -> crate::Result<()>
where
    S: AsyncRead + Unpin,
{
    match timeout(limit, stream.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(TransportError::Timeout.into()),
    }
}

async fn write_all<S>(stream: &mut S, limit: Duration, buf: &[u8]) -> crate::Result<()>
where
    S: AsyncWrite + Unpin,
{
    match timeout(limit, stream.write_all(buf)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(TransportError::Timeout.into()),
    }
}

pub(crate) async fn read_opcode<S>(stream: &mut S, limit: Duration) -> crate::Result<Opcode>
where
    S: AsyncRead + Unpin,
{
    let mut tag = [0u8; 1];
    read_exact(stream, limit, &mut tag).await?;
    Opcode::try_from(tag[0]).map_err(Into::into)
}

pub(crate) async fn expect_opcode<S>(stream: &mut S, limit: Duration, expected: Opcode) -> crate::Result<()>
where
    S: AsyncRead + Unpin,
{
    let opcode = read_opcode(stream, limit).await?;
    if opcode != expected {
        return Err(TransportError::ProtocolViolation("unexpected opcode").into());
    }
    Ok(())
}

pub(crate) async fn read_port<S>(stream: &mut S, limit: Duration) -> crate::Result<u16>
where
    S: AsyncRead + Unpin,
{
    let mut port = [0u8; 2];
    read_exact(stream, limit, &mut port).await?;
    Ok(u16::from_be_bytes(port))
}

pub(crate) async fn read_address<S>(stream: &mut S, limit: Duration) -> crate::Result<SocketAddrV4>
where
    S: AsyncRead + Unpin,
{
    let mut record = [0u8; wire::ADDRESS_LEN];
    read_exact(stream, limit, &mut record).await?;
    wire::decode_address(&record)
}

/// Open a join handshake: CONNECT plus the sender's listen port
pub(crate) async fn send_connect<S>(stream: &mut S, limit: Duration, port: u16) -> crate::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut message = Vec::with_capacity(3);
    message.put_u8(Opcode::Connect as u8);
    message.put_u16(port);
    write_all(stream, limit, &message).await
}

/// Read an ACCEPT or DENY verdict byte
pub(crate) async fn read_verdict<S>(stream: &mut S, limit: Duration) -> crate::Result<bool>
where
    S: AsyncRead + Unpin,
{
    match read_opcode(stream, limit).await? {
        Opcode::Accept => Ok(true),
        Opcode::Deny => Ok(false),
        _ => Err(TransportError::ProtocolViolation("expected accept or deny").into()),
    }
}

pub(crate) async fn write_verdict<S>(stream: &mut S, limit: Duration, accept: bool) -> crate::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let tag = if accept { Opcode::Accept } else { Opcode::Deny };
    write_all(stream, limit, &[tag as u8]).await
}

/// Ask a member to vote on admitting `candidate`
pub(crate) async fn send_propose<S>(
    stream: &mut S,
    limit: Duration,
    candidate: SocketAddrV4,
) -> crate::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut message = Vec::with_capacity(1 + wire::ADDRESS_LEN);
    message.put_u8(Opcode::Propose as u8);
    wire::encode_address(&candidate, &mut message);
    write_all(stream, limit, &message).await
}

/// Request the remote peer list: REQP, then SENDP with length-prefixed records
pub(crate) async fn request_peer_list<S>(
    stream: &mut S,
    limit: Duration,
) -> crate::Result<Vec<SocketAddrV4>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_all(stream, limit, &[Opcode::RequestPeers as u8]).await?;
    expect_opcode(stream, limit, Opcode::SendPeers).await?;

    let mut length = [0u8; 4];
    read_exact(stream, limit, &mut length).await?;
    let length = u32::from_be_bytes(length) as usize;
    if length % wire::ADDRESS_LEN != 0 {
        return Err(TransportError::ProtocolViolation("peer list length not a record multiple").into());
    }
    if length > wire::ADDRESS_LEN * MAX_PEERS {
        return Err(TransportError::ProtocolViolation("peer list too large").into());
    }

    let mut payload = vec![0u8; length];
    read_exact(stream, limit, &mut payload).await?;

    let mut peers = Vec::with_capacity(length / wire::ADDRESS_LEN);
    for record in payload.chunks(wire::ADDRESS_LEN) {
        peers.push(wire::decode_address(record)?);
    }
    Ok(peers)
}

/// Answer a REQP with the full current peer list
pub(crate) async fn send_peer_list<S>(
    stream: &mut S,
    limit: Duration,
    peers: &[SocketAddrV4],
) -> crate::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut message = Vec::with_capacity(5 + peers.len() * wire::ADDRESS_LEN);
    message.put_u8(Opcode::SendPeers as u8);
    message.put_u32((peers.len() * wire::ADDRESS_LEN) as u32);
    for peer in peers {
        wire::encode_address(peer, &mut message);
    }
    write_all(stream, limit, &message).await
}

/// Request the remote display name: REQN with our port, SENDN back
pub(crate) async fn request_name<S>(
    stream: &mut S,
    limit: Duration,
    own_port: u16,
) -> crate::Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut message = Vec::with_capacity(3);
    message.put_u8(Opcode::RequestName as u8);
    message.put_u16(own_port);
    write_all(stream, limit, &message).await?;

    expect_opcode(stream, limit, Opcode::SendName).await?;
    let mut length = [0u8; 1];
    read_exact(stream, limit, &mut length).await?;
    let length = length[0] as usize;
    if !(wire::MIN_NAME_LEN..=wire::MAX_NAME_LEN).contains(&length) {
        return Err(TransportError::InvalidName.into());
    }

    let mut raw = vec![0u8; length];
    read_exact(stream, limit, &mut raw).await?;
    let name = String::from_utf8(raw).map_err(|_| TransportError::InvalidName)?;
    if !wire::valid_display_name(&name) {
        return Err(TransportError::InvalidName.into());
    }
    Ok(name)
}

pub(crate) async fn send_name<S>(stream: &mut S, limit: Duration, name: &str) -> crate::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut message = Vec::with_capacity(2 + name.len());
    message.put_u8(Opcode::SendName as u8);
    message.put_u8(name.len() as u8);
    message.extend_from_slice(name.as_bytes());
    write_all(stream, limit, &message).await
}

/// Announce departure: DISCONNECT plus the sender's listen port
pub(crate) async fn send_disconnect<S>(
    stream: &mut S,
    limit: Duration,
    own_port: u16,
) -> crate::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut message = Vec::with_capacity(3);
    message.put_u8(Opcode::Disconnect as u8);
    message.put_u16(own_port);
    write_all(stream, limit, &message).await
}

/// Abort an exchange in progress
pub(crate) async fn send_close<S>(stream: &mut S, limit: Duration) -> crate::Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_all(stream, limit, &[Opcode::Close as u8]).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio_test::io::Builder;

    const LIMIT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_peer_list_round_trip_over_chunked_reads() {
        let peers = vec![
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 8421),
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 9000),
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 7), 8421),
        ];

        let mut reply = vec![Opcode::SendPeers as u8];
        reply.put_u32((peers.len() * wire::ADDRESS_LEN) as u32);
        for peer in &peers {
            wire::encode_address(peer, &mut reply);
        }

        // Reply split mid-header and mid-record; the reader must not care.
        let mut stream = Builder::new()
            .write(&[Opcode::RequestPeers as u8])
            .read(&reply[..3])
            .read(&reply[3..9])
            .read(&reply[9..])
            .build();

        let decoded = request_peer_list(&mut stream, LIMIT).await.unwrap();
        assert_eq!(decoded, peers);
    }

    #[tokio::test]
    async fn test_peer_list_rejects_ragged_length() {
        // Length field not a multiple of the record size; the reader must
        // bail before asking for the payload.
        let mut reply = vec![Opcode::SendPeers as u8];
        reply.put_u32(7);

        let mut stream = Builder::new()
            .write(&[Opcode::RequestPeers as u8])
            .read(&reply)
            .build();

        assert!(request_peer_list(&mut stream, LIMIT).await.is_err());
    }

    #[tokio::test]
    async fn test_verdict_bytes() {
        let mut stream = Builder::new()
            .read(&[Opcode::Accept as u8])
            .read(&[Opcode::Deny as u8])
            .build();
        assert!(read_verdict(&mut stream, LIMIT).await.unwrap());
        assert!(!read_verdict(&mut stream, LIMIT).await.unwrap());
    }

    #[tokio::test]
    async fn test_verdict_rejects_other_opcodes() {
        let mut stream = Builder::new().read(&[Opcode::Connect as u8]).build();
        assert!(read_verdict(&mut stream, LIMIT).await.is_err());
    }

    #[tokio::test]
    async fn test_name_exchange() {
        let mut request = vec![Opcode::RequestName as u8];
        request.put_u16(8421);
        let mut reply = vec![Opcode::SendName as u8, 5];
        reply.extend_from_slice(b"alice");

        let mut stream = Builder::new().write(&request).read(&reply).build();
        let name = request_name(&mut stream, LIMIT, 8421).await.unwrap();
        assert_eq!(name, "alice");
    }

    #[tokio::test]
    async fn test_name_with_bad_characters_rejected() {
        let mut request = vec![Opcode::RequestName as u8];
        request.put_u16(8421);
        let mut reply = vec![Opcode::SendName as u8, 5];
        reply.extend_from_slice(b"a b!c");

        let mut stream = Builder::new().write(&request).read(&reply).build();
        assert!(request_name(&mut stream, LIMIT, 8421).await.is_err());
    }

    #[tokio::test]
    async fn test_propose_wire_bytes() {
        let candidate = SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 8421);
        let mut expected = vec![Opcode::Propose as u8];
        wire::encode_address(&candidate, &mut expected);

        let mut stream = Builder::new().write(&expected).build();
        send_propose(&mut stream, LIMIT, candidate).await.unwrap();
    }
}
