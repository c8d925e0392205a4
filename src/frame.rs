//! RFC 7540 §4 frame codec: the 9-byte header plus payload, the preface
//! constant, and the exact-read helpers the read loop uses.

use crate::enums::FrameType;
use crate::error::{ProtoError, Reason};
use bytes::{Bytes, BytesMut};
use num_traits::{FromPrimitive, ToPrimitive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The fixed 24-byte client connection preface (RFC 7540 §3.5).
pub const PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub const HEADER_LEN: usize = 9;

/// A parsed 9-byte frame header. `raw_type` is kept alongside `frame_type`
/// because an unrecognized type (RFC 7540 §4.1 reserves the space for
/// extensions) is not itself an error — the read loop just skips the
/// payload and moves on.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub length: u32,
    pub raw_type: u8,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    #[must_use]
    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_u8(self.raw_type)
    }

    fn parse(buf: &[u8; HEADER_LEN]) -> Self {
        let length = u32::from(buf[0]) << 16 | u32::from(buf[1]) << 8 | u32::from(buf[2]);
        let stream_id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7fff_ffff;
        Self { length, raw_type: buf[3], flags: buf[4], stream_id }
    }

    fn write(&self, buf: &mut [u8; HEADER_LEN]) {
        let len_bytes = self.length.to_be_bytes();
        buf[0..3].copy_from_slice(&len_bytes[1..4]);
        buf[3] = self.raw_type;
        buf[4] = self.flags;
        buf[5..9].copy_from_slice(&(self.stream_id & 0x7fff_ffff).to_be_bytes());
    }
}

/// Read exactly one frame. Fails with `FRAME_SIZE_ERROR` if the declared
/// length exceeds `max_local_frame_size` (our own advertised bound) before
/// ever allocating the payload buffer.
pub async fn read_frame(
    reader: &mut (impl AsyncRead + Unpin),
    max_local_frame_size: u32,
) -> crate::error::Result<(FrameHeader, Bytes)> {
    let mut header_buf = [0u8; HEADER_LEN];
    reader.read_exact(&mut header_buf).await?;
    let header = FrameHeader::parse(&header_buf);
    if header.length > max_local_frame_size {
        return Err(ProtoError::Connection(Reason::FrameSizeError).into());
    }
    let mut payload = BytesMut::zeroed(header.length as usize);
    reader.read_exact(&mut payload).await?;
    Ok((header, payload.freeze()))
}

/// Write one frame (header then payload) and flush. Callers are expected
/// to hold the connection's write lock across this call.
pub async fn write_frame(
    writer: &mut (impl AsyncWrite + Unpin),
    frame_type: FrameType,
    flags: u8,
    stream_id: u32,
    payload: &[u8],
) -> crate::error::Result<()> {
    let header = FrameHeader {
        length: payload.len() as u32,
        raw_type: frame_type.to_u8().expect("FrameType fits in u8"),
        flags,
        stream_id,
    };
    let mut header_buf = [0u8; HEADER_LEN];
    header.write(&mut header_buf);
    writer.write_all(&header_buf).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

pub async fn write_preface(writer: &mut (impl AsyncWrite + Unpin)) -> crate::error::Result<()> {
    writer.write_all(PREFACE).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn round_trips_a_frame() {
        let (mut client, mut server) = duplex(1024);
        write_frame(&mut client, FrameType::Ping, 0, 0, b"12345678").await.unwrap();
        let (header, payload) = read_frame(&mut server, 16_384).await.unwrap();
        assert_eq!(header.frame_type(), Some(FrameType::Ping));
        assert_eq!(header.stream_id, 0);
        assert_eq!(&payload[..], b"12345678");
    }

    #[tokio::test]
    async fn masks_the_reserved_stream_id_bit() {
        let (mut client, mut server) = duplex(1024);
        write_frame(&mut client, FrameType::Headers, 0, 0x8000_0001, b"").await.unwrap();
        let (header, _) = read_frame(&mut server, 16_384).await.unwrap();
        assert_eq!(header.stream_id, 1);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_before_reading_payload() {
        let (mut client, mut server) = duplex(1 << 20);
        write_frame(&mut client, FrameType::Data, 0, 1, &vec![0u8; 20_000]).await.unwrap();
        let err = read_frame(&mut server, 16_384).await.unwrap_err();
        assert!(matches!(err, crate::error::Error::Network(_)));
    }

    #[test]
    fn unknown_frame_type_is_not_an_error() {
        let header = FrameHeader { length: 0, raw_type: 0xfe, flags: 0, stream_id: 0 };
        assert_eq!(header.frame_type(), None);
    }
}
