//! Wire protocol: connection header, handshake frames, data framing.
//!
//! Per socket, after the transport connects:
//!
//! ```text
//! Header:     u16 magic (0xF17A) | u8 version (1) | [16]u8 coord-set hash
//! Handshake:  u8 kind (1=Hello, 2=HelloAck, 3=Bye) | u32 len | payload
//! Data frame: [6]u8 coord | u32 len | payload
//! ```
//!
//! Hello payload: `u32 count, count x [6]u8 coords, u64 nonce_nanos`.
//! HelloAck payload: `u64 echoed_nonce, u32 count, count x [6]u8 coords`.
//! Integers are big-endian on the wire.

use crate::coord::{ChainCoord, COORD_SIZE};
use crate::{RouterError, RouterResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

/// Protocol magic.
pub const MAGIC: u16 = 0xF17A;

/// Protocol version.
pub const VERSION: u8 = 1;

/// Header size: magic (2) + version (1) + coord-set hash (16).
pub const HEADER_SIZE: usize = 19;

/// Maximum handshake payload size.
const MAX_HANDSHAKE_PAYLOAD: usize = 64 * 1024;

/// Maximum data frame payload size.
pub const MAX_FRAME_PAYLOAD: usize = 8 * 1024 * 1024;

const KIND_HELLO: u8 = 1;
const KIND_HELLO_ACK: u8 = 2;
const KIND_BYE: u8 = 3;

/// Write the connection header.
pub async fn write_header<W: AsyncWrite + Unpin>(
    stream: &mut W,
    coord_set_hash: [u8; 16],
) -> RouterResult<()> {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE);
    buf.put_u16(MAGIC);
    buf.put_u8(VERSION);
    buf.put_slice(&coord_set_hash);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Read and validate the connection header, returning the peer's
/// coordinate-set hash.
pub async fn read_header<R: AsyncRead + Unpin>(stream: &mut R) -> RouterResult<[u8; 16]> {
    let mut buf = [0u8; HEADER_SIZE];
    stream.read_exact(&mut buf).await?;

    let magic = u16::from_be_bytes([buf[0], buf[1]]);
    if magic != MAGIC {
        return Err(RouterError::HandshakeFailed(format!(
            "bad magic: {:#06x}",
            magic
        )));
    }
    if buf[2] != VERSION {
        return Err(RouterError::HandshakeFailed(format!(
            "unsupported version: {}",
            buf[2]
        )));
    }

    let mut hash = [0u8; 16];
    hash.copy_from_slice(&buf[3..19]);
    Ok(hash)
}

/// Handshake frames exchanged after the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeFrame {
    Hello { coords: Vec<ChainCoord>, nonce: u64 },
    HelloAck { nonce: u64, coords: Vec<ChainCoord> },
    Bye,
}

impl HandshakeFrame {
    fn kind(&self) -> u8 {
        match self {
            HandshakeFrame::Hello { .. } => KIND_HELLO,
            HandshakeFrame::HelloAck { .. } => KIND_HELLO_ACK,
            HandshakeFrame::Bye => KIND_BYE,
        }
    }

    fn encode_payload(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            HandshakeFrame::Hello { coords, nonce } => {
                buf.put_u32(coords.len() as u32);
                for coord in coords {
                    buf.put_slice(coord.as_bytes());
                }
                buf.put_u64(*nonce);
            }
            HandshakeFrame::HelloAck { nonce, coords } => {
                buf.put_u64(*nonce);
                buf.put_u32(coords.len() as u32);
                for coord in coords {
                    buf.put_slice(coord.as_bytes());
                }
            }
            HandshakeFrame::Bye => {}
        }
        buf.freeze()
    }

    fn parse(kind: u8, mut payload: Bytes) -> RouterResult<Self> {
        match kind {
            KIND_HELLO => {
                let coords = read_coords(&mut payload)?;
                if payload.remaining() < 8 {
                    return Err(RouterError::HandshakeFailed("truncated hello".into()));
                }
                let nonce = payload.get_u64();
                Ok(HandshakeFrame::Hello { coords, nonce })
            }
            KIND_HELLO_ACK => {
                if payload.remaining() < 8 {
                    return Err(RouterError::HandshakeFailed("truncated hello ack".into()));
                }
                let nonce = payload.get_u64();
                let coords = read_coords(&mut payload)?;
                Ok(HandshakeFrame::HelloAck { nonce, coords })
            }
            KIND_BYE => Ok(HandshakeFrame::Bye),
            other => Err(RouterError::HandshakeFailed(format!(
                "unknown handshake kind: {}",
                other
            ))),
        }
    }
}

fn read_coords(payload: &mut Bytes) -> RouterResult<Vec<ChainCoord>> {
    if payload.remaining() < 4 {
        return Err(RouterError::HandshakeFailed("truncated coord list".into()));
    }
    let count = payload.get_u32() as usize;
    if payload.remaining() < count * COORD_SIZE {
        return Err(RouterError::HandshakeFailed("truncated coord list".into()));
    }

    let mut coords = Vec::with_capacity(count);
    for _ in 0..count {
        let mut raw = [0u8; COORD_SIZE];
        payload.copy_to_slice(&mut raw);
        coords.push(ChainCoord::new(raw));
    }
    Ok(coords)
}

/// Write one handshake frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    frame: &HandshakeFrame,
) -> RouterResult<()> {
    let payload = frame.encode_payload();
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.put_u8(frame.kind());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one handshake frame.
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> RouterResult<HandshakeFrame> {
    let mut head = [0u8; 5];
    stream.read_exact(&mut head).await?;

    let kind = head[0];
    let len = u32::from_be_bytes([head[1], head[2], head[3], head[4]]) as usize;
    if len > MAX_HANDSHAKE_PAYLOAD {
        return Err(RouterError::HandshakeFailed(format!(
            "handshake payload too large: {} bytes",
            len
        )));
    }

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    HandshakeFrame::parse(kind, Bytes::from(payload))
}

/// Codec for multiplexed data frames after the handshake.
///
/// Every frame carries the chain coordinate it belongs to, so a single
/// socket serves all overlapping coordinates.
pub struct DataCodec {
    max_payload: usize,
}

impl DataCodec {
    pub fn new() -> Self {
        Self {
            max_payload: MAX_FRAME_PAYLOAD,
        }
    }
}

impl Default for DataCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for DataCodec {
    type Item = (ChainCoord, Bytes);
    type Error = RouterError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        const FRAME_HEADER: usize = COORD_SIZE + 4;
        if src.len() < FRAME_HEADER {
            return Ok(None);
        }

        let len = u32::from_be_bytes([
            src[COORD_SIZE],
            src[COORD_SIZE + 1],
            src[COORD_SIZE + 2],
            src[COORD_SIZE + 3],
        ]) as usize;

        if len > self.max_payload {
            return Err(RouterError::HandshakeFailed(format!(
                "frame too large: {} bytes",
                len
            )));
        }

        if src.len() < FRAME_HEADER + len {
            src.reserve(FRAME_HEADER + len - src.len());
            return Ok(None);
        }

        let mut raw = [0u8; COORD_SIZE];
        raw.copy_from_slice(&src[..COORD_SIZE]);
        src.advance(FRAME_HEADER);
        let payload = src.split_to(len).freeze();

        Ok(Some((ChainCoord::new(raw), payload)))
    }
}

impl Encoder<(ChainCoord, Bytes)> for DataCodec {
    type Error = RouterError;

    fn encode(
        &mut self,
        (coord, payload): (ChainCoord, Bytes),
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        if payload.len() > self.max_payload {
            return Err(RouterError::HandshakeFailed(format!(
                "frame too large: {} bytes",
                payload.len()
            )));
        }

        dst.reserve(COORD_SIZE + 4 + payload.len());
        dst.put_slice(coord.as_bytes());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_header_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let hash = [7u8; 16];

        write_header(&mut a, hash).await.unwrap();
        let read = read_header(&mut b).await.unwrap();
        assert_eq!(read, hash);
    }

    #[tokio::test]
    async fn test_bad_magic_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&[0xDE, 0xAD, 1]).await.unwrap();
        a.write_all(&[0u8; 16]).await.unwrap();

        let err = read_header(&mut b).await.unwrap_err();
        assert!(matches!(err, RouterError::HandshakeFailed(_)));
    }

    #[tokio::test]
    async fn test_hello_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frame = HandshakeFrame::Hello {
            coords: vec![
                ChainCoord::new([1, 2, 3, 4, 5, 6]),
                ChainCoord::new([9, 9, 9, 9, 9, 9]),
            ],
            nonce: 0xDEADBEEF,
        };

        write_frame(&mut a, &frame).await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), frame);
    }

    #[tokio::test]
    async fn test_hello_ack_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frame = HandshakeFrame::HelloAck {
            nonce: 42,
            coords: vec![ChainCoord::default()],
        };

        write_frame(&mut a, &frame).await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), frame);
    }

    #[test]
    fn test_data_codec_roundtrip() {
        let mut codec = DataCodec::new();
        let coord = ChainCoord::new([1, 1, 2, 2, 3, 3]);
        let payload = Bytes::from_static(b"sendTest");

        let mut buf = BytesMut::new();
        codec.encode((coord, payload.clone()), &mut buf).unwrap();

        let (got_coord, got_payload) = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(got_coord, coord);
        assert_eq!(got_payload, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_data_codec_partial_frame() {
        let mut codec = DataCodec::new();
        let coord = ChainCoord::default();

        let mut full = BytesMut::new();
        codec
            .encode((coord, Bytes::from_static(b"0123456789")), &mut full)
            .unwrap();

        // Feed only half the frame; the decoder must wait for the rest.
        let mut partial = BytesMut::from(&full[..7]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[7..]);
        let (_, payload) = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(payload, Bytes::from_static(b"0123456789"));
    }
}
