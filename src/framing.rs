//! Length-prefixed framing over a byte stream.
//!
//! Every frame is a 4-byte little-endian payload length followed by the
//! payload. A stream that ends cleanly between frames is reported as
//! `None`, not as an error; a stream that ends inside a frame is an error.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use crate::error::{Result, ZerolinkError};

pub const LENGTH_PREFIX_LEN: usize = 4;

/// Default upper bound on a single frame payload (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Write one frame: length prefix then payload, flushed before returning.
pub async fn write_frame<W>(stream: &mut W, payload: &[u8], max_len: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > max_len || payload.len() > u32::MAX as usize {
        return Err(ZerolinkError::FrameTooLarge {
            len: payload.len(),
            max: max_len,
        });
    }

    let len = payload.len() as u32;
    stream.write_all(&len.to_le_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;

    Ok(())
}

/// Read one frame. Returns `Ok(None)` when the stream closed at a frame boundary.
pub async fn read_frame<R>(stream: &mut R, max_len: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_LEN];
    let mut filled = 0;
    while filled < LENGTH_PREFIX_LEN {
        let n = stream.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ZerolinkError::Truncated {
                field: "length prefix",
                needed: LENGTH_PREFIX_LEN - filled,
            });
        }
        filled += n;
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > max_len {
        return Err(ZerolinkError::FrameTooLarge { len, max: max_len });
    }

    // read_exact retries short reads and fails with UnexpectedEof on closure
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ZerolinkError::Truncated {
                field: "frame payload",
                needed: len,
            }
        } else {
            ZerolinkError::Io(e)
        }
    })?;

    Ok(Some(payload))
}

/// The same framing as a `tokio_util` codec, used by session read loops.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_len: usize,
}

impl FrameCodec {
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = ZerolinkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let mut len_buf = [0u8; LENGTH_PREFIX_LEN];
        len_buf.copy_from_slice(&src[..LENGTH_PREFIX_LEN]);
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > self.max_len {
            return Err(ZerolinkError::FrameTooLarge {
                len,
                max: self.max_len,
            });
        }

        if src.len() < LENGTH_PREFIX_LEN + len {
            src.reserve(LENGTH_PREFIX_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_LEN);
        Ok(Some(src.split_to(len)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(ZerolinkError::Truncated {
                field: "frame",
                needed: src.len(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    async fn round_trip(len: usize) {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let mut wire = Vec::new();
        write_frame(&mut wire, &payload, DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap();
        assert_eq!(wire.len(), LENGTH_PREFIX_LEN + len);
        assert_eq!(&wire[..4], &(len as u32).to_le_bytes());

        let mut reader = wire.as_slice();
        let got = read_frame(&mut reader, DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, payload);
        assert!(read_frame(&mut reader, DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn frames_survive_round_trip_at_boundary_sizes() {
        round_trip(0).await;
        round_trip(1).await;
        round_trip(1_000_000).await;
    }

    #[tokio::test]
    async fn empty_stream_reports_closed() {
        let mut reader: &[u8] = &[];
        assert!(read_frame(&mut reader, 16).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn partial_prefix_is_an_error() {
        let mut reader: &[u8] = &[3, 0];
        let err = read_frame(&mut reader, 16).await.unwrap_err();
        assert!(matches!(err, ZerolinkError::Truncated { .. }));
    }

    #[tokio::test]
    async fn short_payload_is_an_error() {
        let mut reader: &[u8] = &[5, 0, 0, 0, b'a', b'b'];
        let err = read_frame(&mut reader, 16).await.unwrap_err();
        assert!(matches!(err, ZerolinkError::Truncated { .. }));
    }

    #[tokio::test]
    async fn oversized_prefix_is_rejected_before_reading() {
        let mut reader: &[u8] = &[0xff, 0xff, 0xff, 0x7f];
        let err = read_frame(&mut reader, 1024).await.unwrap_err();
        assert!(matches!(err, ZerolinkError::FrameTooLarge { .. }));

        let mut sink = Vec::new();
        let err = write_frame(&mut sink, &[0u8; 32], 16).await.unwrap_err();
        assert!(matches!(err, ZerolinkError::FrameTooLarge { len: 32, max: 16 }));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn partial_reads_are_reassembled() {
        let (client, mut server) = tokio::io::duplex(3);
        let writer = tokio::spawn(async move {
            let mut client = client;
            write_frame(&mut client, b"hello world", 64).await.unwrap();
            write_frame(&mut client, b"again", 64).await.unwrap();
        });

        let first = read_frame(&mut server, 64).await.unwrap().unwrap();
        let second = read_frame(&mut server, 64).await.unwrap().unwrap();
        writer.await.unwrap();

        assert_eq!(first, b"hello world");
        assert_eq!(second, b"again");
        assert!(read_frame(&mut server, 64).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn codec_reads_what_write_frame_wrote() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"one", 64).await.unwrap();
        write_frame(&mut wire, b"", 64).await.unwrap();
        write_frame(&mut wire, b"three", 64).await.unwrap();

        let mut framed = FramedRead::new(wire.as_slice(), FrameCodec::new(64));
        assert_eq!(&framed.next().await.unwrap().unwrap()[..], b"one");
        assert_eq!(&framed.next().await.unwrap().unwrap()[..], b"");
        assert_eq!(&framed.next().await.unwrap().unwrap()[..], b"three");
        assert!(framed.next().await.is_none());
    }

    #[tokio::test]
    async fn codec_rejects_frame_cut_mid_payload() {
        let wire: &[u8] = &[4, 0, 0, 0, 1, 2];
        let mut framed = FramedRead::new(wire, FrameCodec::new(64));
        assert!(framed.next().await.unwrap().is_err());
    }
}
