use bytes::Buf;
use bytes::Bytes;
use bytes::BytesMut;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

use crate::magic;
use crate::scramble::ScrambleKey;

/// A decoded inbound frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub command_id: u16,
    pub payload: Bytes,
}

#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    key: ScrambleKey,
}

impl<R> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(8 * 1024),
            key: ScrambleKey::initial(),
        }
    }

    pub fn set_key(&mut self, key: ScrambleKey) {
        self.key = key;
    }
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Read one frame.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` for a descrambled frame,
    /// - `Ok(None)` on clean EOF with no buffered data.
    ///
    /// A header with bit 15 clear, a length below the header size, or a
    /// length above the negotiated buffer size is `InvalidData`; the caller
    /// is expected to drop the connection.
    pub async fn read_frame(&mut self) -> std::io::Result<Option<Frame>> {
        loop {
            if self.buf.len() >= 4 {
                let header = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
                let Some((command_id, length)) = magic::decode_header(header) else {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "bad frame magic",
                    ));
                };

                // The encoded length counts the header itself.
                if length < 4 || length > magic::RECV_BUFFER_SIZE {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "impossible frame length",
                    ));
                }
                let body_len = usize::from(length) - 4;

                if self.buf.len() >= 4 + body_len {
                    self.buf.advance(4);
                    let mut payload = self.buf.split_to(body_len);
                    self.key.apply(&mut payload);
                    return Ok(Some(Frame {
                        command_id,
                        payload: payload.freeze(),
                    }));
                }
            }

            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "eof while reading frame",
                ));
            }
        }
    }
}

#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
    key: ScrambleKey,
}

impl<W> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            key: ScrambleKey::initial(),
        }
    }

    /// Roll the scramble key. Affects frames written after this call only.
    pub fn set_key(&mut self, key: ScrambleKey) {
        self.key = key;
    }
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub async fn write_frame(&mut self, command_id: u16, payload: &[u8]) -> std::io::Result<()> {
        let length: u16 = (payload.len() + 4).try_into().ok().filter(|l| *l <= magic::RECV_BUFFER_SIZE).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too big")
        })?;

        let header = magic::encode_header(command_id, length);

        let mut scrambled = payload.to_vec();
        self.key.apply(&mut scrambled);

        self.inner.write_all(&header.to_le_bytes()).await?;
        if !scrambled.is_empty() {
            self.inner.write_all(&scrambled).await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_frame() {
        let (a, b) = tokio::io::duplex(256);
        tokio::spawn(async move {
            let mut fw = FrameWriter::new(b);
            fw.write_frame(29, b"hello").await.unwrap();
            fw.flush().await.unwrap();
        });

        let mut fr = FrameReader::new(a);
        let f = fr.read_frame().await.unwrap().unwrap();
        assert_eq!(f.command_id, 29);
        assert_eq!(&f.payload[..], b"hello");
    }

    #[tokio::test]
    async fn payload_is_scrambled_on_the_wire() {
        let (a, mut b) = tokio::io::duplex(256);
        let mut fw = FrameWriter::new(a);
        fw.write_frame(1, b"abcd").await.unwrap();
        fw.flush().await.unwrap();
        drop(fw);

        let mut raw = Vec::new();
        b.read_to_end(&mut raw).await.unwrap();
        assert_eq!(raw.len(), 8);
        // Bytes after the header must not be the plaintext.
        assert_ne!(&raw[4..], b"abcd");
    }

    #[tokio::test]
    async fn key_roll_applies_to_later_frames_only() {
        let (a, b) = tokio::io::duplex(256);
        let mut fw = FrameWriter::new(a);
        fw.write_frame(1, b"first").await.unwrap();
        fw.set_key(ScrambleKey::new([9, 9, 9, 9]));
        fw.write_frame(1, b"second").await.unwrap();
        fw.flush().await.unwrap();
        drop(fw);

        let mut fr = FrameReader::new(b);
        let first = fr.read_frame().await.unwrap().unwrap();
        assert_eq!(&first.payload[..], b"first");

        // The reader still holds the initial key, so the second frame
        // descrambles to garbage until the key is rolled to match.
        let second = fr.read_frame().await.unwrap().unwrap();
        assert_ne!(&second.payload[..], b"second");
    }

    #[tokio::test]
    async fn empty_payload_frame() {
        let (a, b) = tokio::io::duplex(64);
        let mut fw = FrameWriter::new(a);
        fw.write_frame(7, b"").await.unwrap();
        fw.flush().await.unwrap();
        drop(fw);

        let mut fr = FrameReader::new(b);
        let f = fr.read_frame().await.unwrap().unwrap();
        assert_eq!(f.command_id, 7);
        assert!(f.payload.is_empty());

        assert!(fr.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_bad_magic() {
        let (mut a, b) = tokio::io::duplex(64);
        // Bit 15 of the low half clear.
        a.write_all(&0x0000_0000u32.to_le_bytes()).await.unwrap();
        drop(a);

        let mut fr = FrameReader::new(b);
        let err = fr.read_frame().await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn rejects_eof_mid_frame() {
        let (mut a, b) = tokio::io::duplex(64);
        // Header promising 16 payload bytes, then silence.
        let header = magic::encode_header(3, 20);
        a.write_all(&header.to_le_bytes()).await.unwrap();
        a.write_all(&[0u8; 4]).await.unwrap();
        drop(a);

        let mut fr = FrameReader::new(b);
        let err = fr.read_frame().await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }
}
