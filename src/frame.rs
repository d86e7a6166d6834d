//! AES-CBC framed cipher stream
//!
//! Wire format of one frame (all integers big-endian):
//!
//! ```text
//! +----------------+---------------------------+-------------------+
//! | cipher_len: u16 | AES-128-CBC/PKCS7 payload | crc16(payload): u16 |
//! +----------------+---------------------------+-------------------+
//! ```
//!
//! Every frame is encrypted on its own with the same fixed IV, so CBC state
//! never crosses a frame boundary. Losing or corrupting a single frame still
//! desynchronizes the byte stream, which is why any decoding failure poisons
//! the reading side for good.

use crate::key_exchange::SessionKey;
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use bytes::{Buf, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// CBC initialisation vector, restarted for every frame
pub const FRAME_IV: [u8; 16] = *b"8765432187654321";

/// AES block size
const BLOCK_SIZE: usize = 16;

/// Largest plaintext whose padded ciphertext still fits the u16 length field
pub const MAX_FRAME_PAYLOAD: usize = 0xFFFF - (0xFFFF % BLOCK_SIZE) - 1;

/// Plaintext batching buffer of the encrypting side (48 KiB)
pub const WRITE_BUFFER_SIZE: usize = 48 * 1024;

/// Length prefix + CRC trailer
const FRAME_OVERHEAD: usize = 4;

const READ_CHUNK_SIZE: usize = 16 * 1024;

const CRC16_MODBUS: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_MODBUS);

/// CRC-16 (reflected polynomial 0xA001, initial value 0xFFFF)
pub fn crc16(data: &[u8]) -> u16 {
    CRC16_MODBUS.checksum(data)
}

/// Frame codec errors
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Plaintext is empty or cannot be encoded in one frame
    #[error("Frame payload length {0} out of range (1..={MAX_FRAME_PAYLOAD})")]
    PayloadLength(usize),

    /// Length field announced an empty ciphertext
    #[error("Frame announces an empty ciphertext")]
    EmptyCiphertext,

    /// Stream ended in the middle of a frame
    #[error("Unexpected stream end inside a frame")]
    Truncated,

    /// Checksum over the ciphertext did not match
    #[error("CRC mismatch: frame carries {expected:#06x}, computed {actual:#06x}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Block length or PKCS7 padding invalid after decryption
    #[error("Frame decryption failed")]
    Decrypt,

    /// Underlying transport error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<FrameError> for io::Error {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(e) => e,
            FrameError::Truncated => io::Error::new(io::ErrorKind::UnexpectedEof, err),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

/// Read until `buf` is full or the stream ends; returns the number of bytes
/// read. Zero means the stream was already exhausted.
pub(crate) async fn read_fully<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Encrypts and decrypts single frames with one session key
#[derive(Clone)]
pub struct FrameCipher {
    key: SessionKey,
}

impl FrameCipher {
    pub fn new(key: SessionKey) -> Self {
        Self { key }
    }

    /// Encrypt `plaintext` into a complete wire frame
    pub fn encode_frame(&self, plaintext: &[u8]) -> Result<Vec<u8>, FrameError> {
        if plaintext.is_empty() || plaintext.len() > MAX_FRAME_PAYLOAD {
            return Err(FrameError::PayloadLength(plaintext.len()));
        }

        let key: [u8; 16] = *self.key.as_bytes();
        let ciphertext =
            Aes128CbcEnc::new(&key.into(), &FRAME_IV.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut frame = Vec::with_capacity(ciphertext.len() + FRAME_OVERHEAD);
        frame.extend_from_slice(&(ciphertext.len() as u16).to_be_bytes());
        frame.extend_from_slice(&ciphertext);
        frame.extend_from_slice(&crc16(&ciphertext).to_be_bytes());
        Ok(frame)
    }

    /// Verify the checksum and decrypt one ciphertext body
    pub fn open_frame(&self, ciphertext: &[u8], expected_crc: u16) -> Result<Vec<u8>, FrameError> {
        let actual = crc16(ciphertext);
        if actual != expected_crc {
            return Err(FrameError::CrcMismatch {
                expected: expected_crc,
                actual,
            });
        }

        if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(FrameError::Decrypt);
        }

        let key: [u8; 16] = *self.key.as_bytes();
        let plaintext = Aes128CbcDec::new(&key.into(), &FRAME_IV.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| FrameError::Decrypt)?;

        if plaintext.is_empty() {
            return Err(FrameError::PayloadLength(0));
        }
        Ok(plaintext)
    }

    /// Read and decrypt one frame.
    ///
    /// Returns `Ok(None)` only when the stream ends exactly at a frame
    /// boundary; every other short read is [`FrameError::Truncated`].
    pub async fn decode_frame<R>(&self, reader: &mut R) -> Result<Option<Vec<u8>>, FrameError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut len_buf = [0u8; 2];
        match read_fully(reader, &mut len_buf).await? {
            0 => return Ok(None),
            2 => {}
            _ => return Err(FrameError::Truncated),
        }

        let cipher_len = u16::from_be_bytes(len_buf) as usize;
        if cipher_len == 0 {
            return Err(FrameError::EmptyCiphertext);
        }

        let mut body = vec![0u8; cipher_len + 2];
        if read_fully(reader, &mut body).await? != body.len() {
            return Err(FrameError::Truncated);
        }

        let crc = u16::from_be_bytes([body[cipher_len], body[cipher_len + 1]]);
        self.open_frame(&body[..cipher_len], crc).map(Some)
    }

    /// Try to split one complete frame off the front of `raw`
    fn take_frame(&self, raw: &mut BytesMut) -> Result<Option<Vec<u8>>, FrameError> {
        if raw.len() < 2 {
            return Ok(None);
        }
        let cipher_len = u16::from_be_bytes([raw[0], raw[1]]) as usize;
        if cipher_len == 0 {
            return Err(FrameError::EmptyCiphertext);
        }
        if raw.len() < cipher_len + FRAME_OVERHEAD {
            return Ok(None);
        }

        let frame = raw.split_to(cipher_len + FRAME_OVERHEAD);
        let crc = u16::from_be_bytes([frame[2 + cipher_len], frame[3 + cipher_len]]);
        self.open_frame(&frame[2..2 + cipher_len], crc).map(Some)
    }
}

/// Decrypting view over a framed byte stream.
///
/// Frames are reassembled and decrypted on demand; callers see a plain byte
/// stream and may read any amount at a time.
pub struct CipherReader<R> {
    inner: R,
    cipher: FrameCipher,
    raw: BytesMut,
    plain: BytesMut,
    scratch: Box<[u8]>,
    poisoned: Option<io::ErrorKind>,
}

impl<R> CipherReader<R> {
    pub fn new(inner: R, cipher: FrameCipher) -> Self {
        Self {
            inner,
            cipher,
            raw: BytesMut::with_capacity(READ_CHUNK_SIZE),
            plain: BytesMut::new(),
            scratch: vec![0u8; READ_CHUNK_SIZE].into_boxed_slice(),
            poisoned: None,
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn poison(&mut self, err: FrameError) -> io::Error {
        let err: io::Error = err.into();
        self.poisoned = Some(err.kind());
        err
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CipherReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if let Some(kind) = this.poisoned {
                return Poll::Ready(Err(io::Error::new(kind, "cipher stream desynchronized")));
            }

            if buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }

            if !this.plain.is_empty() {
                let to_copy = std::cmp::min(buf.remaining(), this.plain.len());
                buf.put_slice(&this.plain[..to_copy]);
                this.plain.advance(to_copy);
                return Poll::Ready(Ok(()));
            }

            match this.cipher.take_frame(&mut this.raw) {
                Ok(Some(plaintext)) => {
                    this.plain.extend_from_slice(&plaintext);
                    continue;
                }
                Ok(None) => {}
                Err(e) => return Poll::Ready(Err(this.poison(e))),
            }

            let mut chunk = ReadBuf::new(&mut this.scratch);
            match Pin::new(&mut this.inner).poll_read(cx, &mut chunk) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => {
                    this.poisoned = Some(e.kind());
                    return Poll::Ready(Err(e));
                }
                Poll::Ready(Ok(())) => {}
            }

            let filled = chunk.filled();
            if filled.is_empty() {
                if this.raw.is_empty() {
                    // Clean end of stream at a frame boundary
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(this.poison(FrameError::Truncated)));
            }
            this.raw.extend_from_slice(filled);
        }
    }
}

/// Encrypting view over a byte stream.
///
/// Writes accumulate in a [`WRITE_BUFFER_SIZE`] buffer; a frame is produced
/// only when the buffer fills up or on flush.
pub struct CipherWriter<W> {
    inner: W,
    cipher: FrameCipher,
    buf: BytesMut,
    pending: Vec<u8>,
    written: usize,
}

impl<W> CipherWriter<W> {
    pub fn new(inner: W, cipher: FrameCipher) -> Self {
        Self {
            inner,
            cipher,
            buf: BytesMut::with_capacity(WRITE_BUFFER_SIZE),
            pending: Vec::new(),
            written: 0,
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Unwrap the transport. Buffered plaintext that was never flushed is lost.
    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Bytes buffered but not yet sealed into a frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn seal(&mut self) -> io::Result<()> {
        debug_assert!(self.pending.is_empty());
        self.pending = self.cipher.encode_frame(&self.buf)?;
        self.written = 0;
        self.buf.clear();
        Ok(())
    }
}

impl<W: AsyncWrite + Unpin> CipherWriter<W> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.written < self.pending.len() {
            match Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.written..]) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "transport refused frame bytes",
                    )))
                }
                Poll::Ready(Ok(n)) => self.written += n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            }
        }
        self.pending.clear();
        self.written = 0;
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CipherWriter<W> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        loop {
            match this.poll_drain(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(())) => {}
            }
            if this.buf.len() < WRITE_BUFFER_SIZE {
                break;
            }
            this.seal()?;
        }

        let to_copy = std::cmp::min(WRITE_BUFFER_SIZE - this.buf.len(), buf.len());
        this.buf.extend_from_slice(&buf[..to_copy]);
        Poll::Ready(Ok(to_copy))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match this.poll_drain(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(())) => {}
            }
            if this.buf.is_empty() {
                break;
            }
            this.seal()?;
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut *this).poll_flush(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn test_cipher() -> FrameCipher {
        FrameCipher::new(SessionKey::from_bytes(*b"1234567812345678"))
    }

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(crc16(b"123456789"), 0x4B37);
    }

    #[test]
    fn test_max_payload_fits_length_field() {
        let cipher = test_cipher();
        let frame = cipher.encode_frame(&vec![0xAB; MAX_FRAME_PAYLOAD]).unwrap();
        let cipher_len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
        assert_eq!(cipher_len, 0xFFF0);
        assert_eq!(frame.len(), cipher_len + FRAME_OVERHEAD);
        assert!(cipher.encode_frame(&vec![0; MAX_FRAME_PAYLOAD + 1]).is_err());
        assert!(matches!(
            cipher.encode_frame(&[]),
            Err(FrameError::PayloadLength(0))
        ));
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let cipher = test_cipher();
        for len in [1usize, 15, 16, 17, 255, 4096, WRITE_BUFFER_SIZE, MAX_FRAME_PAYLOAD] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let frame = cipher.encode_frame(&payload).unwrap();
            let mut reader = &frame[..];
            let decoded = cipher.decode_frame(&mut reader).await.unwrap();
            assert_eq!(decoded.as_deref(), Some(&payload[..]), "length {}", len);
            assert_eq!(cipher.decode_frame(&mut reader).await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn test_single_bit_flip_is_detected() {
        let cipher = test_cipher();
        let payload = b"example.com. IN A query bytes";
        let frame = cipher.encode_frame(payload).unwrap();

        for byte in 2..frame.len() {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[byte] ^= 1 << bit;
                let mut reader = &corrupted[..];
                let result = cipher.decode_frame(&mut reader).await;
                assert!(result.is_err(), "flip at byte {} bit {} went unnoticed", byte, bit);
            }
        }
    }

    #[tokio::test]
    async fn test_truncation_and_clean_eof() {
        let cipher = test_cipher();
        let frame = cipher.encode_frame(b"hello").unwrap();

        let mut empty: &[u8] = &[];
        assert!(cipher.decode_frame(&mut empty).await.unwrap().is_none());

        for cut in 1..frame.len() {
            let mut reader = &frame[..cut];
            assert!(matches!(
                cipher.decode_frame(&mut reader).await,
                Err(FrameError::Truncated)
            ));
        }

        let mut zero_len: &[u8] = &[0, 0, 0, 0];
        assert!(matches!(
            cipher.decode_frame(&mut zero_len).await,
            Err(FrameError::EmptyCiphertext)
        ));
    }

    #[tokio::test]
    async fn test_wrong_key_never_yields_plaintext() {
        let frame = test_cipher().encode_frame(b"secret payload").unwrap();
        let other = FrameCipher::new(SessionKey::from_bytes([0x42; 16]));
        let mut reader = &frame[..];
        match other.decode_frame(&mut reader).await {
            Ok(Some(plain)) => assert_ne!(plain, b"secret payload"),
            Ok(None) => panic!("frame vanished"),
            Err(_) => {}
        }
    }

    #[tokio::test]
    async fn test_writer_batches_until_flush() {
        let cipher = test_cipher();
        let mut writer = CipherWriter::new(Vec::new(), cipher.clone());
        writer.write_all(b"abc").await.unwrap();
        writer.write_all(b"def").await.unwrap();
        assert_eq!(writer.buffered(), 6);
        assert!(writer.get_ref().is_empty());

        writer.flush().await.unwrap();
        assert_eq!(writer.buffered(), 0);

        let wire = writer.into_inner();
        let mut reader = &wire[..];
        assert_eq!(
            cipher.decode_frame(&mut reader).await.unwrap().as_deref(),
            Some(&b"abcdef"[..])
        );
        assert!(cipher.decode_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_writer_splits_large_writes() {
        let cipher = test_cipher();
        let data: Vec<u8> = (0..100_000u32).map(|i| i as u8).collect();
        let mut writer = CipherWriter::new(Vec::new(), cipher.clone());
        writer.write_all(&data).await.unwrap();
        writer.flush().await.unwrap();

        let wire = writer.into_inner();
        let mut reader = &wire[..];
        let mut frames = Vec::new();
        while let Some(plain) = cipher.decode_frame(&mut reader).await.unwrap() {
            assert!(plain.len() <= WRITE_BUFFER_SIZE);
            frames.push(plain);
        }
        assert_eq!(frames.len(), 3);
        assert_eq!(frames.concat(), data);
    }

    #[tokio::test]
    async fn test_cipher_stream_over_duplex() {
        let cipher = test_cipher();
        let (client, server) = duplex(1024);
        let mut writer = CipherWriter::new(client, cipher.clone());
        let mut reader = CipherReader::new(server, cipher);

        let sender = tokio::spawn(async move {
            for i in 0..50u8 {
                writer.write_all(&[i; 300]).await.unwrap();
                writer.flush().await.unwrap();
            }
            writer.shutdown().await.unwrap();
        });

        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.unwrap();
        sender.await.unwrap();

        assert_eq!(received.len(), 50 * 300);
        for (i, chunk) in received.chunks(300).enumerate() {
            assert!(chunk.iter().all(|b| *b == i as u8));
        }
    }

    #[tokio::test]
    async fn test_reader_reassembles_short_reads() {
        let cipher = test_cipher();
        let frame = cipher.encode_frame(b"split across reads").unwrap();
        let mock = tokio_test::io::Builder::new()
            .read(&frame[..1])
            .read(&frame[1..7])
            .read(&frame[7..])
            .build();

        let mut reader = CipherReader::new(mock, cipher);
        let mut out = vec![0u8; 18];
        reader.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"split across reads");
    }

    #[tokio::test]
    async fn test_reader_poisoned_after_corruption() {
        let cipher = test_cipher();
        let mut wire = cipher.encode_frame(b"first").unwrap();
        let mut second = cipher.encode_frame(b"second").unwrap();
        second[3] ^= 0x01;
        wire.extend_from_slice(&second);
        wire.extend_from_slice(&cipher.encode_frame(b"third").unwrap());

        let mut reader = CipherReader::new(&wire[..], cipher);
        let mut first = [0u8; 5];
        reader.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"first");

        let mut rest = Vec::new();
        let err = reader.read_to_end(&mut rest).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        let mut again = [0u8; 1];
        assert!(reader.read(&mut again).await.is_err());
    }

    #[tokio::test]
    async fn test_reader_truncated_frame_is_unexpected_eof() {
        let cipher = test_cipher();
        let frame = cipher.encode_frame(b"truncated").unwrap();
        let mut reader = CipherReader::new(&frame[..frame.len() - 1], cipher);
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
