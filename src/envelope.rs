//! TunnelEnvelope codec
//!
//! One multiplexed UDP datagram inside the decrypted tunnel stream:
//!
//! ```text
//! +-----------+-----------------+-----------------+
//! | port: u16 | data_len: u16   | data_len bytes  |
//! +-----------+-----------------+-----------------+
//! ```

use crate::frame::read_fully;
use std::io;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Envelope header length
pub const ENVELOPE_HEADER_LEN: usize = 4;

/// Largest datagram an envelope can carry
pub const MAX_ENVELOPE_DATA: usize = u16::MAX as usize;

/// Envelope codec errors
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// Payload does not fit the u16 length field
    #[error("Envelope data too large: {0} bytes (max {MAX_ENVELOPE_DATA})")]
    TooLarge(usize),

    /// Stream ended inside an envelope
    #[error("Truncated envelope: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Underlying stream error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// One UDP datagram tagged with the source port it belongs to
#[derive(Debug, Clone)]
pub struct TunnelEnvelope {
    port: u16,
    data: Vec<u8>,
    received_at: Instant,
}

impl PartialEq for TunnelEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.port == other.port && self.data == other.data
    }
}

impl Eq for TunnelEnvelope {}

impl TunnelEnvelope {
    pub fn new(port: u16, data: Vec<u8>) -> Result<Self, EnvelopeError> {
        if data.len() > MAX_ENVELOPE_DATA {
            return Err(EnvelopeError::TooLarge(data.len()));
        }
        Ok(Self {
            port,
            data,
            received_at: Instant::now(),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Local arrival time; advisory only, never serialized
    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// Serialized size on the tunnel stream
    pub fn wire_len(&self) -> usize {
        ENVELOPE_HEADER_LEN + self.data.len()
    }

    /// Write header and payload. Does not flush: callers batch envelopes
    /// and flush the cipher stream once.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), EnvelopeError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        write_envelope(writer, self.port, &self.data).await
    }

    /// Read one envelope.
    ///
    /// `Ok(None)` means the stream ended cleanly before the next header.
    pub async fn read_from<R>(reader: &mut R) -> Result<Option<Self>, EnvelopeError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut header = [0u8; ENVELOPE_HEADER_LEN];
        let n = read_fully(reader, &mut header).await?;
        if n == 0 {
            return Ok(None);
        }
        if n < ENVELOPE_HEADER_LEN {
            return Err(EnvelopeError::Truncated {
                expected: ENVELOPE_HEADER_LEN,
                actual: n,
            });
        }

        let port = u16::from_be_bytes([header[0], header[1]]);
        let data_len = u16::from_be_bytes([header[2], header[3]]) as usize;

        let mut data = vec![0u8; data_len];
        let n = read_fully(reader, &mut data).await?;
        if n < data_len {
            return Err(EnvelopeError::Truncated {
                expected: data_len,
                actual: n,
            });
        }

        Ok(Some(Self {
            port,
            data,
            received_at: Instant::now(),
        }))
    }
}

/// Serialize one envelope straight from a borrowed payload
pub async fn write_envelope<W>(writer: &mut W, port: u16, data: &[u8]) -> Result<(), EnvelopeError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if data.len() > MAX_ENVELOPE_DATA {
        return Err(EnvelopeError::TooLarge(data.len()));
    }
    let mut header = [0u8; ENVELOPE_HEADER_LEN];
    header[..2].copy_from_slice(&port.to_be_bytes());
    header[2..].copy_from_slice(&(data.len() as u16).to_be_bytes());
    writer.write_all(&header).await?;
    writer.write_all(data).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn encode(envelope: &TunnelEnvelope) -> Vec<u8> {
        let mut wire = Vec::new();
        envelope.write_to(&mut wire).await.unwrap();
        wire
    }

    #[tokio::test]
    async fn test_wire_layout() {
        let envelope = TunnelEnvelope::new(40000, vec![0x01, 0x02]).unwrap();
        let wire = encode(&envelope).await;
        assert_eq!(wire, vec![0x9C, 0x40, 0x00, 0x02, 0x01, 0x02]);
        assert_eq!(envelope.wire_len(), wire.len());
    }

    #[tokio::test]
    async fn test_round_trip_boundaries() {
        let cases = [
            (0u16, Vec::new()),
            (53, vec![0xAA]),
            (u16::MAX, vec![0x55; 512]),
            (1, vec![7u8; MAX_ENVELOPE_DATA]),
        ];
        for (port, data) in cases {
            let envelope = TunnelEnvelope::new(port, data).unwrap();
            let wire = encode(&envelope).await;
            let mut reader = &wire[..];
            let decoded = TunnelEnvelope::read_from(&mut reader).await.unwrap().unwrap();
            assert_eq!(decoded, envelope);
            assert!(TunnelEnvelope::read_from(&mut reader).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_consecutive_envelopes_then_single_eof() {
        let mut wire = Vec::new();
        for port in [1000u16, 2000, 3000] {
            let envelope = TunnelEnvelope::new(port, port.to_be_bytes().to_vec()).unwrap();
            envelope.write_to(&mut wire).await.unwrap();
        }

        let mut reader = &wire[..];
        let mut ports = Vec::new();
        while let Some(envelope) = TunnelEnvelope::read_from(&mut reader).await.unwrap() {
            assert_eq!(envelope.data(), &envelope.port().to_be_bytes()[..]);
            ports.push(envelope.port());
        }
        assert_eq!(ports, vec![1000, 2000, 3000]);
    }

    #[test]
    fn test_oversized_data_rejected() {
        assert!(matches!(
            TunnelEnvelope::new(1, vec![0; MAX_ENVELOPE_DATA + 1]),
            Err(EnvelopeError::TooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_header_and_body() {
        let mut short_header: &[u8] = &[0x00, 0x35, 0x00];
        assert!(matches!(
            TunnelEnvelope::read_from(&mut short_header).await,
            Err(EnvelopeError::Truncated { expected: 4, actual: 3 })
        ));

        let mut short_body: &[u8] = &[0x00, 0x35, 0x00, 0x04, 0xDE, 0xAD];
        assert!(matches!(
            TunnelEnvelope::read_from(&mut short_body).await,
            Err(EnvelopeError::Truncated { expected: 4, actual: 2 })
        ));
    }

    #[tokio::test]
    async fn test_header_split_across_reads() {
        let mock = tokio_test::io::Builder::new()
            .read(&[0x9C])
            .read(&[0x40, 0x00])
            .read(&[0x02, 0x01])
            .read(&[0x02])
            .build();
        let mut reader = mock;
        let envelope = TunnelEnvelope::read_from(&mut reader).await.unwrap().unwrap();
        assert_eq!(envelope.port(), 40000);
        assert_eq!(envelope.data(), &[0x01, 0x02]);
    }
}
