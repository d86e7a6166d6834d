//! Tunnel handshake
//!
//! Both roles run as [`CheckpointMachine`]s over the two halves of one byte
//! stream.
//!
//! ```text
//! client                                           server
//!   | -- 00 01 02 03 | g^a (256 bytes) --------------> |   plaintext hello
//!   | <------------- 00 01 02 03 | g^b (256 bytes) --  |
//!   |            (both switch to the cipher stream)    |
//!   | -- 01 00 01 00 | nonce_c (8) ------------------> |   self-test
//!   | <-- 00 01 00 01 | crc16(nonce_c) | nonce_s (8) - |   reply
//!   | -- 00 00 01 01 | crc16(nonce_s) ---------------> |   ack
//! ```
//!
//! Mismatched session keys cannot produce a matching CRC over encrypted test
//! bytes, so a finished handshake proves both sides hold the same key.

use crate::checkpoint::{CheckpointDriver, CheckpointError, CheckpointMachine, Transition, DEFAULT_RETRY_BUDGET};
use crate::frame::{crc16, CipherReader, CipherWriter, FrameCipher};
use crate::key_exchange::{
    decode_fixed_width, encode_fixed_width, session_key_for, validate_public_value, KeyExchange,
    KeyExchangeError, KeyPair, SessionKey, PUBLIC_VALUE_LEN,
};
use async_trait::async_trait;
use num_bigint::BigUint;
use rand::RngCore;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Plaintext hello prefix
pub const HELLO_MAGIC: [u8; 4] = [0x00, 0x01, 0x02, 0x03];
/// Client self-test prefix
pub const TEST_MAGIC: [u8; 4] = [0x01, 0x00, 0x01, 0x00];
/// Server self-test reply prefix
pub const REPLY_MAGIC: [u8; 4] = [0x00, 0x01, 0x00, 0x01];
/// Client final ack prefix
pub const ACK_MAGIC: [u8; 4] = [0x00, 0x00, 0x01, 0x01];

/// Random bytes each side contributes to the self-test
pub const NONCE_LEN: usize = 8;

const HELLO_LEN: usize = 4 + PUBLIC_VALUE_LEN;
const TEST_LEN: usize = 4 + NONCE_LEN;
const REPLY_LEN: usize = 4 + 2 + NONCE_LEN;
const ACK_LEN: usize = 4 + 2;

/// Default bound on every handshake read and write
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Handshake errors
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// Message started with the wrong prefix
    #[error("Bad {message} magic: {found:02x?}")]
    BadMagic { message: &'static str, found: [u8; 4] },

    /// Self-test checksum mismatch; the two sides derived different keys
    #[error("Self-test CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Peer closed the stream mid-handshake
    #[error("Peer closed the connection during the handshake")]
    PeerClosed,

    /// A handshake read or write did not complete in time
    #[error("Handshake timed out after {0:?}")]
    Timeout(Duration),

    /// Driver gave up for a reason other than a step error
    #[error("Handshake aborted: {0}")]
    Aborted(String),

    /// A message was cut off by an I/O error after part of it moved;
    /// re-running the step would desynchronize the stream
    #[error("IO error after {transferred} of {expected} handshake bytes: {source}")]
    PartialTransfer {
        transferred: usize,
        expected: usize,
        #[source]
        source: io::Error,
    },

    #[error("Key exchange failed: {0}")]
    KeyExchange(#[from] KeyExchangeError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<CheckpointError<HandshakeError>> for HandshakeError {
    fn from(err: CheckpointError<HandshakeError>) -> Self {
        match err {
            CheckpointError::Step { source, .. } | CheckpointError::BudgetExhausted { source, .. } => source,
            other => HandshakeError::Aborted(other.to_string()),
        }
    }
}

/// Handshake tuning shared by both roles
#[derive(Debug, Clone, Copy)]
pub struct HandshakeSettings {
    pub key_exchange: KeyExchange,
    pub timeout: Duration,
    pub retry_budget: u32,
}

impl Default for HandshakeSettings {
    fn default() -> Self {
        Self {
            key_exchange: KeyExchange::default(),
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            retry_budget: DEFAULT_RETRY_BUDGET,
        }
    }
}

/// Encrypted stream pair produced by a successful handshake
pub struct SecureChannel<R, W> {
    pub reader: CipherReader<R>,
    pub writer: CipherWriter<W>,
}

impl<R, W> SecureChannel<R, W> {
    pub fn into_parts(self) -> (CipherReader<R>, CipherWriter<W>) {
        (self.reader, self.writer)
    }
}

/// Transport state of a handshake in progress
enum Stage<R, W> {
    Plain { reader: R, writer: W },
    Encrypted(SecureChannel<R, W>),
    Switching,
}

impl<R, W> Stage<R, W> {
    fn encrypt(&mut self, key: SessionKey) {
        let cipher = FrameCipher::new(key);
        *self = match std::mem::replace(self, Stage::Switching) {
            Stage::Plain { reader, writer } => Stage::Encrypted(SecureChannel {
                reader: CipherReader::new(reader, cipher.clone()),
                writer: CipherWriter::new(writer, cipher),
            }),
            other => other,
        };
    }

    fn into_channel(self) -> Result<SecureChannel<R, W>, HandshakeError> {
        match self {
            Stage::Encrypted(channel) => Ok(channel),
            _ => Err(HandshakeError::Aborted(
                "handshake finished without an encrypted channel".into(),
            )),
        }
    }
}

async fn timed<F, T>(limit: Duration, fut: F) -> Result<T, HandshakeError>
where
    F: Future<Output = Result<T, HandshakeError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| HandshakeError::Timeout(limit))?
}

/// Classify an I/O error by how much of the message had already moved.
/// Only an error before the first byte leaves the step safe to re-run.
fn transfer_error(error: io::Error, transferred: usize, expected: usize) -> HandshakeError {
    if error.kind() == io::ErrorKind::UnexpectedEof {
        HandshakeError::PeerClosed
    } else if transferred == 0 {
        HandshakeError::Io(error)
    } else {
        HandshakeError::PartialTransfer {
            transferred,
            expected,
            source: error,
        }
    }
}

async fn read_message<R>(reader: &mut R, buf: &mut [u8], limit: Duration) -> Result<(), HandshakeError>
where
    R: AsyncRead + Unpin,
{
    timed(limit, async {
        let expected = buf.len();
        let mut filled = 0;
        while filled < expected {
            match reader.read(&mut buf[filled..]).await {
                Ok(0) => return Err(HandshakeError::PeerClosed),
                Ok(n) => filled += n,
                Err(e) => return Err(transfer_error(e, filled, expected)),
            }
        }
        Ok(())
    })
    .await
}

async fn send_message<W>(writer: &mut W, msg: &[u8], limit: Duration) -> Result<(), HandshakeError>
where
    W: AsyncWrite + Unpin,
{
    timed(limit, async {
        let mut written = 0;
        while written < msg.len() {
            match writer.write(&msg[written..]).await {
                Ok(0) => return Err(HandshakeError::Io(io::ErrorKind::WriteZero.into())),
                Ok(n) => written += n,
                Err(e) => return Err(transfer_error(e, written, msg.len())),
            }
        }
        writer
            .flush()
            .await
            .map_err(|e| transfer_error(e, written, msg.len()))
    })
    .await
}

fn check_magic(message: &'static str, expected: [u8; 4], found: &[u8]) -> Result<(), HandshakeError> {
    let mut prefix = [0u8; 4];
    prefix.copy_from_slice(&found[..4]);
    if prefix != expected {
        return Err(HandshakeError::BadMagic { message, found: prefix });
    }
    Ok(())
}

fn hello_message(pair: &KeyPair) -> [u8; HELLO_LEN] {
    let mut msg = [0u8; HELLO_LEN];
    msg[..4].copy_from_slice(&HELLO_MAGIC);
    msg[4..].copy_from_slice(&encode_fixed_width(pair.public_value()));
    msg
}

fn parse_hello(msg: &[u8; HELLO_LEN]) -> Result<BigUint, HandshakeError> {
    check_magic("hello", HELLO_MAGIC, msg)?;
    let peer_public = decode_fixed_width(&msg[4..]);
    validate_public_value(&peer_public)?;
    Ok(peer_public)
}

fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Interrupted or would-block before any byte of the message moved
fn is_transient(error: &HandshakeError) -> bool {
    matches!(
        error,
        HandshakeError::Io(e) if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock)
    )
}

/// Client handshake steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCheckpoint {
    SendHello,
    ReceiveHello,
    SendSelfTest,
    ReceiveReply,
    SendAck,
}

/// Initiating side of the handshake
pub struct ClientHandshake<R, W> {
    stage: Stage<R, W>,
    key_pair: Option<KeyPair>,
    hello: [u8; HELLO_LEN],
    client_nonce: [u8; NONCE_LEN],
    server_nonce: [u8; NONCE_LEN],
    timeout: Duration,
}

impl<R, W> ClientHandshake<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W, key_pair: KeyPair, timeout: Duration) -> Self {
        Self {
            stage: Stage::Plain { reader, writer },
            hello: hello_message(&key_pair),
            key_pair: Some(key_pair),
            client_nonce: random_nonce(),
            server_nonce: [0u8; NONCE_LEN],
            timeout,
        }
    }

    pub fn into_channel(self) -> Result<SecureChannel<R, W>, HandshakeError> {
        self.stage.into_channel()
    }

    async fn send(&mut self, msg: &[u8]) -> Result<(), HandshakeError> {
        match &mut self.stage {
            Stage::Plain { writer, .. } => send_message(writer, msg, self.timeout).await,
            Stage::Encrypted(channel) => send_message(&mut channel.writer, msg, self.timeout).await,
            Stage::Switching => Err(HandshakeError::Aborted("stream unavailable".into())),
        }
    }

    async fn receive(&mut self, buf: &mut [u8]) -> Result<(), HandshakeError> {
        match &mut self.stage {
            Stage::Plain { reader, .. } => read_message(reader, buf, self.timeout).await,
            Stage::Encrypted(channel) => read_message(&mut channel.reader, buf, self.timeout).await,
            Stage::Switching => Err(HandshakeError::Aborted("stream unavailable".into())),
        }
    }
}

#[async_trait]
impl<R, W> CheckpointMachine for ClientHandshake<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    type Checkpoint = ClientCheckpoint;
    type Error = HandshakeError;

    fn initial(&self) -> ClientCheckpoint {
        ClientCheckpoint::SendHello
    }

    async fn run(&mut self, checkpoint: ClientCheckpoint) -> Result<Transition<ClientCheckpoint>, HandshakeError> {
        match checkpoint {
            ClientCheckpoint::SendHello => {
                let hello = self.hello;
                self.send(&hello).await?;
                Ok(Transition::Next(ClientCheckpoint::ReceiveHello))
            }
            ClientCheckpoint::ReceiveHello => {
                let mut msg = [0u8; HELLO_LEN];
                self.receive(&mut msg).await?;
                let peer_public = parse_hello(&msg)?;

                let pair = match self.key_pair.take() {
                    Some(pair) => pair,
                    None => return Ok(Transition::Fail("key pair already consumed".into())),
                };
                let key = session_key_for(pair, &peer_public)?;
                self.stage.encrypt(key);
                log::debug!("Client derived session key, starting self-test");
                Ok(Transition::Next(ClientCheckpoint::SendSelfTest))
            }
            ClientCheckpoint::SendSelfTest => {
                let mut msg = [0u8; TEST_LEN];
                msg[..4].copy_from_slice(&TEST_MAGIC);
                msg[4..].copy_from_slice(&self.client_nonce);
                self.send(&msg).await?;
                Ok(Transition::Next(ClientCheckpoint::ReceiveReply))
            }
            ClientCheckpoint::ReceiveReply => {
                let mut msg = [0u8; REPLY_LEN];
                self.receive(&mut msg).await?;
                check_magic("self-test reply", REPLY_MAGIC, &msg)?;

                let expected = crc16(&self.client_nonce);
                let actual = u16::from_be_bytes([msg[4], msg[5]]);
                if expected != actual {
                    return Err(HandshakeError::CrcMismatch { expected, actual });
                }
                self.server_nonce.copy_from_slice(&msg[6..]);
                Ok(Transition::Next(ClientCheckpoint::SendAck))
            }
            ClientCheckpoint::SendAck => {
                let mut msg = [0u8; ACK_LEN];
                msg[..4].copy_from_slice(&ACK_MAGIC);
                msg[4..].copy_from_slice(&crc16(&self.server_nonce).to_be_bytes());
                self.send(&msg).await?;
                Ok(Transition::Finish)
            }
        }
    }

    fn is_retryable(&self, error: &HandshakeError) -> bool {
        is_transient(error)
    }
}

/// Server handshake steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCheckpoint {
    ReceiveHello,
    SendHello,
    ReplySelfTest,
    VerifyAck,
}

/// Accepting side of the handshake
pub struct ServerHandshake<R, W> {
    stage: Stage<R, W>,
    key_pair: Option<KeyPair>,
    hello: [u8; HELLO_LEN],
    peer_public: Option<BigUint>,
    server_nonce: [u8; NONCE_LEN],
    timeout: Duration,
}

impl<R, W> ServerHandshake<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W, key_pair: KeyPair, timeout: Duration) -> Self {
        Self {
            stage: Stage::Plain { reader, writer },
            hello: hello_message(&key_pair),
            key_pair: Some(key_pair),
            peer_public: None,
            server_nonce: random_nonce(),
            timeout,
        }
    }

    pub fn into_channel(self) -> Result<SecureChannel<R, W>, HandshakeError> {
        self.stage.into_channel()
    }

    async fn send(&mut self, msg: &[u8]) -> Result<(), HandshakeError> {
        match &mut self.stage {
            Stage::Plain { writer, .. } => send_message(writer, msg, self.timeout).await,
            Stage::Encrypted(channel) => send_message(&mut channel.writer, msg, self.timeout).await,
            Stage::Switching => Err(HandshakeError::Aborted("stream unavailable".into())),
        }
    }

    async fn receive(&mut self, buf: &mut [u8]) -> Result<(), HandshakeError> {
        match &mut self.stage {
            Stage::Plain { reader, .. } => read_message(reader, buf, self.timeout).await,
            Stage::Encrypted(channel) => read_message(&mut channel.reader, buf, self.timeout).await,
            Stage::Switching => Err(HandshakeError::Aborted("stream unavailable".into())),
        }
    }
}

#[async_trait]
impl<R, W> CheckpointMachine for ServerHandshake<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    type Checkpoint = ServerCheckpoint;
    type Error = HandshakeError;

    fn initial(&self) -> ServerCheckpoint {
        ServerCheckpoint::ReceiveHello
    }

    async fn run(&mut self, checkpoint: ServerCheckpoint) -> Result<Transition<ServerCheckpoint>, HandshakeError> {
        match checkpoint {
            ServerCheckpoint::ReceiveHello => {
                let mut msg = [0u8; HELLO_LEN];
                self.receive(&mut msg).await?;
                self.peer_public = Some(parse_hello(&msg)?);
                Ok(Transition::Next(ServerCheckpoint::SendHello))
            }
            ServerCheckpoint::SendHello => {
                let hello = self.hello;
                self.send(&hello).await?;

                let (pair, peer_public) = match (self.key_pair.take(), self.peer_public.take()) {
                    (Some(pair), Some(peer)) => (pair, peer),
                    _ => return Ok(Transition::Fail("hello state missing".into())),
                };
                let key = session_key_for(pair, &peer_public)?;
                self.stage.encrypt(key);
                log::debug!("Server derived session key, awaiting self-test");
                Ok(Transition::Next(ServerCheckpoint::ReplySelfTest))
            }
            ServerCheckpoint::ReplySelfTest => {
                let mut msg = [0u8; TEST_LEN];
                self.receive(&mut msg).await?;
                check_magic("self-test", TEST_MAGIC, &msg)?;

                let mut reply = [0u8; REPLY_LEN];
                reply[..4].copy_from_slice(&REPLY_MAGIC);
                reply[4..6].copy_from_slice(&crc16(&msg[4..]).to_be_bytes());
                reply[6..].copy_from_slice(&self.server_nonce);
                self.send(&reply).await?;
                Ok(Transition::Next(ServerCheckpoint::VerifyAck))
            }
            ServerCheckpoint::VerifyAck => {
                let mut msg = [0u8; ACK_LEN];
                self.receive(&mut msg).await?;
                check_magic("ack", ACK_MAGIC, &msg)?;

                let expected = crc16(&self.server_nonce);
                let actual = u16::from_be_bytes([msg[4], msg[5]]);
                if expected != actual {
                    return Err(HandshakeError::CrcMismatch { expected, actual });
                }
                Ok(Transition::Finish)
            }
        }
    }

    fn is_retryable(&self, error: &HandshakeError) -> bool {
        is_transient(error)
    }
}

/// Run the client role over `reader`/`writer` with a fresh key pair
pub async fn client_handshake<R, W>(
    reader: R,
    writer: W,
    settings: &HandshakeSettings,
) -> Result<SecureChannel<R, W>, HandshakeError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let key_pair = settings.key_exchange.generate();
    let mut machine = ClientHandshake::new(reader, writer, key_pair, settings.timeout);
    CheckpointDriver::new(settings.retry_budget).drive(&mut machine).await?;
    machine.into_channel()
}

/// Run the server role over `reader`/`writer` with a fresh key pair
pub async fn server_handshake<R, W>(
    reader: R,
    writer: W,
    settings: &HandshakeSettings,
) -> Result<SecureChannel<R, W>, HandshakeError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let key_pair = settings.key_exchange.generate();
    let mut machine = ServerHandshake::new(reader, writer, key_pair, settings.timeout);
    CheckpointDriver::new(settings.retry_budget).drive(&mut machine).await?;
    machine.into_channel()
}
