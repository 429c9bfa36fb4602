//! Encrypted packet framing.
//!
//! Once logged in, every message on the connection is a packet sealed by
//! the [`SessionCipher`] of its direction. [`PacketReader`] and
//! [`PacketWriter`] wrap the two halves of the socket and own the cipher
//! of their direction, so the receive counter can only advance through the
//! reader and the send counter only through the writer.
//!
//! Packets are dispatched on their [`Command`] byte:
//!
//! | Byte   | Command              |
//! |--------|----------------------|
//! | `0x09` | login notification   |
//! | `0x1b` | SPIRC frame          |
//! | `0x1e` | connect-state frame  |
//! | `0x4a` | Mercury request      |

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::cipher::{SessionCipher, HEADER_LEN, TAG_LEN};
use crate::error::Result;

/// Command byte of a packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Command {
    /// Sent by the access point once the login completed.
    LoginNotification,
    /// SPIRC frame: Hello and Probe, in either direction.
    Spirc,
    /// Connect-state control frame: subscriptions, state pushes and PUTs.
    ConnectState,
    /// Mercury request or reply.
    Mercury,
    /// Any other byte. Logged and ignored.
    Unknown(u8),
}

impl Command {
    const LOGIN_NOTIFICATION: u8 = 0x09;
    const SPIRC: u8 = 0x1b;
    const CONNECT_STATE: u8 = 0x1e;
    const MERCURY: u8 = 0x4a;
}

impl From<u8> for Command {
    fn from(byte: u8) -> Self {
        match byte {
            Self::LOGIN_NOTIFICATION => Self::LoginNotification,
            Self::SPIRC => Self::Spirc,
            Self::CONNECT_STATE => Self::ConnectState,
            Self::MERCURY => Self::Mercury,
            other => Self::Unknown(other),
        }
    }
}

impl From<Command> for u8 {
    fn from(command: Command) -> Self {
        match command {
            Command::LoginNotification => Command::LOGIN_NOTIFICATION,
            Command::Spirc => Command::SPIRC,
            Command::ConnectState => Command::CONNECT_STATE,
            Command::Mercury => Command::MERCURY,
            Command::Unknown(byte) => byte,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoginNotification => write!(f, "login notification"),
            Self::Spirc => write!(f, "spirc"),
            Self::ConnectState => write!(f, "connect state"),
            Self::Mercury => write!(f, "mercury"),
            Self::Unknown(byte) => write!(f, "unknown command {byte:#04x}"),
        }
    }
}

/// A decrypted packet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Packet {
    pub command: Command,
    pub payload: Vec<u8>,
}

impl Packet {
    #[must_use]
    pub fn new(command: Command, payload: Vec<u8>) -> Self {
        Self { command, payload }
    }
}

/// Reads and decrypts packets from the receive half of the connection.
#[derive(Debug)]
pub struct PacketReader<R> {
    inner: R,
    cipher: SessionCipher,
}

impl<R> PacketReader<R>
where
    R: AsyncRead + Unpin,
{
    #[must_use]
    pub fn new(inner: R, cipher: SessionCipher) -> Self {
        Self { inner, cipher }
    }

    /// Reads the next packet.
    ///
    /// Returns `Ok(None)` when the peer closed the connection between
    /// packets.
    ///
    /// # Errors
    ///
    /// * `DataLoss` if the connection closes in the middle of a packet or
    ///   the tag does not verify. The stream cannot be resynchronized after
    ///   either.
    /// * Any I/O error of the underlying stream.
    pub async fn read_packet(&mut self) -> Result<Option<Packet>> {
        let mut header = [0; HEADER_LEN];
        if self.inner.read(&mut header[..1]).await? == 0 {
            return Ok(None);
        }
        self.inner.read_exact(&mut header[1..]).await?;

        let len = usize::from(u16::from_be_bytes([header[1], header[2]]));
        let mut body = vec![0; len + TAG_LEN];
        self.inner.read_exact(&mut body).await?;
        trace!("<- {}{}", hex::encode(header), hex::encode(&body));

        let (ciphertext, tag) = body.split_at(len);
        let payload = self.cipher.open(header[0], ciphertext, tag)?;

        Ok(Some(Packet::new(Command::from(header[0]), payload)))
    }

    /// Returns the receive cipher.
    #[must_use]
    pub fn cipher(&self) -> &SessionCipher {
        &self.cipher
    }
}

/// Encrypts and writes packets to the send half of the connection.
///
/// Callers sharing one writer must serialize access: interleaved writes
/// corrupt the stream and the send counter.
#[derive(Debug)]
pub struct PacketWriter<W> {
    inner: W,
    cipher: SessionCipher,
}

impl<W> PacketWriter<W>
where
    W: AsyncWrite + Unpin,
{
    #[must_use]
    pub fn new(inner: W, cipher: SessionCipher) -> Self {
        Self { inner, cipher }
    }

    /// Seals `payload` and writes it as one packet.
    pub async fn write_packet(&mut self, command: Command, payload: &[u8]) -> Result<()> {
        let packet = self.cipher.seal(command.into(), payload)?;
        trace!("-> {}", hex::encode(&packet));

        self.inner.write_all(&packet).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shuts down the send half of the connection.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    /// Returns the send cipher.
    #[must_use]
    pub fn cipher(&self) -> &SessionCipher {
        &self.cipher
    }
}
