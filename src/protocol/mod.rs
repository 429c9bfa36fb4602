//! Wire protocol of the access point.
//!
//! Everything that touches bytes on the socket lives here, leaf first:
//!
//! * [`dh`] - Diffie-Hellman group and ephemeral key pair
//! * [`cipher`] - the session stream cipher and its per-direction state
//! * [`codec`] - command bytes and encrypted packet framing
//! * [`handshake`] - key exchange, signature check and key derivation
//! * [`mercury`] - Mercury requests and connect-state control frames
//! * [`connect`] - device announcement and SPIRC frames
//!
//! Message types generated from Protocol Buffers are in [`protos`].
//!
//! Lengths on the wire are big-endian throughout. Handshake messages are
//! sent in the clear, everything after the login acknowledgement is an
//! encrypted [`codec::Packet`].

pub mod cipher;
pub mod codec;
pub mod connect;
pub mod dh;
pub mod handshake;
pub mod mercury;
pub mod protos;

use crate::error::{ProtocolError, Result};

/// Appends `bytes` prefixed with their big-endian `u16` length.
///
/// # Errors
///
/// Returns [`ProtocolError::PacketTooLarge`] if `bytes` is longer than
/// `u16::MAX`.
pub(crate) fn put_u16_prefixed(buf: &mut Vec<u8>, what: &'static str, bytes: &[u8]) -> Result<()> {
    let len = u16::try_from(bytes.len()).map_err(|_| ProtocolError::PacketTooLarge {
        what,
        len: bytes.len(),
        max: u16::MAX.into(),
    })?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

/// Splits a big-endian `u16` length prefix and the bytes it announces off
/// the front of `buf`.
///
/// Returns `None` if `buf` is too short.
pub(crate) fn take_u16_prefixed<'a>(buf: &mut &'a [u8]) -> Option<&'a [u8]> {
    let len = take_u16(buf)?;
    let len = usize::from(len);
    if buf.len() < len {
        return None;
    }
    let (bytes, rest) = buf.split_at(len);
    *buf = rest;
    Some(bytes)
}

/// Splits a big-endian `u16` off the front of `buf`.
pub(crate) fn take_u16(buf: &mut &[u8]) -> Option<u16> {
    if buf.len() < 2 {
        return None;
    }
    let (head, rest) = buf.split_at(2);
    *buf = rest;
    Some(u16::from_be_bytes([head[0], head[1]]))
}
