//! Session stream cipher.
//!
//! After the handshake both directions of the connection are encrypted with
//! their own [`SessionCipher`], keyed once with the send or receive key. Each
//! packet re-nonces the cipher with a big-endian packet counter, runs one
//! keystream block over the command byte and payload and appends a 4-byte
//! tag.
//!
//! # Packet layout
//!
//! ```text
//! +---------+----------------+----------------------+---------+
//! | command | length (u16 BE)| encrypted payload    | tag (4) |
//! +---------+----------------+----------------------+---------+
//! ```
//!
//! The command byte is sent in the clear. Its keystream position is still
//! consumed so that payload byte `i` is masked with keystream byte `i + 1`.
//!
//! # Tag strength
//!
//! The tag is the 8-bit sum of the keystream block repeated four times. It
//! depends on the cipher state only, not on the data: it detects a
//! desynchronized packet counter, but not a corrupted payload. It is kept
//! byte-exact because the access point checks it. Nothing else in this crate
//! relies on it for integrity.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ProtocolError, Result};

/// Number of 32-bit words in the register.
const WORDS: usize = 16;

/// Length of the packet tag in bytes.
pub const TAG_LEN: usize = 4;

/// Length of the clear packet header: command byte and payload length.
pub const HEADER_LEN: usize = 3;

/// Keystream register.
///
/// A diffusion cycle mixes every word with its left neighbour: word `i`
/// becomes `old[i - 1] ^ (r[i] >> 3) ^ (r[i - 1] << 5)`, where `r[i - 1]` has
/// already been updated for every `i > 0`. The resulting register is the
/// keystream block.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Shannon {
    r: [u32; WORDS],
    sbuf: [u32; WORDS],
}

impl Shannon {
    /// Creates a register keyed with `key`.
    ///
    /// Key bytes are XOR-ed cyclically into the words before one cycle.
    #[must_use]
    pub fn new(key: &[u8]) -> Self {
        let mut shannon = Self {
            r: [0; WORDS],
            sbuf: [0; WORDS],
        };

        for (i, byte) in key.iter().enumerate() {
            shannon.r[i % WORDS] ^= u32::from(*byte);
        }
        shannon.cycle();

        shannon
    }

    fn cycle(&mut self) {
        let mut rotated = [0; WORDS];
        for (i, word) in rotated.iter_mut().enumerate() {
            *word = self.r[(i + WORDS - 1) % WORDS];
        }

        for i in 0..WORDS {
            let left = self.r[(i + WORDS - 1) % WORDS];
            self.r[i] = rotated[i] ^ (self.r[i] >> 3) ^ (left << 5);
        }

        self.sbuf = self.r;
        rotated.zeroize();
    }

    /// Mixes `nonce` into the first word and cycles.
    pub fn nonce(&mut self, nonce: u32) {
        self.r[0] ^= nonce;
        self.cycle();
    }

    /// Cycles once and masks `buf` with the new keystream block.
    ///
    /// Encryption and decryption are the same operation. Buffers longer than
    /// sixteen bytes reuse the block.
    pub fn transform(&mut self, buf: &mut [u8]) {
        self.cycle();
        for (i, byte) in buf.iter_mut().enumerate() {
            // Only the low byte of each word is used.
            *byte ^= self.sbuf[i % WORDS].to_le_bytes()[0];
        }
    }

    /// Returns the tag over the current keystream block.
    #[must_use]
    pub fn finish(&self) -> [u8; TAG_LEN] {
        let sum = self
            .sbuf
            .iter()
            .fold(0u8, |acc, word| acc.wrapping_add(word.to_le_bytes()[0]));
        [sum; TAG_LEN]
    }
}

/// Stream cipher for one direction of the connection.
///
/// Owns the keystream register and the packet counter of its direction. The
/// counter starts at zero and increases by one per packet. Once it has used
/// `u32::MAX` the cipher refuses to seal or open anything further rather than
/// reuse a nonce.
#[derive(Clone)]
pub struct SessionCipher {
    shannon: Shannon,
    counter: Option<u32>,
}

impl SessionCipher {
    #[must_use]
    pub fn new(key: &[u8]) -> Self {
        Self {
            shannon: Shannon::new(key),
            counter: Some(0),
        }
    }

    /// Returns the nonce the next packet will use, or `None` once exhausted.
    #[must_use]
    pub fn counter(&self) -> Option<u32> {
        self.counter
    }

    fn next_nonce(&mut self) -> Result<u32> {
        let nonce = self.counter.ok_or(ProtocolError::NonceExhausted)?;
        self.counter = nonce.checked_add(1);
        self.shannon.nonce(nonce);
        Ok(nonce)
    }

    /// Encrypts one packet.
    ///
    /// Returns the complete wire encoding: command, length, ciphertext and
    /// tag.
    ///
    /// # Errors
    ///
    /// * [`ProtocolError::PacketTooLarge`] if `payload` does not fit the
    ///   16-bit length field. The counter is left untouched.
    /// * [`ProtocolError::NonceExhausted`] once the counter is used up.
    pub fn seal(&mut self, command: u8, payload: &[u8]) -> Result<Vec<u8>> {
        let len = u16::try_from(payload.len()).map_err(|_| ProtocolError::PacketTooLarge {
            what: "packet payload",
            len: payload.len(),
            max: u16::MAX.into(),
        })?;

        self.next_nonce()?;

        let mut buf = Vec::with_capacity(1 + payload.len());
        buf.push(command);
        buf.extend_from_slice(payload);
        self.shannon.transform(&mut buf);

        let mut packet = Vec::with_capacity(HEADER_LEN + payload.len() + TAG_LEN);
        packet.push(command);
        packet.extend_from_slice(&len.to_be_bytes());
        packet.extend_from_slice(&buf[1..]);
        packet.extend_from_slice(&self.shannon.finish());
        Ok(packet)
    }

    /// Decrypts the payload of one packet and checks its tag.
    ///
    /// # Errors
    ///
    /// * [`ProtocolError::MacMismatch`] if `tag` does not match. The cipher
    ///   state has advanced regardless and no later packet will verify.
    /// * [`ProtocolError::NonceExhausted`] once the counter is used up.
    pub fn open(&mut self, command: u8, ciphertext: &[u8], tag: &[u8]) -> Result<Vec<u8>> {
        self.next_nonce()?;

        let mut buf = Vec::with_capacity(1 + ciphertext.len());
        buf.push(command);
        buf.extend_from_slice(ciphertext);
        self.shannon.transform(&mut buf);

        if tag != self.shannon.finish() {
            return Err(ProtocolError::MacMismatch.into());
        }

        buf.remove(0);
        Ok(buf)
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher")
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn key() -> Vec<u8> {
        (0..32).collect()
    }

    #[test]
    fn keystream_matches_reference() {
        let mut shannon = Shannon::new(b"key");
        let mut buf = [0u8; 20];
        shannon.transform(&mut buf);

        assert_eq!(hex::encode(buf), "0115766d7d00000000000000000000000115766d");
        assert_eq!(shannon.finish(), [0x76; 4]);
    }

    #[test]
    fn sealed_packets_match_reference() {
        let mut send = SessionCipher::new(&key());

        let first = send.seal(0x4a, b"hello world").unwrap();
        assert_eq!(hex::encode(first), "4a000b735e1717145b0c1409171fa7a7a7a7");

        let second = send.seal(0x1b, b"").unwrap();
        assert_eq!(hex::encode(second), "1b00009f9f9f9f");
        assert_eq!(send.counter(), Some(2));
    }

    #[test]
    fn open_reverses_seal() {
        let mut send = SessionCipher::new(&key());
        let mut recv = SessionCipher::new(&key());

        let payloads: [&[u8]; 4] = [b"", b"x", b"a payload longer than one keystream block", &[0xff; 300]];
        for (i, payload) in payloads.into_iter().enumerate() {
            let command = u8::try_from(i).unwrap();
            let packet = send.seal(command, payload).unwrap();

            let body = &packet[HEADER_LEN..packet.len() - TAG_LEN];
            let tag = &packet[packet.len() - TAG_LEN..];
            assert_eq!(recv.open(packet[0], body, tag).unwrap(), payload);
        }
    }

    #[test]
    fn counter_desync_is_detected() {
        let mut send = SessionCipher::new(&key());
        let mut recv = SessionCipher::new(&key());

        send.seal(0x4a, b"hello world").unwrap();
        let second = send.seal(0x1b, b"").unwrap();

        let err = recv.open(0x1b, &[], &second[HEADER_LEN..]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DataLoss);
    }

    #[test]
    fn tag_does_not_cover_payload() {
        let mut send = SessionCipher::new(&key());
        let mut recv = SessionCipher::new(&key());

        let mut packet = send.seal(0x4a, b"hello world").unwrap();
        packet[HEADER_LEN] ^= 0x01;
        let body = &packet[HEADER_LEN..packet.len() - TAG_LEN];
        let tag = &packet[packet.len() - TAG_LEN..];

        let opened = recv.open(0x4a, body, tag).unwrap();
        assert_eq!(opened[0], b'h' ^ 0x01);
    }

    #[test]
    fn directions_are_independent() {
        let mut send = SessionCipher::new(&key());
        let mut recv = SessionCipher::new(&key());
        let mut peer = SessionCipher::new(&key());

        for _ in 0..5 {
            let packet = peer.seal(0x1b, b"probe").unwrap();
            let tag = &packet[packet.len() - TAG_LEN..];
            recv.open(packet[0], &packet[HEADER_LEN..packet.len() - TAG_LEN], tag)
                .unwrap();
        }

        assert_eq!(recv.counter(), Some(5));
        assert_eq!(send.counter(), Some(0));

        send.seal(0x4a, b"").unwrap();
        assert_eq!(recv.counter(), Some(5));
    }

    #[test]
    fn exhausted_counter_fails_closed() {
        let mut send = SessionCipher::new(&key());
        send.counter = Some(u32::MAX);

        send.seal(0x4a, b"last").unwrap();
        assert_eq!(send.counter(), None);

        let err = send.seal(0x4a, b"reuse").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ResourceExhausted);
    }

    #[test]
    fn oversized_payload_keeps_counter() {
        let mut send = SessionCipher::new(&key());
        let payload = vec![0; usize::from(u16::MAX) + 1];

        let err = send.seal(0x4a, &payload).unwrap_err();
        assert_eq!(err.kind, ErrorKind::OutOfRange);
        assert_eq!(send.counter(), Some(0));
    }
}
