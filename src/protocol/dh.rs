//! Diffie-Hellman key agreement over a fixed prime group.
//!
//! The access point speaks the 768-bit Oakley group 1 (RFC 2409) with
//! generator 2, which is the default. The 2048-bit MODP group 14
//! (RFC 3526) is available for peers that expect it.
//!
//! Public values and shared secrets are encoded as minimal big-endian
//! byte strings: no leading zero bytes.
//!
//! # Example
//!
//! ```rust
//! use apconnect::protocol::dh::{Group, KeyPair};
//!
//! let mut rng = rand::rngs::OsRng;
//! let alice = KeyPair::generate(Group::default(), &mut rng);
//! let bob = KeyPair::generate(Group::default(), &mut rng);
//!
//! let ab = alice.shared_secret(bob.public_key())?;
//! let ba = bob.shared_secret(alice.public_key())?;
//! assert_eq!(ab.as_bytes(), ba.as_bytes());
//! # Ok::<(), apconnect::error::Error>(())
//! ```

use std::fmt;

use rand::{CryptoRng, RngCore};
use rsa::BigUint;
use veil::Redact;
use zeroize::Zeroizing;

use crate::error::{ProtocolError, Result};

/// Oakley group 1 prime: 2^768 - 2^704 - 1 + 2^64 * { [2^638 pi] + 149686 }.
const OAKLEY_768_PRIME: [u8; 96] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xc9, 0x0f, 0xda, 0xa2, 0x21, 0x68, 0xc2, 0x34,
    0xc4, 0xc6, 0x62, 0x8b, 0x80, 0xdc, 0x1c, 0xd1, 0x29, 0x02, 0x4e, 0x08, 0x8a, 0x67, 0xcc, 0x74,
    0x02, 0x0b, 0xbe, 0xa6, 0x3b, 0x13, 0x9b, 0x22, 0x51, 0x4a, 0x08, 0x79, 0x8e, 0x34, 0x04, 0xdd,
    0xef, 0x95, 0x19, 0xb3, 0xcd, 0x3a, 0x43, 0x1b, 0x30, 0x2b, 0x0a, 0x6d, 0xf2, 0x5f, 0x14, 0x37,
    0x4f, 0xe1, 0x35, 0x6d, 0x6d, 0x51, 0xc2, 0x45, 0xe4, 0x85, 0xb5, 0x76, 0x62, 0x5e, 0x7e, 0xc6,
    0xf4, 0x4c, 0x42, 0xe9, 0xa6, 0x3a, 0x36, 0x20, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];

/// MODP group 14 prime: 2^2048 - 2^1984 - 1 + 2^64 * { [2^1918 pi] + 124476 }.
const MODP_2048_PRIME: [u8; 256] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xc9, 0x0f, 0xda, 0xa2, 0x21, 0x68, 0xc2, 0x34,
    0xc4, 0xc6, 0x62, 0x8b, 0x80, 0xdc, 0x1c, 0xd1, 0x29, 0x02, 0x4e, 0x08, 0x8a, 0x67, 0xcc, 0x74,
    0x02, 0x0b, 0xbe, 0xa6, 0x3b, 0x13, 0x9b, 0x22, 0x51, 0x4a, 0x08, 0x79, 0x8e, 0x34, 0x04, 0xdd,
    0xef, 0x95, 0x19, 0xb3, 0xcd, 0x3a, 0x43, 0x1b, 0x30, 0x2b, 0x0a, 0x6d, 0xf2, 0x5f, 0x14, 0x37,
    0x4f, 0xe1, 0x35, 0x6d, 0x6d, 0x51, 0xc2, 0x45, 0xe4, 0x85, 0xb5, 0x76, 0x62, 0x5e, 0x7e, 0xc6,
    0xf4, 0x4c, 0x42, 0xe9, 0xa6, 0x37, 0xed, 0x6b, 0x0b, 0xff, 0x5c, 0xb6, 0xf4, 0x06, 0xb7, 0xed,
    0xee, 0x38, 0x6b, 0xfb, 0x5a, 0x89, 0x9f, 0xa5, 0xae, 0x9f, 0x24, 0x11, 0x7c, 0x4b, 0x1f, 0xe6,
    0x49, 0x28, 0x66, 0x51, 0xec, 0xe4, 0x5b, 0x3d, 0xc2, 0x00, 0x7c, 0xb8, 0xa1, 0x63, 0xbf, 0x05,
    0x98, 0xda, 0x48, 0x36, 0x1c, 0x55, 0xd3, 0x9a, 0x69, 0x16, 0x3f, 0xa8, 0xfd, 0x24, 0xcf, 0x5f,
    0x83, 0x65, 0x5d, 0x23, 0xdc, 0xa3, 0xad, 0x96, 0x1c, 0x62, 0xf3, 0x56, 0x20, 0x85, 0x52, 0xbb,
    0x9e, 0xd5, 0x29, 0x07, 0x70, 0x96, 0x96, 0x6d, 0x67, 0x0c, 0x35, 0x4e, 0x4a, 0xbc, 0x98, 0x04,
    0xf1, 0x74, 0x6c, 0x08, 0xca, 0x18, 0x21, 0x7c, 0x32, 0x90, 0x5e, 0x46, 0x2e, 0x36, 0xce, 0x3b,
    0xe3, 0x9e, 0x77, 0x2c, 0x18, 0x0e, 0x86, 0x03, 0x9b, 0x27, 0x83, 0xa2, 0xec, 0x07, 0xa2, 0x8f,
    0xb5, 0xc5, 0x5d, 0xf0, 0x6f, 0x4c, 0x52, 0xc9, 0xde, 0x2b, 0xcb, 0xf6, 0x95, 0x58, 0x17, 0x18,
    0x39, 0x95, 0x49, 0x7c, 0xea, 0x95, 0x6a, 0xe5, 0x15, 0xd2, 0x26, 0x18, 0x98, 0xfa, 0x05, 0x10,
    0x15, 0x72, 0x8e, 0x5a, 0x8a, 0xac, 0xaa, 0x68, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];

/// Generator shared by both groups.
const GENERATOR: u32 = 2;

/// Prime group used for the key agreement.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum Group {
    /// 768-bit Oakley group 1, as spoken by the access point.
    #[default]
    Oakley768,
    /// 2048-bit MODP group 14.
    Modp2048,
}

impl Group {
    /// Returns the big-endian encoding of the group prime.
    #[must_use]
    pub fn prime_bytes(self) -> &'static [u8] {
        match self {
            Self::Oakley768 => &OAKLEY_768_PRIME,
            Self::Modp2048 => &MODP_2048_PRIME,
        }
    }

    #[must_use]
    pub fn prime(self) -> BigUint {
        BigUint::from_bytes_be(self.prime_bytes())
    }

    #[must_use]
    pub fn generator(self) -> BigUint {
        BigUint::from(GENERATOR)
    }

    /// Returns whether `value` lies in `[2, p - 2]`.
    ///
    /// Values outside this range force the shared secret into a tiny
    /// subgroup and are never produced by an honest peer.
    #[must_use]
    pub fn contains(self, value: &BigUint) -> bool {
        let two = BigUint::from(2u32);
        let upper = self.prime() - &two;
        *value >= two && *value <= upper
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oakley768 => write!(f, "oakley-768"),
            Self::Modp2048 => write!(f, "modp-2048"),
        }
    }
}

/// Ephemeral key pair. The private exponent is wiped on drop.
#[derive(Redact)]
pub struct KeyPair {
    group: Group,
    #[redact]
    private: Zeroizing<Vec<u8>>,
    public: Vec<u8>,
}

/// Result of the key agreement, wiped on drop.
#[derive(Clone, Redact)]
#[redact(all)]
pub struct SharedSecret(Zeroizing<Vec<u8>>);

impl SharedSecret {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl KeyPair {
    /// Samples a private exponent uniformly from `[2, p - 2]`.
    ///
    /// Rejection sampling over byte strings as wide as the prime: the prime
    /// starts with `0xff`, so nearly every draw is accepted.
    pub fn generate<R>(group: Group, rng: &mut R) -> Self
    where
        R: RngCore + CryptoRng,
    {
        let mut buf = Zeroizing::new(vec![0; group.prime_bytes().len()]);
        loop {
            rng.fill_bytes(&mut buf);
            let candidate = BigUint::from_bytes_be(&buf);
            if group.contains(&candidate) {
                return Self::with_private(group, &candidate);
            }
        }
    }

    /// Builds a key pair from a known private exponent.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidPublicValue`] if `private` lies outside
    /// `[2, p - 2]`.
    pub fn from_private(group: Group, private: &BigUint) -> Result<Self> {
        if !group.contains(private) {
            return Err(ProtocolError::InvalidPublicValue.into());
        }
        Ok(Self::with_private(group, private))
    }

    fn with_private(group: Group, private: &BigUint) -> Self {
        let public = group.generator().modpow(private, &group.prime());
        Self {
            group,
            private: Zeroizing::new(private.to_bytes_be()),
            public: public.to_bytes_be(),
        }
    }

    #[must_use]
    pub fn group(&self) -> Group {
        self.group
    }

    /// Returns `g^x mod p` as minimal big-endian bytes.
    #[must_use]
    pub fn public_key(&self) -> &[u8] {
        &self.public
    }

    /// Computes `peer^x mod p`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidPublicValue`] if the peer's value lies
    /// outside `[2, p - 2]`.
    pub fn shared_secret(&self, peer: &[u8]) -> Result<SharedSecret> {
        let peer = BigUint::from_bytes_be(peer);
        if !self.group.contains(&peer) {
            return Err(ProtocolError::InvalidPublicValue.into());
        }

        let private = BigUint::from_bytes_be(&self.private);
        let shared = peer.modpow(&private, &self.group.prime());
        Ok(SharedSecret(Zeroizing::new(shared.to_bytes_be())))
    }
}
