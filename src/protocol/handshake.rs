//! Key exchange with the access point.
//!
//! The handshake runs in the clear over a fresh TCP connection:
//!
//! 1. The client sends a `ClientHello` with its Diffie-Hellman public value
//!    and a random nonce.
//! 2. The access point answers with an `APResponseMessage` carrying its own
//!    public value, signed with the access point RSA key.
//! 3. Both sides derive the session keys from the shared secret and the
//!    handshake transcript. The client proves it holds them by sending the
//!    challenge MAC in a `ClientResponsePlaintext`.
//! 4. The access point acknowledges the login with a 9-byte message.
//!
//! Any failure aborts the attempt: there are no retries at this level.
//!
//! # Transcript
//!
//! Key derivation runs over the exact bytes that went over the wire: the
//! complete `ClientHello` packet including its prefix and length, followed by
//! the complete `APResponseMessage` including its length.

use std::time::Duration;

use hmac::{Hmac, Mac};
use protobuf::{EnumOrUnknown, Message, MessageField};
use rand::{rngs::OsRng, RngCore};
use rsa::{BigUint, Pkcs1v15Sign, RsaPublicKey};
use sha1::{Digest, Sha1};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use veil::Redact;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{
    cipher::SessionCipher,
    dh::{Group, KeyPair},
    protos::keyexchange::{
        APResponseMessage, BuildInfo, ClientHello, ClientResponsePlaintext, Cryptosuite,
        CryptoResponseUnion, LoginCryptoDiffieHellmanHello, LoginCryptoDiffieHellmanResponse,
        LoginCryptoHelloUnion, LoginCryptoResponseUnion, Platform, PoWResponseUnion, Product,
        ProductFlags,
    },
};
use crate::{
    config::Config,
    error::{Error, ProtocolError, Result},
};

type HmacSha1 = Hmac<Sha1>;

/// Modulus of the RSA key the access point signs its public value with.
pub const SERVER_KEY: [u8; 256] = [
    0xac, 0xe0, 0x46, 0x0b, 0xff, 0xc2, 0x30, 0xaf, 0xf4, 0x6b, 0xfe, 0xc3, 0xbf, 0xbf, 0x86, 0x3d,
    0xa1, 0x91, 0xc6, 0xcc, 0x33, 0x6c, 0x93, 0xa1, 0x4f, 0xb3, 0xb0, 0x16, 0x12, 0xac, 0xac, 0x6a,
    0xf1, 0x80, 0xe7, 0xf6, 0x14, 0xd9, 0x42, 0x9d, 0xbe, 0x2e, 0x34, 0x66, 0x43, 0xe3, 0x62, 0xd2,
    0x32, 0x7a, 0x1a, 0x0d, 0x92, 0x3b, 0xae, 0xdd, 0x14, 0x02, 0xb1, 0x81, 0x55, 0x05, 0x61, 0x04,
    0xd5, 0x2c, 0x96, 0xa4, 0x4c, 0x1e, 0xcc, 0x02, 0x4a, 0xd4, 0xb2, 0x0c, 0x00, 0x1f, 0x17, 0xed,
    0xc2, 0x2f, 0xc4, 0x35, 0x21, 0xc8, 0xf0, 0xcb, 0xae, 0xd2, 0xad, 0xd7, 0x2b, 0x0f, 0x9d, 0xb3,
    0xc5, 0x32, 0x1a, 0x2a, 0xfe, 0x59, 0xf3, 0x5a, 0x0d, 0xac, 0x68, 0xf1, 0xfa, 0x62, 0x1e, 0xfb,
    0x2c, 0x8d, 0x0c, 0xb7, 0x39, 0x2d, 0x92, 0x47, 0xe3, 0xd7, 0x35, 0x1a, 0x6d, 0xbd, 0x24, 0xc2,
    0xae, 0x25, 0x5b, 0x88, 0xff, 0xab, 0x73, 0x29, 0x8a, 0x0b, 0xcc, 0xcd, 0x0c, 0x58, 0x67, 0x31,
    0x89, 0xe8, 0xbd, 0x34, 0x80, 0x78, 0x4a, 0x5f, 0xc9, 0x6b, 0x89, 0x9d, 0x95, 0x6b, 0xfc, 0x86,
    0xd7, 0x4f, 0x33, 0xa6, 0x78, 0x17, 0x96, 0xc9, 0xc3, 0x2d, 0x0d, 0x32, 0xa5, 0xab, 0xcd, 0x05,
    0x27, 0xe2, 0xf7, 0x10, 0xa3, 0x96, 0x13, 0xc4, 0x2f, 0x99, 0xc0, 0x27, 0xbf, 0xed, 0x04, 0x9c,
    0x3c, 0x27, 0x58, 0x04, 0xb6, 0xb2, 0x19, 0xf9, 0xc1, 0x2f, 0x02, 0xe9, 0x48, 0x63, 0xec, 0xa1,
    0xb6, 0x42, 0xa0, 0x9d, 0x48, 0x25, 0xf8, 0xb3, 0x9d, 0xd0, 0xe8, 0x6a, 0xf9, 0x48, 0x4d, 0xa1,
    0xc2, 0xba, 0x86, 0x30, 0x42, 0xea, 0x9d, 0xb3, 0x08, 0x6c, 0x19, 0x0e, 0x48, 0xb3, 0x9d, 0x66,
    0xeb, 0x00, 0x06, 0xa2, 0x5a, 0xee, 0xa1, 0x1b, 0x13, 0x87, 0x3c, 0xd7, 0x19, 0xe6, 0x55, 0xbd,
];

/// Public exponent of [`SERVER_KEY`].
pub const SERVER_KEY_EXPONENT: u32 = 65_537;

/// Protocol tag in front of the `ClientHello`.
const HELLO_PREFIX: [u8; 2] = [0x00, 0x04];

/// Length of the random client nonce.
pub const NONCE_LEN: usize = 16;

/// Length of the login acknowledgement.
const ACK_LEN: usize = 9;

/// Marker at `[4..7]` of an accepted login acknowledgement.
const ACK_SUCCESS: [u8; 3] = [0xf2, 0x01, 0x02];

/// Upper bound on an `APResponseMessage`, which is well under a kilobyte.
const MAX_AP_RESPONSE_LEN: usize = 16 * 1024;

/// How long an `APResponseMessage` of unexpected length may pause between
/// segments before it is taken as complete.
const AP_RESPONSE_SETTLE: Duration = Duration::from_millis(250);

/// Keys derived from the shared secret and the handshake transcript.
#[derive(Clone, Redact, Zeroize, ZeroizeOnDrop)]
#[redact(all)]
pub struct SessionKeys {
    challenge: [u8; 20],
    send_key: [u8; 32],
    recv_key: [u8; 32],
}

impl SessionKeys {
    /// MAC proving possession of the keys to the access point.
    #[must_use]
    pub fn challenge(&self) -> &[u8; 20] {
        &self.challenge
    }

    /// Key of the client to server direction.
    #[must_use]
    pub fn send_key(&self) -> &[u8; 32] {
        &self.send_key
    }

    /// Key of the server to client direction.
    #[must_use]
    pub fn recv_key(&self) -> &[u8; 32] {
        &self.recv_key
    }
}

/// Derives the session keys.
///
/// `D_i = HMAC-SHA1(shared, transcript || i)` for `i` in `1..=5` gives 100
/// bytes `D`. The challenge is `HMAC-SHA1(D[0..20], transcript)`, the send
/// key `D[20..52]` and the receive key `D[52..84]`.
pub fn derive_keys(shared: &[u8], transcript: &[u8]) -> Result<SessionKeys> {
    let mut data = Vec::with_capacity(5 * 20);
    for i in 1..=5u8 {
        let mut mac = HmacSha1::new_from_slice(shared)?;
        mac.update(transcript);
        mac.update(&[i]);
        data.extend_from_slice(&mac.finalize().into_bytes());
    }

    let mut mac = HmacSha1::new_from_slice(&data[..20])?;
    mac.update(transcript);

    let mut keys = SessionKeys {
        challenge: [0; 20],
        send_key: [0; 32],
        recv_key: [0; 32],
    };
    keys.challenge.copy_from_slice(&mac.finalize().into_bytes());
    keys.send_key.copy_from_slice(&data[20..52]);
    keys.recv_key.copy_from_slice(&data[52..84]);

    data.zeroize();
    Ok(keys)
}

/// Serializes the `ClientHello` packet: prefix, big-endian length of the
/// whole packet, message.
pub fn client_hello(public_key: &[u8], nonce: &[u8; NONCE_LEN], version: u64) -> Result<Vec<u8>> {
    let mut build_info = BuildInfo::new();
    build_info.product = Some(EnumOrUnknown::new(Product::PRODUCT_CLIENT));
    build_info.product_flags = vec![EnumOrUnknown::new(ProductFlags::PRODUCT_FLAG_NONE)];
    build_info.platform = Some(EnumOrUnknown::new(Platform::PLATFORM_OSX_X86));
    build_info.version = Some(version);

    let mut diffie_hellman = LoginCryptoDiffieHellmanHello::new();
    diffie_hellman.gc = Some(public_key.to_vec());
    diffie_hellman.server_keys_known = Some(1);

    let mut login_crypto_hello = LoginCryptoHelloUnion::new();
    login_crypto_hello.diffie_hellman = MessageField::some(diffie_hellman);

    let mut hello = ClientHello::new();
    hello.build_info = MessageField::some(build_info);
    hello.cryptosuites_supported = vec![EnumOrUnknown::new(Cryptosuite::CRYPTO_SUITE_SHANNON)];
    hello.login_crypto_hello = MessageField::some(login_crypto_hello);
    hello.client_nonce = Some(nonce.to_vec());
    hello.padding = Some(vec![0x1e]);

    let message = hello.write_to_bytes()?;
    let len = u32::try_from(HELLO_PREFIX.len() + 4 + message.len()).map_err(|_| {
        ProtocolError::PacketTooLarge {
            what: "ClientHello",
            len: message.len(),
            max: u32::MAX as usize,
        }
    })?;

    let mut packet = Vec::with_capacity(HELLO_PREFIX.len() + 4 + message.len());
    packet.extend_from_slice(&HELLO_PREFIX);
    packet.extend_from_slice(&len.to_be_bytes());
    packet.extend_from_slice(&message);
    Ok(packet)
}

/// Serializes the `ClientResponsePlaintext`, prefixed with the big-endian
/// length of the message alone.
pub fn client_response(challenge: &[u8]) -> Result<Vec<u8>> {
    let mut diffie_hellman = LoginCryptoDiffieHellmanResponse::new();
    diffie_hellman.hmac = Some(challenge.to_vec());

    let mut login_crypto_response = LoginCryptoResponseUnion::new();
    login_crypto_response.diffie_hellman = MessageField::some(diffie_hellman);

    let mut response = ClientResponsePlaintext::new();
    response.login_crypto_response = MessageField::some(login_crypto_response);
    response.pow_response = MessageField::some(PoWResponseUnion::new());
    response.crypto_response = MessageField::some(CryptoResponseUnion::new());

    let message = response.write_to_bytes()?;
    let len = u32::try_from(message.len()).map_err(|_| ProtocolError::PacketTooLarge {
        what: "ClientResponsePlaintext",
        len: message.len(),
        max: u32::MAX as usize,
    })?;

    let mut packet = Vec::with_capacity(4 + message.len());
    packet.extend_from_slice(&len.to_be_bytes());
    packet.extend_from_slice(&message);
    Ok(packet)
}

/// An authenticated connection with its two ciphers.
#[derive(Debug)]
pub struct Connection<S> {
    pub stream: S,
    pub send: SessionCipher,
    pub recv: SessionCipher,
}

/// Runs the key exchange.
#[derive(Clone, Debug)]
pub struct Handshake {
    group: Group,
    server_key: RsaPublicKey,
    timeout: Duration,
    client_version: u64,
}

impl Handshake {
    /// Creates a handshake that trusts the access point key.
    pub fn new(config: &Config) -> Result<Self> {
        let server_key = RsaPublicKey::new(
            BigUint::from_bytes_be(&SERVER_KEY),
            BigUint::from(SERVER_KEY_EXPONENT),
        )?;

        Ok(Self {
            group: config.dh_group,
            server_key,
            timeout: config.handshake_timeout,
            client_version: config.client_version,
        })
    }

    /// Trusts `server_key` instead of the access point key.
    #[must_use]
    pub fn with_server_key(mut self, server_key: RsaPublicKey) -> Self {
        self.server_key = server_key;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Connects to `address` and runs the handshake over the new connection.
    ///
    /// The TCP connect is bounded by the handshake timeout.
    pub async fn connect(&self, address: &str) -> Result<Connection<TcpStream>> {
        debug!("connecting to {address}");
        let stream = self
            .bounded("connect", TcpStream::connect(address))
            .await
            .map_err(|e| {
                if e.downcast::<ProtocolError>().is_some() {
                    e
                } else {
                    Error::unavailable(format!("{address}: {e}"))
                }
            })?;
        stream.set_nodelay(true)?;

        self.run(stream).await
    }

    /// Runs the handshake over an established stream.
    ///
    /// On error the stream is dropped, which closes it.
    pub async fn run<S>(&self, mut stream: S) -> Result<Connection<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let key_pair = KeyPair::generate(self.group, &mut OsRng);
        let mut nonce = [0; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let hello = client_hello(key_pair.public_key(), &nonce, self.client_version)?;
        trace!("ClientHello: {}", hex::encode(&hello));
        stream.write_all(&hello).await?;
        stream.flush().await?;
        debug!("sent ClientHello");

        let ap_response = self.read_ap_response(&mut stream).await?;
        let (gs, signature) = parse_ap_response(&ap_response[4..])?;

        self.verify(&gs, &signature)?;
        debug!("server key signature verified");

        let shared = key_pair.shared_secret(&gs)?;

        let mut transcript = hello;
        transcript.extend_from_slice(&ap_response);
        let keys = derive_keys(shared.as_bytes(), &transcript)?;
        drop(shared);

        let response = client_response(keys.challenge())?;
        stream.write_all(&response).await?;
        stream.flush().await?;
        debug!("sent ClientResponsePlaintext");

        let mut ack = [0; ACK_LEN];
        self.bounded("login acknowledgement", async {
            stream.read_exact(&mut ack).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    Error::from(ProtocolError::LoginRejected(
                        "connection closed before acknowledgement".to_string(),
                    ))
                } else {
                    e.into()
                }
            })
        })
        .await?;
        trace!("login acknowledgement: {}", hex::encode(&ack));

        if ack[4..7] != ACK_SUCCESS {
            return Err(ProtocolError::LoginRejected(format!(
                "unexpected acknowledgement {}",
                hex::encode(&ack)
            ))
            .into());
        }
        info!("logged in to access point");

        Ok(Connection {
            stream,
            send: SessionCipher::new(keys.send_key()),
            recv: SessionCipher::new(keys.recv_key()),
        })
    }

    /// Reads the `APResponseMessage` with its length prefix.
    ///
    /// The prefix counts itself. The prefix and the first bytes of the message
    /// are bounded by the handshake timeout. After that, reading goes on while
    /// the received length differs from the declared one and more bytes keep
    /// arriving within [`AP_RESPONSE_SETTLE`]. The access point sends nothing
    /// else before our `ClientResponsePlaintext`, so everything read here
    /// belongs to the message. A different length is logged and the message
    /// parsed regardless.
    async fn read_ap_response<S>(&self, stream: &mut S) -> Result<Vec<u8>>
    where
        S: AsyncRead + Unpin,
    {
        let mut chunk = [0; 4096];
        let (prefix, first) = self
            .bounded("APResponse", async {
                let mut prefix = [0; 4];
                stream.read_exact(&mut prefix).await?;
                let declared = u32::from_be_bytes(prefix) as usize;
                if declared > MAX_AP_RESPONSE_LEN {
                    return Err(Error::from(ProtocolError::PacketTooLarge {
                        what: "APResponseMessage",
                        len: declared,
                        max: MAX_AP_RESPONSE_LEN,
                    }));
                }
                let n = stream.read(&mut chunk).await?;
                Ok::<_, Error>((prefix, n))
            })
            .await?;

        let expected = (u32::from_be_bytes(prefix) as usize).saturating_sub(4);
        let mut buf = Vec::with_capacity(4 + expected.max(first));
        buf.extend_from_slice(&prefix);
        buf.extend_from_slice(&chunk[..first]);

        let settle = AP_RESPONSE_SETTLE.min(self.timeout);
        while first > 0 && buf.len() - 4 != expected {
            match tokio::time::timeout(settle, stream.read(&mut chunk)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(e.into()),
            }
            if buf.len() - 4 > MAX_AP_RESPONSE_LEN {
                return Err(ProtocolError::PacketTooLarge {
                    what: "APResponseMessage",
                    len: buf.len() - 4,
                    max: MAX_AP_RESPONSE_LEN,
                }
                .into());
            }
        }

        let actual = buf.len() - 4;
        if actual == 0 {
            return Err(ProtocolError::LoginRejected("empty APResponse".to_string()).into());
        }
        if actual != expected {
            warn!(
                "{}",
                ProtocolError::LengthMismatch {
                    declared: expected,
                    actual
                }
            );
        }
        trace!("APResponse: {}", hex::encode(&buf));

        Ok(buf)
    }

    fn verify(&self, gs: &[u8], signature: &[u8]) -> Result<()> {
        let hashed = Sha1::digest(gs);
        self.server_key
            .verify(Pkcs1v15Sign::new::<Sha1>(), &hashed, signature)
            .map_err(|_| ProtocolError::SignatureInvalid.into())
    }

    async fn bounded<F, T, E>(&self, operation: &'static str, future: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, E>>,
        E: Into<Error>,
    {
        match tokio::time::timeout(self.timeout, future).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(ProtocolError::Timeout {
                operation,
                timeout: self.timeout,
            }
            .into()),
        }
    }
}

/// Extracts the server public value and its signature.
fn parse_ap_response(payload: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let response = APResponseMessage::parse_from_bytes(payload)?;

    if let Some(failed) = response.login_failed.as_ref() {
        let code = failed.error_code.map_or_else(
            || "unknown error".to_string(),
            |code| format!("{:?}", code.enum_value_or_default()),
        );
        return Err(ProtocolError::LoginRejected(format!(
            "{code}{}",
            failed
                .error_description
                .as_ref()
                .map(|description| format!(": {description}"))
                .unwrap_or_default()
        ))
        .into());
    }

    if response.upgrade.is_some() {
        return Err(ProtocolError::LoginRejected("client upgrade required".to_string()).into());
    }

    let diffie_hellman = response
        .challenge
        .as_ref()
        .and_then(|challenge| challenge.login_crypto_challenge.as_ref())
        .and_then(|union| union.diffie_hellman.as_ref())
        .ok_or_else(|| Error::invalid_argument("APResponse lacks Diffie-Hellman challenge"))?;

    match (&diffie_hellman.gs, &diffie_hellman.gs_signature) {
        (Some(gs), Some(signature)) => Ok((gs.clone(), signature.clone())),
        _ => Err(Error::invalid_argument(
            "APResponse lacks server public value or signature",
        )),
    }
}


#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::{
        fake::{Fault, Outcome},
        *,
    };
    use crate::error::ErrorKind;

    fn config() -> Config {
        Config::with_access_point("ap.example.com")
    }

    #[test]
    fn client_hello_matches_fixture() {
        let key_pair = KeyPair::from_private(Group::Oakley768, &BigUint::from(16u32)).unwrap();
        let nonce: [u8; NONCE_LEN] = core::array::from_fn(|i| u8::try_from(i).unwrap());

        let hello = client_hello(key_pair.public_key(), &nonce, 124_200_290).unwrap();
        assert_eq!(
            hex::encode(hello),
            "00040000003d520e5000a00100f00101c002e2ca9c3bf0010092030a52085203010000a0010\
             1e20310000102030405060708090a0b0c0d0e0fb204011e"
        );
    }

    #[test]
    fn client_hello_matches_modp_2048_fixture() {
        let key_pair = KeyPair::from_private(Group::Modp2048, &BigUint::from(0x5eed_u32)).unwrap();
        let nonce: [u8; NONCE_LEN] = core::array::from_fn(|i| u8::try_from(i).unwrap());

        let hello = client_hello(key_pair.public_key(), &nonce, 124_200_290).unwrap();
        assert_eq!(key_pair.public_key().len(), 256);
        assert_eq!(hello.len(), 317);
        assert_eq!(
            hex::encode(hello),
            "00040000013d520e5000a00100f00101c002e2ca9c3bf001009203890252860252800292a566\
             e458d5a2b506193cb032aa0c37e437ddc9b214534c4fa278e91a5236bb5ff7b3373cae2c5f1a\
             ab24756034efdc42eef617a869f122ec70a2f5c470917de01b396ebfa6e74831b09e5621c370\
             b76c8354d6a877f284444f35e596567522efadbecc4711a4039663b3985b4342d65df91403f6\
             4c451542da4285da59bd0024d10ce578ccb8f304c4964095ce9be966b9981182fdaae96ccbec\
             79f2631656e8207b7429c0f60f5be1119722c140e648cb57529ad476cc8e2dc45e21831c5f49\
             e19fb7b25dcc3d1b75f41b4fb0c176916e3587e9215ac911779dde48b58ca814f49488714763\
             3fd39bd26c65ecf52539b82836c12d6105bbcb04f39918c4aaa00101e2031000010203040506\
             0708090a0b0c0d0e0fb204011e"
        );
    }

    #[test]
    fn key_derivation_is_deterministic() {
        let transcript = b"client-helloap-response";
        let keys = derive_keys(&[1, 2, 3, 4, 5], transcript).unwrap();
        let again = derive_keys(&[1, 2, 3, 4, 5], transcript).unwrap();

        assert_eq!(
            hex::encode(keys.challenge()),
            "f50d2a3c3860cec1f69547d153d61a862b17d580"
        );
        assert_eq!(
            hex::encode(keys.send_key()),
            "fa959f537b2e94e10e83ae501b9742baed8bf145decfd895f10a70cb78c25cea"
        );
        assert_eq!(
            hex::encode(keys.recv_key()),
            "fe52a0f9431380b1ce14799fea74186125f7af02bf3ef816dde10822df64df0d"
        );
        assert_eq!(keys.challenge(), again.challenge());
        assert_eq!(keys.send_key(), again.send_key());
        assert_eq!(keys.recv_key(), again.recv_key());
    }

    #[test]
    fn client_response_prefix_excludes_itself() {
        let response = client_response(&[0xab; 20]).unwrap();
        let len = u32::from_be_bytes([response[0], response[1], response[2], response[3]]);
        assert_eq!(len as usize, response.len() - 4);

        let parsed = ClientResponsePlaintext::parse_from_bytes(&response[4..]).unwrap();
        assert_eq!(
            parsed.login_crypto_response.diffie_hellman.hmac.as_deref(),
            Some(&[0xab; 20][..])
        );
        assert!(parsed.pow_response.is_some());
        assert!(parsed.crypto_response.is_some());
    }

    #[test]
    fn access_point_key_is_valid() {
        assert!(Handshake::new(&config()).is_ok());
    }

    #[tokio::test]
    async fn handshake_yields_matching_ciphers() {
        let (client, server) = duplex(8192);
        let server = tokio::spawn(fake::serve(server, Fault::None));

        let mut connection = fake::handshake(&config()).run(client).await.unwrap();
        let Outcome::LoggedIn(mut peer) = server.await.unwrap() else {
            panic!("fake access point did not log in");
        };

        let packet = connection.send.seal(0x4a, b"ping").unwrap();
        let body = &packet[3..packet.len() - 4];
        let tag = &packet[packet.len() - 4..];
        assert_eq!(peer.recv.open(0x4a, body, tag).unwrap(), b"ping");

        let packet = peer.send.seal(0x1b, b"pong").unwrap();
        let body = &packet[3..packet.len() - 4];
        let tag = &packet[packet.len() - 4..];
        assert_eq!(connection.recv.open(0x1b, body, tag).unwrap(), b"pong");

        drop(connection.stream);
        drop(peer.stream);
    }

    #[tokio::test]
    async fn corrupted_signature_aborts_before_response() {
        let (client, server) = duplex(8192);
        let server = tokio::spawn(fake::serve(server, Fault::CorruptSignature));

        let err = fake::handshake(&config()).run(client).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::PermissionDenied);
        assert_eq!(
            err.downcast::<ProtocolError>(),
            Some(&ProtocolError::SignatureInvalid)
        );

        let Outcome::Closed(rest) = server.await.unwrap() else {
            panic!("client sent a response after a bad signature");
        };
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let (client, server) = duplex(8192);
        let server = tokio::spawn(fake::serve(server, Fault::Silent));

        let handshake = fake::handshake(&config()).with_timeout(Duration::from_millis(50));
        let err = handshake.run(client).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeadlineExceeded);

        assert!(matches!(server.await.unwrap(), Outcome::Aborted));
    }

    #[tokio::test]
    async fn bad_ack_is_rejected() {
        let (client, server) = duplex(8192);
        let server = tokio::spawn(fake::serve(server, Fault::BadAck));

        let err = fake::handshake(&config()).run(client).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthenticated);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn login_failure_is_rejected() {
        let (client, server) = duplex(8192);
        let server = tokio::spawn(fake::serve(server, Fault::LoginFailed));

        let err = fake::handshake(&config()).run(client).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthenticated);
        assert!(err.to_string().contains("BadCredentials"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn length_mismatch_is_tolerated() {
        let (client, server) = duplex(8192);
        let server = tokio::spawn(fake::serve(server, Fault::ShortLengthPrefix));

        let connection = fake::handshake(&config()).run(client).await.unwrap();
        assert!(matches!(server.await.unwrap(), Outcome::LoggedIn(_)));
        drop(connection);
    }

    #[tokio::test]
    async fn long_length_prefix_is_tolerated() {
        let (client, server) = duplex(8192);
        let server = tokio::spawn(fake::serve(server, Fault::LongLengthPrefix));

        // The missing bytes never come: the read must settle well before the
        // handshake deadline.
        let handshake = fake::handshake(&config()).with_timeout(Duration::from_secs(2));
        let connection = handshake.run(client).await.unwrap();
        assert!(matches!(server.await.unwrap(), Outcome::LoggedIn(_)));
        drop(connection);
    }

    #[tokio::test]
    async fn late_bytes_past_declared_length_are_kept() {
        let (client, server) = duplex(8192);
        let server = tokio::spawn(fake::serve(server, Fault::ShortLengthPrefixSplit));

        // The fake access point checks the challenge against the transcript of
        // everything it sent, so a truncated APResponse fails the login.
        let connection = fake::handshake(&config()).run(client).await.unwrap();
        assert!(matches!(server.await.unwrap(), Outcome::LoggedIn(_)));
        drop(connection);
    }

    #[tokio::test]
    async fn oversized_ap_response_is_refused() {
        let (mut client, mut server) = duplex(8192);
        server
            .write_all(&u32::try_from(MAX_AP_RESPONSE_LEN + 5).unwrap().to_be_bytes())
            .await
            .unwrap();

        let err = fake::handshake(&config())
            .read_ap_response(&mut client)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast::<ProtocolError>(),
            Some(ProtocolError::PacketTooLarge { .. })
        ));
    }
}
