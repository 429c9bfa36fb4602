//! Mercury requests and connect-state control frames.
//!
//! Mercury addresses resources by `hm://` URI. A request is sent as a
//! [`Command::Mercury`](super::codec::Command::Mercury) packet whose payload
//! is:
//!
//! ```text
//! +------------------+-------------+-----------------------------+
//! | header len (u16) | Header      | MercuryMultiGetRequest      |
//! +------------------+-------------+-----------------------------+
//! ```
//!
//! Replies use the same layout with the body in place of the multi-get
//! request.
//!
//! Control frames subscribe to and update connect-state resources:
//!
//! ```text
//! +---------------+-----+-------------+--------------+----------------------------+
//! | uri len (u16) | uri | flags (u16) | count (u16)  | count x (len (u16), bytes) |
//! +---------------+-----+-------------+--------------+----------------------------+
//! ```

use std::fmt;

use protobuf::Message;

use super::{
    protos::mercury::{
        Header, MercuryMultiGetReply, MercuryMultiGetRequest, MercuryReply, MercuryRequest,
        UserField,
    },
    put_u16_prefixed, take_u16, take_u16_prefixed,
};
use crate::{
    config::Config,
    error::{Error, Result},
    token::UserToken,
};

/// Identity of the logged in user, fetched to confirm the session.
pub const IDENTITY_URI: &str = "hm://identity/v3/me";

/// Content type of [`IDENTITY_URI`].
pub const IDENTITY_CONTENT_TYPE: &str = "application/vnd.spotify.identity+json";

/// Mercury request methods.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Method {
    Get,
    Send,
    Sub,
    Unsub,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Send => write!(f, "SEND"),
            Self::Sub => write!(f, "SUB"),
            Self::Unsub => write!(f, "UNSUB"),
        }
    }
}

/// A Mercury request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub content_type: String,
    /// Header fields in the order they are sent.
    pub user_fields: Vec<(String, Vec<u8>)>,
}

impl Request {
    #[must_use]
    pub fn new(method: Method, uri: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            content_type: content_type.into(),
            user_fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn get(uri: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self::new(Method::Get, uri, content_type)
    }

    /// Appends a header field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.user_fields.push((key.into(), value.into()));
        self
    }

    /// Adds the bearer token and client identification, in this order:
    /// `Authorization`, `X-Spotify-Client-Version`, `X-Spotify-Device` and
    /// `X-Spotify-User-Agent`.
    #[must_use]
    pub fn authenticated(self, token: &UserToken, config: &Config) -> Self {
        self.with_field("Authorization", token.bearer())
            .with_field("X-Spotify-Client-Version", config.client_version.to_string())
            .with_field("X-Spotify-Device", config.device_id.to_string())
            .with_field("X-Spotify-User-Agent", config.user_agent.clone())
    }

    /// Returns the request for the user identity.
    #[must_use]
    pub fn identity() -> Self {
        Self::get(IDENTITY_URI, IDENTITY_CONTENT_TYPE)
    }

    /// Encodes the packet payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut header = Header::new();
        header.uri = Some(self.uri.clone());
        header.content_type = Some(self.content_type.clone());
        header.method = Some(self.method.to_string());
        header.user_fields = self
            .user_fields
            .iter()
            .map(|(key, value)| {
                let mut field = UserField::new();
                field.key = Some(key.clone());
                field.value = Some(value.clone());
                field
            })
            .collect();

        let mut request = MercuryRequest::new();
        request.uri = Some(self.uri.clone());
        request.content_type = Some(self.content_type.clone());
        request.body = Some(Vec::new());
        request.etag = Some(Vec::new());

        let mut multi = MercuryMultiGetRequest::new();
        multi.request.push(request);

        let mut payload = Vec::new();
        put_u16_prefixed(&mut payload, "Mercury header", &header.write_to_bytes()?)?;
        multi.write_to_writer(&mut payload)?;
        Ok(payload)
    }
}

/// A Mercury reply.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub uri: String,
    pub content_type: Option<String>,
    pub status_code: Option<i32>,
    pub user_fields: Vec<(String, Vec<u8>)>,
    pub body: Vec<u8>,
}

impl Response {
    /// Decodes a packet payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut rest = payload;
        let header = take_u16_prefixed(&mut rest)
            .ok_or_else(|| Error::data_loss("Mercury payload shorter than its header"))?;
        let header = Header::parse_from_bytes(header)?;

        Ok(Self {
            uri: header.uri.clone().unwrap_or_default(),
            content_type: header.content_type.clone(),
            status_code: header.status_code,
            user_fields: header
                .user_fields
                .iter()
                .map(|field| {
                    (
                        field.key.clone().unwrap_or_default(),
                        field.value.clone().unwrap_or_default(),
                    )
                })
                .collect(),
            body: rest.to_vec(),
        })
    }

    /// Returns whether the status code is absent or in the 2xx range.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status_code.is_none_or(|code| (200..300).contains(&code))
    }

    /// Decodes the body as a multi-get reply.
    pub fn replies(&self) -> Result<Vec<MercuryReply>> {
        Ok(MercuryMultiGetReply::parse_from_bytes(&self.body)?.reply)
    }
}

/// A connect-state control frame.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ControlFrame {
    pub uri: String,
    pub flags: u16,
    pub parts: Vec<Vec<u8>>,
}

impl ControlFrame {
    pub const FLAGS_SUBSCRIBE: u16 = 0x0000;
    pub const FLAGS_PUT: u16 = 0x0003;

    /// Subscribes to `uri`. Carries a single empty part.
    #[must_use]
    pub fn subscribe(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            flags: Self::FLAGS_SUBSCRIBE,
            parts: vec![Vec::new()],
        }
    }

    /// Writes `message` to `uri`.
    pub fn put(uri: impl Into<String>, message: &impl Message) -> Result<Self> {
        Ok(Self {
            uri: uri.into(),
            flags: Self::FLAGS_PUT,
            parts: vec![message.write_to_bytes()?],
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let count = u16::try_from(self.parts.len())
            .map_err(|_| Error::out_of_range(format!("{} parts in control frame", self.parts.len())))?;

        let mut buf = Vec::new();
        put_u16_prefixed(&mut buf, "control frame uri", self.uri.as_bytes())?;
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&count.to_be_bytes());
        for part in &self.parts {
            put_u16_prefixed(&mut buf, "control frame part", part)?;
        }
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let truncated = || Error::data_loss("control frame truncated");

        let mut rest = bytes;
        let uri = take_u16_prefixed(&mut rest).ok_or_else(truncated)?;
        let uri = String::from_utf8(uri.to_vec())?;
        let flags = take_u16(&mut rest).ok_or_else(truncated)?;
        let count = take_u16(&mut rest).ok_or_else(truncated)?;

        let mut parts = Vec::with_capacity(count.into());
        for _ in 0..count {
            parts.push(take_u16_prefixed(&mut rest).ok_or_else(truncated)?.to_vec());
        }

        if !rest.is_empty() {
            debug!("{} trailing bytes after control frame {uri}", rest.len());
        }

        Ok(Self { uri, flags, parts })
    }
}
