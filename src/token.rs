//! Bearer tokens for authenticated requests.
//!
//! Tokens are obtained from an external provider behind the
//! [`UserTokenProvider`] trait. The session asks for a token before every
//! handshake and flushes it when the access point rejects the login, so a
//! provider can refresh transparently.
//!
//! [`FileTokenProvider`] reads the token from a TOML secrets file:
//!
//! ```toml
//! token = "BQD...token..."
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
    time::SystemTime,
};

use async_trait::async_trait;
use serde::Deserialize;
use veil::Redact;

use crate::error::{Error, Result};

/// Bearer token with an optional expiry.
#[derive(Clone, PartialEq, Eq, Redact)]
pub struct UserToken {
    #[redact]
    token: String,
    expires_at: Option<SystemTime>,
}

impl UserToken {
    /// Creates a token.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `token` is empty or contains whitespace:
    /// it ends up in a header value.
    pub fn new(token: &str, expires_at: Option<SystemTime>) -> Result<Self> {
        if token.is_empty() {
            return Err(Error::invalid_argument("user token is empty"));
        }
        if token.contains(char::is_whitespace) {
            return Err(Error::invalid_argument("user token contains whitespace"));
        }

        Ok(Self {
            token: token.to_owned(),
            expires_at,
        })
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| SystemTime::now() >= expires_at)
    }

    /// Returns the `Authorization` header value.
    #[must_use]
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.token
    }
}

/// Source of bearer tokens.
#[async_trait]
pub trait UserTokenProvider: Send {
    /// Returns a currently valid token, refreshing it if needed.
    async fn user_token(&mut self) -> Result<UserToken>;

    /// Discards any cached token so that the next call fetches a new one.
    fn flush_user_token(&mut self);
}

/// Contents of the secrets file.
#[derive(Clone, Deserialize, Redact)]
#[redact(all)]
struct Secrets {
    token: String,
}

/// Reads the token from a TOML secrets file.
///
/// The file is read on first use and again after every flush.
#[derive(Debug)]
pub struct FileTokenProvider {
    path: PathBuf,
    cached: Option<UserToken>,
}

impl FileTokenProvider {
    /// Secrets files are small: refuse to read anything larger.
    const MAX_FILE_SIZE: u64 = 4096;

    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            cached: None,
        }
    }

    fn load(&self) -> Result<UserToken> {
        let size = fs::metadata(&self.path)?.len();
        if size > Self::MAX_FILE_SIZE {
            return Err(Error::out_of_range(format!(
                "{} is too large: {size} bytes",
                self.path.display()
            )));
        }

        let contents = fs::read_to_string(&self.path)?;
        let secrets: Secrets = toml::from_str(&contents)?;
        UserToken::new(secrets.token.trim(), None)
    }
}

#[async_trait]
impl UserTokenProvider for FileTokenProvider {
    async fn user_token(&mut self) -> Result<UserToken> {
        if let Some(token) = self.cached.as_ref().filter(|token| !token.is_expired()) {
            return Ok(token.clone());
        }

        debug!("loading user token from {}", self.path.display());
        let token = self.load()?;
        self.cached = Some(token.clone());
        Ok(token)
    }

    fn flush_user_token(&mut self) {
        self.cached = None;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::ErrorKind;

    fn secrets_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("apconnect-{}-{name}.toml", std::process::id()));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn token_is_redacted() {
        let token = UserToken::new("s3cr3t-value", None).unwrap();
        assert!(!format!("{token:?}").contains("s3cr3t"));
        assert_eq!(token.bearer(), "Bearer s3cr3t-value");
    }

    #[test]
    fn invalid_tokens_are_rejected() {
        assert!(UserToken::new("", None).is_err());
        assert!(UserToken::new("two words", None).is_err());
    }

    #[test]
    fn expiry() {
        let past = SystemTime::now() - Duration::from_secs(1);
        assert!(UserToken::new("abc", Some(past)).unwrap().is_expired());
        assert!(!UserToken::new("abc", None).unwrap().is_expired());
    }

    #[tokio::test]
    async fn file_provider_reloads_after_flush() {
        let path = secrets_file("reload", "token = \"first\"\n");
        let mut provider = FileTokenProvider::new(&path);
        assert_eq!(provider.user_token().await.unwrap().as_str(), "first");

        fs::write(&path, "token = \"second\"\n").unwrap();
        assert_eq!(provider.user_token().await.unwrap().as_str(), "first");

        provider.flush_user_token();
        assert_eq!(provider.user_token().await.unwrap().as_str(), "second");

        fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn file_provider_errors() {
        let mut provider = FileTokenProvider::new("/nonexistent/apconnect/secrets.toml");
        assert_eq!(
            provider.user_token().await.unwrap_err().kind,
            ErrorKind::NotFound
        );

        let path = secrets_file("malformed", "arl = 1\n");
        let mut provider = FileTokenProvider::new(&path);
        assert_eq!(
            provider.user_token().await.unwrap_err().kind,
            ErrorKind::InvalidArgument
        );
        fs::remove_file(path).unwrap();
    }
}
