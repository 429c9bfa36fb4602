//! Connection parameters and device identity.
//!
//! [`Config::with_access_point`] fills in everything needed to open a
//! session with sensible defaults. Fields are public so that callers can
//! adjust them before starting the session:
//!
//! ```rust
//! use std::time::Duration;
//! use apconnect::config::Config;
//!
//! let mut config = Config::with_access_point("ap-gew4.spotify.com");
//! config.device_name = "Living Room".to_string();
//! config.idle_timeout = Some(Duration::from_secs(600));
//! ```

use std::time::Duration;

use uuid::Uuid;

use crate::protocol::dh::Group;

/// Default access point port.
pub const DEFAULT_PORT: u16 = 4070;

/// Build version announced in the `ClientHello` and Mercury headers.
pub const CLIENT_VERSION: u64 = 124_200_290;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub app_name: String,
    pub app_version: String,

    /// Access point host name, resolved by the caller's resolver.
    pub access_point: String,
    pub port: u16,

    /// Bound on the TCP connect and on every handshake read.
    pub handshake_timeout: Duration,

    /// Interval between heartbeat probes.
    pub heartbeat_interval: Duration,

    /// Longest silence from the access point before the session ends.
    ///
    /// `None` waits forever.
    pub idle_timeout: Option<Duration>,

    pub dh_group: Group,
    pub client_version: u64,

    pub device_name: String,

    /// Random per process. Reconnects of the same process keep it.
    pub device_id: Uuid,
    pub device_brand: String,
    pub device_model: String,
    pub platform: String,
    pub volume: u32,

    pub user_agent: String,
}

impl Config {
    /// Default handshake timeout.
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Default heartbeat interval.
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

    /// Default idle timeout: a few missed heartbeats of the access point.
    pub const IDLE_TIMEOUT: Duration = Duration::from_secs(4 * 60);

    #[must_use]
    pub fn with_access_point(access_point: impl Into<String>) -> Self {
        let app_name = env!("CARGO_PKG_NAME").to_owned();
        let app_version = env!("CARGO_PKG_VERSION").to_owned();

        let device_id = Uuid::new_v4();
        trace!("device id: {device_id}");

        let os_name = match std::env::consts::OS {
            "macos" => "osx",
            other => other,
        };
        let os_version = sysinfo::System::os_version().unwrap_or_else(|| String::from("0"));

        let user_agent = format!("{app_name}/{app_version} (Rust; {os_name}/{os_version})");
        trace!("user agent: {user_agent}");

        Self {
            access_point: access_point.into(),
            port: DEFAULT_PORT,

            handshake_timeout: Self::HANDSHAKE_TIMEOUT,
            heartbeat_interval: Self::HEARTBEAT_INTERVAL,
            idle_timeout: Some(Self::IDLE_TIMEOUT),

            dh_group: Group::default(),
            client_version: CLIENT_VERSION,

            device_name: app_name.clone(),
            device_id,
            device_brand: app_name.clone(),
            device_model: String::from("headless"),
            platform: os_name.to_owned(),
            volume: 100,

            user_agent,

            app_name,
            app_version,
        }
    }

    /// Returns `host:port` of the access point.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.access_point, self.port)
    }
}
