//! Headless session with a streaming service access point.
//!
//! The crate opens one long-lived TCP connection to an access point, runs
//! the Diffie-Hellman key exchange, switches to the session cipher and then
//! announces a virtual playback device over the encrypted channel.
//!
//! * [`protocol`] - wire formats: key exchange, session cipher, packet
//!   framing, Mercury requests and device announcements
//! * [`session`] - the session loop that ties these together and keeps the
//!   connection alive
//! * [`token`] - interface to the external bearer token provider
//! * [`config`] - connection parameters and device identity
//! * [`error`] - error kinds shared by all modules
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod token;
