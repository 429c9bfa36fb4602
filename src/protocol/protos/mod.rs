//! Protocol Buffer definitions spoken with the access point.
//!
//! Generated at build time from the `.proto` files next to this module:
//!
//! * `keyexchange` - `ClientHello`, `APResponseMessage` and
//!   `ClientResponsePlaintext` used during the handshake
//! * `mercury` - request and reply headers of the Mercury protocol
//! * `spirc` - SPIRC frames (Hello, Probe) and device state
//! * `connect` - connect-state `PutStateRequest` and device descriptions
//!
//! All fields are declared `optional` in proto2 syntax. Fields serialize in
//! field number order, which keeps the encoding of a message deterministic.
//!
//! Note: The generated code allows pedantic lints to avoid
//! warnings from the auto-generated implementations.

// Allow pedantic lints in generated code
#![allow(clippy::pedantic)]

// Include the generated Rust code from Protocol Buffers
include!(concat!(env!("OUT_DIR"), "/protos/mod.rs"));
