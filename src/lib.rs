//! signgate - transparent forwarding proxy that signs traffic to a fixed
//! upstream with HMAC envelope headers.
//!
//! This library provides the relay service, envelope signing, and logging
//! functionality for the signgate proxy daemon.
//!
//! # Request Path
//!
//! Every inbound request takes the same path:
//!
//! - **Translate:** rebuild the request against the configured upstream,
//!   keeping the method, path, query, headers, and streaming the body.
//! - **Sign:** inject `Third-Party-Timestamp`, `Third-Party-User-Id`, and
//!   `Third-Party-Signature` headers, skipping any the caller already set.
//! - **Dispatch:** send the signed request upstream and relay the response
//!   status and body back verbatim.
//!
//! # Sharing Model
//!
//! The signing identity and upstream address are loaded once at startup into
//! an immutable [`config::Settings`] snapshot and shared read-only across all
//! request tasks. No other state is shared between requests.

pub mod config;
pub mod error;
pub mod logging_layer;
pub mod relay;
pub mod server;
pub mod signer;
pub mod upstream;
