//! Common types and utilities for the lumen consensus driver.
//!
//! This crate holds the pieces every other lumen crate leans on:
//!
//! - [`Hash256`], the content hash used for transaction sets, quorum sets and ledgers
//! - [`NetworkId`], which scopes envelope signatures to one network
//! - [`Config`], the TOML node configuration
//! - [`logging`], tracing subscriber setup with runtime level changes
//! - [`time`], wall-clock helpers for close times

pub mod config;
pub mod error;
pub mod logging;
pub mod network;
pub mod time;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use network::NetworkId;
pub use types::Hash256;

/// Re-export stellar-xdr for convenience
pub use stellar_xdr;
