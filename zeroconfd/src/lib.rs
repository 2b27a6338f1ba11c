//! Zero-configuration service discovery and publishing over mDNS/DNS-SD.

pub mod api;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod interfaces;
pub mod manager;
pub mod mdns;
pub mod reactor;
pub mod registry;
pub mod zeroconf;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Result, ZeroconfError};
pub use zeroconf::{BrowserId, Options, Zeroconf};
