//! Vendor uplink: HTTPS client, typed errors and the store-to-API
//! forwarding pipeline.

pub mod client;
pub mod error;
pub mod forwarder;

pub use client::{Client, RegisteredAgent};
pub use error::ApiError;
