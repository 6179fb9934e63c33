//! Zabbix v1 passive-check support.

pub mod packet;
pub mod server;

pub use packet::{PacketError, split_data};
pub use server::{KeyCallback, ZabbixServer};

use std::sync::Arc;

/// Reply for keys the agent does not implement.
pub const NOT_SUPPORTED: &str = "ZBX_NOTSUPPORTED";

/// Builds the built-in key callback: `agent.ping` and `agent.version`.
pub fn key_registry(version: &str) -> KeyCallback {
    let version = version.to_owned();

    Arc::new(move |key: &str, _args: &[String]| match key {
        "agent.ping" => "1".to_owned(),
        "agent.version" => version.clone(),
        _ => NOT_SUPPORTED.to_owned(),
    })
}
