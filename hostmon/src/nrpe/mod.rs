//! NRPE v2/v3 check-protocol support.

pub mod packet;
pub mod server;

pub use packet::{Packet, PacketError, QUERY_PACKET, RESPONSE_PACKET};
pub use server::{CommandCallback, NrpeServer};

use std::collections::BTreeMap;
use std::sync::Arc;

/// Plugin result code for unknown commands.
pub const RESULT_UNKNOWN: i16 = 3;

/// Builds the command callback from the configured allow-list.
///
/// `_NRPE_CHECK` answers with the agent version banner; anything else
/// resolves through `commands` and falls back to UNKNOWN.
pub fn command_registry(commands: BTreeMap<String, String>, version: &str) -> CommandCallback {
    let banner = format!("hostmon v{version}");

    Arc::new(move |command: &str| {
        if command == "_NRPE_CHECK" {
            return (banner.clone(), 0);
        }

        match commands.get(command) {
            Some(reply) => (reply.clone(), 0),
            None => (format!("NRPE: Command '{command}' not defined"), RESULT_UNKNOWN),
        }
    })
}
