//! NRPE TCP server.
//!
//! One accept loop, one task per accepted connection. A connection carries
//! exactly one exchange: read and validate a query packet, dispatch the
//! command to the callback, write a reply of the same protocol version,
//! close. Any error terminates the connection; nothing is retried on it.
//!
//! Cancellation stops the accept loop; a close barrier then waits for every
//! in-flight handler before `run` returns.

use super::packet::{self, HEADER_LEN, Packet, QUERY_PACKET, RESPONSE_PACKET};
use crate::net::bind_listener;
use crate::telemetry::log;
use crate::{BootstrapResult, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

// Absolute deadline for one request/reply exchange.
const CONNECTION_DEADLINE: Duration = Duration::from_secs(10);

/// Command dispatch callback: maps a command string to a reply and a
/// plugin result code. Invoked from the connection handler task; must not
/// block indefinitely.
pub type CommandCallback = Arc<dyn Fn(&str) -> (String, i16) + Send + Sync>;

/// The NRPE server.
pub struct NrpeServer {
    listener: TcpListener,
    callback: CommandCallback,
}

impl NrpeServer {
    /// Binds the listener.
    pub fn bind(addr: SocketAddr, callback: CommandCallback) -> BootstrapResult<Self> {
        Ok(Self {
            listener: bind_listener(addr)?,
            callback,
        })
    }

    /// The bound address, useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr().unwrap()
    }

    /// Serves connections until cancellation, then waits for in-flight
    /// handlers.
    pub async fn run(self, token: CancellationToken) {
        let (close_tx, close_rx) = watch::channel(());

        loop {
            let (stream, peer) = tokio::select! {
                conn = self.listener.accept() => match conn {
                    Ok(conn) => conn,
                    Err(e) => {
                        log::warn!("failed to accept NRPE connection"; "error" => %e);

                        continue;
                    }
                },
                _ = token.cancelled() => break,
            };

            let callback = Arc::clone(&self.callback);
            let close_rx = close_rx.clone();

            tokio::spawn(async move {
                let exchange = tokio::time::timeout(
                    CONNECTION_DEADLINE,
                    handle_connection(stream, callback),
                );

                match exchange.await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        log::debug!("NRPE exchange failed"; "peer" => %peer, "error" => %err);
                    }
                    Err(_) => {
                        log::debug!("NRPE exchange timed out"; "peer" => %peer);
                    }
                }

                drop(close_rx);
            });
        }

        drop(close_rx);

        close_tx.closed().await;
    }
}

async fn handle_connection(mut stream: TcpStream, callback: CommandCallback) -> Result<()> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await?;

    let body_len = packet::body_len(&header)?;

    let mut bytes = vec![0u8; HEADER_LEN + body_len];
    bytes[..HEADER_LEN].copy_from_slice(&header);
    stream.read_exact(&mut bytes[HEADER_LEN..]).await?;

    let request = packet::decode(&bytes)?;

    if request.packet_type != QUERY_PACKET {
        return Err(format!("unexpected packet type {}", request.packet_type).into());
    }

    let (reply, result_code) = (callback)(&request.buffer);

    let response = Packet {
        version: request.version,
        packet_type: RESPONSE_PACKET,
        result_code,
        buffer: reply,
    };

    stream.write_all(&packet::encode(&response)).await?;
    stream.shutdown().await?;

    Ok(())
}
