//! Zabbix passive-check TCP server.
//!
//! Same lifecycle as the NRPE server: one accept loop, one task per
//! connection, a single request/reply exchange per connection with an
//! absolute deadline, and a close barrier on shutdown.

use super::packet::{self, HEADER_LEN};
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

const CONNECTION_DEADLINE: Duration = Duration::from_secs(10);

/// Key dispatch callback: maps a key and its arguments to the reply string.
pub type KeyCallback = Arc<dyn Fn(&str, &[String]) -> String + Send + Sync>;

/// The Zabbix server.
pub struct ZabbixServer {
    listener: TcpListener,
    callback: KeyCallback,
}

impl ZabbixServer {
    /// Binds the listener.
    pub fn bind(addr: SocketAddr, callback: KeyCallback) -> BootstrapResult<Self> {
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
                        log::warn!("failed to accept Zabbix connection"; "error" => %e);

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
                        log::debug!("Zabbix exchange failed"; "peer" => %peer, "error" => %err);
                    }
                    Err(_) => {
                        log::debug!("Zabbix exchange timed out"; "peer" => %peer);
                    }
                }

                drop(close_rx);
            });
        }

        drop(close_rx);

        close_tx.closed().await;
    }
}

async fn handle_connection(mut stream: TcpStream, callback: KeyCallback) -> Result<()> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await?;

    let (version, data_len) = packet::decode_header(&header)?;

    let mut payload = vec![0u8; data_len as usize];
    stream.read_exact(&mut payload).await?;

    let payload = String::from_utf8(payload).map_err(|_| packet::PacketError::Encoding)?;
    let (key, args) = packet::split_data(&payload)?;

    let reply = (callback)(&key, &args);

    stream.write_all(&packet::encode_reply(version, &reply)).await?;
    stream.shutdown().await?;

    Ok(())
}
