//! HTTP API server.
//!
//! Plain hyper over a tokio listener: one connection task per client, a
//! graceful-shutdown signal propagated to in-flight connections, and a
//! close barrier so `run` only returns once every connection is done.

use super::graphql;
use super::router::Router;
use crate::net::bind_listener;
use crate::store::Store;
use crate::telemetry::log;
use crate::BootstrapResult;
use futures_util::future::FutureExt as _;
use futures_util::pin_mut;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// The agent HTTP API server.
pub struct ApiServer {
    listener: TcpListener,
    router: Router,
}

impl ApiServer {
    /// Binds the listener and prepares the routes.
    pub fn bind(addr: SocketAddr, store: Arc<Store>) -> BootstrapResult<Self> {
        let schema = graphql::build_schema(Arc::clone(&store));

        Ok(Self {
            listener: bind_listener(addr)?,
            router: Router::new(store, schema),
        })
    }

    /// The bound address, useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr().unwrap()
    }

    /// Serves connections until cancellation, then drains in-flight
    /// connections gracefully.
    pub async fn run(self, token: CancellationToken) {
        let (close_tx, close_rx) = watch::channel(());
        let listener = self.listener;

        loop {
            let socket = tokio::select! {
                conn = listener.accept() => match conn {
                    Ok((conn, _)) => TokioIo::new(conn),
                    Err(e) => {
                        log::warn!("failed to accept API connection"; "error" => %e);

                        continue;
                    }
                },
                _ = token.cancelled() => break,
            };

            let router = self.router.clone();
            let token = token.clone();
            let close_rx = close_rx.clone();

            tokio::spawn(async move {
                let conn = hyper::server::conn::http1::Builder::new()
                    .serve_connection(socket, router);

                let cancelled = token.cancelled().fuse();

                pin_mut!(conn);
                pin_mut!(cancelled);

                loop {
                    tokio::select! {
                        _ = conn.as_mut() => break,
                        _ = &mut cancelled => conn.as_mut().graceful_shutdown(),
                    }
                }

                drop(close_rx);
            });
        }

        drop(close_rx);

        close_tx.closed().await;
    }
}
