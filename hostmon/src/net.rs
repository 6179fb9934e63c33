//! Shared listener plumbing.

use crate::BootstrapResult;
use anyhow::Context as _;
use socket2::{Domain, SockAddr, Socket, Type};
use std::net::SocketAddr;
use tokio::net::TcpListener;

/// Binds a TCP listener with address reuse, ready for the tokio accept
/// loops.
pub(crate) fn bind_listener(addr: SocketAddr) -> BootstrapResult<TcpListener> {
    let std_listener = std::net::TcpListener::from(
        bind_socket(addr).with_context(|| format!("binding to socket {addr:?}"))?,
    );

    std_listener.set_nonblocking(true)?;

    Ok(TcpListener::from_std(std_listener)?)
}

fn bind_socket(addr: SocketAddr) -> BootstrapResult<Socket> {
    let socket = Socket::new(
        if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        },
        Type::STREAM,
        None,
    )?;

    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(1024)?;

    Ok(socket)
}
