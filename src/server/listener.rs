use socket2::{Domain, Socket, Type};
use std::io;
use std::net::SocketAddr;

fn bound_socket(addr: SocketAddr, shared: bool) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    #[cfg(unix)]
    {
        socket.set_reuse_address(true)?;
        socket.set_reuse_port(shared)?;
    }
    #[cfg(not(unix))]
    let _ = shared;
    socket.bind(&addr.into())?;
    Ok(socket)
}

fn into_listener(socket: Socket) -> io::Result<tokio::net::TcpListener> {
    socket.listen(1024)?;
    let listener: std::net::TcpListener = socket.into();
    listener.set_nonblocking(true)?;
    tokio::net::TcpListener::from_std(listener)
}

/// Bind a listener this process owns alone; fails with `AddrInUse` when
/// anything else already holds `addr`.
pub fn bind_exclusive(addr: SocketAddr) -> io::Result<tokio::net::TcpListener> {
    into_listener(bound_socket(addr, false)?)
}

/// Bind a listener that other processes can bind to as well.
///
/// Every worker binds the master's address this way and the kernel spreads
/// incoming connections across them.
pub fn bind_reuseport(addr: SocketAddr) -> io::Result<tokio::net::TcpListener> {
    into_listener(bound_socket(addr, true)?)
}

/// Claim `addr` without accepting connections, resolving port 0 to a real
/// port. Held by the master so workers agree on the port and it stays
/// reserved while they restart.
pub fn reserve_port(addr: SocketAddr) -> io::Result<(Socket, SocketAddr)> {
    let socket = bound_socket(addr, true)?;
    let local = socket
        .local_addr()?
        .as_socket()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not an inet address"))?;
    Ok((socket, local))
}
