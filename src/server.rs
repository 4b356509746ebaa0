//! TCP accept loop.
//!
//! Owns the listening socket, blocks on accept and forwards every accepted
//! connection to the active dispatch strategy without waiting for it to be
//! handled. A failing accept is the only fatal condition.

use crate::config::Config;
use crate::dispatch::{Dispatch, DispatchError};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Pending connection backlog for the listener.
const LISTEN_BACKLOG: i32 = 1024;

/// Server instance
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    dispatcher: Box<dyn Dispatch<TcpStream>>,
    read_timeout: Option<Duration>,
    stop: Arc<AtomicBool>,
}

impl Server {
    /// Bind the configured address and wire in a dispatch strategy.
    pub fn bind(
        config: &Config,
        dispatcher: Box<dyn Dispatch<TcpStream>>,
    ) -> Result<Self, ServerError> {
        let listen = config.listen_addr();
        let addr = resolve(&listen).map_err(|e| ServerError::Bind(listen.clone(), e))?;
        let listener = create_listener(addr).map_err(|e| ServerError::Bind(listen.clone(), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Bind(listen, e))?;

        info!(address = %local_addr, strategy = dispatcher.name(), "Server listening");

        Ok(Self {
            listener,
            local_addr,
            dispatcher,
            read_timeout: config.read_timeout,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle that can stop the accept loop from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop: Arc::clone(&self.stop),
            wake_addr: wake_addr(self.local_addr),
        }
    }

    /// Accept connections until the listener fails or shutdown is requested.
    ///
    /// Dropping the server afterwards drops the strategy, which for the
    /// pooled strategy drains queued work.
    pub fn run(self) -> Result<(), ServerError> {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if is_transient(&e) => {
                    warn!(error = %e, "Transient accept failure");
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    return Err(ServerError::Accept(e));
                }
            };

            if self.stop.load(Ordering::SeqCst) {
                debug!(peer = %peer, "Shutdown requested, no longer accepting");
                break;
            }

            debug!(peer = %peer, "Accepted connection");

            if let Some(timeout) = self.read_timeout {
                if let Err(e) = stream.set_read_timeout(Some(timeout)) {
                    warn!(peer = %peer, error = %e, "Failed to set read timeout");
                }
            }

            match self.dispatcher.submit(stream) {
                Ok(()) => debug!(
                    peer = %peer,
                    in_flight = self.dispatcher.in_flight(),
                    queued = self.dispatcher.queued(),
                    "Dispatched connection"
                ),
                Err(e) => log_dispatch_failure(peer, &e),
            }
        }

        info!(address = %self.local_addr, "Server stopped");
        Ok(())
    }
}

fn log_dispatch_failure(peer: SocketAddr, e: &DispatchError) {
    match e {
        DispatchError::QueueFull => warn!(peer = %peer, "Queue full, connection rejected"),
        _ => error!(peer = %peer, error = %e, "Failed to dispatch connection"),
    }
}

/// Stops a running accept loop.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
    wake_addr: SocketAddr,
}

impl ShutdownHandle {
    /// Request shutdown and wake the blocked accept.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = TcpStream::connect(self.wake_addr) {
            warn!(error = %e, "Failed to wake accept loop");
        }
    }
}

/// Errors that end the accept loop.
#[derive(Debug)]
pub enum ServerError {
    Bind(String, io::Error),
    Accept(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Bind(addr, e) => write!(f, "Failed to bind '{addr}': {e}"),
            ServerError::Accept(e) => write!(f, "Failed to accept connection: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind(_, e) | ServerError::Accept(e) => Some(e),
        }
    }
}

/// Accept errors caused by a single connection rather than the listener.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::Interrupted
    )
}

fn resolve(listen: &str) -> io::Result<SocketAddr> {
    listen.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing")
    })
}

/// Loopback address that reaches a listener bound to `addr`.
fn wake_addr(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}

/// Create a blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
