//! TCP listener for query connections.
//!
//! Binds the configured address, accepts connections, and spawns one task
//! per connection. A semaphore caps how many connections are served at once.

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::ServerError;
use crate::resolver::Resolver;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Largest usable `max_connections`: the semaphore's permit limit, and
/// `u32::MAX` so shutdown can wait on every permit at once.
pub const MAX_CONNECTIONS_LIMIT: usize = if Semaphore::MAX_PERMITS < u32::MAX as usize {
    Semaphore::MAX_PERMITS
} else {
    u32::MAX as usize
};

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Bound server, ready to accept connections.
pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    resolver: Arc<dyn Resolver>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Bind the listen address.
    ///
    /// Fails with [`ServerError::Bind`] if the address is invalid, in use, or
    /// not permitted, or if `max_connections` is outside
    /// `1..=MAX_CONNECTIONS_LIMIT`.
    pub async fn bind(config: ServerConfig, resolver: Arc<dyn Resolver>) -> Result<Self, ServerError> {
        let bind_error = |source: io::Error| ServerError::Bind {
            addr: config.listen.clone(),
            source,
        };

        if !(1..=MAX_CONNECTIONS_LIMIT).contains(&config.max_connections) {
            return Err(bind_error(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "max_connections must be between 1 and {}, got {}",
                    MAX_CONNECTIONS_LIMIT, config.max_connections
                ),
            )));
        }

        let addr: SocketAddr = config
            .listen
            .parse()
            .map_err(|e| bind_error(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        let std_listener = create_listener(addr, config.backlog).map_err(bind_error)?;
        let listener = TcpListener::from_std(std_listener).map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        info!(address = %local_addr, max_connections = config.max_connections, "Server listening");

        Ok(Server {
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            config,
            listener,
            local_addr,
            resolver,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// The listening socket is released as soon as `shutdown` fires.
    /// Connections already being served are left to finish on their own;
    /// this waits up to `drain_timeout` for them before returning.
    pub async fn run<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let Server {
            config,
            listener,
            resolver,
            connection_limit,
            ..
        } = self;
        tokio::pin!(shutdown);

        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = connection_limit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let accepted = tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Connection accepted");

                    let resolver = Arc::clone(&resolver);
                    let max_request_size = config.max_request_size;

                    tokio::spawn(async move {
                        let mut conn =
                            Connection::new(stream, peer, resolver).with_max_request_size(max_request_size);
                        if let Err(e) = conn.run().await {
                            warn!(%peer, error = %e, "Connection error");
                        }
                        drop(permit);
                    });
                }
                Err(e) => accept_failed(e).await,
            }
        }

        drop(listener);
        info!("Listener stopped, no longer accepting connections");

        drain(
            &connection_limit,
            config.max_connections,
            Duration::from_secs(config.drain_timeout_secs),
        )
        .await;
        Ok(())
    }
}

/// Log a failed accept and back off so a persistent error (e.g. EMFILE)
/// does not spin the loop.
async fn accept_failed(e: io::Error) {
    error!(error = %ServerError::Accept(e), "Accept failed");
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}

/// Wait for in-flight connections to release their permits.
async fn drain(limit: &Semaphore, max_connections: usize, timeout: Duration) {
    let in_flight = max_connections - limit.available_permits();
    if in_flight == 0 {
        return;
    }
    info!(in_flight, "Waiting for open connections to finish");

    // `bind` keeps max_connections within MAX_CONNECTIONS_LIMIT <= u32::MAX.
    let total = max_connections.min(MAX_CONNECTIONS_LIMIT) as u32;
    match tokio::time::timeout(timeout, limit.acquire_many(total)).await {
        Ok(_) => info!("All connections finished"),
        Err(_) => warn!(
            remaining = max_connections - limit.available_permits(),
            "Drain timeout elapsed with connections still open"
        ),
    }
}

/// Create a reusable-address TCP listener with the given backlog.
fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;

    Ok(socket.into())
}
