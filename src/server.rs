//! TCP server for the echo service.
//!
//! The accept loop owns the listener and funnels accepted connections into
//! a bounded queue. The control loop drains that queue, spawning one echo
//! handler per connection, until a stop signal arrives. Handlers are
//! fire-and-forget: stopping closes the listener but does not wait for
//! in-flight connections.

use crate::config::ServerConfig;
use crate::protocols::echo;
use crate::shutdown::{self, StopChannel, StopReason};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, trace, warn};

/// Listen backlog handed to the OS.
const LISTEN_BACKLOG: i32 = 1024;

/// First delay after a failed accept.
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);

/// Longest delay between accept retries.
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// An accepted client connection.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
}

/// A bound echo server, ready to run.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ServerConfig,
}

impl Server {
    /// Resolve the configured address and bind the listener.
    ///
    /// Fails immediately if the port is unavailable.
    pub async fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        let addr = tokio::net::lookup_host(&config.listen)
            .await
            .map_err(|e| ServerError::Resolve(config.listen.clone(), e))?
            .next()
            .ok_or_else(|| {
                ServerError::Resolve(
                    config.listen.clone(),
                    io::Error::new(io::ErrorKind::NotFound, "no address found"),
                )
            })?;

        let listener = create_listener(addr)
            .and_then(TcpListener::from_std)
            .map_err(|e| ServerError::Bind(addr, e))?;
        let local_addr = listener.local_addr().map_err(|e| ServerError::Bind(addr, e))?;

        Ok(Server {
            listener,
            local_addr,
            config: config.clone(),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve connections until a stop signal arrives.
    ///
    /// On return the listener is closed; new connection attempts are
    /// refused. Connections already handed to a handler keep running.
    pub async fn run(self, stop: StopChannel) -> Result<StopReason, ServerError> {
        let Server {
            listener,
            local_addr,
            config,
        } = self;

        let (handle, mut stop_rx) = stop.into_parts();
        let signals = config
            .watch_signals
            .then(|| shutdown::forward_os_signals(handle.clone()));
        drop(handle);

        let (queue_tx, mut queue) = mpsc::channel(config.queue_capacity);
        let (close_tx, close_rx) = oneshot::channel();
        let acceptor = tokio::spawn(accept_loop(listener, queue_tx, close_rx));

        let limit = config
            .max_connections
            .map(|max| Arc::new(Semaphore::new(max)));

        info!(
            address = %local_addr,
            queue_capacity = config.queue_capacity,
            max_connections = ?config.max_connections,
            "Server listening"
        );

        let outcome = loop {
            tokio::select! {
                biased;

                Some(signal) = stop_rx.recv() => {
                    break Ok(StopReason::from(signal));
                }

                next = next_connection(&mut queue, limit.as_ref()) => match next {
                    Some((conn, permit)) => {
                        debug!(peer = %conn.peer, "New connection");
                        tokio::spawn(async move {
                            echo::handle_connection(conn.stream, conn.peer).await;
                            drop(permit);
                        });
                    }
                    None => break Err(ServerError::AcceptLoopExited),
                },
            }
        };

        info!(address = %local_addr, "Stopping listening");
        let _ = close_tx.send(());
        drop(queue);
        if let Err(e) = acceptor.await {
            warn!(error = %e, "Accept loop panicked");
        }
        if let Some(signals) = signals {
            signals.abort();
        }

        outcome
    }
}

/// Wait for a free handler slot (if capped), then for the next connection.
async fn next_connection(
    queue: &mut mpsc::Receiver<Connection>,
    limit: Option<&Arc<Semaphore>>,
) -> Option<(Connection, Option<OwnedSemaphorePermit>)> {
    let permit = match limit {
        Some(limit) => Some(Arc::clone(limit).acquire_owned().await.ok()?),
        None => None,
    };
    queue.recv().await.map(|conn| (conn, permit))
}

/// Accept connections and push them into the queue until closed.
///
/// Accept errors are retried with a bounded backoff. The loop ends when
/// `close` fires or the consumer is gone, dropping the listener.
async fn accept_loop(
    listener: TcpListener,
    queue: mpsc::Sender<Connection>,
    mut close: oneshot::Receiver<()>,
) {
    let mut backoff = AcceptBackoff::default();

    loop {
        let accepted = tokio::select! {
            _ = &mut close => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                backoff.reset();
                trace!(peer = %peer, "Accepted");
                // Full queue: hold this connection until there is room.
                tokio::select! {
                    _ = &mut close => break,
                    sent = queue.send(Connection { stream, peer }) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Failed to accept connection");
                tokio::select! {
                    _ = &mut close => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    drop(listener);
    debug!("Listener closed");
}

/// Exponential backoff between failed accepts.
#[derive(Debug, Default)]
struct AcceptBackoff {
    current: Option<Duration>,
}

impl AcceptBackoff {
    fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => ACCEPT_BACKOFF_MIN,
            Some(current) => (current * 2).min(ACCEPT_BACKOFF_MAX),
        };
        self.current = Some(next);
        next
    }

    fn reset(&mut self) {
        self.current = None;
    }
}

/// Create a non-blocking TCP listener.
///
/// `SO_REUSEADDR` is only set on Unix: on Windows it would let a second
/// process bind a port that is already in use.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

/// Server errors
#[derive(Debug)]
pub enum ServerError {
    /// The listen address could not be resolved.
    Resolve(String, io::Error),
    /// The listener could not be bound.
    Bind(SocketAddr, io::Error),
    /// The accept loop ended while the server was still running.
    AcceptLoopExited,
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Resolve(addr, e) => {
                write!(f, "Failed to resolve listen address '{addr}': {e}")
            }
            ServerError::Bind(addr, e) => {
                write!(f, "Failed to bind {addr} (possibly a problem with the port binding): {e}")
            }
            ServerError::AcceptLoopExited => write!(f, "Accept loop exited unexpectedly"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Resolve(_, e) | ServerError::Bind(_, e) => Some(e),
            ServerError::AcceptLoopExited => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::StopSignal;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn test_config() -> ServerConfig {
        ServerConfig {
            listen: "127.0.0.1:0".to_string(),
            queue_capacity: 100,
            max_connections: None,
            watch_signals: false,
        }
    }

    async fn echo_once(stream: &mut BufReader<TcpStream>, payload: &str) -> String {
        stream.get_mut().write_all(payload.as_bytes()).await.unwrap();
        let mut line = String::new();
        stream.read_line(&mut line).await.unwrap();
        line
    }

    #[tokio::test]
    async fn test_bind_error_when_port_taken() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = ServerConfig {
            listen: taken.local_addr().unwrap().to_string(),
            ..test_config()
        };

        match Server::bind(&config).await {
            Err(ServerError::Bind(addr, _)) => assert_eq!(addr, taken.local_addr().unwrap()),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("bind should fail"),
        }
    }

    #[tokio::test]
    async fn test_serve_then_stop() {
        let server = Server::bind(&test_config()).await.unwrap();
        let addr = server.local_addr();
        let stop = StopChannel::new();
        let handle = stop.handle();
        let running = tokio::spawn(server.run(stop));

        let mut client = BufReader::new(TcpStream::connect(addr).await.unwrap());
        let line = echo_once(&mut client, "hello").await;
        assert!(line.ends_with(": hello\r\n"), "got {line:?}");

        assert!(handle.stop(StopSignal::Requested));
        let reason = running.await.unwrap().unwrap();
        assert_eq!(reason, StopReason::Requested);

        assert!(TcpStream::connect(addr).await.is_err());

        // The handler outlives the control loop.
        let line = echo_once(&mut client, "after").await;
        assert!(line.ends_with(": after\r\n"), "got {line:?}");
    }

    #[tokio::test]
    async fn test_stop_reason_follows_signal() {
        for (signal, reason) in [
            (StopSignal::Interrupt, StopReason::Interrupted),
            (StopSignal::Terminate, StopReason::Killed),
        ] {
            let server = Server::bind(&test_config()).await.unwrap();
            let stop = StopChannel::new();
            stop.handle().stop(signal);
            assert_eq!(server.run(stop).await.unwrap(), reason);
        }
    }

    #[tokio::test]
    async fn test_no_connection_lost_under_backpressure() {
        let config = ServerConfig {
            queue_capacity: 1,
            ..test_config()
        };
        let server = Server::bind(&config).await.unwrap();
        let addr = server.local_addr();
        let stop = StopChannel::new();
        let handle = stop.handle();
        let running = tokio::spawn(server.run(stop));

        let clients: Vec<_> = (0..32)
            .map(|i| {
                tokio::spawn(async move {
                    let mut client = BufReader::new(TcpStream::connect(addr).await.unwrap());
                    echo_once(&mut client, &format!("client-{i}")).await
                })
            })
            .collect();

        for (i, client) in clients.into_iter().enumerate() {
            let line = client.await.unwrap();
            assert!(line.ends_with(&format!(": client-{i}\r\n")), "got {line:?}");
        }

        handle.stop(StopSignal::Requested);
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connection_cap_holds_back_handlers() {
        let config = ServerConfig {
            max_connections: Some(1),
            ..test_config()
        };
        let server = Server::bind(&config).await.unwrap();
        let addr = server.local_addr();
        let stop = StopChannel::new();
        let handle = stop.handle();
        let running = tokio::spawn(server.run(stop));

        let mut first = BufReader::new(TcpStream::connect(addr).await.unwrap());
        let line = echo_once(&mut first, "one").await;
        assert!(line.ends_with(": one\r\n"));

        let mut second = BufReader::new(TcpStream::connect(addr).await.unwrap());
        second.get_mut().write_all(b"two").await.unwrap();
        let mut line = String::new();
        let waited =
            tokio::time::timeout(Duration::from_millis(100), second.read_line(&mut line)).await;
        assert!(waited.is_err(), "second connection served early: {line:?}");

        drop(first);
        let mut line = String::new();
        second.read_line(&mut line).await.unwrap();
        assert!(line.ends_with(": two\r\n"), "got {line:?}");

        handle.stop(StopSignal::Requested);
        running.await.unwrap().unwrap();
    }

    #[test]
    fn test_accept_backoff_is_bounded() {
        let mut backoff = AcceptBackoff::default();
        assert_eq!(backoff.next_delay(), ACCEPT_BACKOFF_MIN);
        assert_eq!(backoff.next_delay(), ACCEPT_BACKOFF_MIN * 2);

        let mut last = Duration::ZERO;
        for _ in 0..32 {
            last = backoff.next_delay();
            assert!(last <= ACCEPT_BACKOFF_MAX);
        }
        assert_eq!(last, ACCEPT_BACKOFF_MAX);

        backoff.reset();
        assert_eq!(backoff.next_delay(), ACCEPT_BACKOFF_MIN);
    }
}
