//! Echo protocol handler for the Tokio runtime.

use bytes::BytesMut;
use chrono::Local;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use super::parser::{self, Command};

/// Maximum number of bytes taken from the socket per read.
pub const READ_BUFFER_SIZE: usize = 4096;

/// Handle an echo protocol connection until the peer goes away.
///
/// A zero-byte read or a read error is the only way out; the stream is
/// closed exactly once on return. Write failures are logged and left for
/// the next read to discover.
pub async fn handle_connection<S>(mut stream: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    let mut reply = BytesMut::with_capacity(READ_BUFFER_SIZE + 32);

    loop {
        let n = match stream.read(&mut buffer).await {
            Ok(0) => {
                trace!(peer = %peer, "Connection closed by client");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                debug!(peer = %peer, error = %e, "Read failed, closing connection");
                break;
            }
        };

        let data = &buffer[..n];
        trace!(peer = %peer, bytes = n, data = ?data, "Read");

        match parser::parse(data) {
            Command::KeepAlive => {}
            Command::Echo(payload) => {
                reply.clear();
                parser::write_reply(&Local::now(), payload, &mut reply);
                if let Err(e) = stream.write_all(&reply).await {
                    debug!(peer = %peer, error = %e, "Write failed");
                }
            }
        }
    }

    let _ = stream.shutdown().await;
    debug!(peer = %peer, "Connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncBufReadExt, BufReader};

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    async fn read_line<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        line
    }

    #[tokio::test]
    async fn test_echo_reply() {
        let (client, server) = duplex(READ_BUFFER_SIZE * 2);
        let handler = tokio::spawn(handle_connection(server, peer()));
        let (reader, mut writer) = tokio::io::split(client);
        let mut reader = BufReader::new(reader);

        writer.write_all(b"hello").await.unwrap();
        let first = read_line(&mut reader).await;
        let (stamp1, rest) = first.split_once(": ").unwrap();
        assert_eq!(rest, "hello\r\n");
        assert_eq!(stamp1.len(), "00:00:00.000000".len());

        writer.write_all(b"world").await.unwrap();
        let second = read_line(&mut reader).await;
        let (stamp2, rest) = second.split_once(": ").unwrap();
        assert_eq!(rest, "world\r\n");
        assert!(stamp2 >= stamp1);

        writer.shutdown().await.unwrap();
        handler.await.unwrap();
        assert!(read_line(&mut reader).await.is_empty());
    }

    #[tokio::test]
    async fn test_keep_alive_gets_no_reply() {
        let (client, server) = duplex(READ_BUFFER_SIZE * 2);
        let handler = tokio::spawn(handle_connection(server, peer()));
        let (reader, mut writer) = tokio::io::split(client);
        let mut reader = BufReader::new(reader);

        writer.write_all(b"\r\n").await.unwrap();
        let mut pending = String::new();
        let silent =
            tokio::time::timeout(Duration::from_millis(50), reader.read_line(&mut pending)).await;
        assert!(silent.is_err(), "unexpected reply {pending:?}");
        assert!(!handler.is_finished());

        writer.write_all(b"still here").await.unwrap();
        let line = read_line(&mut reader).await;
        assert!(line.ends_with(": still here\r\n"), "got {line:?}");

        writer.shutdown().await.unwrap();
        handler.await.unwrap();
    }

    #[tokio::test]
    async fn test_mock_keep_alive_then_eof() {
        // The mock panics on any write it was not told to expect.
        let stream = tokio_test::io::Builder::new().read(b"\r\n").read(b"\r\n").build();
        handle_connection(stream, peer()).await;
    }

    #[tokio::test]
    async fn test_read_error_closes_without_writing() {
        let stream = tokio_test::io::Builder::new()
            .read(b"\r\n")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        handle_connection(stream, peer()).await;
    }

    #[tokio::test]
    async fn test_large_payload_is_split_per_read() {
        let (client, server) = duplex(READ_BUFFER_SIZE * 4);
        let (reader, mut writer) = tokio::io::split(client);
        let payload = vec![b'a'; READ_BUFFER_SIZE + 10];
        writer.write_all(&payload).await.unwrap();
        writer.shutdown().await.unwrap();

        handle_connection(server, peer()).await;

        let mut echoed = Vec::new();
        let mut reader = BufReader::new(reader);
        let mut total = 0;
        loop {
            let line = read_line(&mut reader).await;
            if line.is_empty() {
                break;
            }
            let (_, rest) = line.split_once(": ").unwrap();
            let body = rest.strip_suffix("\r\n").unwrap();
            assert!(body.len() <= READ_BUFFER_SIZE);
            total += body.len();
            echoed.push(line);
        }
        assert_eq!(total, payload.len());
        assert!(echoed.len() >= 2);
    }
}
