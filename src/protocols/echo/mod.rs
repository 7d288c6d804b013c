//! Timestamped echo protocol.
//!
//! Every read is answered with one line carrying the local time of the
//! reply and the raw bytes received:
//!
//! ## Protocol Format
//!
//! ```text
//! Request:  hello
//! Response: 14:03:27.120345: hello\r\n
//!
//! Request:  \r\n
//! Response: (nothing, treated as a keep-alive)
//! ```
//!
//! There is no framing. A "request" is whatever a single read returns, up
//! to [`handler::READ_BUFFER_SIZE`] bytes, so a large write by the client may be
//! echoed back as several lines.
//!
//! The connection ends when the client closes its side or a read fails.
//! There is no idle timeout.

pub mod handler;
pub mod parser;

pub use handler::handle_connection;
