//! Echo protocol parser.

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, TimeZone};
use std::fmt::Display;

/// Keep-alive ping sent by clients; never answered.
pub const KEEP_ALIVE: &[u8] = b"\r\n";

/// `strftime` format of the reply timestamp: hour:minute:second.microseconds.
pub const TIMESTAMP_FORMAT: &str = "%H:%M:%S%.6f";

/// Parsed echo command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    /// The read was exactly CRLF.
    KeepAlive,
    /// Echo the payload back.
    Echo(&'a [u8]),
}

/// Classify the bytes returned by one read.
pub fn parse(input: &[u8]) -> Command<'_> {
    if input == KEEP_ALIVE {
        Command::KeepAlive
    } else {
        Command::Echo(input)
    }
}

/// Append `<timestamp>: <payload>\r\n` to `output`.
pub fn write_reply<Tz>(at: &DateTime<Tz>, payload: &[u8], output: &mut BytesMut)
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let stamp = at.format(TIMESTAMP_FORMAT).to_string();
    output.reserve(stamp.len() + payload.len() + 4);
    output.put_slice(stamp.as_bytes());
    output.put_slice(b": ");
    output.put_slice(payload);
    output.put_slice(b"\r\n");
}
