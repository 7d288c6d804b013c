//! Protocol implementations.
//!
//! - `echo`: timestamped echo served on every accepted connection

pub mod echo;
