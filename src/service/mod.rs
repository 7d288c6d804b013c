//! Service integration.
//!
//! - `types`: status and control vocabulary
//! - `machine`: the state machine that runs the echo server
//! - `heartbeat`: periodic side effect driven by the state machine
//! - `runner`: control sources (foreground runner, host dispatcher)
//! - `registry`: install/remove/start/stop against the host service manager
//! - `eventlog` (Windows): event source for start, stop and failure events

#[cfg(windows)]
mod dispatcher;
#[cfg(windows)]
mod eventlog;
pub mod heartbeat;
pub mod machine;
pub mod registry;
pub mod runner;
pub mod types;

pub use registry::local_registry;
pub use runner::{is_interactive_session, select_runner, DebugRunner, ServiceRunner};
