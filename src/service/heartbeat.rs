//! Periodic side effect driven by the state machine's tick.

use super::types::ServiceStatus;
use std::io::Write;
use tracing::debug;

/// Called on every heartbeat tick while the state machine is running.
pub trait Heartbeat: Send {
    fn beat(&mut self, status: ServiceStatus);
}

impl<F> Heartbeat for F
where
    F: FnMut(ServiceStatus) + Send,
{
    fn beat(&mut self, status: ServiceStatus) {
        self(status)
    }
}

/// Records each tick in the log only.
#[derive(Debug, Default)]
pub struct LogHeartbeat;

impl Heartbeat for LogHeartbeat {
    fn beat(&mut self, status: ServiceStatus) {
        debug!(status = ?status, "beep");
    }
}

/// Rings the terminal bell on stderr.
#[derive(Debug, Default)]
pub struct BellHeartbeat;

impl Heartbeat for BellHeartbeat {
    fn beat(&mut self, status: ServiceStatus) {
        debug!(status = ?status, "beep");
        let mut stderr = std::io::stderr();
        let _ = stderr.write_all(b"\x07").and_then(|()| stderr.flush());
    }
}
