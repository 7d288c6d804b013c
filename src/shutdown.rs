//! Stop signalling for the server control loop.
//!
//! OS interrupt/terminate signals and explicit stop requests from the
//! service state machine all arrive on one buffered channel, so a stop
//! raised while the control loop is busy is never lost.

use std::fmt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Capacity of the stop channel. One pending stop is all the loop needs.
const STOP_BUFFER: usize = 1;

/// Why the control loop was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// User interrupt (Ctrl-C / SIGINT).
    Interrupt,
    /// Termination request from the OS (SIGTERM, console close).
    Terminate,
    /// Explicit request from the service state machine.
    Requested,
}

/// Outcome reported by a control loop that stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Interrupted,
    Killed,
    Requested,
}

impl From<StopSignal> for StopReason {
    fn from(signal: StopSignal) -> Self {
        match signal {
            StopSignal::Interrupt => StopReason::Interrupted,
            StopSignal::Terminate => StopReason::Killed,
            StopSignal::Requested => StopReason::Requested,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Interrupted => write!(f, "interrupted by system signal"),
            StopReason::Killed => write!(f, "killed"),
            StopReason::Requested => write!(f, "stopped by service control"),
        }
    }
}

/// Sending side of the stop channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: mpsc::Sender<StopSignal>,
}

impl StopHandle {
    /// Ask the loop to stop.
    ///
    /// Returns `false` once the loop has already gone away. A full buffer
    /// means a stop is already pending, which counts as delivered.
    pub fn stop(&self, signal: StopSignal) -> bool {
        match self.tx.try_send(signal) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Both ends of a stop channel, handed to the control loop when it runs.
#[derive(Debug)]
pub struct StopChannel {
    handle: StopHandle,
    rx: mpsc::Receiver<StopSignal>,
}

impl StopChannel {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(STOP_BUFFER);
        Self {
            handle: StopHandle { tx },
            rx,
        }
    }

    /// A handle that can stop the loop this channel is given to.
    pub fn handle(&self) -> StopHandle {
        self.handle.clone()
    }

    pub(crate) fn into_parts(self) -> (StopHandle, mpsc::Receiver<StopSignal>) {
        (self.handle, self.rx)
    }
}

impl Default for StopChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Forward OS interrupt/terminate signals into the stop channel.
///
/// The returned task runs until the channel closes; abort it when the
/// loop it feeds has exited.
pub fn forward_os_signals(handle: StopHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match wait_for_os_signal().await {
                Ok(signal) => {
                    info!(signal = ?signal, "Got signal");
                    if !handle.stop(signal) {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to listen for OS signals");
                    break;
                }
            }
        }
    })
}

#[cfg(unix)]
async fn wait_for_os_signal() -> std::io::Result<StopSignal> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|()| StopSignal::Interrupt),
        _ = terminate.recv() => Ok(StopSignal::Terminate),
    }
}

#[cfg(windows)]
async fn wait_for_os_signal() -> std::io::Result<StopSignal> {
    use tokio::signal::windows::{ctrl_close, ctrl_shutdown};

    let mut close = ctrl_close()?;
    let mut shutdown = ctrl_shutdown()?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|()| StopSignal::Interrupt),
        _ = close.recv() => Ok(StopSignal::Terminate),
        _ = shutdown.recv() => Ok(StopSignal::Terminate),
    }
}

#[cfg(not(any(unix, windows)))]
async fn wait_for_os_signal() -> std::io::Result<StopSignal> {
    tokio::signal::ctrl_c()
        .await
        .map(|()| StopSignal::Interrupt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_mapping() {
        assert_eq!(StopReason::from(StopSignal::Interrupt), StopReason::Interrupted);
        assert_eq!(StopReason::from(StopSignal::Terminate), StopReason::Killed);
        assert_eq!(StopReason::from(StopSignal::Requested), StopReason::Requested);
        assert_ne!(
            StopReason::Interrupted.to_string(),
            StopReason::Killed.to_string()
        );
    }

    #[tokio::test]
    async fn test_pending_stop_is_kept() {
        let channel = StopChannel::new();
        let handle = channel.handle();
        let (_, mut rx) = channel.into_parts();

        assert!(handle.stop(StopSignal::Interrupt));
        // Buffer full: still reported as delivered, first signal wins.
        assert!(handle.stop(StopSignal::Requested));
        assert_eq!(rx.recv().await, Some(StopSignal::Interrupt));
    }

    #[tokio::test]
    async fn test_stop_after_loop_exit() {
        let channel = StopChannel::new();
        let handle = channel.handle();
        drop(channel);
        assert!(!handle.stop(StopSignal::Requested));
    }
}
