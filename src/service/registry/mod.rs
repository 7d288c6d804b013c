//! Registration of the service with the host service manager.
//!
//! Every operation is a best-effort call into the host's native registry.
//! Stop, pause and continue poll the service after sending the control and
//! fail with [`RegistryError::Timeout`] if the target state is not reached.

use super::types::ServiceStatus;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

#[cfg(windows)]
mod windows;

/// How long to wait for a controlled service to reach its target state.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay between status queries while waiting.
pub const POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Install/remove/control operations on a registered service.
pub trait ServiceRegistry {
    /// Register `name`, launching the current executable.
    fn install(&self, name: &str, description: &str) -> Result<(), RegistryError>;

    /// Remove the registration of `name`.
    fn remove(&self, name: &str) -> Result<(), RegistryError>;

    /// Ask the host to start `name`. Does not wait.
    fn start(&self, name: &str) -> Result<(), RegistryError>;

    /// Stop `name` and wait for Stopped.
    fn stop(&self, name: &str) -> Result<(), RegistryError>;

    /// Pause `name` and wait for Paused.
    fn pause(&self, name: &str) -> Result<(), RegistryError>;

    /// Continue `name` and wait for Running.
    fn resume(&self, name: &str) -> Result<(), RegistryError>;

    /// Current status of `name`.
    fn status(&self, name: &str) -> Result<ServiceStatus, RegistryError>;
}

/// Registry for the platform this process runs on.
pub fn local_registry() -> Box<dyn ServiceRegistry> {
    #[cfg(windows)]
    {
        Box::new(windows::WindowsRegistry)
    }

    #[cfg(not(windows))]
    {
        Box::new(UnsupportedRegistry)
    }
}

/// Timing of the post-control status poll.
#[cfg_attr(not(windows), allow(dead_code))]
#[derive(Debug, Clone, Copy)]
pub struct ControlPoll {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for ControlPoll {
    fn default() -> Self {
        Self {
            timeout: CONTROL_TIMEOUT,
            interval: POLL_INTERVAL,
        }
    }
}

/// Poll `query` until it reports `target`.
///
/// `initial` is the status returned when the control was sent; it is
/// checked before any query is made.
#[cfg_attr(not(windows), allow(dead_code))]
pub fn wait_for_state<F>(
    initial: ServiceStatus,
    target: ServiceStatus,
    poll: ControlPoll,
    mut query: F,
) -> Result<(), RegistryError>
where
    F: FnMut() -> Result<ServiceStatus, RegistryError>,
{
    let deadline = Instant::now() + poll.timeout;
    let mut status = initial;

    while status != target {
        if Instant::now() >= deadline {
            return Err(RegistryError::Timeout { target, last: status });
        }
        std::thread::sleep(poll.interval);
        status = query()?;
        debug!(status = ?status, target = ?target, "Polled service status");
    }

    Ok(())
}

/// Stand-in registry for platforms without a supported service manager.
#[cfg(not(windows))]
#[derive(Debug, Default)]
pub struct UnsupportedRegistry;

#[cfg(not(windows))]
impl ServiceRegistry for UnsupportedRegistry {
    fn install(&self, _name: &str, _description: &str) -> Result<(), RegistryError> {
        Err(RegistryError::Unsupported)
    }

    fn remove(&self, _name: &str) -> Result<(), RegistryError> {
        Err(RegistryError::Unsupported)
    }

    fn start(&self, _name: &str) -> Result<(), RegistryError> {
        Err(RegistryError::Unsupported)
    }

    fn stop(&self, _name: &str) -> Result<(), RegistryError> {
        Err(RegistryError::Unsupported)
    }

    fn pause(&self, _name: &str) -> Result<(), RegistryError> {
        Err(RegistryError::Unsupported)
    }

    fn resume(&self, _name: &str) -> Result<(), RegistryError> {
        Err(RegistryError::Unsupported)
    }

    fn status(&self, _name: &str) -> Result<ServiceStatus, RegistryError> {
        Err(RegistryError::Unsupported)
    }
}

/// Service registration errors
#[cfg_attr(not(windows), allow(dead_code))]
#[derive(Debug)]
pub enum RegistryError {
    /// `install` found an existing registration.
    AlreadyInstalled(String),
    /// The named service is not registered.
    NotInstalled(String),
    /// The service did not reach `target` within the control timeout.
    Timeout {
        target: ServiceStatus,
        last: ServiceStatus,
    },
    /// This platform has no supported service manager.
    Unsupported,
    /// The host service manager rejected a call.
    Platform(String),
    /// Local I/O failure (e.g. resolving the executable path).
    Io(std::io::Error),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::AlreadyInstalled(name) => write!(f, "service {name} already exists"),
            RegistryError::NotInstalled(name) => write!(f, "service {name} is not installed"),
            RegistryError::Timeout { target, last } => write!(
                f,
                "timeout waiting for service to go to state={target:?} (last state={last:?})"
            ),
            RegistryError::Unsupported => {
                write!(f, "service registration is not supported on this platform")
            }
            RegistryError::Platform(msg) => write!(f, "{msg}"),
            RegistryError::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<std::io::Error> for RegistryError {
    fn from(e: std::io::Error) -> Self {
        RegistryError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn quick_poll() -> ControlPoll {
        ControlPoll {
            timeout: Duration::from_millis(200),
            interval: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_default_poll_timing() {
        let poll = ControlPoll::default();
        assert_eq!(poll.timeout, Duration::from_secs(10));
        assert_eq!(poll.interval, Duration::from_millis(300));
    }

    #[test]
    fn test_already_in_target_state() {
        let result = wait_for_state(
            ServiceStatus::Stopped,
            ServiceStatus::Stopped,
            quick_poll(),
            || panic!("should not query"),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_reaches_target_after_polling() {
        let queries = Cell::new(0);
        let result = wait_for_state(
            ServiceStatus::StopPending,
            ServiceStatus::Stopped,
            quick_poll(),
            || {
                queries.set(queries.get() + 1);
                Ok(if queries.get() < 3 {
                    ServiceStatus::StopPending
                } else {
                    ServiceStatus::Stopped
                })
            },
        );
        assert!(result.is_ok());
        assert_eq!(queries.get(), 3);
    }

    #[test]
    fn test_times_out() {
        let result = wait_for_state(
            ServiceStatus::Running,
            ServiceStatus::Paused,
            quick_poll(),
            || Ok(ServiceStatus::Running),
        );
        match result {
            Err(RegistryError::Timeout { target, last }) => {
                assert_eq!(target, ServiceStatus::Paused);
                assert_eq!(last, ServiceStatus::Running);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_query_error_propagates() {
        let result = wait_for_state(
            ServiceStatus::Running,
            ServiceStatus::Stopped,
            quick_poll(),
            || Err(RegistryError::NotInstalled("svc".to_string())),
        );
        assert!(matches!(result, Err(RegistryError::NotInstalled(_))));
    }

    #[cfg(not(windows))]
    #[test]
    fn test_unsupported_platform() {
        let registry = local_registry();
        assert!(matches!(
            registry.install("svc", "desc"),
            Err(RegistryError::Unsupported)
        ));
        assert!(matches!(registry.status("svc"), Err(RegistryError::Unsupported)));
    }
}
