//! Windows service control manager dispatcher.
//!
//! The SCM calls back into `service_main` on its own thread. That thread
//! builds a Tokio runtime, registers the control handler and runs the
//! state machine until it reports Stopped. Start, stop and failure are
//! also written to the service's event log source.

use super::eventlog::EventLog;
use super::machine::ServiceMachine;
use super::runner::{configured_heartbeat, ServiceRunner, CONTROL_BUFFER};
use super::types::{ControlRequest, ServiceStatus, StatusReport};
use crate::config::Config;
use std::error::Error;
use std::ffi::OsString;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use windows_service::service::{
    ServiceControl, ServiceControlAccept, ServiceExitCode, ServiceState,
    ServiceStatus as ScmStatus, ServiceType,
};
use windows_service::service_control_handler::{self, ServiceControlHandlerResult};
use windows_service::{define_windows_service, service_dispatcher};

/// `SERVICE_CONTROL_PARAMCHANGE`
const CONTROL_PARAMCHANGE: u32 = 0x0000_0006;

/// Wait hint reported with pending states.
const PENDING_WAIT_HINT: Duration = Duration::from_secs(10);

define_windows_service!(ffi_service_main, service_main);

/// Runner that hands the process over to the service control manager.
#[derive(Debug, Default)]
pub struct WindowsRunner;

impl ServiceRunner for WindowsRunner {
    fn name(&self) -> &'static str {
        "windows-service"
    }

    fn run(&self, config: &Config) -> Result<(), Box<dyn Error>> {
        info!(service = %config.service.name, "Starting service dispatcher");
        service_dispatcher::start(&config.service.name, ffi_service_main)?;
        info!(service = %config.service.name, "Service dispatcher returned");
        Ok(())
    }
}

/// Entry point called by the SCM.
///
/// The dispatcher cannot carry context, so configuration is loaded again
/// from the process arguments.
fn service_main(_arguments: Vec<OsString>) {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return;
        }
    };
    let name = &config.service.name;

    let events = match EventLog::open(name) {
        Ok(events) => Some(events),
        Err(e) => {
            warn!(service = %name, error = %e, "Failed to open event log");
            None
        }
    };
    record(events.as_ref(), &Lifecycle::Starting, name);

    let outcome = match run_service(&config) {
        Ok(()) => Lifecycle::Stopped,
        Err(e) => {
            error!(service = %name, error = %e, "Service failed");
            Lifecycle::Failed(e.to_string())
        }
    };
    record(events.as_ref(), &outcome, name);
}

/// Service lifecycle milestones written to the event log.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Lifecycle {
    Starting,
    Stopped,
    Failed(String),
}

impl Lifecycle {
    fn message(&self, name: &str) -> String {
        match self {
            Lifecycle::Starting => format!("starting {name} service"),
            Lifecycle::Stopped => format!("{name} service stopped"),
            Lifecycle::Failed(e) => format!("{name} service failed: {e}"),
        }
    }
}

fn record(events: Option<&EventLog>, event: &Lifecycle, name: &str) {
    let message = event.message(name);
    info!(service = %name, "{message}");
    let Some(events) = events else {
        return;
    };
    let written = match event {
        Lifecycle::Failed(_) => events.error(&message),
        _ => events.info(&message),
    };
    if let Err(e) = written {
        warn!(error = %e, "Failed to write event log");
    }
}

fn run_service(config: &Config) -> Result<(), Box<dyn Error>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let (request_tx, request_rx) = mpsc::channel(CONTROL_BUFFER);
    let status_handle =
        service_control_handler::register(&config.service.name, move |control| {
            let request = match control {
                ServiceControl::Interrogate => ControlRequest::Interrogate,
                ServiceControl::Stop => ControlRequest::Stop,
                ServiceControl::Shutdown => ControlRequest::Shutdown,
                ServiceControl::Pause => ControlRequest::Pause,
                ServiceControl::Continue => ControlRequest::Continue,
                ServiceControl::Paramchange => ControlRequest::Unknown(CONTROL_PARAMCHANGE),
                other => {
                    debug!(control = ?other, "Control not implemented");
                    return ServiceControlHandlerResult::NotImplemented;
                }
            };
            // Block the handler thread rather than drop a request.
            match request_tx.blocking_send(request) {
                Ok(()) => ServiceControlHandlerResult::NoError,
                Err(_) => ServiceControlHandlerResult::NotImplemented,
            }
        })?;

    let (status_tx, mut status_rx) = mpsc::channel::<StatusReport>(CONTROL_BUFFER);
    let reporter = runtime.spawn(async move {
        while let Some(report) = status_rx.recv().await {
            // Stopped is reported last, with the exit code.
            if report.status == ServiceStatus::Stopped {
                continue;
            }
            if let Err(e) =
                status_handle.set_service_status(scm_status(report, ServiceExitCode::Win32(0)))
            {
                warn!(error = %e, "Failed to report service status");
            }
        }
    });

    let machine = ServiceMachine::new(config, configured_heartbeat(config));
    let result = runtime.block_on(machine.execute(request_rx, status_tx));
    let _ = runtime.block_on(reporter);

    let exit_code = match &result {
        Ok(reason) => {
            info!(reason = %reason, "Service stopped");
            ServiceExitCode::Win32(0)
        }
        Err(_) => ServiceExitCode::ServiceSpecific(1),
    };
    status_handle.set_service_status(scm_status(
        StatusReport::new(ServiceStatus::Stopped, Default::default()),
        exit_code,
    ))?;
    result?;
    Ok(())
}

fn scm_status(report: StatusReport, exit_code: ServiceExitCode) -> ScmStatus {
    let mut controls_accepted = ServiceControlAccept::empty();
    if report.accepts.stop {
        controls_accepted |= ServiceControlAccept::STOP;
    }
    if report.accepts.shutdown {
        controls_accepted |= ServiceControlAccept::SHUTDOWN;
    }
    if report.accepts.pause_continue {
        controls_accepted |= ServiceControlAccept::PAUSE_CONTINUE;
    }

    let (current_state, wait_hint) = match report.status {
        ServiceStatus::StartPending => (ServiceState::StartPending, PENDING_WAIT_HINT),
        ServiceStatus::Running => (ServiceState::Running, Duration::default()),
        ServiceStatus::Paused => (ServiceState::Paused, Duration::default()),
        ServiceStatus::StopPending => (ServiceState::StopPending, PENDING_WAIT_HINT),
        ServiceStatus::Stopped => (ServiceState::Stopped, Duration::default()),
    };

    ScmStatus {
        service_type: ServiceType::OWN_PROCESS,
        current_state,
        controls_accepted,
        exit_code,
        checkpoint: 0,
        wait_hint,
        process_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::types::Accepts;

    #[test]
    fn test_accepts_become_control_bits() {
        let running = scm_status(
            StatusReport::new(ServiceStatus::Running, Accepts::ALL),
            ServiceExitCode::Win32(0),
        );
        assert_eq!(
            running.controls_accepted,
            ServiceControlAccept::STOP
                | ServiceControlAccept::SHUTDOWN
                | ServiceControlAccept::PAUSE_CONTINUE
        );

        let stop_only = Accepts {
            stop: true,
            shutdown: false,
            pause_continue: false,
        };
        let status = scm_status(
            StatusReport::new(ServiceStatus::Running, stop_only),
            ServiceExitCode::Win32(0),
        );
        assert_eq!(status.controls_accepted, ServiceControlAccept::STOP);

        let pending = scm_status(
            StatusReport::new(ServiceStatus::StartPending, Accepts::NONE),
            ServiceExitCode::Win32(0),
        );
        assert!(pending.controls_accepted.is_empty());
    }

    #[test]
    fn test_only_pending_states_get_wait_hint() {
        let cases = [
            (ServiceStatus::StartPending, ServiceState::StartPending, PENDING_WAIT_HINT),
            (ServiceStatus::Running, ServiceState::Running, Duration::ZERO),
            (ServiceStatus::Paused, ServiceState::Paused, Duration::ZERO),
            (ServiceStatus::StopPending, ServiceState::StopPending, PENDING_WAIT_HINT),
            (ServiceStatus::Stopped, ServiceState::Stopped, Duration::ZERO),
        ];
        for (status, state, hint) in cases {
            let scm = scm_status(
                StatusReport::new(status, Accepts::NONE),
                ServiceExitCode::Win32(0),
            );
            assert_eq!(scm.current_state, state);
            assert_eq!(scm.wait_hint, hint);
            assert_eq!(scm.service_type, ServiceType::OWN_PROCESS);
            assert_eq!(scm.checkpoint, 0);
        }
    }

    #[test]
    fn test_exit_code_is_passed_through() {
        let scm = scm_status(
            StatusReport::new(ServiceStatus::Stopped, Accepts::NONE),
            ServiceExitCode::ServiceSpecific(1),
        );
        assert_eq!(scm.exit_code, ServiceExitCode::ServiceSpecific(1));
    }

    #[test]
    fn test_lifecycle_messages() {
        assert_eq!(Lifecycle::Starting.message("echo"), "starting echo service");
        assert_eq!(Lifecycle::Stopped.message("echo"), "echo service stopped");
        assert_eq!(
            Lifecycle::Failed("bind failed".to_string()).message("echo"),
            "echo service failed: bind failed"
        );
    }

    #[test]
    fn test_record_without_event_log() {
        record(None, &Lifecycle::Failed("boom".to_string()), "echo");
    }
}
