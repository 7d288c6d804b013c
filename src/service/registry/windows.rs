//! Windows service control manager backend.

use super::{wait_for_state, ControlPoll, RegistryError, ServiceRegistry};
use crate::service::eventlog;
use crate::service::types::ServiceStatus;
use std::ffi::{OsStr, OsString};
use tracing::{debug, info, warn};
use windows_service::service::{
    Service, ServiceAccess, ServiceErrorControl, ServiceInfo, ServiceStartType, ServiceState,
    ServiceType,
};
use windows_service::service_manager::{ServiceManager, ServiceManagerAccess};

/// `ERROR_SERVICE_DOES_NOT_EXIST`
const SERVICE_DOES_NOT_EXIST: i32 = 1060;

/// Registry backed by the local service control manager.
#[derive(Debug, Default)]
pub struct WindowsRegistry;

impl WindowsRegistry {
    fn manager(access: ServiceManagerAccess) -> Result<ServiceManager, RegistryError> {
        ServiceManager::local_computer(None::<&str>, access).map_err(|e| {
            RegistryError::Platform(format!("could not connect to service manager: {e}"))
        })
    }

    fn open(name: &str, access: ServiceAccess) -> Result<Service, RegistryError> {
        let manager = Self::manager(ServiceManagerAccess::CONNECT)?;
        manager
            .open_service(name, access)
            .map_err(|e| open_error(name, e))
    }

    fn control<F>(
        name: &str,
        access: ServiceAccess,
        target: ServiceStatus,
        send: F,
    ) -> Result<(), RegistryError>
    where
        F: FnOnce(&Service) -> windows_service::Result<windows_service::service::ServiceStatus>,
    {
        let service = Self::open(name, access | ServiceAccess::QUERY_STATUS)?;
        let status = send(&service).map_err(|e| {
            RegistryError::Platform(format!("could not send control to {name}: {e}"))
        })?;
        wait_for_state(
            map_state(status.current_state),
            target,
            ControlPoll::default(),
            || query(&service),
        )
    }
}

impl ServiceRegistry for WindowsRegistry {
    fn install(&self, name: &str, description: &str) -> Result<(), RegistryError> {
        info!(service = name, "Installing service");
        let executable_path = std::env::current_exe()?;
        let manager =
            Self::manager(ServiceManagerAccess::CONNECT | ServiceManagerAccess::CREATE_SERVICE)?;

        if manager
            .open_service(name, ServiceAccess::QUERY_STATUS)
            .is_ok()
        {
            return Err(RegistryError::AlreadyInstalled(name.to_string()));
        }

        let info = ServiceInfo {
            name: OsString::from(name),
            display_name: OsString::from(description),
            service_type: ServiceType::OWN_PROCESS,
            start_type: ServiceStartType::OnDemand,
            error_control: ServiceErrorControl::Normal,
            executable_path,
            launch_arguments: vec![],
            dependencies: vec![],
            account_name: None,
            account_password: None,
        };
        let service = manager
            .create_service(&info, ServiceAccess::CHANGE_CONFIG | ServiceAccess::DELETE)
            .map_err(|e| RegistryError::Platform(format!("could not create service: {e}")))?;
        service
            .set_description(description)
            .map_err(|e| RegistryError::Platform(format!("could not set description: {e}")))?;

        // A service without its event source is rolled back.
        if let Err(e) = eventlog::install_source(name) {
            if let Err(delete) = service.delete() {
                warn!(service = name, error = %delete, "Failed to roll back service");
            }
            return Err(RegistryError::Platform(format!(
                "could not set up event log source: {e}"
            )));
        }
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), RegistryError> {
        info!(service = name, "Removing service");
        let service = Self::open(name, ServiceAccess::DELETE)?;
        service
            .delete()
            .map_err(|e| RegistryError::Platform(format!("could not delete service: {e}")))?;
        eventlog::remove_source(name).map_err(|e| {
            RegistryError::Platform(format!("could not remove event log source: {e}"))
        })
    }

    fn start(&self, name: &str) -> Result<(), RegistryError> {
        info!(service = name, "Starting service");
        let service = Self::open(name, ServiceAccess::START)?;
        service
            .start::<&OsStr>(&[])
            .map_err(|e| RegistryError::Platform(format!("could not start service: {e}")))
    }

    fn stop(&self, name: &str) -> Result<(), RegistryError> {
        info!(service = name, "Stopping service");
        Self::control(name, ServiceAccess::STOP, ServiceStatus::Stopped, |s| {
            s.stop()
        })
    }

    fn pause(&self, name: &str) -> Result<(), RegistryError> {
        info!(service = name, "Pausing service");
        Self::control(
            name,
            ServiceAccess::PAUSE_CONTINUE,
            ServiceStatus::Paused,
            |s| s.pause(),
        )
    }

    fn resume(&self, name: &str) -> Result<(), RegistryError> {
        info!(service = name, "Continuing service");
        Self::control(
            name,
            ServiceAccess::PAUSE_CONTINUE,
            ServiceStatus::Running,
            |s| s.resume(),
        )
    }

    fn status(&self, name: &str) -> Result<ServiceStatus, RegistryError> {
        let service = Self::open(name, ServiceAccess::QUERY_STATUS)?;
        query(&service)
    }
}

fn query(service: &Service) -> Result<ServiceStatus, RegistryError> {
    let status = service.query_status().map_err(|e| {
        RegistryError::Platform(format!("could not retrieve service status: {e}"))
    })?;
    debug!(state = ?status.current_state, "Queried service");
    Ok(map_state(status.current_state))
}

fn open_error(name: &str, e: windows_service::Error) -> RegistryError {
    match &e {
        windows_service::Error::Winapi(io) if io.raw_os_error() == Some(SERVICE_DOES_NOT_EXIST) => {
            RegistryError::NotInstalled(name.to_string())
        }
        _ => RegistryError::Platform(format!("could not access service: {e}")),
    }
}

/// Pending pause/continue states count as the state being left.
fn map_state(state: ServiceState) -> ServiceStatus {
    match state {
        ServiceState::Stopped => ServiceStatus::Stopped,
        ServiceState::StartPending => ServiceStatus::StartPending,
        ServiceState::StopPending => ServiceStatus::StopPending,
        ServiceState::Running => ServiceStatus::Running,
        ServiceState::ContinuePending => ServiceStatus::Paused,
        ServiceState::PausePending => ServiceStatus::Running,
        ServiceState::Paused => ServiceStatus::Paused,
    }
}
