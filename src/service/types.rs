//! Status and control vocabulary shared with the host service manager.

/// Externally visible lifecycle state of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    StartPending,
    Running,
    Paused,
    StopPending,
    Stopped,
}

/// Control families the service declares it will accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Accepts {
    pub stop: bool,
    pub shutdown: bool,
    pub pause_continue: bool,
}

impl Accepts {
    /// Nothing accepted; used while starting or stopping.
    pub const NONE: Accepts = Accepts {
        stop: false,
        shutdown: false,
        pause_continue: false,
    };

    /// Stop, shutdown, pause and continue.
    pub const ALL: Accepts = Accepts {
        stop: true,
        shutdown: true,
        pause_continue: true,
    };
}

/// One status report sent to the host service manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    pub status: ServiceStatus,
    pub accepts: Accepts,
}

impl StatusReport {
    pub const fn new(status: ServiceStatus, accepts: Accepts) -> Self {
        Self { status, accepts }
    }
}

/// A request issued by the host service manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    Interrogate,
    Stop,
    Shutdown,
    Pause,
    Continue,
    /// Any control the service does not understand, by raw code.
    #[cfg_attr(not(windows), allow(dead_code))]
    Unknown(u32),
}
