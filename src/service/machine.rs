//! Service state machine.
//!
//! Consumes control requests from the host service manager, reports status
//! transitions back, drives the heartbeat tick and owns the lifetime of the
//! echo server task. Stop and Shutdown tell the server to close its listener
//! and wait a bounded grace period for it before reporting Stopped.

use super::heartbeat::Heartbeat;
use super::types::{Accepts, ControlRequest, ServiceStatus, StatusReport};
use crate::config::{Config, ControlConfig, HeartbeatConfig, ServerConfig};
use crate::server::{Server, ServerError};
use crate::shutdown::{StopChannel, StopReason, StopSignal};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinError;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// What the event loop must do after a control request was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Report the (possibly unchanged) current status.
    Report,
    /// Report the current status twice.
    Interrogate,
    /// Leave the loop and shut the server down.
    Stop,
    /// Nothing to do.
    Ignore,
}

/// The service's state machine. Build one per service run.
pub struct ServiceMachine {
    server: ServerConfig,
    heartbeat_config: HeartbeatConfig,
    control: ControlConfig,
    heartbeat: Box<dyn Heartbeat>,
    current: StatusReport,
    period: Duration,
    listening: Option<oneshot::Sender<SocketAddr>>,
}

impl ServiceMachine {
    pub fn new(config: &Config, heartbeat: Box<dyn Heartbeat>) -> Self {
        Self {
            server: config.server.clone(),
            heartbeat_config: config.heartbeat.clone(),
            control: config.control.clone(),
            heartbeat,
            current: StatusReport::new(ServiceStatus::StartPending, Accepts::NONE),
            period: config.heartbeat.fast(),
            listening: None,
        }
    }

    /// Send the bound listener address on `tx` once the server is bound.
    #[cfg(test)]
    pub fn notify_listening(mut self, tx: oneshot::Sender<SocketAddr>) -> Self {
        self.listening = Some(tx);
        self
    }

    /// Current status as last reported.
    #[cfg(test)]
    pub fn status(&self) -> StatusReport {
        self.current
    }

    /// Current heartbeat period.
    #[cfg(test)]
    pub fn heartbeat_period(&self) -> Duration {
        self.period
    }

    /// Apply one control request to the state.
    fn apply(&mut self, request: ControlRequest) -> Step {
        match request {
            ControlRequest::Interrogate => Step::Interrogate,
            ControlRequest::Stop | ControlRequest::Shutdown => {
                info!(request = ?request, "Stop requested");
                self.current = StatusReport::new(ServiceStatus::StopPending, Accepts::NONE);
                Step::Stop
            }
            ControlRequest::Pause => {
                self.current = StatusReport::new(ServiceStatus::Paused, Accepts::ALL);
                self.period = self.heartbeat_config.slow();
                Step::Report
            }
            ControlRequest::Continue => {
                self.current = StatusReport::new(ServiceStatus::Running, Accepts::ALL);
                self.period = self.heartbeat_config.fast();
                Step::Report
            }
            ControlRequest::Unknown(code) => {
                warn!(code, "Unexpected control request");
                Step::Ignore
            }
        }
    }

    async fn report(&mut self, status: &mpsc::Sender<StatusReport>, report: StatusReport) {
        self.current = report;
        send_report(status, report).await;
    }

    /// Run the service until Stop/Shutdown or until the server exits.
    ///
    /// Reports StartPending, binds the listener, reports Running and spawns
    /// the server. Always reports Stopped before returning.
    pub async fn execute(
        mut self,
        mut requests: mpsc::Receiver<ControlRequest>,
        status: mpsc::Sender<StatusReport>,
    ) -> Result<StopReason, ServiceError> {
        info!("Service executing");
        self.report(
            &status,
            StatusReport::new(ServiceStatus::StartPending, Accepts::NONE),
        )
        .await;

        let server = match Server::bind(&self.server).await {
            Ok(server) => server,
            Err(e) => {
                warn!(error = %e, "Server failed to start");
                self.report(&status, StatusReport::new(ServiceStatus::Stopped, Accepts::NONE))
                    .await;
                return Err(ServiceError::Server(e));
            }
        };
        if let Some(tx) = self.listening.take() {
            let _ = tx.send(server.local_addr());
        }

        self.period = self.heartbeat_config.fast();
        self.report(&status, StatusReport::new(ServiceStatus::Running, Accepts::ALL))
            .await;

        let stop = StopChannel::new();
        let stop_handle = stop.handle();
        let mut server_task = tokio::spawn(server.run(stop));
        let mut tick = heartbeat_interval(self.period);

        let finished = loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.heartbeat.beat(self.current.status);
                }

                request = requests.recv() => {
                    let request = request.unwrap_or_else(|| {
                        info!("Control channel closed, stopping");
                        ControlRequest::Stop
                    });
                    debug!(request = ?request, "Control request");

                    match self.apply(request) {
                        Step::Report => {
                            send_report(&status, self.current).await;
                            if tick.period() != self.period {
                                tick = heartbeat_interval(self.period);
                            }
                        }
                        Step::Interrogate => {
                            send_report(&status, self.current).await;
                            time::sleep(self.control.interrogate_delay()).await;
                            send_report(&status, self.current).await;
                        }
                        Step::Stop => break None,
                        Step::Ignore => {}
                    }
                }

                joined = &mut server_task => break Some(joined),
            }
        };
        drop(requests);

        let outcome = match finished {
            None => {
                send_report(&status, self.current).await;
                stop_handle.stop(StopSignal::Requested);
                match time::timeout(self.control.shutdown_grace(), &mut server_task).await {
                    Ok(joined) => flatten(joined),
                    Err(_) => {
                        warn!(
                            grace_ms = self.control.shutdown_grace().as_millis() as u64,
                            "Server did not stop in time, aborting"
                        );
                        server_task.abort();
                        Ok(StopReason::Requested)
                    }
                }
            }
            Some(joined) => {
                info!("Server exited, stopping service");
                self.report(
                    &status,
                    StatusReport::new(ServiceStatus::StopPending, Accepts::NONE),
                )
                .await;
                flatten(joined)
            }
        };

        self.report(&status, StatusReport::new(ServiceStatus::Stopped, Accepts::NONE))
            .await;
        match &outcome {
            Ok(reason) => info!(reason = %reason, "Service stopped"),
            Err(e) => warn!(error = %e, "Service stopped with error"),
        }
        outcome
    }
}

// Takes the report by value so no borrow of the machine lives across the send.
async fn send_report(status: &mpsc::Sender<StatusReport>, report: StatusReport) {
    debug!(status = ?report.status, "Reporting status");
    if status.send(report).await.is_err() {
        debug!("Status receiver gone");
    }
}

fn heartbeat_interval(period: Duration) -> Interval {
    let mut tick = time::interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick
}

fn flatten(
    joined: Result<Result<StopReason, ServerError>, JoinError>,
) -> Result<StopReason, ServiceError> {
    match joined {
        Ok(result) => result.map_err(ServiceError::Server),
        Err(e) => Err(ServiceError::Task(e)),
    }
}

/// Service run errors
#[derive(Debug)]
pub enum ServiceError {
    /// The echo server failed to start or exited with an error.
    Server(ServerError),
    /// The echo server task panicked or was cancelled.
    Task(JoinError),
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::Server(e) => write!(f, "{e}"),
            ServiceError::Task(e) => write!(f, "Server task failed: {e}"),
        }
    }
}

impl std::error::Error for ServiceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServiceError::Server(e) => Some(e),
            ServiceError::Task(e) => Some(e),
        }
    }
}
