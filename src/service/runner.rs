//! Service backends.
//!
//! A [`ServiceRunner`] feeds control requests into a [`ServiceMachine`] and
//! delivers its status reports. `main` picks one backend at startup:
//! the foreground [`DebugRunner`], or the host dispatcher on Windows when
//! the process was launched by the service control manager.

use super::heartbeat::{BellHeartbeat, Heartbeat, LogHeartbeat};
use super::machine::{ServiceError, ServiceMachine};
use super::types::{ControlRequest, StatusReport};
use crate::config::Config;
use crate::shutdown::StopReason;
use std::error::Error;
use std::future::Future;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Buffer between the control source and the state machine.
pub(crate) const CONTROL_BUFFER: usize = 16;

/// Runs the service state machine under some control source.
pub trait ServiceRunner {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Run until the service stops.
    fn run(&self, config: &Config) -> Result<(), Box<dyn Error>>;
}

/// Choose the backend for this process.
pub fn select_runner(interactive: bool) -> Box<dyn ServiceRunner> {
    #[cfg(windows)]
    {
        if !interactive {
            return Box::new(super::dispatcher::WindowsRunner);
        }
    }

    let _ = interactive;
    Box::new(DebugRunner)
}

/// Whether the process is attached to an interactive terminal.
#[cfg(unix)]
pub fn is_interactive_session() -> bool {
    // SAFETY: isatty only inspects the descriptor.
    unsafe { libc::isatty(libc::STDIN_FILENO) == 1 }
}

/// Whether the process is attached to an interactive terminal.
#[cfg(not(unix))]
pub fn is_interactive_session() -> bool {
    use std::io::IsTerminal;
    std::io::stdin().is_terminal()
}

/// Heartbeat selected by configuration.
pub(crate) fn configured_heartbeat(config: &Config) -> Box<dyn Heartbeat> {
    if config.heartbeat.audible {
        Box::new(BellHeartbeat)
    } else {
        Box::new(LogHeartbeat)
    }
}

/// In-process runner driven by local signals.
///
/// Unix signal mapping:
///
/// | Signal  | Request     |
/// |---------|-------------|
/// | SIGINT  | Stop        |
/// | SIGTERM | Shutdown    |
/// | SIGHUP  | Interrogate |
/// | SIGUSR1 | Pause       |
/// | SIGUSR2 | Continue    |
///
/// Elsewhere Ctrl-C maps to Stop. Status reports go to the log.
#[derive(Debug, Default)]
pub struct DebugRunner;

impl DebugRunner {
    async fn execute(&self, config: &Config) -> Result<StopReason, ServiceError> {
        // Signals reach the server through the state machine only.
        let mut config = config.clone();
        config.server.watch_signals = false;

        let (request_tx, request_rx) = mpsc::channel(CONTROL_BUFFER);
        let (status_tx, status_rx) = mpsc::channel(CONTROL_BUFFER);

        let signals = tokio::spawn(relay_controls(request_tx, forward_control_signals));
        let reporter = tokio::spawn(log_status(status_rx));

        let machine = ServiceMachine::new(&config, configured_heartbeat(&config));
        let result = machine.execute(request_rx, status_tx).await;

        signals.abort();
        let _ = reporter.await;
        result
    }
}

impl ServiceRunner for DebugRunner {
    fn name(&self) -> &'static str {
        "debug"
    }

    fn run(&self, config: &Config) -> Result<(), Box<dyn Error>> {
        info!(service = %config.service.name, "Starting service in foreground");
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        let reason = runtime.block_on(self.execute(config))?;
        info!(service = %config.service.name, reason = %reason, "Service stopped");
        Ok(())
    }
}

/// Run `forward` on the control channel.
///
/// If the signal source fails the sender is held until the task is aborted;
/// a closed control channel would read as Stop.
async fn relay_controls<F, Fut>(requests: mpsc::Sender<ControlRequest>, forward: F)
where
    F: FnOnce(mpsc::Sender<ControlRequest>) -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = forward(requests.clone()).await {
        warn!(error = %e, "Failed to listen for control signals");
        let _open = requests;
        std::future::pending::<()>().await;
    }
}

async fn log_status(mut status: mpsc::Receiver<StatusReport>) {
    while let Some(report) = status.recv().await {
        info!(status = ?report.status, accepts = ?report.accepts, "Service status");
    }
}

#[cfg(unix)]
async fn forward_control_signals(requests: mpsc::Sender<ControlRequest>) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut pause = signal(SignalKind::user_defined1())?;
    let mut resume = signal(SignalKind::user_defined2())?;

    loop {
        let request = tokio::select! {
            _ = interrupt.recv() => ControlRequest::Stop,
            _ = terminate.recv() => ControlRequest::Shutdown,
            _ = hangup.recv() => ControlRequest::Interrogate,
            _ = pause.recv() => ControlRequest::Pause,
            _ = resume.recv() => ControlRequest::Continue,
        };
        info!(request = ?request, "Got signal");
        if requests.send(request).await.is_err() {
            return Ok(());
        }
    }
}

#[cfg(not(unix))]
async fn forward_control_signals(requests: mpsc::Sender<ControlRequest>) -> std::io::Result<()> {
    loop {
        tokio::signal::ctrl_c().await?;
        info!("Got interrupt");
        if requests.send(ControlRequest::Stop).await.is_err() {
            return Ok(());
        }
    }
}
