//! echo-service: a service-managed TCP echo daemon
//!
//! The process registers with the host service manager and, while running,
//! answers every read on its TCP port with a timestamped echo:
//! - Service state machine driven by start/stop/pause/continue/interrogate
//! - Heartbeat tick that slows down while paused
//! - Accept loop feeding a bounded connection queue
//! - Configuration via CLI arguments or TOML file

mod config;
mod logging;
mod protocols;
mod server;
mod service;
mod shutdown;

use clap::CommandFactory;
use config::{CliArgs, Command, Config};
use server::Server;
use service::{local_registry, DebugRunner, ServiceRunner};
use shutdown::StopChannel;
use tracing::info;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    let interactive = service::is_interactive_session();
    if config.command.is_none() && interactive {
        usage("no command specified");
    }

    // Initialize logging
    logging::init(&config.logging, config.command.is_none())?;

    info!(
        service = %config.service.name,
        command = ?config.command,
        interactive,
        listen = %config.server.listen,
        "Starting echo-service"
    );

    let command = match config.command {
        None => return run_service(&config),
        Some(Command::Debug) => return DebugRunner.run(&config),
        Some(Command::Serve) => return serve(&config),
        Some(command) => command,
    };

    // Registration commands against the host service manager
    let registry = local_registry();
    let name = config.service.name.as_str();
    let result = match command {
        Command::Install => registry.install(name, &config.service.description),
        Command::Remove => registry.remove(name),
        Command::Start => registry.start(name),
        Command::Stop => registry.stop(name),
        Command::Pause => registry.pause(name),
        Command::Continue => registry.resume(name),
        Command::Status => registry.status(name).map(|status| {
            println!("{name}: {status:?}");
        }),
        Command::Debug | Command::Serve => Ok(()),
    };

    result.map_err(|e| format!("failed to {} {}: {}", command_word(command), name, e).into())
}

/// Print usage to stderr and exit with status 2.
fn usage(message: &str) -> ! {
    let mut cmd = CliArgs::command();
    eprintln!("{message}\n\n{}", cmd.render_usage());
    std::process::exit(2);
}

/// Run as the registered service under the host dispatcher.
fn run_service(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let runner = service::select_runner(false);
    info!(runner = runner.name(), "Running as service");
    runner.run(config)
}

/// Run the echo server alone until interrupted.
fn serve(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut server_config = config.server.clone();
    server_config.watch_signals = true;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let reason = runtime.block_on(async {
        let server = Server::bind(&server_config).await?;
        server.run(StopChannel::new()).await
    })?;

    info!(reason = %reason, "Server stopped");
    println!("Daemon was {reason}");
    Ok(())
}

fn command_word(command: Command) -> &'static str {
    match command {
        Command::Install => "install",
        Command::Remove => "remove",
        Command::Start => "start",
        Command::Stop => "stop",
        Command::Status => "status",
        Command::Pause => "pause",
        Command::Continue => "continue",
        Command::Debug => "debug",
        Command::Serve => "serve",
    }
}
