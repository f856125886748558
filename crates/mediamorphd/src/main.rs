//! mediamorph daemon: load configuration from the environment, start the
//! supervisor, and shut down cleanly on SIGINT/SIGTERM.

use std::process::ExitCode;
use std::sync::mpsc;

use log::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use mediamorph::{load_config, Supervisor};

/// `RUST_LOG` wins over the configured level so operators can raise
/// verbosity without touching the service configuration.
fn init_logging(configured_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(configured_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

fn main() -> ExitCode {
    let config = load_config();
    init_logging(&config.log_level);

    if let Err(e) = config.validate() {
        error!("invalid configuration: {e}");
        return ExitCode::from(1);
    }

    info!(
        "starting mediamorphd: {} watch roots, store at {}",
        config.watch_dirs.len(),
        config.db_path.display()
    );

    let supervisor = match Supervisor::start(config) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            error!("failed to start: {e}");
            return ExitCode::from(2);
        }
    };

    let (signal_tx, signal_rx) = mpsc::channel();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = signal_tx.send(());
    }) {
        error!("failed to install signal handler: {e}");
        supervisor.stop();
        return ExitCode::from(2);
    }

    info!("mediamorphd running");
    let _ = signal_rx.recv();

    info!("termination signal received, shutting down");
    supervisor.stop();
    info!("shutdown complete");

    ExitCode::SUCCESS
}
