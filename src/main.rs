//! ptybus — shared serial bus emulation

use clap::Parser;
use ptybus::{Bus, Cli};
use std::io::IsTerminal;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version go to stdout and succeed; every usage error exits 1
            let code = i32::from(e.use_stderr());
            let _ = e.print();
            std::process::exit(code);
        }
    };

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("ptybus=debug")
    } else {
        EnvFilter::new("ptybus=info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .init();

    if let Err(e) = run(&cli).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = cli.to_config()?;

    // Before any port exists, so an early SIGTERM is not fatal
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let mut bus = Bus::open(&config)?;
    let shutdown = bus.shutdown_handle();

    let mut relay = tokio::task::spawn_blocking(move || {
        let result = bus.run();
        (bus, result)
    });

    let (bus, result) = tokio::select! {
        joined = &mut relay => joined?,
        _ = sigterm.recv() => {
            info!("SIGTERM received, shutting down");
            shutdown.trigger();
            relay.await?
        }
        _ = sigint.recv() => {
            info!("SIGINT received, shutting down");
            shutdown.trigger();
            relay.await?
        }
    };

    tokio::task::spawn_blocking(move || bus.close()).await?;
    result?;
    Ok(())
}
