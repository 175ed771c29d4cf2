// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;

use coachd::config::DaemonConfig;

#[derive(Parser)]
#[command(name = "coachd", version, about = "RV CAN-bus control core daemon.")]
struct Cli {
    #[command(flatten)]
    config: DaemonConfig,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Physical CAN binding is deployment-specific; the stock binary
    // brings up loopback transports for the configured interfaces so
    // the platform runs end-to-end in simulation.
    let coach = match coachd::config::CoachConfig::load(&cli.config.config) {
        Ok(coach) => coach,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(2);
        }
    };
    let mut transports: Vec<Box<dyn canlink::transport::BusTransport>> = Vec::new();
    for interface in &coach.interfaces {
        let (transport, handle) = canlink::transport::loopback(interface.clone(), 1024);
        // Keep the peer side alive for the process lifetime.
        std::mem::forget(handle);
        transports.push(Box::new(transport));
    }

    if let Err(e) = coachd::run::run(cli.config, transports).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}
