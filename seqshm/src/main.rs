//! # seqshm binary
//!
//! # Usage
//!
//! ```bash
//! # Own the region, logging its state every 5 s
//! seqshm serve --config /etc/seqshm/seqshm.toml
//!
//! # Clients
//! seqshm read
//! seqshm rt-write --delta 1 --scale 1.234
//! seqshm write --int 100 --float 3.14
//! seqshm status
//! seqshm measure --iterations 100000
//! ```

#![deny(warnings)]

use clap::Parser;
use seqshm_cli::cli::{Args, Command};
use seqshm_cli::commands;
use seqshm_common::config::DaemonConfig;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = run() {
        error!("seqshm failed: {}", e);
        eprintln!("error: {e}");
        std::process::exit(1);
    }
    Ok(())
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = args.resolve_config()?;

    setup_tracing(&args, &config);

    match &args.command {
        Command::Serve { .. } => {
            info!(
                "{} v{} starting",
                config.shared.service_name,
                env!("CARGO_PKG_VERSION")
            );
            let running = Arc::new(AtomicBool::new(true));
            let flag = Arc::clone(&running);
            ctrlc::set_handler(move || {
                info!("Received shutdown signal");
                flag.store(false, Ordering::SeqCst);
            })?;
            commands::serve(&config, running)?;
        }
        Command::Read { max_retries, array } => {
            println!("{}", commands::read(&config, *max_retries, *array)?);
        }
        Command::RtWrite {
            delta,
            scale,
            count,
        } => {
            println!("{}", commands::rt_write(&config, *delta, *scale, *count)?);
        }
        Command::Write {
            integer,
            float,
            max_attempts,
        } => {
            println!(
                "{}",
                commands::write(&config, *integer, *float, *max_attempts)?
            );
        }
        Command::Status => {
            println!("{}", commands::status(&config)?);
        }
        Command::Measure { iterations } => {
            let stats = commands::measure(&config, *iterations)?;
            if args.json {
                println!("{}", serde_json::to_string(&stats)?);
            } else {
                println!("{stats}");
            }
        }
    }
    Ok(())
}

/// Setup tracing subscriber from configuration and CLI arguments.
fn setup_tracing(args: &Args, config: &DaemonConfig) {
    let level = args.log_level(config.shared.log_level);
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
