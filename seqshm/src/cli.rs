//! Command line arguments and configuration resolution

use clap::{Parser, Subcommand};
use seqshm_common::config::{ConfigError, ConfigLoader, DaemonConfig, LogLevel};
use std::path::PathBuf;
use tracing::Level;

/// seqshm - dual-slot seqlock shared memory daemon and client
#[derive(Parser, Debug)]
#[command(name = "seqshm")]
#[command(version)]
#[command(about = "Dual-slot seqlock shared memory: owning daemon and client tools")]
#[command(long_about = None)]
pub struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Logical region name (overrides the configuration)
    #[arg(short, long, global = true)]
    pub name: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output logs in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Operation to perform
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Create, pin, initialize and publish the region, then log its state
    Serve {
        /// Skip page pinning
        #[arg(long)]
        no_pin: bool,

        /// Status line interval in milliseconds
        #[arg(long, value_name = "MS")]
        interval_ms: Option<u64>,

        /// Backing store size in bytes
        #[arg(long)]
        size: Option<usize>,
    },

    /// Consistent read of the active slot
    Read {
        /// Give up after this many retries
        #[arg(long)]
        max_retries: Option<u32>,

        /// Print the whole array
        #[arg(long)]
        array: bool,
    },

    /// RT write: add to the integer and scale the float in place
    RtWrite {
        /// Added to the integer field
        #[arg(long, default_value_t = 1, allow_hyphen_values = true)]
        delta: i32,

        /// Multiplies the float field
        #[arg(long, default_value_t = 1.234)]
        scale: f32,

        /// Number of RT writes to perform
        #[arg(long, default_value_t = 1)]
        count: u32,
    },

    /// Non-RT write through the shadow slot; the array is carried over
    Write {
        /// New integer value
        #[arg(long = "int", allow_hyphen_values = true)]
        integer: Option<i32>,

        /// New float value
        #[arg(long, allow_hyphen_values = true)]
        float: Option<f32>,

        /// Give up after this many attempts
        #[arg(long)]
        max_attempts: Option<u32>,
    },

    /// Print published metadata and the counter decomposition
    Status,

    /// Time RT writes touching every field
    Measure {
        /// Number of timed writes
        #[arg(long, default_value_t = 10_000)]
        iterations: u32,
    },
}

impl Args {
    /// Load the configuration file (or defaults) and apply CLI overrides
    pub fn resolve_config(&self) -> Result<DaemonConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::load(path)?,
            None => DaemonConfig::default(),
        };

        if let Some(name) = &self.name {
            config.region.name = name.clone();
        }
        if let Command::Serve {
            no_pin,
            interval_ms,
            size,
        } = &self.command
        {
            if *no_pin {
                config.region.pin = false;
            }
            if let Some(ms) = interval_ms {
                config.region.status_interval_ms = *ms;
            }
            if size.is_some() {
                config.region.size = *size;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Log level from configuration, raised to debug by `--verbose`
    pub fn log_level(&self, configured: LogLevel) -> Level {
        if self.verbose {
            return Level::DEBUG;
        }
        match configured {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}
