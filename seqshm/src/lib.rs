//! # seqshm command line tools
//!
//! The `seqshm` binary is both the owning daemon (`serve`) and a set of
//! client commands that resolve the published region by name.
//!
//! # Module Structure
//!
//! - [`cli`] - clap arguments and configuration overrides
//! - [`commands`] - subcommand implementations
//! - [`measure`] - RT write latency statistics

pub mod cli;
pub mod commands;
pub mod measure;
