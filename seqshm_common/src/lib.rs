//! seqshm Common Library
//!
//! This crate provides the constants that fix the shared region shape and
//! the configuration loading utilities used by every seqshm crate.
//!
//! # Module Structure
//!
//! - [`consts`] - Payload shape, sequence encoding and segment size limits
//! - [`config`] - Configuration loading traits and daemon configuration types
//!
//! # Usage
//!
//! ```rust
//! use seqshm_common::consts::*;
//! use seqshm_common::config::{ConfigLoader, SharedConfig};
//! ```

pub mod config;
pub mod consts;
