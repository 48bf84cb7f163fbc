//! Core domain + moderation logic for the jose Matrix bot.
//!
//! This crate does not speak HTTP. The homeserver lives behind
//! [`messaging::port::MatrixPort`], implemented in the `jose-matrix` adapter.

pub mod config;
pub mod domain;
pub mod errors;
pub mod logging;
pub mod messaging;
pub mod moderation;
pub mod policy;
pub mod power_levels;
pub mod reactions;
pub mod rooms;

pub use errors::{Error, Result};
