//! Core domain + application logic for the financial news brief bot.
//!
//! This crate is intentionally framework-agnostic. Telegram and the completion
//! provider live behind ports (traits) implemented in adapter crates.

pub mod broadcast;
pub mod buffer;
pub mod commands;
pub mod config;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod ingest;
pub mod logging;
pub mod messaging;
pub mod model;
pub mod scheduler;
pub mod subscribers;
pub mod summarizer;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::{Error, Result};
