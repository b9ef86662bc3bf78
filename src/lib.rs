//! An authoritative DNS nameserver core – library crate.
//!
//! Sluice maintains authoritative zones: a per-zone event table drives
//! loading, transfers, dynamic updates, flushing and DNSSEC signing; every
//! durable change is appended to a chunked changeset journal; published
//! zone versions are immutable snapshots swapped under a single pointer.

pub use crate::config::Config;
pub use crate::error::{Error, Result};

pub mod config;
pub mod control;
pub mod dnssec;
pub mod error;
pub mod events;
pub mod journal;
pub mod log;
pub mod remote;
pub mod server;
pub mod util;
pub mod zone;
