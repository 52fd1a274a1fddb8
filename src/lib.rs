//! Core build graph and scheduling engine for a polyglot,
//! multi-repository build system.
//!
//! This crate owns labels, targets, packages and subrepos, the
//! concurrent build graph, the dependency scheduler, and the
//! command/environment expander. Parsing build files and executing
//! build commands on disk are out-of-scope collaborators, represented
//! here as the [`scheduler::Parser`] and [`scheduler::Executor`]
//! traits.

pub mod command;
pub mod config;
pub mod error;
pub mod graph;
pub mod input;
pub mod interning;
pub mod label;
pub mod output;
pub mod package;
pub mod scheduler;
pub mod subrepo;
pub mod target;

/// Installs an `env_logger` subscriber controlled by `RUST_LOG`.
///
/// Library consumers are never forced to take a global logger; this is
/// an opt-in helper for binaries and integration tests built against
/// this crate, behind the default `env_logger` feature.
#[cfg(feature = "env_logger")]
pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env().try_init();
}
