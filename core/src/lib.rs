//! Core session engine for Obi: PTY-backed agent sessions, report parsing,
//! prompt assembly, and the append-only results ledger.

pub mod beads;
pub mod codex;
pub mod config;
pub mod fake_agent;
pub mod fenced;
pub mod footer;
pub mod launcher;
pub mod ledger;
pub mod plan;
pub mod prompt;
pub mod redact;
pub mod session;
pub mod signal_relay;
pub mod summary;
mod util;

pub use util::LockedWriter;
