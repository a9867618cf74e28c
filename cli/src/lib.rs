//! The `obi` command surface: argument parsing and the `go` orchestrator
//! that drives agent sessions, the epic loop, and the omnibus summarizer.

pub mod go;
pub mod operator_log;
