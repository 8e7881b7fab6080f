//! Command-line interface for dropkit.

mod commands;

pub use commands::{is_verbose, run};
