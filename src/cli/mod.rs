//! Command-line interface definitions.
//!
//! Provides CLI structure and output formatting:
//! - `Cli`, `Commands`: CLI argument definitions via clap
//! - `Display`: Formatted terminal output with colors and status

mod commands;
mod display;

pub use commands::{AgentArg, Cli, Commands};
pub use display::Display;
