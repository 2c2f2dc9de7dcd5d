//! External generation tool invocation.
//!
//! The transformation tool is an opaque CLI that reads a prompt on
//! stdin and writes the complete modified payload on stdout. This
//! crate owns process lifecycle, deadlines, and output cleanup.

pub mod cli;

pub use cli::CliTransformer;
