//! Core domain types and traits for the Retouch edit pipeline.
//!
//! This crate contains:
//! - Resource identifiers and common types
//! - Edit request and content/revision models
//! - Transformer trait (external generation tool boundary)
//! - Notifier trait (best-effort user notification)
//! - Pure payload validation and content-kind classification

pub mod content;
pub mod error;
pub mod id;
pub mod notify;
pub mod request;
pub mod transform;
pub mod validate;

pub use error::{Error, Result};
pub use id::ResourceId;
