//! Expense Assistant Core
//!
//! A conversational expense tracker core that:
//! - Parses free-text spending statements into structured commands
//! - Resolves categories through a five-tier waterfall with confidence scoring
//! - Learns from user corrections via per-user overrides and a shared cache
//! - Owns a one-slot confirmation state machine for ambiguous statements
//! - Degrades gracefully whenever the remote oracle is unavailable or wrong
//!
//! PIPELINE:
//! TEXT → PARSE → RESOLVE (override → cache → keyword → oracle → fallback) → ACT

pub mod api;
pub mod dispatcher;
pub mod error;
pub mod insights;
pub mod keywords;
pub mod merchant;
pub mod models;
pub mod oracle;
pub mod parser;
pub mod resolution;
pub mod store;

pub use error::Result;

// Re-export common types
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use models::*;
pub use resolution::{CategoryResolver, ResolutionRequest};
