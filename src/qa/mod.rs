//! Translation quality assurance.
//!
//! `hard` enforces structural invariants that are never negotiable
//! (tokens, tags, lengths, forbidden patterns); `soft` is an LLM-backed
//! stylistic review that feeds the repair loop.

pub mod hard;
pub mod soft;

pub use hard::{HardQaValidator, QaError, QaErrorType, QaReport, Severity};
pub use soft::{SoftQaIssue, SoftQaOutcome};
