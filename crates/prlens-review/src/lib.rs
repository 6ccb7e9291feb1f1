//! Analysis pipeline stages for prlens.
//!
//! Snapshot fetching, prompt construction, the LLM provider gateway, tiered
//! response parsing, issue coercion, the heuristic fallback, and the shared
//! worker pool for CPU-bound steps.

pub mod coerce;
pub mod github;
pub mod heuristic;
pub mod llm;
pub mod parser;
pub mod pool;
pub mod prompt;
