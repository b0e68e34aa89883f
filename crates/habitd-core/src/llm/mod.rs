//! LLM integration for habitd
//!
//! - client: Ollama-compatible chat client with classified errors and a
//!   shared concurrency cap
//! - schema: per-category extraction schemas (configuration data)
//! - extract: structured-data extraction with bounded, persisted retries
//! - gaps: coverage gap analysis and follow-up question generation
//! - consolidate: merging one session's turns into a single record

mod client;
mod consolidate;
mod extract;
mod gaps;
pub mod schema;

pub use client::{ChatModel, LlmClient, LlmError};
pub use consolidate::Consolidator;
pub use extract::{AttemptSink, ExtractionOutcome, Extractor};
pub use gaps::{FollowUp, Gap, GapAnalyzer};
pub use schema::{CategorySchema, SchemaSet};
