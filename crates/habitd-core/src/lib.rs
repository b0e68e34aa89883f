//! habitd-core - core library for the habitd check-in daemon
//!
//! Provides:
//! - Domain types and SQLite persistence
//! - Category registry with question template banks
//! - LLM client plus extraction / gap-analysis / consolidation engines
//! - Reminder scheduler with coverage debt, quiet hours, and escalation
//! - Core event bus for change notifications

pub mod availability;
pub mod config;
pub mod core;
pub mod db;
pub mod events;
pub mod llm;
pub mod notify;
pub mod registry;
pub mod types;

pub use crate::availability::{Availability, CalendarAvailability};
pub use crate::config::AppConfig;
pub use crate::core::{CheckinControl, CheckinControlOptions, ExtractionWorker, Scheduler};
pub use crate::db::HabitDB;
pub use crate::events::{CoreEvent, EventBus};
pub use crate::llm::{
    ChatModel, Consolidator, ExtractionOutcome, Extractor, Gap, GapAnalyzer, LlmClient, LlmError,
};
pub use crate::registry::CategoryRegistry;
