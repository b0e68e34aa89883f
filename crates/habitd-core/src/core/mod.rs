//! Core module for habitd
//!
//! This module provides the core management components:
//! - Scheduler: coverage debt, due times, quiet hours, escalation
//! - CheckinControl: main coordinator and session lifecycle
//! - ExtractionWorker: background drain of pending responses

mod checkin_control;
mod scheduler;
mod worker;

pub use checkin_control::{CheckinControl, CheckinControlOptions};
pub use scheduler::{interval_minutes, parse_utc, DebtEntry, Scheduler};
pub use worker::ExtractionWorker;
