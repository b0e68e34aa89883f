//! External busy/free availability signal
//!
//! The calendar wrapper (out of scope) syncs events into the
//! calendar_events table; the scheduler consults this trait before
//! sending a reminder. Failures are reported, not swallowed — the caller
//! decides whether to defer or send anyway.

use std::sync::Arc;

use anyhow::Result;

use crate::db::HabitDB;

/// Busy/free signal consulted before sending a reminder
pub trait Availability: Send + Sync {
    /// Is the user busy (non-interruptible) at the given instant?
    fn busy_at(&self, user_id: &str, at: &str) -> Result<bool>;
}

/// Availability backed by synced calendar events
pub struct CalendarAvailability {
    db: Arc<HabitDB>,
}

impl CalendarAvailability {
    pub fn new(db: Arc<HabitDB>) -> Self {
        Self { db }
    }
}

impl Availability for CalendarAvailability {
    fn busy_at(&self, user_id: &str, at: &str) -> Result<bool> {
        Ok(self.db.busy_at(user_id, at)?)
    }
}
