//! Reminder scheduling: coverage debt, due times, quiet hours, escalation
//!
//! All time-dependent entry points take `now` explicitly so the logic is
//! testable without a clock. Times are stored as RFC 3339 UTC; quiet-hour
//! arithmetic happens in the user's own timezone.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::{debug, info, warn};

use crate::availability::Availability;
use crate::config::{PromptsConfig, ScheduleConfig};
use crate::db::HabitDB;
use crate::events::{CoreEvent, EventBus};
use crate::notify::Notifier;
use crate::registry::{generic_question, CategoryRegistry};
use crate::types::{Reminder, ReminderQuestion, ReminderStatus, User};

/// Debt multiplier for critical categories
const CRITICAL_DEBT_WEIGHT: f64 = 1.5;

/// How many recent reminders to scan for per-category frequency limits
const FREQUENCY_LOOKBACK: i64 = 100;

/// Coverage shortfall for one category over the lookback window
#[derive(Debug, Clone)]
pub struct DebtEntry {
    pub category: String,
    pub expected: f64,
    pub actual: i64,
    /// 0.0 = fully covered; critical categories are weighted above 1.0
    /// when completely uncovered
    pub debt: f64,
}

/// Interval until the next reminder, pulled earlier proportionally to the
/// worst outstanding debt and clamped to the configured bounds.
pub fn interval_minutes(max_debt: f64, min_minutes: i64, max_minutes: i64) -> i64 {
    let span = (max_minutes - min_minutes) as f64;
    let pulled = max_minutes as f64 - max_debt.clamp(0.0, 1.0) * span;
    (pulled as i64).clamp(min_minutes, max_minutes)
}

pub fn parse_utc(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}

fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .ok()
}

pub struct Scheduler {
    db: Arc<HabitDB>,
    registry: Arc<CategoryRegistry>,
    prompts: PromptsConfig,
    schedule_defaults: ScheduleConfig,
    availability: Arc<dyn Availability>,
    notifier: Arc<Notifier>,
    events: EventBus,
}

impl Scheduler {
    pub fn new(
        db: Arc<HabitDB>,
        registry: Arc<CategoryRegistry>,
        prompts: PromptsConfig,
        schedule_defaults: ScheduleConfig,
        availability: Arc<dyn Availability>,
        notifier: Arc<Notifier>,
        events: EventBus,
    ) -> Self {
        Self { db, registry, prompts, schedule_defaults, availability, notifier, events }
    }

    // ============ Coverage Debt ============

    /// Per-category coverage debt over the configured lookback window.
    /// Missed reminders contribute nothing to `actual`, so they raise
    /// debt implicitly.
    pub fn compute_debts(&self, user_id: &str, now: DateTime<Utc>) -> Result<Vec<DebtEntry>> {
        let since = (now - Duration::days(self.prompts.window_days)).to_rfc3339();
        let counts = self.db.category_counts_since(user_id, &since)?;
        Ok(self.debts_from_counts(&counts))
    }

    fn debts_from_counts(&self, counts: &HashMap<String, i64>) -> Vec<DebtEntry> {
        self.registry
            .ordered()
            .iter()
            .map(|spec| {
                let expected =
                    (spec.category.frequency_per_day * self.prompts.window_days) as f64;
                let actual = counts.get(&spec.category.name).copied().unwrap_or(0);
                let mut debt = if expected > 0.0 {
                    ((expected - actual as f64) / expected).clamp(0.0, 1.0)
                } else {
                    0.0
                };
                if spec.category.critical {
                    debt *= CRITICAL_DEBT_WEIGHT;
                }
                DebtEntry { category: spec.category.name.clone(), expected, actual, debt }
            })
            .collect()
    }

    pub fn debt_map(debts: &[DebtEntry]) -> HashMap<String, f64> {
        debts.iter().map(|d| (d.category.clone(), d.debt)).collect()
    }

    // ============ Quiet Hours ============

    fn user_tz(user: &User) -> Tz {
        user.timezone.parse().unwrap_or(Tz::UTC)
    }

    fn user_time(&self, user: &User, field: &Option<String>, default: &str) -> NaiveTime {
        field
            .as_deref()
            .and_then(parse_hhmm)
            .or_else(|| parse_hhmm(default))
            .unwrap_or_else(|| NaiveTime::from_hms_opt(8, 0, 0).unwrap())
    }

    /// Defer a candidate instant into the user's waking window. Window end
    /// is screens-off normally; a critically overdue category extends it
    /// to sleep time, but nothing schedules before wake or after sleep.
    pub fn clamp_to_waking_window(
        &self,
        candidate: DateTime<Utc>,
        user: &User,
        critical_overdue: bool,
    ) -> DateTime<Utc> {
        let tz = Self::user_tz(user);
        let wake = self.user_time(user, &user.wake_time, &self.schedule_defaults.wake_time);
        let screens_off =
            self.user_time(user, &user.screens_off_time, &self.schedule_defaults.screens_off);
        let sleep = self.user_time(user, &user.sleep_time, &self.schedule_defaults.sleep_time);
        let end = if critical_overdue { sleep.max(screens_off) } else { screens_off };

        let local = candidate.with_timezone(&tz);
        let time = local.time();

        let deferred_local = if time < wake {
            local.date_naive().and_time(wake)
        } else if time >= end {
            (local.date_naive() + Duration::days(1)).and_time(wake)
        } else {
            return candidate;
        };

        match tz.from_local_datetime(&deferred_local).earliest() {
            Some(dt) => dt.with_timezone(&Utc),
            None => candidate,
        }
    }

    /// Pull the candidate back to the target category's next preferred
    /// time of day, when one lands between now and the candidate.
    fn apply_preferred_time(
        &self,
        candidate: DateTime<Utc>,
        now: DateTime<Utc>,
        user: &User,
        category: &str,
    ) -> DateTime<Utc> {
        let spec = match self.registry.get(category) {
            Some(s) => s,
            None => return candidate,
        };
        if spec.category.preferred_times.is_empty() {
            return candidate;
        }
        let tz = Self::user_tz(user);
        let now_local = now.with_timezone(&tz);

        for preferred in &spec.category.preferred_times {
            let time = match parse_hhmm(preferred) {
                Some(t) => t,
                None => continue,
            };
            // next occurrence of this time-of-day: today or tomorrow
            for day_offset in 0..=1 {
                let local = (now_local.date_naive() + Duration::days(day_offset)).and_time(time);
                let instant = match tz.from_local_datetime(&local).earliest() {
                    Some(dt) => dt.with_timezone(&Utc),
                    None => continue,
                };
                if instant >= now && instant <= candidate {
                    debug!(category, preferred, "Snapping reminder to preferred time");
                    return instant;
                }
            }
        }
        candidate
    }

    // ============ Question Selection ============

    /// Hours since each category was last asked, from recent reminders
    fn last_asked_hours(&self, user_id: &str, now: DateTime<Utc>) -> Result<HashMap<String, f64>> {
        let reminders = self.db.recent_reminders(user_id, FREQUENCY_LOOKBACK)?;
        let mut last_asked: HashMap<String, f64> = HashMap::new();
        for reminder in &reminders {
            let asked_at = match parse_utc(&reminder.scheduled_time) {
                Some(t) => t,
                None => continue,
            };
            let hours = (now - asked_at).num_minutes() as f64 / 60.0;
            for category in &reminder.categories {
                // reminders are newest-first; keep the most recent ask
                last_asked.entry(category.clone()).or_insert(hours);
            }
        }
        Ok(last_asked)
    }

    /// Pick 1..max target categories: respect per-category re-ask limits,
    /// rank by debt, tie-break on registry order.
    fn select_categories(
        &self,
        debts: &[DebtEntry],
        last_asked: &HashMap<String, f64>,
    ) -> Vec<String> {
        let mut eligible: Vec<&DebtEntry> = debts
            .iter()
            .filter(|d| {
                let min_hours = self
                    .registry
                    .get(&d.category)
                    .map(|s| s.min_interval_hours)
                    .unwrap_or(12) as f64;
                match last_asked.get(&d.category) {
                    Some(&hours) => hours >= min_hours,
                    None => true,
                }
            })
            .collect();

        if eligible.is_empty() {
            // Everything was asked too recently; fall back to the
            // shortest-interval check-in
            let fallback =
                if self.registry.contains("mental_state") { "mental_state" } else { "" };
            debug!("No eligible categories, falling back to {}", fallback);
            return debts
                .iter()
                .filter(|d| d.category == fallback)
                .map(|d| d.category.clone())
                .collect();
        }

        eligible.sort_by(|a, b| {
            b.debt
                .partial_cmp(&a.debt)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    self.registry.position(&a.category).cmp(&self.registry.position(&b.category))
                })
        });

        eligible
            .into_iter()
            .take(self.prompts.max_questions_per_reminder.max(1))
            .map(|d| d.category.clone())
            .collect()
    }

    fn build_questions(&self, user_id: &str, categories: &[String]) -> Result<Vec<ReminderQuestion>> {
        let mut questions = Vec::new();
        for (i, category) in categories.iter().enumerate() {
            let cursor = self.db.next_template_cursor(user_id, category)?;
            let text = self
                .registry
                .template_at(category, cursor)
                .map(str::to_string)
                .unwrap_or_else(|| generic_question(category));
            questions.push(ReminderQuestion {
                key: format!("q{}", i + 1),
                text,
                category: category.clone(),
            });
        }
        Ok(questions)
    }

    // ============ Due-time Computation ============

    /// Compute and persist the next reminder for a user. Refuses to stack
    /// a second active reminder unless `force`; the refusal is logged and
    /// reported as zero created, never an error.
    pub fn generate_for_user(
        &self,
        user_id: &str,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let user = self
            .db
            .get_user(user_id)?
            .ok_or_else(|| anyhow!("User not found: {}", user_id))?;

        if !force {
            if let Some(active) = self.db.active_reminder_for_user(user_id)? {
                info!(
                    user_id,
                    active_id = %active.id,
                    status = active.status.as_str(),
                    "Skipping reminder generation: active reminder exists"
                );
                return Ok(0);
            }
        }

        let debts = self.compute_debts(user_id, now)?;
        let max_debt = debts.iter().map(|d| d.debt).fold(0.0_f64, f64::max);
        let critical_overdue = debts.iter().any(|d| {
            d.debt >= self.prompts.critical_debt_threshold
                && self.registry.get(&d.category).map(|s| s.category.critical).unwrap_or(false)
        });

        let last = self.db.last_reminder_time(user_id)?.and_then(|t| parse_utc(&t));
        let interval = interval_minutes(
            max_debt,
            self.prompts.min_interval_minutes,
            self.prompts.max_interval_minutes,
        );
        let mut candidate = match last {
            Some(last) => last + Duration::minutes(interval),
            None => now,
        };
        if candidate < now {
            candidate = now;
        }

        let last_asked = self.last_asked_hours(user_id, now)?;
        let categories = self.select_categories(&debts, &last_asked);
        if categories.is_empty() {
            warn!(user_id, "No categories available for reminder generation");
            return Ok(0);
        }

        candidate = self.apply_preferred_time(candidate, now, &user, &categories[0]);
        candidate = self.clamp_to_waking_window(candidate, &user, critical_overdue);

        let questions = self.build_questions(user_id, &categories)?;

        let reminder = Reminder {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            scheduled_time: candidate.to_rfc3339(),
            sent_at: None,
            acknowledged_at: None,
            categories: Reminder::categories_of(&questions),
            questions,
            status: ReminderStatus::Scheduled,
            escalation_level: 0,
            follow_up_round: 0,
            created_at: now.to_rfc3339(),
        };
        self.db.insert_reminder(&reminder)?;
        info!(
            user_id,
            reminder_id = %reminder.id,
            scheduled_time = %reminder.scheduled_time,
            categories = ?reminder.categories,
            max_debt,
            "Reminder scheduled"
        );
        self.events.emit(CoreEvent::ReminderScheduled {
            reminder_id: reminder.id.clone(),
            user_id: user_id.to_string(),
            scheduled_time: reminder.scheduled_time.clone(),
        });
        Ok(1)
    }

    // ============ Delivery & Escalation ============

    /// Send due reminders. A busy user defers the attempt by a short
    /// fixed delay instead of dropping it.
    pub async fn advance_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.db.due_scheduled_reminders(&now.to_rfc3339(), 50)?;
        let mut sent = 0;
        for reminder in due {
            let busy = match self.availability.busy_at(&reminder.user_id, &now.to_rfc3339()) {
                Ok(b) => b,
                Err(e) => {
                    // Availability-check failure is transient; try again
                    // next tick rather than blocking delivery forever
                    warn!(reminder_id = %reminder.id, error = %e, "Availability check failed");
                    false
                }
            };
            if busy {
                let deferred = now + Duration::minutes(self.prompts.busy_defer_minutes);
                if self.db.defer_reminder(&reminder.id, &deferred.to_rfc3339())? {
                    debug!(
                        reminder_id = %reminder.id,
                        deferred_to = %deferred.to_rfc3339(),
                        "User busy, reminder deferred"
                    );
                }
                continue;
            }

            if self.db.mark_reminder_sent(&reminder.id, &now.to_rfc3339())? {
                sent += 1;
                info!(reminder_id = %reminder.id, user_id = %reminder.user_id, "Reminder sent");
                self.events.emit(CoreEvent::ReminderSent {
                    reminder_id: reminder.id.clone(),
                    user_id: reminder.user_id.clone(),
                });
                self.notifier.send_reminder(&reminder, 0).await;
            }
        }
        Ok(sent)
    }

    /// Fire escalations for sent-but-unacknowledged reminders, and
    /// transition to missed past the last offset. Works purely from the
    /// persisted sent_at/escalation_level, so it also recovers after a
    /// restart.
    pub async fn fire_escalations(&self, now: DateTime<Utc>) -> Result<usize> {
        let offsets = &self.prompts.escalation_offsets_minutes;
        if offsets.is_empty() {
            return Ok(0);
        }
        let mut fired = 0;

        for reminder in self.db.sent_unacknowledged()? {
            let sent_at = match reminder.sent_at.as_deref().and_then(parse_utc) {
                Some(t) => t,
                None => continue,
            };
            let elapsed = (now - sent_at).num_minutes();
            let last_offset = *offsets.last().unwrap_or(&0);

            if elapsed > last_offset {
                // Past the whole escalation window: missed, and the next
                // cycle starts immediately
                if self.db.mark_reminder_missed(&reminder.id)? {
                    info!(
                        reminder_id = %reminder.id,
                        user_id = %reminder.user_id,
                        elapsed_minutes = elapsed,
                        "Reminder missed"
                    );
                    self.events.emit(CoreEvent::ReminderMissed {
                        reminder_id: reminder.id.clone(),
                        user_id: reminder.user_id.clone(),
                    });
                    self.generate_for_user(&reminder.user_id, false, now)?;
                }
                continue;
            }

            let mut level = reminder.escalation_level;
            while (level as usize) < offsets.len() && elapsed >= offsets[level as usize] {
                level += 1;
                if self.db.set_escalation_level(&reminder.id, level)? {
                    fired += 1;
                    info!(reminder_id = %reminder.id, level, "Escalating reminder");
                    self.events.emit(CoreEvent::ReminderEscalated {
                        reminder_id: reminder.id.clone(),
                        user_id: reminder.user_id.clone(),
                        level,
                    });
                    self.notifier.send_reminder(&reminder, level).await;
                } else {
                    // Acknowledged between the query and the CAS
                    break;
                }
            }
        }
        Ok(fired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NotifyConfig, PromptsConfig, ScheduleConfig};
    use crate::types::ProcessingStatus;
    use tempfile::tempdir;

    struct NeverBusy;
    impl Availability for NeverBusy {
        fn busy_at(&self, _user_id: &str, _at: &str) -> Result<bool> {
            Ok(false)
        }
    }

    struct AlwaysBusy;
    impl Availability for AlwaysBusy {
        fn busy_at(&self, _user_id: &str, _at: &str) -> Result<bool> {
            Ok(true)
        }
    }

    fn utc(s: &str) -> DateTime<Utc> {
        parse_utc(s).unwrap()
    }

    fn setup(availability: Arc<dyn Availability>) -> (tempfile::TempDir, Arc<HabitDB>, Scheduler) {
        let dir = tempdir().unwrap();
        let db = Arc::new(HabitDB::open(dir.path().join("test.db")).unwrap());
        let registry = Arc::new(CategoryRegistry::from_config(&[]).unwrap());
        let notifier = Arc::new(Notifier::new(&NotifyConfig::default()).unwrap());
        let scheduler = Scheduler::new(
            db.clone(),
            registry,
            PromptsConfig::default(),
            ScheduleConfig::default(),
            availability,
            notifier,
            EventBus::default(),
        );
        (dir, db, scheduler)
    }

    fn seed_user(db: &HabitDB) -> User {
        let now = chrono::Utc::now().to_rfc3339();
        let user = User {
            id: "user-1".into(),
            name: "Test".into(),
            timezone: "UTC".into(),
            wake_time: Some("06:30".into()),
            sleep_time: Some("22:30".into()),
            screens_off_time: Some("21:00".into()),
            bed_time: Some("22:00".into()),
            created_at: now.clone(),
            updated_at: now,
            deleted_at: None,
        };
        db.insert_user(&user).unwrap();
        user
    }

    fn seed_response(db: &HabitDB, user_id: &str, category: &str, timestamp: &str) {
        let response = crate::types::Response {
            id: uuid::Uuid::new_v4().to_string(),
            reminder_id: None,
            user_id: user_id.into(),
            question_key: None,
            question_text: "q".into(),
            response_text: "a".into(),
            response_structured: None,
            category: category.into(),
            timestamp: timestamp.into(),
            processing_status: ProcessingStatus::Completed,
            processing_attempts: 1,
            last_error: None,
            last_raw_output: None,
            created_at: timestamp.into(),
            deleted_at: None,
        };
        db.insert_response(&response).unwrap();
    }

    #[test]
    fn test_interval_pulled_by_debt() {
        assert_eq!(interval_minutes(0.0, 120, 300), 300);
        assert_eq!(interval_minutes(1.0, 120, 300), 120);
        assert_eq!(interval_minutes(0.5, 120, 300), 210);
        // over-weighted critical debt still clamps at the minimum
        assert_eq!(interval_minutes(1.5, 120, 300), 120);
    }

    #[test]
    fn test_debt_computation() {
        let (_dir, db, scheduler) = setup(Arc::new(NeverBusy));
        let user = seed_user(&db);
        let now = utc("2024-06-01T12:00:00Z");
        // mental_state expects 4/day; give it 2 responses
        seed_response(&db, &user.id, "mental_state", "2024-06-01T08:00:00Z");
        seed_response(&db, &user.id, "mental_state", "2024-06-01T10:00:00Z");

        let debts = scheduler.compute_debts(&user.id, now).unwrap();
        let mental = debts.iter().find(|d| d.category == "mental_state").unwrap();
        // (4-2)/4 = 0.5, critical weight 1.5 => 0.75
        assert!((mental.debt - 0.75).abs() < 1e-9);

        let sleep = debts.iter().find(|d| d.category == "sleep").unwrap();
        // fully uncovered critical category
        assert!((sleep.debt - 1.5).abs() < 1e-9);

        let env = debts.iter().find(|d| d.category == "environment").unwrap();
        assert!((env.debt - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_preferred_time_pulls_candidate_back() {
        use crate::config::CategoryConfig;
        let dir = tempdir().unwrap();
        let db = Arc::new(HabitDB::open(dir.path().join("test.db")).unwrap());
        let overrides = vec![CategoryConfig {
            name: "nutrition".into(),
            preferred_times: Some(vec!["12:30".into()]),
            ..Default::default()
        }];
        let registry = Arc::new(CategoryRegistry::from_config(&overrides).unwrap());
        let notifier = Arc::new(Notifier::new(&NotifyConfig::default()).unwrap());
        let scheduler = Scheduler::new(
            db.clone(),
            registry,
            PromptsConfig::default(),
            ScheduleConfig::default(),
            Arc::new(NeverBusy),
            notifier,
            EventBus::default(),
        );
        let user = seed_user(&db);

        let now = utc("2024-06-01T10:00:00Z");
        let candidate = utc("2024-06-01T15:00:00Z");
        // 12:30 lies between now and the candidate: snap to it
        assert_eq!(
            scheduler.apply_preferred_time(candidate, now, &user, "nutrition"),
            utc("2024-06-01T12:30:00Z")
        );
        // today's 12:30 already passed, tomorrow's is beyond the candidate
        let later = utc("2024-06-01T13:00:00Z");
        assert_eq!(scheduler.apply_preferred_time(candidate, later, &user, "nutrition"), candidate);
        // categories without preferred times are untouched
        assert_eq!(scheduler.apply_preferred_time(candidate, now, &user, "sleep"), candidate);
    }

    #[test]
    fn test_quiet_hours_defer_to_next_wake() {
        let (_dir, db, scheduler) = setup(Arc::new(NeverBusy));
        let user = seed_user(&db);

        // 22:00 UTC is past screens-off (21:00): defer to 06:30 next day
        let candidate = utc("2024-06-01T22:00:00Z");
        let clamped = scheduler.clamp_to_waking_window(candidate, &user, false);
        assert_eq!(clamped.to_rfc3339(), utc("2024-06-02T06:30:00Z").to_rfc3339());

        // 05:00 is before wake: defer to wake the same day
        let candidate = utc("2024-06-01T05:00:00Z");
        let clamped = scheduler.clamp_to_waking_window(candidate, &user, false);
        assert_eq!(clamped.to_rfc3339(), utc("2024-06-01T06:30:00Z").to_rfc3339());

        // inside the window: untouched
        let candidate = utc("2024-06-01T12:00:00Z");
        let clamped = scheduler.clamp_to_waking_window(candidate, &user, false);
        assert_eq!(clamped, candidate);
    }

    #[test]
    fn test_critical_overdue_extends_into_screens_off() {
        let (_dir, db, scheduler) = setup(Arc::new(NeverBusy));
        let user = seed_user(&db);

        // 21:30 is inside screens-off but before sleep (22:30)
        let candidate = utc("2024-06-01T21:30:00Z");
        assert_eq!(
            scheduler.clamp_to_waking_window(candidate, &user, true),
            candidate
        );
        // but never after sleep time
        let candidate = utc("2024-06-01T23:00:00Z");
        let clamped = scheduler.clamp_to_waking_window(candidate, &user, true);
        assert_eq!(clamped.to_rfc3339(), utc("2024-06-02T06:30:00Z").to_rfc3339());
    }

    #[test]
    fn test_quiet_hours_respect_user_timezone() {
        let (_dir, db, scheduler) = setup(Arc::new(NeverBusy));
        let mut user = seed_user(&db);
        user.timezone = "America/New_York".into();

        // 18:00 UTC = 14:00 EDT in June: inside the waking window
        let candidate = utc("2024-06-01T18:00:00Z");
        assert_eq!(scheduler.clamp_to_waking_window(candidate, &user, false), candidate);

        // 02:00 UTC = 22:00 EDT: past screens-off, defers to 06:30 EDT
        let candidate = utc("2024-06-02T02:00:00Z");
        let clamped = scheduler.clamp_to_waking_window(candidate, &user, false);
        assert_eq!(clamped.to_rfc3339(), utc("2024-06-02T10:30:00Z").to_rfc3339());
    }

    #[test]
    fn test_no_second_active_reminder() {
        let (_dir, db, scheduler) = setup(Arc::new(NeverBusy));
        let user = seed_user(&db);
        let now = utc("2024-06-01T12:00:00Z");

        assert_eq!(scheduler.generate_for_user(&user.id, false, now).unwrap(), 1);
        // second computation is rejected while the first is active
        assert_eq!(scheduler.generate_for_user(&user.id, false, now).unwrap(), 0);
        // unless forced
        assert_eq!(scheduler.generate_for_user(&user.id, true, now).unwrap(), 1);
    }

    #[test]
    fn test_all_covered_schedules_at_max_interval() {
        let (_dir, db, scheduler) = setup(Arc::new(NeverBusy));
        let user = seed_user(&db);
        let now = utc("2024-06-01T12:00:00Z");

        // Saturate every category so all debts are zero
        let registry = CategoryRegistry::from_config(&[]).unwrap();
        for spec in registry.ordered() {
            for _ in 0..spec.category.frequency_per_day {
                seed_response(&db, &user.id, &spec.category.name, "2024-06-01T11:00:00Z");
            }
        }

        // last reminder was 2 hours ago
        let last = utc("2024-06-01T10:00:00Z");
        let questions = vec![ReminderQuestion {
            key: "q1".into(),
            text: "t".into(),
            category: "sleep".into(),
        }];
        let prior = Reminder {
            id: "prior".into(),
            user_id: user.id.clone(),
            scheduled_time: last.to_rfc3339(),
            sent_at: Some(last.to_rfc3339()),
            acknowledged_at: Some(last.to_rfc3339()),
            categories: Reminder::categories_of(&questions),
            questions,
            status: ReminderStatus::Completed,
            escalation_level: 0,
            follow_up_round: 0,
            created_at: last.to_rfc3339(),
        };
        db.insert_reminder(&prior).unwrap();

        assert_eq!(scheduler.generate_for_user(&user.id, false, now).unwrap(), 1);
        let created = db.upcoming_reminders(&user.id, 10).unwrap();
        assert_eq!(created.len(), 1);
        // next due = last + max_interval (300m) = 15:00, inside waking hours
        assert_eq!(
            parse_utc(&created[0].scheduled_time).unwrap(),
            utc("2024-06-01T15:00:00Z")
        );
    }

    #[test]
    fn test_question_selection_prefers_high_debt() {
        let (_dir, db, scheduler) = setup(Arc::new(NeverBusy));
        let user = seed_user(&db);
        let now = utc("2024-06-01T12:00:00Z");

        scheduler.generate_for_user(&user.id, false, now).unwrap();
        let created = &db.upcoming_reminders(&user.id, 10).unwrap()[0];

        // nothing covered: the three critical categories carry 1.5 debt
        // and win, in registry order
        assert_eq!(created.categories, vec!["sleep", "mental_state", "stress_anxiety"]);
        assert_eq!(created.questions.len(), 3);
        assert_eq!(created.questions[0].key, "q1");
    }

    #[test]
    fn test_frequency_limit_excludes_recently_asked() {
        let (_dir, db, scheduler) = setup(Arc::new(NeverBusy));
        let user = seed_user(&db);
        let now = utc("2024-06-01T12:00:00Z");

        // sleep was asked 2 hours ago (min re-ask interval is 24h)
        let asked = utc("2024-06-01T10:00:00Z");
        let questions = vec![ReminderQuestion {
            key: "q1".into(),
            text: "t".into(),
            category: "sleep".into(),
        }];
        db.insert_reminder(&Reminder {
            id: "prior".into(),
            user_id: user.id.clone(),
            scheduled_time: asked.to_rfc3339(),
            sent_at: Some(asked.to_rfc3339()),
            acknowledged_at: None,
            categories: Reminder::categories_of(&questions),
            questions,
            status: ReminderStatus::Missed,
            escalation_level: 3,
            follow_up_round: 0,
            created_at: asked.to_rfc3339(),
        })
        .unwrap();

        scheduler.generate_for_user(&user.id, false, now).unwrap();
        let created = &db.upcoming_reminders(&user.id, 10).unwrap()[0];
        assert!(!created.categories.contains(&"sleep".to_string()));
    }

    #[tokio::test]
    async fn test_busy_user_defers_delivery() {
        let (_dir, db, scheduler) = setup(Arc::new(AlwaysBusy));
        let user = seed_user(&db);
        let now = utc("2024-06-01T12:00:00Z");

        scheduler.generate_for_user(&user.id, false, now).unwrap();
        let sent = scheduler.advance_due(now).await.unwrap();
        assert_eq!(sent, 0);

        let reminder = &db.upcoming_reminders(&user.id, 10).unwrap()[0];
        assert_eq!(reminder.status, ReminderStatus::Scheduled);
        // pushed 15 minutes out
        assert_eq!(
            parse_utc(&reminder.scheduled_time).unwrap(),
            now + Duration::minutes(15)
        );
    }

    #[tokio::test]
    async fn test_escalation_sequence_and_missed() {
        let (_dir, db, scheduler) = setup(Arc::new(NeverBusy));
        let user = seed_user(&db);
        let sent_at = utc("2024-06-01T12:00:00Z");

        scheduler.generate_for_user(&user.id, false, sent_at).unwrap();
        scheduler.advance_due(sent_at).await.unwrap();
        let reminder = db.sent_unacknowledged().unwrap().pop().unwrap();

        // T+4: nothing fires
        assert_eq!(scheduler.fire_escalations(sent_at + Duration::minutes(4)).await.unwrap(), 0);

        // T+6: first escalation
        assert_eq!(scheduler.fire_escalations(sent_at + Duration::minutes(6)).await.unwrap(), 1);
        assert_eq!(db.get_reminder(&reminder.id).unwrap().unwrap().escalation_level, 1);

        // T+16: second
        assert_eq!(scheduler.fire_escalations(sent_at + Duration::minutes(16)).await.unwrap(), 1);

        // T+35 exactly: third escalation fires, not yet missed
        assert_eq!(scheduler.fire_escalations(sent_at + Duration::minutes(35)).await.unwrap(), 1);
        let loaded = db.get_reminder(&reminder.id).unwrap().unwrap();
        assert_eq!(loaded.escalation_level, 3);
        assert_eq!(loaded.status, ReminderStatus::Sent);

        // strictly after the last offset: missed, and the next reminder
        // is scheduled immediately
        scheduler.fire_escalations(sent_at + Duration::minutes(36)).await.unwrap();
        let loaded = db.get_reminder(&reminder.id).unwrap().unwrap();
        assert_eq!(loaded.status, ReminderStatus::Missed);
        assert!(db.active_reminder_for_user(&user.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_restart_recovery_marks_old_sent_as_missed() {
        let (_dir, db, scheduler) = setup(Arc::new(NeverBusy));
        let user = seed_user(&db);
        let sent_at = utc("2024-06-01T12:00:00Z");

        scheduler.generate_for_user(&user.id, false, sent_at).unwrap();
        scheduler.advance_due(sent_at).await.unwrap();
        let reminder = db.sent_unacknowledged().unwrap().pop().unwrap();

        // Simulated restart 40 minutes later: no in-memory timers, one
        // escalation pass catches up directly to missed
        scheduler.fire_escalations(sent_at + Duration::minutes(40)).await.unwrap();
        assert_eq!(
            db.get_reminder(&reminder.id).unwrap().unwrap().status,
            ReminderStatus::Missed
        );
    }

    #[tokio::test]
    async fn test_acknowledged_reminder_stops_escalating() {
        let (_dir, db, scheduler) = setup(Arc::new(NeverBusy));
        let user = seed_user(&db);
        let sent_at = utc("2024-06-01T12:00:00Z");

        scheduler.generate_for_user(&user.id, false, sent_at).unwrap();
        scheduler.advance_due(sent_at).await.unwrap();
        let reminder = db.sent_unacknowledged().unwrap().pop().unwrap();
        db.acknowledge_reminder(&reminder.id, &sent_at.to_rfc3339()).unwrap();

        assert_eq!(
            scheduler.fire_escalations(sent_at + Duration::minutes(40)).await.unwrap(),
            0
        );
        let loaded = db.get_reminder(&reminder.id).unwrap().unwrap();
        assert_eq!(loaded.status, ReminderStatus::Acknowledged);
        assert_eq!(loaded.escalation_level, 0);
    }
}
