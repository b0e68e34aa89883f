//! Checkin Control - Main coordinator
//!
//! Owns the database, category registry, LLM engines, and scheduler, and
//! implements every core-facing operation. The session lifecycle
//! (respond -> gap analysis -> follow-ups -> consolidate -> complete)
//! lives here.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::availability::CalendarAvailability;
use crate::config::AppConfig;
use crate::core::scheduler::{parse_utc, Scheduler};
use crate::db::HabitDB;
use crate::events::{CoreEvent, EventBus};
use crate::llm::{
    AttemptSink, ChatModel, Consolidator, ExtractionOutcome, Extractor, GapAnalyzer, LlmClient,
    SchemaSet,
};
use crate::notify::Notifier;
use crate::registry::CategoryRegistry;
use crate::types::{
    CategoryDetection, CreateResponseInput, ProcessingStatus, QuickLogResult, Reminder,
    ReminderQuestion, ReminderStatus, Response, ResponseFilter, SessionQa, SessionRecord, User,
    UserUpdate,
};

/// Options for creating CheckinControl
pub struct CheckinControlOptions {
    /// Database path
    pub db_path: PathBuf,
    /// Full application configuration
    pub config: AppConfig,
}

/// Checkin Control
///
/// Main coordinator for reminders, responses, and the extraction pipeline.
pub struct CheckinControl {
    db: Arc<HabitDB>,
    registry: Arc<CategoryRegistry>,
    config: AppConfig,
    scheduler: Scheduler,
    extractor: Extractor,
    gap_analyzer: GapAnalyzer,
    consolidator: Consolidator,
    schemas: SchemaSet,
    fast_model: Arc<dyn ChatModel>,
    /// Concrete client kept for health checks; absent when running on
    /// injected models (tests, alternative backends)
    llm_client: Option<Arc<LlmClient>>,
    events: EventBus,
}

/// Persists each extraction attempt on the owning response row
struct DbAttemptSink {
    db: Arc<HabitDB>,
    response_id: String,
}

impl AttemptSink for DbAttemptSink {
    fn record(&self, attempts: i64, error: Option<&str>, raw_output: Option<&str>) {
        if let Err(e) =
            self.db.record_extraction_attempt(&self.response_id, attempts, error, raw_output)
        {
            warn!(response_id = %self.response_id, error = %e, "Failed to persist extraction attempt");
        }
    }
}

impl CheckinControl {
    /// Create a new CheckinControl backed by the configured LLM endpoint
    pub fn new(options: CheckinControlOptions) -> Result<Self> {
        let semaphore = Arc::new(Semaphore::new(options.config.llm.concurrency.max(1)));
        let main = Arc::new(LlmClient::new(
            &options.config.llm,
            options.config.llm.model.clone(),
            semaphore.clone(),
        )?);
        let fast = Arc::new(LlmClient::new(
            &options.config.llm,
            options.config.llm.model_fast.clone(),
            semaphore,
        )?);
        Self::build(options, main.clone() as Arc<dyn ChatModel>, fast, Some(main))
    }

    /// Create a CheckinControl on injected chat models (test harnesses,
    /// alternative backends)
    pub fn with_models(
        options: CheckinControlOptions,
        model: Arc<dyn ChatModel>,
        fast_model: Arc<dyn ChatModel>,
    ) -> Result<Self> {
        Self::build(options, model, fast_model, None)
    }

    fn build(
        options: CheckinControlOptions,
        model: Arc<dyn ChatModel>,
        fast_model: Arc<dyn ChatModel>,
        llm_client: Option<Arc<LlmClient>>,
    ) -> Result<Self> {
        let config = options.config;
        let db = Arc::new(HabitDB::open(&options.db_path)?);
        let registry = Arc::new(CategoryRegistry::from_config(&config.categories)?);
        let events = EventBus::default();
        let notifier = Arc::new(Notifier::new(&config.notify)?);
        let availability = Arc::new(CalendarAvailability::new(db.clone()));

        let scheduler = Scheduler::new(
            db.clone(),
            registry.clone(),
            config.prompts.clone(),
            config.schedule.clone(),
            availability,
            notifier,
            events.clone(),
        );

        let extractor = Extractor::new(model.clone(), config.llm.extract_temperature);
        let gap_analyzer =
            GapAnalyzer::new(model.clone(), config.llm.analysis_temperature, config.llm.max_follow_ups);
        let consolidator = Consolidator::new(model, config.llm.consolidate_temperature);

        let schemas = SchemaSet::from_config(&config.categories);
        let control = Self {
            db,
            registry,
            config,
            scheduler,
            extractor,
            gap_analyzer,
            consolidator,
            schemas,
            fast_model,
            llm_client,
            events,
        };
        control.ensure_default_user()?;
        info!("CheckinControl initialized");
        Ok(control)
    }

    /// Seed the configured default user on first start
    fn ensure_default_user(&self) -> Result<()> {
        if !self.db.list_users()?.is_empty() {
            return Ok(());
        }
        let now = Utc::now().to_rfc3339();
        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            name: self.config.user.name.clone(),
            timezone: self.config.user.timezone.clone(),
            wake_time: Some(self.config.schedule.wake_time.clone()),
            sleep_time: Some(self.config.schedule.sleep_time.clone()),
            screens_off_time: Some(self.config.schedule.screens_off.clone()),
            bed_time: Some(self.config.schedule.bed_time.clone()),
            created_at: now.clone(),
            updated_at: now,
            deleted_at: None,
        };
        self.db.insert_user(&user)?;
        info!(user_id = %user.id, name = %user.name, "Seeded default user");
        Ok(())
    }

    pub fn db(&self) -> &Arc<HabitDB> {
        &self.db
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn registry(&self) -> &CategoryRegistry {
        &self.registry
    }

    // ============ Users ============

    pub fn get_user(&self, id: &str) -> Result<Option<User>> {
        Ok(self.db.get_user(id)?)
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        Ok(self.db.list_users()?)
    }

    pub fn update_user(&self, id: &str, update: &UserUpdate) -> Result<User> {
        if let Some(tz) = &update.timezone {
            if tz.parse::<chrono_tz::Tz>().is_err() {
                bail!("Unknown timezone: {}", tz);
            }
        }
        self.db.update_user(id, update)?.ok_or_else(|| anyhow!("User not found: {}", id))
    }

    // ============ Responses ============

    /// Submit a raw response. Empty answers are explicit skips and never
    /// enter the extraction pipeline.
    pub async fn create_response(&self, input: CreateResponseInput) -> Result<Response> {
        if input.user_id.trim().is_empty() {
            bail!("userId must not be empty");
        }
        if input.question_text.trim().is_empty() {
            bail!("questionText must not be empty");
        }
        if input.category.trim().is_empty() {
            bail!("category must not be empty");
        }
        if self.db.get_user(&input.user_id)?.is_none() {
            bail!("User not found: {}", input.user_id);
        }
        if let Some(reminder_id) = &input.reminder_id {
            if self.db.get_reminder(reminder_id)?.is_none() {
                bail!("Reminder not found: {}", reminder_id);
            }
        }

        let now = Utc::now().to_rfc3339();
        let timestamp = match &input.timestamp {
            Some(t) => {
                parse_utc(t).ok_or_else(|| anyhow!("Invalid timestamp: {}", t))?.to_rfc3339()
            }
            None => now.clone(),
        };

        let is_skip = input.response_text.trim().is_empty();
        let response = Response {
            id: uuid::Uuid::new_v4().to_string(),
            reminder_id: input.reminder_id.clone(),
            user_id: input.user_id.clone(),
            question_key: input.question_key.clone(),
            question_text: input.question_text.clone(),
            response_text: input.response_text.clone(),
            response_structured: None,
            category: input.category.clone(),
            timestamp,
            // a skip has nothing to extract
            processing_status: if is_skip {
                ProcessingStatus::Completed
            } else {
                ProcessingStatus::Pending
            },
            processing_attempts: 0,
            last_error: None,
            last_raw_output: None,
            created_at: now,
            deleted_at: None,
        };
        self.db.insert_response(&response)?;
        debug!(response_id = %response.id, category = %response.category, skip = is_skip, "Response created");
        if !is_skip {
            self.events.emit(CoreEvent::ResponseQueued {
                response_id: response.id.clone(),
                user_id: response.user_id.clone(),
            });
        }

        if let Some(reminder_id) = &input.reminder_id {
            if let Err(e) = self.advance_session(reminder_id).await {
                warn!(reminder_id = %reminder_id, error = %e, "Session advance failed, will retry on tick");
            }
        }
        Ok(response)
    }

    pub fn list_responses(&self, filter: &ResponseFilter) -> Result<Vec<Response>> {
        Ok(self.db.list_responses(filter)?)
    }

    pub fn get_response(&self, id: &str) -> Result<Option<Response>> {
        Ok(self.db.get_response(id)?)
    }

    /// Soft-delete a response; cancels any in-flight extraction for it
    pub fn delete_response(&self, id: &str) -> Result<bool> {
        Ok(self.db.soft_delete_response(id)?)
    }

    // ============ Extraction Pipeline ============

    /// Run the extraction engine for one response. Idempotent: an
    /// already-completed response is a successful no-op; a claimed or
    /// failed one reports false without touching anything.
    pub async fn process_response(&self, id: &str) -> Result<bool> {
        let response =
            self.db.get_response(id)?.ok_or_else(|| anyhow!("Response not found: {}", id))?;
        if response.deleted_at.is_some() {
            return Ok(false);
        }
        match response.processing_status {
            ProcessingStatus::Completed => return Ok(true),
            ProcessingStatus::Processing | ProcessingStatus::Failed => return Ok(false),
            ProcessingStatus::Pending => {}
        }

        if !self.db.claim_response_for_processing(id)? {
            // lost the claim race; report what the winner produced
            let current = self.db.get_response(id)?;
            return Ok(matches!(
                current.map(|r| r.processing_status),
                Some(ProcessingStatus::Completed)
            ));
        }

        let schema = self.schemas.get(&response.category);
        let sink = DbAttemptSink { db: self.db.clone(), response_id: id.to_string() };
        let outcome = self
            .extractor
            .extract(
                &response.response_text,
                &response.question_text,
                schema,
                response.processing_attempts,
                self.config.llm.max_retries,
                &sink,
            )
            .await;

        match outcome {
            ExtractionOutcome::Success { value, attempts } => {
                if self.db.complete_response_processing(id, &value)? {
                    info!(response_id = %id, attempts, category = %response.category, "Response extracted");
                    self.events.emit(CoreEvent::ResponseCompleted {
                        response_id: id.to_string(),
                        user_id: response.user_id.clone(),
                    });
                    Ok(true)
                } else {
                    debug!(response_id = %id, "Response deleted mid-extraction, result dropped");
                    Ok(false)
                }
            }
            ExtractionOutcome::NeedsManualReview { error, last_raw, attempts } => {
                if self.db.fail_response_processing(id, &error, last_raw.as_deref())? {
                    warn!(response_id = %id, attempts, error = %error, "Extraction needs manual review");
                    self.events.emit(CoreEvent::ResponseFailed {
                        response_id: id.to_string(),
                        user_id: response.user_id.clone(),
                        error,
                    });
                }
                Ok(false)
            }
        }
    }

    /// Manual-review recovery: reset a failed response to a fresh attempt
    /// budget and run extraction again.
    pub async fn reprocess_response(&self, id: &str) -> Result<bool> {
        if !self.db.reset_response_processing(id)? {
            bail!("Response {} is not in a failed state", id);
        }
        self.process_response(id).await
    }

    // ============ Reminders ============

    pub fn get_reminder(&self, id: &str) -> Result<Option<Reminder>> {
        Ok(self.db.get_reminder(id)?)
    }

    pub fn reminder_responses(&self, reminder_id: &str) -> Result<Vec<Response>> {
        Ok(self.db.responses_for_reminder(reminder_id)?)
    }

    pub fn upcoming_reminders(&self, user_id: &str, limit: i64) -> Result<Vec<Reminder>> {
        Ok(self.db.upcoming_reminders(user_id, limit)?)
    }

    /// Explicit acknowledgement (viewing a reminder does not acknowledge)
    pub fn acknowledge_reminder(&self, id: &str) -> Result<bool> {
        let reminder =
            self.db.get_reminder(id)?.ok_or_else(|| anyhow!("Reminder not found: {}", id))?;
        let ok = self.db.acknowledge_reminder(id, &Utc::now().to_rfc3339())?;
        if ok {
            info!(reminder_id = %id, "Reminder acknowledged");
            self.events.emit(CoreEvent::ReminderAcknowledged {
                reminder_id: id.to_string(),
                user_id: reminder.user_id,
            });
        }
        Ok(ok)
    }

    /// Run one due-time computation for a user; returns reminders created
    pub fn generate_reminders(&self, user_id: &str, force: bool) -> Result<usize> {
        self.scheduler.generate_for_user(user_id, force, Utc::now())
    }

    // ============ Quick Log ============

    async fn detect_category(&self, text: &str) -> CategoryDetection {
        let known: Vec<String> =
            self.registry.ordered().iter().map(|s| s.category.name.clone()).collect();
        let system = format!(
            "You are a health tracking assistant. Categorize the user's log entry into \
             exactly one of these categories: {}.\n\n\
             Respond with JSON only:\n\
             {{\"category\": \"<name>\", \"confidence\": \"high|medium|low\", \
             \"suggested_question\": \"a question that would have prompted this entry\"}}",
            known.join(", ")
        );
        let fallback = CategoryDetection {
            category: "mental_state".to_string(),
            confidence: "low".to_string(),
            suggested_question: "What would you like to log?".to_string(),
        };

        let reply = match self
            .fast_model
            .generate(&format!("Log entry: {}", text), Some(&system), 0.1, 512)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Category detection failed, defaulting to mental_state");
                return fallback;
            }
        };
        let cleaned = Extractor::strip_code_fences(&reply);
        let parsed: serde_json::Value = match serde_json::from_str(cleaned) {
            Ok(v) => v,
            Err(_) => return fallback,
        };
        let category = parsed
            .get("category")
            .and_then(|c| c.as_str())
            .filter(|c| self.registry.contains(c))
            .unwrap_or("mental_state")
            .to_string();
        CategoryDetection {
            category,
            confidence: parsed
                .get("confidence")
                .and_then(|c| c.as_str())
                .unwrap_or("medium")
                .to_string(),
            suggested_question: parsed
                .get("suggested_question")
                .and_then(|q| q.as_str())
                .unwrap_or("What would you like to log?")
                .to_string(),
        }
    }

    /// Ad-hoc entry: detect the category, wrap the text in a completed
    /// ad-hoc reminder, and queue extraction.
    pub async fn quick_log(
        &self,
        user_id: &str,
        text: &str,
        timestamp: Option<String>,
    ) -> Result<QuickLogResult> {
        if text.trim().is_empty() {
            bail!("text must not be empty");
        }
        if self.db.get_user(user_id)?.is_none() {
            bail!("User not found: {}", user_id);
        }

        let detection = self.detect_category(text).await;
        let now = Utc::now().to_rfc3339();
        let entry_time = match &timestamp {
            Some(t) => {
                parse_utc(t).ok_or_else(|| anyhow!("Invalid timestamp: {}", t))?.to_rfc3339()
            }
            None => now.clone(),
        };

        // The ad-hoc reminder is born completed: it never schedules,
        // escalates, or blocks the user's real reminder chain
        let questions = vec![ReminderQuestion {
            key: "q1".to_string(),
            text: detection.suggested_question.clone(),
            category: detection.category.clone(),
        }];
        let reminder = Reminder {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            scheduled_time: entry_time.clone(),
            sent_at: Some(entry_time.clone()),
            acknowledged_at: Some(entry_time.clone()),
            categories: Reminder::categories_of(&questions),
            questions,
            status: ReminderStatus::Completed,
            escalation_level: 0,
            follow_up_round: 0,
            created_at: now.clone(),
        };
        self.db.insert_reminder(&reminder)?;

        let response = Response {
            id: uuid::Uuid::new_v4().to_string(),
            reminder_id: Some(reminder.id.clone()),
            user_id: user_id.to_string(),
            question_key: Some("q1".to_string()),
            question_text: detection.suggested_question.clone(),
            response_text: text.to_string(),
            response_structured: None,
            category: detection.category.clone(),
            timestamp: entry_time,
            processing_status: ProcessingStatus::Pending,
            processing_attempts: 0,
            last_error: None,
            last_raw_output: None,
            created_at: now,
            deleted_at: None,
        };
        self.db.insert_response(&response)?;
        info!(response_id = %response.id, category = %detection.category, "Quick log created");
        self.events.emit(CoreEvent::ResponseQueued {
            response_id: response.id.clone(),
            user_id: user_id.to_string(),
        });

        Ok(QuickLogResult {
            response_id: response.id,
            reminder_id: reminder.id,
            category: detection.category,
            processing_status: ProcessingStatus::Pending,
        })
    }

    // ============ Session Lifecycle ============

    fn session_qas(reminder: &Reminder, responses: &[Response]) -> Option<Vec<SessionQa>> {
        let mut qas = Vec::with_capacity(reminder.questions.len());
        for question in &reminder.questions {
            let answer = responses.iter().find(|r| {
                r.question_key.as_deref() == Some(question.key.as_str())
                    || (r.question_key.is_none() && r.question_text == question.text)
            })?;
            qas.push(SessionQa {
                question: question.text.clone(),
                answer: answer.response_text.clone(),
                category: question.category.clone(),
            });
        }
        Some(qas)
    }

    /// Move a session forward once every asked question has an answer or
    /// an explicit skip: first round runs gap analysis and may append
    /// follow-ups; the follow-up round consolidates and completes.
    pub async fn advance_session(&self, reminder_id: &str) -> Result<()> {
        let reminder = match self.db.get_reminder(reminder_id)? {
            Some(r) => r,
            None => return Ok(()),
        };
        match reminder.status {
            ReminderStatus::Sent => {
                // answering implies acknowledgement; escalation stops here
                if self.db.acknowledge_reminder(reminder_id, &Utc::now().to_rfc3339())? {
                    self.events.emit(CoreEvent::ReminderAcknowledged {
                        reminder_id: reminder_id.to_string(),
                        user_id: reminder.user_id.clone(),
                    });
                }
            }
            ReminderStatus::Acknowledged => {}
            _ => return Ok(()),
        }

        let responses = self.db.responses_for_reminder(reminder_id)?;
        let qas = match Self::session_qas(&reminder, &responses) {
            Some(qas) => qas,
            None => return Ok(()), // still waiting on answers
        };

        let debts =
            Scheduler::debt_map(&self.scheduler.compute_debts(&reminder.user_id, Utc::now())?);

        if reminder.follow_up_round == 0 {
            let gap = match self.gap_analyzer.analyze(&qas, &reminder.categories, &debts).await {
                Ok(gap) => gap,
                Err(e) => {
                    warn!(reminder_id = %reminder_id, error = %e, "Gap analysis failed, will retry");
                    return Ok(());
                }
            };
            if gap.is_complete() {
                self.consolidate_and_complete(&reminder, &qas, &debts).await
            } else {
                let mut questions = reminder.questions.clone();
                let offset = questions.len();
                for (i, follow_up) in gap.follow_ups.iter().enumerate() {
                    questions.push(ReminderQuestion {
                        key: format!("q{}", offset + i + 1),
                        text: follow_up.question.clone(),
                        category: follow_up.category.clone(),
                    });
                }
                self.db.update_reminder(
                    reminder_id,
                    &crate::types::ReminderUpdate {
                        questions: Some(questions),
                        follow_up_round: Some(1),
                        ..Default::default()
                    },
                )?;
                info!(
                    reminder_id = %reminder_id,
                    missing = ?gap.missing_categories,
                    "Follow-up round generated"
                );
                self.events.emit(CoreEvent::FollowUpsAdded {
                    reminder_id: reminder_id.to_string(),
                    user_id: reminder.user_id.clone(),
                    count: gap.follow_ups.len(),
                });
                Ok(())
            }
        } else {
            self.consolidate_and_complete(&reminder, &qas, &debts).await
        }
    }

    async fn consolidate_and_complete(
        &self,
        reminder: &Reminder,
        qas: &[SessionQa],
        debts: &std::collections::HashMap<String, f64>,
    ) -> Result<()> {
        let record =
            match self.consolidator.consolidate(qas, &reminder.scheduled_time, debts).await {
                Ok(record) => record,
                Err(e) => {
                    warn!(reminder_id = %reminder.id, error = %e, "Consolidation failed, will retry");
                    return Ok(());
                }
            };

        let now = Utc::now().to_rfc3339();
        self.db.insert_session_record(&SessionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            reminder_id: reminder.id.clone(),
            user_id: reminder.user_id.clone(),
            session_time: reminder.scheduled_time.clone(),
            record,
            created_at: now,
        })?;
        self.events.emit(CoreEvent::SessionConsolidated {
            reminder_id: reminder.id.clone(),
            user_id: reminder.user_id.clone(),
        });

        if self.db.complete_reminder(&reminder.id)? {
            info!(reminder_id = %reminder.id, "Session completed");
            self.events.emit(CoreEvent::ReminderCompleted {
                reminder_id: reminder.id.clone(),
                user_id: reminder.user_id.clone(),
            });
        }
        Ok(())
    }

    /// Retry path for sessions whose gap analysis or consolidation failed
    /// transiently: re-examine every acknowledged reminder.
    pub async fn advance_pending_sessions(&self) {
        let reminders = match self.db.acknowledged_reminders() {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Failed to list acknowledged reminders");
                return;
            }
        };
        for reminder in reminders {
            if let Err(e) = self.advance_session(&reminder.id).await {
                warn!(reminder_id = %reminder.id, error = %e, "Session advance failed");
            }
        }
    }

    // ============ Scheduling Tick ============

    /// One pass of the scheduling loop. Each step absorbs its own errors:
    /// a failure for one user or reminder never stops the others.
    pub async fn tick(&self) {
        let now = Utc::now();

        if let Err(e) = self.db.recover_stale_processing(self.config.server.stale_processing_minutes)
        {
            warn!(error = %e, "Stale processing recovery failed");
        }

        if let Err(e) = self.scheduler.fire_escalations(now).await {
            warn!(error = %e, "Escalation pass failed");
        }

        if let Err(e) = self.scheduler.advance_due(now).await {
            warn!(error = %e, "Due-reminder pass failed");
        }

        match self.db.list_users() {
            Ok(users) => {
                for user in users {
                    let has_active = match self.db.active_reminder_for_user(&user.id) {
                        Ok(active) => active.is_some(),
                        Err(e) => {
                            warn!(user_id = %user.id, error = %e, "Active-reminder lookup failed");
                            continue;
                        }
                    };
                    if !has_active {
                        if let Err(e) = self.scheduler.generate_for_user(&user.id, false, now) {
                            warn!(user_id = %user.id, error = %e, "Reminder generation failed");
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "User listing failed"),
        }

        self.advance_pending_sessions().await;
    }

    // ============ Health ============

    /// Daemon + LLM endpoint health
    pub async fn llm_health(&self) -> (bool, String) {
        match &self.llm_client {
            Some(client) => (client.health_check().await, client.model().to_string()),
            None => (true, "injected".to_string()),
        }
    }
}
