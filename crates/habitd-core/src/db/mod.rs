//! SQLite database operations for habitd
//!
//! Single write connection behind a mutex plus a read-only connection for
//! queries (WAL allows concurrent reads during writes). All timestamps are
//! RFC 3339 TEXT in UTC.

use std::collections::HashMap;
use std::path::Path;

use rusqlite::{params, Connection, Result as SqliteResult};

use crate::types::{
    CalendarEvent, ProcessingStatus, Reminder, ReminderQuestion, ReminderStatus, ReminderUpdate,
    Response, ResponseFilter, SessionRecord, User, UserUpdate,
};

const SCHEMA: &str = r#"
-- Users
CREATE TABLE IF NOT EXISTS users (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  timezone TEXT NOT NULL DEFAULT 'UTC',
  wake_time TEXT,
  sleep_time TEXT,
  screens_off_time TEXT,
  bed_time TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  deleted_at TEXT
);

-- Reminders (scheduled check-ins)
CREATE TABLE IF NOT EXISTS reminders (
  id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  scheduled_time TEXT NOT NULL,
  sent_at TEXT,
  acknowledged_at TEXT,
  questions TEXT NOT NULL,
  categories TEXT NOT NULL,
  status TEXT NOT NULL DEFAULT 'scheduled',
  escalation_level INTEGER NOT NULL DEFAULT 0,
  follow_up_round INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL,
  FOREIGN KEY (user_id) REFERENCES users(id)
);
CREATE INDEX IF NOT EXISTS idx_reminders_user ON reminders(user_id);
CREATE INDEX IF NOT EXISTS idx_reminders_status ON reminders(status);
CREATE INDEX IF NOT EXISTS idx_reminders_scheduled ON reminders(scheduled_time);

-- Responses (raw answers + extraction pipeline state)
CREATE TABLE IF NOT EXISTS responses (
  id TEXT PRIMARY KEY,
  reminder_id TEXT,
  user_id TEXT NOT NULL,
  question_key TEXT,
  question_text TEXT NOT NULL,
  response_text TEXT NOT NULL,
  response_structured TEXT,
  category TEXT NOT NULL,
  timestamp TEXT NOT NULL,
  processing_status TEXT NOT NULL DEFAULT 'pending',
  processing_attempts INTEGER NOT NULL DEFAULT 0,
  last_error TEXT,
  last_raw_output TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  deleted_at TEXT,
  FOREIGN KEY (user_id) REFERENCES users(id)
);
CREATE INDEX IF NOT EXISTS idx_responses_user ON responses(user_id);
CREATE INDEX IF NOT EXISTS idx_responses_reminder ON responses(reminder_id);
CREATE INDEX IF NOT EXISTS idx_responses_category ON responses(category);
CREATE INDEX IF NOT EXISTS idx_responses_status ON responses(processing_status);
CREATE INDEX IF NOT EXISTS idx_responses_timestamp ON responses(timestamp);

-- Consolidated session records
CREATE TABLE IF NOT EXISTS session_records (
  id TEXT PRIMARY KEY,
  reminder_id TEXT NOT NULL UNIQUE,
  user_id TEXT NOT NULL,
  session_time TEXT NOT NULL,
  record TEXT NOT NULL,
  created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_session_records_user ON session_records(user_id);

-- Calendar events (external busy/free signal, synced by the wrapper)
CREATE TABLE IF NOT EXISTS calendar_events (
  id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  title TEXT,
  start_time TEXT NOT NULL,
  end_time TEXT NOT NULL,
  busy INTEGER NOT NULL DEFAULT 1,
  can_interrupt INTEGER NOT NULL DEFAULT 0,
  synced_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_calendar_user_start ON calendar_events(user_id, start_time);

-- Question template rotation cursors
CREATE TABLE IF NOT EXISTS template_cursors (
  user_id TEXT NOT NULL,
  category TEXT NOT NULL,
  cursor INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY (user_id, category)
);
"#;

fn conversion_err(msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        msg.into(),
    )
}

/// SQLite database operations class
pub struct HabitDB {
    conn: std::sync::Mutex<Connection>,
    /// Read-only connection for queries — avoids blocking on the write
    /// mutex (WAL concurrent reads)
    read_conn: std::sync::Mutex<Connection>,
}

impl HabitDB {
    /// Create a new database connection pair
    pub fn new<P: AsRef<Path>>(db_path: P) -> SqliteResult<Self> {
        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let read_conn = Connection::open_with_flags(
            &db_path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        read_conn.busy_timeout(std::time::Duration::from_secs(2))?;
        let db = Self {
            conn: std::sync::Mutex::new(conn),
            read_conn: std::sync::Mutex::new(read_conn),
        };
        db.init()?;
        Ok(db)
    }

    /// Alias for new - opens a database file
    pub fn open<P: AsRef<Path>>(db_path: P) -> SqliteResult<Self> {
        Self::new(db_path)
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("HabitDB mutex poisoned")
    }

    fn read_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.read_conn.lock().expect("HabitDB read_conn mutex poisoned")
    }

    fn init(&self) -> SqliteResult<()> {
        {
            let conn = self.conn();
            conn.execute_batch(SCHEMA)?;
        }
        self.migrate()?;
        Ok(())
    }

    /// Run schema migrations for existing databases
    fn migrate(&self) -> SqliteResult<()> {
        let conn = self.conn();

        // question_key was added after the first release so follow-up
        // answers can be matched back to their question
        let columns: Vec<String> = conn
            .prepare("PRAGMA table_info(responses)")?
            .query_map([], |row| row.get::<_, String>(1))?
            .filter_map(|r| r.ok())
            .collect();
        if !columns.iter().any(|c| c == "question_key") {
            conn.execute_batch("ALTER TABLE responses ADD COLUMN question_key TEXT;")?;
        }
        if !columns.iter().any(|c| c == "last_raw_output") {
            conn.execute_batch(
                "ALTER TABLE responses ADD COLUMN last_error TEXT;
                 ALTER TABLE responses ADD COLUMN last_raw_output TEXT;",
            )?;
        }

        // escalation state moved into the reminders row so restarts can
        // recompute pending escalations from sent_at
        let rem_columns: Vec<String> = conn
            .prepare("PRAGMA table_info(reminders)")?
            .query_map([], |row| row.get::<_, String>(1))?
            .filter_map(|r| r.ok())
            .collect();
        if !rem_columns.iter().any(|c| c == "escalation_level") {
            conn.execute_batch(
                "ALTER TABLE reminders ADD COLUMN escalation_level INTEGER NOT NULL DEFAULT 0;
                 ALTER TABLE reminders ADD COLUMN follow_up_round INTEGER NOT NULL DEFAULT 0;",
            )?;
        }

        Ok(())
    }

    // ============ Users ============

    pub fn insert_user(&self, user: &User) -> SqliteResult<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO users (id, name, timezone, wake_time, sleep_time, screens_off_time,
                                bed_time, created_at, updated_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                user.id,
                user.name,
                user.timezone,
                user.wake_time,
                user.sleep_time,
                user.screens_off_time,
                user.bed_time,
                user.created_at,
                user.updated_at,
                user.deleted_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: &str) -> SqliteResult<Option<User>> {
        let conn = self.read_conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, timezone, wake_time, sleep_time, screens_off_time, bed_time,
                    created_at, updated_at, deleted_at
             FROM users WHERE id = ? AND deleted_at IS NULL",
        )?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_user(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_users(&self) -> SqliteResult<Vec<User>> {
        let conn = self.read_conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, timezone, wake_time, sleep_time, screens_off_time, bed_time,
                    created_at, updated_at, deleted_at
             FROM users WHERE deleted_at IS NULL ORDER BY created_at ASC",
        )?;
        let users = stmt
            .query_map([], |row| Self::row_to_user(row))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(users)
    }

    pub fn update_user(&self, id: &str, update: &UserUpdate) -> SqliteResult<Option<User>> {
        let mut fields = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(name) = &update.name {
            fields.push("name = ?");
            values.push(Box::new(name.clone()));
        }
        if let Some(tz) = &update.timezone {
            fields.push("timezone = ?");
            values.push(Box::new(tz.clone()));
        }
        if let Some(t) = &update.wake_time {
            fields.push("wake_time = ?");
            values.push(Box::new(t.clone()));
        }
        if let Some(t) = &update.sleep_time {
            fields.push("sleep_time = ?");
            values.push(Box::new(t.clone()));
        }
        if let Some(t) = &update.screens_off_time {
            fields.push("screens_off_time = ?");
            values.push(Box::new(t.clone()));
        }
        if let Some(t) = &update.bed_time {
            fields.push("bed_time = ?");
            values.push(Box::new(t.clone()));
        }

        if !fields.is_empty() {
            fields.push("updated_at = ?");
            values.push(Box::new(chrono::Utc::now().to_rfc3339()));
            let sql = format!("UPDATE users SET {} WHERE id = ?", fields.join(", "));
            values.push(Box::new(id.to_string()));
            let sql_params: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
            let conn = self.conn();
            conn.execute(&sql, sql_params.as_slice())?;
        }
        self.get_user(id)
    }

    /// Soft-delete a user
    pub fn delete_user(&self, id: &str) -> SqliteResult<bool> {
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE users SET deleted_at = ?1, updated_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
            params![now, id],
        )?;
        Ok(n > 0)
    }

    fn row_to_user(row: &rusqlite::Row) -> SqliteResult<User> {
        Ok(User {
            id: row.get(0)?,
            name: row.get(1)?,
            timezone: row.get(2)?,
            wake_time: row.get(3)?,
            sleep_time: row.get(4)?,
            screens_off_time: row.get(5)?,
            bed_time: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
            deleted_at: row.get(9)?,
        })
    }

    // ============ Reminders ============

    pub fn insert_reminder(&self, reminder: &Reminder) -> SqliteResult<()> {
        let questions = serde_json::to_string(&reminder.questions)
            .map_err(|e| conversion_err(format!("questions encode: {e}")))?;
        let categories = serde_json::to_string(&reminder.categories)
            .map_err(|e| conversion_err(format!("categories encode: {e}")))?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO reminders (id, user_id, scheduled_time, sent_at, acknowledged_at,
                                    questions, categories, status, escalation_level,
                                    follow_up_round, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                reminder.id,
                reminder.user_id,
                reminder.scheduled_time,
                reminder.sent_at,
                reminder.acknowledged_at,
                questions,
                categories,
                reminder.status.as_str(),
                reminder.escalation_level,
                reminder.follow_up_round,
                reminder.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_reminder(&self, id: &str) -> SqliteResult<Option<Reminder>> {
        let conn = self.read_conn();
        let mut stmt = conn.prepare(&format!("{REMINDER_SELECT} WHERE id = ?"))?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_reminder(row)?)),
            None => Ok(None),
        }
    }

    pub fn update_reminder(&self, id: &str, update: &ReminderUpdate) -> SqliteResult<()> {
        let mut fields = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(status) = &update.status {
            fields.push("status = ?");
            values.push(Box::new(status.as_str().to_string()));
        }
        if let Some(t) = &update.sent_at {
            fields.push("sent_at = ?");
            values.push(Box::new(t.clone()));
        }
        if let Some(t) = &update.acknowledged_at {
            fields.push("acknowledged_at = ?");
            values.push(Box::new(t.clone()));
        }
        if let Some(level) = &update.escalation_level {
            fields.push("escalation_level = ?");
            values.push(Box::new(*level));
        }
        if let Some(round) = &update.follow_up_round {
            fields.push("follow_up_round = ?");
            values.push(Box::new(*round));
        }
        if let Some(questions) = &update.questions {
            let encoded = serde_json::to_string(questions)
                .map_err(|e| conversion_err(format!("questions encode: {e}")))?;
            fields.push("questions = ?");
            values.push(Box::new(encoded));
            let categories = Reminder::categories_of(questions);
            let encoded = serde_json::to_string(&categories)
                .map_err(|e| conversion_err(format!("categories encode: {e}")))?;
            fields.push("categories = ?");
            values.push(Box::new(encoded));
        }

        if fields.is_empty() {
            return Ok(());
        }

        let sql = format!("UPDATE reminders SET {} WHERE id = ?", fields.join(", "));
        values.push(Box::new(id.to_string()));
        let sql_params: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let conn = self.conn();
        conn.execute(&sql, sql_params.as_slice())?;
        Ok(())
    }

    /// Non-terminal reminders for a user, ordered by scheduled_time
    pub fn upcoming_reminders(&self, user_id: &str, limit: i64) -> SqliteResult<Vec<Reminder>> {
        let conn = self.read_conn();
        let mut stmt = conn.prepare(&format!(
            "{REMINDER_SELECT}
             WHERE user_id = ? AND status IN ('scheduled', 'sent')
             ORDER BY scheduled_time ASC LIMIT ?"
        ))?;
        let reminders = stmt
            .query_map(params![user_id, limit], |row| Self::row_to_reminder(row))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(reminders)
    }

    /// Scheduled reminders whose time has come
    pub fn due_scheduled_reminders(&self, now: &str, limit: i64) -> SqliteResult<Vec<Reminder>> {
        let conn = self.read_conn();
        let mut stmt = conn.prepare(&format!(
            "{REMINDER_SELECT}
             WHERE status = 'scheduled' AND scheduled_time <= ?
             ORDER BY scheduled_time ASC LIMIT ?"
        ))?;
        let reminders = stmt
            .query_map(params![now, limit], |row| Self::row_to_reminder(row))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(reminders)
    }

    /// Sent reminders awaiting acknowledgement (escalation candidates)
    pub fn sent_unacknowledged(&self) -> SqliteResult<Vec<Reminder>> {
        let conn = self.read_conn();
        let mut stmt =
            conn.prepare(&format!("{REMINDER_SELECT} WHERE status = 'sent' ORDER BY sent_at ASC"))?;
        let reminders =
            stmt.query_map([], |row| Self::row_to_reminder(row))?.filter_map(|r| r.ok()).collect();
        Ok(reminders)
    }

    /// The user's active (non-terminal) reminder, if any. At most one
    /// such reminder exists per user by construction.
    pub fn active_reminder_for_user(&self, user_id: &str) -> SqliteResult<Option<Reminder>> {
        let conn = self.read_conn();
        let mut stmt = conn.prepare(&format!(
            "{REMINDER_SELECT}
             WHERE user_id = ? AND status IN ('scheduled', 'sent', 'acknowledged')
             ORDER BY scheduled_time ASC LIMIT 1"
        ))?;
        let mut rows = stmt.query(params![user_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_reminder(row)?)),
            None => Ok(None),
        }
    }

    /// Most recent reminder time for a user (any status)
    pub fn last_reminder_time(&self, user_id: &str) -> SqliteResult<Option<String>> {
        let conn = self.read_conn();
        conn.query_row(
            "SELECT MAX(scheduled_time) FROM reminders WHERE user_id = ?",
            params![user_id],
            |row| row.get(0),
        )
    }

    /// Recent reminders for a user, newest first (frequency-limit lookback)
    pub fn recent_reminders(&self, user_id: &str, limit: i64) -> SqliteResult<Vec<Reminder>> {
        let conn = self.read_conn();
        let mut stmt = conn.prepare(&format!(
            "{REMINDER_SELECT} WHERE user_id = ? ORDER BY scheduled_time DESC LIMIT ?"
        ))?;
        let reminders = stmt
            .query_map(params![user_id, limit], |row| Self::row_to_reminder(row))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(reminders)
    }

    /// Push a still-scheduled reminder's due time out (busy deferral)
    pub fn defer_reminder(&self, id: &str, new_time: &str) -> SqliteResult<bool> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE reminders SET scheduled_time = ?1 WHERE id = ?2 AND status = 'scheduled'",
            params![new_time, id],
        )?;
        Ok(n > 0)
    }

    /// Acknowledged reminders (sessions that may be waiting on answers,
    /// gap analysis, or consolidation)
    pub fn acknowledged_reminders(&self) -> SqliteResult<Vec<Reminder>> {
        let conn = self.read_conn();
        let mut stmt = conn.prepare(&format!(
            "{REMINDER_SELECT} WHERE status = 'acknowledged' ORDER BY scheduled_time ASC"
        ))?;
        let reminders =
            stmt.query_map([], |row| Self::row_to_reminder(row))?.filter_map(|r| r.ok()).collect();
        Ok(reminders)
    }

    /// CAS: scheduled -> sent. Returns false if another path got there first.
    pub fn mark_reminder_sent(&self, id: &str, sent_at: &str) -> SqliteResult<bool> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE reminders SET status = 'sent', sent_at = ?1
             WHERE id = ?2 AND status = 'scheduled'",
            params![sent_at, id],
        )?;
        Ok(n > 0)
    }

    /// CAS: sent -> acknowledged. Acknowledging only stops escalation;
    /// it does not complete the reminder.
    pub fn acknowledge_reminder(&self, id: &str, acknowledged_at: &str) -> SqliteResult<bool> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE reminders SET status = 'acknowledged', acknowledged_at = ?1
             WHERE id = ?2 AND status = 'sent'",
            params![acknowledged_at, id],
        )?;
        Ok(n > 0)
    }

    /// CAS: sent -> missed (only while still unacknowledged)
    pub fn mark_reminder_missed(&self, id: &str) -> SqliteResult<bool> {
        let conn = self.conn();
        let n = conn
            .execute("UPDATE reminders SET status = 'missed' WHERE id = ? AND status = 'sent'", params![id])?;
        Ok(n > 0)
    }

    /// CAS: acknowledged -> completed
    pub fn complete_reminder(&self, id: &str) -> SqliteResult<bool> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE reminders SET status = 'completed' WHERE id = ? AND status = 'acknowledged'",
            params![id],
        )?;
        Ok(n > 0)
    }

    /// Bump escalation level; monotonic, only while still sent
    pub fn set_escalation_level(&self, id: &str, level: i64) -> SqliteResult<bool> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE reminders SET escalation_level = ?1
             WHERE id = ?2 AND status = 'sent' AND escalation_level < ?1",
            params![level, id],
        )?;
        Ok(n > 0)
    }

    fn row_to_reminder(row: &rusqlite::Row) -> SqliteResult<Reminder> {
        let questions_json: String = row.get(5)?;
        let categories_json: String = row.get(6)?;
        let status_str: String = row.get(7)?;
        let questions: Vec<ReminderQuestion> = serde_json::from_str(&questions_json)
            .map_err(|e| conversion_err(format!("questions decode: {e}")))?;
        let categories: Vec<String> = serde_json::from_str(&categories_json)
            .map_err(|e| conversion_err(format!("categories decode: {e}")))?;
        let status = ReminderStatus::from_str(&status_str)
            .ok_or_else(|| conversion_err(format!("invalid reminder status: {status_str}")))?;
        Ok(Reminder {
            id: row.get(0)?,
            user_id: row.get(1)?,
            scheduled_time: row.get(2)?,
            sent_at: row.get(3)?,
            acknowledged_at: row.get(4)?,
            questions,
            categories,
            status,
            escalation_level: row.get(8)?,
            follow_up_round: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    // ============ Responses ============

    pub fn insert_response(&self, response: &Response) -> SqliteResult<()> {
        let structured = match &response.response_structured {
            Some(v) => Some(
                serde_json::to_string(v)
                    .map_err(|e| conversion_err(format!("structured encode: {e}")))?,
            ),
            None => None,
        };
        let conn = self.conn();
        conn.execute(
            "INSERT INTO responses (id, reminder_id, user_id, question_key, question_text,
                                    response_text, response_structured, category, timestamp,
                                    processing_status, processing_attempts, last_error,
                                    last_raw_output, created_at, updated_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                response.id,
                response.reminder_id,
                response.user_id,
                response.question_key,
                response.question_text,
                response.response_text,
                structured,
                response.category,
                response.timestamp,
                response.processing_status.as_str(),
                response.processing_attempts,
                response.last_error,
                response.last_raw_output,
                response.created_at,
                response.created_at,
                response.deleted_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_response(&self, id: &str) -> SqliteResult<Option<Response>> {
        let conn = self.read_conn();
        let mut stmt = conn.prepare(&format!("{RESPONSE_SELECT} WHERE id = ?"))?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_response(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_responses(&self, filter: &ResponseFilter) -> SqliteResult<Vec<Response>> {
        let mut clauses = vec!["deleted_at IS NULL".to_string()];
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(user_id) = &filter.user_id {
            clauses.push("user_id = ?".into());
            values.push(Box::new(user_id.clone()));
        }
        if let Some(reminder_id) = &filter.reminder_id {
            clauses.push("reminder_id = ?".into());
            values.push(Box::new(reminder_id.clone()));
        }
        if let Some(category) = &filter.category {
            clauses.push("category = ?".into());
            values.push(Box::new(category.clone()));
        }
        if let Some(status) = &filter.processing_status {
            clauses.push("processing_status = ?".into());
            values.push(Box::new(status.clone()));
        }

        let limit = filter.limit.unwrap_or(100);
        let sql = format!(
            "{RESPONSE_SELECT} WHERE {} ORDER BY timestamp DESC LIMIT {}",
            clauses.join(" AND "),
            limit
        );
        let sql_params: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let conn = self.read_conn();
        let mut stmt = conn.prepare(&sql)?;
        let responses = stmt
            .query_map(sql_params.as_slice(), |row| Self::row_to_response(row))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(responses)
    }

    /// All live responses belonging to a reminder, oldest first
    pub fn responses_for_reminder(&self, reminder_id: &str) -> SqliteResult<Vec<Response>> {
        let conn = self.read_conn();
        let mut stmt = conn.prepare(&format!(
            "{RESPONSE_SELECT}
             WHERE reminder_id = ? AND deleted_at IS NULL
             ORDER BY timestamp ASC"
        ))?;
        let responses = stmt
            .query_map(params![reminder_id], |row| Self::row_to_response(row))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(responses)
    }

    /// Soft-delete. Any in-flight extraction loses its final CAS write.
    pub fn soft_delete_response(&self, id: &str) -> SqliteResult<bool> {
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE responses SET deleted_at = ?1, updated_at = ?1
             WHERE id = ?2 AND deleted_at IS NULL",
            params![now, id],
        )?;
        Ok(n > 0)
    }

    /// Atomically claim a pending response for extraction (CAS: only
    /// succeeds if still pending and not deleted). Exactly one of any
    /// number of concurrent claimers wins.
    pub fn claim_response_for_processing(&self, id: &str) -> SqliteResult<bool> {
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE responses SET processing_status = 'processing', updated_at = ?1
             WHERE id = ?2 AND processing_status = 'pending' AND deleted_at IS NULL",
            params![now, id],
        )?;
        Ok(n > 0)
    }

    /// Persist one extraction attempt (counter + last error + raw output)
    /// so a restart resumes the budget instead of resetting it.
    pub fn record_extraction_attempt(
        &self,
        id: &str,
        attempts: i64,
        error: Option<&str>,
        raw_output: Option<&str>,
    ) -> SqliteResult<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "UPDATE responses
             SET processing_attempts = ?1, last_error = ?2, last_raw_output = ?3, updated_at = ?4
             WHERE id = ?5 AND processing_status = 'processing'",
            params![attempts, error, raw_output, now, id],
        )?;
        Ok(())
    }

    /// Final success write. Guarded: the row must still exist, be
    /// undeleted, and still be processing (deletion cancels extraction).
    pub fn complete_response_processing(
        &self,
        id: &str,
        structured: &serde_json::Value,
    ) -> SqliteResult<bool> {
        let encoded = serde_json::to_string(structured)
            .map_err(|e| conversion_err(format!("structured encode: {e}")))?;
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE responses
             SET response_structured = ?1, processing_status = 'completed',
                 last_error = NULL, updated_at = ?2
             WHERE id = ?3 AND processing_status = 'processing' AND deleted_at IS NULL",
            params![encoded, now, id],
        )?;
        Ok(n > 0)
    }

    /// Terminal failure write (manual review). Same guards as success.
    pub fn fail_response_processing(
        &self,
        id: &str,
        error: &str,
        raw_output: Option<&str>,
    ) -> SqliteResult<bool> {
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE responses
             SET processing_status = 'failed', last_error = ?1, last_raw_output = ?2, updated_at = ?3
             WHERE id = ?4 AND processing_status = 'processing' AND deleted_at IS NULL",
            params![error, raw_output, now, id],
        )?;
        Ok(n > 0)
    }

    /// Explicit reprocess of a failed response: fresh attempt budget
    pub fn reset_response_processing(&self, id: &str) -> SqliteResult<bool> {
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE responses
             SET processing_status = 'pending', processing_attempts = 0, updated_at = ?1
             WHERE id = ?2 AND processing_status = 'failed' AND deleted_at IS NULL",
            params![now, id],
        )?;
        Ok(n > 0)
    }

    /// Pending responses for the extraction worker, oldest first
    pub fn pending_responses(&self, limit: i64) -> SqliteResult<Vec<Response>> {
        let conn = self.read_conn();
        let mut stmt = conn.prepare(&format!(
            "{RESPONSE_SELECT}
             WHERE processing_status = 'pending' AND deleted_at IS NULL
             ORDER BY timestamp ASC LIMIT ?"
        ))?;
        let responses = stmt
            .query_map(params![limit], |row| Self::row_to_response(row))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(responses)
    }

    /// Recover responses stuck in 'processing' (daemon died mid-attempt).
    /// The attempt counter is kept so the budget resumes, not restarts.
    pub fn recover_stale_processing(&self, stale_minutes: i64) -> SqliteResult<usize> {
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE responses SET processing_status = 'pending', updated_at = ?1
             WHERE processing_status = 'processing'
               AND julianday('now') - julianday(updated_at) > ?2 / 1440.0",
            params![now, stale_minutes as f64],
        )?;
        if n > 0 {
            tracing::warn!(count = n, stale_minutes, "Recovered stale processing responses");
        }
        Ok(n)
    }

    /// Live response counts per category since a cutoff (coverage debt input)
    pub fn category_counts_since(
        &self,
        user_id: &str,
        since: &str,
    ) -> SqliteResult<HashMap<String, i64>> {
        let conn = self.read_conn();
        let mut stmt = conn.prepare(
            "SELECT category, COUNT(*) FROM responses
             WHERE user_id = ?1 AND timestamp >= ?2 AND deleted_at IS NULL
             GROUP BY category",
        )?;
        let mut counts = HashMap::new();
        let rows = stmt.query_map(params![user_id, since], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (category, count) = row?;
            counts.insert(category, count);
        }
        Ok(counts)
    }

    fn row_to_response(row: &rusqlite::Row) -> SqliteResult<Response> {
        let structured_json: Option<String> = row.get(6)?;
        let status_str: String = row.get(9)?;
        let response_structured = match structured_json {
            Some(s) => Some(
                serde_json::from_str(&s)
                    .map_err(|e| conversion_err(format!("structured decode: {e}")))?,
            ),
            None => None,
        };
        let processing_status = ProcessingStatus::from_str(&status_str)
            .ok_or_else(|| conversion_err(format!("invalid processing status: {status_str}")))?;
        Ok(Response {
            id: row.get(0)?,
            reminder_id: row.get(1)?,
            user_id: row.get(2)?,
            question_key: row.get(3)?,
            question_text: row.get(4)?,
            response_text: row.get(5)?,
            response_structured,
            category: row.get(7)?,
            timestamp: row.get(8)?,
            processing_status,
            processing_attempts: row.get(10)?,
            last_error: row.get(11)?,
            last_raw_output: row.get(12)?,
            created_at: row.get(13)?,
            deleted_at: row.get(15)?,
        })
    }

    // ============ Session Records ============

    pub fn insert_session_record(&self, record: &SessionRecord) -> SqliteResult<()> {
        let encoded = serde_json::to_string(&record.record)
            .map_err(|e| conversion_err(format!("record encode: {e}")))?;
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO session_records
                 (id, reminder_id, user_id, session_time, record, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id,
                record.reminder_id,
                record.user_id,
                record.session_time,
                encoded,
                record.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_session_record_for_reminder(
        &self,
        reminder_id: &str,
    ) -> SqliteResult<Option<SessionRecord>> {
        let conn = self.read_conn();
        let mut stmt = conn.prepare(
            "SELECT id, reminder_id, user_id, session_time, record, created_at
             FROM session_records WHERE reminder_id = ?",
        )?;
        let mut rows = stmt.query(params![reminder_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_session_record(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_session_records(&self, user_id: &str, limit: i64) -> SqliteResult<Vec<SessionRecord>> {
        let conn = self.read_conn();
        let mut stmt = conn.prepare(
            "SELECT id, reminder_id, user_id, session_time, record, created_at
             FROM session_records WHERE user_id = ?
             ORDER BY session_time DESC LIMIT ?",
        )?;
        let records = stmt
            .query_map(params![user_id, limit], |row| Self::row_to_session_record(row))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(records)
    }

    fn row_to_session_record(row: &rusqlite::Row) -> SqliteResult<SessionRecord> {
        let record_json: String = row.get(4)?;
        let record = serde_json::from_str(&record_json)
            .map_err(|e| conversion_err(format!("record decode: {e}")))?;
        Ok(SessionRecord {
            id: row.get(0)?,
            reminder_id: row.get(1)?,
            user_id: row.get(2)?,
            session_time: row.get(3)?,
            record,
            created_at: row.get(5)?,
        })
    }

    // ============ Calendar ============

    /// Upsert a synced calendar event (keyed by the external event id)
    pub fn upsert_calendar_event(&self, event: &CalendarEvent) -> SqliteResult<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO calendar_events
                 (id, user_id, title, start_time, end_time, busy, can_interrupt, synced_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.id,
                event.user_id,
                event.title,
                event.start_time,
                event.end_time,
                event.busy,
                event.can_interrupt,
                event.synced_at,
            ],
        )?;
        Ok(())
    }

    /// Is the user inside a non-interruptible busy block at `at`?
    pub fn busy_at(&self, user_id: &str, at: &str) -> SqliteResult<bool> {
        let conn = self.read_conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM calendar_events
             WHERE user_id = ?1 AND busy = 1 AND can_interrupt = 0
               AND start_time <= ?2 AND end_time > ?2",
            params![user_id, at],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ============ Template Cursors ============

    /// Advance the per-(user, category) template cursor, returning the
    /// index to use for this question.
    pub fn next_template_cursor(&self, user_id: &str, category: &str) -> SqliteResult<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO template_cursors (user_id, category, cursor) VALUES (?1, ?2, 0)
             ON CONFLICT(user_id, category) DO UPDATE SET cursor = cursor + 1",
            params![user_id, category],
        )?;
        conn.query_row(
            "SELECT cursor FROM template_cursors WHERE user_id = ?1 AND category = ?2",
            params![user_id, category],
            |row| row.get(0),
        )
    }
}

const REMINDER_SELECT: &str = "SELECT id, user_id, scheduled_time, sent_at, acknowledged_at, \
     questions, categories, status, escalation_level, follow_up_round, created_at FROM reminders";

const RESPONSE_SELECT: &str = "SELECT id, reminder_id, user_id, question_key, question_text, \
     response_text, response_structured, category, timestamp, processing_status, \
     processing_attempts, last_error, last_raw_output, created_at, updated_at, deleted_at \
     FROM responses";
