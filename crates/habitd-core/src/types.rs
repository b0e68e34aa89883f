//! Core types for habitd

use serde::{Deserialize, Serialize};

// ============ Category ============

/// A tracked health category. Immutable configuration, loaded at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Target number of data points per day
    pub frequency_per_day: i64,
    /// Preferred times of day ("HH:MM", user-local), in priority order
    #[serde(default)]
    pub preferred_times: Vec<String>,
    /// Critical categories may break quiet hours when badly overdue
    #[serde(default)]
    pub critical: bool,
}

// ============ User ============

/// User profile and schedule preferences. All times are "HH:MM" in the
/// user's own timezone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    pub timezone: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wake_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sleep_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screens_off_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bed_time: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<String>,
}

/// Partial update for a user's settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub wake_time: Option<String>,
    #[serde(default)]
    pub sleep_time: Option<String>,
    #[serde(default)]
    pub screens_off_time: Option<String>,
    #[serde(default)]
    pub bed_time: Option<String>,
}

// ============ Reminder ============

/// Reminder status state machine:
/// scheduled -> sent -> { acknowledged -> completed, missed }
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReminderStatus {
    Scheduled,
    Sent,
    Acknowledged,
    Completed,
    Missed,
}

impl ReminderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReminderStatus::Scheduled => "scheduled",
            ReminderStatus::Sent => "sent",
            ReminderStatus::Acknowledged => "acknowledged",
            ReminderStatus::Completed => "completed",
            ReminderStatus::Missed => "missed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(ReminderStatus::Scheduled),
            "sent" => Some(ReminderStatus::Sent),
            "acknowledged" => Some(ReminderStatus::Acknowledged),
            "completed" => Some(ReminderStatus::Completed),
            "missed" => Some(ReminderStatus::Missed),
            _ => None,
        }
    }

    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReminderStatus::Completed | ReminderStatus::Missed)
    }
}

/// One question inside a reminder. Key order is insertion order and is
/// preserved end-to-end (display, and matching answers back to questions).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderQuestion {
    pub key: String,
    pub text: String,
    pub category: String,
}

/// A scheduled check-in sent to a user
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reminder {
    pub id: String,
    pub user_id: String,
    pub scheduled_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<String>,
    pub questions: Vec<ReminderQuestion>,
    /// Union of the questions' categories
    pub categories: Vec<String>,
    pub status: ReminderStatus,
    /// How many escalation re-deliveries have fired (persisted so a
    /// restart recomputes pending escalations from sent_at)
    pub escalation_level: i64,
    /// 0 = initial questions, 1 = follow-up round appended
    pub follow_up_round: i64,
    pub created_at: String,
}

impl Reminder {
    /// Union of question categories, preserving first-seen order
    pub fn categories_of(questions: &[ReminderQuestion]) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for q in questions {
            if !out.iter().any(|c| c == &q.category) {
                out.push(q.category.clone());
            }
        }
        out
    }
}

/// Input for creating a reminder directly (manual creation)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateReminderInput {
    pub user_id: String,
    pub scheduled_time: String,
    pub questions: Vec<ReminderQuestion>,
}

/// Partial update for a reminder
#[derive(Debug, Clone, Default)]
pub struct ReminderUpdate {
    pub status: Option<ReminderStatus>,
    pub sent_at: Option<String>,
    pub acknowledged_at: Option<String>,
    pub escalation_level: Option<i64>,
    pub follow_up_round: Option<i64>,
    pub questions: Option<Vec<ReminderQuestion>>,
}

// ============ Response ============

/// Extraction pipeline status of a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ProcessingStatus::Pending),
            "processing" => Some(ProcessingStatus::Processing),
            "completed" => Some(ProcessingStatus::Completed),
            "failed" => Some(ProcessingStatus::Failed),
            _ => None,
        }
    }
}

/// A user's answer to one question. `reminder_id` is None for ad-hoc
/// entries submitted outside any reminder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reminder_id: Option<String>,
    pub user_id: String,
    /// Question key within the reminder, for matching answers back
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question_key: Option<String>,
    pub question_text: String,
    pub response_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_structured: Option<serde_json::Value>,
    pub category: String,
    pub timestamp: String,
    pub processing_status: ProcessingStatus,
    pub processing_attempts: i64,
    /// Last extraction error (retained for manual review)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Last raw LLM output (retained for manual review)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_raw_output: Option<String>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<String>,
}

impl Response {
    /// An empty answer is an explicit skip, not an error
    pub fn is_skip(&self) -> bool {
        self.response_text.trim().is_empty()
    }
}

/// Input for submitting a response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResponseInput {
    #[serde(default)]
    pub reminder_id: Option<String>,
    pub user_id: String,
    #[serde(default)]
    pub question_key: Option<String>,
    pub question_text: String,
    pub response_text: String,
    pub category: String,
    /// Optional backdating timestamp (RFC 3339)
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Filters for listing responses
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFilter {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub reminder_id: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub processing_status: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

// ============ Session Record ============

/// Consolidated structured record for one reminder session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub reminder_id: String,
    pub user_id: String,
    pub session_time: String,
    /// One JSON object keyed by category name
    pub record: serde_json::Value,
    pub created_at: String,
}

// ============ Calendar ============

/// External busy/free signal, synced into the DB by the out-of-scope
/// calendar wrapper. The scheduler only reads this table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub start_time: String,
    pub end_time: String,
    pub busy: bool,
    /// A busy block the user marked as interruptible does not defer reminders
    pub can_interrupt: bool,
    pub synced_at: String,
}

// ============ Session Q/A ============

/// One question/answer turn of a session, input to gap analysis and
/// consolidation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionQa {
    pub question: String,
    pub answer: String,
    pub category: String,
}

// ============ Quick Log ============

/// LLM category detection for a quick-log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryDetection {
    pub category: String,
    pub confidence: String,
    pub suggested_question: String,
}

/// Result of a quick-log submission
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickLogResult {
    pub response_id: String,
    pub reminder_id: String,
    pub category: String,
    pub processing_status: ProcessingStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reminder_status_roundtrip() {
        let statuses = [
            ReminderStatus::Scheduled,
            ReminderStatus::Sent,
            ReminderStatus::Acknowledged,
            ReminderStatus::Completed,
            ReminderStatus::Missed,
        ];
        for status in statuses {
            let parsed = ReminderStatus::from_str(status.as_str()).unwrap();
            assert_eq!(status, parsed);
        }
        assert!(ReminderStatus::from_str("bogus").is_none());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ReminderStatus::Completed.is_terminal());
        assert!(ReminderStatus::Missed.is_terminal());
        assert!(!ReminderStatus::Sent.is_terminal());
        assert!(!ReminderStatus::Acknowledged.is_terminal());
    }

    #[test]
    fn test_processing_status_roundtrip() {
        let statuses = [
            ProcessingStatus::Pending,
            ProcessingStatus::Processing,
            ProcessingStatus::Completed,
            ProcessingStatus::Failed,
        ];
        for status in statuses {
            let parsed = ProcessingStatus::from_str(status.as_str()).unwrap();
            assert_eq!(status, parsed);
        }
    }

    #[test]
    fn test_categories_union_preserves_order() {
        let questions = vec![
            ReminderQuestion {
                key: "q1".into(),
                text: "How did you sleep?".into(),
                category: "sleep".into(),
            },
            ReminderQuestion {
                key: "q2".into(),
                text: "What did you eat?".into(),
                category: "nutrition".into(),
            },
            ReminderQuestion {
                key: "q3".into(),
                text: "Any interruptions overnight?".into(),
                category: "sleep".into(),
            },
        ];
        assert_eq!(Reminder::categories_of(&questions), vec!["sleep", "nutrition"]);
    }

    #[test]
    fn test_response_serialization() {
        let response = Response {
            id: "resp-1".to_string(),
            reminder_id: None,
            user_id: "user-1".to_string(),
            question_key: None,
            question_text: "How are you?".to_string(),
            response_text: "Fine".to_string(),
            response_structured: None,
            category: "mental_state".to_string(),
            timestamp: "2024-01-01T12:00:00Z".to_string(),
            processing_status: ProcessingStatus::Pending,
            processing_attempts: 0,
            last_error: None,
            last_raw_output: None,
            created_at: "2024-01-01T12:00:00Z".to_string(),
            deleted_at: None,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"processingStatus\":\"pending\""));
        let parsed: Response = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.processing_status, ProcessingStatus::Pending);
    }

    #[test]
    fn test_empty_answer_is_skip() {
        let mut r = Response {
            id: "r".into(),
            reminder_id: None,
            user_id: "u".into(),
            question_key: None,
            question_text: "q".into(),
            response_text: "  ".into(),
            response_structured: None,
            category: "sleep".into(),
            timestamp: String::new(),
            processing_status: ProcessingStatus::Pending,
            processing_attempts: 0,
            last_error: None,
            last_raw_output: None,
            created_at: String::new(),
            deleted_at: None,
        };
        assert!(r.is_skip());
        r.response_text = "slept fine".into();
        assert!(!r.is_skip());
    }
}
