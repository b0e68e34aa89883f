//! Application configuration loaded from config.yaml
//!
//! Missing file or missing sections fall back to built-in defaults, so a
//! bare daemon starts with a sensible single-user setup.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Default user profile seeded on first start
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default = "default_user_name")]
    pub name: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_user_name() -> String {
    "User".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for UserConfig {
    fn default() -> Self {
        Self { name: default_user_name(), timezone: default_timezone() }
    }
}

/// Daily schedule boundaries ("HH:MM", user-local)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_wake_time")]
    pub wake_time: String,
    #[serde(default = "default_sleep_time")]
    pub sleep_time: String,
    #[serde(default = "default_screens_off")]
    pub screens_off: String,
    #[serde(default = "default_bed_time")]
    pub bed_time: String,
}

fn default_wake_time() -> String {
    "06:30".to_string()
}
fn default_sleep_time() -> String {
    "22:30".to_string()
}
fn default_screens_off() -> String {
    "21:00".to_string()
}
fn default_bed_time() -> String {
    "22:00".to_string()
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            wake_time: default_wake_time(),
            sleep_time: default_sleep_time(),
            screens_off: default_screens_off(),
            bed_time: default_bed_time(),
        }
    }
}

/// Reminder scheduling knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptsConfig {
    /// Shortest gap between reminders (minutes)
    #[serde(default = "default_min_interval")]
    pub min_interval_minutes: i64,
    /// Longest gap between reminders (minutes)
    #[serde(default = "default_max_interval")]
    pub max_interval_minutes: i64,
    /// Cumulative escalation offsets past sent_at (minutes)
    #[serde(default = "default_escalation_offsets")]
    pub escalation_offsets_minutes: Vec<i64>,
    /// Max categories covered by one reminder
    #[serde(default = "default_max_questions")]
    pub max_questions_per_reminder: usize,
    /// Debt at or above this may break quiet hours for critical categories
    #[serde(default = "default_critical_debt")]
    pub critical_debt_threshold: f64,
    /// Deferral when the user is busy (minutes)
    #[serde(default = "default_busy_defer")]
    pub busy_defer_minutes: i64,
    /// Coverage debt lookback window (days)
    #[serde(default = "default_window_days")]
    pub window_days: i64,
}

fn default_min_interval() -> i64 {
    120
}
fn default_max_interval() -> i64 {
    300
}
fn default_escalation_offsets() -> Vec<i64> {
    vec![5, 15, 35]
}
fn default_max_questions() -> usize {
    3
}
fn default_critical_debt() -> f64 {
    0.8
}
fn default_busy_defer() -> i64 {
    15
}
fn default_window_days() -> i64 {
    1
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            min_interval_minutes: default_min_interval(),
            max_interval_minutes: default_max_interval(),
            escalation_offsets_minutes: default_escalation_offsets(),
            max_questions_per_reminder: default_max_questions(),
            critical_debt_threshold: default_critical_debt(),
            busy_defer_minutes: default_busy_defer(),
            window_days: default_window_days(),
        }
    }
}

/// LLM endpoint configuration (Ollama-compatible chat API)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Smaller model for latency-sensitive calls (quick-log categorization)
    #[serde(default = "default_llm_model_fast")]
    pub model_fast: String,
    /// Extraction attempt budget per processing cycle
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,
    #[serde(default = "default_extract_temperature")]
    pub extract_temperature: f32,
    #[serde(default = "default_consolidate_temperature")]
    pub consolidate_temperature: f32,
    #[serde(default = "default_analysis_temperature")]
    pub analysis_temperature: f32,
    /// Per-request timeout (seconds)
    #[serde(default = "default_llm_timeout")]
    pub timeout_seconds: u64,
    /// Max concurrent in-flight LLM calls (shared endpoint)
    #[serde(default = "default_llm_concurrency")]
    pub concurrency: usize,
    /// Hard cap on follow-up questions per session
    #[serde(default = "default_max_follow_ups")]
    pub max_follow_ups: usize,
}

fn default_llm_base_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_llm_model() -> String {
    "gemma2:32b".to_string()
}
fn default_llm_model_fast() -> String {
    "gemma2:9b".to_string()
}
fn default_max_retries() -> i64 {
    5
}
fn default_extract_temperature() -> f32 {
    0.1
}
fn default_consolidate_temperature() -> f32 {
    0.0
}
fn default_analysis_temperature() -> f32 {
    0.3
}
fn default_llm_timeout() -> u64 {
    120
}
fn default_llm_concurrency() -> usize {
    1
}
fn default_max_follow_ups() -> usize {
    5
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            model_fast: default_llm_model_fast(),
            max_retries: default_max_retries(),
            extract_temperature: default_extract_temperature(),
            consolidate_temperature: default_consolidate_temperature(),
            analysis_temperature: default_analysis_temperature(),
            timeout_seconds: default_llm_timeout(),
            concurrency: default_llm_concurrency(),
            max_follow_ups: default_max_follow_ups(),
        }
    }
}

/// ntfy push publisher. Disabled when topic is empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_ntfy_server")]
    pub server: String,
    #[serde(default)]
    pub topic: String,
    /// Base URL of the client app, used for click-through links
    #[serde(default)]
    pub client_base_url: String,
}

fn default_ntfy_server() -> String {
    "https://ntfy.sh".to_string()
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            server: default_ntfy_server(),
            topic: String::new(),
            client_base_url: String::new(),
        }
    }
}

/// Daemon endpoints and cadences
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Scheduling loop cadence (seconds)
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
    /// Extraction worker poll cadence (seconds)
    #[serde(default = "default_worker_poll_seconds")]
    pub worker_poll_seconds: u64,
    /// Responses stuck in 'processing' longer than this are reset (minutes)
    #[serde(default = "default_stale_processing")]
    pub stale_processing_minutes: i64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8787
}
fn default_tick_seconds() -> u64 {
    300
}
fn default_worker_poll_seconds() -> u64 {
    30
}
fn default_stale_processing() -> i64 {
    15
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            tick_seconds: default_tick_seconds(),
            worker_poll_seconds: default_worker_poll_seconds(),
            stale_processing_minutes: default_stale_processing(),
        }
    }
}

/// Per-category override in config.yaml. Anything left out keeps the
/// built-in default from the registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub frequency_per_day: Option<i64>,
    #[serde(default)]
    pub preferred_times: Option<Vec<String>>,
    #[serde(default)]
    pub critical: Option<bool>,
    /// Minimum hours between asking about this category again
    #[serde(default)]
    pub min_interval_hours: Option<i64>,
    /// Question template bank (rotated per user)
    #[serde(default)]
    pub templates: Option<Vec<String>>,
    /// Extraction schema fields; replaces the built-in schema entirely
    #[serde(default)]
    pub fields: Option<Vec<crate::llm::schema::FieldSpec>>,
}

/// Top-level application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub user: UserConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub categories: Vec<CategoryConfig>,
}

impl AppConfig {
    /// Load from YAML file, returns defaults if the file doesn't exist
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(content) => serde_yaml::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "Invalid config.yaml, using defaults");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.prompts.min_interval_minutes, 120);
        assert_eq!(cfg.prompts.max_interval_minutes, 300);
        assert_eq!(cfg.prompts.escalation_offsets_minutes, vec![5, 15, 35]);
        assert_eq!(cfg.llm.max_retries, 5);
        assert_eq!(cfg.llm.max_follow_ups, 5);
        assert_eq!(cfg.schedule.wake_time, "06:30");
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
user:
  name: Alice
  timezone: Europe/Berlin
prompts:
  min_interval_minutes: 90
categories:
  - name: sleep
    frequency_per_day: 1
"#;
        let cfg: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.user.name, "Alice");
        assert_eq!(cfg.user.timezone, "Europe/Berlin");
        assert_eq!(cfg.prompts.min_interval_minutes, 90);
        // untouched sections keep defaults
        assert_eq!(cfg.prompts.max_interval_minutes, 300);
        assert_eq!(cfg.llm.model, "gemma2:32b");
        assert_eq!(cfg.categories.len(), 1);
        assert_eq!(cfg.categories[0].frequency_per_day, Some(1));
        assert!(cfg.categories[0].templates.is_none());
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let cfg = AppConfig::load(Path::new("/nonexistent/habitd/config.yaml"));
        assert_eq!(cfg.server.port, 8787);
    }
}
