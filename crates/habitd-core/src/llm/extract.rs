//! Extraction engine: free text -> validated structured data
//!
//! Each LLM attempt is persisted through an [`AttemptSink`] before the
//! next one starts, so a daemon restart resumes the remaining budget
//! instead of restarting it. Parse and validation failures feed the
//! specific error back into the next attempt's prompt.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use super::client::ChatModel;
use super::schema::CategorySchema;

const EXTRACT_SYSTEM_PROMPT: &str = "You are a health data extraction assistant. \
Your job is to extract structured information from user responses to \
health-related questions.\n\n\
Always respond with valid JSON only. No explanation, no markdown, just the \
JSON object matching the schema you are given.";

const EXTRACT_MAX_TOKENS: u32 = 2048;

/// Terminal result of one extraction cycle
#[derive(Debug, Clone)]
pub enum ExtractionOutcome {
    Success {
        value: Value,
        attempts: i64,
    },
    /// Attempt budget exhausted; the last raw output is retained for
    /// human inspection.
    NeedsManualReview {
        error: String,
        last_raw: Option<String>,
        attempts: i64,
    },
}

/// Persistence seam: called once per attempt with the running counter and
/// the attempt's error/raw output (None on success).
pub trait AttemptSink: Send + Sync {
    fn record(&self, attempts: i64, error: Option<&str>, raw_output: Option<&str>);
}

/// No-op sink for callers that don't persist attempts
#[cfg(test)]
pub struct NullSink;

#[cfg(test)]
impl AttemptSink for NullSink {
    fn record(&self, _attempts: i64, _error: Option<&str>, _raw_output: Option<&str>) {}
}

pub struct Extractor {
    model: Arc<dyn ChatModel>,
    temperature: f32,
}

impl Extractor {
    pub fn new(model: Arc<dyn ChatModel>, temperature: f32) -> Self {
        Self { model, temperature }
    }

    /// Remove optional markdown code-fence wrapping from an LLM reply
    pub fn strip_code_fences(text: &str) -> &str {
        let mut out = text.trim();
        if let Some(rest) = out.strip_prefix("```json") {
            out = rest;
        } else if let Some(rest) = out.strip_prefix("```") {
            out = rest;
        }
        if let Some(rest) = out.strip_suffix("```") {
            out = rest;
        }
        out.trim()
    }

    fn build_prompt(
        raw_text: &str,
        question_text: &str,
        schema: &CategorySchema,
        feedback: Option<&str>,
    ) -> String {
        let mut prompt = format!(
            "Category: {}\nQuestion: {}\nUser Response: {}\n\n\
             Extract the structured data as JSON matching this schema exactly:\n{}",
            schema.category,
            question_text,
            raw_text,
            schema.schema_text(),
        );
        if let Some(feedback) = feedback {
            prompt.push_str(&format!(
                "\n\nYour previous output was rejected: {}\n\
                 Return a corrected JSON object only.",
                feedback
            ));
        }
        prompt
    }

    /// Run the bounded extraction cycle. `start_attempt` is the persisted
    /// counter from the owning response (non-zero when resuming after a
    /// restart); attempts never exceed `max_retries`.
    pub async fn extract(
        &self,
        raw_text: &str,
        question_text: &str,
        schema: &CategorySchema,
        start_attempt: i64,
        max_retries: i64,
        sink: &dyn AttemptSink,
    ) -> ExtractionOutcome {
        let mut attempts = start_attempt;
        let mut feedback: Option<String> = None;
        let mut last_raw: Option<String> = None;
        let mut last_error = "no attempts made".to_string();

        while attempts < max_retries {
            attempts += 1;

            let prompt = Self::build_prompt(raw_text, question_text, schema, feedback.as_deref());
            let reply = match self
                .model
                .generate(&prompt, Some(EXTRACT_SYSTEM_PROMPT), self.temperature, EXTRACT_MAX_TOKENS)
                .await
            {
                Ok(reply) => reply,
                Err(e) => {
                    // Transient endpoint failures consume one attempt
                    last_error = e.to_string();
                    warn!(
                        category = %schema.category,
                        attempt = attempts,
                        error = %last_error,
                        retryable = e.is_retryable(),
                        "LLM call failed"
                    );
                    sink.record(attempts, Some(&last_error), last_raw.as_deref());
                    continue;
                }
            };

            let cleaned = Self::strip_code_fences(&reply);
            last_raw = Some(reply.clone());

            let parsed: Value = match serde_json::from_str(cleaned) {
                Ok(v) => v,
                Err(e) => {
                    last_error = format!("output is not valid JSON: {}", e);
                    debug!(category = %schema.category, attempt = attempts, "Extraction parse failure");
                    sink.record(attempts, Some(&last_error), last_raw.as_deref());
                    feedback = Some(last_error.clone());
                    continue;
                }
            };

            match schema.validate(&parsed) {
                Ok(()) => {
                    sink.record(attempts, None, last_raw.as_deref());
                    return ExtractionOutcome::Success { value: parsed, attempts };
                }
                Err(errors) => {
                    last_error = errors.join("; ");
                    debug!(
                        category = %schema.category,
                        attempt = attempts,
                        errors = %last_error,
                        "Extraction validation failure"
                    );
                    sink.record(attempts, Some(&last_error), last_raw.as_deref());
                    feedback = Some(last_error.clone());
                }
            }
        }

        ExtractionOutcome::NeedsManualReview { error: last_error, last_raw, attempts }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::LlmError;
    use crate::llm::schema::SchemaSet;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted model: pops the next canned reply per call and records
    /// every prompt it saw.
    struct ScriptedModel {
        replies: Mutex<Vec<Result<String, LlmError>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<Result<String, LlmError>>) -> Self {
            let mut replies = replies;
            replies.reverse();
            Self { replies: Mutex::new(replies), prompts: Mutex::new(Vec::new()) }
        }

        fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn generate(
            &self,
            prompt: &str,
            _system_prompt: Option<&str>,
            _temperature: f32,
            _max_tokens: u32,
        ) -> Result<String, LlmError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Err(LlmError::Network("script exhausted".into())))
        }
    }

    struct CountingSink {
        records: Mutex<Vec<(i64, Option<String>)>>,
    }

    impl CountingSink {
        fn new() -> Self {
            Self { records: Mutex::new(Vec::new()) }
        }
    }

    impl AttemptSink for CountingSink {
        fn record(&self, attempts: i64, error: Option<&str>, _raw_output: Option<&str>) {
            self.records.lock().unwrap().push((attempts, error.map(String::from)));
        }
    }

    fn sleep_schema() -> CategorySchema {
        SchemaSet::default().get("sleep").clone()
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(Extractor::strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(Extractor::strip_code_fences("```\n{}\n```"), "{}");
        assert_eq!(Extractor::strip_code_fences("  {\"a\":1}  "), "{\"a\":1}");
    }

    #[tokio::test]
    async fn test_successful_extraction_first_attempt() {
        let reply = r#"{"summary": "Slept 7 hours, quality 6/10",
            "data": {"duration_hours": 7, "quality": 6, "bed_time": "23:00", "wake_time": "06:00"}}"#;
        let model = Arc::new(ScriptedModel::new(vec![Ok(reply.to_string())]));
        let extractor = Extractor::new(model, 0.1);
        let sink = CountingSink::new();

        let outcome = extractor
            .extract(
                "Slept 7 hours, quality 6/10, in bed 11pm woke 6am",
                "How did you sleep?",
                &sleep_schema(),
                0,
                5,
                &sink,
            )
            .await;

        match outcome {
            ExtractionOutcome::Success { value, attempts } => {
                assert_eq!(attempts, 1);
                assert_eq!(value["data"]["duration_hours"], 7);
                assert_eq!(value["data"]["quality"], 6);
            }
            other => panic!("expected success, got {:?}", other),
        }
        assert_eq!(sink.records.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_corrective_feedback_reaches_next_prompt() {
        let good = r#"{"summary": "ok", "data": {"duration_hours": 7}}"#;
        let model = Arc::new(ScriptedModel::new(vec![
            Ok("not json at all".to_string()),
            Ok(good.to_string()),
        ]));
        let extractor = Extractor::new(model.clone(), 0.1);

        let outcome = extractor
            .extract("slept 7h", "How did you sleep?", &sleep_schema(), 0, 5, &NullSink)
            .await;

        match outcome {
            ExtractionOutcome::Success { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("expected success, got {:?}", other),
        }
        let prompts = model.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(!prompts[0].contains("previous output was rejected"));
        assert!(prompts[1].contains("previous output was rejected"));
        assert!(prompts[1].contains("not valid JSON"));
    }

    #[tokio::test]
    async fn test_exhausted_budget_becomes_manual_review() {
        let replies = (0..5).map(|_| Ok("{broken".to_string())).collect();
        let model = Arc::new(ScriptedModel::new(replies));
        let extractor = Extractor::new(model, 0.1);
        let sink = CountingSink::new();

        let outcome = extractor
            .extract("slept fine", "How did you sleep?", &sleep_schema(), 0, 5, &sink)
            .await;

        match outcome {
            ExtractionOutcome::NeedsManualReview { attempts, last_raw, error } => {
                assert_eq!(attempts, 5);
                assert_eq!(last_raw.as_deref(), Some("{broken"));
                assert!(error.contains("not valid JSON"));
            }
            other => panic!("expected manual review, got {:?}", other),
        }
        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records.last().unwrap().0, 5);
    }

    #[tokio::test]
    async fn test_network_error_consumes_attempt() {
        let good = r#"{"summary": "ok", "data": {"duration_hours": 6.5}}"#;
        let model = Arc::new(ScriptedModel::new(vec![
            Err(LlmError::Timeout("deadline".into())),
            Ok(good.to_string()),
        ]));
        let extractor = Extractor::new(model, 0.1);

        let outcome = extractor
            .extract("6.5h", "How did you sleep?", &sleep_schema(), 0, 5, &NullSink)
            .await;
        match outcome {
            ExtractionOutcome::Success { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resume_respects_remaining_budget() {
        // 3 attempts already persisted; only 2 more may run
        let replies = (0..5).map(|_| Ok("{broken".to_string())).collect();
        let model = Arc::new(ScriptedModel::new(replies));
        let extractor = Extractor::new(model.clone(), 0.1);

        let outcome = extractor
            .extract("slept", "How did you sleep?", &sleep_schema(), 3, 5, &NullSink)
            .await;
        match outcome {
            ExtractionOutcome::NeedsManualReview { attempts, .. } => assert_eq!(attempts, 5),
            other => panic!("expected manual review, got {:?}", other),
        }
        assert_eq!(model.prompts().len(), 2);
    }

    #[tokio::test]
    async fn test_validation_failure_feeds_range_error_back() {
        let bad = r#"{"summary": "ok", "data": {"duration_hours": 7, "quality": 42}}"#;
        let good = r#"{"summary": "ok", "data": {"duration_hours": 7, "quality": 6}}"#;
        let model = Arc::new(ScriptedModel::new(vec![Ok(bad.to_string()), Ok(good.to_string())]));
        let extractor = Extractor::new(model.clone(), 0.1);

        let outcome = extractor
            .extract("slept", "How did you sleep?", &sleep_schema(), 0, 5, &NullSink)
            .await;
        assert!(matches!(outcome, ExtractionOutcome::Success { attempts: 2, .. }));
        assert!(model.prompts()[1].contains("outside range 1-10"));
    }
}
