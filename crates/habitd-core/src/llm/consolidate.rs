//! Session consolidation: many Q/A turns -> one structured record
//!
//! The LLM merges every turn of a session (initial questions plus
//! follow-ups) into a single JSON object keyed by category. The
//! deterministic parts — dropping categories the session never touched
//! and deduplicating facts that appear under two categories — happen in
//! post-processing, so consolidation is reproducible modulo the model's
//! own (temperature-pinned) output.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::warn;

use super::client::{ChatModel, LlmError};
use super::extract::Extractor;
use crate::types::SessionQa;

const CONSOLIDATE_SYSTEM_PROMPT: &str = "You are a health data consolidation assistant. \
Merge all question/answer turns of one check-in session into a single JSON object.\n\n\
Rules:\n\
- Top-level keys are category names; each value is an object of extracted facts.\n\
- A fact mentioned in several answers appears exactly once, under the category \
explicitly asked about in the question it answered.\n\
- Skipped (empty) answers contribute nothing.\n\
Respond with valid JSON only, no markdown.";

const CONSOLIDATE_MAX_TOKENS: u32 = 2048;

pub struct Consolidator {
    model: Arc<dyn ChatModel>,
    temperature: f32,
}

impl Consolidator {
    pub fn new(model: Arc<dyn ChatModel>, temperature: f32) -> Self {
        Self { model, temperature }
    }

    fn build_prompt(qas: &[SessionQa], session_time: &str) -> String {
        let mut prompt = format!("Session time: {}\n\n", session_time);
        for (i, qa) in qas.iter().enumerate() {
            let answer = if qa.answer.trim().is_empty() { "(skipped)" } else { qa.answer.as_str() };
            prompt.push_str(&format!(
                "Q{} [{}]: {}\nA{}: {}\n",
                i + 1,
                qa.category,
                qa.question,
                i + 1,
                answer
            ));
        }
        prompt.push_str("\nMerge these into one JSON object keyed by category.");
        prompt
    }

    /// Category attribution priority: categories explicitly asked about,
    /// in question order, then everything else by ascending coverage debt.
    pub fn category_priority(qas: &[SessionQa], debts: &HashMap<String, f64>) -> Vec<String> {
        let mut priority: Vec<String> = Vec::new();
        for qa in qas {
            if !priority.iter().any(|c| c == &qa.category) {
                priority.push(qa.category.clone());
            }
        }
        let mut rest: Vec<(&String, f64)> = debts
            .iter()
            .filter(|(c, _)| !priority.iter().any(|p| &p == c))
            .map(|(c, d)| (c, *d))
            .collect();
        rest.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        priority.extend(rest.into_iter().map(|(c, _)| c.clone()));
        priority
    }

    /// Remove duplicate (field, value) facts across categories, keeping
    /// the occurrence in the highest-priority category. Categories not in
    /// the priority list are dropped entirely.
    pub fn dedupe_facts(record: &Value, priority: &[String]) -> Value {
        let obj = match record.as_object() {
            Some(o) => o,
            None => return Value::Object(Map::new()),
        };

        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut out = Map::new();

        for category in priority {
            let fields = match obj.get(category).and_then(|v| v.as_object()) {
                Some(f) => f,
                None => continue,
            };
            let mut kept = Map::new();
            for (name, value) in fields {
                let fingerprint = (name.clone(), value.to_string());
                if seen.contains(&fingerprint) {
                    continue;
                }
                seen.insert(fingerprint);
                kept.insert(name.clone(), value.clone());
            }
            if !kept.is_empty() {
                out.insert(category.clone(), Value::Object(kept));
            }
        }

        Value::Object(out)
    }

    /// Consolidate one session. Re-running on the same input yields the
    /// same output structure.
    pub async fn consolidate(
        &self,
        qas: &[SessionQa],
        session_time: &str,
        debts: &HashMap<String, f64>,
    ) -> Result<Value, LlmError> {
        let prompt = Self::build_prompt(qas, session_time);
        let reply = self
            .model
            .generate(
                &prompt,
                Some(CONSOLIDATE_SYSTEM_PROMPT),
                self.temperature,
                CONSOLIDATE_MAX_TOKENS,
            )
            .await?;

        let cleaned = Extractor::strip_code_fences(&reply);
        let parsed: Value = serde_json::from_str(cleaned)
            .map_err(|e| LlmError::Parse(format!("consolidation output: {}", e)))?;

        if !parsed.is_object() {
            warn!("Consolidation returned a non-object, substituting empty record");
            return Ok(Value::Object(Map::new()));
        }

        let priority = Self::category_priority(qas, debts);
        Ok(Self::dedupe_facts(&parsed, &priority))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct FixedModel(String);

    #[async_trait]
    impl ChatModel for FixedModel {
        async fn generate(
            &self,
            _prompt: &str,
            _system_prompt: Option<&str>,
            _temperature: f32,
            _max_tokens: u32,
        ) -> Result<String, LlmError> {
            Ok(self.0.clone())
        }
    }

    fn session() -> Vec<SessionQa> {
        vec![
            SessionQa {
                question: "How did you sleep?".into(),
                answer: "7 hours, had coffee before bed".into(),
                category: "sleep".into(),
            },
            SessionQa {
                question: "Any caffeine today?".into(),
                answer: "one coffee".into(),
                category: "substances".into(),
            },
        ]
    }

    #[test]
    fn test_priority_prefers_question_categories_in_order() {
        let mut debts = HashMap::new();
        debts.insert("sleep".to_string(), 0.9);
        debts.insert("nutrition".to_string(), 0.2);
        debts.insert("environment".to_string(), 0.7);

        let priority = Consolidator::category_priority(&session(), &debts);
        // question categories first (question order), then others by
        // ascending debt
        assert_eq!(priority, vec!["sleep", "substances", "nutrition", "environment"]);
    }

    #[test]
    fn test_dedupe_keeps_fact_in_higher_priority_category() {
        let record = json!({
            "sleep": {"duration_hours": 7, "caffeine": "coffee"},
            "substances": {"caffeine": "coffee", "amount": "1 cup"}
        });
        let priority = vec!["sleep".to_string(), "substances".to_string()];
        let deduped = Consolidator::dedupe_facts(&record, &priority);

        assert_eq!(deduped["sleep"]["caffeine"], "coffee");
        assert!(deduped["substances"].get("caffeine").is_none());
        assert_eq!(deduped["substances"]["amount"], "1 cup");
    }

    #[test]
    fn test_dedupe_drops_unknown_categories() {
        let record = json!({
            "sleep": {"duration_hours": 7},
            "astrology": {"sign": "leo"}
        });
        let deduped = Consolidator::dedupe_facts(&record, &["sleep".to_string()]);
        assert!(deduped.get("astrology").is_none());
        assert!(deduped.get("sleep").is_some());
    }

    #[test]
    fn test_dedupe_is_deterministic() {
        let record = json!({
            "sleep": {"duration_hours": 7, "note": "late coffee"},
            "substances": {"note": "late coffee"}
        });
        let priority = vec!["sleep".to_string(), "substances".to_string()];
        let a = Consolidator::dedupe_facts(&record, &priority);
        let b = Consolidator::dedupe_facts(&record, &priority);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_consolidate_end_to_end() {
        let reply = r#"{
            "sleep": {"duration_hours": 7, "quality": 6},
            "substances": {"substance_type": "caffeine", "amount": "1 cup"}
        }"#;
        let consolidator = Consolidator::new(Arc::new(FixedModel(reply.into())), 0.0);
        let record = consolidator
            .consolidate(&session(), "2024-06-01T20:00:00Z", &HashMap::new())
            .await
            .unwrap();

        assert_eq!(record["sleep"]["duration_hours"], 7);
        assert_eq!(record["substances"]["substance_type"], "caffeine");
    }

    #[tokio::test]
    async fn test_consolidate_propagates_parse_error() {
        let consolidator = Consolidator::new(Arc::new(FixedModel("nope".into())), 0.0);
        let result =
            consolidator.consolidate(&session(), "2024-06-01T20:00:00Z", &HashMap::new()).await;
        assert!(matches!(result, Err(LlmError::Parse(_))));
    }
}
