//! Gap analysis: which categories did a session fail to cover?
//!
//! One LLM call over all Q/A pairs of the session. The reply is parsed
//! defensively: malformed entries and categories outside the required set
//! are dropped, never fatal. The follow-up list is capped, keeping the
//! categories with the largest coverage debt.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use super::client::{ChatModel, LlmError};
use super::extract::Extractor;
use crate::registry::generic_question;
use crate::types::SessionQa;

const GAP_SYSTEM_PROMPT: &str = "You are a health tracking assistant reviewing a check-in \
session. Decide which of the required categories were NOT adequately addressed by the \
user's answers. An empty answer means the user skipped the question.\n\n\
Respond with JSON only, in the form:\n\
{\"missing\": [{\"category\": \"<name>\", \"question\": \"<one concise follow-up question>\"}]}\n\
Only use category names from the required list. Return {\"missing\": []} when everything \
is covered.";

const GAP_MAX_TOKENS: u32 = 1024;

/// One follow-up question for a missing category
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowUp {
    pub category: String,
    pub question: String,
}

/// Result of gap analysis. Empty `missing_categories` means the session
/// is materially complete.
#[derive(Debug, Clone, Default)]
pub struct Gap {
    pub missing_categories: Vec<String>,
    pub follow_ups: Vec<FollowUp>,
}

impl Gap {
    pub fn is_complete(&self) -> bool {
        self.missing_categories.is_empty()
    }
}

pub struct GapAnalyzer {
    model: Arc<dyn ChatModel>,
    temperature: f32,
    max_follow_ups: usize,
}

impl GapAnalyzer {
    pub fn new(model: Arc<dyn ChatModel>, temperature: f32, max_follow_ups: usize) -> Self {
        Self { model, temperature, max_follow_ups }
    }

    fn build_prompt(qas: &[SessionQa], required_categories: &[String]) -> String {
        let mut prompt = format!("Required categories: {}\n\n", required_categories.join(", "));
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
        prompt.push_str("\nWhich required categories are still missing?");
        prompt
    }

    /// Analyze one session round. `debts` orders truncation when the LLM
    /// proposes more follow-ups than the cap allows.
    pub async fn analyze(
        &self,
        qas: &[SessionQa],
        required_categories: &[String],
        debts: &HashMap<String, f64>,
    ) -> Result<Gap, LlmError> {
        let prompt = Self::build_prompt(qas, required_categories);
        let reply = self
            .model
            .generate(&prompt, Some(GAP_SYSTEM_PROMPT), self.temperature, GAP_MAX_TOKENS)
            .await?;

        let cleaned = Extractor::strip_code_fences(&reply);
        let parsed: Value = match serde_json::from_str(cleaned) {
            Ok(v) => v,
            Err(e) => {
                // Malformed analysis must not fail the session
                warn!(error = %e, "Gap analysis returned unparseable JSON, treating as complete");
                return Ok(Gap::default());
            }
        };

        let entries = parsed.get("missing").and_then(|m| m.as_array()).cloned().unwrap_or_default();

        let mut follow_ups: Vec<FollowUp> = Vec::new();
        for entry in &entries {
            let category = match entry.get("category").and_then(|c| c.as_str()) {
                Some(c) => c,
                None => {
                    debug!(entry = %entry, "Dropping malformed gap entry");
                    continue;
                }
            };
            if !required_categories.iter().any(|r| r == category) {
                debug!(category, "Dropping gap entry outside required categories");
                continue;
            }
            if follow_ups.iter().any(|f| f.category == category) {
                continue;
            }
            let question = entry
                .get("question")
                .and_then(|q| q.as_str())
                .map(str::to_string)
                .filter(|q| !q.trim().is_empty())
                .unwrap_or_else(|| generic_question(category));
            follow_ups.push(FollowUp { category: category.to_string(), question });
        }

        // Cap total follow-ups, keeping the largest-debt categories
        if follow_ups.len() > self.max_follow_ups {
            follow_ups.sort_by(|a, b| {
                let da = debts.get(&a.category).copied().unwrap_or(0.0);
                let db = debts.get(&b.category).copied().unwrap_or(0.0);
                db.partial_cmp(&da).unwrap_or(std::cmp::Ordering::Equal)
            });
            follow_ups.truncate(self.max_follow_ups);
        }

        let missing_categories = follow_ups.iter().map(|f| f.category.clone()).collect();
        Ok(Gap { missing_categories, follow_ups })
    }
}
