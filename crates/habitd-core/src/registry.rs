//! Category registry - static table of tracked categories
//!
//! Loaded once at startup from built-in defaults merged with config.yaml
//! overrides; read-only afterwards. Adding a category requires a restart.

use std::collections::HashMap;

use anyhow::{anyhow, Result};

use crate::config::CategoryConfig;
use crate::types::Category;

/// A category plus its scheduling metadata and question template bank
#[derive(Debug, Clone)]
pub struct CategorySpec {
    pub category: Category,
    /// Minimum hours between asking about this category again
    pub min_interval_hours: i64,
    pub templates: Vec<String>,
}

/// Read-only category lookup. Iteration order is the configured order,
/// which is also the scheduler's tie-break order.
#[derive(Debug)]
pub struct CategoryRegistry {
    specs: Vec<CategorySpec>,
    by_name: HashMap<String, usize>,
}

fn spec(
    name: &str,
    description: &str,
    frequency_per_day: i64,
    critical: bool,
    min_interval_hours: i64,
    templates: &[&str],
) -> CategorySpec {
    CategorySpec {
        category: Category {
            name: name.to_string(),
            description: description.to_string(),
            frequency_per_day,
            preferred_times: Vec::new(),
            critical,
        },
        min_interval_hours,
        templates: templates.iter().map(|t| t.to_string()).collect(),
    }
}

/// Built-in category table. Frequencies and re-ask limits follow the
/// tracked defaults; critical categories may break quiet hours.
fn built_in() -> Vec<CategorySpec> {
    vec![
        spec(
            "sleep",
            "Sleep duration and quality",
            1,
            true,
            24,
            &[
                "How did you sleep last night? Rate quality 1-10 and describe any issues.",
                "What time did you get to bed and wake up? How rested do you feel (1-10)?",
            ],
        ),
        spec(
            "nutrition",
            "Food and drink intake",
            3,
            false,
            8,
            &[
                "What have you eaten recently? Include approximate times and portions.",
                "Describe your last meal - what, when, and how much?",
            ],
        ),
        spec(
            "physical_activity",
            "Exercise and movement",
            2,
            false,
            8,
            &[
                "What physical activity have you done today?",
                "Any exercise or movement since your last check-in? What kind and how long?",
            ],
        ),
        spec(
            "substances",
            "Caffeine, alcohol, medication, supplements",
            2,
            false,
            12,
            &[
                "Have you consumed any caffeine, alcohol, or other substances today?",
                "Any medications, supplements, or stimulants since you last checked in?",
            ],
        ),
        spec(
            "mental_state",
            "Mood and emotions",
            4,
            true,
            4,
            &[
                "How are you feeling right now? Rate your mood 1-10.",
                "What's your emotional state at the moment? Give a 1-10 mood rating.",
                "Describe how you're feeling - mood 1-10 and anything on your mind.",
            ],
        ),
        spec(
            "stress_anxiety",
            "Stress and anxiety levels",
            3,
            true,
            6,
            &[
                "What's your current stress level (1-10)? Any specific triggers?",
                "How anxious or stressed do you feel right now (1-10)? What's driving it?",
            ],
        ),
        spec(
            "physical_symptoms",
            "Pain, headaches, illness",
            2,
            false,
            12,
            &[
                "Any physical symptoms to note? Headaches, fatigue, pain?",
                "How does your body feel - any discomfort, pain, or unusual symptoms?",
            ],
        ),
        spec(
            "social_interaction",
            "Social contact and its quality",
            2,
            false,
            12,
            &[
                "Who have you interacted with today and how did it go?",
                "Any meaningful social contact recently? Rate how it felt (1-10).",
            ],
        ),
        spec(
            "work_productivity",
            "Focus and accomplishment",
            2,
            false,
            12,
            &[
                "How focused have you been today (1-10)? What did you accomplish?",
                "How is work going - focus level 1-10 and main tasks done?",
            ],
        ),
        spec(
            "environment",
            "Location, noise, comfort",
            1,
            false,
            24,
            &[
                "Describe your current environment - location, noise, comfort level.",
                "Where are you right now, and how comfortable is it?",
            ],
        ),
    ]
}

impl CategoryRegistry {
    /// Build from config overrides layered over the built-in table.
    /// Unknown config names are appended as new categories; duplicate
    /// names are a startup error.
    pub fn from_config(overrides: &[CategoryConfig]) -> Result<Self> {
        let mut specs = built_in();
        let mut seen: HashMap<String, usize> =
            specs.iter().enumerate().map(|(i, s)| (s.category.name.clone(), i)).collect();

        let mut configured: HashMap<&str, ()> = HashMap::new();
        for cfg in overrides {
            if configured.insert(cfg.name.as_str(), ()).is_some() {
                return Err(anyhow!("Duplicate category in config: {}", cfg.name));
            }
            match seen.get(&cfg.name) {
                Some(&idx) => apply_override(&mut specs[idx], cfg),
                None => {
                    let mut s = spec(&cfg.name, "", 1, false, 12, &[]);
                    apply_override(&mut s, cfg);
                    if s.templates.is_empty() {
                        s.templates.push(generic_question(&cfg.name));
                    }
                    seen.insert(cfg.name.clone(), specs.len());
                    specs.push(s);
                }
            }
        }

        let by_name =
            specs.iter().enumerate().map(|(i, s)| (s.category.name.clone(), i)).collect();
        Ok(Self { specs, by_name })
    }

    pub fn get(&self, name: &str) -> Option<&CategorySpec> {
        self.by_name.get(name).map(|&i| &self.specs[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// All categories in configured order
    pub fn ordered(&self) -> &[CategorySpec] {
        &self.specs
    }

    /// Position in configured order (tie-break key); unknown sorts last
    pub fn position(&self, name: &str) -> usize {
        self.by_name.get(name).copied().unwrap_or(usize::MAX)
    }

    pub fn critical_names(&self) -> Vec<&str> {
        self.specs
            .iter()
            .filter(|s| s.category.critical)
            .map(|s| s.category.name.as_str())
            .collect()
    }

    /// Pick the template at `cursor` (wrapping); rotating the cursor per
    /// user avoids immediate repetition of the same wording.
    pub fn template_at(&self, name: &str, cursor: i64) -> Option<&str> {
        let spec = self.get(name)?;
        if spec.templates.is_empty() {
            return None;
        }
        let idx = (cursor.rem_euclid(spec.templates.len() as i64)) as usize;
        Some(&spec.templates[idx])
    }
}

fn apply_override(spec: &mut CategorySpec, cfg: &CategoryConfig) {
    if let Some(d) = &cfg.description {
        spec.category.description = d.clone();
    }
    if let Some(f) = cfg.frequency_per_day {
        spec.category.frequency_per_day = f;
    }
    if let Some(t) = &cfg.preferred_times {
        spec.category.preferred_times = t.clone();
    }
    if let Some(c) = cfg.critical {
        spec.category.critical = c;
    }
    if let Some(h) = cfg.min_interval_hours {
        spec.min_interval_hours = h;
    }
    if let Some(t) = &cfg.templates {
        spec.templates = t.clone();
    }
}

/// Fallback question when a configured category has no templates
pub fn generic_question(category: &str) -> String {
    format!("How are you doing with your {}?", category.replace('_', " "))
}
