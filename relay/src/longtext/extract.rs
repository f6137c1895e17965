//! Per-chunk extraction shape and the deduplicating reduce.
//!
//! Map responses are parsed tolerantly; a chunk that cannot be parsed
//! contributes nothing. The merge normalizes (lowercase, collapsed
//! whitespace) before deduplication, and is idempotent.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::protocol::parse_lenient;

/// One task pulled out of a plan document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedTask {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", alias = "dependsOn")]
    pub depends_on: Vec<String>,
}

/// One risk with an optional mitigation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRisk {
    pub risk: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mitigation: Option<String>,
}

/// Everything one map step can extract; missing fields default to empty.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(default)]
    pub milestones: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<ExtractedTask>,
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub risks: Vec<ExtractedRisk>,
    #[serde(default)]
    pub unknowns: Vec<String>,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.goals.is_empty()
            && self.milestones.is_empty()
            && self.tasks.is_empty()
            && self.metrics.is_empty()
            && self.risks.is_empty()
            && self.unknowns.is_empty()
    }

    /// Item count across all fields, for chunk summaries.
    pub fn item_count(&self) -> usize {
        self.goals.len()
            + self.milestones.len()
            + self.tasks.len()
            + self.metrics.len()
            + self.risks.len()
            + self.unknowns.len()
    }
}

/// Parses one map response. Accepts the object under `extracted` or at the
/// top level; unparseable responses yield `None`.
pub fn parse_extraction(response: &str) -> Option<Extraction> {
    let value = parse_lenient(response)?;
    let payload = value.get("extracted").cloned().unwrap_or(value);
    if !payload.is_object() {
        return None;
    }
    serde_json::from_value::<Extraction>(sanitize(payload)).ok()
}

/// Drops non-string entries from the string arrays so one bad element does
/// not discard the whole chunk.
fn sanitize(mut payload: Value) -> Value {
    if let Some(obj) = payload.as_object_mut() {
        for key in ["goals", "milestones", "metrics", "unknowns"] {
            if let Some(arr) = obj.get_mut(key).and_then(Value::as_array_mut) {
                arr.retain(|v| v.is_string());
            }
        }
        for key in ["tasks", "risks"] {
            if let Some(arr) = obj.get_mut(key).and_then(Value::as_array_mut) {
                arr.retain(|v| v.is_object());
            }
        }
    }
    payload
}

fn normalize(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn dedup_strings(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items
        .into_iter()
        .filter(|s| !normalize(s).is_empty())
        .filter(|s| seen.insert(normalize(s)))
        .collect()
}

/// Merges map extractions: tasks dedupe by normalized title, risks by
/// normalized risk text, everything else by normalized value.
pub fn merge_extractions(extractions: Vec<Extraction>) -> Extraction {
    let mut merged = Extraction::default();
    let mut task_titles = std::collections::HashSet::new();
    let mut risk_texts = std::collections::HashSet::new();
    for e in extractions {
        merged.goals.extend(e.goals);
        merged.milestones.extend(e.milestones);
        merged.metrics.extend(e.metrics);
        merged.unknowns.extend(e.unknowns);
        for task in e.tasks {
            if !normalize(&task.title).is_empty() && task_titles.insert(normalize(&task.title)) {
                merged.tasks.push(task);
            }
        }
        for risk in e.risks {
            if !normalize(&risk.risk).is_empty() && risk_texts.insert(normalize(&risk.risk)) {
                merged.risks.push(risk);
            }
        }
    }
    merged.goals = dedup_strings(merged.goals);
    merged.milestones = dedup_strings(merged.milestones);
    merged.metrics = dedup_strings(merged.metrics);
    merged.unknowns = dedup_strings(merged.unknowns);
    merged
}
