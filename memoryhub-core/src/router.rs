//! Deterministic tier assignment.

use crate::types::Tier;

/// Classifies a record into exactly one [`Tier`] from its content and tags.
///
/// Rules are matched in order; the first match wins. `context_path` is never
/// inspected — callers rely on this being a pure function of content and
/// tags alone.
#[must_use]
pub fn classify(content: &str, tags: &[String]) -> Tier {
    let lower = content.to_lowercase();

    if lower.contains("task_id") || lower.contains("window_id") {
        return Tier::Core;
    }
    if lower.contains("log") || lower.contains("trace") {
        return Tier::Application;
    }
    if tags.iter().any(|t| t.eq_ignore_ascii_case("archive")) {
        return Tier::Archive;
    }
    Tier::Session
}
