//! The logical record and its storage tier.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;

/// One of the four storage classes a record can be routed to.
///
/// Assigned by [`crate::router::classify`] at store time and never
/// overridable by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Session,
    Core,
    Application,
    Archive,
}

impl Tier {
    /// The four tiers, in the priority order `recall` fans out across.
    pub const RECALL_PRIORITY: [Tier; 4] =
        [Tier::Core, Tier::Application, Tier::Archive, Tier::Session];

    /// Wire name used in JSONL/SQL records and the on-disk layout.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Session => "session",
            Tier::Core => "core",
            Tier::Application => "application",
            Tier::Archive => "archive",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = Error;

    /// Accepts the canonical tier names, plus the historical alias `"app"`
    /// for `"application"` that the original `load_layer` call honored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session" => Ok(Tier::Session),
            "core" => Ok(Tier::Core),
            "application" | "app" => Ok(Tier::Application),
            "archive" => Ok(Tier::Archive),
            other => Err(Error::InvalidInput(format!("unknown tier: {other}"))),
        }
    }
}

/// Set operation applied across the tags passed to `recall_by_tags`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecallOp {
    Intersection,
    Union,
}

/// A stored memory.
///
/// `extra` preserves any JSONL keys this implementation does not otherwise
/// model, so a rewrite (flush, rebuild) never drops caller-supplied data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub content: String,
    pub tags: Vec<String>,
    #[serde(default)]
    pub context_path: String,
    pub tier: Tier,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub recalled_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_recalled: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Record {
    /// Case-insensitive substring match against content, any tag, or the
    /// context path — the one search primitive every tier shares.
    #[must_use]
    pub fn matches(&self, query_lower: &str) -> bool {
        if query_lower.is_empty() {
            return true;
        }
        if self.content.to_lowercase().contains(query_lower) {
            return true;
        }
        if self.context_path.to_lowercase().contains(query_lower) {
            return true;
        }
        self.tags.iter().any(|t| t.to_lowercase().contains(query_lower))
    }

    /// Lowercased tag set, used by the tag pre-index and the bitmap index.
    #[must_use]
    pub fn lowercase_tags(&self) -> Vec<String> {
        self.tags.iter().map(|t| t.to_lowercase()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Record {
        Record {
            id: "mem_1".into(),
            content: "hello world".into(),
            tags: vec!["Greeting".into()],
            context_path: "/a/b".into(),
            tier: Tier::Session,
            created_at: Utc::now(),
            recalled_count: 0,
            last_recalled: None,
            stored_at: None,
            updated_at: None,
            extra: Map::new(),
        }
    }

    #[test]
    fn tier_round_trips_through_display_and_fromstr() {
        for t in Tier::RECALL_PRIORITY {
            assert_eq!(t.as_str().parse::<Tier>().unwrap().as_str(), t.as_str());
        }
    }

    #[test]
    fn app_alias_resolves_to_application() {
        assert_eq!("app".parse::<Tier>().unwrap(), Tier::Application);
    }

    #[test]
    fn matches_is_case_insensitive_over_content_tags_and_path() {
        let r = sample();
        assert!(r.matches("hello"));
        assert!(r.matches("HELLO"));
        assert!(r.matches("greeting"));
        assert!(r.matches("/a/b"));
        assert!(!r.matches("nonexistent"));
    }

    #[test]
    fn empty_query_matches_everything() {
        assert!(sample().matches(""));
    }

    #[test]
    fn extra_keys_round_trip() {
        let mut r = sample();
        r.extra.insert("custom_field".into(), Value::String("x".into()));
        let json = serde_json::to_string(&r).unwrap();
        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(back.extra.get("custom_field"), Some(&Value::String("x".into())));
    }
}
