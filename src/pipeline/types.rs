//! Structured records produced by the pipeline.
//!
//! Model output is loosely shaped, so deserialization is deliberately
//! forgiving: unknown priorities become `Medium`, `null` collections become
//! empty and nested values in text fields are flattened to strings.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

// ── Priority ────────────────────────────────────────────────────────

/// Priority of an event or action item, also used for message importance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    fn parse_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" | "urgent" | "critical" => Self::High,
            "low" => Self::Low,
            _ => Self::Medium,
        }
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(match value {
            Value::String(s) => Self::parse_loose(&s),
            _ => Self::Medium,
        })
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Per-message extraction ──────────────────────────────────────────

/// An event mentioned in one message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Event {
    #[serde(deserialize_with = "lenient::string")]
    pub title: String,
    #[serde(deserialize_with = "lenient::string")]
    pub date: String,
    #[serde(deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(
        alias = "details",
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub description: Option<String>,
    pub priority: Priority,
    /// Audience the event applies to (grade, team, group).
    #[serde(deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Something the reader needs to do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionItem {
    #[serde(alias = "title", deserialize_with = "lenient::string")]
    pub action: String,
    #[serde(
        alias = "deadline",
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub due_date: Option<String>,
    pub priority: Priority,
    #[serde(deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Structured result for one message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerMessageExtraction {
    #[serde(deserialize_with = "lenient::string")]
    pub message_id: String,
    #[serde(deserialize_with = "lenient::string")]
    pub subject: String,
    #[serde(deserialize_with = "lenient::string")]
    pub sender: String,
    #[serde(deserialize_with = "lenient::string")]
    pub date: String,
    #[serde(deserialize_with = "lenient::string")]
    pub summary: String,
    #[serde(deserialize_with = "lenient::vec")]
    pub events: Vec<Event>,
    #[serde(deserialize_with = "lenient::vec")]
    pub action_items: Vec<ActionItem>,
    pub importance: Priority,
    #[serde(deserialize_with = "lenient::strings")]
    pub key_dates: Vec<String>,
    /// Set when the record is a fallback for a failed AI call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PerMessageExtraction {
    /// Attach source metadata from the originating message.
    pub fn with_source(
        mut self,
        message_id: &str,
        subject: &str,
        sender: &str,
        date: &str,
    ) -> Self {
        self.message_id = message_id.to_string();
        self.subject = subject.to_string();
        self.sender = sender.to_string();
        self.date = date.to_string();
        self
    }
}

// ── Digest ──────────────────────────────────────────────────────────

/// One distinct real-world event in the digest calendar.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarEntry {
    #[serde(alias = "event", deserialize_with = "lenient::string")]
    pub title: String,
    #[serde(deserialize_with = "lenient::string")]
    pub date: String,
    #[serde(deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(alias = "description", deserialize_with = "lenient::string")]
    pub details: String,
    #[serde(deserialize_with = "lenient::strings")]
    pub sources: Vec<String>,
}

/// The consolidated digest for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DigestRecord {
    #[serde(deserialize_with = "lenient::string")]
    pub executive_summary: String,
    #[serde(deserialize_with = "lenient::vec")]
    pub event_calendar: Vec<CalendarEntry>,
    #[serde(deserialize_with = "lenient::vec")]
    pub action_items: Vec<ActionItem>,
    /// Always plain narrative strings.
    #[serde(deserialize_with = "lenient::strings")]
    pub important_announcements: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ── Lenient field deserializers ─────────────────────────────────────

pub(crate) mod lenient {
    use super::*;

    /// Keys tried, in order, when an object shows up where text was expected.
    const TEXT_KEYS: &[&str] = &["announcement", "text", "description", "details", "title", "summary"];

    /// Flatten any JSON value into display text.
    pub fn flatten(value: &Value) -> String {
        match value {
            Value::Null => String::new(),
            Value::String(s) => s.trim().to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Array(items) => items
                .iter()
                .map(flatten)
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join("; "),
            Value::Object(map) => TEXT_KEYS
                .iter()
                .find_map(|k| map.get(*k).map(flatten).filter(|s| !s.is_empty()))
                .unwrap_or_else(|| {
                    map.iter()
                        .map(|(k, v)| format!("{k}: {}", flatten(v)))
                        .collect::<Vec<_>>()
                        .join(", ")
                }),
        }
    }

    pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Ok(flatten(&Value::deserialize(d)?))
    }

    pub fn opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        let s = flatten(&Value::deserialize(d)?);
        Ok(if s.is_empty() { None } else { Some(s) })
    }

    /// A list of strings; a bare scalar becomes a one-element list.
    pub fn strings<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Null => Vec::new(),
            Value::Array(items) => items
                .iter()
                .map(flatten)
                .filter(|s| !s.is_empty())
                .collect(),
            other => {
                let s = flatten(&other);
                if s.is_empty() { Vec::new() } else { vec![s] }
            }
        })
    }

    /// A list of records; malformed elements are dropped.
    pub fn vec<'de, D, T>(d: D) -> Result<Vec<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: DeserializeOwned,
    {
        Ok(match Value::deserialize(d)? {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| serde_json::from_value(item).ok())
                .collect(),
            _ => Vec::new(),
        })
    }
}
