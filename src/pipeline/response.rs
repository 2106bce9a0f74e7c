//! Tolerant parsing of model output.
//!
//! The JSON payload is located by trying candidate regions in a fixed
//! order: a ```` ```json ```` fence, a bare ```` ``` ```` fence, the whole
//! text, and finally the outermost `{ ... }` span. The first region that
//! parses as a JSON object wins. Nothing here returns an error: output that
//! yields no object becomes a degraded record.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::pipeline::types::{DigestRecord, PerMessageExtraction};

pub const DEFAULT_SUMMARY: &str = "Email processed - see events and action items below.";
pub const DEFAULT_EXECUTIVE_SUMMARY: &str = "Digest created - see events and action items below.";
pub const UNPARSEABLE_SUMMARY: &str = "Unable to generate summary";

/// Characters of raw output kept as the narrative of a degraded record.
pub const DEGRADED_NARRATIVE_CHARS: usize = 500;

const JSON_FENCE: &str = "```json";
const FENCE: &str = "```";

/// Where a JSON payload was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSource {
    JsonFence,
    GenericFence,
    Raw,
    BraceBounds,
}

impl PayloadSource {
    const PRECEDENCE: [PayloadSource; 4] = [
        PayloadSource::JsonFence,
        PayloadSource::GenericFence,
        PayloadSource::Raw,
        PayloadSource::BraceBounds,
    ];

    /// The region of `text` this source designates, if present.
    fn region(self, text: &str) -> Option<&str> {
        match self {
            Self::JsonFence => fenced(text, JSON_FENCE, false),
            Self::GenericFence => fenced(text, FENCE, true),
            Self::Raw => Some(text.trim()),
            Self::BraceBounds => {
                let start = text.find('{')?;
                let end = text.rfind('}')?;
                (end > start).then(|| &text[start..=end])
            }
        }
    }
}

/// Body of the first fence opened by `open`. An unterminated fence runs to
/// the end of the text. With `skip_tag`, a language tag on the opening line
/// is dropped.
fn fenced<'a>(text: &'a str, open: &str, skip_tag: bool) -> Option<&'a str> {
    let start = text.find(open)? + open.len();
    let mut body = &text[start..];

    if skip_tag {
        let line_end = body.find('\n').unwrap_or(body.len());
        let tag = &body[..line_end];
        if !tag.is_empty() && tag.trim().chars().all(|c| c.is_ascii_alphanumeric()) {
            body = &body[line_end..];
        }
    }

    let end = body.find(FENCE).unwrap_or(body.len());
    Some(body[..end].trim())
}

/// Locate and parse the JSON object in model output.
pub fn extract_json_object(text: &str) -> Option<(PayloadSource, Map<String, Value>)> {
    PayloadSource::PRECEDENCE.into_iter().find_map(|source| {
        let region = source.region(text)?;
        match serde_json::from_str::<Value>(region) {
            Ok(Value::Object(map)) => Some((source, map)),
            _ => None,
        }
    })
}

/// Narrative for a record whose response could not be parsed.
pub fn degraded_narrative(raw: &str) -> String {
    if raw.trim().is_empty() {
        UNPARSEABLE_SUMMARY.to_string()
    } else {
        raw.chars().take(DEGRADED_NARRATIVE_CHARS).collect()
    }
}

/// Parse a per-message response. Never fails.
pub fn parse_message_response(raw: &str) -> PerMessageExtraction {
    let parsed = extract_json_object(raw).and_then(|(source, map)| {
        debug!(?source, "Located JSON in message response");
        serde_json::from_value::<PerMessageExtraction>(Value::Object(map))
            .map_err(|e| warn!(error = %e, "Message response has unusable shape"))
            .ok()
    });

    match parsed {
        Some(mut record) => {
            if record.summary.trim().is_empty() {
                warn!("No summary in AI response, using default");
                record.summary = DEFAULT_SUMMARY.to_string();
            }
            record
        }
        None => {
            warn!(
                preview = %raw.chars().take(200).collect::<String>(),
                "Could not parse message response as JSON"
            );
            PerMessageExtraction {
                summary: degraded_narrative(raw),
                ..Default::default()
            }
        }
    }
}

/// Parse a consolidation response. Never fails.
pub fn parse_digest_response(raw: &str) -> DigestRecord {
    let parsed = extract_json_object(raw).and_then(|(source, map)| {
        debug!(?source, "Located JSON in digest response");
        serde_json::from_value::<DigestRecord>(Value::Object(map))
            .map_err(|e| warn!(error = %e, "Digest response has unusable shape"))
            .ok()
    });

    match parsed {
        Some(mut digest) => {
            if digest.executive_summary.trim().is_empty() {
                warn!("No executive summary in AI response, using default");
                digest.executive_summary = DEFAULT_EXECUTIVE_SUMMARY.to_string();
            }
            digest
        }
        None => {
            warn!(
                preview = %raw.chars().take(200).collect::<String>(),
                "Could not parse digest response as JSON"
            );
            DigestRecord {
                executive_summary: degraded_narrative(raw),
                ..Default::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::Priority;

    #[test]
    fn raw_object() {
        let (source, map) = extract_json_object(r#"{"summary": "ok"}"#).unwrap();
        assert_eq!(source, PayloadSource::Raw);
        assert_eq!(map["summary"], "ok");
    }

    #[test]
    fn json_fence_wins_over_earlier_generic_text() {
        let text = "Here you go:\n```json\n{\"summary\": \"fenced\"}\n```\nthanks";
        let (source, map) = extract_json_object(text).unwrap();
        assert_eq!(source, PayloadSource::JsonFence);
        assert_eq!(map["summary"], "fenced");
    }

    #[test]
    fn generic_fence_with_and_without_tag() {
        let (source, map) = extract_json_object("```\n{\"a\": 1}\n```").unwrap();
        assert_eq!(source, PayloadSource::GenericFence);
        assert_eq!(map["a"], 1);

        let (source, _) = extract_json_object("```JSON\n{\"a\": 1}\n```").unwrap();
        assert_eq!(source, PayloadSource::GenericFence);
    }

    #[test]
    fn unterminated_fence_is_tolerated() {
        let (source, _) = extract_json_object("```json\n{\"a\": 1}").unwrap();
        assert_eq!(source, PayloadSource::JsonFence);
    }

    #[test]
    fn brace_bounds_as_last_resort() {
        let text = "Sure! The result is {\"summary\": \"inline\"} as requested.";
        let (source, map) = extract_json_object(text).unwrap();
        assert_eq!(source, PayloadSource::BraceBounds);
        assert_eq!(map["summary"], "inline");
    }

    #[test]
    fn arrays_are_not_objects() {
        assert!(extract_json_object("[1, 2, 3]").is_none());
    }

    #[test]
    fn no_braces_degrades_without_error() {
        let record = parse_message_response("I could not read this email, sorry.");
        assert_eq!(record.summary, "I could not read this email, sorry.");
        assert!(record.events.is_empty());
        assert!(record.action_items.is_empty());
        assert_eq!(record.importance, Priority::Medium);
    }

    #[test]
    fn degraded_narrative_is_capped() {
        let raw = "é".repeat(2000);
        let record = parse_message_response(&raw);
        assert_eq!(record.summary.chars().count(), DEGRADED_NARRATIVE_CHARS);
    }

    #[test]
    fn empty_response_gets_fixed_narrative() {
        assert_eq!(parse_message_response("").summary, UNPARSEABLE_SUMMARY);
        assert_eq!(parse_digest_response("  ").executive_summary, UNPARSEABLE_SUMMARY);
    }

    #[test]
    fn missing_summary_uses_default() {
        let record = parse_message_response(r#"{"summary": "", "events": [{"title": "Assembly", "date": "Nov 3"}]}"#);
        assert_eq!(record.summary, DEFAULT_SUMMARY);
        assert_eq!(record.events.len(), 1);
    }

    #[test]
    fn full_message_response() {
        let raw = r#"```json
{
  "summary": "Festival on Friday.",
  "events": [{"title": "Fall Festival", "date": "Friday, Oct 31", "time": "3 PM", "priority": "high"}],
  "action_items": [{"action": "Send RSVP", "due_date": "Oct 24"}],
  "importance": "high",
  "key_dates": ["Oct 31"]
}
```"#;
        let record = parse_message_response(raw);
        assert_eq!(record.summary, "Festival on Friday.");
        assert_eq!(record.events[0].time.as_deref(), Some("3 PM"));
        assert_eq!(record.action_items[0].due_date.as_deref(), Some("Oct 24"));
        assert_eq!(record.importance, Priority::High);
        assert_eq!(record.key_dates, vec!["Oct 31"]);
        assert!(record.error.is_none());
    }

    #[test]
    fn digest_defaults_and_flattening() {
        let digest = parse_digest_response(
            r#"{"event_calendar": null, "important_announcements": [{"announcement": "Library closed"}]}"#,
        );
        assert_eq!(digest.executive_summary, DEFAULT_EXECUTIVE_SUMMARY);
        assert!(digest.event_calendar.is_empty());
        assert!(digest.action_items.is_empty());
        assert_eq!(digest.important_announcements, vec!["Library closed"]);
    }

    #[test]
    fn malformed_digest_degrades() {
        let digest = parse_digest_response("```json\n{not json at all\n```");
        assert!(digest.executive_summary.starts_with("```json"));
        assert!(digest.event_calendar.is_empty());
    }
}
