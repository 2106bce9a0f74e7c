//! Digest consolidation.
//!
//! One model call turns the run's per-message records into a digest. The
//! model's calendar is then reconciled against a calendar built locally from
//! the same records, so an event the model dropped or split still appears
//! exactly once.
//!
//! Two calendar entries are the same event when their normalized titles and
//! normalized dates are equal. Nothing fuzzier is merged: near-identical
//! titles on the same day stay separate entries.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use chrono::Month;
use regex::Regex;
use tracing::{debug, error, info};

use crate::llm::LlmProvider;
use crate::pipeline::prompt::PromptBuilder;
use crate::pipeline::response::parse_digest_response;
use crate::pipeline::types::{CalendarEntry, DigestRecord, Event, PerMessageExtraction};

pub const NO_EMAILS_SUMMARY: &str = "No new emails in this period.";

const DETAIL_SEPARATOR: &str = "; ";

static MONTH_DAY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b([a-z]{3,9})\.?\s+(\d{1,2})(?:st|nd|rd|th)?\b").expect("month-day pattern compiles")
});
static DAY_MONTH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{1,2})(?:st|nd|rd|th)?\s+(?:of\s+)?([a-z]{3,9})\b").expect("day-month pattern compiles")
});
static ISO_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{4}-(\d{1,2})-(\d{1,2})\b").expect("iso date pattern compiles"));
static SLASH_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{1,2})/(\d{1,2})(?:/\d{2,4})?\b").expect("slash date pattern compiles")
});

// ── Event identity ──────────────────────────────────────────────────

/// Identity of a real-world event: normalized title plus normalized date.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    title: String,
    date: String,
}

impl EventKey {
    /// `None` when the title or date normalizes to nothing. Such an entry
    /// has no identity to match on and is never merged.
    pub fn new(title: &str, date: &str) -> Option<Self> {
        let title = normalize_title(title);
        let date = normalize_date(date);
        (!title.is_empty() && !date.is_empty()).then_some(Self { title, date })
    }

    fn of(entry: &CalendarEntry) -> Option<Self> {
        Self::new(&entry.title, &entry.date)
    }
}

/// Lowercase, punctuation to spaces, whitespace collapsed.
pub fn normalize_title(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// `MM-DD` when a calendar date can be read out of the text, otherwise the
/// text normalized like a title. Years are ignored: most mentions omit them.
pub fn normalize_date(date: &str) -> String {
    calendar_day(date)
        .map(|(month, day)| format!("{month:02}-{day:02}"))
        .unwrap_or_else(|| normalize_title(date))
}

fn calendar_day(text: &str) -> Option<(u32, u32)> {
    let valid = |month: u32, day: u32| (1..=12).contains(&month) && (1..=31).contains(&day);

    let named = MONTH_DAY
        .captures_iter(text)
        .find_map(|c| Some((month_number(&c[1])?, c[2].parse::<u32>().ok()?)))
        .or_else(|| {
            DAY_MONTH
                .captures_iter(text)
                .find_map(|c| Some((month_number(&c[2])?, c[1].parse::<u32>().ok()?)))
        });
    if let Some((m, d)) = named.filter(|&(m, d)| valid(m, d)) {
        return Some((m, d));
    }

    [&*ISO_DATE, &*SLASH_DATE].into_iter().find_map(|re| {
        let c = re.captures(text)?;
        let (m, d) = (c[1].parse::<u32>().ok()?, c[2].parse::<u32>().ok()?);
        valid(m, d).then_some((m, d))
    })
}

fn month_number(word: &str) -> Option<u32> {
    Month::from_str(word)
        .or_else(|_| Month::from_str(word.get(..3).unwrap_or(word)))
        .ok()
        .map(|m| m.number_from_month())
}

// ── Merging ─────────────────────────────────────────────────────────

fn candidate(event: &Event, subject: &str) -> CalendarEntry {
    CalendarEntry {
        title: event.title.clone(),
        date: event.date.clone(),
        time: event.time.clone(),
        location: event.location.clone(),
        details: event.description.clone().unwrap_or_default(),
        sources: if subject.is_empty() {
            Vec::new()
        } else {
            vec![subject.to_string()]
        },
    }
}

/// Fold `other` into `target`: details and sources are unioned, missing
/// time and location are filled in. Detail segments compare whole and
/// case-insensitively.
fn absorb(target: &mut CalendarEntry, other: CalendarEntry) {
    let mut seen: Vec<String> = target
        .details
        .split(DETAIL_SEPARATOR)
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect();
    for segment in other.details.split(DETAIL_SEPARATOR).map(str::trim) {
        let folded = segment.to_lowercase();
        if segment.is_empty() || seen.contains(&folded) {
            continue;
        }
        if !target.details.is_empty() {
            target.details.push_str(DETAIL_SEPARATOR);
        }
        target.details.push_str(segment);
        seen.push(folded);
    }
    for source in other.sources {
        if !target.sources.contains(&source) {
            target.sources.push(source);
        }
    }
    if target.time.is_none() {
        target.time = other.time;
    }
    if target.location.is_none() {
        target.location = other.location;
    }
}

/// Collapse entries sharing an [`EventKey`], keeping first-seen order.
/// Entries without a key are kept as they are.
pub fn merge_entries(entries: impl IntoIterator<Item = CalendarEntry>) -> Vec<CalendarEntry> {
    let mut merged: Vec<CalendarEntry> = Vec::new();
    let mut index: HashMap<EventKey, usize> = HashMap::new();

    for entry in entries {
        let Some(key) = EventKey::of(&entry) else {
            merged.push(entry);
            continue;
        };
        match index.get(&key) {
            Some(&i) => absorb(&mut merged[i], entry),
            None => {
                index.insert(key, merged.len());
                merged.push(entry);
            }
        }
    }
    merged
}

/// Calendar built from the records alone, without the model.
pub fn local_calendar(records: &[PerMessageExtraction]) -> Vec<CalendarEntry> {
    merge_entries(
        records
            .iter()
            .flat_map(|r| r.events.iter().map(move |e| candidate(e, &r.subject))),
    )
}

/// Merge the model's calendar with the local one. The model's entries come
/// first and keep its ordering; local events it missed are appended.
pub fn reconcile(mut digest: DigestRecord, local: Vec<CalendarEntry>) -> DigestRecord {
    let mut calendar = merge_entries(std::mem::take(&mut digest.event_calendar));
    let from_model = calendar.len();

    for entry in local {
        match model_match(&calendar[..from_model], &entry) {
            Some(i) => absorb(&mut calendar[i], entry),
            None => calendar.push(entry),
        }
    }

    debug!(from_model, total = calendar.len(), "Reconciled event calendar");
    digest.event_calendar = calendar;
    digest
}

/// The model entry a local entry belongs to: the one with the same key,
/// else the single entry with the same title and a compatible date.
/// Several candidates count as no match.
fn model_match(model: &[CalendarEntry], entry: &CalendarEntry) -> Option<usize> {
    let key = EventKey::of(entry)?;
    if let Some(i) = model.iter().position(|m| EventKey::of(m).as_ref() == Some(&key)) {
        return Some(i);
    }

    let mut candidates = model
        .iter()
        .enumerate()
        .filter(|(_, m)| normalize_title(&m.title) == key.title && dates_compatible(m, entry))
        .map(|(i, _)| i);
    match (candidates.next(), candidates.next()) {
        (Some(i), None) => Some(i),
        _ => None,
    }
}

/// Whether two dates can name the same day. Two calendar days must be
/// equal; a loose date ("Friday") matches when its words appear in the
/// other date.
fn dates_compatible(model: &CalendarEntry, local: &CalendarEntry) -> bool {
    if let (Some(a), Some(b)) = (calendar_day(&model.date), calendar_day(&local.date)) {
        return a == b;
    }
    let (m, l) = (normalize_title(&model.date), normalize_title(&local.date));
    if m.is_empty() || l.is_empty() {
        return false;
    }
    contains_words(&m, &l) || contains_words(&l, &m)
}

fn contains_words(haystack: &str, needle: &str) -> bool {
    format!(" {haystack} ").contains(&format!(" {needle} "))
}

// ── Consolidator ────────────────────────────────────────────────────

/// Produces one [`DigestRecord`] per run.
pub struct DigestConsolidator {
    llm: Arc<dyn LlmProvider>,
    prompts: PromptBuilder,
}

impl DigestConsolidator {
    pub fn new(llm: Arc<dyn LlmProvider>, prompts: PromptBuilder) -> Self {
        Self { llm, prompts }
    }

    /// Consolidate a run's records. Never fails; a failed model call yields
    /// a degraded record with the error as its narrative.
    pub async fn consolidate(&self, records: &[PerMessageExtraction], date_range: &str) -> DigestRecord {
        info!(count = records.len(), "Creating digest");

        if records.is_empty() {
            return DigestRecord {
                executive_summary: NO_EMAILS_SUMMARY.to_string(),
                ..Default::default()
            };
        }

        let request = self.prompts.build_digest_request(records, date_range);
        match self.llm.complete(request).await {
            Ok(response) => {
                let digest = reconcile(parse_digest_response(&response.content), local_calendar(records));
                info!(
                    events = digest.event_calendar.len(),
                    action_items = digest.action_items.len(),
                    announcements = digest.important_announcements.len(),
                    "Created consolidated digest"
                );
                digest
            }
            Err(e) => {
                error!(error = %e, "Error creating digest");
                DigestRecord {
                    executive_summary: format!("Error creating digest: {e}"),
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::summarizer::tests::ScriptedLlm;

    fn event(title: &str, date: &str, details: &str) -> Event {
        Event {
            title: title.into(),
            date: date.into(),
            description: (!details.is_empty()).then(|| details.to_string()),
            ..Default::default()
        }
    }

    fn record(subject: &str, events: Vec<Event>) -> PerMessageExtraction {
        PerMessageExtraction {
            message_id: subject.to_lowercase(),
            subject: subject.into(),
            summary: format!("About {subject}"),
            events,
            ..Default::default()
        }
    }

    fn festival_records() -> Vec<PerMessageExtraction> {
        vec![
            record("PTA News", vec![event("Fall Festival", "Friday, October 31", "bring a jacket")]),
            record("Festival Tickets", vec![event("Fall Festival", "Oct 31st", "cost $5")]),
            record("Reminder: Friday", vec![event("fall festival!", "10/31", "starts at 3pm")]),
        ]
    }

    #[test]
    fn titles_normalize() {
        assert_eq!(normalize_title("  Fall   Festival! "), "fall festival");
        assert_eq!(normalize_title("K-1 Assembly"), "k 1 assembly");
    }

    #[test]
    fn dates_normalize_across_phrasings() {
        for s in ["Friday, October 31st", "Oct 31", "31 October 2025", "10/31", "2025-10-31", "Sept. 3"] {
            let expected = if s.starts_with("Sept") { "09-03" } else { "10-31" };
            assert_eq!(normalize_date(s), expected, "{s}");
        }
        assert_eq!(normalize_date("Monday"), "monday");
        assert_eq!(normalize_date("at 3 PM"), "at 3 pm");
        assert_eq!(normalize_date(""), "");
    }

    #[test]
    fn same_event_collapses_with_union_of_details() {
        let calendar = local_calendar(&festival_records());
        assert_eq!(calendar.len(), 1);
        let entry = &calendar[0];
        assert!(entry.details.contains("jacket"));
        assert!(entry.details.contains("cost $5"));
        assert!(entry.details.contains("3pm"));
        assert_eq!(entry.sources, vec!["PTA News", "Festival Tickets", "Reminder: Friday"]);
    }

    #[test]
    fn same_title_on_different_dates_stays_separate() {
        let calendar = local_calendar(&[
            record("A", vec![event("Assembly", "Nov 3", "")]),
            record("B", vec![event("Assembly", "Nov 10", "")]),
        ]);
        assert_eq!(calendar.len(), 2);
    }

    #[test]
    fn similar_titles_on_same_day_stay_separate() {
        let calendar = local_calendar(&[record(
            "A",
            vec![event("Raven Run", "Monday", ""), event("Raven Run Practice", "Monday", "")],
        )]);
        assert_eq!(calendar.len(), 2);
    }

    #[test]
    fn absorb_fills_missing_time_and_location() {
        let mut target = CalendarEntry {
            title: "Raven Run".into(),
            date: "Monday".into(),
            ..Default::default()
        };
        absorb(
            &mut target,
            CalendarEntry {
                title: "Raven Run".into(),
                date: "Monday".into(),
                time: Some("1:45 PM".into()),
                location: Some("School field".into()),
                details: "Families welcome".into(),
                sources: vec!["K News".into()],
            },
        );
        assert_eq!(target.time.as_deref(), Some("1:45 PM"));
        assert_eq!(target.location.as_deref(), Some("School field"));
        assert_eq!(target.details, "Families welcome");
    }

    #[test]
    fn untitled_or_undated_events_never_merge() {
        let calendar = local_calendar(&[record(
            "Halloween",
            vec![
                event("", "Oct 31", "Pajama day"),
                event("", "Oct 31", "Bake sale in the gym"),
                event("Assembly", "", "Gym"),
                event("Assembly", "", "Cafeteria"),
            ],
        )]);
        assert_eq!(calendar.len(), 4);
        assert_eq!(calendar[0].title, "");
        assert_eq!(calendar[0].details, "Pajama day");
        assert_eq!(calendar[1].details, "Bake sale in the gym");
    }

    #[test]
    fn details_compare_as_whole_segments() {
        let mut target = CalendarEntry {
            title: "Open House".into(),
            date: "Nov 6".into(),
            details: "doors open at 3:30".into(),
            ..Default::default()
        };
        let other = CalendarEntry {
            details: "Doors open at 3:30; doors open at 3".into(),
            ..target.clone()
        };
        absorb(&mut target, other);
        assert_eq!(target.details, "doors open at 3:30; doors open at 3");
    }

    #[test]
    fn loose_weekday_joins_the_model_entry_it_names() {
        let model = DigestRecord {
            event_calendar: vec![CalendarEntry {
                title: "Fall Festival".into(),
                date: "Friday, October 31".into(),
                details: "bring a jacket; cost $5".into(),
                sources: vec!["PTA News".into(), "Reminder".into()],
                ..Default::default()
            }],
            ..Default::default()
        };
        let records = [
            record("PTA News", vec![event("Fall Festival", "Friday, October 31", "bring a jacket")]),
            record("Reminder", vec![event("Fall Festival", "Friday", "cost $5")]),
            record("Weekend", vec![event("Fall Festival", "Saturday", "cleanup crew")]),
        ];

        let digest = reconcile(model, local_calendar(&records));

        let dates: Vec<&str> = digest.event_calendar.iter().map(|e| e.date.as_str()).collect();
        assert_eq!(dates, ["Friday, October 31", "Saturday"]);
        assert_eq!(digest.event_calendar[0].details, "bring a jacket; cost $5");
    }

    #[test]
    fn ambiguous_loose_date_is_appended() {
        let entry = |date: &str| CalendarEntry {
            title: "Assembly".into(),
            date: date.into(),
            ..Default::default()
        };
        let model = DigestRecord {
            event_calendar: vec![entry("Monday, November 3"), entry("Monday, November 10")],
            ..Default::default()
        };
        let digest = reconcile(model, vec![entry("Monday")]);
        assert_eq!(digest.event_calendar.len(), 3);
    }

    #[tokio::test]
    async fn empty_batch_skips_the_model() {
        let llm = Arc::new(ScriptedLlm::new(vec![]));
        let consolidator = DigestConsolidator::new(llm.clone(), PromptBuilder::default());
        let digest = consolidator.consolidate(&[], "n/a").await;
        assert_eq!(digest.executive_summary, NO_EMAILS_SUMMARY);
        assert!(digest.event_calendar.is_empty());
        assert_eq!(llm.request_count(), 0);
    }

    #[tokio::test]
    async fn model_duplicates_and_omissions_are_repaired() {
        // The model lists the festival twice and drops Tuesday entirely.
        let llm = Arc::new(ScriptedLlm::new(vec![Ok(r#"{
            "executive_summary": "A busy week.",
            "event_calendar": [
                {"title": "Fall Festival", "date": "Friday, October 31st", "time": "3 PM", "details": "Bring a jacket", "sources": ["PTA News"]},
                {"title": "Fall Festival", "date": "Oct 31", "details": "Tickets cost $5", "sources": ["Festival Tickets"]}
            ],
            "important_announcements": [{"announcement": "Library closed Monday"}]
        }"#)]));
        let mut records = festival_records();
        records.push(record("Tuesday", vec![event("Book Fair", "Tuesday, Oct 28", "")]));

        let consolidator = DigestConsolidator::new(llm, PromptBuilder::default());
        let digest = consolidator.consolidate(&records, "Oct 20 - Oct 27").await;

        assert_eq!(digest.executive_summary, "A busy week.");
        assert_eq!(digest.event_calendar.len(), 2);
        let festival = &digest.event_calendar[0];
        assert_eq!(festival.time.as_deref(), Some("3 PM"));
        assert!(festival.details.contains("Bring a jacket"));
        assert!(festival.details.contains("$5"));
        assert!(festival.details.contains("3pm"));
        assert_eq!(festival.sources.len(), 3);
        assert_eq!(digest.event_calendar[1].title, "Book Fair");
        assert_eq!(digest.important_announcements, vec!["Library closed Monday"]);
    }

    #[tokio::test]
    async fn unparseable_model_output_still_keeps_events() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok("I am unable to help with that.")]));
        let consolidator = DigestConsolidator::new(llm, PromptBuilder::default());
        let digest = consolidator.consolidate(&festival_records(), "range").await;
        assert_eq!(digest.executive_summary, "I am unable to help with that.");
        assert_eq!(digest.event_calendar.len(), 1);
        assert!(digest.action_items.is_empty());
    }

    #[tokio::test]
    async fn request_failure_degrades() {
        let llm = Arc::new(ScriptedLlm::new(vec![Err("overloaded")]));
        let consolidator = DigestConsolidator::new(llm, PromptBuilder::default());
        let digest = consolidator.consolidate(&festival_records(), "range").await;
        assert!(digest.executive_summary.starts_with("Error creating digest:"));
        assert!(digest.executive_summary.contains("overloaded"));
        assert!(digest.event_calendar.is_empty());
        assert!(digest.error.is_some());
    }

    #[tokio::test]
    async fn oversized_batch_is_truncated_and_completes() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok(r#"{"executive_summary": "ok"}"#)]));
        let records: Vec<_> = (0..200)
            .map(|i| record(&format!("Newsletter {i}"), vec![event(&format!("Event {i}"), "Nov 3", &"x".repeat(100))]))
            .collect();
        let prompts = PromptBuilder::default().with_digest_budget(2_000);
        let consolidator = DigestConsolidator::new(llm.clone(), prompts);
        let digest = consolidator.consolidate(&records, "range").await;

        assert_eq!(digest.executive_summary, "ok");
        assert_eq!(digest.event_calendar.len(), 200);
        let template_chars = crate::pipeline::prompt::DEFAULT_DIGEST_TEMPLATE.len();
        assert!(llm.request_text(0).chars().count() < template_chars + 2_100);
    }
}
