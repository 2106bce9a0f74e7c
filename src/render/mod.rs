//! Digest output: a Markdown document on disk and a plain-text email body.

use std::fmt::Write as _;
use std::path::PathBuf;

use chrono::NaiveDate;
use tracing::info;

use crate::config::{OutputSettings, Profile};
use crate::error::RenderError;
use crate::pipeline::types::{ActionItem, CalendarEntry, DigestRecord, PerMessageExtraction};

/// Long-form date used in titles and subjects, e.g. "October 20, 2025".
pub const DISPLAY_DATE_FORMAT: &str = "%B %d, %Y";

/// Date substituted into output filenames.
pub const FILE_DATE_FORMAT: &str = "%Y-%m-%d";

const RULE_WIDTH: usize = 60;

/// Writes a digest somewhere and reports where.
pub trait DigestRenderer: Send + Sync {
    fn render(
        &self,
        digest: &DigestRecord,
        records: &[PerMessageExtraction],
        date: NaiveDate,
    ) -> Result<PathBuf, RenderError>;
}

// ── Markdown ────────────────────────────────────────────────────────

/// Renders the digest as a Markdown file under the output directory.
#[derive(Debug, Clone)]
pub struct MarkdownRenderer {
    title: String,
    directory: PathBuf,
    filename_pattern: String,
}

impl MarkdownRenderer {
    pub fn new(title: impl Into<String>, directory: impl Into<PathBuf>, filename_pattern: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            directory: directory.into(),
            filename_pattern: filename_pattern.into(),
        }
    }

    pub fn from_profile(profile: &Profile) -> Self {
        let OutputSettings {
            directory,
            filename_pattern,
        } = &profile.output;
        Self::new(profile.title(), directory.clone(), filename_pattern.clone())
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        let name = self
            .filename_pattern
            .replace("{date}", &date.format(FILE_DATE_FORMAT).to_string());
        self.directory.join(name)
    }

    /// The document text, without touching the filesystem.
    pub fn document(&self, digest: &DigestRecord, records: &[PerMessageExtraction], date: NaiveDate) -> String {
        let mut doc = String::new();
        let _ = writeln!(doc, "# {} - {}\n", self.title, date.format(DISPLAY_DATE_FORMAT));

        doc.push_str("## Executive Summary\n\n");
        let summary = if digest.executive_summary.trim().is_empty() {
            "No summary available"
        } else {
            digest.executive_summary.trim()
        };
        let _ = writeln!(doc, "{summary}\n");

        doc.push_str("## Upcoming Events\n\n");
        if digest.event_calendar.is_empty() {
            doc.push_str("No events found.\n\n");
        } else {
            events_table(&mut doc, &digest.event_calendar);
            event_details(&mut doc, &digest.event_calendar);
        }

        doc.push_str("## Action Items\n\n");
        if digest.action_items.is_empty() {
            doc.push_str("No action items found.\n\n");
        } else {
            for item in &digest.action_items {
                action_item(&mut doc, item);
            }
            doc.push('\n');
        }

        doc.push_str("## Important Announcements\n\n");
        if digest.important_announcements.is_empty() {
            doc.push_str("None.\n\n");
        } else {
            for ann in &digest.important_announcements {
                let _ = writeln!(doc, "- {ann}");
            }
            doc.push('\n');
        }

        doc.push_str("## Individual Email Summaries\n\n");
        if records.is_empty() {
            doc.push_str("No emails summarized.\n");
        }
        for record in records {
            let subject = non_blank(&record.subject, "No subject");
            let sender = non_blank(&record.sender, "Unknown sender");
            let date = non_blank(&record.date, "Unknown date");
            let _ = writeln!(doc, "### {subject}\n");
            let _ = writeln!(doc, "From: {sender} ({date})\n");
            let _ = writeln!(
                doc,
                "{}\n",
                non_blank(&record.summary, "No summary available for this email.")
            );
        }
        doc
    }
}

impl DigestRenderer for MarkdownRenderer {
    fn render(
        &self,
        digest: &DigestRecord,
        records: &[PerMessageExtraction],
        date: NaiveDate,
    ) -> Result<PathBuf, RenderError> {
        let path = self.path_for(date);
        let write_err = |source| RenderError::Write {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        std::fs::write(&path, self.document(digest, records, date)).map_err(write_err)?;

        info!(
            path = %path.display(),
            events = digest.event_calendar.len(),
            emails = records.len(),
            "Digest document saved"
        );
        Ok(path)
    }
}

fn events_table(doc: &mut String, events: &[CalendarEntry]) {
    doc.push_str("| Event | Date | Time | Location |\n");
    doc.push_str("|---|---|---|---|\n");
    for ev in events {
        let _ = writeln!(
            doc,
            "| {} | {} | {} | {} |",
            cell(non_blank(&ev.title, "Untitled")),
            cell(non_blank(&ev.date, "TBD")),
            cell(ev.time.as_deref().unwrap_or("")),
            cell(ev.location.as_deref().unwrap_or("")),
        );
    }
    doc.push('\n');
}

fn event_details(doc: &mut String, events: &[CalendarEntry]) {
    let with_details: Vec<_> = events
        .iter()
        .filter(|ev| !ev.details.trim().is_empty() || !ev.sources.is_empty())
        .collect();
    if with_details.is_empty() {
        return;
    }

    doc.push_str("### Event Details\n\n");
    for ev in with_details {
        let _ = writeln!(doc, "**{}:**", non_blank(&ev.title, "Untitled"));
        if !ev.details.trim().is_empty() {
            let _ = writeln!(doc, "{}", ev.details.trim());
        }
        if !ev.sources.is_empty() {
            let _ = writeln!(doc, "(Mentioned in: {})", ev.sources.join(", "));
        }
        doc.push('\n');
    }
}

fn action_item(doc: &mut String, item: &ActionItem) {
    let _ = write!(
        doc,
        "- [{}] {}",
        item.priority.as_str().to_uppercase(),
        non_blank(&item.action, "No action")
    );
    if let Some(due) = item.due_date.as_deref() {
        let _ = write!(doc, " (Due: {due})");
    }
    doc.push('\n');
    if let Some(details) = item.details.as_deref() {
        let _ = writeln!(doc, "  {details}");
    }
}

/// Table cells must not break the row.
fn cell(text: &str) -> String {
    text.replace('|', "\\|").replace(['\r', '\n'], " ")
}

fn non_blank<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() { fallback } else { value.trim() }
}

// ── Plain text ──────────────────────────────────────────────────────

/// Plain-text digest used as the body of the digest email.
pub fn text_digest(title: &str, digest: &DigestRecord, email_count: usize, date_label: &str) -> String {
    let rule = "=".repeat(RULE_WIDTH);
    let mut lines = vec![format!("{title} - {date_label}"), rule.clone(), String::new()];

    lines.push("EXECUTIVE SUMMARY:".into());
    lines.push(non_blank(&digest.executive_summary, "No summary available").to_string());
    lines.push(String::new());

    lines.push("UPCOMING EVENTS:".into());
    if digest.event_calendar.is_empty() {
        lines.push("  No events found.".into());
    }
    for ev in &digest.event_calendar {
        let mut line = format!(
            "  • {} - {}",
            non_blank(&ev.date, "N/A"),
            non_blank(&ev.title, "No title")
        );
        if let Some(time) = &ev.time {
            let _ = write!(line, " at {time}");
        }
        if let Some(location) = &ev.location {
            let _ = write!(line, " ({location})");
        }
        lines.push(line);
    }
    lines.push(String::new());

    lines.push("ACTION ITEMS:".into());
    if digest.action_items.is_empty() {
        lines.push("  No action items found.".into());
    }
    for item in &digest.action_items {
        let mut line = format!(
            "  [{}] {}",
            item.priority.as_str().to_uppercase(),
            non_blank(&item.action, "No action")
        );
        if let Some(due) = &item.due_date {
            let _ = write!(line, " (Due {due})");
        }
        lines.push(line);
    }
    lines.push(String::new());

    lines.push("IMPORTANT ANNOUNCEMENTS:".into());
    if digest.important_announcements.is_empty() {
        lines.push("  None.".into());
    }
    for ann in &digest.important_announcements {
        lines.push(format!("  • {ann}"));
    }
    lines.push(String::new());

    lines.push(rule);
    lines.push(format!("Total emails processed: {email_count}"));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::Priority;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 10, 20).unwrap()
    }

    fn digest() -> DigestRecord {
        DigestRecord {
            executive_summary: "Festival Friday, forms due.".into(),
            event_calendar: vec![
                CalendarEntry {
                    title: "Fall Festival".into(),
                    date: "Friday, October 31".into(),
                    time: Some("3 PM".into()),
                    location: Some("Field | East".into()),
                    details: "bring a jacket; cost $5".into(),
                    sources: vec!["PTA News".into(), "Tickets".into()],
                },
                CalendarEntry {
                    title: "Assembly".into(),
                    date: "Nov 3".into(),
                    ..Default::default()
                },
            ],
            action_items: vec![ActionItem {
                action: "Return permission slip".into(),
                due_date: Some("Oct 24".into()),
                priority: Priority::High,
                details: Some("Signed by a parent".into()),
            }],
            important_announcements: vec!["Library closed Monday".into()],
            error: None,
        }
    }

    fn records() -> Vec<PerMessageExtraction> {
        vec![
            PerMessageExtraction {
                subject: "PTA News".into(),
                sender: "pta@school.test".into(),
                date: "Mon, 20 Oct 2025".into(),
                summary: "Festival details.".into(),
                ..Default::default()
            },
            PerMessageExtraction {
                subject: "Blank".into(),
                ..Default::default()
            },
        ]
    }

    #[test]
    fn markdown_document_sections() {
        let renderer = MarkdownRenderer::new("School Digest", "out", "digest_{date}.md");
        let doc = renderer.document(&digest(), &records(), date());

        assert!(doc.starts_with("# School Digest - October 20, 2025\n"));
        assert!(doc.contains("## Executive Summary\n\nFestival Friday, forms due."));
        assert!(doc.contains("| Fall Festival | Friday, October 31 | 3 PM | Field \\| East |"));
        assert!(doc.contains("| Assembly | Nov 3 |  |  |"));
        assert!(doc.contains("(Mentioned in: PTA News, Tickets)"));
        assert!(doc.contains("- [HIGH] Return permission slip (Due: Oct 24)\n  Signed by a parent"));
        assert!(doc.contains("- Library closed Monday"));
        assert!(doc.contains("### PTA News\n\nFrom: pta@school.test (Mon, 20 Oct 2025)"));
        assert!(doc.contains("No summary available for this email."));
        assert!(doc.contains("From: Unknown sender (Unknown date)"));
    }

    #[test]
    fn empty_digest_has_placeholders() {
        let renderer = MarkdownRenderer::new("Digest", "out", "d.md");
        let doc = renderer.document(&DigestRecord::default(), &[], date());
        assert!(doc.contains("No summary available"));
        assert!(doc.contains("No events found."));
        assert!(doc.contains("No action items found."));
        assert!(doc.contains("None."));
        assert!(doc.contains("No emails summarized."));
    }

    #[test]
    fn render_writes_file_from_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("digests");
        let renderer = MarkdownRenderer::new("Digest", &out, "digest_{date}.md");
        let path = renderer.render(&digest(), &records(), date()).unwrap();

        assert_eq!(path, out.join("digest_2025-10-20.md"));
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("Fall Festival"));
    }

    #[test]
    fn render_reports_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let renderer = MarkdownRenderer::new("Digest", blocker.join("sub"), "d.md");
        let err = renderer.render(&digest(), &[], date()).unwrap_err();
        assert!(err.to_string().contains("Failed to write digest document"));
    }

    #[test]
    fn text_digest_layout() {
        let text = text_digest("School Digest", &digest(), 4, "October 20, 2025");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "School Digest - October 20, 2025");
        assert_eq!(lines[1], "=".repeat(60));
        assert!(text.contains("EXECUTIVE SUMMARY:\nFestival Friday, forms due."));
        assert!(text.contains("  • Friday, October 31 - Fall Festival at 3 PM (Field | East)"));
        assert!(text.contains("  • Nov 3 - Assembly\n"));
        assert!(text.contains("  [HIGH] Return permission slip (Due Oct 24)"));
        assert!(text.contains("  • Library closed Monday"));
        assert_eq!(lines[lines.len() - 1], "Total emails processed: 4");
    }

    #[test]
    fn text_digest_empty_sections() {
        let text = text_digest("Digest", &DigestRecord::default(), 0, "today");
        assert!(text.contains("  No events found."));
        assert!(text.contains("  No action items found."));
        assert!(text.contains("IMPORTANT ANNOUNCEMENTS:\n  None."));
    }
}
