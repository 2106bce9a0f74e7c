//! Model request construction.
//!
//! Templates come from the profile's `prompts` section. Any template the
//! profile leaves out falls back to the built-in default below.

use base64::Engine as _;
use base64::engine::general_purpose;
use tracing::{debug, info, warn};

use crate::config::{AiSettings, ProcessingSettings, PromptSettings};
use crate::extract::{ExtractedContent, looks_like_html, strip_html};
use crate::llm::{ChatMessage, CompletionRequest, ContentBlock};
use crate::pipeline::types::PerMessageExtraction;

// ── Built-in templates ──────────────────────────────────────────────

pub const DEFAULT_EMAIL_USER_TEMPLATE: &str = r#"Analyze the following email and extract everything the reader needs to know.

From: {sender}
Subject: {subject}
Date: {date}

Email content:
{body}

Any images or PDF attachments that follow belong to this email. Read flyers, calendars and schedules in them carefully; they often hold dates that the text does not mention.

Return ONLY a JSON object of this shape:
{{
  "summary": "2-3 sentence summary of the email",
  "events": [
    {{
      "title": "Specific event name",
      "date": "Full date with day of week",
      "time": "Exact time or range, if known",
      "location": "Location, if known",
      "description": "Everything relevant: what to bring, costs, permissions, dress code",
      "priority": "high/medium/low",
      "scope": "Who the event applies to"
    }}
  ],
  "action_items": [
    {{
      "action": "Specific action the reader must take",
      "due_date": "Deadline, if any",
      "priority": "high/medium/low",
      "details": "Additional context"
    }}
  ],
  "importance": "high/medium/low",
  "key_dates": ["Every date mentioned, with what happens on it"]
}}"#;

pub const DEFAULT_IMAGE_INSTRUCTION: &str = "Image {index}: {filename}";

pub const DEFAULT_PDF_INSTRUCTION: &str = "PDF Attachment: {filename}";

pub const DEFAULT_DIGEST_TEMPLATE: &str = r#"You are creating a consolidated digest of recent emails.

Date Range: {date_range}
Number of Emails: {email_count}

Per-email extractions (JSON):
{summaries_json}

Create a digest with three sections.

1. UPCOMING EVENTS, in chronological order. Combine every mention of the SAME event into ONE entry and keep DIFFERENT events as separate entries. For each event give the full name, the full date with day of week, the time, the location, ALL details from every email that mentions it, and the subjects of those emails.
2. ACTION ITEMS: sign-ups, forms due, things to bring or buy, volunteer requests, meetings to schedule.
3. IMPORTANT ANNOUNCEMENTS: key information that is neither an event nor an action.

CRITICAL RULES:
1. DEDUPLICATE EVENTS: an event mentioned in three emails is one entry with combined details.
2. NEVER DROP A DAY: if the input has events on Monday, Tuesday and Friday, the calendar has entries for all of those days.
3. Two events with different dates or different names are distinct entries, even if they look similar.
4. Use exact event names, dates and times from the emails. No vague descriptions.
5. important_announcements is an array of plain STRINGS, never objects.

Return ONLY a JSON object of this shape:
{{
  "executive_summary": "2-3 sentence overview of the most important items",
  "event_calendar": [
    {{
      "title": "Specific event name",
      "date": "Full date with day",
      "time": "Exact time or range",
      "location": "Specific location",
      "details": "Combined details from every email mentioning this event",
      "sources": ["Subjects of the emails that mentioned this event"]
    }}
  ],
  "action_items": [
    {{
      "action": "Specific action",
      "due_date": "Exact deadline",
      "priority": "high/medium/low",
      "details": "Additional context"
    }}
  ],
  "important_announcements": ["Announcement text"]
}}"#;

// ── Templates ───────────────────────────────────────────────────────

/// The four prompt templates of a profile, with defaults filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplates {
    pub email_user: String,
    pub image_instruction: String,
    pub pdf_instruction: String,
    pub digest: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            email_user: DEFAULT_EMAIL_USER_TEMPLATE.to_string(),
            image_instruction: DEFAULT_IMAGE_INSTRUCTION.to_string(),
            pdf_instruction: DEFAULT_PDF_INSTRUCTION.to_string(),
            digest: DEFAULT_DIGEST_TEMPLATE.to_string(),
        }
    }
}

impl PromptTemplates {
    pub fn from_settings(settings: &PromptSettings) -> Self {
        fn pick(configured: &Option<String>, name: &str, fallback: &str) -> String {
            match configured.as_deref().map(str::trim) {
                Some(t) if !t.is_empty() => t.to_string(),
                _ => {
                    debug!(template = name, "Using built-in prompt template");
                    fallback.to_string()
                }
            }
        }

        Self {
            email_user: pick(&settings.email_user_template, "email_user_template", DEFAULT_EMAIL_USER_TEMPLATE),
            image_instruction: pick(&settings.image_instruction, "image_instruction", DEFAULT_IMAGE_INSTRUCTION),
            pdf_instruction: pick(&settings.pdf_instruction, "pdf_instruction", DEFAULT_PDF_INSTRUCTION),
            digest: pick(&settings.digest_prompt_template, "digest_prompt_template", DEFAULT_DIGEST_TEMPLATE),
        }
    }
}

/// Substitute `{name}` placeholders in one pass.
///
/// `{{` and `}}` produce literal braces. Placeholders with no matching
/// variable are copied through unchanged, as are substituted values.
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if tail.starts_with("{{") {
            out.push('{');
            rest = &tail[2..];
        } else if tail.starts_with("}}") {
            out.push('}');
            rest = &tail[2..];
        } else if tail.starts_with('{') {
            let name_end = tail[1..].find(['{', '}']).map(|i| i + 1);
            match name_end {
                Some(end) if tail.as_bytes()[end] == b'}' => {
                    let name = &tail[1..end];
                    match vars.iter().find(|(k, _)| *k == name) {
                        Some((_, value)) => out.push_str(value),
                        None => out.push_str(&tail[..=end]),
                    }
                    rest = &tail[end + 1..];
                }
                _ => {
                    out.push('{');
                    rest = &tail[1..];
                }
            }
        } else {
            out.push('}');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}

/// Longest prefix of `s` holding at most `max_chars` characters.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ── Builder ─────────────────────────────────────────────────────────

/// Builds per-message and consolidation requests.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    templates: PromptTemplates,
    max_tokens: u32,
    digest_max_tokens: u32,
    temperature: f32,
    digest_budget_chars: usize,
}

impl PromptBuilder {
    pub fn new(templates: PromptTemplates) -> Self {
        Self {
            templates,
            max_tokens: 3000,
            digest_max_tokens: 4000,
            temperature: 0.0,
            digest_budget_chars: 15_000,
        }
    }

    pub fn from_settings(
        prompts: &PromptSettings,
        ai: &AiSettings,
        processing: &ProcessingSettings,
    ) -> Self {
        Self {
            templates: PromptTemplates::from_settings(prompts),
            max_tokens: ai.max_tokens,
            digest_max_tokens: ai.digest_max_tokens,
            temperature: ai.temperature,
            digest_budget_chars: processing.digest_input_budget_chars,
        }
    }

    pub fn with_digest_budget(mut self, chars: usize) -> Self {
        self.digest_budget_chars = chars;
        self
    }

    /// One user turn: the rendered text template, then an image block and a
    /// caption per accepted image, then one block per attachment with text.
    pub fn build_message_request(&self, content: &ExtractedContent) -> CompletionRequest {
        let raw_body = content.body();
        let body = if looks_like_html(raw_body) {
            strip_html(raw_body)
        } else {
            raw_body.to_string()
        };

        let mut blocks = vec![ContentBlock::text(render_template(
            &self.templates.email_user,
            &[
                ("sender", &content.sender),
                ("subject", &content.subject),
                ("date", &content.date),
                ("body", &body),
            ],
        ))];

        if content.has_images() {
            info!(id = %content.id, images = content.images.len(), "Adding images to analysis");
        }
        for (idx, image) in content.images.iter().enumerate() {
            let index = (idx + 1).to_string();
            let filename = if image.filename.trim().is_empty() {
                "inline image"
            } else {
                image.filename.as_str()
            };
            blocks.push(ContentBlock::image(
                image.mime_type.clone(),
                general_purpose::STANDARD.encode(&image.bytes),
            ));
            blocks.push(ContentBlock::text(render_template(
                &self.templates.image_instruction,
                &[("index", &index), ("filename", filename)],
            )));
        }

        for attachment in &content.attachments {
            let Some(text) = attachment.extracted_text.as_deref() else {
                continue;
            };
            debug!(
                id = %content.id,
                filename = %attachment.filename,
                chars = text.chars().count(),
                "Adding attachment text"
            );
            let instruction = render_template(
                &self.templates.pdf_instruction,
                &[("filename", &attachment.filename)],
            );
            blocks.push(ContentBlock::text(format!("{instruction}\n\n{text}")));
        }

        CompletionRequest::new(vec![ChatMessage::user_blocks(blocks)])
            .with_max_tokens(self.max_tokens)
            .with_temperature(self.temperature)
    }

    /// Single-turn consolidation request. The serialized records are cut to
    /// the character budget before they are inserted into the template.
    pub fn build_digest_request(
        &self,
        records: &[PerMessageExtraction],
        date_range: &str,
    ) -> CompletionRequest {
        let serialized = serde_json::to_string_pretty(records).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to serialize extractions for digest");
            "[]".to_string()
        });
        let summaries_json = truncate_chars(&serialized, self.digest_budget_chars);
        if summaries_json.len() < serialized.len() {
            warn!(
                total_chars = serialized.chars().count(),
                budget = self.digest_budget_chars,
                "Digest input truncated to budget"
            );
        }

        let count = records.len().to_string();
        let prompt = render_template(
            &self.templates.digest,
            &[
                ("date_range", date_range),
                ("email_count", &count),
                ("summaries_json", summaries_json),
            ],
        );

        CompletionRequest::new(vec![ChatMessage::user(prompt)])
            .with_max_tokens(self.digest_max_tokens)
            .with_temperature(self.temperature)
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(PromptTemplates::default())
    }
}
