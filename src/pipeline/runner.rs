//! One end-to-end digest run.
//!
//! Flow:
//! 1. List candidate messages, minus those already processed
//! 2. Per message: fetch, extract, attachment text, summarize, mark processed
//! 3. Consolidate, render, save the digest
//! 4. Optionally email the plain-text digest
//! 5. Prune old tracking rows, whatever happened before
//!
//! Per-message failures are recorded in the [`RunReport`] and the batch
//! continues. A failure outside the per-message loop ends the run early and
//! is reported as critical.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Local};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Profile;
use crate::error::PipelineError;
use crate::extract::{AttachmentTextExtractor, ExtractedContent, ImageFilter, MimeExtractor};
use crate::llm::LlmProvider;
use crate::mail::{MailSource, MessageRef};
use crate::pipeline::consolidate::DigestConsolidator;
use crate::pipeline::prompt::{PromptBuilder, render_template};
use crate::pipeline::summarizer::MessageSummarizer;
use crate::pipeline::types::PerMessageExtraction;
use crate::render::{DISPLAY_DATE_FORMAT, DigestRenderer, text_digest};
use crate::store::TrackingStore;

/// Short date used inside a date range, e.g. "Oct 20, 2025".
const RANGE_DATE_FORMAT: &str = "%b %d, %Y";

// ── Report ──────────────────────────────────────────────────────────

/// One recorded failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub error: String,
    pub critical: bool,
}

/// Outcome of a run, printed as JSON by the binary.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub start_time: DateTime<Local>,
    pub end_time: Option<DateTime<Local>>,
    pub duration_seconds: f64,
    pub emails_found: usize,
    pub emails_processed: usize,
    pub emails_skipped: usize,
    pub digest_created: bool,
    pub digest_sent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest_file: Option<PathBuf>,
    pub errors: Vec<RunError>,
}

impl RunReport {
    fn start() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            start_time: Local::now(),
            end_time: None,
            duration_seconds: 0.0,
            emails_found: 0,
            emails_processed: 0,
            emails_skipped: 0,
            digest_created: false,
            digest_sent: false,
            digest_file: None,
            errors: Vec::new(),
        }
    }

    fn item_error(&mut self, message_id: &str, error: impl ToString) {
        self.errors.push(RunError {
            message_id: Some(message_id.to_string()),
            error: error.to_string(),
            critical: false,
        });
    }

    fn run_error(&mut self, error: impl ToString, critical: bool) {
        self.errors.push(RunError {
            message_id: None,
            error: error.to_string(),
            critical,
        });
    }

    fn finish(&mut self) {
        let end = Local::now();
        self.duration_seconds = (end - self.start_time).num_milliseconds() as f64 / 1000.0;
        self.end_time = Some(end);
    }

    pub fn has_critical_error(&self) -> bool {
        self.errors.iter().any(|e| e.critical)
    }
}

// ── Settings ────────────────────────────────────────────────────────

/// Where and how to email the digest.
#[derive(Debug, Clone)]
pub struct DigestEmail {
    pub recipient: String,
    pub subject_pattern: String,
}

/// Per-run knobs taken from the profile.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub title: String,
    pub label: String,
    pub lookback_hours: u32,
    pub retention_days: u32,
    pub email: Option<DigestEmail>,
}

impl RunSettings {
    pub fn from_profile(profile: &Profile) -> Self {
        let email = match (profile.email.send_digest, &profile.email.recipient) {
            (true, Some(recipient)) => Some(DigestEmail {
                recipient: recipient.clone(),
                subject_pattern: profile.email.subject_pattern.clone(),
            }),
            _ => None,
        };
        Self {
            title: profile.title().to_string(),
            label: profile.mail.label.clone(),
            lookback_hours: profile.mail.lookback_hours,
            retention_days: profile.tracking.retention_days,
            email,
        }
    }
}

// ── Runner ──────────────────────────────────────────────────────────

/// Drives a run over injected collaborators.
pub struct DigestRunner {
    mail: Arc<dyn MailSource>,
    store: Arc<dyn TrackingStore>,
    renderer: Arc<dyn DigestRenderer>,
    extractor: MimeExtractor,
    attachments: AttachmentTextExtractor,
    summarizer: MessageSummarizer,
    consolidator: DigestConsolidator,
    settings: RunSettings,
}

impl DigestRunner {
    /// Wire every component from one profile.
    pub fn new(
        profile: &Profile,
        mail: Arc<dyn MailSource>,
        llm: Arc<dyn LlmProvider>,
        store: Arc<dyn TrackingStore>,
        renderer: Arc<dyn DigestRenderer>,
    ) -> Self {
        let processing = &profile.processing;
        let prompts = PromptBuilder::from_settings(&profile.prompts, &profile.ai, processing);
        Self {
            extractor: MimeExtractor::new(ImageFilter::from_settings(processing)),
            attachments: AttachmentTextExtractor::new(
                mail.clone(),
                processing.process_pdfs,
                processing.max_pdf_chars,
            ),
            summarizer: MessageSummarizer::new(llm.clone(), prompts.clone()),
            consolidator: DigestConsolidator::new(llm, prompts),
            settings: RunSettings::from_profile(profile),
            mail,
            store,
            renderer,
        }
    }

    /// Run once. Never returns an error: failures land in the report.
    pub async fn run(&self, force: bool) -> RunReport {
        let mut report = RunReport::start();
        info!(run_id = %report.run_id, force, label = %self.settings.label, "Starting digest run");

        if let Err(e) = self.run_steps(force, &mut report).await {
            error!(error = %e, "Critical error in run");
            report.run_error(e, true);
        }

        match self.store.cleanup_older_than(self.settings.retention_days).await {
            Ok(deleted) => info!(deleted, "Cleaned up old tracking records"),
            Err(e) => {
                warn!(error = %e, "Tracking cleanup failed");
                report.run_error(format!("cleanup failed: {e}"), false);
            }
        }

        report.finish();
        info!(
            run_id = %report.run_id,
            duration_seconds = report.duration_seconds,
            found = report.emails_found,
            processed = report.emails_processed,
            skipped = report.emails_skipped,
            digest_created = report.digest_created,
            digest_sent = report.digest_sent,
            errors = report.errors.len(),
            "Run completed"
        );
        report
    }

    async fn run_steps(&self, force: bool, report: &mut RunReport) -> Result<(), PipelineError> {
        let exclude = if force {
            Default::default()
        } else {
            self.store.all_processed_ids().await?
        };

        let refs = self
            .mail
            .list_messages(&self.settings.label, self.settings.lookback_hours, &exclude)
            .await?;
        report.emails_found = refs.len();
        if refs.is_empty() {
            info!("No new emails to process");
            return Ok(());
        }

        info!(count = refs.len(), "Processing emails");
        let mut contents = Vec::with_capacity(refs.len());
        for message_ref in &refs {
            match self.extract(message_ref).await {
                Ok(Some(content)) => contents.push(content),
                Ok(None) => {
                    warn!(id = %message_ref.id, "Could not retrieve message");
                    report.emails_skipped += 1;
                }
                Err(e) => {
                    error!(id = %message_ref.id, error = %e, "Error processing message");
                    report.item_error(&message_ref.id, e);
                    report.emails_skipped += 1;
                }
            }
        }
        if contents.is_empty() {
            warn!("No emails successfully processed");
            return Ok(());
        }

        let mut records = Vec::with_capacity(contents.len());
        for content in &contents {
            let record = self.summarizer.summarize(content).await;
            if let Some(e) = &record.error {
                // Left unmarked so the next run retries it.
                report.item_error(&content.id, format!("summarization failed: {e}"));
            } else {
                match self
                    .store
                    .mark_processed(&content.id, &content.thread_id, &content.subject, &content.sender, &record)
                    .await
                {
                    Ok(()) => report.emails_processed += 1,
                    Err(e) => {
                        error!(id = %content.id, error = %e, "Failed to mark message processed");
                        report.item_error(&content.id, e);
                    }
                }
            }
            records.push(record);
        }

        let run_date = Local::now();
        let date_label = run_date.format(DISPLAY_DATE_FORMAT).to_string();
        let date_range = date_range(&records).unwrap_or_else(|| date_label.clone());

        let digest = self.consolidator.consolidate(&records, &date_range).await;
        if let Some(e) = &digest.error {
            report.run_error(format!("digest consolidation failed: {e}"), false);
        }

        let path = self.renderer.render(&digest, &records, run_date.date_naive())?;
        report.digest_created = true;
        report.digest_file = Some(path.clone());

        let path_str = path.display().to_string();
        self.store
            .save_digest(&date_label, records.len(), Some(&path_str), &digest)
            .await?;

        if let Some(email) = &self.settings.email {
            info!(to = %email.recipient, "Sending digest email");
            let subject = render_template(&email.subject_pattern, &[("date", &date_label)]);
            let body = format!(
                "{}\n\nDigest saved to: {path_str}",
                text_digest(&self.settings.title, &digest, records.len(), &date_label)
            );
            report.digest_sent = self.mail.send(&email.recipient, &subject, &body).await;
            if !report.digest_sent {
                report.run_error(PipelineError::Send(format!("to {}", email.recipient)), false);
            }
        }
        Ok(())
    }

    /// Fetch and extract one message; `None` when the source no longer has it.
    async fn extract(&self, message_ref: &MessageRef) -> Result<Option<ExtractedContent>, PipelineError> {
        let Some(raw) = self.mail.get_message(&message_ref.id).await? else {
            return Ok(None);
        };
        let mut content = self.extractor.extract(&raw);
        if content.has_attachments() {
            let attachments = std::mem::take(&mut content.attachments);
            content.attachments = self.attachments.extract_all(&raw.id, attachments).await;
        }
        Ok(Some(content))
    }
}

/// "<earliest> - <latest>" over the message `Date` headers that parse, or
/// `None` when none do.
fn date_range(records: &[PerMessageExtraction]) -> Option<String> {
    let dates: Vec<DateTime<FixedOffset>> = records
        .iter()
        .filter_map(|r| DateTime::parse_from_rfc2822(r.date.trim()).ok())
        .collect();
    let first = dates.iter().min()?;
    let last = dates.iter().max()?;

    let first_label = first.format(RANGE_DATE_FORMAT).to_string();
    let last_label = last.format(RANGE_DATE_FORMAT).to_string();
    Some(if first_label == last_label {
        first_label
    } else {
        format!("{first_label} - {last_label}")
    })
}
