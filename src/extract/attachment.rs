//! Bounded text extraction from document attachments.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::ExtractError;
use crate::extract::Attachment;
use crate::mail::MailSource;

/// Fetches PDF attachments and pulls out at most `max_chars` of text.
pub struct AttachmentTextExtractor {
    mail: Arc<dyn MailSource>,
    enabled: bool,
    max_chars: usize,
}

impl AttachmentTextExtractor {
    pub fn new(mail: Arc<dyn MailSource>, enabled: bool, max_chars: usize) -> Self {
        Self {
            mail,
            enabled,
            max_chars,
        }
    }

    /// Fill `extracted_text` where possible. Every attachment is returned,
    /// with or without text.
    pub async fn extract_all(&self, message_id: &str, attachments: Vec<Attachment>) -> Vec<Attachment> {
        if !self.enabled {
            return attachments;
        }
        let mut out = Vec::with_capacity(attachments.len());
        for mut attachment in attachments {
            attachment.extracted_text = self.extract(message_id, &attachment).await;
            out.push(attachment);
        }
        out
    }

    /// Extract text from one attachment; `None` on any failure.
    pub async fn extract(&self, message_id: &str, attachment: &Attachment) -> Option<String> {
        let bytes = match self.mail.get_attachment(message_id, &attachment.remote_ref).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                warn!(id = message_id, filename = %attachment.filename, "Attachment not found");
                return None;
            }
            Err(e) => {
                warn!(id = message_id, filename = %attachment.filename, error = %e, "Attachment fetch failed");
                return None;
            }
        };

        match pdf_text(&bytes, self.max_chars) {
            Ok(text) if !text.trim().is_empty() => {
                info!(
                    id = message_id,
                    filename = %attachment.filename,
                    chars = text.chars().count(),
                    "Extracted attachment text"
                );
                Some(text)
            }
            Ok(_) => {
                debug!(id = message_id, filename = %attachment.filename, "Attachment yielded no text");
                None
            }
            Err(e) => {
                warn!(id = message_id, filename = %attachment.filename, error = %e, "Attachment text extraction failed");
                None
            }
        }
    }
}

/// Extract up to `max_chars` characters from a PDF, page by page.
pub fn pdf_text(bytes: &[u8], max_chars: usize) -> Result<String, ExtractError> {
    let doc = lopdf::Document::load_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;
    let pages = doc.get_pages();
    Ok(collect_pages(pages.keys().copied(), max_chars, |page| {
        doc.extract_text(&[page]).map_err(|e| e.to_string())
    }))
}

/// Concatenate page texts until `max_chars` is reached. Pages after the cap
/// are never extracted; failing pages are skipped.
fn collect_pages<I, F>(pages: I, max_chars: usize, mut extract: F) -> String
where
    I: IntoIterator<Item = u32>,
    F: FnMut(u32) -> Result<String, String>,
{
    let mut text = String::new();
    let mut chars = 0usize;

    for page in pages {
        if chars >= max_chars {
            break;
        }
        let page_text = match extract(page) {
            Ok(t) => t,
            Err(e) => {
                debug!(page, error = %e, "Skipping unreadable page");
                continue;
            }
        };
        let page_text = page_text.trim();
        if page_text.is_empty() {
            continue;
        }
        if !text.is_empty() {
            // A separator needs room for at least one character after it.
            if max_chars - chars <= 2 {
                break;
            }
            text.push_str("\n\n");
            chars += 2;
        }
        let remaining = max_chars.saturating_sub(chars);
        let taken: String = page_text.chars().take(remaining).collect();
        chars += taken.chars().count();
        text.push_str(&taken);
    }
    text
}
