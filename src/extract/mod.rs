//! Content extraction from raw messages.
//!
//! [`MimeExtractor`] walks the part tree, [`ImageFilter`] screens inline
//! images and [`AttachmentTextExtractor`] pulls bounded text out of PDF
//! attachments. The result is one immutable [`ExtractedContent`] per
//! message.

pub mod attachment;
pub mod image;
pub mod mime;

pub use attachment::AttachmentTextExtractor;
pub use image::{ImageFilter, resolve_cid_references};
pub use mime::MimeExtractor;

use serde::{Deserialize, Serialize};

/// Everything the pipeline needs from one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedContent {
    pub id: String,
    pub thread_id: String,
    pub subject: String,
    pub sender: String,
    /// The message's own `Date` header, verbatim.
    pub date: String,
    pub text_body: String,
    /// `cid:` references to accepted images are already inlined.
    pub html_body: String,
    pub images: Vec<ExtractedImage>,
    pub attachments: Vec<Attachment>,
}

impl ExtractedContent {
    /// Preferred body: HTML when present, otherwise plain text.
    pub fn body(&self) -> &str {
        if self.html_body.trim().is_empty() {
            &self.text_body
        } else {
            &self.html_body
        }
    }

    pub fn has_images(&self) -> bool {
        !self.images.is_empty()
    }

    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }
}

/// An accepted inline image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedImage {
    pub filename: String,
    pub mime_type: String,
    pub content_id: Option<String>,
    pub bytes: Vec<u8>,
    pub size: usize,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// A document attachment, kept for provenance even when no text was
/// extracted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    pub remote_ref: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
}

/// Strip markup from an HTML body for prompting.
///
/// Drops `<script>` and `<style>` blocks, turns remaining tags into spaces
/// and collapses whitespace.
pub fn strip_html(html: &str) -> String {
    let without_blocks = remove_block(&remove_block(html, "script"), "style");

    let mut result = String::with_capacity(without_blocks.len());
    let mut in_tag = false;
    for ch in without_blocks.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whether a body should be treated as HTML for prompting.
pub fn looks_like_html(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("<html") || lower.contains("<body")
}

/// Remove every `<tag ...>...</tag>` block, case-insensitively.
fn remove_block(html: &str, tag: &str) -> String {
    let lower = html.to_ascii_lowercase();
    let open = format!("<{tag}");
    let close = format!("</{tag}>");
    let mut out = String::with_capacity(html.len());
    let mut pos = 0;

    while let Some(start) = lower[pos..].find(&open).map(|i| i + pos) {
        out.push_str(&html[pos..start]);
        match lower[start..].find(&close) {
            Some(end) => pos = start + end + close.len(),
            None => {
                pos = html.len();
                break;
            }
        }
    }
    out.push_str(&html[pos..]);
    out
}
