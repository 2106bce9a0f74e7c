//! Part-tree walk.
//!
//! Each recursive call returns its own [`PartialExtraction`]; parents merge
//! children in traversal order. Nothing is accumulated through shared
//! mutable state.

use tracing::{debug, info};

use crate::extract::image::{ImageFilter, resolve_cid_references};
use crate::extract::{Attachment, ExtractedContent, ExtractedImage};
use crate::mail::{RawMessage, RawPart, decode_base64url};

/// Document types that become attachment entries.
const SUPPORTED_ATTACHMENT_TYPES: &[&str] = &["application/pdf"];

/// Bodies and leaves gathered from one subtree.
#[derive(Debug, Default)]
struct PartialExtraction {
    text_body: String,
    html_body: String,
    images: Vec<ExtractedImage>,
    attachments: Vec<Attachment>,
}

impl PartialExtraction {
    fn merge(mut self, mut other: PartialExtraction) -> Self {
        self.text_body.push_str(&other.text_body);
        self.html_body.push_str(&other.html_body);
        self.images.append(&mut other.images);
        self.attachments.append(&mut other.attachments);
        self
    }
}

/// Turns a [`RawMessage`] into an [`ExtractedContent`].
#[derive(Debug, Clone)]
pub struct MimeExtractor {
    filter: ImageFilter,
}

impl MimeExtractor {
    pub fn new(filter: ImageFilter) -> Self {
        Self { filter }
    }

    /// Extract a message. Individual part failures only drop that part.
    pub fn extract(&self, message: &RawMessage) -> ExtractedContent {
        let partial = self.walk(&message.payload, &message.id);

        let html_body = if partial.images.is_empty() {
            partial.html_body
        } else {
            resolve_cid_references(&partial.html_body, &partial.images)
        };

        let content = ExtractedContent {
            id: message.id.clone(),
            thread_id: if message.thread_id.is_empty() {
                message.id.clone()
            } else {
                message.thread_id.clone()
            },
            subject: message.header("Subject").unwrap_or("No Subject").to_string(),
            sender: message.header("From").unwrap_or("Unknown").to_string(),
            date: message.header("Date").unwrap_or_default().to_string(),
            text_body: partial.text_body,
            html_body,
            images: partial.images,
            attachments: partial.attachments,
        };

        info!(
            id = %content.id,
            text_chars = content.text_body.len(),
            html_chars = content.html_body.len(),
            images = content.images.len(),
            attachments = content.attachments.len(),
            "Extracted message content"
        );
        content
    }

    fn walk(&self, part: &RawPart, message_id: &str) -> PartialExtraction {
        if !part.parts.is_empty() {
            return part
                .parts
                .iter()
                .map(|child| self.walk(child, message_id))
                .fold(PartialExtraction::default(), PartialExtraction::merge);
        }
        self.leaf(part, message_id)
    }

    fn leaf(&self, part: &RawPart, message_id: &str) -> PartialExtraction {
        let mime = part.mime_type.to_ascii_lowercase();
        let mut out = PartialExtraction::default();

        if mime == "text/plain" {
            out.text_body = decode_text(part);
        } else if mime == "text/html" {
            out.html_body = decode_text(part);
        } else if mime.starts_with("image/") {
            if let Some(image) = self.image(part, &mime, message_id) {
                out.images.push(image);
            }
        } else if SUPPORTED_ATTACHMENT_TYPES.contains(&mime.as_str()) {
            match part.attachment_id() {
                Some(remote_ref) => out.attachments.push(Attachment {
                    filename: non_empty(&part.filename, "attachment.pdf"),
                    mime_type: mime,
                    remote_ref: remote_ref.to_string(),
                    size: part.size(),
                    extracted_text: None,
                }),
                None => debug!(
                    id = message_id,
                    filename = %part.filename,
                    "Document part has no attachment reference, skipping"
                ),
            }
        }
        out
    }

    fn image(&self, part: &RawPart, mime: &str, message_id: &str) -> Option<ExtractedImage> {
        let filename = non_empty(&part.filename, "image");
        // Attachment-backed images are not fetched.
        let Some(data) = part.data() else {
            debug!(id = message_id, filename = %filename, "Image has no inline data, skipping");
            return None;
        };
        let Some(bytes) = decode_base64url(data) else {
            info!(id = message_id, filename = %filename, "Image payload failed to decode, skipping");
            return None;
        };
        let content_id = part
            .header("Content-ID")
            .map(|cid| cid.trim().trim_start_matches('<').trim_end_matches('>').to_string())
            .filter(|cid| !cid.is_empty());

        match self.filter.accept(&filename, mime, content_id, bytes) {
            Ok(image) => Some(image),
            Err(e) => {
                info!(id = message_id, reason = %e, "Filtered out image");
                None
            }
        }
    }
}

/// Decode a text part; any failure yields an empty string.
fn decode_text(part: &RawPart) -> String {
    part.data()
        .and_then(decode_base64url)
        .map(|bytes| String::from_utf8_lossy(&bytes).replace('\u{FFFD}', ""))
        .unwrap_or_default()
}

fn non_empty(value: &str, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}
