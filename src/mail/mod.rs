//! Mail collaborator: listing, fetching and sending messages.
//!
//! [`RawMessage`] mirrors the Gmail `format=full` payload so that every
//! source (Gmail REST, local `.eml` files, test fixtures) hands the
//! extractor the same part tree.

pub mod eml;
pub mod gmail;

pub use eml::EmlDirSource;
pub use gmail::GmailSource;

use std::collections::HashSet;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose;
use serde::{Deserialize, Serialize};

use crate::error::MailError;

/// Identifier pair returned by a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
}

/// A message as delivered by the mail collaborator. Read-only input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
    #[serde(default)]
    pub payload: RawPart,
}

impl RawMessage {
    /// First top-level header with this name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.payload.header(name)
    }
}

/// One node of the part tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPart {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub body: Option<PartBody>,
    #[serde(default)]
    pub parts: Vec<RawPart>,
}

impl RawPart {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Inline payload, if the part carries one.
    pub fn data(&self) -> Option<&str> {
        self.body.as_ref().and_then(|b| b.data.as_deref())
    }

    /// Remote attachment reference, if the payload lives elsewhere.
    pub fn attachment_id(&self) -> Option<&str> {
        self.body
            .as_ref()
            .and_then(|b| b.attachment_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    /// Declared payload size in bytes.
    pub fn size(&self) -> u64 {
        self.body.as_ref().map(|b| b.size).unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Part payload: inline URL-safe base64 `data` or a remote `attachment_id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartBody {
    #[serde(default)]
    pub attachment_id: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub data: Option<String>,
}

/// The mail transport the pipeline reads from and sends through.
#[async_trait]
pub trait MailSource: Send + Sync {
    /// Messages carrying `label` received within the last `lookback_hours`,
    /// minus anything in `exclude_ids`.
    async fn list_messages(
        &self,
        label: &str,
        lookback_hours: u32,
        exclude_ids: &HashSet<String>,
    ) -> Result<Vec<MessageRef>, MailError>;

    /// Full message, or `None` when the id no longer resolves.
    async fn get_message(&self, id: &str) -> Result<Option<RawMessage>, MailError>;

    /// Attachment bytes, or `None` when the reference no longer resolves.
    async fn get_attachment(
        &self,
        message_id: &str,
        attachment_ref: &str,
    ) -> Result<Option<Vec<u8>>, MailError>;

    /// Send a plain-text message. Returns whether delivery was accepted.
    async fn send(&self, to: &str, subject: &str, body: &str) -> bool;
}

// ── Base64 helpers ──────────────────────────────────────────────────

/// Decode a base64url payload, tolerating padding and the standard alphabet.
pub fn decode_base64url(data: &str) -> Option<Vec<u8>> {
    let cleaned: String = data.chars().filter(|c| !c.is_whitespace()).collect();
    general_purpose::URL_SAFE_NO_PAD
        .decode(cleaned.trim_end_matches('='))
        .or_else(|_| general_purpose::URL_SAFE.decode(&cleaned))
        .or_else(|_| general_purpose::STANDARD_NO_PAD.decode(cleaned.trim_end_matches('=')))
        .or_else(|_| general_purpose::STANDARD.decode(&cleaned))
        .ok()
}

/// Encode bytes the way Gmail transports them.
pub fn encode_base64url(bytes: &[u8]) -> String {
    general_purpose::URL_SAFE.encode(bytes)
}

/// Build a minimal RFC 5322 text/plain message.
pub fn build_plain_message(from: Option<&str>, to: &str, subject: &str, body: &str) -> String {
    let mut message = String::with_capacity(body.len() + 256);
    if let Some(from) = from {
        message.push_str(&format!("From: {from}\r\n"));
    }
    message.push_str(&format!("To: {to}\r\n"));
    message.push_str(&format!("Subject: {subject}\r\n"));
    message.push_str("MIME-Version: 1.0\r\n");
    message.push_str("Content-Type: text/plain; charset=utf-8\r\n");
    message.push_str("\r\n");
    message.push_str(body);
    message
}
