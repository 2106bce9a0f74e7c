//! Offline mail source over a directory of `.eml` files.
//!
//! Each file is one message; its stem is the message id. A subdirectory
//! named after the label, when present, scopes the listing to that label.
//! Parts are re-expressed as the same [`RawPart`] tree the Gmail API
//! returns: text and image payloads inline, other binaries addressed by
//! part index.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use mail_parser::{Message, MessageParser, MimeHeaders, PartType};
use tracing::{debug, info, warn};

use crate::error::MailError;
use crate::mail::{
    Header, MailSource, MessageRef, PartBody, RawMessage, RawPart, build_plain_message,
    encode_base64url,
};

const OUTBOX_DIR: &str = "outbox";

/// `.eml` directory mail source.
pub struct EmlDirSource {
    root: PathBuf,
}

impl EmlDirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding messages for `label`.
    fn folder(&self, label: &str) -> PathBuf {
        let scoped = self.root.join(label);
        if scoped.is_dir() { scoped } else { self.root.clone() }
    }

    /// Locate `<id>.eml` in the root or any label folder.
    async fn find(&self, id: &str) -> Result<Option<PathBuf>, MailError> {
        let file_name = format!("{id}.eml");
        let direct = self.root.join(&file_name);
        if direct.is_file() {
            return Ok(Some(direct));
        }
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let candidate = entry.path().join(&file_name);
            if candidate.is_file() {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }
}

fn is_eml(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("eml"))
}

fn message_id_of(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
}

/// `type/subtype` for a part, with body-kind fallbacks.
fn mime_type_of(part: &mail_parser::MessagePart<'_>) -> String {
    if let Some(ct) = part.content_type() {
        return match ct.subtype() {
            Some(sub) => format!("{}/{}", ct.ctype(), sub).to_ascii_lowercase(),
            None => ct.ctype().to_ascii_lowercase(),
        };
    }
    match &part.body {
        PartType::Text(_) => "text/plain".into(),
        PartType::Html(_) => "text/html".into(),
        PartType::Multipart(_) => "multipart/mixed".into(),
        PartType::Message(_) => "message/rfc822".into(),
        _ => "application/octet-stream".into(),
    }
}

fn part_headers(part: &mail_parser::MessagePart<'_>) -> Vec<Header> {
    let mut headers = Vec::new();
    if let Some(cid) = part.content_id() {
        headers.push(Header {
            name: "Content-ID".into(),
            value: format!("<{cid}>"),
        });
    }
    headers
}

/// Convert part `idx` of a parsed message into a [`RawPart`] subtree.
fn convert_part(msg: &Message<'_>, idx: usize, depth: usize) -> RawPart {
    let Some(part) = msg.parts.get(idx) else {
        return RawPart::default();
    };
    let mime_type = mime_type_of(part);
    let filename = part.attachment_name().unwrap_or_default().to_string();
    let headers = part_headers(part);

    match &part.body {
        PartType::Multipart(children) if depth < 32 => RawPart {
            mime_type,
            filename,
            headers,
            body: None,
            parts: children
                .iter()
                .map(|child| convert_part(msg, *child as usize, depth + 1))
                .collect(),
        },
        PartType::Text(text) | PartType::Html(text) => RawPart {
            mime_type,
            filename,
            headers,
            body: Some(PartBody {
                attachment_id: None,
                size: text.len() as u64,
                data: Some(encode_base64url(text.as_bytes())),
            }),
            parts: Vec::new(),
        },
        PartType::Binary(bytes) | PartType::InlineBinary(bytes) if mime_type.starts_with("image/") => {
            RawPart {
                mime_type,
                filename,
                headers,
                body: Some(PartBody {
                    attachment_id: None,
                    size: bytes.len() as u64,
                    data: Some(encode_base64url(bytes)),
                }),
                parts: Vec::new(),
            }
        }
        _ => RawPart {
            mime_type,
            filename,
            headers,
            body: Some(PartBody {
                attachment_id: Some(idx.to_string()),
                size: part.contents().len() as u64,
                data: None,
            }),
            parts: Vec::new(),
        },
    }
}

/// Convert a parsed message to the transport-neutral form.
fn to_raw_message(id: &str, msg: &Message<'_>) -> RawMessage {
    let mut payload = convert_part(msg, 0, 0);

    let mut headers = Vec::new();
    if let Some(subject) = msg.subject() {
        headers.push(Header {
            name: "Subject".into(),
            value: subject.to_string(),
        });
    }
    if let Some(from) = msg.from().and_then(|a| a.first()) {
        let value = match (from.name(), from.address()) {
            (Some(name), Some(addr)) => format!("{name} <{addr}>"),
            (None, Some(addr)) => addr.to_string(),
            (Some(name), None) => name.to_string(),
            (None, None) => String::new(),
        };
        headers.push(Header {
            name: "From".into(),
            value,
        });
    }
    if let Some(date) = msg.date() {
        headers.push(Header {
            name: "Date".into(),
            value: date.to_rfc822(),
        });
    }
    headers.append(&mut payload.headers);
    payload.headers = headers;

    RawMessage {
        id: id.to_string(),
        thread_id: msg.message_id().unwrap_or(id).to_string(),
        payload,
    }
}

#[async_trait]
impl MailSource for EmlDirSource {
    async fn list_messages(
        &self,
        label: &str,
        lookback_hours: u32,
        exclude_ids: &HashSet<String>,
    ) -> Result<Vec<MessageRef>, MailError> {
        let folder = self.folder(label);
        let cutoff = Utc::now().timestamp() - i64::from(lookback_hours) * 3600;
        let mut found = Vec::new();

        let mut entries = tokio::fs::read_dir(&folder).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !is_eml(&path) {
                continue;
            }
            let Some(id) = message_id_of(&path) else {
                continue;
            };
            if exclude_ids.contains(&id) {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            let Some(msg) = MessageParser::default().parse(&bytes) else {
                warn!(path = %path.display(), "Skipping unparseable .eml file");
                continue;
            };
            // Undated messages are always in the window.
            if msg.date().is_some_and(|d| d.to_timestamp() < cutoff) {
                continue;
            }
            let thread_id = msg.message_id().unwrap_or(&id).to_string();
            found.push(MessageRef { id, thread_id });
        }

        found.sort_by(|a, b| a.id.cmp(&b.id));
        info!(folder = %folder.display(), count = found.len(), "Listed .eml messages");
        Ok(found)
    }

    async fn get_message(&self, id: &str) -> Result<Option<RawMessage>, MailError> {
        let Some(path) = self.find(id).await? else {
            return Ok(None);
        };
        let bytes = tokio::fs::read(&path).await?;
        let Some(msg) = MessageParser::default().parse(&bytes) else {
            return Err(MailError::InvalidPayload(format!(
                "{} is not a parseable message",
                path.display()
            )));
        };
        debug!(id, "Loaded .eml message");
        Ok(Some(to_raw_message(id, &msg)))
    }

    async fn get_attachment(
        &self,
        message_id: &str,
        attachment_ref: &str,
    ) -> Result<Option<Vec<u8>>, MailError> {
        let Ok(idx) = attachment_ref.parse::<usize>() else {
            return Ok(None);
        };
        let Some(path) = self.find(message_id).await? else {
            return Ok(None);
        };
        let bytes = tokio::fs::read(&path).await?;
        Ok(MessageParser::default()
            .parse(&bytes)
            .and_then(|msg| msg.parts.get(idx).map(|p| p.contents().to_vec())))
    }

    async fn send(&self, to: &str, subject: &str, body: &str) -> bool {
        let outbox = self.root.join(OUTBOX_DIR);
        let path = outbox.join(format!("{}.eml", Utc::now().format("%Y%m%dT%H%M%S%.3f")));
        let raw = build_plain_message(None, to, subject, body);
        let result = async {
            tokio::fs::create_dir_all(&outbox).await?;
            tokio::fs::write(&path, raw).await
        }
        .await;
        match result {
            Ok(()) => {
                info!(to, path = %path.display(), "Wrote outgoing message to outbox");
                true
            }
            Err(e) => {
                warn!(to, error = %e, "Failed to write outgoing message");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::decode_base64url;

    const SIMPLE: &str = "From: Office <office@school.test>\r\n\
Subject: Picture Day\r\n\
Message-ID: <pic@school.test>\r\n\
Content-Type: multipart/mixed; boundary=\"b1\"\r\n\
\r\n\
--b1\r\n\
Content-Type: text/plain\r\n\
\r\n\
Picture day is Friday.\r\n\
--b1\r\n\
Content-Type: application/pdf; name=\"form.pdf\"\r\n\
Content-Disposition: attachment; filename=\"form.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0=\r\n\
--b1--\r\n";

    #[tokio::test]
    async fn lists_and_loads_eml_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("msg-1.eml"), SIMPLE).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let source = EmlDirSource::new(dir.path());

        let listed = source
            .list_messages("School", 24, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "msg-1");
        assert_eq!(listed[0].thread_id, "pic@school.test");

        let msg = source.get_message("msg-1").await.unwrap().unwrap();
        assert_eq!(msg.header("Subject"), Some("Picture Day"));
        assert_eq!(msg.header("From"), Some("Office <office@school.test>"));
        assert_eq!(msg.payload.mime_type, "multipart/mixed");
        assert_eq!(msg.payload.parts.len(), 2);

        let text = &msg.payload.parts[0];
        assert_eq!(text.mime_type, "text/plain");
        let decoded = decode_base64url(text.data().unwrap()).unwrap();
        assert!(String::from_utf8_lossy(&decoded).contains("Picture day is Friday."));

        let pdf = &msg.payload.parts[1];
        assert_eq!(pdf.mime_type, "application/pdf");
        assert_eq!(pdf.filename, "form.pdf");
        let att = pdf.attachment_id().unwrap().to_string();
        let bytes = source.get_attachment("msg-1", &att).await.unwrap().unwrap();
        assert_eq!(bytes, b"%PDF-");
    }

    #[tokio::test]
    async fn excluded_and_missing_ids() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.eml"), SIMPLE).unwrap();
        let source = EmlDirSource::new(dir.path());

        let exclude: HashSet<String> = ["a".to_string()].into_iter().collect();
        assert!(source.list_messages("x", 24, &exclude).await.unwrap().is_empty());
        assert!(source.get_message("missing").await.unwrap().is_none());
        assert!(source.get_attachment("a", "not-a-number").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn label_folder_scopes_listing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("School")).unwrap();
        std::fs::write(dir.path().join("School").join("in-label.eml"), SIMPLE).unwrap();
        std::fs::write(dir.path().join("outside.eml"), SIMPLE).unwrap();
        let source = EmlDirSource::new(dir.path());

        let listed = source.list_messages("School", 24, &HashSet::new()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "in-label");
        assert!(source.get_message("in-label").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn send_writes_outbox() {
        let dir = tempfile::tempdir().unwrap();
        let source = EmlDirSource::new(dir.path());
        assert!(source.send("parent@home.test", "Digest", "body").await);
        let written: Vec<_> = std::fs::read_dir(dir.path().join(OUTBOX_DIR)).unwrap().collect();
        assert_eq!(written.len(), 1);
    }
}
