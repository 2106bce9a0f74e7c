//! Gmail REST API v1 mail source.
//!
//! Uses a bearer access token supplied through the environment; token
//! acquisition and refresh are handled outside this process.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::MailError;
use crate::mail::{
    MailSource, MessageRef, RawMessage, build_plain_message, decode_base64url, encode_base64url,
};

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AttachmentResponse {
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendRequest {
    raw: String,
}

/// Gmail API client.
pub struct GmailSource {
    client: reqwest::Client,
    access_token: SecretString,
}

impl GmailSource {
    pub fn new(access_token: SecretString) -> Self {
        Self {
            client: reqwest::Client::new(),
            access_token,
        }
    }

    fn auth_headers(&self) -> Result<HeaderMap, MailError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.access_token.expose_secret()))
                .map_err(|e| MailError::AuthFailed(format!("invalid token header: {e}")))?,
        );
        Ok(headers)
    }

    /// GET an endpoint; `Ok(None)` on 404.
    async fn get<T: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<T>, MailError> {
        let url = format!("{GMAIL_API_BASE}{endpoint}");
        let response = self
            .client
            .get(&url)
            .headers(self.auth_headers()?)
            .query(query)
            .send()
            .await
            .map_err(|e| MailError::RequestFailed(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        response
            .json()
            .await
            .map(Some)
            .map_err(|e| MailError::InvalidPayload(format!("parse response: {e}")))
    }

    async fn post_send(&self, raw: String) -> Result<(), MailError> {
        let url = format!("{GMAIL_API_BASE}/messages/send");
        let response = self
            .client
            .post(&url)
            .headers(self.auth_headers()?)
            .json(&SendRequest { raw })
            .send()
            .await
            .map_err(|e| MailError::RequestFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(())
    }
}

async fn error_from_response(response: reqwest::Response) -> MailError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    match status.as_u16() {
        401 | 403 => MailError::AuthFailed(format!("{status}: {body}")),
        429 => MailError::RateLimited,
        _ => MailError::RequestFailed(format!("API error ({status}): {body}")),
    }
}

/// Gmail search query for a label and lookback window. The label is quoted
/// so names with spaces or slashes stay one term.
fn list_query(label: &str, lookback_hours: u32, now_epoch: i64) -> String {
    let after = now_epoch - i64::from(lookback_hours) * 3600;
    let label = label.replace('"', "");
    format!("label:\"{label}\" after:{after}")
}

#[async_trait]
impl MailSource for GmailSource {
    async fn list_messages(
        &self,
        label: &str,
        lookback_hours: u32,
        exclude_ids: &HashSet<String>,
    ) -> Result<Vec<MessageRef>, MailError> {
        let query = list_query(label, lookback_hours, Utc::now().timestamp());
        let mut found = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut params = vec![("q", query.as_str())];
            if let Some(token) = page_token.as_deref() {
                params.push(("pageToken", token));
            }
            let Some(page) = self
                .get::<MessageListResponse>("/messages", &params)
                .await?
            else {
                break;
            };
            found.extend(
                page.messages
                    .into_iter()
                    .filter(|m| !exclude_ids.contains(&m.id)),
            );
            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }

        info!(label, count = found.len(), "Listed messages");
        Ok(found)
    }

    async fn get_message(&self, id: &str) -> Result<Option<RawMessage>, MailError> {
        debug!(id, "Fetching message");
        self.get(&format!("/messages/{id}"), &[("format", "full")])
            .await
    }

    async fn get_attachment(
        &self,
        message_id: &str,
        attachment_ref: &str,
    ) -> Result<Option<Vec<u8>>, MailError> {
        let Some(resp) = self
            .get::<AttachmentResponse>(
                &format!("/messages/{message_id}/attachments/{attachment_ref}"),
                &[],
            )
            .await?
        else {
            return Ok(None);
        };
        Ok(resp.data.as_deref().and_then(decode_base64url))
    }

    async fn send(&self, to: &str, subject: &str, body: &str) -> bool {
        let raw = encode_base64url(build_plain_message(None, to, subject, body).as_bytes());
        match self.post_send(raw).await {
            Ok(()) => {
                info!(to, subject, "Sent message");
                true
            }
            Err(e) => {
                error!(to, error = %e, "Failed to send message");
                false
            }
        }
    }
}
