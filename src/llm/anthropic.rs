//! Anthropic Messages API client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, ContentBlock, FinishReason, LlmProvider,
    Role,
};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const PROVIDER: &str = "anthropic";

// ── Wire format ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: Role,
    content: Vec<WireBlock<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireBlock<'a> {
    Text { text: &'a str },
    Image { source: ImageSource<'a> },
}

#[derive(Debug, Serialize)]
struct ImageSource<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: &'a str,
    data: &'a str,
}

impl<'a> From<&'a ChatMessage> for WireMessage<'a> {
    fn from(msg: &'a ChatMessage) -> Self {
        let content = msg
            .content
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => WireBlock::Text { text },
                ContentBlock::Image { media_type, data } => WireBlock::Image {
                    source: ImageSource {
                        kind: "base64",
                        media_type,
                        data,
                    },
                },
            })
            .collect();
        Self {
            role: msg.role,
            content,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseBlock>,
    stop_reason: Option<String>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ResponseBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

// ── Provider ────────────────────────────────────────────────────────

/// Anthropic Claude provider over plain HTTPS.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
}

impl AnthropicProvider {
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model: model.into(),
        }
    }

    fn headers(&self) -> Result<HeaderMap, LlmError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(self.api_key.expose_secret()).map_err(|_| {
                LlmError::AuthFailed {
                    provider: PROVIDER.to_string(),
                }
            })?,
        );
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        Ok(headers)
    }

    async fn error_from_response(response: reqwest::Response) -> LlmError {
        let status = response.status().as_u16();

        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return LlmError::RateLimited {
                provider: PROVIDER.to_string(),
                retry_after,
            };
        }

        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<ErrorEnvelope>(&body).ok();

        if status == 401
            || detail
                .as_ref()
                .is_some_and(|d| d.error.kind == "authentication_error")
        {
            return LlmError::AuthFailed {
                provider: PROVIDER.to_string(),
            };
        }

        LlmError::RequestFailed {
            provider: PROVIDER.to_string(),
            reason: match detail {
                Some(d) => format!("HTTP {status}: {}", d.error.message),
                None => format!("HTTP {status}"),
            },
        }
    }
}

fn finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
        Some("max_tokens") => FinishReason::Length,
        _ => FinishReason::Other,
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system: request.system.as_deref(),
            messages: request.messages.iter().map(WireMessage::from).collect(),
        };

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let parsed: MessagesResponse =
            response
                .json()
                .await
                .map_err(|e| LlmError::InvalidResponse {
                    provider: PROVIDER.to_string(),
                    reason: format!("Failed to parse response: {e}"),
                })?;

        let content = parsed
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");
        let (input_tokens, output_tokens) = parsed
            .usage
            .map(|u| (u.input_tokens, u.output_tokens))
            .unwrap_or_default();

        debug!(
            model = %self.model,
            input_tokens,
            output_tokens,
            "Anthropic completion finished"
        );

        Ok(CompletionResponse {
            content,
            input_tokens,
            output_tokens,
            finish_reason: finish_reason(parsed.stop_reason.as_deref()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_blocks_serialize_as_base64_source() {
        let msg = ChatMessage::user_blocks(vec![
            ContentBlock::text("look"),
            ContentBlock::image("image/png", "iVBOR"),
        ]);
        let wire = WireMessage::from(&msg);
        let json = serde_json::to_value(&wire).unwrap();

        assert_eq!(json["role"], "user");
        assert_eq!(json["content"][0]["type"], "text");
        assert_eq!(json["content"][0]["text"], "look");
        assert_eq!(json["content"][1]["type"], "image");
        assert_eq!(json["content"][1]["source"]["type"], "base64");
        assert_eq!(json["content"][1]["source"]["media_type"], "image/png");
        assert_eq!(json["content"][1]["source"]["data"], "iVBOR");
    }

    #[test]
    fn system_omitted_when_absent() {
        let body = MessagesRequest {
            model: "m",
            max_tokens: 10,
            temperature: 0.0,
            system: None,
            messages: vec![],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("system").is_none());
    }

    #[test]
    fn finish_reasons_map() {
        assert_eq!(finish_reason(Some("end_turn")), FinishReason::Stop);
        assert_eq!(finish_reason(Some("max_tokens")), FinishReason::Length);
        assert_eq!(finish_reason(None), FinishReason::Other);
    }

    #[test]
    fn provider_reports_model() {
        let p = AnthropicProvider::new(SecretString::from("sk-test"), "claude-sonnet-4-20250514");
        assert_eq!(p.model_name(), "claude-sonnet-4-20250514");
    }
}
