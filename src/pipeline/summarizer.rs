//! Per-message summarization.

use std::sync::Arc;

use tracing::{error, info};

use crate::extract::ExtractedContent;
use crate::llm::LlmProvider;
use crate::pipeline::prompt::PromptBuilder;
use crate::pipeline::response::parse_message_response;
use crate::pipeline::types::PerMessageExtraction;

/// Turns extracted messages into [`PerMessageExtraction`] records with one
/// model call each.
pub struct MessageSummarizer {
    llm: Arc<dyn LlmProvider>,
    prompts: PromptBuilder,
}

impl MessageSummarizer {
    pub fn new(llm: Arc<dyn LlmProvider>, prompts: PromptBuilder) -> Self {
        Self { llm, prompts }
    }

    /// Summarize one message. A failed model call yields an error record
    /// rather than an error, so one message never sinks a batch.
    pub async fn summarize(&self, content: &ExtractedContent) -> PerMessageExtraction {
        info!(
            id = %content.id,
            subject = %content.subject,
            images = content.images.len(),
            attachments = content.attachments.len(),
            "Summarizing message"
        );

        let request = self.prompts.build_message_request(content);
        let record = match self.llm.complete(request).await {
            Ok(response) => {
                info!(
                    id = %content.id,
                    model = self.llm.model_name(),
                    input_tokens = response.input_tokens,
                    output_tokens = response.output_tokens,
                    "Summary generated"
                );
                parse_message_response(&response.content)
            }
            Err(e) => {
                error!(id = %content.id, error = %e, "Error summarizing message");
                PerMessageExtraction {
                    summary: format!("Error generating summary: {e}"),
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        };

        record.with_source(&content.id, &content.subject, &content.sender, &content.date)
    }

    /// Summarize messages in order.
    pub async fn summarize_batch(&self, contents: &[ExtractedContent]) -> Vec<PerMessageExtraction> {
        let mut out = Vec::with_capacity(contents.len());
        for content in contents {
            out.push(self.summarize(content).await);
        }
        out
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::error::LlmError;
    use crate::llm::{CompletionRequest, CompletionResponse, ContentBlock, FinishReason};
    use crate::pipeline::types::Priority;

    /// Replays canned responses in order and records every request.
    /// `Err` entries become request failures.
    pub(crate) struct ScriptedLlm {
        responses: Mutex<VecDeque<Result<String, String>>>,
        pub(crate) requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedLlm {
        pub(crate) fn new(responses: Vec<Result<&str, &str>>) -> Self {
            Self {
                responses: Mutex::new(
                    responses
                        .into_iter()
                        .map(|r| r.map(str::to_string).map_err(str::to_string))
                        .collect(),
                ),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        /// All text blocks of the `n`th request, joined.
        pub(crate) fn request_text(&self, n: usize) -> String {
            self.requests.lock().unwrap()[n].messages[0]
                .content
                .iter()
                .filter_map(ContentBlock::as_text)
                .collect::<Vec<_>>()
                .join("\n")
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            self.requests.lock().unwrap().push(request);
            match self.responses.lock().unwrap().pop_front() {
                Some(Ok(content)) => Ok(CompletionResponse {
                    content,
                    input_tokens: 10,
                    output_tokens: 20,
                    finish_reason: FinishReason::Stop,
                }),
                Some(Err(reason)) => Err(LlmError::RequestFailed {
                    provider: "scripted".into(),
                    reason,
                }),
                None => Err(LlmError::RequestFailed {
                    provider: "scripted".into(),
                    reason: "no scripted response left".into(),
                }),
            }
        }
    }

    pub(crate) fn content(id: &str, subject: &str, body: &str) -> ExtractedContent {
        ExtractedContent {
            id: id.into(),
            thread_id: id.into(),
            subject: subject.into(),
            sender: "Principal <office@school.test>".into(),
            date: "Mon, 20 Oct 2025 08:00:00 -0700".into(),
            text_body: body.into(),
            html_body: String::new(),
            images: vec![],
            attachments: vec![],
        }
    }

    #[tokio::test]
    async fn successful_summary_carries_source_metadata() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok(
            r#"{"summary": "Picture day Thursday.", "importance": "high"}"#,
        )]));
        let summarizer = MessageSummarizer::new(llm.clone(), PromptBuilder::default());
        let record = summarizer
            .summarize(&content("m1", "Picture Day", "Picture day is Thursday"))
            .await;

        assert_eq!(record.message_id, "m1");
        assert_eq!(record.subject, "Picture Day");
        assert_eq!(record.summary, "Picture day Thursday.");
        assert_eq!(record.importance, Priority::High);
        assert!(llm.request_text(0).contains("Picture day is Thursday"));
    }

    #[tokio::test]
    async fn model_failure_becomes_error_record() {
        let llm = Arc::new(ScriptedLlm::new(vec![Err("connection reset")]));
        let summarizer = MessageSummarizer::new(llm, PromptBuilder::default());
        let record = summarizer.summarize(&content("m1", "Hello", "body")).await;

        assert!(record.summary.starts_with("Error generating summary:"));
        assert!(record.summary.contains("connection reset"));
        assert!(record.error.is_some());
        assert!(record.events.is_empty());
        assert_eq!(record.importance, Priority::Medium);
        assert_eq!(record.message_id, "m1");
    }

    #[tokio::test]
    async fn batch_continues_past_failures() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            Err("timeout"),
            Ok(r#"{"summary": "second"}"#),
            Ok("not json"),
        ]));
        let summarizer = MessageSummarizer::new(llm.clone(), PromptBuilder::default());
        let records = summarizer
            .summarize_batch(&[
                content("a", "A", "x"),
                content("b", "B", "y"),
                content("c", "C", "z"),
            ])
            .await;

        assert_eq!(records.len(), 3);
        assert!(records[0].error.is_some());
        assert_eq!(records[1].summary, "second");
        assert_eq!(records[2].summary, "not json");
        assert_eq!(llm.request_count(), 3);
    }
}
