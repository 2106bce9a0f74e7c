//! The digest pipeline.
//!
//! Every message flows through:
//! 1. `MimeExtractor` / `AttachmentTextExtractor`: text, images and PDF text
//! 2. `PromptBuilder` + `MessageSummarizer`: one model call per message
//! 3. `ResponseParser` functions: tolerant JSON recovery
//! 4. `DigestConsolidator`: one model call for the whole batch, then event
//!    deduplication against the per-message records
//!
//! [`DigestRunner`] drives one run end to end.

pub mod consolidate;
pub mod prompt;
pub mod response;
pub mod runner;
pub mod summarizer;
pub mod types;

pub use consolidate::DigestConsolidator;
pub use prompt::{PromptBuilder, PromptTemplates};
pub use response::{parse_digest_response, parse_message_response};
pub use runner::{DigestRunner, RunError, RunReport, RunSettings};
pub use summarizer::MessageSummarizer;
pub use types::{ActionItem, CalendarEntry, DigestRecord, Event, PerMessageExtraction, Priority};
