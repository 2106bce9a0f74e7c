//! Mail Digest: turn a mailbox label into a consolidated, deduplicated
//! digest of events and action items.

pub mod config;
pub mod error;
pub mod extract;
pub mod llm;
pub mod mail;
pub mod pipeline;
pub mod render;
pub mod store;
