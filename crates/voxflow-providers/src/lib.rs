//! Text producers for speech sessions.
//!
//! A producer writes text fragments into a session's queue and ends with
//! [`StreamItem::End`](voxflow_core::types::StreamItem::End).

pub mod openai;
pub mod sse;

pub use openai::{ChatHistory, ChatMessage, CompletionClient};
