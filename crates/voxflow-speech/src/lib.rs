//! Streaming TTS pipeline: word chunking, provider link, alignment resync, playback.

pub mod alignment;
pub mod chunker;
pub mod link;
pub mod playback;
pub mod retry;
pub mod session;

pub use session::{SessionReport, StreamSession};
