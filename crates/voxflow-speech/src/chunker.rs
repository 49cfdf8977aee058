//! Word chunker: turns an arbitrary fragment stream into word units.

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use voxflow_core::types::{StreamItem, TextUnit};

/// Buffers characters until a space closes the current word.
///
/// A single left-to-right scan: no look-ahead, no backtracking. Runs of
/// spaces never produce empty units.
#[derive(Debug, Default)]
pub struct WordChunker {
    buffer: String,
}

impl WordChunker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment, returning the units it completes in order.
    pub fn push(&mut self, fragment: &str) -> Vec<TextUnit> {
        let mut units = Vec::new();
        for ch in fragment.chars() {
            if ch == ' ' {
                if !self.buffer.is_empty() {
                    units.push(TextUnit::from_word(&self.buffer));
                    self.buffer.clear();
                }
            } else {
                self.buffer.push(ch);
            }
        }
        units
    }

    /// Flush the partially buffered word, if any.
    pub fn finish(&mut self) -> Option<TextUnit> {
        if self.buffer.is_empty() {
            return None;
        }
        let unit = TextUnit::from_word(&self.buffer);
        self.buffer.clear();
        Some(unit)
    }

    /// Run as a pipeline stage until the end marker arrives.
    ///
    /// The end marker flushes the partial word and is forwarded downstream.
    pub async fn run(
        mut self,
        mut input: mpsc::UnboundedReceiver<StreamItem<String>>,
        output: mpsc::UnboundedSender<StreamItem<TextUnit>>,
    ) {
        debug!("Text chunker started");

        loop {
            let fragment = match input.recv().await {
                Some(StreamItem::Item(fragment)) => fragment,
                Some(StreamItem::End) => break,
                None => {
                    warn!("Chunker input closed without an end marker");
                    break;
                }
            };
            trace!(fragment = ?fragment, "Chunker received text");

            for unit in self.push(&fragment) {
                trace!(unit = %unit, "Emitting unit");
                if output.send(StreamItem::Item(unit)).is_err() {
                    debug!("Chunker output dropped, stopping");
                    return;
                }
            }
        }

        if let Some(unit) = self.finish() {
            trace!(unit = %unit, "Flushing final unit");
            let _ = output.send(StreamItem::Item(unit));
        }
        let _ = output.send(StreamItem::End);

        debug!("Text chunker finished");
    }
}
