//! In-memory content source
//!
//! Deterministic source used by local runs without network access and by
//! pipeline-level tests: serves a fixed item list, optionally pacing items
//! or failing partway through the sequence.

use crate::stream::{ItemStream, SourceEvent};
use crate::ContentSource;
use pulse_common::{Error, RawItem, SourceParams};
use std::time::Duration;
use tokio::sync::mpsc;

/// Content source backed by a fixed list of items
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    items: Vec<RawItem>,
    /// Stop and report this error after serving `fail_after` items
    fail_after: Option<usize>,
    /// Pause between items, for exercising cancellation mid-stream
    item_delay: Option<Duration>,
}

impl MemorySource {
    pub fn new(items: Vec<RawItem>) -> Self {
        Self {
            items,
            fail_after: None,
            item_delay: None,
        }
    }

    /// Serve `n` items, then end the stream with a network error attached
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Sleep between consecutive items
    pub fn with_item_delay(mut self, delay: Duration) -> Self {
        self.item_delay = Some(delay);
        self
    }
}

impl ContentSource for MemorySource {
    fn fetch(&self, _params: SourceParams) -> ItemStream {
        let (tx, rx) = mpsc::channel(16);
        let items = self.items.clone();
        let fail_after = self.fail_after;
        let item_delay = self.item_delay;

        tokio::spawn(async move {
            let total = items.len();
            for (i, item) in items.into_iter().enumerate() {
                if fail_after == Some(i) {
                    let _ = tx
                        .send(SourceEvent::Failed(Error::Network(
                            "upstream went away mid-listing".into(),
                        )))
                        .await;
                    return;
                }
                if let Some(delay) = item_delay {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(SourceEvent::Item(item)).await.is_err() {
                    return;
                }
            }
            // fail_after past the end still ends the stream in failure
            if fail_after.map_or(false, |n| n >= total) {
                let _ = tx
                    .send(SourceEvent::Failed(Error::Network(
                        "upstream went away mid-listing".into(),
                    )))
                    .await;
            }
        });

        ItemStream::new(rx)
    }
}
