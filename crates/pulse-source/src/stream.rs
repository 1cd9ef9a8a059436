//! Item stream handed out by content sources

use pulse_common::{Error, RawItem};
use tokio::sync::mpsc;

/// Events flowing from a fetch task to its consumer
#[derive(Debug)]
pub enum SourceEvent {
    Item(RawItem),
    /// Terminal upstream failure; the stream ends after this event
    Failed(Error),
}

/// Finite, non-restartable sequence of raw items.
///
/// Dropping the stream aborts the underlying fetch at the next send.
#[derive(Debug)]
pub struct ItemStream {
    rx: mpsc::Receiver<SourceEvent>,
    error: Option<Error>,
    ended: bool,
}

impl ItemStream {
    pub(crate) fn new(rx: mpsc::Receiver<SourceEvent>) -> Self {
        Self {
            rx,
            error: None,
            ended: false,
        }
    }

    /// Next item, or `None` once the sequence is exhausted. After `None`,
    /// [`error`](Self::error) reports whether the end was a failure.
    pub async fn next(&mut self) -> Option<RawItem> {
        if self.ended {
            return None;
        }
        match self.rx.recv().await {
            Some(SourceEvent::Item(item)) => Some(item),
            Some(SourceEvent::Failed(e)) => {
                self.error = Some(e);
                self.ended = true;
                None
            }
            None => {
                self.ended = true;
                None
            }
        }
    }

    /// The terminal error, if the stream ended in failure
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }
}
