//! Content source for the Pulse platform
//!
//! Fetches posts and their comments from a Reddit-style listing API as a
//! finite, non-restartable item stream. Per-request retry with exponential
//! backoff lives here; nothing downstream retries source calls.

pub mod memory;
pub mod reddit;
pub mod stream;

pub use memory::MemorySource;
pub use reddit::RedditSource;
pub use stream::{ItemStream, SourceEvent};

use pulse_common::SourceParams;

/// A paginated producer of raw items
pub trait ContentSource: Send + Sync {
    /// Start a fetch; the returned stream is finite and non-restartable.
    /// On terminal upstream failure the stream ends with the error attached.
    fn fetch(&self, params: SourceParams) -> ItemStream;
}
