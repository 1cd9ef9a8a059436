//! Inference for the Pulse platform
//!
//! Three layers: a deterministic lexicon classifier, an HTTP client for the
//! learned-model service, and the failsafe dispatcher that fronts the model
//! service with a circuit breaker and degrades to the lexicon. Callers of
//! [`FailsafeDispatcher::predict`] always get a verdict, never an error.

pub mod failsafe;
pub mod lexicon;
pub mod model_client;

pub use failsafe::{FailsafeDispatcher, FailsafeOptions};
pub use lexicon::LexiconClassifier;
pub use model_client::{is_supported_model, HttpModelClient, ModelClient, SUPPORTED_MODELS};
