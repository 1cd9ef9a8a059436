//! HTTP surface and application wiring for the Pulse platform
//!
//! The [`Platform`] struct owns every component (failsafe dispatcher,
//! result store, task registry, orchestrator, scheduler) as explicit values;
//! handlers reach them through shared state, never through globals.

pub mod handlers;
pub mod platform;
pub mod server;

pub use handlers::create_router;
pub use platform::Platform;
pub use server::Server;
