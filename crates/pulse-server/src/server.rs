//! HTTP server wrapper

use crate::handlers;
use crate::platform::Platform;
use axum::Router;
use pulse_common::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

/// HTTP server for the platform
pub struct Server {
    platform: Arc<Platform>,
}

impl Server {
    pub fn new(platform: Arc<Platform>) -> Self {
        Self { platform }
    }

    /// Serve until the process is stopped
    pub async fn run(&self, bind_addr: &str) -> Result<()> {
        let app = self.create_app();
        info!(bind_addr, "starting http server");

        let listener = tokio::net::TcpListener::bind(bind_addr)
            .await
            .map_err(|e| Error::Network(format!("cannot bind {}: {}", bind_addr, e)))?;

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Network(format!("server error: {}", e)))?;
        Ok(())
    }

    fn create_app(&self) -> Router {
        let timeout = Duration::from_millis(self.platform.config().server.request_timeout_ms);
        handlers::create_router(Arc::clone(&self.platform)).layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(TimeoutLayer::new(timeout)),
        )
    }
}
