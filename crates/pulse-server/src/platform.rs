//! Application wiring
//!
//! Builds and owns the platform components, replacing any notion of
//! process-global state: circuit breaker, registry and store all live here
//! and are handed to the components that need them.

use chrono::{DateTime, Utc};
use pulse_alerts::RuleSet;
use pulse_common::{Config, PipelineRequest, Result, SourceParams, StageKind};
use pulse_inference::{FailsafeDispatcher, FailsafeOptions, HttpModelClient, ModelClient};
use pulse_orchestrator::{Orchestrator, Scheduler, TaskRegistry};
use pulse_source::{ContentSource, RedditSource};
use pulse_store::ResultStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info};

/// Top-level application state shared with every handler
pub struct Platform {
    config: Config,
    dispatcher: Arc<FailsafeDispatcher>,
    store: Arc<ResultStore>,
    registry: Arc<TaskRegistry>,
    orchestrator: Arc<Orchestrator>,
    scheduler: Option<Scheduler>,
    started_at: DateTime<Utc>,
    last_error: RwLock<Option<String>>,
    reaper: tokio::task::JoinHandle<()>,
}

impl Platform {
    /// Build the platform with the production content source
    pub async fn from_config(config: Config) -> Result<Arc<Self>> {
        let source = Arc::new(RedditSource::new(&config.source)?);
        Self::build(config, source).await
    }

    /// Build the platform with an injected content source
    pub async fn build(config: Config, source: Arc<dyn ContentSource>) -> Result<Arc<Self>> {
        config.validate()?;

        let client: Option<Arc<dyn ModelClient>> = match config.model.service_url() {
            Some(url) => {
                info!(url, "using learned-model service");
                Some(Arc::new(HttpModelClient::new(url)?))
            }
            None => {
                info!("no model service configured, every prediction uses the lexicon fallback");
                None
            }
        };

        let dispatcher = Arc::new(FailsafeDispatcher::new(
            client,
            FailsafeOptions {
                max_failures: config.circuit.max_failures,
                window: config.circuit.window(),
                cooldown: config.circuit.cooldown(),
                deadline: config.model.request_timeout(),
            },
        ));

        let store = Arc::new(ResultStore::connect(&config.store.dsn).await?);
        let registry = Arc::new(TaskRegistry::new(config.tasks.ttl()));
        let reaper = registry.start_reaper(Duration::from_secs(3600));

        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&registry),
            source,
            Arc::clone(&dispatcher),
            Arc::clone(&store),
            Arc::new(RuleSet::builtin()),
            config.pipeline.clone(),
        ));

        let scheduler = if config.scheduler.enabled {
            info!(
                interval_minutes = config.scheduler.interval_minutes,
                subreddit = %config.scheduler.subreddit,
                "scheduler enabled"
            );
            Some(Scheduler::start(
                Arc::clone(&orchestrator),
                config.scheduler.interval(),
                config.scheduler.jitter_frac,
                scheduled_request(&config),
            ))
        } else {
            None
        };

        Ok(Arc::new(Self {
            config,
            dispatcher,
            store,
            registry,
            orchestrator,
            scheduler,
            started_at: Utc::now(),
            last_error: RwLock::new(None),
            reaper,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<FailsafeDispatcher> {
        &self.dispatcher
    }

    pub fn store(&self) -> &Arc<ResultStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn uptime_seconds(&self) -> u64 {
        Utc::now()
            .signed_duration_since(self.started_at)
            .num_seconds()
            .max(0) as u64
    }

    pub async fn note_error(&self, message: String) {
        error!(message = %message, "platform error recorded");
        *self.last_error.write().await = Some(message);
    }

    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    /// Stop the scheduler, cancel running pipelines and close the store
    pub async fn shutdown(&self) {
        info!("shutting down platform");
        if let Some(scheduler) = &self.scheduler {
            scheduler.shutdown().await;
        }
        self.orchestrator.cancel_all();
        self.reaper.abort();
        self.store.close().await;
        info!("platform shutdown complete");
    }
}

fn scheduled_request(config: &Config) -> PipelineRequest {
    PipelineRequest {
        source_params: SourceParams {
            subreddit: config.scheduler.subreddit.clone(),
            post_limit: config.scheduler.post_limit,
            comment_limit_per_post: config.scheduler.comment_limit_per_post,
            sort: Default::default(),
            time_window: Default::default(),
            query: None,
        },
        stages: StageKind::ALL.to_vec(),
        enable_alerts: true,
    }
}
