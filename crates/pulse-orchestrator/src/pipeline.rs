//! Pipeline orchestrator
//!
//! Executes a pipeline request as a linear stage DAG. Stages within one
//! pipeline run sequentially with the scraped batch buffered on disk;
//! multiple pipelines run in parallel under a global semaphore. Every stage
//! checks the cancellation token at least between items, and the persist
//! stage fans classification calls out up to a per-pipeline limit.

use crate::registry::{TaskFilter, TaskRegistry};
use crate::spool::{SpoolHandle, SpoolWriter};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use pulse_alerts::RuleSet;
use pulse_common::config::PipelineConfig;
use pulse_common::{
    normalize_item, Classification, Error, NormalizedItem, PipelineRequest, RawItem, Result,
    StageKind, Task, TaskId, TaskKind, TaskState, TextHash,
};
use pulse_inference::FailsafeDispatcher;
use pulse_source::ContentSource;
use pulse_store::ResultStore;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pipeline task plus its per-stage child tasks, in execution order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSnapshot {
    pub pipeline: Task,
    pub stages: Vec<Task>,
}

/// Monotonic orchestrator counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorStats {
    pub pipelines_submitted: u64,
    pub pipelines_succeeded: u64,
    pub pipelines_failed: u64,
    pub pipelines_cancelled: u64,
    pub items_scraped: u64,
    pub items_persisted: u64,
    pub alerts_raised: u64,
    pub active_pipelines: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    items_scraped: AtomicU64,
    items_persisted: AtomicU64,
    alerts_raised: AtomicU64,
}

struct PipelineIds {
    pipeline: TaskId,
    stages: Vec<(StageKind, TaskId)>,
}

#[derive(Default)]
struct StageData {
    spool: Option<SpoolHandle>,
    items: Vec<NormalizedItem>,
}

enum StageEnd {
    Done,
    Failed { error: String, fatal: bool },
    Cancelled,
}

enum ItemOutcome {
    Stored { inserted: bool, alerts: u64 },
    StoreFailed,
    /// Cancellation fired while the classification was in flight
    Discarded,
}

/// Stage DAG executor with cancellation and progress reporting
pub struct Orchestrator {
    registry: Arc<TaskRegistry>,
    source: Arc<dyn ContentSource>,
    dispatcher: Arc<FailsafeDispatcher>,
    store: Arc<ResultStore>,
    rules: Arc<RuleSet>,
    config: PipelineConfig,
    semaphore: Arc<Semaphore>,
    active: DashMap<TaskId, CancellationToken>,
    counters: Counters,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<TaskRegistry>,
        source: Arc<dyn ContentSource>,
        dispatcher: Arc<FailsafeDispatcher>,
        store: Arc<ResultStore>,
        rules: Arc<RuleSet>,
        config: PipelineConfig,
    ) -> Self {
        let max_parallel = config.max_parallel;
        Self {
            registry,
            source,
            dispatcher,
            store,
            rules,
            config,
            semaphore: Arc::new(Semaphore::new(max_parallel)),
            active: DashMap::new(),
            counters: Counters::default(),
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<FailsafeDispatcher> {
        &self.dispatcher
    }

    /// Validate and dispatch a pipeline; returns its id immediately
    pub fn submit(self: &Arc<Self>, request: PipelineRequest) -> Result<TaskId> {
        validate_request(&request)?;

        let pipeline = self.registry.create(TaskKind::Pipeline, None);
        let stages: Vec<(StageKind, TaskId)> = request
            .stages
            .iter()
            .map(|s| {
                let task = self.registry.create((*s).into(), Some(pipeline.id));
                (*s, task.id)
            })
            .collect();

        let ids = PipelineIds {
            pipeline: pipeline.id,
            stages,
        };
        let token = CancellationToken::new();
        self.active.insert(pipeline.id, token.clone());
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        info!(pipeline_id = %pipeline.id, subreddit = %request.source_params.subreddit, "pipeline submitted");

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.run(ids, request, token).await;
        });

        Ok(pipeline.id)
    }

    /// Idempotent cancel. `Some(true)` when the pipeline is (now or already)
    /// cancelled, `Some(false)` when it finished some other way, `None`
    /// when the id is unknown.
    pub fn cancel(&self, id: TaskId) -> Option<bool> {
        let task = self.registry.get(id)?;
        if task.kind != TaskKind::Pipeline {
            return None;
        }
        if let Some(token) = self.active.get(&id) {
            info!(pipeline_id = %id, "cancelling pipeline");
            token.cancel();
            return Some(true);
        }
        Some(task.state == TaskState::Cancelled)
    }

    pub fn snapshot(&self, id: TaskId) -> Option<PipelineSnapshot> {
        let pipeline = self.registry.get(id)?;
        if pipeline.kind != TaskKind::Pipeline {
            return None;
        }
        let mut stages = self.registry.list(&TaskFilter {
            parent: Some(id),
            ..Default::default()
        });
        stages.sort_by_key(|t| stage_order(t.kind));
        Some(PipelineSnapshot { pipeline, stages })
    }

    /// Pipelines currently in the running state
    pub fn active_pipelines(&self) -> Vec<PipelineSnapshot> {
        self.registry
            .list(&TaskFilter {
                kind: Some(TaskKind::Pipeline),
                state: Some(TaskState::Running),
                ..Default::default()
            })
            .into_iter()
            .filter_map(|t| self.snapshot(t.id))
            .collect()
    }

    /// Finished pipelines, optionally bounded to those created since `since`
    pub fn history(&self, since: Option<DateTime<Utc>>) -> Vec<PipelineSnapshot> {
        self.registry
            .list(&TaskFilter {
                kind: Some(TaskKind::Pipeline),
                since,
                ..Default::default()
            })
            .into_iter()
            .filter(|t| t.state.is_terminal())
            .filter_map(|t| self.snapshot(t.id))
            .collect()
    }

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            pipelines_submitted: self.counters.submitted.load(Ordering::Relaxed),
            pipelines_succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            pipelines_failed: self.counters.failed.load(Ordering::Relaxed),
            pipelines_cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            items_scraped: self.counters.items_scraped.load(Ordering::Relaxed),
            items_persisted: self.counters.items_persisted.load(Ordering::Relaxed),
            alerts_raised: self.counters.alerts_raised.load(Ordering::Relaxed),
            active_pipelines: self.active.len() as u64,
        }
    }

    /// Cancel everything still active; used on shutdown
    pub fn cancel_all(&self) {
        for entry in self.active.iter() {
            entry.value().cancel();
        }
    }

    async fn run(self: Arc<Self>, ids: PipelineIds, request: PipelineRequest, token: CancellationToken) {
        // bounded pipeline parallelism; cancellation also applies while queued
        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            permit = Arc::clone(&self.semaphore).acquire_owned() => permit.ok(),
        };
        let _permit = match permit {
            Some(p) => p,
            None => {
                self.finish_cancelled(&ids);
                return;
            }
        };

        self.registry
            .update(ids.pipeline, |t| t.state = TaskState::Running);

        let mut data = StageData::default();
        let mut failure: Option<String> = None;
        let mut cancelled = false;

        for (stage, stage_id) in &ids.stages {
            if token.is_cancelled() {
                cancelled = true;
                break;
            }
            self.registry
                .update(*stage_id, |t| t.state = TaskState::Running);
            debug!(pipeline_id = %ids.pipeline, stage = ?stage, "stage started");

            let end = match stage {
                StageKind::Scrape => {
                    self.stage_scrape(&ids, *stage_id, &request, &token, &mut data)
                        .await
                }
                StageKind::Process => self.stage_process(*stage_id, &token, &mut data).await,
                StageKind::Clean => self.stage_clean(*stage_id, &token, &mut data).await,
                StageKind::Persist => {
                    self.stage_persist(*stage_id, request.enable_alerts, &token, &mut data)
                        .await
                }
            };

            match end {
                StageEnd::Done => {
                    self.registry.update(*stage_id, |t| {
                        t.state = TaskState::Succeeded;
                        t.progress = 100;
                    });
                }
                StageEnd::Failed { error, fatal } => {
                    warn!(pipeline_id = %ids.pipeline, stage = ?stage, fatal, error = %error, "stage failed");
                    let stage_error = error.clone();
                    self.registry.update(*stage_id, |t| {
                        t.state = TaskState::Failed;
                        t.error = Some(stage_error);
                    });
                    if fatal {
                        failure = Some(error);
                        break;
                    }
                }
                StageEnd::Cancelled => {
                    self.registry
                        .update(*stage_id, |t| t.state = TaskState::Cancelled);
                    cancelled = true;
                    break;
                }
            }
            self.refresh_pipeline_progress(&ids);
        }

        // stages never reached stay pending until the pipeline closes them
        for (_, stage_id) in &ids.stages {
            if let Some(task) = self.registry.get(*stage_id) {
                if !task.state.is_terminal() {
                    self.registry
                        .update(*stage_id, |t| t.state = TaskState::Cancelled);
                }
            }
        }

        if let Some(spool) = &data.spool {
            spool.remove().await;
        }

        if cancelled || token.is_cancelled() {
            self.finish_cancelled(&ids);
        } else if let Some(error) = failure {
            self.registry.update(ids.pipeline, |t| {
                t.state = TaskState::Failed;
                t.error = Some(error);
            });
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            self.active.remove(&ids.pipeline);
            info!(pipeline_id = %ids.pipeline, "pipeline failed");
        } else {
            self.registry.update(ids.pipeline, |t| {
                t.state = TaskState::Succeeded;
                t.progress = 100;
            });
            self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
            self.active.remove(&ids.pipeline);
            info!(pipeline_id = %ids.pipeline, "pipeline succeeded");
        }
    }

    fn finish_cancelled(&self, ids: &PipelineIds) {
        for (_, stage_id) in &ids.stages {
            if let Some(task) = self.registry.get(*stage_id) {
                if !task.state.is_terminal() {
                    self.registry
                        .update(*stage_id, |t| t.state = TaskState::Cancelled);
                }
            }
        }
        self.registry
            .update(ids.pipeline, |t| t.state = TaskState::Cancelled);
        self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        self.active.remove(&ids.pipeline);
        info!(pipeline_id = %ids.pipeline, "pipeline cancelled");
    }

    async fn stage_scrape(
        &self,
        ids: &PipelineIds,
        stage_id: TaskId,
        request: &PipelineRequest,
        token: &CancellationToken,
        data: &mut StageData,
    ) -> StageEnd {
        let params = request.source_params.clone();
        let expected = (params.post_limit as usize)
            .saturating_mul(1 + params.comment_limit_per_post as usize)
            .max(1);

        let mut writer = match SpoolWriter::create(&self.config.spool_dir, ids.pipeline).await {
            Ok(w) => w,
            Err(e) => {
                return StageEnd::Failed {
                    error: e.to_string(),
                    fatal: true,
                }
            }
        };

        let mut stream = self.source.fetch(params);
        loop {
            let item = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    writer.discard().await;
                    return StageEnd::Cancelled;
                }
                item = stream.next() => item,
            };
            let Some(item) = item else { break };
            if let Err(e) = writer.append(&item).await {
                writer.discard().await;
                return StageEnd::Failed {
                    error: e.to_string(),
                    fatal: true,
                };
            }
            let progress = (writer.count() * 100 / expected).min(99) as u8;
            self.registry.update(stage_id, |t| t.progress = progress);
        }

        let upstream_error = stream.take_error();
        let handle = match writer.finish().await {
            Ok(h) => h,
            Err(e) => {
                return StageEnd::Failed {
                    error: e.to_string(),
                    fatal: true,
                }
            }
        };
        let count = handle.count();
        self.counters
            .items_scraped
            .fetch_add(count as u64, Ordering::Relaxed);
        data.spool = Some(handle);

        match upstream_error {
            // a partial batch still flows downstream; an empty one cannot
            Some(e) => StageEnd::Failed {
                error: format!("source ended early after {} items: {}", count, e),
                fatal: count == 0,
            },
            None => StageEnd::Done,
        }
    }

    async fn stage_process(
        &self,
        stage_id: TaskId,
        token: &CancellationToken,
        data: &mut StageData,
    ) -> StageEnd {
        let lines = match &data.spool {
            Some(spool) => match spool.lines().await {
                Ok(lines) => lines,
                Err(e) => {
                    return StageEnd::Failed {
                        error: e.to_string(),
                        fatal: true,
                    }
                }
            },
            None => Vec::new(),
        };

        let total = lines.len().max(1);
        let mut items = Vec::with_capacity(lines.len());
        let mut skipped = 0usize;
        for (i, line) in lines.iter().enumerate() {
            if token.is_cancelled() {
                return StageEnd::Cancelled;
            }
            match serde_json::from_str::<RawItem>(line) {
                Ok(raw) => items.push(normalize_item(raw)),
                Err(e) => {
                    debug!(error = %e, "skipping malformed spool line");
                    skipped += 1;
                }
            }
            let progress = ((i + 1) * 100 / total).min(99) as u8;
            self.registry.update(stage_id, |t| t.progress = progress);
        }

        if skipped > 0 {
            warn!(skipped, "items dropped during processing");
        }
        if items.is_empty() && !lines.is_empty() {
            return StageEnd::Failed {
                error: format!("all {} items failed to process", lines.len()),
                fatal: true,
            };
        }
        data.items = items;
        StageEnd::Done
    }

    async fn stage_clean(
        &self,
        _stage_id: TaskId,
        token: &CancellationToken,
        data: &mut StageData,
    ) -> StageEnd {
        if token.is_cancelled() {
            return StageEnd::Cancelled;
        }
        let before = data.items.len();
        let mut seen: HashSet<TextHash> = HashSet::with_capacity(before);
        data.items.retain(|item| seen.insert(item.text_hash));
        if before > data.items.len() {
            debug!(removed = before - data.items.len(), "deduplicated batch");
        }
        StageEnd::Done
    }

    async fn stage_persist(
        &self,
        stage_id: TaskId,
        enable_alerts: bool,
        token: &CancellationToken,
        data: &mut StageData,
    ) -> StageEnd {
        let items = std::mem::take(&mut data.items);
        let total = items.len();
        if total == 0 {
            return StageEnd::Done;
        }

        let mut join: JoinSet<ItemOutcome> = JoinSet::new();
        let mut completed = 0usize;
        let mut consecutive_store_failures = 0u32;
        let mut cancelled = false;
        let mut fatal: Option<String> = None;

        let tally = |outcome: std::result::Result<ItemOutcome, tokio::task::JoinError>,
                         completed: &mut usize,
                         consecutive: &mut u32| {
            *completed += 1;
            match outcome {
                Ok(ItemOutcome::Stored { inserted, alerts }) => {
                    *consecutive = 0;
                    if inserted {
                        self.counters.items_persisted.fetch_add(1, Ordering::Relaxed);
                    }
                    self.counters.alerts_raised.fetch_add(alerts, Ordering::Relaxed);
                }
                Ok(ItemOutcome::StoreFailed) => *consecutive += 1,
                Ok(ItemOutcome::Discarded) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    error!(error = %e, "persist worker crashed");
                }
            }
            let progress = (*completed * 100 / total).min(99) as u8;
            self.registry.update(stage_id, |t| t.progress = progress);
        };

        for item in items {
            if token.is_cancelled() {
                cancelled = true;
                break;
            }
            // bound in-flight classification calls to the fan-out limit
            while join.len() >= self.config.persist_fanout {
                if let Some(outcome) = join.join_next().await {
                    tally(outcome, &mut completed, &mut consecutive_store_failures);
                    if consecutive_store_failures >= self.config.store_failure_threshold {
                        fatal = Some(format!(
                            "store unavailable: {} consecutive write failures",
                            consecutive_store_failures
                        ));
                        break;
                    }
                }
            }
            if fatal.is_some() {
                break;
            }

            let dispatcher = Arc::clone(&self.dispatcher);
            let store = Arc::clone(&self.store);
            let rules = Arc::clone(&self.rules);
            let token = token.clone();
            join.spawn(async move {
                persist_item(item, dispatcher, store, rules, enable_alerts, token).await
            });
        }

        if fatal.is_some() || cancelled {
            // discarded results are never read; abort at the transport layer
            join.abort_all();
        }
        while let Some(outcome) = join.join_next().await {
            tally(outcome, &mut completed, &mut consecutive_store_failures);
            if fatal.is_none()
                && consecutive_store_failures >= self.config.store_failure_threshold
            {
                fatal = Some(format!(
                    "store unavailable: {} consecutive write failures",
                    consecutive_store_failures
                ));
                join.abort_all();
            }
        }

        if let Some(error) = fatal {
            StageEnd::Failed { error, fatal: true }
        } else if cancelled {
            StageEnd::Cancelled
        } else {
            StageEnd::Done
        }
    }

    fn refresh_pipeline_progress(&self, ids: &PipelineIds) {
        let mut sum = 0u32;
        let mut count = 0u32;
        for (_, stage_id) in &ids.stages {
            if let Some(task) = self.registry.get(*stage_id) {
                sum += task.progress as u32;
                count += 1;
            }
        }
        if count > 0 {
            let progress = (sum / count) as u8;
            self.registry.update(ids.pipeline, |t| t.progress = progress);
        }
    }
}

async fn persist_item(
    item: NormalizedItem,
    dispatcher: Arc<FailsafeDispatcher>,
    store: Arc<ResultStore>,
    rules: Arc<RuleSet>,
    enable_alerts: bool,
    token: CancellationToken,
) -> ItemOutcome {
    let verdict = dispatcher.predict(&item.text, None).await;
    // an in-flight result is discarded once the pipeline is cancelled
    if token.is_cancelled() {
        return ItemOutcome::Discarded;
    }
    let classification = Classification {
        item,
        verdict,
        stored_at: Utc::now(),
    };
    match store.store_classification(&classification).await {
        Ok(outcome) => {
            let mut alerts = 0u64;
            if outcome.inserted && enable_alerts {
                for alert in rules.evaluate(&classification) {
                    match store.store_alert(&alert).await {
                        Ok(_) => alerts += 1,
                        Err(e) => warn!(error = %e, "alert write failed"),
                    }
                }
            }
            ItemOutcome::Stored {
                inserted: outcome.inserted,
                alerts,
            }
        }
        Err(e) => {
            warn!(error = %e, content_id = %classification.item.raw.id, "classification write failed");
            ItemOutcome::StoreFailed
        }
    }
}

fn validate_request(request: &PipelineRequest) -> Result<()> {
    if request.source_params.subreddit.trim().is_empty() {
        return Err(Error::Validation("subreddit must not be empty".into()));
    }
    if request.source_params.post_limit == 0 {
        return Err(Error::Validation("post_limit must be >= 1".into()));
    }
    if request.stages.is_empty() {
        return Err(Error::Validation("stages must not be empty".into()));
    }
    let mut last = None;
    for stage in &request.stages {
        let order = stage_order(TaskKind::from(*stage));
        if let Some(prev) = last {
            if order == prev {
                return Err(Error::Validation(format!("duplicate stage {:?}", stage)));
            }
            if order < prev {
                return Err(Error::Validation(
                    "stages must follow scrape, process, clean, persist order".into(),
                ));
            }
        }
        last = Some(order);
    }
    Ok(())
}

fn stage_order(kind: TaskKind) -> usize {
    match kind {
        TaskKind::Scrape => 0,
        TaskKind::Process => 1,
        TaskKind::Clean => 2,
        TaskKind::Persist => 3,
        TaskKind::Pipeline => 4,
    }
}
