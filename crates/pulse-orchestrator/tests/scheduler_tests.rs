//! Scheduler behavior against a live orchestrator

use chrono::Utc;
use pulse_alerts::RuleSet;
use pulse_common::config::PipelineConfig;
use pulse_common::{ItemKind, PipelineRequest, RawItem, SourceParams, StageKind, TaskKind};
use pulse_inference::{FailsafeDispatcher, FailsafeOptions};
use pulse_orchestrator::{Orchestrator, Scheduler, TaskFilter, TaskRegistry};
use pulse_source::MemorySource;
use pulse_store::ResultStore;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn raw_item(id: &str) -> RawItem {
    RawItem {
        id: id.to_string(),
        kind: ItemKind::Post,
        parent_id: None,
        author: None,
        subreddit: "ucla".into(),
        created_at: Utc::now(),
        title: None,
        body: format!("post body {}", id),
        score: None,
        upvote_ratio: None,
    }
}

fn preset() -> PipelineRequest {
    PipelineRequest {
        source_params: SourceParams {
            subreddit: "ucla".into(),
            post_limit: 1000,
            comment_limit_per_post: 0,
            sort: Default::default(),
            time_window: Default::default(),
            query: None,
        },
        stages: StageKind::ALL.to_vec(),
        enable_alerts: true,
    }
}

async fn slow_orchestrator() -> Arc<Orchestrator> {
    let items: Vec<RawItem> = (0..200).map(|i| raw_item(&format!("p{}", i))).collect();
    let source = MemorySource::new(items).with_item_delay(Duration::from_millis(10));
    let registry = Arc::new(TaskRegistry::new(Duration::from_secs(24 * 3600)));
    let dispatcher = Arc::new(FailsafeDispatcher::new(None, FailsafeOptions::default()));
    let store = Arc::new(ResultStore::connect("sqlite::memory:").await.unwrap());
    Arc::new(Orchestrator::new(
        registry,
        Arc::new(source),
        dispatcher,
        store,
        Arc::new(RuleSet::builtin()),
        PipelineConfig {
            max_parallel: 4,
            persist_fanout: 8,
            store_failure_threshold: 10,
            spool_dir: std::env::temp_dir().join(format!("pulse-spool-{}", Uuid::new_v4())),
        },
    ))
}

fn pipeline_count(orchestrator: &Arc<Orchestrator>) -> usize {
    orchestrator
        .registry()
        .list(&TaskFilter {
            kind: Some(TaskKind::Pipeline),
            ..Default::default()
        })
        .len()
}

#[tokio::test]
async fn ticks_skip_while_the_previous_pipeline_is_live() {
    let orchestrator = slow_orchestrator().await;

    // the pipeline takes ~2s; ticks fire every 100ms
    let scheduler = Scheduler::start(
        Arc::clone(&orchestrator),
        Duration::from_millis(100),
        0.0,
        preset(),
    );
    tokio::time::sleep(Duration::from_millis(650)).await;

    // at most one pipeline for this schedule, despite ~6 ticks
    assert_eq!(pipeline_count(&orchestrator), 1);
    assert_eq!(orchestrator.active_pipelines().len(), 1);

    scheduler.shutdown().await;
    orchestrator.cancel_all();
}

#[tokio::test]
async fn paused_scheduler_submits_nothing() {
    let orchestrator = slow_orchestrator().await;
    let scheduler = Scheduler::start(
        Arc::clone(&orchestrator),
        Duration::from_millis(50),
        0.0,
        preset(),
    );
    scheduler.pause().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(pipeline_count(&orchestrator), 0);

    scheduler.resume().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pipeline_count(&orchestrator), 1);

    scheduler.shutdown().await;
    orchestrator.cancel_all();
}

#[tokio::test]
async fn reschedule_changes_the_cadence() {
    let orchestrator = slow_orchestrator().await;
    let scheduler = Scheduler::start(
        Arc::clone(&orchestrator),
        Duration::from_secs(3600),
        0.0,
        preset(),
    );
    // an hour-long interval would never fire within this test
    scheduler.reschedule(Duration::from_millis(50)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(pipeline_count(&orchestrator), 1);

    scheduler.shutdown().await;
    orchestrator.cancel_all();
}
