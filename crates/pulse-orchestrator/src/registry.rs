//! In-process task registry
//!
//! Thread-safe map of task state with filterable listing and TTL eviction.
//! State transitions are monotonic: pending -> running -> terminal, with no
//! way out of a terminal state; updates that would violate this are dropped.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use pulse_common::{Task, TaskId, TaskKind, TaskState};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Filter for task listing; all populated fields must match
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub state: Option<TaskState>,
    pub kind: Option<TaskKind>,
    pub parent: Option<TaskId>,
    pub since: Option<DateTime<Utc>>,
}

/// Thread-safe task map with TTL eviction
pub struct TaskRegistry {
    tasks: DashMap<TaskId, Task>,
    ttl: Duration,
}

impl TaskRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tasks: DashMap::new(),
            ttl,
        }
    }

    /// Create a pending task and return its initial snapshot
    pub fn create(&self, kind: TaskKind, parent: Option<TaskId>) -> Task {
        let task = Task {
            id: Uuid::new_v4(),
            kind,
            state: TaskState::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            progress: 0,
            parent_id: parent,
            error: None,
        };
        self.tasks.insert(task.id, task.clone());
        debug!(task_id = %task.id, kind = ?kind, "task created");
        task
    }

    /// Apply a mutation under the entry lock; the mutator observes a
    /// snapshot and the registry accepts or rejects the resulting state.
    /// Returns the task as stored after the call, or `None` if unknown.
    pub fn update<F>(&self, id: TaskId, mutate: F) -> Option<Task>
    where
        F: FnOnce(&mut Task),
    {
        let mut entry = self.tasks.get_mut(&id)?;
        let mut candidate = entry.value().clone();
        mutate(&mut candidate);

        if !transition_allowed(entry.state, candidate.state) {
            warn!(
                task_id = %id,
                from = ?entry.state,
                to = ?candidate.state,
                "rejected illegal task state transition"
            );
            return Some(entry.value().clone());
        }

        if candidate.state == TaskState::Running && candidate.started_at.is_none() {
            candidate.started_at = Some(Utc::now());
        }
        if candidate.state.is_terminal() && candidate.finished_at.is_none() {
            candidate.finished_at = Some(Utc::now());
        }
        // progress never moves backwards while the task is live
        if candidate.progress < entry.progress {
            candidate.progress = entry.progress;
        }

        *entry = candidate.clone();
        Some(candidate)
    }

    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.tasks.get(&id).map(|t| t.value().clone())
    }

    /// Snapshot of matching tasks, newest first
    pub fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|t| filter.state.map_or(true, |s| t.state == s))
            .filter(|t| filter.kind.map_or(true, |k| t.kind == k))
            .filter(|t| filter.parent.map_or(true, |p| t.parent_id == Some(p)))
            .filter(|t| filter.since.map_or(true, |s| t.created_at >= s))
            .map(|t| t.value().clone())
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    /// Evict tasks whose TTL past `finished_at` has elapsed. Live tasks are
    /// never evicted. Returns how many entries were removed.
    pub fn reap(&self, now: DateTime<Utc>) -> usize {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::hours(24));
        let expired: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|t| {
                t.finished_at
                    .map(|f| f + ttl < now)
                    .unwrap_or(false)
            })
            .map(|t| t.id)
            .collect();
        for id in &expired {
            self.tasks.remove(id);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "reaped expired tasks");
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Spawn the periodic eviction loop
    pub fn start_reaper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                registry.reap(Utc::now());
            }
        })
    }
}

fn transition_allowed(from: TaskState, to: TaskState) -> bool {
    if from == to {
        return true;
    }
    match from {
        TaskState::Pending => true,
        TaskState::Running => to.is_terminal(),
        // no way out of a terminal state
        TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TaskRegistry {
        TaskRegistry::new(Duration::from_secs(24 * 3600))
    }

    #[test]
    fn create_starts_pending_with_zero_progress() {
        let r = registry();
        let t = r.create(TaskKind::Pipeline, None);
        assert_eq!(t.state, TaskState::Pending);
        assert_eq!(t.progress, 0);
        assert!(t.started_at.is_none());
        assert_eq!(r.get(t.id).unwrap().id, t.id);
    }

    #[test]
    fn running_sets_started_at_and_terminal_sets_finished_at() {
        let r = registry();
        let t = r.create(TaskKind::Scrape, None);

        let t = r.update(t.id, |t| t.state = TaskState::Running).unwrap();
        assert!(t.started_at.is_some());
        assert!(t.finished_at.is_none());

        let t = r.update(t.id, |t| t.state = TaskState::Succeeded).unwrap();
        assert!(t.finished_at.is_some());
    }

    #[test]
    fn terminal_states_are_sticky() {
        let r = registry();
        let t = r.create(TaskKind::Persist, None);
        r.update(t.id, |t| t.state = TaskState::Running);
        r.update(t.id, |t| t.state = TaskState::Cancelled);

        let after = r
            .update(t.id, |t| t.state = TaskState::Running)
            .unwrap();
        assert_eq!(after.state, TaskState::Cancelled);

        let after = r
            .update(t.id, |t| t.state = TaskState::Succeeded)
            .unwrap();
        assert_eq!(after.state, TaskState::Cancelled);
    }

    #[test]
    fn running_cannot_return_to_pending() {
        let r = registry();
        let t = r.create(TaskKind::Clean, None);
        r.update(t.id, |t| t.state = TaskState::Running);
        let after = r.update(t.id, |t| t.state = TaskState::Pending).unwrap();
        assert_eq!(after.state, TaskState::Running);
    }

    #[test]
    fn progress_is_monotonic() {
        let r = registry();
        let t = r.create(TaskKind::Process, None);
        r.update(t.id, |t| {
            t.state = TaskState::Running;
            t.progress = 60;
        });
        let after = r.update(t.id, |t| t.progress = 30).unwrap();
        assert_eq!(after.progress, 60);
        let after = r.update(t.id, |t| t.progress = 80).unwrap();
        assert_eq!(after.progress, 80);
    }

    #[test]
    fn list_filters_and_orders_newest_first() {
        let r = registry();
        let parent = r.create(TaskKind::Pipeline, None);
        let a = r.create(TaskKind::Scrape, Some(parent.id));
        let b = r.create(TaskKind::Persist, Some(parent.id));
        r.create(TaskKind::Scrape, None);

        let children = r.list(&TaskFilter {
            parent: Some(parent.id),
            ..Default::default()
        });
        assert_eq!(children.len(), 2);
        let ids: Vec<TaskId> = children.iter().map(|t| t.id).collect();
        assert!(ids.contains(&a.id) && ids.contains(&b.id));

        let pipelines = r.list(&TaskFilter {
            kind: Some(TaskKind::Pipeline),
            ..Default::default()
        });
        assert_eq!(pipelines.len(), 1);

        for pair in r.list(&TaskFilter::default()).windows(2) {
            assert!(pair[0].created_at >= pair[1].created_at);
        }
    }

    #[test]
    fn reap_evicts_only_expired_finished_tasks() {
        let r = TaskRegistry::new(Duration::from_secs(3600));
        let done = r.create(TaskKind::Pipeline, None);
        r.update(done.id, |t| t.state = TaskState::Running);
        r.update(done.id, |t| t.state = TaskState::Succeeded);
        let live = r.create(TaskKind::Pipeline, None);
        r.update(live.id, |t| t.state = TaskState::Running);

        // nothing is old enough yet
        assert_eq!(r.reap(Utc::now()), 0);

        // two hours later the finished task is past its TTL
        let later = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(r.reap(later), 1);
        assert!(r.get(done.id).is_none());
        assert!(r.get(live.id).is_some());

        // running tasks survive any amount of time
        let much_later = Utc::now() + chrono::Duration::days(30);
        assert_eq!(r.reap(much_later), 0);
        assert!(r.get(live.id).is_some());
    }
}
