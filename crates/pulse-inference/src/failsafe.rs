//! Failsafe inference dispatcher
//!
//! Fronts the model service with a circuit breaker and degrades to the
//! lexicon classifier whenever the model path is unavailable, failing or
//! disallowed. `predict` has no error surface: every call returns a verdict.
//!
//! Circuit transitions happen under a short mutex; the actual model call is
//! made outside the critical section. In the half-open phase exactly one
//! probe is in flight at a time; concurrent callers take the fallback path
//! without touching the failure counters.

use crate::lexicon::LexiconClassifier;
use crate::model_client::ModelClient;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use pulse_common::{CircuitPhase, FailsafeSnapshot, SentimentVerdict};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Tuning for the failsafe dispatcher
#[derive(Debug, Clone)]
pub struct FailsafeOptions {
    /// Failures (consecutive, or within the window) that open the circuit
    pub max_failures: u32,
    /// Sliding window for the failure count
    pub window: Duration,
    /// Time the circuit stays open before admitting a probe
    pub cooldown: Duration,
    /// Default per-call deadline for the model service
    pub deadline: Duration,
}

impl Default for FailsafeOptions {
    fn default() -> Self {
        Self {
            max_failures: 3,
            window: Duration::from_secs(300),
            cooldown: Duration::from_secs(60),
            deadline: Duration::from_secs(30),
        }
    }
}

const PHASE_CLOSED: u8 = 0;
const PHASE_OPEN: u8 = 1;
const PHASE_HALF_OPEN: u8 = 2;

struct BreakerInner {
    phase: CircuitPhase,
    consecutive_failures: u32,
    window_failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Circuit breaker guarding the model service
struct CircuitBreaker {
    options: FailsafeOptions,
    inner: Mutex<BreakerInner>,
    // atomic mirrors so snapshots never take the mutex
    phase_tag: AtomicU8,
    consecutive: AtomicU32,
    opened_at_ms: AtomicI64,
    last_failure_ms: AtomicI64,
}

enum Admission {
    /// Model call allowed; `probe` marks the single half-open attempt
    Call { probe: bool },
    Fallback,
}

impl CircuitBreaker {
    fn new(options: FailsafeOptions) -> Self {
        Self {
            options,
            inner: Mutex::new(BreakerInner {
                phase: CircuitPhase::Closed,
                consecutive_failures: 0,
                window_failures: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
            }),
            phase_tag: AtomicU8::new(PHASE_CLOSED),
            consecutive: AtomicU32::new(0),
            opened_at_ms: AtomicI64::new(0),
            last_failure_ms: AtomicI64::new(0),
        }
    }

    fn admit(&self) -> Admission {
        let mut inner = self.inner.lock();
        match inner.phase {
            CircuitPhase::Closed => Admission::Call { probe: false },
            CircuitPhase::Open => {
                let cooled_down = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.options.cooldown)
                    .unwrap_or(true);
                if cooled_down {
                    info!("circuit cooldown elapsed, transitioning to half-open");
                    inner.phase = CircuitPhase::HalfOpen;
                    inner.probe_in_flight = true;
                    self.phase_tag.store(PHASE_HALF_OPEN, Ordering::Relaxed);
                    Admission::Call { probe: true }
                } else {
                    Admission::Fallback
                }
            }
            CircuitPhase::HalfOpen => {
                if inner.probe_in_flight {
                    Admission::Fallback
                } else {
                    inner.probe_in_flight = true;
                    Admission::Call { probe: true }
                }
            }
        }
    }

    fn on_success(&self, probe: bool) {
        let mut inner = self.inner.lock();
        if probe {
            info!("probe succeeded, circuit closed");
            inner.phase = CircuitPhase::Closed;
            inner.probe_in_flight = false;
            inner.opened_at = None;
            inner.window_failures.clear();
            self.phase_tag.store(PHASE_CLOSED, Ordering::Relaxed);
            self.opened_at_ms.store(0, Ordering::Relaxed);
        }
        inner.consecutive_failures = 0;
        self.consecutive.store(0, Ordering::Relaxed);
    }

    fn on_failure(&self, probe: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        inner.window_failures.push_back(now);
        let horizon = self.options.window;
        while inner
            .window_failures
            .front()
            .map(|t| now.duration_since(*t) > horizon)
            .unwrap_or(false)
        {
            inner.window_failures.pop_front();
        }
        inner.consecutive_failures += 1;
        self.consecutive
            .store(inner.consecutive_failures, Ordering::Relaxed);
        self.last_failure_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);

        let trip = if probe {
            warn!("probe failed, circuit re-opened");
            true
        } else if inner.phase == CircuitPhase::Closed {
            inner.consecutive_failures >= self.options.max_failures
                || inner.window_failures.len() as u32 >= self.options.max_failures
        } else {
            false
        };

        if trip {
            if !probe {
                warn!(
                    consecutive = inner.consecutive_failures,
                    windowed = inner.window_failures.len(),
                    "failure threshold crossed, circuit opened"
                );
            }
            inner.phase = CircuitPhase::Open;
            inner.opened_at = Some(now);
            inner.probe_in_flight = false;
            self.phase_tag.store(PHASE_OPEN, Ordering::Relaxed);
            self.opened_at_ms
                .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        }
    }

    fn phase(&self) -> CircuitPhase {
        match self.phase_tag.load(Ordering::Relaxed) {
            PHASE_OPEN => CircuitPhase::Open,
            PHASE_HALF_OPEN => CircuitPhase::HalfOpen,
            _ => CircuitPhase::Closed,
        }
    }
}

/// Always-answering sentiment dispatcher
pub struct FailsafeDispatcher {
    client: Option<Arc<dyn ModelClient>>,
    lexicon: LexiconClassifier,
    breaker: CircuitBreaker,
    total_requests: AtomicU64,
    model_successes: AtomicU64,
    model_failures: AtomicU64,
    fallback_uses: AtomicU64,
}

impl FailsafeDispatcher {
    /// `client = None` (no model service configured) sends every request
    /// down the fallback path without involving the circuit.
    pub fn new(client: Option<Arc<dyn ModelClient>>, options: FailsafeOptions) -> Self {
        Self {
            client,
            lexicon: LexiconClassifier::new(),
            breaker: CircuitBreaker::new(options),
            total_requests: AtomicU64::new(0),
            model_successes: AtomicU64::new(0),
            model_failures: AtomicU64::new(0),
            fallback_uses: AtomicU64::new(0),
        }
    }

    /// Classify with the default deadline
    pub async fn predict(&self, text: &str, model: Option<&str>) -> SentimentVerdict {
        let deadline = self.breaker.options.deadline;
        self.predict_with_deadline(text, model, deadline).await
    }

    /// Classify within `deadline`. Deadline expiry on the model path counts
    /// as a failure for the circuit and falls back immediately.
    pub async fn predict_with_deadline(
        &self,
        text: &str,
        model: Option<&str>,
        deadline: Duration,
    ) -> SentimentVerdict {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        if let Some(client) = &self.client {
            if let Admission::Call { probe } = self.breaker.admit() {
                let outcome =
                    tokio::time::timeout(deadline, client.infer(text, model, deadline)).await;
                match outcome {
                    Ok(Ok(verdict)) => {
                        self.breaker.on_success(probe);
                        self.model_successes.fetch_add(1, Ordering::Relaxed);
                        return verdict;
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, category = e.category(), "model call failed, using fallback");
                        self.breaker.on_failure(probe);
                        self.model_failures.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_) => {
                        warn!(?deadline, "model call exceeded deadline, using fallback");
                        self.breaker.on_failure(probe);
                        self.model_failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
            } else {
                debug!("circuit disallows model call, using fallback");
            }
        }

        self.fallback_uses.fetch_add(1, Ordering::Relaxed);
        self.lexicon.classify(text)
    }

    /// Current phase of the circuit
    pub fn phase(&self) -> CircuitPhase {
        self.breaker.phase()
    }

    /// Counter snapshot; reads only atomics, never blocks predictions
    pub fn snapshot(&self) -> FailsafeSnapshot {
        FailsafeSnapshot {
            phase: self.breaker.phase(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            model_successes: self.model_successes.load(Ordering::Relaxed),
            model_failures: self.model_failures.load(Ordering::Relaxed),
            fallback_uses: self.fallback_uses.load(Ordering::Relaxed),
            consecutive_failures: self.breaker.consecutive.load(Ordering::Relaxed),
            opened_at: millis_to_utc(self.breaker.opened_at_ms.load(Ordering::Relaxed)),
            last_failure_at: millis_to_utc(self.breaker.last_failure_ms.load(Ordering::Relaxed)),
        }
    }
}

fn millis_to_utc(ms: i64) -> Option<DateTime<Utc>> {
    if ms == 0 {
        None
    } else {
        Utc.timestamp_millis_opt(ms).single()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;
    use pulse_common::{Error, Result, SentimentLabel, VerdictSource};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;

    enum Step {
        Ok(f64),
        Err,
        Hang(Duration),
    }

    struct ScriptedClient {
        steps: PlMutex<VecDeque<Step>>,
        calls: AtomicU32,
    }

    impl ScriptedClient {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: PlMutex::new(steps.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedClient {
        async fn infer(
            &self,
            _text: &str,
            _model: Option<&str>,
            _deadline: Duration,
        ) -> Result<SentimentVerdict> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self.steps.lock().pop_front();
            match step {
                Some(Step::Ok(confidence)) => Ok(SentimentVerdict {
                    label: SentimentLabel::Positive,
                    confidence,
                    compound: confidence,
                    model: "distilbert".into(),
                    source: VerdictSource::Model,
                    latency_ms: 1,
                }),
                Some(Step::Hang(d)) => {
                    tokio::time::sleep(d).await;
                    Err(Error::Timeout("hung".into()))
                }
                _ => Err(Error::Network("connection refused".into())),
            }
        }
    }

    fn options(cooldown: Duration) -> FailsafeOptions {
        FailsafeOptions {
            max_failures: 3,
            window: Duration::from_secs(300),
            cooldown,
            deadline: Duration::from_secs(1),
        }
    }

    fn dispatcher(client: Arc<ScriptedClient>, cooldown: Duration) -> FailsafeDispatcher {
        FailsafeDispatcher::new(Some(client), options(cooldown))
    }

    #[tokio::test]
    async fn no_client_means_every_call_is_fallback() {
        let d = FailsafeDispatcher::new(None, FailsafeOptions::default());
        let v = d.predict("neutral statement", None).await;
        assert_eq!(v.source, VerdictSource::Fallback);
        assert_eq!(v.model, "lexicon");
        let snap = d.snapshot();
        assert_eq!(snap.phase, CircuitPhase::Closed);
        assert_eq!(snap.total_requests, 1);
        assert_eq!(snap.fallback_uses, 1);
        assert_eq!(snap.model_successes, 0);
    }

    #[tokio::test]
    async fn model_success_passes_through() {
        let client = ScriptedClient::new(vec![Step::Ok(0.94)]);
        let d = dispatcher(client.clone(), Duration::from_secs(60));
        let v = d.predict("UCLA is amazing for AI research!", None).await;
        assert_eq!(v.source, VerdictSource::Model);
        assert_eq!(v.model, "distilbert");
        assert_eq!(d.snapshot().model_successes, 1);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn circuit_opens_after_threshold_and_skips_the_model() {
        let client = ScriptedClient::new(vec![Step::Err, Step::Err, Step::Err, Step::Err]);
        let d = dispatcher(client.clone(), Duration::from_secs(60));

        for _ in 0..3 {
            let v = d.predict("neutral statement", None).await;
            assert_eq!(v.source, VerdictSource::Fallback);
        }
        let snap = d.snapshot();
        assert_eq!(snap.phase, CircuitPhase::Open);
        assert_eq!(snap.consecutive_failures, 3);
        assert_eq!(snap.model_failures, 3);
        assert!(snap.opened_at.is_some());
        assert!(snap.last_failure_at.is_some());

        // 4th call: circuit open, model client must not be invoked
        let v = d.predict("neutral statement", None).await;
        assert_eq!(v.source, VerdictSource::Fallback);
        assert_eq!(client.calls(), 3);
        assert_eq!(d.snapshot().fallback_uses, 4);
    }

    #[tokio::test]
    async fn windowed_failures_open_the_circuit_despite_interleaved_success() {
        let client = ScriptedClient::new(vec![Step::Err, Step::Ok(0.9), Step::Err, Step::Err]);
        let d = dispatcher(client.clone(), Duration::from_secs(60));

        for _ in 0..4 {
            d.predict("text", None).await;
        }
        // three failures inside the window even though they were not consecutive
        assert_eq!(d.snapshot().phase, CircuitPhase::Open);
        assert_eq!(d.snapshot().consecutive_failures, 2);
    }

    #[tokio::test]
    async fn half_open_probe_success_closes_the_circuit() {
        let client = ScriptedClient::new(vec![Step::Err, Step::Err, Step::Err, Step::Ok(0.9)]);
        let d = dispatcher(client.clone(), Duration::from_millis(40));

        for _ in 0..3 {
            d.predict("text", None).await;
        }
        assert_eq!(d.phase(), CircuitPhase::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;

        let v = d.predict("text", None).await;
        assert_eq!(v.source, VerdictSource::Model);
        let snap = d.snapshot();
        assert_eq!(snap.phase, CircuitPhase::Closed);
        assert_eq!(snap.consecutive_failures, 0);
        assert!(snap.opened_at.is_none());
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens_the_circuit() {
        let client = ScriptedClient::new(vec![Step::Err, Step::Err, Step::Err, Step::Err]);
        let d = dispatcher(client.clone(), Duration::from_millis(40));

        for _ in 0..3 {
            d.predict("text", None).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let v = d.predict("text", None).await;
        assert_eq!(v.source, VerdictSource::Fallback);
        assert_eq!(d.phase(), CircuitPhase::Open);
        assert_eq!(client.calls(), 4);
    }

    #[tokio::test]
    async fn half_open_admits_a_single_probe() {
        let client = ScriptedClient::new(vec![
            Step::Err,
            Step::Err,
            Step::Err,
            Step::Hang(Duration::from_millis(200)),
        ]);
        let d = Arc::new(dispatcher(client.clone(), Duration::from_millis(20)));

        for _ in 0..3 {
            d.predict("text", None).await;
        }
        tokio::time::sleep(Duration::from_millis(40)).await;

        // first caller becomes the probe and hangs; second must fall back fast
        let probe = {
            let d = d.clone();
            tokio::spawn(async move { d.predict("text", None).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let started = Instant::now();
        let v = d.predict("text", None).await;
        assert_eq!(v.source, VerdictSource::Fallback);
        assert!(started.elapsed() < Duration::from_millis(100));
        // the concurrent caller did not reach the model client
        assert_eq!(client.calls(), 4);

        probe.await.unwrap();
    }

    #[tokio::test]
    async fn deadline_expiry_falls_back_and_counts_as_failure() {
        let client = ScriptedClient::new(vec![Step::Hang(Duration::from_secs(10))]);
        let d = dispatcher(client.clone(), Duration::from_secs(60));

        let started = Instant::now();
        let v = d
            .predict_with_deadline("neutral statement", None, Duration::from_millis(50))
            .await;
        assert_eq!(v.source, VerdictSource::Fallback);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(d.snapshot().model_failures, 1);
        assert_eq!(d.snapshot().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn counters_are_monotonic_across_mixed_outcomes() {
        let client = ScriptedClient::new(vec![Step::Ok(0.9), Step::Err, Step::Ok(0.8)]);
        let d = dispatcher(client, Duration::from_secs(60));

        let mut last_total = 0;
        for _ in 0..3 {
            d.predict("text", None).await;
            let snap = d.snapshot();
            assert!(snap.total_requests > last_total);
            last_total = snap.total_requests;
        }
        let snap = d.snapshot();
        assert_eq!(snap.model_successes, 2);
        assert_eq!(snap.model_failures, 1);
        assert_eq!(snap.fallback_uses, 1);
    }
}
