//! Admission behavior of the rate limiter against the in-process store.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

use taskgate::clock::{Clock, ManualClock};
use taskgate::identity::CallerIdentity;
use taskgate::ratelimit::{
    AdmissionEvaluator, CounterSnapshot, CounterStore, FailureMode, MemoryCounterStore,
    PolicyRegistry, PolicyRule, RateLimiter, StoreError,
};

const OP: &str = "tasks.create";

fn limiter_with(clock: &ManualClock, max_requests: i64, window_seconds: i64) -> RateLimiter {
    let mut policies = PolicyRegistry::new();
    policies
        .register_rule(OP, PolicyRule::new(max_requests, window_seconds))
        .unwrap();

    let clock: Arc<dyn Clock> = Arc::new(clock.clone());
    let store = Arc::new(MemoryCounterStore::with_clock(clock.clone()));
    RateLimiter::new(policies, AdmissionEvaluator::new(store, clock))
}

fn caller(id: &str) -> CallerIdentity {
    CallerIdentity::new(id).unwrap()
}

#[tokio::test]
async fn test_documented_scenario() {
    // Window [1000, 1010)
    let clock = ManualClock::at_secs(1_000);
    let limiter = limiter_with(&clock, 5, 10);
    let u1 = caller("u1");

    for expected in 1..=5 {
        let verdict = limiter.check(&u1, OP).await.unwrap();
        assert!(verdict.allowed, "request {} should be allowed", expected);
        assert_eq!(verdict.current_count, expected);
        assert_eq!(verdict.retry_after_seconds, 0);
        clock.advance(Duration::from_secs(1));
    }

    // t = 5
    let verdict = limiter.check(&u1, OP).await.unwrap();
    assert!(!verdict.allowed);
    assert_eq!(verdict.retry_after_seconds, 5);

    // t = 11
    clock.set(Duration::from_secs(1_011));
    let verdict = limiter.check(&u1, OP).await.unwrap();
    assert!(verdict.allowed);
    assert_eq!(verdict.current_count, 1);
}

#[tokio::test]
async fn test_under_quota_always_allowed() {
    let clock = ManualClock::at_secs(50);
    let limiter = limiter_with(&clock, 10, 60);
    let u1 = caller("u1");

    for _ in 0..9 {
        clock.advance(Duration::from_millis(700));
        assert!(limiter.check(&u1, OP).await.unwrap().allowed);
    }
}

#[tokio::test]
async fn test_limit_plus_one() {
    let clock = ManualClock::at_secs(0);
    let limiter = limiter_with(&clock, 3, 30);
    let u1 = caller("u1");

    let verdicts: Vec<_> = {
        let mut out = Vec::new();
        for _ in 0..4 {
            out.push(limiter.check(&u1, OP).await.unwrap());
        }
        out
    };

    assert!(verdicts[..3].iter().all(|v| v.allowed && v.retry_after_seconds == 0));
    assert!(!verdicts[3].allowed);
    assert!(verdicts[3].retry_after_seconds > 0);
}

#[tokio::test]
async fn test_exhausted_window_recovers_after_expiry() {
    let clock = ManualClock::at_secs(0);
    let limiter = limiter_with(&clock, 2, 10);
    let u1 = caller("u1");

    for _ in 0..5 {
        limiter.check(&u1, OP).await;
    }
    assert!(!limiter.check(&u1, OP).await.unwrap().allowed);

    clock.advance(Duration::from_secs(10));
    let verdict = limiter.check(&u1, OP).await.unwrap();
    assert!(verdict.allowed);
    assert_eq!(verdict.current_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_admit_exactly_quota() {
    const N: usize = 64;
    const MAX: i64 = 10;

    let clock = ManualClock::at_secs(5_000);
    let limiter = Arc::new(limiter_with(&clock, MAX, 60));

    let handles: Vec<_> = (0..N)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.check(&caller("burst"), OP).await.unwrap() })
        })
        .collect();

    let mut allowed = 0;
    let mut counts = Vec::with_capacity(N);
    for handle in handles {
        let verdict = handle.await.unwrap();
        if verdict.allowed {
            allowed += 1;
        }
        counts.push(verdict.current_count);
    }

    assert_eq!(allowed, MAX as usize);
    assert_eq!(N - allowed, N - MAX as usize);

    // No lost increments: every count from 1..=N was observed exactly once.
    counts.sort_unstable();
    assert_eq!(counts, (1..=N as u64).collect::<Vec<_>>());
}

/// Store that is permanently unreachable.
struct OutageStore;

#[async_trait]
impl CounterStore for OutageStore {
    async fn increment(&self, _key: &str, _window: Duration) -> Result<CounterSnapshot, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    fn backend(&self) -> &'static str {
        "outage"
    }
}

fn outage_limiter(mode: FailureMode) -> RateLimiter {
    let mut policies = PolicyRegistry::new();
    policies.register_rule(OP, PolicyRule::new(1, 10)).unwrap();
    let evaluator = AdmissionEvaluator::new(Arc::new(OutageStore), Arc::new(ManualClock::at_secs(0)))
        .with_failure_mode(mode);
    RateLimiter::new(policies, evaluator)
}

#[tokio::test]
async fn test_outage_fail_open_allows_everything() {
    let limiter = outage_limiter(FailureMode::FailOpen);
    let u1 = caller("u1");

    for _ in 0..10 {
        let verdict = limiter.check(&u1, OP).await.unwrap();
        assert!(verdict.allowed);
        assert!(verdict.degraded);
    }
}

#[tokio::test]
async fn test_outage_fail_closed_denies_everything() {
    let limiter = outage_limiter(FailureMode::FailClosed);
    let u1 = caller("u1");

    for _ in 0..3 {
        let verdict = limiter.check(&u1, OP).await.unwrap();
        assert!(!verdict.allowed);
        assert!(verdict.degraded);
        assert!(verdict.retry_after_seconds > 0);
    }
}

/// Captures warnings that carry `degraded = true`.
#[derive(Clone, Default)]
struct DegradedWarnings {
    captured: Arc<Mutex<Vec<String>>>,
}

impl DegradedWarnings {
    fn count(&self) -> usize {
        self.captured.lock().len()
    }
}

#[derive(Default)]
struct DegradedVisitor {
    degraded: bool,
    key: Option<String>,
}

impl Visit for DegradedVisitor {
    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == "degraded" {
            self.degraded = value;
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "key" {
            self.key = Some(format!("{value:?}"));
        }
    }
}

impl<S: Subscriber> Layer<S> for DegradedWarnings {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() != Level::WARN {
            return;
        }
        let mut visitor = DegradedVisitor::default();
        event.record(&mut visitor);
        if visitor.degraded {
            self.captured.lock().push(visitor.key.unwrap_or_default());
        }
    }
}

#[tokio::test]
async fn test_every_outage_request_logs_one_degraded_warning() {
    for mode in [FailureMode::FailOpen, FailureMode::FailClosed] {
        let capture = DegradedWarnings::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(capture.clone()));

        let limiter = outage_limiter(mode);
        let u1 = caller("u1");
        for _ in 0..4 {
            let verdict = limiter.check(&u1, OP).await.unwrap();
            assert!(verdict.degraded);
        }

        assert_eq!(capture.count(), 4, "failure mode {mode:?}");
        assert!(capture
            .captured
            .lock()
            .iter()
            .all(|key| key.contains("tasks.create|u1|")));
    }
}

#[tokio::test]
async fn test_healthy_store_logs_no_degraded_warning() {
    let capture = DegradedWarnings::default();
    let _guard =
        tracing::subscriber::set_default(tracing_subscriber::registry().with(capture.clone()));

    let clock = ManualClock::at_secs(0);
    let limiter = limiter_with(&clock, 1, 10);
    let u1 = caller("u1");
    for _ in 0..3 {
        limiter.check(&u1, OP).await;
    }

    assert_eq!(capture.count(), 0);
}
