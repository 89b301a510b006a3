//! Integration tests for the consumption loop
//!
//! Every test runs a real `Consumer` against `InMemoryBroker` with a scripted
//! executor, so no beanstalkd or HTTP server is needed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

use bns_broker::{BrokerError, BrokerOp, InMemoryBroker, JobState};
use bns_worker::{
    AdmissionGate, Consumer, ConsumerConfig, ConsumerError, ConsumerReport, FetchError,
    FetchResponse, TaskExecutor,
};

const TUBE: &str = "jobs";
const UNLIMITED: usize = 1 << 20;

/// Executor that records URLs and holds each fetch until released
struct ScriptedExecutor {
    calls: Mutex<Vec<String>>,
    release: Semaphore,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fail: bool,
}

impl ScriptedExecutor {
    fn build(fail: bool, released: usize) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            release: Semaphore::new(released),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            fail,
        })
    }

    /// Fetches complete immediately with 200
    fn instant() -> Arc<Self> {
        Self::build(false, UNLIMITED)
    }

    /// Fetches wait for `release_fetches`
    fn hanging() -> Arc<Self> {
        Self::build(false, 0)
    }

    /// Fetches complete immediately with a transport error
    fn failing() -> Arc<Self> {
        Self::build(true, UNLIMITED)
    }

    fn release_fetches(&self, n: usize) {
        self.release.add_permits(n);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn fetch(&self, url: &str) -> Result<FetchResponse, FetchError> {
        self.calls.lock().unwrap().push(url.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Ok(permit) = self.release.acquire().await {
            permit.forget();
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail {
            return Err(FetchError::Failed("connection refused".into()));
        }
        Ok(FetchResponse {
            status: 200,
            latency: Duration::from_millis(1),
            body: b"ok".to_vec(),
        })
    }
}

struct Running {
    handle: JoinHandle<Result<ConsumerReport, ConsumerError>>,
    shutdown_tx: watch::Sender<bool>,
    gate: Arc<AdmissionGate>,
}

impl Running {
    async fn stop(self) -> Result<ConsumerReport, ConsumerError> {
        self.shutdown_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("consumer did not stop")
            .unwrap()
    }
}

fn config(concurrency: usize) -> ConsumerConfig {
    ConsumerConfig::new(TUBE)
        .with_concurrency(concurrency)
        .with_reserve_timeout(Duration::from_millis(50))
        .with_shutdown_timeout(Duration::from_secs(2))
}

fn start(broker: &InMemoryBroker, executor: Arc<ScriptedExecutor>, config: ConsumerConfig) -> Running {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer = Consumer::new(broker.connect(), executor, config, shutdown_rx).unwrap();
    let gate = consumer.gate();
    Running {
        handle: tokio::spawn(consumer.run()),
        shutdown_tx,
        gate,
    }
}

/// Poll `condition` until it holds, failing after five seconds
async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[test_log::test(tokio::test)]
async fn test_malformed_payloads_are_buried_not_dispatched() {
    let broker = InMemoryBroker::new();
    let empty = broker.seed(TUBE, "");
    let not_url = broker.seed(TUBE, "not-a-url");
    let good = broker.seed(TUBE, "http://x/y");
    let executor = ScriptedExecutor::instant();

    let running = start(&broker, executor.clone(), config(4));
    eventually("dispatch", || executor.calls().len() == 1).await;
    eventually("delete", || broker.job_state(good).is_none()).await;

    let report = running.stop().await.unwrap();
    assert_eq!(report.reserved, 3);
    assert_eq!(report.buried, 2);
    assert_eq!(report.dispatched, 1);
    assert_eq!(executor.calls(), vec!["http://x/y"]);

    assert_eq!(broker.job_state(empty), Some(JobState::Buried));
    assert_eq!(broker.job_state(not_url), Some(JobState::Buried));
    let history = broker.history();
    assert!(history.contains(&BrokerOp::Buried { id: empty, priority: 99 }));
    assert!(history.contains(&BrokerOp::Buried { id: not_url, priority: 99 }));
    assert!(!history.contains(&BrokerOp::Deleted(empty)));
    assert!(!history.contains(&BrokerOp::Deleted(not_url)));
}

#[tokio::test]
async fn test_jobs_in_other_tubes_are_ignored() {
    let broker = InMemoryBroker::new();
    let elsewhere = broker.seed("other", "http://elsewhere");
    let default = broker.seed(bns_broker::DEFAULT_TUBE, "http://default");
    let mine = broker.seed(TUBE, "http://mine");
    let executor = ScriptedExecutor::instant();

    let running = start(&broker, executor.clone(), config(4));
    eventually("delete", || broker.job_state(mine).is_none()).await;
    running.stop().await.unwrap();

    assert_eq!(executor.calls(), vec!["http://mine"]);
    assert_eq!(broker.job_state(elsewhere), Some(JobState::Ready));
    assert_eq!(broker.job_state(default), Some(JobState::Ready));
}

#[tokio::test]
async fn test_in_flight_fetches_never_exceed_capacity() {
    let broker = InMemoryBroker::new();
    for i in 0..5 {
        broker.seed(TUBE, format!("http://host/{i}"));
    }
    let executor = ScriptedExecutor::hanging();

    let running = start(&broker, executor.clone(), config(2));
    eventually("two fetches", || executor.in_flight() == 2).await;
    // Third job is reserved and waiting for a token; the rest stay ready
    eventually("held job", || broker.count(JobState::Reserved) == 1).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(executor.in_flight(), 2);
    assert_eq!(executor.calls().len(), 2);
    assert_eq!(running.gate.outstanding(), 2);
    assert_eq!(broker.count(JobState::Ready), 2);

    executor.release_fetches(5);
    eventually("all fetches", || executor.calls().len() == 5).await;
    eventually("tokens returned", || running.gate.outstanding() == 0).await;

    let report = running.stop().await.unwrap();
    assert_eq!(report.dispatched, 5);
    assert!(executor.max_in_flight() <= 2);
    assert_eq!(broker.count(JobState::Ready), 0);
    assert_eq!(broker.count(JobState::Reserved), 0);
}

#[tokio::test]
async fn test_failed_fetch_is_not_retried() {
    let broker = InMemoryBroker::new();
    let id = broker.seed(TUBE, "http://unreachable/");
    let executor = ScriptedExecutor::failing();

    let running = start(&broker, executor.clone(), config(2));
    eventually("dispatch", || executor.calls().len() == 1).await;
    eventually("delete", || broker.job_state(id).is_none()).await;

    // Several reserve rounds pass without the job coming back
    tokio::time::sleep(Duration::from_millis(200)).await;
    // The failed fetch returned its token while the loop is still running
    assert_eq!(running.gate.outstanding(), 0);
    assert_eq!(running.gate.available(), 2);
    let report = running.stop().await.unwrap();

    assert_eq!(executor.calls().len(), 1);
    assert_eq!(report.reserved, 1);
    assert!(broker.history().contains(&BrokerOp::Deleted(id)));
}

#[tokio::test]
async fn test_reserve_timeouts_keep_loop_alive() {
    let broker = InMemoryBroker::new();
    let executor = ScriptedExecutor::instant();

    let running = start(&broker, executor.clone(), config(2));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!running.handle.is_finished());

    broker.seed(TUBE, "http://late/");
    eventually("late dispatch", || executor.calls().len() == 1).await;

    let report = running.stop().await.unwrap();
    assert!(report.timeouts >= 1);
    assert_eq!(report.dispatched, 1);
}

#[tokio::test]
async fn test_deadline_soon_is_transient() {
    let broker = InMemoryBroker::new();
    broker.fail_next_reserve(BrokerError::DeadlineSoon);
    broker.seed(TUBE, "http://after-deadline/");
    let executor = ScriptedExecutor::instant();

    let running = start(&broker, executor.clone(), config(2));
    eventually("dispatch", || executor.calls().len() == 1).await;

    let report = running.stop().await.unwrap();
    assert!(report.timeouts >= 1);
    assert_eq!(report.dispatched, 1);
}

#[tokio::test]
async fn test_reserve_failure_is_fatal() {
    let broker = InMemoryBroker::new();
    broker.fail_next_reserve(BrokerError::ConnectionClosed);
    let executor = ScriptedExecutor::instant();

    let running = start(&broker, executor.clone(), config(2));
    let result = tokio::time::timeout(Duration::from_secs(5), running.handle)
        .await
        .expect("consumer did not stop")
        .unwrap();

    let err = result.unwrap_err();
    assert!(matches!(
        err,
        ConsumerError::Broker {
            operation: "reserve",
            error: BrokerError::ConnectionClosed,
            ..
        }
    ));
    assert!(err.to_string().contains("(Consumer::reserve_loop): reserve: "));
    assert!(executor.calls().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_mixed_jobs_single_token() {
    let broker = InMemoryBroker::new();
    let a = broker.seed(TUBE, "http://a");
    let empty = broker.seed(TUBE, "");
    let b = broker.seed(TUBE, "http://b");
    let executor = ScriptedExecutor::instant();

    let running = start(&broker, executor.clone(), config(1));
    eventually("both dispatched", || executor.calls().len() == 2).await;
    eventually("both deleted", || {
        broker.job_state(a).is_none() && broker.job_state(b).is_none()
    })
    .await;

    let gate = running.gate.clone();
    let report = running.stop().await.unwrap();

    assert_eq!(executor.calls(), vec!["http://a", "http://b"]);
    assert_eq!(broker.job_state(empty), Some(JobState::Buried));
    assert_eq!(
        report,
        ConsumerReport {
            reserved: 3,
            dispatched: 2,
            buried: 1,
            timeouts: report.timeouts,
            released: 0,
        }
    );
    assert_eq!(gate.outstanding(), 0);
    assert!(gate.is_closed());
}

#[tokio::test]
async fn test_shutdown_releases_held_job() {
    let broker = InMemoryBroker::new();
    let first = broker.seed(TUBE, "http://first");
    let held = broker.seed(TUBE, "http://held");
    let executor = ScriptedExecutor::hanging();

    let running = start(&broker, executor.clone(), config(1));
    eventually("first fetch", || executor.in_flight() == 1).await;
    eventually("held job", || broker.job_state(held) == Some(JobState::Reserved)).await;

    running.shutdown_tx.send_replace(true);
    eventually("release", || broker.job_state(held) == Some(JobState::Ready)).await;
    executor.release_fetches(1);

    let report = running.stop().await.unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.released, 1);
    assert_eq!(executor.calls(), vec!["http://first"]);
    assert_eq!(broker.job_state(first), None);
    assert!(broker.history().contains(&BrokerOp::Released(held)));
}

#[tokio::test]
async fn test_shutdown_gives_up_on_stuck_fetches() {
    let broker = InMemoryBroker::new();
    broker.seed(TUBE, "http://stuck");
    let executor = ScriptedExecutor::hanging();

    let running = start(
        &broker,
        executor.clone(),
        config(2).with_shutdown_timeout(Duration::from_millis(100)),
    );
    eventually("fetch", || executor.in_flight() == 1).await;

    let err = running.stop().await.unwrap_err();
    assert!(matches!(err, ConsumerError::ShutdownTimeout { outstanding: 1 }));
}

#[tokio::test]
async fn test_zero_concurrency_is_clamped() {
    let broker = InMemoryBroker::new();
    let (_tx, rx) = watch::channel(false);
    let consumer = Consumer::new(
        broker.connect(),
        ScriptedExecutor::instant(),
        ConsumerConfig::new(TUBE).with_concurrency(0),
        rx,
    )
    .unwrap();

    assert_eq!(consumer.gate().capacity(), 1);
}
