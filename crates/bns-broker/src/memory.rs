//! In-memory implementation of [`Broker`] for testing
//!
//! [`InMemoryBroker`] plays the server: it owns tubes and jobs and is cheap to
//! clone. Each [`InMemoryConnection`] has its own tube selection, like a TCP
//! connection to beanstalkd. Delays and TTR expiry are not simulated: a
//! delayed job is ready immediately and a reserved job stays reserved until
//! it is deleted, buried or released.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::broker::{Broker, DEFAULT_TUBE};
use crate::error::BrokerError;
use crate::job::{Job, JobId};
use crate::protocol::validate_tube_name;
use crate::stats::Stats;

/// Lifecycle state of a job held by the in-memory broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Ready,
    Reserved,
    Buried,
}

/// A mutating operation, recorded in order for assertions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerOp {
    Put(JobId),
    Reserved(JobId),
    Deleted(JobId),
    Buried { id: JobId, priority: u32 },
    Released(JobId),
}

struct JobRecord {
    tube: String,
    payload: Vec<u8>,
    priority: u32,
    state: JobState,
}

#[derive(Default)]
struct TubeCounters {
    total_jobs: u64,
}

#[derive(Default)]
struct State {
    next_id: u64,
    jobs: HashMap<JobId, JobRecord>,
    /// Ready queue per tube, ordered by (priority, insertion id)
    ready: HashMap<String, BTreeSet<(u32, JobId)>>,
    tubes: BTreeMap<String, TubeCounters>,
    watchers: HashMap<String, usize>,
    history: Vec<BrokerOp>,
    reserve_errors: VecDeque<BrokerError>,
}

impl State {
    fn touch_tube(&mut self, tube: &str) {
        self.tubes.entry(tube.to_string()).or_default();
    }

    fn make_ready(&mut self, id: JobId) {
        if let Some(job) = self.jobs.get_mut(&id) {
            job.state = JobState::Ready;
            self.ready
                .entry(job.tube.clone())
                .or_default()
                .insert((job.priority, id));
        }
    }

    /// Take the most urgent ready job across `tubes`
    fn take_ready(&mut self, tubes: &[String]) -> Option<Job> {
        let (tube, key) = tubes
            .iter()
            .filter_map(|tube| {
                let first = self.ready.get(tube)?.iter().next()?;
                Some((tube.clone(), *first))
            })
            .min_by_key(|(_, key)| *key)?;

        if let Some(queue) = self.ready.get_mut(&tube) {
            queue.remove(&key);
        }
        let (_, id) = key;
        let job = self.jobs.get_mut(&id)?;
        job.state = JobState::Reserved;
        self.history.push(BrokerOp::Reserved(id));
        Some(Job {
            id,
            payload: job.payload.clone(),
        })
    }

    fn reserved_job(&mut self, id: JobId, command: &'static str) -> Result<&mut JobRecord, BrokerError> {
        match self.jobs.get_mut(&id) {
            Some(job) if job.state == JobState::Reserved => Ok(job),
            _ => Err(BrokerError::NotFound { command }),
        }
    }
}

struct Shared {
    state: Mutex<State>,
    job_ready: Notify,
}

/// In-memory broker shared by any number of connections
///
/// # Example
///
/// ```
/// use bns_broker::InMemoryBroker;
///
/// let broker = InMemoryBroker::new();
/// let conn = broker.connect();
/// ```
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    /// Create an empty broker with only the default tube
    pub fn new() -> Self {
        let mut state = State {
            next_id: 1,
            ..Default::default()
        };
        state.touch_tube(DEFAULT_TUBE);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                job_ready: Notify::new(),
            }),
        }
    }

    /// Open a new connection using and watching the default tube
    pub fn connect(&self) -> InMemoryConnection {
        *self
            .shared
            .state
            .lock()
            .watchers
            .entry(DEFAULT_TUBE.to_string())
            .or_default() += 1;
        InMemoryConnection {
            broker: self.clone(),
            using: DEFAULT_TUBE.to_string(),
            watching: vec![DEFAULT_TUBE.to_string()],
        }
    }

    /// Insert a ready job directly, bypassing any connection
    pub fn seed(&self, tube: &str, payload: impl Into<Vec<u8>>) -> JobId {
        self.insert(tube, payload.into(), 0)
    }

    /// Make the next `reserve` on any connection fail with `error`
    pub fn fail_next_reserve(&self, error: BrokerError) {
        self.shared.state.lock().reserve_errors.push_back(error);
    }

    /// Current state of a job, `None` once deleted
    pub fn job_state(&self, id: JobId) -> Option<JobState> {
        self.shared.state.lock().jobs.get(&id).map(|job| job.state)
    }

    /// Number of jobs in `state` across all tubes
    pub fn count(&self, state: JobState) -> usize {
        self.shared
            .state
            .lock()
            .jobs
            .values()
            .filter(|job| job.state == state)
            .count()
    }

    /// Every mutating operation so far, in order
    pub fn history(&self) -> Vec<BrokerOp> {
        self.shared.state.lock().history.clone()
    }

    fn insert(&self, tube: &str, payload: Vec<u8>, priority: u32) -> JobId {
        let id = {
            let mut state = self.shared.state.lock();
            let id = JobId(state.next_id);
            state.next_id += 1;
            state.touch_tube(tube);
            if let Some(counters) = state.tubes.get_mut(tube) {
                counters.total_jobs += 1;
            }
            state.jobs.insert(
                id,
                JobRecord {
                    tube: tube.to_string(),
                    payload,
                    priority,
                    state: JobState::Ready,
                },
            );
            state.make_ready(id);
            state.history.push(BrokerOp::Put(id));
            id
        };
        self.shared.job_ready.notify_waiters();
        id
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// One connection to an [`InMemoryBroker`]
pub struct InMemoryConnection {
    broker: InMemoryBroker,
    using: String,
    watching: Vec<String>,
}

impl InMemoryConnection {
    /// Tubes this connection currently watches
    pub fn watching(&self) -> &[String] {
        &self.watching
    }
}

impl Drop for InMemoryConnection {
    fn drop(&mut self) {
        let mut state = self.broker.shared.state.lock();
        for tube in &self.watching {
            if let Some(count) = state.watchers.get_mut(tube) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

#[async_trait]
impl Broker for InMemoryConnection {
    async fn use_tube(&mut self, tube: &str) -> Result<(), BrokerError> {
        validate_tube_name(tube)?;
        self.broker.shared.state.lock().touch_tube(tube);
        self.using = tube.to_string();
        Ok(())
    }

    async fn watch(&mut self, tube: &str) -> Result<u32, BrokerError> {
        validate_tube_name(tube)?;
        if !self.watching.iter().any(|t| t == tube) {
            let mut state = self.broker.shared.state.lock();
            state.touch_tube(tube);
            *state.watchers.entry(tube.to_string()).or_default() += 1;
            self.watching.push(tube.to_string());
        }
        Ok(self.watching.len() as u32)
    }

    async fn ignore(&mut self, tube: &str) -> Result<u32, BrokerError> {
        validate_tube_name(tube)?;
        if let Some(pos) = self.watching.iter().position(|t| t == tube) {
            if self.watching.len() == 1 {
                return Err(BrokerError::NotIgnored);
            }
            self.watching.remove(pos);
            if let Some(count) = self.broker.shared.state.lock().watchers.get_mut(tube) {
                *count = count.saturating_sub(1);
            }
        }
        Ok(self.watching.len() as u32)
    }

    async fn put(
        &mut self,
        payload: &[u8],
        priority: u32,
        _delay: Duration,
        _ttr: Duration,
    ) -> Result<JobId, BrokerError> {
        Ok(self.broker.insert(&self.using, payload.to_vec(), priority))
    }

    async fn reserve(&mut self, timeout: Duration) -> Result<Job, BrokerError> {
        let shared = Arc::clone(&self.broker.shared);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register interest before checking so a concurrent put is not missed
            let notified = shared.job_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = shared.state.lock();
                if let Some(error) = state.reserve_errors.pop_front() {
                    return Err(error);
                }
                if let Some(job) = state.take_ready(&self.watching) {
                    return Ok(job);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(BrokerError::TimedOut);
            }
        }
    }

    async fn delete(&mut self, id: JobId) -> Result<(), BrokerError> {
        let mut state = self.broker.shared.state.lock();
        state.reserved_job(id, "delete")?;
        state.jobs.remove(&id);
        state.history.push(BrokerOp::Deleted(id));
        Ok(())
    }

    async fn bury(&mut self, id: JobId, priority: u32) -> Result<(), BrokerError> {
        let mut state = self.broker.shared.state.lock();
        let job = state.reserved_job(id, "bury")?;
        job.state = JobState::Buried;
        job.priority = priority;
        state.history.push(BrokerOp::Buried { id, priority });
        Ok(())
    }

    async fn release(
        &mut self,
        id: JobId,
        priority: u32,
        _delay: Duration,
    ) -> Result<(), BrokerError> {
        {
            let mut state = self.broker.shared.state.lock();
            state.reserved_job(id, "release")?.priority = priority;
            state.make_ready(id);
            state.history.push(BrokerOp::Released(id));
        }
        self.broker.shared.job_ready.notify_waiters();
        Ok(())
    }

    async fn stats_tube(&mut self, tube: &str) -> Result<Stats, BrokerError> {
        validate_tube_name(tube)?;
        let state = self.broker.shared.state.lock();
        let counters = state
            .tubes
            .get(tube)
            .ok_or(BrokerError::NotFound {
                command: "stats-tube",
            })?;

        let count = |wanted: JobState| {
            state
                .jobs
                .values()
                .filter(|job| job.tube == tube && job.state == wanted)
                .count()
        };
        let watching = state.watchers.get(tube).copied().unwrap_or_default();
        let using = usize::from(self.using == tube);

        let mut stats = Stats::new();
        stats.insert("name".into(), tube.to_string());
        stats.insert("current-jobs-ready".into(), count(JobState::Ready).to_string());
        stats.insert("current-jobs-reserved".into(), count(JobState::Reserved).to_string());
        stats.insert("current-jobs-buried".into(), count(JobState::Buried).to_string());
        stats.insert("current-jobs-delayed".into(), "0".into());
        stats.insert("current-watching".into(), watching.to_string());
        stats.insert("current-using".into(), using.to_string());
        stats.insert("total-jobs".into(), counters.total_jobs.to_string());
        Ok(stats)
    }

    async fn stats(&mut self) -> Result<Stats, BrokerError> {
        let state = self.broker.shared.state.lock();
        let count = |wanted: JobState| state.jobs.values().filter(|j| j.state == wanted).count();

        let mut stats = Stats::new();
        stats.insert("current-jobs-ready".into(), count(JobState::Ready).to_string());
        stats.insert("current-jobs-reserved".into(), count(JobState::Reserved).to_string());
        stats.insert("current-jobs-buried".into(), count(JobState::Buried).to_string());
        stats.insert("current-tubes".into(), state.tubes.len().to_string());
        stats.insert("total-jobs".into(), (state.next_id - 1).to_string());
        Ok(stats)
    }

    async fn list_tubes(&mut self) -> Result<Vec<String>, BrokerError> {
        Ok(self.broker.shared.state.lock().tubes.keys().cloned().collect())
    }
}
