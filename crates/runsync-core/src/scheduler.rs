//! Polling scheduler
//!
//! Drives periodic snapshot pulls for one entity until its status settles.
//! The decision of whether and when to poll again is the pure function
//! [`next_poll`]; [`PollingScheduler`] only runs it on a timer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::backoff::BackoffPolicy;
use crate::status::Status;

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollingConfig {
    /// Interval while the status is busy
    #[serde(with = "crate::config::duration_millis")]
    pub busy_interval: Duration,

    /// Interval while a just-created entity is not found yet
    #[serde(with = "crate::config::duration_millis")]
    pub not_found_interval: Duration,

    /// Consecutive not-found answers tolerated for a just-created entity
    pub max_not_found_polls: u32,

    /// Delay between polls after failed pulls
    pub failure_backoff: BackoffPolicy,

    /// Consecutive failed pulls before polling gives up
    pub max_consecutive_failures: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            busy_interval: Duration::from_secs(3),
            not_found_interval: Duration::from_secs(2),
            max_not_found_polls: 30,
            failure_backoff: BackoffPolicy::exponential()
                .with_initial_interval(Duration::from_secs(3))
                .with_max_interval(Duration::from_secs(60)),
            max_consecutive_failures: 5,
        }
    }
}

impl PollingConfig {
    pub fn with_busy_interval(mut self, interval: Duration) -> Self {
        self.busy_interval = interval;
        self
    }

    pub fn with_not_found_interval(mut self, interval: Duration) -> Self {
        self.not_found_interval = interval;
        self
    }

    pub fn with_max_not_found_polls(mut self, polls: u32) -> Self {
        self.max_not_found_polls = polls;
        self
    }

    pub fn with_failure_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.failure_backoff = backoff;
        self
    }

    pub fn with_max_consecutive_failures(mut self, failures: u32) -> Self {
        self.max_consecutive_failures = failures;
        self
    }
}

/// Outcome of one pull, as seen by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollObservation {
    /// Pull succeeded; the entity's derived status afterwards
    Status(Status),
    /// Entity does not exist (yet)
    NotFound,
    /// Pull failed; the cache keeps the last good snapshot
    Failed,
}

/// What the scheduler does next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDecision {
    Continue(Duration),
    Stop,
}

/// Per-watch polling options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollOptions {
    /// The caller just created the entity; tolerate not-found answers
    pub just_created: bool,
}

/// Consecutive-answer counters carried between decisions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollCounters {
    pub not_found: u32,
    pub failures: u32,
}

impl PollCounters {
    pub fn observe(&mut self, observation: &PollObservation) {
        match observation {
            PollObservation::Status(_) => {
                self.not_found = 0;
                self.failures = 0;
            }
            PollObservation::NotFound => {
                self.not_found += 1;
                self.failures = 0;
            }
            PollObservation::Failed => {
                self.failures += 1;
            }
        }
    }
}

/// Decide whether to poll again after an observation.
///
/// `counters` must already include `observation`.
pub fn next_poll(
    observation: &PollObservation,
    counters: &PollCounters,
    options: &PollOptions,
    config: &PollingConfig,
) -> PollDecision {
    match observation {
        PollObservation::Status(status) if status.is_busy() => {
            PollDecision::Continue(config.busy_interval)
        }
        PollObservation::Status(_) => PollDecision::Stop,
        PollObservation::NotFound => {
            if options.just_created && counters.not_found < config.max_not_found_polls {
                PollDecision::Continue(config.not_found_interval)
            } else {
                PollDecision::Stop
            }
        }
        PollObservation::Failed => {
            if counters.failures >= config.max_consecutive_failures {
                PollDecision::Stop
            } else {
                PollDecision::Continue(config.failure_backoff.delay_for_retry(counters.failures))
            }
        }
    }
}

/// Performs one pull for the scheduler.
///
/// Implementations update the cache and derived status themselves and only
/// report the outcome.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch(&self, entity_id: &str) -> PollObservation;

    /// A loop stopped on its own after observing `last`. Runs inside the
    /// loop's task, before it finishes.
    fn stopped(&self, _entity_id: &str, _last: &PollObservation) {}
}

/// Revocable poll loop. Dropping the handle stops the loop.
pub struct PollHandle {
    entity_id: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PollHandle {
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Whether the loop has stopped on its own or been cancelled
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for PollHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollHandle")
            .field("entity_id", &self.entity_id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Spawns poll loops
#[derive(Debug, Clone, Default)]
pub struct PollingScheduler {
    config: PollingConfig,
}

impl PollingScheduler {
    pub fn new(config: PollingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PollingConfig {
        &self.config
    }

    /// Start polling with an immediate first pull
    pub fn watch(
        &self,
        entity_id: impl Into<String>,
        fetcher: Arc<dyn SnapshotFetcher>,
        options: PollOptions,
    ) -> PollHandle {
        self.spawn(
            entity_id.into(),
            fetcher,
            options,
            PollCounters::default(),
            Duration::ZERO,
        )
    }

    /// Continue polling after a pull made elsewhere.
    ///
    /// Returns `None` when `last` already means "stop".
    pub fn resume(
        &self,
        entity_id: impl Into<String>,
        fetcher: Arc<dyn SnapshotFetcher>,
        options: PollOptions,
        last: &PollObservation,
    ) -> Option<PollHandle> {
        let mut counters = PollCounters::default();
        counters.observe(last);
        match next_poll(last, &counters, &options, &self.config) {
            PollDecision::Continue(delay) => {
                Some(self.spawn(entity_id.into(), fetcher, options, counters, delay))
            }
            PollDecision::Stop => None,
        }
    }

    /// Stop a poll loop. Equivalent to dropping the handle.
    pub fn unwatch(&self, handle: PollHandle) {
        drop(handle);
    }

    fn spawn(
        &self,
        entity_id: String,
        fetcher: Arc<dyn SnapshotFetcher>,
        options: PollOptions,
        counters: PollCounters,
        delay: Duration,
    ) -> PollHandle {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(poll_loop(
            entity_id.clone(),
            fetcher,
            options,
            self.config.clone(),
            counters,
            delay,
            cancel.clone(),
        ));
        PollHandle {
            entity_id,
            cancel,
            task,
        }
    }
}

async fn poll_loop(
    entity_id: String,
    fetcher: Arc<dyn SnapshotFetcher>,
    options: PollOptions,
    config: PollingConfig,
    mut counters: PollCounters,
    mut delay: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let observation = tokio::select! {
            _ = cancel.cancelled() => return,
            observation = fetcher.fetch(&entity_id) => observation,
        };
        counters.observe(&observation);

        match next_poll(&observation, &counters, &options, &config) {
            PollDecision::Continue(next) => {
                trace!(entity_id = %entity_id, ?observation, delay_ms = next.as_millis() as u64, "Polling again");
                delay = next;
            }
            PollDecision::Stop => {
                debug!(entity_id = %entity_id, ?observation, "Polling stopped");
                fetcher.stopped(&entity_id, &observation);
                return;
            }
        }
    }
}
