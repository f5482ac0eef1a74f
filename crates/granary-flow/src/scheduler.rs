//! Job scheduling.
//!
//! The [`JobScheduler`] accepts run submissions without blocking,
//! holds them in per-definition FIFO queues, and starts them as
//! concurrency slots free up. Each definition gets
//! `max_concurrent_runs` slots; runs of one definition never consume
//! another's. A started run executes on the [`ComputeBackend`] under
//! the definition's timeout, and a failed or timed-out attempt is
//! retried only while `attempt <= max_retries`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use granary_core::observability::run_span;
use granary_core::RunId;
use tracing::Instrument;

use crate::backend::{BackendStatus, ComputeBackend};
use crate::error::{Error, Result};
use crate::events::{EventSink, PipelineEvent, PipelineEventData};
use crate::job::{JobDefinition, JobParameters};
use crate::metrics::PipelineMetrics;
use crate::run::{JobRun, RunStatus, RunTrigger};
use crate::store::{RunFilter, RunStore};

/// How often a run's backend status is polled unless overridden.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::backend("scheduler lock poisoned")
}

/// Queue and slot accounting, guarded by one lock.
#[derive(Default)]
struct SchedState {
    /// Slots in use per definition.
    slots: HashMap<String, usize>,
    /// Queued run ids per definition, FIFO.
    queues: HashMap<String, VecDeque<RunId>>,
}

struct Inner {
    definitions: HashMap<String, JobDefinition>,
    backend: Arc<dyn ComputeBackend>,
    store: Arc<dyn RunStore>,
    events: Arc<dyn EventSink>,
    state: Mutex<SchedState>,
    poll_interval: Duration,
    metrics: PipelineMetrics,
}

/// Accepts, queues, executes, and tracks job runs.
///
/// Cheap to clone; all clones share one scheduler.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler").finish_non_exhaustive()
    }
}

impl JobScheduler {
    /// Creates a scheduler over a set of job definitions.
    ///
    /// Definitions are validated and must have distinct names.
    pub fn new(
        definitions: impl IntoIterator<Item = JobDefinition>,
        backend: Arc<dyn ComputeBackend>,
        store: Arc<dyn RunStore>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let mut map = HashMap::new();
        for definition in definitions {
            definition.validate()?;
            let name = definition.name.clone();
            if map.insert(name.clone(), definition).is_some() {
                return Err(Error::configuration(format!(
                    "duplicate job definition '{name}'"
                )));
            }
        }
        Ok(Self {
            inner: Arc::new(Inner {
                definitions: map,
                backend,
                store,
                events,
                state: Mutex::new(SchedState::default()),
                poll_interval: DEFAULT_POLL_INTERVAL,
                metrics: PipelineMetrics::new(),
            }),
        })
    }

    /// Overrides the backend poll interval.
    ///
    /// Only effective before the scheduler is cloned or shared.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.poll_interval = interval;
        }
        self
    }

    fn definition(&self, name: &str) -> Result<&JobDefinition> {
        self.inner
            .definitions
            .get(name)
            .ok_or_else(|| Error::UnknownDefinition {
                name: name.to_string(),
            })
    }

    /// Submits a run for a registered definition.
    ///
    /// Returns as soon as the run is recorded and queued; it starts
    /// when a slot for its definition is free. Submission never blocks
    /// on a full definition, so a busy job cannot stall the caller.
    pub async fn submit(
        &self,
        definition_name: &str,
        overrides: JobParameters,
        trigger: RunTrigger,
    ) -> Result<RunId> {
        let definition = self.definition(definition_name)?.clone();
        let parameters = JobParameters::merged(&definition.default_parameters, &overrides);
        let run = JobRun::new(&definition.name, parameters, trigger);
        let run_id = run.id;

        self.inner.store.insert(run.clone()).await?;
        self.inner
            .events
            .append(PipelineEvent::new(PipelineEventData::RunSubmitted {
                run_id,
                definition: definition.name.clone(),
                attempt: run.attempt,
                trigger: run.trigger.kind().to_string(),
            }));
        self.inner
            .metrics
            .record_submission(&definition.name, run.trigger.kind());
        tracing::info!(
            run_id = %run_id,
            definition = %definition.name,
            trigger = run.trigger.kind(),
            "run submitted"
        );

        self.enqueue(&definition.name, run_id)?;
        self.pump(&definition).await?;
        Ok(run_id)
    }

    /// The current state of a run.
    pub async fn status(&self, run_id: RunId) -> Result<JobRun> {
        self.inner
            .store
            .get(run_id)
            .await?
            .ok_or(Error::RunNotFound { run_id })
    }

    /// Runs matching a filter, newest first.
    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<JobRun>> {
        self.inner.store.list(filter).await
    }

    /// Submits a fresh run with the same definition and parameters as
    /// a terminal one.
    ///
    /// The new run starts at attempt 1 with an operator trigger; the
    /// original is left untouched. Non-terminal runs are refused.
    pub async fn resubmit(&self, run_id: RunId) -> Result<RunId> {
        let original = self.status(run_id).await?;
        if !original.is_terminal() {
            return Err(Error::NotResubmittable {
                run_id,
                status: original.status.to_string(),
            });
        }
        let definition = self.definition(&original.definition_name)?.clone();

        let run = JobRun::new(
            &definition.name,
            original.parameters.clone(),
            RunTrigger::operator(run_id),
        );
        let new_id = run.id;
        self.inner.store.insert(run.clone()).await?;
        self.inner
            .events
            .append(PipelineEvent::new(PipelineEventData::RunSubmitted {
                run_id: new_id,
                definition: definition.name.clone(),
                attempt: run.attempt,
                trigger: run.trigger.kind().to_string(),
            }));
        self.inner
            .events
            .append(PipelineEvent::new(PipelineEventData::RunResubmitted {
                run_id: new_id,
                resubmit_of: run_id,
            }));
        self.inner
            .metrics
            .record_submission(&definition.name, run.trigger.kind());
        tracing::info!(
            run_id = %new_id,
            resubmit_of = %run_id,
            definition = %definition.name,
            "run resubmitted"
        );

        self.enqueue(&definition.name, new_id)?;
        self.pump(&definition).await?;
        Ok(new_id)
    }

    /// Waits until no run is executing or queued.
    ///
    /// Terminates because every running attempt is bounded by its
    /// definition's timeout and retries are bounded by `max_retries`.
    pub async fn drain(&self) {
        loop {
            let idle = {
                let Ok(state) = self.inner.state.lock() else {
                    return;
                };
                state.slots.values().all(|&n| n == 0)
                    && state.queues.values().all(VecDeque::is_empty)
            };
            if idle {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn enqueue(&self, definition_name: &str, run_id: RunId) -> Result<()> {
        let depth = {
            let mut state = self.inner.state.lock().map_err(poison_err)?;
            let queue = state.queues.entry(definition_name.to_string()).or_default();
            queue.push_back(run_id);
            queue.len()
        };
        self.inner.metrics.set_queue_depth(definition_name, depth);
        Ok(())
    }

    /// Starts queued runs while slots are free. Each claimed run is
    /// transitioned to running before this returns, so callers observe
    /// slot occupancy synchronously.
    async fn pump(&self, definition: &JobDefinition) -> Result<()> {
        loop {
            let Some(run_id) = self.try_claim(definition)? else {
                return Ok(());
            };
            if let Err(error) = self.start_claimed(definition, run_id).await {
                self.release_slot(&definition.name);
                return Err(error);
            }
        }
    }

    /// Pops the next queued run if a slot is free, incrementing the
    /// slot count for it.
    fn try_claim(&self, definition: &JobDefinition) -> Result<Option<RunId>> {
        let (claimed, depth, in_use) = {
            let mut state = self.inner.state.lock().map_err(poison_err)?;
            let in_use = state
                .slots
                .get(&definition.name)
                .copied()
                .unwrap_or_default();
            if in_use >= definition.max_concurrent_runs {
                return Ok(None);
            }
            let queue = state.queues.entry(definition.name.clone()).or_default();
            let Some(run_id) = queue.pop_front() else {
                return Ok(None);
            };
            let depth = queue.len();
            let in_use = in_use + 1;
            state.slots.insert(definition.name.clone(), in_use);
            (run_id, depth, in_use)
        };
        self.inner.metrics.set_queue_depth(&definition.name, depth);
        self.inner.metrics.set_running(&definition.name, in_use);
        Ok(Some(claimed))
    }

    fn release_slot(&self, definition_name: &str) {
        let in_use = {
            let Ok(mut state) = self.inner.state.lock() else {
                return;
            };
            let in_use = state
                .slots
                .get(definition_name)
                .copied()
                .unwrap_or_default()
                .saturating_sub(1);
            state.slots.insert(definition_name.to_string(), in_use);
            in_use
        };
        self.inner.metrics.set_running(definition_name, in_use);
    }

    /// Marks a claimed run running and spawns its driver task.
    async fn start_claimed(&self, definition: &JobDefinition, run_id: RunId) -> Result<()> {
        let mut run = self
            .inner
            .store
            .get(run_id)
            .await?
            .ok_or(Error::RunNotFound { run_id })?;
        run.transition_to(RunStatus::Running)?;
        self.inner.store.update(run.clone()).await?;
        self.inner
            .events
            .append(PipelineEvent::new(PipelineEventData::RunStarted {
                run_id,
                definition: definition.name.clone(),
                attempt: run.attempt,
            }));

        let scheduler = self.clone();
        let definition = definition.clone();
        let span = run_span("execute", &run_id.to_string(), &definition.name);
        tokio::spawn(
            async move {
                scheduler.run_to_completion(definition, run).await;
            }
            .instrument(span),
        );
        Ok(())
    }

    /// Drives one running attempt to a terminal state, then frees its
    /// slot and starts whatever is next in the queue.
    ///
    /// Returns a boxed future because it is recursive: it awaits
    /// `pump`, and `pump`'s `start_claimed` spawns it again.
    fn run_to_completion<'a>(
        &'a self,
        definition: JobDefinition,
        mut run: JobRun,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let run_id = run.id;
            let started = Instant::now();

            let outcome =
                tokio::time::timeout(definition.timeout, self.execute(&definition, &mut run))
                    .await;
            let (target, error) = match outcome {
                Ok(Ok(())) => (RunStatus::Succeeded, None),
                Ok(Err(error)) => {
                    tracing::warn!(run_id = %run_id, %error, "run failed");
                    (RunStatus::Failed, Some(error.to_string()))
                }
                Err(_) => {
                    // The backend future is dropped here; the work it
                    // started is abandoned, not cancelled.
                    let error = Error::Timeout {
                        run_id,
                        timeout_secs: definition.timeout.as_secs(),
                    };
                    tracing::warn!(run_id = %run_id, %error, "run timed out");
                    (RunStatus::TimedOut, Some(error.to_string()))
                }
            };

            if let Err(error) = self
                .finish_run(&definition, run, target, error, started.elapsed())
                .await
            {
                tracing::error!(run_id = %run_id, %error, "failed to record run completion");
            }
            self.release_slot(&definition.name);
            if let Err(error) = self.pump(&definition).await {
                tracing::error!(definition = %definition.name, %error, "failed to start queued runs");
            }
        })
    }

    /// Submits the run to the backend and polls it to completion.
    async fn execute(&self, definition: &JobDefinition, run: &mut JobRun) -> Result<()> {
        let backend_run_id = self
            .inner
            .backend
            .run_job(definition, &run.parameters)
            .await?;
        run.backend_run_id = Some(backend_run_id.clone());
        self.inner.store.update(run.clone()).await?;

        loop {
            match self.inner.backend.poll_status(&backend_run_id).await? {
                BackendStatus::Running => tokio::time::sleep(self.inner.poll_interval).await,
                BackendStatus::Succeeded => return Ok(()),
                BackendStatus::Failed { message } => {
                    return Err(Error::ExecutionFailed {
                        run_id: run.id,
                        message,
                    })
                }
            }
        }
    }

    /// Records a terminal state and queues the retry attempt when the
    /// policy allows one.
    async fn finish_run(
        &self,
        definition: &JobDefinition,
        mut run: JobRun,
        target: RunStatus,
        error: Option<String>,
        duration: Duration,
    ) -> Result<()> {
        run.error = error;
        run.transition_to(target)?;
        self.inner.store.update(run.clone()).await?;
        self.inner
            .events
            .append(PipelineEvent::new(PipelineEventData::RunFinished {
                run_id: run.id,
                definition: definition.name.clone(),
                status: target,
                attempt: run.attempt,
                error: run.error.clone(),
            }));
        self.inner
            .metrics
            .record_run_finished(&definition.name, target, duration);

        let retryable = matches!(target, RunStatus::Failed | RunStatus::TimedOut);
        if retryable && run.attempt <= definition.max_retries {
            let next = run.next_attempt();
            tracing::info!(
                run_id = %run.id,
                next_run_id = %next.id,
                attempt = next.attempt,
                "retrying run"
            );
            self.inner.store.insert(next.clone()).await?;
            self.inner
                .events
                .append(PipelineEvent::new(PipelineEventData::RunSubmitted {
                    run_id: next.id,
                    definition: definition.name.clone(),
                    attempt: next.attempt,
                    trigger: next.trigger.kind().to_string(),
                }));
            self.inner
                .metrics
                .record_submission(&definition.name, next.trigger.kind());
            self.enqueue(&definition.name, next.id)?;
        }
        Ok(())
    }
}
