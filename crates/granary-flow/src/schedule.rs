//! Scheduled job triggers.
//!
//! A [`ScheduleDefinition`] pairs a six-field cron expression with a
//! job. The [`ScheduleRunner`] evaluates all schedules periodically
//! and fires each at most once per due tick. When evaluation falls
//! behind, whether from a slow loop or a process restart, only the
//! latest due tick fires; older missed ticks are skipped, never
//! replayed.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use granary_core::RunId;
use metrics::histogram;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::events::{EventSink, PipelineEvent, PipelineEventData};
use crate::job::JobParameters;
use crate::metrics::{names as metric_names, PipelineMetrics, TimingGuard};
use crate::run::RunTrigger;
use crate::scheduler::JobScheduler;

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::backend("schedule state lock poisoned")
}

/// A cron-driven trigger for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleDefinition {
    /// Unique schedule name.
    pub name: String,
    /// Six-field cron expression: sec min hour day month weekday.
    pub cron: String,
    /// IANA timezone the expression is evaluated in.
    pub timezone: String,
    /// Job definition to submit on fire.
    pub job: String,
    /// Parameter overrides passed to every fired run.
    pub parameters: JobParameters,
    /// Disabled schedules are kept but never fire.
    pub enabled: bool,
}

impl ScheduleDefinition {
    /// The parsed cron schedule.
    pub fn schedule(&self) -> Result<cron::Schedule> {
        cron::Schedule::from_str(&self.cron)
            .map_err(|e| Error::invalid_cron(&self.cron, e.to_string()))
    }

    /// The parsed timezone.
    pub fn tz(&self) -> Result<Tz> {
        self.timezone.parse::<Tz>().map_err(|_| {
            Error::configuration(format!(
                "schedule '{}': unknown timezone '{}'",
                self.name, self.timezone
            ))
        })
    }

    /// Validates name, expression, timezone, and target.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::configuration("schedule name must not be empty"));
        }
        if self.job.is_empty() {
            return Err(Error::configuration(format!(
                "schedule '{}': job must not be empty",
                self.name
            )));
        }
        self.schedule()?;
        self.tz()?;
        Ok(())
    }

    /// The tick this schedule should fire for right now, if any.
    ///
    /// Returns the latest tick that is due, meaning it lies after
    /// `last_fired_for` and at or before `now`. Earlier due ticks are
    /// dropped, so an evaluator that fell behind fires once instead of
    /// replaying history. With no prior fire there is no anchor and
    /// nothing fires; the caller establishes the anchor first.
    pub fn due_fire(
        &self,
        now: DateTime<Utc>,
        last_fired_for: Option<DateTime<Utc>>,
    ) -> Result<Option<DateTime<Utc>>> {
        if !self.enabled {
            return Ok(None);
        }
        let Some(last) = last_fired_for else {
            return Ok(None);
        };
        let tz = self.tz()?;
        let schedule = self.schedule()?;
        let last_local = last.with_timezone(&tz);
        let now_local = now.with_timezone(&tz);
        let due = schedule
            .after(&last_local)
            .take_while(|tick| *tick <= now_local)
            .last();
        Ok(due.map(|tick| tick.with_timezone(&Utc)))
    }
}

/// Per-schedule firing state.
#[derive(Debug, Clone, Copy)]
struct ScheduleState {
    last_fired_for: DateTime<Utc>,
}

/// One fire produced by an evaluation round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredTick {
    /// The schedule that fired.
    pub schedule: String,
    /// The tick the fire corresponds to.
    pub scheduled_for: DateTime<Utc>,
    /// The submitted run.
    pub run_id: RunId,
}

/// Evaluates schedules and submits their jobs.
pub struct ScheduleRunner {
    schedules: Vec<ScheduleDefinition>,
    states: Mutex<HashMap<String, ScheduleState>>,
    scheduler: JobScheduler,
    events: Arc<dyn EventSink>,
    metrics: PipelineMetrics,
}

impl ScheduleRunner {
    /// Creates a runner over validated schedule definitions.
    pub fn new(
        schedules: Vec<ScheduleDefinition>,
        scheduler: JobScheduler,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        for schedule in &schedules {
            schedule.validate()?;
        }
        Ok(Self {
            schedules,
            states: Mutex::new(HashMap::new()),
            scheduler,
            events,
            metrics: PipelineMetrics::new(),
        })
    }

    /// Evaluates every schedule against `now`, submitting runs for due
    /// ticks.
    ///
    /// A schedule seen for the first time is anchored at `now` and
    /// does not fire; ticks from before the runner existed are not its
    /// business. The anchor is advanced before the run is submitted,
    /// so a submission failure loses that fire rather than risking a
    /// duplicate on the next round.
    pub async fn evaluate(&self, now: DateTime<Utc>) -> Result<Vec<FiredTick>> {
        let _guard = TimingGuard::new(|duration| {
            histogram!(metric_names::SCHEDULE_EVAL_SECONDS).record(duration.as_secs_f64());
        });
        let mut fired = Vec::new();
        for schedule in &self.schedules {
            let last = {
                let mut states = self.states.lock().map_err(poison_err)?;
                match states.get(&schedule.name) {
                    Some(state) => state.last_fired_for,
                    None => {
                        states.insert(
                            schedule.name.clone(),
                            ScheduleState {
                                last_fired_for: now,
                            },
                        );
                        continue;
                    }
                }
            };

            let Some(tick) = schedule.due_fire(now, Some(last))? else {
                continue;
            };

            {
                let mut states = self.states.lock().map_err(poison_err)?;
                states.insert(
                    schedule.name.clone(),
                    ScheduleState {
                        last_fired_for: tick,
                    },
                );
            }

            let run_id = self
                .scheduler
                .submit(
                    &schedule.job,
                    schedule.parameters.clone(),
                    RunTrigger::schedule(&schedule.name, tick),
                )
                .await?;
            tracing::info!(
                schedule = %schedule.name,
                scheduled_for = %tick,
                run_id = %run_id,
                "schedule fired"
            );
            self.metrics.record_schedule_fire(&schedule.name);
            self.events
                .append(PipelineEvent::new(PipelineEventData::ScheduleFired {
                    schedule: schedule.name.clone(),
                    scheduled_for: tick,
                    run_id,
                }));
            fired.push(FiredTick {
                schedule: schedule.name.clone(),
                scheduled_for: tick,
                run_id,
            });
        }
        Ok(fired)
    }

    /// Evaluation loop, driven by a fixed interval until shutdown.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = self.evaluate(Utc::now()).await {
                        tracing::error!(%error, "schedule evaluation failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("schedule runner stopped");
    }
}
