//! Job runs and their lifecycle.
//!
//! A [`JobRun`] is one attempt to execute a job definition. Runs move
//! through a small state machine:
//!
//! ```text
//! QUEUED -> RUNNING -> SUCCEEDED | FAILED | TIMED_OUT
//! ```
//!
//! Terminal states never transition again. A retry or resubmission is
//! always a fresh run with its own id, never a mutation of the old one.

use chrono::{DateTime, Utc};
use granary_core::{ObjectKey, RunId};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::job::JobParameters;

/// Lifecycle state of a job run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Accepted and waiting for a concurrency slot.
    #[default]
    Queued,
    /// Executing on the compute backend.
    Running,
    /// Finished successfully.
    Succeeded,
    /// The backend reported a failure.
    Failed,
    /// The run exceeded its definition's timeout.
    TimedOut,
}

impl RunStatus {
    /// True for states that never transition again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut)
    }

    /// Whether the lifecycle allows moving from `self` to `target`.
    #[must_use]
    pub fn can_transition_to(self, target: Self) -> bool {
        match (self, target) {
            (Self::Queued, Self::Running) => true,
            (Self::Running, Self::Succeeded | Self::Failed | Self::TimedOut) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::TimedOut => "TIMED_OUT",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "RUNNING" => Ok(Self::Running),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            "TIMED_OUT" => Ok(Self::TimedOut),
            other => Err(Error::serialization(format!("unknown run status '{other}'"))),
        }
    }
}

/// What caused a run to be submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunTrigger {
    /// An object arrived in storage and matched a routing rule.
    ObjectEvent {
        /// The key that matched.
        key: ObjectKey,
    },
    /// A schedule tick came due.
    Schedule {
        /// Name of the schedule that fired.
        schedule_name: String,
        /// The tick instant the fire corresponds to.
        scheduled_for: DateTime<Utc>,
    },
    /// An operator resubmitted a terminal run.
    Operator {
        /// The run that was resubmitted.
        resubmit_of: RunId,
    },
    /// Automatic retry of a failed or timed-out attempt.
    Retry {
        /// The attempt that failed.
        previous_run: RunId,
    },
}

impl RunTrigger {
    /// Creates an object-event trigger.
    #[must_use]
    pub fn object_event(key: ObjectKey) -> Self {
        Self::ObjectEvent { key }
    }

    /// Creates a schedule trigger.
    #[must_use]
    pub fn schedule(schedule_name: impl Into<String>, scheduled_for: DateTime<Utc>) -> Self {
        Self::Schedule {
            schedule_name: schedule_name.into(),
            scheduled_for,
        }
    }

    /// Creates an operator-resubmission trigger.
    #[must_use]
    pub fn operator(resubmit_of: RunId) -> Self {
        Self::Operator { resubmit_of }
    }

    /// Creates an automatic-retry trigger.
    #[must_use]
    pub fn retry(previous_run: RunId) -> Self {
        Self::Retry { previous_run }
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ObjectEvent { .. } => "object_event",
            Self::Schedule { .. } => "schedule",
            Self::Operator { .. } => "operator",
            Self::Retry { .. } => "retry",
        }
    }

    /// The object key for event-triggered runs, if any.
    #[must_use]
    pub fn object_key(&self) -> Option<&ObjectKey> {
        match self {
            Self::ObjectEvent { key } => Some(key),
            _ => None,
        }
    }
}

/// One attempt to execute a job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRun {
    /// Unique, time-ordered run id.
    pub id: RunId,
    /// Name of the definition this run executes.
    pub definition_name: String,
    /// The object key that caused the run, for event-triggered runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggering_key: Option<ObjectKey>,
    /// What caused the submission.
    pub trigger: RunTrigger,
    /// 1-indexed attempt number. Never exceeds `max_retries + 1`.
    pub attempt: u32,
    /// Effective parameters after merging defaults with overrides.
    pub parameters: JobParameters,
    /// When the run was accepted.
    pub submitted_at: DateTime<Utc>,
    /// When execution began.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Current lifecycle state.
    pub status: RunStatus,
    /// Failure or timeout message for unsuccessful runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Identifier assigned by the compute backend, once submitted there.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_run_id: Option<String>,
}

impl JobRun {
    /// Creates a queued first attempt.
    #[must_use]
    pub fn new(
        definition_name: impl Into<String>,
        parameters: JobParameters,
        trigger: RunTrigger,
    ) -> Self {
        Self {
            id: RunId::generate(),
            definition_name: definition_name.into(),
            triggering_key: trigger.object_key().cloned(),
            trigger,
            attempt: 1,
            parameters,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            status: RunStatus::Queued,
            error: None,
            backend_run_id: None,
        }
    }

    /// Creates the follow-up attempt for a failed or timed-out run.
    ///
    /// The new run gets a fresh id, a retry trigger pointing at this
    /// one, and the same definition, parameters, and triggering key.
    #[must_use]
    pub fn next_attempt(&self) -> Self {
        Self {
            id: RunId::generate(),
            definition_name: self.definition_name.clone(),
            triggering_key: self.triggering_key.clone(),
            trigger: RunTrigger::retry(self.id),
            attempt: self.attempt + 1,
            parameters: self.parameters.clone(),
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            status: RunStatus::Queued,
            error: None,
            backend_run_id: None,
        }
    }

    /// True once the run has reached a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Moves the run to `target`, stamping timestamps as it goes.
    ///
    /// `started_at` is set on entering `Running`, `finished_at` on
    /// entering any terminal state. Disallowed transitions leave the
    /// run untouched and return an error.
    #[tracing::instrument(skip(self), fields(run_id = %self.id, from = %self.status, to = %target))]
    pub fn transition_to(&mut self, target: RunStatus) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: target.to_string(),
                reason: if self.status.is_terminal() {
                    "run is already terminal".to_string()
                } else {
                    "transition not allowed by the run lifecycle".to_string()
                },
            });
        }

        let now = Utc::now();
        if target == RunStatus::Running {
            self.started_at = Some(now);
        }
        if target.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = target;
        tracing::debug!("run transitioned");
        Ok(())
    }
}
