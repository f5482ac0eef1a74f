//! Pipeline audit events.
//!
//! Every significant pipeline action appends a [`PipelineEvent`] to an
//! [`EventSink`]: an object routed, a run submitted or finished, a
//! schedule fired, a batch upserted. The envelope carries a
//! deterministic idempotency key so consumers can collapse redelivered
//! events, and a correlation id linking the event to its run.

use chrono::{DateTime, Utc};
use granary_core::{ObjectKey, RunId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ulid::Ulid;

use crate::router::SkipReason;
use crate::run::RunStatus;
use crate::sink::RecordKind;

/// Logical source recorded on every envelope.
pub const EVENT_SOURCE: &str = "/granary/pipeline";

/// Current envelope schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Envelope wrapping one pipeline occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineEvent {
    /// Unique, time-ordered event id.
    pub event_id: String,
    /// Logical source of the event.
    pub source: String,
    /// Namespaced type, `granary.pipeline.{name}`.
    pub event_type: String,
    /// When the event was recorded.
    pub time: DateTime<Utc>,
    /// Deterministic key for consumer-side deduplication.
    pub idempotency_key: String,
    /// The run this event belongs to, when there is one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Envelope schema version.
    pub schema_version: u32,
    /// The occurrence itself.
    pub data: PipelineEventData,
}

impl PipelineEvent {
    /// Wraps `data` in a fresh envelope.
    #[must_use]
    pub fn new(data: PipelineEventData) -> Self {
        Self {
            event_id: Ulid::new().to_string(),
            source: EVENT_SOURCE.to_string(),
            event_type: format!("granary.pipeline.{}", data.event_name()),
            time: Utc::now(),
            idempotency_key: data.idempotency_key(),
            correlation_id: data.run_id().map(|id| id.to_string()),
            schema_version: SCHEMA_VERSION,
            data,
        }
    }
}

/// The occurrences the pipeline records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEventData {
    /// An object matched a routing rule and a run was submitted.
    ObjectRouted {
        /// The object key that matched.
        key: ObjectKey,
        /// Storage etag of the object version that was routed.
        etag: String,
        /// Job definition the key routed to.
        job: String,
        /// The submitted run.
        run_id: RunId,
    },
    /// An object-created event was observed but no run was submitted.
    RoutingSkipped {
        /// The raw key, which may not parse.
        key: String,
        /// Storage etag of the object version.
        etag: String,
        /// Why it was skipped.
        reason: SkipReason,
    },
    /// A run was accepted by the scheduler.
    RunSubmitted {
        /// The new run.
        run_id: RunId,
        /// Its definition.
        definition: String,
        /// 1-indexed attempt number.
        attempt: u32,
        /// Trigger kind label.
        trigger: String,
    },
    /// A run claimed a concurrency slot and began executing.
    RunStarted {
        /// The run.
        run_id: RunId,
        /// Its definition.
        definition: String,
        /// 1-indexed attempt number.
        attempt: u32,
    },
    /// A run reached a terminal state.
    RunFinished {
        /// The run.
        run_id: RunId,
        /// Its definition.
        definition: String,
        /// Terminal status.
        status: RunStatus,
        /// 1-indexed attempt number.
        attempt: u32,
        /// Failure or timeout message, for unsuccessful runs.
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// An operator resubmitted a terminal run as a fresh one.
    RunResubmitted {
        /// The fresh run.
        run_id: RunId,
        /// The terminal run it was derived from.
        resubmit_of: RunId,
    },
    /// A schedule tick came due and submitted its job.
    ScheduleFired {
        /// Schedule name.
        schedule: String,
        /// The tick instant this fire corresponds to.
        scheduled_for: DateTime<Utc>,
        /// The submitted run.
        run_id: RunId,
    },
    /// A batch of records was written to the relational sink.
    SinkUpserted {
        /// Record kind of the batch.
        kind: RecordKind,
        /// Agency the records belong to.
        agency: String,
        /// The deposit the records were read from.
        source_key: ObjectKey,
        /// Records created.
        inserted: usize,
        /// Records replaced.
        updated: usize,
    },
}

impl PipelineEventData {
    /// Snake-case name used in the envelope's `event_type`.
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::ObjectRouted { .. } => "object_routed",
            Self::RoutingSkipped { .. } => "routing_skipped",
            Self::RunSubmitted { .. } => "run_submitted",
            Self::RunStarted { .. } => "run_started",
            Self::RunFinished { .. } => "run_finished",
            Self::RunResubmitted { .. } => "run_resubmitted",
            Self::ScheduleFired { .. } => "schedule_fired",
            Self::SinkUpserted { .. } => "sink_upserted",
        }
    }

    /// The run this occurrence belongs to, if any.
    #[must_use]
    pub fn run_id(&self) -> Option<RunId> {
        match self {
            Self::ObjectRouted { run_id, .. }
            | Self::RunSubmitted { run_id, .. }
            | Self::RunStarted { run_id, .. }
            | Self::RunFinished { run_id, .. }
            | Self::RunResubmitted { run_id, .. }
            | Self::ScheduleFired { run_id, .. } => Some(*run_id),
            Self::RoutingSkipped { .. } | Self::SinkUpserted { .. } => None,
        }
    }

    /// Deterministic deduplication key for this occurrence.
    ///
    /// Derived only from what identifies the occurrence, not from
    /// envelope ids or timestamps: redelivering the same occurrence
    /// produces the same key.
    #[must_use]
    pub fn idempotency_key(&self) -> String {
        let material = match self {
            Self::ObjectRouted { key, etag, .. } => {
                format!("object_routed:{key}:{etag}")
            }
            Self::RoutingSkipped { key, etag, reason } => {
                format!("routing_skipped:{key}:{etag}:{reason}")
            }
            Self::RunSubmitted { run_id, .. } => format!("run_submitted:{run_id}"),
            Self::RunStarted { run_id, .. } => format!("run_started:{run_id}"),
            Self::RunFinished { run_id, status, .. } => {
                format!("run_finished:{run_id}:{status}")
            }
            Self::RunResubmitted { run_id, .. } => format!("run_resubmitted:{run_id}"),
            Self::ScheduleFired {
                schedule,
                scheduled_for,
                ..
            } => format!("schedule_fired:{schedule}:{}", scheduled_for.to_rfc3339()),
            Self::SinkUpserted { source_key, .. } => format!("sink_upserted:{source_key}"),
        };
        format!("{:x}", Sha256::digest(material.as_bytes()))
    }
}

/// Destination for pipeline events.
///
/// Appending must not fail and must be callable from any task, so the
/// trait takes `&self` and implementations handle their own interior
/// mutability.
pub trait EventSink: Send + Sync + 'static {
    /// Records one event.
    fn append(&self, event: PipelineEvent);
}

/// In-memory event sink for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryOutbox {
    events: std::sync::Mutex<Vec<PipelineEvent>>,
}

impl InMemoryOutbox {
    /// Creates an empty outbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Removes and returns all recorded events, oldest first.
    #[must_use]
    pub fn drain(&self) -> Vec<PipelineEvent> {
        let mut guard = self
            .events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        std::mem::take(&mut *guard)
    }

    /// Number of recorded events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// True when no events have been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for InMemoryOutbox {
    fn append(&self, event: PipelineEvent) {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(event);
    }
}
