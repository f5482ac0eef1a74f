//! # granary-flow
//!
//! The granary staged-ingestion pipeline: everything that happens
//! between a CSV landing in object storage and a record landing in the
//! relational store.
//!
//! - **Event Router**: matches object-created events against ordered
//!   prefix/suffix rules and submits the matching job. Rule sets that
//!   could claim one key twice are rejected at startup.
//! - **Job Scheduler**: per-definition FIFO queues and concurrency
//!   slots, hard per-attempt timeouts, and no silent retries unless a
//!   definition opts in.
//! - **Stage Chain**: deposits advance `raw` to `clean` to
//!   `ids-assigned` to the sink, and chain conformance is validated
//!   before anything runs.
//! - **Schedules**: six-field cron triggers that fire at most once per
//!   tick and skip missed ticks instead of replaying them.
//! - **Relational Sink**: upserts keyed `(kind, agency, external_id)`,
//!   so re-processing converges.
//!
//! ## Example
//!
//! ```rust
//! use granary_flow::prelude::*;
//!
//! let table = RoutingTable::new(vec![
//!     RoutingRule::new("raw/cihr", ".csv", "clean-cihr"),
//!     RoutingRule::new("clean/cihr", "", "assign-ids"),
//! ])
//! .unwrap();
//!
//! let rule = table.route("raw/cihr/2024.csv").unwrap();
//! assert_eq!(rule.job, "clean-cihr");
//! assert!(table.route("raw/nserc/2024.csv").is_none());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod api;
pub mod backend;
pub mod chain;
pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod metrics;
pub mod router;
pub mod run;
pub mod runtime;
pub mod schedule;
pub mod scheduler;
pub mod sink;
pub mod store;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use granary_flow::prelude::*;
/// ```
pub mod prelude {
    pub use crate::backend::{BackendStatus, ComputeBackend, HandlerBackend, JobContext};
    pub use crate::chain::JobOutput;
    pub use crate::config::PipelineConfig;
    pub use crate::error::{Error, Result};
    pub use crate::events::{EventSink, InMemoryOutbox, PipelineEvent, PipelineEventData};
    pub use crate::job::{JobDefinition, JobParameters};
    pub use crate::router::{EventRouter, RouteOutcome, RoutingRule, RoutingTable};
    pub use crate::run::{JobRun, RunStatus, RunTrigger};
    pub use crate::runtime::PipelineRuntime;
    pub use crate::schedule::ScheduleDefinition;
    pub use crate::scheduler::JobScheduler;
    pub use crate::sink::{MemorySink, RecordKind, RelationalSink, SinkRecord, UpsertSummary};
    pub use crate::store::{InMemoryRunStore, RunFilter, RunStore};
}

pub use backend::{BackendStatus, ComputeBackend, HandlerBackend};
pub use config::PipelineConfig;
pub use error::{Error, Result};
pub use router::{EventRouter, RouteOutcome, RoutingRule, RoutingTable};
pub use run::{JobRun, RunStatus, RunTrigger};
pub use runtime::PipelineRuntime;
pub use scheduler::JobScheduler;
