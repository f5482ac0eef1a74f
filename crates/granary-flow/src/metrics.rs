//! Pipeline metrics.
//!
//! Counter, gauge, and histogram names live in [`names`]; label keys
//! in [`labels`]. [`PipelineMetrics`] is a thin stateless recorder so
//! call sites stay free of raw macro invocations and name typos.

use std::sync::{Once, OnceLock};
use std::time::{Duration, Instant};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::error::{Error, Result};
use crate::run::RunStatus;

/// Metric names emitted by this crate.
pub mod names {
    /// Counter: object-created events routed, by outcome.
    pub const EVENTS_ROUTED_TOTAL: &str = "granary_pipeline_events_routed_total";
    /// Counter: runs submitted, by definition and trigger.
    pub const RUNS_TOTAL: &str = "granary_pipeline_runs_total";
    /// Histogram: run duration in seconds, by definition and status.
    pub const RUN_DURATION_SECONDS: &str = "granary_pipeline_run_duration_seconds";
    /// Gauge: queued runs per definition.
    pub const QUEUE_DEPTH: &str = "granary_pipeline_queue_depth";
    /// Gauge: currently executing runs per definition.
    pub const RUNNING_RUNS: &str = "granary_pipeline_running_runs";
    /// Counter: schedule fires, by schedule name.
    pub const SCHEDULE_FIRES_TOTAL: &str = "granary_pipeline_schedule_fires_total";
    /// Histogram: wall time of one schedule evaluation round.
    pub const SCHEDULE_EVAL_SECONDS: &str = "granary_pipeline_schedule_eval_seconds";
    /// Counter: records written to the relational sink, by kind and op.
    pub const SINK_UPSERTS_TOTAL: &str = "granary_pipeline_sink_upserts_total";
}

/// Label keys used with the metrics above.
pub mod labels {
    /// Job definition name.
    pub const DEFINITION: &str = "definition";
    /// Terminal run status.
    pub const STATUS: &str = "status";
    /// Routing outcome: submitted, no_match, malformed.
    pub const OUTCOME: &str = "outcome";
    /// What caused a submission: object_event, schedule, operator, retry.
    pub const TRIGGER: &str = "trigger";
    /// Schedule name.
    pub const SCHEDULE: &str = "schedule";
    /// Sink record kind: grant, patent.
    pub const KIND: &str = "kind";
    /// Sink operation: inserted, updated.
    pub const OP: &str = "op";
}

static INSTALL: Once = Once::new();
static PROMETHEUS: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the global Prometheus recorder.
///
/// Call once at process startup, before any metric is recorded.
/// Subsequent calls are no-ops.
pub fn init_metrics() -> Result<()> {
    let mut install_error = None;
    INSTALL.call_once(|| match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            let _ = PROMETHEUS.set(handle);
        }
        Err(e) => install_error = Some(e),
    });
    match install_error {
        Some(e) => Err(Error::configuration(format!(
            "failed to install metrics recorder: {e}"
        ))),
        None => Ok(()),
    }
}

/// The installed Prometheus handle, if [`init_metrics`] has run.
#[must_use]
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS.get()
}

/// Recorder for pipeline metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineMetrics;

impl PipelineMetrics {
    /// Creates a recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records the outcome of routing one object-created event.
    pub fn record_route_outcome(&self, outcome: &'static str) {
        metrics::counter!(names::EVENTS_ROUTED_TOTAL, labels::OUTCOME => outcome).increment(1);
    }

    /// Records a run submission.
    pub fn record_submission(&self, definition: &str, trigger: &'static str) {
        metrics::counter!(
            names::RUNS_TOTAL,
            labels::DEFINITION => definition.to_string(),
            labels::TRIGGER => trigger,
        )
        .increment(1);
    }

    /// Records a run reaching a terminal state.
    pub fn record_run_finished(&self, definition: &str, status: RunStatus, duration: Duration) {
        metrics::histogram!(
            names::RUN_DURATION_SECONDS,
            labels::DEFINITION => definition.to_string(),
            labels::STATUS => status.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Sets the queued-run gauge for a definition.
    pub fn set_queue_depth(&self, definition: &str, depth: usize) {
        metrics::gauge!(names::QUEUE_DEPTH, labels::DEFINITION => definition.to_string())
            .set(depth as f64);
    }

    /// Sets the running-run gauge for a definition.
    pub fn set_running(&self, definition: &str, running: usize) {
        metrics::gauge!(names::RUNNING_RUNS, labels::DEFINITION => definition.to_string())
            .set(running as f64);
    }

    /// Records a schedule fire.
    pub fn record_schedule_fire(&self, schedule: &str) {
        metrics::counter!(
            names::SCHEDULE_FIRES_TOTAL,
            labels::SCHEDULE => schedule.to_string(),
        )
        .increment(1);
    }

    /// Records a batch of sink writes.
    pub fn record_sink_upsert(&self, kind: &'static str, inserted: usize, updated: usize) {
        if inserted > 0 {
            metrics::counter!(
                names::SINK_UPSERTS_TOTAL,
                labels::KIND => kind,
                labels::OP => "inserted",
            )
            .increment(inserted as u64);
        }
        if updated > 0 {
            metrics::counter!(
                names::SINK_UPSERTS_TOTAL,
                labels::KIND => kind,
                labels::OP => "updated",
            )
            .increment(updated as u64);
        }
    }
}

/// Measures a duration and reports it on drop.
pub struct TimingGuard<F: FnOnce(Duration)> {
    started: Instant,
    report: Option<F>,
}

impl<F: FnOnce(Duration)> TimingGuard<F> {
    /// Starts the clock. `report` runs with the elapsed time on drop.
    #[must_use]
    pub fn new(report: F) -> Self {
        Self {
            started: Instant::now(),
            report: Some(report),
        }
    }
}

impl<F: FnOnce(Duration)> Drop for TimingGuard<F> {
    fn drop(&mut self) {
        if let Some(report) = self.report.take() {
            report(self.started.elapsed());
        }
    }
}
