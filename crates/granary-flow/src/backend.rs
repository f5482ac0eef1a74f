//! Compute backends.
//!
//! The scheduler hands started runs to a [`ComputeBackend`] and polls
//! them to completion. [`HandlerBackend`] executes registered async
//! handlers in-process, which is the execution model for tests and
//! single-process deployments; a remote backend implements the same
//! trait against an external executor.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use granary_core::{ObjectKey, StorageBackend};
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::events::EventSink;
use crate::job::{params, JobDefinition, JobParameters};
use crate::sink::RelationalSink;

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::backend("handler backend lock poisoned")
}

/// Backend-reported state of a submitted run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendStatus {
    /// Still executing.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished unsuccessfully.
    Failed {
        /// What went wrong.
        message: String,
    },
}

/// Executes job runs.
#[async_trait]
pub trait ComputeBackend: Send + Sync + 'static {
    /// Starts executing a run, returning a backend-scoped id for
    /// subsequent polling.
    async fn run_job(
        &self,
        definition: &JobDefinition,
        parameters: &JobParameters,
    ) -> Result<String>;

    /// Reports the current state of a previously started run.
    async fn poll_status(&self, backend_run_id: &str) -> Result<BackendStatus>;
}

/// Everything a handler needs to do its work.
#[derive(Clone)]
pub struct JobContext {
    /// Effective run parameters.
    pub parameters: JobParameters,
    /// Object storage holding stage deposits.
    pub storage: Arc<dyn StorageBackend>,
    /// Relational store for finished records.
    pub sink: Arc<dyn RelationalSink>,
    /// Audit event destination.
    pub events: Arc<dyn EventSink>,
}

impl JobContext {
    /// The object key the run was triggered for.
    pub fn input_key(&self) -> Result<ObjectKey> {
        let raw = self
            .parameters
            .get(params::INPUT_KEY)
            .ok_or_else(|| Error::backend("run has no input_key parameter"))?;
        Ok(ObjectKey::parse(raw)?)
    }
}

/// Async function executed for runs of one entry point.
pub type JobHandler =
    Arc<dyn Fn(JobContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

/// In-process backend dispatching runs to registered handlers.
///
/// Handlers are keyed by a definition's entry point, so several
/// definitions can share one implementation.
pub struct HandlerBackend {
    handlers: RwLock<HashMap<String, JobHandler>>,
    runs: Arc<RwLock<HashMap<String, BackendStatus>>>,
    storage: Arc<dyn StorageBackend>,
    sink: Arc<dyn RelationalSink>,
    events: Arc<dyn EventSink>,
}

impl HandlerBackend {
    /// Creates a backend with no handlers registered.
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        sink: Arc<dyn RelationalSink>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            runs: Arc::new(RwLock::new(HashMap::new())),
            storage,
            sink,
            events,
        }
    }

    /// Registers the handler for an entry point, replacing any
    /// previous one.
    pub fn register(&self, entry_point: impl Into<String>, handler: JobHandler) -> Result<()> {
        let mut handlers = self.handlers.write().map_err(poison_err)?;
        handlers.insert(entry_point.into(), handler);
        Ok(())
    }
}

#[async_trait]
impl ComputeBackend for HandlerBackend {
    async fn run_job(
        &self,
        definition: &JobDefinition,
        parameters: &JobParameters,
    ) -> Result<String> {
        let handler = {
            let handlers = self.handlers.read().map_err(poison_err)?;
            handlers.get(&definition.entry_point).cloned()
        }
        .ok_or_else(|| {
            Error::backend(format!(
                "no handler registered for entry point '{}'",
                definition.entry_point
            ))
        })?;

        let backend_run_id = Ulid::new().to_string();
        {
            let mut runs = self.runs.write().map_err(poison_err)?;
            runs.insert(backend_run_id.clone(), BackendStatus::Running);
        }

        let context = JobContext {
            parameters: parameters.clone(),
            storage: self.storage.clone(),
            sink: self.sink.clone(),
            events: self.events.clone(),
        };
        let runs = self.runs.clone();
        let id = backend_run_id.clone();
        tokio::spawn(async move {
            let status = match handler(context).await {
                Ok(()) => BackendStatus::Succeeded,
                Err(error) => BackendStatus::Failed {
                    message: error.to_string(),
                },
            };
            let mut runs = runs
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            runs.insert(id, status);
        });
        Ok(backend_run_id)
    }

    async fn poll_status(&self, backend_run_id: &str) -> Result<BackendStatus> {
        let runs = self.runs.read().map_err(poison_err)?;
        runs.get(backend_run_id)
            .cloned()
            .ok_or_else(|| Error::backend(format!("unknown backend run id '{backend_run_id}'")))
    }
}

/// Stock handlers for the standard pipeline jobs.
pub mod handlers {
    use super::{Arc, Error, JobContext, JobHandler};
    use crate::chain;
    use crate::events::{PipelineEvent, PipelineEventData};
    use crate::metrics::PipelineMetrics;
    use crate::sink::{records_from_deposit, RecordKind};

    /// Copies the input object to the same key at the next stage.
    #[must_use]
    pub fn copy_to_next_stage() -> JobHandler {
        Arc::new(|ctx: JobContext| {
            Box::pin(async move {
                let input = ctx.input_key()?;
                let output = chain::output_key(&input).ok_or_else(|| {
                    Error::backend(format!("'{input}' is already at the final stage"))
                })?;
                let data = ctx.storage.get(&input.to_string()).await?;
                ctx.storage.put(&output.to_string(), data).await?;
                tracing::debug!(input = %input, output = %output, "advanced object one stage");
                Ok(())
            })
        })
    }

    /// Parses the input deposit and upserts its rows into the
    /// relational sink.
    #[must_use]
    pub fn upsert_to_sink(kind: RecordKind) -> JobHandler {
        Arc::new(move |ctx: JobContext| {
            Box::pin(async move {
                let input = ctx.input_key()?;
                let agency = input.agency().to_string();
                let data = ctx.storage.get(&input.to_string()).await?;
                let records = records_from_deposit(kind, &agency, &data)?;
                let summary = ctx.sink.upsert(records).await?;
                tracing::info!(
                    key = %input,
                    kind = %kind,
                    inserted = summary.inserted,
                    updated = summary.updated,
                    "deposit upserted"
                );
                PipelineMetrics::new().record_sink_upsert(
                    kind.as_str(),
                    summary.inserted,
                    summary.updated,
                );
                ctx.events
                    .append(PipelineEvent::new(PipelineEventData::SinkUpserted {
                        kind,
                        agency,
                        source_key: input,
                        inserted: summary.inserted,
                        updated: summary.updated,
                    }));
                Ok(())
            })
        })
    }

    /// Succeeds immediately without touching anything.
    #[must_use]
    pub fn succeed() -> JobHandler {
        Arc::new(|_ctx: JobContext| Box::pin(async { Ok(()) }))
    }

    /// Fails immediately with a fixed message.
    #[must_use]
    pub fn fail_with(message: impl Into<String>) -> JobHandler {
        let message = message.into();
        Arc::new(move |_ctx: JobContext| {
            let message = message.clone();
            Box::pin(async move { Err(Error::backend(message)) })
        })
    }

    /// Never finishes on its own. Runs executing this only end by
    /// hitting their definition's timeout.
    #[must_use]
    pub fn hang() -> JobHandler {
        Arc::new(|_ctx: JobContext| {
            Box::pin(async {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                Ok(())
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InMemoryOutbox;
    use crate::sink::{MemorySink, RecordKind};
    use bytes::Bytes;
    use granary_core::MemoryBackend;
    use std::time::Duration;

    fn backend_fixture() -> (HandlerBackend, Arc<MemoryBackend>, Arc<MemorySink>) {
        let storage = Arc::new(MemoryBackend::new());
        let sink = Arc::new(MemorySink::new());
        let events = Arc::new(InMemoryOutbox::new());
        let backend = HandlerBackend::new(storage.clone(), sink.clone(), events);
        (backend, storage, sink)
    }

    fn params_for(key: &str) -> JobParameters {
        let mut params = JobParameters::new();
        params.insert(super::params::INPUT_KEY, key);
        params
    }

    async fn poll_until_terminal(backend: &HandlerBackend, id: &str) -> BackendStatus {
        for _ in 0..200 {
            let status = backend.poll_status(id).await.unwrap();
            if status != BackendStatus::Running {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("backend run '{id}' never finished");
    }

    #[tokio::test]
    async fn unknown_entry_point_is_rejected() {
        let (backend, _, _) = backend_fixture();
        let definition = JobDefinition::new("clean", "unregistered");
        let err = backend
            .run_job(&definition, &JobParameters::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unregistered"));
    }

    #[tokio::test]
    async fn unknown_backend_run_id_is_rejected() {
        let (backend, _, _) = backend_fixture();
        assert!(backend.poll_status("nope").await.is_err());
    }

    #[tokio::test]
    async fn handler_failure_is_reported() {
        let (backend, _, _) = backend_fixture();
        backend
            .register("explode", handlers::fail_with("boom"))
            .unwrap();
        let definition = JobDefinition::new("bad", "explode");
        let id = backend
            .run_job(&definition, &JobParameters::new())
            .await
            .unwrap();
        let status = poll_until_terminal(&backend, &id).await;
        assert_eq!(
            status,
            BackendStatus::Failed {
                message: "backend error: boom".to_string()
            }
        );
    }

    #[tokio::test]
    async fn copy_handler_advances_the_object() {
        let (backend, storage, _) = backend_fixture();
        backend
            .register("copy", handlers::copy_to_next_stage())
            .unwrap();
        storage
            .put("raw/cihr/2024.csv", Bytes::from_static(b"id,title\nG-1,X\n"))
            .await
            .unwrap();

        let definition = JobDefinition::new("clean-cihr", "copy");
        let id = backend
            .run_job(&definition, &params_for("raw/cihr/2024.csv"))
            .await
            .unwrap();
        assert_eq!(poll_until_terminal(&backend, &id).await, BackendStatus::Succeeded);

        let copied = storage.get("clean/cihr/2024.csv").await.unwrap();
        assert_eq!(&copied[..], b"id,title\nG-1,X\n");
    }

    #[tokio::test]
    async fn copy_handler_fails_at_final_stage() {
        let (backend, storage, _) = backend_fixture();
        backend
            .register("copy", handlers::copy_to_next_stage())
            .unwrap();
        storage
            .put("ids-assigned/cihr/2024.csv", Bytes::from_static(b"x"))
            .await
            .unwrap();

        let definition = JobDefinition::new("overshoot", "copy");
        let id = backend
            .run_job(&definition, &params_for("ids-assigned/cihr/2024.csv"))
            .await
            .unwrap();
        let status = poll_until_terminal(&backend, &id).await;
        assert!(matches!(status, BackendStatus::Failed { .. }));
    }

    #[tokio::test]
    async fn sink_handler_upserts_deposit_rows() {
        let (backend, storage, sink) = backend_fixture();
        backend
            .register("store", handlers::upsert_to_sink(RecordKind::Grant))
            .unwrap();
        storage
            .put(
                "ids-assigned/nserc/2024.csv",
                Bytes::from_static(b"id,title\nN-1,Robotics\nN-2,Optics\n"),
            )
            .await
            .unwrap();

        let definition = JobDefinition::new("store-grants", "store");
        let id = backend
            .run_job(&definition, &params_for("ids-assigned/nserc/2024.csv"))
            .await
            .unwrap();
        assert_eq!(poll_until_terminal(&backend, &id).await, BackendStatus::Succeeded);

        assert_eq!(sink.count(RecordKind::Grant).await.unwrap(), 2);
        let stored = sink
            .get(RecordKind::Grant, "nserc", "N-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.payload["title"], "Robotics");
    }

    #[tokio::test]
    async fn missing_input_key_fails_the_run() {
        let (backend, _, _) = backend_fixture();
        backend
            .register("copy", handlers::copy_to_next_stage())
            .unwrap();
        let definition = JobDefinition::new("clean", "copy");
        let id = backend
            .run_job(&definition, &JobParameters::new())
            .await
            .unwrap();
        let status = poll_until_terminal(&backend, &id).await;
        assert!(matches!(status, BackendStatus::Failed { .. }));
    }
}
