//! Pipeline runtime.
//!
//! [`PipelineRuntime::start`] validates a config, builds the
//! scheduler, router, and schedule runner over the provided storage
//! and compute backends, subscribes to object-created events, and
//! serves the HTTP API. [`PipelineRuntime::shutdown`] stops intake
//! first and then waits for in-flight runs, which finish or hit their
//! timeouts; nothing is dropped mid-write.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use granary_core::observability::routing_span;
use granary_core::{ObjectCreated, StorageBackend};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::api::{self, ApiState};
use crate::backend::ComputeBackend;
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::events::EventSink;
use crate::router::{EventRouter, RoutingTable};
use crate::schedule::ScheduleRunner;
use crate::scheduler::JobScheduler;
use crate::store::InMemoryRunStore;

/// A running pipeline: event loop, schedule loop, and API server.
pub struct PipelineRuntime {
    scheduler: JobScheduler,
    api_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    event_loop: JoinHandle<()>,
    schedule_loop: JoinHandle<()>,
    api_task: JoinHandle<()>,
}

impl PipelineRuntime {
    /// Starts the pipeline over the given storage and compute
    /// backends.
    ///
    /// The config is validated first; an invalid one prevents startup
    /// entirely. Binding the API listener happens here too, so an
    /// occupied port fails fast instead of surfacing later.
    pub async fn start(
        config: PipelineConfig,
        storage: Arc<dyn StorageBackend>,
        backend: Arc<dyn ComputeBackend>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(InMemoryRunStore::new());
        let scheduler = JobScheduler::new(config.job_definitions(), backend, store, events.clone())?
            .with_poll_interval(Duration::from_millis(config.scheduler.poll_interval_ms));
        let table = RoutingTable::new(config.routing_rules())?;
        let router = EventRouter::new(table, scheduler.clone(), events.clone());

        let (shutdown, shutdown_rx) = watch::channel(false);

        let object_events = storage.subscribe();
        let event_loop = tokio::spawn(route_events(router, object_events, shutdown_rx.clone()));

        let runner = Arc::new(ScheduleRunner::new(
            config.schedule_definitions(),
            scheduler.clone(),
            events.clone(),
        )?);
        let schedule_loop = tokio::spawn(runner.run(
            Duration::from_millis(config.scheduler.schedule_eval_interval_ms),
            shutdown_rx.clone(),
        ));

        let addr: SocketAddr = config.api.addr.parse().map_err(|_| {
            Error::configuration(format!(
                "api.addr '{}' is not a socket address",
                config.api.addr
            ))
        })?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::configuration(format!("cannot bind api listener on {addr}: {e}")))?;
        let api_addr = listener
            .local_addr()
            .map_err(|e| Error::backend(format!("cannot resolve api listener address: {e}")))?;
        let api_state = ApiState {
            scheduler: scheduler.clone(),
        };
        let api_task = tokio::spawn(async move {
            if let Err(error) = api::serve(listener, api_state, shutdown_rx).await {
                tracing::error!(%error, "api server terminated");
            }
        });

        tracing::info!(api_addr = %api_addr, "pipeline runtime started");
        Ok(Self {
            scheduler,
            api_addr,
            shutdown,
            event_loop,
            schedule_loop,
            api_task,
        })
    }

    /// The scheduler driving this runtime.
    #[must_use]
    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    /// The address the API is actually listening on.
    #[must_use]
    pub fn api_addr(&self) -> SocketAddr {
        self.api_addr
    }

    /// Stops intake, then waits for in-flight runs to finish.
    ///
    /// The event loop, schedule loop, and API stop first so nothing
    /// new is accepted; queued and running work then drains, bounded
    /// by each definition's timeout and retry limits.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for (name, task) in [
            ("event loop", self.event_loop),
            ("schedule loop", self.schedule_loop),
            ("api server", self.api_task),
        ] {
            if let Err(error) = task.await {
                tracing::warn!(task = name, %error, "task ended abnormally");
            }
        }
        self.scheduler.drain().await;
        tracing::info!("pipeline runtime stopped");
    }
}

/// Consumes object-created events until shutdown.
///
/// Routing failures are logged and the loop keeps going; one bad
/// event never stops the pipeline. A lagged receiver means delivery
/// gaps, which is reported but survivable since storage delivery is
/// at-least-once for live consumers.
async fn route_events(
    router: EventRouter,
    mut object_events: broadcast::Receiver<ObjectCreated>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            received = object_events.recv() => match received {
                Ok(event) => {
                    let span = routing_span("handle_event", &event.key);
                    if let Err(error) = router.handle(&event).instrument(span).await {
                        tracing::error!(key = %event.key, %error, "failed to route object event");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event loop lagged; object events were missed");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    tracing::debug!("event loop stopped");
}
