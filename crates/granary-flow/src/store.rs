//! Run persistence.
//!
//! Every run the scheduler accepts is written to a [`RunStore`]. The
//! trait is the seam for swapping the in-memory store for a durable
//! one without touching the scheduler.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use granary_core::RunId;

use crate::error::{Error, Result};
use crate::run::{JobRun, RunStatus};

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::backend("run store lock poisoned")
}

/// Criteria for listing runs.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    /// Restrict to one definition.
    pub definition: Option<String>,
    /// Restrict to one status.
    pub status: Option<RunStatus>,
    /// Cap on returned runs.
    pub limit: Option<usize>,
}

impl RunFilter {
    /// Creates a filter that matches everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to runs of one definition.
    #[must_use]
    pub fn with_definition(mut self, definition: impl Into<String>) -> Self {
        self.definition = Some(definition.into());
        self
    }

    /// Restricts to runs in one status.
    #[must_use]
    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Caps the number of returned runs.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, run: &JobRun) -> bool {
        if let Some(definition) = &self.definition {
            if &run.definition_name != definition {
                return false;
            }
        }
        if let Some(status) = self.status {
            if run.status != status {
                return false;
            }
        }
        true
    }
}

/// Persistence for job runs.
#[async_trait]
pub trait RunStore: Send + Sync + 'static {
    /// Stores a new run. The id must not already exist.
    async fn insert(&self, run: JobRun) -> Result<()>;

    /// Replaces the stored state of an existing run.
    async fn update(&self, run: JobRun) -> Result<()>;

    /// Fetches a run by id.
    async fn get(&self, run_id: RunId) -> Result<Option<JobRun>>;

    /// Lists runs matching a filter, newest first.
    async fn list(&self, filter: &RunFilter) -> Result<Vec<JobRun>>;
}

/// In-memory run store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<RunId, JobRun>>,
}

impl InMemoryRunStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn insert(&self, run: JobRun) -> Result<()> {
        let mut runs = self.runs.write().map_err(poison_err)?;
        if runs.contains_key(&run.id) {
            return Err(Error::backend(format!(
                "run '{}' already exists in the store",
                run.id
            )));
        }
        runs.insert(run.id, run);
        Ok(())
    }

    async fn update(&self, run: JobRun) -> Result<()> {
        let mut runs = self.runs.write().map_err(poison_err)?;
        if !runs.contains_key(&run.id) {
            return Err(Error::RunNotFound { run_id: run.id });
        }
        runs.insert(run.id, run);
        Ok(())
    }

    async fn get(&self, run_id: RunId) -> Result<Option<JobRun>> {
        let runs = self.runs.read().map_err(poison_err)?;
        Ok(runs.get(&run_id).cloned())
    }

    async fn list(&self, filter: &RunFilter) -> Result<Vec<JobRun>> {
        let runs = self.runs.read().map_err(poison_err)?;
        let mut matched: Vec<JobRun> = runs
            .values()
            .filter(|run| filter.matches(run))
            .cloned()
            .collect();
        // Newest first. The id tiebreak keeps ordering stable when two
        // runs share a submission instant.
        matched.sort_by(|a, b| {
            b.submitted_at
                .cmp(&a.submitted_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobParameters;
    use crate::run::RunTrigger;
    use granary_core::ObjectKey;

    fn run_for(definition: &str) -> JobRun {
        let key = ObjectKey::parse("raw/cihr/2024.csv").unwrap();
        JobRun::new(
            definition,
            JobParameters::new(),
            RunTrigger::object_event(key),
        )
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() -> Result<()> {
        let store = InMemoryRunStore::new();
        let run = run_for("clean-cihr");
        let id = run.id;
        store.insert(run.clone()).await?;
        assert_eq!(store.get(id).await?, Some(run));
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() -> Result<()> {
        let store = InMemoryRunStore::new();
        let run = run_for("clean-cihr");
        store.insert(run.clone()).await?;
        assert!(store.insert(run).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn update_requires_existing_run() {
        let store = InMemoryRunStore::new();
        let err = store.update(run_for("clean-cihr")).await.unwrap_err();
        assert!(matches!(err, Error::RunNotFound { .. }));
    }

    #[tokio::test]
    async fn list_filters_and_orders_newest_first() -> Result<()> {
        let store = InMemoryRunStore::new();
        let first = run_for("clean-cihr");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let mut second = run_for("assign-ids");
        second.transition_to(RunStatus::Running)?;
        std::thread::sleep(std::time::Duration::from_millis(2));
        let third = run_for("clean-cihr");

        store.insert(first.clone()).await?;
        store.insert(second.clone()).await?;
        store.insert(third.clone()).await?;

        let all = store.list(&RunFilter::new()).await?;
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, third.id);
        assert_eq!(all[2].id, first.id);

        let cleans = store
            .list(&RunFilter::new().with_definition("clean-cihr"))
            .await?;
        assert_eq!(cleans.len(), 2);

        let running = store
            .list(&RunFilter::new().with_status(RunStatus::Running))
            .await?;
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, second.id);

        let limited = store.list(&RunFilter::new().with_limit(1)).await?;
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, third.id);
        Ok(())
    }
}
