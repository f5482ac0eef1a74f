//! Job definitions and parameters.
//!
//! A [`JobDefinition`] is the static description of a unit of work:
//! what to execute, how many copies may run at once, and how long a
//! run may take. Definitions are registered with the scheduler at
//! startup; runs are created from them at submission time.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chain::JobOutput;
use crate::error::{Error, Result};

/// Well-known parameter names.
pub mod params {
    /// Key of the object that triggered the run, as a string.
    ///
    /// Set by the event router on every event-triggered submission.
    pub const INPUT_KEY: &str = "input_key";
}

/// Default ceiling on a single run's wall-clock duration.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(900);

/// String key/value parameters passed to a job run.
///
/// Backed by an ordered map so serialized forms and iteration order
/// are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobParameters(BTreeMap<String, String>);

impl JobParameters {
    /// Creates an empty parameter set.
    #[must_use]
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Inserts a parameter, replacing any previous value for the key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Returns the value for a key, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Number of parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no parameters are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over `(key, value)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Merges defaults with overrides. Override values win on key collision.
    #[must_use]
    pub fn merged(defaults: &Self, overrides: &Self) -> Self {
        let mut out = defaults.0.clone();
        for (key, value) in &overrides.0 {
            out.insert(key.clone(), value.clone());
        }
        Self(out)
    }
}

impl FromIterator<(String, String)> for JobParameters {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Static description of a job registered with the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDefinition {
    /// Unique name the job is addressed by.
    pub name: String,
    /// Number of runs of this definition that may execute concurrently.
    pub max_concurrent_runs: usize,
    /// Automatic retries after a failed or timed-out attempt.
    ///
    /// Zero means a failed run stays failed until an operator resubmits it.
    pub max_retries: u32,
    /// Wall-clock ceiling for a single attempt.
    pub timeout: Duration,
    /// Backend entry point identifying the code to execute.
    pub entry_point: String,
    /// Parameters applied to every run unless overridden at submission.
    pub default_parameters: JobParameters,
    /// Where successful runs deposit their output.
    pub output: JobOutput,
}

impl JobDefinition {
    /// Creates a definition with defaults: one concurrent run, no
    /// retries, the standard timeout, no default parameters, no output.
    #[must_use]
    pub fn new(name: impl Into<String>, entry_point: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_concurrent_runs: 1,
            max_retries: 0,
            timeout: DEFAULT_TIMEOUT,
            entry_point: entry_point.into(),
            default_parameters: JobParameters::new(),
            output: JobOutput::None,
        }
    }

    /// Sets the concurrency ceiling.
    #[must_use]
    pub fn with_max_concurrent_runs(mut self, max: usize) -> Self {
        self.max_concurrent_runs = max;
        self
    }

    /// Sets the automatic retry count.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the default parameters.
    #[must_use]
    pub fn with_default_parameters(mut self, parameters: JobParameters) -> Self {
        self.default_parameters = parameters;
        self
    }

    /// Sets the output declaration.
    #[must_use]
    pub fn with_output(mut self, output: JobOutput) -> Self {
        self.output = output;
        self
    }

    /// Validates the definition's internal constraints.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::configuration("job definition name must not be empty"));
        }
        if self.entry_point.is_empty() {
            return Err(Error::configuration(format!(
                "job definition '{}': entry point must not be empty",
                self.name
            )));
        }
        if self.max_concurrent_runs == 0 {
            return Err(Error::configuration(format!(
                "job definition '{}': max_concurrent_runs must be at least 1",
                self.name
            )));
        }
        Ok(())
    }
}
