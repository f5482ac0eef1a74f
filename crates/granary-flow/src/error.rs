//! Error types for the pipeline crate.
//!
//! Every fallible operation in this crate returns [`Result`]. Variants
//! carry enough context to be actionable without a debugger: run ids,
//! offending keys, the pair of rules that collide.

use granary_core::RunId;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by routing, scheduling, and sink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Two routing rules can match the same object key.
    #[error("ambiguous routes: key '{key}' matches both [{first}] and [{second}]")]
    AmbiguousRoutes {
        /// An example key that both rules accept.
        key: String,
        /// Rendering of the earlier rule.
        first: String,
        /// Rendering of the later rule.
        second: String,
    },

    /// An object key does not follow the `{stage}/{agency}/{filename}` convention.
    #[error("malformed object key '{key}': {reason}")]
    MalformedKey {
        /// The offending key.
        key: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A submission or route referenced a job definition that is not registered.
    #[error("unknown job definition '{name}'")]
    UnknownDefinition {
        /// The definition name that was requested.
        name: String,
    },

    /// No run exists with the given id.
    #[error("run '{run_id}' not found")]
    RunNotFound {
        /// The id that was looked up.
        run_id: RunId,
    },

    /// A run was asked to move between states the lifecycle does not allow.
    #[error("invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        /// State the run is currently in.
        from: String,
        /// State that was requested.
        to: String,
        /// Why the transition is rejected.
        reason: String,
    },

    /// Resubmission requires the original run to be terminal.
    #[error("run '{run_id}' is not resubmittable: status is {status}")]
    NotResubmittable {
        /// The run that was asked to resubmit.
        run_id: RunId,
        /// Its current, non-terminal status.
        status: String,
    },

    /// The compute backend reported the run as failed.
    #[error("run '{run_id}' failed: {message}")]
    ExecutionFailed {
        /// The failed run.
        run_id: RunId,
        /// Failure message reported by the backend.
        message: String,
    },

    /// A run exceeded its definition's timeout and was marked timed out.
    #[error("run '{run_id}' timed out after {timeout_secs}s")]
    Timeout {
        /// The run that was abandoned.
        run_id: RunId,
        /// The configured ceiling, in seconds.
        timeout_secs: u64,
    },

    /// A sink implementation could not resolve a conflicting write.
    ///
    /// The in-memory sink never returns this: it resolves every conflict
    /// by last write wins. External sink implementations that enforce
    /// stricter constraints surface them through this variant.
    #[error("sink conflict on record '{key}'")]
    SinkConflict {
        /// The `{kind}/{agency}/{external_id}` identity of the record.
        key: String,
    },

    /// A cron expression failed to parse.
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron {
        /// The expression as configured.
        expression: String,
        /// Parser diagnostics.
        reason: String,
    },

    /// The pipeline configuration is invalid.
    #[error("configuration error: {message}")]
    Configuration {
        /// What is wrong with it.
        message: String,
    },

    /// A compute backend operation failed.
    #[error("backend error: {message}")]
    Backend {
        /// Description of the failure.
        message: String,
    },

    /// An error bubbled up from the core crate (keys, ids, storage).
    #[error(transparent)]
    Core(#[from] granary_core::Error),

    /// Serialization or deserialization failed.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the failure.
        message: String,
    },
}

impl Error {
    /// Creates a [`Error::Configuration`] from a message.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a [`Error::Backend`] from a message.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates a [`Error::MalformedKey`] from a key and reason.
    pub fn malformed_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Creates a [`Error::InvalidCron`] from an expression and reason.
    pub fn invalid_cron(expression: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidCron {
            expression: expression.into(),
            reason: reason.into(),
        }
    }

    /// Creates a [`Error::Serialization`] from a message.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambiguous_routes_display_names_both_rules() {
        let err = Error::AmbiguousRoutes {
            key: "raw/cihr/file.csv".to_string(),
            first: "prefix 'raw' suffix '.csv' -> clean-all".to_string(),
            second: "prefix 'raw/cihr' suffix '' -> clean-cihr".to_string(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("raw/cihr/file.csv"));
        assert!(rendered.contains("clean-all"));
        assert!(rendered.contains("clean-cihr"));
    }

    #[test]
    fn timeout_display_includes_ceiling() {
        let run_id = RunId::generate();
        let err = Error::Timeout {
            run_id,
            timeout_secs: 900,
        };
        assert!(err.to_string().contains("900s"));
        assert!(err.to_string().contains(&run_id.to_string()));
    }

    #[test]
    fn core_errors_convert() {
        let core = granary_core::Error::invalid_key("bad", "missing segments");
        let err: Error = core.into();
        assert!(matches!(err, Error::Core(_)));
    }

    #[test]
    fn not_resubmittable_reports_status() {
        let err = Error::NotResubmittable {
            run_id: RunId::generate(),
            status: "RUNNING".to_string(),
        };
        assert!(err.to_string().contains("RUNNING"));
    }
}
