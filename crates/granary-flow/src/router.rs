//! Event routing.
//!
//! The router turns object-created notifications into job
//! submissions. A [`RoutingTable`] holds ordered prefix/suffix rules
//! and refuses at construction to hold two rules that could claim the
//! same key, so matching is deterministic by inspection. The
//! [`EventRouter`] consumes storage events, routes them, and records
//! the outcome without ever tearing down the event loop: malformed
//! keys are logged and dropped, not escalated.

use std::fmt;
use std::sync::Arc;

use granary_core::{ObjectCreated, ObjectKey};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::events::{EventSink, PipelineEvent, PipelineEventData};
use crate::job::{params, JobParameters};
use crate::metrics::PipelineMetrics;
use crate::run::RunTrigger;
use crate::scheduler::JobScheduler;
use granary_core::RunId;

/// One prefix/suffix routing rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Path prefix the key must start with, matched at segment
    /// boundaries. `raw/cihr` matches `raw/cihr/x.csv` but not
    /// `raw/cihrx/x.csv`.
    pub prefix: String,
    /// Suffix the key must end with. Empty matches everything.
    pub suffix: String,
    /// Job definition to submit on match.
    pub job: String,
}

impl RoutingRule {
    /// Creates a rule.
    #[must_use]
    pub fn new(
        prefix: impl Into<String>,
        suffix: impl Into<String>,
        job: impl Into<String>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
            job: job.into(),
        }
    }

    /// Whether this rule claims the given key.
    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        prefix_matches(&self.prefix, key) && key.ends_with(&self.suffix)
    }
}

impl fmt::Display for RoutingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "prefix '{}' suffix '{}' -> {}",
            self.prefix, self.suffix, self.job
        )
    }
}

/// Whether `key` starts with `prefix` at a path-segment boundary.
fn prefix_matches(prefix: &str, key: &str) -> bool {
    if prefix.is_empty() || key == prefix {
        return true;
    }
    if !key.starts_with(prefix) {
        return false;
    }
    prefix.ends_with('/') || key.as_bytes().get(prefix.len()) == Some(&b'/')
}

/// Whether one prefix's segment subtree contains the other's.
fn prefixes_overlap(a: &str, b: &str) -> bool {
    prefix_matches(a, b) || prefix_matches(b, a)
}

/// Whether one suffix constraint subsumes the other. Two suffixes can
/// both hold for a single key only when one ends with the other.
fn suffixes_overlap(a: &str, b: &str) -> bool {
    a.ends_with(b) || b.ends_with(a)
}

/// A key both rules would claim, used as the ambiguity witness.
fn overlap_witness(a: &RoutingRule, b: &RoutingRule) -> String {
    let prefix = if prefix_matches(&a.prefix, &b.prefix) {
        &b.prefix
    } else {
        &a.prefix
    };
    let suffix = if a.suffix.ends_with(&b.suffix) {
        &a.suffix
    } else {
        &b.suffix
    };
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        format!("file{suffix}")
    } else {
        format!("{prefix}/file{suffix}")
    }
}

/// Ordered, ambiguity-free set of routing rules.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    rules: Vec<RoutingRule>,
}

impl RoutingTable {
    /// Builds a table, rejecting rule pairs that could claim the same
    /// key.
    ///
    /// Two rules collide when their prefixes cover overlapping
    /// subtrees and one suffix ends with the other. The error names
    /// both rules and an example key they would both claim.
    pub fn new(rules: Vec<RoutingRule>) -> Result<Self> {
        for (i, first) in rules.iter().enumerate() {
            for second in &rules[i + 1..] {
                if prefixes_overlap(&first.prefix, &second.prefix)
                    && suffixes_overlap(&first.suffix, &second.suffix)
                {
                    return Err(Error::AmbiguousRoutes {
                        key: overlap_witness(first, second),
                        first: first.to_string(),
                        second: second.to_string(),
                    });
                }
            }
        }
        Ok(Self { rules })
    }

    /// The first rule claiming the key, in declared order.
    #[must_use]
    pub fn route(&self, key: &str) -> Option<&RoutingRule> {
        self.rules.iter().find(|rule| rule.matches(key))
    }

    /// The rules in declared order.
    #[must_use]
    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }
}

/// Why an object-created event produced no run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The key does not follow `{stage}/{agency}/{filename}`.
    Malformed,
    /// The key is well formed but no rule claims it.
    NoMatch,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Malformed => "malformed",
            Self::NoMatch => "no_match",
        };
        f.write_str(s)
    }
}

/// What the router did with one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// A rule matched and a run was submitted.
    Submitted {
        /// The submitted run.
        run_id: RunId,
        /// The job it executes.
        job: String,
    },
    /// The key was well formed but no rule claimed it.
    NoMatch,
    /// The key was dropped because it does not parse.
    Malformed,
}

/// Consumes object-created events and submits matching jobs.
pub struct EventRouter {
    table: RoutingTable,
    scheduler: JobScheduler,
    events: Arc<dyn EventSink>,
    metrics: PipelineMetrics,
}

impl EventRouter {
    /// Creates a router over a validated table.
    #[must_use]
    pub fn new(table: RoutingTable, scheduler: JobScheduler, events: Arc<dyn EventSink>) -> Self {
        Self {
            table,
            scheduler,
            events,
            metrics: PipelineMetrics::new(),
        }
    }

    /// Routes one event.
    ///
    /// Malformed keys and unmatched keys are recorded and skipped;
    /// neither returns an error, so a bad deposit cannot take down the
    /// event loop. Errors surface only when a matched submission
    /// itself fails.
    pub async fn handle(&self, event: &ObjectCreated) -> Result<RouteOutcome> {
        let key = match ObjectKey::parse(&event.key) {
            Ok(key) => key,
            Err(error) => {
                tracing::warn!(key = %event.key, %error, "dropping event with malformed key");
                self.metrics.record_route_outcome("malformed");
                self.events
                    .append(PipelineEvent::new(PipelineEventData::RoutingSkipped {
                        key: event.key.clone(),
                        etag: event.etag.clone(),
                        reason: SkipReason::Malformed,
                    }));
                return Ok(RouteOutcome::Malformed);
            }
        };

        let Some(rule) = self.table.route(&event.key) else {
            tracing::debug!(key = %event.key, "no routing rule matched");
            self.metrics.record_route_outcome("no_match");
            self.events
                .append(PipelineEvent::new(PipelineEventData::RoutingSkipped {
                    key: event.key.clone(),
                    etag: event.etag.clone(),
                    reason: SkipReason::NoMatch,
                }));
            return Ok(RouteOutcome::NoMatch);
        };

        let mut overrides = JobParameters::new();
        overrides.insert(params::INPUT_KEY, event.key.clone());
        let run_id = self
            .scheduler
            .submit(&rule.job, overrides, RunTrigger::object_event(key.clone()))
            .await?;

        tracing::info!(key = %event.key, job = %rule.job, run_id = %run_id, "object routed");
        self.metrics.record_route_outcome("submitted");
        self.events
            .append(PipelineEvent::new(PipelineEventData::ObjectRouted {
                key,
                etag: event.etag.clone(),
                job: rule.job.clone(),
                run_id,
            }));
        Ok(RouteOutcome::Submitted {
            run_id,
            job: rule.job.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_matches_only_at_segment_boundaries() {
        let rule = RoutingRule::new("raw/ci", "", "clean");
        assert!(rule.matches("raw/ci/file.csv"));
        assert!(!rule.matches("raw/cihr/file.csv"));

        let slash = RoutingRule::new("raw/cihr/", "", "clean");
        assert!(slash.matches("raw/cihr/file.csv"));
        assert!(!slash.matches("raw/cihrx/file.csv"));
    }

    #[test]
    fn suffix_must_match_end() {
        let rule = RoutingRule::new("raw/cihr", ".csv", "clean");
        assert!(rule.matches("raw/cihr/2024.csv"));
        assert!(!rule.matches("raw/cihr/2024.tsv"));
        assert!(!rule.matches("raw/cihr/2024.csv.bak"));
    }

    #[test]
    fn empty_suffix_matches_any_filename() {
        let rule = RoutingRule::new("clean/nserc", "", "assign");
        assert!(rule.matches("clean/nserc/a"));
        assert!(rule.matches("clean/nserc/a.anything"));
    }

    #[test]
    fn route_returns_first_match_in_declared_order() {
        let table = RoutingTable::new(vec![
            RoutingRule::new("raw/cihr", ".csv", "clean-cihr"),
            RoutingRule::new("raw/nserc", ".csv", "clean-nserc"),
        ])
        .unwrap();

        assert_eq!(table.route("raw/cihr/2024.csv").unwrap().job, "clean-cihr");
        assert_eq!(table.route("raw/nserc/2024.csv").unwrap().job, "clean-nserc");
        assert!(table.route("raw/sshrc/2024.csv").is_none());
        assert!(table.route("not a key").is_none());
    }

    #[test]
    fn nested_prefixes_with_overlapping_suffixes_are_ambiguous() {
        let err = RoutingTable::new(vec![
            RoutingRule::new("raw", ".csv", "clean-all"),
            RoutingRule::new("raw/cihr", "", "clean-cihr"),
        ])
        .unwrap_err();

        let Error::AmbiguousRoutes { key, first, second } = err else {
            panic!("expected ambiguity error");
        };
        assert!(first.contains("clean-all"));
        assert!(second.contains("clean-cihr"));
        // The witness really is claimed by both rules.
        assert!(RoutingRule::new("raw", ".csv", "clean-all").matches(&key));
        assert!(RoutingRule::new("raw/cihr", "", "clean-cihr").matches(&key));
    }

    #[test]
    fn identical_prefixes_with_disjoint_suffixes_coexist() {
        let table = RoutingTable::new(vec![
            RoutingRule::new("raw/cihr", ".csv", "clean-csv"),
            RoutingRule::new("raw/cihr", ".tsv", "clean-tsv"),
        ]);
        assert!(table.is_ok());
    }

    #[test]
    fn disjoint_prefixes_coexist_with_any_suffixes() {
        let table = RoutingTable::new(vec![
            RoutingRule::new("raw/cihr", "", "clean-cihr"),
            RoutingRule::new("raw/nserc", "", "clean-nserc"),
            RoutingRule::new("clean/cihr", "", "assign-ids"),
        ]);
        assert!(table.is_ok());
    }

    #[test]
    fn duplicate_rules_are_ambiguous() {
        let err = RoutingTable::new(vec![
            RoutingRule::new("raw/cihr", ".csv", "a"),
            RoutingRule::new("raw/cihr", ".csv", "b"),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::AmbiguousRoutes { .. }));
    }

    #[test]
    fn witness_is_shared_by_both_rules_across_cases() {
        let cases = [
            (
                RoutingRule::new("raw", "", "a"),
                RoutingRule::new("raw/cihr", ".csv", "b"),
            ),
            (
                RoutingRule::new("clean/nserc", ".csv", "a"),
                RoutingRule::new("clean/nserc", "2024.csv", "b"),
            ),
            (
                RoutingRule::new("", ".csv", "a"),
                RoutingRule::new("raw", ".csv", "b"),
            ),
        ];
        for (first, second) in cases {
            let witness = overlap_witness(&first, &second);
            assert!(first.matches(&witness), "{first} should match {witness}");
            assert!(second.matches(&witness), "{second} should match {witness}");
        }
    }
}
