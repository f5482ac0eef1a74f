//! Stage chain declarations and conformance checking.
//!
//! Jobs declare where their output lands via [`JobOutput`]. At startup
//! [`validate_chain`] walks every route and checks that objects
//! written to an intermediate stage will be picked up by another rule,
//! so a deposit admitted at `raw` cannot silently stall between
//! stages.

use granary_core::{ObjectKey, Stage};
use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::router::RoutingTable;

/// Where a job's successful runs deposit their output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobOutput {
    /// The job writes objects to a pipeline stage.
    Stage {
        /// The stage written to.
        stage: Stage,
    },
    /// The job writes records to the relational sink.
    Sink,
    /// The job produces no tracked output.
    #[default]
    None,
}

/// The key a stage-advancing job writes for a given input key.
///
/// Returns `None` when the input is already at the final stage.
#[must_use]
pub fn output_key(input: &ObjectKey) -> Option<ObjectKey> {
    input.next_stage_key()
}

/// Checks that every intermediate stage output has an onward route.
///
/// For each routing rule whose target job writes to a stage, a probe
/// key is built at that stage for every agency the rule can serve. The
/// probe must match some rule in the table; a miss means objects would
/// be written there and never routed again.
pub fn validate_chain(config: &PipelineConfig) -> Result<()> {
    let table = RoutingTable::new(config.routing_rules())?;

    for route in &config.routes {
        let mut segments = route.prefix.split('/');
        let stage_segment = segments.next().unwrap_or_default();
        if stage_segment.parse::<Stage>().is_err() {
            return Err(Error::configuration(format!(
                "route prefix '{}' must begin with a pipeline stage",
                route.prefix
            )));
        }
        let agency_segment = segments.next().filter(|s| !s.is_empty());
        if let Some(agency) = agency_segment {
            if !config.agencies.iter().any(|a| a == agency) {
                return Err(Error::configuration(format!(
                    "route prefix '{}' names unknown agency '{}'",
                    route.prefix, agency
                )));
            }
        }

        let definition = config
            .definitions
            .iter()
            .find(|d| d.name == route.job)
            .ok_or_else(|| Error::UnknownDefinition {
                name: route.job.clone(),
            })?;
        let JobOutput::Stage { stage } = definition.output else {
            continue;
        };

        // The job preserves filenames, so anything it writes keeps the
        // suffix its input matched.
        let probe_agencies: Vec<&str> = match agency_segment {
            Some(agency) => vec![agency],
            None => config.agencies.iter().map(String::as_str).collect(),
        };
        for agency in probe_agencies {
            let probe = format!("{}/{}/sample{}", stage.as_str(), agency, route.suffix);
            if table.route(&probe).is_none() {
                return Err(Error::configuration(format!(
                    "chain break: job '{}' (route prefix '{}' suffix '{}') writes stage \
                     '{}' but no rule routes '{}'",
                    route.job, route.prefix, route.suffix, stage, probe
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_serializes_tagged() {
        let stage = JobOutput::Stage { stage: Stage::Clean };
        assert_eq!(
            serde_json::to_string(&stage).unwrap(),
            r#"{"type":"stage","stage":"clean"}"#
        );
        assert_eq!(serde_json::to_string(&JobOutput::Sink).unwrap(), r#"{"type":"sink"}"#);
        assert_eq!(serde_json::to_string(&JobOutput::None).unwrap(), r#"{"type":"none"}"#);

        let parsed: JobOutput =
            serde_json::from_str(r#"{"type":"stage","stage":"ids-assigned"}"#).unwrap();
        assert_eq!(
            parsed,
            JobOutput::Stage {
                stage: Stage::IdsAssigned
            }
        );
    }

    #[test]
    fn output_key_advances_one_stage() {
        let raw = ObjectKey::parse("raw/cihr/2024.csv").unwrap();
        let clean = output_key(&raw).unwrap();
        assert_eq!(clean.to_string(), "clean/cihr/2024.csv");

        let ids = output_key(&clean).unwrap();
        assert_eq!(ids.to_string(), "ids-assigned/cihr/2024.csv");

        assert!(output_key(&ids).is_none());
    }
}
