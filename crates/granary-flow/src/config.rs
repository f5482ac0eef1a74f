//! Pipeline configuration.
//!
//! A [`PipelineConfig`] describes one deployment: the agencies it
//! ingests for, the job definitions, the routing rules, and the
//! schedules. Configs load from JSON, take a few environment
//! overrides, and are validated as a whole before anything starts, so
//! a pipeline with an ambiguous route or a broken stage chain refuses
//! to boot instead of misbehaving later.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use granary_core::LogFormat;
use serde::Deserialize;

use crate::chain::{validate_chain, JobOutput};
use crate::error::{Error, Result};
use crate::job::{JobDefinition, JobParameters};
use crate::router::RoutingRule;
use crate::schedule::ScheduleDefinition;

/// Environment variable names recognized by the pipeline.
pub mod env {
    /// Path to the JSON config file.
    pub const CONFIG_PATH: &str = "GRANARY_CONFIG_PATH";
    /// Log output format override: `json` or `pretty`.
    pub const LOG_FORMAT: &str = "GRANARY_LOG_FORMAT";
    /// API listen address override.
    pub const API_ADDR: &str = "GRANARY_API_ADDR";
    /// Backend poll interval override, in milliseconds.
    pub const POLL_INTERVAL_MS: &str = "GRANARY_POLL_INTERVAL_MS";
}

fn default_max_concurrent() -> usize {
    1
}

fn default_timeout_secs() -> u64 {
    900
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_eval_interval_ms() -> u64 {
    1000
}

fn default_api_addr() -> String {
    "127.0.0.1:8080".to_string()
}

/// One job definition as configured.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDefinitionConfig {
    /// Unique definition name.
    pub name: String,
    /// Concurrency ceiling. Defaults to 1.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_runs: usize,
    /// Automatic retries after failure. Defaults to 0: failures stay
    /// failed until an operator steps in.
    #[serde(default)]
    pub max_retries: u32,
    /// Per-attempt timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Backend entry point.
    pub entry_point: String,
    /// Parameters applied to every run.
    #[serde(default)]
    pub default_parameters: JobParameters,
    /// Declared output location.
    #[serde(default)]
    pub output: JobOutput,
}

impl JobDefinitionConfig {
    /// Materializes the runtime definition.
    #[must_use]
    pub fn to_definition(&self) -> JobDefinition {
        JobDefinition::new(&self.name, &self.entry_point)
            .with_max_concurrent_runs(self.max_concurrent_runs)
            .with_max_retries(self.max_retries)
            .with_timeout(Duration::from_secs(self.timeout_secs))
            .with_default_parameters(self.default_parameters.clone())
            .with_output(self.output)
    }
}

/// One routing rule as configured.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    /// Key prefix, matched at segment boundaries.
    pub prefix: String,
    /// Key suffix. Defaults to empty, matching any filename.
    #[serde(default)]
    pub suffix: String,
    /// Job to submit on match.
    pub job: String,
}

/// One schedule as configured.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleConfig {
    /// Unique schedule name.
    pub name: String,
    /// Six-field cron expression.
    pub cron: String,
    /// IANA timezone. Defaults to UTC.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Job to submit on fire.
    pub job: String,
    /// Parameter overrides for fired runs.
    #[serde(default)]
    pub parameters: JobParameters,
    /// Whether the schedule fires. Defaults to true.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ScheduleConfig {
    /// Materializes the runtime schedule definition.
    #[must_use]
    pub fn to_definition(&self) -> ScheduleDefinition {
        ScheduleDefinition {
            name: self.name.clone(),
            cron: self.cron.clone(),
            timezone: self.timezone.clone(),
            job: self.job.clone(),
            parameters: self.parameters.clone(),
            enabled: self.enabled,
        }
    }
}

/// Scheduler tuning knobs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerSettings {
    /// How often running backends are polled, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How often schedules are evaluated, in milliseconds.
    #[serde(default = "default_eval_interval_ms")]
    pub schedule_eval_interval_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            schedule_eval_interval_ms: default_eval_interval_ms(),
        }
    }
}

/// HTTP API settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSettings {
    /// Listen address, `host:port`.
    #[serde(default = "default_api_addr")]
    pub addr: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            addr: default_api_addr(),
        }
    }
}

/// Full configuration for one pipeline deployment.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Agencies deposits are ingested for. Used as key segments.
    pub agencies: Vec<String>,
    /// Job definitions.
    pub definitions: Vec<JobDefinitionConfig>,
    /// Routing rules, in match-priority order.
    pub routes: Vec<RouteConfig>,
    /// Cron schedules.
    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
    /// Scheduler tuning.
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    /// HTTP API settings.
    #[serde(default)]
    pub api: ApiSettings,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

impl PipelineConfig {
    /// Parses and validates a config from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::serialization(format!("invalid pipeline config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a config from a JSON file, applies environment
    /// overrides, and validates.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("cannot read config file '{}': {e}", path.display()))
        })?;
        let mut config: Self = serde_json::from_str(&json).map_err(|e| {
            Error::serialization(format!("invalid pipeline config '{}': {e}", path.display()))
        })?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Applies recognized environment variable overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(raw) = env_string(env::LOG_FORMAT) {
            self.log_format = raw.parse::<LogFormat>().map_err(|_| {
                Error::configuration(format!("{} must be json or pretty", env::LOG_FORMAT))
            })?;
        }
        if let Some(raw) = env_string(env::API_ADDR) {
            raw.parse::<SocketAddr>().map_err(|_| {
                Error::configuration(format!(
                    "{} must be a socket address, got '{raw}'",
                    env::API_ADDR
                ))
            })?;
            self.api.addr = raw;
        }
        if let Some(interval) = env_u64(env::POLL_INTERVAL_MS)? {
            self.scheduler.poll_interval_ms = interval;
        }
        Ok(())
    }

    /// Validates the configuration as a whole.
    ///
    /// Checks agency names, definition uniqueness and limits, route
    /// targets, routing ambiguity, schedule expressions and targets,
    /// and stage-chain conformance. The first problem found is
    /// returned with enough context to fix it.
    pub fn validate(&self) -> Result<()> {
        if self.agencies.is_empty() {
            return Err(Error::configuration(
                "at least one agency must be configured",
            ));
        }
        for agency in &self.agencies {
            if agency.is_empty() || agency.contains('/') {
                return Err(Error::configuration(format!(
                    "agency name '{agency}' must be a non-empty key segment"
                )));
            }
        }
        for (i, agency) in self.agencies.iter().enumerate() {
            if self.agencies[i + 1..].contains(agency) {
                return Err(Error::configuration(format!(
                    "duplicate agency '{agency}'"
                )));
            }
        }

        for (i, definition) in self.definitions.iter().enumerate() {
            definition.to_definition().validate()?;
            if self.definitions[i + 1..].iter().any(|d| d.name == definition.name) {
                return Err(Error::configuration(format!(
                    "duplicate job definition '{}'",
                    definition.name
                )));
            }
        }

        for route in &self.routes {
            if route.prefix.is_empty() {
                return Err(Error::configuration(format!(
                    "route to '{}' has an empty prefix",
                    route.job
                )));
            }
            if !self.definitions.iter().any(|d| d.name == route.job) {
                return Err(Error::configuration(format!(
                    "route prefix '{}' targets unknown job '{}'",
                    route.prefix, route.job
                )));
            }
        }

        for (i, schedule) in self.schedules.iter().enumerate() {
            schedule.to_definition().validate()?;
            if self.schedules[i + 1..].iter().any(|s| s.name == schedule.name) {
                return Err(Error::configuration(format!(
                    "duplicate schedule '{}'",
                    schedule.name
                )));
            }
            if !self.definitions.iter().any(|d| d.name == schedule.job) {
                return Err(Error::configuration(format!(
                    "schedule '{}' targets unknown job '{}'",
                    schedule.name, schedule.job
                )));
            }
        }

        // Builds the routing table, so ambiguous rule pairs surface
        // here too.
        validate_chain(self)?;
        Ok(())
    }

    /// The configured routes as routing rules, in declared order.
    #[must_use]
    pub fn routing_rules(&self) -> Vec<RoutingRule> {
        self.routes
            .iter()
            .map(|r| RoutingRule::new(&r.prefix, &r.suffix, &r.job))
            .collect()
    }

    /// The configured job definitions.
    #[must_use]
    pub fn job_definitions(&self) -> Vec<JobDefinition> {
        self.definitions
            .iter()
            .map(JobDefinitionConfig::to_definition)
            .collect()
    }

    /// The configured schedules.
    #[must_use]
    pub fn schedule_definitions(&self) -> Vec<ScheduleDefinition> {
        self.schedules
            .iter()
            .map(ScheduleConfig::to_definition)
            .collect()
    }

    /// The canonical grants-and-patents pipeline.
    ///
    /// Each agency's raw CSV deposits are cleaned, given ids, and
    /// stored: grant agencies into grant records, patents into patent
    /// records. Used when no config file is supplied.
    #[must_use]
    pub fn builtin_grants() -> Self {
        let agencies = ["cihr", "nserc", "sshrc", "cfi", "rise", "patents"];
        let grant_agencies = ["cihr", "nserc", "sshrc", "cfi", "rise"];

        let mut definitions = Vec::new();
        let mut routes = Vec::new();

        for agency in agencies {
            definitions.push(JobDefinitionConfig {
                name: format!("clean-{agency}"),
                max_concurrent_runs: 2,
                max_retries: 0,
                timeout_secs: 300,
                entry_point: "copy-to-next-stage".to_string(),
                default_parameters: JobParameters::new(),
                output: JobOutput::Stage {
                    stage: granary_core::Stage::Clean,
                },
            });
            routes.push(RouteConfig {
                prefix: format!("raw/{agency}"),
                suffix: ".csv".to_string(),
                job: format!("clean-{agency}"),
            });
        }

        definitions.push(JobDefinitionConfig {
            name: "assign-ids".to_string(),
            max_concurrent_runs: 4,
            max_retries: 0,
            timeout_secs: 300,
            entry_point: "copy-to-next-stage".to_string(),
            default_parameters: JobParameters::new(),
            output: JobOutput::Stage {
                stage: granary_core::Stage::IdsAssigned,
            },
        });
        for agency in agencies {
            routes.push(RouteConfig {
                prefix: format!("clean/{agency}"),
                suffix: String::new(),
                job: "assign-ids".to_string(),
            });
        }

        definitions.push(JobDefinitionConfig {
            name: "store-grants".to_string(),
            max_concurrent_runs: 4,
            max_retries: 0,
            timeout_secs: 300,
            entry_point: "store-grants".to_string(),
            default_parameters: JobParameters::new(),
            output: JobOutput::Sink,
        });
        definitions.push(JobDefinitionConfig {
            name: "store-patents".to_string(),
            max_concurrent_runs: 4,
            max_retries: 0,
            timeout_secs: 300,
            entry_point: "store-patents".to_string(),
            default_parameters: JobParameters::new(),
            output: JobOutput::Sink,
        });
        for agency in grant_agencies {
            routes.push(RouteConfig {
                prefix: format!("ids-assigned/{agency}"),
                suffix: String::new(),
                job: "store-grants".to_string(),
            });
        }
        routes.push(RouteConfig {
            prefix: "ids-assigned/patents".to_string(),
            suffix: String::new(),
            job: "store-patents".to_string(),
        });

        Self {
            agencies: agencies.map(String::from).to_vec(),
            definitions,
            routes,
            schedules: Vec::new(),
            scheduler: SchedulerSettings::default(),
            api: ApiSettings::default(),
            log_format: LogFormat::default(),
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    if raw.is_empty() {
        return Ok(None);
    }
    match raw.trim().parse::<u64>() {
        Ok(value) if value >= 1 => Ok(Some(value)),
        _ => Err(Error::configuration(format!(
            "{name} must be a positive integer, got '{raw}'"
        ))),
    }
}
