//! Integration tests for config loading, environment overrides, and
//! file handling.

use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use granary_core::LogFormat;
use granary_flow::chain::JobOutput;
use granary_flow::config::{env, PipelineConfig};

// Environment variables are process-global, so every test that reads
// or writes them holds this lock.
static ENV_LOCK: Mutex<()> = Mutex::new(());

const VALID_CONFIG: &str = r#"{
    "agencies": ["cihr"],
    "definitions": [
        {"name": "clean-cihr", "entryPoint": "copy-to-next-stage",
         "maxConcurrentRuns": 3, "maxRetries": 1, "timeoutSecs": 120,
         "defaultParameters": {"delimiter": ","},
         "output": {"type": "stage", "stage": "clean"}},
        {"name": "assign-ids", "entryPoint": "copy-to-next-stage",
         "output": {"type": "stage", "stage": "ids-assigned"}},
        {"name": "store-grants", "entryPoint": "store-grants",
         "output": {"type": "sink"}}
    ],
    "routes": [
        {"prefix": "raw/cihr", "suffix": ".csv", "job": "clean-cihr"},
        {"prefix": "clean/cihr", "job": "assign-ids"},
        {"prefix": "ids-assigned/cihr", "job": "store-grants"}
    ],
    "schedules": [
        {"name": "nightly-sweep", "cron": "0 0 3 * * *",
         "timezone": "America/Toronto", "job": "assign-ids",
         "parameters": {"mode": "sweep"}}
    ],
    "scheduler": {"pollIntervalMs": 250, "scheduleEvalIntervalMs": 5000},
    "api": {"addr": "127.0.0.1:9090"},
    "logFormat": "json"
}"#;

fn temp_config_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("granary-config-{}-{tag}.json", std::process::id()))
}

#[test]
fn full_config_parses_every_section() {
    let config = PipelineConfig::from_json_str(VALID_CONFIG)
        .unwrap_or_else(|e| panic!("parse: {e}"));

    assert_eq!(config.agencies, vec!["cihr".to_string()]);
    assert_eq!(config.scheduler.poll_interval_ms, 250);
    assert_eq!(config.scheduler.schedule_eval_interval_ms, 5000);
    assert_eq!(config.api.addr, "127.0.0.1:9090");
    assert_eq!(config.log_format, LogFormat::Json);

    let definitions = config.job_definitions();
    let clean = &definitions[0];
    assert_eq!(clean.name, "clean-cihr");
    assert_eq!(clean.max_concurrent_runs, 3);
    assert_eq!(clean.max_retries, 1);
    assert_eq!(clean.timeout, Duration::from_secs(120));
    assert_eq!(clean.default_parameters.get("delimiter"), Some(","));
    assert_eq!(
        clean.output,
        JobOutput::Stage {
            stage: granary_core::Stage::Clean
        }
    );

    let schedules = config.schedule_definitions();
    assert_eq!(schedules[0].name, "nightly-sweep");
    assert_eq!(schedules[0].timezone, "America/Toronto");
    assert_eq!(schedules[0].parameters.get("mode"), Some("sweep"));
    assert!(schedules[0].enabled);
}

#[test]
fn environment_overrides_are_applied_and_checked() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    let clear = || {
        std::env::remove_var(env::LOG_FORMAT);
        std::env::remove_var(env::API_ADDR);
        std::env::remove_var(env::POLL_INTERVAL_MS);
    };
    clear();

    // Unset variables leave the config untouched.
    let mut config = PipelineConfig::builtin_grants();
    config.apply_env().unwrap_or_else(|e| panic!("apply: {e}"));
    assert_eq!(config.api.addr, "127.0.0.1:8080");
    assert_eq!(config.scheduler.poll_interval_ms, 500);

    // Valid overrides take effect.
    std::env::set_var(env::LOG_FORMAT, "json");
    std::env::set_var(env::API_ADDR, "0.0.0.0:9999");
    std::env::set_var(env::POLL_INTERVAL_MS, "250");
    let mut config = PipelineConfig::builtin_grants();
    config.apply_env().unwrap_or_else(|e| panic!("apply: {e}"));
    assert_eq!(config.log_format, LogFormat::Json);
    assert_eq!(config.api.addr, "0.0.0.0:9999");
    assert_eq!(config.scheduler.poll_interval_ms, 250);
    clear();

    // Empty values are treated as unset.
    std::env::set_var(env::API_ADDR, "");
    let mut config = PipelineConfig::builtin_grants();
    config.apply_env().unwrap_or_else(|e| panic!("apply: {e}"));
    assert_eq!(config.api.addr, "127.0.0.1:8080");
    clear();

    // Bad values fail loudly instead of being ignored.
    std::env::set_var(env::LOG_FORMAT, "yaml");
    let err = PipelineConfig::builtin_grants().apply_env().unwrap_err();
    assert!(err.to_string().contains("must be json or pretty"), "{err}");
    clear();

    std::env::set_var(env::API_ADDR, "not-an-address");
    let err = PipelineConfig::builtin_grants().apply_env().unwrap_err();
    assert!(err.to_string().contains("socket address"), "{err}");
    clear();

    std::env::set_var(env::POLL_INTERVAL_MS, "0");
    let err = PipelineConfig::builtin_grants().apply_env().unwrap_err();
    assert!(err.to_string().contains("positive integer"), "{err}");
    clear();

    std::env::set_var(env::POLL_INTERVAL_MS, "soon");
    let err = PipelineConfig::builtin_grants().apply_env().unwrap_err();
    assert!(err.to_string().contains("positive integer"), "{err}");
    clear();
}

#[test]
fn config_loads_from_file() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    let path = temp_config_path("valid");
    std::fs::write(&path, VALID_CONFIG).unwrap_or_else(|e| panic!("write: {e}"));

    let config = PipelineConfig::from_json_file(&path).unwrap_or_else(|e| panic!("load: {e}"));
    assert_eq!(config.api.addr, "127.0.0.1:9090");
    assert_eq!(config.definitions.len(), 3);

    let _ = std::fs::remove_file(&path);
}

#[test]
fn missing_config_file_names_the_path() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    let path = temp_config_path("missing");
    let err = PipelineConfig::from_json_file(&path).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("cannot read config file"), "{message}");
    assert!(message.contains("missing"), "{message}");
}

#[test]
fn invalid_json_in_file_is_a_serialization_error() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    let path = temp_config_path("broken");
    std::fs::write(&path, "{ not json").unwrap_or_else(|e| panic!("write: {e}"));

    let err = PipelineConfig::from_json_file(&path).unwrap_err();
    assert!(err.to_string().contains("invalid pipeline config"), "{err}");

    let _ = std::fs::remove_file(&path);
}

#[test]
fn file_that_fails_validation_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    let path = temp_config_path("invalid");
    // Valid JSON, but the route targets a job that does not exist.
    std::fs::write(
        &path,
        r#"{
            "agencies": ["cihr"],
            "definitions": [],
            "routes": [{"prefix": "raw/cihr", "job": "ghost"}]
        }"#,
    )
    .unwrap_or_else(|e| panic!("write: {e}"));

    let err = PipelineConfig::from_json_file(&path).unwrap_err();
    assert!(err.to_string().contains("ghost"), "{err}");

    let _ = std::fs::remove_file(&path);
}
