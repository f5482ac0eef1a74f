//! Integration tests for stage-chain conformance checking.

use granary_flow::chain::validate_chain;
use granary_flow::config::PipelineConfig;
use granary_flow::Error;

#[test]
fn canonical_chain_validates() {
    let config = PipelineConfig::builtin_grants();
    validate_chain(&config).unwrap_or_else(|e| panic!("builtin chain: {e}"));
}

#[test]
fn missing_onward_route_is_a_chain_break() {
    let err = PipelineConfig::from_json_str(
        r#"{
            "agencies": ["cihr"],
            "definitions": [
                {"name": "clean-cihr", "entryPoint": "copy-to-next-stage",
                 "output": {"type": "stage", "stage": "clean"}}
            ],
            "routes": [
                {"prefix": "raw/cihr", "suffix": ".csv", "job": "clean-cihr"}
            ]
        }"#,
    )
    .unwrap_err();

    let message = err.to_string();
    assert!(message.contains("chain break"), "{message}");
    assert!(message.contains("clean-cihr"), "{message}");
    assert!(message.contains("clean/cihr/sample.csv"), "{message}");
}

#[test]
fn stage_wide_prefix_probes_every_agency() {
    let broken = r#"{
        "agencies": ["cihr", "nserc"],
        "definitions": [
            {"name": "clean-all", "entryPoint": "copy-to-next-stage",
             "output": {"type": "stage", "stage": "clean"}},
            {"name": "absorb", "entryPoint": "noop", "output": {"type": "none"}}
        ],
        "routes": [
            {"prefix": "raw", "suffix": ".csv", "job": "clean-all"},
            {"prefix": "clean/cihr", "job": "absorb"}
        ]
    }"#;
    let err = PipelineConfig::from_json_str(broken).unwrap_err();
    assert!(
        err.to_string().contains("clean/nserc/sample.csv"),
        "the probe must name the agency with no onward route: {err}"
    );

    // Covering the second agency heals the chain.
    let fixed = r#"{
        "agencies": ["cihr", "nserc"],
        "definitions": [
            {"name": "clean-all", "entryPoint": "copy-to-next-stage",
             "output": {"type": "stage", "stage": "clean"}},
            {"name": "absorb", "entryPoint": "noop", "output": {"type": "none"}}
        ],
        "routes": [
            {"prefix": "raw", "suffix": ".csv", "job": "clean-all"},
            {"prefix": "clean/cihr", "job": "absorb"},
            {"prefix": "clean/nserc", "job": "absorb"}
        ]
    }"#;
    PipelineConfig::from_json_str(fixed).unwrap_or_else(|e| panic!("fixed chain: {e}"));
}

#[test]
fn sink_and_untracked_outputs_end_the_chain() {
    PipelineConfig::from_json_str(
        r#"{
            "agencies": ["cihr"],
            "definitions": [
                {"name": "store-grants", "entryPoint": "store-grants",
                 "output": {"type": "sink"}},
                {"name": "audit-only", "entryPoint": "noop", "output": {"type": "none"}}
            ],
            "routes": [
                {"prefix": "raw/cihr", "suffix": ".csv", "job": "store-grants"},
                {"prefix": "clean/cihr", "job": "audit-only"}
            ]
        }"#,
    )
    .unwrap_or_else(|e| panic!("terminal outputs need no onward route: {e}"));
}

#[test]
fn ambiguous_rules_are_rejected_during_validation() {
    let err = PipelineConfig::from_json_str(
        r#"{
            "agencies": ["cihr"],
            "definitions": [
                {"name": "one", "entryPoint": "noop", "output": {"type": "none"}},
                {"name": "two", "entryPoint": "noop", "output": {"type": "none"}}
            ],
            "routes": [
                {"prefix": "raw/cihr", "suffix": ".csv", "job": "one"},
                {"prefix": "raw", "suffix": "2024.csv", "job": "two"}
            ]
        }"#,
    )
    .unwrap_err();
    assert!(
        matches!(err, Error::AmbiguousRoutes { .. }),
        "overlapping rules must fail validation, got: {err}"
    );
}
