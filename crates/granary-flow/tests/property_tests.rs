//! Property tests for routing determinism.

use proptest::prelude::*;

use granary_flow::config::PipelineConfig;
use granary_flow::router::{RoutingRule, RoutingTable};

fn arb_stage() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec!["raw", "clean", "ids-assigned"])
}

fn arb_agency() -> impl Strategy<Value = String> {
    prop_oneof![
        prop::sample::select(vec!["cihr", "nserc", "sshrc", "cfi", "rise", "patents"])
            .prop_map(str::to_string),
        "[a-z]{3,10}",
    ]
}

fn arb_filename() -> impl Strategy<Value = String> {
    "[a-z0-9_-]{1,12}(\\.csv|\\.tsv)?"
}

/// Keys shaped like deposits, plus unstructured junk.
fn arb_key() -> impl Strategy<Value = String> {
    prop_oneof![
        4 => (arb_stage(), arb_agency(), arb_filename())
            .prop_map(|(stage, agency, filename)| format!("{stage}/{agency}/{filename}")),
        1 => "[a-zA-Z0-9/._-]{0,40}",
    ]
}

fn builtin_table() -> RoutingTable {
    RoutingTable::new(PipelineConfig::builtin_grants().routing_rules())
        .unwrap_or_else(|e| panic!("builtin rules must build a table: {e}"))
}

fn linear_scan<'a>(rules: &'a [RoutingRule], key: &str) -> Option<&'a RoutingRule> {
    rules.iter().find(|rule| rule.matches(key))
}

proptest! {
    #[test]
    fn route_is_deterministic(key in arb_key()) {
        let table = builtin_table();
        let first = table.route(&key).cloned();
        let second = table.route(&key).cloned();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn route_agrees_with_declared_order_scan(key in arb_key()) {
        let table = builtin_table();
        prop_assert_eq!(table.route(&key), linear_scan(table.rules(), &key));
    }

    #[test]
    fn matched_rule_claims_the_key(key in arb_key()) {
        let table = builtin_table();
        if let Some(rule) = table.route(&key) {
            prop_assert!(rule.matches(&key));
        }
    }

    // Construction rejects rule pairs that could share a key, so on a
    // built table no key has two claimants.
    #[test]
    fn validated_table_has_at_most_one_claimant(key in arb_key()) {
        let table = builtin_table();
        let claimants = table.rules().iter().filter(|rule| rule.matches(&key)).count();
        prop_assert!(claimants <= 1, "key '{}' claimed by {} rules", key, claimants);
    }
}
