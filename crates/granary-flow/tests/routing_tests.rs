//! Integration tests for event routing into the scheduler.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use granary_core::storage::{MemoryBackend, ObjectCreated};
use granary_flow::backend::{handlers, HandlerBackend};
use granary_flow::events::{InMemoryOutbox, PipelineEventData};
use granary_flow::job::{params, JobDefinition};
use granary_flow::router::{EventRouter, RouteOutcome, RoutingRule, RoutingTable, SkipReason};
use granary_flow::run::RunTrigger;
use granary_flow::scheduler::JobScheduler;
use granary_flow::sink::MemorySink;
use granary_flow::store::{InMemoryRunStore, RunFilter};
use granary_flow::Error;

fn object_created(key: &str) -> ObjectCreated {
    ObjectCreated {
        key: key.to_string(),
        size: 42,
        etag: "etag-1".to_string(),
        created_at: Utc::now(),
    }
}

fn router_over(rules: Vec<RoutingRule>) -> (EventRouter, JobScheduler, Arc<InMemoryOutbox>) {
    let outbox = Arc::new(InMemoryOutbox::new());
    let backend = HandlerBackend::new(
        Arc::new(MemoryBackend::new()),
        Arc::new(MemorySink::new()),
        outbox.clone(),
    );
    backend
        .register("noop", handlers::succeed())
        .unwrap_or_else(|e| panic!("register: {e}"));

    let definitions = vec![JobDefinition::new("clean-cihr", "noop")];
    let scheduler = JobScheduler::new(
        definitions,
        Arc::new(backend),
        Arc::new(InMemoryRunStore::new()),
        outbox.clone(),
    )
    .unwrap_or_else(|e| panic!("scheduler: {e}"))
    .with_poll_interval(Duration::from_millis(10));

    let table = RoutingTable::new(rules).unwrap_or_else(|e| panic!("table: {e}"));
    let router = EventRouter::new(table, scheduler.clone(), outbox.clone());
    (router, scheduler, outbox)
}

fn csv_rule() -> RoutingRule {
    RoutingRule::new("raw/cihr", ".csv", "clean-cihr")
}

#[tokio::test]
async fn matched_deposit_submits_a_run() {
    let (router, scheduler, outbox) = router_over(vec![csv_rule()]);

    let outcome = router
        .handle(&object_created("raw/cihr/2024.csv"))
        .await
        .unwrap_or_else(|e| panic!("handle: {e}"));
    let RouteOutcome::Submitted { run_id, job } = outcome else {
        panic!("expected a submission, got {outcome:?}");
    };
    assert_eq!(job, "clean-cihr");

    let run = scheduler
        .status(run_id)
        .await
        .unwrap_or_else(|e| panic!("status: {e}"));
    assert_eq!(run.definition_name, "clean-cihr");
    assert_eq!(run.parameters.get(params::INPUT_KEY), Some("raw/cihr/2024.csv"));
    assert_eq!(
        run.triggering_key.as_ref().map(ToString::to_string),
        Some("raw/cihr/2024.csv".to_string())
    );
    assert!(matches!(run.trigger, RunTrigger::ObjectEvent { .. }));

    let routed: Vec<_> = outbox
        .events()
        .into_iter()
        .filter(|e| e.event_type.ends_with("object_routed"))
        .collect();
    assert_eq!(routed.len(), 1);
    assert_eq!(routed[0].correlation_id.as_deref(), Some(run_id.to_string().as_str()));

    scheduler.drain().await;
}

#[tokio::test]
async fn unmatched_key_is_skipped_not_failed() {
    let (router, scheduler, outbox) = router_over(vec![csv_rule()]);

    let outcome = router
        .handle(&object_created("clean/cihr/2024.csv"))
        .await
        .unwrap_or_else(|e| panic!("handle: {e}"));
    assert_eq!(outcome, RouteOutcome::NoMatch);

    let runs = scheduler
        .list_runs(&RunFilter::default())
        .await
        .unwrap_or_else(|e| panic!("list: {e}"));
    assert!(runs.is_empty(), "an unmatched key must not submit anything");

    let skipped: Vec<_> = outbox
        .events()
        .into_iter()
        .filter_map(|e| match e.data {
            PipelineEventData::RoutingSkipped { key, reason, .. } => Some((key, reason)),
            _ => None,
        })
        .collect();
    assert_eq!(skipped, vec![("clean/cihr/2024.csv".to_string(), SkipReason::NoMatch)]);
}

#[tokio::test]
async fn malformed_key_is_dropped_and_the_loop_keeps_going() {
    let (router, scheduler, outbox) = router_over(vec![csv_rule()]);

    for bad in ["orders/cihr/2024.csv", "raw/cihr", "raw//2024.csv"] {
        let outcome = router
            .handle(&object_created(bad))
            .await
            .unwrap_or_else(|e| panic!("handle {bad}: {e}"));
        assert_eq!(outcome, RouteOutcome::Malformed, "key {bad}");
    }

    let reasons: Vec<_> = outbox
        .events()
        .into_iter()
        .filter_map(|e| match e.data {
            PipelineEventData::RoutingSkipped { reason, .. } => Some(reason),
            _ => None,
        })
        .collect();
    assert_eq!(reasons, vec![SkipReason::Malformed; 3]);

    // A good deposit after the bad ones still routes.
    let outcome = router
        .handle(&object_created("raw/cihr/after.csv"))
        .await
        .unwrap_or_else(|e| panic!("handle: {e}"));
    assert!(matches!(outcome, RouteOutcome::Submitted { .. }));

    scheduler.drain().await;
}

#[tokio::test]
async fn rule_pointing_at_unknown_job_fails_submission() {
    let (router, _scheduler, _outbox) =
        router_over(vec![RoutingRule::new("raw/cihr", ".csv", "ghost")]);

    let err = router
        .handle(&object_created("raw/cihr/2024.csv"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownDefinition { ref name } if name == "ghost"));
}

#[tokio::test]
async fn redelivered_event_keeps_its_idempotency_key() {
    let (router, scheduler, outbox) = router_over(vec![csv_rule()]);
    let event = object_created("raw/cihr/2024.csv");

    for _ in 0..2 {
        let outcome = router
            .handle(&event)
            .await
            .unwrap_or_else(|e| panic!("handle: {e}"));
        assert!(matches!(outcome, RouteOutcome::Submitted { .. }));
    }

    // Delivery is at-least-once, so a redelivered deposit submits a
    // second run. Consumers collapse the duplicates by idempotency key.
    let routed: Vec<_> = outbox
        .events()
        .into_iter()
        .filter(|e| e.event_type.ends_with("object_routed"))
        .collect();
    assert_eq!(routed.len(), 2);
    assert_eq!(routed[0].idempotency_key, routed[1].idempotency_key);
    assert_ne!(routed[0].event_id, routed[1].event_id);

    scheduler.drain().await;
}
