use std::time::Duration;

use serde_json::json;

use tributary_core::{Component, FlowExecId, FlowId, FlowStatus, StepId};
use tributary_orchestrator::broker::{InboundMessage, INPUT_ROUTING_KEY, ORCHESTRATOR_TOKEN_HEADER};
use tributary_orchestrator::credentials::TokenStore;
use tributary_orchestrator::inbound::MessageOutcome;
use tributary_orchestrator::token::ContinuationClaims;
use tributary_orchestrator::OrchestratorError;

mod test_fixtures;
use test_fixtures::{claims_for, fan_out_flow, init_test_tracing, linear_flow, privileged, Harness, USER_ID};

/// Flow `f1` running `a -> b`, with an access token issued
async fn running_flow(harness: &Harness) {
    harness
        .save_components(&[Component::local("c1"), Component::local("c2")])
        .await;
    harness
        .save_flow(linear_flow("f1", FlowStatus::Active, &[("a", "c1"), ("b", "c2")]))
        .await;
    harness
        .tokens
        .get_token_for_flow_and_user(&FlowId::from("f1"), USER_ID)
        .await
        .unwrap();
}

/// Claims carried by the `index`th published message
async fn published_claims(harness: &Harness, index: usize) -> ContinuationClaims {
    let published = harness.broker.published().await;
    harness
        .signer
        .verify(&published[index].record.orchestrator_token)
        .unwrap()
}

fn counters_message(started: i64, succeeded: i64) -> String {
    format!("started={} succeeded={}", started, succeeded)
}

async fn counters_of(harness: &Harness, flow_exec_id: &str) -> Option<String> {
    harness
        .orchestrator
        .counters()
        .find_by_flow_exec_id(&FlowExecId::from(flow_exec_id))
        .await
        .unwrap()
        .map(|row| counters_message(row.started, row.succeeded))
}

#[tokio::test]
async fn test_execute_flow_publishes_first_step() {
    init_test_tracing();
    let harness = Harness::new();
    running_flow(&harness).await;

    let flow_exec_id = harness
        .orchestrator
        .execute_flow(
            &FlowId::from("f1"),
            json!({
                "data": { "x": 1 },
                "metadata": { "source": { "externalExecId": "ext-1" } }
            }),
        )
        .await
        .unwrap();
    assert_eq!(flow_exec_id, FlowExecId::from("ext-1"));

    let published = harness.broker.published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].exchange, "flow-f1");
    assert_eq!(published[0].routing_key, "flow-f1.a.input");
    assert_eq!(published[0].record.task_id, "f1");
    assert_eq!(published[0].record.user_id, USER_ID);
    assert_eq!(published[0].record.step_id, StepId::from("a"));
    assert_eq!(
        published[0].message,
        json!({
            "attachments": {},
            "data": { "x": 1 },
            "metadata": { "source": { "externalExecId": "ext-1" } },
            "passthrough": {}
        })
    );

    let claims = published_claims(&harness, 0).await;
    assert_eq!(claims.flow_id, FlowId::from("f1"));
    assert_eq!(claims.step_id, StepId::from("a"));
    assert_eq!(claims.flow_exec_id, flow_exec_id);
    assert_eq!(claims.user_id.as_deref(), Some(USER_ID));
    let api_key = harness
        .tokens
        .get_token_by_flow_id(&FlowId::from("f1"))
        .await
        .unwrap();
    assert_eq!(claims.api_key, Some(api_key));

    let row = harness
        .orchestrator
        .counters()
        .find_by_flow_exec_id(&flow_exec_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.started, 1);
    assert_eq!(row.step_counter(&StepId::from("a")).unwrap().inbound, 1);
}

#[tokio::test]
async fn test_execute_flow_requires_access_token() {
    init_test_tracing();
    let harness = Harness::new();
    harness.save_components(&[Component::local("c1")]).await;
    harness
        .save_flow(linear_flow("f1", FlowStatus::Active, &[("a", "c1")]))
        .await;

    let err = harness
        .orchestrator
        .execute_flow(&FlowId::from("f1"), json!({}))
        .await
        .unwrap_err();

    assert!(err.is_not_found());
    assert!(harness.broker.published().await.is_empty());
}

#[tokio::test]
async fn test_execution_runs_to_completion() {
    init_test_tracing();
    let harness = Harness::new();
    running_flow(&harness).await;
    let flow_exec_id = harness
        .orchestrator
        .execute_flow(&FlowId::from("f1"), json!({ "data": { "x": 1 } }))
        .await
        .unwrap();
    harness
        .snapshots
        .save(&flow_exec_id, &StepId::from("a"), json!({ "cursor": 1 }))
        .await;
    let inbound = harness.orchestrator.inbound();

    let a = published_claims(&harness, 0).await;
    let outcome = inbound
        .process_message(&harness.step_output(&a, json!({ "data": { "y": 2 } }), "a-out-1"))
        .await
        .unwrap();
    assert_eq!(outcome, MessageOutcome::Dispatched(1));

    let published = harness.broker.published().await;
    assert_eq!(published.len(), 2);
    assert_eq!(published[1].routing_key, "flow-f1.b.input");
    assert_eq!(published[1].message["data"], json!({ "y": 2 }));
    assert_eq!(counters_of(&harness, flow_exec_id.as_str()).await, Some(counters_message(2, 0)));

    let outcome = inbound
        .process_message(&harness.step_state(&a, "a-state-1"))
        .await
        .unwrap();
    assert_eq!(outcome, MessageOutcome::StepStateRecorded { flow_complete: false });
    assert_eq!(counters_of(&harness, flow_exec_id.as_str()).await, Some(counters_message(2, 1)));

    let b = published_claims(&harness, 1).await;
    assert_eq!(b.step_id, StepId::from("b"));
    let outcome = inbound
        .process_message(&harness.step_output(&b, json!({ "data": {} }), "b-out-1"))
        .await
        .unwrap();
    assert_eq!(outcome, MessageOutcome::Dispatched(0));

    let outcome = inbound
        .process_message(&harness.step_state(&b, "b-state-1"))
        .await
        .unwrap();
    assert_eq!(outcome, MessageOutcome::StepStateRecorded { flow_complete: true });

    assert_eq!(counters_of(&harness, flow_exec_id.as_str()).await, None);
    assert_eq!(harness.snapshots.count(&flow_exec_id).await, 0);
    assert_eq!(harness.snapshots.purges().await, vec![flow_exec_id.clone()]);

    let records = harness
        .orchestrator
        .journal()
        .find_by_flow_exec_id(&flow_exec_id)
        .await
        .unwrap();
    assert_eq!(records.len(), 5);
    assert!(records.iter().all(|record| record.completed_at.is_some()));
}

#[tokio::test]
async fn test_redelivery_is_skipped() {
    init_test_tracing();
    let harness = Harness::new();
    running_flow(&harness).await;
    harness
        .orchestrator
        .execute_flow(&FlowId::from("f1"), json!({}))
        .await
        .unwrap();
    let a = published_claims(&harness, 0).await;
    let delivery = harness.step_output(&a, json!({ "data": {} }), "a-out-1");
    let inbound = harness.orchestrator.inbound();

    assert_eq!(inbound.process_message(&delivery).await.unwrap(), MessageOutcome::Dispatched(1));
    assert_eq!(inbound.process_message(&delivery).await.unwrap(), MessageOutcome::AlreadyProcessed);

    assert_eq!(harness.broker.published().await.len(), 2);
    assert_eq!(counters_of(&harness, a.flow_exec_id.as_str()).await, Some(counters_message(2, 0)));

    let state = harness.step_state(&a, "a-state-1");
    inbound.process_message(&state).await.unwrap();
    assert_eq!(inbound.process_message(&state).await.unwrap(), MessageOutcome::AlreadyProcessed);
    assert_eq!(counters_of(&harness, a.flow_exec_id.as_str()).await, Some(counters_message(2, 1)));
}

#[tokio::test]
async fn test_redelivery_without_broker_id_uses_message_header() {
    init_test_tracing();
    let harness = Harness::new();
    running_flow(&harness).await;
    harness
        .orchestrator
        .execute_flow(&FlowId::from("f1"), json!({}))
        .await
        .unwrap();
    let a = published_claims(&harness, 0).await;
    let inbound = harness.orchestrator.inbound();

    let first = harness
        .delivery(INPUT_ROUTING_KEY, &a, json!({ "data": { "n": 1 } }))
        .with_header("messageId", "runtime-1");
    let second = harness
        .delivery(INPUT_ROUTING_KEY, &a, json!({ "data": { "n": 2 } }))
        .with_header("messageId", "runtime-2");

    assert_eq!(inbound.process_message(&first).await.unwrap(), MessageOutcome::Dispatched(1));
    assert_eq!(inbound.process_message(&first).await.unwrap(), MessageOutcome::AlreadyProcessed);
    assert_eq!(inbound.process_message(&second).await.unwrap(), MessageOutcome::Dispatched(1));
    assert_eq!(harness.broker.published().await.len(), 3);
}

#[tokio::test]
async fn test_publish_failure_resumes_without_double_counting() {
    init_test_tracing();
    let harness = Harness::new();
    running_flow(&harness).await;
    harness
        .orchestrator
        .execute_flow(&FlowId::from("f1"), json!({}))
        .await
        .unwrap();
    let a = published_claims(&harness, 0).await;
    let delivery = harness.step_output(&a, json!({ "data": {} }), "a-out-1");
    let inbound = harness.orchestrator.inbound();

    harness.broker.fail_next_publishes(1);
    let err = inbound.process_message(&delivery).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::BrokerError(_)));
    assert_eq!(harness.broker.published().await.len(), 1);
    assert_eq!(counters_of(&harness, a.flow_exec_id.as_str()).await, Some(counters_message(2, 0)));

    assert_eq!(inbound.process_message(&delivery).await.unwrap(), MessageOutcome::Dispatched(1));

    let published = harness.broker.published().await;
    assert_eq!(published.len(), 2);
    assert_eq!(published[1].record.step_id, StepId::from("b"));

    let row = harness
        .orchestrator
        .counters()
        .find_by_flow_exec_id(&a.flow_exec_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.started, 2);
    assert_eq!(row.step_counter(&StepId::from("b")).unwrap().inbound, 1);
}

#[tokio::test]
async fn test_failed_snapshot_purge_still_completes_once() {
    init_test_tracing();
    let harness = Harness::new();
    running_flow(&harness).await;
    let flow_exec_id = harness
        .orchestrator
        .execute_flow(&FlowId::from("f1"), json!({}))
        .await
        .unwrap();
    harness
        .snapshots
        .save(&flow_exec_id, &StepId::from("a"), json!({ "cursor": 1 }))
        .await;
    let a = published_claims(&harness, 0).await;
    let state = harness.step_state(&a, "a-state-1");
    let inbound = harness.orchestrator.inbound();

    harness.snapshots.fail_next_purges(1);
    assert_eq!(
        inbound.process_message(&state).await.unwrap(),
        MessageOutcome::StepStateRecorded { flow_complete: true }
    );
    assert_eq!(harness.snapshots.purges().await, vec![flow_exec_id.clone()]);
    assert_eq!(harness.snapshots.count(&flow_exec_id).await, 1);
    assert_eq!(counters_of(&harness, flow_exec_id.as_str()).await, None);

    assert_eq!(inbound.process_message(&state).await.unwrap(), MessageOutcome::AlreadyProcessed);
    assert_eq!(counters_of(&harness, flow_exec_id.as_str()).await, None);
    assert_eq!(harness.snapshots.purges().await.len(), 1);
}

#[tokio::test]
async fn test_fan_out_failure_lets_siblings_finish() {
    init_test_tracing();
    let harness = Harness::new();
    harness
        .save_components(&[Component::local("c1"), Component::local("c2")])
        .await;
    harness
        .save_flow(fan_out_flow("f1", FlowStatus::Active, ("r", "c1"), &[("b", "c1"), ("c", "c2")]))
        .await;
    harness
        .tokens
        .get_token_for_flow_and_user(&FlowId::from("f1"), USER_ID)
        .await
        .unwrap();
    harness
        .orchestrator
        .execute_flow(&FlowId::from("f1"), json!({}))
        .await
        .unwrap();
    let r = published_claims(&harness, 0).await;
    let delivery = harness.step_output(&r, json!({ "data": {} }), "r-out-1");
    let inbound = harness.orchestrator.inbound();

    harness
        .broker
        .delay_publishes_to("flow-f1.b.input", Duration::from_millis(50))
        .await;
    harness.broker.fail_next_publishes_to("flow-f1.c.input", 1).await;

    let err = inbound.process_message(&delivery).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::BrokerError(_)));

    assert_eq!(inbound.process_message(&delivery).await.unwrap(), MessageOutcome::Dispatched(2));

    let routing_keys: Vec<String> = harness
        .broker
        .published()
        .await
        .into_iter()
        .map(|message| message.routing_key)
        .collect();
    assert_eq!(routing_keys, vec!["flow-f1.r.input", "flow-f1.b.input", "flow-f1.c.input"]);

    let row = harness
        .orchestrator
        .counters()
        .find_by_flow_exec_id(&r.flow_exec_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.started, 3);
    assert_eq!(row.step_counter(&StepId::from("b")).unwrap().inbound, 1);
    assert_eq!(row.step_counter(&StepId::from("c")).unwrap().inbound, 1);
}

#[tokio::test]
async fn test_rejects_unsigned_and_malformed_deliveries() {
    init_test_tracing();
    let harness = Harness::new();
    running_flow(&harness).await;
    let inbound = harness.orchestrator.inbound();
    let flow = harness.flow("f1").await;
    let claims = claims_for(&flow, "a", "e1", false);

    let unsigned = InboundMessage::new(INPUT_ROUTING_KEY, json!({}).to_string());
    assert!(matches!(
        inbound.process_message(&unsigned).await.unwrap_err(),
        OrchestratorError::TokenError(_)
    ));

    let forged = InboundMessage::new(INPUT_ROUTING_KEY, json!({}).to_string())
        .with_header(ORCHESTRATOR_TOKEN_HEADER, "not-a-token");
    assert!(matches!(
        inbound.process_message(&forged).await.unwrap_err(),
        OrchestratorError::TokenError(_)
    ));

    let token = harness.signer.sign(&claims).unwrap();
    let garbage = InboundMessage::new(INPUT_ROUTING_KEY, "{not json")
        .with_header(ORCHESTRATOR_TOKEN_HEADER, token);
    assert!(matches!(
        inbound.process_message(&garbage).await.unwrap_err(),
        OrchestratorError::ValidationError(_)
    ));

    assert!(harness.broker.published().await.is_empty());
}

/// Flow `f1` running `router -> b` where `router` is privileged, plus
/// `f2` owned by the same user and `f3` owned by someone else
async fn routing_setup(harness: &Harness) -> ContinuationClaims {
    harness
        .save_components(&[privileged("router"), Component::local("c1")])
        .await;
    harness
        .save_flow(linear_flow("f1", FlowStatus::Active, &[("router", "router"), ("b", "c1")]))
        .await;
    harness
        .save_flow(linear_flow("f2", FlowStatus::Active, &[("x", "c1")]))
        .await;
    let mut foreign = linear_flow("f3", FlowStatus::Active, &[("x", "c1")]);
    foreign.started_by = Some("user-2".to_string());
    harness.save_flow(foreign).await;

    harness
        .orchestrator
        .counters()
        .upsert_state(&FlowId::from("f1"), &FlowExecId::from("e1"), None)
        .await
        .unwrap();

    let flow = harness.flow("f1").await;
    claims_for(&flow, "router", "e1", true)
}

#[tokio::test]
async fn test_run_next_steps_validation_mutates_nothing() {
    init_test_tracing();
    let harness = Harness::new();
    let claims = routing_setup(&harness).await;
    let inbound = harness.orchestrator.inbound();

    let cases = [
        (json!([]), "parameters"),
        (json!(["f1:b", "f1:nope"]), "Target step \"nope\" not found in flow \"f1\""),
        (json!(["ghost:b"]), "Target flow \"ghost\" not started"),
        (json!(["f3:x"]), "Execution not permitted for user \"user-1\""),
    ];

    for (index, (parameters, expected)) in cases.into_iter().enumerate() {
        let delivery = harness.step_output(
            &claims,
            json!({ "command": "run-next-steps", "parameters": parameters }),
            &format!("cmd-{}", index),
        );
        match inbound.process_message(&delivery).await {
            Err(OrchestratorError::ValidationError(message)) => {
                assert!(message.contains(expected), "{} does not mention {}", message, expected)
            }
            other => panic!("Expected validation error, got {:?}", other),
        }
    }

    assert!(harness.broker.published().await.is_empty());
    assert_eq!(counters_of(&harness, "e1").await, Some(counters_message(1, 0)));
}

#[tokio::test]
async fn test_run_next_steps_dispatches_explicit_targets() {
    init_test_tracing();
    let harness = Harness::new();
    let claims = routing_setup(&harness).await;

    let delivery = harness.step_output(
        &claims,
        json!({
            "command": "run-next-steps",
            "parameters": ["b", "f2:x"],
            "data": { "routed": true }
        }),
        "cmd-1",
    );
    let outcome = harness
        .orchestrator
        .inbound()
        .process_message(&delivery)
        .await
        .unwrap();
    assert_eq!(outcome, MessageOutcome::RanNextSteps(2));

    let mut routing_keys: Vec<String> = harness
        .broker
        .published()
        .await
        .into_iter()
        .map(|message| {
            assert_eq!(message.message["data"], json!({ "routed": true }));
            assert!(message.message.get("command").is_none());
            message.routing_key
        })
        .collect();
    routing_keys.sort();
    assert_eq!(routing_keys, vec!["flow-f1.b.input", "flow-f2.x.input"]);
    assert_eq!(counters_of(&harness, "e1").await, Some(counters_message(3, 1)));
}

#[tokio::test]
async fn test_run_next_steps_keeps_equal_step_ids_of_different_flows_apart() {
    init_test_tracing();
    let harness = Harness::new();
    let claims = routing_setup(&harness).await;
    harness
        .save_flow(linear_flow("f4", FlowStatus::Active, &[("b", "c1")]))
        .await;

    let delivery = harness.step_output(
        &claims,
        json!({ "command": "run-next-steps", "parameters": ["b", "f4:b"] }),
        "cmd-1",
    );
    let outcome = harness
        .orchestrator
        .inbound()
        .process_message(&delivery)
        .await
        .unwrap();
    assert_eq!(outcome, MessageOutcome::RanNextSteps(2));

    let mut routing_keys: Vec<String> = harness
        .broker
        .published()
        .await
        .into_iter()
        .map(|message| message.routing_key)
        .collect();
    routing_keys.sort();
    assert_eq!(routing_keys, vec!["flow-f1.b.input", "flow-f4.b.input"]);

    let row = harness
        .orchestrator
        .counters()
        .find_by_flow_exec_id(&FlowExecId::from("e1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.started, 3);
    assert_eq!(row.step_counter(&StepId::from("b")).unwrap().inbound, 2);
}

#[tokio::test]
async fn test_void_completes_the_execution() {
    init_test_tracing();
    let harness = Harness::new();
    let claims = routing_setup(&harness).await;

    let outcome = harness
        .orchestrator
        .inbound()
        .process_message(&harness.step_output(&claims, json!({ "command": "void" }), "void-1"))
        .await
        .unwrap();

    assert_eq!(outcome, MessageOutcome::Voided { flow_complete: true });
    assert!(harness.broker.published().await.is_empty());
    assert_eq!(counters_of(&harness, "e1").await, None);
}

#[tokio::test]
async fn test_commands_need_a_privileged_component() {
    init_test_tracing();
    let harness = Harness::new();
    let mut claims = routing_setup(&harness).await;
    claims.special_flags.privileged_component = false;

    let outcome = harness
        .orchestrator
        .inbound()
        .process_message(&harness.step_output(&claims, json!({ "command": "void" }), "void-1"))
        .await
        .unwrap();

    assert_eq!(outcome, MessageOutcome::Dispatched(1));
    assert_eq!(counters_of(&harness, "e1").await, Some(counters_message(2, 0)));
}

#[tokio::test]
async fn test_unknown_command_follows_the_graph() {
    init_test_tracing();
    let harness = Harness::new();
    let claims = routing_setup(&harness).await;

    let outcome = harness
        .orchestrator
        .inbound()
        .process_message(&harness.step_output(
            &claims,
            json!({ "command": "rewind", "parameters": ["b"], "data": { "k": 1 } }),
            "cmd-1",
        ))
        .await
        .unwrap();

    assert_eq!(outcome, MessageOutcome::Dispatched(1));
    let published = harness.broker.published().await;
    assert_eq!(published[0].routing_key, "flow-f1.b.input");
    assert_eq!(published[0].message["data"], json!({ "k": 1 }));
}

#[tokio::test]
async fn test_step_errors_are_counted() {
    init_test_tracing();
    let harness = Harness::new();
    let claims = routing_setup(&harness).await;
    let inbound = harness.orchestrator.inbound();

    let report = harness
        .delivery("orchestrator_backchannel.error", &claims, json!({ "error": "boom" }))
        .with_header("reboundReason", "timeout");
    inbound.process_error(&report).await.unwrap();

    let unparsable = InboundMessage::new("orchestrator_backchannel.error", "oops")
        .with_header(ORCHESTRATOR_TOKEN_HEADER, harness.signer.sign(&claims).unwrap());
    inbound.process_error(&unparsable).await.unwrap();

    let row = harness
        .orchestrator
        .counters()
        .find_by_flow_exec_id(&FlowExecId::from("e1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.errors, 2);
    assert_eq!(row.step_counter(&StepId::from("router")).unwrap().errors, 2);

    let unsigned = InboundMessage::new("orchestrator_backchannel.error", "{}");
    assert!(inbound.process_error(&unsigned).await.is_err());
}
