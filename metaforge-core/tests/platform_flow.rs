//! End-to-end flows across the compiler, policy, validation, lifecycle,
//! approval, timer, and data services wired over in-memory capabilities.

use metaforge_core::approval::{
    ApprovalStore, ApprovalTemplate, Assignee, AssignmentRule, DecisionVerb, InstanceStatus,
    StageMode, TaskType, TemplateStage,
};
use metaforge_core::bus::PlatformMessage;
use metaforge_core::config::PlatformConfig;
use metaforge_core::context::{now_ms, RequestContext};
use metaforge_core::error::PlatformError;
use metaforge_core::jobs::JobQueue;
use metaforge_core::lifecycle::{
    Lifecycle, LifecycleState, LifecycleStore, LifecycleTransition, RoutingRule, TransitionGate,
};
use metaforge_core::policy::condition::{Condition, ConditionOp, Record};
use metaforge_core::schema::{
    EntitySchema, FieldDef, FieldType, OnDelete, PolicyAction, PolicyDef, PolicyEffect,
    SchemaRegistry,
};
use metaforge_core::timer::{DelayType, TimerPolicy, TimerStatus, TimerType, TimerStore};
use metaforge_core::Platform;
use serde_json::json;
use uuid::Uuid;

/// Fully wired in-memory platform with a tracing subscriber installed once
/// for the test binary (later calls are no-ops).
fn test_platform() -> Platform {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    Platform::in_memory(PlatformConfig::default())
}

fn allow_all(resource: &str) -> PolicyDef {
    PolicyDef {
        name: format!("{resource}_allow_all"),
        effect: PolicyEffect::Allow,
        action: PolicyAction::All,
        resource: resource.to_string(),
        conditions: vec![],
        fields: None,
        priority: 0,
    }
}

fn user_ctx(tenant: Uuid) -> RequestContext {
    RequestContext::new(Uuid::now_v7(), tenant, "core", vec!["user".to_string()])
}

async fn publish_entity(
    platform: &Platform,
    name: &str,
    extra_fields: Vec<FieldDef>,
    policies: Vec<PolicyDef>,
    ctx: &RequestContext,
) {
    let mut schema = EntitySchema::new(name, 1).with_system_fields();
    schema.fields.extend(extra_fields);
    schema.policies = policies;
    platform.registry.save_draft(&schema).await.unwrap();
    platform.compiler.publish(name, 1, &[], ctx).await.unwrap();
}

struct LifecycleSpec<'a> {
    entity: &'a str,
    states: &'a [(&'a str, i32, bool)],
    transitions: &'a [(&'a str, &'a str, &'a str, Vec<TransitionGate>)],
}

async fn install_lifecycle(platform: &Platform, spec: LifecycleSpec<'_>) -> Lifecycle {
    let states: Vec<LifecycleState> = spec
        .states
        .iter()
        .map(|(code, sort_order, terminal)| LifecycleState {
            id: Uuid::now_v7(),
            code: code.to_string(),
            is_terminal: *terminal,
            sort_order: *sort_order,
        })
        .collect();
    let state_id = |code: &str| states.iter().find(|s| s.code == code).unwrap().id;

    let transitions: Vec<LifecycleTransition> = spec
        .transitions
        .iter()
        .map(|(from, to, operation, gates)| LifecycleTransition {
            id: Uuid::now_v7(),
            from_state: state_id(from),
            to_state: state_id(to),
            operation_code: operation.to_string(),
            is_active: true,
            gates: gates.clone(),
        })
        .collect();

    let lifecycle = Lifecycle {
        id: Uuid::now_v7(),
        code: format!("{}_default", spec.entity.to_lowercase()),
        version_no: 1,
        is_active: true,
        states,
        transitions,
    };
    platform
        .lifecycle_store
        .save_lifecycle(&lifecycle)
        .await
        .unwrap();
    platform
        .lifecycle_store
        .save_routing_rules(
            spec.entity,
            &[RoutingRule {
                id: Uuid::now_v7(),
                priority: 0,
                conditions: vec![],
                lifecycle_id: lifecycle.id,
            }],
        )
        .await
        .unwrap();
    lifecycle
}

fn record(pairs: &[(&str, serde_json::Value)]) -> Record {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

// ─── Create / read / lifecycle seeding ────────────────────────

#[tokio::test]
async fn create_seeds_lifecycle_and_read_round_trips() {
    let platform = test_platform();
    let tenant = Uuid::now_v7();
    let ctx = user_ctx(tenant);

    publish_entity(
        &platform,
        "Ticket",
        vec![
            FieldDef::new("title", FieldType::String).required(),
            FieldDef::new("priority", FieldType::Number),
        ],
        vec![allow_all("Ticket")],
        &ctx,
    )
    .await;
    install_lifecycle(
        &platform,
        LifecycleSpec {
            entity: "Ticket",
            states: &[("OPEN", 10, false), ("CLOSED", 20, true)],
            transitions: &[("OPEN", "CLOSED", "CLOSE", vec![])],
        },
    )
    .await;

    let created = platform
        .data
        .create(
            "Ticket",
            record(&[("title", json!("Printer on fire")), ("priority", json!(2))]),
            &ctx,
        )
        .await
        .unwrap();
    let id = Uuid::parse_str(created.get("id").unwrap().as_str().unwrap()).unwrap();
    assert_eq!(created.get("version"), Some(&json!(1)));

    // Routing resolved a lifecycle: the instance exists at the initial state.
    let instance = platform
        .lifecycle
        .get_instance("Ticket", id, &ctx)
        .await
        .unwrap()
        .expect("instance must exist after create");
    let events = platform
        .lifecycle_store
        .load_events(instance.id)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].operation_code, "CREATE");

    // Read returns the same data modulo system fields.
    let read = platform
        .data
        .read("Ticket", id, &ctx, false, None)
        .await
        .unwrap();
    assert_eq!(read.get("title"), Some(&json!("Printer on fire")));
    assert_eq!(read.get("priority"), Some(&json!(2)));
}

#[tokio::test]
async fn deny_wins_end_to_end_and_is_logged() {
    let platform = test_platform();
    let tenant = Uuid::now_v7();
    let ctx = user_ctx(tenant);

    publish_entity(
        &platform,
        "Invoice",
        vec![FieldDef::new("amount", FieldType::Number)],
        vec![
            PolicyDef {
                name: "invoice_read".to_string(),
                effect: PolicyEffect::Allow,
                action: PolicyAction::Read,
                resource: "Invoice".to_string(),
                conditions: vec![],
                fields: None,
                priority: 10,
            },
            PolicyDef {
                name: "deny_guest_read".to_string(),
                effect: PolicyEffect::Deny,
                action: PolicyAction::Read,
                resource: "Invoice".to_string(),
                conditions: vec![Condition::new(
                    "ctx.roles",
                    ConditionOp::In,
                    json!(["guest"]),
                )],
                fields: None,
                priority: 0,
            },
        ],
        &ctx,
    )
    .await;

    let mut guest = user_ctx(tenant);
    guest.roles.push("guest".to_string());
    let err = platform
        .data
        .read("Invoice", Uuid::now_v7(), &guest, false, None)
        .await
        .unwrap_err();
    assert_eq!(err.code().as_str(), "Unauthorized");

    let entries = platform.decision_log.entries().await;
    let deny = entries.iter().find(|e| e.effect == "deny").unwrap();
    assert_eq!(deny.matched_rule_id.as_deref(), Some("deny_guest_read"));
}

// ─── Approval-gated transition ────────────────────────────────

#[tokio::test]
async fn approval_gate_initiates_then_completes_transition() {
    let platform = test_platform();
    let tenant = Uuid::now_v7();
    let ctx = user_ctx(tenant);

    let approver = Uuid::now_v7();
    platform.identity.grant_role(tenant, approver, "approver").await;

    let template = ApprovalTemplate {
        id: Uuid::now_v7(),
        code: "submit_review".to_string(),
        version_no: 1,
        is_active: true,
        stages: vec![TemplateStage {
            stage_no: 1,
            mode: StageMode::Serial,
            quorum: None,
        }],
        rules: vec![AssignmentRule {
            id: Uuid::now_v7(),
            priority: 0,
            stage_no: Some(1),
            conditions: vec![],
            assign_to: Assignee::Role {
                role: "approver".to_string(),
            },
            task_type: TaskType::Approver,
        }],
        default_reviewer: None,
        task_due_ms: None,
        compiled_hash: "t".to_string(),
    };
    platform.approval_store.save_template(&template).await.unwrap();

    publish_entity(
        &platform,
        "Expense",
        vec![FieldDef::new("amount", FieldType::Number)],
        vec![allow_all("Expense")],
        &ctx,
    )
    .await;
    install_lifecycle(
        &platform,
        LifecycleSpec {
            entity: "Expense",
            states: &[("DRAFT", 10, false), ("PENDING", 20, false)],
            transitions: &[(
                "DRAFT",
                "PENDING",
                "SUBMIT",
                vec![TransitionGate {
                    required_operations: vec![],
                    approval_template_id: Some(template.id),
                    conditions: vec![],
                    threshold_rules: vec![],
                }],
            )],
        },
    )
    .await;

    let created = platform
        .data
        .create("Expense", record(&[("amount", json!(950))]), &ctx)
        .await
        .unwrap();
    let id = Uuid::parse_str(created.get("id").unwrap().as_str().unwrap()).unwrap();

    // First call initiates the approval and denies.
    let err = platform
        .data
        .transition("Expense", id, "SUBMIT", &ctx, None)
        .await
        .unwrap_err();
    assert_eq!(err.code().as_str(), "ApprovalPending");

    let approval = platform
        .approval_store
        .latest_instance_for(tenant, "Expense", id)
        .await
        .unwrap()
        .expect("approval instance created by the gate");
    assert_eq!(approval.status, InstanceStatus::Open);
    let stages = platform.approval_store.load_stages(approval.id).await.unwrap();
    assert_eq!(stages.len(), 1);

    // Re-calling while open stays denied, without a second instance.
    let err = platform
        .data
        .transition("Expense", id, "SUBMIT", &ctx, None)
        .await
        .unwrap_err();
    assert_eq!(err.code().as_str(), "ApprovalPending");

    // Approve every task; completion lands on the bus.
    let mut feed = platform.take_bus_feed().await.unwrap();
    let approver_ctx = RequestContext::new(approver, tenant, "core", vec!["approver".into()]);
    for task in platform
        .approval_store
        .load_tasks_for_instance(approval.id)
        .await
        .unwrap()
    {
        platform
            .approvals
            .decide(task.id, DecisionVerb::Approve, None, &approver_ctx)
            .await
            .unwrap();
    }
    let message = feed.recv().await.unwrap();
    assert!(matches!(message, PlatformMessage::ApprovalCompleted { .. }));

    // The manager consumes the message and re-runs the gated transition.
    platform.lifecycle.consume(message).await;

    let instance = platform
        .lifecycle
        .get_instance("Expense", id, &ctx)
        .await
        .unwrap()
        .unwrap();
    let lifecycle = platform
        .lifecycle_store
        .load_lifecycle(instance.lifecycle_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lifecycle.state(instance.state_id).unwrap().code, "PENDING");

    // Exactly one CREATE and one SUBMIT event.
    let events = platform
        .lifecycle_store
        .load_events(instance.id)
        .await
        .unwrap();
    let codes: Vec<&str> = events.iter().map(|e| e.operation_code.as_str()).collect();
    assert_eq!(codes, vec!["CREATE", "SUBMIT"]);
}

// ─── Threshold gates ──────────────────────────────────────────

#[tokio::test]
async fn threshold_block_denies_transition() {
    use metaforge_core::lifecycle::{ThresholdAction, ThresholdOp, ThresholdRule};

    let platform = test_platform();
    let tenant = Uuid::now_v7();
    let ctx = user_ctx(tenant);

    publish_entity(
        &platform,
        "Payout",
        vec![FieldDef::new("amount", FieldType::Number)],
        vec![allow_all("Payout")],
        &ctx,
    )
    .await;
    install_lifecycle(
        &platform,
        LifecycleSpec {
            entity: "Payout",
            states: &[("NEW", 10, false), ("SENT", 20, true)],
            transitions: &[(
                "NEW",
                "SENT",
                "SEND",
                vec![TransitionGate {
                    required_operations: vec![],
                    approval_template_id: None,
                    conditions: vec![],
                    threshold_rules: vec![ThresholdRule {
                        field: "amount".to_string(),
                        op: ThresholdOp::Gt,
                        value: json!(10_000),
                        action: ThresholdAction::Block,
                    }],
                }],
            )],
        },
    )
    .await;

    let big = platform
        .data
        .create("Payout", record(&[("amount", json!(50_000))]), &ctx)
        .await
        .unwrap();
    let big_id = Uuid::parse_str(big.get("id").unwrap().as_str().unwrap()).unwrap();
    let err = platform
        .data
        .transition("Payout", big_id, "SEND", &ctx, None)
        .await
        .unwrap_err();
    assert_eq!(err.code().as_str(), "Unauthorized");

    let small = platform
        .data
        .create("Payout", record(&[("amount", json!(100))]), &ctx)
        .await
        .unwrap();
    let small_id = Uuid::parse_str(small.get("id").unwrap().as_str().unwrap()).unwrap();
    let result = platform
        .data
        .transition("Payout", small_id, "SEND", &ctx, None)
        .await
        .unwrap();
    assert_eq!(result.state_code, "SENT");

    // SENT is terminal: further updates are refused.
    let err = platform
        .data
        .update(
            "Payout",
            small_id,
            record(&[("amount", json!(1)), ("_version", json!(1))]),
            &ctx,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code().as_str(), "Terminal");
}

// ─── Timers ───────────────────────────────────────────────────

async fn timer_fixture(
    platform: &Platform,
    ctx: &RequestContext,
    policy: TimerPolicy,
) -> (Uuid, Uuid) {
    publish_entity(
        platform,
        "Case",
        vec![FieldDef::new("subject", FieldType::String)],
        vec![allow_all("Case")],
        ctx,
    )
    .await;
    install_lifecycle(
        platform,
        LifecycleSpec {
            entity: "Case",
            states: &[("OPEN", 10, false), ("CLOSED", 20, true)],
            transitions: &[
                ("OPEN", "CLOSED", "CLOSE", vec![]),
                ("OPEN", "CLOSED", "AUTO_TRANSITION", vec![]),
            ],
        },
    )
    .await;

    platform.timer_store.save_policy(&policy).await.unwrap();
    let created = platform
        .data
        .create("Case", record(&[("subject", json!("overdue invoice"))]), ctx)
        .await
        .unwrap();
    let id = Uuid::parse_str(created.get("id").unwrap().as_str().unwrap()).unwrap();
    (policy.id, id)
}

fn auto_close_policy(delay_ms: i64, cancel_on_any: bool) -> TimerPolicy {
    TimerPolicy {
        id: Uuid::now_v7(),
        code: "auto_close".to_string(),
        timer_type: TimerType::AutoClose,
        delay_type: DelayType::Fixed,
        delay_ms,
        delay_from_field: None,
        delay_offset_ms: 0,
        target_operation_code: None,
        conditions: vec![],
        cancel_on_any_transition: cancel_on_any,
        cancel_on_states: vec![],
        is_active: true,
    }
}

#[tokio::test]
async fn manual_transition_cancels_scheduled_timer() {
    let platform = test_platform();
    let tenant = Uuid::now_v7();
    let ctx = user_ctx(tenant);

    let day_ms = 24 * 3600 * 1000;
    let (policy_id, case_id) =
        timer_fixture(&platform, &ctx, auto_close_policy(day_ms, true)).await;

    let schedule = platform
        .timers
        .schedule_timer(policy_id, "Case", case_id, &ctx, None)
        .await
        .unwrap()
        .expect("timer scheduled");
    assert_eq!(platform.queue.pending().await, 1);

    // Manual close an hour in: the timer is canceled and the job removed.
    platform
        .data
        .transition("Case", case_id, "CLOSE", &ctx, None)
        .await
        .unwrap();

    let row = platform
        .timer_store
        .load_schedule(schedule.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, TimerStatus::Canceled);
    assert_eq!(platform.queue.pending().await, 0);

    // Past the original fire time nothing is due, and no event appears.
    let due = platform
        .queue
        .take_due(now_ms() + day_ms + 1000, 10)
        .await
        .unwrap();
    assert!(due.is_empty());
    let instance = platform
        .lifecycle
        .get_instance("Case", case_id, &ctx)
        .await
        .unwrap()
        .unwrap();
    let events = platform
        .lifecycle_store
        .load_events(instance.id)
        .await
        .unwrap();
    assert_eq!(events.len(), 2); // CREATE + CLOSE only
}

#[tokio::test]
async fn timer_fires_auto_transition_exactly_once() {
    let platform = test_platform();
    let tenant = Uuid::now_v7();
    let ctx = user_ctx(tenant);

    let (policy_id, case_id) = timer_fixture(&platform, &ctx, auto_close_policy(500, false)).await;
    let schedule = platform
        .timers
        .schedule_timer(policy_id, "Case", case_id, &ctx, None)
        .await
        .unwrap()
        .unwrap();

    let due = platform.queue.take_due(now_ms() + 1000, 10).await.unwrap();
    assert_eq!(due.len(), 1);
    platform.timer_worker.handle(&due[0]).await.unwrap();

    let instance = platform
        .lifecycle
        .get_instance("Case", case_id, &ctx)
        .await
        .unwrap()
        .unwrap();
    let lifecycle = platform
        .lifecycle_store
        .load_lifecycle(instance.lifecycle_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lifecycle.state(instance.state_id).unwrap().code, "CLOSED");

    // A second fire on the same schedule is a no-op.
    platform.timer_worker.process_timer(schedule.id).await.unwrap();
    let events = platform
        .lifecycle_store
        .load_events(instance.id)
        .await
        .unwrap();
    assert_eq!(events.len(), 2); // CREATE + AUTO_TRANSITION
}

#[tokio::test]
async fn rehydrate_reenqueues_future_timers() {
    let platform = test_platform();
    let tenant = Uuid::now_v7();
    let ctx = user_ctx(tenant);

    let (policy_id, case_id) =
        timer_fixture(&platform, &ctx, auto_close_policy(60_000, false)).await;
    let schedule = platform
        .timers
        .schedule_timer(policy_id, "Case", case_id, &ctx, None)
        .await
        .unwrap()
        .unwrap();

    // Simulate queue loss: remove the job, then rehydrate.
    platform
        .queue
        .remove_job(schedule.job_id.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(platform.queue.pending().await, 0);

    let rehydrated = platform.timers.rehydrate_timers(tenant).await.unwrap();
    assert_eq!(rehydrated, 1);
    assert_eq!(platform.queue.pending().await, 1);

    let row = platform
        .timer_store
        .load_schedule(schedule.id)
        .await
        .unwrap()
        .unwrap();
    assert_ne!(row.job_id, schedule.job_id);
}

// ─── Optimistic locking ───────────────────────────────────────

#[tokio::test]
async fn concurrent_updates_conflict_on_version() {
    let platform = test_platform();
    let tenant = Uuid::now_v7();
    let ctx = user_ctx(tenant);

    publish_entity(
        &platform,
        "Note",
        vec![FieldDef::new("body", FieldType::String)],
        vec![allow_all("Note")],
        &ctx,
    )
    .await;

    let created = platform
        .data
        .create("Note", record(&[("body", json!("v1"))]), &ctx)
        .await
        .unwrap();
    let id = Uuid::parse_str(created.get("id").unwrap().as_str().unwrap()).unwrap();

    // Two writers both read version 1; one wins, one conflicts.
    let updated = platform
        .data
        .update(
            "Note",
            id,
            record(&[("body", json!("first writer")), ("_version", json!(1))]),
            &ctx,
        )
        .await
        .unwrap();
    assert_eq!(updated.get("version"), Some(&json!(2)));

    let err = platform
        .data
        .update(
            "Note",
            id,
            record(&[("body", json!("second writer")), ("_version", json!(1))]),
            &ctx,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PlatformError::VersionConflict { .. }));

    // Updates without a version are rejected outright.
    let err = platform
        .data
        .update("Note", id, record(&[("body", json!("no version"))]), &ctx)
        .await
        .unwrap_err();
    assert_eq!(err.code().as_str(), "Validation");
}

// ─── Soft delete, cascade, restore ────────────────────────────

async fn cascade_fixture(platform: &Platform, ctx: &RequestContext) -> (Uuid, Uuid) {
    publish_entity(
        platform,
        "Customer",
        vec![FieldDef::new("name", FieldType::String)],
        vec![allow_all("Customer")],
        ctx,
    )
    .await;
    publish_entity(
        platform,
        "Order",
        vec![
            FieldDef::new("total", FieldType::Number),
            FieldDef::reference("customerId", "Customer", OnDelete::Cascade),
        ],
        vec![allow_all("Order")],
        ctx,
    )
    .await;
    publish_entity(
        platform,
        "Invoice",
        vec![
            FieldDef::new("amount", FieldType::Number),
            FieldDef::reference("orderId", "Order", OnDelete::Restrict),
        ],
        vec![allow_all("Invoice")],
        ctx,
    )
    .await;

    let customer = platform
        .data
        .create("Customer", record(&[("name", json!("ACME"))]), ctx)
        .await
        .unwrap();
    let customer_id =
        Uuid::parse_str(customer.get("id").unwrap().as_str().unwrap()).unwrap();
    let order = platform
        .data
        .create(
            "Order",
            record(&[
                ("total", json!(120)),
                ("customerId", json!(customer_id)),
            ]),
            ctx,
        )
        .await
        .unwrap();
    let order_id = Uuid::parse_str(order.get("id").unwrap().as_str().unwrap()).unwrap();
    (customer_id, order_id)
}

#[tokio::test]
async fn cascade_delete_soft_deletes_orders() {
    let platform = test_platform();
    let tenant = Uuid::now_v7();
    let ctx = user_ctx(tenant);
    let (customer_id, order_id) = cascade_fixture(&platform, &ctx).await;

    platform.data.delete("Customer", customer_id, &ctx).await.unwrap();

    // Both rows are gone from normal reads but visible with includeDeleted.
    for (entity, id) in [("Customer", customer_id), ("Order", order_id)] {
        let err = platform.data.read(entity, id, &ctx, false, None).await.unwrap_err();
        assert_eq!(err.code().as_str(), "NotFound");
        let raw = platform.data.read(entity, id, &ctx, true, None).await.unwrap();
        assert!(!raw.get("deleted_at").unwrap().is_null());
    }
}

#[tokio::test]
async fn restrict_reference_blocks_delete_without_mutation() {
    let platform = test_platform();
    let tenant = Uuid::now_v7();
    let ctx = user_ctx(tenant);
    let (customer_id, order_id) = cascade_fixture(&platform, &ctx).await;

    platform
        .data
        .create(
            "Invoice",
            record(&[("amount", json!(120)), ("orderId", json!(order_id))]),
            &ctx,
        )
        .await
        .unwrap();

    let err = platform
        .data
        .delete("Customer", customer_id, &ctx)
        .await
        .unwrap_err();
    match err {
        PlatformError::RestrictViolation(referrers) => {
            assert_eq!(referrers.len(), 1);
            assert_eq!(referrers[0].entity, "Invoice");
            assert_eq!(referrers[0].count, 1);
        }
        other => panic!("expected RestrictViolation, got {other:?}"),
    }

    // No mutation happened anywhere in the tree.
    for (entity, id) in [("Customer", customer_id), ("Order", order_id)] {
        assert!(platform.data.read(entity, id, &ctx, false, None).await.is_ok());
    }
}

#[tokio::test]
async fn restore_clears_soft_delete() {
    let platform = test_platform();
    let tenant = Uuid::now_v7();
    let ctx = user_ctx(tenant);

    publish_entity(
        &platform,
        "Draft",
        vec![FieldDef::new("body", FieldType::String)],
        vec![allow_all("Draft")],
        &ctx,
    )
    .await;
    let created = platform
        .data
        .create("Draft", record(&[("body", json!("keep me"))]), &ctx)
        .await
        .unwrap();
    let id = Uuid::parse_str(created.get("id").unwrap().as_str().unwrap()).unwrap();

    platform.data.delete("Draft", id, &ctx).await.unwrap();
    let restored = platform.data.restore("Draft", id, &ctx).await.unwrap();
    assert!(restored.get("deleted_at").unwrap().is_null());

    let read = platform.data.read("Draft", id, &ctx, false, None).await.unwrap();
    assert_eq!(read.get("body"), Some(&json!("keep me")));
}

// ─── Field-level write filtering ──────────────────────────────

#[tokio::test]
async fn write_filter_drops_unauthorized_fields() {
    let platform = test_platform();
    let tenant = Uuid::now_v7();
    let ctx = user_ctx(tenant);

    publish_entity(
        &platform,
        "Profile",
        vec![
            FieldDef::new("displayName", FieldType::String),
            FieldDef::new("internalScore", FieldType::Number),
        ],
        vec![
            PolicyDef {
                name: "profile_read".to_string(),
                effect: PolicyEffect::Allow,
                action: PolicyAction::Read,
                resource: "Profile".to_string(),
                conditions: vec![],
                fields: None,
                priority: 0,
            },
            // Writes may only touch displayName.
            PolicyDef {
                name: "profile_write_narrow".to_string(),
                effect: PolicyEffect::Allow,
                action: PolicyAction::Create,
                resource: "Profile".to_string(),
                conditions: vec![],
                fields: Some(vec!["displayName".to_string()]),
                priority: 0,
            },
        ],
        &ctx,
    )
    .await;

    let created = platform
        .data
        .create(
            "Profile",
            record(&[
                ("displayName", json!("Sam")),
                ("internalScore", json!(99)),
            ]),
            &ctx,
        )
        .await
        .unwrap();
    assert_eq!(created.get("displayName"), Some(&json!("Sam")));
    // The unauthorized field never reached the row.
    assert_eq!(created.get("internalScore"), None);
}

// ─── Numbering ────────────────────────────────────────────────

#[tokio::test]
async fn numbering_assigns_sequenced_values() {
    use metaforge_core::numbering::{NumberingSequence, NumberingStore};

    let platform = test_platform();
    let tenant = Uuid::now_v7();
    let ctx = user_ctx(tenant);

    let mut schema = EntitySchema::new("Quote", 1).with_system_fields();
    schema.fields.push(FieldDef::new("number", FieldType::String));
    schema.policies = vec![allow_all("Quote")];
    schema
        .metadata
        .insert("numbering".to_string(), json!("number"));
    platform.registry.save_draft(&schema).await.unwrap();
    platform.compiler.publish("Quote", 1, &[], &ctx).await.unwrap();

    platform
        .numbering_store
        .save_sequence(&NumberingSequence {
            tenant_id: tenant,
            entity_name: "Quote".to_string(),
            prefix: "Q-".to_string(),
            padding: 4,
            pattern: None,
            counter: 0,
        })
        .await
        .unwrap();

    let first = platform.data.create("Quote", Record::new(), &ctx).await.unwrap();
    let second = platform.data.create("Quote", Record::new(), &ctx).await.unwrap();
    assert_eq!(first.get("number"), Some(&json!("Q-0001")));
    assert_eq!(second.get("number"), Some(&json!("Q-0002")));
}

// ─── Audit pipeline ───────────────────────────────────────────

#[tokio::test]
async fn mutations_flow_through_outbox_to_audit_log() {
    let platform = test_platform();
    let tenant = Uuid::now_v7();
    let ctx = user_ctx(tenant);

    publish_entity(
        &platform,
        "Memo",
        vec![FieldDef::new("body", FieldType::String)],
        vec![allow_all("Memo")],
        &ctx,
    )
    .await;
    platform
        .data
        .create("Memo", record(&[("body", json!("audit me"))]), &ctx)
        .await
        .unwrap();

    let stats = platform.drain.drain_once().await.unwrap();
    assert!(stats.persisted >= 1);

    let records = platform.audit_sink.records().await;
    assert!(records.iter().any(|r| r.event_type == "entity.created"));
    assert!(records.iter().all(|r| r.tenant_id == tenant));
}

// ─── Bulk operations ──────────────────────────────────────────

#[tokio::test]
async fn bulk_create_skips_invalid_items_and_commits_the_rest() {
    let platform = test_platform();
    let tenant = Uuid::now_v7();
    let ctx = user_ctx(tenant);

    publish_entity(
        &platform,
        "Contact",
        vec![FieldDef::new("email", FieldType::String).required()],
        vec![allow_all("Contact")],
        &ctx,
    )
    .await;

    let results = platform
        .data
        .bulk_create(
            "Contact",
            vec![
                record(&[("email", json!("a@example.com"))]),
                record(&[("email", json!(""))]), // fails required
                record(&[("email", json!("b@example.com"))]),
            ],
            &ctx,
        )
        .await
        .unwrap();

    assert_eq!(results.len(), 3);
    assert!(results[0].error.is_none());
    assert_eq!(results[1].error_code, Some("Validation"));
    assert!(results[2].error.is_none());

    let rows = platform
        .data
        .list("Contact", metaforge_core::data::Query::default(), &ctx)
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
}

// ─── Effective dating ─────────────────────────────────────────

#[tokio::test]
async fn effective_dated_reads_honor_as_of() {
    let platform = test_platform();
    let tenant = Uuid::now_v7();
    let ctx = user_ctx(tenant);

    let mut schema = EntitySchema::new("Rate", 1).with_system_fields();
    schema.fields.push(FieldDef::new("value", FieldType::Number));
    schema.fields.push(FieldDef::new("effective_from", FieldType::DateTime));
    schema.fields.push(FieldDef::new("effective_to", FieldType::DateTime));
    schema.policies = vec![allow_all("Rate")];
    schema
        .metadata
        .insert("effectiveDating".to_string(), json!(true));
    platform.registry.save_draft(&schema).await.unwrap();
    platform.compiler.publish("Rate", 1, &[], &ctx).await.unwrap();

    let tomorrow = now_ms() + 24 * 3600 * 1000;
    let created = platform
        .data
        .create(
            "Rate",
            record(&[
                ("value", json!(4.5)),
                ("effective_from", json!(tomorrow)),
            ]),
            &ctx,
        )
        .await
        .unwrap();
    let id = Uuid::parse_str(created.get("id").unwrap().as_str().unwrap()).unwrap();

    // Not yet effective at the default asOf (now).
    let err = platform.data.read("Rate", id, &ctx, false, None).await.unwrap_err();
    assert_eq!(err.code().as_str(), "NotFound");

    // Visible once asOf is past effective_from.
    let read = platform
        .data
        .read("Rate", id, &ctx, false, Some(tomorrow + 1000))
        .await
        .unwrap();
    assert_eq!(read.get("value"), Some(&json!(4.5)));
}

// ─── Available transitions ────────────────────────────────────

#[tokio::test]
async fn available_transitions_report_authorization_and_approval() {
    use metaforge_core::lifecycle::{ThresholdAction, ThresholdOp, ThresholdRule};

    let platform = test_platform();
    let tenant = Uuid::now_v7();
    let ctx = user_ctx(tenant);

    publish_entity(
        &platform,
        "Claim",
        vec![FieldDef::new("amount", FieldType::Number)],
        vec![allow_all("Claim")],
        &ctx,
    )
    .await;
    install_lifecycle(
        &platform,
        LifecycleSpec {
            entity: "Claim",
            states: &[
                ("NEW", 10, false),
                ("PAID", 20, true),
                ("WITHDRAWN", 30, true),
            ],
            transitions: &[
                (
                    "NEW",
                    "PAID",
                    "PAY",
                    vec![TransitionGate {
                        required_operations: vec![],
                        approval_template_id: None,
                        conditions: vec![],
                        threshold_rules: vec![ThresholdRule {
                            field: "amount".to_string(),
                            op: ThresholdOp::Gt,
                            value: json!(1_000),
                            action: ThresholdAction::Block,
                        }],
                    }],
                ),
                ("NEW", "WITHDRAWN", "WITHDRAW", vec![]),
            ],
        },
    )
    .await;

    let created = platform
        .data
        .create("Claim", record(&[("amount", json!(5_000))]), &ctx)
        .await
        .unwrap();
    let id = Uuid::parse_str(created.get("id").unwrap().as_str().unwrap()).unwrap();

    let mut available = platform
        .lifecycle
        .get_available_transitions("Claim", id, &ctx)
        .await
        .unwrap();
    available.sort_by(|a, b| a.operation_code.cmp(&b.operation_code));
    assert_eq!(available.len(), 2);

    let pay = &available[0];
    assert_eq!(pay.operation_code, "PAY");
    assert!(!pay.authorized);
    assert!(pay.unauthorized_reason.as_deref().unwrap().contains("threshold"));

    let withdraw = &available[1];
    assert_eq!(withdraw.operation_code, "WITHDRAW");
    assert!(withdraw.authorized);
    assert!(!withdraw.requires_approval);
}

// ─── Deadlines ────────────────────────────────────────────────

#[tokio::test]
async fn expired_deadline_times_out_before_io() {
    let platform = test_platform();
    let tenant = Uuid::now_v7();
    let ctx = user_ctx(tenant);

    publish_entity(
        &platform,
        "Task",
        vec![FieldDef::new("title", FieldType::String)],
        vec![allow_all("Task")],
        &ctx,
    )
    .await;

    let mut late = user_ctx(tenant);
    late.deadline_ms = Some(now_ms() - 1);
    let err = platform
        .data
        .read("Task", Uuid::now_v7(), &late, false, None)
        .await
        .unwrap_err();
    assert_eq!(err.code().as_str(), "Timeout");
    assert!(err.retryable());
}

#[tokio::test]
async fn set_null_references_are_nulled_on_delete() {
    let platform = test_platform();
    let tenant = Uuid::now_v7();
    let ctx = user_ctx(tenant);

    publish_entity(
        &platform,
        "Rep",
        vec![FieldDef::new("name", FieldType::String)],
        vec![allow_all("Rep")],
        &ctx,
    )
    .await;
    publish_entity(
        &platform,
        "Account",
        vec![
            FieldDef::new("name", FieldType::String),
            FieldDef::reference("repId", "Rep", OnDelete::SetNull),
        ],
        vec![allow_all("Account")],
        &ctx,
    )
    .await;

    let rep = platform
        .data
        .create("Rep", record(&[("name", json!("Jo"))]), &ctx)
        .await
        .unwrap();
    let rep_id = Uuid::parse_str(rep.get("id").unwrap().as_str().unwrap()).unwrap();
    let account = platform
        .data
        .create(
            "Account",
            record(&[("name", json!("ACME")), ("repId", json!(rep_id))]),
            &ctx,
        )
        .await
        .unwrap();
    let account_id = Uuid::parse_str(account.get("id").unwrap().as_str().unwrap()).unwrap();

    platform.data.delete("Rep", rep_id, &ctx).await.unwrap();

    // The account survives with its reference cleared.
    let read = platform
        .data
        .read("Account", account_id, &ctx, false, None)
        .await
        .unwrap();
    assert!(read.get("repId").unwrap().is_null());
}

#[tokio::test]
async fn bulk_failure_rolls_back_the_whole_batch() {
    let platform = test_platform();
    let tenant = Uuid::now_v7();
    let ctx = user_ctx(tenant);

    publish_entity(
        &platform,
        "Claim2",
        vec![FieldDef::new("amount", FieldType::Number)],
        vec![
            allow_all("Claim2"),
            // Large claims cannot be created at all: a per-item Unauthorized,
            // which is a transaction-level failure for the batch.
            PolicyDef {
                name: "deny_large_create".to_string(),
                effect: PolicyEffect::Deny,
                action: PolicyAction::Create,
                resource: "Claim2".to_string(),
                conditions: vec![Condition::new(
                    "record.amount",
                    ConditionOp::Gt,
                    json!(100),
                )],
                fields: None,
                priority: 0,
            },
        ],
        &ctx,
    )
    .await;
    install_lifecycle(
        &platform,
        LifecycleSpec {
            entity: "Claim2",
            states: &[("NEW", 10, false), ("PAID", 20, true)],
            transitions: &[("NEW", "PAID", "PAY", vec![])],
        },
    )
    .await;

    let err = platform
        .data
        .bulk_create(
            "Claim2",
            vec![
                record(&[("amount", json!(10))]),
                record(&[("amount", json!(20))]),
                record(&[("amount", json!(500))]),
            ],
            &ctx,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code().as_str(), "Unauthorized");

    // The two already-created items rolled back with the batch: no records,
    // no lifecycle instances, no outbox rows.
    let rows = platform
        .data
        .list("Claim2", metaforge_core::data::Query::default(), &ctx)
        .await
        .unwrap();
    assert!(rows.is_empty());

    let stats = platform.drain.drain_once().await.unwrap();
    assert_eq!(stats.picked, 0);
}
