//! Cross-module scenarios: commands through the registry and context,
//! crews over agents, and requests through the orchestrator.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Value};

use taskforge::events::{
    AGENT_COMPLETED, COMMAND_EXECUTED, CREW_KICKOFF_COMPLETED, ORCHESTRATOR_DISPATCHED,
};
use taskforge::{
    Agent, AgentConfig, AppContext, Command, CommandContext, CommandRegistry, Crew, CrewConfig,
    EngineError, EventBus, EventBusConfig, ExecutionOptions, FieldRule, NullContext,
    Orchestrator, ProcessKind, Request, Schema, Task, ToolDescriptor, ValueKind,
};

fn null_ctx() -> Arc<dyn CommandContext> {
    Arc::new(NullContext)
}

fn failing_agent(role: &str, keyword: &str) -> Agent {
    Agent::new(AgentConfig::new(role, "")).with_tool(
        ToolDescriptor::new("unstable", |_task: Task, _ctx: Value| async {
            Err(EngineError::handler("tool crashed"))
        })
        .with_keywords([keyword]),
    )
}

/// Agent whose single tool records the context it was invoked with
fn recording_agent(role: &str, seen: Arc<Mutex<Vec<Value>>>) -> Agent {
    Agent::new(AgentConfig::new(role, "")).with_tool(
        ToolDescriptor::new("recorder", move |_task: Task, ctx: Value| {
            seen.lock().push(ctx);
            async { Ok(json!("recorded")) }
        })
        .with_condition(|_task, _ctx| true),
    )
}

// === Commands ===

#[tokio::test]
async fn scenario_echo_command() {
    let registry = CommandRegistry::new();
    registry
        .register(Command::new("echo", |_ctx, params: Value, _opts| async move {
            Ok(params["value"].clone())
        }))
        .unwrap();

    let result = registry
        .execute("echo", null_ctx(), json!({"value": "hi"}), ExecutionOptions::default())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.data, Some(json!("hi")));
}

#[tokio::test]
async fn scenario_strict_command_validation() {
    let registry = CommandRegistry::new();
    registry
        .register(
            Command::new("strict", |_ctx, _params, _opts| async { Ok(Value::Null) }).with_input_schema(
                Schema::fields().field("x", FieldRule::new().required().of_type(ValueKind::Number)),
            ),
        )
        .unwrap();

    let result = registry
        .execute("strict", null_ctx(), json!({}), ExecutionOptions::default())
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.code(), Some("VALIDATION_ERROR"));
}

#[tokio::test(start_paused = true)]
async fn always_failing_handler_runs_retries_plus_one() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let cmd = Command::new("flaky", move |_ctx, _params, _opts| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err(EngineError::handler("down")) }
    })
    .with_retries(2);

    let result = cmd.execute(null_ctx(), Value::Null, ExecutionOptions::default()).await;

    assert!(!result.success);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn never_resolving_handler_times_out_promptly() {
    let cmd = Command::new("hang", |_ctx, _params, _opts| std::future::pending::<taskforge::Result<Value>>())
        .with_timeout(50);

    let started = Instant::now();
    let result = cmd.execute(null_ctx(), Value::Null, ExecutionOptions::default()).await;

    assert!(!result.success);
    assert_eq!(result.error.unwrap().name, "TimeoutError");
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn context_state_and_events_flow_through_registry() {
    let bus = EventBus::new();
    let registry = Arc::new(CommandRegistry::new().with_event_bus(bus.clone()));
    registry
        .register(Command::new("set-locus", |ctx: Arc<dyn CommandContext>, params: Value, _opts| async move {
            ctx.set_state("locus", params["locus"].clone(), None);
            Ok(json!(true))
        }))
        .unwrap();
    let ctx = AppContext::new(Arc::clone(&registry), bus.clone());

    ctx.execute("set-locus", json!({"locus": "chr17:43044295"})).await.unwrap();

    assert_eq!(ctx.get_state("locus"), Some(json!("chr17:43044295")));
    let executed = bus.history_for(COMMAND_EXECUTED);
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].data["success"], true);
}

// === Event bus ===

#[test]
fn scenario_history_cap() {
    let bus = EventBus::with_config(EventBusConfig {
        max_history_size: 2,
        ..Default::default()
    });
    for name in ["E1", "E2", "E3"] {
        bus.emit(name, Value::Null);
    }

    let names: Vec<String> = bus.history().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["E2", "E3"]);
}

#[test]
fn emit_async_blocks_to_completion() {
    let bus = EventBus::new();
    let event = tokio_test::block_on(bus.emit_async("ping", json!(1)));
    assert_eq!(event.data, json!(1));
    assert_eq!(bus.metrics().events_emitted, 1);
}

// === Crews ===

#[tokio::test]
async fn scenario_sequential_crew_with_one_failure() {
    let crew = Crew::new(CrewConfig::new("pair", ProcessKind::Sequential))
        .with_agent(failing_agent("agent1", "t1"))
        .with_agent(Agent::new(AgentConfig::new("agent2", "")))
        .with_task(Task::new("t1"))
        .with_task(Task::new("t2"));

    let output = crew.kickoff(Value::Null).await;

    assert!(!output.success);
    assert_eq!(output.results.len(), 2);
    assert!(!output.results[0].success);
    assert!(output.results[1].success);
}

#[tokio::test]
async fn sequential_context_carries_previous_result_only_on_success() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let crew = Crew::new(CrewConfig::new("chain", ProcessKind::Sequential))
        .with_agent(recording_agent("recorder", Arc::clone(&seen)))
        .with_agent(failing_agent("breaker", "break"))
        .with_task(Task::new("collect").for_agent("recorder"))
        .with_task(Task::new("break things").for_agent("breaker"))
        .with_task(Task::new("collect again").for_agent("recorder"))
        .with_task(Task::new("collect once more").for_agent("recorder"));

    crew.kickoff(json!({"genome": "hg38"})).await;

    let seen = seen.lock();
    assert_eq!(seen.len(), 3);
    assert!(seen[0].get("task_0_result").is_none());
    assert_eq!(seen[0]["genome"], "hg38");
    // task 2 follows a failed task 1
    assert!(seen[1].get("task_1_result").is_none());
    assert!(seen[1].get("task_0_result").is_some());
    // task 3 follows a successful task 2
    assert!(seen[2].get("task_2_result").is_some());
}

#[tokio::test]
async fn parallel_crew_reports_every_task() {
    let bus = EventBus::new();
    let crew = Crew::new(CrewConfig::new("fanout", ProcessKind::Parallel))
        .with_event_bus(bus.clone())
        .with_agent(Agent::new(AgentConfig::new("ok", "")).with_event_bus(bus.clone()))
        .with_agent(failing_agent("bad", "fetch"))
        .with_task(Task::new("zoom"))
        .with_task(Task::new("fetch uniprot"))
        .with_task(Task::new("search"));

    let output = crew.kickoff(Value::Null).await;

    assert!(output.success);
    assert_eq!(output.results.len(), 3);
    assert!(!output.results[1].success);
    assert_eq!(bus.history_for(AGENT_COMPLETED).len(), 2);
    assert_eq!(bus.history_for(CREW_KICKOFF_COMPLETED).len(), 1);
}

// === Orchestrator ===

#[tokio::test]
async fn orchestrator_routes_commands_and_crews() {
    let bus = EventBus::new();
    let registry = Arc::new(CommandRegistry::new().with_event_bus(bus.clone()));
    registry
        .register(
            Command::new("gc-content", |_ctx, params: Value, _opts| async move {
                let seq = params["sequence"].as_str().unwrap_or_default().to_uppercase();
                let gc = seq.chars().filter(|c| *c == 'G' || *c == 'C').count();
                Ok(json!(gc as f64 / seq.len().max(1) as f64))
            })
            .with_category("sequence"),
        )
        .unwrap();
    registry.alias("gc", "gc-content").unwrap();

    let orchestrator = Arc::new(Orchestrator::new(registry, bus.clone()));
    orchestrator.register_crew(
        Crew::new(CrewConfig::new("navigators", ProcessKind::Sequential))
            .with_agent(Agent::new(AgentConfig::new("navigator", "move around the genome"))),
        &["navigation"],
    );

    let command = orchestrator
        .dispatch(Request::command("gc", json!({"sequence": "GGCCAT"})))
        .await;
    assert!(command.success);
    assert_eq!(command.route.as_deref(), Some("command:gc-content"));

    let (channel, service) = Arc::clone(&orchestrator).with_channel();
    let id = channel.submit(Request::new("jump to chr3")).unwrap();
    let outcome = channel.recv().await.unwrap();
    assert_eq!(outcome.request_id, id);
    assert!(outcome.success);
    assert_eq!(outcome.route.as_deref(), Some("crew:navigators/sequential"));

    drop(channel);
    service.await.unwrap();

    let metrics = orchestrator.metrics();
    assert_eq!(metrics.dispatched, 2);
    assert_eq!(metrics.command_routes, 1);
    assert_eq!(metrics.crew_routes, 1);
    assert_eq!(bus.history_for(ORCHESTRATOR_DISPATCHED).len(), 2);
}
