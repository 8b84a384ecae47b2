//! Crew - a group of agents scheduled over a task list
//!
//! ```text
//!  sequential    T1 ─► T2 ─► T3        context accumulates task_<i>_result
//!  parallel      T1 ┐
//!                T2 ┼─► join           results keep task order
//!                T3 ┘
//!  hierarchical  agents[0] coordinates agents[1..] for each task
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::agent::{merge_context, AgentHandle, AgentStatistics, Task};
use crate::config::{CrewConfig, ProcessKind};
use crate::error::EngineError;
use crate::events::{EventBus, CREW_KICKOFF_COMPLETED, CREW_KICKOFF_STARTED};
use crate::hierarchy::{Decomposer, RolePerspectiveDecomposer};

/// Kickoff state machine: `Created → Planning → Executing → Completed | Failed`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrewPhase {
    #[default]
    Created,
    Planning,
    Executing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutcome {
    /// Position in the kickoff's task list
    pub task_index: usize,
    /// Task description
    pub task: String,
    /// Role of the agent (or coordinator) that ran the task
    pub agent: String,
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub execution_time_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrewOutput {
    pub execution_id: String,
    pub process: ProcessKind,
    /// One entry per task, in task order
    pub results: Vec<TaskOutcome>,
    pub execution_time_ms: f64,
    pub success: bool,
    pub error: Option<String>,
}

impl CrewOutput {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }
}

/// One kickoff as kept in crew history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrewRun {
    pub execution_id: String,
    pub process: ProcessKind,
    pub success: bool,
    pub tasks: usize,
    pub succeeded: usize,
    pub execution_time_ms: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrewStatistics {
    pub name: String,
    pub process: ProcessKind,
    pub kickoffs: usize,
    pub successful_kickoffs: usize,
    pub success_rate: f64,
    pub average_time_ms: f64,
    pub tasks: usize,
    pub agents: Vec<AgentStatistics>,
}

/// Agents plus a task list run under one [`ProcessKind`]
pub struct Crew {
    /// Unique crew ID
    id: Uuid,
    /// Name, process and sharing options
    config: CrewConfig,
    /// Members; the first one coordinates hierarchical runs
    agents: RwLock<Vec<AgentHandle>>,
    /// Default task list for [`Crew::kickoff`]
    tasks: RwLock<Vec<Task>>,
    /// `task_<index>_result` entries of the latest kickoff
    crew_state: RwLock<HashMap<String, Value>>,
    /// Past kickoffs, capped at `max_history`
    history: Mutex<VecDeque<CrewRun>>,
    /// Phase of the current or last kickoff
    phase: RwLock<CrewPhase>,
    /// Splits hierarchical tasks across subordinates
    decomposer: RwLock<Arc<dyn Decomposer>>,
    /// Bus for kickoff events
    events: Option<EventBus>,
}

impl Crew {
    pub fn new(config: CrewConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            agents: RwLock::new(Vec::new()),
            tasks: RwLock::new(Vec::new()),
            crew_state: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            phase: RwLock::new(CrewPhase::Created),
            decomposer: RwLock::new(Arc::new(RolePerspectiveDecomposer)),
            events: None,
        }
    }

    pub fn with_agent(self, agent: impl Into<AgentHandle>) -> Self {
        self.add_agent(agent);
        self
    }

    pub fn with_task(self, task: Task) -> Self {
        self.add_task(task);
        self
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn add_agent(&self, agent: impl Into<AgentHandle>) {
        let agent = agent.into();
        debug!(crew = %self.config.name, role = %agent.role(), "Adding agent");
        self.agents.write().push(agent);
    }

    /// Remove every agent with this role
    pub fn remove_agent(&self, role: &str) -> bool {
        let mut agents = self.agents.write();
        let before = agents.len();
        agents.retain(|a| a.role() != role);
        before != agents.len()
    }

    pub fn add_task(&self, task: Task) {
        self.tasks.write().push(task);
    }

    pub fn set_decomposer(&self, decomposer: Arc<dyn Decomposer>) {
        *self.decomposer.write() = decomposer;
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn process(&self) -> ProcessKind {
        self.config.process
    }

    pub fn config(&self) -> &CrewConfig {
        &self.config
    }

    pub fn agents(&self) -> Vec<AgentHandle> {
        self.agents.read().clone()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.tasks.read().clone()
    }

    pub fn phase(&self) -> CrewPhase {
        *self.phase.read()
    }

    pub fn crew_state(&self) -> HashMap<String, Value> {
        self.crew_state.read().clone()
    }

    pub fn history(&self) -> Vec<CrewRun> {
        self.history.lock().iter().cloned().collect()
    }

    /// Run the crew's own task list
    pub async fn kickoff(&self, inputs: Value) -> CrewOutput {
        let tasks = self.tasks();
        self.kickoff_tasks(tasks, inputs).await
    }

    /// Run an explicit task list with this crew's agents and discipline.
    /// Never fails; a crew without agents yields a failed output.
    #[instrument(skip_all, fields(crew = %self.config.name, process = %self.config.process))]
    pub async fn kickoff_tasks(&self, tasks: Vec<Task>, inputs: Value) -> CrewOutput {
        let execution_id = Uuid::new_v4().to_string();
        let process = self.config.process;
        let started = Instant::now();

        self.set_phase(CrewPhase::Planning);
        if self.config.share_crew_state {
            // results are only visible within the kickoff that produced them
            self.crew_state.write().retain(|key, _| !is_result_key(key));
        }
        let agents = self.agents();
        info!(execution_id = %execution_id, agents = agents.len(), tasks = tasks.len(), "Crew kickoff");
        self.emit(
            CREW_KICKOFF_STARTED,
            json!({
                "crew": self.config.name,
                "executionId": execution_id,
                "process": process,
                "tasks": tasks.len(),
            }),
        );

        let (results, success, error) = if agents.is_empty() {
            let err = EngineError::NoAgents(self.config.name.clone());
            warn!(error = %err, "Crew kickoff aborted");
            (Vec::new(), false, Some(err.to_string()))
        } else {
            self.set_phase(CrewPhase::Executing);
            let results = match process {
                ProcessKind::Sequential => self.run_sequential(&agents, &tasks, &inputs).await,
                ProcessKind::Parallel => self.run_parallel(&agents, &tasks, &inputs).await,
                ProcessKind::Hierarchical => self.run_hierarchical(&agents, &tasks, &inputs).await,
            };
            let success = match process {
                ProcessKind::Sequential => results.iter().all(|r| r.success),
                _ => results.is_empty() || results.iter().any(|r| r.success),
            };
            (results, success, None)
        };

        if self.config.share_crew_state {
            let mut state = self.crew_state.write();
            for outcome in results.iter().filter(|r| r.success) {
                if let Some(output) = &outcome.output {
                    state.insert(result_key(outcome.task_index), output.clone());
                }
            }
        }

        let execution_time_ms = started.elapsed().as_secs_f64() * 1_000.0;
        self.set_phase(if success { CrewPhase::Completed } else { CrewPhase::Failed });

        let output = CrewOutput {
            execution_id,
            process,
            results,
            execution_time_ms,
            success,
            error,
        };
        self.record(&output);

        info!(
            execution_id = %output.execution_id,
            success,
            succeeded = output.succeeded(),
            elapsed_ms = execution_time_ms,
            "Crew kickoff finished"
        );
        self.emit(
            CREW_KICKOFF_COMPLETED,
            json!({
                "crew": self.config.name,
                "executionId": output.execution_id,
                "success": success,
                "executionTime": execution_time_ms,
            }),
        );
        output
    }

    async fn run_sequential(&self, agents: &[AgentHandle], tasks: &[Task], inputs: &Value) -> Vec<TaskOutcome> {
        let mut accumulated = merge_context(inputs, &Value::Null);
        let mut results = Vec::with_capacity(tasks.len());

        for (index, task) in tasks.iter().enumerate() {
            let agent = select_agent(agents, task, index);
            let context = self.with_crew_state(accumulated.clone());

            let started = Instant::now();
            let result = agent.execute(task, &context).await;

            if let (true, Some(value)) = (result.success, &result.result) {
                accumulated[result_key(index)] = value.clone();
                if self.config.share_crew_state {
                    self.crew_state.write().insert(result_key(index), value.clone());
                }
            }
            results.push(TaskOutcome {
                task_index: index,
                task: task.description.clone(),
                agent: result.agent,
                success: result.success,
                output: result.result,
                error: result.error,
                execution_time_ms: started.elapsed().as_secs_f64() * 1_000.0,
            });
        }
        results
    }

    async fn run_parallel(&self, agents: &[AgentHandle], tasks: &[Task], inputs: &Value) -> Vec<TaskOutcome> {
        let context = self.with_crew_state(merge_context(inputs, &Value::Null));
        let runs = tasks.iter().enumerate().map(|(index, task)| {
            let agent = select_agent(agents, task, index);
            let context = &context;
            async move {
                let started = Instant::now();
                let result = agent.execute(task, context).await;
                TaskOutcome {
                    task_index: index,
                    task: task.description.clone(),
                    agent: result.agent,
                    success: result.success,
                    output: result.result,
                    error: result.error,
                    execution_time_ms: started.elapsed().as_secs_f64() * 1_000.0,
                }
            }
        });
        join_all(runs).await
    }

    async fn run_hierarchical(&self, agents: &[AgentHandle], tasks: &[Task], inputs: &Value) -> Vec<TaskOutcome> {
        let (coordinator, subordinates) = agents.split_at(1);
        let coordinator = &coordinator[0];
        let decomposer = Arc::clone(&*self.decomposer.read());
        let context = self.with_crew_state(merge_context(inputs, &Value::Null));

        let mut results = Vec::with_capacity(tasks.len());
        for (index, task) in tasks.iter().enumerate() {
            let task = task
                .clone()
                .with_context(merge_context(&context, &task.context));
            let outcome = coordinator
                .collaborate_with(&task, subordinates, ProcessKind::Hierarchical, decomposer.as_ref())
                .await;

            let output = match &outcome.synthesis {
                Some(synthesis) => Some(synthesis.to_value()),
                None => outcome.results.first().and_then(|r| r.result.clone()),
            };
            let error = (!outcome.success).then(|| {
                outcome
                    .results
                    .iter()
                    .filter_map(|r| r.error.as_deref())
                    .collect::<Vec<_>>()
                    .join("; ")
            });
            results.push(TaskOutcome {
                task_index: index,
                task: task.description.clone(),
                agent: outcome.coordinator,
                success: outcome.success,
                output,
                error,
                execution_time_ms: outcome.execution_time_ms,
            });
        }
        results
    }

    fn with_crew_state(&self, mut context: Value) -> Value {
        if self.config.share_crew_state {
            let state: serde_json::Map<String, Value> = self
                .crew_state
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            context["crewState"] = Value::Object(state);
        }
        context
    }

    fn set_phase(&self, phase: CrewPhase) {
        *self.phase.write() = phase;
    }

    fn record(&self, output: &CrewOutput) {
        let mut history = self.history.lock();
        history.push_back(CrewRun {
            execution_id: output.execution_id.clone(),
            process: output.process,
            success: output.success,
            tasks: output.results.len(),
            succeeded: output.succeeded(),
            execution_time_ms: output.execution_time_ms,
            timestamp: Utc::now(),
        });
        while history.len() > self.config.max_history {
            history.pop_front();
        }
    }

    fn emit(&self, event: &str, data: Value) {
        if let Some(events) = &self.events {
            events.emit_from(event, data, &self.config.name);
        }
    }

    /// Crew-level kickoff stats plus each agent's own statistics
    pub fn get_statistics(&self) -> CrewStatistics {
        let history = self.history();
        let kickoffs = history.len();
        let successful_kickoffs = history.iter().filter(|r| r.success).count();
        let (success_rate, average_time_ms) = if kickoffs == 0 {
            (0.0, 0.0)
        } else {
            let n = kickoffs as f64;
            (
                successful_kickoffs as f64 / n,
                history.iter().map(|r| r.execution_time_ms).sum::<f64>() / n,
            )
        };

        CrewStatistics {
            name: self.config.name.clone(),
            process: self.config.process,
            kickoffs,
            successful_kickoffs,
            success_rate,
            average_time_ms,
            tasks: self.tasks.read().len(),
            agents: self.agents().iter().map(|a| a.statistics()).collect(),
        }
    }
}

impl std::fmt::Debug for Crew {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crew")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .field("process", &self.config.process)
            .field("agents", &self.agents.read().len())
            .field("tasks", &self.tasks.read().len())
            .finish()
    }
}

fn result_key(index: usize) -> String {
    format!("task_{index}_result")
}

fn is_result_key(key: &str) -> bool {
    key.strip_prefix("task_")
        .and_then(|rest| rest.strip_suffix("_result"))
        .is_some_and(|index| index.parse::<usize>().is_ok())
}

/// Explicit role match first, else round-robin by task index.
/// `agents` must be non-empty.
fn select_agent<'a>(agents: &'a [AgentHandle], task: &Task, index: usize) -> &'a AgentHandle {
    if let Some(role) = task.agent.as_deref() {
        if let Some(agent) = agents.iter().find(|a| a.role() == role) {
            return agent;
        }
        warn!(role = %role, "No agent with requested role, falling back to round-robin");
    }
    &agents[index % agents.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, ToolDescriptor};
    use crate::config::AgentConfig;

    fn worker(role: &str) -> Agent {
        Agent::new(AgentConfig::new(role, ""))
    }

    fn failing(role: &str, keyword: &str) -> Agent {
        worker(role).with_tool(
            ToolDescriptor::new("broken", |_t: Task, _c: Value| async {
                Err(EngineError::handler("tool crashed"))
            })
            .with_keywords([keyword]),
        )
    }

    fn crew(process: ProcessKind) -> Crew {
        Crew::new(CrewConfig::new("genomics", process))
    }

    // === Agent selection ===

    #[test]
    fn test_select_agent_prefers_role_then_round_robin() {
        let agents = vec![AgentHandle::new(worker("a")), AgentHandle::new(worker("b"))];

        assert_eq!(select_agent(&agents, &Task::new("x").for_agent("b"), 0).role(), "b");
        assert_eq!(select_agent(&agents, &Task::new("x"), 0).role(), "a");
        assert_eq!(select_agent(&agents, &Task::new("x"), 3).role(), "b");
        assert_eq!(select_agent(&agents, &Task::new("x").for_agent("zz"), 2).role(), "a");
    }

    // === Sequential ===

    #[tokio::test]
    async fn test_sequential_requires_all_tasks() {
        let crew = crew(ProcessKind::Sequential)
            .with_agent(failing("first", "align"))
            .with_agent(worker("second"))
            .with_task(Task::new("align reads"))
            .with_task(Task::new("summarize"));

        let output = crew.kickoff(Value::Null).await;

        assert!(!output.success);
        assert_eq!(output.results.len(), 2);
        assert_eq!(output.results[0].agent, "first");
        assert!(!output.results[0].success);
        assert!(output.results[1].success);
        assert_eq!(crew.phase(), CrewPhase::Failed);
    }

    #[tokio::test]
    async fn test_shared_state_records_successes() {
        let crew = Crew::new(CrewConfig::new("shared", ProcessKind::Sequential).with_shared_state(true))
            .with_agent(worker("only"))
            .with_task(Task::new("one"))
            .with_task(Task::new("two"));

        let output = crew.kickoff(json!({"genome": "hg38"})).await;

        assert!(output.success);
        assert_eq!(crew.phase(), CrewPhase::Completed);
        let state = crew.crew_state();
        assert!(state.contains_key("task_0_result"));
        assert!(state.contains_key("task_1_result"));
    }

    #[tokio::test]
    async fn test_shared_state_is_scoped_to_one_kickoff() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let counter = Arc::clone(&calls);
        let flaky = worker("flaky").with_tool(
            ToolDescriptor::new("assemble", move |_t: Task, _c: Value| {
                let first = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0;
                async move {
                    if first {
                        Ok(json!("fresh-0"))
                    } else {
                        Err(EngineError::handler("assembler offline"))
                    }
                }
            })
            .with_condition(|_t, _c| true),
        );
        let recorder_seen = Arc::clone(&seen);
        let recorder = worker("recorder").with_tool(
            ToolDescriptor::new("record", move |_t: Task, ctx: Value| {
                recorder_seen.lock().push(ctx["crewState"].clone());
                async { Ok(json!("recorded")) }
            })
            .with_condition(|_t, _c| true),
        );
        let crew = Crew::new(CrewConfig::new("shared", ProcessKind::Sequential).with_shared_state(true))
            .with_agent(flaky)
            .with_agent(recorder)
            .with_task(Task::new("assemble contigs").for_agent("flaky"))
            .with_task(Task::new("annotate").for_agent("recorder"));

        assert!(crew.kickoff(Value::Null).await.success);
        let second = crew.kickoff(Value::Null).await;

        assert!(!second.results[0].success);
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].get("task_0_result").is_some());
        assert!(seen[1].get("task_0_result").is_none());
        assert!(!crew.crew_state().contains_key("task_0_result"));
        assert!(crew.crew_state().contains_key("task_1_result"));
    }

    #[test]
    fn test_result_key_detection() {
        assert!(is_result_key(&result_key(12)));
        assert!(!is_result_key("task_x_result"));
        assert!(!is_result_key("genome"));
    }

    // === Parallel ===

    #[tokio::test]
    async fn test_parallel_survives_panicking_tool() {
        let crashing = worker("a").with_tool(
            ToolDescriptor::new("lookup", |_t: Task, _c: Value| async {
                let hits: Vec<Value> = Vec::new();
                Ok(hits[3].clone())
            })
            .with_condition(|_t, _c| true),
        );
        let crew = crew(ProcessKind::Parallel)
            .with_agent(crashing)
            .with_agent(worker("b"))
            .with_task(Task::new("lookup variant"))
            .with_task(Task::new("zoom"));

        let output = tokio::spawn(async move { crew.kickoff(Value::Null).await })
            .await
            .unwrap();

        assert_eq!(output.results.len(), 2);
        assert!(output.success);
        assert!(!output.results[0].success);
        assert!(output.results[0].error.as_deref().unwrap().contains("panicked"));
        assert!(output.results[1].success);
    }

    #[tokio::test]
    async fn test_parallel_keeps_order_and_succeeds_if_any() {
        let crew = crew(ProcessKind::Parallel)
            .with_agent(worker("a"))
            .with_agent(failing("b", "fetch"))
            .with_task(Task::new("zoom"))
            .with_task(Task::new("fetch pdb"))
            .with_task(Task::new("search"));

        let output = crew.kickoff(Value::Null).await;

        assert!(output.success);
        let roles: Vec<&str> = output.results.iter().map(|r| r.agent.as_str()).collect();
        assert_eq!(roles, vec!["a", "b", "a"]);
        assert!(!output.results[1].success);
        assert_eq!(output.results[2].task_index, 2);
    }

    // === Hierarchical ===

    #[tokio::test]
    async fn test_hierarchical_coordinator_synthesizes() {
        let crew = crew(ProcessKind::Hierarchical)
            .with_agent(worker("lead"))
            .with_agent(worker("searcher"))
            .with_agent(worker("analyst"))
            .with_task(Task::new("search BRCA2"));

        let output = crew.kickoff(Value::Null).await;

        assert!(output.success);
        assert_eq!(output.results.len(), 1);
        assert_eq!(output.results[0].agent, "lead");
        let synthesis = output.results[0].output.as_ref().unwrap();
        assert_eq!(synthesis["insights"].as_array().unwrap().len(), 2);
        assert_eq!(crew.get_statistics().agents[0].executions, 0);
    }

    #[tokio::test]
    async fn test_hierarchical_single_agent_runs_itself() {
        let crew = crew(ProcessKind::Hierarchical)
            .with_agent(worker("solo"))
            .with_task(Task::new("zoom to chr1"));

        let output = crew.kickoff(Value::Null).await;

        assert!(output.success);
        assert_eq!(crew.get_statistics().agents[0].executions, 1);
    }

    struct SplitInHalf;

    impl Decomposer for SplitInHalf {
        fn decompose(&self, task: &Task, _coordinator: &Agent, subordinates: &[AgentHandle]) -> Vec<Task> {
            vec![
                Task::new(format!("{} part 1", task.description)).for_agent(subordinates[0].role()),
                Task::new(format!("{} part 2", task.description)).for_agent(subordinates[0].role()),
            ]
        }
    }

    #[tokio::test]
    async fn test_custom_decomposer() {
        let crew = crew(ProcessKind::Hierarchical)
            .with_agent(worker("lead"))
            .with_agent(worker("worker"))
            .with_task(Task::new("analyze"));
        crew.set_decomposer(Arc::new(SplitInHalf));

        crew.kickoff(Value::Null).await;

        let stats = crew.get_statistics();
        assert_eq!(stats.agents[1].executions, 2);
    }

    // === Lifecycle ===

    #[tokio::test]
    async fn test_no_agents_fails_cleanly() {
        let crew = crew(ProcessKind::Sequential).with_task(Task::new("anything"));

        let output = crew.kickoff(Value::Null).await;

        assert!(!output.success);
        assert!(output.results.is_empty());
        assert!(output.error.unwrap().contains("no agents"));
        assert_eq!(crew.phase(), CrewPhase::Failed);
    }

    #[tokio::test]
    async fn test_events_and_history() {
        let bus = EventBus::new();
        let crew = crew(ProcessKind::Parallel)
            .with_event_bus(bus.clone())
            .with_agent(worker("a"))
            .with_task(Task::new("t"));

        crew.kickoff(Value::Null).await;
        crew.kickoff(Value::Null).await;

        assert_eq!(bus.history_for(CREW_KICKOFF_STARTED).len(), 2);
        let done = bus.history_for(CREW_KICKOFF_COMPLETED);
        assert_eq!(done[1].data["success"], true);
        let stats = crew.get_statistics();
        assert_eq!(stats.kickoffs, 2);
        assert!((stats.success_rate - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_mutators() {
        let crew = crew(ProcessKind::Sequential)
            .with_agent(worker("a"))
            .with_agent(worker("b"));
        crew.add_task(Task::new("t"));

        assert_eq!(crew.phase(), CrewPhase::Created);
        assert!(crew.remove_agent("a"));
        assert!(!crew.remove_agent("a"));
        assert_eq!(crew.agents().len(), 1);
        assert_eq!(crew.tasks().len(), 1);
    }
}
