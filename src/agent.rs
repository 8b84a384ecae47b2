//! Agent implementation - a single role-scoped worker
//!
//! An agent runs a [`Task`] by invoking every attached [`Tool`] that claims
//! the task, then synthesizes a response (through a [`Generator`] when one is
//! attached). Outcomes are folded into a per-category memory that later
//! executions of the same kind of task get to see.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::{AgentConfig, ProcessKind};
use crate::error::{EngineError, Result};
use crate::events::{EventBus, AGENT_COMPLETED, AGENT_FAILED, AGENT_STARTED};
use crate::hierarchy::{Decomposer, RolePerspectiveDecomposer, Synthesis};

/// Number of earlier same-category records shown to a new execution
const PRIOR_DIGEST_LEN: usize = 3;

/// Text carried by a caught panic payload
fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => format!("panicked: {message}"),
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => format!("panicked: {message}"),
            Err(_) => "panicked".to_string(),
        },
    }
}

// === Tasks ===

/// A unit of work handed to an agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub description: String,
    /// Role of the agent that must run this task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default)]
    pub context: Value,
}

impl Task {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            agent: None,
            context: Value::Null,
        }
    }

    pub fn for_agent(mut self, role: impl Into<String>) -> Self {
        self.agent = Some(role.into());
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

/// Coarse task kind used to index agent memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskCategory {
    Search,
    Analysis,
    Navigation,
    Sequence,
    External,
    Plugin,
    General,
}

impl TaskCategory {
    const RULES: &'static [(TaskCategory, &'static [&'static str])] = &[
        (TaskCategory::Search, &["search", "find", "blast", "lookup", "query"]),
        (TaskCategory::Analysis, &["analy", "compare", "statistic", "evaluate", "assess"]),
        (TaskCategory::Navigation, &["navigate", "go to", "jump", "zoom", "position", "chromosome"]),
        (
            TaskCategory::Sequence,
            &["sequence", "dna", "protein", "gc content", "translate", "codon", "reverse complement"],
        ),
        (TaskCategory::External, &["pdb", "alphafold", "uniprot", "ncbi", "api", "database", "fetch"]),
        (TaskCategory::Plugin, &["plugin", "extension"]),
    ];

    /// First matching keyword group wins
    pub fn classify(description: &str) -> Self {
        let text = description.to_lowercase();
        Self::RULES
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| text.contains(k)))
            .map(|(category, _)| *category)
            .unwrap_or(TaskCategory::General)
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskCategory::Search => "search",
            TaskCategory::Analysis => "analysis",
            TaskCategory::Navigation => "navigation",
            TaskCategory::Sequence => "sequence",
            TaskCategory::External => "external",
            TaskCategory::Plugin => "plugin",
            TaskCategory::General => "general",
        }
    }

    fn recommendations(&self) -> &'static [&'static str] {
        match self {
            TaskCategory::Search => &["Review the top hits for significance", "Narrow the query if results are broad"],
            TaskCategory::Analysis => &["Validate findings with a second method", "Record the parameters used"],
            TaskCategory::Navigation => &["Bookmark the current region", "Load supporting tracks for context"],
            TaskCategory::Sequence => &["Verify sequence boundaries", "Check the reading frame before translating"],
            TaskCategory::External => &["Cache fetched records", "Cross-check identifiers against a second source"],
            TaskCategory::Plugin => &["Confirm plugin compatibility before use"],
            TaskCategory::General => &["Break the request into specific operations"],
        }
    }

    fn next_steps(&self) -> &'static [&'static str] {
        match self {
            TaskCategory::Search => &["Inspect the best match", "Run a follow-up analysis on the hits"],
            TaskCategory::Analysis => &["Summarize the results", "Visualize the comparison"],
            TaskCategory::Navigation => &["Inspect features in view"],
            TaskCategory::Sequence => &["Search for homologous sequences"],
            TaskCategory::External => &["Link fetched records to the current view"],
            TaskCategory::Plugin => &["Run the plugin on the current selection"],
            TaskCategory::General => &["Clarify the goal of the request"],
        }
    }
}

impl std::fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Overlay `overlay`'s keys onto `base`; non-object sides are treated as empty
pub fn merge_context(base: &Value, overlay: &Value) -> Value {
    let mut merged = match base {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    if let Value::Object(extra) = overlay {
        for (key, value) in extra {
            merged.insert(key.clone(), value.clone());
        }
    }
    Value::Object(merged)
}

// === Tools & generators ===

/// External capability an agent can invoke
#[async_trait]
pub trait Tool: Send + Sync {
    fn id(&self) -> &str;

    /// Whether this tool should run for the task
    fn matches(&self, task: &Task, context: &Value) -> bool;

    async fn invoke(&self, task: &Task, context: &Value) -> Result<Value>;
}

pub type ToolCondition = Arc<dyn Fn(&Task, &Value) -> bool + Send + Sync>;
pub type ToolInvoke = Arc<dyn Fn(Task, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Closure-backed [`Tool`]. Selection uses the condition when set, else a
/// case-insensitive keyword match on the task description.
#[derive(Clone)]
pub struct ToolDescriptor {
    id: String,
    keywords: Vec<String>,
    condition: Option<ToolCondition>,
    invoke: ToolInvoke,
}

impl ToolDescriptor {
    pub fn new<F, Fut>(id: impl Into<String>, invoke: F) -> Self
    where
        F: Fn(Task, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            id: id.into(),
            keywords: Vec::new(),
            condition: None,
            invoke: Arc::new(move |task: Task, context: Value| invoke(task, context).boxed()),
        }
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords
            .into_iter()
            .map(|k| k.into().to_lowercase())
            .collect();
        self
    }

    pub fn with_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&Task, &Value) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }
}

#[async_trait]
impl Tool for ToolDescriptor {
    fn id(&self) -> &str {
        &self.id
    }

    fn matches(&self, task: &Task, context: &Value) -> bool {
        if let Some(condition) = &self.condition {
            return condition(task, context);
        }
        let text = task.description.to_lowercase();
        self.keywords.iter().any(|k| text.contains(k.as_str()))
    }

    async fn invoke(&self, task: &Task, context: &Value) -> Result<Value> {
        (self.invoke)(task.clone(), context.clone()).await
    }
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("id", &self.id)
            .field("keywords", &self.keywords)
            .field("condition", &self.condition.is_some())
            .finish()
    }
}

/// Text/structured response generator (an LLM in practice)
#[async_trait]
pub trait Generator: Send + Sync {
    /// Returns either a string or an object
    async fn generate(&self, prompt: &str) -> Result<Value>;
}

// === Results & memory ===

/// Per-tool entry in an agent response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub tool: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResult {
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Role of the agent that produced this
    pub agent: String,
    pub execution_time_ms: f64,
    pub execution_id: String,
}

impl AgentResult {
    fn failure(agent: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            agent: agent.to_string(),
            execution_time_ms: 0.0,
            execution_id: Uuid::new_v4().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub execution_id: String,
    /// Task description
    pub task: String,
    pub category: TaskCategory,
    pub success: bool,
    pub execution_time_ms: f64,
    /// IDs of the tools that were invoked
    pub tools: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Rolling stats for one task category
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryMemory {
    /// Tasks of this category run so far
    pub executions: u64,
    /// Rolling success rate in `[0, 1]`
    pub success_rate: f64,
    /// Rolling average execution time
    pub average_time_ms: f64,
    /// Most recent records, oldest first, capped at `max_patterns`
    pub recent_patterns: VecDeque<ExecutionRecord>,
}

impl CategoryMemory {
    fn record(&mut self, record: ExecutionRecord, max_patterns: usize) {
        self.executions += 1;
        let n = self.executions as f64;
        let hit = if record.success { 1.0 } else { 0.0 };
        self.success_rate += (hit - self.success_rate) / n;
        self.average_time_ms += (record.execution_time_ms - self.average_time_ms) / n;

        self.recent_patterns.push_back(record);
        while self.recent_patterns.len() > max_patterns {
            self.recent_patterns.pop_front();
        }
    }

    fn digest(&self) -> Value {
        let recent: Vec<Value> = self
            .recent_patterns
            .iter()
            .rev()
            .take(PRIOR_DIGEST_LEN)
            .map(|r| json!({ "task": r.task, "success": r.success }))
            .collect();
        json!({
            "executions": self.executions,
            "successRate": self.success_rate,
            "averageTimeMs": self.average_time_ms,
            "recent": recent,
        })
    }
}

#[derive(Debug, Clone, Default)]
struct Totals {
    executions: u64,
    successes: u64,
    total_time_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatistics {
    pub role: String,
    pub executions: u64,
    pub successes: u64,
    pub success_rate: f64,
    pub average_time_ms: f64,
    pub tools: usize,
    pub memory: HashMap<TaskCategory, CategoryMemory>,
}

/// Outcome of running one task across several agents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaborationResult {
    pub mode: ProcessKind,
    pub coordinator: String,
    pub success: bool,
    pub results: Vec<AgentResult>,
    /// Only set for hierarchical collaboration
    pub synthesis: Option<Synthesis>,
    pub execution_time_ms: f64,
}

// === Agent ===

/// A single worker
pub struct Agent {
    /// Unique agent ID
    id: Uuid,
    /// Role, goal and limits
    config: AgentConfig,
    /// Tools tried in insertion order
    tools: RwLock<Vec<Arc<dyn Tool>>>,
    /// Response generator; the rule-based response is used without one
    generator: Option<Arc<dyn Generator>>,
    /// Bus for lifecycle events
    events: Option<EventBus>,
    /// Recent executions, capped at `max_history`
    history: Mutex<VecDeque<ExecutionRecord>>,
    /// Per-category collaboration memory
    memory: RwLock<HashMap<TaskCategory, CategoryMemory>>,
    /// Lifetime counters
    totals: Mutex<Totals>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        let id = Uuid::new_v4();
        debug!(agent_id = %id, role = %config.role, "Creating agent");

        Self {
            id,
            config,
            tools: RwLock::new(Vec::new()),
            generator: None,
            events: None,
            history: Mutex::new(VecDeque::new()),
            memory: RwLock::new(HashMap::new()),
            totals: Mutex::new(Totals::default()),
        }
    }

    pub fn with_tool<T: Tool + 'static>(self, tool: T) -> Self {
        self.add_tool(Arc::new(tool));
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Append a tool; tools run in the order they were added
    pub fn add_tool(&self, tool: Arc<dyn Tool>) {
        self.tools.write().push(tool);
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn role(&self) -> &str {
        &self.config.role
    }

    pub fn goal(&self) -> &str {
        &self.config.goal
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn tool_ids(&self) -> Vec<String> {
        self.tools.read().iter().map(|t| t.id().to_string()).collect()
    }

    /// Run a task. Never fails; failures come back in the result.
    #[instrument(skip_all, fields(agent = %self.config.role))]
    pub async fn execute(&self, task: &Task, context: &Value) -> AgentResult {
        let execution_id = Uuid::new_v4().to_string();
        let category = TaskCategory::classify(&task.description);
        let started = Instant::now();

        self.emit(
            AGENT_STARTED,
            json!({
                "agent": self.config.role,
                "executionId": execution_id,
                "task": task.description,
                "category": category,
            }),
        );

        let context = merge_context(&task.context, context);
        let (outcome, tools) = self.perform(task, &context, category).await;
        let execution_time_ms = started.elapsed().as_secs_f64() * 1_000.0;

        self.remember(ExecutionRecord {
            execution_id: execution_id.clone(),
            task: task.description.clone(),
            category,
            success: outcome.is_ok(),
            execution_time_ms,
            tools,
            timestamp: Utc::now(),
        });

        match outcome {
            Ok(result) => {
                debug!(execution_id = %execution_id, elapsed_ms = execution_time_ms, "Task completed");
                self.emit(
                    AGENT_COMPLETED,
                    json!({
                        "agent": self.config.role,
                        "executionId": execution_id,
                        "executionTime": execution_time_ms,
                    }),
                );
                AgentResult {
                    success: true,
                    result: Some(result),
                    error: None,
                    agent: self.config.role.clone(),
                    execution_time_ms,
                    execution_id,
                }
            }
            Err(err) => {
                warn!(execution_id = %execution_id, error = %err, "Task failed");
                self.emit(
                    AGENT_FAILED,
                    json!({
                        "agent": self.config.role,
                        "executionId": execution_id,
                        "error": err.to_string(),
                    }),
                );
                AgentResult {
                    success: false,
                    result: None,
                    error: Some(err.to_string()),
                    agent: self.config.role.clone(),
                    execution_time_ms,
                    execution_id,
                }
            }
        }
    }

    /// Invoke the matching tools in order, then build the response
    async fn perform(
        &self,
        task: &Task,
        context: &Value,
        category: TaskCategory,
    ) -> (Result<Value>, Vec<String>) {
        let selected: Vec<Arc<dyn Tool>> = self
            .tools
            .read()
            .iter()
            .filter(|tool| tool.matches(task, context))
            .cloned()
            .collect();
        let used: Vec<String> = selected.iter().map(|t| t.id().to_string()).collect();

        let mut outcomes = Vec::with_capacity(selected.len());
        for tool in &selected {
            let invocation = AssertUnwindSafe(async { tool.invoke(task, context).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(EngineError::tool(tool.id(), panic_message(panic))));
            let outcome = match invocation {
                Ok(result) => ToolOutcome {
                    tool: tool.id().to_string(),
                    success: true,
                    result: Some(result),
                    error: None,
                },
                Err(err) => {
                    warn!(tool = %tool.id(), error = %err, "Tool failed");
                    ToolOutcome {
                        tool: tool.id().to_string(),
                        success: false,
                        result: None,
                        error: Some(err.to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        }

        if !outcomes.is_empty() && outcomes.iter().all(|o| !o.success) {
            let message = outcomes
                .iter()
                .filter_map(|o| o.error.as_deref())
                .collect::<Vec<_>>()
                .join("; ");
            return (Err(EngineError::tool(used.join(","), message)), used);
        }

        let response = self.respond(task, context, category, &outcomes).await;
        (Ok(response), used)
    }

    async fn respond(
        &self,
        task: &Task,
        context: &Value,
        category: TaskCategory,
        outcomes: &[ToolOutcome],
    ) -> Value {
        let fallback = self.rule_based_response(task, category, outcomes);
        let Some(generator) = &self.generator else {
            return fallback;
        };

        let prompt = self.prompt(task, context, category, outcomes);
        let generated = AssertUnwindSafe(async { generator.generate(&prompt).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(EngineError::Generator(panic_message(panic))));
        match generated {
            Ok(Value::Object(mut generated)) => {
                generated
                    .entry("toolResults")
                    .or_insert_with(|| fallback["toolResults"].clone());
                Value::Object(generated)
            }
            Ok(Value::String(text)) => {
                let mut response = fallback;
                response["summary"] = Value::String(text);
                response["generated"] = Value::Bool(true);
                response
            }
            Ok(other) => {
                let mut response = fallback;
                response["generated"] = other;
                response
            }
            Err(err) => {
                warn!(error = %err, "Generator failed, using rule-based response");
                fallback
            }
        }
    }

    /// Role-scoped prompt: who the agent is, the caller context and a digest
    /// of earlier tasks in the same category
    fn prompt(&self, task: &Task, context: &Value, category: TaskCategory, outcomes: &[ToolOutcome]) -> String {
        let prior = self
            .memory
            .read()
            .get(&category)
            .map(CategoryMemory::digest)
            .unwrap_or(Value::Null);

        let mut prompt = format!("You are {}.", self.config.role);
        if !self.config.goal.is_empty() {
            prompt.push_str(&format!(" Your goal: {}.", self.config.goal));
        }
        if !self.config.backstory.is_empty() {
            prompt.push_str(&format!(" {}", self.config.backstory));
        }
        prompt.push_str(&format!("\n\nTask ({category}): {}", task.description));
        prompt.push_str(&format!("\nContext: {context}"));
        if !prior.is_null() {
            prompt.push_str(&format!("\nPrior {category} work: {prior}"));
        }
        if !outcomes.is_empty() {
            let tools = serde_json::to_string(outcomes).unwrap_or_default();
            prompt.push_str(&format!("\nTool results: {tools}"));
        }
        prompt
    }

    fn rule_based_response(&self, task: &Task, category: TaskCategory, outcomes: &[ToolOutcome]) -> Value {
        let succeeded: Vec<&ToolOutcome> = outcomes.iter().filter(|o| o.success).collect();
        let failed: Vec<&str> = outcomes
            .iter()
            .filter(|o| !o.success)
            .map(|o| o.tool.as_str())
            .collect();

        let summary = if outcomes.is_empty() {
            format!("{} reviewed '{}' without tools", self.config.role, task.description)
        } else {
            format!(
                "{} handled '{}' with {} of {} tool(s)",
                self.config.role,
                task.description,
                succeeded.len(),
                outcomes.len()
            )
        };

        let mut recommendations: Vec<String> =
            category.recommendations().iter().map(|s| s.to_string()).collect();
        if !self.config.goal.is_empty() {
            recommendations.push(format!("Keep the focus on: {}", self.config.goal));
        }

        let mut next_steps: Vec<String> = Vec::new();
        if !failed.is_empty() {
            next_steps.push(format!("Retry failed tools: {}", failed.join(", ")));
        }
        if outcomes.is_empty() {
            next_steps.push(format!("Attach a tool that handles {category} tasks"));
        }
        next_steps.extend(category.next_steps().iter().map(|s| s.to_string()));

        json!({
            "summary": summary,
            "category": category,
            "toolResults": outcomes,
            "recommendations": recommendations,
            "nextSteps": next_steps,
        })
    }

    fn remember(&self, record: ExecutionRecord) {
        {
            let mut totals = self.totals.lock();
            totals.executions += 1;
            if record.success {
                totals.successes += 1;
            }
            totals.total_time_ms += record.execution_time_ms;
        }
        {
            let mut history = self.history.lock();
            history.push_back(record.clone());
            while history.len() > self.config.max_history {
                history.pop_front();
            }
        }
        self.memory
            .write()
            .entry(record.category)
            .or_default()
            .record(record, self.config.max_patterns);
    }

    fn emit(&self, event: &str, data: Value) {
        if let Some(events) = &self.events {
            events.emit_from(event, data, &self.config.role);
        }
    }

    // === Delegation & collaboration ===

    /// Hand a task to another agent, tagging its context with who delegated
    /// and why
    pub async fn delegate_task(&self, task: &Task, target: &Agent, reason: &str) -> AgentResult {
        if !self.config.allow_delegation {
            let err = EngineError::DelegationDisabled(self.config.role.clone());
            warn!(delegate_to = %target.role(), error = %err, "Delegation refused");
            return AgentResult::failure(&self.config.role, err.to_string());
        }

        info!(from = %self.config.role, to = %target.role(), reason = %reason, "Delegating task");
        let context = merge_context(
            &task.context,
            &json!({ "delegatedBy": self.config.role, "reason": reason }),
        );
        let delegated = task.clone().with_context(context);
        target.execute(&delegated, &Value::Null).await
    }

    pub async fn collaborate(&self, task: &Task, peers: &[AgentHandle], mode: ProcessKind) -> CollaborationResult {
        self.collaborate_with(task, peers, mode, &RolePerspectiveDecomposer).await
    }

    /// Run `task` across `peers` under one discipline. Sequential threads
    /// earlier successes into `previousResults`; parallel settles all;
    /// hierarchical makes this agent the coordinator.
    #[instrument(skip_all, fields(coordinator = %self.config.role, mode = %mode))]
    pub async fn collaborate_with(
        &self,
        task: &Task,
        peers: &[AgentHandle],
        mode: ProcessKind,
        decomposer: &dyn Decomposer,
    ) -> CollaborationResult {
        let started = Instant::now();
        let mut synthesis = None;

        let results = match mode {
            ProcessKind::Sequential => {
                let mut results = Vec::with_capacity(peers.len());
                let mut previous: Vec<Value> = Vec::new();
                for peer in peers {
                    let context = json!({ "previousResults": previous });
                    let result = peer.execute(task, &context).await;
                    if let (true, Some(value)) = (result.success, &result.result) {
                        previous.push(value.clone());
                    }
                    results.push(result);
                }
                results
            }
            ProcessKind::Parallel => {
                join_all(peers.iter().map(|peer| peer.execute(task, &Value::Null))).await
            }
            ProcessKind::Hierarchical if peers.is_empty() => {
                vec![self.execute(task, &Value::Null).await]
            }
            ProcessKind::Hierarchical => {
                let subtasks = decomposer.decompose(task, self, peers);
                let runs = subtasks.iter().enumerate().map(|(i, subtask)| {
                    let assignee = subtask
                        .agent
                        .as_deref()
                        .and_then(|role| peers.iter().find(|p| p.role() == role))
                        .unwrap_or(&peers[i % peers.len()]);
                    assignee.execute(subtask, &Value::Null)
                });
                let results = join_all(runs).await;
                synthesis = Some(Synthesis::from_results(&self.config.role, &task.description, &results));
                results
            }
        };

        let success = results.iter().any(|r| r.success);
        debug!(peers = peers.len(), success, "Collaboration finished");

        CollaborationResult {
            mode,
            coordinator: self.config.role.clone(),
            success,
            results,
            synthesis,
            execution_time_ms: started.elapsed().as_secs_f64() * 1_000.0,
        }
    }

    // === Introspection ===

    pub fn history(&self) -> Vec<ExecutionRecord> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn memory_for(&self, category: TaskCategory) -> Option<CategoryMemory> {
        self.memory.read().get(&category).cloned()
    }

    pub fn statistics(&self) -> AgentStatistics {
        let totals = self.totals.lock().clone();
        let (success_rate, average_time_ms) = if totals.executions == 0 {
            (0.0, 0.0)
        } else {
            let n = totals.executions as f64;
            (totals.successes as f64 / n, totals.total_time_ms / n)
        };

        AgentStatistics {
            role: self.config.role.clone(),
            executions: totals.executions,
            successes: totals.successes,
            success_rate,
            average_time_ms,
            tools: self.tools.read().len(),
            memory: self.memory.read().clone(),
        }
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("role", &self.config.role)
            .field("tools", &self.tool_ids())
            .finish()
    }
}

/// Shared handle to an agent
#[derive(Clone, Debug)]
pub struct AgentHandle {
    inner: Arc<Agent>,
}

impl AgentHandle {
    pub fn new(agent: Agent) -> Self {
        Self {
            inner: Arc::new(agent),
        }
    }

    pub fn inner(&self) -> &Agent {
        &self.inner
    }

    pub fn ptr_eq(&self, other: &AgentHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl From<Agent> for AgentHandle {
    fn from(agent: Agent) -> Self {
        Self::new(agent)
    }
}

impl std::ops::Deref for AgentHandle {
    type Target = Agent;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
