//! Commands - validated, retryable, timeout-bounded handler execution
//!
//! Execution runs through a fixed lifecycle:
//!
//! ```text
//! validate input ─► before hooks ─► handler (retry × timeout) ─► validate output
//!        │                │                    │                        │
//!        └──── failure ───┴────────────────────┴────────────────────────┘
//!                                   │                                   │
//!                              error hooks                         after hooks
//!                                   └──────────► stats ◄────────────────┘
//!                                                  │
//!                                            finally hooks
//! ```
//!
//! [`Command::execute`] never returns an error; failures are folded into the
//! [`CommandResult`] envelope.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::CommandOptions;
use crate::context::CommandContext;
use crate::error::{EngineError, Result};

pub type HandlerFuture = BoxFuture<'static, Result<Value>>;
pub type Handler =
    Arc<dyn Fn(Arc<dyn CommandContext>, Value, ExecutionOptions) -> HandlerFuture + Send + Sync>;

/// Per-call overrides, also handed to the handler
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionOptions {
    pub retries: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub source: Option<String>,
    pub extra: Value,
}

impl ExecutionOptions {
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

// === Schemas ===

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Null,
}

impl ValueKind {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::String(_) => ValueKind::String,
            Value::Number(_) => ValueKind::Number,
            Value::Bool(_) => ValueKind::Boolean,
            Value::Object(_) => ValueKind::Object,
            Value::Array(_) => ValueKind::Array,
            Value::Null => ValueKind::Null,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ValueKind::String => "string",
            ValueKind::Number => "number",
            ValueKind::Boolean => "boolean",
            ValueKind::Object => "object",
            ValueKind::Array => "array",
            ValueKind::Null => "null",
        }
    }
}

pub type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Rule for one field of an object payload
#[derive(Clone, Default)]
pub struct FieldRule {
    pub required: bool,
    pub kind: Option<ValueKind>,
    validate: Option<Predicate>,
}

impl FieldRule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn of_type(mut self, kind: ValueKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn validate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(predicate));
        self
    }
}

/// Either a whole-value predicate or a set of per-field rules
#[derive(Clone)]
pub enum Schema {
    Predicate(Predicate),
    Fields(Vec<(String, FieldRule)>),
}

impl Schema {
    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Schema::Predicate(Arc::new(predicate))
    }

    pub fn fields() -> Self {
        Schema::Fields(Vec::new())
    }

    /// Add a field rule (turns a predicate schema into a field schema)
    pub fn field(self, name: impl Into<String>, rule: FieldRule) -> Self {
        let mut fields = match self {
            Schema::Fields(fields) => fields,
            Schema::Predicate(_) => Vec::new(),
        };
        fields.push((name.into(), rule));
        Schema::Fields(fields)
    }

    pub fn check(&self, value: &Value) -> std::result::Result<(), String> {
        match self {
            Schema::Predicate(predicate) => {
                if predicate(value) {
                    Ok(())
                } else {
                    Err("value rejected by schema predicate".to_string())
                }
            }
            Schema::Fields(fields) => {
                for (name, rule) in fields {
                    let field = value.get(name).filter(|v| !v.is_null());
                    let Some(field) = field else {
                        if rule.required {
                            return Err(format!("missing required field '{name}'"));
                        }
                        continue;
                    };
                    if let Some(kind) = rule.kind {
                        let actual = ValueKind::of(field);
                        if actual != kind {
                            return Err(format!(
                                "field '{name}' must be of type {}, got {}",
                                kind.name(),
                                actual.name()
                            ));
                        }
                    }
                    if let Some(validate) = &rule.validate {
                        if !validate(field) {
                            return Err(format!("field '{name}' failed validation"));
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Schema::Predicate(_) => f.write_str("Schema::Predicate"),
            Schema::Fields(fields) => f
                .debug_list()
                .entries(fields.iter().map(|(name, _)| name))
                .finish(),
        }
    }
}

// === Hooks ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookStage {
    Before,
    After,
    Error,
    Finally,
}

impl HookStage {
    pub fn name(&self) -> &'static str {
        match self {
            HookStage::Before => "before",
            HookStage::After => "after",
            HookStage::Error => "error",
            HookStage::Finally => "finally",
        }
    }
}

/// What a hook sees at its lifecycle point
pub struct HookContext<'a> {
    pub command: &'a str,
    pub execution_id: &'a str,
    pub context: &'a dyn CommandContext,
    pub params: &'a Value,
    pub result: Option<&'a Value>,
    pub error: Option<&'a EngineError>,
}

pub type Hook = Arc<dyn Fn(&HookContext<'_>) -> Result<()> + Send + Sync>;

#[derive(Clone, Default)]
struct HookChain {
    before: Vec<Hook>,
    after: Vec<Hook>,
    error: Vec<Hook>,
    finally: Vec<Hook>,
}

impl HookChain {
    fn stage(&self, stage: HookStage) -> &Vec<Hook> {
        match stage {
            HookStage::Before => &self.before,
            HookStage::After => &self.after,
            HookStage::Error => &self.error,
            HookStage::Finally => &self.finally,
        }
    }

    fn stage_mut(&mut self, stage: HookStage) -> &mut Vec<Hook> {
        match stage {
            HookStage::Before => &mut self.before,
            HookStage::After => &mut self.after,
            HookStage::Error => &mut self.error,
            HookStage::Finally => &mut self.finally,
        }
    }
}

// === Results ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMetadata {
    pub description: String,
    pub category: String,
    pub tags: Vec<String>,
    pub version: String,
}

impl Default for CommandMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            tags: Vec::new(),
            version: "1.0.0".to_string(),
        }
    }
}

/// Serializable failure carried in a [`CommandResult`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandFailure {
    pub message: String,
    pub name: String,
    pub code: String,
    pub details: Option<Value>,
}

impl From<&EngineError> for CommandFailure {
    fn from(err: &EngineError) -> Self {
        Self {
            message: err.to_string(),
            name: err.name().to_string(),
            code: err.code().to_string(),
            details: err.details().cloned(),
        }
    }
}

impl std::fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetadata {
    pub command_id: String,
    pub command_name: String,
    pub execution_id: String,
    pub execution_time_ms: f64,
    pub timestamp: DateTime<Utc>,
    /// 1-based attempt that produced the outcome; 0 if the handler never ran
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<CommandFailure>,
    pub metadata: ExecutionMetadata,
}

impl CommandResult {
    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }

    pub fn into_result(self) -> std::result::Result<Value, CommandFailure> {
        match (self.data, self.error) {
            (_, Some(failure)) => Err(failure),
            (data, None) => Ok(data.unwrap_or(Value::Null)),
        }
    }
}

/// Running counters for one command
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandStats {
    pub execution_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub total_execution_time_ms: f64,
    pub average_execution_time_ms: f64,
    pub last_executed: Option<DateTime<Utc>>,
    pub last_error: Option<CommandFailure>,
}

// === Command ===

pub struct Command {
    id: Uuid,
    name: String,
    created_at: DateTime<Utc>,
    handler: Handler,
    options: CommandOptions,
    input_schema: Option<Schema>,
    output_schema: Option<Schema>,
    hooks: RwLock<HookChain>,
    metadata: CommandMetadata,
    stats: Mutex<CommandStats>,
}

impl Command {
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Arc<dyn CommandContext>, Value, ExecutionOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: Handler = Arc::new(
            move |ctx: Arc<dyn CommandContext>, params: Value, opts: ExecutionOptions| {
                handler(ctx, params, opts).boxed()
            },
        );
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            created_at: Utc::now(),
            handler,
            options: CommandOptions::default(),
            input_schema: None,
            output_schema: None,
            hooks: RwLock::new(HookChain::default()),
            metadata: CommandMetadata::default(),
            stats: Mutex::new(CommandStats::default()),
        }
    }

    pub fn with_options(mut self, options: CommandOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.options.timeout_ms = timeout_ms;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.options.retries = retries;
        self
    }

    pub fn with_input_schema(mut self, schema: Schema) -> Self {
        self.input_schema = Some(schema);
        self
    }

    /// Setting an output schema also turns output validation on
    pub fn with_output_schema(mut self, schema: Schema) -> Self {
        self.output_schema = Some(schema);
        self.options.validate_output = true;
        self
    }

    pub fn with_metadata(mut self, metadata: CommandMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.metadata.description = description.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.metadata.category = category.into();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metadata.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn hook<F>(self, stage: HookStage, hook: F) -> Self
    where
        F: Fn(&HookContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.add_hook(stage, hook);
        self
    }

    /// Append a hook to a lifecycle stage; hooks run in insertion order
    pub fn add_hook<F>(&self, stage: HookStage, hook: F)
    where
        F: Fn(&HookContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks.write().stage_mut(stage).push(Arc::new(hook));
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn options(&self) -> &CommandOptions {
        &self.options
    }

    pub fn metadata(&self) -> &CommandMetadata {
        &self.metadata
    }

    pub fn category(&self) -> &str {
        &self.metadata.category
    }

    pub fn stats(&self) -> CommandStats {
        self.stats.lock().clone()
    }

    /// Run the full lifecycle. Never fails; see [`CommandResult`].
    #[instrument(skip_all, fields(command = %self.name))]
    pub async fn execute(
        &self,
        ctx: Arc<dyn CommandContext>,
        params: Value,
        opts: ExecutionOptions,
    ) -> CommandResult {
        let execution_id = Uuid::new_v4().to_string();
        let timestamp = Utc::now();
        let started = Instant::now();

        if self.options.log_execution {
            debug!(execution_id = %execution_id, "Executing command");
        }

        let (outcome, attempt) = self.run(&ctx, &params, &opts, &execution_id).await;
        let execution_time_ms = started.elapsed().as_secs_f64() * 1_000.0;

        let metadata = ExecutionMetadata {
            command_id: self.id.to_string(),
            command_name: self.name.clone(),
            execution_id: execution_id.clone(),
            execution_time_ms,
            timestamp,
            attempt,
        };

        let error = outcome.as_ref().err().cloned();
        let result = match outcome {
            Ok(data) => {
                self.record(execution_time_ms, None);
                if self.options.log_execution {
                    info!(
                        execution_id = %execution_id,
                        attempt,
                        elapsed_ms = execution_time_ms,
                        "Command succeeded"
                    );
                }
                CommandResult {
                    success: true,
                    data: Some(data),
                    error: None,
                    metadata,
                }
            }
            Err(err) => {
                self.run_error_hooks(ctx.as_ref(), &params, &execution_id, &err);
                let failure = CommandFailure::from(&err);
                self.record(execution_time_ms, Some(failure.clone()));
                if self.options.log_execution {
                    warn!(
                        execution_id = %execution_id,
                        code = %failure.code,
                        error = %failure.message,
                        "Command failed"
                    );
                }
                CommandResult {
                    success: false,
                    data: None,
                    error: Some(failure),
                    metadata,
                }
            }
        };

        self.run_finally_hooks(ctx.as_ref(), &params, &execution_id, result.data.as_ref(), error.as_ref());
        result
    }

    async fn run(
        &self,
        ctx: &Arc<dyn CommandContext>,
        params: &Value,
        opts: &ExecutionOptions,
        execution_id: &str,
    ) -> (Result<Value>, u32) {
        if self.options.validate_input {
            if let Some(schema) = &self.input_schema {
                if let Err(reason) = schema.check(params) {
                    return (Err(EngineError::Validation(reason)), 0);
                }
            }
        }

        let before = HookContext {
            command: &self.name,
            execution_id,
            context: ctx.as_ref(),
            params,
            result: None,
            error: None,
        };
        if let Err(err) = self.run_hooks(HookStage::Before, &before) {
            return (Err(err), 0);
        }

        let (outcome, attempt) = self.invoke_with_retry(ctx, params, opts).await;
        let data = match outcome {
            Ok(data) => data,
            Err(err) => return (Err(err), attempt),
        };

        if self.options.validate_output {
            if let Some(schema) = &self.output_schema {
                if let Err(reason) = schema.check(&data) {
                    return (Err(EngineError::OutputValidation(reason)), attempt);
                }
            }
        }

        let after = HookContext {
            command: &self.name,
            execution_id,
            context: ctx.as_ref(),
            params,
            result: Some(&data),
            error: None,
        };
        if let Err(err) = self.run_hooks(HookStage::After, &after) {
            return (Err(err), attempt);
        }

        (Ok(data), attempt)
    }

    /// Each attempt races the handler against the timer. The handler runs as
    /// its own task, so a timed-out attempt keeps running detached.
    async fn invoke_with_retry(
        &self,
        ctx: &Arc<dyn CommandContext>,
        params: &Value,
        opts: &ExecutionOptions,
    ) -> (Result<Value>, u32) {
        let attempts = opts.retries.unwrap_or(self.options.retries).saturating_add(1);
        let timeout_ms = opts.timeout_ms.unwrap_or(self.options.timeout_ms);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let call = (self.handler)(Arc::clone(ctx), params.clone(), opts.clone());
            let task = tokio::spawn(call);

            let outcome = match tokio::time::timeout(Duration::from_millis(timeout_ms), task).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(join_err)) => Err(EngineError::handler(format!("handler aborted: {join_err}"))),
                Err(_) => Err(EngineError::Timeout {
                    command: self.name.clone(),
                    timeout_ms,
                }),
            };

            match outcome {
                Ok(data) => return (Ok(data), attempt),
                Err(err) => {
                    if attempt < attempts {
                        let delay = self.options.retry.delay_for(attempt);
                        warn!(
                            attempt,
                            attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Command attempt failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_error = Some(err);
                }
            }
        }

        let err = last_error.unwrap_or_else(|| EngineError::handler("command made no attempts"));
        (Err(err), attempts)
    }

    fn hooks_for(&self, stage: HookStage) -> Vec<Hook> {
        self.hooks.read().stage(stage).clone()
    }

    fn run_hooks(&self, stage: HookStage, hook_ctx: &HookContext<'_>) -> Result<()> {
        for hook in self.hooks_for(stage) {
            if let Err(err) = hook(hook_ctx) {
                debug!(stage = stage.name(), error = %err, "Hook aborted command");
                return Err(err);
            }
        }
        Ok(())
    }

    fn run_error_hooks(
        &self,
        ctx: &dyn CommandContext,
        params: &Value,
        execution_id: &str,
        err: &EngineError,
    ) {
        let hook_ctx = HookContext {
            command: &self.name,
            execution_id,
            context: ctx,
            params,
            result: None,
            error: Some(err),
        };
        for hook in self.hooks_for(HookStage::Error) {
            if let Err(hook_err) = hook(&hook_ctx) {
                warn!(command = %self.name, error = %hook_err, "Error hook failed");
            }
        }
    }

    fn run_finally_hooks(
        &self,
        ctx: &dyn CommandContext,
        params: &Value,
        execution_id: &str,
        result: Option<&Value>,
        error: Option<&EngineError>,
    ) {
        let hook_ctx = HookContext {
            command: &self.name,
            execution_id,
            context: ctx,
            params,
            result,
            error,
        };
        for hook in self.hooks_for(HookStage::Finally) {
            if let Err(hook_err) = hook(&hook_ctx) {
                warn!(command = %self.name, error = %hook_err, "Finally hook failed");
            }
        }
    }

    fn record(&self, elapsed_ms: f64, failure: Option<CommandFailure>) {
        let mut stats = self.stats.lock();
        stats.execution_count += 1;
        match failure {
            None => stats.success_count += 1,
            Some(failure) => {
                stats.error_count += 1;
                stats.last_error = Some(failure);
            }
        }
        stats.total_execution_time_ms += elapsed_ms;
        stats.average_execution_time_ms =
            stats.total_execution_time_ms / stats.execution_count as f64;
        stats.last_executed = Some(Utc::now());
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("category", &self.metadata.category)
            .field("options", &self.options)
            .finish()
    }
}
