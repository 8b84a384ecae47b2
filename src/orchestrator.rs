//! Orchestration facade - routes requests to commands or crews
//!
//! A request either names a command (run through the registry) or describes
//! work for a crew. Crew selection goes: explicit crew name, then the crew
//! registered for the request's category, then the default crew. A process
//! override runs the chosen crew's agents under a different discipline.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::agent::{Task, TaskCategory};
use crate::channel::{ChannelPair, OrchestratorChannel};
use crate::command::ExecutionOptions;
use crate::config::{CrewConfig, ProcessKind};
use crate::context::{AppContext, CommandContext};
use crate::crew::Crew;
use crate::error::{EngineError, Result};
use crate::events::{EventBus, ORCHESTRATOR_DISPATCHED};
use crate::registry::CommandRegistry;

/// Dispatch outcomes kept for inspection
const HISTORY_LIMIT: usize = 100;

/// Incoming unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Request {
    pub id: String,
    pub description: String,
    /// Run this command instead of a crew
    pub command: Option<String>,
    pub params: Value,
    pub crew: Option<String>,
    /// Overrides the category inferred from the description
    pub category: Option<String>,
    pub process: Option<ProcessKind>,
    /// Defaults to a single task built from the description
    pub tasks: Vec<Task>,
    pub inputs: Value,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            description: String::new(),
            command: None,
            params: Value::Null,
            crew: None,
            category: None,
            process: None,
            tasks: Vec::new(),
            inputs: Value::Null,
        }
    }
}

impl Request {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn command(name: impl Into<String>, params: Value) -> Self {
        let name = name.into();
        Self {
            description: name.clone(),
            command: Some(name),
            params,
            ..Default::default()
        }
    }

    pub fn with_crew(mut self, crew: impl Into<String>) -> Self {
        self.crew = Some(crew.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_process(mut self, process: ProcessKind) -> Self {
        self.process = Some(process);
        self
    }

    pub fn with_tasks(mut self, tasks: Vec<Task>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn with_inputs(mut self, inputs: Value) -> Self {
        self.inputs = inputs;
        self
    }
}

/// How a request will be handled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "route", rename_all = "lowercase")]
pub enum Plan {
    Command {
        name: String,
        params: Value,
    },
    Crew {
        crew: String,
        process: ProcessKind,
        tasks: Vec<Task>,
        /// Process differs from the crew's own, so an ad-hoc crew is built
        custom: bool,
    },
}

impl Plan {
    pub fn route(&self) -> String {
        match self {
            Plan::Command { name, .. } => format!("command:{name}"),
            Plan::Crew { crew, process, .. } => format!("crew:{crew}/{process}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOutcome {
    pub request_id: String,
    pub route: Option<String>,
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub execution_time_ms: f64,
    pub timestamp: DateTime<Utc>,
}

impl RequestOutcome {
    pub fn failed(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            route: None,
            success: false,
            data: None,
            error: Some(error.into()),
            execution_time_ms: 0.0,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorMetrics {
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub command_routes: u64,
    pub crew_routes: u64,
    pub average_time_ms: f64,
}

/// The orchestration facade
pub struct Orchestrator {
    registry: Arc<CommandRegistry>,
    context: Arc<AppContext>,
    events: EventBus,
    crews: RwLock<HashMap<String, Arc<Crew>>>,
    /// category -> crew name
    categories: RwLock<HashMap<String, String>>,
    default_crew: RwLock<Option<String>>,
    history: Mutex<VecDeque<RequestOutcome>>,
    metrics: Mutex<OrchestratorMetrics>,
}

impl Orchestrator {
    pub fn new(registry: Arc<CommandRegistry>, events: EventBus) -> Self {
        let context = AppContext::new(Arc::clone(&registry), events.clone());
        Self {
            registry,
            context,
            events,
            crews: RwLock::new(HashMap::new()),
            categories: RwLock::new(HashMap::new()),
            default_crew: RwLock::new(None),
            history: Mutex::new(VecDeque::new()),
            metrics: Mutex::new(OrchestratorMetrics::default()),
        }
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    /// Context handed to commands dispatched through this orchestrator
    pub fn context(&self) -> &Arc<AppContext> {
        &self.context
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Register a crew for the given task categories. The first crew
    /// registered becomes the default.
    pub fn register_crew(&self, crew: Crew, categories: &[&str]) -> Arc<Crew> {
        let name = crew.name().to_string();
        let crew = Arc::new(crew);

        if self.crews.write().insert(name.clone(), Arc::clone(&crew)).is_some() {
            warn!(crew = %name, "Crew already registered, overwriting");
        }
        {
            let mut map = self.categories.write();
            for category in categories {
                map.insert(category.to_string(), name.clone());
            }
        }
        self.default_crew.write().get_or_insert_with(|| name.clone());

        info!(crew = %name, categories = ?categories, "Registered crew");
        crew
    }

    pub fn set_default_crew(&self, name: &str) -> Result<()> {
        if !self.crews.read().contains_key(name) {
            return Err(EngineError::CrewNotFound(name.to_string()));
        }
        *self.default_crew.write() = Some(name.to_string());
        Ok(())
    }

    pub fn crew(&self, name: &str) -> Option<Arc<Crew>> {
        self.crews.read().get(name).cloned()
    }

    pub fn crew_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.crews.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Decide how a request would be handled without running it
    pub fn plan(&self, request: &Request) -> Result<Plan> {
        if let Some(name) = &request.command {
            let command = self
                .registry
                .get(name)
                .ok_or_else(|| EngineError::CommandNotFound(name.clone()))?;
            return Ok(Plan::Command {
                name: command.name().to_string(),
                params: request.params.clone(),
            });
        }

        let crew = self.select_crew(request)?;
        let tasks = if request.tasks.is_empty() {
            vec![Task::new(request.description.clone())]
        } else {
            request.tasks.clone()
        };
        let process = request.process.unwrap_or_else(|| crew.process());

        Ok(Plan::Crew {
            crew: crew.name().to_string(),
            process,
            tasks,
            custom: process != crew.process(),
        })
    }

    fn select_crew(&self, request: &Request) -> Result<Arc<Crew>> {
        let crews = self.crews.read();
        if let Some(name) = &request.crew {
            return crews
                .get(name)
                .cloned()
                .ok_or_else(|| EngineError::CrewNotFound(name.clone()));
        }

        let category = request
            .category
            .clone()
            .unwrap_or_else(|| TaskCategory::classify(&request.description).name().to_string());
        let by_category = self
            .categories
            .read()
            .get(&category)
            .and_then(|name| crews.get(name).cloned());
        if let Some(crew) = by_category {
            return Ok(crew);
        }

        self.default_crew
            .read()
            .as_ref()
            .and_then(|name| crews.get(name).cloned())
            .ok_or_else(|| EngineError::CrewNotFound(format!("no crew handles category '{category}'")))
    }

    /// Plan and run a request. Never fails; errors end up in the outcome.
    #[instrument(skip_all, fields(request_id = %request.id))]
    pub async fn dispatch(&self, request: Request) -> RequestOutcome {
        let started = Instant::now();

        let plan = match self.plan(&request) {
            Ok(plan) => plan,
            Err(err) => {
                error!(error = %err, "Request could not be planned");
                let outcome = RequestOutcome::failed(request.id, err.to_string());
                self.finish(&outcome, None);
                return outcome;
            }
        };
        let route = plan.route();
        debug!(route = %route, "Dispatching request");

        let (success, data, error) = match plan {
            Plan::Command { ref name, ref params } => {
                let ctx: Arc<dyn CommandContext> = Arc::clone(&self.context) as Arc<dyn CommandContext>;
                let opts = ExecutionOptions::default().with_source("orchestrator");
                match self.registry.execute(name, ctx, params.clone(), opts).await {
                    Ok(result) => (result.success, result.data, result.error.map(|f| f.to_string())),
                    Err(err) => (false, None, Some(err.to_string())),
                }
            }
            Plan::Crew {
                ref crew,
                process,
                ref tasks,
                custom,
            } => match self.crew(crew) {
                Some(registered) => {
                    let runner = if custom {
                        Arc::new(self.custom_crew(&registered, process))
                    } else {
                        registered
                    };
                    let output = runner.kickoff_tasks(tasks.clone(), request.inputs.clone()).await;
                    let error = match (&output.error, output.success) {
                        (Some(err), _) => Some(err.clone()),
                        (None, false) => Some(format!(
                            "{} of {} tasks failed",
                            output.results.len() - output.succeeded(),
                            output.results.len()
                        )),
                        (None, true) => None,
                    };
                    (output.success, serde_json::to_value(&output).ok(), error)
                }
                None => (false, None, Some(EngineError::CrewNotFound(crew.clone()).to_string())),
            },
        };

        let outcome = RequestOutcome {
            request_id: request.id,
            route: Some(route),
            success,
            data,
            error,
            execution_time_ms: started.elapsed().as_secs_f64() * 1_000.0,
            timestamp: Utc::now(),
        };
        self.finish(&outcome, Some(&plan));
        outcome
    }

    /// Same agents and settings, different discipline
    fn custom_crew(&self, base: &Crew, process: ProcessKind) -> Crew {
        let config = CrewConfig {
            name: format!("{}:{}", base.name(), process),
            process,
            ..base.config().clone()
        };
        debug!(crew = %config.name, "Building ad-hoc crew");
        base.agents()
            .into_iter()
            .fold(Crew::new(config).with_event_bus(self.events.clone()), |crew, agent| {
                crew.with_agent(agent)
            })
    }

    fn finish(&self, outcome: &RequestOutcome, plan: Option<&Plan>) {
        {
            let mut metrics = self.metrics.lock();
            metrics.dispatched += 1;
            if outcome.success {
                metrics.succeeded += 1;
            } else {
                metrics.failed += 1;
            }
            match plan {
                Some(Plan::Command { .. }) => metrics.command_routes += 1,
                Some(Plan::Crew { .. }) => metrics.crew_routes += 1,
                None => {}
            }
            let n = metrics.dispatched as f64;
            metrics.average_time_ms += (outcome.execution_time_ms - metrics.average_time_ms) / n;
        }

        if outcome.success {
            info!(route = ?outcome.route, elapsed_ms = outcome.execution_time_ms, "Request completed");
        } else {
            error!(route = ?outcome.route, error = ?outcome.error, "Request failed");
        }
        self.events.emit_from(
            ORCHESTRATOR_DISPATCHED,
            json!({
                "requestId": outcome.request_id,
                "route": outcome.route,
                "success": outcome.success,
                "executionTime": outcome.execution_time_ms,
            }),
            "orchestrator",
        );

        let mut history = self.history.lock();
        history.push_back(outcome.clone());
        while history.len() > HISTORY_LIMIT {
            history.pop_front();
        }
    }

    pub fn metrics(&self) -> OrchestratorMetrics {
        self.metrics.lock().clone()
    }

    pub fn history(&self) -> Vec<RequestOutcome> {
        self.history.lock().iter().cloned().collect()
    }

    /// Start the service loop on the current runtime and return the client
    /// channel
    pub fn with_channel(self: Arc<Self>) -> (OrchestratorChannel, JoinHandle<()>) {
        let (channel, pair) = OrchestratorChannel::new();
        let handle = tokio::spawn(self.serve(pair));
        (channel, handle)
    }

    /// Dispatch requests in arrival order until every client is gone
    #[instrument(skip_all)]
    pub async fn serve(self: Arc<Self>, mut pair: ChannelPair) {
        info!("Starting orchestrator service loop");

        while let Some(request) = pair.request_rx.recv().await {
            let outcome = self.dispatch(request).await;
            if pair.outcome_tx.send(outcome).is_err() {
                warn!("Outcome receiver dropped, stopping");
                break;
            }
        }

        info!("Orchestrator service loop stopped");
    }
}
