//! Execution context handed to command handlers
//!
//! Handlers only see the [`CommandContext`] trait. [`AppContext`] is the
//! in-process implementation: services, keyed state with change
//! notifications, and nested command execution through the registry.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::command::{CommandResult, ExecutionOptions};
use crate::error::{EngineError, Result};
use crate::events::{
    EventBus, ListenerOptions, Subscription, BATCH_COMPLETED, CONTEXT_DESTROYED,
    SERVICE_REGISTERED, STATE_CHANGED,
};
use crate::registry::CommandRegistry;

pub type Service = Arc<dyn Any + Send + Sync>;
/// Called with `(key, new_value)` on every change of a subscribed key
pub type StateCallback = Arc<dyn Fn(&str, &Value) + Send + Sync>;

#[async_trait]
pub trait CommandContext: Send + Sync {
    fn get_service(&self, name: &str) -> Option<Service>;

    fn get_state(&self, key: &str) -> Option<Value>;

    fn set_state(&self, key: &str, value: Value, meta: Option<Value>);

    fn subscribe(&self, key: &str, callback: StateCallback) -> Option<Subscription>;

    /// Execute another command by name
    async fn execute(&self, command: &str, params: Value) -> Result<CommandResult>;
}

/// Context with no services, no state and no commands
#[derive(Debug, Clone, Copy, Default)]
pub struct NullContext;

#[async_trait]
impl CommandContext for NullContext {
    fn get_service(&self, _name: &str) -> Option<Service> {
        None
    }

    fn get_state(&self, _key: &str) -> Option<Value> {
        None
    }

    fn set_state(&self, _key: &str, _value: Value, _meta: Option<Value>) {}

    fn subscribe(&self, _key: &str, _callback: StateCallback) -> Option<Subscription> {
        None
    }

    async fn execute(&self, command: &str, _params: Value) -> Result<CommandResult> {
        Err(EngineError::CommandNotFound(command.to_string()))
    }
}

/// Shared application context backed by a registry and an event bus
pub struct AppContext {
    me: Weak<AppContext>,
    registry: Arc<CommandRegistry>,
    events: EventBus,
    services: RwLock<HashMap<String, Service>>,
    state: RwLock<HashMap<String, Value>>,
    destroyed: AtomicBool,
}

impl AppContext {
    pub fn new(registry: Arc<CommandRegistry>, events: EventBus) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            registry,
            events,
            services: RwLock::new(HashMap::new()),
            state: RwLock::new(HashMap::new()),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn register_service(&self, name: &str, service: Service) {
        self.services.write().insert(name.to_string(), service);
        debug!(service = %name, "Registered service");
        self.events
            .emit_from(SERVICE_REGISTERED, json!({ "name": name }), "context");
    }

    /// Typed service lookup
    pub fn service<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.get_service(name)
            .and_then(|service| service.downcast::<T>().ok())
    }

    pub fn state_snapshot(&self) -> HashMap<String, Value> {
        self.state.read().clone()
    }

    /// Run commands in order; every call runs regardless of earlier failures
    pub async fn execute_batch(&self, calls: Vec<(String, Value)>) -> Vec<Result<CommandResult>> {
        let mut results = Vec::with_capacity(calls.len());
        for (command, params) in calls {
            results.push(self.execute(&command, params).await);
        }

        let succeeded = results
            .iter()
            .filter(|r| matches!(r, Ok(result) if result.success))
            .count();
        self.events.emit_from(
            BATCH_COMPLETED,
            json!({
                "total": results.len(),
                "succeeded": succeeded,
                "failed": results.len() - succeeded,
            }),
            "context",
        );
        results
    }

    /// Drop all state and services; later executions fail
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let keys = {
            let mut state = self.state.write();
            let count = state.len();
            state.clear();
            count
        };
        self.services.write().clear();
        info!(state_keys = keys, "Context destroyed");
        self.events
            .emit_from(CONTEXT_DESTROYED, json!({ "stateKeys": keys }), "context");
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandContext for AppContext {
    fn get_service(&self, name: &str) -> Option<Service> {
        self.services.read().get(name).cloned()
    }

    fn get_state(&self, key: &str) -> Option<Value> {
        self.state.read().get(key).cloned()
    }

    fn set_state(&self, key: &str, value: Value, meta: Option<Value>) {
        let previous = self.state.write().insert(key.to_string(), value.clone());
        self.events.emit_from(
            STATE_CHANGED,
            json!({
                "key": key,
                "value": value,
                "previous": previous,
                "meta": meta,
            }),
            "context",
        );
    }

    fn subscribe(&self, key: &str, callback: StateCallback) -> Option<Subscription> {
        let wanted = key.to_string();
        let subscription = self.events.on(
            STATE_CHANGED,
            move |event| {
                let key = event.data["key"].as_str().unwrap_or_default();
                callback(key, &event.data["value"]);
                Ok(())
            },
            ListenerOptions::new().filter(move |event| event.data["key"] == wanted.as_str()),
        );
        Some(subscription)
    }

    async fn execute(&self, command: &str, params: Value) -> Result<CommandResult> {
        if self.is_destroyed() {
            return Err(EngineError::Config("context has been destroyed".into()));
        }
        let me: Arc<dyn CommandContext> = self
            .me
            .upgrade()
            .ok_or_else(|| EngineError::Config("context has been dropped".into()))?;
        self.registry
            .execute(command, me, params, ExecutionOptions::default())
            .await
    }
}
