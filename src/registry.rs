//! Command registry - name lookup, categories and aliases

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::command::{Command, CommandResult, CommandStats, ExecutionOptions};
use crate::context::CommandContext;
use crate::error::{EngineError, Result};
use crate::events::{EventBus, COMMAND_EXECUTED};

#[derive(Default)]
struct RegistryState {
    commands: HashMap<String, Arc<Command>>,
    /// category -> command names; each command sits in exactly one bucket
    categories: HashMap<String, BTreeSet<String>>,
    /// alias -> command name
    aliases: HashMap<String, String>,
}

impl RegistryState {
    fn resolve(&self, name: &str) -> Option<&Arc<Command>> {
        self.commands
            .get(name)
            .or_else(|| self.aliases.get(name).and_then(|target| self.commands.get(target)))
    }

    fn detach_category(&mut self, command: &Command) {
        let category = command.category();
        if let Some(bucket) = self.categories.get_mut(category) {
            bucket.remove(command.name());
            if bucket.is_empty() {
                self.categories.remove(category);
            }
        }
    }
}

/// Registry of named commands
pub struct CommandRegistry {
    state: RwLock<RegistryState>,
    events: Option<EventBus>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            events: None,
        }
    }

    /// Executions through this registry will emit `command:executed`
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn event_bus(&self) -> Option<&EventBus> {
        self.events.as_ref()
    }

    /// Register a command, replacing (with a warning) any command of the
    /// same name
    pub fn register(&self, command: Command) -> Result<Arc<Command>> {
        self.register_shared(Arc::new(command))
    }

    pub fn register_shared(&self, command: Arc<Command>) -> Result<Arc<Command>> {
        if command.name().trim().is_empty() {
            return Err(EngineError::Config("command name must not be empty".into()));
        }

        let name = command.name().to_string();
        let category = command.category().to_string();
        let mut state = self.state.write();

        if let Some(previous) = state.commands.remove(&name) {
            warn!(command = %name, "Command already registered, overwriting");
            state.detach_category(&previous);
        }
        if state.aliases.contains_key(&name) {
            warn!(command = %name, "Command name shadows an existing alias");
        }

        state
            .categories
            .entry(category.clone())
            .or_default()
            .insert(name.clone());
        state.commands.insert(name.clone(), Arc::clone(&command));

        info!(command = %name, category = %category, "Registered command");
        Ok(command)
    }

    /// Look up by name, falling back to the alias table
    pub fn get(&self, name: &str) -> Option<Arc<Command>> {
        self.state.read().resolve(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.read().resolve(name).is_some()
    }

    /// Execute a registered command by name or alias
    #[instrument(skip(self, ctx, params, opts))]
    pub async fn execute(
        &self,
        name: &str,
        ctx: Arc<dyn CommandContext>,
        params: Value,
        opts: ExecutionOptions,
    ) -> Result<CommandResult> {
        let command = self
            .get(name)
            .ok_or_else(|| EngineError::CommandNotFound(name.to_string()))?;

        let result = command.execute(ctx, params, opts).await;

        if let Some(events) = &self.events {
            events.emit_from(
                COMMAND_EXECUTED,
                json!({
                    "command": command.name(),
                    "requested": name,
                    "executionId": result.metadata.execution_id,
                    "success": result.success,
                    "executionTime": result.metadata.execution_time_ms,
                    "code": result.code(),
                }),
                "registry",
            );
        }

        Ok(result)
    }

    /// Point `alias` at a registered command (or at another alias' target)
    pub fn alias(&self, alias: &str, target: &str) -> Result<()> {
        let mut state = self.state.write();
        let resolved = state
            .resolve(target)
            .map(|cmd| cmd.name().to_string())
            .ok_or_else(|| EngineError::AliasTarget {
                alias: alias.to_string(),
                target: target.to_string(),
            })?;

        if state.commands.contains_key(alias) {
            warn!(alias = %alias, "Alias is shadowed by a command of the same name");
        }
        debug!(alias = %alias, target = %resolved, "Registered alias");
        state.aliases.insert(alias.to_string(), resolved);
        Ok(())
    }

    pub fn aliases_for(&self, name: &str) -> Vec<String> {
        let mut aliases: Vec<String> = self
            .state
            .read()
            .aliases
            .iter()
            .filter(|(_, target)| target.as_str() == name)
            .map(|(alias, _)| alias.clone())
            .collect();
        aliases.sort();
        aliases
    }

    /// Commands in a category, ordered by name
    pub fn get_by_category(&self, category: &str) -> Vec<Arc<Command>> {
        let state = self.state.read();
        state
            .categories
            .get(category)
            .map(|names| {
                names
                    .iter()
                    .filter_map(|name| state.commands.get(name).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove a command along with its category entry and any aliases
    /// pointing at it
    pub fn unregister(&self, name: &str) -> bool {
        let mut state = self.state.write();
        let Some(command) = state.commands.remove(name) else {
            return false;
        };
        state.detach_category(&command);
        state.aliases.retain(|_, target| target.as_str() != name);
        info!(command = %name, "Unregistered command");
        true
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().commands.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn categories(&self) -> Vec<String> {
        let mut categories: Vec<String> = self.state.read().categories.keys().cloned().collect();
        categories.sort();
        categories
    }

    pub fn len(&self) -> usize {
        self.state.read().commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-command stat snapshots
    pub fn statistics(&self) -> BTreeMap<String, CommandStats> {
        self.state
            .read()
            .commands
            .iter()
            .map(|(name, cmd)| (name.clone(), cmd.stats()))
            .collect()
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}
