//! In-process publish/subscribe bus
//!
//! Listeners subscribe to a specific event name or to the wildcard `"*"`.
//! Every emitted event passes through the middleware pipeline first, is
//! appended to the bounded history, and then fans out to the specific
//! listeners followed by the wildcard listeners.
//!
//! ```text
//!  emit(name, data)
//!        │
//!        ▼
//!  ┌────────────┐   ┌─────────┐   ┌──────────────────────────────┐
//!  │ middleware │──►│ history │──►│ specific listeners, wildcard │
//!  └────────────┘   └─────────┘   └──────────────┬───────────────┘
//!                                                │ failure
//!                                                ▼
//!                                         listener:error
//! ```
//!
//! A failing listener never stops its siblings. The failure is counted and
//! re-emitted as `listener:error`, unless the event that triggered it is
//! itself an error-class event.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::EventBusConfig;
use crate::error::{EngineError, Result};

/// Subscribing to this name receives every event
pub const WILDCARD: &str = "*";

pub const STATE_CHANGED: &str = "state:changed";
pub const SERVICE_REGISTERED: &str = "service:registered";
pub const COMMAND_EXECUTED: &str = "command:executed";
pub const ERROR: &str = "error";
pub const LISTENER_ERROR: &str = "listener:error";
pub const PERFORMANCE_SLOW: &str = "performance:slow";
pub const BATCH_COMPLETED: &str = "batch:completed";
pub const CONTEXT_DESTROYED: &str = "context:destroyed";

pub const AGENT_STARTED: &str = "agent:started";
pub const AGENT_COMPLETED: &str = "agent:completed";
pub const AGENT_FAILED: &str = "agent:failed";
pub const CREW_KICKOFF_STARTED: &str = "crew:kickoff_started";
pub const CREW_KICKOFF_COMPLETED: &str = "crew:kickoff_completed";
pub const ORCHESTRATOR_DISPATCHED: &str = "orchestrator:dispatched";

/// Error-class events never re-emit their own listener failures
pub fn is_error_event(name: &str) -> bool {
    name == ERROR || name == LISTENER_ERROR || name.ends_with(":error")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source: Option<String>,
}

/// A single emitted event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    pub name: String,
    pub data: Value,
    pub metadata: EventMetadata,
}

impl EventData {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
            metadata: EventMetadata {
                id: Uuid::new_v4().to_string(),
                timestamp: Utc::now(),
                source: None,
            },
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.metadata.source = Some(source.into());
        self
    }

    /// Copy of this event carrying a different payload
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

pub type SyncListener = Arc<dyn Fn(&EventData) -> Result<()> + Send + Sync>;
pub type AsyncListener = Arc<dyn Fn(EventData) -> BoxFuture<'static, Result<()>> + Send + Sync>;
pub type Filter = Arc<dyn Fn(&EventData) -> bool + Send + Sync>;
/// Pure transform applied to every event before listeners see it
pub type Middleware = Arc<dyn Fn(EventData) -> EventData + Send + Sync>;

#[derive(Clone)]
enum Callback {
    Sync(SyncListener),
    Async(AsyncListener),
}

/// Rate control for a listener. Only one mode applies per subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FlowControl {
    #[default]
    Immediate,
    /// Leading edge: fire, then drop calls inside the window
    Throttle(Duration),
    /// Trailing edge: fire once after the quiet period with the last payload
    Debounce(Duration),
}

#[derive(Clone, Default)]
pub struct ListenerOptions {
    pub filter: Option<Filter>,
    pub flow: FlowControl,
    pub once: bool,
}

impl ListenerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&EventData) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(predicate));
        self
    }

    pub fn throttle(mut self, window: Duration) -> Self {
        self.flow = FlowControl::Throttle(window);
        self
    }

    pub fn debounce(mut self, wait: Duration) -> Self {
        self.flow = FlowControl::Debounce(wait);
        self
    }

    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }
}

/// Stable handle identifying one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct ListenerEntry {
    id: SubscriptionId,
    callback: Callback,
    options: ListenerOptions,
    active: AtomicBool,
    fired: AtomicBool,
    last_fired: Mutex<Option<tokio::time::Instant>>,
    debounce_generation: AtomicU64,
}

impl ListenerEntry {
    fn invoke(&self, event: &EventData) -> Dispatch {
        match &self.callback {
            Callback::Sync(f) => Dispatch::Completed(f(event)),
            Callback::Async(f) => Dispatch::Pending(f(event.clone())),
        }
    }
}

enum Dispatch {
    Skipped,
    Deferred,
    Completed(Result<()>),
    Pending(BoxFuture<'static, Result<()>>),
}

#[derive(Default)]
struct ListenerTable {
    events: HashMap<String, Vec<Arc<ListenerEntry>>>,
    wildcard: Vec<Arc<ListenerEntry>>,
}

impl ListenerTable {
    fn targets(&self, name: &str) -> Vec<Arc<ListenerEntry>> {
        let mut out: Vec<Arc<ListenerEntry>> =
            self.events.get(name).cloned().unwrap_or_default();
        if name != WILDCARD {
            out.extend(self.wildcard.iter().cloned());
        }
        out
    }

    fn count(&self, name: &str) -> usize {
        if name == WILDCARD {
            self.wildcard.len()
        } else {
            self.events.get(name).map(Vec::len).unwrap_or(0)
        }
    }
}

/// Snapshot of bus counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetrics {
    pub events_emitted: u64,
    pub listeners_triggered: u64,
    pub average_emit_time_ms: f64,
    pub error_count: u64,
}

struct BusInner {
    config: EventBusConfig,
    listeners: RwLock<ListenerTable>,
    middleware: RwLock<Vec<Middleware>>,
    history: Mutex<VecDeque<EventData>>,
    metrics: Mutex<EventMetrics>,
    next_id: AtomicU64,
}

impl BusInner {
    fn remove(&self, id: SubscriptionId) -> bool {
        let mut table = self.listeners.write();
        let mut found = false;
        let mut strip = |entries: &mut Vec<Arc<ListenerEntry>>| {
            entries.retain(|entry| {
                if entry.id == id {
                    entry.active.store(false, Ordering::SeqCst);
                    found = true;
                    false
                } else {
                    true
                }
            });
        };
        for entries in table.events.values_mut() {
            strip(entries);
        }
        strip(&mut table.wildcard);
        table.events.retain(|_, entries| !entries.is_empty());
        found
    }
}

/// Returned by `on()`; unsubscribes explicitly, never on drop
#[derive(Clone)]
pub struct Subscription {
    id: SubscriptionId,
    event: String,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn unsubscribe(&self) -> bool {
        self.bus
            .upgrade()
            .map(|inner| inner.remove(self.id))
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("event", &self.event)
            .finish()
    }
}

/// The event bus. Cloning yields another handle to the same bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    pub fn with_config(config: EventBusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                listeners: RwLock::new(ListenerTable::default()),
                middleware: RwLock::new(Vec::new()),
                history: Mutex::new(VecDeque::new()),
                metrics: Mutex::new(EventMetrics::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.inner.config
    }

    // === Subscription ===

    /// Subscribe a synchronous listener
    pub fn on<F>(&self, event: &str, listener: F, options: ListenerOptions) -> Subscription
    where
        F: Fn(&EventData) -> Result<()> + Send + Sync + 'static,
    {
        self.subscribe(event, Callback::Sync(Arc::new(listener)), options)
    }

    /// Subscribe an async listener; its future is awaited and failures are
    /// routed to `listener:error`
    pub fn on_async<F, Fut>(&self, event: &str, listener: F, options: ListenerOptions) -> Subscription
    where
        F: Fn(EventData) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let callback: AsyncListener = Arc::new(move |event| listener(event).boxed());
        self.subscribe(event, Callback::Async(callback), options)
    }

    pub fn once<F>(&self, event: &str, listener: F) -> Subscription
    where
        F: Fn(&EventData) -> Result<()> + Send + Sync + 'static,
    {
        self.on(event, listener, ListenerOptions::new().once())
    }

    /// Subscribe for at most `ms`; the subscription is dropped when the
    /// timer fires even if no event arrived
    pub fn timeout<F>(&self, event: &str, listener: F, ms: u64) -> Subscription
    where
        F: Fn(&EventData) -> Result<()> + Send + Sync + 'static,
    {
        let subscription = self.on(event, listener, ListenerOptions::new());
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let expiring = subscription.clone();
                handle.spawn(async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    if expiring.unsubscribe() {
                        debug!(event = %expiring.event, id = %expiring.id, "Timed subscription expired");
                    }
                });
            }
            Err(_) => {
                warn!(event = %event, "No async runtime; timed subscription will not expire");
            }
        }
        subscription
    }

    fn subscribe(&self, event: &str, callback: Callback, options: ListenerOptions) -> Subscription {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let entry = Arc::new(ListenerEntry {
            id,
            callback,
            options,
            active: AtomicBool::new(true),
            fired: AtomicBool::new(false),
            last_fired: Mutex::new(None),
            debounce_generation: AtomicU64::new(0),
        });

        let count = {
            let mut table = self.inner.listeners.write();
            let entries = if event == WILDCARD {
                &mut table.wildcard
            } else {
                table.events.entry(event.to_string()).or_default()
            };
            entries.push(entry);
            entries.len()
        };

        if count > self.inner.config.max_listeners {
            warn!(
                event = %event,
                count,
                max = self.inner.config.max_listeners,
                "Listener count exceeds soft limit"
            );
        }

        Subscription {
            id,
            event: event.to_string(),
            bus: Arc::downgrade(&self.inner),
        }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.remove(id)
    }

    /// Append a middleware stage to the pipeline
    pub fn use_middleware<F>(&self, middleware: F)
    where
        F: Fn(EventData) -> EventData + Send + Sync + 'static,
    {
        self.inner.middleware.write().push(Arc::new(middleware));
    }

    /// Remove every listener for `event`
    pub fn off(&self, event: &str) -> usize {
        let mut table = self.inner.listeners.write();
        let removed = if event == WILDCARD {
            std::mem::take(&mut table.wildcard)
        } else {
            table.events.remove(event).unwrap_or_default()
        };
        for entry in &removed {
            entry.active.store(false, Ordering::SeqCst);
        }
        removed.len()
    }

    pub fn remove_all_listeners(&self) {
        let mut table = self.inner.listeners.write();
        for entry in table.events.values().flatten().chain(table.wildcard.iter()) {
            entry.active.store(false, Ordering::SeqCst);
        }
        *table = ListenerTable::default();
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.inner.listeners.read().count(event)
    }

    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.listeners.read().events.keys().cloned().collect();
        names.sort();
        names
    }

    // === Emission ===

    /// Emit and return the post-middleware event. Sync listeners run inline;
    /// async listeners are spawned on the current runtime.
    pub fn emit(&self, event: &str, data: Value) -> EventData {
        self.emit_event(EventData::new(event, data))
    }

    pub fn emit_from(&self, event: &str, data: Value, source: &str) -> EventData {
        self.emit_event(EventData::new(event, data).with_source(source))
    }

    /// Emit with caller-supplied metadata (id, timestamp and source)
    pub fn emit_with_metadata(&self, event: &str, data: Value, metadata: EventMetadata) -> EventData {
        self.emit_event(EventData {
            name: event.to_string(),
            data,
            metadata,
        })
    }

    fn emit_event(&self, raw: EventData) -> EventData {
        let started = std::time::Instant::now();
        let (event, pending, triggered) = self.fan_out(raw);
        let spawned = pending
            .into_iter()
            .filter_map(|(id, future)| self.spawn_listener(id, future, &event))
            .count() as u64;
        self.finish(&event, started, triggered + spawned);
        event
    }

    /// Emit and wait for every async listener to settle
    pub async fn emit_async(&self, event: &str, data: Value) -> EventData {
        let started = std::time::Instant::now();
        let (event, pending, triggered) = self.fan_out(EventData::new(event, data));
        let (ids, futures): (Vec<_>, Vec<_>) = pending.into_iter().unzip();
        let triggered = triggered + futures.len() as u64;
        let outcomes = join_all(futures).await;
        for (id, outcome) in ids.into_iter().zip(outcomes) {
            if let Err(err) = outcome {
                self.report_listener_error(&event, id, &err);
            }
        }
        self.finish(&event, started, triggered);
        event
    }

    /// Emit and wait at most `ms` for async listeners. On expiry the caller
    /// gets a timeout error; the listener work keeps running.
    pub async fn emit_with_timeout(&self, event: &str, data: Value, ms: u64) -> Result<EventData> {
        let started = std::time::Instant::now();
        let (event, pending, triggered) = self.fan_out(EventData::new(event, data));
        let handles: Vec<JoinHandle<()>> = pending
            .into_iter()
            .filter_map(|(id, future)| self.spawn_listener(id, future, &event))
            .collect();
        let triggered = triggered + handles.len() as u64;

        let settled = tokio::time::timeout(Duration::from_millis(ms), join_all(handles)).await;
        self.finish(&event, started, triggered);
        match settled {
            Ok(_) => Ok(event),
            Err(_) => Err(EngineError::EmitTimeout {
                event: event.name.clone(),
                timeout_ms: ms,
            }),
        }
    }

    fn fan_out(
        &self,
        raw: EventData,
    ) -> (EventData, Vec<(SubscriptionId, BoxFuture<'static, Result<()>>)>, u64) {
        let event = self.apply_middleware(raw);
        self.record_history(&event);

        let targets = self.inner.listeners.read().targets(&event.name);
        let mut pending = Vec::new();
        let mut triggered = 0;

        for entry in targets {
            match self.dispatch(&entry, &event) {
                Dispatch::Skipped | Dispatch::Deferred => {}
                Dispatch::Completed(outcome) => {
                    triggered += 1;
                    if let Err(err) = outcome {
                        self.report_listener_error(&event, entry.id, &err);
                    }
                }
                // counted once it actually runs
                Dispatch::Pending(future) => {
                    pending.push((entry.id, future));
                }
            }
        }

        (event, pending, triggered)
    }

    fn apply_middleware(&self, event: EventData) -> EventData {
        let stages = self.inner.middleware.read().clone();
        stages.iter().fold(event, |event, stage| stage(event))
    }

    fn record_history(&self, event: &EventData) {
        let cap = self.inner.config.max_history_size;
        let mut history = self.inner.history.lock();
        history.push_back(event.clone());
        while history.len() > cap {
            history.pop_front();
        }
    }

    fn dispatch(&self, entry: &Arc<ListenerEntry>, event: &EventData) -> Dispatch {
        if !entry.active.load(Ordering::SeqCst) {
            return Dispatch::Skipped;
        }
        if let Some(filter) = &entry.options.filter {
            if !filter(event) {
                return Dispatch::Skipped;
            }
        }
        if entry.options.once {
            if entry.fired.swap(true, Ordering::SeqCst) {
                return Dispatch::Skipped;
            }
            self.inner.remove(entry.id);
        }

        match entry.options.flow {
            FlowControl::Immediate => entry.invoke(event),
            FlowControl::Throttle(window) => {
                let now = tokio::time::Instant::now();
                let mut last = entry.last_fired.lock();
                if let Some(previous) = *last {
                    if now.duration_since(previous) < window {
                        return Dispatch::Skipped;
                    }
                }
                *last = Some(now);
                drop(last);
                entry.invoke(event)
            }
            FlowControl::Debounce(wait) => {
                self.schedule_debounced(Arc::clone(entry), event.clone(), wait);
                Dispatch::Deferred
            }
        }
    }

    fn schedule_debounced(&self, entry: Arc<ListenerEntry>, event: EventData, wait: Duration) {
        let generation = entry.debounce_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(event = %event.name, id = %entry.id, "No async runtime; debounced call dropped");
            return;
        };

        let bus = self.clone();
        handle.spawn(async move {
            tokio::time::sleep(wait).await;
            if entry.debounce_generation.load(Ordering::SeqCst) != generation
                || !entry.active.load(Ordering::SeqCst)
            {
                return;
            }
            let outcome = match entry.invoke(&event) {
                Dispatch::Completed(outcome) => outcome,
                Dispatch::Pending(future) => future.await,
                Dispatch::Skipped | Dispatch::Deferred => Ok(()),
            };
            bus.inner.metrics.lock().listeners_triggered += 1;
            if let Err(err) = outcome {
                bus.report_listener_error(&event, entry.id, &err);
            }
        });
    }

    fn spawn_listener(
        &self,
        id: SubscriptionId,
        future: BoxFuture<'static, Result<()>>,
        event: &EventData,
    ) -> Option<JoinHandle<()>> {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(event = %event.name, id = %id, "No async runtime; async listener skipped");
            return None;
        };
        let bus = self.clone();
        let event = event.clone();
        Some(handle.spawn(async move {
            if let Err(err) = future.await {
                bus.report_listener_error(&event, id, &err);
            }
        }))
    }

    fn report_listener_error(&self, event: &EventData, id: SubscriptionId, err: &EngineError) {
        self.inner.metrics.lock().error_count += 1;
        warn!(event = %event.name, id = %id, error = %err, "Listener failed");

        if !is_error_event(&event.name) {
            self.emit(
                LISTENER_ERROR,
                json!({
                    "event": event.name,
                    "eventId": event.metadata.id,
                    "subscription": id.to_string(),
                    "error": err.to_string(),
                    "code": err.code(),
                }),
            );
        }
    }

    fn finish(&self, event: &EventData, started: std::time::Instant, triggered: u64) {
        let elapsed = started.elapsed();
        let elapsed_ms = elapsed.as_secs_f64() * 1_000.0;
        {
            let mut metrics = self.inner.metrics.lock();
            metrics.events_emitted += 1;
            metrics.listeners_triggered += triggered;
            let n = metrics.events_emitted as f64;
            metrics.average_emit_time_ms += (elapsed_ms - metrics.average_emit_time_ms) / n;
        }

        if elapsed > Duration::from_millis(self.inner.config.slow_threshold_ms)
            && event.name != PERFORMANCE_SLOW
        {
            self.emit(
                PERFORMANCE_SLOW,
                json!({
                    "event": event.name,
                    "durationMs": elapsed_ms,
                    "listeners": triggered,
                }),
            );
        }
    }

    // === History & metrics ===

    pub fn history(&self) -> Vec<EventData> {
        self.inner.history.lock().iter().cloned().collect()
    }

    pub fn history_for(&self, event: &str) -> Vec<EventData> {
        self.inner
            .history
            .lock()
            .iter()
            .filter(|e| e.name == event)
            .cloned()
            .collect()
    }

    pub fn clear_history(&self) {
        self.inner.history.lock().clear();
    }

    pub fn metrics(&self) -> EventMetrics {
        self.inner.metrics.lock().clone()
    }

    pub fn reset_metrics(&self) {
        *self.inner.metrics.lock() = EventMetrics::default();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn counting(count: &Arc<AtomicUsize>) -> impl Fn(&EventData) -> Result<()> + Send + Sync + 'static {
        let count = Arc::clone(count);
        move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    // === Fan-out ===

    #[test]
    fn test_specific_and_wildcard_listeners_each_fire_once() {
        let bus = EventBus::new();
        bus.use_middleware(|e| {
            let data = json!({"wrapped": e.data.clone()});
            e.with_data(data)
        });

        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let seen = Arc::clone(&seen);
            bus.on(
                "track:loaded",
                move |e| {
                    seen.lock().push(e.data.clone());
                    Ok(())
                },
                ListenerOptions::new(),
            );
        }
        let wild = Arc::clone(&seen);
        bus.on(
            WILDCARD,
            move |e| {
                wild.lock().push(e.data.clone());
                Ok(())
            },
            ListenerOptions::new(),
        );

        let emitted = bus.emit("track:loaded", json!(42));

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|d| *d == json!({"wrapped": 42})));
        assert_eq!(emitted.data, json!({"wrapped": 42}));
        assert_eq!(bus.metrics().listeners_triggered, 3);
    }

    #[test]
    fn test_once_listener_fires_once_and_is_removed() {
        let bus = EventBus::new();
        let count = counter();
        bus.once("ready", counting(&count));

        bus.emit("ready", Value::Null);
        bus.emit("ready", Value::Null);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count("ready"), 0);
    }

    #[test]
    fn test_filter_gates_execution() {
        let bus = EventBus::new();
        let count = counter();
        bus.on(
            "position",
            counting(&count),
            ListenerOptions::new().filter(|e| e.data["chr"] == "chr1"),
        );

        bus.emit("position", json!({"chr": "chr2"}));
        bus.emit("position", json!({"chr": "chr1"}));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_handle() {
        let bus = EventBus::new();
        let count = counter();
        let sub = bus.on("tick", counting(&count), ListenerOptions::new());

        assert!(sub.unsubscribe());
        assert!(!sub.unsubscribe());
        bus.emit("tick", Value::Null);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_off_and_remove_all() {
        let bus = EventBus::new();
        bus.on("a", |_| Ok(()), ListenerOptions::new());
        bus.on("a", |_| Ok(()), ListenerOptions::new());
        bus.on("b", |_| Ok(()), ListenerOptions::new());

        assert_eq!(bus.off("a"), 2);
        assert_eq!(bus.event_names(), vec!["b".to_string()]);

        bus.remove_all_listeners();
        assert!(bus.event_names().is_empty());
    }

    #[test]
    fn test_max_listeners_is_soft_limit() {
        let bus = EventBus::with_config(EventBusConfig {
            max_listeners: 1,
            ..Default::default()
        });
        for _ in 0..3 {
            bus.on("busy", |_| Ok(()), ListenerOptions::new());
        }
        assert_eq!(bus.listener_count("busy"), 3);
    }

    // === History ===

    #[test]
    fn test_history_evicts_oldest() {
        let bus = EventBus::with_config(EventBusConfig {
            max_history_size: 2,
            ..Default::default()
        });
        bus.emit("E1", Value::Null);
        bus.emit("E2", Value::Null);
        bus.emit("E3", Value::Null);

        let names: Vec<String> = bus.history().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["E2", "E3"]);
        assert_eq!(bus.history_for("E1").len(), 0);
    }

    #[test]
    fn test_emit_with_metadata_keeps_caller_fields() {
        let bus = EventBus::new();
        let metadata = EventMetadata {
            id: "evt-42".to_string(),
            timestamp: Utc::now() - chrono::Duration::minutes(5),
            source: Some("importer".to_string()),
        };

        let event = bus.emit_with_metadata("track:loaded", json!({"track": "genes"}), metadata.clone());

        assert_eq!(event.metadata, metadata);
        assert_eq!(bus.history_for("track:loaded")[0].metadata.id, "evt-42");
    }

    #[test]
    fn test_async_listener_without_runtime_is_not_counted() {
        let bus = EventBus::new();
        let count = counter();
        bus.on("sync-only", counting(&count), ListenerOptions::new());
        bus.on_async("sync-only", |_| async { Ok(()) }, ListenerOptions::new());

        bus.emit("sync-only", Value::Null);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.metrics().listeners_triggered, 1);
    }

    // === Failure isolation ===

    #[test]
    fn test_failing_listener_does_not_block_siblings() {
        let bus = EventBus::new();
        let count = counter();
        let errors = Arc::new(Mutex::new(Vec::new()));

        bus.on("job", |_| Err(EngineError::handler("listener broke")), ListenerOptions::new());
        bus.on("job", counting(&count), ListenerOptions::new());
        let sink = Arc::clone(&errors);
        bus.on(
            LISTENER_ERROR,
            move |e| {
                sink.lock().push(e.data.clone());
                Ok(())
            },
            ListenerOptions::new(),
        );

        bus.emit("job", Value::Null);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        let errors = errors.lock();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["event"], "job");
        assert_eq!(errors[0]["error"], "listener broke");
        assert_eq!(bus.metrics().error_count, 1);
    }

    #[test]
    fn test_error_event_failures_are_not_reemitted() {
        let bus = EventBus::new();
        let count = counter();
        bus.on(ERROR, |_| Err(EngineError::handler("again")), ListenerOptions::new());
        bus.on(LISTENER_ERROR, counting(&count), ListenerOptions::new());

        bus.emit(ERROR, json!("first"));

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(bus.metrics().error_count, 1);
    }

    #[test]
    fn test_slow_fan_out_reports_performance_event() {
        let bus = EventBus::new();
        let slow = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&slow);
        bus.on(
            PERFORMANCE_SLOW,
            move |e| {
                sink.lock().push(e.data["event"].clone());
                Ok(())
            },
            ListenerOptions::new(),
        );
        bus.on(
            "render",
            |_| {
                std::thread::sleep(Duration::from_millis(20));
                Ok(())
            },
            ListenerOptions::new(),
        );

        bus.emit("render", Value::Null);

        assert_eq!(*slow.lock(), vec![json!("render")]);
    }

    // === Flow control ===

    #[tokio::test(start_paused = true)]
    async fn test_throttle_drops_calls_within_window() {
        let bus = EventBus::new();
        let count = counter();
        bus.on(
            "scroll",
            counting(&count),
            ListenerOptions::new().throttle(Duration::from_millis(100)),
        );

        bus.emit("scroll", Value::Null);
        bus.emit("scroll", Value::Null);
        bus.emit("scroll", Value::Null);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(150)).await;
        bus.emit("scroll", Value::Null);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_delivers_last_payload() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.on(
            "search:input",
            move |e| {
                sink.lock().push(e.data.clone());
                Ok(())
            },
            ListenerOptions::new().debounce(Duration::from_millis(50)),
        );

        bus.emit("search:input", json!("b"));
        bus.emit("search:input", json!("br"));
        bus.emit("search:input", json!("brca"));
        assert!(seen.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;

        assert_eq!(*seen.lock(), vec![json!("brca")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_subscription_expires() {
        let bus = EventBus::new();
        let count = counter();
        bus.timeout("reply", counting(&count), 100);
        assert_eq!(bus.listener_count("reply"), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        tokio::task::yield_now().await;

        assert_eq!(bus.listener_count("reply"), 0);
        bus.emit("reply", Value::Null);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    // === Async listeners ===

    #[tokio::test]
    async fn test_emit_async_awaits_listeners_and_routes_failures() {
        let bus = EventBus::new();
        let count = counter();
        let c = Arc::clone(&count);
        bus.on_async(
            "fetch",
            move |_| {
                let c = Arc::clone(&c);
                async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            ListenerOptions::new(),
        );
        bus.on_async(
            "fetch",
            |_| async { Err(EngineError::handler("remote failed")) },
            ListenerOptions::new(),
        );

        bus.emit_async("fetch", Value::Null).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.metrics().error_count, 1);
        assert_eq!(bus.history_for(LISTENER_ERROR).len(), 1);
    }

    #[tokio::test]
    async fn test_emit_with_timeout_bounds_async_listeners() {
        let bus = EventBus::new();
        bus.on_async(
            "slow",
            |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            ListenerOptions::new(),
        );

        let err = bus.emit_with_timeout("slow", Value::Null, 20).await.unwrap_err();
        assert!(err.is_timeout());

        let ok = bus.emit_with_timeout("quiet", Value::Null, 20).await;
        assert!(ok.is_ok());
    }
}
