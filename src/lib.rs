//! # Taskforge
//!
//! In-process command execution and agent orchestration engine.
//!
//! Direct operations run as [`Command`]s (validated, retried, timeout-bounded
//! and hooked). Open-ended requests go to [`Crew`]s of [`Agent`]s that split
//! the work under a sequential, parallel or hierarchical discipline. Every
//! layer reports progress on a shared [`EventBus`].
//!
//! ## Architecture
//!
//! ```text
//!                        ┌──────────────────────────────┐
//!        Request ───────►│         ORCHESTRATOR         │◄──── OrchestratorChannel
//!                        │   plan: command | crew       │
//!                        └──────┬────────────────┬──────┘
//!                               │                │
//!                               ▼                ▼
//!                  ┌─────────────────┐   ┌─────────────────────────────┐
//!                  │ CommandRegistry │   │            CREW             │
//!                  │  name / alias   │   │ sequential │ parallel │ hier│
//!                  └────────┬────────┘   └──────┬──────────┬──────────┘
//!                           ▼                   ▼          ▼
//!                  ┌─────────────────┐      ┌───────┐  ┌───────┐
//!                  │     Command     │      │ Agent │  │ Agent │──► Tools
//!                  │ retry × timeout │      └───┬───┘  └───┬───┘
//!                  └────────┬────────┘          │          │
//!                           └──────────┬────────┴──────────┘
//!                                      ▼
//!                              ┌──────────────┐
//!                              │   EventBus   │
//!                              └──────────────┘
//! ```
//!
//! ## Key Concepts
//!
//! - **Command**: A named handler wrapped with validation, retries, timeout and hooks
//! - **EventBus**: Pub/sub with wildcard listeners, middleware and flow control
//! - **Agent**: A role-scoped worker that runs tasks through its tools
//! - **Crew**: Agents plus tasks under one scheduling discipline
//! - **Orchestrator**: Routes requests to a command or a crew

pub mod agent;
pub mod channel;
pub mod command;
pub mod config;
pub mod context;
pub mod crew;
pub mod error;
pub mod events;
pub mod hierarchy;
pub mod orchestrator;
pub mod registry;

pub use agent::{
    Agent, AgentHandle, AgentResult, CollaborationResult, Generator, Task, TaskCategory, Tool,
    ToolDescriptor,
};
pub use channel::{ChannelPair, OrchestratorChannel};
pub use command::{
    Command, CommandResult, ExecutionOptions, FieldRule, HookStage, Schema, ValueKind,
};
pub use config::{
    AgentConfig, CommandOptions, CrewConfig, EngineConfig, EventBusConfig, ProcessKind,
    RetryPolicy,
};
pub use context::{AppContext, CommandContext, NullContext};
pub use crew::{Crew, CrewOutput, CrewPhase, TaskOutcome};
pub use error::{EngineError, Result};
pub use events::{EventBus, EventData, EventMetadata, ListenerOptions, Subscription, SubscriptionId};
pub use hierarchy::{Decomposer, RolePerspectiveDecomposer, Synthesis};
pub use orchestrator::{Orchestrator, Plan, Request, RequestOutcome};
pub use registry::CommandRegistry;
