//! Coordinator/subordinate work splitting
//!
//! A coordinator hands each subordinate a subtask produced by a
//! [`Decomposer`], then folds the subordinate results into a [`Synthesis`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::agent::{merge_context, Agent, AgentHandle, AgentResult, Task};

/// Upper bound on merged recommendations and next steps
pub const MAX_SYNTHESIS_ITEMS: usize = 5;

/// Splits a task into subtasks for the subordinates of a coordinator
pub trait Decomposer: Send + Sync {
    fn decompose(&self, task: &Task, coordinator: &Agent, subordinates: &[AgentHandle]) -> Vec<Task>;
}

/// One subtask per subordinate, phrased from that subordinate's role
#[derive(Debug, Clone, Copy, Default)]
pub struct RolePerspectiveDecomposer;

impl Decomposer for RolePerspectiveDecomposer {
    fn decompose(&self, task: &Task, coordinator: &Agent, subordinates: &[AgentHandle]) -> Vec<Task> {
        subordinates
            .iter()
            .map(|sub| {
                let description = if sub.goal().is_empty() {
                    format!("{} (as {})", task.description, sub.role())
                } else {
                    format!("{} (as {}: {})", task.description, sub.role(), sub.goal())
                };
                let context = merge_context(
                    &task.context,
                    &json!({
                        "coordinator": coordinator.role(),
                        "parentTask": task.description,
                    }),
                );
                Task::new(description)
                    .for_agent(sub.role())
                    .with_context(context)
            })
            .collect()
    }
}

/// What one subordinate contributed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub agent: String,
    pub success: bool,
    pub summary: String,
}

/// Coordinator-level merge of subordinate results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Synthesis {
    pub coordinator: String,
    pub task: String,
    pub insights: Vec<Insight>,
    pub recommendations: Vec<String>,
    pub next_steps: Vec<String>,
    pub completed: usize,
    pub failed: usize,
}

impl Synthesis {
    pub fn from_results(coordinator: &str, task: &str, results: &[AgentResult]) -> Self {
        let insights = results
            .iter()
            .map(|r| Insight {
                agent: r.agent.clone(),
                success: r.success,
                summary: summarize(r),
            })
            .collect();

        let completed = results.iter().filter(|r| r.success).count();

        Self {
            coordinator: coordinator.to_string(),
            task: task.to_string(),
            insights,
            recommendations: merge_lists(results, "recommendations"),
            next_steps: merge_lists(results, "nextSteps"),
            completed,
            failed: results.len() - completed,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn summarize(result: &AgentResult) -> String {
    if let Some(error) = &result.error {
        return error.clone();
    }
    match &result.result {
        Some(Value::String(s)) => s.clone(),
        Some(value) => value
            .get("summary")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        None => String::new(),
    }
}

/// Union of a string-array field across successful results, first seen wins
fn merge_lists(results: &[AgentResult], field: &str) -> Vec<String> {
    let mut merged: Vec<String> = Vec::new();
    let items = results
        .iter()
        .filter(|r| r.success)
        .filter_map(|r| r.result.as_ref()?.get(field)?.as_array())
        .flatten()
        .filter_map(Value::as_str);

    for item in items {
        if merged.len() == MAX_SYNTHESIS_ITEMS {
            break;
        }
        if !merged.iter().any(|m| m == item) {
            merged.push(item.to_string());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;

    fn result(agent: &str, success: bool, value: Value) -> AgentResult {
        AgentResult {
            success,
            result: success.then(|| value.clone()),
            error: (!success).then(|| "boom".to_string()),
            agent: agent.to_string(),
            execution_time_ms: 1.0,
            execution_id: "x".to_string(),
        }
    }

    // === Decomposition ===

    #[test]
    fn test_one_subtask_per_subordinate() {
        let lead = Agent::new(AgentConfig::new("lead", "coordinate"));
        let subs = vec![
            AgentHandle::new(Agent::new(AgentConfig::new("searcher", "find hits"))),
            AgentHandle::new(Agent::new(AgentConfig::new("analyst", ""))),
        ];
        let task = Task::new("search BRCA1").with_context(json!({"genome": "hg38"}));

        let subtasks = RolePerspectiveDecomposer.decompose(&task, &lead, &subs);

        assert_eq!(subtasks.len(), 2);
        assert_eq!(subtasks[0].agent.as_deref(), Some("searcher"));
        assert_eq!(subtasks[0].description, "search BRCA1 (as searcher: find hits)");
        assert_eq!(subtasks[1].description, "search BRCA1 (as analyst)");
        assert_eq!(subtasks[1].context["genome"], "hg38");
        assert_eq!(subtasks[1].context["coordinator"], "lead");
    }

    // === Synthesis ===

    #[test]
    fn test_synthesis_dedups_and_caps() {
        let results = vec![
            result(
                "a",
                true,
                json!({"summary": "found 3", "recommendations": ["r1", "r2", "r3"], "nextSteps": ["n1"]}),
            ),
            result(
                "b",
                true,
                json!({"summary": "found 4", "recommendations": ["r2", "r4", "r5", "r6"], "nextSteps": ["n1", "n2"]}),
            ),
            result("c", false, Value::Null),
        ];

        let synthesis = Synthesis::from_results("lead", "task", &results);

        assert_eq!(synthesis.recommendations, vec!["r1", "r2", "r3", "r4", "r5"]);
        assert_eq!(synthesis.next_steps, vec!["n1", "n2"]);
        assert_eq!(synthesis.completed, 2);
        assert_eq!(synthesis.failed, 1);
        assert_eq!(synthesis.insights[0].summary, "found 3");
        assert_eq!(synthesis.insights[2].summary, "boom");
    }

    #[test]
    fn test_synthesis_serializes_camel_case() {
        let synthesis = Synthesis::from_results("lead", "t", &[]);
        let value = synthesis.to_value();
        assert!(value.get("nextSteps").is_some());
        assert_eq!(value["completed"], 0);
    }
}
