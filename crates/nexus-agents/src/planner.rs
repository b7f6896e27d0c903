//! # Research Planner
//!
//! Turns a persisted decomposition tree into an execution plan: expected
//! time per subtask, parents scheduled before children with siblings in
//! parallel, and an agent type per node.
//!
//! Expected time follows the rule
//! `base = 1 + 2/(depth+1) + 0.5·children + 0.2·key_questions` (hours).
//! Agent selection: a leaf with data-source URLs goes to browser-style
//! search, a leaf without goes to query search, a non-leaf is a
//! summarization node over its children.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use nexus_shared::messaging::MessageEnvelope;
use nexus_shared::types::Subtask;
use nexus_shared::{NexusError, NexusResult};

use crate::context::AgentContext;
use crate::registry::Agent;
use crate::topics;

#[derive(Debug)]
pub struct PlannerAgent {
    ctx: Arc<AgentContext>,
}

impl PlannerAgent {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }
}

/// Expected effort in hours for one subtask.
pub fn expected_time_hours(depth: u32, children: usize, key_questions: usize) -> f64 {
    1.0 + 2.0 / (depth as f64 + 1.0) + 0.5 * children as f64 + 0.2 * key_questions as f64
}

/// Agent type for one subtask.
pub fn select_agent_type(subtask: &Subtask) -> &'static str {
    if subtask.is_leaf() {
        if subtask.data_sources.is_empty() {
            "query_search"
        } else {
            "browser_search"
        }
    } else {
        "summarization"
    }
}

#[async_trait]
impl Agent for PlannerAgent {
    fn agent_id(&self) -> &str {
        "research_planner"
    }

    fn agent_type(&self) -> &'static str {
        "planner"
    }

    fn request_topic(&self) -> &'static str {
        topics::PLAN
    }

    async fn handle(&self, request: &MessageEnvelope) -> NexusResult<Value> {
        let task_id = request
            .payload
            .get("task_id")
            .and_then(Value::as_str)
            .ok_or_else(|| NexusError::stage_failed("planning", "request missing task_id"))?;

        let mut subtasks = self.ctx.store.subtasks_for_task(task_id).await?;
        if subtasks.is_empty() {
            return Err(NexusError::stage_failed(
                "planning",
                format!("no decomposition tree for task {task_id}"),
            ));
        }

        // Depth-major order gives parents-before-children; siblings share a
        // wave index and run in parallel
        subtasks.sort_by(|a, b| a.depth.cmp(&b.depth).then(a.subtask_id.cmp(&b.subtask_id)));

        let mut plan_tasks = Vec::with_capacity(subtasks.len());
        for subtask in &mut subtasks {
            let agent_type = select_agent_type(subtask);
            let expected = expected_time_hours(
                subtask.depth,
                subtask.children.len(),
                subtask.key_questions.len(),
            );
            subtask.assigned_agent = Some(agent_type.to_string());
            self.ctx.store.upsert_subtask(subtask).await?;

            plan_tasks.push(json!({
                "subtask_id": subtask.subtask_id,
                "topic": subtask.description,
                "wave": subtask.depth,
                "agent_type": agent_type,
                "expected_time_hours": expected,
                "key_questions": subtask.key_questions,
                "data_sources": subtask.data_sources,
            }));
        }

        // Leaf questions drive the searching stage
        let questions: Vec<String> = subtasks
            .iter()
            .filter(|s| s.is_leaf())
            .flat_map(|s| {
                if s.key_questions.is_empty() {
                    vec![s.description.clone()]
                } else {
                    s.key_questions.clone()
                }
            })
            .collect();

        Ok(json!({
            "plan": { "task_id": task_id, "tasks": plan_tasks },
            "questions": questions,
        }))
    }
}
