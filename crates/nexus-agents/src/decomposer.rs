//! # Topic Decomposer
//!
//! Breaks a research query into a hierarchical tree of sub-topics. The
//! model is asked for strict JSON; a bracketed-substring recovery pass
//! handles fenced or prose-wrapped output, and anything past that is a
//! `decomposition_failed` parse error.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use nexus_shared::llm::parse_json_or_extract;
use nexus_shared::messaging::MessageEnvelope;
use nexus_shared::types::Subtask;
use nexus_shared::{NexusError, NexusResult};

use crate::context::AgentContext;
use crate::registry::Agent;
use crate::topics;

pub const DEFAULT_MAX_DEPTH: u32 = 3;
pub const DEFAULT_MAX_BREADTH: usize = 5;

#[derive(Debug)]
pub struct DecomposerAgent {
    ctx: Arc<AgentContext>,
}

impl DecomposerAgent {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }

    fn prompt(query: &str, max_depth: u32, max_breadth: usize) -> String {
        format!(
            r#"You are a research topic decomposer. Break the following research query into a hierarchical tree of sub-topics.

Research query: {query}

Constraints:
- At most {max_depth} levels deep and {max_breadth} subtopics per node.
- Every node carries concrete key questions a web search could answer.
- List candidate data-source URLs only when you are confident they exist.

Return ONLY a JSON object with this exact structure, no other text:
{{
  "title": "short topic title",
  "description": "what this topic covers",
  "key_questions": ["question 1", "question 2"],
  "data_sources": ["https://example.org"],
  "subtopics": [ {{ "title": "...", "description": "...", "key_questions": [...], "data_sources": [...], "subtopics": [...] }} ]
}}"#
        )
    }

    /// Persist the decomposition as a subtask tree rooted at one node.
    /// Returns (root id, leaf question count).
    async fn persist_tree(
        &self,
        task_id: &str,
        query: &str,
        decomposition: &Value,
        max_depth: u32,
        max_breadth: usize,
    ) -> NexusResult<(String, usize)> {
        let title = decomposition
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or(query);
        let mut root = Subtask::root(task_id, format!("Research on {title}"));
        root.key_questions = string_list(decomposition.get("key_questions"));
        root.data_sources = string_list(decomposition.get("data_sources"));

        let subtopics = decomposition
            .get("subtopics")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        // Fewer than one child: the root sub-question is the task
        // description itself
        if subtopics.is_empty() {
            root.description = query.to_string();
            if root.key_questions.is_empty() {
                root.key_questions = vec![query.to_string()];
            }
            let leaves = root.key_questions.len();
            self.ctx.store.upsert_subtask(&root).await?;
            return Ok((root.subtask_id.clone(), leaves));
        }

        let mut leaves = 0usize;
        let mut nodes = Vec::new();
        collect_children(
            &mut root,
            &subtopics,
            1,
            max_depth,
            max_breadth,
            &mut nodes,
            &mut leaves,
        );

        self.ctx.store.upsert_subtask(&root).await?;
        for node in &nodes {
            self.ctx.store.upsert_subtask(node).await?;
        }
        Ok((root.subtask_id.clone(), leaves))
    }

}

fn collect_children(
    parent: &mut Subtask,
    subtopics: &[Value],
    depth: u32,
    max_depth: u32,
    max_breadth: usize,
    out: &mut Vec<Subtask>,
    leaves: &mut usize,
) {
    for topic in subtopics.iter().take(max_breadth) {
        let description = topic
            .get("description")
            .or_else(|| topic.get("title"))
            .and_then(Value::as_str)
            .unwrap_or("(unspecified subtopic)");
        let mut child = Subtask::child_of(parent, description);
        child.key_questions = string_list(topic.get("key_questions"));
        child.data_sources = string_list(topic.get("data_sources"));
        parent.children.push(child.subtask_id.clone());

        let nested = topic
            .get("subtopics")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if nested.is_empty() || depth >= max_depth {
            *leaves += child.key_questions.len().max(1);
        } else {
            collect_children(&mut child, &nested, depth + 1, max_depth, max_breadth, out, leaves);
        }
        out.push(child);
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl Agent for DecomposerAgent {
    fn agent_id(&self) -> &str {
        "topic_decomposer"
    }

    fn agent_type(&self) -> &'static str {
        "decomposer"
    }

    fn request_topic(&self) -> &'static str {
        topics::DECOMPOSE
    }

    async fn handle(&self, request: &MessageEnvelope) -> NexusResult<Value> {
        let task_id = request
            .payload
            .get("task_id")
            .and_then(Value::as_str)
            .ok_or_else(|| NexusError::stage_failed("planning", "request missing task_id"))?;
        let query = request
            .payload
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| NexusError::stage_failed("planning", "request missing query"))?;
        let max_depth = request
            .payload
            .get("max_depth")
            .and_then(Value::as_u64)
            .map(|d| d as u32)
            .unwrap_or(DEFAULT_MAX_DEPTH);
        let max_breadth = request
            .payload
            .get("max_breadth")
            .and_then(Value::as_u64)
            .map(|b| b as usize)
            .unwrap_or(DEFAULT_MAX_BREADTH);

        let response = self
            .ctx
            .llm
            .generate(&Self::prompt(query, max_depth, max_breadth), false)
            .await?;

        let decomposition = parse_json_or_extract(&response)
            .map_err(|e| NexusError::Parse(format!("decomposition_failed: {e}")))?;

        let (root_subtask_id, leaf_questions) = self
            .persist_tree(task_id, query, &decomposition, max_depth, max_breadth)
            .await?;
        debug!(task_id, leaf_questions, "decomposition persisted");

        Ok(json!({
            "decomposition": decomposition,
            "root_subtask_id": root_subtask_id,
            "leaf_questions": leaf_questions,
        }))
    }
}
