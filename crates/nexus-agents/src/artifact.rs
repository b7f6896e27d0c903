//! # Artifact Generator
//!
//! Writes one markdown report and one JSON bundle per completed task into
//! `{storage_path}/{slugify(title)}_{YYYYMMDD}.{md,json}` and records an
//! artifact row for each file.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::info;

use nexus_shared::messaging::MessageEnvelope;
use nexus_shared::types::{Artifact, ArtifactKind};
use nexus_shared::{NexusError, NexusResult};

use crate::context::AgentContext;
use crate::registry::Agent;
use crate::topics;

#[derive(Debug)]
pub struct ArtifactAgent {
    ctx: Arc<AgentContext>,
}

impl ArtifactAgent {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }

    fn render_markdown(title: &str, query: &str, summary: &Value, reasoning: &Value) -> String {
        let mut out = String::new();
        out.push_str(&format!("# {title}\n\n"));
        out.push_str(&format!("**Research query:** {query}\n\n"));

        out.push_str("## Executive summary\n\n");
        out.push_str(
            summary
                .get("executive_summary")
                .and_then(Value::as_str)
                .unwrap_or("(no summary available)"),
        );
        out.push_str("\n\n## Key findings\n\n");
        for finding in string_items(summary.get("key_findings")) {
            out.push_str(&format!("- {finding}\n"));
        }

        out.push_str("\n## Analysis\n\n");
        out.push_str(
            reasoning
                .get("synthesis")
                .and_then(Value::as_str)
                .unwrap_or("(no analysis available)"),
        );
        let recommendations = string_items(reasoning.get("recommendations"));
        if !recommendations.is_empty() {
            out.push_str("\n\n## Recommendations\n\n");
            for recommendation in recommendations {
                out.push_str(&format!("- {recommendation}\n"));
            }
        }

        out.push_str("\n## Sources\n\n");
        for source in string_items(summary.get("sources")) {
            out.push_str(&format!("- {source}\n"));
        }
        out
    }
}

fn string_items(value: Option<&Value>) -> Vec<&str> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

/// Lowercase, alphanumerics kept, everything else collapsed to single
/// underscores.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_was_separator = true;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_was_separator = false;
        } else if !last_was_separator {
            slug.push('_');
            last_was_separator = true;
        }
    }
    let trimmed = slug.trim_end_matches('_').to_string();
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed
    }
}

/// `{slug}_{YYYYMMDD}` — the base name both artifact files share.
pub fn artifact_basename(title: &str, date: chrono::NaiveDate) -> String {
    format!("{}_{}", slugify(title), date.format("%Y%m%d"))
}

#[async_trait]
impl Agent for ArtifactAgent {
    fn agent_id(&self) -> &str {
        "artifact_generator"
    }

    fn agent_type(&self) -> &'static str {
        "artifact"
    }

    fn request_topic(&self) -> &'static str {
        topics::ARTIFACT
    }

    async fn handle(&self, request: &MessageEnvelope) -> NexusResult<Value> {
        let task_id = request
            .payload
            .get("task_id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                NexusError::stage_failed("generating_artifacts", "request missing task_id")
            })?;
        let title = request
            .payload
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("Untitled");
        let query = request
            .payload
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or("");
        let summary = request.payload.get("summary").cloned().unwrap_or(Value::Null);
        let reasoning = request
            .payload
            .get("reasoning")
            .cloned()
            .unwrap_or(Value::Null);

        tokio::fs::create_dir_all(&self.ctx.storage_path).await?;
        let basename = artifact_basename(title, Utc::now().date_naive());

        // Markdown report
        let markdown_path: PathBuf = self.ctx.storage_path.join(format!("{basename}.md"));
        let markdown = Self::render_markdown(title, query, &summary, &reasoning);
        tokio::fs::write(&markdown_path, &markdown).await?;
        let markdown_artifact = Artifact::new(task_id, Some(title), ArtifactKind::Markdown)
            .with_file_path(markdown_path.to_string_lossy());
        self.ctx.store.create_artifact(&markdown_artifact).await?;

        // JSON bundle
        let json_path: PathBuf = self.ctx.storage_path.join(format!("{basename}.json"));
        let bundle = json!({
            "task_id": task_id,
            "title": title,
            "query": query,
            "summary": summary,
            "reasoning": reasoning,
            "generated_at": Utc::now(),
        });
        tokio::fs::write(&json_path, serde_json::to_string_pretty(&bundle)?).await?;
        let json_artifact = Artifact::new(task_id, Some(title), ArtifactKind::Json)
            .with_file_path(json_path.to_string_lossy());
        self.ctx.store.create_artifact(&json_artifact).await?;

        info!(task_id, basename = %basename, "artifacts generated");
        Ok(json!({
            "artifacts": [markdown_artifact.artifact_id, json_artifact.artifact_id],
        }))
    }
}
