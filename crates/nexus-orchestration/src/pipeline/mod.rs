//! # Research Pipeline
//!
//! The staged state machine that drives one task from `planning` through
//! `generating_artifacts`. The pipeline performs no agent work itself:
//! every stage sends a correlated request over the bus to its agent and
//! waits for the reply. Each stage transition opens an operation row and
//! emits `phase_started`; leaving a stage closes the row and emits
//! `phase_completed` with counts.
//!
//! Replay safety: under at-least-once delivery a task can be handed to a
//! worker twice. A stage whose (task, stage) operation row is already
//! `completed` is skipped, with its outputs reloaded from the store.
//!
//! Failure policy per stage:
//!
//! | stage                | policy                                        |
//! |----------------------|-----------------------------------------------|
//! | planning             | retry once, then fail                         |
//! | searching            | per-question failures recorded as evidence;   |
//! |                      | the stage never fails wholesale               |
//! | aggregating          | fail on internal error                        |
//! | summarizing          | retry once, then placeholder and continue     |
//! | reasoning            | retry once, then placeholder and continue     |
//! | generating_artifacts | retry once, then fail                         |

mod stage;

pub use stage::Stage;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{info, warn};

use nexus_agents::{reasoner::ReasonerAgent, summarizer::SummarizerAgent, topics};
use nexus_shared::messaging::{reply_topic, AgentBus, MessageEnvelope};
use nexus_shared::monitoring::{EventBus, MonitoringEvent, MonitoringEventType};
use nexus_shared::types::{
    EvidenceKind, OperationEvidence, OperationStatus, ResearchTask, TaskOperation,
};
use nexus_shared::{NexusError, NexusResult};
use nexus_store::KnowledgeStore;

/// Sender name the pipeline uses on the bus.
const PIPELINE_SENDER: &str = "pipeline";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Enabled search provider names, tried round-robin per question
    pub search_providers: Vec<String>,
    /// Deadline for each correlated request
    pub reply_timeout: Duration,
    /// Hard cap per stage
    pub stage_deadline: Duration,
    pub max_results_per_question: usize,
    pub max_depth: u32,
    pub max_breadth: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            search_providers: Vec::new(),
            reply_timeout: Duration::from_secs(60),
            stage_deadline: Duration::from_secs(300),
            max_results_per_question: 5,
            max_depth: 3,
            max_breadth: 5,
        }
    }
}

/// Durable outputs handed back to the worker on success.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub results: Value,
    pub summary: Value,
    pub reasoning: Value,
}

/// Intermediate stage outputs threaded between stages.
#[derive(Debug, Default)]
struct StageState {
    questions: Vec<String>,
    responses: Vec<Value>,
    bundle: Value,
    summary: Value,
    reasoning: Value,
}

#[derive(Debug, Clone)]
pub struct ResearchPipeline {
    store: KnowledgeStore,
    bus: AgentBus,
    event_bus: EventBus,
    worker_id: u32,
    config: PipelineConfig,
}

impl ResearchPipeline {
    pub fn new(
        store: KnowledgeStore,
        bus: AgentBus,
        event_bus: EventBus,
        worker_id: u32,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            bus,
            event_bus,
            worker_id,
            config,
        }
    }

    /// Drive one task through every stage. Stage transitions for a single
    /// task are totally ordered by the owning worker.
    pub async fn run(&self, task: &ResearchTask) -> NexusResult<PipelineOutcome> {
        let mut state = StageState::default();

        for stage in Stage::ALL {
            self.store
                .update_task_status(&task.task_id, stage.task_status())
                .await?;

            if self
                .store
                .stage_already_completed(&task.task_id, stage.name())
                .await?
            {
                info!(task_id = %task.task_id, stage = %stage, "stage already completed, skipping");
                self.reload_stage(stage, task, &mut state).await?;
                continue;
            }

            let started = Instant::now();
            self.event_bus
                .publish(
                    &MonitoringEvent::phase(
                        MonitoringEventType::PhaseStarted,
                        stage.name(),
                        task.task_id.clone(),
                    )
                    .with_worker(self.worker_id),
                )
                .await;

            let operation = self.store.open_operation(&task.task_id, stage.name()).await?;

            let result = match tokio::time::timeout(
                self.config.stage_deadline,
                self.execute_with_retry(stage, task, &operation, &mut state),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(NexusError::stage_failed(
                    stage.name(),
                    format!(
                        "stage exceeded {}s deadline",
                        self.config.stage_deadline.as_secs()
                    ),
                )),
            };

            match result {
                Ok(counts) => {
                    self.store
                        .close_operation(
                            &operation.operation_id,
                            OperationStatus::Completed,
                            None,
                            &counts,
                        )
                        .await?;
                    self.event_bus
                        .publish(
                            &MonitoringEvent::phase(
                                MonitoringEventType::PhaseCompleted,
                                stage.name(),
                                task.task_id.clone(),
                            )
                            .with_worker(self.worker_id)
                            .with_counts(counts)
                            .with_duration_ms(started.elapsed().as_millis() as u64),
                        )
                        .await;
                }
                Err(error) => {
                    // Best-effort close; the failure itself is what we surface
                    if let Err(close_error) = self
                        .store
                        .close_operation(
                            &operation.operation_id,
                            OperationStatus::Failed,
                            Some(&error.to_string()),
                            &HashMap::new(),
                        )
                        .await
                    {
                        warn!(error = %close_error, "failed to close failed operation row");
                    }
                    return Err(error);
                }
            }
        }

        Ok(PipelineOutcome {
            results: state.bundle,
            summary: state.summary,
            reasoning: state.reasoning,
        })
    }

    /// Apply the stage's retry policy around `run_stage`.
    async fn execute_with_retry(
        &self,
        stage: Stage,
        task: &ResearchTask,
        operation: &TaskOperation,
        state: &mut StageState,
    ) -> NexusResult<HashMap<String, i64>> {
        match self.run_stage(stage, task, operation, state).await {
            Ok(counts) => Ok(counts),
            Err(error) if stage.retries_once() && !matches!(error, NexusError::Cancelled(_)) => {
                warn!(task_id = %task.task_id, stage = %stage, error = %error, "stage failed, retrying once");
                match self.run_stage(stage, task, operation, state).await {
                    Ok(counts) => Ok(counts),
                    Err(retry_error) if stage.degrades_to_placeholder() => {
                        warn!(
                            task_id = %task.task_id,
                            stage = %stage,
                            error = %retry_error,
                            "retry failed, recording placeholder and continuing"
                        );
                        match stage {
                            Stage::Summarizing => {
                                state.summary = SummarizerAgent::placeholder(&task.description);
                            }
                            Stage::Reasoning => {
                                state.reasoning = ReasonerAgent::placeholder(&task.description);
                            }
                            _ => unreachable!("only summarizing/reasoning degrade"),
                        }
                        Ok(HashMap::from([("placeholder".to_string(), 1)]))
                    }
                    Err(retry_error) => Err(retry_error),
                }
            }
            Err(error) => Err(error),
        }
    }

    async fn run_stage(
        &self,
        stage: Stage,
        task: &ResearchTask,
        operation: &TaskOperation,
        state: &mut StageState,
    ) -> NexusResult<HashMap<String, i64>> {
        match stage {
            Stage::Planning => self.run_planning(task, operation, state).await,
            Stage::Searching => self.run_searching(task, operation, state).await,
            Stage::Aggregating => self.run_aggregating(task, operation, state).await,
            Stage::Summarizing => self.run_summarizing(task, operation, state).await,
            Stage::Reasoning => self.run_reasoning(task, operation, state).await,
            Stage::GeneratingArtifacts => self.run_artifacts(task, operation, state).await,
        }
    }

    // =========================================================================
    // Stage implementations
    // =========================================================================

    async fn run_planning(
        &self,
        task: &ResearchTask,
        operation: &TaskOperation,
        state: &mut StageState,
    ) -> NexusResult<HashMap<String, i64>> {
        let decompose_reply = self
            .request_reply(
                topics::DECOMPOSE,
                "topic_decomposer",
                json!({
                    "task_id": task.task_id,
                    "query": task.description,
                    "max_depth": self.config.max_depth,
                    "max_breadth": self.config.max_breadth,
                    "operation_id": operation.operation_id,
                }),
                &task.task_id,
            )
            .await?;

        // Success condition: a decomposition tree with a non-empty root
        let decomposition = &decompose_reply["decomposition"];
        let root_present = decomposition.is_object()
            && decompose_reply["root_subtask_id"].as_str().is_some();
        if !root_present {
            return Err(NexusError::stage_failed(
                "planning",
                "decomposer returned no usable tree",
            ));
        }

        let plan_reply = self
            .request_reply(
                topics::PLAN,
                "research_planner",
                json!({ "task_id": task.task_id, "query": task.description }),
                &task.task_id,
            )
            .await?;

        state.questions = plan_reply["questions"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if state.questions.is_empty() {
            state.questions = vec![task.description.clone()];
        }

        let subtask_count = self.store.subtasks_for_task(&task.task_id).await?.len();
        Ok(HashMap::from([
            ("subtasks".to_string(), subtask_count as i64),
            ("questions".to_string(), state.questions.len() as i64),
        ]))
    }

    /// Per-question provider rotation. A provider failure is recorded as
    /// evidence and the next provider is tried; a question with every
    /// provider exhausted is recorded as a failed response. The stage
    /// itself always succeeds.
    async fn run_searching(
        &self,
        task: &ResearchTask,
        operation: &TaskOperation,
        state: &mut StageState,
    ) -> NexusResult<HashMap<String, i64>> {
        let providers = &self.config.search_providers;
        let mut responses = Vec::with_capacity(state.questions.len());
        let mut failed_questions = 0i64;
        let mut total_results = 0i64;

        for (index, question) in state.questions.iter().enumerate() {
            let mut answered = false;
            let mut last_error: Option<NexusError> = None;

            for attempt in 0..providers.len() {
                let provider = &providers[(index + attempt) % providers.len()];
                let recipient = format!("{provider}_search");
                match self
                    .request_reply(
                        topics::SEARCH,
                        &recipient,
                        json!({
                            "query": question,
                            "operation_id": operation.operation_id,
                            "max_results": self.config.max_results_per_question,
                        }),
                        &task.task_id,
                    )
                    .await
                {
                    Ok(reply) => {
                        let results = reply["results"].clone();
                        total_results += results.as_array().map(|r| r.len()).unwrap_or(0) as i64;
                        responses.push(json!({
                            "question": question,
                            "provider": provider,
                            "results": results,
                        }));
                        answered = true;
                        break;
                    }
                    Err(error) => {
                        let evidence = OperationEvidence::new(
                            operation.operation_id.clone(),
                            EvidenceKind::SearchResult,
                            json!({
                                "question": question,
                                "provider": provider,
                                "error": error.to_string(),
                                "category": error.category(),
                            }),
                        );
                        if let Err(e) = self.store.append_evidence(&evidence).await {
                            warn!(error = %e, "failed to record provider failure evidence");
                        }
                        last_error = Some(error);
                    }
                }
            }

            if !answered {
                failed_questions += 1;
                let reason = last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no search providers configured".to_string());
                responses.push(json!({ "question": question, "error": reason }));
            }
        }

        state.responses = responses;
        Ok(HashMap::from([
            ("questions".to_string(), state.questions.len() as i64),
            ("failed_questions".to_string(), failed_questions),
            ("results".to_string(), total_results),
        ]))
    }

    async fn run_aggregating(
        &self,
        task: &ResearchTask,
        operation: &TaskOperation,
        state: &mut StageState,
    ) -> NexusResult<HashMap<String, i64>> {
        let reply = self
            .request_reply(
                topics::AGGREGATE,
                "data_aggregator",
                json!({
                    "task_id": task.task_id,
                    "operation_id": operation.operation_id,
                    "responses": state.responses,
                }),
                &task.task_id,
            )
            .await?;

        let mut counts = HashMap::new();
        if let Some(reported) = reply["counts"].as_object() {
            for (key, value) in reported {
                if let Some(n) = value.as_i64() {
                    counts.insert(key.clone(), n);
                }
            }
        }
        state.bundle = reply;
        Ok(counts)
    }

    async fn run_summarizing(
        &self,
        task: &ResearchTask,
        operation: &TaskOperation,
        state: &mut StageState,
    ) -> NexusResult<HashMap<String, i64>> {
        let reply = self
            .request_reply(
                topics::SUMMARIZE,
                "summarization",
                json!({
                    "task_id": task.task_id,
                    "operation_id": operation.operation_id,
                    "query": task.description,
                    "bundle": {
                        "sources": state.bundle["sources"],
                        "key_points": state.bundle["key_points"],
                    },
                }),
                &task.task_id,
            )
            .await?;

        state.summary = reply["summary"].clone();
        let key_findings = state.summary["key_findings"]
            .as_array()
            .map(|f| f.len())
            .unwrap_or(0) as i64;
        Ok(HashMap::from([("key_findings".to_string(), key_findings)]))
    }

    async fn run_reasoning(
        &self,
        task: &ResearchTask,
        operation: &TaskOperation,
        state: &mut StageState,
    ) -> NexusResult<HashMap<String, i64>> {
        let reply = self
            .request_reply(
                topics::REASON,
                "reasoning",
                json!({
                    "task_id": task.task_id,
                    "operation_id": operation.operation_id,
                    "query": task.description,
                    "summary": state.summary,
                }),
                &task.task_id,
            )
            .await?;

        state.reasoning = reply["reasoning"].clone();
        let insights = state.reasoning["insights"]
            .as_array()
            .map(|i| i.len())
            .unwrap_or(0) as i64;
        Ok(HashMap::from([("insights".to_string(), insights)]))
    }

    async fn run_artifacts(
        &self,
        task: &ResearchTask,
        operation: &TaskOperation,
        state: &mut StageState,
    ) -> NexusResult<HashMap<String, i64>> {
        let reply = self
            .request_reply(
                topics::ARTIFACT,
                "artifact_generator",
                json!({
                    "task_id": task.task_id,
                    "operation_id": operation.operation_id,
                    "title": task.title,
                    "query": task.description,
                    "summary": state.summary,
                    "reasoning": state.reasoning,
                }),
                &task.task_id,
            )
            .await?;

        let artifact_count = reply["artifacts"].as_array().map(|a| a.len()).unwrap_or(0);
        if artifact_count == 0 {
            return Err(NexusError::stage_failed(
                "generating_artifacts",
                "no artifacts were persisted",
            ));
        }
        Ok(HashMap::from([(
            "artifacts".to_string(),
            artifact_count as i64,
        )]))
    }

    // =========================================================================
    // Replay reload
    // =========================================================================

    /// Rebuild a skipped stage's outputs from the store so downstream
    /// stages can still run.
    async fn reload_stage(
        &self,
        stage: Stage,
        task: &ResearchTask,
        state: &mut StageState,
    ) -> NexusResult<()> {
        match stage {
            Stage::Planning => {
                let subtasks = self.store.subtasks_for_task(&task.task_id).await?;
                state.questions = subtasks
                    .iter()
                    .filter(|s| s.children.is_empty())
                    .flat_map(|s| {
                        if s.key_questions.is_empty() {
                            vec![s.description.clone()]
                        } else {
                            s.key_questions.clone()
                        }
                    })
                    .collect();
                if state.questions.is_empty() {
                    state.questions = vec![task.description.clone()];
                }
            }
            Stage::Searching => {
                let mut responses: Vec<Value> = Vec::new();
                if let Some(operation) = self
                    .store
                    .find_operation(&task.task_id, stage.name())
                    .await?
                {
                    let mut by_question: HashMap<String, Vec<Value>> = HashMap::new();
                    for evidence in self
                        .store
                        .evidence_for_operation(&operation.operation_id)
                        .await?
                    {
                        let question = evidence.payload["question"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string();
                        if let Some(result) = evidence.payload.get("result") {
                            by_question.entry(question).or_default().push(result.clone());
                        }
                    }
                    responses = by_question
                        .into_iter()
                        .map(|(question, results)| json!({"question": question, "results": results}))
                        .collect();
                }
                state.responses = responses;
            }
            Stage::Aggregating => {
                let mut key_points = Value::Array(Vec::new());
                if let Some(operation) = self
                    .store
                    .find_operation(&task.task_id, stage.name())
                    .await?
                {
                    for evidence in self
                        .store
                        .evidence_for_operation(&operation.operation_id)
                        .await?
                    {
                        if evidence.kind == EvidenceKind::ExtractedFact {
                            if let Some(points) = evidence.payload.get("key_points") {
                                key_points = points.clone();
                            }
                        }
                    }
                }
                state.bundle = json!({ "sources": [], "key_points": key_points, "counts": {} });
            }
            Stage::Summarizing => {
                let stored = self.store.get_task(&task.task_id).await?;
                state.summary = stored
                    .and_then(|t| t.summary)
                    .unwrap_or_else(|| SummarizerAgent::placeholder(&task.description));
            }
            Stage::Reasoning => {
                let stored = self.store.get_task(&task.task_id).await?;
                state.reasoning = stored
                    .and_then(|t| t.reasoning)
                    .unwrap_or_else(|| ReasonerAgent::placeholder(&task.description));
            }
            Stage::GeneratingArtifacts => {
                // Nothing downstream needs artifact outputs
            }
        }
        Ok(())
    }

    // =========================================================================
    // Bus plumbing
    // =========================================================================

    /// Publish a correlated request and wait for its reply; error replies
    /// are mapped back into typed errors.
    async fn request_reply(
        &self,
        topic: &str,
        recipient: &str,
        payload: Value,
        conversation_id: &str,
    ) -> NexusResult<Value> {
        let request = MessageEnvelope::request(PIPELINE_SENDER, topic, payload)
            .with_recipient(recipient)
            .with_conversation(conversation_id);

        // Register the correlation before publishing so a fast reply
        // cannot slip past the waiter
        let pending = self.bus.register_reply_waiter(
            &reply_topic(topic),
            Some(conversation_id),
            Some(&request.message_id),
        )?;
        self.bus.publish(request)?;
        let reply = pending.wait(self.config.reply_timeout).await?;

        if reply.is_error() {
            return Err(map_error_reply(&reply, topic));
        }
        Ok(reply.payload)
    }
}

/// Map an error reply envelope back to the error kind the agent surfaced.
fn map_error_reply(reply: &MessageEnvelope, topic: &str) -> NexusError {
    let message = reply.error_text().unwrap_or("unknown agent error").to_string();
    match reply.error_category() {
        Some("parse_error") => NexusError::Parse(message),
        Some("provider_error") => NexusError::Provider {
            provider: reply.sender.clone(),
            message,
        },
        Some("store_error") => NexusError::Store(message),
        Some("transient_network") => NexusError::TransientNetwork(message),
        Some("cancelled") => NexusError::Cancelled(message),
        _ => NexusError::StageFailed {
            stage: topic.to_string(),
            message,
        },
    }
}
