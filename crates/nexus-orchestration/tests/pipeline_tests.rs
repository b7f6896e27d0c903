//! Hermetic pipeline tests: in-memory store and bus, scripted LLM and
//! search adapters, real agents spawned on the bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use nexus_agents::search::SearchResult;
use nexus_agents::{AgentContext, AgentRegistry, AgentSpawner};
use nexus_orchestration::pipeline::{PipelineConfig, ResearchPipeline};
use nexus_shared::config::MonitoringConfig;
use nexus_shared::monitoring::EventBus;
use nexus_shared::pubsub::{PubSubProvider, PubSubStream};
use nexus_shared::types::{OperationStatus, ResearchTask, TaskStatus};

struct Harness {
    ctx: Arc<AgentContext>,
    pipeline: ResearchPipeline,
    events: PubSubStream,
    _spawner: AgentSpawner,
}

async fn harness(providers: &[&str]) -> Harness {
    let ctx = AgentContext::for_tests(providers);
    let pubsub = PubSubProvider::new_in_memory();
    let event_bus = EventBus::new(pubsub.clone(), MonitoringConfig::default());
    let events = pubsub
        .subscribe(&["nexus:events".to_string()])
        .await
        .unwrap();

    let registry =
        AgentRegistry::with_defaults(&providers.iter().map(|p| p.to_string()).collect::<Vec<_>>());
    let spawner = AgentSpawner::new(ctx.clone());
    spawner.spawn_all(&registry).unwrap();

    let pipeline = ResearchPipeline::new(
        ctx.store.clone(),
        ctx.bus.clone(),
        event_bus,
        1,
        PipelineConfig {
            search_providers: providers.iter().map(|p| p.to_string()).collect(),
            reply_timeout: Duration::from_secs(5),
            stage_deadline: Duration::from_secs(30),
            ..Default::default()
        },
    );

    Harness {
        ctx,
        pipeline,
        events,
        _spawner: spawner,
    }
}

fn script_happy_llm(ctx: &AgentContext) {
    // Decomposer
    ctx.llm.as_scripted().push_response(
        json!({
            "title": "AI in Healthcare",
            "description": "Clinical AI",
            "key_questions": [],
            "data_sources": [],
            "subtopics": [
                {"title": "Diagnostics", "description": "AI diagnostics",
                 "key_questions": ["How accurate is AI imaging?"], "data_sources": [], "subtopics": []}
            ]
        })
        .to_string(),
    );
    // Summarizer
    ctx.llm.as_scripted().push_response(
        json!({
            "executive_summary": "AI diagnostics are maturing.",
            "key_findings": ["imaging accuracy is high"],
            "sources": ["https://x.test/a"],
        })
        .to_string(),
    );
    // Reasoner
    ctx.llm.as_scripted().push_response(
        json!({
            "synthesis": "Accuracy gains outpace deployment.",
            "contradictions": [],
            "credibility_assessment": "high",
            "gaps": [],
            "insights": ["deployment is the bottleneck"],
            "recommendations": ["study deployment barriers"],
        })
        .to_string(),
    );
}

fn stub_search(ctx: &AgentContext, provider: &str) {
    ctx.search_adapters[provider].as_scripted().set_default(vec![
        SearchResult::new(provider, "https://x.test/a", "imaging accuracy snippet")
            .with_title("Imaging study")
            .with_extracted_text("full text of the imaging study"),
    ]);
}

async fn make_task(ctx: &AgentContext) -> ResearchTask {
    let task = ResearchTask::new("AI in Healthcare", "Impact of AI");
    ctx.store.upsert_task(&task).await.unwrap();
    task
}

async fn drain_event_types(events: &mut PubSubStream) -> Vec<String> {
    let mut types = Vec::new();
    while let Ok(Some((_, payload))) =
        tokio::time::timeout(Duration::from_millis(100), events.recv()).await
    {
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        types.push(format!(
            "{}:{}",
            value["event_type"].as_str().unwrap(),
            value["phase"].as_str().unwrap_or("-")
        ));
    }
    types
}

#[tokio::test]
async fn test_happy_path_runs_every_stage_in_order() {
    let mut h = harness(&["exa"]).await;
    script_happy_llm(&h.ctx);
    stub_search(&h.ctx, "exa");
    let task = make_task(&h.ctx).await;

    let outcome = h.pipeline.run(&task).await.unwrap();
    assert_eq!(
        outcome.summary["executive_summary"],
        json!("AI diagnostics are maturing.")
    );
    assert_eq!(
        outcome.reasoning["synthesis"],
        json!("Accuracy gains outpace deployment.")
    );
    assert!(outcome.results["sources"].as_array().unwrap().len() >= 1);

    // Operation rows: one completed row per stage
    for stage in [
        "planning",
        "searching",
        "aggregating",
        "summarizing",
        "reasoning",
        "generating_artifacts",
    ] {
        let operation = h
            .ctx
            .store
            .find_operation(&task.task_id, stage)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("missing operation for {stage}"));
        assert_eq!(operation.status, OperationStatus::Completed, "{stage}");
    }

    // Artifacts persisted
    let artifacts = h.ctx.store.artifacts_for_task(&task.task_id).await.unwrap();
    assert_eq!(artifacts.len(), 2);

    // phase_started/phase_completed pairs arrive in stage order
    let event_types = drain_event_types(&mut h.events).await;
    let expected: Vec<String> = [
        "planning",
        "searching",
        "aggregating",
        "summarizing",
        "reasoning",
        "generating_artifacts",
    ]
    .iter()
    .flat_map(|stage| {
        vec![
            format!("phase_started:{stage}"),
            format!("phase_completed:{stage}"),
        ]
    })
    .collect();
    assert_eq!(event_types, expected);
}

#[tokio::test]
async fn test_provider_failure_falls_over_to_next_provider() {
    let h = harness(&["exa", "linkup"]).await;
    script_happy_llm(&h.ctx);
    stub_search(&h.ctx, "linkup");
    // Every exa query fails; linkup carries the load
    h.ctx.search_adapters["exa"]
        .as_scripted()
        .fail_query("How accurate is AI imaging?");
    let task = make_task(&h.ctx).await;

    let outcome = h.pipeline.run(&task).await.unwrap();
    assert_eq!(outcome.results["counts"]["failed_questions"], json!(0));

    // The provider failure is durably recorded as evidence
    let searching = h
        .ctx
        .store
        .find_operation(&task.task_id, "searching")
        .await
        .unwrap()
        .unwrap();
    let evidence = h
        .ctx
        .store
        .evidence_for_operation(&searching.operation_id)
        .await
        .unwrap();
    assert!(evidence
        .iter()
        .any(|e| e.payload.get("error").is_some() && e.payload["provider"] == json!("exa")));
}

#[tokio::test]
async fn test_all_providers_exhausted_records_failed_question() {
    let h = harness(&["exa"]).await;
    script_happy_llm(&h.ctx);
    h.ctx.search_adapters["exa"]
        .as_scripted()
        .fail_query("How accurate is AI imaging?");
    let task = make_task(&h.ctx).await;

    // Searching never fails wholesale; the pipeline completes
    let outcome = h.pipeline.run(&task).await.unwrap();
    assert_eq!(outcome.results["counts"]["failed_questions"], json!(1));
}

#[tokio::test]
async fn test_decomposer_failure_retries_once_then_fails() {
    let h = harness(&["exa"]).await;
    // Both attempts return unparseable output
    h.ctx.llm.as_scripted().push_response("garbage");
    h.ctx.llm.as_scripted().push_response("more garbage");
    let task = make_task(&h.ctx).await;

    let result = h.pipeline.run(&task).await;
    assert!(result.is_err());
    let error = result.unwrap_err().to_string();
    assert!(error.contains("decomposition_failed"), "{error}");

    // The planning operation row is closed failed
    let operation = h
        .ctx
        .store
        .find_operation(&task.task_id, "planning")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(operation.status, OperationStatus::Failed);
    assert!(operation.error.is_some());
}

#[tokio::test]
async fn test_summarizer_failure_degrades_to_placeholder() {
    let h = harness(&["exa"]).await;
    stub_search(&h.ctx, "exa");
    // Decomposer OK, then summarizer garbage twice, then reasoner OK
    h.ctx.llm.as_scripted().push_response(
        json!({"title": "T", "description": "d", "key_questions": ["q1"],
               "data_sources": [], "subtopics": []})
        .to_string(),
    );
    h.ctx.llm.as_scripted().push_response("not json");
    h.ctx.llm.as_scripted().push_response("still not json");
    h.ctx.llm.as_scripted().push_response(
        json!({"synthesis": "s", "contradictions": [], "credibility_assessment": "c",
               "gaps": [], "insights": [], "recommendations": []})
        .to_string(),
    );
    let task = make_task(&h.ctx).await;

    let outcome = h.pipeline.run(&task).await.unwrap();
    assert_eq!(outcome.summary["placeholder"], json!(true));
    assert_eq!(outcome.reasoning["synthesis"], json!("s"));

    let operation = h
        .ctx
        .store
        .find_operation(&task.task_id, "summarizing")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(operation.status, OperationStatus::Completed);
    assert_eq!(operation.counts.get("placeholder"), Some(&1));
}

#[tokio::test]
async fn test_completed_stage_is_skipped_on_replay() {
    let h = harness(&["exa"]).await;
    stub_search(&h.ctx, "exa");
    let task = make_task(&h.ctx).await;

    // Simulate a prior run that completed planning: persisted tree +
    // completed operation row
    let mut root = nexus_shared::types::Subtask::root(&task.task_id, "Research on AI");
    root.key_questions = vec!["How accurate is AI imaging?".to_string()];
    h.ctx.store.upsert_subtask(&root).await.unwrap();
    let operation = h
        .ctx
        .store
        .open_operation(&task.task_id, "planning")
        .await
        .unwrap();
    h.ctx
        .store
        .close_operation(
            &operation.operation_id,
            OperationStatus::Completed,
            None,
            &HashMap::new(),
        )
        .await
        .unwrap();

    // Only summarizer + reasoner responses are scripted: a decomposer call
    // would fail the run, proving planning was skipped
    h.ctx.llm.as_scripted().push_response(
        json!({"executive_summary": "e", "key_findings": [], "sources": []}).to_string(),
    );
    h.ctx.llm.as_scripted().push_response(
        json!({"synthesis": "s", "contradictions": [], "credibility_assessment": "c",
               "gaps": [], "insights": [], "recommendations": []})
        .to_string(),
    );

    let outcome = h.pipeline.run(&task).await.unwrap();
    assert_eq!(outcome.summary["executive_summary"], json!("e"));

    // Planning still has exactly the one (replayed) completed row
    let found = h
        .ctx
        .store
        .find_operation(&task.task_id, "planning")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.operation_id, operation.operation_id);
}

#[tokio::test]
async fn test_task_status_advances_through_stage_enum() {
    let h = harness(&["exa"]).await;
    script_happy_llm(&h.ctx);
    stub_search(&h.ctx, "exa");
    let task = make_task(&h.ctx).await;

    h.pipeline.run(&task).await.unwrap();

    // After the pipeline the worker owns the terminal transition; here the
    // task sits at the last stage status
    let stored = h.ctx.store.get_task(&task.task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::GeneratingArtifacts);
}
