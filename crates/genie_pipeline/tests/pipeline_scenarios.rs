//! Pipeline scenarios driven through the public `Pipeline` handle.

mod harness;

use genie_pipeline::actions::names;
use genie_pipeline::exceptions::{ACTION_FAILED, QUALITY_WARNING};
use genie_pipeline::project::{ActionStatus, ChatRole, EvaluationData, ProjectPatch};
use genie_pipeline::services::APOLOGY;
use genie_pipeline::{
    AutopilotStatus, ExceptionResolution, ExceptionStatus, MemoryStore, OrgSnapshot,
    PipelineConfig, PipelineError, ProjectStore, StageActions, StageId, StageStatus,
};
use harness::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::Notify;

fn run_analysis_suggestions(project: &genie_pipeline::Project) -> usize {
    project
        .copilot
        .as_ref()
        .map(|c| {
            c.suggestions
                .iter()
                .filter(|s| s.action.as_deref() == Some(names::RUN_ANALYSIS))
                .count()
        })
        .unwrap_or(0)
}

// =============================================================================
// READINESS AND SUGGESTIONS
// =============================================================================

#[tokio::test]
async fn test_analysis_suggested_once_after_people_load() {
    let h = build(
        project_at(StageId::Analyze),
        StageId::Analyze,
        OrgSnapshot::new(ORG_ID),
        quiet_config(),
    );
    let pipeline = &h.pipeline;

    pipeline.load_org(|org| org.members = Some(members())).await;
    pipeline.load_org(|org| org.departments = Some(departments())).await;
    assert!(!pipeline.readiness().await.analyze);
    assert_eq!(run_analysis_suggestions(&pipeline.project().await), 0);

    pipeline.load_org(|org| org.teams = Some(teams())).await;
    assert!(pipeline.readiness().await.analyze);
    assert_eq!(run_analysis_suggestions(&pipeline.project().await), 1);

    // Reloading the same data must not repeat the suggestion
    for _ in 0..3 {
        pipeline.load_org(|org| org.teams = Some(teams())).await;
    }
    assert_eq!(run_analysis_suggestions(&pipeline.project().await), 1);
}

#[tokio::test]
async fn test_manual_suggestion_dedup() {
    let h = build(project_at(StageId::Ingest), StageId::Ingest, full_org(), quiet_config());
    let mut added = 0;
    for i in 0..10 {
        let message = format!("Generate the lessons now? ({})", i);
        if h
            .pipeline
            .add_suggestion(StageId::Develop, &message, Some(names::GENERATE_LESSONS))
            .await
            .is_some()
        {
            added += 1;
        }
    }
    assert_eq!(added, 1);

    let stats = h.pipeline.suggestion_stats().await;
    let develop = h
        .pipeline
        .project()
        .await
        .copilot
        .unwrap()
        .suggestions
        .into_iter()
        .filter(|s| s.stage == StageId::Develop)
        .count();
    assert_eq!(develop, 1);
    assert_eq!(stats.followed, 0);
}

#[tokio::test]
async fn test_invoking_action_marks_suggestion_followed() {
    let h = build(project_at(StageId::Analyze), StageId::Analyze, full_org(), quiet_config());
    let pipeline = &h.pipeline;
    pipeline.refresh().await;
    assert_eq!(run_analysis_suggestions(&pipeline.project().await), 1);

    pipeline
        .invoke_stage_action(StageId::Analyze, names::RUN_ANALYSIS, None)
        .await
        .unwrap();

    let stats = pipeline.suggestion_stats().await;
    assert!(stats.followed >= 1);
    let project = pipeline.project().await;
    assert!(project.analysis.is_some());
    assert_eq!(project.status(StageId::Analyze), StageStatus::Completed);
}

// =============================================================================
// STAGE COMPLETION
// =============================================================================

#[tokio::test]
async fn test_design_completion_tracks_tactics() {
    let h = build(project_at(StageId::Design), StageId::Design, full_org(), quiet_config());
    let pipeline = &h.pipeline;
    assert!(!pipeline.is_stage_complete(StageId::Design).await);
    pipeline.update_project(ProjectPatch::new().design(design())).await;
    assert!(pipeline.is_stage_complete(StageId::Design).await);

    let mut broken = design();
    broken.modules[1].multimedia.clear();
    pipeline.update_project(ProjectPatch::new().design(broken)).await;
    assert!(!pipeline.is_stage_complete(StageId::Design).await);
    assert!(matches!(
        pipeline.mark_stage_complete(StageId::Design).await,
        Err(PipelineError::Prerequisite(_))
    ));
    assert_eq!(
        pipeline.project().await.status(StageId::Design),
        StageStatus::InProgress
    );

    pipeline.update_project(ProjectPatch::new().design(design())).await;
    assert!(pipeline.is_stage_complete(StageId::Design).await);
    assert!(pipeline.mark_stage_complete(StageId::Design).await.unwrap());
    // idempotent
    assert!(!pipeline.mark_stage_complete(StageId::Design).await.unwrap());
}

#[tokio::test]
async fn test_select_refuses_inaccessible_stage() {
    let h = build(project_at(StageId::Analyze), StageId::Analyze, full_org(), quiet_config());
    assert!(!h.pipeline.select_stage(StageId::Develop).await);
    assert_eq!(h.pipeline.current_stage().await, StageId::Analyze);
    assert!(h.pipeline.select_stage(StageId::Ingest).await);
    assert_eq!(h.pipeline.current_stage().await, StageId::Ingest);
}

#[tokio::test]
async fn test_prerequisite_failure_changes_nothing() {
    let mut org = full_org();
    org.teams = None;
    let h = build(project_at(StageId::Analyze), StageId::Analyze, org, quiet_config());
    let before = h.pipeline.project().await;

    let result = h
        .pipeline
        .invoke_stage_action(StageId::Analyze, names::RUN_ANALYSIS, None)
        .await;
    assert!(matches!(result, Err(PipelineError::Prerequisite(_))));
    assert_eq!(h.pipeline.project().await, before);
    assert_eq!(h.generation.chat_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unregistered_action_is_noop() {
    let h = build(project_at(StageId::Analyze), StageId::Analyze, full_org(), quiet_config());
    let before = h.pipeline.project().await;
    h.pipeline
        .invoke_stage_action(StageId::Analyze, "does_not_exist", None)
        .await
        .unwrap();
    // handlers of inactive stages are not registered either
    h.pipeline
        .invoke_stage_action(StageId::Develop, names::GENERATE_LESSONS, None)
        .await
        .unwrap();
    assert_eq!(h.pipeline.project().await, before);
}

// =============================================================================
// APPROVAL
// =============================================================================

#[tokio::test]
async fn test_approval_requires_opened_stage() {
    let h = build(project_at(StageId::Analyze), StageId::Analyze, full_org(), quiet_config());
    assert!(matches!(
        h.pipeline.approve_stage(StageId::Design, "pat").await,
        Err(PipelineError::Prerequisite(_))
    ));
    assert!(h.pipeline.approve_stage(StageId::Analyze, "pat").await.unwrap());
    assert!(!h.pipeline.approve_stage(StageId::Analyze, "pat").await.unwrap());
    assert!(h.pipeline.revoke_approval(StageId::Analyze).await);

    let project = h.pipeline.project().await;
    assert!(!project.is_approved(StageId::Analyze));
    assert_eq!(project.approval_history.len(), 1);
}

// =============================================================================
// AUTOPILOT
// =============================================================================

#[tokio::test]
async fn test_autopilot_blocks_on_unapproved_develop() {
    let config = PipelineConfig {
        autopilot: true,
        checkpoints: false,
        ..Default::default()
    };
    let h = build(project_at(StageId::Develop), StageId::Develop, full_org(), config);
    let pipeline = &h.pipeline;

    pipeline.refresh().await;
    assert_eq!(pipeline.autopilot_status().await, AutopilotStatus::Blocked);
    assert_eq!(h.generation.lesson_calls(), 0);
    assert!(pipeline.project().await.draft.is_none());

    // a data change alone does not unblock
    pipeline
        .update_project(ProjectPatch::new().description("A longer description of the course"))
        .await;
    assert_eq!(pipeline.autopilot_status().await, AutopilotStatus::Blocked);
    assert_eq!(h.generation.lesson_calls(), 0);

    // approval lets it run, then it advances and blocks on the next stage
    pipeline.approve_stage(StageId::Develop, "pat").await.unwrap();
    let project = pipeline.project().await;
    let draft = project.draft.as_ref().unwrap();
    assert_eq!(draft.generated_lessons(), 3);
    assert_eq!(project.status(StageId::Develop), StageStatus::Completed);
    assert_eq!(pipeline.current_stage().await, StageId::Implement);
    assert_eq!(pipeline.autopilot_status().await, AutopilotStatus::Blocked);

    let records = &project.copilot.as_ref().unwrap().actions_taken;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].action, names::GENERATE_LESSONS);
    assert_eq!(records[0].status, ActionStatus::Success);
}

#[tokio::test]
async fn test_autopilot_failure_is_not_retried() {
    let config = PipelineConfig {
        autopilot: true,
        checkpoints: false,
        ..Default::default()
    };
    let h = build(project_at(StageId::Develop), StageId::Develop, full_org(), config);
    let pipeline = &h.pipeline;
    h.generation.fail_lesson("Leave");

    pipeline.approve_stage(StageId::Develop, "pat").await.unwrap();
    assert_eq!(h.generation.lesson_calls(), 3);
    assert_eq!(pipeline.autopilot_status().await, AutopilotStatus::Idle);
    assert!(pipeline.last_error().await.unwrap().contains("1 of 3"));

    let project = pipeline.project().await;
    let draft = project.draft.as_ref().unwrap();
    assert_eq!(draft.generated_lessons(), 2);
    let failed = &draft.modules[0].lessons[1];
    assert_eq!(failed.title, "Leave");
    assert!(failed.error.as_deref().unwrap().contains("model timeout"));
    assert!(draft.warnings.iter().any(|w| w.contains("\"Leave\"")));
    assert_eq!(
        project.copilot.as_ref().unwrap().actions_taken[0].status,
        ActionStatus::Error
    );

    // more edits do not re-trigger the failed stage
    pipeline.set_stage_prompt(StageId::Develop, "Keep it short").await;
    assert_eq!(h.generation.lesson_calls(), 3);

    // a human retry only generates the missing lesson
    h.generation.heal_lessons();
    pipeline.retry_stage(StageId::Develop).await.unwrap();
    assert_eq!(h.generation.lesson_calls(), 4);
    assert!(pipeline.is_stage_complete(StageId::Develop).await);
    assert!(pipeline.last_error().await.is_none());
}

#[tokio::test]
async fn test_pause_wins_over_inflight_action() {
    let h = build(
        project_at(StageId::Develop),
        StageId::Develop,
        full_org(),
        quiet_config(),
    );
    let pipeline = h.pipeline.clone();
    let gate = Arc::new(Notify::new());

    let release = gate.clone();
    pipeline
        .register_stage_actions(
            StageId::Develop,
            StageActions::new().with_fn(names::GENERATE_LESSONS, move |ctx| {
                let release = release.clone();
                async move {
                    ctx.pipeline.report_progress(1, 2).await;
                    release.notified().await;
                    Ok(())
                }
            }),
        )
        .await;
    pipeline.approve_stage(StageId::Develop, "pat").await.unwrap();

    let runner = pipeline.clone();
    let task = tokio::spawn(async move { runner.enable_autopilot().await });
    for _ in 0..1_000 {
        if pipeline.autopilot_status().await == AutopilotStatus::Running {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(pipeline.autopilot_status().await, AutopilotStatus::Running);
    assert_eq!(pipeline.autopilot_progress().await.unwrap().percent(), 50);

    pipeline.pause_autopilot().await;
    assert_eq!(pipeline.autopilot_status().await, AutopilotStatus::Idle);

    gate.notify_one();
    task.await.unwrap();

    let status = pipeline.status().await;
    assert_eq!(status.autopilot, AutopilotStatus::Idle);
    assert!(!status.autopilot_enabled);
    assert!(status.autopilot_progress.is_none());
}

#[tokio::test]
async fn test_revoke_before_autopilot_call_starts_withdraws_it() {
    let mut project = project_at(StageId::Analyze);
    project.mark_stage_in_progress(StageId::Analyze);
    project.approve_stage(StageId::Analyze, "pat").unwrap();
    project.evaluation = Some(EvaluationData {
        metrics: vec!["completion_rate".to_string()],
        ..Default::default()
    });
    let config = PipelineConfig {
        autopilot: true,
        checkpoints: false,
        ..Default::default()
    };
    let h = build(project, StageId::Analyze, full_org(), config);
    h.generation.hold_chat.store(true, Ordering::SeqCst);

    // completing another stage decides to run analysis, then posts the
    // completion summary before starting it
    let pipeline = h.pipeline.clone();
    let task = tokio::spawn(async move { pipeline.mark_stage_complete(StageId::Evaluate).await });
    h.generation.chat_entered.notified().await;

    assert!(h.pipeline.revoke_approval(StageId::Analyze).await);
    h.generation.hold_chat.store(false, Ordering::SeqCst);
    h.generation.chat_release.notify_one();
    assert!(task.await.unwrap().unwrap());

    let project = h.pipeline.project().await;
    assert!(project.analysis.is_none());
    let taken = project.copilot.as_ref().map_or(0, |c| c.actions_taken.len());
    assert_eq!(taken, 0);
    assert!(h.pipeline.pipeline_metrics(None).await.is_empty());
    assert_eq!(h.pipeline.autopilot_status().await, AutopilotStatus::Blocked);
}

// =============================================================================
// EXCEPTIONS AND METRICS
// =============================================================================

#[tokio::test]
async fn test_failed_action_opens_exceptions_and_retry_is_counted() {
    let h = build(
        project_at(StageId::Develop),
        StageId::Develop,
        full_org(),
        quiet_config(),
    );
    let pipeline = &h.pipeline;
    h.generation.fail_lesson("Leave");

    let result = pipeline
        .invoke_stage_action(StageId::Develop, names::GENERATE_LESSONS, None)
        .await;
    assert!(matches!(result, Err(PipelineError::Service(_))));

    let open = pipeline.list_exceptions(Some(ExceptionStatus::Open)).await;
    let codes: Vec<&str> = open.iter().map(|e| e.reason_code.as_str()).collect();
    assert_eq!(codes, vec![ACTION_FAILED, QUALITY_WARNING]);
    assert!(open[0].reason_message.starts_with("generate_lessons failed"));
    assert!(open[1].reason_message.contains("\"Leave\""));
    assert_eq!(pipeline.status().await.open_exceptions, 2);

    h.generation.heal_lessons();
    pipeline.retry_stage(StageId::Develop).await.unwrap();

    let metrics = pipeline.pipeline_metrics(None).await;
    assert_eq!(metrics.len(), 2);
    assert_eq!(metrics[0].status, ActionStatus::Success);
    assert_eq!(metrics[0].retry_count, 1);
    assert_eq!(metrics[1].status, ActionStatus::Error);
    assert!(metrics.iter().all(|m| m.run_id.is_none()));

    // a human closes the queue entries
    assert!(pipeline
        .resolve_exception(&open[0].id, ExceptionResolution::Resolve, "pat", Some("quota raised"))
        .await
        .unwrap());
    assert!(pipeline
        .resolve_exception(&open[1].id, ExceptionResolution::Override, "pat", None)
        .await
        .unwrap());
    assert!(!pipeline
        .resolve_exception(&open[1].id, ExceptionResolution::Reject, "sam", None)
        .await
        .unwrap());
    assert!(pipeline
        .list_exceptions(Some(ExceptionStatus::Open))
        .await
        .is_empty());

    let resolved = pipeline.list_exceptions(Some(ExceptionStatus::Resolved)).await;
    assert_eq!(resolved[0].resolved_by.as_deref(), Some("pat"));
    assert_eq!(resolved[0].resolution_notes.as_deref(), Some("quota raised"));
    assert_eq!(pipeline.status().await.open_exceptions, 0);
}

#[tokio::test]
async fn test_outline_with_empty_module_is_rejected() {
    let h = build(
        project_at(StageId::Design),
        StageId::Design,
        full_org(),
        quiet_config(),
    );
    h.generation.broken_outline.store(true, Ordering::SeqCst);

    let result = h
        .pipeline
        .invoke_stage_action(StageId::Design, names::GENERATE_DESIGN, None)
        .await;
    match result {
        Err(PipelineError::Validation(message)) => assert!(message.contains("Wrap-up")),
        other => panic!("unexpected result {:?}", other),
    }
    let project = h.pipeline.project().await;
    assert!(project.design.is_none());
    assert_eq!(project.status(StageId::Design), StageStatus::InProgress);
    let open = h.pipeline.list_exceptions(None).await;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].stage, StageId::Design);
}

#[tokio::test]
async fn test_status_lists_accessible_stages() {
    let h = build(project_at(StageId::Design), StageId::Design, full_org(), quiet_config());
    let status = h.pipeline.status().await;
    assert_eq!(
        status.accessible_stages,
        vec![StageId::Ingest, StageId::Analyze, StageId::Design]
    );
    let flagged: Vec<StageId> = status
        .stages
        .iter()
        .filter(|s| s.accessible)
        .map(|s| s.stage)
        .collect();
    assert_eq!(flagged, status.accessible_stages);
}

// =============================================================================
// CHAT AND PERSISTENCE
// =============================================================================

#[tokio::test]
async fn test_chat_degrades_to_apology() {
    // no org sources, so no suggestion interleaves with the chat
    let h = build(
        project_at(StageId::Ingest),
        StageId::Ingest,
        OrgSnapshot::new(ORG_ID),
        quiet_config(),
    );
    let reply = h.pipeline.send_chat("What next?").await;
    assert!(reply.starts_with("Noted:"));

    h.generation.fail_chat.store(true, Ordering::SeqCst);
    assert_eq!(h.pipeline.send_chat("Hello?").await, APOLOGY);

    let history = h.pipeline.project().await.copilot.unwrap().history;
    let roles: Vec<ChatRole> = history.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![
            ChatRole::User,
            ChatRole::Assistant,
            ChatRole::User,
            ChatRole::Assistant
        ]
    );
}

#[tokio::test]
async fn test_completion_posts_summary() {
    let h = build(project_at(StageId::Analyze), StageId::Analyze, full_org(), quiet_config());
    h.pipeline
        .update_project(ProjectPatch::new().analysis(analysis()))
        .await;
    h.pipeline.mark_stage_complete(StageId::Analyze).await.unwrap();

    let history = h.pipeline.project().await.copilot.unwrap().history;
    assert!(history
        .iter()
        .any(|m| m.role == ChatRole::Assistant && m.content.starts_with("Analyze is complete.")));
}

#[tokio::test]
async fn test_flush_persists_snapshot() {
    let store = Arc::new(MemoryStore::new());
    let generation = Arc::new(ScriptedGeneration::default());
    let platform = Arc::new(RecordingPlatform::default());
    let pipeline = genie_pipeline::Pipeline::builder(
        project_at(StageId::Analyze),
        generation.clone(),
        platform.clone(),
    )
    .org(full_org())
    .current_stage(StageId::Analyze)
    .store(store.clone())
    .build();

    pipeline
        .update_project(ProjectPatch::new().name("Renamed"))
        .await;
    pipeline.flush().await.unwrap();
    assert!(store.write_count() >= 1);

    let snapshot = store.load(ORG_ID).unwrap().unwrap();
    assert_eq!(snapshot.current_stage, StageId::Analyze);

    let restored = genie_pipeline::Pipeline::restore(&snapshot, generation, platform)
        .unwrap()
        .build();
    let project = restored.project().await;
    assert_eq!(project.name, "Renamed");
    assert_eq!(project.status(StageId::Ingest), StageStatus::Completed);
    assert_eq!(restored.current_stage().await, StageId::Analyze);

    pipeline.shutdown().await.unwrap();
}
