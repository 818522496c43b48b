//! Build & launch runs with human checkpoints.

mod harness;

use chrono::Utc;
use genie_ids::RunId;
use genie_pipeline::exceptions::LAUNCH_FAILED;
use genie_pipeline::project::{
    ActionStatus, EnrollmentRule, EnrollmentTarget, ImplementationData, ProjectPatch,
};
use genie_pipeline::{
    DefaultActions, ExceptionStatus, LaunchOutcome, LaunchRun, LaunchRunner, LaunchStatus,
    LaunchStep, MemoryStore, Pipeline, PipelineConfig, Project, ProjectStore, StageId,
    StageStatus,
};
use harness::*;
use std::sync::Arc;

fn fresh_project() -> Project {
    let mut project = Project::new(
        "Acme onboarding",
        "Everything a new Acme hire needs in the first week",
    );
    project.source_ids.insert("s1".to_string());
    project.source_ids.insert("s2".to_string());
    project
}

fn everyone() -> ProjectPatch {
    ProjectPatch::new().implementation(ImplementationData {
        enrollment_rules: vec![EnrollmentRule {
            target: EnrollmentTarget::Everyone,
            required: true,
        }],
        ..Default::default()
    })
}

#[tokio::test]
async fn test_cancel_at_assessments_keeps_draft() {
    let h = build(fresh_project(), StageId::Ingest, full_org(), PipelineConfig::default());
    let runner = LaunchRunner::new(h.pipeline.clone());
    let task = tokio::spawn(async move { runner.run().await });

    loop {
        let step = until_checkpoint(&h.pipeline).await;
        let proceed = step != LaunchStep::Assessments;
        assert!(h.pipeline.resolve_checkpoint(proceed));
        if !proceed {
            break;
        }
    }
    let outcome = task.await.unwrap().unwrap();
    assert_eq!(
        outcome,
        LaunchOutcome::Canceled {
            step: LaunchStep::Assessments
        }
    );

    let project = h.pipeline.project().await;
    let draft = project.draft.as_ref().expect("draft survives cancellation");
    assert_eq!(draft.total_lessons(), 3);
    assert_eq!(draft.generated_lessons(), 3);
    assert!(project.implementation.is_none());
    assert_eq!(h.platform.count("create_course"), 0);
    assert_eq!(h.platform.count("ingest"), 1);

    assert_eq!(
        h.pipeline.last_error().await.as_deref(),
        Some("Pipeline canceled at assessments")
    );
    let run = h.pipeline.launch_run().await.unwrap();
    assert_eq!(run.status, LaunchStatus::Canceled);
    assert_eq!(
        run.completed_steps,
        vec![LaunchStep::Ingest, LaunchStep::Outline, LaunchStep::Lessons]
    );
    assert!(h.pipeline.pending_checkpoint().is_none());
}

#[tokio::test]
async fn test_double_resolve_is_noop() {
    let h = build(fresh_project(), StageId::Ingest, full_org(), PipelineConfig::default());
    let waiter = h.pipeline.clone();
    let task = tokio::spawn(async move { waiter.wait_for_checkpoint(LaunchStep::Outline).await });

    assert_eq!(until_checkpoint(&h.pipeline).await, LaunchStep::Outline);
    assert!(h.pipeline.resolve_checkpoint(true));
    assert!(!h.pipeline.resolve_checkpoint(false));
    assert_eq!(task.await.unwrap(), Ok(true));
}

#[tokio::test]
async fn test_full_launch_without_checkpoints() {
    let h = build(fresh_project(), StageId::Ingest, full_org(), quiet_config());
    h.pipeline.update_project(everyone()).await;
    h.platform.question_counts.lock().unwrap().extend([2, 0]);

    let outcome = LaunchRunner::new(h.pipeline.clone()).run().await.unwrap();
    assert_eq!(outcome, LaunchOutcome::Completed);

    let project = h.pipeline.project().await;
    let implementation = project.implementation.as_ref().unwrap();
    assert_eq!(implementation.course_id.as_deref(), Some("course-1"));
    assert_eq!(
        implementation.assessment_ids,
        vec!["assessment-1".to_string(), "assessment-2".to_string()]
    );
    assert_eq!(implementation.enrolled_count, 3);
    assert_eq!(implementation.notified_count, 3);
    assert!(implementation.deployed_at.is_some());

    let warnings = &project.draft.as_ref().unwrap().warnings;
    assert!(warnings.iter().any(|w| w.contains("only has 2 question")));
    assert!(warnings.iter().any(|w| w.contains("no questions")));

    assert_eq!(project.status(StageId::Ingest), StageStatus::Completed);
    assert_eq!(project.status(StageId::Implement), StageStatus::Completed);
    assert_eq!(h.platform.count("enroll course-1 3 true"), 1);

    let run = h.pipeline.launch_run().await.unwrap();
    assert_eq!(run.status, LaunchStatus::Completed);
    assert_eq!(run.attempt, 1);
    assert_eq!(run.completed_steps.len(), 6);
    assert!(h.pipeline.last_error().await.is_none());
}

#[tokio::test]
async fn test_missing_rules_fail_enrollments_and_retry_counts_attempts() {
    let h = build(fresh_project(), StageId::Ingest, full_org(), quiet_config());

    let outcome = LaunchRunner::new(h.pipeline.clone()).run().await.unwrap();
    match &outcome {
        LaunchOutcome::Failed { step, error } => {
            assert_eq!(*step, LaunchStep::Enrollments);
            assert!(error.contains("enrollment rule"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    // the course was created before the failure and is kept
    let course_id = h
        .pipeline
        .project()
        .await
        .implementation
        .and_then(|i| i.course_id);
    assert_eq!(course_id.as_deref(), Some("course-1"));

    // patches replace the whole record, so keep the course id
    let mut implementation = h.pipeline.project().await.implementation.unwrap();
    implementation.enrollment_rules.push(EnrollmentRule {
        target: EnrollmentTarget::Department {
            id: "support".to_string(),
        },
        required: false,
    });
    h.pipeline
        .update_project(ProjectPatch::new().implementation(implementation))
        .await;
    let outcome = LaunchRunner::new(h.pipeline.clone()).run().await.unwrap();
    assert!(outcome.is_completed());
    assert_eq!(h.platform.count("enroll course-1 2 false"), 1);
    let run = h.pipeline.launch_run().await.unwrap();
    assert_eq!(run.attempt, 2);
    // the existing course is reused
    assert_eq!(h.platform.count("create_course"), 1);
}

#[tokio::test]
async fn test_lesson_failure_stops_run() {
    let h = build(fresh_project(), StageId::Ingest, full_org(), quiet_config());
    h.generation.fail_lesson("Core ideas");

    let outcome = LaunchRunner::new(h.pipeline.clone()).run().await.unwrap();
    assert!(matches!(
        outcome,
        LaunchOutcome::Failed {
            step: LaunchStep::Lessons,
            ..
        }
    ));
    // every lesson was still attempted
    assert_eq!(h.generation.lesson_calls(), 3);
    assert_eq!(h.platform.count("create_course"), 0);
    assert!(h
        .pipeline
        .last_error()
        .await
        .unwrap()
        .starts_with("lessons failed"));
}

#[tokio::test]
async fn test_run_record_survives_reload() {
    let store = Arc::new(MemoryStore::new());
    let generation = Arc::new(ScriptedGeneration::default());
    let platform = Arc::new(RecordingPlatform::default());
    let pipeline = Pipeline::builder(fresh_project(), generation.clone(), platform.clone())
        .org(full_org())
        .config(quiet_config())
        .actions(Arc::new(DefaultActions))
        .store(store.clone())
        .build();

    // no enrollment rules yet, so the run stops at enrollments
    let outcome = LaunchRunner::new(pipeline.clone()).run().await.unwrap();
    assert!(!outcome.is_completed());
    let first = pipeline.launch_run().await.unwrap();
    pipeline.shutdown().await.unwrap();

    let snapshot = store.load(ORG_ID).unwrap().unwrap();
    let reopened = Pipeline::restore(&snapshot, generation, platform)
        .unwrap()
        .org(full_org())
        .config(quiet_config())
        .actions(Arc::new(DefaultActions))
        .build();

    let run = reopened.launch_run().await.expect("run record is persisted");
    assert_eq!(run.run_id, first.run_id);
    assert_eq!(run.attempt, 1);
    assert_eq!(run.status, LaunchStatus::Failed);
    assert_eq!(run.completed_steps.len(), 4);
    assert!(reopened
        .last_error()
        .await
        .unwrap()
        .starts_with("enrollments failed"));
    assert_eq!(reopened.status().await.launch, Some(run));

    LaunchRunner::new(reopened.clone()).run().await.unwrap();
    let second = reopened.launch_run().await.unwrap();
    assert_eq!(second.attempt, 2);
    assert_ne!(second.run_id, first.run_id);

    // every step that ran left a metric under its run
    let first_metrics = reopened.pipeline_metrics(Some(&first.run_id)).await;
    let phases: Vec<&str> = first_metrics.iter().map(|m| m.phase.as_str()).collect();
    assert_eq!(
        phases,
        vec!["enrollments", "assessments", "lessons", "outline", "ingest"]
    );
    assert_eq!(first_metrics[0].status, ActionStatus::Error);
    assert_eq!(first_metrics[0].retry_count, 0);

    let second_metrics = reopened.pipeline_metrics(Some(&second.run_id)).await;
    assert_eq!(second_metrics.len(), 5);
    assert_eq!(second_metrics[0].phase, "enrollments");
    assert_eq!(second_metrics[0].retry_count, 1);
    assert_eq!(second_metrics[1].retry_count, 0);
    assert_eq!(reopened.pipeline_metrics(None).await.len(), 10);

    // the same failure twice stays one open exception
    let open = reopened.list_exceptions(Some(ExceptionStatus::Open)).await;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].reason_code, LAUNCH_FAILED);
    assert_eq!(open[0].stage, StageId::Implement);
}

#[tokio::test]
async fn test_run_left_running_is_closed_on_reopen() {
    let mut project = fresh_project();
    project.launch = Some(LaunchRun {
        run_id: RunId::new(),
        attempt: 3,
        status: LaunchStatus::Running,
        current_step: Some(LaunchStep::Lessons),
        completed_steps: vec![LaunchStep::Ingest, LaunchStep::Outline],
        progress: None,
        started_at: Utc::now(),
        finished_at: None,
        last_error: None,
    });
    let h = build(project, StageId::Ingest, full_org(), quiet_config());

    let run = h.pipeline.launch_run().await.unwrap();
    assert_eq!(run.status, LaunchStatus::Failed);
    assert!(run.finished_at.is_some());
    assert_eq!(
        h.pipeline.last_error().await.as_deref(),
        Some("lessons interrupted")
    );

    // a new run is allowed and keeps counting
    LaunchRunner::new(h.pipeline.clone()).run().await.unwrap();
    assert_eq!(h.pipeline.launch_run().await.unwrap().attempt, 4);
}
