//! Shared fixtures: a scripted generation service, a recording platform,
//! and org/project builders.

#![allow(dead_code)]

use async_trait::async_trait;
use genie_pipeline::org::{Department, Member, SourceDocument, Team};
use genie_pipeline::project::{
    AnalysisData, DesignData, DesignModule, DraftData, LessonPlan, LessonType,
};
use genie_pipeline::services::{
    CreatedAssessment, GenerationError, GenerationService, LearningPlatform, LessonContent,
    LessonRequest, OutlineLesson, OutlineModule,
};
use genie_pipeline::{
    DefaultActions, LaunchStep, OrgSnapshot, Pipeline, PipelineConfig, Project, StageId,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub const ORG_ID: &str = "acme";

// =============================================================================
// Generation
// =============================================================================

/// Deterministic generation service with switchable failures.
#[derive(Default)]
pub struct ScriptedGeneration {
    pub fail_objectives: AtomicBool,
    pub fail_chat: AtomicBool,
    /// Append a module without lessons to every outline
    pub broken_outline: AtomicBool,
    /// Park chat calls until `chat_release` is notified
    pub hold_chat: AtomicBool,
    pub chat_entered: Notify,
    pub chat_release: Notify,
    /// Lesson titles that fail to generate
    pub failing_lessons: Mutex<BTreeSet<String>>,
    pub lesson_calls: AtomicUsize,
    pub chat_calls: AtomicUsize,
}

impl ScriptedGeneration {
    pub fn fail_lesson(&self, title: &str) {
        self.failing_lessons.lock().unwrap().insert(title.to_string());
    }

    pub fn heal_lessons(&self) {
        self.failing_lessons.lock().unwrap().clear();
    }

    pub fn lesson_calls(&self) -> usize {
        self.lesson_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationService for ScriptedGeneration {
    async fn generate_objectives(
        &self,
        _sources: &[SourceDocument],
        _context: &str,
        count: usize,
    ) -> Result<Vec<String>, GenerationError> {
        if self.fail_objectives.load(Ordering::SeqCst) {
            return Err(GenerationError::Unavailable("objectives offline".to_string()));
        }
        Ok((1..=count).map(|i| format!("Objective {}", i)).collect())
    }

    async fn generate_outline(
        &self,
        _title: &str,
        _sources: &[SourceDocument],
        _prompt: Option<&str>,
    ) -> Result<Vec<OutlineModule>, GenerationError> {
        let mut outline = vec![
            OutlineModule {
                title: "Foundations".to_string(),
                lessons: vec![
                    outline_lesson("Welcome", LessonType::Video),
                    outline_lesson("Core ideas", LessonType::Text),
                ],
            },
            OutlineModule {
                title: "Practice".to_string(),
                lessons: vec![outline_lesson("Check yourself", LessonType::Quiz)],
            },
        ];
        if self.broken_outline.load(Ordering::SeqCst) {
            outline.push(OutlineModule {
                title: "Wrap-up".to_string(),
                lessons: Vec::new(),
            });
        }
        Ok(outline)
    }

    async fn generate_lesson_content(
        &self,
        request: &LessonRequest,
    ) -> Result<LessonContent, GenerationError> {
        self.lesson_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .failing_lessons
            .lock()
            .unwrap()
            .contains(&request.lesson_title)
        {
            return Err(GenerationError::Unavailable("model timeout".to_string()));
        }
        Ok(LessonContent {
            content: format!(
                "# {}\n\nPart of {} in {}.",
                request.lesson_title, request.module_title, request.course_title
            ),
            duration: Some(10),
            is_required: None,
        })
    }

    async fn chat_completion(
        &self,
        _system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, GenerationError> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        if self.hold_chat.load(Ordering::SeqCst) {
            self.chat_entered.notify_one();
            self.chat_release.notified().await;
        }
        if self.fail_chat.load(Ordering::SeqCst) {
            return Err(GenerationError::Unavailable("chat offline".to_string()));
        }
        Ok(format!("Noted: {}", user_prompt.chars().take(40).collect::<String>()))
    }
}

fn outline_lesson(title: &str, lesson_type: LessonType) -> OutlineLesson {
    OutlineLesson {
        title: title.to_string(),
        lesson_type,
        duration: None,
        is_required: None,
    }
}

// =============================================================================
// Platform
// =============================================================================

/// Platform fake that records every write.
pub struct RecordingPlatform {
    pub calls: Mutex<Vec<String>>,
    /// Question counts handed out for created assessments
    pub question_counts: Mutex<Vec<usize>>,
}

impl Default for RecordingPlatform {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            question_counts: Mutex::new(vec![5]),
        }
    }
}

impl RecordingPlatform {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl LearningPlatform for RecordingPlatform {
    async fn ingest_sources(&self, org_id: &str, sources: &[SourceDocument]) -> anyhow::Result<usize> {
        self.record(format!("ingest {} {}", org_id, sources.len()));
        Ok(sources.len() * 4)
    }

    async fn create_course(&self, org_id: &str, draft: &DraftData) -> anyhow::Result<String> {
        self.record(format!("create_course {} {}", org_id, draft.course_title));
        Ok("course-1".to_string())
    }

    async fn create_assessments(
        &self,
        course_id: &str,
        _draft: &DraftData,
    ) -> anyhow::Result<Vec<CreatedAssessment>> {
        self.record(format!("create_assessments {}", course_id));
        let counts = self.question_counts.lock().unwrap().clone();
        Ok(counts
            .into_iter()
            .enumerate()
            .map(|(i, question_count)| CreatedAssessment {
                id: format!("assessment-{}", i + 1),
                title: format!("Quiz {}", i + 1),
                question_count,
            })
            .collect())
    }

    async fn enroll(&self, course_id: &str, member_ids: &[String], required: bool) -> anyhow::Result<usize> {
        self.record(format!("enroll {} {} {}", course_id, member_ids.len(), required));
        Ok(member_ids.len())
    }

    async fn notify(&self, course_id: &str, member_ids: &[String]) -> anyhow::Result<usize> {
        self.record(format!("notify {} {}", course_id, member_ids.len()));
        Ok(member_ids.len())
    }
}

// =============================================================================
// Fixtures
// =============================================================================

pub fn sources() -> Vec<SourceDocument> {
    vec![
        SourceDocument {
            id: "s1".to_string(),
            title: "Employee handbook".to_string(),
            content: Some("Policies and benefits".to_string()),
        },
        SourceDocument {
            id: "s2".to_string(),
            title: "Security policy".to_string(),
            content: None,
        },
    ]
}

pub fn members() -> Vec<Member> {
    ["ada", "bob", "cy"]
        .into_iter()
        .enumerate()
        .map(|(i, id)| Member {
            id: id.to_string(),
            name: id.to_uppercase(),
            email: Some(format!("{}@acme.test", id)),
            department_id: Some(if i == 0 { "sales" } else { "support" }.to_string()),
            team_id: None,
        })
        .collect()
}

pub fn departments() -> Vec<Department> {
    vec![
        Department {
            id: "sales".to_string(),
            name: "Sales".to_string(),
        },
        Department {
            id: "support".to_string(),
            name: "Support".to_string(),
        },
    ]
}

pub fn teams() -> Vec<Team> {
    vec![Team {
        id: "t1".to_string(),
        name: "Onboarding crew".to_string(),
        department_id: Some("support".to_string()),
    }]
}

/// Everything loaded.
pub fn full_org() -> OrgSnapshot {
    OrgSnapshot {
        org_id: ORG_ID.to_string(),
        members: Some(members()),
        departments: Some(departments()),
        teams: Some(teams()),
        enrollments: Some(Vec::new()),
        sources: Some(sources()),
    }
}

pub fn analysis() -> AnalysisData {
    AnalysisData {
        target_audience: "New hires".to_string(),
        learning_needs: vec!["Know the benefits".to_string()],
        skill_gaps: Vec::new(),
        summary: None,
    }
}

fn module(title: &str, lessons: &[&str]) -> DesignModule {
    DesignModule {
        title: title.to_string(),
        lessons: lessons
            .iter()
            .map(|l| LessonPlan {
                title: l.to_string(),
                lesson_type: LessonType::Text,
                duration_minutes: None,
                is_required: None,
            })
            .collect(),
        active_learning: vec!["Scenario discussion".to_string()],
        multimedia: vec!["Illustrated slides".to_string()],
    }
}

/// Complete design: title, objectives, and both tactic kinds everywhere.
pub fn design() -> DesignData {
    DesignData {
        course_title: "Welcome to Acme".to_string(),
        objectives: vec!["Explain the benefits".to_string()],
        modules: vec![
            module("Benefits", &["Health", "Leave"]),
            module("Security", &["Passwords"]),
        ],
        assessment_strategy: None,
    }
}

/// A project whose stages before `stage` are completed with fixture data.
pub fn project_at(stage: StageId) -> Project {
    let mut project = Project::new(
        "Acme onboarding",
        "Everything a new Acme hire needs in the first week",
    );
    for done in StageId::ALL.into_iter().take_while(|s| *s != stage) {
        match done {
            StageId::Ingest => {
                project.source_ids.insert("s1".to_string());
            }
            StageId::Analyze => project.analysis = Some(analysis()),
            StageId::Design => project.design = Some(design()),
            _ => panic!("project_at only prepares up to develop"),
        }
        project.mark_stage_complete(done).unwrap();
    }
    project
}

pub struct Harness {
    pub pipeline: Pipeline,
    pub generation: Arc<ScriptedGeneration>,
    pub platform: Arc<RecordingPlatform>,
}

/// Pipeline with the built-in handlers and the given org data.
pub fn build(project: Project, stage: StageId, org: OrgSnapshot, config: PipelineConfig) -> Harness {
    let generation = Arc::new(ScriptedGeneration::default());
    let platform = Arc::new(RecordingPlatform::default());
    let pipeline = Pipeline::builder(project, generation.clone(), platform.clone())
        .org(org)
        .config(config)
        .current_stage(stage)
        .actions(Arc::new(DefaultActions))
        .build();
    Harness {
        pipeline,
        generation,
        platform,
    }
}

pub fn quiet_config() -> PipelineConfig {
    PipelineConfig {
        checkpoints: false,
        ..Default::default()
    }
}

/// Yield until the pipeline has a pending checkpoint.
pub async fn until_checkpoint(pipeline: &Pipeline) -> LaunchStep {
    for _ in 0..10_000 {
        if let Some(step) = pipeline.pending_checkpoint() {
            return step;
        }
        tokio::task::yield_now().await;
    }
    panic!("no checkpoint became pending");
}
