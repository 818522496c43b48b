//! Project aggregate: the single source of truth for one authoring project.
//!
//! Timestamps serialize as epoch milliseconds so persisted snapshots stay
//! plain JSON numbers.

use crate::error::{PipelineError, Result};
use crate::exceptions::ProjectException;
use crate::graph;
use crate::launch::LaunchRun;
use crate::metrics::RunMetric;
use crate::stage::{ApprovalState, StageId, StageStatus};
use chrono::serde::{ts_milliseconds, ts_milliseconds_option};
use chrono::{DateTime, Utc};
use genie_ids::{ActionRecordId, MessageId, ProjectId, SuggestionId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// ============================================================================
// Project
// ============================================================================

/// Root aggregate for one authoring project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts_milliseconds")]
    pub updated_at: DateTime<Utc>,

    /// Content sources selected for this project
    #[serde(default)]
    pub source_ids: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub design: Option<DesignData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft: Option<DraftData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementation: Option<ImplementationData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<EvaluationData>,

    #[serde(default)]
    pub stage_status: BTreeMap<StageId, StageStatus>,
    #[serde(default)]
    pub stage_approvals: BTreeMap<StageId, ApprovalState>,
    /// Append-only approval audit log
    #[serde(default)]
    pub approval_history: Vec<ApprovalRecord>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copilot: Option<CopilotState>,

    /// Dedup keys of every suggestion ever emitted for this project
    #[serde(default)]
    pub suggestion_keys: BTreeSet<String>,

    #[serde(default)]
    pub stage_timings: BTreeMap<StageId, StageTiming>,

    /// Latest build & launch run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch: Option<LaunchRun>,
    /// Most recent failure, shown at banner level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(default)]
    pub exceptions: Vec<ProjectException>,
    #[serde(default)]
    pub run_metrics: Vec<RunMetric>,
}

impl Project {
    /// Start a new project: no stage data, every stage pending and unapproved.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ProjectId::new(),
            name: name.into(),
            description: description.into(),
            created_at: now,
            updated_at: now,
            source_ids: BTreeSet::new(),
            analysis: None,
            design: None,
            draft: None,
            implementation: None,
            evaluation: None,
            stage_status: StageId::ALL
                .iter()
                .map(|s| (*s, StageStatus::Pending))
                .collect(),
            stage_approvals: StageId::ALL
                .iter()
                .map(|s| (*s, ApprovalState::Unapproved))
                .collect(),
            approval_history: Vec::new(),
            copilot: None,
            suggestion_keys: BTreeSet::new(),
            stage_timings: BTreeMap::new(),
            launch: None,
            last_error: None,
            exceptions: Vec::new(),
            run_metrics: Vec::new(),
        }
    }

    pub fn status(&self, stage: StageId) -> StageStatus {
        self.stage_status.get(&stage).copied().unwrap_or_default()
    }

    pub fn approval(&self, stage: StageId) -> ApprovalState {
        self.stage_approvals.get(&stage).copied().unwrap_or_default()
    }

    pub fn is_approved(&self, stage: StageId) -> bool {
        self.approval(stage).is_approved()
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Shallow top-level merge. A supplied stage payload replaces the whole
    /// previous record; fields are never deep-merged.
    ///
    /// Returns the fields that were supplied.
    pub fn apply_patch(&mut self, patch: ProjectPatch) -> Vec<ProjectField> {
        let mut changed = Vec::new();

        if let Some(name) = patch.name {
            self.name = name;
            changed.push(ProjectField::Name);
        }
        if let Some(description) = patch.description {
            self.description = description;
            changed.push(ProjectField::Description);
        }
        if let Some(source_ids) = patch.source_ids {
            self.source_ids = source_ids;
            changed.push(ProjectField::Sources);
        }
        if let Some(analysis) = patch.analysis {
            self.analysis = Some(analysis);
            changed.push(ProjectField::Analysis);
        }
        if let Some(design) = patch.design {
            self.design = Some(design);
            changed.push(ProjectField::Design);
        }
        if let Some(draft) = patch.draft {
            self.draft = Some(draft);
            changed.push(ProjectField::Draft);
        }
        if let Some(implementation) = patch.implementation {
            self.implementation = Some(implementation);
            changed.push(ProjectField::Implementation);
        }
        if let Some(evaluation) = patch.evaluation {
            self.evaluation = Some(evaluation);
            changed.push(ProjectField::Evaluation);
        }

        if !changed.is_empty() {
            self.touch();
        }
        changed
    }

    /// Move a stage to `in_progress` unless it is already completed.
    ///
    /// Returns true if the status changed.
    pub fn mark_stage_in_progress(&mut self, stage: StageId) -> bool {
        if self.status(stage) != StageStatus::Pending {
            return false;
        }
        self.stage_status.insert(stage, StageStatus::InProgress);
        self.stage_timings
            .entry(stage)
            .or_default()
            .started_at
            .get_or_insert_with(Utc::now);
        self.touch();
        true
    }

    /// Mark a stage completed. Idempotent.
    ///
    /// Rejected without mutation when the stage's minimum-data predicate does
    /// not hold. Returns true if the status changed.
    pub fn mark_stage_complete(&mut self, stage: StageId) -> Result<bool> {
        if self.status(stage).is_completed() {
            return Ok(false);
        }
        if !graph::is_stage_complete(self, stage) {
            return Err(PipelineError::prerequisite(format!(
                "{} is missing required data",
                stage.title()
            )));
        }

        self.stage_status.insert(stage, StageStatus::Completed);
        let now = Utc::now();
        let timing = self.stage_timings.entry(stage).or_default();
        timing.started_at.get_or_insert(now);
        timing.completed_at.get_or_insert(now);
        self.touch();
        Ok(true)
    }

    /// Grant autopilot authority for a stage.
    ///
    /// The stage must have reached at least `in_progress`, i.e. a human has
    /// seen it. Returns true if a new approval was recorded.
    pub fn approve_stage(&mut self, stage: StageId, approver: impl Into<String>) -> Result<bool> {
        if self.status(stage) == StageStatus::Pending {
            return Err(PipelineError::prerequisite(format!(
                "{} has not been opened yet and cannot be approved",
                stage.title()
            )));
        }
        if self.is_approved(stage) {
            return Ok(false);
        }

        self.stage_approvals.insert(stage, ApprovalState::Approved);
        self.approval_history.push(ApprovalRecord {
            stage,
            approved_at: Utc::now(),
            approver: approver.into(),
        });
        self.touch();
        Ok(true)
    }

    /// Withdraw autopilot authority. History is kept.
    pub fn revoke_approval(&mut self, stage: StageId) -> bool {
        if !self.is_approved(stage) {
            return false;
        }
        self.stage_approvals.insert(stage, ApprovalState::Unapproved);
        self.touch();
        true
    }

    pub fn copilot(&self) -> Option<&CopilotState> {
        self.copilot.as_ref()
    }

    pub fn copilot_mut(&mut self) -> &mut CopilotState {
        self.copilot.get_or_insert_with(CopilotState::default)
    }

    /// Record a free-form generation prompt for a stage.
    pub fn push_stage_prompt(&mut self, stage: StageId, prompt: impl Into<String>) {
        self.copilot_mut()
            .prompts
            .entry(stage)
            .or_default()
            .push(prompt.into());
        self.touch();
    }

    /// Most recent prompt recorded for a stage.
    pub fn latest_prompt(&self, stage: StageId) -> Option<&str> {
        self.copilot
            .as_ref()
            .and_then(|c| c.prompts.get(&stage))
            .and_then(|prompts| prompts.last())
            .map(String::as_str)
    }

    pub fn find_action_record_mut(&mut self, id: &ActionRecordId) -> Option<&mut ActionRecord> {
        self.copilot
            .as_mut()
            .and_then(|c| c.actions_taken.iter_mut().find(|r| &r.id == id))
    }
}

/// Top-level fields an update can touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectField {
    Name,
    Description,
    Sources,
    Analysis,
    Design,
    Draft,
    Implementation,
    Evaluation,
}

impl ProjectField {
    /// Stage whose payload this field holds, if any.
    pub fn stage(&self) -> Option<StageId> {
        match self {
            ProjectField::Sources => Some(StageId::Ingest),
            ProjectField::Analysis => Some(StageId::Analyze),
            ProjectField::Design => Some(StageId::Design),
            ProjectField::Draft => Some(StageId::Develop),
            ProjectField::Implementation => Some(StageId::Implement),
            ProjectField::Evaluation => Some(StageId::Evaluate),
            ProjectField::Name | ProjectField::Description => None,
        }
    }
}

/// Partial update applied by [`Project::apply_patch`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub source_ids: Option<BTreeSet<String>>,
    pub analysis: Option<AnalysisData>,
    pub design: Option<DesignData>,
    pub draft: Option<DraftData>,
    pub implementation: Option<ImplementationData>,
    pub evaluation: Option<EvaluationData>,
}

impl ProjectPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn sources<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.source_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn analysis(mut self, analysis: AnalysisData) -> Self {
        self.analysis = Some(analysis);
        self
    }

    pub fn design(mut self, design: DesignData) -> Self {
        self.design = Some(design);
        self
    }

    pub fn draft(mut self, draft: DraftData) -> Self {
        self.draft = Some(draft);
        self
    }

    pub fn implementation(mut self, implementation: ImplementationData) -> Self {
        self.implementation = Some(implementation);
        self
    }

    pub fn evaluation(mut self, evaluation: EvaluationData) -> Self {
        self.evaluation = Some(evaluation);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One entry in the approval audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub stage: StageId,
    #[serde(with = "ts_milliseconds")]
    pub approved_at: DateTime<Utc>,
    pub approver: String,
}

/// When a stage was first opened and first completed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    #[serde(default, with = "ts_milliseconds_option", skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "ts_milliseconds_option", skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageTiming {
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

// ============================================================================
// Stage payloads
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisData {
    #[serde(default)]
    pub target_audience: String,
    #[serde(default)]
    pub learning_needs: Vec<String>,
    #[serde(default)]
    pub skill_gaps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DesignData {
    #[serde(default)]
    pub course_title: String,
    #[serde(default)]
    pub objectives: Vec<String>,
    #[serde(default)]
    pub modules: Vec<DesignModule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assessment_strategy: Option<String>,
}

impl DesignData {
    pub fn total_lessons(&self) -> usize {
        self.modules.iter().map(|m| m.lessons.len()).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DesignModule {
    pub title: String,
    #[serde(default)]
    pub lessons: Vec<LessonPlan>,
    /// Active-learning tactics (discussion, scenario practice, ...)
    #[serde(default)]
    pub active_learning: Vec<String>,
    /// Multimedia tactics (video, narrated slides, ...)
    #[serde(default)]
    pub multimedia: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LessonType {
    #[default]
    Text,
    Video,
    Audio,
    Quiz,
    Interactive,
}

impl LessonType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LessonType::Text => "text",
            LessonType::Video => "video",
            LessonType::Audio => "audio",
            LessonType::Quiz => "quiz",
            LessonType::Interactive => "interactive",
        }
    }
}

impl fmt::Display for LessonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonPlan {
    pub title: String,
    #[serde(default)]
    pub lesson_type: LessonType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_required: Option<bool>,
}

/// In-progress generated course structure produced during Develop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DraftData {
    pub course_title: String,
    #[serde(default)]
    pub modules: Vec<DraftModule>,
    /// Quality-gate findings from the last generation pass
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl DraftData {
    /// Lay out an empty draft mirroring the design's module plan.
    pub fn from_design(design: &DesignData) -> Self {
        Self {
            course_title: design.course_title.clone(),
            modules: design
                .modules
                .iter()
                .map(|module| DraftModule {
                    title: module.title.clone(),
                    lessons: module
                        .lessons
                        .iter()
                        .map(|plan| DraftLesson {
                            title: plan.title.clone(),
                            lesson_type: plan.lesson_type,
                            content: None,
                            duration_minutes: plan.duration_minutes,
                            is_required: plan.is_required,
                            error: None,
                        })
                        .collect(),
                })
                .collect(),
            warnings: Vec::new(),
        }
    }

    pub fn total_lessons(&self) -> usize {
        self.modules.iter().map(|m| m.lessons.len()).sum()
    }

    pub fn generated_lessons(&self) -> usize {
        self.modules
            .iter()
            .flat_map(|m| m.lessons.iter())
            .filter(|l| l.is_generated())
            .count()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DraftModule {
    pub title: String,
    #[serde(default)]
    pub lessons: Vec<DraftLesson>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftLesson {
    pub title: String,
    #[serde(default)]
    pub lesson_type: LessonType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_required: Option<bool>,
    /// Error from the last generation attempt for this lesson only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DraftLesson {
    pub fn is_generated(&self) -> bool {
        self.content.as_deref().is_some_and(|c| !c.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImplementationData {
    /// Course created on the learning platform
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course_id: Option<String>,
    #[serde(default)]
    pub enrollment_rules: Vec<EnrollmentRule>,
    #[serde(default, with = "ts_milliseconds_option", skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, with = "ts_milliseconds_option", skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assessment_ids: Vec<String>,
    #[serde(default)]
    pub enrolled_count: usize,
    #[serde(default)]
    pub notified_count: usize,
    #[serde(default, with = "ts_milliseconds_option", skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<DateTime<Utc>>,
}

impl ImplementationData {
    pub fn has_schedule(&self) -> bool {
        self.start_date.is_some() || self.due_date.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentRule {
    pub target: EnrollmentTarget,
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EnrollmentTarget {
    Everyone,
    Department { id: String },
    Team { id: String },
    Member { id: String },
}

impl fmt::Display for EnrollmentTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnrollmentTarget::Everyone => write!(f, "everyone"),
            EnrollmentTarget::Department { id } => write!(f, "department:{}", id),
            EnrollmentTarget::Team { id } => write!(f, "team:{}", id),
            EnrollmentTarget::Member { id } => write!(f, "member:{}", id),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationData {
    /// Tracking metrics selected for the launched course
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub survey_enabled: bool,
    #[serde(default, with = "ts_milliseconds_option", skip_serializing_if = "Option::is_none")]
    pub review_date: Option<DateTime<Utc>>,
}

// ============================================================================
// Copilot
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CopilotState {
    #[serde(default)]
    pub prompts: BTreeMap<StageId, Vec<String>>,
    /// Chronological chat transcript
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    /// One record per attempted action invocation
    #[serde(default)]
    pub actions_taken: Vec<ActionRecord>,
    #[serde(default)]
    pub suggestions: Vec<Suggestion>,
}

impl CopilotState {
    pub fn push_message(&mut self, role: ChatRole, content: impl Into<String>) -> MessageId {
        let message = ChatMessage::new(role, content);
        let id = message.id.clone();
        self.history.push(message);
        id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub role: ChatRole,
    pub content: String,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Outcome of one action invocation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Success,
    Error,
}

impl ActionStatus {
    /// Only `Pending -> Success` and `Pending -> Error` are valid.
    pub fn can_transition_to(&self, next: ActionStatus) -> bool {
        matches!(
            (self, next),
            (ActionStatus::Pending, ActionStatus::Success) | (ActionStatus::Pending, ActionStatus::Error)
        )
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ActionStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Success => "success",
            ActionStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: ActionRecordId,
    pub stage: StageId,
    pub action: String,
    pub status: ActionStatus,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "ts_milliseconds_option", skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionRecord {
    pub fn pending(stage: StageId, action: impl Into<String>) -> Self {
        Self {
            id: ActionRecordId::new(),
            stage,
            action: action.into(),
            status: ActionStatus::Pending,
            created_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    /// Settle as success. Returns false (and changes nothing) if already settled.
    pub fn succeed(&mut self) -> bool {
        self.settle(ActionStatus::Success, None)
    }

    /// Settle as error. Returns false (and changes nothing) if already settled.
    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        self.settle(ActionStatus::Error, Some(error.into()))
    }

    fn settle(&mut self, next: ActionStatus, error: Option<String>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.error = error;
        self.finished_at = Some(Utc::now());
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub id: SuggestionId,
    pub stage: StageId,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub followed: bool,
}

impl Suggestion {
    /// Dedup key: `(stage, action ?? message)`.
    pub fn dedup_key(stage: StageId, message: &str, action: Option<&str>) -> String {
        format!("{}:{}", stage.as_str(), action.unwrap_or(message))
    }

    pub fn key(&self) -> String {
        Self::dedup_key(self.stage, &self.message, self.action.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_analysis() -> AnalysisData {
        AnalysisData {
            target_audience: "New support agents".to_string(),
            learning_needs: vec!["Ticket triage".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_new_project_starts_pending() {
        let project = Project::new("Onboarding", "");
        for stage in StageId::ALL {
            assert_eq!(project.status(stage), StageStatus::Pending);
            assert_eq!(project.approval(stage), ApprovalState::Unapproved);
        }
        assert!(project.copilot.is_none());
    }

    #[test]
    fn test_patch_replaces_whole_payload() {
        let mut project = Project::new("Onboarding", "");
        project.apply_patch(ProjectPatch::new().analysis(AnalysisData {
            target_audience: "Agents".to_string(),
            learning_needs: vec!["Triage".to_string()],
            skill_gaps: vec!["Escalation".to_string()],
            summary: None,
        }));

        let changed = project.apply_patch(ProjectPatch::new().analysis(AnalysisData {
            target_audience: "Leads".to_string(),
            ..Default::default()
        }));

        assert_eq!(changed, vec![ProjectField::Analysis]);
        let analysis = project.analysis.as_ref().unwrap();
        assert_eq!(analysis.target_audience, "Leads");
        assert!(analysis.learning_needs.is_empty());
        assert!(analysis.skill_gaps.is_empty());
    }

    #[test]
    fn test_patch_leaves_other_fields_alone() {
        let mut project = Project::new("Onboarding", "desc");
        project.apply_patch(ProjectPatch::new().sources(["src-1"]));
        project.apply_patch(ProjectPatch::new().name("Renamed"));

        assert_eq!(project.name, "Renamed");
        assert_eq!(project.description, "desc");
        assert!(project.source_ids.contains("src-1"));
    }

    #[test]
    fn test_in_progress_never_downgrades_completed() {
        let mut project = Project::new("Onboarding", "");
        project.apply_patch(ProjectPatch::new().analysis(complete_analysis()));
        assert!(project.mark_stage_in_progress(StageId::Analyze));
        assert!(project.mark_stage_complete(StageId::Analyze).unwrap());

        assert!(!project.mark_stage_in_progress(StageId::Analyze));
        assert_eq!(project.status(StageId::Analyze), StageStatus::Completed);
    }

    #[test]
    fn test_mark_complete_is_idempotent() {
        let mut project = Project::new("Onboarding", "");
        project.apply_patch(ProjectPatch::new().analysis(complete_analysis()));
        assert!(project.mark_stage_complete(StageId::Analyze).unwrap());
        assert!(!project.mark_stage_complete(StageId::Analyze).unwrap());

        let timing = &project.stage_timings[&StageId::Analyze];
        assert!(timing.completed_at.is_some());
        assert!(timing.duration_ms().unwrap() >= 0);
    }

    #[test]
    fn test_mark_complete_rejects_missing_data() {
        let mut project = Project::new("Onboarding", "");
        let err = project.mark_stage_complete(StageId::Analyze).unwrap_err();
        assert!(matches!(err, PipelineError::Prerequisite(_)));
        assert_eq!(project.status(StageId::Analyze), StageStatus::Pending);
    }

    #[test]
    fn test_approval_requires_stage_opened() {
        let mut project = Project::new("Onboarding", "");
        assert!(project.approve_stage(StageId::Design, "ana").is_err());
        assert!(project.approval_history.is_empty());

        project.mark_stage_in_progress(StageId::Design);
        assert!(project.approve_stage(StageId::Design, "ana").unwrap());
        assert!(!project.approve_stage(StageId::Design, "ana").unwrap());
        assert_eq!(project.approval_history.len(), 1);
        assert_eq!(project.approval_history[0].approver, "ana");
    }

    #[test]
    fn test_revoke_keeps_history() {
        let mut project = Project::new("Onboarding", "");
        project.mark_stage_in_progress(StageId::Design);
        project.approve_stage(StageId::Design, "ana").unwrap();

        assert!(project.revoke_approval(StageId::Design));
        assert!(!project.is_approved(StageId::Design));
        assert_eq!(project.approval_history.len(), 1);

        project.approve_stage(StageId::Design, "ben").unwrap();
        assert_eq!(project.approval_history.len(), 2);
    }

    #[test]
    fn test_action_record_status_is_monotonic() {
        let mut record = ActionRecord::pending(StageId::Develop, "generate_lessons");
        assert!(record.fail("quota exceeded"));
        assert!(!record.succeed());
        assert!(!record.fail("again"));
        assert_eq!(record.status, ActionStatus::Error);
        assert_eq!(record.error.as_deref(), Some("quota exceeded"));
    }

    #[test]
    fn test_action_status_transitions() {
        assert!(ActionStatus::Pending.can_transition_to(ActionStatus::Success));
        assert!(ActionStatus::Pending.can_transition_to(ActionStatus::Error));
        assert!(!ActionStatus::Success.can_transition_to(ActionStatus::Pending));
        assert!(!ActionStatus::Error.can_transition_to(ActionStatus::Success));
        assert!(!ActionStatus::Pending.can_transition_to(ActionStatus::Pending));
    }

    #[test]
    fn test_timestamps_serialize_as_epoch_millis() {
        let project = Project::new("Onboarding", "");
        let value = serde_json::to_value(&project).unwrap();
        assert_eq!(
            value["created_at"].as_i64(),
            Some(project.created_at.timestamp_millis())
        );

        let decoded: Project = serde_json::from_value(value).unwrap();
        assert_eq!(
            decoded.created_at.timestamp_millis(),
            project.created_at.timestamp_millis()
        );
    }

    #[test]
    fn test_suggestion_key_prefers_action() {
        assert_eq!(
            Suggestion::dedup_key(StageId::Analyze, "Run it?", Some("run_analysis")),
            "analyze:run_analysis"
        );
        assert_eq!(
            Suggestion::dedup_key(StageId::Ingest, "Pick a source", None),
            "ingest:Pick a source"
        );
    }

    #[test]
    fn test_draft_counts() {
        let design = DesignData {
            course_title: "Support 101".to_string(),
            objectives: vec!["Triage tickets".to_string()],
            modules: vec![DesignModule {
                title: "Basics".to_string(),
                lessons: vec![
                    LessonPlan {
                        title: "Intro".to_string(),
                        lesson_type: LessonType::Text,
                        duration_minutes: Some(10),
                        is_required: None,
                    },
                    LessonPlan {
                        title: "Quiz".to_string(),
                        lesson_type: LessonType::Quiz,
                        duration_minutes: None,
                        is_required: Some(true),
                    },
                ],
                active_learning: vec![],
                multimedia: vec![],
            }],
            assessment_strategy: None,
        };
        let mut draft = DraftData::from_design(&design);
        assert_eq!(draft.total_lessons(), 2);
        assert_eq!(draft.generated_lessons(), 0);

        draft.modules[0].lessons[0].content = Some("Welcome".to_string());
        draft.modules[0].lessons[1].content = Some("   ".to_string());
        assert_eq!(draft.generated_lessons(), 1);
    }
}
