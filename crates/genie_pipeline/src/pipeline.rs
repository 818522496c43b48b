//! Pipeline session: the one mutation surface for a project.
//!
//! [`Pipeline`] is a cheap clonable handle. Every operation locks the
//! session state for a short synchronous section, appends events, releases
//! the lock, and then runs [`Pipeline::settle`]: the reducer that drains the
//! new events, evaluates suggestion rules, schedules persistence, posts stage
//! summaries, and steps the autopilot.
//!
//! The state lock is never held across an `.await` on a handler or an
//! external service.

use crate::actions::{ActionContext, ActionProvider, ActionRegistry, StageActions};
use crate::autopilot::{
    AutopilotController, AutopilotDecision, AutopilotProgress, AutopilotStatus, AutopilotTicket,
};
use crate::checkpoint::{CheckpointError, CheckpointGate};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::events::{EventLog, LoggedEvent, ProjectEvent};
use crate::exceptions::{self, ExceptionPriority, ExceptionResolution, ExceptionStatus, ProjectException};
use crate::graph::{self, StageCursor};
use crate::launch::{LaunchRun, LaunchStep};
use crate::metrics::{self, RunMetric};
use crate::org::{self, OrgSnapshot, Readiness};
use crate::persistence::{DebouncedSaver, ProjectSnapshot, ProjectStore};
use crate::project::{
    ActionRecord, ActionStatus, ChatRole, Project, ProjectField, ProjectPatch, Suggestion,
};
use crate::services::{GenerationService, LearningPlatform, APOLOGY};
use crate::stage::{ApprovalState, StageId, StageStatus};
use crate::suggestions::{self, SuggestionEngine, SuggestionStats};
use genie_ids::{ExceptionId, RunId, SuggestionId};
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const SUMMARY_SYSTEM_PROMPT: &str = "You are Genie, a course-authoring copilot. \
Summarize what was just completed in two sentences and suggest the next step.";

/// Mutable session state guarded by the pipeline lock.
pub(crate) struct PipelineState {
    pub(crate) project: Project,
    pub(crate) org: OrgSnapshot,
    pub(crate) cursor: StageCursor,
    pub(crate) registry: ActionRegistry,
    pub(crate) autopilot: AutopilotController,
    pub(crate) events: EventLog,
}

impl PipelineState {
    fn set_stage_in_progress(&mut self, stage: StageId) {
        if self.project.mark_stage_in_progress(stage) {
            self.events.push(ProjectEvent::StageStatusChanged {
                stage,
                status: StageStatus::InProgress,
            });
        }
    }

    /// Bookkeeping after the cursor moved away from `previous`.
    fn enter_stage(&mut self, previous: StageId, provider: Option<&Arc<dyn ActionProvider>>) {
        let stage = self.cursor.current();
        if stage == previous {
            return;
        }
        if let Some(provider) = provider {
            self.registry.clear_stage(previous);
            self.registry
                .register_stage_actions(stage, provider.actions_for(stage));
        }
        self.events.push(ProjectEvent::StageEntered { stage });
        if graph::is_stage_accessible(&self.project, stage) {
            self.set_stage_in_progress(stage);
        }
        info!("Entered stage {}", stage);
    }

    /// Open an exception on the project and log it as an event.
    pub(crate) fn raise_exception(
        &mut self,
        stage: StageId,
        reason_code: &str,
        message: &str,
        priority: ExceptionPriority,
    ) -> Option<ExceptionId> {
        let id = exceptions::raise(&mut self.project, stage, reason_code, message, priority)?;
        self.events.push(ProjectEvent::ExceptionRaised {
            stage,
            reason_code: reason_code.to_string(),
        });
        Some(id)
    }
}

struct PipelineInner {
    state: Mutex<PipelineState>,
    generation: Arc<dyn GenerationService>,
    platform: Arc<dyn LearningPlatform>,
    provider: Option<Arc<dyn ActionProvider>>,
    suggestions: SuggestionEngine,
    checkpoints: CheckpointGate,
    saver: Option<DebouncedSaver>,
    config: PipelineConfig,
}

/// Handle onto one project's pipeline session.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

pub struct PipelineBuilder {
    project: Project,
    org: OrgSnapshot,
    current_stage: StageId,
    config: PipelineConfig,
    generation: Arc<dyn GenerationService>,
    platform: Arc<dyn LearningPlatform>,
    provider: Option<Arc<dyn ActionProvider>>,
    store: Option<Arc<dyn ProjectStore>>,
    suggestions: SuggestionEngine,
}

impl PipelineBuilder {
    pub fn org(mut self, org: OrgSnapshot) -> Self {
        self.org = org;
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn current_stage(mut self, stage: StageId) -> Self {
        self.current_stage = stage;
        self
    }

    /// Supplies each stage's handlers when the stage becomes active.
    pub fn actions(mut self, provider: Arc<dyn ActionProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Persist through a debounced saver on this store.
    pub fn store(mut self, store: Arc<dyn ProjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn suggestion_engine(mut self, engine: SuggestionEngine) -> Self {
        self.suggestions = engine;
        self
    }

    /// Start the session. Spawns the saver task when a store was given, so
    /// this must run inside a tokio runtime in that case.
    pub fn build(mut self) -> Pipeline {
        if let Some(run) = self.project.launch.as_mut().filter(|r| r.is_running()) {
            run.interrupt();
            warn!("Launch run {} was interrupted", run.run_id.short());
            self.project.last_error = run.last_error.clone();
        }

        let mut cursor = StageCursor::default();
        if !cursor.select(&self.project, self.current_stage) {
            warn!(
                "Stage {} is not accessible; starting at {}",
                self.current_stage,
                cursor.current()
            );
        }

        let mut registry = ActionRegistry::new();
        if let Some(provider) = &self.provider {
            registry.register_stage_actions(cursor.current(), provider.actions_for(cursor.current()));
        }

        let mut state = PipelineState {
            project: self.project,
            org: self.org,
            cursor,
            registry,
            autopilot: AutopilotController::new(self.config.autopilot),
            events: EventLog::default(),
        };
        let stage = state.cursor.current();
        state.events.push(ProjectEvent::StageEntered { stage });
        state.set_stage_in_progress(stage);

        let saver = self
            .store
            .map(|store| DebouncedSaver::spawn(store, self.config.persist_debounce()));

        info!(
            "Pipeline session started for project {} ({}) at stage {}",
            state.project.name,
            state.project.id.short(),
            stage
        );

        Pipeline {
            inner: Arc::new(PipelineInner {
                state: Mutex::new(state),
                generation: self.generation,
                platform: self.platform,
                provider: self.provider,
                suggestions: self.suggestions,
                checkpoints: CheckpointGate::new(self.config.checkpoints),
                saver,
                config: self.config,
            }),
        }
    }
}

/// Per-stage row of [`PipelineStatus`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageSummary {
    pub stage: StageId,
    pub status: StageStatus,
    pub approval: ApprovalState,
    pub accessible: bool,
    pub complete: bool,
    pub ready: bool,
}

/// Read-only view of the whole session, for status output.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub project_name: String,
    pub current_stage: StageId,
    pub stages: Vec<StageSummary>,
    /// Stages the cursor may jump to
    pub accessible_stages: Vec<StageId>,
    pub autopilot_enabled: bool,
    pub autopilot: AutopilotStatus,
    pub autopilot_progress: Option<AutopilotProgress>,
    pub pending_checkpoint: Option<LaunchStep>,
    pub last_error: Option<String>,
    pub suggestions: SuggestionStats,
    pub open_exceptions: usize,
    pub launch: Option<LaunchRun>,
}

/// One pass of the reducer.
struct Round {
    snapshot: Option<ProjectSnapshot>,
    completed: Vec<StageId>,
    decision: AutopilotDecision,
}

impl Pipeline {
    pub fn builder(
        project: Project,
        generation: Arc<dyn GenerationService>,
        platform: Arc<dyn LearningPlatform>,
    ) -> PipelineBuilder {
        PipelineBuilder {
            project,
            org: OrgSnapshot::default(),
            current_stage: StageId::first(),
            config: PipelineConfig::default(),
            generation,
            platform,
            provider: None,
            store: None,
            suggestions: SuggestionEngine::default(),
        }
    }

    /// Builder seeded from a persisted snapshot.
    pub fn restore(
        snapshot: &ProjectSnapshot,
        generation: Arc<dyn GenerationService>,
        platform: Arc<dyn LearningPlatform>,
    ) -> Result<PipelineBuilder> {
        let project = snapshot.restore()?;
        Ok(Self::builder(project, generation, platform)
            .org(OrgSnapshot::new(snapshot.org_id.clone()))
            .current_stage(snapshot.current_stage))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn generation(&self) -> Arc<dyn GenerationService> {
        Arc::clone(&self.inner.generation)
    }

    pub fn platform(&self) -> Arc<dyn LearningPlatform> {
        Arc::clone(&self.inner.platform)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn project(&self) -> Project {
        self.inner.state.lock().await.project.clone()
    }

    pub async fn org(&self) -> OrgSnapshot {
        self.inner.state.lock().await.org.clone()
    }

    pub async fn current_stage(&self) -> StageId {
        self.inner.state.lock().await.cursor.current()
    }

    pub async fn is_stage_accessible(&self, stage: StageId) -> bool {
        graph::is_stage_accessible(&self.inner.state.lock().await.project, stage)
    }

    pub async fn is_stage_complete(&self, stage: StageId) -> bool {
        graph::is_stage_complete(&self.inner.state.lock().await.project, stage)
    }

    pub async fn readiness(&self) -> Readiness {
        let state = self.inner.state.lock().await;
        Readiness::evaluate(&state.project, &state.org)
    }

    pub async fn autopilot_status(&self) -> AutopilotStatus {
        self.inner.state.lock().await.autopilot.status()
    }

    pub async fn autopilot_progress(&self) -> Option<AutopilotProgress> {
        self.inner.state.lock().await.autopilot.progress()
    }

    pub async fn last_error(&self) -> Option<String> {
        self.inner.state.lock().await.project.last_error.clone()
    }

    pub async fn launch_run(&self) -> Option<LaunchRun> {
        self.inner.state.lock().await.project.launch.clone()
    }

    /// Exception queue, newest first.
    pub async fn list_exceptions(&self, status: Option<ExceptionStatus>) -> Vec<ProjectException> {
        exceptions::list(&self.inner.state.lock().await.project, status)
    }

    /// Per-phase metrics, newest first. `run_id` limits them to one launch run.
    pub async fn pipeline_metrics(&self, run_id: Option<&RunId>) -> Vec<RunMetric> {
        metrics::query(&self.inner.state.lock().await.project, run_id)
    }

    pub async fn suggestion_stats(&self) -> SuggestionStats {
        suggestions::stats(&self.inner.state.lock().await.project)
    }

    pub async fn registered_actions(&self, stage: StageId) -> Vec<String> {
        self.inner.state.lock().await.registry.action_names(stage)
    }

    /// Retained events, oldest first.
    pub async fn event_history(&self) -> Vec<LoggedEvent> {
        self.inner.state.lock().await.events.entries().cloned().collect()
    }

    pub async fn status(&self) -> PipelineStatus {
        let state = self.inner.state.lock().await;
        let project = &state.project;
        let accessible = graph::accessible_stages(project);
        PipelineStatus {
            project_name: project.name.clone(),
            current_stage: state.cursor.current(),
            stages: StageId::ALL
                .iter()
                .map(|stage| StageSummary {
                    stage: *stage,
                    status: project.status(*stage),
                    approval: project.approval(*stage),
                    accessible: accessible.contains(stage),
                    complete: graph::is_stage_complete(project, *stage),
                    ready: org::is_stage_ready(project, &state.org, *stage),
                })
                .collect(),
            accessible_stages: accessible,
            autopilot_enabled: state.autopilot.is_enabled(),
            autopilot: state.autopilot.status(),
            autopilot_progress: state.autopilot.progress(),
            pending_checkpoint: self.inner.checkpoints.pending_checkpoint(),
            last_error: project.last_error.clone(),
            suggestions: suggestions::stats(project),
            open_exceptions: exceptions::open_count(project),
            launch: project.launch.clone(),
        }
    }

    // ========================================================================
    // Project mutations
    // ========================================================================

    /// Apply a shallow patch. Stage payloads in the patch replace the whole
    /// previous record.
    pub async fn update_project(&self, patch: ProjectPatch) -> Vec<ProjectField> {
        if patch.is_empty() {
            return Vec::new();
        }
        self.commit(|state| {
            let fields = state.project.apply_patch(patch);
            state.events.push(ProjectEvent::ProjectUpdated {
                fields: fields.clone(),
            });
            fields
        })
        .await
    }

    /// Replace the organizational snapshot (or part of it).
    pub async fn load_org(&self, update: impl FnOnce(&mut OrgSnapshot) + Send) {
        self.commit(|state| {
            update(&mut state.org);
            state.events.push(ProjectEvent::OrgDataLoaded);
        })
        .await
    }

    pub async fn mark_stage_in_progress(&self, stage: StageId) -> bool {
        self.commit(|state| {
            let changed = state.project.mark_stage_in_progress(stage);
            if changed {
                state.events.push(ProjectEvent::StageStatusChanged {
                    stage,
                    status: StageStatus::InProgress,
                });
            }
            changed
        })
        .await
    }

    /// Idempotent. Fails with a prerequisite error, changing nothing, when
    /// the stage lacks its minimum data.
    pub async fn mark_stage_complete(&self, stage: StageId) -> Result<bool> {
        self.commit(|state| -> Result<bool> {
            let changed = state.project.mark_stage_complete(stage)?;
            if changed {
                info!("Stage {} completed", stage);
                state.events.push(ProjectEvent::StageStatusChanged {
                    stage,
                    status: StageStatus::Completed,
                });
            }
            Ok(changed)
        })
        .await
    }

    /// Complete the stage if its data allows it. Returns whether it is complete.
    pub async fn complete_stage_if_ready(&self, stage: StageId) -> bool {
        if !self.is_stage_complete(stage).await {
            return false;
        }
        self.mark_stage_complete(stage).await.is_ok()
    }

    pub async fn approve_stage(&self, stage: StageId, approver: &str) -> Result<bool> {
        self.commit(|state| -> Result<bool> {
            let approved = state.project.approve_stage(stage, approver)?;
            if approved {
                info!("Stage {} approved by {}", stage, approver);
                state.autopilot.rearm_stage(stage);
                state.events.push(ProjectEvent::StageApproved {
                    stage,
                    approver: approver.to_string(),
                });
            }
            Ok(approved)
        })
        .await
    }

    pub async fn revoke_approval(&self, stage: StageId) -> bool {
        self.commit(|state| {
            let revoked = state.project.revoke_approval(stage);
            if revoked {
                info!("Approval revoked for stage {}", stage);
                state.events.push(ProjectEvent::ApprovalRevoked { stage });
            }
            revoked
        })
        .await
    }

    pub async fn set_stage_prompt(&self, stage: StageId, prompt: &str) {
        self.commit(|state| {
            state.project.push_stage_prompt(stage, prompt);
            state.events.push(ProjectEvent::ProjectUpdated { fields: Vec::new() });
        })
        .await
    }

    /// Emit a suggestion by hand. Deduplicated like rule-driven suggestions.
    pub async fn add_suggestion(
        &self,
        stage: StageId,
        message: &str,
        action: Option<&str>,
    ) -> Option<SuggestionId> {
        self.commit(|state| {
            let id = suggestions::add_suggestion(&mut state.project, stage, message, action);
            if id.is_some() {
                state.events.push(ProjectEvent::SuggestionAdded {
                    stage,
                    key: Suggestion::dedup_key(stage, message, action),
                });
            }
            id
        })
        .await
    }

    /// Close an open exception. Returns false when it was already closed.
    pub async fn resolve_exception(
        &self,
        id: &ExceptionId,
        resolution: ExceptionResolution,
        by: &str,
        notes: Option<&str>,
    ) -> Result<bool> {
        self.commit(|state| -> Result<bool> {
            let closed = exceptions::resolve(&mut state.project, id, resolution, by, notes)?;
            if closed {
                state.events.push(ProjectEvent::ExceptionResolved {
                    id: id.clone(),
                    status: resolution.status(),
                });
            }
            Ok(closed)
        })
        .await
    }

    // ========================================================================
    // Navigation
    // ========================================================================

    /// Jump to a stage. Silently refused (false) when it is not accessible.
    pub async fn select_stage(&self, stage: StageId) -> bool {
        let provider = self.inner.provider.clone();
        self.commit(|state| {
            let previous = state.cursor.current();
            if !state.cursor.select(&state.project, stage) {
                debug!("Refusing to select inaccessible stage {}", stage);
                return false;
            }
            state.enter_stage(previous, provider.as_ref());
            true
        })
        .await
    }

    pub async fn next_stage(&self) -> StageId {
        let provider = self.inner.provider.clone();
        self.commit(|state| {
            let previous = state.cursor.current();
            let current = state.cursor.next();
            state.enter_stage(previous, provider.as_ref());
            current
        })
        .await
    }

    pub async fn prev_stage(&self) -> StageId {
        let provider = self.inner.provider.clone();
        self.commit(|state| {
            let previous = state.cursor.current();
            let current = state.cursor.prev();
            state.enter_stage(previous, provider.as_ref());
            current
        })
        .await
    }

    // ========================================================================
    // Actions
    // ========================================================================

    /// Replace the handler set for a stage.
    pub async fn register_stage_actions(&self, stage: StageId, actions: StageActions) {
        self.commit(|state| state.registry.register_stage_actions(stage, actions))
            .await
    }

    pub async fn clear_stage_actions(&self, stage: StageId) -> bool {
        self.inner.state.lock().await.registry.clear_stage(stage)
    }

    /// Invoke a registered action. An unregistered `(stage, name)` is a
    /// silent no-op.
    pub async fn invoke_stage_action(
        &self,
        stage: StageId,
        name: &str,
        payload: Option<Value>,
    ) -> Result<()> {
        self.run_action(stage, name, payload, None).await
    }

    /// Human re-trigger of a stage's primary action after a failure.
    pub async fn retry_stage(&self, stage: StageId) -> Result<()> {
        self.inner.state.lock().await.project.last_error = None;
        info!("Retrying stage {}", stage);
        self.run_action(stage, stage.primary_action(), None, None).await
    }

    /// `ticket` is set when the autopilot started the call. Approval and the
    /// pause epoch are checked again here, because the decision was taken in
    /// an earlier critical section.
    async fn run_action(
        &self,
        stage: StageId,
        name: &str,
        payload: Option<Value>,
        ticket: Option<AutopilotTicket>,
    ) -> Result<()> {
        let (handler, record_id, started_at) = {
            let mut state = self.inner.state.lock().await;
            if let Some(ticket) = &ticket {
                if !state.project.is_approved(stage) || !state.autopilot.is_current(ticket) {
                    info!("Autopilot call {}/{} withdrawn before it started", stage, name);
                    return Ok(());
                }
            }
            let Some(handler) = state.registry.get(stage, name) else {
                debug!("No handler for {}/{}; ignoring", stage, name);
                return Ok(());
            };
            handler.check(&state.project, &state.org)?;
            if name == stage.primary_action() {
                state.autopilot.mark_attempted(stage);
            }

            let record = ActionRecord::pending(stage, name);
            let record_id = record.id.clone();
            let started_at = record.created_at;
            state.project.copilot_mut().actions_taken.push(record);
            let followed = suggestions::mark_followed(&mut state.project, stage, name);
            if followed > 0 {
                debug!("Marked {} suggestion(s) followed for {}/{}", followed, stage, name);
            }
            state.events.push(ProjectEvent::ActionStarted {
                stage,
                action: name.to_string(),
                record: record_id.clone(),
            });
            (handler, record_id, started_at)
        };

        info!("Running action {}/{} ({})", stage, name, record_id.short());
        let ctx = ActionContext {
            pipeline: self.clone(),
            stage,
            action: name.to_string(),
            payload,
        };
        let outcome = handler.run(ctx).await;

        {
            let mut state = self.inner.state.lock().await;
            let status = match &outcome {
                Ok(()) => {
                    if let Some(record) = state.project.find_action_record_mut(&record_id) {
                        record.succeed();
                    }
                    ActionStatus::Success
                }
                Err(e) => {
                    warn!("Action {}/{} failed: {}", stage, name, e);
                    let message = e.to_string();
                    if let Some(record) = state.project.find_action_record_mut(&record_id) {
                        record.fail(message.clone());
                    }
                    state.project.last_error = Some(message.clone());
                    state.raise_exception(
                        stage,
                        exceptions::ACTION_FAILED,
                        &format!("{} failed: {}", name, message),
                        ExceptionPriority::High,
                    );
                    ActionStatus::Error
                }
            };
            metrics::record(&mut state.project, None, stage, name, status, started_at);
            state.events.push(ProjectEvent::ActionFinished {
                stage,
                action: name.to_string(),
                record: record_id,
                status,
            });
        }

        self.settle().await;
        outcome
    }

    // ========================================================================
    // Autopilot
    // ========================================================================

    pub async fn enable_autopilot(&self) {
        self.commit(|state| state.autopilot.enable()).await
    }

    /// Force the autopilot off and back to idle.
    pub async fn pause_autopilot(&self) {
        self.commit(|state| {
            state.autopilot.pause();
            state.events.push(ProjectEvent::AutopilotChanged {
                status: AutopilotStatus::Idle,
            });
        })
        .await
    }

    /// Progress report from an in-flight action. Also feeds a running launch.
    pub async fn report_progress(&self, current: usize, total: usize) {
        let mut state = self.inner.state.lock().await;
        state.autopilot.set_progress(current, total);
        if let Some(run) = state.project.launch.as_mut().filter(|r| r.is_running()) {
            run.progress = Some(AutopilotProgress { current, total });
        }
    }

    /// Re-run the reducer and autopilot without any new mutation.
    pub async fn refresh(&self) {
        self.settle().await
    }

    // ========================================================================
    // Checkpoints
    // ========================================================================

    pub fn checkpoints(&self) -> &CheckpointGate {
        &self.inner.checkpoints
    }

    pub async fn wait_for_checkpoint(&self, step: LaunchStep) -> std::result::Result<bool, CheckpointError> {
        self.inner.checkpoints.wait_for_checkpoint(step).await
    }

    pub fn resolve_checkpoint(&self, proceed: bool) -> bool {
        self.inner.checkpoints.resolve_checkpoint(proceed)
    }

    pub fn pending_checkpoint(&self) -> Option<LaunchStep> {
        self.inner.checkpoints.pending_checkpoint()
    }

    // ========================================================================
    // Copilot chat
    // ========================================================================

    /// Send a user chat message and return the assistant reply. Service
    /// failures degrade to a static apology.
    pub async fn send_chat(&self, message: &str) -> String {
        let system_prompt = {
            let mut state = self.inner.state.lock().await;
            state
                .project
                .copilot_mut()
                .push_message(ChatRole::User, message);
            state.events.push(ProjectEvent::ChatMessageAdded {
                role: ChatRole::User,
            });
            let stage = state.cursor.current();
            format!(
                "You are Genie, a course-authoring copilot. Project: \"{}\". Current stage: {} ({}).",
                state.project.name,
                stage.title(),
                state.project.status(stage)
            )
        };

        let reply = match self
            .inner
            .generation
            .chat_completion(&system_prompt, message)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Chat completion failed: {}", e);
                APOLOGY.to_string()
            }
        };

        self.commit(|state| {
            state
                .project
                .copilot_mut()
                .push_message(ChatRole::Assistant, reply.clone());
            state.events.push(ProjectEvent::ChatMessageAdded {
                role: ChatRole::Assistant,
            });
        })
        .await;
        reply
    }

    async fn post_stage_summary(&self, stage: StageId) {
        let context = {
            let state = self.inner.state.lock().await;
            stage_context(&state.project, stage)
        };
        let summary = match self
            .inner
            .generation
            .chat_completion(SUMMARY_SYSTEM_PROMPT, &context)
            .await
        {
            Ok(text) => format!("{} is complete. {}", stage.title(), text.trim()),
            Err(e) => {
                warn!("Stage summary for {} failed: {}", stage, e);
                APOLOGY.to_string()
            }
        };

        let mut state = self.inner.state.lock().await;
        state
            .project
            .copilot_mut()
            .push_message(ChatRole::Assistant, summary);
        state.events.push(ProjectEvent::ChatMessageAdded {
            role: ChatRole::Assistant,
        });
    }

    // ========================================================================
    // Launch run bookkeeping
    // ========================================================================

    pub(crate) async fn with_state<T>(&self, f: impl FnOnce(&mut PipelineState) -> T) -> T {
        let mut state = self.inner.state.lock().await;
        f(&mut state)
    }

    pub(crate) async fn mutate<T>(&self, f: impl FnOnce(&mut PipelineState) -> T) -> T {
        self.commit(f).await
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Write the current state now, bypassing the quiet period.
    pub async fn flush(&self) -> Result<()> {
        self.schedule_save().await;
        match &self.inner.saver {
            Some(saver) => saver.flush().await,
            None => Ok(()),
        }
    }

    async fn schedule_save(&self) {
        let Some(saver) = &self.inner.saver else {
            return;
        };
        let snapshot = {
            let state = self.inner.state.lock().await;
            ProjectSnapshot::capture(&state.org.org_id, &state.project, state.cursor.current())
        };
        match snapshot {
            Ok(snapshot) => saver.schedule(snapshot),
            Err(e) => warn!("Failed to capture project snapshot: {}", e),
        }
    }

    // ========================================================================
    // Reducer
    // ========================================================================

    async fn commit<T>(&self, f: impl FnOnce(&mut PipelineState) -> T) -> T {
        let out = {
            let mut state = self.inner.state.lock().await;
            f(&mut state)
        };
        self.settle().await;
        out
    }

    fn reduce(&self, state: &mut PipelineState) -> Round {
        let events = state.events.take_pending();
        let mut dirty = false;
        let mut completed = Vec::new();
        for event in &events {
            dirty |= event.touches_document();
            if let ProjectEvent::StageStatusChanged {
                stage,
                status: StageStatus::Completed,
            } = event
            {
                completed.push(*stage);
            }
        }

        let added = self.inner.suggestions.observe(&mut state.project, &state.org);
        if !added.is_empty() {
            dirty = true;
            let keys: Vec<(StageId, String)> = state
                .project
                .copilot
                .iter()
                .flat_map(|c| c.suggestions.iter())
                .filter(|s| added.contains(&s.id))
                .map(|s| (s.stage, s.key()))
                .collect();
            for (stage, key) in keys {
                state.events.push(ProjectEvent::SuggestionAdded { stage, key });
            }
        }

        let before = state.autopilot.status();
        let decision = state
            .autopilot
            .decide(&state.project, &state.org, state.cursor.current());
        let after = state.autopilot.status();
        if before != after {
            debug!("Autopilot {} -> {}", before, after);
            state.events.push(ProjectEvent::AutopilotChanged { status: after });
        }

        let snapshot = if dirty && self.inner.saver.is_some() {
            match ProjectSnapshot::capture(&state.org.org_id, &state.project, state.cursor.current()) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!("Failed to capture project snapshot: {}", e);
                    None
                }
            }
        } else {
            None
        };

        Round {
            snapshot,
            completed,
            decision,
        }
    }

    /// Drain events and step the autopilot until nothing is left to do.
    fn settle(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            loop {
                let round = {
                    let mut state = self.inner.state.lock().await;
                    self.reduce(&mut state)
                };

                if let (Some(saver), Some(snapshot)) = (&self.inner.saver, round.snapshot) {
                    saver.schedule(snapshot);
                }
                for stage in round.completed {
                    self.post_stage_summary(stage).await;
                }

                match round.decision {
                    AutopilotDecision::Invoke {
                        stage,
                        action,
                        ticket,
                    } => {
                        info!("Autopilot invoking {}/{}", stage, action);
                        if let Err(e) = self.run_action(stage, action, None, Some(ticket)).await {
                            warn!("Autopilot action {}/{} failed: {}", stage, action, e);
                        }
                        let mut state = self.inner.state.lock().await;
                        if state.autopilot.finish(ticket) {
                            state.events.push(ProjectEvent::AutopilotChanged {
                                status: AutopilotStatus::Idle,
                            });
                        }
                        continue;
                    }
                    AutopilotDecision::Advance { from, to } => {
                        let provider = self.inner.provider.clone();
                        let mut guard = self.inner.state.lock().await;
                        let state = &mut *guard;
                        if state.cursor.current() == from && state.cursor.select(&state.project, to) {
                            info!("Autopilot advancing {} -> {}", from, to);
                            state.enter_stage(from, provider.as_ref());
                        }
                        continue;
                    }
                    _ => {}
                }

                let more = self.inner.state.lock().await.events.has_pending();
                if !more {
                    break;
                }
            }
        })
    }

    /// Write any queued snapshot, then stop the saver if this is the last
    /// handle.
    pub async fn shutdown(self) -> Result<()> {
        self.flush().await?;
        if let Ok(inner) = Arc::try_unwrap(self.inner) {
            if let Some(saver) = inner.saver {
                saver.shutdown().await;
            }
        }
        Ok(())
    }
}

/// Compact description of a stage's payload for summary prompts.
fn stage_context(project: &Project, stage: StageId) -> String {
    let payload = match stage {
        StageId::Ingest => serde_json::to_value(&project.source_ids).ok(),
        StageId::Analyze => project.analysis.as_ref().and_then(|d| serde_json::to_value(d).ok()),
        StageId::Design => project.design.as_ref().and_then(|d| serde_json::to_value(d).ok()),
        StageId::Develop => project.draft.as_ref().map(|d| {
            serde_json::json!({
                "course_title": d.course_title,
                "modules": d.modules.len(),
                "lessons": d.total_lessons(),
                "warnings": d.warnings,
            })
        }),
        StageId::Implement => project
            .implementation
            .as_ref()
            .and_then(|d| serde_json::to_value(d).ok()),
        StageId::Evaluate => project.evaluation.as_ref().and_then(|d| serde_json::to_value(d).ok()),
    };
    format!(
        "Project \"{}\" finished the {} stage. Data: {}",
        project.name,
        stage.title(),
        payload.unwrap_or(Value::Null)
    )
}
