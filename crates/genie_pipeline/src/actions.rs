//! Stage action registry.
//!
//! A per-stage capability table: `stage -> action name -> handler`.
//! Registering a stage replaces its whole handler set, and invoking a name
//! that is not registered is a silent no-op.

use crate::error::Result;
use crate::org::OrgSnapshot;
use crate::pipeline::Pipeline;
use crate::project::Project;
use crate::stage::StageId;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Well-known action names.
pub mod names {
    pub const CONFIRM_SOURCES: &str = "confirm_sources";
    pub const RUN_ANALYSIS: &str = "run_analysis";
    pub const GENERATE_DESIGN: &str = "generate_design";
    pub const GENERATE_LESSONS: &str = "generate_lessons";
    pub const DEPLOY: &str = "deploy";
    pub const SCHEDULE_ENROLLMENT: &str = "schedule_enrollment";
    pub const CONFIGURE_TRACKING: &str = "configure_tracking";
}

/// Everything a handler gets when invoked.
#[derive(Clone)]
pub struct ActionContext {
    pub pipeline: Pipeline,
    pub stage: StageId,
    pub action: String,
    pub payload: Option<Value>,
}

impl fmt::Debug for ActionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionContext")
            .field("stage", &self.stage)
            .field("action", &self.action)
            .field("payload", &self.payload)
            .finish()
    }
}

/// A named operation a stage exposes.
///
/// Handlers may be re-invoked by the autopilot, so they should tolerate
/// running more than once.
#[async_trait]
pub trait StageAction: Send + Sync {
    /// Readiness check run before anything is recorded. An error here means
    /// the invocation changes no state.
    fn check(&self, _project: &Project, _org: &OrgSnapshot) -> Result<()> {
        Ok(())
    }

    async fn run(&self, ctx: ActionContext) -> Result<()>;
}

/// Adapter turning an async closure into a [`StageAction`].
pub struct FnAction<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> StageAction for FnAction<F>
where
    F: Fn(ActionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn run(&self, ctx: ActionContext) -> Result<()> {
        (self.f)(ctx).await
    }
}

pub fn action_fn<F, Fut>(f: F) -> Arc<dyn StageAction>
where
    F: Fn(ActionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnAction { f })
}

/// The handler set one stage registers.
#[derive(Clone, Default)]
pub struct StageActions {
    handlers: HashMap<String, Arc<dyn StageAction>>,
}

impl StageActions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, handler: Arc<dyn StageAction>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn with_fn<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.with(name, action_fn(f))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for StageActions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("StageActions").field("names", &names).finish()
    }
}

/// Supplies the handler set for a stage when it becomes the active stage.
pub trait ActionProvider: Send + Sync {
    fn actions_for(&self, stage: StageId) -> StageActions;
}

/// Registry of stage action handlers.
#[derive(Default)]
pub struct ActionRegistry {
    stages: HashMap<StageId, HashMap<String, Arc<dyn StageAction>>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entire handler set for `stage`. No merging across calls.
    pub fn register_stage_actions(&mut self, stage: StageId, actions: StageActions) {
        debug!(
            "Registering {} action(s) for stage {}",
            actions.len(),
            stage
        );
        if actions.is_empty() {
            self.stages.remove(&stage);
        } else {
            self.stages.insert(stage, actions.handlers);
        }
    }

    /// Drop every handler for `stage`. Returns true if anything was registered.
    pub fn clear_stage(&mut self, stage: StageId) -> bool {
        let removed = self.stages.remove(&stage).is_some();
        if removed {
            debug!("Cleared actions for stage {}", stage);
        }
        removed
    }

    pub fn get(&self, stage: StageId, name: &str) -> Option<Arc<dyn StageAction>> {
        self.stages
            .get(&stage)
            .and_then(|handlers| handlers.get(name))
            .cloned()
    }

    pub fn has_action(&self, stage: StageId, name: &str) -> bool {
        self.stages
            .get(&stage)
            .is_some_and(|handlers| handlers.contains_key(name))
    }

    /// Registered action names for a stage, sorted.
    pub fn action_names(&self, stage: StageId) -> Vec<String> {
        let mut names: Vec<String> = self
            .stages
            .get(&stage)
            .map(|handlers| handlers.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for stage in StageId::ALL {
            if self.stages.contains_key(&stage) {
                map.entry(&stage, &self.action_names(stage));
            }
        }
        map.finish()
    }
}
