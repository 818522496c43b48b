//! Stage graph: completion predicates, accessibility, and navigation.
//!
//! Accessibility only looks at the predecessor's `stage_status`, and status
//! never moves backwards, so once a stage is accessible it stays accessible.

use crate::project::{DesignData, Project};
use crate::stage::StageId;
use serde::{Deserialize, Serialize};

/// Whether `stage` holds the minimum data required to be marked completed.
///
/// Only presence of key fields is checked; content is never interpreted.
pub fn is_stage_complete(project: &Project, stage: StageId) -> bool {
    match stage {
        StageId::Ingest => !project.source_ids.is_empty(),
        StageId::Analyze => project.analysis.as_ref().is_some_and(|a| {
            !a.target_audience.trim().is_empty() && !a.learning_needs.is_empty()
        }),
        StageId::Design => project.design.as_ref().is_some_and(design_is_complete),
        StageId::Develop => project.draft.as_ref().is_some_and(|draft| {
            let total = draft.total_lessons();
            total > 0 && draft.generated_lessons() == total
        }),
        StageId::Implement => project.implementation.as_ref().is_some_and(|imp| {
            imp.course_id.is_some() && !imp.enrollment_rules.is_empty()
        }),
        StageId::Evaluate => project
            .evaluation
            .as_ref()
            .is_some_and(|e| !e.metrics.is_empty()),
    }
}

/// Title, objectives, modules, and full tactic coverage on every module.
fn design_is_complete(design: &DesignData) -> bool {
    !design.course_title.trim().is_empty()
        && !design.objectives.is_empty()
        && !design.modules.is_empty()
        && design
            .modules
            .iter()
            .all(|m| !m.active_learning.is_empty() && !m.multimedia.is_empty())
}

/// Design modules still missing an active-learning or multimedia tactic.
pub fn modules_missing_tactics(design: &DesignData) -> Vec<&str> {
    design
        .modules
        .iter()
        .filter(|m| m.active_learning.is_empty() || m.multimedia.is_empty())
        .map(|m| m.title.as_str())
        .collect()
}

/// True for the first stage, or when the preceding stage is completed.
pub fn is_stage_accessible(project: &Project, stage: StageId) -> bool {
    match stage.prev() {
        None => true,
        Some(prev) => project.status(prev).is_completed(),
    }
}

/// Stages the user may currently navigate to.
pub fn accessible_stages(project: &Project) -> Vec<StageId> {
    StageId::ALL
        .into_iter()
        .filter(|s| is_stage_accessible(project, *s))
        .collect()
}

/// Currently selected stage.
///
/// `next`/`prev` are pure sequence navigation. `select` is the direct
/// jump and is refused when the target is not accessible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCursor {
    current: StageId,
}

impl Default for StageCursor {
    fn default() -> Self {
        Self {
            current: StageId::first(),
        }
    }
}

impl StageCursor {
    pub fn new(current: StageId) -> Self {
        Self { current }
    }

    pub fn current(&self) -> StageId {
        self.current
    }

    /// Move forward one stage. No-op at the last stage.
    pub fn next(&mut self) -> StageId {
        if let Some(next) = self.current.next() {
            self.current = next;
        }
        self.current
    }

    /// Move back one stage. No-op at the first stage.
    pub fn prev(&mut self) -> StageId {
        if let Some(prev) = self.current.prev() {
            self.current = prev;
        }
        self.current
    }

    /// Jump to `stage` if accessible. Returns false and stays put otherwise.
    pub fn select(&mut self, project: &Project, stage: StageId) -> bool {
        if !is_stage_accessible(project, stage) {
            return false;
        }
        self.current = stage;
        true
    }
}
