//! Built-in stage handlers.
//!
//! Each stage module exposes its primary action as a [`StageAction`] plus the
//! plain async functions behind it, which the launch run reuses.
//!
//! [`StageAction`]: crate::actions::StageAction

pub mod analyze;
pub mod design;
pub mod develop;
pub mod evaluate;
pub mod implement;
pub mod ingest;

use crate::actions::{names, ActionProvider, StageActions};
use crate::events::ProjectEvent;
use crate::pipeline::Pipeline;
use crate::project::{DraftData, ImplementationData, ProjectField};
use crate::stage::StageId;
use std::sync::Arc;

/// Registers the built-in handlers for whichever stage is active.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultActions;

impl ActionProvider for DefaultActions {
    fn actions_for(&self, stage: StageId) -> StageActions {
        match stage {
            StageId::Ingest => {
                StageActions::new().with(names::CONFIRM_SOURCES, Arc::new(ingest::ConfirmSources))
            }
            StageId::Analyze => {
                StageActions::new().with(names::RUN_ANALYSIS, Arc::new(analyze::RunAnalysis))
            }
            StageId::Design => {
                StageActions::new().with(names::GENERATE_DESIGN, Arc::new(design::GenerateDesign))
            }
            StageId::Develop => {
                StageActions::new().with(names::GENERATE_LESSONS, Arc::new(develop::GenerateLessons))
            }
            StageId::Implement => StageActions::new()
                .with(names::DEPLOY, Arc::new(implement::Deploy))
                .with(names::SCHEDULE_ENROLLMENT, Arc::new(implement::ScheduleEnrollment)),
            StageId::Evaluate => StageActions::new()
                .with(names::CONFIGURE_TRACKING, Arc::new(evaluate::ConfigureTracking)),
        }
    }
}

/// Edit the draft in place. Returns false when there is no draft.
pub(crate) async fn edit_draft(pipeline: &Pipeline, edit: impl FnOnce(&mut DraftData) + Send) -> bool {
    pipeline
        .mutate(|state| {
            let Some(draft) = state.project.draft.as_mut() else {
                return false;
            };
            edit(draft);
            state.events.push(ProjectEvent::ProjectUpdated {
                fields: vec![ProjectField::Draft],
            });
            true
        })
        .await
}

/// Edit the implementation record, creating an empty one if needed.
pub(crate) async fn edit_implementation(
    pipeline: &Pipeline,
    edit: impl FnOnce(&mut ImplementationData) + Send,
) {
    pipeline
        .mutate(|state| {
            edit(state.project.implementation.get_or_insert_with(Default::default));
            state.events.push(ProjectEvent::ProjectUpdated {
                fields: vec![ProjectField::Implementation],
            });
        })
        .await
}
