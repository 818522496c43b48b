//! Next-best-action suggestions.
//!
//! A fixed rule set is evaluated after every committed change. Each emitted
//! suggestion is keyed by `(stage, action ?? message)` and the key is
//! persisted on the project, so a rule fires at most once per project even
//! across reloads.

use crate::actions::names;
use crate::graph;
use crate::org::{self, OrgSnapshot};
use crate::project::{ChatRole, Project, Suggestion};
use crate::stage::StageId;
use chrono::Utc;
use genie_ids::SuggestionId;
use serde::Serialize;
use tracing::debug;

/// Append a suggestion plus the matching assistant chat message.
///
/// No-op (returns `None`) when the dedup key was already emitted.
pub fn add_suggestion(
    project: &mut Project,
    stage: StageId,
    message: &str,
    action: Option<&str>,
) -> Option<SuggestionId> {
    let key = Suggestion::dedup_key(stage, message, action);
    if !project.suggestion_keys.insert(key.clone()) {
        return None;
    }

    let suggestion = Suggestion {
        id: SuggestionId::new(),
        stage,
        message: message.to_string(),
        action: action.map(String::from),
        created_at: Utc::now(),
        followed: false,
    };
    let id = suggestion.id.clone();
    debug!("Suggestion {} ({})", key, id.short());

    let copilot = project.copilot_mut();
    copilot.suggestions.push(suggestion);
    copilot.push_message(ChatRole::Assistant, message);
    Some(id)
}

/// Flag every unfollowed suggestion for `(stage, action)` as followed.
///
/// Returns how many changed.
pub fn mark_followed(project: &mut Project, stage: StageId, action: &str) -> usize {
    let Some(copilot) = project.copilot.as_mut() else {
        return 0;
    };
    let mut changed = 0;
    for suggestion in copilot
        .suggestions
        .iter_mut()
        .filter(|s| s.stage == stage && s.action.as_deref() == Some(action) && !s.followed)
    {
        suggestion.followed = true;
        changed += 1;
    }
    changed
}

/// Followed-vs-ignored counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SuggestionStats {
    pub emitted: usize,
    pub followed: usize,
    pub ignored: usize,
}

pub fn stats(project: &Project) -> SuggestionStats {
    let suggestions = project
        .copilot
        .as_ref()
        .map(|c| c.suggestions.as_slice())
        .unwrap_or(&[]);
    let followed = suggestions.iter().filter(|s| s.followed).count();
    SuggestionStats {
        emitted: suggestions.len(),
        followed,
        ignored: suggestions.len() - followed,
    }
}

/// One reactive rule.
pub struct SuggestionRule {
    pub stage: StageId,
    pub message: &'static str,
    pub action: Option<&'static str>,
    pub when: fn(&Project, &OrgSnapshot) -> bool,
}

/// The rule set, evaluated in order.
pub struct SuggestionEngine {
    rules: Vec<SuggestionRule>,
}

impl Default for SuggestionEngine {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

impl SuggestionEngine {
    pub fn new(rules: Vec<SuggestionRule>) -> Self {
        Self { rules }
    }

    /// Evaluate every rule against the current state. Returns the ids of the
    /// suggestions that were actually added.
    pub fn observe(&self, project: &mut Project, org: &OrgSnapshot) -> Vec<SuggestionId> {
        let firing: Vec<&SuggestionRule> = self
            .rules
            .iter()
            .filter(|rule| (rule.when)(project, org))
            .collect();

        firing
            .into_iter()
            .filter_map(|rule| add_suggestion(project, rule.stage, rule.message, rule.action))
            .collect()
    }
}

fn default_rules() -> Vec<SuggestionRule> {
    vec![
        SuggestionRule {
            stage: StageId::Ingest,
            message: "Pick at least one content source so I can start building the course.",
            action: None,
            when: |project, org| project.source_ids.is_empty() && !org.sources().is_empty(),
        },
        SuggestionRule {
            stage: StageId::Analyze,
            message: "Your sources are in. Want me to run the audience and needs analysis?",
            action: Some(names::RUN_ANALYSIS),
            when: |project, org| project.analysis.is_none() && org::can_analyze(project, org),
        },
        SuggestionRule {
            stage: StageId::Design,
            message: "The analysis is done. I can draft objectives and a module plan next.",
            action: Some(names::GENERATE_DESIGN),
            when: |project, _| project.design.is_none() && org::can_design(project),
        },
        SuggestionRule {
            stage: StageId::Design,
            message: "Some modules still need an active-learning and a multimedia tactic.",
            action: None,
            when: |project, _| {
                project
                    .design
                    .as_ref()
                    .is_some_and(|d| !graph::modules_missing_tactics(d).is_empty())
            },
        },
        SuggestionRule {
            stage: StageId::Develop,
            message: "The design is ready. Shall I generate the lesson content?",
            action: Some(names::GENERATE_LESSONS),
            when: |project, _| {
                org::can_develop(project) && !graph::is_stage_complete(project, StageId::Develop)
            },
        },
        SuggestionRule {
            stage: StageId::Implement,
            message: "Enrollment rules are set but there are no dates yet. Want me to schedule the rollout?",
            action: Some(names::SCHEDULE_ENROLLMENT),
            when: |project, _| {
                project
                    .implementation
                    .as_ref()
                    .is_some_and(|i| !i.enrollment_rules.is_empty() && !i.has_schedule())
            },
        },
        SuggestionRule {
            stage: StageId::Evaluate,
            message: "The course is live. Pick the metrics you want to track.",
            action: Some(names::CONFIGURE_TRACKING),
            when: |project, _| {
                org::can_evaluate(project)
                    && project.evaluation.as_ref().map_or(true, |e| e.metrics.is_empty())
            },
        },
    ]
}
