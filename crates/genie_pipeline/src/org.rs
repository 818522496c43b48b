//! Read-only organizational data and per-stage readiness.
//!
//! The pipeline never writes this data. Each collection is loaded
//! independently; `None` means "not loaded yet", which is different from
//! "loaded and empty".

use crate::graph;
use crate::project::Project;
use crate::stage::StageId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Department {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Team {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrollment {
    pub member_id: String,
    pub course_id: String,
}

/// An uploaded or linked content source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Snapshot of the organization the project belongs to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrgSnapshot {
    pub org_id: String,
    #[serde(default)]
    pub members: Option<Vec<Member>>,
    #[serde(default)]
    pub departments: Option<Vec<Department>>,
    #[serde(default)]
    pub teams: Option<Vec<Team>>,
    #[serde(default)]
    pub enrollments: Option<Vec<Enrollment>>,
    #[serde(default)]
    pub sources: Option<Vec<SourceDocument>>,
}

impl OrgSnapshot {
    pub fn new(org_id: impl Into<String>) -> Self {
        Self {
            org_id: org_id.into(),
            ..Default::default()
        }
    }

    /// Members, departments, and teams have all been loaded.
    pub fn people_loaded(&self) -> bool {
        self.members.is_some() && self.departments.is_some() && self.teams.is_some()
    }

    pub fn members(&self) -> &[Member] {
        self.members.as_deref().unwrap_or(&[])
    }

    pub fn sources(&self) -> &[SourceDocument] {
        self.sources.as_deref().unwrap_or(&[])
    }

    /// Source documents the project has selected, in org order.
    pub fn selected_sources<'a>(&'a self, project: &'a Project) -> Vec<&'a SourceDocument> {
        self.sources()
            .iter()
            .filter(|s| project.source_ids.contains(&s.id))
            .collect()
    }

    /// Members matched by any of the project's enrollment rules.
    pub fn members_matching<'a>(
        &'a self,
        rules: &'a [crate::project::EnrollmentRule],
    ) -> Vec<&'a Member> {
        use crate::project::EnrollmentTarget;

        self.members()
            .iter()
            .filter(|member| {
                rules.iter().any(|rule| match &rule.target {
                    EnrollmentTarget::Everyone => true,
                    EnrollmentTarget::Department { id } => {
                        member.department_id.as_deref() == Some(id.as_str())
                    }
                    EnrollmentTarget::Team { id } => member.team_id.as_deref() == Some(id.as_str()),
                    EnrollmentTarget::Member { id } => &member.id == id,
                })
            })
            .collect()
    }
}

/// Readiness predicates: may the stage's primary action run right now?
///
/// Readiness is separate from completion; a stage can be ready long before it
/// holds enough data to complete.
pub fn is_stage_ready(project: &Project, org: &OrgSnapshot, stage: StageId) -> bool {
    match stage {
        StageId::Ingest => can_ingest(project),
        StageId::Analyze => can_analyze(project, org),
        StageId::Design => can_design(project),
        StageId::Develop => can_develop(project),
        StageId::Implement => can_implement(project, org),
        StageId::Evaluate => can_evaluate(project),
    }
}

pub fn can_ingest(project: &Project) -> bool {
    !project.source_ids.is_empty()
}

pub fn can_analyze(project: &Project, org: &OrgSnapshot) -> bool {
    !project.source_ids.is_empty() && org.people_loaded()
}

pub fn can_design(project: &Project) -> bool {
    graph::is_stage_complete(project, StageId::Analyze)
}

pub fn can_develop(project: &Project) -> bool {
    project
        .design
        .as_ref()
        .is_some_and(|d| d.total_lessons() > 0)
        && graph::is_stage_complete(project, StageId::Design)
}

pub fn can_implement(project: &Project, org: &OrgSnapshot) -> bool {
    graph::is_stage_complete(project, StageId::Develop)
        && org.members.is_some()
        && project
            .implementation
            .as_ref()
            .is_some_and(|i| !i.enrollment_rules.is_empty())
}

pub fn can_evaluate(project: &Project) -> bool {
    project
        .implementation
        .as_ref()
        .is_some_and(|i| i.course_id.is_some())
}

/// All readiness flags at once, for status output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Readiness {
    pub ingest: bool,
    pub analyze: bool,
    pub design: bool,
    pub develop: bool,
    pub implement: bool,
    pub evaluate: bool,
}

impl Readiness {
    pub fn evaluate(project: &Project, org: &OrgSnapshot) -> Self {
        Self {
            ingest: can_ingest(project),
            analyze: can_analyze(project, org),
            design: can_design(project),
            develop: can_develop(project),
            implement: can_implement(project, org),
            evaluate: can_evaluate(project),
        }
    }

    pub fn get(&self, stage: StageId) -> bool {
        match stage {
            StageId::Ingest => self.ingest,
            StageId::Analyze => self.analyze,
            StageId::Design => self.design,
            StageId::Develop => self.develop,
            StageId::Implement => self.implement,
            StageId::Evaluate => self.evaluate,
        }
    }
}
