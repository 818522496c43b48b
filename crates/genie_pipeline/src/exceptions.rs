//! Exception queue: problems on a project that need a human decision.
//!
//! Failed actions, failed launch steps and quality-gate findings each open an
//! entry. A human closes it by resolving, rejecting or overriding it; closed
//! entries are kept for the audit trail. While an entry is open, raising the
//! same `(stage, reason_code, message)` again is a no-op.

use crate::error::{PipelineError, Result};
use crate::project::Project;
use crate::stage::StageId;
use chrono::serde::{ts_milliseconds, ts_milliseconds_option};
use chrono::{DateTime, Utc};
use genie_ids::ExceptionId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

/// A stage action returned an error.
pub const ACTION_FAILED: &str = "action_failed";
/// A launch run stopped on a failing step.
pub const LAUNCH_FAILED: &str = "launch_failed";
/// The draft or its assessments did not pass the quality gate.
pub const QUALITY_WARNING: &str = "quality_warning";

/// Most entries a listing returns, newest first.
pub const MAX_LISTED_EXCEPTIONS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionStatus {
    #[default]
    Open,
    Resolved,
    Rejected,
    Overridden,
}

impl ExceptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExceptionStatus::Open => "open",
            ExceptionStatus::Resolved => "resolved",
            ExceptionStatus::Rejected => "rejected",
            ExceptionStatus::Overridden => "overridden",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, ExceptionStatus::Open)
    }
}

impl fmt::Display for ExceptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Error, Clone)]
#[error("invalid exception status: {0} (expected one of open, resolved, rejected, overridden)")]
pub struct ExceptionStatusParseError(String);

impl std::str::FromStr for ExceptionStatus {
    type Err = ExceptionStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(ExceptionStatus::Open),
            "resolved" => Ok(ExceptionStatus::Resolved),
            "rejected" => Ok(ExceptionStatus::Rejected),
            "overridden" => Ok(ExceptionStatus::Overridden),
            _ => Err(ExceptionStatusParseError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionPriority {
    Low,
    #[default]
    Normal,
    High,
}

impl ExceptionPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExceptionPriority::Low => "low",
            ExceptionPriority::Normal => "normal",
            ExceptionPriority::High => "high",
        }
    }
}

impl fmt::Display for ExceptionPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a human closes an open exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionResolution {
    /// The underlying problem was fixed.
    Resolve,
    /// The exception is not a real problem.
    Reject,
    /// Accept the problem and carry on anyway.
    Override,
}

impl ExceptionResolution {
    pub fn status(&self) -> ExceptionStatus {
        match self {
            ExceptionResolution::Resolve => ExceptionStatus::Resolved,
            ExceptionResolution::Reject => ExceptionStatus::Rejected,
            ExceptionResolution::Override => ExceptionStatus::Overridden,
        }
    }
}

impl std::str::FromStr for ExceptionResolution {
    type Err = ExceptionStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "resolve" => Ok(ExceptionResolution::Resolve),
            "reject" => Ok(ExceptionResolution::Reject),
            "override" => Ok(ExceptionResolution::Override),
            _ => Err(ExceptionStatusParseError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectException {
    pub id: ExceptionId,
    pub stage: StageId,
    pub reason_code: String,
    pub reason_message: String,
    #[serde(default)]
    pub status: ExceptionStatus,
    #[serde(default)]
    pub priority: ExceptionPriority,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "ts_milliseconds_option", skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_notes: Option<String>,
}

impl ProjectException {
    fn same_problem(&self, stage: StageId, reason_code: &str, message: &str) -> bool {
        self.stage == stage && self.reason_code == reason_code && self.reason_message == message
    }
}

/// Open an exception unless an identical one is still open.
pub fn raise(
    project: &mut Project,
    stage: StageId,
    reason_code: &str,
    message: &str,
    priority: ExceptionPriority,
) -> Option<ExceptionId> {
    if project
        .exceptions
        .iter()
        .any(|e| e.status.is_open() && e.same_problem(stage, reason_code, message))
    {
        debug!("Exception {}/{} already open", stage, reason_code);
        return None;
    }

    let exception = ProjectException {
        id: ExceptionId::new(),
        stage,
        reason_code: reason_code.to_string(),
        reason_message: message.to_string(),
        status: ExceptionStatus::Open,
        priority,
        created_at: Utc::now(),
        resolved_at: None,
        resolved_by: None,
        resolution_notes: None,
    };
    let id = exception.id.clone();
    info!("Exception {} raised at {}: {}", id.short(), stage, message);
    project.exceptions.push(exception);
    Some(id)
}

/// Close an open exception.
///
/// Returns false (and changes nothing) when it was already closed. An
/// unknown id is a [`PipelineError::NotFound`].
pub fn resolve(
    project: &mut Project,
    id: &ExceptionId,
    resolution: ExceptionResolution,
    by: &str,
    notes: Option<&str>,
) -> Result<bool> {
    let exception = project
        .exceptions
        .iter_mut()
        .find(|e| &e.id == id)
        .ok_or_else(|| PipelineError::NotFound(format!("exception {}", id)))?;
    if !exception.status.is_open() {
        return Ok(false);
    }

    exception.status = resolution.status();
    exception.resolved_at = Some(Utc::now());
    exception.resolved_by = Some(by.to_string());
    exception.resolution_notes = notes.map(str::trim).filter(|n| !n.is_empty()).map(String::from);
    info!("Exception {} {} by {}", id.short(), exception.status, by);
    Ok(true)
}

/// Newest first, optionally filtered by status.
pub fn list(project: &Project, status: Option<ExceptionStatus>) -> Vec<ProjectException> {
    project
        .exceptions
        .iter()
        .rev()
        .filter(|e| status.map_or(true, |s| e.status == s))
        .take(MAX_LISTED_EXCEPTIONS)
        .cloned()
        .collect()
}

pub fn open_count(project: &Project) -> usize {
    project.exceptions.iter().filter(|e| e.status.is_open()).count()
}
