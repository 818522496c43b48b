//! Stage identifiers and per-stage status enums.
//!
//! The six stages run in a fixed total order modeled on ADDIE, with an
//! ingest step in front:
//!
//! ```text
//! ingest -> analyze -> design -> develop -> implement -> evaluate
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// Stage ID
// ============================================================================

/// One of the six ordered pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    /// Select and confirm content sources
    Ingest,
    /// Audience and learning-needs analysis
    Analyze,
    /// Course title, objectives, module plan, instructional tactics
    Design,
    /// Lesson-by-lesson content generation into the draft
    Develop,
    /// Course creation, enrollment rules, scheduling
    Implement,
    /// Tracking metrics and review
    Evaluate,
}

impl StageId {
    pub const ALL: [StageId; 6] = [
        StageId::Ingest,
        StageId::Analyze,
        StageId::Design,
        StageId::Develop,
        StageId::Implement,
        StageId::Evaluate,
    ];

    pub fn first() -> StageId {
        StageId::Ingest
    }

    pub fn last() -> StageId {
        StageId::Evaluate
    }

    /// Get the canonical string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Ingest => "ingest",
            StageId::Analyze => "analyze",
            StageId::Design => "design",
            StageId::Develop => "develop",
            StageId::Implement => "implement",
            StageId::Evaluate => "evaluate",
        }
    }

    /// Human-readable title for prompts and CLI output.
    pub fn title(&self) -> &'static str {
        match self {
            StageId::Ingest => "Ingest",
            StageId::Analyze => "Analyze",
            StageId::Design => "Design",
            StageId::Develop => "Develop",
            StageId::Implement => "Implement",
            StageId::Evaluate => "Evaluate",
        }
    }

    /// Zero-based position in the stage order.
    pub fn index(&self) -> usize {
        match self {
            StageId::Ingest => 0,
            StageId::Analyze => 1,
            StageId::Design => 2,
            StageId::Develop => 3,
            StageId::Implement => 4,
            StageId::Evaluate => 5,
        }
    }

    pub fn is_first(&self) -> bool {
        *self == StageId::first()
    }

    /// The following stage, or `None` past the last stage.
    pub fn next(&self) -> Option<StageId> {
        StageId::ALL.get(self.index() + 1).copied()
    }

    /// The preceding stage, or `None` before the first stage.
    pub fn prev(&self) -> Option<StageId> {
        self.index()
            .checked_sub(1)
            .and_then(|idx| StageId::ALL.get(idx).copied())
    }

    /// Name of the action the autopilot invokes for this stage.
    pub fn primary_action(&self) -> &'static str {
        use crate::actions::names;
        match self {
            StageId::Ingest => names::CONFIRM_SOURCES,
            StageId::Analyze => names::RUN_ANALYSIS,
            StageId::Design => names::GENERATE_DESIGN,
            StageId::Develop => names::GENERATE_LESSONS,
            StageId::Implement => names::DEPLOY,
            StageId::Evaluate => names::CONFIGURE_TRACKING,
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error when parsing a StageId from string.
#[derive(Debug, Error, Clone)]
#[error("invalid stage: {0} (expected one of ingest, analyze, design, develop, implement, evaluate)")]
pub struct StageParseError(String);

impl std::str::FromStr for StageId {
    type Err = StageParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ingest" => Ok(StageId::Ingest),
            "analyze" | "analysis" => Ok(StageId::Analyze),
            "design" => Ok(StageId::Design),
            "develop" | "development" => Ok(StageId::Develop),
            "implement" | "implementation" => Ok(StageId::Implement),
            "evaluate" | "evaluation" => Ok(StageId::Evaluate),
            _ => Err(StageParseError(s.to_string())),
        }
    }
}

// ============================================================================
// Stage Status
// ============================================================================

/// Progress of a single stage.
///
/// Ordered: `Pending < InProgress < Completed`. Status only moves forward;
/// nothing in the pipeline un-completes a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::InProgress => "in_progress",
            StageStatus::Completed => "completed",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, StageStatus::Completed)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Approval State
// ============================================================================

/// Human gate authorizing the autopilot to act on a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    #[default]
    Unapproved,
    Approved,
}

impl ApprovalState {
    pub fn is_approved(&self) -> bool {
        matches!(self, ApprovalState::Approved)
    }
}

impl fmt::Display for ApprovalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalState::Unapproved => write!(f, "unapproved"),
            ApprovalState::Approved => write!(f, "approved"),
        }
    }
}
