//! Stage-gated course authoring pipeline.
//!
//! A course project moves through six stages:
//!
//! ```text
//! ingest -> analyze -> design -> develop -> implement -> evaluate
//! ```
//!
//! Each stage has a data-derived completion predicate, a human approval
//! flag, and a registry of named actions. On top of that sit an optional
//! autopilot that invokes approved stages' primary actions, a deduplicated
//! suggestion engine, human checkpoints for the composite launch run, and
//! debounced persistence. Failures and quality findings open entries in a
//! per-project exception queue, and every finished phase leaves a run metric.
//!
//! # Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Pipeline (handle)                                        │
//! │   state lock: Project, OrgSnapshot, StageCursor,         │
//! │               ActionRegistry, AutopilotController,       │
//! │               EventLog                                   │
//! │   reducer:    suggestions -> summaries -> save -> autopilot │
//! ├──────────────────────────────────────────────────────────┤
//! │ CheckpointGate   DebouncedSaver   GenerationService      │
//! │                                   LearningPlatform       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Every mutation goes through [`Pipeline`]. The state lock is never held
//! across an external call; the only suspension points are the checkpoint
//! gate, service calls, and stage handlers.

pub mod actions;
pub mod autopilot;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod events;
pub mod exceptions;
pub mod graph;
pub mod launch;
pub mod metrics;
pub mod org;
pub mod persistence;
pub mod pipeline;
pub mod project;
pub mod services;
pub mod stage;
pub mod stages;
pub mod suggestions;

pub use actions::{action_fn, ActionContext, ActionProvider, ActionRegistry, StageAction, StageActions};
pub use autopilot::{AutopilotController, AutopilotDecision, AutopilotProgress, AutopilotStatus};
pub use checkpoint::{CheckpointError, CheckpointGate};
pub use config::{load_pipeline_config, PipelineConfig};
pub use error::{PipelineError, Result};
pub use events::{LoggedEvent, ProjectEvent};
pub use exceptions::{ExceptionPriority, ExceptionResolution, ExceptionStatus, ProjectException};
pub use launch::{LaunchOutcome, LaunchRun, LaunchRunner, LaunchStatus, LaunchStep};
pub use metrics::RunMetric;
pub use org::{OrgSnapshot, Readiness};
pub use persistence::{DebouncedSaver, JsonFileStore, MemoryStore, ProjectSnapshot, ProjectStore};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineStatus, StageSummary};
pub use project::{Project, ProjectPatch};
pub use services::{GenerationError, GenerationService, LearningPlatform};
pub use stage::{ApprovalState, StageId, StageStatus};
pub use stages::DefaultActions;
pub use suggestions::{SuggestionEngine, SuggestionStats};
