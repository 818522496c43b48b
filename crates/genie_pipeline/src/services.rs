//! External collaborators consumed by the pipeline.
//!
//! Both traits are opaque async services. The pipeline never retries a call;
//! it validates output shape, falls back where a fallback exists, and
//! otherwise reports the failure to the caller.

use crate::org::SourceDocument;
use crate::project::{DraftData, LessonType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Static reply used whenever a chat completion fails.
pub const APOLOGY: &str =
    "Sorry, I couldn't reach the assistant just now. Your project is unchanged; please try again.";

/// Errors reported by the generation service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    /// The service answered, but the output failed a shape check.
    #[error("malformed generation output: {0}")]
    Malformed(String),

    /// The service could not be reached or refused the request.
    #[error("generation service unavailable: {0}")]
    Unavailable(String),
}

/// One module of a generated outline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlineModule {
    pub title: String,
    #[serde(default)]
    pub lessons: Vec<OutlineLesson>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlineLesson {
    pub title: String,
    #[serde(default, rename = "type")]
    pub lesson_type: LessonType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_required: Option<bool>,
}

/// Input for a single lesson generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct LessonRequest {
    pub course_title: String,
    pub module_title: String,
    pub lesson_title: String,
    pub lesson_type: LessonType,
    pub sources: Vec<SourceDocument>,
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonContent {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_required: Option<bool>,
}

/// AI content generation.
#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn generate_objectives(
        &self,
        sources: &[SourceDocument],
        context: &str,
        count: usize,
    ) -> Result<Vec<String>, GenerationError>;

    async fn generate_outline(
        &self,
        title: &str,
        sources: &[SourceDocument],
        prompt: Option<&str>,
    ) -> Result<Vec<OutlineModule>, GenerationError>;

    async fn generate_lesson_content(
        &self,
        request: &LessonRequest,
    ) -> Result<LessonContent, GenerationError>;

    async fn chat_completion(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, GenerationError>;
}

/// Reject outlines with no modules, or with any module that has no lessons.
pub fn validate_outline(modules: &[OutlineModule]) -> Result<(), GenerationError> {
    if modules.is_empty() {
        return Err(GenerationError::Malformed("outline has no modules".to_string()));
    }
    for (idx, module) in modules.iter().enumerate() {
        if module.title.trim().is_empty() {
            return Err(GenerationError::Malformed(format!(
                "module {} has an empty title",
                idx + 1
            )));
        }
        if module.lessons.is_empty() {
            return Err(GenerationError::Malformed(format!(
                "module \"{}\" has no lessons",
                module.title
            )));
        }
    }
    Ok(())
}

/// Deterministic placeholder objectives used when generation fails.
pub fn fallback_objectives(topic: &str, count: usize) -> Vec<String> {
    const STEMS: [&str; 6] = [
        "Explain the core concepts of",
        "Apply the key procedures of",
        "Analyze common situations involving",
        "Evaluate outcomes related to",
        "Identify the tools and resources for",
        "Practice day-to-day tasks in",
    ];
    let topic = if topic.trim().is_empty() {
        "the course topic"
    } else {
        topic.trim()
    };
    (0..count.max(1))
        .map(|i| format!("{} {}", STEMS[i % STEMS.len()], topic))
        .collect()
}

/// Assessment created on the learning platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedAssessment {
    pub id: String,
    pub title: String,
    pub question_count: usize,
}

/// Writes to the organization's learning platform.
///
/// These are the only calls that change organizational data, and they are
/// only ever made from stage actions.
#[async_trait]
pub trait LearningPlatform: Send + Sync {
    /// Index the selected sources. Returns the number of chunks stored.
    async fn ingest_sources(&self, org_id: &str, sources: &[SourceDocument]) -> anyhow::Result<usize>;

    /// Create (or reuse) a course for the draft. Returns the course id.
    async fn create_course(&self, org_id: &str, draft: &DraftData) -> anyhow::Result<String>;

    async fn create_assessments(
        &self,
        course_id: &str,
        draft: &DraftData,
    ) -> anyhow::Result<Vec<CreatedAssessment>>;

    /// Enroll members. Returns how many new enrollments were created.
    async fn enroll(&self, course_id: &str, member_ids: &[String], required: bool) -> anyhow::Result<usize>;

    /// Notify members about the course. Returns how many were notified.
    async fn notify(&self, course_id: &str, member_ids: &[String]) -> anyhow::Result<usize>;
}
