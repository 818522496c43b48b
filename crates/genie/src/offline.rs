//! Offline backends: deterministic generation and a local learning platform.
//!
//! Nothing here leaves the machine. Output is a pure function of the inputs,
//! so repeated runs over the same project produce the same course.

use async_trait::async_trait;
use genie_pipeline::org::SourceDocument;
use genie_pipeline::project::{DraftData, LessonType};
use genie_pipeline::services::{
    CreatedAssessment, GenerationError, GenerationService, LearningPlatform, LessonContent,
    LessonRequest, OutlineLesson, OutlineModule,
};
use tracing::info;

const OBJECTIVE_STEMS: [&str; 5] = [
    "Describe",
    "Apply the guidance in",
    "Recognize common mistakes around",
    "Find the right resources for",
    "Explain to a colleague",
];

const EXCERPT_CHARS: usize = 280;

/// Template-driven stand-in for an AI generation service.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateGenerator;

#[async_trait]
impl GenerationService for TemplateGenerator {
    async fn generate_objectives(
        &self,
        sources: &[SourceDocument],
        context: &str,
        count: usize,
    ) -> Result<Vec<String>, GenerationError> {
        let topics: Vec<&str> = if sources.is_empty() {
            vec![context.trim()]
        } else {
            sources.iter().map(|s| s.title.trim()).collect()
        };
        Ok((0..count)
            .map(|i| {
                format!(
                    "{} {}",
                    OBJECTIVE_STEMS[i % OBJECTIVE_STEMS.len()],
                    topics[i % topics.len()]
                )
            })
            .collect())
    }

    async fn generate_outline(
        &self,
        title: &str,
        sources: &[SourceDocument],
        _prompt: Option<&str>,
    ) -> Result<Vec<OutlineModule>, GenerationError> {
        let mut modules: Vec<OutlineModule> = if sources.is_empty() {
            vec![topic_module(title)]
        } else {
            sources.iter().map(|s| topic_module(&s.title)).collect()
        };
        modules.push(OutlineModule {
            title: "Review".to_string(),
            lessons: vec![lesson("Check your understanding", LessonType::Quiz)],
        });
        Ok(modules)
    }

    async fn generate_lesson_content(
        &self,
        request: &LessonRequest,
    ) -> Result<LessonContent, GenerationError> {
        let mut content = format!(
            "# {}\n\n_{} / {}_\n",
            request.lesson_title, request.course_title, request.module_title
        );
        if let Some(prompt) = request.prompt.as_deref().filter(|p| !p.trim().is_empty()) {
            content.push_str(&format!("\n> {}\n", prompt.trim()));
        }
        for source in &request.sources {
            if let Some(text) = source.content.as_deref() {
                content.push_str(&format!("\n## From {}\n\n{}\n", source.title, excerpt(text)));
            }
        }
        let duration = match request.lesson_type {
            LessonType::Quiz => 5,
            LessonType::Video | LessonType::Audio => 8,
            LessonType::Text | LessonType::Interactive => 10,
        };
        Ok(LessonContent {
            content,
            duration: Some(duration),
            is_required: Some(request.lesson_type != LessonType::Audio),
        })
    }

    async fn chat_completion(
        &self,
        _system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, GenerationError> {
        let line = user_prompt
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| GenerationError::Malformed("empty prompt".to_string()))?;
        Ok(format!("(offline) {}", excerpt(line)))
    }
}

fn topic_module(topic: &str) -> OutlineModule {
    OutlineModule {
        title: topic.to_string(),
        lessons: vec![
            lesson(&format!("{}: overview", topic), LessonType::Text),
            lesson(&format!("{} in practice", topic), LessonType::Interactive),
        ],
    }
}

fn lesson(title: &str, lesson_type: LessonType) -> OutlineLesson {
    OutlineLesson {
        title: title.to_string(),
        lesson_type,
        duration: None,
        is_required: None,
    }
}

fn excerpt(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() <= EXCERPT_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(EXCERPT_CHARS).collect();
    format!("{}...", cut.trim_end())
}

/// Learning platform that only logs what it would have written.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalPlatform;

#[async_trait]
impl LearningPlatform for LocalPlatform {
    async fn ingest_sources(&self, org_id: &str, sources: &[SourceDocument]) -> anyhow::Result<usize> {
        let chunks: usize = sources
            .iter()
            .map(|s| s.content.as_deref().map_or(1, |c| c.len() / 1000 + 1))
            .sum();
        info!("Indexed {} sources for {} into {} chunks", sources.len(), org_id, chunks);
        Ok(chunks)
    }

    async fn create_course(&self, org_id: &str, draft: &DraftData) -> anyhow::Result<String> {
        let id = format!("{}-{}", org_id, slug(&draft.course_title));
        info!("Created course {} ({} modules)", id, draft.modules.len());
        Ok(id)
    }

    async fn create_assessments(
        &self,
        course_id: &str,
        draft: &DraftData,
    ) -> anyhow::Result<Vec<CreatedAssessment>> {
        let assessments: Vec<CreatedAssessment> = draft
            .modules
            .iter()
            .filter(|m| !m.lessons.is_empty())
            .enumerate()
            .map(|(i, module)| CreatedAssessment {
                id: format!("{}-a{}", course_id, i + 1),
                title: format!("{} check", module.title),
                question_count: module.lessons.len() * 2,
            })
            .collect();
        info!("Created {} assessments for {}", assessments.len(), course_id);
        Ok(assessments)
    }

    async fn enroll(&self, course_id: &str, member_ids: &[String], required: bool) -> anyhow::Result<usize> {
        info!(
            "Enrolled {} members in {} ({})",
            member_ids.len(),
            course_id,
            if required { "required" } else { "optional" }
        );
        Ok(member_ids.len())
    }

    async fn notify(&self, course_id: &str, member_ids: &[String]) -> anyhow::Result<usize> {
        info!("Notified {} members about {}", member_ids.len(), course_id);
        Ok(member_ids.len())
    }
}

fn slug(title: &str) -> String {
    let mut slug = String::new();
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "course".to_string()
    } else {
        slug.to_string()
    }
}
