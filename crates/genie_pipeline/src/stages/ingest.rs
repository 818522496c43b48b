//! Ingest: push the selected sources to the platform's index.

use crate::actions::{ActionContext, StageAction};
use crate::error::{PipelineError, Result};
use crate::org::{self, OrgSnapshot, SourceDocument};
use crate::pipeline::Pipeline;
use crate::project::Project;
use crate::stage::StageId;
use async_trait::async_trait;
use tracing::{info, warn};

pub struct ConfirmSources;

#[async_trait]
impl StageAction for ConfirmSources {
    fn check(&self, project: &Project, _org: &OrgSnapshot) -> Result<()> {
        if !org::can_ingest(project) {
            return Err(PipelineError::prerequisite("select at least one source first"));
        }
        Ok(())
    }

    async fn run(&self, ctx: ActionContext) -> Result<()> {
        ingest_sources(&ctx.pipeline).await.map(|_| ())
    }
}

/// Send the selected sources to the platform and complete the stage.
/// Returns the number of chunks the platform stored.
pub async fn ingest_sources(pipeline: &Pipeline) -> Result<usize> {
    let (org_id, selected, sources) = pipeline
        .with_state(|state| {
            let sources: Vec<SourceDocument> = state
                .org
                .selected_sources(&state.project)
                .into_iter()
                .cloned()
                .collect();
            (state.org.org_id.clone(), state.project.source_ids.len(), sources)
        })
        .await;

    if selected == 0 {
        return Err(PipelineError::prerequisite("select at least one source first"));
    }
    if sources.len() < selected {
        warn!(
            "{} selected source(s) are not in the loaded org data",
            selected - sources.len()
        );
    }

    let chunks = pipeline
        .platform()
        .ingest_sources(&org_id, &sources)
        .await
        .map_err(|e| PipelineError::service(format!("source ingestion failed: {:#}", e)))?;
    info!("Ingested {} source(s) into {} chunk(s)", sources.len(), chunks);

    pipeline.mark_stage_complete(StageId::Ingest).await?;
    Ok(chunks)
}
