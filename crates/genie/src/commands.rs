//! Command handlers. Each one opens the project, applies one operation,
//! flushes the snapshot, and prints the result.

use crate::output;
use crate::workspace::Workspace;
use anyhow::{anyhow, bail, Context, Result};
use genie_ids::{ExceptionId, RunId};
use genie_pipeline::project::{EnrollmentRule, EnrollmentTarget, ImplementationData, ProjectPatch};
use genie_pipeline::{
    ExceptionResolution, ExceptionStatus, LaunchOutcome, LaunchRunner, LaunchStep, OrgSnapshot,
    Pipeline, Project, StageId,
};
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

const CHECKPOINT_POLL: Duration = Duration::from_millis(25);

/// Parse `everyone`, `department:<id>`, `team:<id>`, or `member:<id>`.
pub fn parse_target(raw: &str) -> Result<EnrollmentTarget> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("everyone") {
        return Ok(EnrollmentTarget::Everyone);
    }
    let (kind, id) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("invalid target '{}': expected everyone or <kind>:<id>", raw))?;
    let id = id.trim().to_string();
    if id.is_empty() {
        bail!("invalid target '{}': missing id", raw);
    }
    match kind.trim().to_ascii_lowercase().as_str() {
        "department" | "dept" => Ok(EnrollmentTarget::Department { id }),
        "team" => Ok(EnrollmentTarget::Team { id }),
        "member" => Ok(EnrollmentTarget::Member { id }),
        other => bail!("invalid target kind '{}': expected department, team or member", other),
    }
}

async fn finish(pipeline: Pipeline) -> Result<()> {
    pipeline.shutdown().await?;
    Ok(())
}

pub async fn init(
    ws: &Workspace,
    org_id: &str,
    name: &str,
    description: &str,
    org_data: Option<&Path>,
    force: bool,
) -> Result<()> {
    if ws.project_exists(org_id)? && !force {
        bail!(
            "Organization '{}' already has a project. TRY: pass --force to start over",
            org_id
        );
    }
    let org = match org_data {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let mut org: OrgSnapshot = serde_json::from_str(&json)
                .with_context(|| format!("Failed to parse org data in {}", path.display()))?;
            org.org_id = org_id.to_string();
            org
        }
        None => ws.load_org(org_id)?,
    };
    ws.save_org(&org)?;

    let pipeline = ws.create(org, Project::new(name, description)).await?;
    let status = pipeline.status().await;
    let suggestions = suggestions_of(&pipeline).await;
    finish(pipeline).await?;
    output::print_status(&status, &suggestions);
    println!("Saved to {}", ws.store_dir().display());
    Ok(())
}

async fn suggestions_of(pipeline: &Pipeline) -> Vec<genie_pipeline::project::Suggestion> {
    pipeline
        .project()
        .await
        .copilot
        .map(|c| c.suggestions)
        .unwrap_or_default()
}

pub async fn status(ws: &Workspace, org_id: &str, json: bool) -> Result<()> {
    let pipeline = ws.open(org_id)?;
    let status = pipeline.status().await;
    let suggestions = suggestions_of(&pipeline).await;
    finish(pipeline).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        output::print_status(&status, &suggestions);
    }
    Ok(())
}

pub async fn select_sources(ws: &Workspace, org_id: &str, ids: Vec<String>) -> Result<()> {
    let pipeline = ws.open(org_id)?;
    let org = pipeline.org().await;
    let unknown: Vec<&String> = ids
        .iter()
        .filter(|id| !org.sources().iter().any(|s| &s.id == *id))
        .collect();
    if org.sources.is_some() && !unknown.is_empty() {
        warn!("Unknown source ids: {:?}", unknown);
    }
    let changed = pipeline.update_project(ProjectPatch::new().sources(ids)).await;
    info!("Updated {} field(s)", changed.len());
    let count = pipeline.project().await.source_ids.len();
    finish(pipeline).await?;
    println!("{} source(s) selected", count);
    Ok(())
}

pub async fn add_enrollment(ws: &Workspace, org_id: &str, target: &str, optional: bool) -> Result<()> {
    let target = parse_target(target)?;
    let pipeline = ws.open(org_id)?;
    let mut implementation: ImplementationData = pipeline
        .project()
        .await
        .implementation
        .unwrap_or_default();
    let rule = EnrollmentRule {
        target,
        required: !optional,
    };
    if implementation.enrollment_rules.contains(&rule) {
        println!("Rule {} already present", rule.target);
    } else {
        println!("Added rule {} ({})", rule.target, if optional { "optional" } else { "required" });
        implementation.enrollment_rules.push(rule);
        pipeline
            .update_project(ProjectPatch::new().implementation(implementation))
            .await;
    }
    finish(pipeline).await
}

pub async fn select(ws: &Workspace, org_id: &str, stage: StageId) -> Result<()> {
    let pipeline = ws.open(org_id)?;
    let moved = pipeline.select_stage(stage).await;
    let current = pipeline.current_stage().await;
    finish(pipeline).await?;
    if !moved {
        bail!("{} is not open yet; current stage is {}", stage.title(), current.title());
    }
    println!("Current stage: {}", current.title());
    Ok(())
}

pub async fn approve(ws: &Workspace, org_id: &str, stage: StageId, approver: &str) -> Result<()> {
    let pipeline = ws.open(org_id)?;
    let result = pipeline.approve_stage(stage, approver).await;
    finish(pipeline).await?;
    if result? {
        println!("{} approved by {}", stage.title(), approver);
    } else {
        println!("{} was already approved", stage.title());
    }
    Ok(())
}

pub async fn revoke(ws: &Workspace, org_id: &str, stage: StageId) -> Result<()> {
    let pipeline = ws.open(org_id)?;
    let revoked = pipeline.revoke_approval(stage).await;
    finish(pipeline).await?;
    if revoked {
        println!("{} approval revoked", stage.title());
    } else {
        println!("{} was not approved", stage.title());
    }
    Ok(())
}

pub async fn invoke(
    ws: &Workspace,
    org_id: &str,
    stage: StageId,
    action: &str,
    payload: Option<&str>,
) -> Result<()> {
    let payload: Option<serde_json::Value> = payload
        .map(serde_json::from_str)
        .transpose()
        .context("--payload must be valid JSON")?;
    let pipeline = ws.open(org_id)?;
    if !pipeline.registered_actions(stage).await.iter().any(|a| a == action) {
        warn!("No handler for {} on {}; nothing to do", action, stage);
    }
    let result = pipeline.invoke_stage_action(stage, action, payload).await;
    let status = pipeline.status().await;
    let suggestions = suggestions_of(&pipeline).await;
    finish(pipeline).await?;
    output::print_status(&status, &suggestions);
    result?;
    Ok(())
}

pub async fn retry(ws: &Workspace, org_id: &str, stage: StageId) -> Result<()> {
    let pipeline = ws.open(org_id)?;
    let result = pipeline.retry_stage(stage).await;
    let status = pipeline.status().await;
    let suggestions = suggestions_of(&pipeline).await;
    finish(pipeline).await?;
    output::print_status(&status, &suggestions);
    result?;
    Ok(())
}

/// Arm the autopilot and let it run until it goes idle or blocks.
pub async fn autopilot(ws: &Workspace, org_id: &str) -> Result<()> {
    let pipeline = ws.open(org_id)?;
    pipeline.enable_autopilot().await;
    let status = pipeline.status().await;
    let suggestions = suggestions_of(&pipeline).await;
    finish(pipeline).await?;
    output::print_status(&status, &suggestions);
    Ok(())
}

fn confirm(step: LaunchStep) -> Result<bool> {
    let mut stdout = io::stdout();
    write!(stdout, "Continue with {}? [Y/n] ", step)?;
    stdout.flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let answer = line.trim().to_ascii_lowercase();
    Ok(answer.is_empty() || answer == "y" || answer == "yes")
}

/// Run the composite build-and-launch, asking before each step unless `yes`.
pub async fn launch(ws: &Workspace, org_id: &str, yes: bool) -> Result<()> {
    let pipeline = ws.open(org_id)?;
    if yes {
        pipeline.checkpoints().set_enabled(false);
    }

    let runner = LaunchRunner::new(pipeline.clone());
    let mut task = tokio::spawn(async move { runner.run().await });
    let outcome = loop {
        tokio::select! {
            joined = &mut task => break joined.context("launch task panicked")?,
            _ = tokio::time::sleep(CHECKPOINT_POLL) => {
                if let Some(step) = pipeline.pending_checkpoint() {
                    let proceed = tokio::task::spawn_blocking(move || confirm(step))
                        .await
                        .context("prompt task panicked")??;
                    pipeline.resolve_checkpoint(proceed);
                }
            }
        }
    };

    let run = pipeline.launch_run().await;
    finish(pipeline).await?;
    if let Some(run) = &run {
        output::print_launch(run);
    }
    match outcome? {
        LaunchOutcome::Completed => {
            println!("Course launched");
            Ok(())
        }
        other => Err(anyhow!(other
            .error_message()
            .unwrap_or_else(|| "launch did not complete".to_string()))),
    }
}

pub async fn chat(ws: &Workspace, org_id: &str, message: &str) -> Result<()> {
    if message.trim().is_empty() {
        bail!("message is empty");
    }
    let pipeline = ws.open(org_id)?;
    let reply = pipeline.send_chat(message).await;
    finish(pipeline).await?;
    println!("{}", reply);
    Ok(())
}

pub async fn exceptions(
    ws: &Workspace,
    org_id: &str,
    status: Option<ExceptionStatus>,
    json: bool,
) -> Result<()> {
    let pipeline = ws.open(org_id)?;
    let entries = pipeline.list_exceptions(status).await;
    finish(pipeline).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else if entries.is_empty() {
        println!("No exceptions");
    } else {
        output::print_exceptions(&entries);
    }
    Ok(())
}

pub async fn resolve(
    ws: &Workspace,
    org_id: &str,
    id: &ExceptionId,
    resolution: ExceptionResolution,
    by: &str,
    notes: Option<&str>,
) -> Result<()> {
    let pipeline = ws.open(org_id)?;
    let result = pipeline.resolve_exception(id, resolution, by, notes).await;
    finish(pipeline).await?;
    if result? {
        println!("Exception {} {} by {}", id.short(), resolution.status(), by);
    } else {
        println!("Exception {} was already closed", id.short());
    }
    Ok(())
}

pub async fn metrics(ws: &Workspace, org_id: &str, run: Option<&RunId>, json: bool) -> Result<()> {
    let pipeline = ws.open(org_id)?;
    let metrics = pipeline.pipeline_metrics(run).await;
    finish(pipeline).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&metrics)?);
    } else if metrics.is_empty() {
        println!("No metrics recorded");
    } else {
        output::print_metrics(&metrics);
    }
    Ok(())
}
