//! Terminal rendering for pipeline status.

use chrono::{DateTime, Local, Utc};
use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, Color, ContentArrangement, Table};
use genie_pipeline::project::{ActionStatus, Suggestion};
use genie_pipeline::{
    ExceptionPriority, ExceptionStatus, LaunchRun, LaunchStatus, LaunchStep, PipelineStatus,
    ProjectException, RunMetric, StageStatus, StageSummary,
};

fn table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(headers.iter().map(|h| Cell::new(h).fg(Color::Cyan)));
    table
}

fn status_color(status: StageStatus) -> Color {
    match status {
        StageStatus::Pending => Color::DarkGrey,
        StageStatus::InProgress => Color::Yellow,
        StageStatus::Completed => Color::Green,
    }
}

fn flag(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "-"
    }
}

pub fn format_time(time: DateTime<Utc>) -> String {
    let local: DateTime<Local> = time.into();
    local.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn stage_row(summary: &StageSummary, current: bool) -> Vec<Cell> {
    let marker = if current { ">" } else { "" };
    vec![
        Cell::new(marker),
        Cell::new(summary.stage.title()),
        Cell::new(summary.status).fg(status_color(summary.status)),
        Cell::new(summary.approval),
        Cell::new(flag(summary.accessible)),
        Cell::new(flag(summary.ready)),
        Cell::new(flag(summary.complete)),
    ]
}

pub fn print_status(status: &PipelineStatus, suggestions: &[Suggestion]) {
    println!("Project: {}", status.project_name);

    let mut stages = table(&["", "STAGE", "STATUS", "APPROVAL", "OPEN", "READY", "DONE"]);
    for summary in &status.stages {
        stages.add_row(stage_row(summary, summary.stage == status.current_stage));
    }
    println!("{}", stages);

    let mut autopilot = format!(
        "Autopilot: {} ({})",
        if status.autopilot_enabled { "on" } else { "off" },
        status.autopilot
    );
    if let Some(progress) = status.autopilot_progress {
        autopilot.push_str(&format!(
            " {}/{} {}%",
            progress.current,
            progress.total,
            progress.percent()
        ));
    }
    println!("{}", autopilot);

    if let Some(step) = status.pending_checkpoint {
        println!("Waiting for confirmation before: {}", step);
    }
    if let Some(run) = &status.launch {
        print_launch(run);
    }
    if let Some(error) = &status.last_error {
        println!("Last error: {}", error);
    }
    if status.open_exceptions > 0 {
        println!(
            "Open exceptions: {} (genie exceptions --status open)",
            status.open_exceptions
        );
    }

    let open: Vec<&Suggestion> = suggestions.iter().filter(|s| !s.followed).collect();
    println!(
        "Suggestions: {} emitted, {} followed, {} ignored",
        status.suggestions.emitted, status.suggestions.followed, status.suggestions.ignored
    );
    if !open.is_empty() {
        let mut rows = table(&["STAGE", "SUGGESTION", "ACTION"]);
        for suggestion in open {
            rows.add_row(vec![
                suggestion.stage.as_str().to_string(),
                suggestion.message.clone(),
                suggestion.action.clone().unwrap_or_default(),
            ]);
        }
        println!("{}", rows);
    }
}

pub fn print_launch(run: &LaunchRun) {
    let color = match run.status {
        LaunchStatus::Running => Color::Yellow,
        LaunchStatus::Completed => Color::Green,
        LaunchStatus::Canceled => Color::DarkGrey,
        LaunchStatus::Failed => Color::Red,
    };
    let mut launch = table(&["RUN", "ATTEMPT", "STATUS", "STEPS", "STARTED"]);
    launch.add_row(vec![
        Cell::new(&run.run_id),
        Cell::new(run.attempt),
        Cell::new(format!("{:?}", run.status).to_lowercase()).fg(color),
        Cell::new(format!("{}/{}", run.completed_steps.len(), LaunchStep::ALL.len())),
        Cell::new(format_time(run.started_at)),
    ]);
    println!("{}", launch);
}

pub fn print_exceptions(entries: &[ProjectException]) {
    let mut rows = table(&["ID", "STAGE", "REASON", "PRIORITY", "STATUS", "RAISED", "MESSAGE"]);
    for entry in entries {
        let priority = match entry.priority {
            ExceptionPriority::High => Color::Red,
            ExceptionPriority::Normal => Color::Yellow,
            ExceptionPriority::Low => Color::DarkGrey,
        };
        let status = if entry.status == ExceptionStatus::Open {
            Color::Yellow
        } else {
            Color::Green
        };
        rows.add_row(vec![
            Cell::new(entry.id.short()),
            Cell::new(entry.stage.as_str()),
            Cell::new(&entry.reason_code),
            Cell::new(entry.priority).fg(priority),
            Cell::new(entry.status).fg(status),
            Cell::new(format_time(entry.created_at)),
            Cell::new(&entry.reason_message),
        ]);
    }
    println!("{}", rows);
}

pub fn print_metrics(metrics: &[RunMetric]) {
    let mut rows = table(&["RUN", "STAGE", "PHASE", "STATUS", "DURATION", "RETRIES", "AT"]);
    for metric in metrics {
        let color = match metric.status {
            ActionStatus::Success => Color::Green,
            ActionStatus::Error => Color::Red,
            ActionStatus::Pending => Color::Yellow,
        };
        rows.add_row(vec![
            Cell::new(metric.run_id.as_ref().map_or("-", |id| id.short())),
            Cell::new(metric.stage.as_str()),
            Cell::new(&metric.phase),
            Cell::new(metric.status.as_str()).fg(color),
            Cell::new(format!("{} ms", metric.duration_ms)),
            Cell::new(metric.retry_count),
            Cell::new(format_time(metric.created_at)),
        ]);
    }
    println!("{}", rows);
}
