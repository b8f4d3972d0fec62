//! Output rendering for the orcctl CLI.

use orc_core::{Artifact, Project, Run, RunStatus, Step};

pub fn print_run_created(run: &Run) {
    println!("Created run: {}", run.id);
    println!("  Name:   {}", run.name);
    println!("  Status: {}", format_status(run.status));
}

pub fn print_run_list(runs: &[Run]) {
    if runs.is_empty() {
        println!("No runs found.");
        return;
    }

    println!("{:<36}  {:<20}  {:<10}  {:<20}", "ID", "NAME", "STATUS", "CREATED");
    println!("{}", "-".repeat(90));

    for run in runs {
        println!(
            "{:<36}  {:<20}  {:<10}  {:<20}",
            run.id,
            truncate(&run.name, 20),
            format_status(run.status),
            format_time(&run.created_at),
        );
    }

    println!();
    println!("{} run(s)", runs.len());
}

pub fn print_run_details(run: &Run, steps: &[Step]) {
    println!("Run: {}", run.id);
    println!();
    println!("  Name:     {}", run.name);
    println!("  Project:  {}", run.project_id);
    println!("  Status:   {}", format_status(run.status));
    println!("  Progress: {}%", run.progress);
    if run.had_errors {
        println!("  Errors:");
        for error in &run.errors {
            println!("    [{}] {}", error.code.as_str(), error.message);
        }
    }
    println!();
    println!("  Created:  {}", format_time(&run.created_at));
    if let Some(started) = run.started_at {
        println!("  Started:  {}", format_time(&started));
    }
    if let Some(finished) = run.finished_at {
        println!("  Finished: {}", format_time(&finished));
    }

    if let Some(summary) = &run.machine_summary {
        println!();
        println!("  Machine Summary:");
        println!("    Goal:               {}", summary.goal);
        println!("    Attempted/Succeeded: {}/{}", summary.execution_attempted, summary.execution_succeeded);
        if let Some(primary) = &summary.primary_artifact {
            println!("    Primary Artifact:   {primary}");
        }
    }

    if !steps.is_empty() {
        println!();
        println!("  Steps:");
        println!("    {:<6}  {:<10}  {:<7}  CONTENT", "SEQ", "ROLE", "OK");
        println!("    {}", "-".repeat(80));
        for step in steps {
            println!(
                "    {:<6}  {:<10}  {:<7}  {}",
                step.sequence,
                step.role.as_str(),
                step.outcome_ok,
                truncate(&step.content, 60),
            );
        }
    }
}

pub fn print_projects(projects: &[Project]) {
    if projects.is_empty() {
        println!("No projects found.");
        return;
    }
    println!("{:<24}  {:<30}  {}", "ID", "NAME", "TASK TYPE");
    println!("{}", "-".repeat(70));
    for project in projects {
        println!(
            "{:<24}  {:<30}  {}",
            project.id,
            truncate(&project.name, 30),
            project.task_type.map_or("-".to_string(), |t| t.as_str().to_string()),
        );
    }
}

pub fn print_artifacts(artifacts: &[Artifact]) {
    if artifacts.is_empty() {
        println!("No artifacts found.");
        return;
    }
    println!("{:<36}  {:<16}  {:<10}  PATH", "ID", "KIND", "BYTES");
    println!("{}", "-".repeat(90));
    for artifact in artifacts {
        println!("{:<36}  {:<16}  {:<10}  {}", artifact.id, artifact.kind, artifact.bytes, artifact.path);
    }
}

fn format_status(status: RunStatus) -> &'static str {
    status.as_str()
}

fn format_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{truncated}...")
    }
}
