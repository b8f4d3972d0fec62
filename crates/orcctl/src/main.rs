//! orcctl - CLI client for orcd
//!
//! Local control plane client for the pattern-learning orchestrator daemon.

mod client;
mod render;

use clap::{Parser, Subcommand};
use client::{Client, ClientError, CreateRunRequest, UpsertProjectRequest};
use orc_core::TaskType;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// CLI client for the orcd orchestrator daemon.
#[derive(Parser)]
#[command(name = "orcctl")]
#[command(about = "Control plane for orcd, the pattern-learning orchestrator daemon")]
#[command(version)]
struct Cli {
    /// Daemon address
    #[arg(long, global = true, env = "ORCD_ADDR", default_value = "http://127.0.0.1:7700")]
    addr: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create or update a project
    ProjectSet {
        /// Project id, must match [A-Za-z0-9_-]{1,64}
        id: String,
        /// Display name
        #[arg(long)]
        name: String,
        /// Task type, selects the domain instruction block and pattern variables
        #[arg(long, value_parser = parse_task_type)]
        task_type: Option<TaskType>,
    },

    /// List projects
    Projects,

    /// Start a new run
    Run {
        /// Project id the run belongs to
        project_id: String,
        /// Instructions for the planner
        instructions: String,
        /// Display name for the run
        #[arg(long)]
        name: Option<String>,
        /// Task type
        #[arg(long, value_parser = parse_task_type)]
        task_type: Option<TaskType>,
        /// Prior run whose cached pattern should seed this run's system prompt
        #[arg(long)]
        reference_run: Option<String>,
        /// Prior run whose workspace should be copied into this run
        #[arg(long)]
        from_run: Option<String>,
    },

    /// List runs, optionally filtered by project
    List {
        #[arg(long)]
        project: Option<String>,
    },

    /// Show detailed information about a run
    Inspect { run_id: String },

    /// Cancel a run
    Cancel { run_id: String },

    /// Stream live events from a run until it reaches a terminal status
    Tail { run_id: String },

    /// List a run's workspace files
    Files { run_id: String },

    /// List a run's persisted artifacts
    Artifacts { run_id: String },

    /// Show the pattern cached for a run, if any
    Pattern { run_id: String },
}

fn parse_task_type(s: &str) -> Result<TaskType, String> {
    s.to_lowercase().replace('-', "_").parse().map_err(|_| {
        format!(
            "invalid task type '{s}', expected: code, research, writing, data_analysis, \
             document_processing, document_writing, document_analysis"
        )
    })
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let client = Client::new(&cli.addr);

    if let Err(e) = client.wait_for_ready().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }

    let result = match cli.command {
        Command::ProjectSet { id, name, task_type } => project_set(&client, id, name, task_type).await,
        Command::Projects => projects(&client).await,
        Command::Run { project_id, instructions, name, task_type, reference_run, from_run } => {
            run_create(&client, project_id, instructions, name, task_type, reference_run, from_run).await
        }
        Command::List { project } => run_list(&client, project).await,
        Command::Inspect { run_id } => run_inspect(&client, &run_id).await,
        Command::Cancel { run_id } => run_cancel(&client, &run_id).await,
        Command::Tail { run_id } => client.stream_run(&run_id).await,
        Command::Files { run_id } => run_files(&client, &run_id).await,
        Command::Artifacts { run_id } => run_artifacts(&client, &run_id).await,
        Command::Pattern { run_id } => run_pattern(&client, &run_id).await,
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn project_set(
    client: &Client,
    id: String,
    name: String,
    task_type: Option<TaskType>,
) -> Result<(), ClientError> {
    let project = client
        .upsert_project(&id, &UpsertProjectRequest { id: id.clone(), name, task_type })
        .await?;
    println!("Project {} saved ({})", project.id, project.name);
    Ok(())
}

async fn projects(client: &Client) -> Result<(), ClientError> {
    let projects = client.list_projects().await?;
    render::print_projects(&projects);
    Ok(())
}

async fn run_create(
    client: &Client,
    project_id: String,
    instructions: String,
    name: Option<String>,
    task_type: Option<TaskType>,
    reference_run: Option<String>,
    from_run: Option<String>,
) -> Result<(), ClientError> {
    let req = CreateRunRequest {
        project_id: project_id.clone(),
        name: name.unwrap_or_else(|| "unnamed run".to_string()),
        instructions,
        task_type,
        reference_run_id: reference_run,
        from_run_id: from_run,
    };
    let run = client.create_run(&project_id, &req).await?;
    render::print_run_created(&run);
    Ok(())
}

async fn run_list(client: &Client, project: Option<String>) -> Result<(), ClientError> {
    let runs = client.list_runs(project.as_deref()).await?;
    render::print_run_list(&runs);
    Ok(())
}

async fn run_inspect(client: &Client, run_id: &str) -> Result<(), ClientError> {
    let run = client.get_run(run_id).await?;
    let steps = client.list_steps(run_id).await?;
    render::print_run_details(&run, &steps);
    Ok(())
}

async fn run_cancel(client: &Client, run_id: &str) -> Result<(), ClientError> {
    client.cancel_run(run_id).await?;
    println!("Run {run_id} cancellation requested");
    Ok(())
}

async fn run_files(client: &Client, run_id: &str) -> Result<(), ClientError> {
    let response = client.list_workspace_files(run_id).await?;
    println!("{:<50}  {:<12}  TYPE", "PATH", "BYTES");
    println!("{}", "-".repeat(80));
    for file in &response.files {
        println!("{:<50}  {:<12}  {}", render::truncate(&file.path, 50), file.size_bytes, file.mime_type);
    }
    println!();
    println!("{} file(s)", response.total_files);
    Ok(())
}

async fn run_artifacts(client: &Client, run_id: &str) -> Result<(), ClientError> {
    let artifacts = client.list_artifacts(run_id).await?;
    render::print_artifacts(&artifacts);
    Ok(())
}

async fn run_pattern(client: &Client, run_id: &str) -> Result<(), ClientError> {
    let pattern = client.get_pattern(run_id).await?;
    println!("{}", pattern.rendered_block);
    Ok(())
}
