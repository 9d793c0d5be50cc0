//! Command-line entry point: plan, implement, review and test a task against a
//! project directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use orchestrator::exit_codes;
use orchestrator::io::config::{DEFAULT_CONFIG_FILE, OrchestratorConfig, load_config, write_config};
use orchestrator::logging;
use orchestrator::wiring::build_orchestrator;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "orchestrator",
    version,
    about = "Multi-agent coding workflow orchestrator"
)]
struct Cli {
    /// Path to the config file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file if missing.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Run one task through plan, subtasks, review and tests.
    Run {
        /// Natural-language task description.
        description: String,
        /// Project root directory.
        #[arg(long, default_value = ".")]
        project: PathBuf,
        /// Project name; defaults to the directory name.
        #[arg(long)]
        name: Option<String>,
        /// Short project description shown to the agents.
        #[arg(long, default_value = "")]
        about: String,
        /// Enable the auto-accept gate for this run.
        #[arg(long)]
        auto_accept: bool,
        /// Write the outcome JSON here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() {
    logging::init();
    let _ = dotenvy::dotenv();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Run {
            description,
            project,
            name,
            about,
            auto_accept,
            output,
        } => {
            let config = load_config(&cli.config)?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("build tokio runtime")?;
            runtime.block_on(cmd_run(RunArgs {
                config,
                description,
                project,
                name,
                about,
                auto_accept,
                output,
            }))
        }
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        println!("{} already exists", path.display());
        return Ok(exit_codes::OK);
    }
    write_config(path, &OrchestratorConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

struct RunArgs {
    config: OrchestratorConfig,
    description: String,
    project: PathBuf,
    name: Option<String>,
    about: String,
    auto_accept: bool,
    output: Option<PathBuf>,
}

async fn cmd_run(args: RunArgs) -> Result<i32> {
    let root = fs::canonicalize(&args.project)
        .with_context(|| format!("resolve project {}", args.project.display()))?;
    let name = args.name.clone().unwrap_or_else(|| {
        root.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string())
    });

    let orchestrator = build_orchestrator(&args.config, &root)?;
    if args.auto_accept {
        orchestrator.set_auto_accept(true);
    }
    orchestrator
        .initialize_project(&root.display().to_string(), &name, &args.about)
        .await;
    let outcome = orchestrator.execute_task(&args.description).await;
    info!(success = outcome.success, "run finished");

    let mut payload = serde_json::to_string_pretty(&outcome).context("serialize outcome")?;
    payload.push('\n');
    match &args.output {
        Some(path) => {
            fs::write(path, payload).with_context(|| format!("write {}", path.display()))?
        }
        None => print!("{payload}"),
    }

    Ok(if outcome.success {
        exit_codes::OK
    } else {
        exit_codes::FAILED
    })
}
