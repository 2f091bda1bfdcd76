mod config;
mod server;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::RwLock;
use tracing::info;

use haivemind_core::agent::ClaudeCodeBackend;
use haivemind_core::orchestrator::{ClaudeCodePlanner, MarkerFileWorkspaceAnalyzer};
use haivemind_core::{recover_orphaned_sessions, Broadcaster, OrchestratorConfig, SessionOrchestrator};
use haivemind_state::models::Project;
use haivemind_state::Engine;

use config::{EngineConfig, LogFormat};
use server::AppState;

#[derive(Parser)]
#[command(name = "haivemind", about = "Orchestrator for fleets of external AI coding agents")]
struct Cli {
    /// Base directory for the interrupted-session inbox and project registry.
    #[arg(long, env = "HAIVEMIND_BASE_DIR")]
    base_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control-plane HTTP server and observer duplex channel.
    Serve,
    /// Register a project directory under a slug so sessions can target it.
    AddProject {
        slug: String,
        dir: PathBuf,
    },
    /// List registered projects.
    ListProjects,
}

/// `<slug, dir>` registry persisted at `<base_dir>/projects.json`; project
/// CRUD otherwise stays an external collaborator per spec, so this is
/// intentionally just enough to let `serve` resolve a slug to a `Project`.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct ProjectRegistry(HashMap<String, PathBuf>);

fn registry_path(base_dir: &std::path::Path) -> PathBuf {
    base_dir.join("projects.json")
}

fn load_registry(base_dir: &std::path::Path) -> Result<ProjectRegistry> {
    let path = registry_path(base_dir);
    if !path.exists() {
        return Ok(ProjectRegistry::default());
    }
    let contents = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
}

fn save_registry(base_dir: &std::path::Path, registry: &ProjectRegistry) -> Result<()> {
    std::fs::create_dir_all(base_dir)?;
    let path = registry_path(base_dir);
    std::fs::write(&path, serde_json::to_string_pretty(registry)?).with_context(|| format!("writing {}", path.display()))
}

fn default_base_dir() -> PathBuf {
    dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join("haivemind")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let engine_config = EngineConfig::resolve();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(engine_config.log_level.clone()));
    match engine_config.log_format {
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }

    let base_dir = cli.base_dir.clone().unwrap_or_else(default_base_dir);

    match cli.command {
        Commands::AddProject { slug, dir } => {
            let mut registry = load_registry(&base_dir)?;
            registry.0.insert(slug.clone(), dir.canonicalize().unwrap_or(dir));
            save_registry(&base_dir, &registry)?;
            println!("registered project '{slug}'");
            Ok(())
        }
        Commands::ListProjects => {
            let registry = load_registry(&base_dir)?;
            for (slug, dir) in &registry.0 {
                println!("{slug}\t{}", dir.display());
            }
            Ok(())
        }
        Commands::Serve => run_serve(base_dir, engine_config).await,
    }
}

async fn run_serve(base_dir: PathBuf, engine_config: EngineConfig) -> Result<()> {
    let registry = load_registry(&base_dir)?;
    let mut projects = HashMap::new();
    for (slug, dir) in registry.0 {
        let settings = engine_config.default_project_settings();
        projects.insert(slug.clone(), Project { slug, dir, settings, skills: Default::default() });
    }
    let project_dirs: Vec<PathBuf> = projects.values().map(|p| p.dir.clone()).collect();

    let recovered = recover_orphaned_sessions(&base_dir, &project_dirs)?;
    if !recovered.is_empty() {
        info!(count = recovered.len(), "recovered orphaned sessions into interrupted inbox");
    }

    let engine = Arc::new(Engine::new());
    let broadcaster = Broadcaster::new(engine.clone());
    let backend = Arc::new(ClaudeCodeBackend::with_binary(engine_config.default_backend.clone()));
    let planner = Arc::new(ClaudeCodePlanner::new());
    let orchestrator_config = OrchestratorConfig {
        analysis_timeout_ms: engine_config.orchestrator_timeout_ms,
        runner_config: engine_config.runner_config(),
        ..OrchestratorConfig::default()
    };
    let orchestrator = Arc::new(SessionOrchestrator::new(
        engine.clone(),
        broadcaster.clone(),
        backend,
        planner.clone(),
        planner,
        Some(Arc::new(MarkerFileWorkspaceAnalyzer)),
        orchestrator_config,
    ));

    let state = AppState {
        engine: engine.clone(),
        broadcaster: broadcaster.clone(),
        orchestrator: orchestrator.clone(),
        base_dir: base_dir.clone(),
        projects: Arc::new(RwLock::new(projects)),
    };

    let server_task = tokio::spawn(server::run_server(state, engine_config.port));

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown signal received");
    haivemind_core::graceful_shutdown(&engine, &broadcaster, orchestrator.agent_managers().await).await;
    server_task.abort();
    Ok(())
}
