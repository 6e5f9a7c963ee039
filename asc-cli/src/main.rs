//! ASC CLI - run and inspect an agent fleet

use anyhow::{Context, Result, bail};
use asc_core::config::{Config, ConfigWatcher, ControllerSettings, Template, load_env_file};
use asc_core::diagnostics::{Diagnostics, DiagnosticsConfig};
use asc_core::liveness::{CoordinatorClient, EventStreamClient, StreamConfig};
use asc_supervisor::{
    HealthConfig, HealthMonitor, LocalProcessSupervisor, ReconcileOnReload, ReconciliationEngine,
};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Parser)]
#[command(name = "asc")]
#[command(about = "Agent fleet control plane", long_about = None)]
#[command(version)]
struct Cli {
    /// Fleet configuration file
    #[arg(short, long, global = true, env = "ASC_CONFIG", default_value = "asc.toml")]
    config: PathBuf,

    /// File holding agent secrets
    #[arg(long, global = true, env = "ASC_ENV_FILE", default_value = ".env")]
    env_file: PathBuf,

    /// Controller settings file
    #[arg(long, global = true, env = "ASC_SETTINGS")]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the fleet and keep it in line with the configuration
    Up {
        /// Do not subscribe to the coordinator event stream
        #[arg(long)]
        no_events: bool,
        /// Report unhealthy agents without restarting them
        #[arg(long)]
        no_recovery: bool,
    },
    /// Diagnose and optionally repair local state
    Doctor {
        /// Apply automatic fixes
        #[arg(long)]
        fix: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
        /// Include descriptions and impact
        #[arg(short, long)]
        verbose: bool,
    },
    /// Show agent liveness
    Status {
        /// Only this agent
        agent: Option<String>,
    },
    /// Print coordinator events as they arrive
    Events,
    /// Write a starter configuration
    Init {
        #[arg(short, long, default_value_t = Template::Solo)]
        template: Template,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Version information
    Version,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => ControllerSettings::load_from(path),
        None => ControllerSettings::load(),
    }
    .context("Failed to load controller settings")?;

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.log_filter)),
        )
        .init();

    match cli.command {
        Commands::Version => {
            println!("asc {}", env!("CARGO_PKG_VERSION"));
            println!("asc-core {}", asc_core::VERSION);
        }
        Commands::Init { template, force } => init(&cli.config, template, force)?,
        Commands::Doctor { fix, json, verbose } => {
            return doctor(&cli.config, &cli.env_file, &settings, fix, json, verbose).await;
        }
        Commands::Status { agent } => status(&cli.config, &settings, agent.as_deref()).await?,
        Commands::Events => events(&cli.config, &settings).await?,
        Commands::Up { no_events, no_recovery } => {
            let options = UpOptions {
                events: !no_events,
                recovery: !no_recovery,
            };
            up(&cli.config, &cli.env_file, &settings, options).await?
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn load_config(path: &Path) -> Result<Config> {
    let config = Config::load(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    for warning in config.warnings() {
        tracing::warn!(suggestion = %warning.suggestion, "{}", warning.message);
    }
    Ok(config)
}

fn init(path: &Path, template: Template, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    std::fs::write(path, template.render())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Created {} from the {template} template", path.display());
    Ok(())
}

async fn doctor(
    config_path: &Path,
    env_path: &Path,
    settings: &ControllerSettings,
    fix: bool,
    json: bool,
    verbose: bool,
) -> Result<ExitCode> {
    let layout = settings.layout()?;
    let diagnostics = Diagnostics::new(DiagnosticsConfig::new(config_path, env_path, layout))?;

    let mut report = diagnostics.run_diagnostics().await;
    if fix {
        report.fixes_applied = diagnostics.apply_fixes(&report);
    }

    if json {
        println!("{}", report.to_json()?);
    } else {
        print!("{}", report.format(verbose));
    }

    let fixed_everything = fix && report.fixes_applied.iter().all(|f| f.success);
    if report.has_critical_issues() && !fixed_everything {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

async fn status(config_path: &Path, settings: &ControllerSettings, agent: Option<&str>) -> Result<()> {
    let config = load_config(config_path)?;
    let client = CoordinatorClient::from_settings(&config.services.coordinator.url, settings)?;

    let statuses = match agent {
        Some(name) => vec![client.track_agent_status(name, settings.offline_threshold).await?],
        None => client.get_all_agent_statuses(settings.offline_threshold).await?,
    };

    if statuses.is_empty() {
        println!("No heartbeats received");
    }
    for status in statuses {
        let task = status.current_task.as_deref().unwrap_or("-");
        let seen = status
            .last_seen
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!("{:<20} {:<8} {:<24} {}", status.name, status.state, task, seen);
    }
    Ok(())
}

fn stream_client(config: &Config, settings: &ControllerSettings) -> EventStreamClient {
    let url = settings
        .stream_url
        .clone()
        .unwrap_or_else(|| config.services.coordinator.stream_url());
    EventStreamClient::with_config(url, StreamConfig::from_settings(settings))
}

async fn events(config_path: &Path, settings: &ControllerSettings) -> Result<()> {
    let config = load_config(config_path)?;
    let client = stream_client(&config, settings);
    let mut events = client
        .take_events()
        .context("event queue already taken")?;
    client.connect().await.context("Failed to connect to event stream")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(event) => println!("{}", serde_json::to_string(&event)?),
                None => break,
            },
        }
    }

    client.close().await;
    Ok(())
}

async fn up(
    config_path: &Path,
    env_path: &Path,
    settings: &ControllerSettings,
    options: UpOptions,
) -> Result<()> {
    let config = load_config(config_path)?;

    let secrets = if env_path.exists() {
        load_env_file(env_path)
            .with_context(|| format!("Failed to load {}", env_path.display()))?
    } else {
        tracing::warn!(path = %env_path.display(), "no env file, agents start without secrets");
        BTreeMap::new()
    };

    let layout = settings.layout()?;
    layout.ensure()?;
    let supervisor = Arc::new(LocalProcessSupervisor::new(layout));

    let engine = ReconciliationEngine::new(config.clone(), supervisor.clone(), secrets);
    engine
        .start_coordinator()
        .await
        .context("Failed to start the coordination server")?;
    let engine = Arc::new(Mutex::new(engine));

    let outcome = serve(config_path, &config, settings, &engine, options).await;

    tracing::info!("shutting down");
    {
        let engine = engine.lock().await;
        for error in engine.stop_all().await.errors {
            tracing::error!(agent = %error.agent, error = %error.error, "failed to stop agent");
        }
        if let Err(e) = engine.stop_coordinator().await {
            tracing::error!(error = %e, "failed to stop the coordination server");
        }
    }
    for (agent, error) in supervisor.stop_all().await {
        tracing::error!(%agent, error = %error, "failed to stop process");
    }

    outcome
}

#[derive(Debug, Clone, Copy)]
struct UpOptions {
    events: bool,
    recovery: bool,
}

/// Run the fleet until Ctrl-C. Processes are left running for the caller to stop.
async fn serve(
    config_path: &Path,
    config: &Config,
    settings: &ControllerSettings,
    engine: &Arc<Mutex<ReconciliationEngine>>,
    options: UpOptions,
) -> Result<()> {
    let started = engine.lock().await.start_all().await;
    for error in &started.errors {
        tracing::error!(agent = %error.agent, error = %error.error, "agent failed to start");
    }
    tracing::info!(
        agents = started.added.len(),
        failed = started.errors.len(),
        "fleet started"
    );

    let watcher = ConfigWatcher::new(config_path).with_debounce(settings.debounce);
    watcher
        .on_reload(Arc::new(ReconcileOnReload::new(engine.clone())))
        .await;
    watcher.start().context("Failed to watch configuration")?;

    let client = CoordinatorClient::from_settings(&config.services.coordinator.url, settings)?;
    let health = HealthConfig {
        unresponsive_timeout: settings.offline_threshold,
        auto_recovery: options.recovery,
        ..Default::default()
    };
    let monitor = Arc::new(HealthMonitor::new(engine.clone(), Arc::new(client), health));
    monitor.start();

    let stream = options.events.then(|| stream_client(config, settings));
    if let Some(stream) = &stream {
        if let Some(mut events) = stream.take_events() {
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    tracing::info!(?event, "coordinator event");
                }
            });
        }
        if let Err(e) = stream.connect().await {
            tracing::warn!(error = %e, "event stream unavailable, continuing without it");
        }
    }

    let signal = tokio::signal::ctrl_c().await;

    // The monitor must be gone before the caller stops agents
    watcher.stop().await;
    monitor.stop().await;
    if let Some(stream) = &stream {
        stream.close().await;
    }
    signal.context("Failed to listen for Ctrl-C")
}
