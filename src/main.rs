use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use review_workflow::config::ReviewWorkflowConfig;
use review_workflow::shutdown::ShutdownCoordinator;
use review_workflow::sla::SlaSweeper;
use review_workflow::telemetry::{init_telemetry, shutdown_telemetry};
use review_workflow::{ReviewWorkflowService, WorkflowDefinition};

#[derive(Parser)]
#[command(name = "review-workflow")]
#[command(about = "Workflow engine for peer-review case management")]
#[command(long_about = "Validates and inspects workflow definitions for reviews, findings and corrective \
                       action plans, and runs the SLA escalation sweep.")]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "review-workflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check graph integrity of workflow definition files
    Validate {
        /// Definition files or directories of *.toml definitions
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Print the states and transitions of one definition
    Describe {
        /// Definition file
        path: PathBuf,
    },
    /// Load definitions and run the SLA escalation sweep
    Sweep {
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
        /// Definition directory (defaults to the configured one)
        #[arg(long)]
        definitions: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { paths } => validate_command(&paths),
        Commands::Describe { path } => describe_command(&path),
        Commands::Sweep { once, definitions } => {
            tokio::runtime::Runtime::new()?.block_on(async { sweep_command(&cli.config, once, definitions).await })
        }
    }
}

fn collect_definitions(path: &Path) -> Result<Vec<(PathBuf, Result<WorkflowDefinition>)>> {
    if path.is_dir() {
        let mut files: Vec<PathBuf> = std::fs::read_dir(path)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        files.sort();
        Ok(files
            .into_iter()
            .map(|f| {
                let parsed = WorkflowDefinition::from_toml_file(&f);
                (f, parsed)
            })
            .collect())
    } else {
        Ok(vec![(path.to_path_buf(), WorkflowDefinition::from_toml_file(path))])
    }
}

fn validate_command(paths: &[PathBuf]) -> Result<()> {
    let mut failures = 0usize;
    let mut checked = 0usize;

    for path in paths {
        for (file, parsed) in collect_definitions(path)? {
            checked += 1;
            match parsed.and_then(|d| d.validate().map(|_| d).map_err(anyhow::Error::from)) {
                Ok(definition) => println!(
                    "✅ {}: {} ({} states, {} transitions)",
                    file.display(),
                    definition.entity_type,
                    definition.states.len(),
                    definition.transitions.len()
                ),
                Err(e) => {
                    failures += 1;
                    println!("❌ {}: {}", file.display(), e);
                }
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} of {checked} definitions failed validation");
    }
    println!("All {checked} definitions are valid");
    Ok(())
}

fn describe_command(path: &Path) -> Result<()> {
    let definition = WorkflowDefinition::from_toml_file(path)?;
    definition.validate()?;

    println!("{} - {}", definition.entity_type, definition.name);
    println!();
    println!("States:");
    for state in &definition.states {
        let mut flags = Vec::new();
        if state.is_initial {
            flags.push("initial".to_string());
        }
        if state.is_terminal {
            flags.push("terminal".to_string());
        }
        if let Some(days) = state.sla_days {
            flags.push(format!("SLA {days}d"));
        }
        if !state.escalation_rules.is_empty() {
            flags.push(format!("{} escalation rule(s)", state.escalation_rules.len()));
        }
        println!("  {:<24} {:<32} {}", state.code, state.label, flags.join(", "));
    }

    println!();
    println!("Transitions:");
    for t in &definition.transitions {
        let roles: Vec<&str> = t.allowed_roles.iter().map(|r| r.as_str()).collect();
        let mut guards = t.guards.checks.clone();
        if t.guards.requires_coi_clearance {
            guards.insert(0, "coi_clearance".to_string());
        }
        println!(
            "  {:<20} {} -> {} [{:?}] roles: {}{}",
            t.code,
            t.from_state,
            t.to_state,
            t.trigger,
            roles.join(", "),
            if guards.is_empty() {
                String::new()
            } else {
                format!(" guards: {}", guards.join(", "))
            }
        );
    }
    Ok(())
}

async fn sweep_command(config_path: &Path, once: bool, definitions: Option<PathBuf>) -> Result<()> {
    ReviewWorkflowConfig::load_env_file()?;
    let config = ReviewWorkflowConfig::load_from(config_path)?;
    init_telemetry(&config.observability)?;

    #[allow(unused_mut)]
    let mut builder = ReviewWorkflowService::builder(config.clone());
    #[cfg(feature = "database")]
    if let Some(db_config) = &config.database {
        let manager = Arc::new(review_workflow::database::DatabaseManager::from_config(db_config).await?);
        builder = builder.execution_store(manager.clone()).audit_sink(manager);
    }
    let service = builder.build();

    let directory = definitions.unwrap_or_else(|| config.definitions.directory.clone());
    for definition in WorkflowDefinition::load_dir(&directory)? {
        let published = service
            .engine()
            .definitions()
            .publish(definition, &config.service.system_actor_id)
            .await?;
        tracing::info!(definition = %published.definition_id(), "Loaded workflow definition");
    }

    if once {
        let report = service.sla_sweep().await?;
        println!(
            "Sweep evaluated {} clocks, fired {} escalations ({} failures)",
            report.evaluated,
            report.fired.len(),
            report.failures
        );
        shutdown_telemetry(&config.observability);
        return Ok(());
    }

    let coordinator = ShutdownCoordinator::new();
    let sweeper = SlaSweeper::new(
        Arc::clone(service.sla()),
        Duration::from_secs(config.sla.sweep_interval_seconds),
    );
    let handle = tokio::spawn({
        let shutdown = coordinator.subscribe();
        async move { sweeper.run(shutdown).await }
    });

    coordinator.wait_for_signal().await?;
    if let Some(ticks) = ShutdownCoordinator::drain(handle, Duration::from_secs(10)).await {
        println!("SLA sweeper stopped after {ticks} ticks");
    }
    shutdown_telemetry(&config.observability);
    Ok(())
}
