//! # Cycle Orchestrator Configuration Validator
//!
//! Command-line tool for validating orchestrator configuration before a long
//! unattended run. Loads the TOML file plus `CYCLE_*` environment overrides,
//! runs the same validation the orchestrator runs at construction, and prints
//! the effective configuration with the database password masked.

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use cycle_orchestrator::config::{ConfigManager, CycleConfig};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "config-validator")]
#[command(about = "Validate cycle orchestrator configuration")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Ignore CYCLE_* environment overrides
    #[arg(long)]
    no_env: bool,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output format (table, json)
    #[arg(long, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate every configuration section
    All,

    /// Validate and print one section
    Component {
        /// Section name (paths, database, orchestrator, worker, health, resources)
        name: String,
    },

    /// Print the effective configuration
    Show,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let _subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .try_init();

    let result = load(&cli).and_then(|manager| match &cli.command {
        Some(Commands::All) | None => validate_all(&manager),
        Some(Commands::Component { name }) => validate_component(&cli, &manager, name),
        Some(Commands::Show) => show(&cli, &manager),
    });

    match result {
        Ok(()) => {
            info!("Configuration validation completed successfully");
            process::exit(0);
        }
        Err(e) => {
            error!("Configuration validation failed: {:#}", e);
            eprintln!("❌ {e:#}");
            process::exit(1);
        }
    }
}

fn load(cli: &Cli) -> anyhow::Result<Arc<ConfigManager>> {
    let path = cli.config.as_deref();
    let manager = if cli.no_env {
        ConfigManager::load_from_file(path)
    } else {
        ConfigManager::load(path)
    };
    manager.with_context(|| match path {
        Some(path) => format!("loading {}", path.display()),
        None => "loading defaults and environment".to_string(),
    })
}

fn validate_all(manager: &ConfigManager) -> anyhow::Result<()> {
    println!("🔧 Validating Cycle Orchestrator Configuration");
    println!("Environment: {}", manager.environment());
    match manager.source_file() {
        Some(path) => println!("Config File: {}", path.display()),
        None => println!("Config File: (defaults and environment only)"),
    }
    println!();

    let config = manager.config();
    config.validate()?;

    print_summary(config);
    println!("\n🎉 All configuration validation checks passed!");
    Ok(())
}

fn print_summary(config: &CycleConfig) {
    println!("✅ Modules ({}): {}", config.orchestrator.modules.len(), config.orchestrator.modules.join(", "));
    match config.database.sanitized_url() {
        Some(url) => println!("✅ Database: {url} (pool {}..{})", config.database.min_connections, config.database.max_connections),
        None => println!("⚠️  Database: not configured, state persists to file only"),
    }
    println!("✅ State file: {}", config.paths.state_file.display());
    println!("✅ Log directory: {}", config.paths.log_dir.display());
    println!(
        "✅ Health: timeout {}s, check every {}s, {} consecutive failures",
        config.health.heartbeat_timeout_seconds,
        config.health.check_interval_seconds,
        config.health.max_consecutive_failures
    );
    println!(
        "✅ Worker: batch {}, {}ms between items",
        config.worker.batch_size, config.worker.delay_between_items_ms
    );
    println!(
        "✅ Memory: warning {:.0}%, critical {:.0}%",
        config.resources.memory_warning_threshold * 100.0,
        config.resources.memory_critical_threshold * 100.0
    );
}

fn validate_component(cli: &Cli, manager: &ConfigManager, name: &str) -> anyhow::Result<()> {
    println!("🔧 Validating Component: {name}");
    manager.config().validate()?;

    let effective = manager.debug_config();
    let section = effective
        .get(name.to_lowercase().as_str())
        .ok_or_else(|| anyhow!("Unknown component: {name}"))?;

    print_value(cli, section)?;
    println!("✅ Component '{name}' validation passed!");
    Ok(())
}

fn show(cli: &Cli, manager: &ConfigManager) -> anyhow::Result<()> {
    print_value(cli, &manager.debug_config())
}

fn print_value(cli: &Cli, value: &serde_json::Value) -> anyhow::Result<()> {
    match cli.format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(value)?),
        "table" => print_table(value, ""),
        other => bail!("Unsupported format: {other}"),
    }
    Ok(())
}

fn print_table(value: &serde_json::Value, prefix: &str) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, nested) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                print_table(nested, &path);
            }
        }
        other => println!("  {prefix:<45} {other}"),
    }
}
