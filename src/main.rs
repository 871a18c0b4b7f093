//! CLI entry point for microlab
//!
//! ```bash
//! microlab check --config config/microlab.toml
//! microlab run --config config/microlab.toml
//! microlab recipe --config config/microlab.toml demos/warm_synthesis.json --choose Ready
//! microlab schema > lab.schema.json
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use microlab::logging::{self, LogConfig, LogFormat};
use microlab::tasks::{RecipePlan, RecipeState, RecipeStatus};
use microlab::{Lab, LabConfig};
use std::collections::VecDeque;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "microlab")]
#[command(about = "Bioreactor device orchestration and temperature control", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a lab file and show the device bring-up order
    Check {
        /// Lab configuration file (TOML)
        #[arg(long, default_value = "config/microlab.toml")]
        config: PathBuf,
    },

    /// Bring the lab up and keep the control loop and task workers running
    Run {
        /// Lab configuration file (TOML)
        #[arg(long, default_value = "config/microlab.toml")]
        config: PathBuf,
    },

    /// Run a recipe plan to the end
    Recipe {
        /// Lab configuration file (TOML)
        #[arg(long, default_value = "config/microlab.toml")]
        config: PathBuf,

        /// Recipe plan (JSON)
        plan: PathBuf,

        /// Answers for choice points, used in order before asking on stdin
        #[arg(long)]
        choose: Vec<String>,
    },

    /// Print the JSON schema of the lab file
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Schema => {
            println!("{}", LabConfig::json_schema()?);
            Ok(())
        }
        Commands::Check { config } => {
            let config = load(&config, cli.log_json)?;
            check(config).await
        }
        Commands::Run { config } => {
            let config = load(&config, cli.log_json)?;
            run(config).await
        }
        Commands::Recipe {
            config,
            plan,
            choose,
        } => {
            let config = load(&config, cli.log_json)?;
            recipe(config, &plan, choose).await
        }
    }
}

fn load(path: &Path, log_json: bool) -> Result<LabConfig> {
    let config = LabConfig::load(path)?;

    let mut log = LogConfig::from_level_name(&config.lab.log_level).map_err(anyhow::Error::msg)?;
    if log_json {
        log = log.with_format(LogFormat::Json).with_ansi(false);
    }
    logging::init(log).map_err(anyhow::Error::msg)?;
    info!(lab = %config.lab.name, file = %path.display(), "lab config loaded");
    Ok(config)
}

async fn check(config: LabConfig) -> Result<()> {
    let lab = Lab::bring_up(config).await?;
    println!("Lab '{}' is valid.", lab.config().lab.name);
    println!("Bring-up order:");
    for (i, device) in lab.registry().list_devices().iter().enumerate() {
        println!(
            "  {}. {} ({} / {})",
            i + 1,
            device.id,
            device.device_type,
            device.implementation
        );
    }
    if let Some(control) = lab.control() {
        let status = control.status();
        println!(
            "Control loop: {} reading {}, target {}",
            status.controller_id,
            status.thermometer_id,
            status
                .target
                .map(|t| format!("{t:.1} °C"))
                .unwrap_or_else(|| "none".to_string())
        );
    }
    Ok(())
}

async fn run(config: LabConfig) -> Result<()> {
    let mut lab = Lab::bring_up(config).await?;
    let (shutdown, _) = broadcast::channel(1);
    let handles = lab.start(&shutdown);

    info!("microlab running. Press Ctrl+C to stop.");
    signal::ctrl_c().await?;
    info!("shutting down");

    let _ = shutdown.send(());
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "background task ended abnormally");
        }
    }
    Ok(())
}

async fn recipe(config: LabConfig, plan: &Path, choose: Vec<String>) -> Result<()> {
    let plan = RecipePlan::load(plan)?;
    let mut lab = Lab::bring_up(config).await?;
    let (shutdown, _) = broadcast::channel(1);
    let handles = lab.start(&shutdown);

    let mut runner = lab.recipe_runner(plan)?;
    let mut answers: VecDeque<String> = choose.into();
    let mut last_step = None;

    let outcome = runner
        .run_to_end(Duration::from_millis(500), |status| {
            if last_step != status.step {
                last_step = status.step;
                report(status);
            }
            answers.pop_front().or_else(|| ask(status))
        })
        .await;

    let _ = shutdown.send(());
    for handle in handles {
        let _ = handle.await;
    }

    let status = outcome?;
    report(&status);
    match status.status {
        RecipeState::Complete => Ok(()),
        RecipeState::Error => bail!(
            "recipe '{}' failed at step {:?}: {}",
            status.title,
            status.step,
            status.error.unwrap_or_default()
        ),
        _ => {
            println!("Recipe stopped.");
            Ok(())
        }
    }
}

fn report(status: &RecipeStatus) {
    match status.step {
        Some(step) => println!("[step {step}] {}", status.message),
        None => println!("[{:?}] {}", status.status, status.title),
    }
}

/// Read an answer from stdin. An empty line or end of input stops the recipe.
fn ask(status: &RecipeStatus) -> Option<String> {
    print!("Choose one of {:?}: ", status.options);
    std::io::stdout().flush().ok()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line).ok()?;
    let line = line.trim();
    (!line.is_empty()).then(|| line.to_string())
}
