mod cli;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Commands, OutputFormat};
use remint_core::config::Config;
use remint_core::controller::{MigrationController, MigrationPlan, MigrationSummary};
use remint_core::error::format_error_with_remediation;
use remint_core::lifecycle::{Direction, EntityRetypeMigration, HookOutcome, run_hook};
use remint_core::logging::{LogError, init_logging};
use remint_core::store::{DocumentStore, ElasticStore};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            report(&err);
            ExitCode::FAILURE
        }
    }
}

fn report(err: &anyhow::Error) {
    match err.downcast_ref::<remint_core::Error>() {
        Some(core) => eprintln!("{}", format_error_with_remediation(core)),
        None => eprintln!("Error: {err:#}"),
    }
}

/// File, then environment, then command line; validated.
fn load_config(cli: &Cli) -> remint_core::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    config.apply_env_overrides();
    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    config.validate()?;
    Ok(config)
}

fn controller(config: &Config) -> remint_core::Result<MigrationController> {
    let store: Arc<dyn DocumentStore> = Arc::new(ElasticStore::new(&config.store)?);
    Ok(MigrationController::new(store, config.settings()?))
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = load_config(&cli)?;
    match init_logging(&config.logging) {
        Ok(()) | Err(LogError::AlreadyInitialized) => {}
        Err(err) => return Err(err).context("failed to initialize logging"),
    }

    match cli.command {
        Commands::Config => {
            let shown = config.redacted();
            match cli.format {
                OutputFormat::Plain => print!("{}", shown.to_toml().map_err(remint_core::Error::from)?),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&shown)?),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Plan => {
            let plan = controller(&config)?.plan().await?;
            match cli.format {
                OutputFormat::Plain => print_plan(&plan),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Up => run_direction(&config, Direction::Up, cli.format).await,
        Commands::Down => run_direction(&config, Direction::Down, cli.format).await,
    }
}

async fn run_direction(
    config: &Config,
    direction: Direction,
    format: OutputFormat,
) -> anyhow::Result<ExitCode> {
    let migration = EntityRetypeMigration::new(controller(config)?);
    let mut outcome = None;
    run_hook(&migration, direction, |result| outcome = Some(result)).await;

    match outcome.context("migration hook did not complete")? {
        Ok(HookOutcome::Applied(summary)) => {
            print_summary(&summary, format)?;
            Ok(ExitCode::SUCCESS)
        }
        Ok(HookOutcome::Skipped { reason }) => {
            match format {
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&HookOutcome::Skipped { reason })?
                ),
                OutputFormat::Plain => println!(
                    "Migration {} {direction}: skipped ({reason})",
                    config.migration.name
                ),
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            print_summary(&err.summary, format)?;
            eprintln!("{}", format_error_with_remediation(&err.source));
            Ok(ExitCode::FAILURE)
        }
    }
}

fn print_summary(summary: &MigrationSummary, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(summary)?),
        OutputFormat::Plain => {
            println!("Migration {} {}", summary.name, summary.state);
            println!("  started:     {}", summary.started_at.to_rfc3339());
            println!("  scanned:     {}", summary.scanned);
            println!("  duplicates:  {}", summary.duplicates_skipped);
            println!(
                "  operations:  {} applied of {} ({}/{} batches)",
                summary.applied_operations,
                summary.total_operations,
                summary.batches_applied,
                summary.batches_total
            );
            println!("  elapsed:     {} ms", summary.elapsed_ms);
        }
    }
    Ok(())
}

fn print_plan(plan: &MigrationPlan) {
    println!("Plan for {}", plan.name);
    println!("  select:      {}", plan.predicate);
    println!("  retype to:   {}", plan.target_type);
    println!("  scanned:     {}", plan.scanned);
    println!("  duplicates:  {}", plan.duplicates_skipped);
    println!(
        "  operations:  {} in {} batches of <= {}",
        plan.operations, plan.batches, plan.max_batch_size
    );
    for (location, count) in &plan.per_location {
        println!("    {location}: {count}");
    }
    if !plan.sample.is_empty() {
        println!("  sample:");
        for update in &plan.sample {
            println!(
                "    {}/{} -> {}",
                update.location, update.record_id, update.standard_id
            );
        }
    }
}
