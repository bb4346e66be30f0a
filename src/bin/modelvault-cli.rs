//! ModelVault CLI - Local maintenance tool
//!
//! Provides command-line access to:
//! - Vault status and per-user integrity checks
//! - Backup listing and restore
//! - Compatibility checks and version migrations
//!
//! Usage:
//!   modelvault-cli status
//!   modelvault-cli verify <USER>
//!   modelvault-cli backups <USER>
//!   modelvault-cli restore <USER> <BACKUP_ID>
//!   modelvault-cli compat <FROM> <TO>
//!   modelvault-cli migrate <USER> <TARGET>
//!   modelvault-cli delete <USER>

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use modelvault::config::{SecretSource, VaultConfig};
use modelvault::migration::MigrationManager;
use modelvault::store::ModelStore;

/// CLI command structure
#[derive(Debug)]
enum Command {
    Status,
    Verify { user: String },
    Backups { user: String },
    Restore { user: String, backup_id: String },
    Compat { source: String, target: String },
    Migrate { user: String, target: String },
    Delete { user: String },
    Help,
    Version,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();

    match parse_args(&args) {
        Ok(cmd) => match run_command(cmd) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error: {:#}", e);
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            ExitCode::FAILURE
        }
    }
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    if args.len() < 2 {
        return Ok(Command::Help);
    }

    match args[1].as_str() {
        "help" | "--help" | "-h" => Ok(Command::Help),
        "version" | "--version" | "-V" => Ok(Command::Version),

        "status" => Ok(Command::Status),

        "verify" => {
            let user = args.get(2).ok_or("Missing user ID")?.clone();
            Ok(Command::Verify { user })
        }

        "backups" => {
            let user = args.get(2).ok_or("Missing user ID")?.clone();
            Ok(Command::Backups { user })
        }

        "restore" => {
            let user = args.get(2).ok_or("Missing user ID")?.clone();
            let backup_id = args.get(3).ok_or("Missing backup ID")?.clone();
            Ok(Command::Restore { user, backup_id })
        }

        "compat" => {
            let source = args.get(2).ok_or("Missing source version")?.clone();
            let target = args.get(3).ok_or("Missing target version")?.clone();
            Ok(Command::Compat { source, target })
        }

        "migrate" => {
            let user = args.get(2).ok_or("Missing user ID")?.clone();
            let target = args.get(3).ok_or("Missing target version")?.clone();
            Ok(Command::Migrate { user, target })
        }

        "delete" => {
            let user = args.get(2).ok_or("Missing user ID")?.clone();
            Ok(Command::Delete { user })
        }

        _ => Err(format!("Unknown command: {}", args[1])),
    }
}

fn run_command(cmd: Command) -> Result<()> {
    match cmd {
        Command::Help => {
            print_help();
            Ok(())
        }
        Command::Version => {
            println!("modelvault-cli {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        cmd => {
            let runtime =
                tokio::runtime::Runtime::new().context("Failed to start the async runtime")?;
            runtime.block_on(run_vault_command(cmd))
        }
    }
}

fn print_help() {
    println!(
        r#"ModelVault CLI - Local maintenance tool

USAGE:
    modelvault-cli <COMMAND> [ARGS]

COMMANDS:
    status                      Show vault statistics

    verify <USER>               Run a full integrity check on a user's model

    backups <USER>              List recorded backups for a user

    restore <USER> <BACKUP_ID>  Restore a model from a recorded backup

    compat <FROM> <TO>          Assess compatibility between two versions

    migrate <USER> <TARGET>     Plan and execute a migration to a target version

    delete <USER>               Remove a user's model, backups, and key material

    help                        Show this help message
    version                     Show version information

EXAMPLES:
    modelvault-cli status
    modelvault-cli verify user-42
    modelvault-cli backups user-42
    modelvault-cli restore user-42 bk_1756100000000_a1b2c3d4
    modelvault-cli compat 1.0.0 1.1.0
    modelvault-cli migrate user-42 1.1.0
"#
    );
}

fn open_store() -> Result<Arc<ModelStore>> {
    let secret = SecretSource::resolve().context("Failed to resolve the master secret")?;
    let config = VaultConfig::new(secret).context("Failed to locate the vault directory")?;
    let store = ModelStore::open(config).context("Failed to open the model vault")?;
    Ok(Arc::new(store))
}

async fn run_vault_command(cmd: Command) -> Result<()> {
    match cmd {
        Command::Status => run_status().await,
        Command::Verify { user } => run_verify(&user).await,
        Command::Backups { user } => run_backups(&user).await,
        Command::Restore { user, backup_id } => run_restore(&user, &backup_id).await,
        Command::Compat { source, target } => run_compat(&source, &target),
        Command::Migrate { user, target } => run_migrate(&user, &target).await,
        Command::Delete { user } => run_delete(&user).await,
        // help and version never reach this path
        Command::Help | Command::Version => Ok(()),
    }
}

async fn run_status() -> Result<()> {
    let store = open_store()?;
    let users = store.user_ids().context("Failed to list stored models")?;
    let disk = store.disk_usage().context("Failed to measure disk usage")?;

    println!("ModelVault Statistics");
    println!("{}", "-".repeat(30));
    println!("Location:  {}", store.base_dir().display());
    println!("Models:    {}", users.len());
    println!("Disk:      {} bytes", disk);
    println!(
        "Keychain:  {}",
        if SecretSource::keychain_available() {
            "Available"
        } else {
            "Unavailable"
        }
    );

    if !users.is_empty() {
        println!();
        println!("{:<36} {:<12} {:<8}", "USER", "VERSION", "BACKUPS");
        println!("{}", "-".repeat(60));
        for user in users {
            let model = store.load(&user).await;
            let backups = store.list_backups(&user).map(|b| b.len()).unwrap_or(0);
            match model {
                Ok(model) => {
                    println!("{:<36} {:<12} {:<8}", user, model.version, backups)
                }
                Err(e) => println!("{:<36} {:<12} {:<8}", user, format!("<{}>", e), backups),
            }
        }
    }

    Ok(())
}

async fn run_verify(user: &str) -> Result<()> {
    let store = open_store()?;
    let model = store
        .load(user)
        .await
        .with_context(|| format!("Failed to load the model for {}", user))?;
    let check = store
        .verify_model(&model)
        .await
        .context("Integrity check failed to run")?;

    println!("Integrity check for {}", user);
    println!("{}", "-".repeat(40));
    println!("Checksum:    {}", if check.checksum_valid { "OK" } else { "FAILED" });
    println!("Structure:   {}", if check.structure_valid { "OK" } else { "FAILED" });
    println!("Consistency: {}", if check.data_consistent { "OK" } else { "FAILED" });
    println!("Overall:     {}", if check.passed { "PASSED" } else { "FAILED" });

    if !check.issues.is_empty() {
        println!("\nIssues:");
        for issue in &check.issues {
            println!("  [{}] {}", issue.kind, issue.description);
        }
    }

    Ok(())
}

async fn run_backups(user: &str) -> Result<()> {
    let store = open_store()?;
    let backups = store
        .list_backups(user)
        .with_context(|| format!("Failed to list backups for {}", user))?;

    if backups.is_empty() {
        println!("No backups recorded for {}.", user);
    } else {
        println!("{:<36} {:<12} {:<26} {:<10}", "ID", "VERSION", "CREATED", "SIZE");
        println!("{}", "-".repeat(88));
        for backup in backups {
            println!(
                "{:<36} {:<12} {:<26} {:<10}",
                backup.backup_id,
                backup.model_version,
                backup.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
                backup.size
            );
        }
    }

    Ok(())
}

async fn run_restore(user: &str, backup_id: &str) -> Result<()> {
    let store = open_store()?;
    let result = store
        .restore(user, backup_id)
        .await
        .with_context(|| format!("Failed to restore {} for {}", backup_id, user))?;

    println!("Restored {} from {}", user, backup_id);
    println!("Version:   {}", result.restored_version);
    println!("Integrity: {}", if result.integrity.passed { "PASSED" } else { "FAILED" });
    println!("Elapsed:   {} ms", result.restore_time_ms);
    Ok(())
}

fn run_compat(source: &str, target: &str) -> Result<()> {
    // pure version analysis; the vault itself is not consulted
    let assessment = modelvault::migration::assess_compatibility(source, target);

    println!("Compatibility: {} -> {}", source, target);
    println!("{}", "-".repeat(40));
    println!("Compatible:  {}", assessment.is_compatible);
    println!("Required:    {}", assessment.migration_required);
    println!("Complexity:  {}", assessment.migration_complexity);
    println!("Risk:        {}", assessment.risk_level);
    println!("Estimate:    {} ms", assessment.estimated_duration_ms);

    if !assessment.compatibility_issues.is_empty() {
        println!("\nIssues:");
        for issue in &assessment.compatibility_issues {
            println!("  - {}", issue);
        }
    }

    Ok(())
}

async fn run_migrate(user: &str, target: &str) -> Result<()> {
    let store = open_store()?;
    let manager = MigrationManager::new(store.clone());

    let model = store
        .load(user)
        .await
        .with_context(|| format!("Failed to load the model for {}", user))?;

    let plan = manager.create_migration_plan(&model, target);
    println!(
        "Plan {} ({} steps, estimated {} ms, risk {})",
        plan.plan_id,
        plan.migration_steps.len(),
        plan.estimated_duration_ms,
        plan.risk_assessment.risk_level
    );
    for step in &plan.migration_steps {
        println!("  {} - {}", step.step_id, step.description);
    }

    let result = manager
        .execute_migration_plan(&plan)
        .await
        .context("Migration could not be attempted")?;

    println!();
    println!("Migration {}: {}", result.migration_id, result.state);
    println!(
        "Steps:     {}/{} completed",
        result.steps_completed, result.steps_total
    );
    println!("Elapsed:   {} ms", result.elapsed_ms);
    println!(
        "Integrity: {}",
        if result.integrity.passed { "PASSED" } else { "FAILED" }
    );
    if let Some(error) = &result.error {
        println!("Error:     {}", error);
    }
    for entry in result.log.entries() {
        println!("  [{}] {}", entry.timestamp.format("%H:%M:%S%.3f"), entry.message);
    }

    if !result.success {
        anyhow::bail!("migration ended in state {}", result.state);
    }
    Ok(())
}

async fn run_delete(user: &str) -> Result<()> {
    let store = open_store()?;
    store
        .delete(user)
        .await
        .with_context(|| format!("Failed to delete vault data for {}", user))?;
    println!("Removed model, backups, and key material for {}.", user);
    Ok(())
}
