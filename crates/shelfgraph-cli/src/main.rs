//! shelfgraph - library snapshot to property-graph migration.

mod config;

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::{Args, Command};
use shelfgraph_migrate::{
    BackupArtifact, BackupManager, MigrationError, MigrationOrchestrator, SourceLayout,
    SourceReader,
};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "shelfgraph=info,shelfgraph_migrate=info,shelfgraph_store=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    match args.command {
        Command::Migrate(migrate) => {
            let (config, report_path) = migrate.into_config();
            tracing::info!(
                source = %config.source.display(),
                path = %config.target.display(),
                backup_dir = %config.backup_dir.display(),
                "configuration loaded"
            );

            let outcome = MigrationOrchestrator::new(config).run();
            print!("{}", outcome.report);

            if let Some(path) = report_path {
                let written = outcome
                    .report
                    .to_json()
                    .map_err(|e| e.to_string())
                    .and_then(|json| std::fs::write(&path, json).map_err(|e| e.to_string()));
                if let Err(e) = written {
                    tracing::error!(path = %path.display(), error = %e, "failed to write report");
                }
            }

            if let Some(err) = &outcome.error {
                report_error(err);
            }
            ExitCode::from(outcome.exit_code() as u8)
        }
        Command::Inspect { source, json } => match SourceReader::inspect(&source) {
            Ok(layout) => {
                if json {
                    match serde_json::to_string_pretty(&layout) {
                        Ok(text) => println!("{text}"),
                        Err(e) => {
                            eprintln!("error: {e}");
                            return ExitCode::FAILURE;
                        }
                    }
                } else {
                    print_layout(&layout);
                }
                ExitCode::SUCCESS
            }
            Err(err) => {
                report_error(&err);
                ExitCode::FAILURE
            }
        },
        Command::VerifyBackup { path } => match verify_backup(&path) {
            Ok(artifact) => {
                println!(
                    "{} ok: {} bytes, sha256 {}",
                    artifact.path.display(),
                    artifact.manifest.size,
                    artifact.manifest.sha256
                );
                ExitCode::SUCCESS
            }
            Err(err) => {
                report_error(&err);
                ExitCode::FAILURE
            }
        },
    }
}

fn verify_backup(path: &Path) -> Result<BackupArtifact, MigrationError> {
    let artifact = BackupArtifact::load(path)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    BackupManager::new(dir).verify(&artifact)?;
    Ok(artifact)
}

fn report_error(err: &MigrationError) {
    eprintln!("error[{}]: {}", err.kind(), err);
}

fn print_layout(layout: &SourceLayout) {
    println!("{} ({} bytes)", layout.path.display(), layout.size);
    for table in &layout.tables {
        println!("  {:<12} {:>8} rows", table.name, table.rows);
        if !table.missing.is_empty() {
            println!("  {:<12} missing: {}", "", table.missing.join(", "));
        }
        if !table.unmapped.is_empty() {
            println!("  {:<12} not mapped: {}", "", table.unmapped.join(", "));
        }
    }
    if !layout.other_tables.is_empty() {
        println!("  not migrated: {}", layout.other_tables.join(", "));
    }
}
