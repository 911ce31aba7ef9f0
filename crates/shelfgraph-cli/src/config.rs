//! Command-line arguments.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use shelfgraph_migrate::config::{
    DEFAULT_BACKUP_DIR, DEFAULT_BATCH_SIZE, DEFAULT_SAMPLE_SIZE, DEFAULT_SOURCE, DEFAULT_TARGET,
};
use shelfgraph_migrate::MigrationConfig;

/// Command-line arguments for shelfgraph.
#[derive(Parser, Debug)]
#[command(name = "shelfgraph")]
#[command(version, about = "Migrate a library snapshot into a property graph", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Back up the source, migrate it into the target and verify the result.
    Migrate(MigrateArgs),

    /// Show the source layout and row counts without writing anything.
    Inspect {
        /// SQLite snapshot to inspect.
        #[arg(short, long, default_value = DEFAULT_SOURCE)]
        source: PathBuf,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Recompute a backup's digest and compare it with its manifest.
    VerifyBackup {
        /// Backup file (its `.manifest.json` must sit next to it).
        path: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
pub struct MigrateArgs {
    /// SQLite snapshot to migrate.
    #[arg(short, long, default_value = DEFAULT_SOURCE)]
    pub source: PathBuf,

    /// Graph store directory.
    #[arg(short, long, default_value = DEFAULT_TARGET)]
    pub target: PathBuf,

    /// Directory receiving the pre-migration backup.
    #[arg(long, default_value = DEFAULT_BACKUP_DIR)]
    pub backup_dir: PathBuf,

    /// Writes per store batch.
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Records compared from each end of every collection.
    #[arg(long, default_value_t = DEFAULT_SAMPLE_SIZE)]
    pub sample_size: usize,

    /// Write the run report as JSON to this path.
    #[arg(long)]
    pub report: Option<PathBuf>,
}

impl MigrateArgs {
    /// Convert command-line arguments to a migration configuration.
    pub fn into_config(self) -> (MigrationConfig, Option<PathBuf>) {
        let config = MigrationConfig::new(self.source, self.target)
            .with_backup_dir(self.backup_dir)
            .with_batch_size(self.batch_size)
            .with_sample_size(self.sample_size);
        (config, self.report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_defaults() {
        let args = Args::try_parse_from(["shelfgraph", "migrate"]).unwrap();
        let Command::Migrate(migrate) = args.command else {
            panic!("expected migrate");
        };
        let (config, report) = migrate.into_config();
        assert_eq!(config, MigrationConfig::default());
        assert!(report.is_none());
    }

    #[test]
    fn test_migrate_overrides() {
        let args = Args::try_parse_from([
            "shelfgraph",
            "migrate",
            "--source",
            "snap.db",
            "--target",
            "out",
            "--batch-size",
            "0",
            "--sample-size",
            "2",
            "--report",
            "run.json",
        ])
        .unwrap();
        let Command::Migrate(migrate) = args.command else {
            panic!("expected migrate");
        };
        let (config, report) = migrate.into_config();
        assert_eq!(config.source, PathBuf::from("snap.db"));
        assert_eq!(config.target, PathBuf::from("out"));
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.sample_size, 2);
        assert_eq!(report, Some(PathBuf::from("run.json")));
    }

    #[test]
    fn test_verify_backup_requires_path() {
        assert!(Args::try_parse_from(["shelfgraph", "verify-backup"]).is_err());
        let args = Args::try_parse_from(["shelfgraph", "verify-backup", "b.db"]).unwrap();
        assert!(matches!(args.command, Command::VerifyBackup { .. }));
    }
}
