use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "crystal",
    about = "Inspect Crystal snapshots, journals, storages and configurations",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Check a snapshot file against its waypoint
    Verify(VerifyArgs),
    /// List journal books and the gaps between them
    Books(BooksArgs),
    /// Report blob count and usage of a storage directory
    Storage(StorageArgs),
    /// Parse a registry configuration file and print it back
    Config(ConfigArgs),
}

#[derive(Args)]
pub struct VerifyArgs {
    /// Snapshot file; its waypoint is expected next to it
    pub snapshot: PathBuf,
}

#[derive(Args)]
pub struct BooksArgs {
    /// Journal directory
    pub directory: PathBuf,
}

#[derive(Args)]
pub struct StorageArgs {
    /// Storage directory
    pub directory: PathBuf,
    /// Capacity in bytes, for the usage ratio
    #[arg(long, default_value = "0")]
    pub capacity: u64,
}

#[derive(Args)]
pub struct ConfigArgs {
    /// TOML registry configuration
    pub file: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_verify() {
        let cli = Cli::try_parse_from(["crystal", "verify", "data/root.bin"]).unwrap();
        match cli.command {
            Command::Verify(args) => assert_eq!(args.snapshot, PathBuf::from("data/root.bin")),
            _ => panic!("expected verify"),
        }
        assert_eq!(cli.format, OutputFormat::Text);
    }

    #[test]
    fn parse_global_flags_after_subcommand() {
        let cli =
            Cli::try_parse_from(["crystal", "books", "journal", "--format", "json", "-v"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.format, OutputFormat::Json);
        assert!(matches!(cli.command, Command::Books(_)));
    }

    #[test]
    fn parse_storage_capacity() {
        let cli =
            Cli::try_parse_from(["crystal", "storage", "blobs", "--capacity", "4096"]).unwrap();
        if let Command::Storage(args) = cli.command {
            assert_eq!(args.capacity, 4096);
        } else {
            panic!("expected storage");
        }
    }

    #[test]
    fn missing_argument_rejected() {
        assert!(Cli::try_parse_from(["crystal", "config"]).is_err());
    }
}
