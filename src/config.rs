use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{io_helper::RetryPolicy, port::PortRange};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "storage-migrate",
    about = "Keep browser storage attached to the local app origin across port changes",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Relocate storage generations to the given port.
    Migrate(MigrateArgs),

    /// Show the newest storage generation of every backend.
    Scan(ScanArgs),

    /// Pick a free port, migrate storage to it and remember it.
    Prepare(ReportArgs),
}

#[derive(Args, Debug, Clone)]
pub struct MigrateArgs {
    #[arg(long, value_name = "PORT", value_parser = clap::value_parser!(u16).range(1..))]
    pub port: u16,

    /// Port served before an in-place restart; switches to copy semantics.
    #[arg(long, value_name = "PORT", value_parser = clap::value_parser!(u16).range(1..))]
    pub last_port: Option<u16>,

    #[command(flatten)]
    pub report: ReportArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ReportArgs {
    /// Exit non-zero when any backend failed to migrate.
    #[arg(long)]
    pub strict: bool,

    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ScanArgs {
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long,
        global = true,
        env = "STORAGE_MIGRATE_USER_DATA_DIR",
        value_name = "PATH",
        default_value = "./user-data"
    )]
    pub user_data_dir: PathBuf,

    #[arg(
        long = "io-retry-attempts",
        global = true,
        env = "STORAGE_MIGRATE_IO_RETRY_ATTEMPTS",
        value_name = "N",
        default_value_t = 5,
        value_parser = clap::value_parser!(u32).range(1..=20)
    )]
    pub io_retry_attempts: u32,

    #[arg(
        long = "io-retry-delay-ms",
        global = true,
        env = "STORAGE_MIGRATE_IO_RETRY_DELAY_MS",
        value_name = "MS",
        default_value_t = 100,
        value_parser = clap::value_parser!(u64).range(1..=10_000)
    )]
    pub io_retry_delay_ms: u64,

    #[arg(
        long = "port-range-start",
        global = true,
        env = "STORAGE_MIGRATE_PORT_RANGE_START",
        value_name = "PORT",
        default_value_t = 57200,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub port_range_start: u16,

    #[arg(
        long = "port-range-end",
        global = true,
        env = "STORAGE_MIGRATE_PORT_RANGE_END",
        value_name = "PORT",
        default_value_t = 57400,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub port_range_end: u16,
}

impl Config {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.io_retry_attempts,
            delay: Duration::from_millis(self.io_retry_delay_ms),
        }
    }

    pub fn port_range(&self) -> PortRange {
        PortRange {
            start: self.port_range_start,
            end: self.port_range_end,
            ..PortRange::default()
        }
    }
}
