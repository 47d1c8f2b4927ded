use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use storage_migrate::{
    config::{Cli, Command, Config, MigrateArgs, ReportArgs, ScanArgs},
    events::{EventsBus, spawn_storage_migrator},
    io_helper::find_newest_entry,
    migration::{MigrationReport, StorageMigrationEngine},
    port::{PortFile, find_free_port},
    storage::{StorageBackend, extract_port},
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Migrate(args) => migrate(&cli.config, args).await,
        Command::Scan(args) => scan(&cli.config, args).await,
        Command::Prepare(args) => prepare(&cli.config, args).await,
    }
}

fn engine(config: &Config) -> StorageMigrationEngine {
    StorageMigrationEngine::new(
        StorageBackend::builtin(&config.user_data_dir),
        config.retry_policy(),
    )
}

async fn migrate(config: &Config, args: MigrateArgs) -> Result<()> {
    let report = engine(config).migrate(args.port, args.last_port).await;
    print_report(&report, &args.report)
}

async fn prepare(config: &Config, args: ReportArgs) -> Result<()> {
    let port_file = PortFile::new(&config.user_data_dir);
    let last_used = port_file.load(config.port_range());
    let port = find_free_port(config.port_range(), last_used)?;

    let (bus, rx) = EventsBus::new(1);
    let migrator = spawn_storage_migrator(Arc::new(engine(config)), rx);
    let report = bus.before_load_url(port, None).await;
    drop(bus);
    migrator.await.context("storage migrator task")?;

    if let Err(err) = port_file.save(port) {
        // Only costs a migration on the next launch.
        warn!(error = %err, "could not save port");
    }
    info!(port, "ready to load http://127.0.0.1:{port}/");

    match report {
        Some(report) => print_report(&report, &args)?,
        None => println!("{port}"),
    }
    Ok(())
}

fn print_report(report: &MigrationReport, args: &ReportArgs) -> Result<()> {
    if args.json {
        let out = serde_json::to_string_pretty(&report.to_view()).context("serialize report")?;
        println!("{out}");
    } else {
        for b in report.to_view().backends {
            match b.error {
                Some(err) => println!("{}\t{}\t{err}", b.backend, b.status),
                None => println!("{}\t{}", b.backend, b.status),
            }
        }
        println!("port\t{}", report.target_port);
    }

    if args.strict && !report.is_success() {
        anyhow::bail!("storage migration to port {} failed", report.target_port);
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct ScanView {
    backend: &'static str,
    root: String,
    entries: usize,
    newest: Option<String>,
    newest_port: Option<u16>,
    modified_at: Option<DateTime<Utc>>,
}

async fn scan(config: &Config, args: ScanArgs) -> Result<()> {
    let mut views = Vec::new();
    for backend in StorageBackend::builtin(&config.user_data_dir) {
        let scan = find_newest_entry(&backend.root, |name| backend.matches(name))
            .await
            .with_context(|| format!("scan {}", backend.root.display()))?;
        views.push(ScanView {
            backend: backend.kind.as_str(),
            root: backend.root.display().to_string(),
            entries: scan.entries.iter().filter(|e| backend.matches(&e.name)).count(),
            newest_port: scan.newest.as_ref().and_then(|e| extract_port(&e.name)),
            modified_at: scan.newest.as_ref().map(|e| DateTime::<Utc>::from(e.modified)),
            newest: scan.newest.map(|e| e.name),
        });
    }

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&views).context("serialize scan")?
        );
    } else {
        for v in views {
            println!(
                "{}\t{}\t{}",
                v.backend,
                v.newest.as_deref().unwrap_or("-"),
                v.newest_port.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())
            );
        }
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
