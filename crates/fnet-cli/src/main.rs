use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fnet_adapters::load_disclosure;
use fnet_storage::{DocumentStore, PgDocumentStore};
use fnet_sync::{SyncConfig, SyncPipeline};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "fnet-cli")]
#[command(about = "FNET document registry sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one incremental ingestion (default).
    Sync,
    /// Apply database migrations.
    Migrate,
    /// Run the sync on the configured cron schedule until Ctrl-C.
    Schedule,
    /// Print every persisted document id, one per line.
    DocumentIds {
        #[arg(long = "exclude", value_name = "ID")]
        exclude: Vec<i64>,
    },
    /// Decode disclosure XML files (or directories of them) to JSON lines.
    ParseXml {
        #[arg(required = true, value_name = "PATH")]
        paths: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let env_errors = load_env_files(&[Path::new(".env.dev"), Path::new(".env")]);
    init_tracing();
    for (file, err) in &env_errors {
        warn!(file = %file.display(), error = %err, "could not load env file");
    }

    let cli = Cli::parse();
    match run(cli.command.unwrap_or(Commands::Sync)).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = ?err, "command failed");
            ExitCode::FAILURE
        }
    }
}

/// Loads each existing file in turn. Errors are returned rather than logged
/// because the env files may configure the subscriber.
fn load_env_files(files: &[&Path]) -> Vec<(PathBuf, dotenvy::Error)> {
    files
        .iter()
        .filter(|file| file.exists())
        .filter_map(|file| {
            dotenvy::from_filename(file)
                .err()
                .map(|err| (file.to_path_buf(), err))
        })
        .collect()
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

async fn run(command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Sync => {
            let config = SyncConfig::from_env()?;
            let pipeline = Arc::new(SyncPipeline::connect(config).await?);
            let report = pipeline.run_once().await;
            println!("{}", report.summary_line());
            let code = if report.succeeded() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            };

            if let Some(sched) = pipeline.maybe_build_scheduler().await? {
                info!("scheduler enabled; staying up for scheduled runs");
                run_scheduler(sched).await?;
            }
            Ok(code)
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            let store = PgDocumentStore::connect(&config.database_url, 1)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Schedule => {
            let config = SyncConfig::from_env()?;
            let pipeline = Arc::new(SyncPipeline::connect(config).await?);
            let sched = pipeline.build_scheduler().await?;
            info!(
                cron_1 = %pipeline.config().sync_cron_1,
                cron_2 = %pipeline.config().sync_cron_2,
                "scheduler starting"
            );
            run_scheduler(sched).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::DocumentIds { exclude } => {
            let config = SyncConfig::from_env()?;
            let store = PgDocumentStore::connect(&config.database_url, 1)
                .await
                .context("connecting to postgres")?;
            let mut chunks = store.persisted_document_ids(exclude, config.id_chunk_size);
            while let Some(chunk) = chunks.next_chunk().await? {
                for id in chunk {
                    println!("{id}");
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::ParseXml { paths } => parse_xml(&paths),
    }
}

async fn run_scheduler(mut sched: tokio_cron_scheduler::JobScheduler) -> Result<()> {
    sched.start().await.context("starting scheduler")?;
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

fn parse_xml(paths: &[PathBuf]) -> Result<ExitCode> {
    let mut failures = 0_usize;
    for path in expand_xml_paths(paths)? {
        match load_disclosure(&path) {
            Ok(data) => {
                let line = serde_json::json!({
                    "path": path.display().to_string(),
                    "data": data,
                });
                println!("{line}");
            }
            Err(err) => {
                failures += 1;
                warn!(path = %path.display(), error = ?err, "could not decode disclosure");
            }
        }
    }
    Ok(if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Directories contribute their `.xml` files in name order.
fn expand_xml_paths(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut files = std::fs::read_dir(path)
                .with_context(|| format!("reading {}", path.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| {
                    p.is_file()
                        && p.extension()
                            .is_some_and(|ext| ext.eq_ignore_ascii_case("xml"))
                })
                .collect::<Vec<_>>();
            files.sort();
            out.extend(files);
        } else {
            out.push(path.clone());
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_to_sync_and_parses_excludes() {
        let cli = Cli::try_parse_from(["fnet-cli"]).unwrap();
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from(["fnet-cli", "document-ids", "--exclude", "3", "--exclude", "9"])
            .unwrap();
        match cli.command {
            Some(Commands::DocumentIds { exclude }) => assert_eq!(exclude, vec![3, 9]),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parse_xml_requires_a_path() {
        assert!(Cli::try_parse_from(["fnet-cli", "parse-xml"]).is_err());
    }

    #[test]
    fn malformed_env_file_is_reported() {
        let dir = std::env::temp_dir().join(format!("fnet-cli-env-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let broken = dir.join("broken.env");
        std::fs::write(&broken, "this is not an env line\n").unwrap();
        let missing = dir.join("missing.env");

        let errors = load_env_files(&[broken.as_path(), missing.as_path()]);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, broken);
        assert!(matches!(errors[0].1, dotenvy::Error::LineParse(..)));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn directories_expand_to_sorted_xml_files() {
        let dir = std::env::temp_dir().join(format!("fnet-cli-xml-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        for name in ["b.xml", "a.XML", "notes.txt"] {
            std::fs::write(dir.join(name), "<x/>").unwrap();
        }

        let expanded = expand_xml_paths(&[dir.clone()]).unwrap();
        let names: Vec<_> = expanded
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.XML", "b.xml"]);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
