//! TapeHSM connector maintenance tool

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tapehsm_connector::sys::LibDm;
use tapehsm_connector::{Connector, ConnectorConfig, FileInfo};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "thsm-connector")]
#[command(about = "TapeHSM DMAPI connector maintenance", long_about = None)]
struct Cli {
    /// Connector configuration (.toml or .json)
    #[arg(short, long, env = "THSM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reclaim sessions left behind by a previous run
    Cleanup,
    /// Print the migration state of files
    InfoFiles {
        /// Read file names from this list, one per line
        #[arg(short = 'f', long = "file-list", conflicts_with = "paths")]
        file_list: Option<PathBuf>,
        /// Print JSON records instead of table rows
        #[arg(long)]
        json: bool,
        paths: Vec<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<ConnectorConfig> {
    match path {
        Some(p) => ConnectorConfig::from_file(p)
            .with_context(|| format!("loading configuration from {}", p.display())),
        None => Ok(ConnectorConfig::default()),
    }
}

fn cleanup(config: ConnectorConfig) -> Result<()> {
    let config = ConnectorConfig {
        cleanup_on_start: true,
        ..config
    };
    let connector = Connector::new(config, Arc::new(LibDm::new()))?;
    if let Some(report) = connector.cleanup_report() {
        println!(
            "examined {} sessions, {} matched, {} tokens aborted, {} destroyed, {} failed",
            report.examined,
            report.matched,
            report.tokens_aborted,
            report.destroyed.len(),
            report.failed.len()
        );
    }
    connector.shutdown()?;
    Ok(())
}

fn info_files(
    config: ConnectorConfig,
    file_list: Option<PathBuf>,
    json: bool,
    paths: Vec<PathBuf>,
) -> Result<()> {
    let names: Vec<PathBuf> = match file_list {
        Some(list) => {
            let file = std::fs::File::open(&list)
                .with_context(|| format!("opening file list {}", list.display()))?;
            BufReader::new(file)
                .lines()
                .map(|l| l.map(PathBuf::from))
                .collect::<std::io::Result<_>>()?
        }
        None => paths,
    };
    if names.is_empty() {
        bail!("no files given");
    }

    let connector = Connector::new(config, Arc::new(LibDm::new()))?;
    if !json {
        println!("{}", FileInfo::header());
    }
    for name in names {
        let Ok(path) = std::fs::canonicalize(&name) else {
            tracing::debug!(path = %name.display(), "skipping unresolvable name");
            continue;
        };
        let Some(info) = FileInfo::gather(connector.session(), &path) else {
            continue;
        };
        if json {
            println!("{}", serde_json::to_string(&info)?);
        } else {
            println!("{}", info);
        }
    }
    connector.shutdown()?;
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Cleanup => cleanup(config),
        Command::InfoFiles {
            file_list,
            json,
            paths,
        } => info_files(config, file_list, json, paths),
    }
}
