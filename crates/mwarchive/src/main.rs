use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use mwarchive_core::{
    Archiver, ArchiverConfig, Backend, FileStore, LoadedConfig, MediaWikiClient,
    MediaWikiClientConfig, NamespaceReport, Persister, RunAborted, SqliteStore, StorageTarget,
    resolve_config,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "mwarchive",
    version,
    about = "Archive the latest revision of MediaWiki pages into SQLite or a file tree"
)]
struct Cli {
    #[arg(
        long,
        value_name = "PATH",
        help = "Config file (default: $HOME/.mwarchiver.yaml)"
    )]
    config: Option<PathBuf>,
    #[arg(long, value_name = "URL", help = "MediaWiki api.php endpoint")]
    api_url: Option<String>,
    #[arg(long, value_name = "UA", help = "User-Agent header (empty to omit)")]
    user_agent: Option<String>,
    #[arg(
        long,
        value_name = "PATH",
        conflicts_with = "output_dir",
        help = "Archive into this SQLite database"
    )]
    db: Option<PathBuf>,
    #[arg(long, value_name = "DIR", help = "Archive into a write-once file tree")]
    output_dir: Option<PathBuf>,
    #[arg(
        short = 'n',
        long = "namespace",
        value_name = "ID",
        help = "Namespace to archive (repeatable)"
    )]
    namespaces: Vec<i32>,
    #[arg(
        long,
        value_name = "N",
        allow_negative_numbers = true,
        help = "Pages per namespace; 0 or less for all"
    )]
    limit: Option<i64>,
    #[arg(long, help = "Print the namespace reports as JSON")]
    json: bool,
    #[arg(long, help = "Print the resolved configuration before archiving")]
    diagnostics: bool,
    #[arg(
        short,
        long,
        action = ArgAction::Count,
        help = "Increase logging verbosity (-v, -vv)"
    )]
    verbose: u8,
    #[arg(short, long, conflicts_with = "verbose", help = "Only log errors")]
    quiet: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut ArchiverConfig) {
        if let Some(api_url) = &self.api_url {
            config.api_url = api_url.clone();
        }
        if let Some(user_agent) = &self.user_agent {
            config.user_agent = user_agent.clone();
        }
        if let Some(db) = &self.db {
            config.backend = Some(Backend::Sqlite);
            config.db_path = db.to_string_lossy().into_owned();
        }
        if let Some(output_dir) = &self.output_dir {
            config.backend = Some(Backend::Files);
            config.output_path = output_dir.to_string_lossy().into_owned();
        }
        if !self.namespaces.is_empty() {
            config.namespaces = self.namespaces.clone();
        }
        if let Some(limit) = self.limit {
            config.limit = limit;
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    setup_logging(cli.verbose, cli.quiet);

    let LoadedConfig { mut config, source } = resolve_config(cli.config.as_deref())?;
    if let Some(path) = &source {
        info!(path = %path.display(), "using config file");
    }
    cli.apply_overrides(&mut config);
    config.validate()?;

    if cli.diagnostics {
        println!(
            "{}",
            serde_json::to_string_pretty(&config).context("failed to render config")?
        );
    }

    let client = MediaWikiClient::new(MediaWikiClientConfig::from_config(&config))?;
    let outcome = match config.storage_target()? {
        StorageTarget::Sqlite(db_path) => {
            let store = SqliteStore::open(&db_path).with_context(|| {
                format!("failed to open archive database {}", db_path.display())
            })?;
            run_archive(client, store, &config)
        }
        StorageTarget::Files(root) => run_archive(client, FileStore::new(root), &config),
    };

    match outcome {
        Ok(reports) => print_reports(&reports, cli.json),
        Err(aborted) => {
            // Namespaces finished before the failure are already committed.
            print_reports(&aborted.completed, cli.json)?;
            Err(anyhow::Error::new(aborted).context("archive run aborted"))
        }
    }
}

fn run_archive<P: Persister>(
    client: MediaWikiClient,
    store: P,
    config: &ArchiverConfig,
) -> std::result::Result<Vec<NamespaceReport>, RunAborted> {
    let mut archiver = Archiver::new(client, store);
    archiver.archive_all(&config.namespaces, config.limit)
}

fn print_reports(reports: &[NamespaceReport], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(reports)?);
    } else {
        for report in reports {
            print_report(report);
        }
    }
    Ok(())
}

fn print_report(report: &NamespaceReport) {
    println!(
        "namespace {}: listed={} archived={} skipped={} failed={} requests={}",
        report.namespace,
        report.listed,
        report.archived,
        report.skipped,
        report.failed,
        report.request_count
    );
    for failure in &report.failures {
        println!(
            "  failed {} {}: {}",
            failure.page_id, failure.title, failure.error
        );
    }
}

fn setup_logging(verbose: u8, quiet: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if quiet {
            EnvFilter::new("error")
        } else {
            match verbose {
                0 => EnvFilter::new("mwarchive=info,mwarchive_core=info,warn"),
                1 => EnvFilter::new("mwarchive=debug,mwarchive_core=debug,info"),
                _ => EnvFilter::new("trace"),
            }
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
