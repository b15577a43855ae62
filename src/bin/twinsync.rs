//! twinsync CLI - transform CSV batches into twin-graph documents and
//! dry-run their reconciliation against an in-memory graph.

use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use twinsync::{
    sync_batch, BatchSource, ErrorReport, FailurePolicy, MemoryStore, QueueMessage, Reconciler,
    RowIssue, SyncConfig, Throttle, Transformer,
};

/// CSV → digital-twin graph sync.
#[derive(Parser)]
#[command(name = "twinsync")]
#[command(author, version)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:
  twinsync transform widget.csv --model-version 2
  twinsync transform linksTo.csv --json
  twinsync apply widget.csv linksTo.csv")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// JSON config file (missing fields take their defaults)
    #[arg(short, long, global = true, env = "TWINSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Raise log level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Record bad rows and keep going instead of failing the batch
    #[arg(long, global = true)]
    keep_going: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Print one encoded queue message per document
    Transform {
        /// CSV batch
        csv: PathBuf,

        #[command(flatten)]
        batch: BatchArgs,

        /// Print the JSON document instead of the encoded message
        #[arg(long)]
        json: bool,
    },

    /// Transform and reconcile batches, in order, against an empty in-memory graph
    Apply {
        /// CSV batches; twins before the relationships that connect them
        #[arg(required = true)]
        csv: Vec<PathBuf>,

        #[command(flatten)]
        batch: BatchArgs,

        /// Print outcomes as JSON lines
        #[arg(long)]
        json: bool,

        /// Skip the pre-call delays
        #[arg(long)]
        no_throttle: bool,
    },
}

#[derive(Args)]
struct BatchArgs {
    /// Batch name (defaults to the file stem)
    #[arg(short, long)]
    name: Option<String>,

    /// Model version for synthesized model references
    #[arg(long)]
    model_version: Option<String>,
}

impl BatchArgs {
    fn source_for(&self, path: &Path) -> anyhow::Result<BatchSource> {
        let name = match &self.name {
            Some(name) => name.clone(),
            None => path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(str::to_owned)
                .with_context(|| format!("cannot derive a batch name from {}", path.display()))?,
        };
        let source = BatchSource::new(name);
        Ok(match &self.model_version {
            Some(v) => source.with_version(v.clone()),
            None => source,
        })
    }
}

fn setup_logging(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<SyncConfig> {
    let Some(path) = path else {
        return Ok(SyncConfig::default());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    SyncConfig::from_json_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn open(path: &Path) -> anyhow::Result<BufReader<File>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    Ok(BufReader::new(file))
}

fn report_issues(batch: &str, label: &str, issues: &[RowIssue]) {
    for issue in issues {
        let report = ErrorReport::from(issue);
        eprintln!("{batch}: row {}: {label}: {}", report.row, report.message);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let mut config = load_config(cli.config.as_deref())?;
    if cli.keep_going {
        config.failure_policy = FailurePolicy::ReportAndContinue;
    }
    let transformer = Transformer::new(config.clone());
    let mut out = std::io::stdout().lock();

    match cli.command {
        Command::Transform { csv, batch, json } => {
            let source = batch.source_for(&csv)?;
            let report = transformer.transform_csv(&source, open(&csv)?)?;
            for doc in &report.documents {
                if json {
                    writeln!(out, "{}", doc.to_json_string()?)?;
                } else {
                    let message = QueueMessage::encode(doc, config.max_message_bytes)?;
                    writeln!(out, "{}", message.body())?;
                }
            }
            report_issues(&report.batch, "warning", &report.warnings);
            report_issues(&report.batch, "failed", &report.failures);
        }
        Command::Apply { csv, batch, json, no_throttle } => {
            if batch.name.is_some() && csv.len() > 1 {
                bail!("--name applies to a single batch");
            }
            let store = Arc::new(MemoryStore::new());
            let mut reconciler = Reconciler::new(store.clone(), &config);
            if no_throttle {
                reconciler = reconciler.with_throttle(Throttle::none());
            }

            for path in &csv {
                let source = batch.source_for(path)?;
                let summary = sync_batch(&transformer, &reconciler, &source, open(path)?).await?;
                for outcome in &summary.outcomes {
                    if json {
                        writeln!(out, "{}", serde_json::to_string(outcome)?)?;
                    } else {
                        writeln!(out, "{}\t{}\t{:?}", outcome.kind, outcome.id, outcome.action)?;
                    }
                }
                report_issues(&summary.batch, "warning", &summary.warnings);
                report_issues(&summary.batch, "failed", &summary.failures);
            }
            eprintln!("{} twins, {} relationships", store.twin_count(), store.relationship_count());
        }
    }
    Ok(())
}
