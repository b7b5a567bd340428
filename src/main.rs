use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use neuromemo::config::{load_config, MAX_TOP_K};
use neuromemo::db::Database;

#[derive(Debug, Parser)]
#[command(name = "neuromemo")]
#[command(version)]
#[command(about = "Self-contained semantic memory engine: save and recall short notes by embedding similarity")]
struct Cli {
    /// Database basename (overrides the configured default).
    #[arg(short = 'f', long, global = true)]
    basename: Option<String>,

    /// Emit verbose progress lines to stderr.
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Embed TEXT and append it to the database, or overwrite an existing
    /// record in place when `--id` is given.
    Save {
        text: String,
        /// Inline flow-style metadata, e.g. `{source: user, tags: [a, b]}`.
        #[arg(short = 'm', long)]
        metadata: Option<String>,
        /// Overwrite the record at this id instead of appending a new one.
        #[arg(long)]
        id: Option<u64>,
    },
    /// Embed QUERY and return the most similar records.
    Recall {
        query: String,
        /// Number of results to return (capped at 100).
        #[arg(short = 'k', long)]
        k: Option<usize>,
        /// Flow-style filter expression pre-filtering candidates.
        #[arg(long)]
        filter: Option<String>,
    },
    /// Delete the database's sidecar files.
    Clean,
    /// Print summary statistics for the database.
    Analyze,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let repo_root = std::env::current_dir().context("failed to get current directory")?;
    let mut config = load_config(&repo_root);

    if let Some(basename) = &cli.basename {
        config.db_basename = basename.clone();
    }

    if cli.verbose {
        eprintln!(
            "[neuromemo] basename={} model={} tokenizer={}",
            config.db_basename,
            config.model_path.display(),
            config.tokenizer_path.display()
        );
    }

    match cli.cmd {
        Command::Save { text, metadata, id: Some(id) } => {
            let mut db = Database::open(&config).context("failed to open database")?;
            db.overwrite_record(id, &text, metadata.as_deref())
                .context("failed to overwrite record")?;
            println!("overwrote id={id}");
        }
        Command::Save { text, metadata, id: None } => {
            let mut db = Database::open(&config).context("failed to open database")?;
            let id = db
                .save_record(&text, metadata.as_deref())
                .context("failed to save record")?;
            println!("saved id={id}");
        }
        Command::Recall { query, k, filter } => {
            let mut db = Database::open(&config).context("failed to open database")?;
            let k = k.unwrap_or(config.default_top_k).min(MAX_TOP_K);
            let rows = db
                .recall(&query, k, filter.as_deref())
                .context("failed to recall")?;

            println!("id\tscore\ttext\tmetadata");
            for row in rows {
                if row.sentinel {
                    continue;
                }
                println!("{}\t{:.4}\t{}\t{}", row.id, row.score, row.text, row.metadata);
            }
        }
        Command::Clean => {
            let db = Database::open(&config).context("failed to open database")?;
            db.clean().context("failed to clean database")?;
            println!("cleaned basename={}", config.db_basename);
        }
        Command::Analyze => {
            let db = Database::open(&config).context("failed to open database")?;
            let summary = db.analyze();
            println!(
                "records={} dim={} metric={:?} with_metadata={}",
                summary.count, summary.dim, summary.metric, summary.with_metadata
            );
        }
    }

    Ok(())
}
