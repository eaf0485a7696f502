//! Exocortex CLI
//!
//! Operator surface for the memory engine: ingest, import, stats, entity and
//! contradiction inspection, the HTTP server, and retrieval-regression runs.

mod agent;
mod http;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use exocortex_core::maintenance::export::{export_encrypted, import_encrypted};
use exocortex_core::regression::{self, RegressionOptions};
use exocortex_core::{
    ContradictionStatus, CreateMemoryInput, HashingProvider, ImportRecord, MemorySource,
    Scheduler, Store,
};

/// Exocortex - personal memory engine
#[derive(Parser)]
#[command(name = "exocortex")]
#[command(version = exocortex_core::VERSION)]
#[command(about = "Local personal memory engine with hybrid retrieval")]
#[command(long_about = "Exocortex stores textual memories in a single local file and answers \
ranked hybrid queries over them.\n\nEnvironment:\n  EXOCORTEX_DB_PATH    override the store location\n  \
EXOCORTEX_MODEL_DIR  model cache for embedding providers\n  EXOCORTEX_HOST       bind interface for serve")]
struct Cli {
    /// Store path (defaults to EXOCORTEX_DB_PATH or the platform data dir)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a memory
    Add {
        /// Content to remember
        content: String,
        /// Tags (comma-separated)
        #[arg(long)]
        tags: Option<String>,
        /// Content type (text, conversation, note, summary)
        #[arg(long, default_value = "text")]
        content_type: String,
        /// Importance in [0,1]
        #[arg(long)]
        importance: Option<f64>,
        /// Source URI
        #[arg(long)]
        source_uri: Option<String>,
    },

    /// Import records from a JSON or JSONL file
    Import {
        /// Path to the records file
        file: PathBuf,
        /// Input format: json or jsonl
        #[arg(long, default_value = "json")]
        format: String,
    },

    /// Show store statistics
    Stats,

    /// List entities by memory count
    Entities {
        #[arg(long, default_value = "25")]
        limit: usize,
    },

    /// List or resolve contradictions
    Contradictions {
        /// Filter: pending, resolved, dismissed
        #[arg(long)]
        status: Option<String>,
        /// Resolve a contradiction by id
        #[arg(long)]
        resolve: Option<String>,
        /// Resolution note (with --resolve)
        #[arg(long)]
        note: Option<String>,
    },

    /// Run the HTTP API (and the maintenance scheduler)
    Serve {
        /// Bind interface (EXOCORTEX_HOST overrides the default)
        #[arg(long, env = "EXOCORTEX_HOST", default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value = "8275")]
        port: u16,
        /// Disable the background maintenance scheduler
        #[arg(long)]
        no_scheduler: bool,
    },

    /// Speak the line-delimited JSON agent protocol over stdio
    Agent,

    /// Run retrieval-regression against the golden queries
    RetrievalRegression {
        /// Per-query result depth
        #[arg(long)]
        limit: Option<usize>,
        /// Replace baselines with this run's results
        #[arg(long)]
        update_baselines: bool,
        /// Promote a previous run's results to baselines
        #[arg(long)]
        promote: Option<String>,
        /// Delete all baselines
        #[arg(long)]
        reset: bool,
        /// Exit non-zero when any query alerts
        #[arg(long)]
        fail_on_alert: bool,
    },

    /// Write an encrypted export of the whole store
    Export {
        output: PathBuf,
        /// Password for the encrypted container
        #[arg(long)]
        password: String,
    },

    /// Import an encrypted export
    Restore {
        input: PathBuf,
        #[arg(long)]
        password: String,
    },
}

fn open_store(db: Option<PathBuf>) -> anyhow::Result<Store> {
    let store = Store::open(db)?;
    let dims = store.setting_i64("embedding.dimensions", 0);
    let dims = if dims > 0 { dims as usize } else { 256 };
    store.set_embedding_provider(Arc::new(HashingProvider::new(dims)));
    Ok(store)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Add {
            content,
            tags,
            content_type,
            importance,
            source_uri,
        } => run_add(cli.db, content, tags, content_type, importance, source_uri),
        Commands::Import { file, format } => run_import(cli.db, file, format),
        Commands::Stats => run_stats(cli.db),
        Commands::Entities { limit } => run_entities(cli.db, limit),
        Commands::Contradictions {
            status,
            resolve,
            note,
        } => run_contradictions(cli.db, status, resolve, note),
        Commands::Serve {
            host,
            port,
            no_scheduler,
        } => run_serve(cli.db, host, port, !no_scheduler),
        Commands::Agent => {
            let store = Arc::new(open_store(cli.db)?);
            agent::run(store)
        }
        Commands::RetrievalRegression {
            limit,
            update_baselines,
            promote,
            reset,
            fail_on_alert,
        } => run_regression_cmd(cli.db, limit, update_baselines, promote, reset, fail_on_alert),
        Commands::Export { output, password } => run_export(cli.db, output, password),
        Commands::Restore { input, password } => run_restore(cli.db, input, password),
    }
}

fn run_add(
    db: Option<PathBuf>,
    content: String,
    tags: Option<String>,
    content_type: String,
    importance: Option<f64>,
    source_uri: Option<String>,
) -> anyhow::Result<()> {
    let store = open_store(db)?;
    let tags = tags
        .map(|t| t.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_default();

    let result = store.create_memory(CreateMemoryInput {
        content,
        content_type: exocortex_core::ContentType::parse_name(&content_type),
        source: MemorySource::Cli,
        source_uri,
        importance,
        tags,
        ..Default::default()
    })?;

    match result.dedup_action.as_deref() {
        Some("skipped") => println!(
            "{} existing memory {} (tags merged)",
            "DEDUP".yellow().bold(),
            result.memory.id
        ),
        _ => {
            println!("{} {}", "ADDED".green().bold(), result.memory.id);
            if let Some(old) = result.superseded_id {
                println!("  superseded {}", old.dimmed());
            }
            if let Some(chunks) = result.chunk_count {
                println!("  chunked into {} pieces", chunks);
            }
        }
    }
    Ok(())
}

fn run_import(db: Option<PathBuf>, file: PathBuf, format: String) -> anyhow::Result<()> {
    let store = open_store(db)?;
    let raw = std::fs::read_to_string(&file)?;

    let records: Vec<ImportRecord> = match format.as_str() {
        "jsonl" => raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?,
        _ => serde_json::from_str(&raw)?,
    };

    println!("Importing {} records from {}", records.len(), file.display());
    let report = store.import_records(records)?;
    println!(
        "{}: {} created, {} skipped, {} failed",
        "DONE".green().bold(),
        report.created,
        report.skipped,
        report.failed
    );
    if report.failed > 0 {
        anyhow::bail!("{} records failed to import", report.failed);
    }
    Ok(())
}

fn run_stats(db: Option<PathBuf>) -> anyhow::Result<()> {
    let store = open_store(db)?;
    let stats = store.stats()?;

    println!("{}", "=== Exocortex Statistics ===".cyan().bold());
    println!();
    println!("{}: {}", "Memories".white().bold(), stats.total_memories);
    println!("  active:   {}", stats.active_memories);
    println!("  archived: {}", stats.archived_memories);
    println!("  embedded: {}", stats.memories_with_embeddings);
    println!("{}: {}", "Entities".white().bold(), stats.total_entities);
    println!("{}: {}", "Links".white().bold(), stats.total_memory_links);
    println!(
        "{}: {} ({} active)",
        "Goals".white().bold(),
        stats.total_goals,
        stats.active_goals
    );
    println!(
        "{}: {}",
        "Pending contradictions".white().bold(),
        stats.pending_contradictions
    );
    println!("{}: {}", "Accesses".white().bold(), stats.total_accesses);
    println!(
        "{}: {:.1} KiB",
        "Store size".white().bold(),
        stats.db_size_bytes as f64 / 1024.0
    );
    Ok(())
}

fn run_entities(db: Option<PathBuf>, limit: usize) -> anyhow::Result<()> {
    let store = open_store(db)?;
    let entities = store.list_entities(limit)?;

    if entities.is_empty() {
        println!("{}", "No entities yet.".dimmed());
        return Ok(());
    }
    for entity in entities {
        let aliases = if entity.aliases.is_empty() {
            String::new()
        } else {
            format!(" ({})", entity.aliases.join(", ")).dimmed().to_string()
        };
        println!(
            "{:12} {}{}",
            entity.entity_type.as_str().blue(),
            entity.name.bold(),
            aliases
        );
    }
    Ok(())
}

fn run_contradictions(
    db: Option<PathBuf>,
    status: Option<String>,
    resolve: Option<String>,
    note: Option<String>,
) -> anyhow::Result<()> {
    let store = open_store(db)?;

    if let Some(id) = resolve {
        store.set_contradiction_status(&id, ContradictionStatus::Resolved, note.as_deref())?;
        println!("{} {}", "RESOLVED".green().bold(), id);
        return Ok(());
    }

    let status = status.map(|s| ContradictionStatus::parse_name(&s));
    let contradictions = store.list_contradictions(status)?;
    if contradictions.is_empty() {
        println!("{}", "No contradictions.".dimmed());
        return Ok(());
    }

    for c in contradictions {
        let badge = match c.status {
            ContradictionStatus::Pending => "PENDING".yellow().bold(),
            ContradictionStatus::Resolved => "RESOLVED".green().bold(),
            ContradictionStatus::Dismissed => "DISMISSED".dimmed().bold(),
        };
        println!("{} {} {}", badge, c.id, c.description);
        println!("  a: {}", c.memory_a_id.dimmed());
        println!("  b: {}", c.memory_b_id.dimmed());
    }
    Ok(())
}

fn run_serve(
    db: Option<PathBuf>,
    host: String,
    port: u16,
    with_scheduler: bool,
) -> anyhow::Result<()> {
    let store = Arc::new(open_store(db)?);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        if with_scheduler {
            let scheduler = Arc::new(Scheduler::new(Arc::clone(&store)));
            tokio::spawn(scheduler.run());
        }

        let addr = format!("{}:{}", host, port);
        println!("{} http://{}", "SERVING".green().bold(), addr);
        http::serve(store, &addr).await
    })
}

fn run_regression_cmd(
    db: Option<PathBuf>,
    limit: Option<usize>,
    update_baselines: bool,
    promote: Option<String>,
    reset: bool,
    fail_on_alert: bool,
) -> anyhow::Result<()> {
    let store = open_store(db)?;

    if reset {
        let deleted = regression::reset_baselines(&store, None)?;
        println!("{} {} baselines deleted", "RESET".yellow().bold(), deleted);
        return Ok(());
    }
    if let Some(run_id) = promote {
        let promoted = regression::promote_from_run(&store, &run_id)?;
        println!("{} {} baselines promoted", "PROMOTED".green().bold(), promoted);
        return Ok(());
    }

    let report = regression::run_regression(
        &store,
        &RegressionOptions {
            limit,
            update_baselines,
            ..Default::default()
        },
    )?;

    println!(
        "{} run {} over {} golden queries",
        "REGRESSION".cyan().bold(),
        report.run_id,
        report.results.len()
    );
    for result in &report.results {
        let badge = if result.initialized {
            "INIT".blue().bold()
        } else if result.alert {
            "ALERT".red().bold()
        } else {
            "OK".green().bold()
        };
        println!(
            "  {} '{}' overlap {:.2} shift {:.2}",
            badge, result.query, result.overlap, result.avg_rank_shift
        );
    }

    if fail_on_alert && report.alerts > 0 {
        anyhow::bail!("{} regression alert(s)", report.alerts);
    }
    Ok(())
}

fn run_export(db: Option<PathBuf>, output: PathBuf, password: String) -> anyhow::Result<()> {
    let store = open_store(db)?;
    let sealed = export_encrypted(&store, &password)?;
    std::fs::write(&output, &sealed)?;
    println!(
        "{} {} ({} bytes)",
        "EXPORTED".green().bold(),
        output.display(),
        sealed.len()
    );
    Ok(())
}

fn run_restore(db: Option<PathBuf>, input: PathBuf, password: String) -> anyhow::Result<()> {
    let store = open_store(db)?;
    let sealed = std::fs::read(&input)?;
    let report = import_encrypted(&store, &sealed, &password)?;
    println!(
        "{} {} memories, {} entities, {} goals",
        "RESTORED".green().bold(),
        report.memories,
        report.entities,
        report.goals
    );
    Ok(())
}
