//! EmberDB CLI
//!
//! Command-line access to an environment directory: inspect, dump, load
//! and edit databases, force checkpoints, run recovery.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use emberdb::{
    AccessMethod, DbConfig, Duplicates, EnvConfig, Environment, PutFlags, Result, SeekMode,
};
use tracing_subscriber::{fmt, EnvFilter};

/// EmberDB CLI
#[derive(Parser, Debug)]
#[command(name = "ember-cli")]
#[command(about = "Inspect and edit an EmberDB environment")]
#[command(version)]
struct Args {
    /// Environment home directory
    #[arg(short = 'H', long, default_value = "./emberdb_data")]
    home: PathBuf,

    /// Page size in bytes (must match existing databases)
    #[arg(short, long, default_value = "4096")]
    page_size: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Environment and per-database statistics
    Stat,

    /// Print every pair of a database as `key<TAB>value`
    Dump {
        database: String,

        /// Start at the first key at or after this one
        #[arg(long)]
        from: Option<String>,
    },

    /// Read `key<TAB>value` lines from stdin into a database
    Load {
        database: String,

        /// Create a hash-ordered database
        #[arg(long)]
        hash: bool,

        /// Create a database with sorted duplicates
        #[arg(long)]
        dups: bool,
    },

    /// Get a value by key
    Get { database: String, key: String },

    /// Store a key-value pair
    Put {
        database: String,
        key: String,
        value: String,

        /// Fail if the key already exists
        #[arg(long)]
        no_overwrite: bool,
    },

    /// Delete a key
    Delete { database: String, key: String },

    /// Force a checkpoint
    Checkpoint,

    /// Open with recovery and report what it did
    Recover,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,emberdb=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        tracing::error!("{} (code {})", e, e.code());
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = EnvConfig::builder()
        .home(&args.home)
        .page_size(args.page_size)
        .build();
    let env = Environment::open(config)?;
    tracing::debug!("EmberDB v{} at {}", emberdb::VERSION, env.home().display());

    let mut out = io::stdout().lock();
    match args.command {
        Commands::Stat => {
            let stat = env.stat()?;
            writeln!(out, "last LSN:            {}", stat.last_lsn)?;
            writeln!(out, "durable LSN:         {}", stat.durable_lsn)?;
            writeln!(out, "checkpoints:         {}", stat.checkpoints)?;
            writeln!(out, "active transactions: {}", stat.active_transactions)?;
            writeln!(
                out,
                "cache:               {} hits, {} misses, {} evictions",
                stat.pool.hits, stat.pool.misses, stat.pool.evictions
            )?;
            for (id, name) in &stat.databases {
                match env.open_existing(name).and_then(|db| db.stat()) {
                    Ok(tree) => writeln!(
                        out,
                        "db {} {}: {} entries, height {}, {} leaf / {} internal / {} overflow / {} free pages",
                        id,
                        name,
                        tree.entries,
                        tree.height,
                        tree.leaf_pages,
                        tree.internal_pages,
                        tree.overflow_pages,
                        tree.free_pages
                    )?,
                    Err(e) => writeln!(out, "db {} {}: {}", id, name, e)?,
                }
            }
        }
        Commands::Dump { database, from } => {
            let db = env.open_existing(&database)?;
            let mut cursor = db.cursor(None)?;
            let first = match &from {
                Some(key) => cursor.position(key.as_bytes(), SeekMode::AtOrAfter),
                None => cursor.first(),
            };
            match first {
                Ok((key, value)) => print_pair(&mut out, &key, &value)?,
                Err(emberdb::EmberError::NotFound) => return Ok(()),
                Err(e) => return Err(e),
            }
            for (key, value) in cursor.collect()? {
                print_pair(&mut out, &key, &value)?;
            }
        }
        Commands::Load { database, hash, dups } => {
            let config = DbConfig::builder(database.as_str())
                .access_method(if hash { AccessMethod::Hash } else { AccessMethod::BTree })
                .duplicates(if dups { Duplicates::Sorted } else { Duplicates::Unique })
                .build();
            let db = env.open_database(config)?;
            let mut loaded = 0usize;
            for line in io::stdin().lock().lines() {
                let line = line?;
                let Some((key, value)) = line.split_once('\t') else {
                    tracing::warn!("skipping line without a tab: {:?}", line);
                    continue;
                };
                db.put(None, key.as_bytes(), value.as_bytes(), PutFlags::Overwrite)?;
                loaded += 1;
            }
            db.sync()?;
            writeln!(out, "loaded {} pairs into {}", loaded, database)?;
        }
        Commands::Get { database, key } => {
            let db = env.open_existing(&database)?;
            match db.get(None, key.as_bytes())? {
                Some(value) => writeln!(out, "{}", String::from_utf8_lossy(&value))?,
                None => {
                    writeln!(out, "(not found)")?;
                    return Err(emberdb::EmberError::NotFound);
                }
            }
        }
        Commands::Put {
            database,
            key,
            value,
            no_overwrite,
        } => {
            let db = match env.open_existing(&database) {
                Err(emberdb::EmberError::NotFound) => env.open_database(DbConfig::builder(database.as_str()).build())?,
                other => other?,
            };
            let flags = if no_overwrite { PutFlags::NoOverwrite } else { PutFlags::Overwrite };
            db.put(None, key.as_bytes(), value.as_bytes(), flags)?;
            writeln!(out, "OK")?;
        }
        Commands::Delete { database, key } => {
            let db = env.open_existing(&database)?;
            db.delete(None, key.as_bytes())?;
            writeln!(out, "OK")?;
        }
        Commands::Checkpoint => {
            env.checkpoint()?;
            writeln!(out, "checkpoint written")?;
        }
        Commands::Recover => {
            let stats = env.recovery_stats().unwrap_or_default();
            writeln!(out, "records read:    {}", stats.records)?;
            writeln!(out, "databases:       {}", stats.databases)?;
            writeln!(out, "pages redone:    {}", stats.redone_pages)?;
            writeln!(out, "updates undone:  {}", stats.undone_updates)?;
            writeln!(out, "winners/losers:  {}/{}", stats.winners, stats.losers)?;
        }
    }

    env.close()
}

fn print_pair(out: &mut impl Write, key: &[u8], value: &[u8]) -> io::Result<()> {
    writeln!(
        out,
        "{}\t{}",
        String::from_utf8_lossy(key),
        String::from_utf8_lossy(value)
    )
}
