// src/main.rs

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use lineage::archive::{MemoryArchive, Multiplexer};
use lineage::db::{self, DbFlavor, ProvenanceStorage};
use lineage::directory::directory_flatten_range;
use lineage::dump::dump_storage;
use lineage::model::{parse_swhid, Sha1Git};
use lineage::origin::{origin_add, origins_from_csv};
use lineage::provenance::Provenance;
use lineage::revision::{revision_add, revisions_from_csv, IngestOptions};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tracing::info;

const DEFAULT_DB_PATH: &str = "/var/lib/lineage/lineage.db";

#[derive(Parser)]
#[command(name = "lineage")]
#[command(author, version, about = "Provenance index over a source-code archive", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the Lineage database
    Init {
        /// Database path
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
        /// Storage flavor (fixed at creation time)
        #[arg(
            long,
            default_value = "with-path",
            value_parser = ["with-path", "without-path", "with-path-denormalized", "without-path-denormalized"],
        )]
        flavor: String,
    },
    /// Revision-layer ingestion
    Revision {
        #[command(subcommand)]
        command: RevisionCommands,
    },
    /// Origin-layer ingestion
    Origin {
        #[command(subcommand)]
        command: OriginCommands,
    },
    /// Directory maintenance
    Directory {
        #[command(subcommand)]
        command: DirectoryCommands,
    },
    /// Find the first occurrence of a blob
    FindFirst {
        /// Blob id, as a SWHID or a 40-character hex string
        swhid: String,
        /// Database path
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
    },
    /// Find all occurrences of a blob
    FindAll {
        /// Blob id, as a SWHID or a 40-character hex string
        swhid: String,
        /// Database path
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
        /// Maximum number of results
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Print the whole model in a human-readable form
    Dump {
        /// Database path
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
    },
    /// Generate shell completion scripts
    Completions {
        /// Shell type (bash, zsh, fish, powershell)
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum RevisionCommands {
    /// Ingest revisions from a CSV of (rev-hex, iso8601-date, root-hex)
    FromCsv {
        /// CSV file path
        file: PathBuf,
        /// Archive dump (JSON) backing the directory walks; may be given
        /// several times, earlier dumps take precedence
        #[arg(short, long, required = true)]
        archive: Vec<PathBuf>,
        /// Database path
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
        /// Record directory occurrences for all frontiers
        #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
        track_all: bool,
        /// Flatten new frontiers inline
        #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
        flatten: bool,
        /// Reuse frontiers as low in the tree as possible
        #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
        reuse: bool,
        /// Minimum depth of a new frontier
        #[arg(long, default_value_t = 1)]
        min_depth: usize,
        /// Skip files smaller than this many bytes
        #[arg(long, default_value_t = 0)]
        min_size: u64,
        /// Abort revisions with more directories than this (0 = unbounded)
        #[arg(long, default_value_t = 0)]
        max_directory_size: usize,
        /// Stop after this many revisions
        #[arg(short, long)]
        limit: Option<usize>,
    },
}

#[derive(Subcommand)]
enum OriginCommands {
    /// Ingest origin visits from a CSV of (url, snapshot-hex)
    FromCsv {
        /// CSV file path
        file: PathBuf,
        /// Archive dump (JSON) backing the snapshot and history walks;
        /// may be given several times, earlier dumps take precedence
        #[arg(short, long, required = true)]
        archive: Vec<PathBuf>,
        /// Database path
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
        /// Stop after this many origins
        #[arg(short, long)]
        limit: Option<usize>,
    },
}

#[derive(Subcommand)]
enum DirectoryCommands {
    /// Flatten known directories in an id range
    Flatten {
        /// Archive dump (JSON) backing the directory walks; may be given
        /// several times, earlier dumps take precedence
        #[arg(short, long, required = true)]
        archive: Vec<PathBuf>,
        /// Database path
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
        /// First directory id (hex) of the range
        #[arg(long)]
        range_from: String,
        /// End of the range (hex, exclusive)
        #[arg(long)]
        range_to: String,
        /// Skip files smaller than this many bytes
        #[arg(long, default_value_t = 0)]
        min_size: u64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Init { db_path, flavor }) => {
            let flavor: DbFlavor = flavor
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?;
            db::init(&db_path, flavor)?;
            println!("Initialized {} database at {}", flavor.as_str(), db_path);
        }
        Some(Commands::Revision { command }) => match command {
            RevisionCommands::FromCsv {
                file,
                archive,
                db_path,
                track_all,
                flatten,
                reuse,
                min_depth,
                min_size,
                max_directory_size,
                limit,
            } => {
                let archive = load_archives(&archive)?;
                let reader = BufReader::new(
                    File::open(&file)
                        .with_context(|| format!("Failed to open {}", file.display()))?,
                );
                let mut revisions = revisions_from_csv(reader)?;
                if let Some(limit) = limit {
                    revisions.truncate(limit);
                }
                info!("Ingesting {} revisions", revisions.len());

                let mut provenance = Provenance::new(ProvenanceStorage::open(&db_path)?);
                let options = IngestOptions {
                    trackall: track_all,
                    flatten,
                    lower: reuse,
                    mindepth: min_depth,
                    minsize: min_size,
                    max_directory_size,
                    commit: true,
                };
                // One batch per revision: each is the unit of cancellation
                for revision in &revisions {
                    revision_add(
                        &mut provenance,
                        &archive,
                        std::slice::from_ref(revision),
                        &options,
                    )?;
                }
                println!("Ingested {} revisions", revisions.len());
            }
        },
        Some(Commands::Origin { command }) => match command {
            OriginCommands::FromCsv {
                file,
                archive,
                db_path,
                limit,
            } => {
                let archive = load_archives(&archive)?;
                let reader = BufReader::new(
                    File::open(&file)
                        .with_context(|| format!("Failed to open {}", file.display()))?,
                );
                let mut origins = origins_from_csv(reader)?;
                if let Some(limit) = limit {
                    origins.truncate(limit);
                }
                info!("Ingesting {} origin visits", origins.len());

                let mut provenance = Provenance::new(ProvenanceStorage::open(&db_path)?);
                for origin in &origins {
                    origin_add(&mut provenance, &archive, std::slice::from_ref(origin), true)?;
                }
                println!("Ingested {} origin visits", origins.len());
            }
        },
        Some(Commands::Directory { command }) => match command {
            DirectoryCommands::Flatten {
                archive,
                db_path,
                range_from,
                range_to,
                min_size,
            } => {
                let archive = load_archives(&archive)?;
                let start = Sha1Git::from_hex(&range_from)?;
                let end = Sha1Git::from_hex(&range_to)?;
                let mut provenance = Provenance::new(ProvenanceStorage::open(&db_path)?);
                directory_flatten_range(&mut provenance, &archive, start, end, min_size)?;
                println!("Flattened directories in [{}, {})", start, end);
            }
        },
        Some(Commands::FindFirst { swhid, db_path }) => {
            let id = parse_swhid(&swhid)?;
            let storage = ProvenanceStorage::open(&db_path)?;
            match storage.content_find_first(id)? {
                Some(result) => println!("{}", format_result(&result)),
                None => bail!("No occurrence found for {}", swhid),
            }
        }
        Some(Commands::FindAll {
            swhid,
            db_path,
            limit,
        }) => {
            let id = parse_swhid(&swhid)?;
            let storage = ProvenanceStorage::open(&db_path)?;
            let results = storage.content_find_all(id, limit)?;
            if results.is_empty() {
                bail!("No occurrence found for {}", swhid);
            }
            for result in &results {
                println!("{}", format_result(result));
            }
        }
        Some(Commands::Dump { db_path }) => {
            let storage = ProvenanceStorage::open(&db_path)?;
            let stdout = io::stdout();
            dump_storage(&storage, &mut stdout.lock())?;
        }
        Some(Commands::Completions { shell }) => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(shell, &mut cmd, name, &mut io::stdout());
        }
        None => {
            Cli::command().print_help()?;
        }
    }

    Ok(())
}

fn load_archives(paths: &[PathBuf]) -> Result<Multiplexer<MemoryArchive>> {
    let mut backends = Vec::new();
    for path in paths {
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let archive = MemoryArchive::from_json_file(Path::new(path))
            .with_context(|| format!("Failed to load archive dump {}", path.display()))?;
        backends.push((name, archive));
    }
    Ok(Multiplexer::new(backends))
}

fn format_result(result: &lineage::db::ProvenanceResult) -> String {
    format!(
        "swh:1:cnt:{}, swh:1:rev:{}, {}, {}, {}",
        result.content,
        result.revision,
        result.date.format("%Y-%m-%dT%H:%M:%S%:z"),
        result.origin.as_deref().unwrap_or("-"),
        String::from_utf8_lossy(&result.path),
    )
}
