// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn db_path_arg() -> Arg {
    Arg::new("db_path")
        .short('d')
        .long("db-path")
        .value_name("PATH")
        .default_value("/var/lib/lineage/lineage.db")
        .help("Database path")
}

fn archive_arg() -> Arg {
    Arg::new("archive")
        .short('a')
        .long("archive")
        .value_name("JSON")
        .required(true)
        .action(ArgAction::Append)
        .help("Archive dump backing the DAG walks (repeatable)")
}

fn build_cli() -> Command {
    Command::new("lineage")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Lineage Contributors")
        .about("Provenance index over a source-code archive")
        .subcommand_required(false)
        .subcommand(
            Command::new("init")
                .about("Initialize the Lineage database")
                .arg(db_path_arg())
                .arg(
                    Arg::new("flavor")
                        .long("flavor")
                        .default_value("with-path")
                        .value_parser([
                            "with-path",
                            "without-path",
                            "with-path-denormalized",
                            "without-path-denormalized",
                        ])
                        .help("Storage flavor (fixed at creation time)"),
                ),
        )
        .subcommand(
            Command::new("revision").about("Revision-layer ingestion").subcommand(
                Command::new("from-csv")
                    .about("Ingest revisions from a CSV of (rev-hex, iso8601-date, root-hex)")
                    .arg(Arg::new("file").required(true).help("CSV file path"))
                    .arg(archive_arg())
                    .arg(db_path_arg())
                    .arg(
                        Arg::new("track_all")
                            .long("track-all")
                            .default_value("true")
                            .help("Record directory occurrences for all frontiers"),
                    )
                    .arg(
                        Arg::new("flatten")
                            .long("flatten")
                            .default_value("true")
                            .help("Flatten new frontiers inline"),
                    )
                    .arg(
                        Arg::new("reuse")
                            .long("reuse")
                            .default_value("true")
                            .help("Reuse frontiers as low in the tree as possible"),
                    )
                    .arg(
                        Arg::new("min_depth")
                            .long("min-depth")
                            .default_value("1")
                            .help("Minimum depth of a new frontier"),
                    )
                    .arg(
                        Arg::new("min_size")
                            .long("min-size")
                            .default_value("0")
                            .help("Skip files smaller than this many bytes"),
                    )
                    .arg(
                        Arg::new("max_directory_size")
                            .long("max-directory-size")
                            .default_value("0")
                            .help("Abort revisions with more directories than this"),
                    )
                    .arg(
                        Arg::new("limit")
                            .short('l')
                            .long("limit")
                            .help("Stop after this many revisions"),
                    ),
            ),
        )
        .subcommand(
            Command::new("origin").about("Origin-layer ingestion").subcommand(
                Command::new("from-csv")
                    .about("Ingest origin visits from a CSV of (url, snapshot-hex)")
                    .arg(Arg::new("file").required(true).help("CSV file path"))
                    .arg(archive_arg())
                    .arg(db_path_arg())
                    .arg(
                        Arg::new("limit")
                            .short('l')
                            .long("limit")
                            .help("Stop after this many origins"),
                    ),
            ),
        )
        .subcommand(
            Command::new("directory").about("Directory maintenance").subcommand(
                Command::new("flatten")
                    .about("Flatten known directories in an id range")
                    .arg(archive_arg())
                    .arg(db_path_arg())
                    .arg(
                        Arg::new("range_from")
                            .long("range-from")
                            .required(true)
                            .help("First directory id (hex) of the range"),
                    )
                    .arg(
                        Arg::new("range_to")
                            .long("range-to")
                            .required(true)
                            .help("End of the range (hex, exclusive)"),
                    )
                    .arg(
                        Arg::new("min_size")
                            .long("min-size")
                            .default_value("0")
                            .help("Skip files smaller than this many bytes"),
                    ),
            ),
        )
        .subcommand(
            Command::new("find-first")
                .about("Find the first occurrence of a blob")
                .arg(
                    Arg::new("swhid")
                        .required(true)
                        .help("Blob id, as a SWHID or a 40-character hex string"),
                )
                .arg(db_path_arg()),
        )
        .subcommand(
            Command::new("find-all")
                .about("Find all occurrences of a blob")
                .arg(
                    Arg::new("swhid")
                        .required(true)
                        .help("Blob id, as a SWHID or a 40-character hex string"),
                )
                .arg(db_path_arg())
                .arg(
                    Arg::new("limit")
                        .short('l')
                        .long("limit")
                        .help("Maximum number of results"),
                ),
        )
        .subcommand(
            Command::new("dump")
                .about("Print the whole model in a human-readable form")
                .arg(db_path_arg()),
        )
        .subcommand(
            Command::new("completions")
                .about("Generate shell completion scripts")
                .arg(
                    Arg::new("shell")
                        .required(true)
                        .value_parser(["bash", "zsh", "fish", "powershell"])
                        .help("Shell type"),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Create man directory
    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    // Generate main man page
    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer = Vec::new();
    man.render(&mut buffer)
        .expect("Failed to render man page");

    let man_path = man_dir.join("lineage.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");

    println!("cargo:warning=Man page generated at {}", man_path.display());
}
