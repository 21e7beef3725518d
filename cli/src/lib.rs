use anyhow::{anyhow, Context, Error, Result};
use clap::{Parser, Subcommand};
use genstore::backup::open_backup;
use genstore::consts::BACKUP_COMPRESSION_LEVEL;
use genstore::storage::write_nquads;
use genstore::{Location, OldGeneration, Store, StoreConfig, StoreParams, TxnMode};
use log::info;
use oxigraph::io::RdfFormat;
use oxigraph::model::{GraphName, NamedNode, NamedOrBlankNode, Term};
use std::env::current_dir;
use std::ffi::OsString;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "genstore")]
#[command(about = "Generational RDF quad store")]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Directory holding the store, defaults to the current directory
    #[clap(long, short, global = true)]
    location: Option<PathBuf>,
    /// Verbose mode - sets the RUST_LOG level to info, defaults to warning level
    #[clap(long, short, action, default_value = "false", global = true)]
    verbose: bool,
    /// Debug mode - sets the RUST_LOG level to debug, defaults to warning level
    #[clap(long, action, default_value = "false", global = true)]
    debug: bool,
    /// Seconds to wait for an active writer when switching generations
    #[clap(long, global = true)]
    exclusive_timeout: Option<u64>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create a new store at the location
    Init {
        /// Quad index layouts, e.g. SPOG POSG GSPO (defaults to all six)
        #[clap(long, num_args = 1..)]
        indexes: Vec<String>,
        /// Do not fsync the journal on every commit
        #[clap(long, action, default_value = "false")]
        no_sync: bool,
    },
    /// Load an RDF file in a single write transaction
    Load {
        /// File to load; the format is taken from the extension (a trailing .zst is decompressed)
        file: PathBuf,
        /// Graph for triples that carry no graph name, defaults to the default graph
        #[clap(long, short)]
        graph: Option<String>,
        /// Override the format: ttl, nt, nq, trig, rdf, n3
        #[clap(long, short)]
        format: Option<String>,
    },
    /// Write every quad as N-Quads
    Dump {
        /// Output file, defaults to stdout; a .zst extension compresses the output
        #[clap(long, short)]
        output: Option<PathBuf>,
    },
    /// Print the quads matching a pattern as N-Quads
    Find {
        /// Subject, e.g. <http://example.org/s> or _:b0
        #[clap(long, short)]
        subject: Option<String>,
        /// Predicate IRI in angle brackets
        #[clap(long, short)]
        predicate: Option<String>,
        /// Object term in N-Triples syntax
        #[clap(long, short)]
        object: Option<String>,
        /// Graph name in angle brackets, or `default`
        #[clap(long, short)]
        graph: Option<String>,
    },
    /// Prints the status of the store
    Status {
        /// Output JSON instead of text
        #[clap(long, action, default_value = "false")]
        json: bool,
    },
    /// List the generation directories at the location
    Generations,
    /// Copy the live data into a new generation and switch to it
    Compact {
        /// Remove the superseded generation directory afterwards
        #[clap(long, action, default_value = "false")]
        delete_old: bool,
    },
    /// Write a compressed N-Quads backup into <location>/Backups
    Backup,
    /// Prints the version of the genstore binary
    Version,
}

impl std::fmt::Display for Commands {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Commands::Init { .. } => write!(f, "Init"),
            Commands::Load { .. } => write!(f, "Load"),
            Commands::Dump { .. } => write!(f, "Dump"),
            Commands::Find { .. } => write!(f, "Find"),
            Commands::Status { .. } => write!(f, "Status"),
            Commands::Generations => write!(f, "Generations"),
            Commands::Compact { .. } => write!(f, "Compact"),
            Commands::Backup => write!(f, "Backup"),
            Commands::Version => write!(f, "Version"),
        }
    }
}

pub fn run() -> Result<()> {
    genstore::init_logging();
    let cmd = Cli::parse();
    execute(cmd)
}

pub fn run_from_args<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    genstore::init_logging();
    let cmd = Cli::try_parse_from(args).map_err(Error::from)?;
    execute(cmd)
}

fn execute(cmd: Cli) -> Result<()> {
    // RUST_LOG may already come from GENSTORE_LOG; the flags win over both.
    if cmd.debug {
        std::env::set_var("RUST_LOG", "debug");
    } else if cmd.verbose {
        std::env::set_var("RUST_LOG", "info");
    } else if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "warn");
    }
    let _ = env_logger::try_init();

    if let Commands::Version = cmd.command {
        println!("genstore {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let root = match &cmd.location {
        Some(path) => path.clone(),
        None => current_dir()?,
    };
    let mut builder = StoreConfig::builder();
    builder.location(Location::dir(&root));
    if let Some(secs) = cmd.exclusive_timeout {
        builder.exclusive_timeout(Duration::from_secs(secs));
    }
    if let Commands::Init { indexes, no_sync } = &cmd.command {
        let mut params = if indexes.is_empty() {
            StoreParams::default()
        } else {
            StoreParams::with_indexes(indexes.iter().cloned())
        };
        params.sync_commits = !*no_sync;
        builder.params(params);
    }
    let config = builder.build()?;
    if cmd.verbose || cmd.debug {
        config.print();
    }

    // Every command except `init` works on an existing store.
    if !matches!(cmd.command, Commands::Init { .. })
        && genstore::generation::current_generation(&root)?.is_none()
    {
        return Err(anyhow!(
            "No store found at {}. Use `genstore init`.",
            root.display()
        ));
    }
    info!("Running {} on {}", cmd.command, root.display());
    let store = Store::open(config)?;

    match cmd.command {
        Commands::Init { .. } => {
            println!(
                "Initialized store at {} (generation {})",
                root.display(),
                store.current_generation()
            );
        }
        Commands::Load {
            file,
            graph,
            format,
        } => {
            let format = match format {
                Some(name) => RdfFormat::from_extension(&name)
                    .ok_or_else(|| anyhow!("Unknown RDF format: {name}"))?,
                None => format_for_path(&file)?,
            };
            let graph = graph.map(|g| parse_graph_name(&g)).transpose()?;
            let reader = open_backup(&file)?;
            let added = store.load(reader, format, graph)?;
            println!("Loaded {added} new quad(s) from {}", file.display());
        }
        Commands::Dump { output } => {
            let count = match output {
                Some(path) => dump_to_file(&store, &path)?,
                None => {
                    let stdout = std::io::stdout();
                    store.dump(stdout.lock())?
                }
            };
            info!("Wrote {count} quad(s)");
        }
        Commands::Find {
            subject,
            predicate,
            object,
            graph,
        } => {
            let subject = subject.map(|s| parse_subject(&s)).transpose()?;
            let predicate = predicate
                .map(|p| NamedNode::from_str(&p).map_err(|e| anyhow!("Invalid predicate {p}: {e}")))
                .transpose()?;
            let object = object
                .map(|o| Term::from_str(&o).map_err(|e| anyhow!("Invalid object {o}: {e}")))
                .transpose()?;
            let graph = graph.map(|g| parse_graph_name(&g)).transpose()?;
            let txn = store.begin(TxnMode::Read)?;
            let matches = txn.find(
                subject.as_ref().map(|s| s.as_ref()),
                predicate.as_ref().map(|p| p.as_ref()),
                object.as_ref().map(|o| o.as_ref()),
                graph.as_ref().map(|g| g.as_ref()),
            )?;
            let stdout = std::io::stdout();
            let (mut out, count) = write_nquads(stdout.lock(), matches)?;
            out.flush()?;
            info!("{count} matching quad(s)");
        }
        Commands::Status { json } => {
            let stats = store.stats();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Location: {}", stats.location);
                println!("Generation: {} ({})", stats.generation, stats.storage);
                println!("Quads: {}", stats.quads);
                println!("Nodes: {}", stats.nodes);
                println!("Data version: {}", stats.coordinator.data_version);
                println!("Compaction: {:?}", stats.compaction);
            }
        }
        Commands::Generations => {
            let current = store.current_generation();
            for id in store.generations()? {
                let marker = if id == current { "*" } else { " " };
                println!("{marker} {}", id.dir_name());
            }
        }
        Commands::Compact { delete_old } => {
            let report = store.compact_with(OldGeneration::from(delete_old))?;
            println!(
                "Compacted {} into {}: {} quad(s), {} -> {} node(s){}",
                report.from,
                report.to,
                report.quads,
                report.nodes_before,
                report.nodes_after,
                if report.old_removed {
                    format!(", removed {}", report.from)
                } else {
                    String::new()
                }
            );
        }
        Commands::Backup => {
            let (path, count) = store.backup()?;
            println!("Backed up {count} quad(s) to {}", path.display());
        }
        Commands::Version => {}
    }
    Ok(())
}

fn format_for_path(path: &Path) -> Result<RdfFormat> {
    let mut path = path.to_path_buf();
    if path.extension().is_some_and(|e| e == "zst") {
        path.set_extension("");
    }
    path.extension()
        .and_then(|e| e.to_str())
        .and_then(RdfFormat::from_extension)
        .ok_or_else(|| anyhow!("Cannot tell the RDF format of {}", path.display()))
}

fn dump_to_file(store: &Store, path: &Path) -> Result<usize> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let writer = BufWriter::new(file);
    if path.extension().is_some_and(|e| e == "zst") {
        let mut encoder = zstd::Encoder::new(writer, BACKUP_COMPRESSION_LEVEL)?.auto_finish();
        let count = store.dump(&mut encoder)?;
        encoder.flush()?;
        Ok(count)
    } else {
        Ok(store.dump(writer)?)
    }
}

fn parse_subject(value: &str) -> Result<NamedOrBlankNode> {
    match Term::from_str(value).map_err(|e| anyhow!("Invalid subject {value}: {e}"))? {
        Term::NamedNode(n) => Ok(n.into()),
        Term::BlankNode(b) => Ok(b.into()),
        other => Err(anyhow!("{other} cannot be a subject")),
    }
}

fn parse_graph_name(value: &str) -> Result<GraphName> {
    if value == "default" {
        return Ok(GraphName::DefaultGraph);
    }
    match Term::from_str(value).map_err(|e| anyhow!("Invalid graph name {value}: {e}"))? {
        Term::NamedNode(n) => Ok(n.into()),
        Term::BlankNode(b) => Ok(b.into()),
        other => Err(anyhow!("{other} cannot be a graph name")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_terms() {
        assert!(parse_subject("<http://example.org/s>").is_ok());
        assert!(parse_subject("_:b0").is_ok());
        assert!(parse_subject("\"literal\"").is_err());
        assert_eq!(parse_graph_name("default").unwrap(), GraphName::DefaultGraph);
        assert!(parse_graph_name("<http://example.org/g>").is_ok());
    }

    #[test]
    fn format_from_extension() {
        assert_eq!(
            format_for_path(Path::new("data.ttl")).unwrap(),
            RdfFormat::Turtle
        );
        assert_eq!(
            format_for_path(Path::new("backup.nq.zst")).unwrap(),
            RdfFormat::NQuads
        );
        assert!(format_for_path(Path::new("notes.docx")).is_err());
    }
}
