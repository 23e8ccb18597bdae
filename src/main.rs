use clap::{Parser, Subcommand};
use serde_json::Value;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use csvquery::daemon::Daemon;
use csvquery::error::{Error, Result};
use csvquery::executor::{Engine, OrderBy, QueryRequest, RowSink};
use csvquery::indexer::{IndexOptions, Indexer};
use csvquery::predicate::Predicate;
use csvquery::source::Source;

#[derive(Parser)]
#[command(name = "csvquery", version, about = "Indexed queries over huge delimited files")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build or refresh indexes for the listed columns
    Index {
        #[arg(short, long)]
        input: PathBuf,
        /// JSON array; strings are single-column indexes, arrays composite,
        /// e.g. '["STATUS", ["DEPT","LEVEL"]]'. Omit to refresh all columns
        /// listed in the meta file.
        #[arg(short, long)]
        columns: Option<String>,
        #[arg(short, long, default_value = ",")]
        separator: char,
        /// Scan worker count (default: CPU count; CSVQUERY_WORKERS overrides)
        #[arg(short, long)]
        workers: Option<usize>,
        /// Indexer memory budget in MB (CSVQUERY_MEMORY_MB overrides)
        #[arg(short, long)]
        memory: Option<usize>,
        /// Bloom filter false-positive rate
        #[arg(long, default_value = "0.01")]
        bloom_fp: f64,
        /// Rebuild even when the source no longer matches the meta capture
        #[arg(short, long)]
        force: bool,
        #[arg(short, long)]
        verbose: bool,
    },
    /// Stream matching `offset,length` lines to stdout, closed by OK / ERR
    Query {
        #[arg(short, long)]
        input: PathBuf,
        /// Predicate tree as JSON, e.g. '{"op":"=","column":"STATUS","value":"active"}'
        #[arg(short, long)]
        r#where: String,
        /// JSON array of columns for the client to hydrate (passed through)
        #[arg(long)]
        select: Option<String>,
        /// Column name, or '{"column":...,"desc":true}'
        #[arg(long)]
        order_by: Option<String>,
        #[arg(short, long)]
        limit: Option<usize>,
        #[arg(short, long, default_value = "0")]
        offset: usize,
        #[arg(short, long, default_value = ",")]
        separator: char,
        /// Fail with ERR NoUsableIndex instead of falling back to a full scan
        #[arg(long)]
        strict: bool,
    },
    /// Serve queries over the local stream socket until terminated
    Daemon {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(long)]
        socket: Option<PathBuf>,
        #[arg(short, long, default_value = ",")]
        separator: char,
    },
    /// Append NDJSON rows to the source (indexes pick them up on rebuild)
    Write {
        #[arg(short, long)]
        input: PathBuf,
        /// NDJSON file of objects keyed by column name; "-" reads stdin
        #[arg(short, long)]
        rows: PathBuf,
        #[arg(short, long, default_value = ",")]
        separator: char,
    },
    /// Print semantic version and build date
    Version,
}

fn main() {
    let cli = Cli::parse();
    let default_level = match cli.command {
        Commands::Index { verbose: true, .. } => "debug",
        Commands::Daemon { .. } => "info",
        _ => "warn",
    };
    init_logging(default_level);
    if let Err(e) = run(cli) {
        eprintln!("{}", e.wire_line());
        std::process::exit(1);
    }
}

fn init_logging(default: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {

        // ── Index ────────────────────────────────────────────────────────────
        Commands::Index { input, columns, separator, workers, memory, bloom_fp, force, .. } => {
            let mut opts = IndexOptions {
                separator: separator as u8,
                bloom_fp,
                force,
                ..IndexOptions::default()
            };
            if let Some(spec) = columns {
                opts.columns = parse_columns(&spec)?;
            }
            if let Some(w) = workers.or_else(|| env_usize("CSVQUERY_WORKERS")) {
                opts.workers = w.max(1);
            }
            if let Some(m) = memory.or_else(|| env_usize("CSVQUERY_MEMORY_MB")) {
                opts.memory_mb = m.max(1);
            }

            let report = Indexer::new(opts).build(&input)?;
            eprintln!(
                "Indexed {} rows ({} malformed skipped) from {}",
                report.total_rows,
                report.malformed_rows,
                input.display()
            );
            for (key, records, blocks) in &report.indexes {
                eprintln!("  {key:<24} {records:>10} records  {blocks:>6} blocks");
            }
        }

        // ── Query ────────────────────────────────────────────────────────────
        Commands::Query { input, r#where, select, order_by, limit, offset, separator, strict } => {
            let engine = Engine::open(&input, separator as u8)?;
            let where_json: Value = serde_json::from_str(&r#where)
                .map_err(|e| Error::Protocol(format!("--where is not valid JSON: {e}")))?;
            // --select is hydration input for the client; offsets are the
            // same either way, so it is accepted and passed over.
            let _ = select;
            let req = QueryRequest {
                predicate: Some(Predicate::from_json(&where_json)?),
                limit,
                offset,
                order_by: order_by.as_deref().map(parse_order_by).transpose()?,
                strict,
                ..QueryRequest::default()
            };

            let stdout = std::io::stdout();
            let mut sink = StdoutSink { out: stdout.lock() };
            match engine.query_stream(&req, &mut sink) {
                Ok(_) => writeln!(sink.out, "OK")?,
                Err(e) => {
                    writeln!(sink.out, "{}", e.wire_line())?;
                    return Err(e);
                }
            }
        }

        // ── Daemon ───────────────────────────────────────────────────────────
        Commands::Daemon { input, socket, separator } => {
            // Fail fast on an unreadable source instead of at first query.
            Source::open(&input)?;
            Daemon::new(input, socket, separator as u8).run()?;
        }

        // ── Write ────────────────────────────────────────────────────────────
        Commands::Write { input, rows, separator } => {
            let appended = append_rows(&input, &rows, separator as u8)?;
            eprintln!("Appended {appended} row(s) to {}", input.display());
        }

        // ── Version ──────────────────────────────────────────────────────────
        Commands::Version => {
            println!(
                "csvquery {} (built {})",
                env!("CARGO_PKG_VERSION"),
                env!("CSVQUERY_BUILD_DATE")
            );
        }
    }
    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

/// Streams query output lines to stdout as the executor produces them.
struct StdoutSink<W: Write> {
    out: W,
}

impl<W: Write> RowSink for StdoutSink<W> {
    fn warning(&mut self, message: &str) -> Result<()> {
        writeln!(self.out, "WARN {message}")?;
        Ok(())
    }

    fn row(&mut self, offset: u64, length: u64) -> Result<()> {
        writeln!(self.out, "{offset},{length}")?;
        Ok(())
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.parse().ok()
}

fn parse_columns(spec: &str) -> Result<Vec<Vec<String>>> {
    let v: Value = serde_json::from_str(spec)
        .map_err(|e| Error::Protocol(format!("--columns is not valid JSON: {e}")))?;
    let items = v
        .as_array()
        .ok_or_else(|| Error::Protocol("--columns must be a JSON array".into()))?;
    items
        .iter()
        .map(|item| match item {
            Value::String(s) => Ok(vec![s.clone()]),
            Value::Array(parts) => parts
                .iter()
                .map(|p| {
                    p.as_str()
                        .map(str::to_owned)
                        .ok_or_else(|| Error::Protocol("composite columns must be strings".into()))
                })
                .collect(),
            _ => Err(Error::Protocol("--columns entries must be strings or arrays".into())),
        })
        .collect()
}

fn parse_order_by(spec: &str) -> Result<OrderBy> {
    if let Ok(v) = serde_json::from_str::<Value>(spec) {
        if let Some(obj) = v.as_object() {
            let column = obj
                .get("column")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Protocol("--order-by object needs a \"column\"".into()))?
                .to_owned();
            let desc = obj.get("desc").and_then(Value::as_bool).unwrap_or(false);
            return Ok(OrderBy { column, desc });
        }
        if let Some(s) = v.as_str() {
            return Ok(OrderBy { column: s.to_owned(), desc: false });
        }
    }
    // A bare column name is accepted without JSON quoting.
    Ok(OrderBy { column: spec.to_owned(), desc: false })
}

/// Append NDJSON objects as delimited rows, in header column order.
fn append_rows(input: &PathBuf, rows: &PathBuf, sep: u8) -> Result<u64> {
    let source = Source::open(input)?;
    let header = source.header_columns(sep)?;
    drop(source); // release the map before appending

    let reader: Box<dyn BufRead> = if rows.as_os_str() == "-" {
        Box::new(std::io::stdin().lock())
    } else {
        Box::new(std::io::BufReader::new(std::fs::File::open(rows)?))
    };

    let mut file = std::fs::OpenOptions::new().append(true).open(input)?;
    let mut appended = 0u64;
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let obj: Value = serde_json::from_str(&line)
            .map_err(|e| Error::Protocol(format!("--rows line is not valid JSON: {e}")))?;
        let fields: Vec<String> = header
            .iter()
            .map(|col| match obj.get(col) {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
            })
            .collect();
        let sep_str = (sep as char).to_string();
        writeln!(file, "{}", fields.join(&sep_str))?;
        appended += 1;
    }
    file.sync_all()?;
    Ok(appended)
}
