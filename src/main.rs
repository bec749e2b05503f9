use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use indexdb::common::{
    DEFAULT_BTREE_ORDER, DEFAULT_HASH_BUCKET_CAPACITY, DEFAULT_POINT_CACHE_CAPACITY,
    DEFAULT_RTREE_NODE_CAPACITY,
};
use indexdb::printer::Printer;
use indexdb::{Catalog, EngineConfig, IndexKind, IndexOptions};

#[derive(Parser)]
#[command(about = "Inspect and maintain an indexdb data directory")]
struct Cli {
    #[arg(long, help = "Directory where data is stored")]
    data: PathBuf,

    #[arg(
        long,
        help = "If enabled, it assumes that data directory is empty and needs to be initialized"
    )]
    new: bool,

    #[arg(long, default_value_t = DEFAULT_BTREE_ORDER, help = "Order of new B+Trees")]
    btree_order: u32,

    #[arg(long, default_value_t = DEFAULT_HASH_BUCKET_CAPACITY, help = "Entries per hash bucket")]
    bucket_capacity: u32,

    #[arg(long, default_value_t = DEFAULT_RTREE_NODE_CAPACITY, help = "Entries per R-tree node")]
    rtree_capacity: u32,

    #[arg(long, default_value_t = DEFAULT_POINT_CACHE_CAPACITY, help = "Points cached per table")]
    point_cache: usize,

    #[arg(long, help = "Rebuild indexes that fail to open")]
    repair: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List all tables
    Tables,
    /// Show the columns of a table
    Columns { table: String },
    /// Show the indexes of a table
    Indexes { table: String },
    /// Print every record of a table
    Scan { table: String },
    /// Check record counts and index invariants, of one table or all of them
    Verify { table: Option<String> },
    /// Build an index again from the records
    Rebuild {
        table: String,
        column: String,
        kind: IndexKind,
    },
}

impl Cli {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            data_directory: self.data.clone(),
            point_cache_capacity: self.point_cache,
            index_options: IndexOptions {
                btree_order: self.btree_order,
                hash_bucket_capacity: self.bucket_capacity,
                rtree_node_capacity: self.rtree_capacity,
            },
            repair_indexes: self.repair,
        }
    }
}

fn run(catalog: &Catalog, command: Command, writer: &mut impl Write) -> Result<()> {
    match command {
        Command::Tables => writeln!(writer, "{}", catalog.list_tables().join(" "))?,
        Command::Columns { table } => {
            for column in catalog.schema(&table)?.columns() {
                writeln!(writer, "{:?}", column)?;
            }
        }
        Command::Indexes { table } => {
            for index in catalog.indexes(&table)? {
                let unique = if index.unique { " unique" } else { "" };
                writeln!(writer, "{} {}{}", index.column, index.kind, unique)?;
            }
        }
        Command::Scan { table } => {
            let printer = Printer::new(&catalog.schema(&table)?);
            printer.print_all_tuples(&catalog.scan(&table)?, writer)?;
        }
        Command::Verify { table } => {
            let tables = match table {
                Some(table) => vec![table],
                None => catalog.list_tables(),
            };
            for table in tables {
                catalog
                    .verify(&table)
                    .with_context(|| format!("Table {table} failed verification"))?;
                writeln!(writer, "{table}: ok")?;
            }
        }
        Command::Rebuild {
            table,
            column,
            kind,
        } => {
            catalog.rebuild_index(&table, &column, kind)?;
            writeln!(writer, "rebuilt {kind} index on {table}.{column}")?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.engine_config();
    let catalog = if cli.new {
        Catalog::create(config)
    } else {
        Catalog::open(config)
    }
    .with_context(|| format!("Failed to open data directory {}", cli.data.display()))?;

    let stdout = io::stdout();
    let mut writer = BufWriter::new(stdout.lock());
    run(&catalog, cli.command, &mut writer)?;
    writer.flush()?;
    Ok(())
}
