//! pagedb - offline inspection of a database directory

use anyhow::{bail, Context, Result};
use clap::{Parser as ClapParser, Subcommand};
use pagedb::catalog::Catalog;
use pagedb::storage::file::FileManager;
use pagedb::storage::wal::{WalManager, WalPayload};
use pagedb::storage::{Page, Row};
use std::path::PathBuf;

/// Inspect the catalog, WAL and pages of a pagedb database without opening it
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding data/<database>
    #[arg(short = 'D', long, default_value = ".")]
    data_root: PathBuf,

    /// Database name
    #[arg(short = 'd', long, default_value = "default")]
    database: String,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List schemas, tables and columns
    Catalog,
    /// Dump every readable WAL record
    Wal,
    /// Print the live rows of a table as stored in its page files
    Scan {
        schema: String,
        table: String,
        /// Comma separated column names
        #[arg(long, value_delimiter = ',')]
        columns: Vec<String>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let database_dir = args.data_root.join("data").join(&args.database);
    if !database_dir.is_dir() {
        bail!("no database at {}", database_dir.display());
    }
    let files = FileManager::open(&args.data_root, &args.database)
        .with_context(|| format!("Failed to open {}", database_dir.display()))?;

    match args.command {
        Command::Catalog => print_catalog(&files),
        Command::Wal => print_wal(&files),
        Command::Scan {
            schema,
            table,
            columns,
        } => print_scan(&files, &schema, &table, &columns),
    }
}

fn print_catalog(files: &FileManager) -> Result<()> {
    let catalog = Catalog::load(files).context("Failed to load catalog")?;
    for schema in catalog.schemas() {
        println!("{} ({})", schema.name, schema.id);
        for table in catalog.tables_in_schema(&schema.id) {
            println!("  {} ({}) last row id {}", table.name, table.id, table.last_row_id);
            for column in &table.columns {
                println!("    {} {} {:?}", column.name, column.value_type, column.flags);
            }
        }
    }
    Ok(())
}

fn print_wal(files: &FileManager) -> Result<()> {
    let records = WalManager::read_all(&files.wal_dir()).context("Failed to read WAL")?;
    for record in &records {
        let detail = match &record.payload {
            WalPayload::Insert { row, .. } => format!("{} row bytes", row.len()),
            WalPayload::Delete { row_id, .. } => format!("row {}", row_id),
            WalPayload::Update { old_row_id, row, .. } => {
                format!("replaces row {} ({} row bytes)", old_row_id, row.len())
            }
            _ => String::new(),
        };
        println!(
            "{} {:?} {} {}",
            record.lsn,
            record.record_type(),
            record.payload.entity_id(),
            detail
        );
    }
    println!("{} records", records.len());
    Ok(())
}

fn format_row(row: &Row) -> String {
    let values: Vec<String> = row.values.iter().map(ToString::to_string).collect();
    format!("{}: {}", row.row_id, values.join(" | "))
}

fn print_scan(files: &FileManager, schema: &str, table: &str, columns: &[String]) -> Result<()> {
    let catalog = Catalog::load(files).context("Failed to load catalog")?;
    let schema_id = catalog
        .schema_by_name(schema)
        .map(|s| s.id)
        .with_context(|| format!("Schema '{}' not found", schema))?;
    let table_info = catalog
        .table_by_name(&schema_id, table)
        .with_context(|| format!("Table '{}.{}' not found", schema, table))?;

    let projection = if columns.is_empty() {
        None
    } else {
        let names: Vec<&str> = columns.iter().map(String::as_str).collect();
        Some(table_info.projection(&names)?)
    };

    let mut rows = Vec::new();
    for (page_id, data) in files.read_pages(schema, table)? {
        let page_rows = Page::scan_serialized(&data, table_info.column_count(), projection.as_ref())
            .with_context(|| format!("Failed to read page {}", page_id))?;
        rows.extend(page_rows);
    }
    rows.sort_by_key(|row| row.row_id);
    for row in &rows {
        println!("{}", format_row(row));
    }
    println!("{} rows", rows.len());
    Ok(())
}
