//! Offline inspector for an arbol data directory.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::{Path, PathBuf};

use arbol::db::{init_logging, Store, StoreConfig, JOURNAL_DIR_NAME, PAGE_FILE_NAME};
use arbol::primitives::io::StdFileIo;
use arbol::primitives::journal::{JournalReader, LogRecord};
use arbol::primitives::pager::load_meta;
use arbol::storage::btree::BTreeStats;
use arbol::storage::txn::analyze;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(
    name = "arbol-inspect",
    version,
    about = "Inspect the page file and journal of an arbol data directory",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for reports"
    )]
    format: OutputFormat,

    #[arg(
        long,
        global = true,
        env = "ARBOL_LOG",
        default_value = "warn",
        help = "Log filter (RUST_LOG syntax)"
    )]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the meta page without opening the store.
    Meta {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },
    /// List journal entries.
    Journal {
        #[arg(value_name = "DIR")]
        dir: PathBuf,

        #[arg(long, help = "Only entries of this transaction")]
        txn: Option<u64>,

        #[arg(long, help = "Stop after this many entries")]
        limit: Option<usize>,

        #[arg(long, help = "Only print the summary")]
        summary: bool,
    },
    /// Open the store (recovering it if needed) and check every tree.
    Verify {
        #[arg(value_name = "DIR")]
        dir: PathBuf,

        #[arg(long, value_name = "FILE", help = "Store configuration (TOML)")]
        config: Option<PathBuf>,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Serialize)]
struct MetaReport {
    page_size: u32,
    format_version: u16,
    salt: String,
    next_page: u64,
    free_head: u64,
    free_pages: u64,
    collections_root: u64,
    documents_root: u64,
    node_index_root: u64,
    next_collection_id: u32,
    next_doc_id: u32,
}

#[derive(Serialize)]
struct JournalReport {
    files: Vec<u32>,
    entries: u64,
    last_lsn: u64,
    max_txn: u64,
    torn_tail: bool,
    checkpoint_lsn: Option<u64>,
    redo_start: u64,
    listed: Vec<String>,
}

#[derive(Serialize)]
struct TreeReport {
    name: &'static str,
    root: u64,
    depth: usize,
    leaf_pages: u64,
    internal_pages: u64,
    entries: u64,
}

#[derive(Serialize)]
struct VerifyReport {
    recovered: bool,
    redone: u64,
    undone: u64,
    losers: Vec<u64>,
    page_count: u64,
    trees: Vec<TreeReport>,
    success: bool,
    error: Option<String>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logging(&cli.log);
    match cli.command {
        Command::Meta { dir } => {
            let report = meta_report(&dir)?;
            emit(cli.format, &report, || print_meta_text(&report))?;
        }
        Command::Journal {
            dir,
            txn,
            limit,
            summary,
        } => {
            let report = journal_report(&dir, txn, limit, summary)?;
            emit(cli.format, &report, || print_journal_text(&report))?;
        }
        Command::Verify { dir, config } => {
            let config = match config {
                Some(path) => StoreConfig::load(path)?,
                None => StoreConfig::default(),
            };
            let report = verify_report(&dir, &config)?;
            emit(cli.format, &report, || print_verify_text(&report))?;
            if !report.success {
                std::process::exit(2);
            }
        }
    }
    Ok(())
}

fn meta_report(dir: &Path) -> Result<MetaReport, Box<dyn Error>> {
    let io = StdFileIo::open_read(dir.join(PAGE_FILE_NAME))?;
    let (meta, _) = load_meta(&io, false)?;
    Ok(MetaReport {
        page_size: meta.page_size,
        format_version: meta.format_version,
        salt: hex::encode(meta.salt.to_be_bytes()),
        next_page: meta.next_page.0,
        free_head: meta.free_head.0,
        free_pages: meta.free_pages,
        collections_root: meta.collections_root.0,
        documents_root: meta.documents_root.0,
        node_index_root: meta.node_index_root.0,
        next_collection_id: meta.next_collection_id,
        next_doc_id: meta.next_doc_id,
    })
}

fn journal_report(
    dir: &Path,
    txn: Option<u64>,
    limit: Option<usize>,
    summary_only: bool,
) -> Result<JournalReport, Box<dyn Error>> {
    let reader = JournalReader::open(&dir.join(JOURNAL_DIR_NAME))?;
    let mut listed = Vec::new();
    let mut checkpoint_lsn = None;
    let summary = reader.scan(|entry| {
        if matches!(entry.record, LogRecord::Checkpoint(_)) {
            checkpoint_lsn = Some(entry.lsn.0);
        }
        let wanted = txn.map_or(true, |id| entry.txn.0 == id);
        let room = limit.map_or(true, |max| listed.len() < max);
        if !summary_only && wanted && room {
            listed.push(entry.to_string());
        }
        Ok(())
    })?;
    let analysis = analyze(&reader)?;
    Ok(JournalReport {
        files: reader.file_numbers(),
        entries: summary.entries,
        last_lsn: summary.last_lsn.0,
        max_txn: summary.max_txn.0,
        torn_tail: summary.torn_tail,
        checkpoint_lsn,
        redo_start: analysis.redo_start().0,
        listed,
    })
}

fn verify_report(dir: &Path, config: &StoreConfig) -> Result<VerifyReport, Box<dyn Error>> {
    let store = Store::open(dir, config)?;
    let mut report = VerifyReport {
        recovered: false,
        redone: 0,
        undone: 0,
        losers: Vec::new(),
        page_count: store.pages().page_count()?,
        trees: Vec::new(),
        success: true,
        error: None,
    };
    if let Some(recovery) = store.recovery_report() {
        report.recovered = true;
        report.redone = recovery.redone;
        report.undone = recovery.undone;
        report.losers = recovery.losers.iter().map(|txn| txn.0).collect();
    }
    let catalog = store.catalog();
    for tree in [
        catalog.collections_tree(),
        catalog.documents_tree(),
        catalog.nodes().index(),
    ] {
        match tree.verify() {
            Ok(stats) => report.trees.push(tree_report(tree.name(), tree.root().0, &stats)),
            Err(err) => {
                report.success = false;
                report.error = Some(format!("{}: {err}", tree.name()));
                break;
            }
        }
    }
    store.close(false)?;
    Ok(report)
}

fn tree_report(name: &'static str, root: u64, stats: &BTreeStats) -> TreeReport {
    TreeReport {
        name,
        root,
        depth: stats.depth,
        leaf_pages: stats.leaf_pages,
        internal_pages: stats.internal_pages,
        entries: stats.entries,
    }
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_meta_text(report: &MetaReport) {
    println!("Meta:");
    println!(
        "  page_size={} format_version={} salt={}",
        report.page_size, report.format_version, report.salt
    );
    println!(
        "  next_page={} free_head={} free_pages={}",
        report.next_page, report.free_head, report.free_pages
    );
    println!(
        "  roots: collections={} documents={} node_index={}",
        report.collections_root, report.documents_root, report.node_index_root
    );
    println!(
        "  next_collection_id={} next_doc_id={}",
        report.next_collection_id, report.next_doc_id
    );
}

fn print_journal_text(report: &JournalReport) {
    for line in &report.listed {
        println!("{line}");
    }
    if !report.listed.is_empty() {
        println!();
    }
    let files: Vec<String> = report.files.iter().map(|no| format!("{no:010x}")).collect();
    println!("Journal: files=[{}]", files.join(", "));
    println!(
        "  entries={} last_lsn={} max_txn={} torn_tail={}",
        report.entries, report.last_lsn, report.max_txn, report.torn_tail
    );
    match report.checkpoint_lsn {
        Some(lsn) => println!("  checkpoint_lsn={lsn} redo_start={}", report.redo_start),
        None => println!("  checkpoint_lsn=none redo_start={}", report.redo_start),
    }
}

fn print_verify_text(report: &VerifyReport) {
    if report.recovered {
        println!(
            "Recovery: redone={} undone={} losers={:?}",
            report.redone, report.undone, report.losers
        );
    }
    println!("Pages: {}", report.page_count);
    for tree in &report.trees {
        println!(
            "  {:<12} root={} depth={} leaves={} internal={} entries={}",
            tree.name, tree.root, tree.depth, tree.leaf_pages, tree.internal_pages, tree.entries
        );
    }
    match &report.error {
        Some(err) => println!("FAILED: {err}"),
        None => println!("OK"),
    }
}
