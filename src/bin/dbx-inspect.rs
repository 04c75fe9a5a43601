//! Binary entry point for the store inspector.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use dbx_store::{
    admin::{
        inspect_page, summarize, verify, AdminOpenOptions, FileSummary, PageSummary, VerifyReport,
    },
    logging::init_logging,
    StoreOptions,
};

#[derive(Parser, Debug)]
#[command(
    name = "dbx-inspect",
    version,
    about = "Read-only inspector for dbx-store files",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(flatten)]
    open: OpenArgs,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[arg(
        long,
        global = true,
        env = "DBX_LOG",
        value_name = "FILTER",
        help = "Tracing filter, e.g. dbx_store=debug"
    )]
    log: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct OpenArgs {
    #[arg(long, global = true, value_name = "FILE", help = "TOML store options to open with")]
    config: Option<PathBuf>,

    #[arg(long, global = true, help = "Override page buffer size (pages)")]
    buffer_pages: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Show header fields and page counts")]
    Info {
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },

    #[command(about = "Show one page's header and record table")]
    Page {
        #[arg(value_name = "FILE")]
        path: PathBuf,
        #[arg(value_name = "PAGE")]
        page: u32,
    },

    #[command(about = "Check page structures; exits 2 on errors")]
    Verify {
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    if let Some(filter) = &cli.log {
        init_logging(filter)?;
    }
    let open_opts = build_open_options(&cli.open)?;

    match cli.command {
        Command::Info { path } => {
            let summary = summarize(&path, &open_opts)?;
            emit(&cli.format, &summary, |_| print_info_text(&summary))?;
        }
        Command::Page { path, page } => {
            let summary = inspect_page(&path, &open_opts, page)?;
            emit(&cli.format, &summary, |_| print_page_text(&summary))?;
        }
        Command::Verify { path } => {
            let report = verify(&path, &open_opts)?;
            emit(&cli.format, &report, |_| print_verify_text(&report))?;
            if !report.success {
                std::process::exit(2);
            }
        }
    }
    Ok(())
}

fn build_open_options(args: &OpenArgs) -> Result<AdminOpenOptions, Box<dyn Error>> {
    let mut opts = AdminOpenOptions::default();
    if let Some(path) = &args.config {
        let text = std::fs::read_to_string(path)?;
        let store = StoreOptions::from_toml_str(&text)?;
        opts.buffer_pages = store.buffer_pages;
        opts.lock_timeout_ms = store.lock_timeout_ms;
    }
    if let Some(pages) = args.buffer_pages {
        opts.buffer_pages = pages;
    }
    Ok(opts)
}

fn emit<T, F>(format: &OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: serde::Serialize,
    F: Fn(OutputFormat),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(OutputFormat::Text),
    }
    Ok(())
}

fn print_info_text(summary: &FileSummary) {
    println!(
        "File: path={} size={} kind={:?} version={} codec={:?}",
        summary.path, summary.size_bytes, summary.kind, summary.version, summary.codec
    );
    println!(
        "Pages: page_size={} work_size={} last_page={} free_head={}",
        summary.page_size,
        summary.work_size,
        summary.last_page,
        summary
            .free_head
            .map_or_else(|| "none".to_string(), |p| p.to_string())
    );
    println!(
        "  record={} multi_page={} lob={} free_list={} unreadable={}",
        summary.pages.record,
        summary.pages.multi_page,
        summary.pages.lob,
        summary.pages.free_list,
        summary.pages.unreadable
    );
    println!("Free space: {} entries", summary.free_space.len());
    for entry in &summary.free_space {
        println!("  page {} free={}", entry.page, entry.free);
    }
}

fn print_page_text(page: &PageSummary) {
    println!(
        "Page {}: status={:?} records={} data_length={} next_slot={} remaining={}",
        page.page, page.status, page.record_count, page.data_length, page.next_slot, page.remaining
    );
    println!(
        "  next_in_chain={:?} last_in_chain={:?}",
        page.next_in_chain, page.last_in_chain
    );
    for record in &page.records {
        match record.forward_to {
            Some(target) => println!(
                "  slot={} offset={} link={}",
                record.slot, record.offset, target
            ),
            None => println!(
                "  slot={} offset={} len={}{}",
                record.slot,
                record.offset,
                record.len,
                if record.overflow_ref { " overflow_ref" } else { "" }
            ),
        }
    }
    if !page.preview.is_empty() {
        println!("  data: {}", page.preview);
    }
}

fn print_verify_text(report: &VerifyReport) {
    println!(
        "Verify ({:?}) => success={} pages={} records={} chain_heads={} chain_pages={} free_pages={} unreadable={}",
        report.kind,
        report.success,
        report.counts.pages,
        report.counts.records,
        report.counts.chain_heads,
        report.counts.chain_pages,
        report.counts.free_pages,
        report.counts.unreadable_pages,
    );
    for finding in &report.findings {
        match finding.page {
            Some(page) => println!("- {:?} (page {page}): {}", finding.severity, finding.message),
            None => println!("- {:?}: {}", finding.severity, finding.message),
        }
    }
}
