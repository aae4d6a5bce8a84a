use anyhow::Context;
use clap::{Parser, ValueEnum};
use rayon::prelude::*;
use tracing_subscriber::EnvFilter;

use memregions::utils::parse_address;
use memregions::{
    MemoryRegionList, ProcessOpener, ProcessOperations, QueryOptions, WorkingSetStrategy,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Snapshot the memory regions of a process", long_about = None)]
struct Args {
    /// Process to inspect; repeat to snapshot several processes.
    #[arg(long, required = true)]
    pid: Vec<u32>,

    /// Keep free ranges in the listing.
    #[arg(long)]
    include_free: bool,

    /// Skip heap/stack/TEB/mapped-file classification.
    #[arg(long)]
    no_region_types: bool,

    /// Collect working-set counters with the given query strategy.
    #[arg(long, value_enum)]
    working_set: Option<WorkingSetArg>,

    #[arg(long, value_enum, default_value_t = Format::Table)]
    format: Format,

    /// Only print the region containing this (hex) address.
    #[arg(long)]
    lookup: Option<String>,

    /// -v for debug, -vv for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum WorkingSetArg {
    Ex,
    Legacy,
}

impl From<WorkingSetArg> for WorkingSetStrategy {
    fn from(arg: WorkingSetArg) -> Self {
        match arg {
            WorkingSetArg::Ex => WorkingSetStrategy::Ex,
            WorkingSetArg::Legacy => WorkingSetStrategy::Legacy,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Format {
    Table,
    Json,
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);
    run_platform(&args)
}

#[cfg(windows)]
fn run_platform(args: &Args) -> anyhow::Result<()> {
    let operations = ProcessOperations::new(
        memregions::windows::WindowsOpener,
        memregions::windows::current_policy(),
    );
    run(&operations, args)
}

#[cfg(not(windows))]
fn run_platform(_args: &Args) -> anyhow::Result<()> {
    anyhow::bail!("live memory snapshots are only supported on Windows")
}

#[cfg_attr(not(windows), allow(dead_code))]
fn run<O>(operations: &ProcessOperations<O>, args: &Args) -> anyhow::Result<()>
where
    O: ProcessOpener + Sync,
{
    let options = QueryOptions {
        include_free: args.include_free,
        region_types: !args.no_region_types,
        working_set: args.working_set.map(Into::into),
    };
    let lookup = args
        .lookup
        .as_deref()
        .map(parse_address)
        .transpose()
        .context("invalid --lookup address")?;

    // Snapshots of different processes are independent.
    let results: Vec<_> = args
        .pid
        .par_iter()
        .map(|&pid| (pid, operations.query_memory_regions(pid, &options)))
        .collect();

    let mut failures = 0;
    for (pid, result) in results {
        match result {
            Ok(list) => match args.format {
                Format::Json => print_json(&list, lookup)?,
                Format::Table => print_table(&list, lookup, options.working_set.is_some()),
            },
            Err(err) => {
                failures += 1;
                eprintln!("pid {}: {:#}", pid, anyhow::Error::from(err));
            }
        }
    }

    if failures == args.pid.len() {
        anyhow::bail!("no process could be inspected");
    }
    Ok(())
}

fn selected(list: &MemoryRegionList, lookup: Option<u64>) -> Vec<memregions::RegionId> {
    match lookup {
        Some(address) => list.lookup(address).into_iter().collect(),
        None => list.ids().collect(),
    }
}

fn print_json(list: &MemoryRegionList, lookup: Option<u64>) -> anyhow::Result<()> {
    let regions: Vec<_> = selected(list, lookup)
        .into_iter()
        .filter_map(|id| list.get(id))
        .collect();
    let document = serde_json::json!({
        "pid": list.process_id(),
        "regions": regions,
    });
    println!("{}", serde_json::to_string_pretty(&document)?);
    Ok(())
}

fn print_table(list: &MemoryRegionList, lookup: Option<u64>, working_set: bool) {
    println!("pid {} ({} regions)", list.process_id(), list.len());
    print!(
        "{:<18} {:>12} {:<9} {:<8} {:<8}",
        "Base", "Size", "State", "Type", "Protect"
    );
    if working_set {
        print!(" {:>8} {:>8} {:>8} {:>8}", "WS", "Shared", "Private", "Locked");
    }
    println!(" Use");

    for id in selected(list, lookup) {
        let Some(region) = list.get(id) else {
            continue;
        };
        print!(
            "{:<#18x} {:>12} {:<9} {:<8} {:<8}",
            region.base_address,
            format_size(region.region_size),
            region.state_str(),
            region.type_str(),
            region.protection_string()
        );
        if working_set {
            let ws = &region.working_set;
            print!(" {:>8} {:>8} {:>8} {:>8}", ws.total, ws.shared, ws.private, ws.locked);
        }
        println!(" {}", list.describe(id));
    }
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "kB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
