use anyhow::{anyhow, bail, Context, Result};
use cellalloc_core::{Fallback, Placement, Prefer, SampleId};
use cellalloc_engine::{
    AllocationError, AllocationService, AuditReport, AuditorConfig, BulkItem, BulkOutcome,
    ConsistencyAuditor, DuplicateResolver, ErrorKind, JsonlAuditSink, RepairReport,
    ResolverConfig, ResolverReport, DEFAULT_MAX_FILL_CELLS, DEFAULT_MISSING_CELLS_CAP,
};
use cellalloc_storage::{OccupancyStore, StorageError, StoreConfig};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cellalloc")]
#[command(about = "Storage-cell allocation engine", long_about = None)]
struct Cli {
    /// SQLite database file
    #[arg(long, global = true, env = "CELLALLOC_DB", default_value = "cellalloc.db")]
    db: PathBuf,
    /// Audit log (JSON lines); defaults to `<db>.audit.jsonl`
    #[arg(long, global = true, env = "CELLALLOC_AUDIT_LOG")]
    audit_log: Option<PathBuf>,
    #[arg(long, global = true, env = "CELLALLOC_BUSY_TIMEOUT_MS", default_value_t = 5000)]
    busy_timeout_ms: u64,
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[arg(long, global = true, default_value_t = false)]
    verbose: bool,
    /// Machine-readable output on stdout
    #[arg(long, global = true, default_value_t = false)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct CellArgs {
    #[arg(long = "box")]
    box_id: String,
    #[arg(long = "cell")]
    cell_id: String,
}

#[derive(Args, Debug)]
struct BulkArgs {
    #[arg(long = "box")]
    box_id: String,
    /// JSON array of `{sample_id, cell_id, is_primary}`; stdin when omitted
    #[arg(long)]
    file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the missing cells of a box grid
    EnsureCells {
        #[arg(long = "box")]
        box_id: String,
        #[arg(long)]
        rows: u32,
        #[arg(long)]
        cols: u32,
    },
    /// Set a sample's primary location
    Assign {
        #[arg(long = "sample")]
        sample_id: SampleId,
        #[command(flatten)]
        cell: CellArgs,
    },
    /// Free a cell, whichever relationship holds it
    Clear {
        #[command(flatten)]
        cell: CellArgs,
    },
    /// Place a sample through an allocation row
    Allocate {
        #[arg(long = "sample")]
        sample_id: SampleId,
        #[command(flatten)]
        cell: CellArgs,
        #[arg(long, default_value_t = false)]
        primary: bool,
    },
    /// Remove a sample's allocation on a cell
    Unallocate {
        #[arg(long = "sample")]
        sample_id: SampleId,
        #[command(flatten)]
        cell: CellArgs,
    },
    BulkAssign(BulkArgs),
    BulkAllocate(BulkArgs),
    /// Report duplicates, gaps and geometry drift per box
    Audit {
        #[arg(long = "box")]
        boxes: Vec<String>,
        #[arg(long, default_value_t = DEFAULT_MISSING_CELLS_CAP)]
        missing_cap: usize,
    },
    /// Fix box metadata, duplicate cell rows and grid gaps
    Repair {
        #[arg(long = "box")]
        boxes: Vec<String>,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        /// Boxes with a larger gap than this fail instead of being filled
        #[arg(long, default_value_t = DEFAULT_MAX_FILL_CELLS)]
        max_fill_cells: u64,
    },
    /// Pick one winner for every cell shared as primary by several samples
    ResolveDuplicates(ResolveArgs),
}

#[derive(Args, Debug)]
struct ResolveArgs {
    #[arg(long = "box")]
    boxes: Vec<String>,
    #[arg(long, default_value_t = false, conflicts_with = "execute")]
    dry_run: bool,
    #[arg(long, default_value_t = false)]
    execute: bool,
    #[arg(long, value_enum, default_value_t = PreferArg::WithStrain)]
    prefer: PreferArg,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long, default_value_t = false)]
    reallocate: bool,
    #[arg(long, value_enum, default_value_t = FallbackArg::None)]
    fallback: FallbackArg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum PreferArg {
    #[value(name = "with_strain")]
    WithStrain,
    #[value(name = "created_at")]
    CreatedAt,
    #[value(name = "updated_at")]
    UpdatedAt,
}

impl From<PreferArg> for Prefer {
    fn from(value: PreferArg) -> Self {
        match value {
            PreferArg::WithStrain => Prefer::WithStrain,
            PreferArg::CreatedAt => Prefer::CreatedAt,
            PreferArg::UpdatedAt => Prefer::UpdatedAt,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum FallbackArg {
    #[value(name = "none")]
    None,
    #[value(name = "any_box")]
    AnyBox,
}

impl From<FallbackArg> for Fallback {
    fn from(value: FallbackArg) -> Self {
        match value {
            FallbackArg::None => Fallback::None,
            FallbackArg::AnyBox => Fallback::AnyBox,
        }
    }
}

#[derive(Serialize)]
struct ErrorOutput<'a> {
    error: ErrorKind,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    occupant: Option<SampleId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    remediation: Option<&'a str>,
    retryable: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref(), cli.verbose);
    run(cli)
}

fn log_directive(flag: Option<&str>, verbose: bool) -> Option<String> {
    if verbose {
        return Some("debug".to_string());
    }
    flag.map(str::to_string)
        .or_else(|| std::env::var("CELLALLOC_LOG_LEVEL").ok())
        .filter(|level| !level.trim().is_empty())
}

fn init_logging(flag: Option<&str>, verbose: bool) {
    let filter = match log_directive(flag, verbose) {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn default_audit_log(db: &Path) -> PathBuf {
    let mut name = OsString::from(db.as_os_str());
    name.push(".audit.jsonl");
    PathBuf::from(name)
}

fn open_store(cli: &Cli) -> Result<OccupancyStore> {
    let config = StoreConfig {
        busy_timeout: Duration::from_millis(cli.busy_timeout_ms),
        ..StoreConfig::default()
    };
    OccupancyStore::open_with(&cli.db, config)
        .with_context(|| format!("failed to open database {}", cli.db.display()))
}

fn run(cli: Cli) -> Result<()> {
    let mut store = open_store(&cli)?;
    let audit_path = cli
        .audit_log
        .clone()
        .unwrap_or_else(|| default_audit_log(&cli.db));
    let audit = JsonlAuditSink::new(audit_path);
    let service = AllocationService::new(&audit);
    let json = cli.json;

    match cli.command {
        Commands::EnsureCells {
            box_id,
            rows,
            cols,
        } => {
            let created = store
                .ensure_cells(&box_id, rows, cols)
                .with_context(|| format!("failed to generate cells for {box_id}"))?;
            if json {
                print_json(&serde_json::json!({ "box_id": box_id, "created": created }))?;
            } else {
                println!("{box_id}: {created} cell(s) created");
            }
        }
        Commands::Assign { sample_id, cell } => {
            let placement = service
                .assign_primary(&mut store, sample_id, &cell.box_id, &cell.cell_id)
                .map_err(|err| allocation_failure(json, &err))?;
            print_placement(json, "assigned", &placement)?;
        }
        Commands::Clear { cell } => {
            let placement = service
                .clear_primary(&mut store, &cell.box_id, &cell.cell_id)
                .map_err(|err| allocation_failure(json, &err))?;
            print_placement(json, "cleared", &placement)?;
        }
        Commands::Allocate {
            sample_id,
            cell,
            primary,
        } => {
            let placement = service
                .allocate(&mut store, sample_id, &cell.box_id, &cell.cell_id, primary)
                .map_err(|err| allocation_failure(json, &err))?;
            print_placement(json, "allocated", &placement)?;
        }
        Commands::Unallocate { sample_id, cell } => {
            let placement = service
                .unallocate(&mut store, sample_id, &cell.box_id, &cell.cell_id)
                .map_err(|err| allocation_failure(json, &err))?;
            print_placement(json, "unallocated", &placement)?;
        }
        Commands::BulkAssign(args) => {
            let items = read_bulk_items(args.file.as_deref())?;
            let outcome = service
                .bulk_assign_primary(&mut store, &args.box_id, &items)
                .map_err(|err| allocation_failure(json, &err))?;
            print_bulk(json, &outcome)?;
        }
        Commands::BulkAllocate(args) => {
            let items = read_bulk_items(args.file.as_deref())?;
            let outcome = service
                .bulk_allocate(&mut store, &args.box_id, &items)
                .map_err(|err| allocation_failure(json, &err))?;
            print_bulk(json, &outcome)?;
        }
        Commands::Audit { boxes, missing_cap } => {
            let auditor = ConsistencyAuditor::new(
                AuditorConfig {
                    missing_cells_cap: missing_cap,
                    boxes,
                    ..AuditorConfig::default()
                },
                &audit,
            );
            let report = auditor.report(&store).context("audit failed")?;
            print_audit(json, &report)?;
            if report.has_failures() {
                bail!(
                    "{} box(es) have no inferable geometry: {}",
                    report.failed_boxes.len(),
                    report.failed_boxes.join(", ")
                );
            }
        }
        Commands::Repair {
            boxes,
            dry_run,
            max_fill_cells,
        } => {
            let auditor = ConsistencyAuditor::new(
                AuditorConfig {
                    boxes,
                    max_fill_cells,
                    ..AuditorConfig::default()
                },
                &audit,
            );
            let report = auditor.report(&store).context("audit failed")?;
            let repairs = auditor
                .repair(&mut store, &report, dry_run)
                .context("repair failed")?;
            if !dry_run {
                try_enforce_constraints(&store)?;
            }
            print_repair(json, &repairs)?;
            if repairs.has_failures() {
                bail!(
                    "{} box(es) could not be repaired: {}",
                    repairs.failed_boxes.len(),
                    repairs.failed_boxes.join(", ")
                );
            }
        }
        Commands::ResolveDuplicates(args) => {
            let resolver = DuplicateResolver::new(
                ResolverConfig {
                    prefer: args.prefer.into(),
                    execute: args.execute && !args.dry_run,
                    limit: args.limit,
                    reallocate: args.reallocate,
                    fallback: args.fallback.into(),
                    boxes: args.boxes,
                },
                &audit,
            );
            let report = resolver.run(&mut store).context("duplicate resolution failed")?;
            if !report.dry_run {
                try_enforce_constraints(&store)?;
            }
            print_resolve(json, cli.verbose, &report)?;
        }
    }

    Ok(())
}

/// Installs the uniqueness indexes when the data has become clean.
fn try_enforce_constraints(store: &OccupancyStore) -> Result<()> {
    match store.enforce_constraints() {
        Ok(()) => {
            info!(event = "constraints_enforced");
            Ok(())
        }
        Err(StorageError::ConstraintsBlocked {
            duplicate_cells,
            shared_primaries,
        }) => {
            warn!(event = "constraints_deferred", duplicate_cells, shared_primaries);
            Ok(())
        }
        Err(err) => Err(err).context("failed to enforce uniqueness constraints"),
    }
}

fn allocation_failure(json: bool, err: &AllocationError) -> anyhow::Error {
    if json {
        let output = ErrorOutput {
            error: err.kind(),
            message: err.to_string(),
            occupant: err.occupant(),
            remediation: err.remediation(),
            retryable: err.is_retryable(),
        };
        if let Err(print_err) = print_json(&output) {
            return print_err;
        }
    }
    anyhow!("{}: {err}", err.kind().as_str())
}

fn read_bulk_items(file: Option<&Path>) -> Result<Vec<BulkItem>> {
    let content = match file {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .context("failed to read bulk items from stdin")?;
            buffer
        }
    };
    parse_bulk_items(&content)
}

fn parse_bulk_items(content: &str) -> Result<Vec<BulkItem>> {
    serde_json::from_str(content).context("bulk items must be a JSON array of {sample_id, cell_id}")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_placement(json: bool, verb: &str, placement: &Placement) -> Result<()> {
    if json {
        return print_json(placement);
    }
    let role = if placement.is_primary {
        "primary"
    } else {
        "secondary"
    };
    println!(
        "{verb}: sample {} at {}/{} ({role})",
        placement.sample_id, placement.box_id, placement.cell_id
    );
    Ok(())
}

fn print_bulk(json: bool, outcome: &BulkOutcome) -> Result<()> {
    if json {
        return print_json(outcome);
    }
    println!(
        "{}: {} requested, {} successful, {} failed (batch {})",
        outcome.box_id, outcome.requested, outcome.successful, outcome.failed, outcome.batch_id
    );
    for error in &outcome.errors {
        match &error.remediation {
            Some(remediation) => println!(
                "  sample {} -> {}: {} [{remediation}]",
                error.item.sample_id, error.item.cell_id, error.message
            ),
            None => println!(
                "  sample {} -> {}: {}",
                error.item.sample_id, error.item.cell_id, error.message
            ),
        }
    }
    Ok(())
}

fn print_audit(json: bool, report: &AuditReport) -> Result<()> {
    if json {
        return print_json(report);
    }
    for audit in &report.boxes {
        if let Some(error) = &audit.error {
            println!("{}: ERROR {error}", audit.box_id);
            continue;
        }
        let stored = audit
            .stored
            .map_or_else(|| "none".to_string(), |g| format!("{}x{}", g.rows, g.cols));
        let inferred = audit
            .inferred
            .map_or_else(|| "none".to_string(), |g| format!("{}x{}", g.rows, g.cols));
        println!(
            "{}: {} rows, {} distinct, stored {stored}, inferred {inferred}, {} duplicate label(s), {} missing{}",
            audit.box_id,
            audit.cell_rows,
            audit.distinct_cells,
            audit.duplicates.len(),
            audit.missing_count,
            if audit.geometry_mismatch { ", geometry mismatch" } else { "" }
        );
        if !audit.invalid_labels.is_empty() {
            println!("  invalid labels: {}", audit.invalid_labels.join(", "));
        }
        if !audit.noncanonical_labels.is_empty() {
            let spellings = audit
                .noncanonical_labels
                .iter()
                .map(|spelling| format!("{} -> {}", spelling.cell_id, spelling.canonical))
                .collect::<Vec<_>>();
            println!("  respell: {}", spellings.join(", "));
        }
    }
    println!(
        "total: {} cell rows, {} duplicate rows, {} missing cells",
        report.total_cell_rows, report.total_duplicate_rows, report.total_missing
    );
    Ok(())
}

fn print_repair(json: bool, report: &RepairReport) -> Result<()> {
    if json {
        return print_json(report);
    }
    let mode = if report.dry_run { "dry-run" } else { "applied" };
    for repair in &report.boxes {
        if let Some(error) = &repair.error {
            println!("{}: ERROR {error}", repair.box_id);
            continue;
        }
        println!(
            "{} ({mode}): {} step(s), {} cell(s) created, {} duplicate row(s) removed, {} label(s) respelled, {} reference(s) moved",
            repair.box_id,
            repair.steps.len(),
            repair.cells_created,
            repair.rows_removed,
            repair.labels_renamed,
            repair.references_moved
        );
    }
    Ok(())
}

fn print_resolve(json: bool, verbose: bool, report: &ResolverReport) -> Result<()> {
    if json {
        return print_json(report);
    }
    let mode = if report.dry_run { "dry-run" } else { "executed" };
    println!(
        "{mode}: {} conflict group(s), {} processed, {} skipped, {} cleared, {} reallocated, {} unplaced",
        report.groups_found,
        report.groups_processed,
        report.groups_skipped,
        report.cleared,
        report.reallocated,
        report.unplaced
    );
    println!("plan digest: {}", report.plan_digest);
    if verbose {
        for decision in &report.decisions {
            let losers = decision
                .losers
                .iter()
                .map(|loser| format!("{} (score {})", loser.sample_id, loser.score))
                .collect::<Vec<_>>()
                .join(", ");
            println!(
                "  {}/{}: keep {} (score {}), release {losers}",
                decision.box_id, decision.cell_id, decision.winner.sample_id, decision.winner.score
            );
            for reallocation in &decision.reallocations {
                match (&reallocation.box_id, &reallocation.cell_id) {
                    (Some(box_id), Some(cell_id)) => {
                        println!("    {} -> {box_id}/{cell_id}", reallocation.sample_id)
                    }
                    _ => println!("    {} -> unplaced", reallocation.sample_id),
                }
            }
        }
    }
    for error in &report.errors {
        println!(
            "  error at {}/{}: {}",
            error.box_id, error.cell_id, error.message
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn resolver_flags_parse() {
        let cli = Cli::try_parse_from([
            "cellalloc",
            "--db",
            "lab.db",
            "resolve-duplicates",
            "--execute",
            "--prefer",
            "updated_at",
            "--limit",
            "3",
            "--reallocate",
            "--fallback",
            "any_box",
            "--box",
            "BOX1",
            "--box",
            "BOX2",
        ])
        .expect("parse");
        assert_eq!(cli.db, PathBuf::from("lab.db"));
        let Commands::ResolveDuplicates(args) = cli.command else {
            panic!("expected resolve-duplicates");
        };
        assert!(args.execute);
        assert_eq!(Prefer::from(args.prefer), Prefer::UpdatedAt);
        assert_eq!(Fallback::from(args.fallback), Fallback::AnyBox);
        assert_eq!(args.limit, Some(3));
        assert_eq!(args.boxes, vec!["BOX1", "BOX2"]);
    }

    #[test]
    fn execute_conflicts_with_dry_run() {
        let err = Cli::try_parse_from([
            "cellalloc",
            "resolve-duplicates",
            "--execute",
            "--dry-run",
        ])
        .expect_err("conflict");
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn resolver_defaults_to_dry_run_with_strain() {
        let cli = Cli::try_parse_from(["cellalloc", "resolve-duplicates"]).expect("parse");
        let Commands::ResolveDuplicates(args) = cli.command else {
            panic!("expected resolve-duplicates");
        };
        assert!(!args.execute);
        assert_eq!(args.prefer, PreferArg::WithStrain);
        assert_eq!(args.fallback, FallbackArg::None);
    }

    #[test]
    fn cell_commands_take_box_and_cell() {
        let cli = Cli::try_parse_from([
            "cellalloc", "allocate", "--sample", "10", "--box", "BOX1", "--cell", "a1", "--primary",
        ])
        .expect("parse");
        let Commands::Allocate {
            sample_id,
            cell,
            primary,
        } = cli.command
        else {
            panic!("expected allocate");
        };
        assert_eq!(sample_id, 10);
        assert_eq!(cell.box_id, "BOX1");
        assert_eq!(cell.cell_id, "a1");
        assert!(primary);
    }

    #[test]
    fn repair_bounds_the_grid_fill() {
        let cli = Cli::try_parse_from(["cellalloc", "repair", "--dry-run"]).expect("parse");
        let Commands::Repair { max_fill_cells, .. } = cli.command else {
            panic!("expected repair");
        };
        assert_eq!(max_fill_cells, DEFAULT_MAX_FILL_CELLS);

        let cli = Cli::try_parse_from(["cellalloc", "repair", "--max-fill-cells", "50"])
            .expect("parse");
        let Commands::Repair {
            dry_run,
            max_fill_cells,
            ..
        } = cli.command
        else {
            panic!("expected repair");
        };
        assert!(!dry_run);
        assert_eq!(max_fill_cells, 50);
    }

    #[test]
    fn audit_log_defaults_next_to_database() {
        assert_eq!(
            default_audit_log(Path::new("/data/lab.db")),
            PathBuf::from("/data/lab.db.audit.jsonl")
        );
    }

    #[test]
    fn verbose_forces_debug_logging() {
        assert_eq!(log_directive(Some("warn"), true).as_deref(), Some("debug"));
        assert_eq!(log_directive(Some("warn"), false).as_deref(), Some("warn"));
    }

    #[test]
    fn bulk_items_default_to_non_primary() {
        let items = parse_bulk_items(
            r#"[{"sample_id": 1, "cell_id": "A1"}, {"sample_id": 2, "cell_id": "B1", "is_primary": true}]"#,
        )
        .expect("parse");
        assert_eq!(items.len(), 2);
        assert!(!items[0].is_primary);
        assert!(items[1].is_primary);
        assert!(parse_bulk_items("{}").is_err());
    }
}
