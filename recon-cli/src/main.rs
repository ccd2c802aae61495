//! recon: CLI driver for the surveillance report associator.

use std::io::{self, BufRead};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use comfy_table::{Cell, Table};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use recon_core::associator::{Associator, NeverCancel, PassOutcome};
use recon_core::config::{self, Settings};
use recon_core::store::ReportStore;
use recon_core::target::ReconstructorTarget;
use recon_core::types::*;

#[derive(Parser)]
#[command(name = "recon", version, about = "Surveillance report associator")]
struct Cli {
    /// Debug logging (RUST_LOG is honoured otherwise)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Associate reports from a JSON-lines file and print the targets
    Associate {
        /// Path to file with one JSON report per line ("-" for stdin)
        file: PathBuf,

        /// Settings file (default ~/.track-recon/config.yaml)
        #[arg(long, env = "RECON_CONFIG")]
        config: Option<PathBuf>,

        /// Slice length in seconds; 0 runs a single pass
        #[arg(long, default_value = "0")]
        slice: f64,

        /// Print record numbers of each target
        #[arg(short, long)]
        raw: bool,
    },

    /// Show or create the settings file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective settings
    Show {
        #[arg(long)]
        path: Option<PathBuf>,

        /// Print as JSON instead of the config file format
        #[arg(long)]
        json: bool,
    },
    /// Write a default settings file
    Init {
        #[arg(long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Associate {
            file,
            config,
            slice,
            raw,
        } => cmd_associate(&file, config, slice, raw),
        Commands::Config { action } => match action {
            ConfigAction::Show { path, json } => cmd_config_show(path, json),
            ConfigAction::Init { path, force } => cmd_config_init(path, force),
        },
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn load_or_exit(path: Option<PathBuf>) -> (PathBuf, Settings) {
    let path = path.unwrap_or_else(config::config_file);
    match config::load_settings(&path) {
        Ok(settings) => (path, settings),
        Err(e) => {
            eprintln!("Error loading settings {}: {e}", path.display());
            std::process::exit(1);
        }
    }
}

// ---------------------------------------------------------------------------
// associate
// ---------------------------------------------------------------------------

fn cmd_associate(file: &Path, config: Option<PathBuf>, slice: f64, raw: bool) {
    let (config_path, settings) = load_or_exit(config);
    info!(config = %config_path.display(), "settings loaded");

    let reader: Box<dyn BufRead> = if file.to_str() == Some("-") {
        Box::new(io::stdin().lock())
    } else {
        let f = std::fs::File::open(file).unwrap_or_else(|e| {
            eprintln!("Error opening {}: {e}", file.display());
            std::process::exit(1);
        });
        Box::new(io::BufReader::new(f))
    };

    let mut store = ReportStore::new();
    let loaded = load_reports(reader, &mut store);
    info!(inserted = loaded.inserted, skipped = loaded.skipped, "reports loaded");

    let mut associator = Associator::new(settings);
    let ids = store.time_ordered();
    let slices = split_slices(&store, &ids, slice);

    for (i, ids) in slices.iter().enumerate() {
        info!(slice = i, reports = ids.len(), "slice");
        match associator.associate_new_data(&store, ids, &NeverCancel) {
            Ok(PassOutcome::Completed) => {}
            Ok(PassOutcome::Cancelled(stage)) => {
                warn!(slice = i, stage = %stage, "pass cancelled");
                break;
            }
            Err(e) => {
                eprintln!("Error associating slice {i}: {e}");
                std::process::exit(1);
            }
        }
    }

    println!();
    println!("Input: {}", file.display());
    println!(
        "  Reports: {} loaded, {} skipped, {} slices",
        loaded.inserted,
        loaded.skipped,
        slices.len()
    );
    println!(
        "  Targets: {}, unassociated reports: {}",
        associator.targets().len(),
        associator.unassociated().len()
    );
    println!();

    if raw {
        for (utn, target) in associator.targets().iter() {
            let rec_nums: Vec<String> = target.rec_nums_by_time().map(|rn| rn.to_string()).collect();
            println!("{utn}: {}", rec_nums.join(" "));
        }
    } else if !associator.targets().is_empty() {
        print_targets(associator.targets().iter().map(|(_, t)| t));
    }

    print_stats(associator.stats());
}

#[derive(Debug, Default, PartialEq, Eq)]
struct LoadSummary {
    inserted: usize,
    skipped: usize,
}

/// Parse one JSON-lines entry. Blank lines and `#` comments yield `None`.
fn parse_report_line(line: &str) -> Option<std::result::Result<TargetReport, serde_json::Error>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    Some(serde_json::from_str(line))
}

fn load_reports(reader: impl BufRead, store: &mut ReportStore) -> LoadSummary {
    let mut summary = LoadSummary::default();

    for (idx, line) in reader.lines().enumerate() {
        let line = match line {
            Ok(l) => l,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!(line = idx + 1, error = %e, "unreadable line");
                summary.skipped += 1;
                continue;
            }
            Err(e) => {
                warn!(line = idx + 1, error = %e, "read failed, stopping");
                summary.skipped += 1;
                break;
            }
        };

        let report = match parse_report_line(&line) {
            None => continue,
            Some(Ok(tr)) => tr,
            Some(Err(e)) => {
                warn!(line = idx + 1, error = %e, "unparseable report");
                summary.skipped += 1;
                continue;
            }
        };

        match store.insert(report) {
            Ok(_) => summary.inserted += 1,
            Err(e) => {
                warn!(line = idx + 1, error = %e, "report rejected");
                summary.skipped += 1;
            }
        }
    }
    summary
}

/// Cut time-ordered record numbers into consecutive windows of
/// `slice_len` seconds. Empty windows are skipped.
fn split_slices(store: &ReportStore, ids: &[RecNum], slice_len: f64) -> Vec<Vec<RecNum>> {
    let Some(&first) = ids.first() else {
        return Vec::new();
    };
    if slice_len <= 0.0 {
        return vec![ids.to_vec()];
    }

    let t0 = store.report(first).timestamp;
    let mut slices: Vec<Vec<RecNum>> = Vec::new();
    let mut current_idx = None;

    for &rn in ids {
        let idx = ((store.report(rn).timestamp - t0) / slice_len).floor() as u64;
        if current_idx != Some(idx) {
            slices.push(Vec::new());
            current_idx = Some(idx);
        }
        if let Some(slice) = slices.last_mut() {
            slice.push(rn);
        }
    }
    slices
}

fn fmt_opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or("-".into())
}

fn target_row(target: &ReconstructorTarget) -> Vec<Cell> {
    let acids: Vec<&str> = target.acids().iter().map(String::as_str).collect();
    let mode_as: Vec<String> = target.mode_as().iter().map(|&c| mode_a_to_string(c)).collect();

    vec![
        Cell::new(fmt_opt(target.utn)),
        Cell::new(if target.has_acad() {
            target.acads_str()
        } else {
            "-".into()
        }),
        Cell::new(if acids.is_empty() { "-".into() } else { acids.join(",") }),
        Cell::new(if mode_as.is_empty() {
            "-".into()
        } else {
            mode_as.join(",")
        }),
        Cell::new(
            target
                .mode_c_range()
                .map(|(lo, hi)| format!("{lo:.0}-{hi:.0}"))
                .unwrap_or("-".into()),
        ),
        Cell::new(target.num_associated()),
        Cell::new(target.ds_ids().len()),
        Cell::new(fmt_opt(target.timestamp_min().map(|t| format!("{t:.1}")))),
        Cell::new(fmt_opt(target.timestamp_max().map(|t| format!("{t:.1}")))),
    ]
}

fn print_targets<'a>(targets: impl Iterator<Item = &'a ReconstructorTarget>) {
    let mut table = Table::new();
    table.set_header(vec![
        "UTN", "ACAD", "Callsign", "Mode A", "Mode C (ft)", "Reports", "Sources", "Begin", "End",
    ]);
    for target in targets {
        table.add_row(target_row(target));
    }
    println!("{table}");
}

fn print_stats(stats: &recon_core::AssociationStats) {
    let value = match serde_json::to_value(stats) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "stats not serializable");
            return;
        }
    };
    let Some(fields) = value.as_object() else {
        return;
    };

    let mut table = Table::new();
    table.set_header(vec!["Statistic", "Value"]);
    for (name, v) in fields {
        table.add_row(vec![Cell::new(name.replace('_', " ")), Cell::new(v.to_string())]);
    }
    println!();
    println!("{table}");
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config_show(path: Option<PathBuf>, json: bool) {
    let (path, settings) = load_or_exit(path);
    if !json {
        println!("# {}", path.display());
        print!("{}", config::serialize_settings(&settings));
        return;
    }
    match settings_json(&settings) {
        Ok(text) => println!("{text}"),
        Err(e) => {
            eprintln!("Error encoding settings: {e}");
            std::process::exit(1);
        }
    }
}

fn settings_json(settings: &Settings) -> serde_json::Result<String> {
    serde_json::to_string_pretty(settings)
}

fn cmd_config_init(path: Option<PathBuf>, force: bool) {
    let path = path.unwrap_or_else(config::config_file);
    if path.exists() && !force {
        eprintln!("{} already exists (use --force to overwrite)", path.display());
        std::process::exit(1);
    }
    if let Err(e) = config::save_settings(&Settings::default(), &path) {
        eprintln!("Error writing {}: {e}", path.display());
        std::process::exit(1);
    }
    println!("Wrote default settings to {}", path.display());
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
