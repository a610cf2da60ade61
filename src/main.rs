use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use log::warn;

use cortex::models::{parse_port_range, ScanMode, ScanResult, ScanState};
use cortex::probes::{self, ProbeCatalogue};
use cortex::scanner;
use cortex::tasks::ScanModes;

/// Concurrent port scanner with probe-based service detection
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Target hostnames or IP addresses
    #[clap(value_parser, required = true)]
    hosts: Vec<String>,

    /// Port range to scan, e.g. 22-80
    #[clap(short, long, default_value = "1-1000")]
    ports: String,

    /// Scan mode (syn and udp require root/admin)
    #[clap(short, long, value_enum, default_value = "connect")]
    mode: ModeArg,

    /// Path to an nmap-service-probes file for service detection
    #[clap(long, default_value = "nmap-service-probes")]
    probes: PathBuf,

    /// Output results in JSON format
    #[clap(short, long)]
    json: bool,

    /// Enable verbose output
    #[clap(short, long)]
    verbose: bool,
}

/// Enum for scan modes from the CLI
#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Connect,
    Syn,
    Udp,
}

impl From<ModeArg> for ScanMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Connect => ScanMode::Connect,
            ModeArg::Syn => ScanMode::Syn,
            ModeArg::Udp => ScanMode::Udp,
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();

    // A missing probe file degrades to plain port scanning rather than
    // aborting the run.
    let catalogue = match probes::load_probes(&args.probes) {
        Ok((probes, stats)) => {
            println!("Loaded {} service detection probes", stats.probe_count);
            Arc::new(ProbeCatalogue::new(probes))
        }
        Err(e) => {
            warn!("could not load service probes: {}", e);
            warn!("continuing with basic port scanning without service detection");
            Arc::new(ProbeCatalogue::empty())
        }
    };

    let (start_port, end_port) = match parse_port_range(&args.ports) {
        Ok(range) => range,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    let mode = ScanMode::from(args.mode);
    let modes = ScanModes::new();
    let (worker, worker_count) = match modes.resolve(mode).await {
        Ok(resolved) => resolved,
        Err(e) => {
            eprintln!("Error: {}", e);
            if mode != ScanMode::Connect {
                eprintln!(
                    "{} scan requires elevated privileges. Try: sudo cortex --mode {} ...",
                    mode, mode
                );
            }
            process::exit(1);
        }
    };

    let results =
        scanner::execute_scan(&args.hosts, start_port, end_port, worker, worker_count, catalogue)
            .await;

    if args.json {
        output_json(&results);
    } else {
        output_plain_text(&results);
    }
}

/// Print results as pretty JSON
fn output_json(results: &[ScanResult]) {
    match serde_json::to_string_pretty(results) {
        Ok(encoded) => println!("{}", encoded),
        Err(e) => eprintln!("Error encoding to JSON: {}", e),
    }
}

/// Print open ports in human-readable form, one per line, with the service
/// name or the first line of the banner when one was captured
fn output_plain_text(results: &[ScanResult]) {
    for result in results {
        if result.state != ScanState::Open {
            continue;
        }
        if result.service.is_empty() {
            println!("{}:{} - {}", result.host, result.port, result.state);
        } else {
            let first_line = result.service.lines().next().unwrap_or_default();
            let mut banner: String = first_line.chars().take(100).collect();
            if banner.len() < first_line.len() {
                banner.push_str("...");
            }
            println!("{}:{} - {} - {}", result.host, result.port, result.state, banner);
        }
    }
}
