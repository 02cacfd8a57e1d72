mod driver;
mod error;
mod group;
mod iteration;
mod modes;
mod partition;
mod planner;
mod raster;
mod scene;
mod stats;
mod traits;
mod transfer;
mod verify;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytesize::ByteSize;
use clap::Parser;
use driver::{PeerFeatureTable, SoftwareDriver, SoftwareGroup, SoftwarePlatform};
use group::{GroupSelector, PeerFeatures};
use indicatif::{ProgressBar, ProgressStyle};
use log::warn;
use stats::RunStats;
use traits::{CaseReport, DeviceGroupDriver, Outcome, RunConfig, DEFAULT_FENCE_TIMEOUT};

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-GPU device-group rendering verifier", long_about = None)]
struct Args {
    /// List the test cases and exit
    #[arg(long, default_value_t = false)]
    list: bool,

    /// Run the case with this name, or every case whose name contains it
    #[arg(short, long)]
    case: Option<String>,

    /// Device group to test
    #[arg(long, default_value_t = 0)]
    group_index: usize,

    /// Primary device within the group
    #[arg(long, default_value_t = 0)]
    device_index: usize,

    /// Device count of each simulated group (e.g., '2' or '2,3'), 1 to 32
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "2",
        value_parser = clap::value_parser!(u32).range(1..=group::MAX_DEVICE_GROUP_SIZE as i64)
    )]
    devices: Vec<u32>,

    /// Simulated groups back every allocation on all devices
    #[arg(long, default_value_t = false)]
    broadcast_allocation: bool,

    /// Simulated devices cannot read peer memory from shaders
    #[arg(long, default_value_t = false)]
    no_peer_generic_src: bool,

    /// Directory holding the sphere reference images
    #[arg(long, default_value = "assets")]
    assets: PathBuf,

    /// Write diff images of failed comparisons here
    #[arg(long)]
    artifact_dir: Option<PathBuf>,

    #[arg(long, help = "Upper bound on each fence wait (e.g., '10s', '500ms')")]
    fence_timeout: Option<String>,

    /// Render the sphere references into the asset directory and exit
    #[arg(long, default_value_t = false)]
    write_references: bool,

    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    /// List available GPU adapters and exit
    #[arg(long, default_value_t = false)]
    list_gpus: bool,
}

fn parse_duration(s: &str) -> Option<Duration> {
    humantime::parse_duration(s).ok()
}

fn build_platform(args: &Args) -> SoftwarePlatform {
    let peer_features = if args.no_peer_generic_src {
        PeerFeatureTable::uniform(PeerFeatures::ALL.without(PeerFeatures::GENERIC_SRC))
    } else {
        PeerFeatureTable::default()
    };
    SoftwarePlatform {
        groups: args
            .devices
            .iter()
            .map(|&count| SoftwareGroup::new(count, !args.broadcast_allocation))
            .collect(),
        peer_features,
        ..SoftwarePlatform::default()
    }
}

fn build_config(args: &Args) -> Result<RunConfig, String> {
    let fence_timeout = match &args.fence_timeout {
        Some(s) => parse_duration(s).ok_or_else(|| format!("invalid fence timeout '{}'", s))?,
        None => DEFAULT_FENCE_TIMEOUT,
    };
    Ok(RunConfig {
        selector: GroupSelector {
            group_index: args.group_index,
            device_index: args.device_index,
        },
        asset_root: args.assets.clone(),
        artifact_dir: args.artifact_dir.clone(),
        fence_timeout,
    })
}

fn main() {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if args.list_gpus {
        #[cfg(feature = "gpu")]
        {
            let adapters = driver::adapters::enumerate_adapters();
            if adapters.is_empty() {
                println!("No GPUs found.");
            } else {
                println!("Available GPUs:");
                for adapter in &adapters {
                    println!("  {}", adapter);
                }
                println!();
                println!("Candidate device groups:");
                for group in driver::adapters::candidate_groups(&adapters) {
                    let note = if group.is_multi_device() {
                        ""
                    } else {
                        " (single device, no peer transfers)"
                    };
                    println!("  {}{}", group, note);
                }
            }
        }
        #[cfg(not(feature = "gpu"))]
        {
            println!("GPU support not compiled. Build with: cargo build --features gpu");
        }
        std::process::exit(0);
    }

    if args.list {
        for case in modes::all_cases() {
            println!("{:<26} {}", case.name, case.description);
        }
        std::process::exit(0);
    }

    if args.write_references {
        match verify::write_references(&args.assets, scene::RENDER_EXTENT) {
            Ok(paths) => {
                for path in paths {
                    println!("Wrote {}", path.display());
                }
                std::process::exit(0);
            }
            Err(e) => {
                eprintln!("Error writing references: {}", e);
                std::process::exit(1);
            }
        }
    }

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let cases = modes::select_cases(args.case.as_deref());
    if cases.is_empty() {
        eprintln!(
            "No test case matches '{}' (use --list)",
            args.case.as_deref().unwrap_or_default()
        );
        std::process::exit(1);
    }

    let platform = build_platform(&args);
    let mut driver = SoftwareDriver::new(platform);
    print_header(&driver, &config);

    let should_stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&should_stop);
    if let Err(e) = ctrlc::set_handler(move || stop_flag.store(true, Ordering::Relaxed)) {
        warn!("Could not install Ctrl-C handler: {}", e);
    }

    let stats = RunStats::new();
    let reports = run_cases(&mut driver, &cases, &config, &stats, &should_stop);

    println!();
    println!("Test Complete");
    println!("=============");
    for report in &reports {
        let detail = match &report.outcome {
            Outcome::Pass => String::new(),
            Outcome::Skip { reason } => format!(" ({})", reason),
            Outcome::Fail { message, artifact } => match artifact {
                Some(path) => format!(" ({}; diff: {})", message, path.display()),
                None => format!(" ({})", message),
            },
        };
        println!(
            "  {:<4} {:<26} {:>6} ms{}",
            report.outcome.label(),
            report.case_name,
            report.duration_ms,
            detail
        );
    }
    println!();
    println!("{}", stats.summary());
    println!("Submissions: {}", driver.submission_count());
    println!("Duration: {:.2}s", stats.elapsed_ms() as f64 / 1000.0);
    let (buffers, images, memories) = driver.live_objects();
    if buffers + images + memories > 0 {
        warn!(
            "{} buffers, {} images and {} allocations outlived their case",
            buffers, images, memories
        );
    }
    if !reports.is_empty() && reports.iter().all(|r| r.outcome.is_skip()) {
        println!("No case could run on the selected group");
    }
    if should_stop.load(Ordering::Relaxed) {
        println!(
            "Interrupted after {} of {} cases",
            stats.total(),
            cases.len()
        );
    }

    if reports.iter().any(|r| r.outcome.is_fail()) {
        println!();
        println!("DEVICE GROUP FAILURES DETECTED!");
        std::process::exit(1);
    }
    println!();
    println!("SUCCESS: No device group failures detected!");
}

fn print_header(driver: &SoftwareDriver, config: &RunConfig) {
    println!("Device Group Rendering Verification");
    println!("===================================");
    println!("Driver: {}", driver.name());
    for (index, group) in driver.platform().groups.iter().enumerate() {
        println!(
            "Group {}: {} devices, {} allocation",
            index,
            group.device_count,
            if group.subset_allocation {
                "subset"
            } else {
                "broadcast"
            }
        );
    }
    for (index, heap) in driver.platform().memory.heaps.iter().enumerate() {
        println!(
            "Heap {}: {}{}",
            index,
            ByteSize::b(heap.size),
            if heap.multi_instance {
                " (multi-instance)"
            } else {
                ""
            }
        );
    }
    println!(
        "Testing group {}, device {}",
        config.selector.group_index, config.selector.device_index
    );
    println!();
}

fn run_cases(
    driver: &mut dyn DeviceGroupDriver,
    cases: &[modes::TestCase],
    config: &RunConfig,
    stats: &RunStats,
    should_stop: &AtomicBool,
) -> Vec<CaseReport> {
    let pb = ProgressBar::new(cases.len() as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} cases | {msg}")
    {
        pb.set_style(style.progress_chars("=> "));
    }

    let mut reports = Vec::with_capacity(cases.len());
    for case in cases {
        if should_stop.load(Ordering::Relaxed) {
            pb.println("Interrupted, skipping remaining cases");
            break;
        }
        pb.set_message(case.name);
        let start = Instant::now();
        let outcome = iteration::run_case(driver, case, config);
        let report = CaseReport {
            case_name: case.name,
            outcome,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        if !report.outcome.is_pass() {
            pb.println(format!("{} {}", report.outcome.label(), case.name));
        }
        stats.record_report(&report);
        reports.push(report);
        pb.inc(1);
    }
    pb.finish_with_message("Complete");
    reports
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_seconds() {
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("invalid").is_none());
        assert!(parse_duration("").is_none());
    }

    #[test]
    fn test_parse_defaults() {
        let args = Args::parse_from(["devgroup-verify"]);
        assert!(!args.list);
        assert_eq!(args.devices, vec![2]);
        assert_eq!(args.assets, PathBuf::from("assets"));
        let config = build_config(&args).unwrap();
        assert_eq!(config.fence_timeout, DEFAULT_FENCE_TIMEOUT);
        assert_eq!(config.selector, GroupSelector::default());
    }

    #[test]
    fn test_parse_devices_list() {
        let args = Args::parse_from(["devgroup-verify", "--devices", "2,3", "--group-index", "1"]);
        assert_eq!(args.devices, vec![2, 3]);
        let platform = build_platform(&args);
        assert_eq!(platform.groups.len(), 2);
        assert_eq!(platform.groups[1].device_count, 3);
        assert!(platform.groups[1].subset_allocation);
        assert_eq!(build_config(&args).unwrap().selector.group_index, 1);
    }

    #[test]
    fn test_parse_platform_flags() {
        let args = Args::parse_from([
            "devgroup-verify",
            "--broadcast-allocation",
            "--no-peer-generic-src",
        ]);
        let platform = build_platform(&args);
        assert!(!platform.groups[0].subset_allocation);
        assert!(!platform
            .peer_features
            .get(0, 0, 1)
            .supports(PeerFeatures::GENERIC_SRC));
    }

    #[test]
    fn test_custom_fence_timeout() {
        let args = Args::parse_from(["devgroup-verify", "--fence-timeout", "250ms"]);
        assert_eq!(
            build_config(&args).unwrap().fence_timeout,
            Duration::from_millis(250)
        );
        let bad = Args::parse_from(["devgroup-verify", "--fence-timeout", "soon"]);
        assert!(build_config(&bad).is_err());
    }

    #[test]
    fn test_devices_limited_to_group_size() {
        let args = Args::parse_from(["devgroup-verify", "--devices", "1,32"]);
        assert_eq!(args.devices, vec![1, 32]);
        assert!(Args::try_parse_from(["devgroup-verify", "--devices", "33"]).is_err());
        assert!(Args::try_parse_from(["devgroup-verify", "--devices", "2,0"]).is_err());
    }

    #[test]
    fn test_parse_list_gpus() {
        let args = Args::parse_from(["devgroup-verify", "--list-gpus"]);
        assert!(args.list_gpus);
    }

    #[test]
    fn test_run_cases_records_outcomes() {
        let mut driver = SoftwareDriver::new(SoftwarePlatform::default());
        let cases = modes::select_cases(Some("_dedicated_peer"));
        let stats = RunStats::new();
        let reports = run_cases(
            &mut driver,
            &cases,
            &RunConfig::default(),
            &stats,
            &AtomicBool::new(false),
        );
        assert_eq!(reports.len(), 2);
        assert_eq!(stats.passed(), 2);
    }

    #[test]
    fn test_run_cases_stops_when_flagged() {
        let mut driver = SoftwareDriver::new(SoftwarePlatform::default());
        let stats = RunStats::new();
        let reports = run_cases(
            &mut driver,
            modes::all_cases(),
            &RunConfig::default(),
            &stats,
            &AtomicBool::new(true),
        );
        assert!(reports.is_empty());
        assert_eq!(stats.total(), 0);
    }
}
