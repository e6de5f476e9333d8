use clap::Parser;
use log::{error, info, warn};
use probe_data::vector::{candidate_space, candidate_space_len};
use probe_data::TestVector;
use probe_master::config::{ProbeConfig, SchedulerSettings};
use probe_master::disasm::listing;
use probe_master::elf;
use probe_master::executor::NativeExecutor;
use probe_master::harness::HarnessGenerator;
use probe_master::probe::Prober;
use probe_master::scheduler::Scheduler;
use probe_master::state::{CheckpointStore, QueueOrder, RunState, WorkQueue};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Searches short byte sequences that execute without any visible effect.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Number of parallel workers
    #[arg(short, long, default_value_t = 16)]
    threads: usize,
    /// Checkpoint file, resumed from if it exists
    #[arg(short, long, default_value = "result.json")]
    out: PathBuf,
    /// Probe the vectors of another result file instead of the whole space
    #[arg(short, long = "in")]
    input: Option<PathBuf>,
    /// Seconds between checkpoints
    #[arg(long, default_value_t = 600)]
    save: u64,
    /// Seconds between status reports
    #[arg(long, default_value_t = 10)]
    status: u64,
    /// Longest sequence to probe
    #[arg(short, long, default_value_t = 3, value_parser = clap::value_parser!(u8).range(1..=3))]
    length: u8,
    /// Probe in random order
    #[arg(long)]
    shuffle: bool,
    /// Seed of the random order
    #[arg(long)]
    seed: Option<u64>,
    /// Seconds a single harness may run
    #[arg(long, default_value_t = 10)]
    timeout: u64,
    #[arg(long, default_value_t = probe_data::output::DEFAULT_CAPTURE_GROUPS)]
    capture_groups: usize,
    #[arg(long, default_value_t = 8)]
    stack_guard_frames: usize,
    #[arg(long, default_value_t = 512)]
    jump_guard_bytes: usize,
    #[arg(long)]
    skip_selfcheck: bool,
    /// Print the harness listing of a single vector (hex) and exit
    #[arg(long)]
    dump_harness: Option<TestVector>,
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let args = Args::parse();

    let config = ProbeConfig {
        capture_groups: args.capture_groups,
        stack_guard_frames: args.stack_guard_frames,
        jump_guard_bytes: args.jump_guard_bytes,
        timeout: Duration::from_secs(args.timeout),
        ..Default::default()
    };
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    if let Some(vector) = args.dump_harness {
        let generator = HarnessGenerator::new(config);
        match generator.assemble(&vector.padded()) {
            Ok(code) => {
                let ip = elf::entry_point() as u64;
                print!("{}", listing(&code, ip));
            }
            Err(e) => {
                error!("Failed to build the harness for {}: {}", vector, e);
                std::process::exit(1);
            }
        }
        return;
    }

    if args.input.as_ref() == Some(&args.out) {
        error!("Input and output file must differ");
        std::process::exit(1);
    }

    let store = match CheckpointStore::load(&args.out) {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to load the checkpoint {:?}: {:?}", args.out, e);
            std::process::exit(1);
        }
    };

    let candidates: Vec<TestVector> = match &args.input {
        Some(input) => match CheckpointStore::from_file(input) {
            Ok(previous) => {
                info!("Retesting {} vectors from {:?}", previous.len(), input);
                previous.vectors().collect()
            }
            Err(e) => {
                error!("Failed to load the input {:?}: {:?}", input, e);
                std::process::exit(1);
            }
        },
        None => {
            let length = args.length as usize;
            info!(
                "Generating all {} sequences up to {} bytes",
                candidate_space_len(length),
                length
            );
            candidate_space(length).collect()
        }
    };

    if args.seed.is_some() && !args.shuffle {
        warn!("--seed has no effect without --shuffle");
    }
    let order = if args.shuffle {
        QueueOrder::Shuffled(args.seed)
    } else {
        QueueOrder::Sorted
    };
    let queue = WorkQueue::build(candidates, &store, order);

    let executor = match NativeExecutor::new() {
        Ok(executor) => executor,
        Err(e) => {
            error!("Failed to create the scratch directory: {:?}", e);
            std::process::exit(1);
        }
    };
    let prober = match Prober::new(config, executor) {
        Ok(prober) => prober,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    if !args.skip_selfcheck && !prober.selfcheck().await {
        error!("This host cannot run the harness, aborting");
        std::process::exit(1);
    }

    let settings = SchedulerSettings {
        workers: args.threads,
        checkpoint_interval: Duration::from_secs(args.save),
        status_interval: Duration::from_secs(args.status),
        checkpoint_path: args.out.clone(),
    };
    let state = Arc::new(RunState::new(queue, store));
    let scheduler = match Scheduler::new(prober, state, settings) {
        Ok(scheduler) => scheduler,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let summary = scheduler.run().await;
    info!("{}", summary);
    if summary.interrupted {
        info!("Run again with the same --out to resume");
    }
    if !summary.saved {
        std::process::exit(1);
    }
}
