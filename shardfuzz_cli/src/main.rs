use clap::Parser;
use shardfuzz_core::engine::{early_exit_code, early_exit_requested, Engine};
use shardfuzz_core::executor::{CommandCallbacks, CommandOptions, InputDelivery};
use shardfuzz_core::knobs::Knobs;
use shardfuzz_core::workdir::{self, LocalStorage};
use shardfuzz_core::EngineConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Distributed coverage-guided fuzzing engine for out-of-process targets.
///
/// Flags override settings loaded from --config-file. Launch one process
/// per shard; shards cooperate only through append-only files under the
/// workdir.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Optional TOML file with engine settings.
    #[clap(long, value_parser)]
    config_file: Option<PathBuf>,

    /// Target binary to fuzz.
    #[clap(long)]
    binary: Option<String>,

    /// Additional binaries each batch is replayed against.
    #[clap(long = "extra-binary")]
    extra_binaries: Vec<String>,

    /// Shared state directory.
    #[clap(long)]
    workdir: Option<PathBuf>,

    /// Merge the same-index shard from this other workdir before fuzzing.
    #[clap(long)]
    merge_from: Option<PathBuf>,

    #[clap(long)]
    total_shards: Option<usize>,

    #[clap(long)]
    shard_index: Option<usize>,

    /// Number of target runs this shard performs.
    #[clap(long)]
    num_runs: Option<u64>,

    #[clap(long)]
    batch_size: Option<usize>,

    /// Prune the corpus whenever its total is a multiple of this (0 = off).
    #[clap(long)]
    prune_frequency: Option<usize>,

    #[clap(long)]
    max_corpus_size: Option<usize>,

    /// Load a random sibling shard every N batches (0 = off).
    #[clap(long)]
    load_other_shard_frequency: Option<usize>,

    /// Load every shard at startup instead of just our own.
    #[clap(long)]
    full_sync: bool,

    /// Shards with index below this distill after loading.
    #[clap(long)]
    distill_shards: Option<usize>,

    /// Sample the corpus uniformly instead of by rarity weight.
    #[clap(long)]
    uniform_sampling: bool,

    #[clap(long)]
    no_dataflow_features: bool,

    #[clap(long)]
    no_cmp_features: bool,

    /// Depth of bounded-path tracking (0 discards path features).
    #[clap(long)]
    path_level: Option<usize>,

    /// External command vetoing corpus additions (input path as argv[1]).
    #[clap(long)]
    input_filter: Option<String>,

    /// PC indexes the function filter accepts (comma-separated).
    #[clap(long, value_delimiter = ',')]
    function_filter: Vec<usize>,

    /// Directories receiving content-addressed copies of new inputs.
    #[clap(long = "corpus-dir")]
    corpus_dirs: Vec<PathBuf>,

    #[clap(long)]
    exit_on_crash: bool,

    #[clap(long)]
    max_num_crash_reports: Option<usize>,

    #[clap(long)]
    seed: Option<u64>,

    /// Verbosity of periodic stats lines (0 keeps lifecycle events only).
    #[clap(long)]
    log_level: Option<usize>,

    /// Deliver inputs by writing to this file instead of stdin; `@@` in
    /// target args is replaced by the path.
    #[clap(long)]
    input_file: Option<PathBuf>,

    /// Arguments passed to the target binary.
    #[clap(long = "target-arg")]
    target_args: Vec<String>,

    /// Per-run timeout in milliseconds.
    #[clap(long, default_value_t = 2000)]
    timeout_ms: u64,

    /// Knob values as comma-separated bytes.
    #[clap(long, value_delimiter = ',')]
    knobs: Vec<u8>,

    /// Export all inputs from this directory into the shards, then exit.
    #[clap(long)]
    export_corpus_from: Option<PathBuf>,

    /// Write every shard's corpus to this directory, then exit.
    #[clap(long)]
    save_corpus_to: Option<PathBuf>,
}

fn build_config(cli: &Cli) -> Result<EngineConfig, anyhow::Error> {
    let mut config = match &cli.config_file {
        Some(path) => {
            log::info!("loading configuration from {path:?}");
            EngineConfig::load_from_file(path)?
        }
        None => {
            let binary = cli
                .binary
                .clone()
                .ok_or_else(|| anyhow::anyhow!("--binary is required without --config-file"))?;
            let workdir = cli
                .workdir
                .clone()
                .ok_or_else(|| anyhow::anyhow!("--workdir is required without --config-file"))?;
            EngineConfig::new(binary, workdir)
        }
    };

    if let Some(binary) = &cli.binary {
        config.binary = binary.clone();
    }
    if !cli.extra_binaries.is_empty() {
        config.extra_binaries = cli.extra_binaries.clone();
    }
    if let Some(workdir) = &cli.workdir {
        config.workdir = workdir.clone();
    }
    if let Some(merge_from) = &cli.merge_from {
        config.merge_from = Some(merge_from.clone());
    }
    if let Some(total_shards) = cli.total_shards {
        config.total_shards = total_shards;
    }
    if let Some(shard_index) = cli.shard_index {
        config.my_shard_index = shard_index;
    }
    if let Some(num_runs) = cli.num_runs {
        config.num_runs = num_runs;
    }
    if let Some(batch_size) = cli.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(prune_frequency) = cli.prune_frequency {
        config.prune_frequency = prune_frequency;
    }
    if let Some(max_corpus_size) = cli.max_corpus_size {
        config.max_corpus_size = max_corpus_size;
    }
    if let Some(frequency) = cli.load_other_shard_frequency {
        config.load_other_shard_frequency = frequency;
    }
    if cli.full_sync {
        config.full_sync = true;
    }
    if let Some(distill_shards) = cli.distill_shards {
        config.distill_shards = distill_shards;
    }
    if cli.uniform_sampling {
        config.use_corpus_weights = false;
    }
    if cli.no_dataflow_features {
        config.use_dataflow_features = false;
    }
    if cli.no_cmp_features {
        config.use_cmp_features = false;
    }
    if let Some(path_level) = cli.path_level {
        config.path_level = path_level;
    }
    if let Some(input_filter) = &cli.input_filter {
        config.input_filter = Some(input_filter.clone());
    }
    if !cli.function_filter.is_empty() {
        config.function_filter = cli.function_filter.clone();
    }
    if !cli.corpus_dirs.is_empty() {
        config.corpus_dir = cli.corpus_dirs.clone();
    }
    if cli.exit_on_crash {
        config.exit_on_crash = true;
    }
    if let Some(max_num_crash_reports) = cli.max_num_crash_reports {
        config.max_num_crash_reports = max_num_crash_reports;
    }
    if let Some(seed) = cli.seed {
        config.seed = seed;
    }
    if let Some(log_level) = cli.log_level {
        config.log_level = log_level;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    // Only an atomic store; the loop notices at the next batch boundary.
    ctrlc::set_handler(|| shardfuzz_core::request_early_exit(130))?;
    let cli = Cli::parse();
    let config = build_config(&cli)?;
    let layout = config.layout();

    if let Some(dir) = &cli.export_corpus_from {
        let (added, ignored) =
            workdir::export_corpus_from_dir(&LocalStorage, &layout, config.total_shards, dir)?;
        log::info!("exported {added} inputs ({ignored} already present)");
        return Ok(());
    }
    if let Some(dir) = &cli.save_corpus_to {
        let saved = workdir::save_corpus_to_dir(&LocalStorage, &layout, config.total_shards, dir)?;
        log::info!("saved {saved} inputs to {dir:?}");
        return Ok(());
    }

    let options = CommandOptions {
        args: cli.target_args.clone(),
        input_delivery: match &cli.input_file {
            Some(path) => InputDelivery::File { path: path.clone() },
            None => InputDelivery::Stdin,
        },
        timeout: Duration::from_millis(cli.timeout_ms),
        working_dir: None,
    };
    let mut knobs = Knobs::new();
    knobs.set(&cli.knobs);
    let mut callbacks = CommandCallbacks::new(options, knobs, config.seed);

    let mut engine = Engine::new(config, &mut callbacks)?;
    engine.fuzzing_loop()?;

    if early_exit_requested() && early_exit_code() != 0 {
        std::process::exit(early_exit_code());
    }
    Ok(())
}
