//! The per-shard control loop.
//!
//! One `Engine` owns all mutable state of one shard: the feature set, the
//! corpus, the RNG, and the counters. It drives the user callbacks in
//! batches, attributes new coverage, appends its findings to the shard's
//! append-only files, and periodically absorbs what sibling shards have
//! found. Everything shared with other shards goes through the workdir;
//! nothing else is shared.

use crate::blob::{pack, pack_features_and_hash};
use crate::config::{ConfigError, EngineConfig};
use crate::corpus::Corpus;
use crate::executor::{BatchResult, EngineCallbacks};
use crate::feature::{domains, FeatureVec};
use crate::feature_set::FeatureSet;
use crate::filter::{FunctionFilter, InputFilter};
use crate::frontier::CoverageFrontier;
use crate::workdir::{self, LocalStorage, Storage, WorkdirError, WorkdirLayout};
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Instant;
use thiserror::Error;

/// Sightings after which a feature is considered boring.
const FREQUENCY_THRESHOLD: u8 = 100;

static EARLY_EXIT_REQUESTED: AtomicBool = AtomicBool::new(false);
static EARLY_EXIT_CODE: AtomicI32 = AtomicI32::new(0);

/// Asks every loop in this process to stop at the next batch boundary.
/// Safe to call from signal handlers.
pub fn request_early_exit(exit_code: i32) {
    EARLY_EXIT_CODE.store(exit_code, Ordering::SeqCst);
    EARLY_EXIT_REQUESTED.store(true, Ordering::SeqCst);
}

pub fn early_exit_requested() -> bool {
    EARLY_EXIT_REQUESTED.load(Ordering::SeqCst)
}

pub fn early_exit_code() -> i32 {
    EARLY_EXIT_CODE.load(Ordering::SeqCst)
}

/// Re-arms the process for another loop. Only meaningful for embedders
/// that run several engines in one process.
pub fn clear_early_exit() {
    EARLY_EXIT_REQUESTED.store(false, Ordering::SeqCst);
    EARLY_EXIT_CODE.store(0, Ordering::SeqCst);
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Workdir(#[from] WorkdirError),
    /// A write to shard state failed; the shard cannot make progress.
    #[error("engine I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}

/// One shard of the fuzzing engine.
pub struct Engine<'a> {
    config: EngineConfig,
    layout: WorkdirLayout,
    storage: Box<dyn Storage>,
    callbacks: &'a mut dyn EngineCallbacks,
    rng: ChaCha8Rng,
    feature_set: FeatureSet,
    corpus: Corpus,
    frontier: CoverageFrontier,
    function_filter: FunctionFilter,
    input_filter: Option<InputFilter>,
    num_runs: u64,
    start_time: Instant,
    num_crash_reports: usize,
}

impl<'a> Engine<'a> {
    pub fn new(
        config: EngineConfig,
        callbacks: &'a mut dyn EngineCallbacks,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let layout = config.layout();
        let input_filter = config.input_filter.clone().map(|command| {
            InputFilter::new(command, layout.filter_input_path(config.my_shard_index))
        });
        let function_filter = FunctionFilter::new(&config.function_filter);
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Ok(Self {
            config,
            layout,
            storage: Box::new(LocalStorage),
            callbacks,
            rng,
            feature_set: FeatureSet::new(FREQUENCY_THRESHOLD),
            corpus: Corpus::new(),
            frontier: CoverageFrontier::new(),
            function_filter,
            input_filter,
            num_runs: 0,
            start_time: Instant::now(),
            num_crash_reports: 0,
        })
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    pub fn feature_set(&self) -> &FeatureSet {
        &self.feature_set
    }

    pub fn num_runs(&self) -> u64 {
        self.num_runs
    }

    /// Frontier hints are supplied by an external control-flow analysis.
    pub fn frontier_mut(&mut self) -> &mut CoverageFrontier {
        &mut self.frontier
    }

    /// Emits one structured stats line for a designated event.
    fn log_stats(&self, event: &str, min_log_level: usize) {
        if self.config.log_level < min_log_level {
            return;
        }
        let seconds = self.start_time.elapsed().as_secs();
        let exec_speed = if seconds > 0 { self.num_runs / seconds } else { 0 };
        let (max_size, avg_size) = self.corpus.max_and_avg_size();
        log::info!(
            "[{}] {}: ft: {} cov: {} cnt: {} df: {} cmp: {} path: {} corp: {}/{} max/avg: {} {} exec/s: {}",
            self.num_runs,
            event,
            self.feature_set.len(),
            self.feature_set.to_coverage_pc_indices().len(),
            self.feature_set.count_features(domains::COUNTERS_8BIT),
            self.feature_set.count_features(domains::DATA_FLOW),
            self.feature_set.count_features(domains::CMP),
            self.feature_set.count_features(domains::BOUNDED_PATH),
            self.corpus.num_active(),
            self.corpus.num_total(),
            max_size,
            avg_size,
            exec_speed,
        );
    }

    /// Drops features from instrumentation sources the config disabled.
    fn strip_disabled_domains(&self, features: &mut FeatureVec) {
        features.retain(|&feature| {
            if domains::DATA_FLOW.contains(feature) {
                self.config.use_dataflow_features
            } else if domains::CMP.contains(feature) {
                self.config.use_cmp_features
            } else if domains::BOUNDED_PATH.contains(feature) {
                self.config.path_level > 0
            } else {
                true
            }
        });
    }

    fn execute_and_report_crash(
        &mut self,
        binary: &str,
        inputs: &[Vec<u8>],
        batch_result: &mut BatchResult,
    ) -> Result<bool, EngineError> {
        let success = self.callbacks.execute(binary, inputs, batch_result);
        if !success {
            self.report_crash(binary, inputs, batch_result)?;
        }
        Ok(success)
    }

    /// Executes one batch and attributes its coverage.
    ///
    /// New inputs are appended to `corpus_path`/`features_path` when given;
    /// `unconditional_features_path` receives a features frame for every
    /// input regardless of novelty (used when re-pairing orphaned inputs).
    /// Returns whether the batch gained any new coverage.
    pub fn run_batch(
        &mut self,
        inputs: &[Vec<u8>],
        batch_result: &mut BatchResult,
        corpus_path: Option<&Path>,
        features_path: Option<&Path>,
        unconditional_features_path: Option<&Path>,
    ) -> Result<bool, EngineError> {
        let binary = self.config.binary.clone();
        let mut success = self.execute_and_report_crash(&binary, inputs, batch_result)?;
        for extra_binary in self.config.extra_binaries.clone() {
            let mut extra_result = BatchResult::new(inputs.len());
            success =
                self.execute_and_report_crash(&extra_binary, inputs, &mut extra_result)? && success;
        }
        if !success && self.config.exit_on_crash {
            log::info!("exit_on_crash is enabled; exiting soon");
            request_early_exit(1);
            return Ok(false);
        }

        self.num_runs += inputs.len() as u64;
        let mut batch_gained_new_coverage = false;
        for (index, input) in inputs.iter().enumerate() {
            let mut features = std::mem::take(batch_result.results_mut()[index].features_mut());
            self.strip_disabled_domains(&mut features);
            let function_filter_passed = self.function_filter.filter(&features);
            let new_count = self.feature_set.count_unseen_and_prune_frequent(&mut features);
            if let Some(path) = unconditional_features_path {
                self.storage
                    .append(path, &pack(&pack_features_and_hash(input, &features)))?;
            }
            if new_count == 0 {
                continue;
            }
            if let Some(filter) = &self.input_filter {
                if !filter.passes(input) {
                    continue;
                }
            }
            self.feature_set.increment_frequencies(&features);
            batch_gained_new_coverage = true;
            if function_filter_passed {
                let cmp_args =
                    std::mem::take(batch_result.results_mut()[index].cmp_args_mut());
                self.corpus.add(
                    input.clone(),
                    features.clone(),
                    cmp_args,
                    &self.feature_set,
                    &self.frontier,
                );
            }
            if self.config.prune_frequency != 0
                && self.corpus.num_total() % self.config.prune_frequency == 0
            {
                self.corpus.prune(
                    &self.feature_set,
                    &self.frontier,
                    self.config.max_corpus_size,
                    &mut self.rng,
                );
            }
            if let Some(path) = corpus_path {
                self.storage.append(path, &pack(input))?;
            }
            if let Some(dir) = self.config.corpus_dir.first() {
                workdir::write_hashed_file_in_dir(self.storage.as_ref(), dir, input)?;
            }
            if let Some(path) = features_path {
                self.storage
                    .append(path, &pack(&pack_features_and_hash(input, &features)))?;
            }
        }
        Ok(batch_gained_new_coverage)
    }

    /// Loads one shard's records into this engine's state.
    ///
    /// Records that came with features are offered to the feature set and
    /// added to the corpus when they carry anything new. Records whose
    /// features are unknown (the writer had not appended them yet) are
    /// re-executed iff `rerun`, writing their features to this shard's own
    /// features file; the input is already on disk, so only the features
    /// file is written.
    pub fn load_shard(
        &mut self,
        layout: &WorkdirLayout,
        shard_index: usize,
        rerun: bool,
    ) -> Result<(), EngineError> {
        let records = workdir::read_shard_records(self.storage.as_ref(), layout, shard_index);
        let mut to_rerun: Vec<Vec<u8>> = Vec::new();
        let mut added_to_corpus = 0usize;
        for mut record in records {
            if record.features.is_empty() {
                // TODO: distinguish inputs that genuinely produced no
                // infrequent features from inputs whose features are
                // simply unknown; the former need no rerun.
                if rerun {
                    to_rerun.push(record.data);
                }
                continue;
            }
            if self.feature_set.count_unseen_and_prune_frequent(&mut record.features) > 0 {
                self.feature_set.increment_frequencies(&record.features);
                self.corpus.add(
                    record.data,
                    record.features,
                    record.cmp_args,
                    &self.feature_set,
                    &self.frontier,
                );
                added_to_corpus += 1;
            }
        }
        // No pruning here: it would interfere with distillation.
        if added_to_corpus > 0 {
            self.log_stats("load-shard", 1);
        }

        if to_rerun.is_empty() {
            return Ok(());
        }
        log::info!("{} inputs to rerun", to_rerun.len());
        let features_path = self.layout.features_path(self.config.my_shard_index);
        let batch_size = self.config.batch_size;
        while !to_rerun.is_empty() {
            let start = to_rerun.len().saturating_sub(batch_size);
            let batch = to_rerun.split_off(start);
            let mut batch_result = BatchResult::new(batch.len());
            if self.run_batch(&batch, &mut batch_result, None, None, Some(&features_path))? {
                self.log_stats("rerun-old", 1);
            }
        }
        Ok(())
    }

    /// Replays the same-index shard of another workdir, then records what
    /// survived into our own corpus file.
    fn merge_from_other_corpus(
        &mut self,
        merge_from: &Path,
        shard_index: usize,
    ) -> Result<(), EngineError> {
        log::info!("merging from {merge_from:?}");
        let other_layout = WorkdirLayout::new(
            merge_from.to_path_buf(),
            self.layout.binary_identity().to_string(),
        );
        let initial_active = self.corpus.num_active();
        self.load_shard(&other_layout, shard_index, true)?;
        let new_active = self.corpus.num_active();
        if new_active > initial_active {
            let mut combined_inputs = Vec::new();
            for index in initial_active..new_active {
                combined_inputs.extend_from_slice(&pack(self.corpus.get(index)));
            }
            log::info!("merge: {} new inputs added", new_active - initial_active);
            let own_corpus_path = self.layout.corpus_path(self.config.my_shard_index);
            self.storage.append(&own_corpus_path, &combined_inputs)?;
        }
        Ok(())
    }

    /// Writes the active corpus as a compact replayable set.
    fn distill(&mut self) -> Result<(), EngineError> {
        let distilled_path = self.layout.distilled_path(self.config.my_shard_index);
        let mut packed = Vec::new();
        for index in 0..self.corpus.num_active() {
            packed.extend_from_slice(&pack(self.corpus.get(index)));
            if let Some(dir) = self.config.corpus_dir.first() {
                workdir::write_hashed_file_in_dir(self.storage.as_ref(), dir, self.corpus.get(index))?;
            }
        }
        log::info!(
            "distilling {} inputs ({} packed bytes) to {:?}",
            self.corpus.num_active(),
            packed.len(),
            distilled_path
        );
        self.storage.write(&distilled_path, &packed)?;
        Ok(())
    }

    fn generate_coverage_report(&mut self) -> Result<(), EngineError> {
        if !self.config.generating_coverage_report_in_this_shard() {
            return Ok(());
        }
        let pc_indices = self.feature_set.to_coverage_pc_indices();
        let mut report = String::new();
        let _ = writeln!(report, "covered PCs: {}", pc_indices.len());
        for domain in domains::ALL {
            let _ = writeln!(
                report,
                "features in {}: {}",
                domain.name(),
                self.feature_set.count_features(domain)
            );
        }
        for pc_index in pc_indices {
            let _ = writeln!(report, "{pc_index}");
        }
        let report_path = self.layout.coverage_report_path(self.config.my_shard_index);
        log::info!("coverage report: {report_path:?}");
        self.storage.write(&report_path, report.as_bytes())?;
        Ok(())
    }

    fn generate_corpus_stats(&mut self) -> Result<(), EngineError> {
        if !self.config.generating_corpus_stats_in_this_shard() {
            return Ok(());
        }
        let mut stats = Vec::new();
        self.corpus.print_stats(&mut stats, &self.feature_set)?;
        let stats_path = self.layout.corpus_stats_path(self.config.my_shard_index);
        self.storage.write(&stats_path, &stats)?;
        Ok(())
    }

    /// The main entry point: runs this shard's whole fuzzing session.
    pub fn fuzzing_loop(&mut self) -> Result<(), EngineError> {
        let my_shard = self.config.my_shard_index;
        let total_shards = self.config.total_shards;
        log::info!(
            "shard: {my_shard}/{total_shards} workdir: {:?} target: {}",
            self.config.workdir,
            self.layout.binary_identity()
        );

        // Warm up the target once; the result is discarded.
        {
            let dummy_input = self.callbacks.dummy_valid_input();
            let mut warmup_result = BatchResult::new(1);
            let _ = self
                .callbacks
                .execute(&self.config.binary, &[dummy_input], &mut warmup_result);
        }
        self.log_stats("begin-fuzz", 0);

        let layout = self.layout.clone();
        if self.config.full_sync || self.config.distilling_in_this_shard() {
            let mut shards: Vec<usize> = (0..total_shards).collect();
            shards.shuffle(&mut self.rng);
            for (loaded, shard_index) in shards.into_iter().enumerate() {
                self.load_shard(&layout, shard_index, shard_index == my_shard)?;
                if (loaded + 1) % 100 == 0 {
                    log::info!("shards loaded: {}", loaded + 1);
                }
            }
        } else {
            self.load_shard(&layout, my_shard, true)?;
        }

        if let Some(merge_from) = self.config.merge_from.clone() {
            self.merge_from_other_corpus(&merge_from, my_shard)?;
        }

        let corpus_path = layout.corpus_path(my_shard);
        let features_path = layout.features_path(my_shard);

        if self.corpus.num_total() == 0 {
            let dummy_input = self.callbacks.dummy_valid_input();
            self.corpus.add(
                dummy_input,
                FeatureVec::new(),
                Vec::new(),
                &self.feature_set,
                &self.frontier,
            );
        }

        self.log_stats("init-done", 0);
        // Pre-init work must not skew the throughput numbers.
        self.start_time = Instant::now();
        self.num_runs = 0;

        if self.config.distilling_in_this_shard() {
            self.distill()?;
        }
        self.generate_coverage_report()?;

        let number_of_batches = self.config.num_runs.div_ceil(self.config.batch_size as u64);
        let mut new_runs = 0u64;
        let mut batch_result = BatchResult::new(0);
        for batch_index in 0..number_of_batches {
            if early_exit_requested() {
                break;
            }
            let remaining_runs = self.config.num_runs - new_runs;
            let batch_size = (self.config.batch_size as u64).min(remaining_runs) as usize;
            let mut inputs = Vec::with_capacity(batch_size);
            for _ in 0..batch_size {
                let random = self.rng.next_u64();
                // The weighted distribution refuses an all-zero total, which
                // happens while the corpus holds only the featureless seed.
                let pick = if self.config.use_corpus_weights
                    && self.corpus.total_active_weight() > 0
                {
                    self.corpus.weighted_random(random)
                } else {
                    self.corpus.uniform_random(random)
                };
                inputs.push(pick.to_vec());
            }
            self.callbacks.mutate(&mut inputs);
            let gained_new_coverage = self.run_batch(
                &inputs,
                &mut batch_result,
                Some(&corpus_path),
                Some(&features_path),
                None,
            )?;
            new_runs += inputs.len() as u64;

            let batch_is_power_of_two = (batch_index.wrapping_sub(1) & batch_index) == 0;
            if gained_new_coverage {
                self.log_stats("new-feature", 1);
            } else if batch_is_power_of_two {
                self.log_stats("pulse", 1);
            }
            if batch_is_power_of_two {
                self.generate_corpus_stats()?;
            }

            if self.config.load_other_shard_frequency != 0
                && batch_index % self.config.load_other_shard_frequency as u64 == 0
                && total_shards > 1
            {
                let random = self.rng.next_u64() as usize % (total_shards - 1);
                let other_shard_index = (my_shard + 1 + random) % total_shards;
                self.load_shard(&layout, other_shard_index, false)?;
            }
        }
        // External tooling keys on this line being the last event.
        self.log_stats("end-fuzz", 0);
        Ok(())
    }

    /// Narrows a crashed batch down to a single reproducer input and saves
    /// it under the crashes directory, overwriting any previous reproducer
    /// with the same hash. At most `max_num_crash_reports` crashes are
    /// investigated per process.
    fn report_crash(
        &mut self,
        binary: &str,
        inputs: &[Vec<u8>],
        batch_result: &BatchResult,
    ) -> Result<(), EngineError> {
        if self.num_crash_reports >= self.config.max_num_crash_reports {
            return Ok(());
        }
        self.num_crash_reports += 1;
        log::info!(
            "ReportCrash[{}]: batch of {} inputs crashed on '{}'; exit code: {}",
            self.num_crash_reports - 1,
            inputs.len(),
            binary,
            batch_result.exit_code()
        );
        if !batch_result.log().is_empty() {
            log::info!("target log follows:\n{}", batch_result.log());
        }
        if self.num_crash_reports == self.config.max_num_crash_reports {
            log::info!("reached max_num_crash_reports; further reports will be suppressed");
        }

        // The first unreported input is the presumed crasher; try it first,
        // then everything in order.
        let suspect_index = batch_result.num_outputs_read();
        if suspect_index < inputs.len() && self.try_one_input(binary, &inputs[suspect_index])? {
            return Ok(());
        }
        for input in inputs {
            if self.try_one_input(binary, input)? {
                return Ok(());
            }
        }
        log::info!("crash was not observed when running inputs one-by-one");
        Ok(())
    }

    /// Re-executes one input alone; on failure saves it as a reproducer and
    /// returns true.
    fn try_one_input(&mut self, binary: &str, input: &[u8]) -> Result<bool, EngineError> {
        let single = [input.to_vec()];
        let mut single_result = BatchResult::new(1);
        if self.callbacks.execute(binary, &single, &mut single_result) {
            return Ok(false);
        }
        self.storage.mkdir_all(&self.layout.crashes_dir())?;
        let reproducer_path = self.layout.crash_reproducer_path(input);
        log::info!("crash detected, saving input to {reproducer_path:?}");
        self.storage.write(&reproducer_path, input)?;
        Ok(true)
    }
}
