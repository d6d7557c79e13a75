//! The in-memory collection of inputs kept because they were interesting.
//!
//! Records are append-only: an input enters the corpus when it first
//! exercised at least one novel, non-frequent feature, and is later *pruned*
//! (marked inactive, never deleted) once every feature it carried has become
//! frequent, or when the corpus outgrows its size budget. Sampling is
//! rarity-weighted through a [`WeightedDistribution`] kept parallel to the
//! records.

use crate::feature::FeatureVec;
use crate::feature_set::FeatureSet;
use crate::frontier::CoverageFrontier;
use rand_core::RngCore;
use serde_json::json;
use std::io::Write;

/// A prefix-sum table over non-negative weights supporting O(log n) weighted
/// index sampling.
///
/// Mutating a weight leaves the prefix sums stale; the table tracks that and
/// refuses to sample until [`recompute_internal_state`] has run. Sampling
/// from a stale, empty, or all-zero table is a programming error and panics.
///
/// [`recompute_internal_state`]: WeightedDistribution::recompute_internal_state
#[derive(Debug, Default)]
pub struct WeightedDistribution {
    weights: Vec<u32>,
    cumulative: Vec<u64>,
    dirty: bool,
}

impl WeightedDistribution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Appends a weight, extending the prefix sums in O(1).
    pub fn add_weight(&mut self, weight: u32) {
        self.weights.push(weight);
        let previous = self.cumulative.last().copied().unwrap_or(0);
        self.cumulative.push(previous + weight as u64);
    }

    /// Overwrites the weight at `index`. The prefix sums become stale until
    /// the next [`WeightedDistribution::recompute_internal_state`].
    pub fn change_weight(&mut self, index: usize, weight: u32) {
        self.weights[index] = weight;
        self.dirty = true;
    }

    /// Drops the last weight. Does not make the prefix sums stale.
    pub fn pop_back(&mut self) {
        self.weights.pop();
        self.cumulative.pop();
    }

    pub fn clear(&mut self) {
        self.weights.clear();
        self.cumulative.clear();
        self.dirty = false;
    }

    /// Rebuilds the prefix sums in O(n) after weight changes.
    pub fn recompute_internal_state(&mut self) {
        let mut running = 0u64;
        for (cumulative, &weight) in self.cumulative.iter_mut().zip(&self.weights) {
            running += weight as u64;
            *cumulative = running;
        }
        self.dirty = false;
    }

    /// Sum of all weights. Zero for an empty table.
    pub fn total_weight(&self) -> u64 {
        assert!(!self.dirty, "total_weight called on a stale distribution");
        self.cumulative.last().copied().unwrap_or(0)
    }

    /// Returns the unique index `i` with
    /// `cumulative[i-1] <= random % total < cumulative[i]`, so that index
    /// `i` is picked with probability `weights[i] / total`. Zero-weight
    /// entries are never returned.
    ///
    /// # Panics
    ///
    /// Panics if the table is stale, empty, or has zero total weight.
    pub fn random_index(&self, random: u64) -> usize {
        assert!(!self.dirty, "random_index called on a stale distribution");
        let total = *self
            .cumulative
            .last()
            .expect("random_index called on an empty distribution");
        assert!(total > 0, "random_index called with zero total weight");
        let target = random % total;
        self.cumulative.partition_point(|&c| c <= target)
    }
}

/// One kept input together with the features it contributed when first seen
/// and the comparison operands captured during its run. The data never
/// changes after insertion; the features may shrink as they become
/// frequent.
#[derive(Debug, Clone)]
pub struct CorpusRecord {
    pub data: Vec<u8>,
    pub features: FeatureVec,
    pub cmp_args: Vec<u8>,
}

/// Ordered, append-only store of corpus records with an activity bitmap.
///
/// `num_total` counts every record ever added; `num_active` counts those
/// still eligible for sampling. The weighted distribution always spans all
/// records, with inactive ones at weight zero.
#[derive(Debug, Default)]
pub struct Corpus {
    records: Vec<CorpusRecord>,
    is_active: Vec<bool>,
    /// Indexes of active records, in insertion order.
    active_ids: Vec<usize>,
    weighted: WeightedDistribution,
}

impl Corpus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_total(&self) -> usize {
        self.records.len()
    }

    pub fn num_active(&self) -> usize {
        self.active_ids.len()
    }

    /// Sum of sampling weights over active records.
    pub fn total_active_weight(&self) -> u64 {
        self.weighted.total_weight()
    }

    fn record_weight(
        record: &CorpusRecord,
        feature_set: &FeatureSet,
        frontier: &CoverageFrontier,
    ) -> u32 {
        if record.features.is_empty() {
            return 0;
        }
        feature_set
            .compute_weight(&record.features)
            .saturating_add(frontier.weight_for(&record.features))
    }

    /// Appends a record and gives it a rarity weight from `feature_set`,
    /// topped up by the coverage-frontier bonus. The caller must already
    /// have incremented the feature frequencies for `features`.
    pub fn add(
        &mut self,
        data: Vec<u8>,
        features: FeatureVec,
        cmp_args: Vec<u8>,
        feature_set: &FeatureSet,
        frontier: &CoverageFrontier,
    ) {
        let record = CorpusRecord {
            data,
            features,
            cmp_args,
        };
        let weight = Self::record_weight(&record, feature_set, frontier);
        let index = self.records.len();
        self.records.push(record);
        self.is_active.push(true);
        self.active_ids.push(index);
        self.weighted.add_weight(weight);
    }

    /// The data of the `i`-th active record, in insertion order.
    pub fn get(&self, i: usize) -> &[u8] {
        &self.records[self.active_ids[i]].data
    }

    /// The comparison operands of the `i`-th active record.
    pub fn get_cmp_args(&self, i: usize) -> &[u8] {
        &self.records[self.active_ids[i]].cmp_args
    }

    /// Samples an active record with probability proportional to its
    /// weight. Panics when no active record has positive weight; callers
    /// should fall back to [`Corpus::uniform_random`] in that case.
    pub fn weighted_random(&self, random: u64) -> &[u8] {
        &self.records[self.weighted.random_index(random)].data
    }

    /// Samples uniformly among active records. Panics on an empty corpus.
    pub fn uniform_random(&self, random: u64) -> &[u8] {
        assert!(
            !self.active_ids.is_empty(),
            "uniform_random called on an empty corpus"
        );
        self.get((random % self.active_ids.len() as u64) as usize)
    }

    fn deactivate(&mut self, record_index: usize) {
        self.is_active[record_index] = false;
        self.weighted.change_weight(record_index, 0);
    }

    /// Prunes the corpus in two phases and returns how many records became
    /// inactive.
    ///
    /// Phase one drops each record whose entire feature support has become
    /// frequent (its stored features prune down to nothing) and refreshes
    /// the weights of the survivors. Phase two evicts uniformly random
    /// active records until at most `max_corpus_size` remain.
    ///
    /// Must not be called while shards are being loaded, as that would
    /// interfere with distillation.
    ///
    /// # Panics
    ///
    /// Panics if `max_corpus_size` is zero.
    pub fn prune(
        &mut self,
        feature_set: &FeatureSet,
        frontier: &CoverageFrontier,
        max_corpus_size: usize,
        rng: &mut dyn RngCore,
    ) -> usize {
        assert!(max_corpus_size > 0, "max_corpus_size must be at least 1");
        let initially_active = self.active_ids.len();

        for record_index in 0..self.records.len() {
            if !self.is_active[record_index] {
                continue;
            }
            feature_set
                .count_unseen_and_prune_frequent(&mut self.records[record_index].features);
            if self.records[record_index].features.is_empty() {
                self.deactivate(record_index);
            } else {
                let weight =
                    Self::record_weight(&self.records[record_index], feature_set, frontier);
                self.weighted.change_weight(record_index, weight);
            }
        }
        let is_active = &self.is_active;
        self.active_ids.retain(|&index| is_active[index]);

        while self.active_ids.len() > max_corpus_size {
            let victim = (rng.next_u64() % self.active_ids.len() as u64) as usize;
            let record_index = self.active_ids.remove(victim);
            self.deactivate(record_index);
        }

        self.weighted.recompute_internal_state();
        initially_active - self.active_ids.len()
    }

    /// Largest and average input size over active records.
    pub fn max_and_avg_size(&self) -> (usize, usize) {
        if self.active_ids.is_empty() {
            return (0, 0);
        }
        let max = self
            .active_ids
            .iter()
            .map(|&index| self.records[index].data.len())
            .max()
            .unwrap_or(0);
        let total: usize = self
            .active_ids
            .iter()
            .map(|&index| self.records[index].data.len())
            .sum();
        (max, total / self.active_ids.len())
    }

    /// Writes a JSON snapshot of the active records: per-record input size
    /// and the current frequency of each of its features, in insertion
    /// order.
    pub fn print_stats(
        &self,
        out: &mut dyn Write,
        feature_set: &FeatureSet,
    ) -> std::io::Result<()> {
        let stats: Vec<serde_json::Value> = self
            .active_ids
            .iter()
            .map(|&index| {
                let record = &self.records[index];
                let frequencies: Vec<u8> = record
                    .features
                    .iter()
                    .map(|&feature| feature_set.frequency(feature))
                    .collect();
                json!({ "size": record.data.len(), "frequencies": frequencies })
            })
            .collect();
        serde_json::to_writer_pretty(&mut *out, &json!({ "corpus_stats": stats }))?;
        writeln!(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn distribution_frequencies(wd: &WeightedDistribution, iterations: u64) -> Vec<u64> {
        let mut freq = vec![0u64; wd.len()];
        // Numbers in [0, iterations) stand in for random draws.
        for i in 0..iterations {
            freq[wd.random_index(i)] += 1;
        }
        freq
    }

    fn set_weights(wd: &mut WeightedDistribution, weights: &[u32]) {
        wd.clear();
        for &w in weights {
            wd.add_weight(w);
        }
    }

    #[test]
    fn weighted_distribution_matches_weight_ratios() {
        const ITERS: u64 = 10_000;
        let mut wd = WeightedDistribution::new();

        set_weights(&mut wd, &[1, 1]);
        let freq = distribution_frequencies(&wd, ITERS);
        assert_eq!(freq[0], ITERS / 2);
        assert_eq!(freq[1], ITERS / 2);

        set_weights(&mut wd, &[1, 2]);
        let freq = distribution_frequencies(&wd, ITERS);
        assert!(freq[0] > ITERS / 4 && freq[0] < ITERS / 2);
        assert!(freq[1] > ITERS / 2);

        set_weights(&mut wd, &[10, 100, 1]);
        let freq = distribution_frequencies(&wd, ITERS);
        assert!(9 * freq[2] < freq[0]);
        assert!(9 * freq[0] < freq[1]);

        set_weights(&mut wd, &[0, 1, 2]);
        let freq = distribution_frequencies(&wd, ITERS);
        assert_eq!(freq[0], 0);
        assert!(freq[2] > freq[1]);

        set_weights(&mut wd, &[2, 1, 0]);
        let freq = distribution_frequencies(&wd, ITERS);
        assert_eq!(freq[2], 0);
        assert!(freq[0] > freq[1]);
    }

    #[test]
    fn change_weight_and_pop_back_keep_sampling_consistent() {
        const ITERS: u64 = 10_000;
        let mut wd = WeightedDistribution::new();
        set_weights(&mut wd, &[1, 2, 3, 4, 5]);
        let freq = distribution_frequencies(&wd, ITERS);
        assert!(freq[4] > freq[3] && freq[3] > freq[2] && freq[2] > freq[1] && freq[1] > freq[0]);

        // Weights: {1, 2, 1, 4, 5}.
        wd.change_weight(2, 1);
        wd.recompute_internal_state();
        let freq = distribution_frequencies(&wd, ITERS);
        assert!(freq[4] > freq[3]);
        assert!(freq[2] < freq[1]);

        // Weights: {1, 2, 1, 0, 5}: index 3 can never come up, 4 dominates.
        wd.change_weight(3, 0);
        wd.recompute_internal_state();
        let freq = distribution_frequencies(&wd, ITERS);
        assert_eq!(freq[3], 0);
        assert!(freq[4] > freq[1] && freq[1] > freq[0] && freq[1] > freq[2]);
        assert_eq!(freq.iter().max(), Some(&freq[4]));

        // pop_back keeps the prefix sums valid without a recompute.
        wd.pop_back();
        assert_eq!(wd.len(), 4);
        let freq = distribution_frequencies(&wd, ITERS);
        assert_eq!(freq[3], 0);
        assert!(freq[1] > freq[0] && freq[1] > freq[2]);
    }

    #[test]
    #[should_panic(expected = "stale")]
    fn sampling_after_change_weight_without_recompute_panics() {
        let mut wd = WeightedDistribution::new();
        set_weights(&mut wd, &[1, 2, 3]);
        wd.change_weight(1, 7);
        wd.random_index(0);
    }

    #[test]
    #[should_panic(expected = "empty")]
    fn sampling_from_an_empty_distribution_panics() {
        let wd = WeightedDistribution::new();
        wd.random_index(0);
    }

    #[test]
    #[should_panic(expected = "zero total weight")]
    fn sampling_with_zero_total_weight_panics() {
        let mut wd = WeightedDistribution::new();
        set_weights(&mut wd, &[0, 0]);
        wd.random_index(1);
    }

    #[test]
    fn weighted_distribution_scales_to_many_weights() {
        let mut wd = WeightedDistribution::new();
        for i in 1..100_000u32 {
            wd.add_weight(i);
        }
        let _ = distribution_frequencies(&wd, 10_000);
    }

    fn add_record(
        corpus: &mut Corpus,
        feature_set: &mut FeatureSet,
        data: Vec<u8>,
        features: FeatureVec,
    ) {
        feature_set.increment_frequencies(&features);
        corpus.add(data, features, Vec::new(), feature_set, &CoverageFrontier::new());
    }

    fn active_inputs(corpus: &Corpus) -> Vec<Vec<u8>> {
        let mut inputs: Vec<Vec<u8>> =
            (0..corpus.num_active()).map(|i| corpus.get(i).to_vec()).collect();
        inputs.sort();
        inputs
    }

    #[test]
    fn prune_drops_records_with_fully_frequent_features() {
        let frontier = CoverageFrontier::new();
        let mut feature_set = FeatureSet::new(3);
        let mut corpus = Corpus::new();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let max_corpus_size = 1000;

        add_record(&mut corpus, &mut feature_set, vec![0], vec![20, 40]);
        add_record(&mut corpus, &mut feature_set, vec![1], vec![20, 30]);
        add_record(&mut corpus, &mut feature_set, vec![2], vec![30, 40]);
        add_record(&mut corpus, &mut feature_set, vec![3], vec![40, 50]);
        add_record(&mut corpus, &mut feature_set, vec![4], vec![10, 20]);

        // Features 20 and 40 are frequent, so input {0} loses its support.
        assert_eq!(corpus.num_active(), 5);
        assert_eq!(corpus.prune(&feature_set, &frontier, max_corpus_size, &mut rng), 1);
        assert_eq!(corpus.num_active(), 4);
        assert_eq!(corpus.num_total(), 5);
        assert_eq!(active_inputs(&corpus), vec![vec![1], vec![2], vec![3], vec![4]]);

        add_record(&mut corpus, &mut feature_set, vec![5], vec![30, 60]);
        assert_eq!(corpus.num_total(), 6);
        // Feature 30 is now frequent too; inputs {1} and {2} follow.
        assert_eq!(corpus.num_active(), 5);
        assert_eq!(corpus.prune(&feature_set, &frontier, max_corpus_size, &mut rng), 2);
        assert_eq!(corpus.num_active(), 3);
        assert_eq!(active_inputs(&corpus), vec![vec![3], vec![4], vec![5]]);

        // Size-cap eviction, one record at a time.
        assert_eq!(corpus.prune(&feature_set, &frontier, 3, &mut rng), 0);
        assert_eq!(corpus.num_active(), 3);
        assert_eq!(corpus.prune(&feature_set, &frontier, 2, &mut rng), 1);
        assert_eq!(corpus.num_active(), 2);
        assert_eq!(corpus.prune(&feature_set, &frontier, 1, &mut rng), 1);
        assert_eq!(corpus.num_active(), 1);
        assert_eq!(corpus.num_total(), 6);
    }

    #[test]
    #[should_panic(expected = "max_corpus_size")]
    fn prune_with_zero_size_budget_panics() {
        let mut corpus = Corpus::new();
        let mut feature_set = FeatureSet::new(3);
        add_record(&mut corpus, &mut feature_set, vec![1], vec![10]);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        corpus.prune(&feature_set, &CoverageFrontier::new(), 0, &mut rng);
    }

    #[test]
    fn prune_handles_partially_supported_records() {
        // A record may keep part of its features while a sibling loses all.
        let frontier = CoverageFrontier::new();
        let mut feature_set = FeatureSet::new(2);
        let mut corpus = Corpus::new();
        let mut rng = ChaCha8Rng::seed_from_u64(0);

        add_record(&mut corpus, &mut feature_set, vec![1], vec![10, 20]);
        add_record(&mut corpus, &mut feature_set, vec![2], vec![10]);
        assert_eq!(corpus.prune(&feature_set, &frontier, 1000, &mut rng), 1);
        assert_eq!(active_inputs(&corpus), vec![vec![1]]);
    }

    #[test]
    fn cmp_args_are_retained() {
        let frontier = CoverageFrontier::new();
        let mut feature_set = FeatureSet::new(3);
        let mut corpus = Corpus::new();
        let cmp_args = vec![2, 0, 1, 2, 3];
        let features: FeatureVec = vec![10, 20, 30];
        feature_set.increment_frequencies(&features);
        corpus.add(vec![1], features, cmp_args.clone(), &feature_set, &frontier);
        assert_eq!(corpus.num_active(), 1);
        assert_eq!(corpus.get_cmp_args(0), cmp_args.as_slice());
    }

    #[test]
    fn print_stats_emits_one_entry_per_active_record() {
        let frontier = CoverageFrontier::new();
        let mut feature_set = FeatureSet::new(3);
        let mut corpus = Corpus::new();
        let features1: FeatureVec = vec![10, 20, 30];
        let features2: FeatureVec = vec![20, 40];
        feature_set.increment_frequencies(&features1);
        corpus.add(vec![1, 2, 3], features1, Vec::new(), &feature_set, &frontier);
        feature_set.increment_frequencies(&features2);
        corpus.add(vec![4, 5], features2, Vec::new(), &feature_set, &frontier);

        let mut out = Vec::new();
        corpus.print_stats(&mut out, &feature_set).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&out).unwrap();
        let stats = parsed["corpus_stats"].as_array().unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0]["size"], 3);
        assert_eq!(stats[0]["frequencies"], serde_json::json!([1, 2, 1]));
        assert_eq!(stats[1]["size"], 2);
        assert_eq!(stats[1]["frequencies"], serde_json::json!([2, 1]));
    }

    #[test]
    fn sampling_respects_weights_and_activity() {
        let mut feature_set = FeatureSet::new(100);
        let mut corpus = Corpus::new();
        add_record(&mut corpus, &mut feature_set, vec![0xA], vec![1]);
        add_record(&mut corpus, &mut feature_set, vec![0xB], vec![1]);
        // Record {0xB} was added once feature 1 had frequency 2, so the
        // earlier record carries more weight.
        let mut counts = std::collections::HashMap::new();
        for r in 0..1000u64 {
            *counts.entry(corpus.weighted_random(r).to_vec()).or_insert(0u32) += 1;
        }
        assert!(counts[&vec![0xA_u8]] > counts[&vec![0xB_u8]]);

        let (max, avg) = corpus.max_and_avg_size();
        assert_eq!((max, avg), (1, 1));
    }

    #[test]
    fn uniform_random_covers_all_active_records() {
        let mut feature_set = FeatureSet::new(100);
        let mut corpus = Corpus::new();
        for byte in 0..5u8 {
            add_record(&mut corpus, &mut feature_set, vec![byte], vec![byte as u64 + 100]);
        }
        let picked: std::collections::HashSet<Vec<u8>> =
            (0..50u64).map(|r| corpus.uniform_random(r).to_vec()).collect();
        assert_eq!(picked.len(), 5);
    }
}
