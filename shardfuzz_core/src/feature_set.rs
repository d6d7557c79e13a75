//! Global frequency accounting for observed features.
//!
//! The `FeatureSet` is the engine's memory of everything the target has ever
//! exercised in this process. It decides which features in a fresh execution
//! are novel (worth keeping the input for), and it assigns rarity weights
//! that bias corpus sampling toward inputs exercising uncommon behavior.
//! Features that have been seen `frequency_threshold` times are considered
//! boring; they are pruned out of every feature vector that passes through
//! [`FeatureSet::count_unseen_and_prune_frequent`] so hot edges stop
//! attracting attention.

use crate::feature::{
    convert_8bit_counter_feature_to_pc_index, domain_of, domains, Feature, FeatureDomain,
    FeatureVec, PcIndex, NUM_DOMAINS,
};
use std::collections::HashMap;

/// Frequency table over all features seen by this engine process.
///
/// Per-feature counters saturate at the frequency threshold; a feature whose
/// counter has reached the threshold is *frequent* and is treated as absent
/// by the pruning and weighting paths, while still remembered so it is never
/// reported as unseen again.
#[derive(Debug)]
pub struct FeatureSet {
    frequency_threshold: u8,
    /// Saturating per-feature counters, `1..=frequency_threshold` once seen.
    frequencies: HashMap<Feature, u8>,
    /// How many distinct features have been seen per domain.
    features_per_domain: [usize; NUM_DOMAINS],
}

impl FeatureSet {
    pub fn new(frequency_threshold: u8) -> Self {
        assert!(frequency_threshold > 0, "frequency threshold must be positive");
        Self {
            frequency_threshold,
            frequencies: HashMap::new(),
            features_per_domain: [0; NUM_DOMAINS],
        }
    }

    /// Number of distinct features seen so far.
    pub fn len(&self) -> usize {
        self.frequencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frequencies.is_empty()
    }

    /// Number of distinct features seen in `domain`.
    pub fn count_features(&self, domain: FeatureDomain) -> usize {
        self.features_per_domain[domain.index()]
    }

    /// Current frequency of `feature`; 0 if it was never seen.
    pub fn frequency(&self, feature: Feature) -> u8 {
        self.frequencies.get(&feature).copied().unwrap_or(0)
    }

    /// Removes from `features` every feature that has already become
    /// frequent, and returns how many of the remaining ones have never been
    /// seen at all. Does not change the set itself.
    ///
    /// A return value of zero means the vector carries nothing novel; a
    /// positive value is the caller's signal that the input deserves a place
    /// in the corpus.
    pub fn count_unseen_and_prune_frequent(&self, features: &mut FeatureVec) -> usize {
        let mut unseen = 0;
        features.retain(|&feature| {
            let frequency = self.frequency(feature);
            if frequency == 0 {
                unseen += 1;
            }
            frequency < self.frequency_threshold
        });
        unseen
    }

    /// Registers one more sighting of every feature in `features`.
    ///
    /// A feature seen for the first time starts at frequency 1 and bumps its
    /// domain's seen-count; further sightings saturate at the threshold,
    /// after which [`count_unseen_and_prune_frequent`] will drop the feature
    /// from incoming vectors.
    ///
    /// [`count_unseen_and_prune_frequent`]: FeatureSet::count_unseen_and_prune_frequent
    pub fn increment_frequencies(&mut self, features: &FeatureVec) {
        for &feature in features {
            let entry = self.frequencies.entry(feature).or_insert(0);
            if *entry == 0 {
                self.features_per_domain[domain_of(feature).index()] += 1;
            }
            if *entry < self.frequency_threshold {
                *entry += 1;
            }
        }
    }

    /// Computes the rarity weight of a feature vector.
    ///
    /// Each feature contributes more the lower its frequency, and features
    /// from a domain with fewer seen features contribute more than equally
    /// frequent ones from a crowded domain.
    ///
    /// # Panics
    ///
    /// Panics if any feature in `features` has never been incremented; the
    /// weight of an unknown feature is a programming error.
    pub fn compute_weight(&self, features: &FeatureVec) -> u32 {
        let num_features = self.frequencies.len() as u32;
        let mut weight = 0u32;
        for &feature in features {
            let frequency = self.frequency(feature);
            assert!(frequency > 0, "compute_weight: unknown feature {feature}");
            let features_in_domain = self.features_per_domain[domain_of(feature).index()] as u32;
            assert!(features_in_domain > 0, "compute_weight: empty domain for {feature}");
            // frequency 1 => 256, frequency 2 => 128, and so on.
            weight =
                weight.saturating_add((256 / frequency as u32) * (num_features / features_in_domain));
        }
        weight
    }

    /// PC indexes covered so far, derived from the edge-coverage domains,
    /// sorted and deduplicated.
    pub fn to_coverage_pc_indices(&self) -> Vec<PcIndex> {
        let mut pc_indices: Vec<PcIndex> = self
            .frequencies
            .keys()
            .filter_map(|&feature| {
                if domains::PC_GUARD.contains(feature) {
                    Some((feature - domains::PC_GUARD.begin()) as PcIndex)
                } else if domains::COUNTERS_8BIT.contains(feature) {
                    Some(convert_8bit_counter_feature_to_pc_index(feature))
                } else {
                    None
                }
            })
            .collect();
        pc_indices.sort_unstable();
        pc_indices.dedup();
        pc_indices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::convert_8bit_counter_to_number;

    #[test]
    fn count_unseen_and_prune_interacts_with_increment() {
        let frequency_threshold = 3;
        let feature_set = &mut FeatureSet::new(frequency_threshold);

        // On an empty set everything is unseen and nothing is pruned.
        let mut features: FeatureVec = vec![10, 20];
        assert_eq!(feature_set.count_unseen_and_prune_frequent(&mut features), 2);
        assert_eq!(feature_set.len(), 0);
        assert_eq!(features, vec![10, 20]);

        // First and second sightings of {10}: seen but not frequent.
        for _ in 0..2 {
            feature_set.increment_frequencies(&vec![10]);
            let mut features: FeatureVec = vec![10, 20];
            assert_eq!(feature_set.count_unseen_and_prune_frequent(&mut features), 1);
            assert_eq!(feature_set.len(), 1);
            assert_eq!(features, vec![10, 20]);
        }

        // Third sighting: {10} becomes frequent and gets pruned out.
        feature_set.increment_frequencies(&vec![10]);
        let mut features: FeatureVec = vec![10, 20];
        assert_eq!(feature_set.count_unseen_and_prune_frequent(&mut features), 1);
        assert_eq!(feature_set.len(), 1);
        assert_eq!(features, vec![20]);

        // A new feature {30} does not resurrect {10}.
        feature_set.increment_frequencies(&vec![30]);
        let mut features: FeatureVec = vec![10, 20];
        assert_eq!(feature_set.count_unseen_and_prune_frequent(&mut features), 1);
        assert_eq!(feature_set.len(), 2);
        assert_eq!(features, vec![20]);

        let mut features: FeatureVec = vec![10, 20, 30];
        assert_eq!(feature_set.count_unseen_and_prune_frequent(&mut features), 1);
        assert_eq!(features, vec![20, 30]);

        // Drive {30} to the threshold; only {20} survives, still unseen.
        feature_set.increment_frequencies(&vec![30]);
        feature_set.increment_frequencies(&vec![30]);
        let mut features: FeatureVec = vec![10, 20, 30];
        assert_eq!(feature_set.count_unseen_and_prune_frequent(&mut features), 1);
        assert_eq!(feature_set.len(), 2);
        assert_eq!(features, vec![20]);

        // Once {20} is seen twice, nothing is unseen any more.
        feature_set.increment_frequencies(&vec![20]);
        feature_set.increment_frequencies(&vec![20]);
        let mut features: FeatureVec = vec![10, 20, 30];
        assert_eq!(feature_set.count_unseen_and_prune_frequent(&mut features), 0);
        assert_eq!(feature_set.len(), 3);
        assert_eq!(features, vec![20]);

        // And after its third sighting the whole vector dissolves.
        feature_set.increment_frequencies(&vec![20]);
        let mut features: FeatureVec = vec![10, 20, 30];
        assert_eq!(feature_set.count_unseen_and_prune_frequent(&mut features), 0);
        assert_eq!(feature_set.len(), 3);
        assert!(features.is_empty());
    }

    #[test]
    fn increment_then_count_reports_nothing_new() {
        let mut feature_set = FeatureSet::new(100);
        let features: FeatureVec = vec![7, 8, 9];
        feature_set.increment_frequencies(&features);
        let mut again = features.clone();
        assert_eq!(feature_set.count_unseen_and_prune_frequent(&mut again), 0);
        assert_eq!(again, features);
    }

    #[test]
    fn compute_weight_prefers_rare_features() {
        let mut feature_set = FeatureSet::new(10);
        feature_set.increment_frequencies(&vec![1, 2, 3]);
        assert_eq!(
            feature_set.compute_weight(&vec![1]),
            feature_set.compute_weight(&vec![2])
        );
        assert_eq!(
            feature_set.compute_weight(&vec![1]),
            feature_set.compute_weight(&vec![3])
        );

        feature_set.increment_frequencies(&vec![1, 2]);
        assert!(feature_set.compute_weight(&vec![3]) > feature_set.compute_weight(&vec![2]));
        assert!(feature_set.compute_weight(&vec![3]) > feature_set.compute_weight(&vec![1]));
        assert!(feature_set.compute_weight(&vec![3, 1]) > feature_set.compute_weight(&vec![2, 1]));
        assert!(feature_set.compute_weight(&vec![3, 2]) > feature_set.compute_weight(&vec![2]));

        feature_set.increment_frequencies(&vec![1]);
        assert!(feature_set.compute_weight(&vec![3]) > feature_set.compute_weight(&vec![2]));
        assert!(feature_set.compute_weight(&vec![2]) > feature_set.compute_weight(&vec![1]));
        assert!(feature_set.compute_weight(&vec![3, 2]) > feature_set.compute_weight(&vec![3, 1]));
    }

    #[test]
    #[should_panic(expected = "unknown feature")]
    fn compute_weight_panics_on_unknown_feature() {
        let mut feature_set = FeatureSet::new(10);
        feature_set.increment_frequencies(&vec![1, 2, 3]);
        feature_set.compute_weight(&vec![4]);
    }

    #[test]
    fn compute_weight_prefers_rare_domains() {
        let mut feature_set = FeatureSet::new(10);
        // Domain seen-counts: counters 1, cmp 2, bounded-path 3.
        let f1 = domains::COUNTERS_8BIT.begin();
        let f2 = domains::CMP.begin();
        let f3 = domains::BOUNDED_PATH.begin();
        feature_set.increment_frequencies(&vec![f1, f2, f2 + 1, f3, f3 + 1, f3 + 2]);

        assert!(feature_set.compute_weight(&vec![f1]) > feature_set.compute_weight(&vec![f2]));
        assert!(feature_set.compute_weight(&vec![f2]) > feature_set.compute_weight(&vec![f3]));
    }

    #[test]
    fn per_domain_counts_track_first_sightings_only() {
        let mut feature_set = FeatureSet::new(5);
        let cmp = domains::CMP.begin() + 9;
        feature_set.increment_frequencies(&vec![cmp, cmp, cmp]);
        assert_eq!(feature_set.count_features(domains::CMP), 1);
        assert_eq!(feature_set.count_features(domains::UNKNOWN), 0);
        assert_eq!(feature_set.frequency(cmp), 3);
    }

    #[test]
    fn coverage_pc_indices_come_from_edge_domains() {
        let mut feature_set = FeatureSet::new(5);
        let counter_feature = domains::COUNTERS_8BIT
            .convert_to_me(convert_8bit_counter_to_number(42, 1));
        let guard_feature = domains::PC_GUARD.begin() + 7;
        let cmp_feature = domains::CMP.begin() + 1;
        feature_set.increment_frequencies(&vec![counter_feature, guard_feature, cmp_feature]);
        assert_eq!(feature_set.to_coverage_pc_indices(), vec![7, 42]);
    }
}
