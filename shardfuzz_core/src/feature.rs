//! The flat feature space observed from instrumented targets.
//!
//! Every dynamic event the runner can report (an edge hit, a bucketed edge
//! counter, a data-flow load, a comparison, a short path hash) is encoded as
//! a single `Feature`, a tag in one flat `u64` space. The space is split into
//! contiguous *domains*, one per instrumentation source, so that the engine
//! can weight and count features per source without carrying the source
//! around separately.

/// One observed instrumentation event, encoded into the flat feature space.
pub type Feature = u64;

/// An ordered sequence of features. Duplicates are not permitted; the order
/// carries no meaning but is preserved for determinism.
pub type FeatureVec = Vec<Feature>;

/// Index of a PC in the target's PC table.
pub type PcIndex = usize;

/// Width of every feature domain.
pub const DOMAIN_SIZE: u64 = 1 << 40;

/// Number of feature domains, including the catch-all one.
pub const NUM_DOMAINS: usize = 6;

/// A contiguous `[begin, end)` interval of the feature space owned by one
/// instrumentation source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureDomain {
    index: usize,
    name: &'static str,
}

impl FeatureDomain {
    const fn new(index: usize, name: &'static str) -> Self {
        Self { index, name }
    }

    /// First feature belonging to this domain.
    pub const fn begin(&self) -> Feature {
        self.index as u64 * DOMAIN_SIZE
    }

    /// One past the last feature belonging to this domain.
    pub const fn end(&self) -> Feature {
        self.begin() + DOMAIN_SIZE
    }

    pub const fn contains(&self, feature: Feature) -> bool {
        feature >= self.begin() && feature < self.end()
    }

    /// Maps a raw instrumentation number into this domain.
    pub const fn convert_to_me(&self, number: u64) -> Feature {
        self.begin() + number % DOMAIN_SIZE
    }

    /// Position of this domain in the per-domain count tables.
    pub const fn index(&self) -> usize {
        self.index
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

/// The fixed partition of the feature space.
pub mod domains {
    use super::FeatureDomain;

    /// Features that came from an unrecognized source.
    pub const UNKNOWN: FeatureDomain = FeatureDomain::new(0, "unknown");
    /// Plain edge coverage (one feature per PC guard).
    pub const PC_GUARD: FeatureDomain = FeatureDomain::new(1, "pc-guard");
    /// Counter-bucketed edge coverage: (pc, log2-bucket) pairs.
    pub const COUNTERS_8BIT: FeatureDomain = FeatureDomain::new(2, "8bit-counters");
    /// Data-flow features: (pc, load address) pairs.
    pub const DATA_FLOW: FeatureDomain = FeatureDomain::new(3, "data-flow");
    /// Context-hashed comparison operand pairs.
    pub const CMP: FeatureDomain = FeatureDomain::new(4, "cmp");
    /// Hashes of short execution paths.
    pub const BOUNDED_PATH: FeatureDomain = FeatureDomain::new(5, "bounded-path");

    /// All domains, ordered by their position in the feature space.
    pub const ALL: [FeatureDomain; super::NUM_DOMAINS] =
        [UNKNOWN, PC_GUARD, COUNTERS_8BIT, DATA_FLOW, CMP, BOUNDED_PATH];
}

/// Returns the domain a feature belongs to. Features past the last domain
/// are treated as unknown.
pub fn domain_of(feature: Feature) -> FeatureDomain {
    let index = (feature / DOMAIN_SIZE) as usize;
    if index < NUM_DOMAINS {
        domains::ALL[index]
    } else {
        domains::UNKNOWN
    }
}

/// Buckets an 8-bit execution counter into its log2-ish class, 0..=7.
const fn counter_log_bucket(counter_value: u8) -> u64 {
    match counter_value {
        0 | 1 => 0,
        2 => 1,
        3..=4 => 2,
        5..=8 => 3,
        9..=16 => 4,
        17..=32 => 5,
        33..=128 => 6,
        _ => 7,
    }
}

/// Packs an `(pc_index, counter_value)` observation into a raw counter
/// number: 8 numbers per PC, one per counter bucket.
pub const fn convert_8bit_counter_to_number(pc_index: PcIndex, counter_value: u8) -> u64 {
    pc_index as u64 * 8 + counter_log_bucket(counter_value)
}

/// Recovers the PC index from a feature in the 8-bit counter domain.
pub fn convert_8bit_counter_feature_to_pc_index(feature: Feature) -> PcIndex {
    debug_assert!(domains::COUNTERS_8BIT.contains(feature));
    ((feature - domains::COUNTERS_8BIT.begin()) / 8) as PcIndex
}

/// Packs a pair of offsets (e.g. a load PC and a load address) into one
/// number, injective while both offsets stay below `max_offset`.
pub const fn convert_pc_pair_to_number(pc_offset: u64, addr_offset: u64, max_offset: u64) -> u64 {
    pc_offset * max_offset + addr_offset
}

/// A 64-bit finalizer (splitmix64) used to spread raw instrumentation
/// numbers before they are folded into a domain.
pub const fn hash64_bits(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// Packs a comparison observation `(arg1, arg2)` made in a given calling
/// context into one number.
pub const fn convert_context_and_arg_pair_to_number(arg1: u64, arg2: u64, context: u64) -> u64 {
    hash64_bits(arg1) ^ hash64_bits(arg2).rotate_left(32) ^ context
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domains_partition_the_space_contiguously() {
        let mut expected_begin = 0;
        for domain in domains::ALL {
            assert_eq!(domain.begin(), expected_begin);
            assert!(domain.contains(domain.begin()));
            assert!(domain.contains(domain.end() - 1));
            assert!(!domain.contains(domain.end()));
            expected_begin = domain.end();
        }
    }

    #[test]
    fn domain_of_resolves_membership() {
        assert_eq!(domain_of(10), domains::UNKNOWN);
        assert_eq!(domain_of(domains::CMP.begin() + 5), domains::CMP);
        // Beyond the last domain everything degrades to unknown.
        assert_eq!(domain_of(u64::MAX), domains::UNKNOWN);
    }

    #[test]
    fn convert_to_me_lands_inside_the_domain() {
        let f = domains::BOUNDED_PATH.convert_to_me(u64::MAX);
        assert!(domains::BOUNDED_PATH.contains(f));
        assert_eq!(domains::PC_GUARD.convert_to_me(3), domains::PC_GUARD.begin() + 3);
    }

    #[test]
    fn counter_features_round_trip_to_pc_index() {
        for pc_index in [0usize, 1, 7, 1000] {
            for counter in [1u8, 2, 4, 17, 255] {
                let number = convert_8bit_counter_to_number(pc_index, counter);
                let feature = domains::COUNTERS_8BIT.convert_to_me(number);
                assert_eq!(convert_8bit_counter_feature_to_pc_index(feature), pc_index);
            }
        }
    }

    #[test]
    fn counter_buckets_are_monotone() {
        let buckets: Vec<u64> = (1..=255u8)
            .map(|c| convert_8bit_counter_to_number(0, c))
            .collect();
        assert!(buckets.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(buckets.first(), Some(&0));
        assert_eq!(buckets.last(), Some(&7));
    }

    #[test]
    fn cmp_packing_depends_on_all_inputs() {
        let base = convert_context_and_arg_pair_to_number(1, 2, 3);
        assert_ne!(base, convert_context_and_arg_pair_to_number(2, 2, 3));
        assert_ne!(base, convert_context_and_arg_pair_to_number(1, 3, 3));
        assert_ne!(base, convert_context_and_arg_pair_to_number(1, 2, 4));
    }
}
