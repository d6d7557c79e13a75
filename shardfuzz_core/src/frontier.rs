//! Per-function "partially explored" hints.
//!
//! Frontier analysis itself (control-flow graphs, symbolization) lives
//! outside the core; the corpus only needs a scalar bonus per covered PC so
//! that inputs touching half-explored functions get extra sampling weight.

use crate::feature::{
    convert_8bit_counter_feature_to_pc_index, domains, FeatureVec, PcIndex,
};
use std::collections::HashMap;

/// Scalar frontier weights keyed by PC index, as supplied by an external
/// control-flow analysis. An empty frontier contributes nothing.
#[derive(Debug, Default, Clone)]
pub struct CoverageFrontier {
    weights: HashMap<PcIndex, u32>,
}

impl CoverageFrontier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that the function holding `pc_index` is a frontier with the
    /// given weight.
    pub fn set_weight(&mut self, pc_index: PcIndex, weight: u32) {
        if weight == 0 {
            self.weights.remove(&pc_index);
        } else {
            self.weights.insert(pc_index, weight);
        }
    }

    pub fn num_functions_in_frontier(&self) -> usize {
        self.weights.len()
    }

    pub fn frontier_weight(&self, pc_index: PcIndex) -> u32 {
        self.weights.get(&pc_index).copied().unwrap_or(0)
    }

    /// The strongest frontier bonus among the PCs a feature vector covers.
    pub fn weight_for(&self, features: &FeatureVec) -> u32 {
        if self.weights.is_empty() {
            return 0;
        }
        features
            .iter()
            .filter_map(|&feature| {
                if domains::PC_GUARD.contains(feature) {
                    Some((feature - domains::PC_GUARD.begin()) as PcIndex)
                } else if domains::COUNTERS_8BIT.contains(feature) {
                    Some(convert_8bit_counter_feature_to_pc_index(feature))
                } else {
                    None
                }
            })
            .map(|pc_index| self.frontier_weight(pc_index))
            .max()
            .unwrap_or(0)
    }
}
