//! Gates deciding which interesting inputs actually enter the corpus.

use crate::engine::request_early_exit;
use crate::feature::{
    convert_8bit_counter_feature_to_pc_index, domains, FeatureVec, PcIndex,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Restricts corpus growth to inputs that cover at least one PC of
/// interest. An empty filter passes everything. PC resolution from
/// function names happens outside the core; the filter receives plain PC
/// indexes.
#[derive(Debug, Default, Clone)]
pub struct FunctionFilter {
    allowed_pcs: HashSet<PcIndex>,
}

impl FunctionFilter {
    pub fn new(pc_indices: &[PcIndex]) -> Self {
        Self {
            allowed_pcs: pc_indices.iter().copied().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.allowed_pcs.is_empty()
    }

    /// True when the filter is empty or `features` covers an allowed PC.
    pub fn filter(&self, features: &FeatureVec) -> bool {
        if self.allowed_pcs.is_empty() {
            return true;
        }
        features.iter().any(|&feature| {
            let pc_index = if domains::PC_GUARD.contains(feature) {
                (feature - domains::PC_GUARD.begin()) as PcIndex
            } else if domains::COUNTERS_8BIT.contains(feature) {
                convert_8bit_counter_feature_to_pc_index(feature)
            } else {
                return false;
            };
            self.allowed_pcs.contains(&pc_index)
        })
    }
}

/// External veto over corpus additions: the input is written to a scratch
/// file and handed to a user-supplied command; a nonzero exit drops the
/// input. A command killed by a signal additionally requests engine
/// shutdown.
#[derive(Debug)]
pub struct InputFilter {
    command: String,
    input_path: PathBuf,
}

impl InputFilter {
    pub fn new(command: String, input_path: PathBuf) -> Self {
        Self {
            command,
            input_path,
        }
    }

    pub fn passes(&self, input: &[u8]) -> bool {
        if let Some(parent) = self.input_path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return false;
            }
        }
        if std::fs::write(&self.input_path, input).is_err() {
            return false;
        }
        let status = Command::new(&self.command)
            .arg(&self.input_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(status) if status.success() => true,
            Ok(status) => {
                if status.code().is_none() {
                    // Killed by a signal: somebody wants us gone.
                    request_early_exit(1);
                }
                false
            }
            Err(error) => {
                log::info!("input filter '{}' failed to run: {error}", self.command);
                false
            }
        }
    }
}
