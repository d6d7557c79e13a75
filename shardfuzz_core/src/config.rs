//! Engine configuration: everything the CLI surface can set, plus the
//! derived workdir layout.

use crate::blob::hash_hex;
use crate::workdir::WorkdirLayout;
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {reason}")]
    Read { path: PathBuf, reason: String },
    #[error("failed to parse config file {path:?}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn default_total_shards() -> usize {
    1
}
fn default_num_runs() -> u64 {
    1_000_000
}
fn default_batch_size() -> usize {
    1000
}
fn default_prune_frequency() -> usize {
    100
}
fn default_max_corpus_size() -> usize {
    100_000
}
fn default_load_other_shard_frequency() -> usize {
    10
}
fn default_true() -> bool {
    true
}
fn default_max_num_crash_reports() -> usize {
    5
}
fn default_seed() -> u64 {
    1
}
fn default_log_level() -> usize {
    1
}

/// Per-shard engine settings. Field semantics follow the CLI flags
/// one-to-one; a TOML file with the kebab-case field names can set any
/// subset, with the CLI overriding.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Target binary to execute.
    pub binary: String,
    /// Additional binaries every batch is replayed against.
    #[serde(default)]
    pub extra_binaries: Vec<String>,
    /// Shared state root, local or mounted from a remote store.
    pub workdir: PathBuf,
    /// Second workdir to merge the same-index shard from.
    #[serde(default)]
    pub merge_from: Option<PathBuf>,
    #[serde(default = "default_total_shards")]
    pub total_shards: usize,
    #[serde(default)]
    pub my_shard_index: usize,
    /// Total number of target runs this shard will perform.
    #[serde(default = "default_num_runs")]
    pub num_runs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Prune the corpus every time `num_total` is a multiple of this;
    /// zero disables pruning.
    #[serde(default = "default_prune_frequency")]
    pub prune_frequency: usize,
    #[serde(default = "default_max_corpus_size")]
    pub max_corpus_size: usize,
    /// Load a random sibling shard every N batches; zero disables.
    #[serde(default = "default_load_other_shard_frequency")]
    pub load_other_shard_frequency: usize,
    /// Load every shard at startup instead of just our own.
    #[serde(default)]
    pub full_sync: bool,
    /// Shards with index below this value distill after loading.
    #[serde(default)]
    pub distill_shards: usize,
    #[serde(default = "default_true")]
    pub use_corpus_weights: bool,
    #[serde(default = "default_true")]
    pub use_dataflow_features: bool,
    #[serde(default = "default_true")]
    pub use_cmp_features: bool,
    /// Depth of bounded-path tracking; zero discards path features.
    #[serde(default)]
    pub path_level: usize,
    /// External command vetoing corpus additions.
    #[serde(default)]
    pub input_filter: Option<String>,
    /// PC indexes the function filter accepts; empty accepts all.
    #[serde(default)]
    pub function_filter: Vec<usize>,
    /// Directories receiving content-addressed copies of new inputs.
    #[serde(default)]
    pub corpus_dir: Vec<PathBuf>,
    #[serde(default)]
    pub exit_on_crash: bool,
    #[serde(default = "default_max_num_crash_reports")]
    pub max_num_crash_reports: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Verbosity of the periodic stats lines; 0 keeps only the lifecycle
    /// events.
    #[serde(default = "default_log_level")]
    pub log_level: usize,
}

impl EngineConfig {
    /// A minimal config for the given target and workdir; everything else
    /// at defaults.
    pub fn new(binary: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            extra_binaries: Vec::new(),
            workdir: workdir.into(),
            merge_from: None,
            total_shards: default_total_shards(),
            my_shard_index: 0,
            num_runs: default_num_runs(),
            batch_size: default_batch_size(),
            prune_frequency: default_prune_frequency(),
            max_corpus_size: default_max_corpus_size(),
            load_other_shard_frequency: default_load_other_shard_frequency(),
            full_sync: false,
            distill_shards: 0,
            use_corpus_weights: true,
            use_dataflow_features: true,
            use_cmp_features: true,
            path_level: 0,
            input_filter: None,
            function_filter: Vec::new(),
            corpus_dir: Vec::new(),
            exit_on_crash: false,
            max_num_crash_reports: default_max_num_crash_reports(),
            seed: default_seed(),
            log_level: default_log_level(),
        }
    }

    pub fn load_from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.clone(),
            reason: e.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.binary.is_empty() {
            return Err(ConfigError::Invalid("binary must be set".into()));
        }
        if self.total_shards == 0 {
            return Err(ConfigError::Invalid("total_shards must be at least 1".into()));
        }
        if self.my_shard_index >= self.total_shards {
            return Err(ConfigError::Invalid(format!(
                "my_shard_index {} out of range for {} shards",
                self.my_shard_index, self.total_shards
            )));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".into()));
        }
        if self.max_corpus_size == 0 {
            return Err(ConfigError::Invalid("max_corpus_size must be at least 1".into()));
        }
        Ok(())
    }

    /// Identity string tying feature state to one target build: the binary
    /// name plus a hash of its contents (or of its path when the file is
    /// unreadable, e.g. on a different machine than the runner).
    pub fn binary_identity(&self) -> String {
        let name = std::path::Path::new(&self.binary)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "target".to_string());
        let digest = match std::fs::read(&self.binary) {
            Ok(contents) => md5::compute(&contents).0,
            Err(_) => md5::compute(self.binary.as_bytes()).0,
        };
        format!("{name}-{}", hash_hex(&digest))
    }

    pub fn layout(&self) -> WorkdirLayout {
        WorkdirLayout::new(self.workdir.clone(), self.binary_identity())
    }

    /// Whether this shard writes a distilled corpus after loading.
    pub fn distilling_in_this_shard(&self) -> bool {
        self.my_shard_index < self.distill_shards
    }

    /// The coverage report and corpus stats come from the first shard only.
    pub fn generating_coverage_report_in_this_shard(&self) -> bool {
        self.my_shard_index == 0
    }

    pub fn generating_corpus_stats_in_this_shard(&self) -> bool {
        self.my_shard_index == 0
    }
}
