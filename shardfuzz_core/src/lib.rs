pub mod blob;
pub mod config;
pub mod corpus;
pub mod engine;
pub mod executor;
pub mod feature;
pub mod feature_set;
pub mod filter;
pub mod frontier;
pub mod knobs;
pub mod mutator;
pub mod workdir;

pub use config::{ConfigError, EngineConfig};
pub use corpus::{Corpus, CorpusRecord, WeightedDistribution};
pub use engine::{
    clear_early_exit, early_exit_code, early_exit_requested, request_early_exit, Engine,
    EngineError,
};
pub use executor::{
    BatchResult, CommandCallbacks, CommandExecutor, CommandOptions, EngineCallbacks,
    ExecutionResult, ExecutorError, InputDelivery,
};
pub use feature::{Feature, FeatureDomain, FeatureVec, PcIndex};
pub use feature_set::FeatureSet;
pub use filter::{FunctionFilter, InputFilter};
pub use frontier::CoverageFrontier;
pub use knobs::{KnobId, Knobs};
pub use mutator::ByteMutator;
pub use workdir::{LocalStorage, Storage, WorkdirError, WorkdirLayout};
