//! On-disk layout and access for the shared working directory.
//!
//! Every shard owns two append-only files: `corpus.<i>` with its raw inputs
//! and `features.<i>` with `(input hash, features)` payloads. Any shard may
//! read any file at any time; because a writer may be between the two
//! appends, readers must accept corpus frames whose features frame has not
//! landed yet. Files are never truncated, renamed, or deleted while in use.
//!
//! Feature sets are tied to a binary identity, so two different target
//! builds sharing a workdir keep independent feature state while sharing
//! the corpus.

use crate::blob::{self, hash_hex, unpack_features_and_hash, InputHash};
use crate::corpus::CorpusRecord;
use crate::feature::FeatureVec;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from workdir operations that prevent a shard from making
/// progress. Failures to *read* optional files are not errors; they are
/// expected while sibling shards have not produced output yet.
#[derive(Error, Debug)]
pub enum WorkdirError {
    /// A write or append to shared state failed.
    #[error("workdir I/O error: {0}")]
    Io(String),
}

impl From<io::Error> for WorkdirError {
    fn from(err: io::Error) -> Self {
        WorkdirError::Io(err.to_string())
    }
}

/// Capability set the engine needs from its backing store. The default
/// implementation is the local filesystem; a networked store can be
/// substituted as long as appends by distinct writers are serialized per
/// file.
pub trait Storage {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
    fn append(&self, path: &Path, data: &[u8]) -> io::Result<()>;
    /// Replaces the file contents in one step (write-then-rename).
    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()>;
    fn mkdir_all(&self, path: &Path) -> io::Result<()>;
}

/// Local-filesystem storage. Parent directories are created on demand.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalStorage;

fn ensure_parent(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

impl Storage for LocalStorage {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn append(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        use std::io::Write;
        ensure_parent(path)?;
        let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(data)
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        ensure_parent(path)?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, data)?;
        fs::rename(&tmp, path)
    }

    fn mkdir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }
}

/// Path scheme of one workdir for one binary identity.
#[derive(Debug, Clone)]
pub struct WorkdirLayout {
    workdir: PathBuf,
    binary_identity: String,
}

impl WorkdirLayout {
    pub fn new(workdir: PathBuf, binary_identity: String) -> Self {
        Self {
            workdir,
            binary_identity,
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn binary_identity(&self) -> &str {
        &self.binary_identity
    }

    /// `workdir/corpus.<i>` — the corpus is shared between binaries.
    pub fn corpus_path(&self, shard_index: usize) -> PathBuf {
        self.workdir.join(format!("corpus.{shard_index:06}"))
    }

    /// `workdir/features/<identity>/features.<i>`.
    pub fn features_path(&self, shard_index: usize) -> PathBuf {
        self.workdir
            .join("features")
            .join(&self.binary_identity)
            .join(format!("features.{shard_index:06}"))
    }

    pub fn coverage_report_path(&self, shard_index: usize) -> PathBuf {
        self.workdir
            .join(format!("coverage-report.{}.{shard_index:06}", self.binary_identity))
    }

    pub fn corpus_stats_path(&self, shard_index: usize) -> PathBuf {
        self.workdir
            .join(format!("corpus-stats.{}.{shard_index:06}", self.binary_identity))
    }

    pub fn distilled_path(&self, shard_index: usize) -> PathBuf {
        self.workdir
            .join(format!("distilled.{}.{shard_index:06}", self.binary_identity))
    }

    pub fn crashes_dir(&self) -> PathBuf {
        self.workdir.join("crashes").join(&self.binary_identity)
    }

    pub fn crash_reproducer_path(&self, input: &[u8]) -> PathBuf {
        self.crashes_dir().join(hash_hex(&blob::hash_input(input)))
    }

    /// Scratch file for handing inputs to an external filter process.
    pub fn filter_input_path(&self, shard_index: usize) -> PathBuf {
        self.workdir
            .join("tmp")
            .join(format!("filter-input.{shard_index:06}"))
    }
}

/// Reads one shard's corpus and features files and re-assembles them into
/// records, pairing the two streams by input hash.
///
/// Inputs whose features frame has not been written yet come back with an
/// empty feature vector; the caller re-executes them. Feature frames whose
/// input never shows up are dropped, since the data is replayable. Missing
/// files yield no records.
pub fn read_shard_records(
    storage: &dyn Storage,
    layout: &WorkdirLayout,
    shard_index: usize,
) -> Vec<CorpusRecord> {
    let corpus_blob = storage.read(&layout.corpus_path(shard_index)).unwrap_or_default();
    let features_blob = storage
        .read(&layout.features_path(shard_index))
        .unwrap_or_default();

    let mut features_by_hash: HashMap<InputHash, FeatureVec> = HashMap::new();
    for payload in blob::unpack(&features_blob) {
        if let Some((hash, features)) = unpack_features_and_hash(&payload) {
            features_by_hash.insert(hash, features);
        }
    }

    blob::unpack(&corpus_blob)
        .into_iter()
        .map(|data| {
            let features = features_by_hash
                .remove(&blob::hash_input(&data))
                .unwrap_or_default();
            CorpusRecord {
                data,
                features,
                cmp_args: Vec::new(),
            }
        })
        .collect()
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else if path.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

/// Stable shard assignment for a seed file: hash of the file name, not the
/// content, so a renamed copy may move but a retry never does.
fn shard_for_filename(path: &Path, total_shards: usize) -> usize {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let digest = md5::compute(name.as_bytes()).0;
    let key = u64::from_le_bytes(digest[..8].try_into().expect("digest has 8+ bytes"));
    (key % total_shards as u64) as usize
}

/// Appends every input file under `local_dir` to its shard's corpus file,
/// skipping inputs whose hash the shard already has. Returns
/// `(inputs_added, inputs_ignored)`. Re-running the export adds nothing.
pub fn export_corpus_from_dir(
    storage: &dyn Storage,
    layout: &WorkdirLayout,
    total_shards: usize,
    local_dir: &Path,
) -> Result<(usize, usize), WorkdirError> {
    let mut paths = Vec::new();
    collect_files(local_dir, &mut paths)
        .map_err(|e| WorkdirError::Io(format!("failed to list {local_dir:?}: {e}")))?;
    paths.sort();

    let mut sharded_paths: Vec<Vec<PathBuf>> = vec![Vec::new(); total_shards];
    for path in paths {
        sharded_paths[shard_for_filename(&path, total_shards)].push(path);
    }

    let mut inputs_added = 0;
    let mut inputs_ignored = 0;
    for (shard_index, shard_paths) in sharded_paths.into_iter().enumerate() {
        if shard_paths.is_empty() {
            continue;
        }
        let existing_blob = storage.read(&layout.corpus_path(shard_index)).unwrap_or_default();
        let existing_hashes: HashSet<InputHash> = blob::unpack(&existing_blob)
            .iter()
            .map(|input| blob::hash_input(input))
            .collect();

        let mut shard_data = Vec::new();
        for path in shard_paths {
            let input = fs::read(&path)
                .map_err(|e| WorkdirError::Io(format!("failed to read seed {path:?}: {e}")))?;
            if existing_hashes.contains(&blob::hash_input(&input)) {
                inputs_ignored += 1;
                continue;
            }
            shard_data.extend_from_slice(&blob::pack(&input));
            inputs_added += 1;
        }
        if !shard_data.is_empty() {
            storage.append(&layout.corpus_path(shard_index), &shard_data)?;
        }
    }
    log::info!(
        "export-corpus: dir: {local_dir:?} added: {inputs_added} ignored: {inputs_ignored}"
    );
    Ok((inputs_added, inputs_ignored))
}

/// Writes `input` to a content-addressed file in `dir`.
pub fn write_hashed_file_in_dir(
    storage: &dyn Storage,
    dir: &Path,
    input: &[u8],
) -> Result<(), WorkdirError> {
    let path = dir.join(hash_hex(&blob::hash_input(input)));
    storage.write(&path, input)?;
    Ok(())
}

/// Reads every shard's corpus and writes each input to a content-addressed
/// file in `local_dir`. Returns how many inputs were written.
pub fn save_corpus_to_dir(
    storage: &dyn Storage,
    layout: &WorkdirLayout,
    total_shards: usize,
    local_dir: &Path,
) -> Result<usize, WorkdirError> {
    storage.mkdir_all(local_dir)?;
    let mut saved = 0;
    for shard_index in 0..total_shards {
        let blob_data = storage.read(&layout.corpus_path(shard_index)).unwrap_or_default();
        let inputs = blob::unpack(&blob_data);
        log::info!(
            "save-corpus: read {} inputs from {:?}",
            inputs.len(),
            layout.corpus_path(shard_index)
        );
        for input in inputs {
            write_hashed_file_in_dir(storage, local_dir, &input)?;
            saved += 1;
        }
    }
    Ok(saved)
}
