//! Execution of input batches against out-of-process targets.
//!
//! The engine itself only depends on the [`EngineCallbacks`] trait: hand it
//! a batch, get back per-input feature vectors and a crash signal. The
//! bundled [`CommandExecutor`] runs a plain binary per input; wiring actual
//! instrumentation features back from a runner library is the runner's
//! concern, so command-executed results carry empty feature vectors.

use crate::feature::FeatureVec;
use crate::knobs::Knobs;
use crate::mutator::ByteMutator;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("failed to spawn target '{command}': {reason}")]
    Spawn { command: String, reason: String },
    #[error("I/O error while running target: {0}")]
    Io(String),
}

impl From<std::io::Error> for ExecutorError {
    fn from(err: std::io::Error) -> Self {
        ExecutorError::Io(err.to_string())
    }
}

/// Outcome of one input as observed by the engine.
#[derive(Debug, Default, Clone)]
pub struct ExecutionResult {
    features: FeatureVec,
    cmp_args: Vec<u8>,
}

impl ExecutionResult {
    pub fn features(&self) -> &FeatureVec {
        &self.features
    }

    pub fn features_mut(&mut self) -> &mut FeatureVec {
        &mut self.features
    }

    pub fn cmp_args(&self) -> &[u8] {
        &self.cmp_args
    }

    pub fn cmp_args_mut(&mut self) -> &mut Vec<u8> {
        &mut self.cmp_args
    }
}

/// Result of executing one batch.
///
/// `num_outputs_read` is how many inputs the target finished reporting
/// before it died; when a batch fails, the input at that index is the
/// presumed crasher.
#[derive(Debug, Default)]
pub struct BatchResult {
    results: Vec<ExecutionResult>,
    num_outputs_read: usize,
    exit_code: i32,
    log: String,
}

impl BatchResult {
    pub fn new(num_inputs: usize) -> Self {
        let mut batch_result = Self::default();
        batch_result.reset(num_inputs);
        batch_result
    }

    /// Clears all state and sizes `results` for a batch of `num_inputs`.
    pub fn reset(&mut self, num_inputs: usize) {
        self.results.clear();
        self.results.resize(num_inputs, ExecutionResult::default());
        self.num_outputs_read = 0;
        self.exit_code = 0;
        self.log.clear();
    }

    pub fn results(&self) -> &[ExecutionResult] {
        &self.results
    }

    pub fn results_mut(&mut self) -> &mut [ExecutionResult] {
        &mut self.results
    }

    pub fn num_outputs_read(&self) -> usize {
        self.num_outputs_read
    }

    pub fn set_num_outputs_read(&mut self, n: usize) {
        self.num_outputs_read = n;
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn set_exit_code(&mut self, exit_code: i32) {
        self.exit_code = exit_code;
    }

    pub fn log(&self) -> &str {
        &self.log
    }

    pub fn set_log(&mut self, log: String) {
        self.log = log;
    }
}

/// The user-supplied surface the fuzzing loop drives.
pub trait EngineCallbacks {
    /// Executes `inputs` against `binary`, filling `batch_result`. Returns
    /// `false` iff the batch crashed; a per-input failure is signalled by
    /// `num_outputs_read() < inputs.len()`.
    fn execute(&mut self, binary: &str, inputs: &[Vec<u8>], batch_result: &mut BatchResult)
        -> bool;

    /// A minimal input the target accepts; used for warm-up and seeding.
    fn dummy_valid_input(&self) -> Vec<u8> {
        vec![0]
    }

    /// Transforms a batch of corpus picks into the inputs to actually run.
    fn mutate(&mut self, inputs: &mut Vec<Vec<u8>>);
}

/// How an input reaches the target process.
#[derive(Debug, Clone)]
pub enum InputDelivery {
    /// Input bytes are piped to the target's stdin.
    Stdin,
    /// Input is written to `path`; `@@` in the argument list is replaced by
    /// it (the path is appended when no argument mentions it).
    File { path: PathBuf },
}

/// Settings for running one target binary.
#[derive(Debug, Clone)]
pub struct CommandOptions {
    pub args: Vec<String>,
    pub input_delivery: InputDelivery,
    pub timeout: Duration,
    pub working_dir: Option<PathBuf>,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            input_delivery: InputDelivery::Stdin,
            timeout: Duration::from_secs(2),
            working_dir: None,
        }
    }
}

enum RunOutcome {
    Ok,
    Crashed { exit_code: i32, log: String },
}

/// Runs an external binary once per input, blocking on each run.
pub struct CommandExecutor {
    program: String,
    options: CommandOptions,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, options: CommandOptions) -> Self {
        Self {
            program: program.into(),
            options,
        }
    }

    fn run_one(&self, input: &[u8]) -> Result<RunOutcome, ExecutorError> {
        let mut args = self.options.args.clone();
        if let InputDelivery::File { path } = &self.options.input_delivery {
            std::fs::write(path, input)?;
            let path_str = path.to_string_lossy();
            let mut replaced = false;
            for arg in &mut args {
                if arg.contains("@@") {
                    *arg = arg.replace("@@", &path_str);
                    replaced = true;
                }
            }
            if !replaced {
                args.push(path_str.into_owned());
            }
        }

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .stdin(match self.options.input_delivery {
                InputDelivery::Stdin => Stdio::piped(),
                InputDelivery::File { .. } => Stdio::null(),
            });
        if let Some(dir) = &self.options.working_dir {
            command.current_dir(dir);
        }
        let mut child = command.spawn().map_err(|e| ExecutorError::Spawn {
            command: self.program.clone(),
            reason: e.to_string(),
        })?;

        if let InputDelivery::Stdin = self.options.input_delivery {
            if let Some(mut stdin) = child.stdin.take() {
                use std::io::Write;
                // The target may exit without draining stdin; that is its
                // business, not an engine error.
                let _ = stdin.write_all(input);
            }
        }

        let deadline = Instant::now() + self.options.timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(RunOutcome::Crashed {
                    exit_code: -1,
                    log: format!("target timed out after {:?}", self.options.timeout),
                });
            }
            std::thread::sleep(Duration::from_millis(1));
        };

        let mut log = String::new();
        if let Some(mut stderr) = child.stderr.take() {
            let _ = stderr.read_to_string(&mut log);
        }
        if status.success() {
            Ok(RunOutcome::Ok)
        } else {
            Ok(RunOutcome::Crashed {
                exit_code: status.code().unwrap_or(-1),
                log,
            })
        }
    }

    /// Executes a whole batch, stopping at the first failing input.
    /// Returns `false` iff the batch crashed.
    pub fn execute_batch(&self, inputs: &[Vec<u8>], batch_result: &mut BatchResult) -> bool {
        batch_result.reset(inputs.len());
        for (index, input) in inputs.iter().enumerate() {
            match self.run_one(input) {
                Ok(RunOutcome::Ok) => batch_result.set_num_outputs_read(index + 1),
                Ok(RunOutcome::Crashed { exit_code, log }) => {
                    batch_result.set_num_outputs_read(index);
                    batch_result.set_exit_code(exit_code);
                    batch_result.set_log(log);
                    return false;
                }
                Err(error) => {
                    batch_result.set_num_outputs_read(index);
                    batch_result.set_exit_code(-1);
                    batch_result.set_log(error.to_string());
                    return false;
                }
            }
        }
        true
    }
}

/// Default callbacks: command execution plus knob-driven byte mutation.
pub struct CommandCallbacks {
    options: CommandOptions,
    mutator: ByteMutator,
    knobs: Knobs,
    rng: ChaCha8Rng,
}

impl CommandCallbacks {
    pub fn new(options: CommandOptions, knobs: Knobs, seed: u64) -> Self {
        Self {
            options,
            mutator: ByteMutator::new(),
            knobs,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl EngineCallbacks for CommandCallbacks {
    fn execute(&mut self, binary: &str, inputs: &[Vec<u8>], batch_result: &mut BatchResult) -> bool {
        CommandExecutor::new(binary, self.options.clone()).execute_batch(inputs, batch_result)
    }

    fn mutate(&mut self, inputs: &mut Vec<Vec<u8>>) {
        for input in inputs {
            self.mutator.mutate(input, &self.knobs, &mut self.rng);
        }
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn write_script(dir: &std::path::Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn batch_succeeds_when_every_input_passes() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "ok.sh", "cat > /dev/null; exit 0");
        let executor = CommandExecutor::new(script, CommandOptions::default());
        let mut batch_result = BatchResult::new(0);
        let inputs = vec![vec![1u8], vec![2u8], vec![3u8]];
        assert!(executor.execute_batch(&inputs, &mut batch_result));
        assert_eq!(batch_result.num_outputs_read(), 3);
        assert_eq!(batch_result.results().len(), 3);
        assert_eq!(batch_result.exit_code(), 0);
    }

    #[test]
    fn failing_input_marks_the_suspect() {
        let dir = tempdir().unwrap();
        // Crashes on any input containing an X.
        let script = write_script(
            dir.path(),
            "picky.sh",
            "in=$(cat); case \"$in\" in *X*) echo boom >&2; exit 42;; esac; exit 0",
        );
        let executor = CommandExecutor::new(script, CommandOptions::default());
        let mut batch_result = BatchResult::new(0);
        let inputs = vec![b"aa".to_vec(), b"aXa".to_vec(), b"zz".to_vec()];
        assert!(!executor.execute_batch(&inputs, &mut batch_result));
        assert_eq!(batch_result.num_outputs_read(), 1);
        assert_eq!(batch_result.exit_code(), 42);
        assert!(batch_result.log().contains("boom"));
    }

    #[test]
    fn file_delivery_substitutes_the_input_path() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "check.sh", "test -s \"$1\"");
        let input_path = dir.path().join("cur-input");
        let options = CommandOptions {
            args: vec!["@@".to_string()],
            input_delivery: InputDelivery::File { path: input_path },
            ..CommandOptions::default()
        };
        let executor = CommandExecutor::new(script, options);
        let mut batch_result = BatchResult::new(0);
        assert!(executor.execute_batch(&[vec![7u8]], &mut batch_result));
    }

    #[test]
    fn hung_target_counts_as_a_crash() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "hang.sh", "cat > /dev/null; sleep 10");
        let options = CommandOptions {
            timeout: Duration::from_millis(100),
            ..CommandOptions::default()
        };
        let executor = CommandExecutor::new(script, options);
        let mut batch_result = BatchResult::new(0);
        assert!(!executor.execute_batch(&[vec![1u8]], &mut batch_result));
        assert!(batch_result.log().contains("timed out"));
    }

    #[test]
    fn missing_binary_fails_the_batch() {
        let executor = CommandExecutor::new("/no/such/binary", CommandOptions::default());
        let mut batch_result = BatchResult::new(0);
        assert!(!executor.execute_batch(&[vec![1u8]], &mut batch_result));
        assert_eq!(batch_result.num_outputs_read(), 0);
    }
}
