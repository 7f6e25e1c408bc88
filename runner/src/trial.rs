use serde::{Deserialize, Serialize};
use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    process::ExitStatus,
    str::FromStr,
};
use thiserror::Error;

/// persisted outcome tag, one line
pub const RET_FILE: &str = "ret.txt";
/// persisted elapsed wall clock seconds
pub const TIME_FILE: &str = "time.txt";
pub const STDOUT_FILE: &str = "output.txt";
pub const STDERR_FILE: &str = "error.txt";

/// One experiment trial as handed over by the enumeration layer.
/// Immutable once built; the executor confines all side effects to
/// files under `trial_dir`.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TrialSpec {
    /// working directory of the trial, also receives all result files
    pub trial_dir: PathBuf,
    /// argv of the trial command
    pub command: Vec<String>,
    /// argv of the best-effort cleanup command, may be empty
    #[serde(default)]
    pub cleanup: Vec<String>,
    /// wall clock budget in seconds, 0 disables the deadline
    #[serde(default)]
    pub timeout: f64,
    /// estimated runtime in seconds from a prior profiling pass, 0 if unknown
    #[serde(default)]
    pub estimate: f64,
}

impl TrialSpec {
    /// a trial is done once its outcome file exists
    pub fn is_done(&self) -> bool {
        self.trial_dir.join(RET_FILE).is_file()
    }
}

/// Classified termination condition of a trial child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// clean exit with code zero
    Exit(i32),
    /// positive exit code
    Error(i32),
    /// terminated by a signal, carries the negated signal number
    Crash(i32),
    /// the wall clock deadline expired before the child exited
    Timeout,
}

impl Outcome {
    /// map a reaped exit status onto an outcome category
    pub fn classify(status: ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        match status.code() {
            Some(0) => Self::Exit(0),
            Some(code) if code > 0 => Self::Error(code),
            Some(code) => Self::Crash(code),
            None => Self::Crash(-status.signal().unwrap_or(0)),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exit(code) => write!(f, "exit, {code}"),
            Self::Error(code) => write!(f, "error, {code}"),
            Self::Crash(code) => write!(f, "crash, {code}"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

#[derive(Error, Debug)]
#[error("unrecognized outcome tag: {0}")]
pub struct ParseOutcomeError(String);

impl FromStr for Outcome {
    type Err = ParseOutcomeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        if s == "timeout" {
            return Ok(Self::Timeout);
        }

        let (tag, code) = s
            .split_once(',')
            .ok_or_else(|| ParseOutcomeError(s.to_owned()))?;
        let code: i32 = code
            .trim()
            .parse()
            .map_err(|_| ParseOutcomeError(s.to_owned()))?;

        match tag.trim() {
            "exit" => Ok(Self::Exit(code)),
            "error" => Ok(Self::Error(code)),
            "crash" => Ok(Self::Crash(code)),
            _ => Err(ParseOutcomeError(s.to_owned())),
        }
    }
}

#[derive(Error, Debug)]
pub enum ResultFileError {
    #[error("failed to read result files")]
    Io(#[from] io::Error),
    #[error("malformed outcome")]
    MalformedOutcome(#[from] ParseOutcomeError),
    #[error("malformed elapsed time: {0}")]
    MalformedTime(String),
}

/// Persisted result of a finished trial, written exactly once by the
/// trial executor and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialResult {
    pub outcome: Outcome,
    /// elapsed wall clock seconds
    pub elapsed: f64,
}

impl TrialResult {
    /// write `ret.txt` and `time.txt`, the sole persistence point for a trial
    pub fn persist(&self, trial_dir: &Path) -> io::Result<()> {
        fs::write(trial_dir.join(RET_FILE), format!("{}\n", self.outcome))?;
        fs::write(trial_dir.join(TIME_FILE), format!("{:.2}\n", self.elapsed))
    }

    /// read a previously persisted result back
    pub fn load(trial_dir: &Path) -> Result<Self, ResultFileError> {
        let ret = fs::read_to_string(trial_dir.join(RET_FILE))?;
        let outcome = ret.parse()?;

        let time = fs::read_to_string(trial_dir.join(TIME_FILE))?;
        let elapsed = time
            .trim()
            .parse()
            .map_err(|_| ResultFileError::MalformedTime(time.trim().to_owned()))?;

        Ok(Self { outcome, elapsed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(dir: &Path) -> TrialSpec {
        TrialSpec {
            trial_dir: dir.to_path_buf(),
            command: vec!["true".to_owned()],
            cleanup: Vec::new(),
            timeout: 0.0,
            estimate: 0.0,
        }
    }

    #[test]
    fn outcome_tags_round_trip() {
        for outcome in [
            Outcome::Exit(0),
            Outcome::Error(3),
            Outcome::Crash(-9),
            Outcome::Timeout,
        ] {
            assert_eq!(outcome.to_string().parse::<Outcome>().unwrap(), outcome);
        }
    }

    #[test]
    fn outcome_tags_match_result_file_format() {
        assert_eq!(Outcome::Exit(0).to_string(), "exit, 0");
        assert_eq!(Outcome::Error(3).to_string(), "error, 3");
        assert_eq!(Outcome::Crash(-11).to_string(), "crash, -11");
        assert_eq!(Outcome::Timeout.to_string(), "timeout");
    }

    #[test]
    fn malformed_outcome_is_rejected() {
        assert!("segfault, 1".parse::<Outcome>().is_err());
        assert!("exit".parse::<Outcome>().is_err());
        assert!("error, many".parse::<Outcome>().is_err());
    }

    #[test]
    fn result_persists_and_loads() {
        let dir = tempfile::tempdir().unwrap();
        let result = TrialResult {
            outcome: Outcome::Error(3),
            elapsed: 1.25,
        };

        result.persist(dir.path()).unwrap();

        assert_eq!(
            std::fs::read_to_string(dir.path().join(RET_FILE)).unwrap(),
            "error, 3\n"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join(TIME_FILE)).unwrap(),
            "1.25\n"
        );
        assert_eq!(TrialResult::load(dir.path()).unwrap(), result);
    }

    #[test]
    fn done_detection_follows_ret_file() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec(dir.path());

        assert!(!spec.is_done());

        TrialResult {
            outcome: Outcome::Exit(0),
            elapsed: 0.01,
        }
        .persist(dir.path())
        .unwrap();

        assert!(spec.is_done());
    }
}
