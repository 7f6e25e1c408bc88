use super::{ExecutorError, RunMonitor};
use crate::trial::{Outcome, TrialResult, TrialSpec, STDERR_FILE, STDOUT_FILE};
use std::{
    fs::File,
    io,
    path::Path,
    process::{Command, Stdio},
    time::{Duration, Instant},
};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

fn setup_error(path: &Path, source: io::Error) -> ExecutorError {
    ExecutorError::Setup {
        path: path.to_path_buf(),
        source,
    }
}

/// Run a single trial to completion and persist its outcome.
///
/// The child runs with `trial_dir` as working directory, the inherited
/// environment plus `env`, and stdout/stderr redirected into fresh
/// capture files. A positive timeout turns into a deadline wait with a
/// forced kill on expiry. The cleanup command runs unconditionally
/// afterwards. The monitor learns the child pid so cancellation can
/// reach it; a cancelled trial persists nothing and is safe to requeue.
pub fn run_trial(
    spec: &TrialSpec,
    env: &[(String, String)],
    monitor: &RunMonitor,
    slot: usize,
) -> Result<TrialResult, ExecutorError> {
    // a cancellation that lands before the spawn must not start a child
    // the kill fan-out can no longer reach
    if monitor.cancelled() {
        return Err(ExecutorError::Interrupted);
    }

    let stdout = File::create(spec.trial_dir.join(STDOUT_FILE))
        .map_err(|error| setup_error(&spec.trial_dir, error))?;
    let stderr = File::create(spec.trial_dir.join(STDERR_FILE))
        .map_err(|error| setup_error(&spec.trial_dir, error))?;

    let (program, args) = spec.command.split_first().ok_or_else(|| {
        ExecutorError::Spawn(io::Error::new(
            io::ErrorKind::InvalidInput,
            "trial command is empty",
        ))
    })?;

    let start = Instant::now();
    let mut child = Command::new(program)
        .args(args)
        .current_dir(&spec.trial_dir)
        .envs(env.iter().map(|(name, value)| (name, value)))
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .spawn()
        .map_err(ExecutorError::Spawn)?;

    monitor.register(slot, child.id());

    let outcome = if spec.timeout > 0.0 {
        let deadline = Duration::from_secs_f64(spec.timeout);

        match child.wait_timeout(deadline).map_err(ExecutorError::Wait)? {
            Some(status) => Outcome::classify(status),
            None => {
                debug!(trial = ?spec.trial_dir, timeout = spec.timeout, "Deadline expired, killing child");

                if let Err(error) = child.kill() {
                    warn!(?error, "Failed to kill timed out child");
                }
                // reap so the child is gone before cleanup runs
                let _ = child.wait();

                Outcome::Timeout
            }
        }
    } else {
        Outcome::classify(child.wait().map_err(ExecutorError::Wait)?)
    };

    let elapsed = start.elapsed().as_secs_f64();
    monitor.clear(slot);

    run_cleanup(spec, env);

    if monitor.cancelled() {
        // an interrupted trial must leave no result behind so a later
        // pass requeues it
        return Err(ExecutorError::Interrupted);
    }

    let result = TrialResult { outcome, elapsed };
    result
        .persist(&spec.trial_dir)
        .map_err(|error| setup_error(&spec.trial_dir, error))?;

    debug!(trial = ?spec.trial_dir, outcome = %result.outcome, elapsed, "Trial done");

    Ok(result)
}

/// best-effort cleanup in the trial directory, failures are logged and
/// never change the trial's outcome
fn run_cleanup(spec: &TrialSpec, env: &[(String, String)]) {
    let Some((program, args)) = spec.cleanup.split_first() else {
        return;
    };

    let status = Command::new(program)
        .args(args)
        .current_dir(&spec.trial_dir)
        .envs(env.iter().map(|(name, value)| (name, value)))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => {}
        Ok(status) => warn!(trial = ?spec.trial_dir, ?status, "Cleanup command failed"),
        Err(error) => warn!(trial = ?spec.trial_dir, ?error, "Failed to run cleanup command"),
    }
}
