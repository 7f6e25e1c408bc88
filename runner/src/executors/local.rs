use super::{interrupted, trial, ExecutorError, RunMonitor};
use crate::trial::{TrialResult, TrialSpec};
use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::{mpsc, Arc},
    thread,
    time::Duration,
};
use tracing::{debug, error, info, warn};

/// cadence of the slot liveness poll
const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// polls between throughput estimator updates
const RATE_WINDOW: u64 = 30;

/// Tally of one whole dispatcher invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchSummary {
    pub total: usize,
    pub executed: usize,
    pub skipped: usize,
    pub failed: usize,
}

struct SlotDone {
    slot: usize,
    trial_dir: PathBuf,
    result: Result<TrialResult, ExecutorError>,
}

/// Exponentially smoothed completion rate, used for progress and ETA
/// reporting only, never for scheduling decisions.
struct Throughput {
    total: usize,
    rate: f64,
    last_completed: usize,
    /// seconds covered by one estimator window
    window: f64,
}

impl Throughput {
    fn new(total: usize, window: f64) -> Self {
        Self {
            total,
            rate: 0.0,
            last_completed: 0,
            window,
        }
    }

    fn update(&mut self, completed: usize) {
        let delta = (completed - self.last_completed) as f64;
        self.rate = 0.5 * (delta / self.window) + 0.5 * self.rate;
        self.last_completed = completed;
    }

    fn eta(&self, completed: usize) -> String {
        if self.rate > 0.0 {
            let remaining = (self.total - completed) as f64 / self.rate;
            crate::submit::walltime(remaining as u64)
        } else {
            "--:--:--".to_owned()
        }
    }
}

/// Dispatcher over a fixed pool of local worker slots.
///
/// Each occupied slot is one worker thread blocking on its own child;
/// completions come back over a channel and the loop refills idle
/// slots from the FIFO queue once per poll tick, so a long trial never
/// stalls progress reporting or the refill of other slots.
pub struct LocalDispatcher {
    slots: usize,
    env: Vec<(String, String)>,
    poll_interval: Duration,
    monitor: Arc<RunMonitor>,
}

impl LocalDispatcher {
    pub fn new(slots: usize, env: Vec<(String, String)>) -> Self {
        Self {
            slots: slots.max(1),
            env,
            poll_interval: POLL_INTERVAL,
            monitor: Arc::new(RunMonitor::new()),
        }
    }

    /// handle for cancelling this dispatcher from another thread; the
    /// signal handler path goes through the process-global flag instead
    pub fn monitor(&self) -> Arc<RunMonitor> {
        Arc::clone(&self.monitor)
    }

    /// shorten the poll cadence to keep tests fast
    #[cfg(test)]
    fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run every pending trial to completion, at most `slots` at a time.
    pub fn execute(&self, trials: Vec<TrialSpec>) -> Result<DispatchSummary, ExecutorError> {
        let mut summary = DispatchSummary {
            total: trials.len(),
            ..DispatchSummary::default()
        };

        // a trial with a persisted outcome is never re-executed
        let mut pending: VecDeque<TrialSpec> = trials
            .into_iter()
            .filter(|trial| {
                if trial.is_done() {
                    debug!(trial = ?trial.trial_dir, "Skipping trial with existing result");
                    summary.skipped += 1;
                    false
                } else {
                    true
                }
            })
            .collect();

        let queued = pending.len();
        info!(
            total = summary.total,
            queued,
            skipped = summary.skipped,
            slots = self.slots,
            "Dispatching trials"
        );

        let (done_tx, done_rx) = mpsc::channel::<SlotDone>();
        let mut slots: Vec<Option<thread::JoinHandle<()>>> =
            (0..self.slots).map(|_| None).collect();

        let window = RATE_WINDOW as f64 * self.poll_interval.as_secs_f64();
        let mut throughput = Throughput::new(queued, window);
        let mut finished = 0;
        let mut ticks: u64 = 0;

        while finished < queued {
            if interrupted() || self.monitor.cancelled() {
                warn!("Interrupt received, terminating running trials");
                self.monitor.cancel();
                for handle in slots.iter_mut().filter_map(Option::take) {
                    let _ = handle.join();
                }

                return Err(ExecutorError::Interrupted);
            }

            // reap slots whose worker reported back
            while let Ok(done) = done_rx.try_recv() {
                if let Some(handle) = slots[done.slot].take() {
                    let _ = handle.join();
                }
                finished += 1;

                match done.result {
                    Ok(result) => {
                        debug!(
                            trial = ?done.trial_dir,
                            outcome = %result.outcome,
                            elapsed = result.elapsed,
                            "Trial finished"
                        );
                        summary.executed += 1;
                    }
                    Err(error) => {
                        error!(trial = ?done.trial_dir, %error, "Trial failed to execute");
                        summary.failed += 1;
                    }
                }
            }

            // refill every idle slot, FIFO over the input order
            for (index, slot) in slots.iter_mut().enumerate() {
                if slot.is_none() {
                    let Some(spec) = pending.pop_front() else {
                        break;
                    };
                    *slot = Some(self.launch(index, spec, &done_tx));
                }
            }

            if finished >= queued {
                break;
            }

            thread::sleep(self.poll_interval);
            ticks += 1;

            if ticks % RATE_WINDOW == 0 {
                throughput.update(finished);
                info!(
                    completed = finished,
                    total = queued,
                    rate = %format_args!("{:.2}/s", throughput.rate),
                    eta = %throughput.eta(finished),
                    "Progress"
                );
            }
        }

        info!(
            executed = summary.executed,
            skipped = summary.skipped,
            failed = summary.failed,
            "Dispatch complete"
        );

        Ok(summary)
    }

    fn launch(
        &self,
        slot: usize,
        spec: TrialSpec,
        done: &mpsc::Sender<SlotDone>,
    ) -> thread::JoinHandle<()> {
        let monitor = Arc::clone(&self.monitor);
        let done = done.clone();
        let env = self.env.clone();

        thread::spawn(move || {
            let result = trial::run_trial(&spec, &env, &monitor, slot);
            // the receiver may already be gone on interrupt
            let _ = done.send(SlotDone {
                slot,
                trial_dir: spec.trial_dir,
                result,
            });
        })
    }
}
