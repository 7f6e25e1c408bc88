use crate::schedule::JobGroup;
use itertools::Itertools;
use std::{
    fmt::Write as _,
    fs, io,
    path::{Path, PathBuf},
};
use tracing::info;

/// Static description shared by every submission script of a campaign.
#[derive(Clone, Debug)]
pub struct SubmitConfig {
    /// batch queue partition
    pub partition: String,
    /// worker slots each node runs concurrently
    pub slots_per_node: usize,
    /// tag embedded in the script file names
    pub label: String,
    /// environment overrides forwarded to every trial
    pub env: Vec<(String, String)>,
    /// dispatcher binary invoked inside the allocation
    pub dispatcher: String,
}

/// seconds to the `HH:MM:SS` form batch queues expect
pub fn walltime(secs: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60
    )
}

/// single shell word holding a whole argv, split again by the dispatcher
fn quote(argv: &[String]) -> String {
    format!(
        "\"{}\"",
        argv.iter().map(|arg| arg.replace('"', "\\\"")).join(" ")
    )
}

/// Render the submission script for one job group: scheduler
/// directives, then one dispatcher invocation per allocation with the
/// group's trials as repeated `-r` tuples. Chunks cycle over the
/// allocated nodes so each rank picks up at most `slots_per_node` of
/// them.
///
/// The requested walltime is a soft bound: each rank drains its trials
/// FIFO over its slots rather than chunk-by-chunk, so unbalanced
/// chunks can push a rank past the longest chunk total. Trials cut off
/// at the limit leave no result file and are requeued by the next
/// scheduling pass.
pub fn render(config: &SubmitConfig, group: &JobGroup) -> String {
    let mut script = String::new();

    script.push_str("#!/bin/bash\n");
    let _ = writeln!(script, "#SBATCH --nodes={}", group.nodes);
    let _ = writeln!(script, "#SBATCH --partition={}", config.partition);
    let _ = writeln!(script, "#SBATCH --time={}", walltime(group.walltime_secs));
    script.push_str("#SBATCH --export=ALL\n");
    script.push_str("date\n");

    // -W 0 keeps the allocation alive when a single task exits early
    let _ = write!(
        script,
        "srun -W 0 -N {nodes} -n {nodes} {} run --slots {}",
        config.dispatcher,
        config.slots_per_node,
        nodes = group.nodes,
    );
    for (name, value) in &config.env {
        let _ = write!(script, " -e {name} {value}");
    }
    for (index, chunk) in group.chunks.iter().enumerate() {
        let rank = index % group.nodes;

        for trial in &chunk.trials {
            let _ = write!(
                script,
                " -r {rank} {} {} {} {}",
                trial.trial_dir.display(),
                trial.timeout,
                quote(&trial.command),
                quote(&trial.cleanup),
            );
        }
    }
    script.push('\n');

    script.push_str("date\n");
    script.push_str("echo \"JOB COMPLETED\"\n");

    script
}

/// write one `submit-<label>-<index>.sh` per group
pub fn write_scripts(
    config: &SubmitConfig,
    groups: &[JobGroup],
    out_dir: &Path,
) -> io::Result<Vec<PathBuf>> {
    let mut paths = Vec::with_capacity(groups.len());

    for (index, group) in groups.iter().enumerate() {
        let path = out_dir.join(format!("submit-{}-{}.sh", config.label, index + 1));
        fs::write(&path, render(config, group))?;

        info!(
            script = ?path,
            nodes = group.nodes,
            trials = group.trial_count(),
            walltime = %walltime(group.walltime_secs),
            "Wrote submission script"
        );
        paths.push(path);
    }

    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{group, pack, DEFAULT_ESTIMATE};
    use crate::trial::TrialSpec;
    use std::path::PathBuf;

    fn config() -> SubmitConfig {
        SubmitConfig {
            partition: "batch".to_owned(),
            slots_per_node: 2,
            label: "fi".to_owned(),
            env: vec![("OMP_NUM_THREADS".to_owned(), "8".to_owned())],
            dispatcher: "faultline".to_owned(),
        }
    }

    fn sample_group() -> JobGroup {
        let trials = vec![
            TrialSpec {
                trial_dir: PathBuf::from("/res/fi/1"),
                command: vec!["./app".to_owned(), "-n".to_owned(), "4".to_owned()],
                cleanup: vec!["rm".to_owned(), "-f".to_owned(), "core".to_owned()],
                timeout: 90.0,
                estimate: 30.0,
            },
            TrialSpec {
                trial_dir: PathBuf::from("/res/fi/2"),
                command: vec!["./app".to_owned()],
                cleanup: Vec::new(),
                timeout: 90.0,
                estimate: 40.0,
            },
        ];
        let chunks = pack(trials, 100.0, DEFAULT_ESTIMATE);
        group(chunks, 1, 2).remove(0)
    }

    #[test]
    fn walltime_renders_batch_queue_format() {
        assert_eq!(walltime(0), "00:00:00");
        assert_eq!(walltime(60), "00:01:00");
        assert_eq!(walltime(3725), "01:02:05");
        assert_eq!(walltime(360000), "100:00:00");
    }

    #[test]
    fn script_carries_scheduler_directives() {
        let script = render(&config(), &sample_group());

        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("#SBATCH --nodes=1\n"));
        assert!(script.contains("#SBATCH --partition=batch\n"));
        assert!(script.contains("#SBATCH --time=00:02:00\n"));
        assert!(script.contains("#SBATCH --export=ALL\n"));
    }

    #[test]
    fn script_invokes_the_dispatcher_with_trial_tuples() {
        let script = render(&config(), &sample_group());

        assert!(script.contains("srun -W 0 -N 1 -n 1 faultline run --slots 2"));
        assert!(script.contains(" -e OMP_NUM_THREADS 8"));
        assert!(script.contains(" -r 0 /res/fi/1 90 \"./app -n 4\" \"rm -f core\""));
        assert!(script.contains(" -r 0 /res/fi/2 90 \"./app\" \"\""));
    }

    #[test]
    fn chunks_cycle_over_the_allocated_nodes() {
        let trials: Vec<TrialSpec> = (0..4)
            .map(|index| TrialSpec {
                trial_dir: PathBuf::from(format!("/res/fi/{index}")),
                command: vec!["./app".to_owned()],
                cleanup: Vec::new(),
                timeout: 0.0,
                estimate: 50.0,
            })
            .collect();
        let chunks = pack(trials, 60.0, DEFAULT_ESTIMATE);
        assert_eq!(chunks.len(), 4);

        let groups = group(chunks, 2, 2);
        let script = render(&config(), &groups[0]);

        assert!(script.contains(" -r 0 /res/fi/0 "));
        assert!(script.contains(" -r 1 /res/fi/1 "));
        assert!(script.contains(" -r 0 /res/fi/2 "));
        assert!(script.contains(" -r 1 /res/fi/3 "));
    }

    #[test]
    fn scripts_are_written_per_group() {
        let dir = tempfile::tempdir().unwrap();
        let groups = vec![sample_group(), sample_group()];

        let paths = write_scripts(&config(), &groups, dir.path()).unwrap();

        assert_eq!(paths.len(), 2);
        assert!(dir.path().join("submit-fi-1.sh").is_file());
        assert!(dir.path().join("submit-fi-2.sh").is_file());
    }
}
