use crate::trial::TrialSpec;
use itertools::Itertools;
use tracing::debug;

/// fallback runtime estimate (seconds) when no profiling data exists,
/// keeps estimate-less trials from starving the packer
pub const DEFAULT_ESTIMATE: f64 = 3600.0;

/// Trials whose combined runtime estimate fits within the wall clock
/// limit. A chunk occupies one worker slot for up to `total` seconds.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Chunk {
    /// sum of the estimates of all member trials
    pub total: f64,
    pub trials: Vec<TrialSpec>,
}

impl Chunk {
    fn singleton(trial: TrialSpec, estimate: f64) -> Self {
        Self {
            total: estimate,
            trials: vec![trial],
        }
    }
}

/// Partition trials into wall-clock-bounded chunks, first fit in input
/// order. Callers wanting FFD behaviour sort by descending estimate
/// beforehand. A trial whose own estimate exceeds `wall_limit` gets a
/// chunk of its own, never rejected or split. O(trials x chunks), fine
/// for the chunk counts seen here; optimal packing is NP-hard anyway.
pub fn pack(trials: Vec<TrialSpec>, wall_limit: f64, default_estimate: f64) -> Vec<Chunk> {
    let mut chunks: Vec<Chunk> = Vec::new();

    for trial in trials {
        let estimate = if trial.estimate > 0.0 {
            trial.estimate
        } else {
            default_estimate
        };

        match chunks
            .iter_mut()
            .find(|chunk| chunk.total + estimate <= wall_limit)
        {
            Some(chunk) => {
                chunk.total += estimate;
                chunk.trials.push(trial);
            }
            None => chunks.push(Chunk::singleton(trial, estimate)),
        }
    }

    debug!(chunks = chunks.len(), wall_limit, "Packed trials");

    chunks
}

/// One batch queue submission: a set of chunks that run concurrently
/// on `nodes` nodes, one chunk per worker slot.
#[derive(Clone, Debug, PartialEq)]
pub struct JobGroup {
    pub chunks: Vec<Chunk>,
    /// requested wall time in seconds, a whole number of minutes
    pub walltime_secs: u64,
    /// nodes needed for the chunks actually assigned, not the configured maximum
    pub nodes: usize,
}

impl JobGroup {
    pub fn trial_count(&self) -> usize {
        self.chunks.iter().map(|chunk| chunk.trials.len()).sum()
    }
}

/// Consume chunks in order into groups of at most
/// `nodes * slots_per_node` slots (one chunk per slot). The group wall
/// time is the longest member chunk since chunks run concurrently, not
/// sequentially.
pub fn group(chunks: Vec<Chunk>, nodes: usize, slots_per_node: usize) -> Vec<JobGroup> {
    let slots_per_node = slots_per_node.max(1);
    let capacity = (nodes * slots_per_node).max(1);
    let mut groups = Vec::new();

    for batch in &chunks.into_iter().chunks(capacity) {
        let chunks: Vec<Chunk> = batch.collect();
        let longest = chunks
            .iter()
            .fold(0.0_f64, |longest, chunk| longest.max(chunk.total));
        let nodes = (chunks.len() + slots_per_node - 1) / slots_per_node;

        groups.push(JobGroup {
            chunks,
            walltime_secs: round_to_minute(longest),
            nodes,
        });
    }

    debug!(groups = groups.len(), capacity, "Grouped chunks");

    groups
}

/// slots one trial run leaves free on a node: a single-threaded trial
/// shares the node with a full complement, a fully threaded one owns it
pub fn slots_for_threads(threads: usize, cores_per_node: usize) -> usize {
    (cores_per_node / threads.max(1)).max(1)
}

/// round up to the next full minute, the batch queue granularity
fn round_to_minute(secs: f64) -> u64 {
    let secs = secs.ceil() as u64;

    match secs % 60 {
        0 => secs,
        rem => secs + (60 - rem),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn trial(name: &str, estimate: f64) -> TrialSpec {
        TrialSpec {
            trial_dir: PathBuf::from(format!("/tmp/trials/{name}")),
            command: vec!["app".to_owned()],
            cleanup: Vec::new(),
            timeout: estimate * 3.0,
            estimate,
        }
    }

    fn trials(estimates: &[f64]) -> Vec<TrialSpec> {
        estimates
            .iter()
            .enumerate()
            .map(|(index, estimate)| trial(&index.to_string(), *estimate))
            .collect()
    }

    #[test]
    fn packs_first_fit_in_input_order() {
        let chunks = pack(trials(&[10.0, 8.0, 6.0, 4.0, 2.0]), 15.0, DEFAULT_ESTIMATE);

        let totals: Vec<f64> = chunks.iter().map(|chunk| chunk.total).collect();
        assert_eq!(totals, vec![14.0, 14.0, 2.0]);

        let estimates: Vec<Vec<f64>> = chunks
            .iter()
            .map(|chunk| chunk.trials.iter().map(|trial| trial.estimate).collect())
            .collect();
        assert_eq!(
            estimates,
            vec![vec![10.0, 4.0], vec![8.0, 6.0], vec![2.0]]
        );
    }

    #[test]
    fn chunk_totals_respect_the_limit() {
        let chunks = pack(
            trials(&[7.0, 5.0, 5.0, 3.0, 3.0, 2.0, 1.0]),
            10.0,
            DEFAULT_ESTIMATE,
        );

        for chunk in &chunks {
            assert!(chunk.total <= 10.0 || chunk.trials.len() == 1);
            let sum: f64 = chunk.trials.iter().map(|trial| trial.estimate).sum();
            assert!((chunk.total - sum).abs() < 1e-9);
        }
    }

    #[test]
    fn no_trial_is_lost_or_duplicated() {
        let input = trials(&[9.0, 1.0, 8.0, 2.0, 7.0, 3.0, 6.0]);
        let chunks = pack(input.clone(), 10.0, DEFAULT_ESTIMATE);

        let mut packed: Vec<TrialSpec> = chunks
            .into_iter()
            .flat_map(|chunk| chunk.trials)
            .collect();
        assert_eq!(packed.len(), input.len());

        packed.sort_by(|a, b| a.trial_dir.cmp(&b.trial_dir));
        let mut expected = input;
        expected.sort_by(|a, b| a.trial_dir.cmp(&b.trial_dir));
        assert_eq!(packed, expected);
    }

    #[test]
    fn oversized_trials_are_packed_alone() {
        let chunks = pack(trials(&[30.0, 5.0, 5.0]), 10.0, DEFAULT_ESTIMATE);

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].trials.len(), 1);
        assert_eq!(chunks[0].total, 30.0);
        assert_eq!(chunks[1].trials.len(), 2);
    }

    #[test]
    fn missing_estimates_use_the_default() {
        let chunks = pack(trials(&[0.0, 0.0]), 4000.0, DEFAULT_ESTIMATE);

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].total, DEFAULT_ESTIMATE);
    }

    #[test]
    fn groups_are_bounded_by_slot_capacity() {
        let chunks = pack(trials(&[10.0, 8.0, 6.0, 4.0, 2.0]), 15.0, DEFAULT_ESTIMATE);
        let groups = group(chunks, 1, 2);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].chunks.len(), 2);
        assert_eq!(groups[1].chunks.len(), 1);

        for group in &groups {
            assert!(group.chunks.len() <= 2);
            assert_eq!(group.nodes, (group.chunks.len() + 1) / 2);
        }
    }

    #[test]
    fn group_walltime_is_the_longest_chunk_rounded_up() {
        let chunks = pack(trials(&[100.0, 70.0]), 120.0, DEFAULT_ESTIMATE);
        let groups = group(chunks, 2, 1);

        assert_eq!(groups.len(), 1);
        // 100 + 70 > 120, so two chunks of 100 and 70 seconds
        assert_eq!(groups[0].walltime_secs, 120);
        assert_eq!(groups[0].nodes, 2);
    }

    #[test]
    fn exact_minute_walltimes_are_not_padded() {
        assert_eq!(round_to_minute(120.0), 120);
        assert_eq!(round_to_minute(120.5), 180);
        assert_eq!(round_to_minute(1.0), 60);
    }

    #[test]
    fn node_counts_follow_assigned_chunks() {
        let chunks = pack(trials(&[5.0; 10]), 5.0, DEFAULT_ESTIMATE);
        assert_eq!(chunks.len(), 10);

        let groups = group(chunks, 4, 2);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].nodes, 4);
        // only two chunks spill over, they need a single node
        assert_eq!(groups[1].chunks.len(), 2);
        assert_eq!(groups[1].nodes, 1);
    }

    #[test]
    fn slot_mapping_matches_node_core_budget() {
        assert_eq!(slots_for_threads(1, 16), 16);
        assert_eq!(slots_for_threads(8, 16), 2);
        assert_eq!(slots_for_threads(16, 16), 1);
        assert_eq!(slots_for_threads(32, 16), 1);
    }
}
