use crate::trial::TrialSpec;
use std::{
    env,
    fs::File,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("environment variable {0} is missing")]
    MissingEnv(String),
    #[error("environment variable {0} holds an invalid value")]
    InvalidEnv(String),
    #[error("failed to read campaign file")]
    CampaignIo(#[from] std::io::Error),
    #[error("failed to parse campaign file")]
    CampaignFormat(#[from] serde_yaml::Error),
    #[error("run tuple is malformed: {0}")]
    InvalidRunTuple(String),
}

/// Process-wide settings resolved from the environment exactly once at
/// startup and passed to whoever needs them.
#[derive(Clone, Debug)]
pub struct Environment {
    /// home directory, root of the installed instrumentation tool variants
    pub home: PathBuf,
    /// rank of this worker within a pre-sliced trial list
    pub rank: Option<u32>,
}

impl Environment {
    pub fn from_env() -> Result<Self, ConfigErrors> {
        let home = env::var("HOME")
            .map(PathBuf::from)
            .map_err(|_| ConfigErrors::MissingEnv("HOME".to_owned()))?;

        let rank = match env::var("SLURM_PROCID") {
            Ok(value) => Some(
                value
                    .parse()
                    .map_err(|_| ConfigErrors::InvalidEnv("SLURM_PROCID".to_owned()))?,
            ),
            Err(_) => None,
        };

        debug!(home = ?home, rank, "Resolved environment");

        Ok(Self { home, rank })
    }

    /// `LD_LIBRARY_PATH` override selecting an installed tool variant
    pub fn ld_library_path(&self, tool: Option<&str>) -> String {
        let base = self.home.join("usr/local/lib");

        match tool {
            Some(tool) => format!(
                "{}:{}",
                self.home.join(format!("usr/local/{tool}/lib")).display(),
                base.display()
            ),
            None => base.display().to_string(),
        }
    }
}

/// load the campaign trial list emitted by the enumeration layer
pub fn load_campaign(path: &Path) -> Result<Vec<TrialSpec>, ConfigErrors> {
    let file = File::open(path)?;

    Ok(serde_yaml::from_reader(file)?)
}

/// Decode the repeated `-r` tuples of a submission script into
/// rank-tagged trials: `rank trial_dir timeout command cleanup`, with
/// command and cleanup as whitespace-joined argv strings.
pub fn parse_run_tuples(args: &[String]) -> Result<Vec<(u32, TrialSpec)>, ConfigErrors> {
    if args.len() % 5 != 0 {
        return Err(ConfigErrors::InvalidRunTuple(format!(
            "expected groups of 5 values, got {}",
            args.len()
        )));
    }

    args.chunks(5)
        .map(|tuple| {
            let rank = tuple[0]
                .parse()
                .map_err(|_| ConfigErrors::InvalidRunTuple(format!("bad rank '{}'", tuple[0])))?;
            let timeout = tuple[2].parse().map_err(|_| {
                ConfigErrors::InvalidRunTuple(format!("bad timeout '{}'", tuple[2]))
            })?;

            let command: Vec<String> = tuple[3].split_whitespace().map(str::to_owned).collect();
            if command.is_empty() {
                return Err(ConfigErrors::InvalidRunTuple(format!(
                    "empty command for {}",
                    tuple[1]
                )));
            }
            let cleanup = tuple[4].split_whitespace().map(str::to_owned).collect();

            Ok((
                rank,
                TrialSpec {
                    trial_dir: PathBuf::from(&tuple[1]),
                    command,
                    cleanup,
                    timeout,
                    estimate: 0.0,
                },
            ))
        })
        .collect()
}
