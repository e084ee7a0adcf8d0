//! Build parameters.
//!
//! This module defines the `BuildContext` struct containing all the
//! parameters of a state system build. It is meant to be built from command
//! line parameters:
//! ```no_run
//! use statehist::{cli::Cli, context::BuildContext};
//! use clap::Parser;
//!
//! let args = Cli::parse();
//! let ctx = BuildContext::from(&args);
//! ```
//! Default values of the command line are defined in the `cli` module.

use std::path::{Path, PathBuf};

use crate::cli::{AnalysisArgs, Cli};
use crate::provider::future::FutureFlushPolicy;
use crate::state::StateSystemConfig;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

/// Contains all build parameters
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Directory holding history files.
    pub history_dir: PathBuf,
    pub verbose: bool,
    /// If true, existing history files are ignored and overwritten.
    pub force_rebuild: bool,
    pub state_config: StateSystemConfig,
    pub flush_policy: FutureFlushPolicy,
    /// Capacity of the channel between the trace reader thread and the
    /// builder.
    pub channel_capacity: usize,
}

impl BuildContext {
    /// A context saving history files in `history_dir`, with default
    /// settings otherwise.
    pub fn new<P: AsRef<Path>>(history_dir: P) -> Self {
        Self {
            history_dir: history_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }
}

impl Default for BuildContext {
    fn default() -> Self {
        Self {
            history_dir: PathBuf::from("."),
            verbose: false,
            force_rebuild: false,
            state_config: StateSystemConfig::default(),
            flush_policy: FutureFlushPolicy::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl From<&AnalysisArgs> for BuildContext {
    fn from(args: &AnalysisArgs) -> Self {
        let history_dir = args.history_dir.clone().unwrap_or_else(|| {
            args.trace
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
        });

        Self {
            history_dir,
            verbose: false,
            force_rebuild: args.force,
            state_config: StateSystemConfig {
                query_policy: args.query_policy,
            },
            flush_policy: FutureFlushPolicy {
                pop: args.flush_pop,
                modify: args.flush_modify,
            },
            channel_capacity: args.channel_capacity.max(1),
        }
    }
}

impl From<&Cli> for BuildContext {
    fn from(cli: &Cli) -> Self {
        let ctx = cli.analysis_args().map(BuildContext::from).unwrap_or_default();

        Self {
            verbose: cli.verbose,
            ..ctx
        }
    }
}
