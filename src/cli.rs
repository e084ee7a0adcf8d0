//! Command line interface.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::context::DEFAULT_CHANNEL_CAPACITY;
use crate::provider::callstack::CallStackConfig;
use crate::provider::future::FlushAction;
use crate::state::BuildingQueryPolicy;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Print debug messages.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build the call-stack state system of a trace, or load it from its
    /// history file.
    Build {
        #[command(flatten)]
        analysis: AnalysisArgs,
    },
    /// Query the call-stack state system of a trace, building it if needed.
    Query {
        #[command(flatten)]
        analysis: AnalysisArgs,

        #[command(flatten)]
        query: QueryArgs,
    },
    /// List the history files of a directory.
    List {
        /// History directory.
        #[arg(default_value = ".")]
        dir: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
pub struct AnalysisArgs {
    /// JSON trace file: an array of events, one per line.
    pub trace: PathBuf,

    /// Where history files are saved. Defaults to the directory of the trace.
    #[arg(short = 'd', long)]
    pub history_dir: Option<PathBuf>,

    /// Rebuild the state system even if a history file exists.
    #[arg(short, long)]
    pub force: bool,

    /// End-of-trace handling of pending scheduled pops.
    #[arg(long, value_enum, default_value_t = FlushAction::Fire)]
    pub flush_pop: FlushAction,

    /// End-of-trace handling of pending scheduled modifications.
    #[arg(long, value_enum, default_value_t = FlushAction::FireWithinTrace)]
    pub flush_modify: FlushAction,

    /// Answer of non-blocking queries on states not built yet.
    #[arg(long, value_enum, default_value_t = BuildingQueryPolicy::Sentinel)]
    pub query_policy: BuildingQueryPolicy,

    /// Events buffered between the trace reader and the builder.
    #[arg(long, default_value_t = DEFAULT_CHANNEL_CAPACITY)]
    pub channel_capacity: usize,

    #[command(flatten)]
    pub callstack: CallStackArgs,
}

#[derive(Args, Debug, Clone)]
pub struct CallStackArgs {
    /// Function entry event.
    #[arg(long, default_value = "entry")]
    pub entry_event: String,

    /// Function exit event.
    #[arg(long, default_value = "exit")]
    pub exit_event: String,

    #[arg(long, default_value = "pid")]
    pub pid_field: String,

    #[arg(long, default_value = "tid")]
    pub tid_field: String,

    /// Field holding the function name.
    #[arg(long, default_value = "name")]
    pub name_field: String,

    /// Field holding the duration of a call, on entry events.
    #[arg(long, default_value = "duration")]
    pub duration_field: String,

    #[arg(long)]
    pub process_name_field: Option<String>,

    #[arg(long)]
    pub thread_name_field: Option<String>,
}

impl From<&CallStackArgs> for CallStackConfig {
    fn from(args: &CallStackArgs) -> Self {
        Self {
            entry_event: args.entry_event.clone(),
            exit_event: args.exit_event.clone(),
            pid_field: args.pid_field.clone(),
            tid_field: args.tid_field.clone(),
            name_field: args.name_field.clone(),
            duration_field: args.duration_field.clone(),
            process_name_field: args.process_name_field.clone(),
            thread_name_field: args.thread_name_field.clone(),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct QueryArgs {
    /// Attribute path, e.g. `Processes/1000/42/CallStack`. All attributes
    /// when omitted.
    #[arg(short, long)]
    pub path: Option<String>,

    /// Query time.
    #[arg(short, long)]
    pub time: u64,

    /// Turns the query into a range query from `time` to `end`.
    #[arg(short, long)]
    pub end: Option<u64>,

    /// Include the sub-attributes of `path`.
    #[arg(short, long)]
    pub recursive: bool,

    /// Print JSON instead of text.
    #[arg(long)]
    pub json: bool,
}

impl Cli {
    pub fn analysis_args(&self) -> Option<&AnalysisArgs> {
        match &self.command {
            Command::Build { analysis } | Command::Query { analysis, .. } => Some(analysis),
            Command::List { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, Parser};

    use super::{Cli, Command};
    use crate::provider::future::FlushAction;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_query_args() {
        let cli = Cli::try_parse_from([
            "statehist",
            "query",
            "trace.json",
            "--time",
            "42",
            "--path",
            "Processes/1/1/CallStack",
            "--flush-modify",
            "drop",
            "--entry-event",
            "func_entry",
        ])
        .unwrap();

        let args = cli.analysis_args().unwrap();
        assert_eq!(args.flush_modify, FlushAction::Drop);
        assert_eq!(args.flush_pop, FlushAction::Fire);
        assert_eq!(args.callstack.entry_event, "func_entry");

        match cli.command {
            Command::Query { query, .. } => {
                assert_eq!(query.time, 42);
                assert_eq!(query.end, None);
            }
            _ => panic!("expected a query command"),
        }
    }
}
