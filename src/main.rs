use std::{path::Path, sync::Arc};

use anyhow::{anyhow, Context, Error, Result};
use clap::Parser;
use serde::Serialize;
use statehist::{
    analysis::{AnalysisModule, ScheduleOutcome},
    cli::{AnalysisArgs, Cli, Command, QueryArgs},
    context::BuildContext,
    history::HistoryDirectory,
    provider::{
        callstack::{CallStackConfig, CallStackDefinition},
        dispatcher::BuildOutcome,
    },
    state::{StateInterval, StateSystem},
    trace::reader::TraceReader,
    utils::CancelToken,
    EventSource,
};

fn init_logger(verbose: bool) {
    let level = match verbose {
        true => "debug",
        false => "info",
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

/// Loads the call-stack state system of the trace, or builds it. SIGINT
/// cancels the build.
fn load_or_build(args: &AnalysisArgs, ctx: &BuildContext) -> Result<Arc<StateSystem>> {
    let cancel = CancelToken::new();
    signal_hook::flag::register(signal_hook::consts::SIGINT, cancel.flag())
        .context("Failed to register the SIGINT handler")?;

    let reader = TraceReader::new(&args.trace).with_capacity(ctx.channel_capacity);
    let definition = Arc::new(CallStackDefinition::new(CallStackConfig::from(
        &args.callstack,
    )));

    let mut module =
        AnalysisModule::new(definition, &reader.trace_info(), ctx)?.with_cancel_token(cancel);

    match module.schedule(reader)? {
        ScheduleOutcome::Loaded(path) => {
            eprintln!("Loaded '{}' from {}.", module.id(), path.display())
        }
        ScheduleOutcome::Built { outcome, saved } => {
            let stats = outcome.stats();

            eprintln!(
                "Processed {} events of '{}' ({} handled, {} skipped, {} failed).",
                stats.events,
                module.trace_name(),
                stats.handled,
                stats.skipped,
                stats.handler_errors
            );

            match (outcome, saved) {
                (_, Some(path)) => eprintln!("Results saved in {}.", path.display()),
                (BuildOutcome::Cancelled(_), None) => {
                    eprintln!("Build interrupted, the partial state system was not saved.")
                }
                (BuildOutcome::Completed(_), None) => {}
            }
        }
    }

    module
        .state_system()
        .ok_or_else(|| anyhow!("No state system for {}", args.trace.display()))
}

#[derive(Serialize)]
struct QueryRow<'a> {
    path: String,
    #[serde(flatten)]
    interval: &'a StateInterval,
}

fn query(ss: &StateSystem, args: &QueryArgs) -> Result<()> {
    let quarks = match &args.path {
        Some(path) => {
            let elements = path.split('/').filter(|e| !e.is_empty()).collect::<Vec<_>>();
            let quark = ss
                .opt_quark_absolute(&elements)
                .ok_or_else(|| anyhow!("No attribute {}", path))?;

            let mut quarks = vec![quark];
            if args.recursive {
                quarks.extend(ss.sub_attributes(Some(quark), true));
            }
            quarks
        }
        None => ss.sub_attributes(None, true),
    };

    let mut intervals = Vec::new();

    for quark in quarks {
        match args.end {
            Some(end) => intervals.extend(ss.query_range(quark, args.time, end)?),
            None => intervals.push(ss.query_single_state(args.time, quark)?),
        }
    }

    if args.json {
        let rows = intervals
            .iter()
            .map(|interval| QueryRow {
                path: ss.full_path_string(interval.quark),
                interval,
            })
            .collect::<Vec<_>>();

        serde_json::to_writer_pretty(std::io::stdout().lock(), &rows)?;
        println!();

        return Ok(());
    }

    for interval in intervals {
        let end = interval
            .end
            .map_or_else(|| String::from("..."), |e| e.to_string());

        println!(
            "{} [{}, {}) {}",
            ss.full_path_string(interval.quark),
            interval.start,
            end,
            interval.value
        );
    }

    Ok(())
}

fn list(dir: &Path) -> Result<()> {
    let histories = HistoryDirectory::new(dir)
        .histories()
        .with_context(|| format!("Failed to list {}", dir.display()))?;

    if histories.is_empty() {
        eprintln!("No history files in {}.", dir.display());
    }

    for (name, path) in histories {
        match HistoryDirectory::header(&path) {
            Ok(h) => println!(
                "{}\t{} v{}\t[{}, {}]\t{} attributes\t{} intervals\t{}",
                name.trace,
                name.analysis,
                h.provider_version,
                h.start,
                h.end,
                h.attribute_count,
                h.interval_count,
                h.created()
            ),
            Err(e) => println!("{}\t{}\tunreadable: {}", name.trace, name.analysis, e),
        }
    }

    Ok(())
}

fn main() -> Result<(), Error> {
    let opts = Cli::parse();
    let ctx = BuildContext::from(&opts);

    init_logger(ctx.verbose);

    match &opts.command {
        Command::Build { analysis } => {
            load_or_build(analysis, &ctx)?;
            Ok(())
        }
        Command::Query { analysis, query: q } => {
            let ss = load_or_build(analysis, &ctx)?;
            query(&ss, q)
        }
        Command::List { dir } => list(dir),
    }
}
