mod cli;
mod config;
mod engine;
mod resource;
mod ui;

use anyhow::{Context as AnyhowContext, Result};
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{ApplyArgs, Cli, Command, OutputFormat, ProbeArgs, RunArgs};
use declarative::CancelToken;
use engine::{PlaybookOptions, PlaybookSummary, ResultEnvelope};
use std::io;
use std::process::ExitCode;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
    };

    match cli.command {
        Command::Run(args) => run(&ctx, args),
        Command::Apply(args) => apply(&ctx, args),
        Command::Probe(args) => probe(args),
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "ontap-converge", &mut io::stdout());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn exit_code(failed: bool) -> ExitCode {
    if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("Could not serialize result")?);
    Ok(())
}

fn run(ctx: &Context, args: RunArgs) -> Result<ExitCode> {
    let mut params = config::load_params(&args.file)?;
    params.check_mode |= args.check;
    if params.check_mode && !ctx.quiet && args.format == OutputFormat::Text {
        ui::info("Check mode - no changes will be made");
    }

    let label = params.label();
    let envelope = ResultEnvelope::from(engine::run(&params, &CancelToken::new())).with_task(label);
    match args.format {
        OutputFormat::Json => print_json(&envelope)?,
        OutputFormat::Text => ui::envelope(&envelope),
    }
    Ok(exit_code(envelope.failed))
}

fn apply(ctx: &Context, args: ApplyArgs) -> Result<ExitCode> {
    let mut tasks = config::load_playbook(&args.playbook)?;
    if let Some(target) = &args.target {
        let filter = engine::parse_target(target);
        tasks.retain(|params| engine::matches_filter(params, &filter));
    }
    for params in &mut tasks {
        params.check_mode |= args.check;
    }

    let text = args.format == OutputFormat::Text;
    if tasks.is_empty() {
        if text {
            ui::dim("No tasks match");
        }
        return Ok(ExitCode::SUCCESS);
    }
    if text && !ctx.quiet {
        ui::header(&format!("Applying {} tasks from {}", tasks.len(), args.playbook.display()));
        if args.check {
            ui::info("Check mode - no changes will be made");
        }
    }

    let opts = PlaybookOptions {
        jobs: args.jobs,
        fail_fast: args.fail_fast,
    };
    let progress = ui::TaskProgress::new(tasks.len());
    let envelopes = engine::run_playbook(&tasks, &opts, &progress, engine::run)?;
    progress.finish();

    let summary = PlaybookSummary::from_envelopes(&envelopes);
    match args.format {
        OutputFormat::Json => print_json(&envelopes)?,
        OutputFormat::Text => {
            for envelope in &envelopes {
                if ctx.verbose > 0 || envelope.changed || envelope.failed || !envelope.warnings.is_empty() {
                    ui::envelope(envelope);
                }
            }
            ui::summary(&summary);
        }
    }
    Ok(exit_code(!summary.is_success()))
}

fn probe(args: ProbeArgs) -> Result<ExitCode> {
    let params = config::load_connection(&args.file)?;
    let report = engine::probe_cluster(&params).with_context(|| format!("Could not probe {}", params.connection.hostname))?;
    match args.format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Text => {
            ui::probe(&report);
            ui::success(&format!("Connected over {}", report.protocol));
        }
    }
    Ok(ExitCode::SUCCESS)
}
