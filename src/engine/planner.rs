//! Playbook runs: task selection and the worker pool

use anyhow::{Context as AnyhowContext, Result};
use declarative::{CancelToken, Error, Failure, ProgressCallback, Report};
use rayon::prelude::*;

use super::envelope::ResultEnvelope;
use crate::config::Params;

/// Task selector parsed from `--target`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub kind: Option<String>,
    pub name: Option<String>,
}

/// Parse a target like `volume` or `volume.vol1`
pub fn parse_target(target: &str) -> TaskFilter {
    match target.split_once('.') {
        Some((kind, name)) => TaskFilter {
            kind: Some(kind.to_string()).filter(|k| !k.is_empty()),
            name: Some(name.to_string()).filter(|n| !n.is_empty()),
        },
        None => TaskFilter {
            kind: Some(target.to_string()),
            name: None,
        },
    }
}

/// Check if a task matches the filter
pub fn matches_filter(params: &Params, filter: &TaskFilter) -> bool {
    if let Some(kind) = &filter.kind
        && params.kind.as_str() != kind
    {
        return false;
    }

    if let Some(name) = &filter.name
        && !params.label().contains(name.as_str())
    {
        return false;
    }

    true
}

#[derive(Debug, Clone)]
pub struct PlaybookOptions {
    /// Number of tasks run in parallel
    pub jobs: usize,
    /// Raise the cancellation signal after the first failure
    pub fail_fast: bool,
}

impl Default for PlaybookOptions {
    fn default() -> Self {
        Self {
            jobs: 4,
            fail_fast: false,
        }
    }
}

/// Summary of a playbook run
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PlaybookSummary {
    pub changed: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl PlaybookSummary {
    pub fn from_envelopes(envelopes: &[ResultEnvelope]) -> Self {
        let mut summary = Self::default();
        for envelope in envelopes {
            match (envelope.failed, envelope.changed) {
                (true, _) => summary.failed += 1,
                (false, true) => summary.changed += 1,
                (false, false) => summary.unchanged += 1,
            }
        }
        summary
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Run every task as an independent invocation
///
/// Results come back in task order. Each invocation gets its own session;
/// only the cancellation signal is shared.
pub fn run_playbook<F>(
    tasks: &[Params],
    opts: &PlaybookOptions,
    progress: &dyn ProgressCallback,
    invoke: F,
) -> Result<Vec<ResultEnvelope>>
where
    F: Fn(&Params, &CancelToken) -> Result<Report, Failure> + Sync,
{
    let cancel = CancelToken::new();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(opts.jobs.max(1))
        .build()
        .context("Failed to create task thread pool")?;

    let envelopes = pool.install(|| {
        tasks
            .par_iter()
            .enumerate()
            .map(|(index, params)| {
                let label = params.label();
                progress.on_task_start(index, &label);

                let outcome = if cancel.is_cancelled() {
                    Err(Failure {
                        error: Error::Cancelled {
                            step: label.clone(),
                        },
                        changed: false,
                        warnings: Vec::new(),
                        decision: None,
                    })
                } else {
                    invoke(params, &cancel)
                };

                match &outcome {
                    Ok(report) => progress.on_task_complete(index, &label, Ok(report)),
                    Err(failure) => {
                        if opts.fail_fast {
                            cancel.cancel();
                        }
                        progress.on_task_complete(index, &label, Err(&failure.to_string()));
                    }
                }
                ResultEnvelope::from(outcome).with_task(label)
            })
            .collect()
    });

    Ok(envelopes)
}
