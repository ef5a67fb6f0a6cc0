//! Asynchronous job waiter.
//!
//! Long running operations return a job handle instead of finishing in the
//! request. [`wait_for_job`] polls the handle until the job reaches a
//! terminal state or the timeout elapses. The poll itself is a closure, so
//! the same loop serves REST (`cluster/jobs/{uuid}`) and ZAPI (`job-get`).

use crate::error::{Error, Result, ZAPI_NOT_FOUND};
use crate::types::{FeatureFlags, RestResponse};
use crate::zapi::{ZapiElement, ZapiResponse};
use declarative::{CancelToken, Clock, JobHandle, JobOutcome};
use serde_json::Value;
use std::time::Duration;

/// Fields requested when polling a REST job.
pub const REST_JOB_FIELDS: &str = "state,message,code,error";

/// Polling behaviour of the job waiter.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitConfig {
    /// Delay before the second poll.
    pub interval: Duration,
    /// Multiplier applied to the delay after each poll.
    pub backoff_factor: f64,
    /// Upper bound for a single delay.
    pub max_interval: Duration,
    /// Treat a job that is still missing at the timeout as successful.
    pub ignore_missing_job: bool,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            backoff_factor: 1.0,
            max_interval: Duration::from_secs(60),
            ignore_missing_job: true,
        }
    }
}

impl WaitConfig {
    /// Config derived from the feature flags of a run.
    #[must_use]
    pub fn from_flags(flags: &FeatureFlags) -> Self {
        Self {
            interval: Duration::from_secs(flags.job_poll_interval.max(1)),
            ignore_missing_job: flags.ignore_job_404,
            ..Self::default()
        }
    }

    /// Delay after the given poll (0-indexed).
    #[must_use]
    pub fn delay_for_poll(&self, poll: u32) -> Duration {
        let delay = self.interval.as_secs_f64() * self.backoff_factor.powi(poll.min(i32::MAX as u32) as i32);
        Duration::from_secs_f64(delay.min(self.max_interval.as_secs_f64()))
    }
}

/// State of a job as seen by one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPoll {
    /// Queued or running, with the job's progress message.
    Running(Option<String>),
    /// Finished; carries a warning when the job reported one.
    Success(Option<String>),
    /// Finished with an error message.
    Failure(String),
    /// The cluster does not know the job (yet).
    Missing,
}

/// Poll `job` until it is terminal or `timeout` elapses.
///
/// The first poll is immediate. A poll error ends the wait, connection
/// errors included; only a missing job is polled again. A job that is
/// missing on the last poll before the timeout is reported as a success
/// with an "ignoring job status" warning when
/// [`WaitConfig::ignore_missing_job`] is set.
pub fn wait_for_job<F>(
    config: &WaitConfig,
    clock: &dyn Clock,
    cancel: &CancelToken,
    job: &JobHandle,
    timeout: Duration,
    mut poll: F,
) -> Result<JobOutcome>
where
    F: FnMut(&JobHandle) -> Result<JobPoll>,
{
    let start = clock.now();
    let mut polls: u32 = 0;
    let mut missing = false;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        polls += 1;

        match poll(job) {
            Ok(JobPoll::Success(warning)) => {
                log::debug!("Job {} succeeded after {polls} poll(s)", job.id);
                return Ok(JobOutcome::Success {
                    warnings: warning.into_iter().collect(),
                });
            }
            Ok(JobPoll::Failure(message)) => {
                log::debug!("Job {} failed: {message}", job.id);
                return Ok(JobOutcome::Failure { message });
            }
            Ok(JobPoll::Running(message)) => {
                missing = false;
                log::trace!("Job {} running: {}", job.id, message.unwrap_or_default());
            }
            Ok(JobPoll::Missing) => {
                missing = true;
                log::debug!("Job {} not found yet", job.id);
            }
            Err(e) => {
                log::debug!("Polling job {} failed: {e}", job.id);
                return Err(e);
            }
        }

        let elapsed = clock.now().saturating_duration_since(start);
        if elapsed >= timeout {
            break;
        }
        let delay = config.delay_for_poll(polls - 1).min(timeout - elapsed);
        if !cancel.sleep(clock, delay) {
            return Err(Error::Cancelled);
        }
    }

    if missing && config.ignore_missing_job {
        let warning = format!(
            "ignoring job status, assuming success: job {} was not found after {}s",
            job.id,
            timeout.as_secs()
        );
        log::warn!("{warning}");
        return Ok(JobOutcome::Success {
            warnings: vec![warning],
        });
    }
    Ok(JobOutcome::Timeout)
}

/// Path polled for a REST job.
#[must_use]
pub fn rest_job_path(job: &JobHandle) -> String {
    match &job.link {
        Some(link) => {
            let link = link.trim_start_matches('/');
            link.strip_prefix("api/").unwrap_or(link).to_string()
        }
        None => format!("cluster/jobs/{}", job.id),
    }
}

/// Classify the response to `GET cluster/jobs/{uuid}`.
pub fn rest_job_status(response: RestResponse) -> Result<JobPoll> {
    if response.status == 404 {
        return Ok(JobPoll::Missing);
    }
    let response = response.into_result()?;
    let body = response.body.unwrap_or(Value::Null);
    let text = |name: &str| body.get(name).and_then(Value::as_str).map(str::to_string);
    let message = text("message");

    match text("state").as_deref() {
        Some("success") => {
            let code = body.get("code").and_then(Value::as_i64).unwrap_or(0);
            Ok(JobPoll::Success(if code == 0 {
                None
            } else {
                Some(format!(
                    "job finished with code {code}: {}",
                    message.unwrap_or_default()
                ))
            }))
        }
        Some("failure") => Ok(JobPoll::Failure(
            message
                .or_else(|| body.pointer("/error/message").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| "job failed without a message".into()),
        )),
        Some("queued" | "running" | "paused") => Ok(JobPoll::Running(message)),
        Some(other) => {
            log::debug!("Unknown job state '{other}', treating as running");
            Ok(JobPoll::Running(message))
        }
        None => Err(Error::InvalidResponse("job response has no state".into())),
    }
}

/// `job-get` request for a ZAPI job id.
#[must_use]
pub fn zapi_job_request(job: &JobHandle) -> ZapiElement {
    ZapiElement::new("job-get").child_text("job-id", &job.id)
}

/// Classify the response to `job-get`.
pub fn zapi_job_status(response: ZapiResponse) -> Result<JobPoll> {
    if matches!(&response.error, Some((code, _)) if code == ZAPI_NOT_FOUND) {
        return Ok(JobPoll::Missing);
    }
    let results = response.into_result("job-get")?;
    let info = results
        .path(&["attributes", "job-info"])
        .ok_or_else(|| Error::InvalidResponse("job-get returned no job-info".into()))?;
    let completion = info.text("job-completion").map(str::to_string);

    match info.text("job-state") {
        Some("success") => Ok(JobPoll::Success(None)),
        Some("failure" | "error") => Ok(JobPoll::Failure(
            info.text("job-failure-reason")
                .map(str::to_string)
                .or(completion)
                .unwrap_or_else(|| "job failed without a message".into()),
        )),
        Some(_) => Ok(JobPoll::Running(completion)),
        None => Err(Error::InvalidResponse("job-get returned no job-state".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use declarative::ManualClock;
    use serde_json::json;
    use std::collections::VecDeque;

    fn scripted(polls: Vec<Result<JobPoll>>) -> (impl FnMut(&JobHandle) -> Result<JobPoll>, std::rc::Rc<std::cell::Cell<u32>>) {
        let count = std::rc::Rc::new(std::cell::Cell::new(0));
        let seen = count.clone();
        let mut queue: VecDeque<_> = polls.into();
        let poll = move |_: &JobHandle| {
            seen.set(seen.get() + 1);
            if queue.len() > 1 {
                queue.pop_front().unwrap_or(Ok(JobPoll::Missing))
            } else {
                match queue.front() {
                    Some(Ok(p)) => Ok(p.clone()),
                    _ => Err(Error::unreachable("mock", "down")),
                }
            }
        };
        (poll, count)
    }

    fn wait(polls: Vec<Result<JobPoll>>, timeout: u64) -> (Result<JobOutcome>, u32, Duration) {
        let clock = ManualClock::new();
        let (poll, count) = scripted(polls);
        let outcome = wait_for_job(
            &WaitConfig::default(),
            &clock,
            &CancelToken::new(),
            &JobHandle::new("j1"),
            Duration::from_secs(timeout),
            poll,
        );
        (outcome, count.get(), clock.elapsed())
    }

    #[test]
    fn test_running_running_success_polls_three_times() {
        let (outcome, polls, elapsed) = wait(
            vec![Ok(JobPoll::Running(None)), Ok(JobPoll::Running(None)), Ok(JobPoll::Success(None))],
            180,
        );
        assert_eq!(outcome.unwrap(), JobOutcome::Success { warnings: vec![] });
        assert_eq!(polls, 3);
        assert_eq!(elapsed, Duration::from_secs(10));
    }

    #[test]
    fn test_missing_then_success_has_no_warning() {
        let (outcome, polls, _) = wait(
            vec![Ok(JobPoll::Missing), Ok(JobPoll::Missing), Ok(JobPoll::Success(None))],
            180,
        );
        assert_eq!(outcome.unwrap(), JobOutcome::Success { warnings: vec![] });
        assert_eq!(polls, 3);
    }

    #[test]
    fn test_missing_until_timeout_is_ignored() {
        let (outcome, _, elapsed) = wait(vec![Ok(JobPoll::Missing)], 30);
        match outcome.unwrap() {
            JobOutcome::Success { warnings } => {
                assert_eq!(warnings.len(), 1);
                assert!(warnings[0].starts_with("ignoring job status"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(elapsed, Duration::from_secs(30));
    }

    #[test]
    fn test_missing_until_timeout_without_flag_times_out() {
        let clock = ManualClock::new();
        let (poll, _) = scripted(vec![Ok(JobPoll::Missing)]);
        let config = WaitConfig {
            ignore_missing_job: false,
            ..WaitConfig::default()
        };
        let outcome = wait_for_job(
            &config,
            &clock,
            &CancelToken::new(),
            &JobHandle::new("j1"),
            Duration::from_secs(20),
            poll,
        );
        assert_eq!(outcome.unwrap(), JobOutcome::Timeout);
    }

    #[test]
    fn test_running_until_timeout() {
        let (outcome, polls, elapsed) = wait(vec![Ok(JobPoll::Running(None))], 12);
        assert_eq!(outcome.unwrap(), JobOutcome::Timeout);
        // t=0, 5, 10, 12
        assert_eq!(polls, 4);
        assert_eq!(elapsed, Duration::from_secs(12));
    }

    #[test]
    fn test_failure_is_terminal() {
        let (outcome, polls, _) = wait(
            vec![Ok(JobPoll::Running(None)), Ok(JobPoll::Failure("disk full".into()))],
            180,
        );
        assert_eq!(
            outcome.unwrap(),
            JobOutcome::Failure {
                message: "disk full".into()
            }
        );
        assert_eq!(polls, 2);
    }

    #[test]
    fn test_unreachable_ends_the_wait() {
        let (outcome, polls, elapsed) = wait(
            vec![Err(Error::unreachable("mock", "reset")), Ok(JobPoll::Success(None))],
            180,
        );
        assert!(matches!(outcome, Err(Error::Unreachable { .. })));
        assert_eq!(polls, 1);
        assert_eq!(elapsed, Duration::ZERO);

        let (outcome, polls, _) = wait(
            vec![Ok(JobPoll::Running(None)), Err(Error::unreachable("mock", "down"))],
            180,
        );
        assert!(matches!(outcome, Err(Error::Unreachable { .. })));
        assert_eq!(polls, 2);
    }

    #[test]
    fn test_non_retryable_error_propagates() {
        let (outcome, polls, _) = wait(vec![Err(Error::rest(500, None, "boom", None)), Ok(JobPoll::Success(None))], 180);
        assert!(outcome.is_err());
        assert_eq!(polls, 1);
    }

    #[test]
    fn test_cancelled_before_poll() {
        let clock = ManualClock::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let (poll, count) = scripted(vec![Ok(JobPoll::Running(None))]);
        let outcome = wait_for_job(
            &WaitConfig::default(),
            &clock,
            &cancel,
            &JobHandle::new("j1"),
            Duration::from_secs(60),
            poll,
        );
        assert!(matches!(outcome, Err(Error::Cancelled)));
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn test_delay_backoff_is_capped() {
        let config = WaitConfig {
            interval: Duration::from_secs(5),
            backoff_factor: 2.0,
            max_interval: Duration::from_secs(30),
            ..WaitConfig::default()
        };
        assert_eq!(config.delay_for_poll(0), Duration::from_secs(5));
        assert_eq!(config.delay_for_poll(2), Duration::from_secs(20));
        assert_eq!(config.delay_for_poll(5), Duration::from_secs(30));
    }

    #[test]
    fn test_from_flags() {
        let flags = FeatureFlags {
            job_poll_interval: 10,
            ignore_job_404: false,
            ..FeatureFlags::default()
        };
        let config = WaitConfig::from_flags(&flags);
        assert_eq!(config.interval, Duration::from_secs(10));
        assert!(!config.ignore_missing_job);
    }

    #[test]
    fn test_rest_job_path() {
        assert_eq!(rest_job_path(&JobHandle::new("u1")), "cluster/jobs/u1");
        assert_eq!(
            rest_job_path(&JobHandle::new("u1").with_link("/api/cluster/jobs/u1")),
            "cluster/jobs/u1"
        );
    }

    #[test]
    fn test_rest_job_status() {
        let poll = |body| rest_job_status(RestResponse::ok(body)).unwrap();
        assert_eq!(poll(json!({"state": "running", "message": "50%"})), JobPoll::Running(Some("50%".into())));
        assert_eq!(poll(json!({"state": "success", "code": 0})), JobPoll::Success(None));
        assert!(matches!(poll(json!({"state": "success", "code": 7, "message": "partial"})), JobPoll::Success(Some(_))));
        assert_eq!(
            poll(json!({"state": "failure", "message": "no space"})),
            JobPoll::Failure("no space".into())
        );
        assert_eq!(
            rest_job_status(RestResponse::error(404, "4", "entry doesn't exist")).unwrap(),
            JobPoll::Missing
        );
        assert!(rest_job_status(RestResponse::error(500, "", "boom")).is_err());
    }

    #[test]
    fn test_zapi_job_status() {
        let info = |state: &str| {
            ZapiResponse::passed(vec![ZapiElement::new("attributes").child(
                ZapiElement::new("job-info")
                    .child_text("job-state", state)
                    .child_text("job-completion", "done")
                    .child_text("job-failure-reason", "aggregate offline"),
            )])
        };
        assert_eq!(zapi_job_status(info("running")).unwrap(), JobPoll::Running(Some("done".into())));
        assert_eq!(zapi_job_status(info("success")).unwrap(), JobPoll::Success(None));
        assert_eq!(
            zapi_job_status(info("failure")).unwrap(),
            JobPoll::Failure("aggregate offline".into())
        );
        assert_eq!(
            zapi_job_status(ZapiResponse::failed(ZAPI_NOT_FOUND, "job not found")).unwrap(),
            JobPoll::Missing
        );
        assert_eq!(zapi_job_request(&JobHandle::new("42")).text("job-id"), Some("42"));
    }
}
