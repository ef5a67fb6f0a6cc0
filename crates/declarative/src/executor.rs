//! Execution engine - the apply loop
//!
//! fetch -> plan -> (unless check mode) run steps -> wait for jobs ->
//! (optionally) re-fetch and validate -> report.

use crate::diff::decide;
use crate::error::Error;
use crate::planner::{plan, rename_source};
use crate::resource::{EngineSession, Resource, Steps};
use crate::types::{
    ApplyOptions, Completion, Decision, DecisionSummary, JobOutcome, Record, Report, Scope, ValidatePolicy,
};
use std::fmt;

/// A failed run, with whatever had already happened
#[derive(Debug)]
pub struct Failure {
    pub error: Error,
    /// Whether an earlier step had already altered the cluster
    pub changed: bool,
    pub warnings: Vec<String>,
    pub decision: Option<DecisionSummary>,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

fn failure<S: EngineSession>(session: &mut S, error: Error, changed: bool, decision: Option<&DecisionSummary>) -> Failure {
    Failure {
        error,
        changed,
        warnings: session.take_warnings(),
        decision: decision.cloned(),
    }
}

/// Reconcile one resource against the cluster
pub fn reconcile<R: Resource>(resource: &R, session: &mut R::Session, opts: &ApplyOptions) -> Result<Report, Failure> {
    let desired = resource.desired();
    let schema = resource.schema();
    let identity = resource.identity();

    if let Err(e) = check_preconditions(resource) {
        return Err(failure(session, e, false, None));
    }

    log::debug!("Reconciling {identity}");

    let current = match resource.fetch(session, &desired.name) {
        Ok(record) => record,
        Err(e) => return Err(failure(session, Error::step(format!("fetch {identity}"), e), false, None)),
    };
    let from = match rename_source(desired) {
        Some(from_name) => match resource.fetch(session, from_name) {
            Ok(record) => record,
            Err(e) => {
                let step = format!("fetch {} '{from_name}'", identity.kind);
                return Err(failure(session, Error::step(step, e), false, None));
            }
        },
        None => None,
    };

    let plan = match plan(desired, &schema, current, from) {
        Ok(plan) => plan,
        Err(e) => return Err(failure(session, e, false, None)),
    };
    let summary = DecisionSummary::new(&plan.decision, desired);
    log::debug!("{identity}: decision {}", summary.action);

    if plan.is_noop() {
        return Ok(Report {
            changed: false,
            decision: summary,
            warnings: session.take_warnings(),
            record: plan.target,
        });
    }

    if opts.check_mode {
        log::info!("{identity}: would {} (check mode)", summary.action);
        return Ok(Report {
            changed: true,
            decision: summary,
            warnings: session.take_warnings(),
            record: plan.target,
        });
    }

    if resource.requires_uuid(session)
        && let Some(target) = &plan.target
        && target.uuid.is_none()
    {
        let e = Error::Internal(format!("{identity} has no uuid"));
        return Err(failure(session, e, false, Some(&summary)));
    }

    // After a rename, follow-up steps address the resource by its new name
    let renamed = plan.target.as_ref().map(|t| Record {
        name: desired.name.clone(),
        ..t.clone()
    });
    let steps = match build_steps(resource, session, &plan.decision, plan.target.as_ref(), renamed.as_ref()) {
        Ok(steps) => steps,
        Err(e) => return Err(failure(session, e, false, Some(&summary))),
    };

    let cancel = session.cancel_token();
    let mut changed = false;
    let mut background = false;

    for step in steps {
        let name = step.name.clone();
        if cancel.is_cancelled() {
            return Err(failure(session, Error::Cancelled { step: name }, changed, Some(&summary)));
        }
        log::debug!("{identity}: {name}");

        match step.run(session) {
            Ok(Completion::Done) => changed = true,
            Ok(Completion::AlreadyConverged) => log::debug!("{identity}: {name} already converged"),
            Ok(Completion::Pending(job)) => {
                changed = true;
                if !opts.wait_for_completion {
                    session.warn(format!(
                        "{name}: process is still running in the background (job {})",
                        job.id
                    ));
                    background = true;
                    continue;
                }
                match session.await_job(&job, opts.job_timeout) {
                    Ok(JobOutcome::Success { warnings }) => {
                        for warning in warnings {
                            session.warn(warning);
                        }
                    }
                    Ok(JobOutcome::Failure { message }) => {
                        let e = Error::JobFailed { step: name, message };
                        return Err(failure(session, e, changed, Some(&summary)));
                    }
                    Ok(JobOutcome::Timeout) if opts.job_timeout_is_warning => {
                        session.warn(format!(
                            "{name}: job {} did not finish within {}s, continuing",
                            job.id,
                            opts.job_timeout.as_secs()
                        ));
                        background = true;
                    }
                    Ok(JobOutcome::Timeout) => {
                        let e = Error::JobTimeout {
                            step: name,
                            job: job.id,
                            seconds: opts.job_timeout.as_secs(),
                        };
                        return Err(failure(session, e, changed, Some(&summary)));
                    }
                    Err(e) => return Err(failure(session, Error::step(name, e), changed, Some(&summary))),
                }
            }
            Err(e) => return Err(failure(session, Error::step(name, e), changed, Some(&summary))),
        }
    }

    let mut record = match plan.decision {
        Decision::Delete => None,
        Decision::Rename { .. } => renamed,
        _ => plan.target,
    };

    if changed && !background && opts.validate != ValidatePolicy::Ignore {
        let after = match resource.fetch(session, &desired.name) {
            Ok(after) => after,
            Err(e) => {
                let e = Error::step(format!("validate {identity}"), e);
                return Err(failure(session, e, changed, Some(&summary)));
            }
        };
        let recheck = decide(after.as_ref().map(|r| &r.attributes), desired, &schema);
        if !recheck.is_none() {
            let keys = recheck
                .modify_set()
                .map(|m| m.keys().cloned().collect::<Vec<_>>().join(", "))
                .unwrap_or_else(|| recheck.action().to_string());
            let e = Error::ValidationFailed {
                resource: identity.to_string(),
                action: summary.action.to_string(),
                keys,
            };
            if opts.validate == ValidatePolicy::Error {
                return Err(failure(session, e, changed, Some(&summary)));
            }
            log::warn!("{e}");
            session.warn(e.to_string());
        }
        record = after;
    }

    Ok(Report {
        changed,
        decision: summary,
        warnings: session.take_warnings(),
        record,
    })
}

fn check_preconditions<R: Resource>(resource: &R) -> Result<(), Error> {
    let desired = resource.desired();
    let identity = resource.identity();
    resource.schema().validate(&desired.attributes)?;

    if let Scope::Vserver(vserver) = &identity.scope
        && vserver.trim().is_empty()
    {
        return Err(Error::Internal(format!("{} requires a vserver", identity.kind)));
    }
    if desired.name.trim().is_empty() {
        return Err(Error::Internal(format!("{} requires a name", identity.kind)));
    }
    if let Some(from) = rename_source(desired)
        && !resource.supports_rename()
    {
        return Err(Error::RenameUnsupported {
            kind: identity.kind,
            from: from.to_string(),
        });
    }
    Ok(())
}

fn build_steps<'a, R: Resource>(
    resource: &'a R,
    session: &R::Session,
    decision: &'a Decision,
    target: Option<&'a Record>,
    renamed: Option<&'a Record>,
) -> Result<Steps<'a, R>, Error> {
    let missing = || Error::Internal(format!("{} has no current record to act on", resource.identity()));
    let steps = match decision {
        Decision::None => Vec::new(),
        Decision::Create => resource.create_steps(session),
        Decision::Delete => resource.delete_steps(session, target.ok_or_else(missing)?),
        Decision::Modify(modify) => resource.modify_steps(session, target.ok_or_else(missing)?, modify),
        Decision::Rename { modify, .. } => {
            let source = target.ok_or_else(missing)?;
            let mut steps = resource.rename_steps(session, source, &resource.desired().name);
            if !modify.is_empty() {
                steps.extend(resource.modify_steps(session, renamed.ok_or_else(missing)?, modify));
            }
            steps
        }
    };
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CancelToken;
    use crate::resource::Step;
    use crate::schema::{AttrSpec, Schema};
    use crate::types::{Desired, Identity, JobHandle};
    use crate::value::{Attr, Attributes};
    use std::collections::{BTreeMap, VecDeque};
    use std::io;
    use std::time::Duration;

    const SCHEMA: Schema = Schema::new("thing", &[AttrSpec::new("comment"), AttrSpec::new("tags")]);

    #[derive(Default)]
    struct FakeSession {
        store: BTreeMap<String, Record>,
        calls: Vec<String>,
        warnings: Vec<String>,
        cancel: CancelToken,
        jobs: VecDeque<JobOutcome>,
        fail_on: Option<&'static str>,
        next_uuid: u32,
    }

    impl FakeSession {
        fn call(&mut self, name: &str) -> io::Result<()> {
            self.calls.push(name.to_string());
            if self.fail_on == Some(name) {
                return Err(io::Error::other("rejected"));
            }
            Ok(())
        }

        fn with(mut self, record: Record) -> Self {
            self.store.insert(record.name.clone(), record);
            self
        }
    }

    impl EngineSession for FakeSession {
        type Error = io::Error;

        fn warn(&mut self, message: String) {
            self.warnings.push(message);
        }

        fn take_warnings(&mut self) -> Vec<String> {
            std::mem::take(&mut self.warnings)
        }

        fn cancel_token(&self) -> CancelToken {
            self.cancel.clone()
        }

        fn await_job(&mut self, job: &JobHandle, _timeout: Duration) -> io::Result<JobOutcome> {
            self.calls.push(format!("wait {}", job.id));
            Ok(self.jobs.pop_front().unwrap_or(JobOutcome::Success { warnings: vec![] }))
        }
    }

    #[derive(Default)]
    struct FakeThing {
        desired: Option<Desired>,
        rename: bool,
        asynchronous: bool,
        uuid: bool,
        ignore_modify: bool,
    }

    impl FakeThing {
        fn new(desired: Desired) -> Self {
            Self {
                desired: Some(desired),
                ..Self::default()
            }
        }
    }

    fn completion(asynchronous: bool) -> Completion {
        if asynchronous {
            Completion::Pending(JobHandle::new("42"))
        } else {
            Completion::Done
        }
    }

    impl Resource for FakeThing {
        type Session = FakeSession;
        type Error = io::Error;

        fn identity(&self) -> Identity {
            Identity::vserver("thing", "vs1", &self.desired().name)
        }

        fn schema(&self) -> Schema {
            SCHEMA
        }

        fn desired(&self) -> &Desired {
            self.desired.as_ref().unwrap()
        }

        fn fetch(&self, session: &mut FakeSession, name: &str) -> io::Result<Option<Record>> {
            session.calls.push(format!("get {name}"));
            Ok(session.store.get(name).cloned())
        }

        fn create_steps<'a>(&'a self, _session: &FakeSession) -> Steps<'a, Self> {
            let desired = self.desired();
            let mut steps = vec![Step::new("create thing", move |s: &mut FakeSession| {
                s.call("create thing")?;
                s.next_uuid += 1;
                let mut attrs = desired.attributes.clone();
                attrs.remove("tags");
                let record = Record::new(&desired.name, attrs).with_uuid(s.next_uuid.to_string());
                s.store.insert(desired.name.clone(), record);
                Ok(completion(self.asynchronous))
            })];
            if let Some(tags) = desired.attributes.get("tags") {
                steps.push(Step::new("add tags", move |s: &mut FakeSession| {
                    s.call("add tags")?;
                    if let Some(r) = s.store.get_mut(&desired.name) {
                        r.attributes.insert("tags".into(), tags.clone());
                    }
                    Ok(Completion::Done)
                }));
            }
            steps
        }

        fn delete_steps<'a>(&'a self, _session: &FakeSession, current: &'a Record) -> Steps<'a, Self> {
            vec![Step::new("delete thing", move |s: &mut FakeSession| {
                s.call("delete thing")?;
                s.store.remove(&current.name);
                Ok(completion(self.asynchronous))
            })]
        }

        fn modify_steps<'a>(&'a self, _session: &FakeSession, current: &'a Record, modify: &'a Attributes) -> Steps<'a, Self> {
            vec![Step::new("modify thing", move |s: &mut FakeSession| {
                s.call("modify thing")?;
                if self.ignore_modify {
                    return Ok(Completion::Done);
                }
                if let Some(r) = s.store.get_mut(&current.name) {
                    r.attributes.extend(modify.clone());
                }
                Ok(Completion::Done)
            })]
        }

        fn supports_rename(&self) -> bool {
            self.rename
        }

        fn rename_steps<'a>(&'a self, _session: &FakeSession, current: &'a Record, to: &'a str) -> Steps<'a, Self> {
            vec![Step::new("rename thing", move |s: &mut FakeSession| {
                s.call("rename thing")?;
                if let Some(mut r) = s.store.remove(&current.name) {
                    r.name = to.to_string();
                    s.store.insert(to.to_string(), r);
                }
                Ok(Completion::Done)
            })]
        }

        fn requires_uuid(&self, _session: &FakeSession) -> bool {
            self.uuid
        }
    }

    fn attrs(pairs: &[(&str, &str)]) -> Attributes {
        pairs.iter().map(|(k, v)| ((*k).to_string(), Attr::from(*v))).collect()
    }

    fn writes(session: &FakeSession) -> Vec<&str> {
        session
            .calls
            .iter()
            .map(String::as_str)
            .filter(|c| !c.starts_with("get "))
            .collect()
    }

    #[test]
    fn test_create_then_converged() {
        let thing = FakeThing::new(Desired::present("a", attrs(&[("comment", "hi")])));
        let mut session = FakeSession::default();

        let report = reconcile(&thing, &mut session, &ApplyOptions::default()).unwrap();
        assert!(report.changed);
        assert_eq!(report.decision.action.to_string(), "create");

        session.calls.clear();
        let report = reconcile(&thing, &mut session, &ApplyOptions::default()).unwrap();
        assert!(!report.changed);
        assert!(writes(&session).is_empty());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let thing = FakeThing::new(Desired::absent("a"));
        let mut session = FakeSession::default().with(Record::new("a", Attributes::new()));

        assert!(reconcile(&thing, &mut session, &ApplyOptions::default()).unwrap().changed);
        let report = reconcile(&thing, &mut session, &ApplyOptions::default()).unwrap();
        assert!(!report.changed);
        assert_eq!(writes(&session), vec!["delete thing"]);
    }

    #[test]
    fn test_check_mode_performs_no_writes() {
        let thing = FakeThing::new(Desired::present("a", attrs(&[("comment", "new")])));
        let mut session = FakeSession::default().with(Record::new("a", attrs(&[("comment", "old")])));
        let opts = ApplyOptions {
            check_mode: true,
            ..ApplyOptions::default()
        };

        let report = reconcile(&thing, &mut session, &opts).unwrap();
        assert!(report.changed);
        assert_eq!(report.decision.modify["comment"], "new");
        assert!(writes(&session).is_empty());
    }

    #[test]
    fn test_modify_only_supplied_keys() {
        let thing = FakeThing::new(Desired::present("a", attrs(&[("comment", "new")])));
        let mut session = FakeSession::default().with(Record::new("a", attrs(&[("comment", "old"), ("tags", "x")])));

        let report = reconcile(&thing, &mut session, &ApplyOptions::default()).unwrap();
        assert!(report.changed);
        assert_eq!(report.decision.modify.len(), 1);
        assert_eq!(writes(&session), vec!["modify thing"]);
    }

    #[test]
    fn test_rename_from_existing_source() {
        let mut thing = FakeThing::new(Desired::present("new", Attributes::new()).with_from_name("old"));
        thing.rename = true;
        let mut session = FakeSession::default().with(Record::new("old", Attributes::new()));

        let report = reconcile(&thing, &mut session, &ApplyOptions::default()).unwrap();
        assert!(report.changed);
        assert_eq!(writes(&session), vec!["rename thing"]);
        assert!(session.store.contains_key("new"));
        assert_eq!(report.record.unwrap().name, "new");
    }

    #[test]
    fn test_rename_then_modify_addresses_new_name() {
        let mut thing =
            FakeThing::new(Desired::present("new", attrs(&[("comment", "after")])).with_from_name("old"));
        thing.rename = true;
        let mut session = FakeSession::default().with(Record::new("old", attrs(&[("comment", "before")])));

        reconcile(&thing, &mut session, &ApplyOptions::default()).unwrap();
        assert_eq!(writes(&session), vec!["rename thing", "modify thing"]);
        assert_eq!(session.store["new"].attributes["comment"], Attr::from("after"));
    }

    #[test]
    fn test_rename_unsupported() {
        let thing = FakeThing::new(Desired::present("new", Attributes::new()).with_from_name("old"));
        let mut session = FakeSession::default();
        let err = reconcile(&thing, &mut session, &ApplyOptions::default()).unwrap_err();
        assert!(matches!(err.error, Error::RenameUnsupported { .. }));
        assert!(session.calls.is_empty());
    }

    #[test]
    fn test_partial_failure_names_step() {
        let thing = FakeThing::new(Desired::present("a", attrs(&[("tags", "t")])));
        let mut session = FakeSession {
            fail_on: Some("add tags"),
            ..FakeSession::default()
        };

        let err = reconcile(&thing, &mut session, &ApplyOptions::default()).unwrap_err();
        assert!(err.changed);
        assert_eq!(err.error.step_name(), Some("add tags"));
        assert_eq!(writes(&session), vec!["create thing", "add tags"]);
    }

    #[test]
    fn test_first_step_failure_stops_run() {
        let thing = FakeThing::new(Desired::present("a", attrs(&[("tags", "t")])));
        let mut session = FakeSession {
            fail_on: Some("create thing"),
            ..FakeSession::default()
        };

        let err = reconcile(&thing, &mut session, &ApplyOptions::default()).unwrap_err();
        assert!(!err.changed);
        assert_eq!(writes(&session), vec!["create thing"]);
        assert!(err.to_string().contains("create thing failed"));
    }

    #[test]
    fn test_job_waited_and_warnings_surface() {
        let mut thing = FakeThing::new(Desired::present("a", Attributes::new()));
        thing.asynchronous = true;
        let mut session = FakeSession::default();
        session.jobs.push_back(JobOutcome::Success {
            warnings: vec!["ignoring job status".into()],
        });

        let report = reconcile(&thing, &mut session, &ApplyOptions::default()).unwrap();
        assert_eq!(writes(&session), vec!["create thing", "wait 42"]);
        assert_eq!(report.warnings, vec!["ignoring job status".to_string()]);
    }

    #[test]
    fn test_job_failure() {
        let mut thing = FakeThing::new(Desired::present("a", Attributes::new()));
        thing.asynchronous = true;
        let mut session = FakeSession::default();
        session.jobs.push_back(JobOutcome::Failure {
            message: "aggregate full".into(),
        });

        let err = reconcile(&thing, &mut session, &ApplyOptions::default()).unwrap_err();
        assert!(matches!(err.error, Error::JobFailed { .. }));
        assert!(err.to_string().contains("aggregate full"));
    }

    #[test]
    fn test_job_timeout_error_or_warning() {
        let mut thing = FakeThing::new(Desired::present("a", Attributes::new()));
        thing.asynchronous = true;

        let mut session = FakeSession::default();
        session.jobs.push_back(JobOutcome::Timeout);
        let err = reconcile(&thing, &mut session, &ApplyOptions::default()).unwrap_err();
        assert!(matches!(err.error, Error::JobTimeout { seconds: 180, .. }));
        assert!(err.changed);

        let mut session = FakeSession::default();
        session.jobs.push_back(JobOutcome::Timeout);
        let opts = ApplyOptions {
            job_timeout_is_warning: true,
            ..ApplyOptions::default()
        };
        let report = reconcile(&thing, &mut session, &opts).unwrap();
        assert!(report.changed);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn test_no_wait_warns_background() {
        let mut thing = FakeThing::new(Desired::present("a", Attributes::new()));
        thing.asynchronous = true;
        let mut session = FakeSession::default();
        let opts = ApplyOptions {
            wait_for_completion: false,
            validate: ValidatePolicy::Error,
            ..ApplyOptions::default()
        };

        let report = reconcile(&thing, &mut session, &opts).unwrap();
        assert!(report.changed);
        assert!(report.warnings[0].contains("process is still running in the background"));
        assert!(!session.calls.iter().any(|c| c.starts_with("wait")));
    }

    #[test]
    fn test_validation_policies() {
        let mut thing = FakeThing::new(Desired::present("a", attrs(&[("comment", "new")])));
        thing.ignore_modify = true;
        let seed = || FakeSession::default().with(Record::new("a", attrs(&[("comment", "old")])));

        let mut session = seed();
        let report = reconcile(&thing, &mut session, &ApplyOptions::default()).unwrap();
        assert!(report.warnings.is_empty());

        let mut session = seed();
        let opts = ApplyOptions {
            validate: ValidatePolicy::Warn,
            ..ApplyOptions::default()
        };
        let report = reconcile(&thing, &mut session, &opts).unwrap();
        assert!(report.warnings[0].contains("comment"));

        let mut session = seed();
        let opts = ApplyOptions {
            validate: ValidatePolicy::Error,
            ..ApplyOptions::default()
        };
        let err = reconcile(&thing, &mut session, &opts).unwrap_err();
        assert!(matches!(err.error, Error::ValidationFailed { .. }));
    }

    #[test]
    fn test_cancelled_before_first_step() {
        let thing = FakeThing::new(Desired::present("a", Attributes::new()));
        let mut session = FakeSession::default();
        session.cancel.cancel();

        let err = reconcile(&thing, &mut session, &ApplyOptions::default()).unwrap_err();
        assert!(matches!(err.error, Error::Cancelled { .. }));
        assert!(writes(&session).is_empty());
    }

    #[test]
    fn test_already_converged_step_reports_unchanged() {
        struct Converged(FakeThing);
        impl Resource for Converged {
            type Session = FakeSession;
            type Error = io::Error;
            fn identity(&self) -> Identity {
                self.0.identity()
            }
            fn schema(&self) -> Schema {
                SCHEMA
            }
            fn desired(&self) -> &Desired {
                self.0.desired()
            }
            fn fetch(&self, session: &mut FakeSession, name: &str) -> io::Result<Option<Record>> {
                self.0.fetch(session, name)
            }
            fn create_steps<'a>(&'a self, _session: &FakeSession) -> Steps<'a, Self> {
                vec![Step::new("create thing", |_: &mut FakeSession| Ok(Completion::AlreadyConverged))]
            }
            fn delete_steps<'a>(&'a self, _session: &FakeSession, _current: &'a Record) -> Steps<'a, Self> {
                Vec::new()
            }
            fn modify_steps<'a>(&'a self, _: &FakeSession, _: &'a Record, _: &'a Attributes) -> Steps<'a, Self> {
                Vec::new()
            }
        }

        let thing = Converged(FakeThing::new(Desired::present("a", Attributes::new())));
        let report = reconcile(&thing, &mut FakeSession::default(), &ApplyOptions::default()).unwrap();
        assert!(!report.changed);
    }

    #[test]
    fn test_missing_uuid_is_internal_error() {
        let mut thing = FakeThing::new(Desired::absent("a"));
        thing.uuid = true;
        let mut session = FakeSession::default().with(Record::new("a", Attributes::new()));

        let err = reconcile(&thing, &mut session, &ApplyOptions::default()).unwrap_err();
        assert!(matches!(err.error, Error::Internal(_)));
        assert!(writes(&session).is_empty());
    }

    #[test]
    fn test_undeclared_attribute_rejected() {
        let thing = FakeThing::new(Desired::present("a", attrs(&[("colour", "red")])));
        let err = reconcile(&thing, &mut FakeSession::default(), &ApplyOptions::default()).unwrap_err();
        assert!(matches!(err.error, Error::Internal(_)));
    }
}
