//! SAN initiator groups.

use declarative::{
    Attr, AttrSpec, Attributes, CaseRule, Completion, Desired, Identity, Intent, Record, Resource, Schema, Step,
    Steps, list_delta,
};
use ontapkit::{Error, Idempotency, Session, ZapiElement};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{names_at, put, str_at, uuid_of};

const KIND: &str = "igroup";

const IDEMPOTENCY: Idempotency = Idempotency::LENIENT;

const SCHEMA: Schema = Schema::new(
    KIND,
    &[
        AttrSpec::new("initiator_group_type"),
        AttrSpec::new("initiator_names"),
        AttrSpec::new("os_type"),
    ],
);

const REST_FIELDS: &str = "uuid,name,os_type,protocol,initiators.name";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IgroupParams {
    pub name: String,
    pub vserver: String,
    pub from_name: Option<String>,
    pub os_type: Option<String>,
    /// `iscsi`, `fcp` or `mixed`
    pub initiator_group_type: Option<String>,
    pub initiator_names: Option<Vec<String>>,
}

#[derive(Debug)]
pub struct Igroup {
    params: IgroupParams,
    desired: Desired,
}

impl Igroup {
    pub fn new(params: IgroupParams, intent: Intent) -> Self {
        let mut attributes = Attributes::new();
        put(&mut attributes, "initiator_group_type", params.initiator_group_type.clone());
        put(&mut attributes, "initiator_names", params.initiator_names.clone());
        put(&mut attributes, "os_type", params.os_type.clone());
        let desired = super::desired(intent, &params.name, params.from_name.as_deref(), attributes);
        Self { params, desired }
    }

    fn vserver(&self) -> &str {
        &self.params.vserver
    }

    fn initiators(&self) -> Vec<String> {
        self.params.initiator_names.clone().unwrap_or_default()
    }

    fn rest_path(current: &Record) -> ontapkit::Result<String> {
        Ok(format!("protocols/san/igroups/{}", uuid_of(current)?))
    }

    fn zapi_call(&self, session: &mut Session, request: &ZapiElement) -> ontapkit::Result<Completion> {
        session.zapi(Some(self.vserver()), request).map(|_| Completion::Done)
    }
}

fn record_from_rest(name: &str, value: &Value) -> Record {
    let mut attrs = Attributes::new();
    put(&mut attrs, "initiator_group_type", str_at(value, "/protocol"));
    put(
        &mut attrs,
        "initiator_names",
        Some(names_at(value, "/initiators", "name").unwrap_or_default()),
    );
    put(&mut attrs, "os_type", str_at(value, "/os_type"));

    let record = Record::new(name, attrs);
    match str_at(value, "/uuid") {
        Some(uuid) => record.with_uuid(uuid),
        None => record,
    }
}

fn record_from_zapi(name: &str, group: &ZapiElement) -> Record {
    let initiators: Vec<String> = group
        .get("initiators")
        .map(|list| {
            list.children
                .iter()
                .filter_map(|info| info.text("initiator-name").map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let mut attrs = Attributes::new();
    put(&mut attrs, "initiator_group_type", group.text("initiator-group-type"));
    put(&mut attrs, "initiator_names", Some(initiators));
    put(&mut attrs, "os_type", group.text("initiator-group-os-type"));

    let record = Record::new(name, attrs);
    match group.text("initiator-group-uuid") {
        Some(uuid) => record.with_uuid(uuid),
        None => record,
    }
}

impl Resource for Igroup {
    type Session = Session;
    type Error = Error;

    fn identity(&self) -> Identity {
        Identity::vserver(KIND, self.vserver(), &self.params.name)
    }

    fn schema(&self) -> Schema {
        SCHEMA
    }

    fn desired(&self) -> &Desired {
        &self.desired
    }

    fn fetch(&self, session: &mut Session, name: &str) -> ontapkit::Result<Option<Record>> {
        if session.use_rest() {
            let query = [("name", name), ("svm.name", self.vserver()), ("fields", REST_FIELDS)];
            let record = session.rest_get_one("protocols/san/igroups", &query)?;
            return Ok(record.map(|r| record_from_rest(name, &r)));
        }

        let query = ZapiElement::new("initiator-group-info")
            .child_text("initiator-group-name", name)
            .child_text("vserver", self.vserver());
        let mut records = session.zapi_get_iter(Some(self.vserver()), "igroup-get-iter", query)?;
        match records.len() {
            0 => Ok(None),
            1 => Ok(records.pop().map(|r| record_from_zapi(name, &r))),
            n => Err(Error::InvalidResponse(format!("expected at most one igroup '{name}', got {n}"))),
        }
    }

    fn create_steps<'a>(&'a self, session: &Session) -> Steps<'a, Self> {
        if session.use_rest() {
            return vec![Step::new("create igroup", move |s: &mut Session| {
                let mut body = json!({
                    "name": self.params.name,
                    "svm": { "name": self.vserver() },
                });
                if let Some(os_type) = &self.params.os_type {
                    body["os_type"] = json!(os_type);
                }
                if let Some(protocol) = &self.params.initiator_group_type {
                    body["protocol"] = json!(protocol);
                }
                let initiators = self.initiators();
                if !initiators.is_empty() {
                    body["initiators"] = initiators.iter().map(|name| json!({ "name": name })).collect();
                }
                IDEMPOTENCY.on_create(s.rest_post("protocols/san/igroups", body))
            })];
        }

        let mut steps: Steps<'a, Self> = vec![Step::new("create igroup", move |s: &mut Session| {
            let request = ZapiElement::new("igroup-create")
                .child_text("initiator-group-name", &self.params.name)
                .child_opt("initiator-group-type", self.params.initiator_group_type.as_deref())
                .child_opt("os-type", self.params.os_type.as_deref());
            IDEMPOTENCY.on_create(self.zapi_call(s, &request))
        })];
        for initiator in self.initiators() {
            steps.push(Step::new(format!("add initiator {initiator}"), move |s: &mut Session| {
                let request = ZapiElement::new("igroup-add")
                    .child_text("initiator-group-name", &self.params.name)
                    .child_text("initiator", &initiator);
                self.zapi_call(s, &request)
            }));
        }
        steps
    }

    fn delete_steps<'a>(&'a self, session: &Session, current: &'a Record) -> Steps<'a, Self> {
        let rest = session.use_rest();
        vec![Step::new("delete igroup", move |s: &mut Session| {
            let result = if rest {
                Self::rest_path(current).and_then(|path| s.rest_delete(&path))
            } else {
                let request = ZapiElement::new("igroup-destroy")
                    .child_text("initiator-group-name", &current.name)
                    .child_text("force", false);
                self.zapi_call(s, &request)
            };
            IDEMPOTENCY.on_delete(result)
        })]
    }

    fn modify_steps<'a>(
        &'a self,
        session: &Session,
        current: &'a Record,
        modify: &'a Attributes,
    ) -> Steps<'a, Self> {
        let rest = session.use_rest();
        let mut steps: Steps<'a, Self> = Vec::new();

        if let Some(wanted) = modify.get("initiator_group_type") {
            let have = current
                .attributes
                .get("initiator_group_type")
                .map(Attr::to_string)
                .unwrap_or_default();
            steps.push(Step::new("check igroup type", move |_: &mut Session| {
                Err(Error::Other(format!(
                    "initiator_group_type cannot be changed from '{have}' to '{wanted}'; delete and recreate the igroup"
                )))
            }));
            return steps;
        }

        if let Some(wanted) = modify.get("initiator_names") {
            let have = current
                .attributes
                .get("initiator_names")
                .and_then(Attr::as_list)
                .unwrap_or_default();
            let (additions, removals) = list_delta(have, wanted.as_list().unwrap_or_default(), CaseRule::Insensitive);
            let additions: Vec<String> = additions.iter().map(Attr::to_string).collect();
            let removals: Vec<String> = removals.iter().map(Attr::to_string).collect();

            if rest && !additions.is_empty() {
                steps.push(Step::new("add initiators", move |s: &mut Session| {
                    let records: Vec<Value> = additions.iter().map(|name| json!({ "name": name })).collect();
                    let path = format!("{}/initiators", Self::rest_path(current)?);
                    s.rest_post(&path, json!({ "records": records }))
                }));
            } else {
                for initiator in additions {
                    steps.push(Step::new(format!("add initiator {initiator}"), move |s: &mut Session| {
                        let request = ZapiElement::new("igroup-add")
                            .child_text("initiator-group-name", &current.name)
                            .child_text("initiator", &initiator);
                        self.zapi_call(s, &request)
                    }));
                }
            }

            for initiator in removals {
                steps.push(Step::new(format!("remove initiator {initiator}"), move |s: &mut Session| {
                    if rest {
                        let path = format!("{}/initiators/{initiator}", Self::rest_path(current)?);
                        return s.rest_delete(&path);
                    }
                    let request = ZapiElement::new("igroup-remove")
                        .child_text("initiator-group-name", &current.name)
                        .child_text("initiator", &initiator)
                        .child_text("force", false);
                    self.zapi_call(s, &request)
                }));
            }
        }

        if let Some(os_type) = modify.get("os_type") {
            steps.push(Step::new("set igroup os type", move |s: &mut Session| {
                if rest {
                    return s.rest_patch(&Self::rest_path(current)?, json!({ "os_type": os_type.to_json() }));
                }
                let request = ZapiElement::new("igroup-set-os-type")
                    .child_text("initiator-group-name", &current.name)
                    .child_text("os-type", os_type);
                self.zapi_call(s, &request)
            }));
        }

        steps
    }

    fn supports_rename(&self) -> bool {
        true
    }

    fn rename_steps<'a>(&'a self, session: &Session, current: &'a Record, to: &'a str) -> Steps<'a, Self> {
        let rest = session.use_rest();
        vec![Step::new("rename igroup", move |s: &mut Session| {
            if rest {
                return s.rest_patch(&Self::rest_path(current)?, json!({ "name": to }));
            }
            let request = ZapiElement::new("igroup-rename")
                .child_text("initiator-group-name", &current.name)
                .child_text("initiator-group-new-name", to);
            self.zapi_call(s, &request)
        })]
    }

    fn requires_uuid(&self, session: &Session) -> bool {
        session.use_rest()
    }
}
