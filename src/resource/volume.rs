//! FlexVol volumes.
//!
//! REST writes address the volume by uuid and may return jobs; a ZAPI
//! aggregate move returns a job id that is polled through `job-get`.

use anyhow::{Result, bail};
use declarative::{Attr, AttrSpec, Attributes, Completion, Desired, Identity, Intent, Record, Resource, Schema, Step, Steps};
use ontapkit::{Error, Idempotency, ProtocolRequirements, Session, ZapiElement};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::{insert_at, put, str_at, uuid_of};

const KIND: &str = "volume";

const IDEMPOTENCY: Idempotency = Idempotency::LENIENT;

const SCHEMA: Schema = Schema::new(
    KIND,
    &[
        AttrSpec::new("aggregate_name"),
        AttrSpec::new("atime_update"),
        AttrSpec::new("comment"),
        AttrSpec::new("is_online"),
        AttrSpec::new("junction_path"),
        AttrSpec::new("nvfail_enabled"),
        AttrSpec::new("size"),
        AttrSpec::new("snapshot_policy"),
        AttrSpec::new("tiering_minimum_cooling_days"),
    ],
);

const REST_FIELDS: &str = "uuid,name,aggregates.name,size,nas.path,comment,snapshot_policy.name,state,tiering.min_cooling_days";

/// Attribute name to REST body field
const REST_BODY: &[(&str, &str)] = &[
    ("comment", "comment"),
    ("junction_path", "nas.path"),
    ("size", "size"),
    ("snapshot_policy", "snapshot_policy.name"),
    ("tiering_minimum_cooling_days", "tiering.min_cooling_days"),
];

/// ZAPI `volume-attributes` sections and the attributes each one carries
const ZAPI_SECTIONS: &[(&str, &[(&str, &str)])] = &[
    ("volume-id-attributes", &[("comment", "comment")]),
    ("volume-snapshot-attributes", &[("snapshot_policy", "snapshot-policy")]),
    (
        "volume-comp-aggr-attributes",
        &[("tiering_minimum_cooling_days", "tiering-minimum-cooling-days")],
    ),
    ("volume-performance-attributes", &[("atime_update", "is-atime-update-enabled")]),
    ("volume-state-attributes", &[("nvfail_enabled", "is-nvfail-enabled")]),
];

/// Attributes written by the options step of a modify
const OPTION_KEYS: &[&str] = &[
    "atime_update",
    "comment",
    "nvfail_enabled",
    "snapshot_policy",
    "tiering_minimum_cooling_days",
];

/// Unit of the `size` parameter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeUnit {
    Bytes,
    B,
    Kb,
    Mb,
    #[default]
    Gb,
    Tb,
    Pb,
}

impl SizeUnit {
    pub fn multiplier(self) -> i64 {
        let exponent = match self {
            Self::Bytes | Self::B => 0,
            Self::Kb => 1,
            Self::Mb => 2,
            Self::Gb => 3,
            Self::Tb => 4,
            Self::Pb => 5,
        };
        1024_i64.pow(exponent)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VolumeParams {
    pub name: String,
    pub vserver: String,
    pub from_name: Option<String>,
    pub aggregate_name: Option<String>,
    pub size: Option<i64>,
    #[serde(default)]
    pub size_unit: SizeUnit,
    pub junction_path: Option<String>,
    pub comment: Option<String>,
    pub snapshot_policy: Option<String>,
    pub is_online: Option<bool>,
    pub tiering_minimum_cooling_days: Option<i64>,
    pub atime_update: Option<bool>,
    pub nvfail_enabled: Option<bool>,
}

#[derive(Debug)]
pub struct Volume {
    params: VolumeParams,
    desired: Desired,
}

impl Volume {
    pub fn new(params: VolumeParams, intent: Intent) -> Result<Self> {
        let size = match params.size {
            Some(size) if size < 0 => bail!("size must not be negative, got {size}"),
            Some(size) => match size.checked_mul(params.size_unit.multiplier()) {
                Some(bytes) => Some(bytes),
                None => bail!("size {size} {:?} does not fit in 64 bits", params.size_unit),
            },
            None => None,
        };

        let mut attributes = Attributes::new();
        put(&mut attributes, "aggregate_name", params.aggregate_name.clone());
        put(&mut attributes, "atime_update", params.atime_update);
        put(&mut attributes, "comment", params.comment.clone());
        put(&mut attributes, "is_online", params.is_online);
        put(&mut attributes, "junction_path", params.junction_path.clone());
        put(&mut attributes, "nvfail_enabled", params.nvfail_enabled);
        put(&mut attributes, "size", size);
        put(&mut attributes, "snapshot_policy", params.snapshot_policy.clone());
        put(&mut attributes, "tiering_minimum_cooling_days", params.tiering_minimum_cooling_days);

        let desired = super::desired(intent, &params.name, params.from_name.as_deref(), attributes);
        Ok(Self { params, desired })
    }

    /// REST support of the supplied options
    pub fn requirements(&self) -> ProtocolRequirements {
        let mut requirements = ProtocolRequirements::new();
        if self.params.atime_update.is_some() {
            requirements = requirements.unsupported("atime_update");
        }
        if self.params.nvfail_enabled.is_some() {
            requirements = requirements.unsupported("nvfail_enabled");
        }
        if self.params.tiering_minimum_cooling_days.is_some() {
            requirements = requirements.requires("tiering_minimum_cooling_days", (9, 8, 0));
        }
        requirements
    }

    fn vserver(&self) -> &str {
        &self.params.vserver
    }

    fn aggregate(&self) -> ontapkit::Result<&str> {
        self.desired
            .attributes
            .get("aggregate_name")
            .and_then(Attr::as_str)
            .ok_or_else(|| Error::Config("aggregate_name is required to create a volume".into()))
    }

    fn rest_create(&self, session: &mut Session) -> ontapkit::Result<Completion> {
        let attrs = &self.desired.attributes;
        let mut body = rest_body(attrs);
        body.insert("name".into(), json!(self.params.name));
        body.insert("svm".into(), json!({ "name": self.vserver() }));
        body.insert("aggregates".into(), json!([{ "name": self.aggregate()? }]));
        if let Some(online) = attrs.get("is_online").and_then(Attr::as_bool) {
            body.insert("state".into(), json!(state_name(online)));
        }
        IDEMPOTENCY.on_create(session.rest_post("storage/volumes", Value::Object(body)))
    }

    fn zapi_create(&self, session: &mut Session) -> ontapkit::Result<Completion> {
        let attrs = &self.desired.attributes;
        let junction = attrs
            .get("junction_path")
            .and_then(Attr::as_str)
            .filter(|path| !path.is_empty());
        let request = ZapiElement::new("volume-create")
            .child_text("volume", &self.params.name)
            .child_text("containing-aggr-name", self.aggregate()?)
            .child_opt("size", attrs.get("size"))
            .child_opt("junction-path", junction)
            .child_opt("volume-comment", attrs.get("comment"))
            .child_opt("snapshot-policy", attrs.get("snapshot_policy"))
            .child_opt(
                "volume-state",
                attrs.get("is_online").and_then(Attr::as_bool).map(state_name),
            );
        IDEMPOTENCY.on_create(session.zapi(Some(self.vserver()), &request).map(|_| Completion::Done))
    }

    /// `volume-modify-iter` for one volume; per-volume failures are errors
    fn zapi_modify(&self, session: &mut Session, name: &str, attrs: &Attributes) -> ontapkit::Result<Completion> {
        let request = ZapiElement::new("volume-modify-iter")
            .child(ZapiElement::new("query").child(volume_id(name, self.vserver())))
            .child(ZapiElement::new("attributes").child(zapi_attributes(attrs)));
        let results = session.zapi(None, &request)?;
        if results.path_i64(&["num-failed"]).unwrap_or(0) > 0 {
            let info = results.path(&["failure-list", "volume-modify-iter-info"]);
            let code = info.and_then(|i| i.text("error-code")).unwrap_or("unknown");
            let reason = info.and_then(|i| i.text("error-message")).unwrap_or("no reason given");
            return Err(Error::zapi("volume-modify-iter", code, reason));
        }
        Ok(Completion::Done)
    }
}

fn state_name(online: bool) -> &'static str {
    if online { "online" } else { "offline" }
}

fn rest_body(attrs: &Attributes) -> Map<String, Value> {
    let mut body = Map::new();
    for (key, field) in REST_BODY {
        if let Some(value) = attrs.get(*key) {
            insert_at(&mut body, field, value.to_json());
        }
    }
    body
}

fn rest_patch(session: &mut Session, current: &Record, body: Value) -> ontapkit::Result<Completion> {
    let uuid = uuid_of(current)?;
    session.rest_patch(&format!("storage/volumes/{uuid}"), body)
}

fn volume_id(name: &str, vserver: &str) -> ZapiElement {
    ZapiElement::new("volume-attributes").child(
        ZapiElement::new("volume-id-attributes")
            .child_text("name", name)
            .child_text("owning-vserver-name", vserver),
    )
}

fn zapi_attributes(attrs: &Attributes) -> ZapiElement {
    let mut volume = ZapiElement::new("volume-attributes");
    for (section, fields) in ZAPI_SECTIONS {
        let mut element = ZapiElement::new(*section);
        for (key, field) in *fields {
            if let Some(value) = attrs.get(*key) {
                element.add_child(ZapiElement::leaf(*field, value));
            }
        }
        if !element.children.is_empty() {
            volume.add_child(element);
        }
    }
    volume
}

fn record_from_rest(name: &str, value: &Value) -> Record {
    let mut attrs = Attributes::new();
    put(&mut attrs, "aggregate_name", str_at(value, "/aggregates/0/name"));
    put(&mut attrs, "comment", Some(str_at(value, "/comment").unwrap_or_default()));
    put(&mut attrs, "is_online", str_at(value, "/state").map(|s| s == "online"));
    put(&mut attrs, "junction_path", Some(str_at(value, "/nas/path").unwrap_or_default()));
    put(&mut attrs, "size", value.get("size").and_then(Value::as_i64));
    put(&mut attrs, "snapshot_policy", str_at(value, "/snapshot_policy/name"));
    put(
        &mut attrs,
        "tiering_minimum_cooling_days",
        value.pointer("/tiering/min_cooling_days").and_then(Value::as_i64),
    );

    let record = Record::new(name, attrs);
    match str_at(value, "/uuid") {
        Some(uuid) => record.with_uuid(uuid),
        None => record,
    }
}

fn record_from_zapi(name: &str, volume: &ZapiElement) -> Record {
    let id = |field: &str| volume.path_text(&["volume-id-attributes", field]);
    let mut attrs = Attributes::new();
    put(&mut attrs, "aggregate_name", id("containing-aggregate-name"));
    put(
        &mut attrs,
        "atime_update",
        volume.path_bool(&["volume-performance-attributes", "is-atime-update-enabled"]),
    );
    put(&mut attrs, "comment", Some(id("comment").unwrap_or_default()));
    put(
        &mut attrs,
        "is_online",
        volume
            .path_text(&["volume-state-attributes", "state"])
            .map(|s| s == "online"),
    );
    put(&mut attrs, "junction_path", Some(id("junction-path").unwrap_or_default()));
    put(
        &mut attrs,
        "nvfail_enabled",
        volume.path_bool(&["volume-state-attributes", "is-nvfail-enabled"]),
    );
    put(&mut attrs, "size", volume.path_i64(&["volume-space-attributes", "size"]));
    put(
        &mut attrs,
        "snapshot_policy",
        volume.path_text(&["volume-snapshot-attributes", "snapshot-policy"]),
    );
    put(
        &mut attrs,
        "tiering_minimum_cooling_days",
        volume.path_i64(&["volume-comp-aggr-attributes", "tiering-minimum-cooling-days"]),
    );

    let record = Record::new(name, attrs);
    match id("instance-uuid") {
        Some(uuid) => record.with_uuid(uuid),
        None => record,
    }
}

impl Resource for Volume {
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
            let record = session.rest_get_one("storage/volumes", &query)?;
            return Ok(record.map(|r| record_from_rest(name, &r)));
        }

        let mut records = session.zapi_get_iter(None, "volume-get-iter", volume_id(name, self.vserver()))?;
        match records.len() {
            0 => Ok(None),
            1 => Ok(records.pop().map(|r| record_from_zapi(name, &r))),
            n => Err(Error::InvalidResponse(format!("expected at most one volume '{name}', got {n}"))),
        }
    }

    fn create_steps<'a>(&'a self, session: &Session) -> Steps<'a, Self> {
        if session.use_rest() {
            return vec![Step::new("create volume", move |s: &mut Session| self.rest_create(s))];
        }

        let mut steps: Steps<'a, Self> = vec![Step::new("create volume", move |s: &mut Session| self.zapi_create(s))];
        // volume-create has no field for these
        let options: Attributes = self
            .desired
            .attributes
            .iter()
            .filter(|(key, _)| ["atime_update", "nvfail_enabled", "tiering_minimum_cooling_days"].contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if !options.is_empty() {
            steps.push(Step::new("set volume options", move |s: &mut Session| {
                self.zapi_modify(s, &self.params.name, &options)
            }));
        }
        steps
    }

    fn delete_steps<'a>(&'a self, session: &Session, current: &'a Record) -> Steps<'a, Self> {
        let rest = session.use_rest();
        vec![Step::new("delete volume", move |s: &mut Session| {
            let result = if rest {
                let uuid = uuid_of(current)?;
                s.rest_delete(&format!("storage/volumes/{uuid}"))
            } else {
                let request = ZapiElement::new("volume-destroy")
                    .child_text("name", &current.name)
                    .child_text("unmount-and-offline", true);
                s.zapi(Some(self.vserver()), &request).map(|_| Completion::Done)
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
        let vserver = self.vserver();
        let mut steps: Steps<'a, Self> = Vec::new();

        if let Some(online) = modify.get("is_online").and_then(Attr::as_bool) {
            let name = if online { "bring volume online" } else { "take volume offline" };
            steps.push(Step::new(name, move |s: &mut Session| {
                if rest {
                    return rest_patch(s, current, json!({ "state": state_name(online) }));
                }
                let api = if online { "volume-online" } else { "volume-offline" };
                let request = ZapiElement::new(api).child_text("name", &current.name);
                s.zapi(Some(vserver), &request).map(|_| Completion::Done)
            }));
        }

        if let Some(size) = modify.get("size") {
            steps.push(Step::new("resize volume", move |s: &mut Session| {
                if rest {
                    return rest_patch(s, current, json!({ "size": size.to_json() }));
                }
                let request = ZapiElement::new("volume-size")
                    .child_text("volume", &current.name)
                    .child_text("new-size", size);
                s.zapi(Some(vserver), &request).map(|_| Completion::Done)
            }));
        }

        let options: Attributes = modify
            .iter()
            .filter(|(key, _)| OPTION_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if !options.is_empty() {
            steps.push(Step::new("modify volume attributes", move |s: &mut Session| {
                if rest {
                    return rest_patch(s, current, Value::Object(rest_body(&options)));
                }
                self.zapi_modify(s, &current.name, &options)
            }));
        }

        if let Some(path) = modify.get("junction_path").and_then(Attr::as_str) {
            if rest {
                let name = if path.is_empty() { "unmount volume" } else { "mount volume" };
                steps.push(Step::new(name, move |s: &mut Session| {
                    rest_patch(s, current, json!({ "nas": { "path": path } }))
                }));
            } else {
                let mounted = current
                    .attributes
                    .get("junction_path")
                    .and_then(Attr::as_str)
                    .is_some_and(|p| !p.is_empty());
                if mounted {
                    steps.push(Step::new("unmount volume", move |s: &mut Session| {
                        let request = ZapiElement::new("volume-unmount")
                            .child_text("volume-name", &current.name)
                            .child_text("force", false);
                        s.zapi(Some(vserver), &request).map(|_| Completion::Done)
                    }));
                }
                if !path.is_empty() {
                    steps.push(Step::new("mount volume", move |s: &mut Session| {
                        let request = ZapiElement::new("volume-mount")
                            .child_text("volume-name", &current.name)
                            .child_text("junction-path", path);
                        s.zapi(Some(vserver), &request).map(|_| Completion::Done)
                    }));
                }
            }
        }

        if let Some(aggregate) = modify.get("aggregate_name").and_then(Attr::as_str) {
            steps.push(Step::new("move volume", move |s: &mut Session| {
                if rest {
                    let body = json!({ "movement": { "destination_aggregate": { "name": aggregate } } });
                    return rest_patch(s, current, body);
                }
                let request = ZapiElement::new("volume-move-start")
                    .child_text("source-volume", &current.name)
                    .child_text("dest-aggr", aggregate)
                    .child_text("vserver", vserver);
                s.zapi_write(None, &request)
            }));
        }

        steps
    }

    fn supports_rename(&self) -> bool {
        true
    }

    fn rename_steps<'a>(&'a self, session: &Session, current: &'a Record, to: &'a str) -> Steps<'a, Self> {
        let rest = session.use_rest();
        vec![Step::new("rename volume", move |s: &mut Session| {
            if rest {
                return rest_patch(s, current, json!({ "name": to }));
            }
            let request = ZapiElement::new("volume-rename")
                .child_text("volume", &current.name)
                .child_text("new-volume-name", to);
            s.zapi(Some(self.vserver()), &request).map(|_| Completion::Done)
        })]
    }

    fn requires_uuid(&self, session: &Session) -> bool {
        session.use_rest()
    }
}
