//! CIFS (SMB) shares.
//!
//! REST addresses a share by the owning SVM's uuid and the share name, so
//! the record's uuid is the SVM uuid. Shares cannot be renamed.

use declarative::{AttrSpec, Attributes, Completion, Desired, Identity, Intent, Record, Resource, Schema, Step, Steps};
use ontapkit::{Error, Idempotency, ProtocolRequirements, Session, ZapiElement};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{put, str_at, uuid_of};

const KIND: &str = "cifs_share";

/// The share already existing under another path is not convergence
const IDEMPOTENCY: Idempotency = Idempotency::STRICT_CREATE;

const SCHEMA: Schema = Schema::new(
    KIND,
    &[
        AttrSpec::new("comment"),
        AttrSpec::new("offline_files"),
        AttrSpec::new("path"),
        AttrSpec::new("share_properties"),
        AttrSpec::new("symlink_properties"),
    ],
);

const REST_FIELDS: &str = "name,path,comment,offline_files,svm.uuid";

/// Attributes REST can write
const REST_KEYS: &[&str] = &["comment", "offline_files", "path"];

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CifsShareParams {
    pub name: String,
    pub vserver: String,
    /// Accepted so the engine can report that shares cannot be renamed
    pub from_name: Option<String>,
    pub path: Option<String>,
    pub comment: Option<String>,
    /// `none`, `manual`, `documents` or `programs`
    pub offline_files: Option<String>,
    pub share_properties: Option<Vec<String>>,
    pub symlink_properties: Option<Vec<String>>,
}

#[derive(Debug)]
pub struct CifsShare {
    params: CifsShareParams,
    desired: Desired,
}

impl CifsShare {
    pub fn new(params: CifsShareParams, intent: Intent) -> Self {
        let mut attributes = Attributes::new();
        put(&mut attributes, "comment", params.comment.clone());
        put(&mut attributes, "offline_files", params.offline_files.clone());
        put(&mut attributes, "path", params.path.clone());
        put(&mut attributes, "share_properties", params.share_properties.clone());
        put(&mut attributes, "symlink_properties", params.symlink_properties.clone());
        let desired = super::desired(intent, &params.name, params.from_name.as_deref(), attributes);
        Self { params, desired }
    }

    pub fn requirements(&self) -> ProtocolRequirements {
        let mut requirements = ProtocolRequirements::new();
        if self.params.share_properties.is_some() {
            requirements = requirements.unsupported("share_properties");
        }
        if self.params.symlink_properties.is_some() {
            requirements = requirements.unsupported("symlink_properties");
        }
        requirements
    }

    fn vserver(&self) -> &str {
        &self.params.vserver
    }

    fn rest_path(current: &Record) -> ontapkit::Result<String> {
        Ok(format!("protocols/cifs/shares/{}/{}", uuid_of(current)?, current.name))
    }
}

fn rest_body(attrs: &Attributes) -> Map<String, Value> {
    attrs
        .iter()
        .filter(|(key, _)| REST_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.to_json()))
        .collect()
}

/// Share fields of a `cifs-share-create` or `cifs-share-modify` request
fn zapi_fields(mut request: ZapiElement, attrs: &Attributes) -> ZapiElement {
    request = request
        .child_opt("path", attrs.get("path"))
        .child_opt("comment", attrs.get("comment"))
        .child_opt("offline-files-mode", attrs.get("offline_files"));
    if let Some(properties) = attrs.get("share_properties") {
        request = request.child_list("share-properties", "cifs-share-properties", properties.string_list());
    }
    if let Some(properties) = attrs.get("symlink_properties") {
        request = request.child_list(
            "symlink-properties",
            "cifs-share-symlink-properties",
            properties.string_list(),
        );
    }
    request
}

fn record_from_rest(name: &str, value: &Value) -> Record {
    let mut attrs = Attributes::new();
    put(&mut attrs, "comment", Some(str_at(value, "/comment").unwrap_or_default()));
    put(&mut attrs, "offline_files", str_at(value, "/offline_files"));
    put(&mut attrs, "path", str_at(value, "/path"));

    let record = Record::new(name, attrs);
    match str_at(value, "/svm/uuid") {
        Some(uuid) => record.with_uuid(uuid),
        None => record,
    }
}

fn record_from_zapi(name: &str, share: &ZapiElement) -> Record {
    let mut attrs = Attributes::new();
    put(&mut attrs, "comment", Some(share.text("comment").unwrap_or_default()));
    put(&mut attrs, "offline_files", share.text("offline-files-mode"));
    put(&mut attrs, "path", share.text("path"));
    put(&mut attrs, "share_properties", Some(share.list_text("share-properties")));
    put(&mut attrs, "symlink_properties", Some(share.list_text("symlink-properties")));
    Record::new(name, attrs)
}

impl Resource for CifsShare {
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
            let record = session.rest_get_one("protocols/cifs/shares", &query)?;
            return Ok(record.map(|r| record_from_rest(name, &r)));
        }

        let query = ZapiElement::new("cifs-share")
            .child_text("share-name", name)
            .child_text("vserver", self.vserver());
        let mut records = session.zapi_get_iter(Some(self.vserver()), "cifs-share-get-iter", query)?;
        match records.len() {
            0 => Ok(None),
            1 => Ok(records.pop().map(|r| record_from_zapi(name, &r))),
            n => Err(Error::InvalidResponse(format!("expected at most one share '{name}', got {n}"))),
        }
    }

    fn create_steps<'a>(&'a self, session: &Session) -> Steps<'a, Self> {
        let rest = session.use_rest();
        vec![Step::new("create share", move |s: &mut Session| {
            let attrs = &self.desired.attributes;
            let result = if rest {
                let mut body = rest_body(attrs);
                body.insert("name".into(), Value::from(self.params.name.as_str()));
                body.insert("svm".into(), serde_json::json!({ "name": self.vserver() }));
                s.rest_post("protocols/cifs/shares", Value::Object(body))
            } else {
                let request = ZapiElement::new("cifs-share-create").child_text("share-name", &self.params.name);
                s.zapi(Some(self.vserver()), &zapi_fields(request, attrs))
                    .map(|_| Completion::Done)
            };
            IDEMPOTENCY.on_create(result)
        })]
    }

    fn delete_steps<'a>(&'a self, session: &Session, current: &'a Record) -> Steps<'a, Self> {
        let rest = session.use_rest();
        vec![Step::new("delete share", move |s: &mut Session| {
            let result = if rest {
                Self::rest_path(current).and_then(|path| s.rest_delete(&path))
            } else {
                let request = ZapiElement::new("cifs-share-delete").child_text("share-name", &current.name);
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
        vec![Step::new("modify share", move |s: &mut Session| {
            if rest {
                return s.rest_patch(&Self::rest_path(current)?, Value::Object(rest_body(modify)));
            }
            let request = ZapiElement::new("cifs-share-modify").child_text("share-name", &current.name);
            s.zapi(Some(self.vserver()), &zapi_fields(request, modify))
                .map(|_| Completion::Done)
        })]
    }

    fn requires_uuid(&self, session: &Session) -> bool {
        session.use_rest()
    }
}
