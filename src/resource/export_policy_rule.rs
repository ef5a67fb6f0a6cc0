//! NFS export policy rules.
//!
//! A rule is named by its index, or by its client match list when no index
//! is given. Renaming a rule moves it to a new index.

use anyhow::{Result, bail};
use declarative::{
    Attr, AttrSpec, Attributes, Completion, Desired, Identity, Intent, Record, Resource, Schema, Step, Steps,
};
use ontapkit::{Error, Idempotency, Session, ZapiElement};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value, json};

use super::{names_at, put, strings_at, uuid_of};

const KIND: &str = "export_policy_rule";

const IDEMPOTENCY: Idempotency = Idempotency::LENIENT;

const SCHEMA: Schema = Schema::new(
    KIND,
    &[
        AttrSpec::new("allow_suid"),
        AttrSpec::new("anonymous_user_id"),
        AttrSpec::new("client_match"),
        AttrSpec::new("protocol"),
        AttrSpec::new("ro_rule"),
        AttrSpec::new("rw_rule"),
        AttrSpec::new("super_user_security"),
    ],
);

const REST_FIELDS: &str = "index,clients,ro_rule,rw_rule,superuser,protocols,anonymous_user,allow_suid";

/// Attribute name, REST field, ZAPI field, ZAPI list item
const FIELDS: &[(&str, &str, &str, Option<&str>)] = &[
    ("allow_suid", "allow_suid", "is-allow-set-uid-enabled", None),
    ("anonymous_user_id", "anonymous_user", "anonymous-user-id", None),
    ("protocol", "protocols", "protocol", Some("access-protocol")),
    ("ro_rule", "ro_rule", "ro-rule", Some("security-flavor")),
    ("rw_rule", "rw_rule", "rw-rule", Some("security-flavor")),
    ("super_user_security", "superuser", "super-user-security", Some("security-flavor")),
];

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportPolicyRuleParams {
    pub vserver: String,
    pub policy_name: String,
    pub rule_index: Option<i64>,
    /// Index of an existing rule to move to `rule_index`
    pub from_rule_index: Option<i64>,
    pub client_match: Option<Vec<String>>,
    pub ro_rule: Option<Vec<String>>,
    pub rw_rule: Option<Vec<String>>,
    pub super_user_security: Option<Vec<String>>,
    pub protocol: Option<Vec<String>>,
    #[serde(default, deserialize_with = "string_or_int")]
    pub anonymous_user_id: Option<String>,
    pub allow_suid: Option<bool>,
}

fn string_or_int<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Int(i64),
    }
    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Str(s) => s,
        Raw::Int(i) => i.to_string(),
    }))
}

#[derive(Debug)]
pub struct ExportPolicyRule {
    params: ExportPolicyRuleParams,
    desired: Desired,
}

impl ExportPolicyRule {
    pub fn new(params: ExportPolicyRuleParams, intent: Intent) -> Result<Self> {
        if params.from_rule_index.is_some() && params.rule_index.is_none() {
            bail!("from_rule_index requires rule_index");
        }
        let name = match (&params.rule_index, &params.client_match) {
            (Some(index), _) => index.to_string(),
            (None, Some(clients)) if !clients.is_empty() => clients.join(","),
            _ => bail!("either rule_index or client_match is required"),
        };

        let mut attributes = Attributes::new();
        put(&mut attributes, "allow_suid", params.allow_suid);
        put(&mut attributes, "anonymous_user_id", params.anonymous_user_id.clone());
        put(&mut attributes, "client_match", params.client_match.clone());
        put(&mut attributes, "protocol", params.protocol.clone());
        put(&mut attributes, "ro_rule", params.ro_rule.clone());
        put(&mut attributes, "rw_rule", params.rw_rule.clone());
        put(&mut attributes, "super_user_security", params.super_user_security.clone());

        let from = params.from_rule_index.map(|i| i.to_string());
        let desired = super::desired(intent, &name, from.as_deref(), attributes);
        Ok(Self { params, desired })
    }

    fn vserver(&self) -> &str {
        &self.params.vserver
    }

    fn policy(&self) -> &str {
        &self.params.policy_name
    }

    /// Id of the export policy, if it exists
    fn rest_policy_id(&self, session: &mut Session) -> ontapkit::Result<Option<String>> {
        let query = [("name", self.policy()), ("svm.name", self.vserver()), ("fields", "id")];
        let policy = session.rest_get_one("protocols/nfs/export-policies", &query)?;
        Ok(policy.and_then(|p| p.get("id").map(json_text)))
    }

    fn ensure_policy(&self, session: &mut Session, rest: bool) -> ontapkit::Result<Completion> {
        if rest {
            if self.rest_policy_id(session)?.is_some() {
                return Ok(Completion::AlreadyConverged);
            }
            let body = json!({ "name": self.policy(), "svm": { "name": self.vserver() } });
            return Idempotency::LENIENT.on_create(session.rest_post("protocols/nfs/export-policies", body));
        }
        let request = ZapiElement::new("export-policy-create").child_text("policy-name", self.policy());
        Idempotency::LENIENT.on_create(session.zapi(Some(self.vserver()), &request).map(|_| Completion::Done))
    }

    fn create_rule(&self, session: &mut Session, rest: bool) -> ontapkit::Result<Completion> {
        let attrs = &self.desired.attributes;
        let result = if rest {
            let id = self
                .rest_policy_id(session)?
                .ok_or_else(|| Error::InvalidResponse(format!("export policy '{}' not found", self.policy())))?;
            let mut body = rest_body(attrs);
            if let Some(index) = self.params.rule_index {
                body.insert("index".into(), json!(index));
            }
            session.rest_post(&format!("protocols/nfs/export-policies/{id}/rules"), Value::Object(body))
        } else {
            let request = ZapiElement::new("export-rule-create")
                .child_text("policy-name", self.policy())
                .child_opt("rule-index", self.params.rule_index);
            session
                .zapi(Some(self.vserver()), &zapi_fields(request, attrs))
                .map(|_| Completion::Done)
        };
        IDEMPOTENCY.on_create(result)
    }

    fn rest_rule_path(current: &Record) -> ontapkit::Result<String> {
        Ok(format!(
            "protocols/nfs/export-policies/{}/rules/{}",
            uuid_of(current)?,
            rule_index(current)?
        ))
    }

    fn zapi_rule(&self, api: &str, current: &Record) -> ontapkit::Result<ZapiElement> {
        Ok(ZapiElement::new(api)
            .child_text("policy-name", self.policy())
            .child_text("rule-index", rule_index(current)?))
    }

    fn zapi_call(&self, session: &mut Session, request: &ZapiElement) -> ontapkit::Result<Completion> {
        session.zapi(Some(self.vserver()), request).map(|_| Completion::Done)
    }
}

fn json_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Index of a fetched rule
///
/// A rule looked up by client match keeps its index among the attributes.
fn rule_index(record: &Record) -> ontapkit::Result<i64> {
    record
        .name
        .parse()
        .ok()
        .or_else(|| record.attributes.get("rule_index").and_then(Attr::as_i64))
        .ok_or_else(|| Error::InvalidResponse(format!("export rule '{}' has no index", record.name)))
}

/// Whether two client match lists name the same clients
fn same_clients(a: &[String], b: &[String]) -> bool {
    let normalize = |list: &[String]| {
        let mut list: Vec<String> = list.iter().map(|c| c.trim().to_lowercase()).collect();
        list.sort_unstable();
        list
    };
    normalize(a) == normalize(b)
}

fn split_clients(name: &str) -> Vec<String> {
    name.split(',').map(|c| c.trim().to_string()).filter(|c| !c.is_empty()).collect()
}

fn rest_body(attrs: &Attributes) -> Map<String, Value> {
    let mut body = Map::new();
    if let Some(clients) = attrs.get("client_match") {
        let clients: Vec<Value> = clients
            .string_list()
            .into_iter()
            .map(|c| json!({ "match": c }))
            .collect();
        body.insert("clients".into(), Value::Array(clients));
    }
    for (key, rest, _, _) in FIELDS {
        if let Some(value) = attrs.get(*key) {
            body.insert((*rest).into(), value.to_json());
        }
    }
    body
}

fn zapi_fields(mut request: ZapiElement, attrs: &Attributes) -> ZapiElement {
    if let Some(clients) = attrs.get("client_match") {
        request = request.child_text("client-match", clients.string_list().join(","));
    }
    for (key, _, field, item) in FIELDS {
        let Some(value) = attrs.get(*key) else {
            continue;
        };
        request = match item {
            Some(item) => request.child_list(field, item, value.string_list()),
            None => request.child_text(*field, value),
        };
    }
    request
}

fn record_from_rest(name: &str, policy_id: &str, rule: &Value) -> Record {
    let mut attrs = Attributes::new();
    put(&mut attrs, "allow_suid", rule.get("allow_suid").and_then(Value::as_bool));
    put(&mut attrs, "anonymous_user_id", rule.get("anonymous_user").map(json_text));
    put(&mut attrs, "client_match", names_at(rule, "/clients", "match"));
    put(&mut attrs, "protocol", strings_at(rule, "/protocols"));
    put(&mut attrs, "ro_rule", strings_at(rule, "/ro_rule"));
    put(&mut attrs, "rule_index", rule.get("index").and_then(Value::as_i64));
    put(&mut attrs, "rw_rule", strings_at(rule, "/rw_rule"));
    put(&mut attrs, "super_user_security", strings_at(rule, "/superuser"));
    Record::new(name, attrs).with_uuid(policy_id)
}

fn record_from_zapi(name: &str, rule: &ZapiElement) -> Record {
    let mut attrs = Attributes::new();
    put(&mut attrs, "allow_suid", rule.path_bool(&["is-allow-set-uid-enabled"]));
    put(&mut attrs, "anonymous_user_id", rule.text("anonymous-user-id"));
    put(&mut attrs, "client_match", rule.text("client-match").map(split_clients));
    put(&mut attrs, "protocol", Some(rule.list_text("protocol")));
    put(&mut attrs, "ro_rule", Some(rule.list_text("ro-rule")));
    put(&mut attrs, "rule_index", rule.path_i64(&["rule-index"]));
    put(&mut attrs, "rw_rule", Some(rule.list_text("rw-rule")));
    put(&mut attrs, "super_user_security", Some(rule.list_text("super-user-security")));
    Record::new(name, attrs)
}

impl Resource for ExportPolicyRule {
    type Session = Session;
    type Error = Error;

    fn identity(&self) -> Identity {
        Identity::vserver(KIND, self.vserver(), &self.desired.name)
    }

    fn schema(&self) -> Schema {
        SCHEMA
    }

    fn desired(&self) -> &Desired {
        &self.desired
    }

    fn fetch(&self, session: &mut Session, name: &str) -> ontapkit::Result<Option<Record>> {
        let index: Option<i64> = name.parse().ok();
        let clients = split_clients(name);

        if session.use_rest() {
            let Some(policy_id) = self.rest_policy_id(session)? else {
                return Ok(None);
            };
            let path = format!("protocols/nfs/export-policies/{policy_id}/rules");
            let index_text = index.map(|i| i.to_string());
            let mut query = vec![("fields", REST_FIELDS)];
            match &index_text {
                Some(index) => query.push(("index", index.as_str())),
                None => query.push(("clients.match", name)),
            }
            let rules = session.rest_get_records(&path, &query)?;
            let rule = rules.iter().find(|rule| match index {
                Some(index) => rule.get("index").and_then(Value::as_i64) == Some(index),
                None => names_at(rule, "/clients", "match").is_some_and(|c| same_clients(&c, &clients)),
            });
            return Ok(rule.map(|r| record_from_rest(name, &policy_id, r)));
        }

        let query = ZapiElement::new("export-rule-info")
            .child_text("policy-name", self.policy())
            .child_text("vserver-name", self.vserver())
            .child_opt("rule-index", index)
            .child_opt("client-match", index.is_none().then_some(name));
        let rules = session.zapi_get_iter(Some(self.vserver()), "export-rule-get-iter", query)?;
        let rule = rules.iter().find(|rule| match index {
            Some(index) => rule.path_i64(&["rule-index"]) == Some(index),
            None => rule
                .text("client-match")
                .is_some_and(|c| same_clients(&split_clients(c), &clients)),
        });
        Ok(rule.map(|r| record_from_zapi(name, r)))
    }

    fn create_steps<'a>(&'a self, session: &Session) -> Steps<'a, Self> {
        let rest = session.use_rest();
        vec![
            Step::new("ensure export policy", move |s: &mut Session| self.ensure_policy(s, rest)),
            Step::new("create export rule", move |s: &mut Session| self.create_rule(s, rest)),
        ]
    }

    fn delete_steps<'a>(&'a self, session: &Session, current: &'a Record) -> Steps<'a, Self> {
        let rest = session.use_rest();
        vec![Step::new("delete export rule", move |s: &mut Session| {
            let result = if rest {
                Self::rest_rule_path(current).and_then(|path| s.rest_delete(&path))
            } else {
                self.zapi_rule("export-rule-destroy", current)
                    .and_then(|request| self.zapi_call(s, &request))
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
        vec![Step::new("modify export rule", move |s: &mut Session| {
            if rest {
                return s.rest_patch(&Self::rest_rule_path(current)?, Value::Object(rest_body(modify)));
            }
            let request = zapi_fields(self.zapi_rule("export-rule-modify", current)?, modify);
            self.zapi_call(s, &request)
        })]
    }

    fn supports_rename(&self) -> bool {
        true
    }

    fn rename_steps<'a>(&'a self, session: &Session, current: &'a Record, to: &'a str) -> Steps<'a, Self> {
        let rest = session.use_rest();
        vec![Step::new("move export rule", move |s: &mut Session| {
            let new_index: i64 = to
                .parse()
                .map_err(|_| Error::Config(format!("rule index '{to}' is not a number")))?;
            if rest {
                return s.rest_patch(&Self::rest_rule_path(current)?, json!({ "index": new_index }));
            }
            let request = self
                .zapi_rule("export-rule-set-index", current)?
                .child_text("new-rule-index", new_index);
            self.zapi_call(s, &request)
        })]
    }

    fn requires_uuid(&self, session: &Session) -> bool {
        session.use_rest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::testing::{connected, write_body, zapi_write};
    use declarative::{Action, ApplyOptions, reconcile};
    use ontapkit::{Method, MockTransport, ProtocolRequirements, RestResponse, UseRest, ZapiResponse};

    fn rule(params: Value) -> ExportPolicyRule {
        ExportPolicyRule::new(serde_json::from_value(params).unwrap(), Intent::Present).unwrap()
    }

    fn policy() -> RestResponse {
        RestResponse::records(vec![json!({"id": 7, "name": "p1"})])
    }

    fn rest_rule() -> Value {
        json!({
            "index": 1,
            "clients": [{"match": "10.0.0.0/24"}],
            "ro_rule": ["any"],
            "rw_rule": ["any"],
            "superuser": ["any"],
            "protocols": ["any"],
            "anonymous_user": "65534",
            "allow_suid": true,
        })
    }

    #[test]
    fn test_name_and_validation() {
        let by_clients = rule(json!({"vserver": "vs1", "policy_name": "p1", "client_match": ["a", "b"]}));
        assert_eq!(by_clients.desired.name, "a,b");
        let by_index = rule(json!({"vserver": "vs1", "policy_name": "p1", "rule_index": 3, "from_rule_index": 5}));
        assert_eq!(by_index.desired.name, "3");
        assert_eq!(by_index.desired.from_name.as_deref(), Some("5"));

        let params = |v: Value| serde_json::from_value::<ExportPolicyRuleParams>(v).unwrap();
        assert!(ExportPolicyRule::new(params(json!({"vserver": "vs1", "policy_name": "p1"})), Intent::Present).is_err());
        assert!(
            ExportPolicyRule::new(
                params(json!({"vserver": "vs1", "policy_name": "p1", "client_match": ["a"], "from_rule_index": 2})),
                Intent::Present
            )
            .is_err()
        );
    }

    #[test]
    fn test_anonymous_user_accepts_numbers() {
        let r = rule(json!({"vserver": "vs1", "policy_name": "p1", "rule_index": 1, "anonymous_user_id": 65534}));
        assert_eq!(r.desired.attributes["anonymous_user_id"], Attr::from("65534"));
    }

    #[test]
    fn test_existing_rule_is_idempotent() {
        let mock = MockTransport::new().with_cluster_version(9, 12, 1);
        mock.on_rest_get("protocols/nfs/export-policies", policy());
        mock.on_rest_get("protocols/nfs/export-policies/7/rules", RestResponse::records(vec![rest_rule()]));
        let r = rule(json!({
            "vserver": "vs1", "policy_name": "p1", "client_match": ["10.0.0.0/24"],
            "ro_rule": ["any"], "rw_rule": ["any"],
        }));
        let mut session = connected(&mock, UseRest::Auto, &ProtocolRequirements::new());

        let report = reconcile(&r, &mut session, &ApplyOptions::default()).unwrap();
        assert!(!report.changed);
        assert_eq!(report.decision.action, Action::None);
        assert!(mock.writes().is_empty());
    }

    #[test]
    fn test_rest_create_creates_missing_policy_first() {
        let mock = MockTransport::new().with_cluster_version(9, 12, 1);
        mock.on_rest_get("protocols/nfs/export-policies", RestResponse::records(Vec::new()))
            .on_rest_get("protocols/nfs/export-policies", RestResponse::records(Vec::new()))
            .on_rest_get("protocols/nfs/export-policies", policy());
        let r = rule(json!({
            "vserver": "vs1", "policy_name": "p1", "client_match": ["10.0.0.0/24", "10.1.0.0/24"],
            "ro_rule": ["sys"], "rw_rule": ["none"],
        }));
        let mut session = connected(&mock, UseRest::Auto, &ProtocolRequirements::new());

        let report = reconcile(&r, &mut session, &ApplyOptions::default()).unwrap();
        assert!(report.changed);
        assert_eq!(
            mock.write_labels(),
            vec![
                "POST protocols/nfs/export-policies",
                "POST protocols/nfs/export-policies/7/rules",
            ]
        );
        assert_eq!(
            write_body(&mock, 1),
            json!({
                "clients": [{"match": "10.0.0.0/24"}, {"match": "10.1.0.0/24"}],
                "ro_rule": ["sys"],
                "rw_rule": ["none"],
            })
        );
    }

    #[test]
    fn test_zapi_create_tolerates_existing_policy() {
        let mock = MockTransport::new().with_cluster_version(9, 12, 1);
        mock.on_zapi_error("export-policy-create", "13001", "duplicate entry");
        let r = rule(json!({"vserver": "vs1", "policy_name": "p1", "rule_index": 2, "client_match": ["host1"], "protocol": ["nfs3", "nfs4"]}));
        let mut session = connected(&mock, UseRest::Never, &ProtocolRequirements::new());

        let report = reconcile(&r, &mut session, &ApplyOptions::default()).unwrap();
        assert!(report.changed);
        assert_eq!(mock.write_labels(), vec!["export-policy-create", "export-rule-create"]);
        let request = zapi_write(&mock, 1);
        assert_eq!(request.text("client-match"), Some("host1"));
        assert_eq!(request.text("rule-index"), Some("2"));
        assert_eq!(request.list_text("protocol"), vec!["nfs3", "nfs4"]);
    }

    #[test]
    fn test_rest_modify_by_client_match() {
        let mock = MockTransport::new().with_cluster_version(9, 12, 1);
        mock.on_rest_get("protocols/nfs/export-policies", policy());
        mock.on_rest_get("protocols/nfs/export-policies/7/rules", RestResponse::records(vec![rest_rule()]));
        let r = rule(json!({
            "vserver": "vs1", "policy_name": "p1", "client_match": ["10.0.0.0/24"], "rw_rule": ["never"],
        }));
        let mut session = connected(&mock, UseRest::Auto, &ProtocolRequirements::new());

        let report = reconcile(&r, &mut session, &ApplyOptions::default()).unwrap();
        assert!(report.changed);
        assert_eq!(mock.write_labels(), vec!["PATCH protocols/nfs/export-policies/7/rules/1"]);
        assert_eq!(write_body(&mock, 0), json!({"rw_rule": ["never"]}));
    }

    #[test]
    fn test_zapi_move_rule_to_new_index() {
        let mock = MockTransport::new().with_cluster_version(9, 12, 1);
        let existing = ZapiElement::new("export-rule-info")
            .child_text("policy-name", "p1")
            .child_text("rule-index", 5)
            .child_text("client-match", "host1");
        mock.on_zapi("export-rule-get-iter", ZapiResponse::records(Vec::new()))
            .on_zapi("export-rule-get-iter", ZapiResponse::records(vec![existing]));
        let r = rule(json!({"vserver": "vs1", "policy_name": "p1", "rule_index": 1, "from_rule_index": 5}));
        let mut session = connected(&mock, UseRest::Never, &ProtocolRequirements::new());

        let report = reconcile(&r, &mut session, &ApplyOptions::default()).unwrap();
        assert_eq!(report.decision.action, Action::Rename);
        assert_eq!(mock.write_labels(), vec!["export-rule-set-index"]);
        let request = zapi_write(&mock, 0);
        assert_eq!(request.text("rule-index"), Some("5"));
        assert_eq!(request.text("new-rule-index"), Some("1"));
    }

    #[test]
    fn test_absent_rule_in_missing_policy() {
        let mock = MockTransport::new().with_cluster_version(9, 12, 1);
        let params = json!({"vserver": "vs1", "policy_name": "p1", "rule_index": 4});
        let r = ExportPolicyRule::new(serde_json::from_value(params).unwrap(), Intent::Absent).unwrap();
        let mut session = connected(&mock, UseRest::Auto, &ProtocolRequirements::new());

        let report = reconcile(&r, &mut session, &ApplyOptions::default()).unwrap();
        assert!(!report.changed);
        assert_eq!(mock.count_rest(Method::Get, "protocols/nfs/export-policies"), 1);
        assert!(mock.writes().is_empty());
    }

    #[test]
    fn test_zapi_finds_rule_on_later_page() {
        let mock = MockTransport::new().with_cluster_version(9, 12, 1);
        let info = |index: i64, clients: &str| {
            ZapiElement::new("export-rule-info")
                .child_text("policy-name", "p1")
                .child_text("rule-index", index)
                .child_text("client-match", clients)
                .child(ZapiElement::new("ro-rule").child_text("security-flavor", "any"))
                .child(ZapiElement::new("rw-rule").child_text("security-flavor", "any"))
        };
        let mut first = ZapiResponse::records((1..=20).map(|i| info(i, &format!("192.168.{i}.0/24"))).collect());
        first.results.add_child(ZapiElement::leaf("next-tag", "rules-page-2"));
        mock.on_zapi("export-rule-get-iter", first)
            .on_zapi("export-rule-get-iter", ZapiResponse::records(vec![info(21, "10.0.0.0/24")]));
        let r = rule(json!({
            "vserver": "vs1", "policy_name": "p1", "client_match": ["10.0.0.0/24"],
            "ro_rule": ["any"], "rw_rule": ["any"],
        }));
        let mut session = connected(&mock, UseRest::Never, &ProtocolRequirements::new());

        let report = reconcile(&r, &mut session, &ApplyOptions::default()).unwrap();
        assert!(!report.changed);
        assert_eq!(report.decision.action, Action::None);
        assert!(mock.writes().is_empty());
        assert_eq!(mock.count_zapi("export-rule-get-iter"), 2);
        let query = mock.calls().into_iter().find_map(|call| match call {
            ontapkit::Call::Zapi { request, .. } if request.name == "export-rule-get-iter" => Some(request),
            _ => None,
        });
        assert_eq!(
            query.unwrap().path_text(&["query", "export-rule-info", "client-match"]),
            Some("10.0.0.0/24")
        );
    }

    #[test]
    fn test_client_sets_compare_unordered() {
        assert!(same_clients(
            &["10.0.0.0/24".into(), "Host1".into()],
            &["host1".into(), "10.0.0.0/24".into()]
        ));
        assert!(!same_clients(&["a".into()], &["a".into(), "b".into()]));
    }
}
