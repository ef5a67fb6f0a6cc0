//! Typed builder and parser for the legacy XML API (ZAPI).
//!
//! A request is a tree of [`ZapiElement`]s rooted at the API name. It is
//! rendered into the `<netapp>` envelope, optionally tunnelled to a vserver,
//! and the `<results>` element of the response is parsed back into the same
//! owned tree type.

use crate::error::{Error, Result};
use std::fmt::Write as _;

/// ZAPI envelope version.
pub const ZAPI_VERSION: &str = "1.110";

/// ZAPI namespace.
pub const ZAPI_NAMESPACE: &str = "http://www.netapp.com/filer/admin";

/// Servlet path ZAPI requests are posted to.
pub const ZAPI_PATH: &str = "/servlets/netapp.servlets.admin.XMLrequest_filer";

/// One element of a ZAPI request or response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ZapiElement {
    /// Element name.
    pub name: String,
    /// Text content, for leaf elements.
    pub content: Option<String>,
    /// Child elements, in document order.
    pub children: Vec<ZapiElement>,
}

impl ZapiElement {
    /// Create an empty element.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: None,
            children: Vec::new(),
        }
    }

    /// Create a leaf element with text content.
    pub fn leaf(name: impl Into<String>, content: impl ToString) -> Self {
        Self {
            name: name.into(),
            content: Some(content.to_string()),
            children: Vec::new(),
        }
    }

    /// Append a text child.
    pub fn child_text(mut self, name: impl Into<String>, content: impl ToString) -> Self {
        self.children.push(Self::leaf(name, content));
        self
    }

    /// Append a text child if `content` is set.
    pub fn child_opt<T: ToString>(self, name: impl Into<String>, content: Option<T>) -> Self {
        match content {
            Some(value) => self.child_text(name, value),
            None => self,
        }
    }

    /// Append a child element.
    pub fn child(mut self, element: Self) -> Self {
        self.children.push(element);
        self
    }

    /// Append `<wrapper><item>v</item>...</wrapper>`.
    pub fn child_list<I, T>(mut self, wrapper: &str, item: &str, values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: ToString,
    {
        let mut list = Self::new(wrapper);
        for value in values {
            list.children.push(Self::leaf(item, value));
        }
        self.children.push(list);
        self
    }

    /// Append a child element in place.
    pub fn add_child(&mut self, element: Self) {
        self.children.push(element);
    }

    /// First child called `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Self> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Text of the first child called `name`.
    #[must_use]
    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|c| c.content.as_deref())
    }

    /// Descend through a path of child names.
    #[must_use]
    pub fn path(&self, names: &[&str]) -> Option<&Self> {
        names.iter().try_fold(self, |node, name| node.get(name))
    }

    /// Text at the end of a path.
    #[must_use]
    pub fn path_text(&self, names: &[&str]) -> Option<&str> {
        self.path(names).and_then(|c| c.content.as_deref())
    }

    /// Boolean text at the end of a path.
    #[must_use]
    pub fn path_bool(&self, names: &[&str]) -> Option<bool> {
        match self.path_text(names)?.to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }

    /// Integer text at the end of a path.
    #[must_use]
    pub fn path_i64(&self, names: &[&str]) -> Option<i64> {
        self.path_text(names)?.trim().parse().ok()
    }

    /// Text of every child of the list element `wrapper`.
    #[must_use]
    pub fn list_text(&self, wrapper: &str) -> Vec<String> {
        self.get(wrapper)
            .map(|list| {
                list.children
                    .iter()
                    .filter_map(|c| c.content.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Render this element as XML.
    #[must_use]
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.render(&mut out);
        out
    }

    fn render(&self, out: &mut String) {
        let _ = write!(out, "<{}>", self.name);
        if let Some(content) = &self.content {
            out.push_str(&escape(content));
        }
        for child in &self.children {
            child.render(out);
        }
        let _ = write!(out, "</{}>", self.name);
    }
}

/// Wrap a request in the `<netapp>` envelope.
#[must_use]
pub fn envelope(request: &ZapiElement, vserver: Option<&str>) -> String {
    let vfiler = vserver
        .map(|vs| format!(" vfiler='{}'", escape(vs)))
        .unwrap_or_default();
    format!(
        "<?xml version='1.0' encoding='utf-8'?>\
         <netapp version='{ZAPI_VERSION}' xmlns='{ZAPI_NAMESPACE}'{vfiler}>{}</netapp>",
        request.to_xml()
    )
}

/// Parsed ZAPI response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZapiResponse {
    /// The `<results>` element.
    pub results: ZapiElement,
    /// `(errno, reason)` when the status is `failed`.
    pub error: Option<(String, String)>,
}

impl ZapiResponse {
    /// A passed response with the given children.
    pub fn passed(children: Vec<ZapiElement>) -> Self {
        Self {
            results: ZapiElement {
                name: "results".into(),
                content: None,
                children,
            },
            error: None,
        }
    }

    /// A failed response.
    pub fn failed(code: &str, reason: &str) -> Self {
        Self {
            results: ZapiElement::new("results"),
            error: Some((code.to_string(), reason.to_string())),
        }
    }

    /// A passed `*-get-iter` response holding `records`.
    pub fn records(records: Vec<ZapiElement>) -> Self {
        let count = records.len();
        let mut children = vec![ZapiElement::leaf("num-records", count)];
        if count > 0 {
            children.push(ZapiElement {
                name: "attributes-list".into(),
                content: None,
                children: records,
            });
        }
        Self::passed(children)
    }

    /// Parse the body returned by the ZAPI servlet.
    pub fn parse(xml: &str) -> Result<Self> {
        let doc = roxmltree::Document::parse(xml)?;
        let results = doc
            .root_element()
            .children()
            .find(|n| n.is_element() && n.tag_name().name() == "results")
            .ok_or_else(|| Error::InvalidResponse("ZAPI response has no <results> element".into()))?;

        let error = match results.attribute("status") {
            Some("passed") => None,
            _ => Some((
                results.attribute("errno").unwrap_or("unknown").to_string(),
                results.attribute("reason").unwrap_or("no reason given").to_string(),
            )),
        };
        Ok(Self {
            results: from_node(results),
            error,
        })
    }

    /// Turn a failed response into an [`Error`].
    pub fn into_result(self, api: &str) -> Result<ZapiElement> {
        match self.error {
            None => Ok(self.results),
            Some((code, reason)) => Err(Error::zapi(api, code, reason)),
        }
    }
}

fn from_node(node: roxmltree::Node<'_, '_>) -> ZapiElement {
    let children: Vec<ZapiElement> = node.children().filter(roxmltree::Node::is_element).map(from_node).collect();
    let content = if children.is_empty() {
        node.text().map(|t| t.trim().to_string()).filter(|t| !t.is_empty())
    } else {
        None
    };
    ZapiElement {
        name: node.tag_name().name().to_string(),
        content,
        children,
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// Records of a `*-get-iter` result.
#[must_use]
pub fn iter_records(results: &ZapiElement) -> Vec<ZapiElement> {
    results
        .get("attributes-list")
        .map(|list| list.children.clone())
        .unwrap_or_default()
}

/// Build a `*-get-iter` request filtered by `query`.
#[must_use]
pub fn get_iter(api: &str, query: ZapiElement) -> ZapiElement {
    ZapiElement::new(api).child(ZapiElement::new("query").child(query))
}
