//! Blocking HTTP transport.
//!
//! REST requests go to `https://host:port/api/<path>`; ZAPI requests are
//! posted to the admin servlet over HTTP or HTTPS depending on the `https`
//! setting. Non-2xx statuses are returned as responses, never as errors.

use crate::backend::Transport;
use crate::error::{Error, Result};
use crate::types::{ConnectionConfig, Method, Protocol, RestRequest, RestResponse};
use crate::zapi::{ZAPI_PATH, ZapiElement, ZapiResponse, envelope};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use std::time::Duration;
use ureq::tls::{Certificate, ClientCert, PrivateKey, TlsConfig};

/// Header identifying the caller for cluster audit logs.
pub const CLIENT_APP_HEADER: &str = "X-Dot-Client-App";

/// Value of [`CLIENT_APP_HEADER`].
pub const CLIENT_APP: &str = concat!("ontap-converge/", env!("CARGO_PKG_VERSION"));

/// Largest response body accepted.
const MAX_BODY_SIZE: u64 = 64 * 1024 * 1024;

/// ureq-backed transport.
///
/// # Example
///
/// ```no_run
/// use ontapkit::backend::{Transport, http::HttpTransport};
/// use ontapkit::{ConnectionConfig, RestRequest};
///
/// let config = ConnectionConfig::new("cluster1.example.com", "admin", "secret");
/// let transport = HttpTransport::new(&config).unwrap();
/// let response = transport.send_rest(&RestRequest::get("cluster")).unwrap();
/// println!("HTTP {}", response.status);
/// ```
pub struct HttpTransport {
    agent: ureq::Agent,
    config: ConnectionConfig,
    authorization: Option<String>,
}

impl HttpTransport {
    /// Build a transport for `config`.
    pub fn new(config: &ConnectionConfig) -> Result<Self> {
        config.validate()?;

        let mut tls = TlsConfig::builder().disable_verification(!config.validate_certs);
        if let Some(cert_path) = &config.cert_filepath {
            tls = tls.client_cert(Some(load_client_cert(config, cert_path)?));
        }

        let mut builder = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(Duration::from_secs(config.connection_timeout)))
            .tls_config(tls.build());
        if let Some(proxy) = &config.proxy {
            let proxy = ureq::Proxy::new(proxy).map_err(|e| Error::Config(format!("invalid proxy '{proxy}': {e}")))?;
            builder = builder.proxy(Some(proxy));
        }

        let authorization = match (&config.username, &config.password) {
            (Some(user), Some(password)) => Some(format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))),
            _ => None,
        };

        Ok(Self {
            agent: builder.build().into(),
            config: config.clone(),
            authorization,
        })
    }

    /// URL of a REST path.
    #[must_use]
    pub fn rest_url(&self, path: &str) -> String {
        rest_url(&self.config, path)
    }

    /// URL of the ZAPI servlet.
    #[must_use]
    pub fn zapi_url(&self) -> String {
        format!(
            "{}://{}{ZAPI_PATH}",
            self.config.scheme(Protocol::Zapi),
            self.config.authority(Protocol::Zapi)
        )
    }

    fn decorate<B>(&self, mut builder: ureq::RequestBuilder<B>, request: &RestRequest) -> ureq::RequestBuilder<B> {
        builder = builder
            .header("Accept", "application/json")
            .header(CLIENT_APP_HEADER, CLIENT_APP);
        if let Some(auth) = &self.authorization {
            builder = builder.header("Authorization", auth.as_str());
        }
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        for (key, value) in &request.query {
            builder = builder.query(key.as_str(), value.as_str());
        }
        builder
    }

    fn transport_error(&self, err: &ureq::Error) -> Error {
        transport_error(&self.config.hostname, err)
    }
}

/// Map a ureq failure onto the error taxonomy.
///
/// Only failures to reach the cluster (socket, DNS, TLS, proxy, timeouts)
/// become [`Error::Unreachable`].
fn transport_error(host: &str, err: &ureq::Error) -> Error {
    match err {
        ureq::Error::Io(_)
        | ureq::Error::Timeout(_)
        | ureq::Error::HostNotFound
        | ureq::Error::ConnectionFailed
        | ureq::Error::ConnectProxyFailed(_)
        | ureq::Error::Tls(_)
        | ureq::Error::Rustls(_) => Error::unreachable(host, err.to_string()),
        ureq::Error::BodyExceedsLimit(_) | ureq::Error::Protocol(_) | ureq::Error::Json(_) => {
            Error::InvalidResponse(format!("{host}: {err}"))
        }
        _ => Error::Other(format!("HTTP request to {host} failed: {err}")),
    }
}

/// Join a REST path onto `https://host:port/api/`.
#[must_use]
pub fn rest_url(config: &ConnectionConfig, path: &str) -> String {
    let path = path.trim_start_matches('/');
    let path = path.strip_prefix("api/").unwrap_or(path);
    format!(
        "{}://{}/api/{path}",
        config.scheme(Protocol::Rest),
        config.authority(Protocol::Rest)
    )
}

fn load_client_cert(config: &ConnectionConfig, cert_path: &std::path::Path) -> Result<ClientCert> {
    let read = |path: &std::path::Path| {
        std::fs::read(path).map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))
    };
    let cert_pem = read(cert_path)?;
    let key_pem = match &config.key_filepath {
        Some(key_path) => read(key_path)?,
        None => cert_pem.clone(),
    };
    let cert = Certificate::from_pem(&cert_pem)
        .map_err(|e| Error::Config(format!("invalid certificate {}: {e}", cert_path.display())))?;
    let key = PrivateKey::from_pem(&key_pem).map_err(|e| Error::Config(format!("invalid private key: {e}")))?;
    Ok(ClientCert::new_with_certs(&[cert], key))
}

fn read_body(response: &mut ureq::http::Response<ureq::Body>) -> std::result::Result<String, ureq::Error> {
    response.body_mut().with_config().limit(MAX_BODY_SIZE).read_to_string()
}

impl Transport for HttpTransport {
    fn send_rest(&self, request: &RestRequest) -> Result<RestResponse> {
        let url = self.rest_url(&request.path);
        log::trace!("{} {url}", request.method);

        let result = match (request.method, &request.body) {
            (Method::Get, _) => self.decorate(self.agent.get(&url), request).call(),
            (Method::Delete, None) => self.decorate(self.agent.delete(&url), request).call(),
            (Method::Delete, Some(body)) => self
                .decorate(self.agent.delete(&url).force_send_body(), request)
                .send_json(body),
            (Method::Post, body) => self
                .decorate(self.agent.post(&url), request)
                .send_json(body.clone().unwrap_or_else(|| serde_json::json!({}))),
            (Method::Patch, body) => self
                .decorate(self.agent.patch(&url), request)
                .send_json(body.clone().unwrap_or_else(|| serde_json::json!({}))),
        };

        let mut response = result.map_err(|e| self.transport_error(&e))?;
        let status = response.status().as_u16();
        let text = read_body(&mut response).map_err(|e| self.transport_error(&e))?;
        Ok(RestResponse::from_text(status, &text))
    }

    fn send_zapi(&self, vserver: Option<&str>, request: &ZapiElement) -> Result<ZapiResponse> {
        let url = self.zapi_url();
        let xml = envelope(request, vserver);
        log::trace!("POST {url} {}", request.name);

        let mut builder = self
            .agent
            .post(&url)
            .header("Content-Type", "text/xml; charset=utf-8")
            .header(CLIENT_APP_HEADER, CLIENT_APP);
        if let Some(auth) = &self.authorization {
            builder = builder.header("Authorization", auth.as_str());
        }

        let mut response = builder.send(xml.as_str()).map_err(|e| self.transport_error(&e))?;
        let status = response.status().as_u16();
        let text = read_body(&mut response).map_err(|e| self.transport_error(&e))?;
        match status {
            200..=299 => ZapiResponse::parse(&text),
            401 | 403 => Err(Error::AuthFailed {
                status,
                message: "ZAPI request rejected".into(),
            }),
            _ => Err(Error::zapi(&request.name, format!("HTTP {status}"), text.trim())),
        }
    }

    fn host(&self) -> &str {
        &self.config.hostname
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rest_url() {
        let config = ConnectionConfig::new("cluster1", "admin", "x");
        assert_eq!(rest_url(&config, "storage/volumes"), "https://cluster1:443/api/storage/volumes");
        assert_eq!(rest_url(&config, "/api/cluster/jobs/j1"), "https://cluster1:443/api/cluster/jobs/j1");
    }

    #[test]
    fn test_zapi_url_follows_https_flag() {
        let mut config = ConnectionConfig::new("10.0.0.5", "admin", "x");
        let transport = HttpTransport::new(&config).unwrap();
        assert_eq!(
            transport.zapi_url(),
            "http://10.0.0.5:80/servlets/netapp.servlets.admin.XMLrequest_filer"
        );

        config.https = true;
        config.http_port = Some(8443);
        let transport = HttpTransport::new(&config).unwrap();
        assert!(transport.zapi_url().starts_with("https://10.0.0.5:8443/"));
    }

    #[test]
    fn test_transport_error_mapping() {
        let timeout = transport_error("c1", &ureq::Error::Timeout(ureq::Timeout::Global));
        assert!(matches!(timeout, Error::Unreachable { ref host, .. } if host == "c1"));
        assert!(matches!(transport_error("c1", &ureq::Error::HostNotFound), Error::Unreachable { .. }));
        assert!(matches!(transport_error("c1", &ureq::Error::ConnectionFailed), Error::Unreachable { .. }));
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        assert!(matches!(transport_error("c1", &ureq::Error::Io(reset)), Error::Unreachable { .. }));

        assert!(matches!(
            transport_error("c1", &ureq::Error::BodyExceedsLimit(MAX_BODY_SIZE)),
            Error::InvalidResponse(_)
        ));
        assert!(matches!(
            transport_error("c1", &ureq::Error::BadUri("no host".into())),
            Error::Other(_)
        ));
    }

    #[test]
    fn test_basic_auth_header() {
        let config = ConnectionConfig::new("c1", "admin", "netapp1!");
        let transport = HttpTransport::new(&config).unwrap();
        assert_eq!(transport.authorization.as_deref(), Some("Basic YWRtaW46bmV0YXBwMSE="));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ConnectionConfig::new("", "admin", "x");
        assert!(matches!(HttpTransport::new(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_cert_file() {
        let mut config = ConnectionConfig::new("c1", "admin", "x");
        config.username = None;
        config.password = None;
        config.cert_filepath = Some("/nonexistent/cert.pem".into());
        let err = HttpTransport::new(&config).err().unwrap();
        assert!(err.to_string().contains("cannot read"));
    }

    #[test]
    fn test_client_app_header_value() {
        assert!(CLIENT_APP.starts_with("ontap-converge/"));
    }
}
