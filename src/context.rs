//! Sanitized snapshots of in-flight requests.

use indexmap::IndexMap;
use serde::Serialize;
use url::form_urlencoded;

use crate::{
    redaction::{self, RedactionRules, ValueMap},
    request::InboundRequest,
};

const FORWARDED_PROTO: &str = "x-forwarded-proto";
const COOKIE: &str = "cookie";

/// How a snapshot interprets the request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnapshotOptions {
    /// Record the URL as `https` when `X-Forwarded-Proto: https` is present,
    /// even if this process did not terminate TLS.
    ///
    /// The header can be set by any client. Only leave this on when the
    /// server sits behind a proxy that overwrites it.
    pub trust_forwarded_proto: bool,
}

impl SnapshotOptions {
    /// Trusts `X-Forwarded-Proto`.
    pub const DEFAULT: Self = Self {
        trust_forwarded_proto: true,
    };
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Peer address of the request, split into host and port.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RemoteEnv {
    /// Host part of the peer address.
    #[serde(rename = "REMOTE_ADDR")]
    pub remote_addr: String,
    /// Port part of the peer address.
    #[serde(rename = "REMOTE_PORT")]
    pub remote_port: String,
}

/// Caller-supplied request payload.
///
/// Never filled in by the snapshot itself and never redacted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RequestData {
    /// A raw body.
    Text(String),
    /// Flat form fields.
    Fields(IndexMap<String, String>),
}

/// Redacted snapshot of an HTTP request taken when a handler panicked.
///
/// `url` and `method` are always non-empty. `query_string` and `headers` have
/// been passed through [`RedactionRules::redact`]; `cookies`, `env` and `url`
/// are recorded verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RequestContext {
    url: String,
    method: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    query_string: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cookies: Option<String>,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    headers: IndexMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    env: Option<RemoteEnv>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<RequestData>,
}

impl RequestContext {
    /// Snapshots `request` with the default options and the process-wide
    /// redaction set.
    pub fn snapshot<R: InboundRequest + ?Sized>(request: &R) -> Self {
        Self::snapshot_with(request, &SnapshotOptions::DEFAULT, &redaction::rules())
    }

    /// Snapshots `request`.
    ///
    /// The request itself is never modified; redaction works on copies of
    /// the query parameters and headers.
    pub fn snapshot_with<R: InboundRequest + ?Sized>(
        request: &R,
        options: &SnapshotOptions,
        rules: &RedactionRules,
    ) -> Self {
        let headers = request.headers();

        let forwarded_https = options.trust_forwarded_proto
            && first_value(&headers, FORWARDED_PROTO) == Some("https");
        let scheme = if request.is_tls() || forwarded_https {
            "https"
        } else {
            "http"
        };
        let url = format!(
            "{scheme}://{}{}",
            request.host().unwrap_or_default(),
            request.path()
        );

        let query = rules.redact(parse_query(request.raw_query().unwrap_or_default()));

        let cookies = values(&headers, COOKIE)
            .map(|crumbs| {
                crumbs
                    .iter()
                    .map(|crumb| crumb.trim())
                    .filter(|crumb| !crumb.is_empty())
                    .collect::<Vec<_>>()
                    .join("; ")
            })
            .filter(|cookies| !cookies.is_empty());

        let headers = rules
            .redact(headers)
            .into_iter()
            .map(|(name, values)| (name, values.join(",")))
            .collect();

        let env = request
            .peer_addr()
            .and_then(split_host_port)
            .map(|(addr, port)| RemoteEnv {
                remote_addr: addr.to_owned(),
                remote_port: port.to_owned(),
            });

        Self {
            url,
            method: request.method().to_owned(),
            query_string: encode_query(query),
            cookies,
            headers,
            env,
            data: None,
        }
    }

    /// Attaches a caller-supplied payload.
    #[must_use]
    pub fn with_data(mut self, data: RequestData) -> Self {
        self.data = Some(data);
        self
    }

    /// `scheme://host/path`, without the query.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The HTTP verb.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Redacted, form-encoded query. Empty when the request had none.
    pub fn query_string(&self) -> &str {
        &self.query_string
    }

    /// The raw `Cookie` header, if the request carried one.
    pub fn cookies(&self) -> Option<&str> {
        self.cookies.as_deref()
    }

    /// Redacted headers, multiple values joined with `,`.
    pub fn headers(&self) -> &IndexMap<String, String> {
        &self.headers
    }

    /// Peer address, if it could be split into host and port.
    pub fn env(&self) -> Option<&RemoteEnv> {
        self.env.as_ref()
    }

    /// Caller-supplied payload.
    pub fn data(&self) -> Option<&RequestData> {
        self.data.as_ref()
    }
}

fn values<'a>(headers: &'a ValueMap, name: &str) -> Option<&'a Vec<String>> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, values)| values)
}

fn first_value<'a>(headers: &'a ValueMap, name: &str) -> Option<&'a str> {
    values(headers, name)?.first().map(String::as_str)
}

fn parse_query(raw: &str) -> ValueMap {
    let mut map = ValueMap::new();
    for (key, value) in form_urlencoded::parse(raw.as_bytes()) {
        map.entry(key.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    map
}

/// Form-encodes `query` with keys in sorted order.
fn encode_query(mut query: ValueMap) -> String {
    query.sort_keys();
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, values) in &query {
        for value in values {
            serializer.append_pair(key, value);
        }
    }
    serializer.finish()
}

/// Splits `host:port`, or `[host]:port` for IPv6 literals.
///
/// Returns `None` for anything without a port separator, with unbalanced
/// brackets, or with an unbracketed colon in the host.
pub fn split_host_port(addr: &str) -> Option<(&str, &str)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = after.strip_prefix(':')?;
        if port.contains([':', '[', ']']) {
            return None;
        }
        return Some((host, port));
    }

    let (host, port) = addr.rsplit_once(':')?;
    if host.contains([':', '[', ']']) || port.contains(['[', ']']) {
        return None;
    }
    Some((host, port))
}
