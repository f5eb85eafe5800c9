//! The view of an inbound HTTP request that snapshots are taken from.

use std::net::SocketAddr;

use http::header;

use crate::redaction::ValueMap;

/// Read access to the parts of an inbound request that end up in a
/// [`RequestContext`](crate::RequestContext).
///
/// Implemented for [`http::Request`]. Servers that do not use the `http`
/// types can implement it for their own request type.
pub trait InboundRequest {
    /// The HTTP verb, e.g. `GET`.
    fn method(&self) -> &str;

    /// The host the request was addressed to, including the port if one was
    /// given.
    fn host(&self) -> Option<&str>;

    /// The URL path, without the query.
    fn path(&self) -> &str;

    /// The raw, still percent-encoded query, without the leading `?`.
    fn raw_query(&self) -> Option<&str>;

    /// A copy of all headers. Each name maps to every value received for it,
    /// in arrival order.
    fn headers(&self) -> ValueMap;

    /// Whether TLS was terminated by this process.
    fn is_tls(&self) -> bool;

    /// The peer address as reported by the transport, normally `host:port`.
    fn peer_addr(&self) -> Option<&str>;
}

/// Connection details a server attaches to [`http::Request::extensions`].
///
/// `http::Request` carries no connection information of its own. Without
/// this extension, requests are treated as plain-text and as having no peer
/// address.
///
/// ```rust
/// use faultline::ConnectionInfo;
///
/// let mut request = http::Request::new(());
/// request
///     .extensions_mut()
///     .insert(ConnectionInfo::new("203.0.113.5:54321").with_tls(true));
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Peer address string, usually `host:port`.
    pub peer_addr: Option<String>,
    /// TLS was terminated by this process.
    pub tls: bool,
}

impl ConnectionInfo {
    /// Connection info for a plain-text connection from `peer_addr`.
    pub fn new(peer_addr: impl Into<String>) -> Self {
        Self {
            peer_addr: Some(peer_addr.into()),
            tls: false,
        }
    }

    /// Connection info for a TCP peer.
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::new(addr.to_string())
    }

    /// Sets whether TLS was terminated by this process.
    #[must_use]
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }
}

impl<B> InboundRequest for http::Request<B> {
    fn method(&self) -> &str {
        self.method().as_str()
    }

    fn host(&self) -> Option<&str> {
        self.uri().authority().map(|a| a.as_str()).or_else(|| {
            self.headers()
                .get(header::HOST)
                .and_then(|value| value.to_str().ok())
        })
    }

    fn path(&self) -> &str {
        self.uri().path()
    }

    fn raw_query(&self) -> Option<&str> {
        self.uri().query()
    }

    fn headers(&self) -> ValueMap {
        let headers = self.headers();
        let mut map = ValueMap::with_capacity(headers.keys_len());
        for (name, value) in headers {
            map.entry(name.as_str().to_owned())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }
        map
    }

    fn is_tls(&self) -> bool {
        self.extensions()
            .get::<ConnectionInfo>()
            .is_some_and(|info| info.tls)
    }

    fn peer_addr(&self) -> Option<&str> {
        self.extensions()
            .get::<ConnectionInfo>()
            .and_then(|info| info.peer_addr.as_deref())
    }
}
