//! Structured HTTP/1.1 messages.
//!
//! Requests and responses keep their headers as an ordered sequence of
//! name/value pairs with the original casing, because the proxy must forward
//! traffic as close to byte-identical as it can. Lookup helpers are
//! case-insensitive. Bodies are fully buffered [`Bytes`]; the codec enforces
//! the size ceiling before they get here.

use std::fmt;
use std::net::IpAddr;

use base64::Engine as _;
use bytes::Bytes;
use serde::{Serialize, Serializer};

/// A single header line, order- and case-preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Ordered header sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push(Header {
            name: name.into(),
            value: value.into(),
        });
    }

    /// First value for `name`, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Replace the first occurrence of `name` (dropping any further
    /// duplicates), or append if absent.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        let mut seen = false;
        self.0.retain_mut(|h| {
            if h.name.eq_ignore_ascii_case(name) {
                if seen {
                    return false;
                }
                h.value = value.clone();
                seen = true;
            }
            true
        });
        if !seen {
            self.push(name.to_string(), value);
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|h| !h.name.eq_ignore_ascii_case(name));
    }

    /// True if any comma-separated element of any `name` header equals
    /// `token`, case-insensitive. Used for `Connection` and
    /// `Transfer-Encoding` checks.
    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Append a folded continuation line onto the header at `index`,
    /// separated by a single space.
    pub(crate) fn fold_into(&mut self, index: usize, continuation: &str) {
        if let Some(header) = self.0.get_mut(index) {
            if !header.value.is_empty() {
                header.value.push(' ');
            }
            header.value.push_str(continuation);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Headers(
            iter.into_iter()
                .map(|(name, value)| Header { name, value })
                .collect(),
        )
    }
}

/// URL scheme understood by the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Absolute URL with the components the proxy needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Always begins with `/`.
    pub path: String,
    pub query: Option<String>,
}

impl Url {
    /// Parse an absolute-form URL (`http://host[:port]/path?query`).
    pub fn parse(input: &str) -> Option<Url> {
        let (scheme, rest) = if let Some(rest) = input.strip_prefix("http://") {
            (Scheme::Http, rest)
        } else if let Some(rest) = input.strip_prefix("https://") {
            (Scheme::Https, rest)
        } else {
            return None;
        };

        let (authority, path_and_query) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        let (host, port) = parse_authority(authority, Some(scheme.default_port()))?;
        let (path, query) = split_path_and_query(path_and_query);
        Some(Url {
            scheme,
            host,
            port,
            path,
            query,
        })
    }

    /// Build a URL from an authority string (`host[:port]`) plus an
    /// origin-form target, e.g. for requests seen inside a tunnel.
    pub fn from_authority(scheme: Scheme, authority: &str, path_and_query: &str) -> Option<Url> {
        let (host, port) = parse_authority(authority, Some(scheme.default_port()))?;
        let (path, query) = split_path_and_query(path_and_query);
        Some(Url {
            scheme,
            host,
            port,
            path,
            query,
        })
    }

    /// `host[:port]`, omitting the scheme's default port.
    pub fn authority(&self) -> String {
        let host = self.bracketed_host();
        if self.port == self.scheme.default_port() {
            host.into_owned()
        } else {
            format!("{}:{}", host, self.port)
        }
    }

    /// `host:port`, always explicit. Suitable for `TcpStream::connect`.
    pub fn host_port(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }

    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }

    fn bracketed_host(&self) -> std::borrow::Cow<'_, str> {
        if self.host.contains(':') {
            std::borrow::Cow::Owned(format!("[{}]", self.host))
        } else {
            std::borrow::Cow::Borrowed(&self.host)
        }
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.authority(), self.path)?;
        if let Some(q) = &self.query {
            write!(f, "?{q}")?;
        }
        Ok(())
    }
}

impl Serialize for Url {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Parse `host[:port]`, handling bracketed IPv6 literals. Returns `None` when
/// a port is required (`default_port` is `None`) but missing, or when the
/// port does not parse.
pub fn parse_authority(input: &str, default_port: Option<u16>) -> Option<(String, u16)> {
    if input.is_empty() {
        return None;
    }
    if let Some(rest) = input.strip_prefix('[') {
        // Bracketed IPv6: [::1]:443
        let close = rest.find(']')?;
        let host = &rest[..close];
        host.parse::<IpAddr>().ok()?;
        let after = &rest[close + 1..];
        let port = match after.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None if after.is_empty() => default_port?,
            None => return None,
        };
        return Some((host.to_string(), port));
    }
    match input.rsplit_once(':') {
        // A second colon means an unbracketed IPv6 literal with no port.
        Some((host, _)) if host.contains(':') => {
            input.parse::<IpAddr>().ok()?;
            Some((input.to_string(), default_port?))
        }
        Some((host, port)) => {
            if host.is_empty() {
                return None;
            }
            Some((host.to_string(), port.parse().ok()?))
        }
        None => Some((input.to_string(), default_port?)),
    }
}

fn split_path_and_query(input: &str) -> (String, Option<String>) {
    match input.split_once('?') {
        Some((path, query)) => (path.to_string(), Some(query.to_string())),
        None => (input.to_string(), None),
    }
}

/// The request-target as it appeared on the request line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestTarget {
    /// `GET /path?q=1`, the normal in-tunnel and origin-server form.
    Origin { path_and_query: String },
    /// `GET http://host/path`, the proxy form.
    Absolute(Url),
    /// `CONNECT host:port`, exposed verbatim with no URL required.
    Authority(String),
    /// `OPTIONS *`.
    Asterisk,
}

impl RequestTarget {
    pub fn as_absolute(&self) -> Option<&Url> {
        match self {
            RequestTarget::Absolute(url) => Some(url),
            _ => None,
        }
    }
}

impl fmt::Display for RequestTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestTarget::Origin { path_and_query } => f.write_str(path_and_query),
            RequestTarget::Absolute(url) => write!(f, "{url}"),
            RequestTarget::Authority(authority) => f.write_str(authority),
            RequestTarget::Asterisk => f.write_str("*"),
        }
    }
}

/// HTTP version. Only 1.0 and 1.1 are spoken; anything else is rejected at
/// parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }

    pub fn parse(input: &str) -> Option<Version> {
        match input {
            "HTTP/1.0" => Some(Version::Http10),
            "HTTP/1.1" => Some(Version::Http11),
            _ => None,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn serialize_body<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(body))
}

/// A parsed HTTP request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HttpRequest {
    pub method: String,
    pub target: RequestTarget,
    pub version: Version,
    pub headers: Headers,
    #[serde(serialize_with = "serialize_body")]
    pub body: Bytes,
}

impl HttpRequest {
    pub fn is_connect(&self) -> bool {
        self.method == "CONNECT"
    }

    /// Whether this side of the exchange permits connection reuse.
    pub fn wants_keep_alive(&self) -> bool {
        if self.headers.contains_token("Connection", "close") {
            return false;
        }
        if self.headers.contains_token("Connection", "keep-alive") {
            return true;
        }
        self.version == Version::Http11
    }

    /// Resolve the absolute URL for this request: either the absolute-form
    /// target, or the origin-form target joined with the `Host` header.
    pub fn url(&self, scheme: Scheme) -> Option<Url> {
        match &self.target {
            RequestTarget::Absolute(url) => Some(url.clone()),
            RequestTarget::Origin { path_and_query } => {
                let host = self.headers.get("Host")?;
                Url::from_authority(scheme, host, path_and_query)
            }
            _ => None,
        }
    }
}

/// A parsed HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HttpResponse {
    pub version: Version,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    #[serde(serialize_with = "serialize_body")]
    pub body: Bytes,
}

impl HttpResponse {
    /// Build a proxy-synthesized response, e.g. a `502 Bad Gateway` when the
    /// origin is unreachable.
    pub fn synthetic(status: u16, reason: &str, body: &str) -> HttpResponse {
        let mut headers = Headers::new();
        headers.push("Content-Type", "text/plain; charset=utf-8");
        headers.push("Content-Length", body.len().to_string());
        headers.push("Connection", "close");
        HttpResponse {
            version: Version::Http11,
            status,
            reason: reason.to_string(),
            headers,
            body: Bytes::copy_from_slice(body.as_bytes()),
        }
    }

    /// True when a response to `method` with this status carries no body.
    pub fn has_no_body(&self, head_request: bool) -> bool {
        head_request || self.status == 204 || self.status == 304 || (100..200).contains(&self.status)
    }

    fn has_framing_headers(&self) -> bool {
        self.headers.get("Content-Length").is_some()
            || self.headers.contains_token("Transfer-Encoding", "chunked")
    }

    /// Whether the upstream connection may be reused after this response.
    /// A response delimited by connection close never allows reuse.
    pub fn allows_keep_alive(&self, head_request: bool) -> bool {
        if self.headers.contains_token("Connection", "close") {
            return false;
        }
        if !self.has_framing_headers() && !self.has_no_body(head_request) {
            return false;
        }
        if self.headers.contains_token("Connection", "keep-alive") {
            return true;
        }
        self.version == Version::Http11
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_preserve_order_and_case() {
        let mut headers = Headers::new();
        headers.push("X-First", "1");
        headers.push("Host", "example.com");
        headers.push("x-first", "2");

        let names: Vec<&str> = headers.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["X-First", "Host", "x-first"]);
        assert_eq!(headers.get("X-FIRST"), Some("1"));
        assert_eq!(headers.get_all("x-first").count(), 2);
    }

    #[test]
    fn headers_set_replaces_and_dedupes() {
        let mut headers = Headers::new();
        headers.push("Host", "a");
        headers.push("Accept", "*/*");
        headers.push("host", "b");

        headers.set("Host", "c");
        assert_eq!(headers.get_all("host").collect::<Vec<_>>(), vec!["c"]);
        assert_eq!(headers.len(), 2);

        headers.set("X-New", "yes");
        assert_eq!(headers.get("x-new"), Some("yes"));
    }

    #[test]
    fn connection_token_matching() {
        let mut headers = Headers::new();
        headers.push("Connection", "Keep-Alive, Upgrade");
        assert!(headers.contains_token("Connection", "keep-alive"));
        assert!(headers.contains_token("connection", "upgrade"));
        assert!(!headers.contains_token("Connection", "close"));
    }

    #[test]
    fn url_parse_roundtrip() {
        let url = Url::parse("http://origin.test/a").unwrap();
        assert_eq!(url.scheme, Scheme::Http);
        assert_eq!(url.host, "origin.test");
        assert_eq!(url.port, 80);
        assert_eq!(url.path, "/a");
        assert_eq!(url.to_string(), "http://origin.test/a");

        let url = Url::parse("https://origin.test:8443/b?x=1&y=2").unwrap();
        assert_eq!(url.port, 8443);
        assert_eq!(url.query.as_deref(), Some("x=1&y=2"));
        assert_eq!(url.to_string(), "https://origin.test:8443/b?x=1&y=2");
        assert_eq!(url.path_and_query(), "/b?x=1&y=2");
    }

    #[test]
    fn url_without_path_gets_root() {
        let url = Url::parse("http://origin.test").unwrap();
        assert_eq!(url.path, "/");
    }

    #[test]
    fn authority_parsing() {
        assert_eq!(
            parse_authority("origin.test:443", None),
            Some(("origin.test".to_string(), 443))
        );
        assert_eq!(parse_authority("origin.test", None), None);
        assert_eq!(
            parse_authority("origin.test", Some(80)),
            Some(("origin.test".to_string(), 80))
        );
        assert_eq!(
            parse_authority("[::1]:8443", None),
            Some(("::1".to_string(), 8443))
        );
        assert_eq!(parse_authority("origin.test:notaport", None), None);
        assert_eq!(parse_authority("", Some(80)), None);
    }

    #[test]
    fn keep_alive_defaults_by_version() {
        let req = HttpRequest {
            method: "GET".to_string(),
            target: RequestTarget::Origin {
                path_and_query: "/".to_string(),
            },
            version: Version::Http11,
            headers: Headers::new(),
            body: Bytes::new(),
        };
        assert!(req.wants_keep_alive());

        let mut old = req.clone();
        old.version = Version::Http10;
        assert!(!old.wants_keep_alive());
        old.headers.push("Connection", "keep-alive");
        assert!(old.wants_keep_alive());
    }

    #[test]
    fn close_delimited_response_never_keeps_alive() {
        let mut resp = HttpResponse::synthetic(200, "OK", "hello");
        resp.headers.remove("Connection");
        assert!(resp.allows_keep_alive(false));

        resp.headers.remove("Content-Length");
        assert!(!resp.allows_keep_alive(false));
        // ...unless the status forbids a body anyway.
        resp.status = 204;
        assert!(resp.allows_keep_alive(false));
    }

    #[test]
    fn synthetic_responses_are_well_formed() {
        let resp = HttpResponse::synthetic(502, "Bad Gateway", "upstream unreachable");
        assert_eq!(resp.status, 502);
        assert_eq!(
            resp.headers.get("Content-Length").unwrap(),
            resp.body.len().to_string()
        );
        assert!(resp.headers.contains_token("Connection", "close"));
    }
}
