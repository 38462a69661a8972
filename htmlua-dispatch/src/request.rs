//! Inbound request model and the per-request scope handed to scripts.
//!
//! A [`RequestScope`] is built fresh for every request and dropped when the
//! request ends; nothing in it is shared with any other request.

use std::{collections::BTreeMap, path::Path};

use url::form_urlencoded;

pub type Fields = BTreeMap<String, String>;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// A request as handed over by the front-end (HTTP worker or CGI).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    /// Raw request URI, query string included.
    pub uri: String,
    pub headers: Vec<(String, String)>,
    /// Script-name hint; stripped from the path when it prefixes it.
    pub script_name: String,
    /// Overrides the configured document root when set.
    pub document_root: Option<std::path::PathBuf>,
    pub body: Vec<u8>,
    pub remote_addr: Option<String>,
}

impl Request {
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            uri: uri.into(),
            ..Self::default()
        }
    }

    pub fn get(uri: impl Into<String>) -> Self { Self::new("GET", uri) }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn with_script_name(mut self, script_name: impl Into<String>) -> Self {
        self.script_name = script_name.into();
        self
    }

    #[must_use]
    pub fn with_document_root(mut self, root: impl Into<std::path::PathBuf>) -> Self {
        self.document_root = Some(root.into());
        self
    }

    #[must_use]
    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    /// First header with the given name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// The routing-relevant parts of a request URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget {
    /// Raw path; never percent-decoded or normalized.
    pub path: String,
    /// Raw query string without the leading `?`.
    pub query: String,
}

impl RequestTarget {
    pub fn parse(uri: &str) -> Self {
        let uri = uri.split_once('#').map_or(uri, |(before, _)| before);
        let uri = strip_authority(uri);
        let (path, query) = match uri.split_once('?') {
            Some((path, query)) => (path, query),
            None => (uri, ""),
        };
        let path = if path.is_empty() { "/" } else { path };
        Self {
            path: path.to_string(),
            query: query.to_string(),
        }
    }

    pub fn strip_script_name(&mut self, hint: &str) {
        if hint.is_empty() {
            return;
        }
        if let Some(rest) = self.path.strip_prefix(hint) {
            self.path = if rest.starts_with('/') { rest.to_string() } else { format!("/{rest}") };
        }
    }
}

/// Drops `scheme://authority` from an absolute-form request target.
fn strip_authority(uri: &str) -> &str {
    for scheme in ["http://", "https://"] {
        if let Some(rest) = uri.strip_prefix(scheme) {
            return rest.find(['/', '?']).map_or("", |idx| &rest[idx..]);
        }
    }
    uri
}

/// Request-scoped variables exposed to a script as the `request` table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestScope {
    pub method: String,
    pub uri: String,
    pub path: String,
    pub query: Fields,
    pub form: Fields,
    /// `query` merged with `form`; form values win.
    pub request: Fields,
    pub cookies: Fields,
    /// Lower-cased header names.
    pub headers: Fields,
    pub server: Fields,
    pub body: Vec<u8>,
}

impl RequestScope {
    pub fn from_request(request: &Request, target: &RequestTarget, document_root: &Path) -> Self {
        let query = parse_urlencoded(target.query.as_bytes());

        let is_form = request
            .header("content-type")
            .and_then(|ct| ct.split(';').next())
            .is_some_and(|mime| mime.trim().eq_ignore_ascii_case(FORM_CONTENT_TYPE));
        let form = if is_form { parse_urlencoded(&request.body) } else { Fields::new() };

        let mut merged = query.clone();
        merged.extend(form.iter().map(|(k, v)| (k.clone(), v.clone())));

        let cookies = request.header("cookie").map(parse_cookies).unwrap_or_default();

        let headers = request
            .headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
            .collect();

        let mut server = Fields::new();
        server.insert("REQUEST_METHOD".into(), request.method.clone());
        server.insert("REQUEST_URI".into(), request.uri.clone());
        server.insert("QUERY_STRING".into(), target.query.clone());
        server.insert("SCRIPT_NAME".into(), request.script_name.clone());
        server.insert("DOCUMENT_ROOT".into(), document_root.display().to_string());
        if let Some(addr) = &request.remote_addr {
            server.insert("REMOTE_ADDR".into(), addr.clone());
        }

        Self {
            method: request.method.clone(),
            uri: request.uri.clone(),
            path: target.path.clone(),
            query,
            form,
            request: merged,
            cookies,
            headers,
            server,
            body: request.body.clone(),
        }
    }
}

fn parse_urlencoded(input: &[u8]) -> Fields {
    form_urlencoded::parse(input).into_owned().collect()
}

fn parse_cookies(header: &str) -> Fields {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .filter(|(name, _)| !name.is_empty())
        .map(|(name, value)| (name.to_string(), value.trim_matches('"').to_string()))
        .collect()
}
