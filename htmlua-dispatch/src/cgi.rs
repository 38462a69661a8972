//! CGI/1.1 glue: builds a [`Request`] from the CGI environment and writes
//! a [`Response`] in CGI response format.

use std::{io::Write, path::PathBuf};

use crate::{
    request::Request,
    response::{Response, reason_phrase},
};

/// Reads a request from CGI meta-variables. `lookup` is usually
/// `|k| std::env::var(k).ok()`; `vars` lists every variable name so `HTTP_*`
/// headers can be recovered.
pub fn request_from_env<F>(lookup: F, vars: &[String], body: Vec<u8>) -> Request
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).unwrap_or_default();

    let script_name = get("SCRIPT_NAME");
    let query = get("QUERY_STRING");
    let uri = lookup("REQUEST_URI").filter(|u| !u.is_empty()).unwrap_or_else(|| {
        let mut uri = format!("{script_name}{}", get("PATH_INFO"));
        if !query.is_empty() {
            uri.push('?');
            uri.push_str(&query);
        }
        uri
    });

    let method = lookup("REQUEST_METHOD").filter(|m| !m.is_empty()).unwrap_or_else(|| "GET".to_string());
    let mut request = Request::new(method, uri).with_script_name(script_name).with_body(body);

    if let Some(root) = lookup("DOCUMENT_ROOT").filter(|r| !r.is_empty()) {
        request = request.with_document_root(PathBuf::from(root));
    }
    if let Some(addr) = lookup("REMOTE_ADDR").filter(|a| !a.is_empty()) {
        request = request.with_remote_addr(addr);
    }
    if let Some(content_type) = lookup("CONTENT_TYPE").filter(|c| !c.is_empty()) {
        request = request.with_header("Content-Type", content_type);
    }
    for name in vars {
        if let Some(header) = name.strip_prefix("HTTP_") {
            if let Some(value) = lookup(name) {
                request = request.with_header(header_name(header), value);
            }
        }
    }
    request
}

/// `ACCEPT_ENCODING` -> `Accept-Encoding`.
fn header_name(cgi_name: &str) -> String {
    cgi_name
        .split('_')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

pub fn write_response<W: Write>(out: &mut W, response: &Response) -> std::io::Result<()> {
    write!(out, "Status: {} {}\r\n", response.status, reason_phrase(response.status))?;
    for (name, value) in &response.headers {
        write!(out, "{name}: {value}\r\n")?;
    }
    out.write_all(b"\r\n")?;
    out.write_all(&response.body)?;
    out.flush()
}
