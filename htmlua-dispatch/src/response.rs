use crate::error::ScriptFault;

pub const DEFAULT_CONTENT_TYPE: &str = "text/html; charset=utf-8";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Fault detail, present only on 500s produced with debug output on.
    pub trace: Option<String>,
}

impl Response {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
            trace: None,
        }
    }

    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::new(200, body).with_header("Content-Type", DEFAULT_CONTENT_TYPE)
    }

    pub fn not_found() -> Self {
        Self::new(404, "404 Not Found").with_header("Content-Type", "text/plain; charset=utf-8")
    }

    pub fn not_a_script() -> Self {
        Self::new(404, "File not found or not a script file").with_header("Content-Type", "text/plain; charset=utf-8")
    }

    /// Generic 500. With `debug` the fault's message, origin and traceback
    /// are appended to the body.
    pub fn internal_error(fault: &ScriptFault, debug: bool) -> Self {
        let mut body = String::from("Internal Server Error");
        let mut trace = None;
        if debug {
            body.push_str(&format!(
                "\n\nDEBUG INFO:\nError: {}\nFile: {}\nLine: {}\nTrace:\n{}",
                fault.message, fault.file, fault.line, fault.traceback
            ));
            trace = Some(fault.traceback.clone());
        }
        Self {
            trace,
            ..Self::new(500, body).with_header("Content-Type", "text/plain; charset=utf-8")
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        410 => "Gone",
        413 => "Payload Too Large",
        415 => "Unsupported Media Type",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}
