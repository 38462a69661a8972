use std::path::Path;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("not found: {0}")]
    NotFound(#[from] NotFound),

    #[error("script execution failed: {0}")]
    Execution(#[from] ScriptFault),

    #[error("interpreter error: {0}")]
    Runtime(#[from] mlua::Error),
}

/// Why a request was answered with 404.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFound {
    #[error("no file or front controller matches the request")]
    NoTarget,

    #[error("resolved path escapes the document root")]
    OutsideDocumentRoot,

    #[error("resolved file is not a script")]
    NotAScript,
}

/// An error raised while a script was running, with its origin.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} in {file}:{line}")]
pub struct ScriptFault {
    pub message: String,
    pub file: String,
    pub line: u32,
    pub traceback: String,
}

const TRACEBACK_MARKER: &str = "stack traceback:";

impl ScriptFault {
    /// Builds a fault from a Lua error. Lua reports script errors as
    /// `<file>:<line>: <message>` optionally followed by a traceback. Errors
    /// raised by native functions carry no location, so the line comes from
    /// the innermost traceback frame in `script`, or 0 if there is none.
    pub fn from_lua(err: &mlua::Error, script: &Path) -> Self {
        let (raw, mut traceback) = match err {
            mlua::Error::CallbackError { traceback, cause } => (plain_message(cause), traceback.clone()),
            other => (plain_message(other), String::new()),
        };

        let head = match raw.find(TRACEBACK_MARKER) {
            Some(idx) => {
                if traceback.is_empty() {
                    traceback = raw[idx..].trim_end().to_string();
                }
                raw[..idx].trim_end().to_string()
            }
            None => raw.trim_end().to_string(),
        };

        let (file, line, message) = split_location(&head).unwrap_or_else(|| {
            let line = script_frame(&traceback, script).unwrap_or(0);
            (script.display().to_string(), line, head.clone())
        });

        Self { message, file, line, traceback }
    }

    /// A fault raised by the dispatcher itself rather than by script code.
    pub fn internal(message: impl Into<String>, script: &Path) -> Self {
        Self {
            message: message.into(),
            file: script.display().to_string(),
            line: 0,
            traceback: String::new(),
        }
    }
}

fn plain_message(err: &mlua::Error) -> String {
    match innermost(err) {
        mlua::Error::RuntimeError(message) | mlua::Error::MemoryError(message) => message.clone(),
        mlua::Error::SyntaxError { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

fn innermost(err: &mlua::Error) -> &mlua::Error {
    match err {
        mlua::Error::CallbackError { cause, .. } | mlua::Error::WithContext { cause, .. } => innermost(cause),
        other => other,
    }
}

/// Splits `path/to/file.lua:12: message` into its parts.
fn split_location(head: &str) -> Option<(String, u32, String)> {
    let first_line = head.lines().next()?;

    let mut search_from = 0;
    while let Some(offset) = first_line[search_from..].find(':') {
        let colon = search_from + offset;
        let rest = &first_line[colon + 1..];
        let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
        if !digits.is_empty() && rest[digits.len()..].starts_with(": ") && colon > 0 {
            let line = digits.parse().ok()?;
            let mut message = rest[digits.len() + 2..].to_string();
            for extra in head.lines().skip(1) {
                message.push('\n');
                message.push_str(extra);
            }
            return Some((first_line[..colon].to_string(), line, message));
        }
        search_from = colon + 1;
    }
    None
}

/// Line of the innermost traceback frame that belongs to `script`.
fn script_frame(traceback: &str, script: &Path) -> Option<u32> {
    let script = script.display().to_string();
    traceback.lines().find_map(|frame| {
        let (file, line, _) = split_location(frame.trim())?;
        same_source(&file, &script).then_some(line)
    })
}

/// Lua shortens long chunk names to `...<tail>` in tracebacks.
fn same_source(frame_file: &str, script: &str) -> bool {
    match frame_file.strip_prefix("...") {
        Some(tail) => script.ends_with(tail),
        None => frame_file == script,
    }
}
