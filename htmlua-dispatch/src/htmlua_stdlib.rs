use std::{cell::RefCell, fmt::Write, rc::Rc};

use chrono::{Local, Utc};
use chrono_tz::Tz;
use mlua::{Error, Function, Lua, LuaSerdeExt, Table, Value, Variadic};

use crate::{
    output::OutputStack,
    session::{SESSION_COOKIE, SessionStore},
};

const DEFAULT_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%:z";

/// Mutable state a script builds up while it runs.
#[derive(Debug)]
pub struct RequestState {
    pub output: OutputStack,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub session_id: Option<String>,
}

impl RequestState {
    pub fn new(session_id: Option<String>) -> Self {
        Self {
            output: OutputStack::new(),
            status: 200,
            headers: Vec::new(),
            session_id,
        }
    }
}

pub struct StdlibContext {
    pub state: Rc<RefCell<RequestState>>,
    pub timezone: Option<Tz>,
    pub sessions: SessionStore,
}

/// Builds the `htmlua` table for one request. Every function writes into
/// that request's state only.
pub fn create_htmlua_stdlib(l: &Lua, ctx: &StdlibContext) -> mlua::Result<Table> {
    let t = l.create_table()?;

    let state = ctx.state.clone();
    t.set(
        "println",
        l.create_function(move |_, text: mlua::String| {
            let mut state = state.borrow_mut();
            state.output.write(&text.as_bytes());
            state.output.write(b"\n");
            Ok(())
        })?,
    )?;

    let state = ctx.state.clone();
    t.set(
        "print",
        l.create_function(move |_, text: mlua::String| {
            state.borrow_mut().output.write(&text.as_bytes());
            Ok(())
        })?,
    )?;

    create_output_buffering(l, &t, &ctx.state)?;
    create_response_control(l, &t, &ctx.state)?;

    let timezone = ctx.timezone;
    t.set(
        "now",
        l.create_function(move |_, fmt: Option<String>| {
            let fmt = fmt.unwrap_or_else(|| DEFAULT_TIME_FORMAT.to_string());
            let mut out = String::new();
            match timezone {
                Some(tz) => write!(out, "{}", Utc::now().with_timezone(&tz).format(&fmt)),
                None => write!(out, "{}", Local::now().format(&fmt)),
            }
            .map_err(|_| Error::RuntimeError(format!("invalid time format: {fmt}")))?;
            Ok(out)
        })?,
    )?;

    t.set(
        "timezone",
        l.create_function(move |_, ()| Ok(timezone.map_or_else(|| "local".to_string(), |tz| tz.name().to_string())))?,
    )?;

    t.set(
        "decode_json",
        l.create_function(move |l, text: String| {
            let table: serde_json::Value = serde_json::from_str(&text).map_err(|e| Error::RuntimeError(e.to_string()))?;
            l.to_value(&table)
        })?,
    )?;

    t.set(
        "encode_json",
        l.create_function(move |l, value: Value| {
            let json: serde_json::Value = l.from_value(value)?;
            serde_json::to_string(&json).map_err(|e| Error::RuntimeError(e.to_string()))
        })?,
    )?;

    let state = ctx.state.clone();
    let sessions = ctx.sessions.clone();
    t.set(
        "session_start",
        l.create_function(move |_, ()| {
            let mut state = state.borrow_mut();
            if let Some(id) = &state.session_id {
                return Ok(Some(id.clone()));
            }
            if !sessions.is_persistent() {
                return Ok(None);
            }
            let id = sessions.create();
            state
                .headers
                .push(("Set-Cookie".to_string(), format!("{SESSION_COOKIE}={id}; Path=/; HttpOnly")));
            state.session_id = Some(id.clone());
            Ok(Some(id))
        })?,
    )?;

    Ok(t)
}

fn create_output_buffering(l: &Lua, t: &Table, state: &Rc<RefCell<RequestState>>) -> mlua::Result<()> {
    let s = state.clone();
    t.set(
        "ob_start",
        l.create_function(move |_, ()| {
            s.borrow_mut().output.start();
            Ok(())
        })?,
    )?;

    let s = state.clone();
    t.set(
        "ob_get_clean",
        l.create_function(move |l, ()| {
            let captured = s.borrow_mut().output.get_clean();
            captured.map(|bytes| l.create_string(bytes)).transpose()
        })?,
    )?;

    let s = state.clone();
    t.set(
        "ob_end_clean",
        l.create_function(move |_, ()| Ok(s.borrow_mut().output.end_clean()))?,
    )?;

    let s = state.clone();
    t.set(
        "ob_get_level",
        l.create_function(move |_, ()| Ok(s.borrow().output.level()))?,
    )?;
    Ok(())
}

fn create_response_control(l: &Lua, t: &Table, state: &Rc<RefCell<RequestState>>) -> mlua::Result<()> {
    let s = state.clone();
    t.set(
        "status",
        l.create_function(move |_, code: Option<u16>| {
            let mut state = s.borrow_mut();
            if let Some(code) = code {
                if !(100..=599).contains(&code) {
                    return Err(Error::RuntimeError(format!("invalid status code {code}")));
                }
                state.status = code;
            }
            Ok(state.status)
        })?,
    )?;

    let s = state.clone();
    t.set(
        "header",
        l.create_function(move |_, (name, value): (String, String)| {
            if name.is_empty() || [&name, &value].iter().any(|part| part.contains(['\r', '\n'])) {
                return Err(Error::RuntimeError(format!("invalid header {name:?}")));
            }
            s.borrow_mut().headers.push((name, value));
            Ok(())
        })?,
    )?;
    Ok(())
}

/// Replacement for the global `print` that writes to the request output,
/// separating arguments with tabs like the stock Lua `print`.
pub fn create_print(l: &Lua, state: &Rc<RefCell<RequestState>>) -> mlua::Result<Function> {
    let s = state.clone();
    l.create_function(move |l, args: Variadic<Value>| {
        let tostring: Function = l.globals().get("tostring")?;
        let mut line = Vec::new();
        for (i, arg) in args.iter().cloned().enumerate() {
            if i > 0 {
                line.push(b'\t');
            }
            let text: mlua::String = tostring.call(arg)?;
            line.extend_from_slice(&text.as_bytes());
        }
        line.push(b'\n');
        s.borrow_mut().output.write(&line);
        Ok(())
    })
}

/// Writer behind the request's `io.write` and `io.stdout:write`. Accepts
/// strings and numbers only, like the stock `io.write`.
pub fn create_write(l: &Lua, state: &Rc<RefCell<RequestState>>) -> mlua::Result<Function> {
    let s = state.clone();
    l.create_function(move |l, args: Variadic<Value>| {
        let tostring: Function = l.globals().get("tostring")?;
        let mut chunk = Vec::new();
        for (i, arg) in args.iter().cloned().enumerate() {
            match arg {
                Value::String(text) => chunk.extend_from_slice(&text.as_bytes()),
                Value::Integer(_) | Value::Number(_) => {
                    let text: mlua::String = tostring.call(arg)?;
                    chunk.extend_from_slice(&text.as_bytes());
                }
                other => {
                    return Err(Error::RuntimeError(format!(
                        "bad argument #{} to 'write' (string expected, got {})",
                        i + 1,
                        other.type_name()
                    )));
                }
            }
        }
        s.borrow_mut().output.write(&chunk);
        Ok(())
    })
}
