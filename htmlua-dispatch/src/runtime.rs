//! The long-lived Lua interpreter a worker runs scripts in.
//!
//! One [`ScriptRuntime`] serves many requests. Each request runs in its own
//! environment table that falls back to the shared globals for reads, with
//! its own copies of the standard library tables and an `io` whose output
//! goes to the response. Metatables that would lead back to shared state
//! are locked, so whatever a script changes disappears with the request.

use std::{cell::RefCell, rc::Rc};

use chrono_tz::Tz;
use mlua::{Function, Lua, LuaSerdeExt, Table, Value};
use tracing::{debug, warn};

use crate::{
    config::WorkerConfig,
    error::{DispatchError, ScriptFault},
    htmlua_stdlib::{RequestState, StdlibContext, create_htmlua_stdlib, create_print, create_write},
    request::{Fields, RequestScope},
    resolve::ResolvedTarget,
    response::DEFAULT_CONTENT_TYPE,
    session::{SESSION_COOKIE, SessionData, SessionStore},
};

const SANDBOX: &str = include_str!("sandbox.lua");

/// What a successful script run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOutput {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

pub struct ScriptRuntime {
    lua: Lua,
    sandbox: Function,
    timezone: Option<Tz>,
}

impl ScriptRuntime {
    pub fn new(config: &WorkerConfig) -> mlua::Result<Self> {
        let lua = Lua::new();
        lua.set_memory_limit(config.memory_limit)?;

        let os: Table = lua.globals().get("os")?;
        os.set("exit", Value::Nil)?;

        let sandbox: Function = lua.load(SANDBOX).set_name("=sandbox").call(())?;

        Ok(Self {
            lua,
            sandbox,
            timezone: resolve_timezone(config.timezone.as_deref()),
        })
    }

    pub fn timezone(&self) -> Option<Tz> { self.timezone }

    /// Runs the script at `target` with `scope` bound as `request`.
    ///
    /// Errors raised by the script become [`DispatchError::Execution`];
    /// failures while preparing or collecting the request are
    /// [`DispatchError::Runtime`].
    pub fn execute(
        &self,
        target: &ResolvedTarget,
        scope: &RequestScope,
        sessions: &SessionStore,
    ) -> Result<ScriptOutput, DispatchError> {
        let session_id = scope
            .cookies
            .get(SESSION_COOKIE)
            .filter(|id| sessions.contains(id))
            .cloned();
        let session = session_id
            .as_deref()
            .and_then(|id| sessions.load(id))
            .unwrap_or_default();

        let ctx = StdlibContext {
            state: Rc::new(RefCell::new(RequestState::new(session_id))),
            timezone: self.timezone,
            sessions: sessions.clone(),
        };

        let request = self.request_table(target, scope, &session)?;
        let env = self.environment(&ctx, request.clone())?;

        self.lua
            .load(target.path.as_path())
            .set_environment(env)
            .exec()
            .map_err(|e| ScriptFault::from_lua(&e, &target.path))?;

        Ok(self.collect(&ctx, &request, sessions)?)
    }

    /// Full collection pass; run between requests.
    pub fn collect_garbage(&self) -> mlua::Result<()> {
        self.lua.gc_collect()
    }

    pub fn used_memory(&self) -> usize {
        self.lua.used_memory()
    }

    fn collect(&self, ctx: &StdlibContext, request: &Table, sessions: &SessionStore) -> mlua::Result<ScriptOutput> {
        let mut state = ctx.state.borrow_mut();
        if let Some(id) = state.session_id.clone() {
            match self.lua.from_value::<serde_json::Value>(request.get("session")?) {
                Ok(serde_json::Value::Object(data)) => sessions.store(&id, data),
                Ok(serde_json::Value::Array(items)) if items.is_empty() => sessions.store(&id, SessionData::new()),
                Ok(other) => warn!(session = %id, kind = %json_kind(&other), "request.session is not a table, not saved"),
                Err(e) => warn!(session = %id, error = %e, "failed to read request.session, not saved"),
            }
        }

        let mut headers = std::mem::take(&mut state.headers);
        if !headers.iter().any(|(name, _)| name.eq_ignore_ascii_case("content-type")) {
            headers.insert(0, ("Content-Type".to_string(), DEFAULT_CONTENT_TYPE.to_string()));
        }
        let output = std::mem::take(&mut state.output);
        Ok(ScriptOutput {
            status: state.status,
            headers,
            body: output.finish(),
        })
    }

    fn environment(&self, ctx: &StdlibContext, request: Table) -> mlua::Result<Table> {
        let lua = &self.lua;
        let env = lua.create_table()?;
        let meta = lua.create_table()?;
        meta.set("__index", lua.globals())?;
        meta.set("__metatable", false)?;
        env.set_metatable(Some(meta));

        self.sandbox.call::<()>((env.clone(), create_write(lua, &ctx.state)?))?;

        env.set("_G", env.clone())?;
        env.set("print", create_print(lua, &ctx.state)?)?;
        env.set("htmlua", create_htmlua_stdlib(lua, ctx)?)?;
        env.set("request", request)?;
        Ok(env)
    }

    fn request_table(&self, target: &ResolvedTarget, scope: &RequestScope, session: &SessionData) -> mlua::Result<Table> {
        let lua = &self.lua;
        let t = lua.create_table()?;
        t.set("method", scope.method.as_str())?;
        t.set("uri", scope.uri.as_str())?;
        t.set("path", scope.path.as_str())?;
        t.set("query", fields_table(lua, &scope.query)?)?;
        t.set("form", fields_table(lua, &scope.form)?)?;
        t.set("params", fields_table(lua, &scope.request)?)?;
        t.set("cookies", fields_table(lua, &scope.cookies)?)?;
        t.set("headers", fields_table(lua, &scope.headers)?)?;
        t.set("body", lua.create_string(&scope.body)?)?;

        let server = fields_table(lua, &scope.server)?;
        server.set("SCRIPT_FILENAME", target.path.display().to_string())?;
        server.set("SELF", target.self_path.as_str())?;
        t.set("server", server)?;

        let session_table = if session.is_empty() {
            lua.create_table()?
        } else {
            match lua.to_value(session)? {
                Value::Table(table) => table,
                _ => lua.create_table()?,
            }
        };
        t.set("session", session_table)?;
        Ok(t)
    }
}

fn fields_table(lua: &Lua, fields: &Fields) -> mlua::Result<Table> {
    lua.create_table_from(fields.iter().map(|(k, v)| (k.as_str(), v.as_str())))
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Parses a timezone identifier; `None` or an unknown name means the
/// system timezone.
pub fn resolve_timezone(name: Option<&str>) -> Option<Tz> {
    let name = name?;
    match name.parse::<Tz>() {
        Ok(tz) => {
            debug!(timezone = %tz.name(), "using configured timezone");
            Some(tz)
        }
        Err(e) => {
            warn!(timezone = %name, error = %e, "unknown timezone, using system default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ScriptConfig,
        request::{Request, RequestTarget},
        resolve::resolve,
    };
    use std::{fs, path::Path};

    fn run_script(root: &Path, source: &str, request: &Request, sessions: &SessionStore) -> Result<ScriptOutput, ScriptFault> {
        fs::write(root.join("index.lua"), source).unwrap();
        let runtime = ScriptRuntime::new(&WorkerConfig::default()).unwrap();
        run_with(&runtime, root, request, sessions)
    }

    fn run_with(runtime: &ScriptRuntime, root: &Path, request: &Request, sessions: &SessionStore) -> Result<ScriptOutput, ScriptFault> {
        let target_uri = RequestTarget::parse(&request.uri);
        let target = resolve(&target_uri.path, root, &ScriptConfig::default()).unwrap();
        let scope = RequestScope::from_request(request, &target_uri, root);
        runtime.execute(&target, &scope, sessions).map_err(|e| match e {
            DispatchError::Execution(fault) => fault,
            other => panic!("expected a script fault, got {other}"),
        })
    }

    fn body(output: &ScriptOutput) -> String { String::from_utf8_lossy(&output.body).into_owned() }

    #[test]
    fn captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_script(
            dir.path(),
            r#"
                htmlua.print("a")
                htmlua.println("b")
                print("c", 1, true)
            "#,
            &Request::get("/"),
            &SessionStore::new(),
        )
        .unwrap();
        assert_eq!(out.status, 200);
        assert_eq!(body(&out), "ab\nc\t1\ttrue\n");
        assert_eq!(out.headers[0], ("Content-Type".to_string(), DEFAULT_CONTENT_TYPE.to_string()));
    }

    #[test]
    fn exposes_request_variables() {
        let dir = tempfile::tempdir().unwrap();
        let request = Request::new("POST", "/orders?page=3")
            .with_header("Content-Type", "application/x-www-form-urlencoded")
            .with_header("Cookie", "theme=dark")
            .with_body("item=tea");
        let out = run_script(
            dir.path(),
            r#"
                htmlua.print(table.concat({
                    request.method, request.path, request.query.page, request.form.item,
                    request.params.item, request.cookies.theme, request.server.SELF,
                    request.server.QUERY_STRING, request.body,
                }, "|"))
            "#,
            &request,
            &SessionStore::new(),
        )
        .unwrap();
        assert_eq!(body(&out), "POST|/orders|3|tea|tea|dark|/index.lua|page=3|item=tea");
    }

    #[test]
    fn status_and_headers() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_script(
            dir.path(),
            r#"
                htmlua.status(201)
                htmlua.header("Content-Type", "application/json")
                htmlua.header("X-Trace", "abc")
                htmlua.print(htmlua.encode_json({ ok = true }))
            "#,
            &Request::get("/"),
            &SessionStore::new(),
        )
        .unwrap();
        assert_eq!(out.status, 201);
        assert_eq!(
            out.headers,
            vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("X-Trace".to_string(), "abc".to_string()),
            ]
        );
        assert_eq!(body(&out), r#"{"ok":true}"#);
    }

    #[test]
    fn invalid_status_is_a_fault() {
        let dir = tempfile::tempdir().unwrap();
        let fault = run_script(
            dir.path(),
            "local code = 42\nhtmlua.status(code)\n",
            &Request::get("/"),
            &SessionStore::new(),
        )
        .unwrap_err();
        assert!(fault.message.contains("invalid status code 42"), "{fault:?}");
        assert_eq!(fault.line, 2, "{fault:?}");
        assert!(fault.file.ends_with("index.lua"), "{fault:?}");
    }

    #[test]
    fn callback_fault_reports_script_line() {
        let dir = tempfile::tempdir().unwrap();
        let fault = run_script(
            dir.path(),
            "local a = 1\nlocal b = 2\nlocal v = htmlua.decode_json(\"{not json\")\n",
            &Request::get("/"),
            &SessionStore::new(),
        )
        .unwrap_err();
        assert_eq!(fault.line, 3, "{fault:?}");
        assert!(fault.traceback.contains("index.lua:3:"), "{fault:?}");
    }

    #[test]
    fn header_injection_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let fault = run_script(
            dir.path(),
            r#"htmlua.header("X-A", "ok\r\nSet-Cookie: evil=1")"#,
            &Request::get("/"),
            &SessionStore::new(),
        )
        .unwrap_err();
        assert!(fault.message.contains("invalid header"), "{fault:?}");
        assert_eq!(fault.line, 1, "{fault:?}");
    }

    #[test]
    fn nested_output_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_script(
            dir.path(),
            r#"
                htmlua.print("<")
                htmlua.ob_start()
                htmlua.print("inner")
                local captured = htmlua.ob_get_clean()
                htmlua.print(string.upper(captured))
                htmlua.ob_start()
                htmlua.print("dropped")
                htmlua.ob_end_clean()
                htmlua.ob_start()
                htmlua.ob_start()
                htmlua.print(htmlua.ob_get_level())
                htmlua.print(">")
            "#,
            &Request::get("/"),
            &SessionStore::new(),
        )
        .unwrap();
        assert_eq!(body(&out), "<INNER2>");
    }

    #[test]
    fn runtime_error_reports_location() {
        let dir = tempfile::tempdir().unwrap();
        let fault = run_script(
            dir.path(),
            "local x = 1\nlocal y = 2\nerror(\"kaboom\")\n",
            &Request::get("/"),
            &SessionStore::new(),
        )
        .unwrap_err();
        assert_eq!(fault.message, "kaboom");
        assert_eq!(fault.line, 3);
        assert!(fault.file.ends_with("index.lua"), "{fault:?}");
    }

    #[test]
    fn syntax_error_is_a_fault() {
        let dir = tempfile::tempdir().unwrap();
        let fault = run_script(dir.path(), "local = = 1", &Request::get("/"), &SessionStore::new()).unwrap_err();
        assert_eq!(fault.line, 1);
        assert!(fault.file.ends_with("index.lua"), "{fault:?}");
    }

    #[test]
    fn globals_do_not_leak_between_requests() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("index.lua"),
            r#"
                htmlua.print(tostring(leaked) .. "|" .. tostring(request.form.name))
                leaked = request.form.name
                _G.also_leaked = true
            "#,
        )
        .unwrap();
        let runtime = ScriptRuntime::new(&WorkerConfig::default()).unwrap();
        let sessions = SessionStore::new();

        let first = Request::new("POST", "/")
            .with_header("Content-Type", "application/x-www-form-urlencoded")
            .with_body("name=alice");
        let out = run_with(&runtime, dir.path(), &first, &sessions).unwrap();
        assert_eq!(body(&out), "nil|alice");

        let out = run_with(&runtime, dir.path(), &Request::get("/"), &sessions).unwrap();
        assert_eq!(body(&out), "nil|nil");

        let globals = runtime.lua.globals();
        assert!(globals.get::<Value>("leaked").unwrap().is_nil());
        assert!(globals.get::<Value>("also_leaked").unwrap().is_nil());
    }

    #[test]
    fn shared_tables_do_not_leak_between_requests() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("index.lua"),
            r#"
                htmlua.print(table.concat({
                    tostring(string.stash), tostring(string.required), tostring(("").stash),
                    tostring(via_meta), tostring(from_load), tostring(from_package),
                    tostring(getmetatable(_G)), tostring(getmetatable("")),
                }, "|"))
                local secret = request.form.secret
                string.stash = secret
                require("string").required = secret
                pcall(function() getmetatable(_G).__index.via_meta = secret end)
                pcall(function() getmetatable("").__index.stash = secret end)
                load("from_load = ...")(secret)
                package.loaded._G.from_package = secret
                math.pi = secret
            "#,
        )
        .unwrap();
        let runtime = ScriptRuntime::new(&WorkerConfig::default()).unwrap();
        let sessions = SessionStore::new();
        let clean = "nil|nil|nil|nil|nil|nil|false|false";

        let first = Request::new("POST", "/")
            .with_header("Content-Type", "application/x-www-form-urlencoded")
            .with_body("secret=hunter2");
        assert_eq!(body(&run_with(&runtime, dir.path(), &first, &sessions).unwrap()), clean);
        assert_eq!(body(&run_with(&runtime, dir.path(), &Request::get("/"), &sessions).unwrap()), clean);

        let globals = runtime.lua.globals();
        let string: Table = globals.get("string").unwrap();
        assert!(string.get::<Value>("stash").unwrap().is_nil());
        assert!(globals.get::<Value>("via_meta").unwrap().is_nil());
        assert!(globals.get::<Value>("from_load").unwrap().is_nil());
        assert!(globals.get::<Value>("from_package").unwrap().is_nil());
        let math: Table = globals.get("math").unwrap();
        assert!(matches!(math.get::<Value>("pi").unwrap(), Value::Number(_)));
    }

    #[test]
    fn io_write_goes_to_the_response() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_script(
            dir.path(),
            r#"
                io.write("a", 1, "b")
                io.stdout:write("c"):write("d")
                htmlua.ob_start()
                io.write("x")
                local inner = htmlua.ob_get_clean()
                io.output():write("[", inner, "]")
            "#,
            &Request::get("/"),
            &SessionStore::new(),
        )
        .unwrap();
        assert_eq!(body(&out), "a1bcd[x]");
    }

    #[test]
    fn io_write_rejects_tables() {
        let dir = tempfile::tempdir().unwrap();
        let fault = run_script(dir.path(), "io.write({})", &Request::get("/"), &SessionStore::new()).unwrap_err();
        assert!(fault.message.contains("string expected, got table"), "{fault:?}");
    }

    #[test]
    fn os_exit_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let fault = run_script(dir.path(), "os.exit(1)", &Request::get("/"), &SessionStore::new()).unwrap_err();
        assert_eq!(fault.line, 1);
    }

    #[test]
    fn memory_limit_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.lua"), r#"local s = string.rep("x", 64 * 1024 * 1024)"#).unwrap();
        let config = WorkerConfig {
            memory_limit: 4 * 1024 * 1024,
            ..WorkerConfig::default()
        };
        let runtime = ScriptRuntime::new(&config).unwrap();
        let fault = run_with(&runtime, dir.path(), &Request::get("/"), &SessionStore::new()).unwrap_err();
        assert!(!fault.message.is_empty());
        assert!(runtime.used_memory() <= 4 * 1024 * 1024);
    }

    #[test]
    fn session_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("index.lua"),
            r#"
                local id = htmlua.session_start()
                request.session.visits = (request.session.visits or 0) + 1
                htmlua.print(id .. ":" .. request.session.visits)
            "#,
        )
        .unwrap();
        let runtime = ScriptRuntime::new(&WorkerConfig::default()).unwrap();
        let sessions = SessionStore::new();

        let first = run_with(&runtime, dir.path(), &Request::get("/"), &sessions).unwrap();
        let cookie = first
            .headers
            .iter()
            .find(|(name, _)| name == "Set-Cookie")
            .map(|(_, value)| value.clone())
            .unwrap();
        let id = cookie
            .strip_prefix("HTMLUASESSID=")
            .and_then(|rest| rest.split(';').next())
            .unwrap()
            .to_string();
        assert_eq!(body(&first), format!("{id}:1"));

        let again = Request::get("/").with_header("Cookie", format!("HTMLUASESSID={id}"));
        let second = run_with(&runtime, dir.path(), &again, &sessions).unwrap();
        assert_eq!(body(&second), format!("{id}:2"));
        assert!(second.headers.iter().all(|(name, _)| name != "Set-Cookie"));
        assert_eq!(sessions.load(&id).unwrap()["visits"], serde_json::json!(2));
    }

    #[test]
    fn one_shot_store_does_not_start_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = SessionStore::ephemeral();
        let out = run_script(
            dir.path(),
            r#"
                request.session.n = 1
                htmlua.print(tostring(htmlua.session_start()) .. ":" .. request.session.n)
            "#,
            &Request::get("/"),
            &sessions,
        )
        .unwrap();
        assert_eq!(body(&out), "nil:1");
        assert!(out.headers.iter().all(|(name, _)| name != "Set-Cookie"));
        assert!(sessions.is_empty());
    }

    #[test]
    fn failed_request_keeps_session() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = SessionStore::new();
        let id = sessions.create();
        let mut data = SessionData::new();
        data.insert("user".into(), serde_json::json!("ada"));
        sessions.store(&id, data.clone());

        let request = Request::get("/").with_header("Cookie", format!("HTMLUASESSID={id}"));
        run_script(
            dir.path(),
            r#"
                request.session.user = "mallory"
                error("abort")
            "#,
            &request,
            &sessions,
        )
        .unwrap_err();
        assert_eq!(sessions.load(&id), Some(data));
    }

    #[test]
    fn unknown_session_cookie_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = SessionStore::new();
        let request = Request::get("/").with_header("Cookie", "HTMLUASESSID=forged");
        let out = run_script(
            dir.path(),
            r#"
                request.session.x = 1
                htmlua.print(next(request.session) and "set" or "empty")
            "#,
            &request,
            &sessions,
        )
        .unwrap();
        assert_eq!(body(&out), "set");
        assert!(sessions.is_empty());
    }

    #[test]
    fn time_in_configured_zone() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("index.lua"),
            r#"htmlua.print(htmlua.timezone() .. " " .. htmlua.now("%z"))"#,
        )
        .unwrap();
        let config = WorkerConfig {
            timezone: Some("UTC".to_string()),
            ..WorkerConfig::default()
        };
        let runtime = ScriptRuntime::new(&config).unwrap();
        let out = run_with(&runtime, dir.path(), &Request::get("/"), &SessionStore::new()).unwrap();
        assert_eq!(body(&out), "UTC +0000");
    }

    #[test]
    fn unknown_timezone_falls_back() {
        assert_eq!(resolve_timezone(Some("Mars/Olympus_Mons")), None);
        assert_eq!(resolve_timezone(None), None);
        assert_eq!(resolve_timezone(Some("Europe/Berlin")), Some(chrono_tz::Europe::Berlin));
    }

    #[test]
    fn decode_json() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_script(
            dir.path(),
            r#"
                local v = htmlua.decode_json('{"name":"tea","tags":["a","b"]}')
                htmlua.print(v.name .. #v.tags)
            "#,
            &Request::get("/"),
            &SessionStore::new(),
        )
        .unwrap();
        assert_eq!(body(&out), "tea2");
    }
}
