use std::{path::PathBuf, sync::Arc};

use tracing::{debug, error, info_span, trace, warn};

use crate::{
    config::Config,
    error::{DispatchError, NotFound, ScriptFault},
    request::{Request, RequestScope, RequestTarget},
    resolve::resolve,
    response::Response,
    runtime::ScriptRuntime,
    session::SessionStore,
};

/// Resolves, executes and answers requests for one worker thread.
///
/// Owns a long-lived interpreter, so it is not `Send`: keep one per thread.
pub struct Dispatcher {
    config: Arc<Config>,
    runtime: ScriptRuntime,
    sessions: SessionStore,
}

impl Dispatcher {
    pub fn new(config: Arc<Config>, sessions: SessionStore) -> Result<Self, DispatchError> {
        let runtime = ScriptRuntime::new(&config.worker)?;
        Ok(Self { config, runtime, sessions })
    }

    pub fn config(&self) -> &Config { &self.config }

    pub fn sessions(&self) -> &SessionStore { &self.sessions }

    /// Handles one request. Never fails: every error is translated into a
    /// 404 or 500 response here, and cleanup runs on every path out.
    pub fn dispatch(&self, request: &Request) -> Response {
        let span = info_span!("dispatch", method = %request.method, uri = %request.uri);
        let _enter = span.enter();
        let _cleanup = Cleanup { runtime: &self.runtime };

        let result = self.try_dispatch(request);
        self.respond(request, result)
    }

    /// Turns the outcome of a request into the response sent back.
    fn respond(&self, request: &Request, result: Result<Response, DispatchError>) -> Response {
        match result {
            Ok(response) => {
                debug!(status = response.status, bytes = response.body.len(), "request succeeded");
                response
            }
            Err(DispatchError::NotFound(reason)) => {
                debug!(%reason, "request rejected");
                match reason {
                    NotFound::NotAScript => Response::not_a_script(),
                    NotFound::NoTarget | NotFound::OutsideDocumentRoot => Response::not_found(),
                }
            }
            Err(DispatchError::Execution(fault)) => {
                error!(error = %fault.message, file = %fault.file, line = fault.line, "worker error");
                Response::internal_error(&fault, self.config.worker.debug)
            }
            Err(DispatchError::Runtime(e)) => {
                error!(error = %e, "interpreter error while preparing request");
                let fault = ScriptFault::internal(e.to_string(), &self.document_root(request));
                Response::internal_error(&fault, self.config.worker.debug)
            }
        }
    }

    fn try_dispatch(&self, request: &Request) -> Result<Response, DispatchError> {
        let document_root = self.document_root(request);

        trace!("resolving");
        let mut target = RequestTarget::parse(&request.uri);
        target.strip_script_name(&request.script_name);
        let resolved = resolve(&target.path, &document_root, &self.config.scripts)?;
        debug!(script = %resolved.path.display(), "resolved");

        trace!("executing");
        let scope = RequestScope::from_request(request, &target, &document_root);
        let output = self.runtime.execute(&resolved, &scope, &self.sessions)?;

        Ok(Response {
            status: output.status,
            headers: output.headers,
            body: output.body,
            trace: None,
        })
    }

    fn document_root(&self, request: &Request) -> PathBuf {
        request
            .document_root
            .clone()
            .unwrap_or_else(|| self.config.paths.document_root.clone())
    }
}

/// Runs when a request leaves the dispatcher, whichever way it leaves.
struct Cleanup<'a> {
    runtime: &'a ScriptRuntime,
}

impl Drop for Cleanup<'_> {
    fn drop(&mut self) {
        trace!("cleaning up");
        if let Err(e) = self.runtime.collect_garbage() {
            warn!(error = %e, "garbage collection failed");
        }
    }
}
