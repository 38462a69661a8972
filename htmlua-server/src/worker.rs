//! Glue between rouille and the dispatcher.
//!
//! rouille serves requests from a fixed pool of threads. Each pool thread
//! lazily builds its own [`Dispatcher`], so every interpreter (and every
//! request scope) is confined to one thread.

use std::{
    borrow::Cow,
    cell::RefCell,
    io::Read,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use htmlua_dispatch::{Config, Dispatcher, Request, Response, SessionStore};
use rouille::ResponseBody;
use tracing::{error, warn};

static NEXT_WORKER_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static DISPATCHER: RefCell<Option<(usize, Dispatcher)>> = const { RefCell::new(None) };
}

#[derive(Clone)]
pub struct Worker {
    id: usize,
    config: Arc<Config>,
    sessions: SessionStore,
}

impl Worker {
    pub fn new(config: Arc<Config>, sessions: SessionStore) -> Self {
        Self {
            id: NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed),
            config,
            sessions,
        }
    }

    pub fn config(&self) -> &Config { &self.config }

    pub fn handle(&self, request: &rouille::Request) -> rouille::Response {
        let body = match self.read_body(request) {
            Ok(Some(body)) => body,
            Ok(None) => {
                warn!(limit = self.config.server.max_body_bytes, "request body too large");
                return rouille::Response::text("Payload Too Large").with_status_code(413);
            }
            Err(e) => {
                warn!(error = %e, "failed to read request body");
                return rouille::Response::text("Bad Request").with_status_code(400);
            }
        };
        into_rouille(self.dispatch(&self.to_dispatch_request(request, body)))
    }

    fn dispatch(&self, request: &Request) -> Response {
        DISPATCHER.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.as_ref().is_none_or(|(id, _)| *id != self.id) {
                match Dispatcher::new(self.config.clone(), self.sessions.clone()) {
                    Ok(dispatcher) => *slot = Some((self.id, dispatcher)),
                    Err(e) => {
                        error!(error = %e, "failed to start interpreter");
                        return Response::new(500, "Internal Server Error");
                    }
                }
            }
            match slot.as_ref() {
                Some((_, dispatcher)) => dispatcher.dispatch(request),
                None => Response::new(500, "Internal Server Error"),
            }
        })
    }

    /// Reads the whole body, or `None` if it exceeds the configured limit.
    fn read_body(&self, request: &rouille::Request) -> std::io::Result<Option<Vec<u8>>> {
        let limit = self.config.server.max_body_bytes;
        let mut body = Vec::new();
        if let Some(data) = request.data() {
            data.take(limit.saturating_add(1)).read_to_end(&mut body)?;
        }
        if body.len() as u64 > limit {
            return Ok(None);
        }
        Ok(Some(body))
    }

    fn to_dispatch_request(&self, request: &rouille::Request, body: Vec<u8>) -> Request {
        let mut converted = Request::new(request.method(), request.raw_url())
            .with_script_name(self.config.server.script_name.clone())
            .with_body(body)
            .with_remote_addr(request.remote_addr().ip().to_string());
        for (name, value) in request.headers() {
            converted = converted.with_header(name, value);
        }
        converted
    }
}

fn into_rouille(response: Response) -> rouille::Response {
    rouille::Response {
        status_code: response.status,
        headers: response
            .headers
            .into_iter()
            .map(|(name, value)| (Cow::Owned(name), Cow::Owned(value)))
            .collect(),
        data: ResponseBody::from_data(response.body),
        upgrade: None,
    }
}
