use crate::{
    config::Config,
    dispatch::Dispatcher,
    error::DispatchError,
    request::Request,
    response::Response,
    session::SessionStore,
};
use std::sync::{Arc, OnceLock};

static CONFIG: OnceLock<Arc<Config>> = OnceLock::new();

pub fn get_config() -> Arc<Config> {
    CONFIG
        .get_or_init(|| {
            Arc::new(Config::load().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "failed to load config, using default configuration");
                let mut config = Config::default();
                config.apply_env_with(|key| std::env::var(key).ok());
                config
            }))
        })
        .clone()
}

/// Dispatches a single request with a throwaway interpreter, for front-ends
/// that handle one request per process. Sessions need a long-lived worker:
/// here `htmlua.session_start` returns nil and sets no cookie.
pub fn serve_request(request: &Request) -> Result<Response, DispatchError> {
    let dispatcher = Dispatcher::new(get_config(), SessionStore::ephemeral())?;
    Ok(dispatcher.dispatch(request))
}
