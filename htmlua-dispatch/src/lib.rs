#![warn(clippy::pedantic)]

//! Request dispatch for htmlua workers: resolve a request path to a Lua
//! script under the document root, run it in a long-lived interpreter with a
//! request-scoped environment, and turn the outcome into a response.

pub mod cgi;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod htmlua_stdlib;
pub mod logging;
pub mod output;
pub mod request;
pub mod resolve;
pub mod response;
pub mod runtime;
pub mod serve;
pub mod session;

pub use config::Config;
pub use dispatch::Dispatcher;
pub use error::{DispatchError, NotFound, ScriptFault};
pub use request::Request;
pub use response::Response;
pub use session::SessionStore;
