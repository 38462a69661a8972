use std::env;
use std::io::{self, Read, Write};

use anyhow::{Context, Result};
use htmlua_dispatch::{
    Response,
    cgi::{request_from_env, write_response},
    logging::init_tracing,
    serve::{get_config, serve_request},
};

fn main() -> Result<()> {
    let config = get_config();
    init_tracing(&config)?;

    let length = content_length();
    if length > config.server.max_body_bytes {
        tracing::warn!(length, limit = config.server.max_body_bytes, "request body too large");
        return respond(&Response::new(413, "Payload Too Large"));
    }
    let body = read_body(length)?;
    let names: Vec<String> = env::vars_os()
        .filter_map(|(key, _)| key.into_string().ok())
        .collect();
    let request = request_from_env(|key| env::var(key).ok(), &names, body);

    let response = serve_request(&request).unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to start interpreter");
        Response::new(500, "Internal Server Error")
    });

    respond(&response)
}

fn respond(response: &Response) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    write_response(&mut out, response).context("Failed to write CGI response")?;
    out.flush()?;
    Ok(())
}

fn content_length() -> u64 {
    env::var("CONTENT_LENGTH")
        .ok()
        .and_then(|len| len.trim().parse::<u64>().ok())
        .unwrap_or(0)
}

fn read_body(length: u64) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    io::stdin()
        .take(length)
        .read_to_end(&mut body)
        .context("Failed to read request body")?;
    Ok(body)
}
