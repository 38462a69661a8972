use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use htmlua_dispatch::{Config, logging::init_tracing};

#[derive(Parser, Debug)]
#[command(name = "htmlua-server", about = "Long-lived htmlua worker behind a reverse proxy")]
struct Args {
    /// Config file (defaults to the system config path)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    admin_port: Option<u16>,

    #[arg(long)]
    document_root: Option<PathBuf>,

    /// Write the effective configuration to the config path and exit
    #[arg(long)]
    write_config: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) if args.write_config && !path.exists() => {
            let mut config = Config::default();
            config.apply_env_with(|key| std::env::var(key).ok());
            config
        }
        Some(path) => {
            let mut config = Config::load_from(path)?;
            config.apply_env_with(|key| std::env::var(key).ok());
            config
        }
        None => Config::load()?,
    };
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(admin_port) = args.admin_port {
        config.server.admin_port = admin_port;
    }
    if let Some(root) = args.document_root {
        config.paths.document_root = root;
    }

    if args.write_config {
        match &args.config {
            Some(path) => config.save_to(path)?,
            None => config.save()?,
        }
        println!("Wrote {}", args.config.unwrap_or_else(Config::config_file_path).display());
        return Ok(());
    }

    init_tracing(&config)?;
    htmlua_server::run(config)
}
