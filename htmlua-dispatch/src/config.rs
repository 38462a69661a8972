use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::{fs, path::{Path, PathBuf}};

/// Default memory ceiling for a worker's interpreter: 512 MiB.
pub const DEFAULT_MEMORY_LIMIT: usize = 512 * 1024 * 1024;

/// Largest request body a worker reads into memory: 32 MiB.
pub const DEFAULT_MAX_BODY_BYTES: u64 = 32 * 1024 * 1024;

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub paths: PathConfig,
    pub server: ServerConfig,
    pub scripts: ScriptConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct PathConfig {
    pub document_root: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_log: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub admin_port: u16,
    pub workers: usize,
    /// Prefix stripped from request paths before resolution, e.g. `/worker.lua`.
    pub script_name: String,
    /// Bodies larger than this are answered with 413.
    pub max_body_bytes: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ScriptConfig {
    /// Extension (without the dot) of files the dispatcher may execute.
    pub extension: String,
    /// Directory index and front controller file name.
    pub index: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    pub memory_limit: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    pub debug: bool,
    /// Seconds a session may sit idle before it expires.
    pub session_lifetime: u64,
    pub max_sessions: usize,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            document_root: PathBuf::from("/var/www/html/public"),
            error_log: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            admin_port: 8081,
            workers: 4,
            script_name: String::new(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            extension: "lua".to_string(),
            index: "index.lua".to_string(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            memory_limit: DEFAULT_MEMORY_LIMIT,
            timezone: None,
            debug: false,
            session_lifetime: 1440,
            max_sessions: 10_000,
        }
    }
}

impl Config {
    /// Loads the config file if one exists, falling back to defaults, then
    /// applies environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = Self::get_config_path();
        let mut config = if config_path.exists() {
            Self::load_from(&config_path)?
        } else {
            Config::default()
        };
        config.apply_env_with(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&config_content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Applies `TZ`, `DEBUG`, `APP_ENV`, `HTMLUA_ERROR_LOG` and
    /// `HTMLUA_DOCUMENT_ROOT`. Unset or empty variables leave the value alone.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(tz) = lookup("TZ") {
            self.worker.timezone = Some(tz);
        }
        if lookup("DEBUG").as_deref() == Some("1") || lookup("APP_ENV").as_deref() == Some("development") {
            self.worker.debug = true;
        }
        if let Some(path) = lookup("HTMLUA_ERROR_LOG") {
            self.paths.error_log = Some(PathBuf::from(path));
        }
        if let Some(root) = lookup("HTMLUA_DOCUMENT_ROOT") {
            self.paths.document_root = PathBuf::from(root);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let extension = self.scripts.extension.trim_start_matches('.');
        if extension.is_empty() {
            bail!("scripts.extension must not be empty");
        }
        if Path::new(&self.scripts.index).extension().and_then(|e| e.to_str()) != Some(extension) {
            bail!(
                "scripts.index ({}) must carry the script extension .{extension}",
                self.scripts.index
            );
        }
        if self.worker.memory_limit == 0 {
            bail!("worker.memory_limit must be greater than zero");
        }
        if self.worker.session_lifetime == 0 || self.worker.max_sessions == 0 {
            bail!("worker.session_lifetime and worker.max_sessions must be greater than zero");
        }
        Ok(())
    }

    fn get_config_path() -> PathBuf {
        if cfg!(windows) {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("C:\\ProgramData"))
                .join("htmlua")
                .join("config.toml")
        } else {
            PathBuf::from("/etc/htmlua.toml")
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::get_config_path())
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }
        let config_content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(config_path, config_content)
            .with_context(|| format!("Failed to write config to: {}", config_path.display()))?;
        Ok(())
    }

    pub fn config_file_path() -> PathBuf { Self::get_config_path() }
}
