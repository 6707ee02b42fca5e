// Configuration loading and parsing (campus.toml, credentials.toml).

use serde::Deserialize;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::connection::BackoffPolicy;
use crate::session::User;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },

    #[error("failed to initialize config from defaults: {message}")]
    DefaultsCopyError { message: String },
}

// ---------------------------------------------------------------------------
// Top-level assembled Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub connection: ConnectionConfig,
    pub competition: CompetitionConfig,
    /// Resolved database location (never empty).
    pub db_path: String,
    pub credentials: CredentialsConfig,
}

impl Config {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            floor: Duration::from_secs_f64(self.connection.backoff_floor_secs),
            ceiling: Duration::from_secs_f64(self.connection.backoff_ceiling_secs),
            factor: self.connection.backoff_factor,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.competition.tick_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// campus.toml structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct CampusFile {
    server: ServerConfig,
    #[serde(default)]
    connection: ConnectionConfig,
    #[serde(default)]
    competition: CompetitionConfig,
    #[serde(default)]
    database: DatabaseSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP base of the backend, e.g. `https://campus.example`. The push
    /// channel URL is derived from it.
    pub base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub backoff_floor_secs: f64,
    pub backoff_ceiling_secs: f64,
    pub backoff_factor: f64,
    /// Capacity of the channel carrying connection events to the app loop.
    pub event_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        let policy = BackoffPolicy::default();
        ConnectionConfig {
            backoff_floor_secs: policy.floor.as_secs_f64(),
            backoff_ceiling_secs: policy.ceiling.as_secs_f64(),
            backoff_factor: policy.factor,
            event_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompetitionConfig {
    pub tick_interval_ms: u64,
}

impl Default for CompetitionConfig {
    fn default() -> Self {
        CompetitionConfig {
            tick_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
struct DatabaseSection {
    #[serde(default)]
    path: String,
}

// ---------------------------------------------------------------------------
// credentials.toml structs
// ---------------------------------------------------------------------------

/// Who the client runs as. Obtaining the token is outside this program.
#[derive(Clone, Deserialize, Default)]
pub struct CredentialsConfig {
    pub token: Option<String>,
    pub user: Option<User>,
}

impl std::fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("user", &self.user)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate `config/campus.toml` and (optionally)
/// `config/credentials.toml` relative to `base_dir`. Does not copy defaults;
/// see [`load_config`].
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let config_dir = base_dir.join("config");

    let campus_path = config_dir.join("campus.toml");
    let campus_text = read_file(&campus_path)?;
    let campus: CampusFile =
        toml::from_str(&campus_text).map_err(|e| ConfigError::ParseError {
            path: campus_path.clone(),
            source: e,
        })?;

    let credentials_path = config_dir.join("credentials.toml");
    let credentials = if credentials_path.exists() {
        let text = read_file(&credentials_path)?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseError {
            path: credentials_path.clone(),
            source: e,
        })?
    } else {
        CredentialsConfig::default()
    };

    let db_path = if campus.database.path.trim().is_empty() {
        default_db_path()
    } else {
        campus.database.path
    };

    let config = Config {
        server: campus.server,
        connection: campus.connection,
        competition: campus.competition,
        db_path,
        credentials,
    };

    validate(&config)?;

    Ok(config)
}

/// Seed `config/` from `defaults/`: every regular file that is not a
/// `*.example` template and has no counterpart in `config/` yet is copied.
/// Returns the paths written, sorted.
pub fn ensure_config_files(base_dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let defaults_dir = base_dir.join("defaults");
    let config_dir = base_dir.join("config");

    if !defaults_dir.is_dir() {
        // A deployed tree may ship a populated config/ on its own.
        return if config_dir.is_dir() {
            Ok(Vec::new())
        } else {
            Err(copy_error(format!(
                "neither defaults/ nor config/ exists under {}",
                base_dir.display()
            )))
        };
    }

    fs::create_dir_all(&config_dir)
        .map_err(|e| copy_error(format!("cannot create {}: {e}", config_dir.display())))?;

    let mut written = Vec::new();
    for template in seed_files(&defaults_dir)? {
        let Some(name) = template.file_name() else {
            continue;
        };
        let target = config_dir.join(name);
        if seed_file(&template, &target)? {
            written.push(target);
        }
    }
    written.sort();
    Ok(written)
}

/// Load config relative to the working directory, seeding it from
/// `defaults/` first.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|_| ConfigError::FileNotFound {
        path: PathBuf::from("."),
    })?;
    ensure_config_files(&cwd)?;
    load_config_from(&cwd)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_file(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })
}

/// Per-user data directory, or the working directory when the platform has
/// no home directory.
fn default_db_path() -> String {
    directories::ProjectDirs::from("org", "campus", "campus")
        .map(|dirs| dirs.data_dir().join("campus.db"))
        .unwrap_or_else(|| PathBuf::from("campus.db"))
        .to_string_lossy()
        .into_owned()
}

/// Regular files in `dir`, minus `*.example` templates.
fn seed_files(dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let listing_error = |e: io::Error| copy_error(format!("cannot list {}: {e}", dir.display()));
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(listing_error)? {
        let path = entry.map_err(listing_error)?.path();
        let template = path.extension().is_some_and(|ext| ext == "example");
        if path.is_file() && !template {
            files.push(path);
        }
    }
    Ok(files)
}

/// Copy `from` to `to` unless `to` already exists. Returns whether anything
/// was written.
fn seed_file(from: &Path, to: &Path) -> Result<bool, ConfigError> {
    let mut dest = match OpenOptions::new().write(true).create_new(true).open(to) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(copy_error(format!("cannot create {}: {e}", to.display()))),
    };
    let mut src = File::open(from)
        .map_err(|e| copy_error(format!("cannot read {}: {e}", from.display())))?;
    io::copy(&mut src, &mut dest)
        .map_err(|e| copy_error(format!("cannot write {}: {e}", to.display())))?;
    Ok(true)
}

fn copy_error(message: String) -> ConfigError {
    ConfigError::DefaultsCopyError { message }
}

fn invalid(field: &str, message: String) -> ConfigError {
    ConfigError::ValidationError {
        field: field.into(),
        message,
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &Config) -> Result<(), ConfigError> {
    let base = &config.server.base_url;
    if !(base.starts_with("http://") || base.starts_with("https://")) {
        return Err(invalid(
            "server.base_url",
            format!("must start with http:// or https://, got {base:?}"),
        ));
    }

    let c = &config.connection;
    if !(c.backoff_floor_secs.is_finite() && c.backoff_floor_secs > 0.0) {
        return Err(invalid(
            "connection.backoff_floor_secs",
            format!("must be > 0, got {}", c.backoff_floor_secs),
        ));
    }
    if !(c.backoff_ceiling_secs.is_finite() && c.backoff_ceiling_secs >= c.backoff_floor_secs) {
        return Err(invalid(
            "connection.backoff_ceiling_secs",
            format!(
                "must be >= backoff_floor_secs ({}), got {}",
                c.backoff_floor_secs, c.backoff_ceiling_secs
            ),
        ));
    }
    if !(c.backoff_factor.is_finite() && c.backoff_factor >= 1.0) {
        return Err(invalid(
            "connection.backoff_factor",
            format!("must be >= 1.0, got {}", c.backoff_factor),
        ));
    }
    if c.event_buffer == 0 {
        return Err(invalid("connection.event_buffer", "must be > 0".into()));
    }

    if config.competition.tick_interval_ms == 0 {
        return Err(invalid("competition.tick_interval_ms", "must be > 0".into()));
    }

    if let Some(token) = &config.credentials.token {
        if token.trim().is_empty() {
            return Err(invalid("credentials.token", "must not be blank".into()));
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
