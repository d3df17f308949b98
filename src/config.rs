//! Configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` relative to the current working directory (or
//! the path given with `-f`), then applies `FSW_BASE_DIR`, `FSW_LOG_LEVEL`
//! and `FSW_QUEUE_PATH` env overrides.

use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::error::AppError;

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Which [`DurableQueue`](crate::queue::DurableQueue) backend to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    Sqlite,
    Memory,
}

/// Queue names and backend settings (`[queue]`).
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    /// Database file for the sqlite backend.
    pub path: PathBuf,
    /// Prefix for every queue key, `"<namespace>:<name>"`.
    pub namespace: String,
    pub task_queue: String,
    pub response_queue: String,
    pub chat_queue: String,
    /// How often a blocked pop re-checks the table for rows written by
    /// other processes.
    pub poll_interval: Duration,
}

/// Entity index settings (`[index]`).
#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub case_insensitive: bool,
    /// Number of open per-store indexes kept by the dispatcher.
    pub cache_size: usize,
    /// Most keyword-boost candidates handed to the chat responder.
    pub topk: usize,
}

/// Reference ingestor settings (`[ingest]`).
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub chunk_size: usize,
    /// Lower-case file extensions the plain-text ingestor accepts.
    pub extensions: Vec<String>,
}

/// Fully-resolved worker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub worker_name: String,
    /// Root of all feature stores (already expanded, no `~`).
    pub base_dir: PathBuf,
    /// Store config template copied into every new store.
    pub template_path: PathBuf,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub queue: QueueConfig,
    pub index: IndexConfig,
    pub ingest: IngestConfig,
}

/// Overrides applied on top of the TOML file. Tests pass these directly
/// instead of mutating env vars.
#[derive(Debug, Default, Clone)]
pub struct Overrides<'a> {
    pub base_dir: Option<&'a str>,
    pub log_level: Option<&'a str>,
    pub queue_path: Option<&'a str>,
}

/// Raw TOML shape — `serde` target before resolution.
#[derive(Deserialize)]
struct RawConfig {
    worker: RawWorker,
    #[serde(default)]
    queue: RawQueue,
    #[serde(default)]
    index: RawIndex,
    #[serde(default)]
    ingest: RawIngest,
}

#[derive(Deserialize)]
struct RawWorker {
    #[serde(default = "default_worker_name")]
    name: String,
    base_dir: String,
    #[serde(default = "default_template_path")]
    template_path: String,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    log_file: Option<String>,
}

#[derive(Deserialize)]
struct RawQueue {
    #[serde(default = "default_backend")]
    backend: String,
    /// Relative paths resolve against `base_dir`.
    #[serde(default = "default_queue_path")]
    path: String,
    #[serde(default = "default_namespace")]
    namespace: String,
    #[serde(default = "default_task_queue")]
    task: String,
    #[serde(default = "default_response_queue")]
    response: String,
    #[serde(default = "default_chat_queue")]
    chat: String,
    #[serde(default = "default_poll_interval_ms")]
    poll_interval_ms: u64,
}

impl Default for RawQueue {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_queue_path(),
            namespace: default_namespace(),
            task: default_task_queue(),
            response: default_response_queue(),
            chat: default_chat_queue(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Deserialize)]
struct RawIndex {
    #[serde(default = "default_true")]
    case_insensitive: bool,
    #[serde(default = "default_cache_size")]
    cache_size: usize,
    #[serde(default = "default_topk")]
    topk: usize,
}

impl Default for RawIndex {
    fn default() -> Self {
        Self { case_insensitive: true, cache_size: default_cache_size(), topk: default_topk() }
    }
}

#[derive(Deserialize)]
struct RawIngest {
    #[serde(default = "default_chunk_size")]
    chunk_size: usize,
    #[serde(default = "default_extensions")]
    extensions: Vec<String>,
}

impl Default for RawIngest {
    fn default() -> Self {
        Self { chunk_size: default_chunk_size(), extensions: default_extensions() }
    }
}

fn default_worker_name() -> String { "featurestore-worker".to_string() }
fn default_template_path() -> String { "config/store-template.toml".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_backend() -> String { "sqlite".to_string() }
fn default_queue_path() -> String { "queue.db".to_string() }
fn default_namespace() -> String { "featurestore".to_string() }
fn default_task_queue() -> String { "Task".to_string() }
fn default_response_queue() -> String { "TaskResponse".to_string() }
fn default_chat_queue() -> String { "ChatResponse".to_string() }
fn default_poll_interval_ms() -> u64 { 200 }
fn default_cache_size() -> usize { 4 }
fn default_topk() -> usize { 100 }
fn default_chunk_size() -> usize { 900 }
fn default_extensions() -> Vec<String> { vec!["txt".into(), "md".into()] }

fn default_true() -> bool {
    true
}

/// Load config from `path` (or `config/default.toml`), then apply env-var
/// overrides.
pub fn load(path: Option<&str>) -> Result<Config, AppError> {
    let base_dir = env::var("FSW_BASE_DIR").ok();
    let log_level = env::var("FSW_LOG_LEVEL").ok();
    let queue_path = env::var("FSW_QUEUE_PATH").ok();
    load_from(
        Path::new(path.unwrap_or(DEFAULT_CONFIG_PATH)),
        Overrides {
            base_dir: base_dir.as_deref(),
            log_level: log_level.as_deref(),
            queue_path: queue_path.as_deref(),
        },
    )
}

/// Internal loader — accepts an explicit path and overrides.
pub fn load_from(path: &Path, overrides: Overrides<'_>) -> Result<Config, AppError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;
    parse(&raw, overrides).map_err(|e| match e {
        AppError::Config(msg) => AppError::Config(format!("{}: {msg}", path.display())),
        other => other,
    })
}

fn parse(raw: &str, overrides: Overrides<'_>) -> Result<Config, AppError> {
    let parsed: RawConfig =
        toml::from_str(raw).map_err(|e| AppError::Config(format!("parse error: {e}")))?;

    let w = parsed.worker;
    let base_dir = expand_home(overrides.base_dir.unwrap_or(&w.base_dir));
    let log_level = overrides.log_level.unwrap_or(&w.log_level).to_string();

    let backend = match parsed.queue.backend.as_str() {
        "sqlite" => QueueBackend::Sqlite,
        "memory" => QueueBackend::Memory,
        other => {
            return Err(AppError::Config(format!(
                "unknown queue backend '{other}' (expected 'sqlite' or 'memory')"
            )));
        }
    };
    let queue_path = resolve_under(&base_dir, overrides.queue_path.unwrap_or(&parsed.queue.path));

    if parsed.index.cache_size == 0 {
        return Err(AppError::Config("index.cache_size must be > 0".into()));
    }
    if parsed.index.topk == 0 {
        return Err(AppError::Config("index.topk must be > 0".into()));
    }
    if parsed.ingest.chunk_size == 0 {
        return Err(AppError::Config("ingest.chunk_size must be > 0".into()));
    }

    Ok(Config {
        worker_name: w.name,
        template_path: expand_home(&w.template_path),
        log_file: w.log_file.map(|p| resolve_under(&base_dir, &p)),
        base_dir,
        log_level,
        queue: QueueConfig {
            backend,
            path: queue_path,
            namespace: parsed.queue.namespace,
            task_queue: parsed.queue.task,
            response_queue: parsed.queue.response,
            chat_queue: parsed.queue.chat,
            poll_interval: Duration::from_millis(parsed.queue.poll_interval_ms.max(1)),
        },
        index: IndexConfig {
            case_insensitive: parsed.index.case_insensitive,
            cache_size: parsed.index.cache_size,
            topk: parsed.index.topk,
        },
        ingest: IngestConfig {
            chunk_size: parsed.ingest.chunk_size,
            extensions: parsed
                .ingest
                .extensions
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
        },
    })
}

/// Expand `path` and, if it is relative, join it onto `base`.
fn resolve_under(base: &Path, path: &str) -> PathBuf {
    let p = expand_home(path);
    if p.is_absolute() { p } else { base.join(p) }
}

/// Expand a leading `~` to the user's home directory.
/// Absolute or relative paths without `~` are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

// ── defaults ──────────────────────────────────────────────────────────────────

impl Config {
    /// All defaults with an in-memory queue, everything rooted at `base_dir`.
    /// Used by tests and embedders that skip the TOML file.
    pub fn for_base_dir(base_dir: &Path, template_path: &Path) -> Self {
        Self {
            worker_name: "test".into(),
            base_dir: base_dir.to_path_buf(),
            template_path: template_path.to_path_buf(),
            log_level: "info".into(),
            log_file: None,
            queue: QueueConfig {
                backend: QueueBackend::Memory,
                path: base_dir.join(default_queue_path()),
                namespace: default_namespace(),
                task_queue: default_task_queue(),
                response_queue: default_response_queue(),
                chat_queue: default_chat_queue(),
                poll_interval: Duration::from_millis(default_poll_interval_ms()),
            },
            index: IndexConfig {
                case_insensitive: true,
                cache_size: default_cache_size(),
                topk: default_topk(),
            },
            ingest: IngestConfig {
                chunk_size: default_chunk_size(),
                extensions: default_extensions(),
            },
        }
    }
}
