//! Store lifecycle — on-disk layout and build/update operations for feature
//! stores.
//!
//! Each store lives in its own directory under the worker's base dir:
//!
//! ```text
//! <base_dir>/<store_id>/
//!   config.toml   cloned from the template on first build
//!   desc          human-readable store name
//!   workdir/      ingestion output, entity index (db_reverted_index/)
//!   repodir/      reserved for source repositories
//! ```
//!
//! Directories are created lazily by the first `add_doc` and are never
//! deleted here.  Updates on a store that was never built are rejected.

pub mod collaborators;
pub mod plaintext;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

pub use collaborators::{
    ChatAnswer, ChatRequest, ChatResponder, FileState, IngestReport, Ingestor, SampleTuner,
    TextChunk,
};

use crate::dispatch::task::{AddDocPayload, StatusCode, UpdatePipelinePayload, UpdateSamplePayload};
use crate::error::AppError;
use crate::index::{EntityIndex, INDEX_DIR};

// ── Layout ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct StoreLayout {
    pub id: String,
    pub root: PathBuf,
    pub workdir: PathBuf,
    pub repodir: PathBuf,
    pub config_path: PathBuf,
    pub desc_path: PathBuf,
}

impl StoreLayout {
    fn new(base_dir: &Path, id: &str) -> Self {
        let root = base_dir.join(id);
        Self {
            id: id.to_string(),
            workdir: root.join("workdir"),
            repodir: root.join("repodir"),
            config_path: root.join("config.toml"),
            desc_path: root.join("desc"),
            root,
        }
    }

    /// True once `ensure_layout` has run for this store.
    pub fn is_built(&self) -> bool {
        self.workdir.is_dir() && self.config_path.is_file()
    }

    pub fn index_dir(&self) -> PathBuf {
        self.workdir.join(INDEX_DIR)
    }
}

/// Store ids become directory names; reject anything that could escape the
/// base dir.
fn validate_store_id(id: &str) -> Result<(), AppError> {
    if id.is_empty() {
        return Err(AppError::Validation("feature_store_id must not be empty".into()));
    }
    if id == "." || id == ".." || id.contains(['/', '\\']) {
        return Err(AppError::Validation(format!("invalid feature_store_id '{id}'")));
    }
    Ok(())
}

// ── Outcome ──────────────────────────────────────────────────────────────────

/// Terminal result of a lifecycle operation, reported as a task status.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub code: StatusCode,
    pub status: String,
    pub files_state: Vec<FileState>,
}

impl TaskOutcome {
    fn success(status: impl Into<String>) -> Self {
        Self { code: StatusCode::Success, status: status.into(), files_state: Vec::new() }
    }
}

/// Classify an ingestion report against the number of requested files.
fn summarize(requested: usize, report: &IngestReport) -> (StatusCode, String) {
    let summary = format!(
        "{} succeeded, {} skipped, {} failed",
        report.success, report.skipped, report.failed
    );
    if report.success == requested {
        (StatusCode::Success, format!("success: {summary}"))
    } else if report.success == 0 {
        (StatusCode::Failed, format!("fail: {summary}"))
    } else {
        (StatusCode::Success, format!("partial success: {summary}"))
    }
}

// ── Lifecycle ────────────────────────────────────────────────────────────────

pub struct StoreLifecycle {
    base_dir: PathBuf,
    template_path: PathBuf,
    case_insensitive: bool,
    ingestor: Arc<dyn Ingestor>,
    tuner: Arc<dyn SampleTuner>,
}

impl StoreLifecycle {
    pub fn new(
        base_dir: &Path,
        template_path: &Path,
        case_insensitive: bool,
        ingestor: Arc<dyn Ingestor>,
        tuner: Arc<dyn SampleTuner>,
    ) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
            template_path: template_path.to_path_buf(),
            case_insensitive,
            ingestor,
            tuner,
        }
    }

    pub fn layout(&self, store_id: &str) -> Result<StoreLayout, AppError> {
        validate_store_id(store_id)?;
        Ok(StoreLayout::new(&self.base_dir, store_id))
    }

    /// Create the store's directories and clone the config template if the
    /// store has none yet.  Idempotent.
    pub fn ensure_layout(&self, store_id: &str) -> Result<StoreLayout, AppError> {
        let layout = self.layout(store_id)?;
        std::fs::create_dir_all(&layout.workdir)?;
        std::fs::create_dir_all(&layout.repodir)?;

        if !layout.config_path.exists() {
            if !self.template_path.is_file() {
                return Err(AppError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("store config template {} not found", self.template_path.display()),
                )));
            }
            std::fs::copy(&self.template_path, &layout.config_path)?;
            info!(store_id, config = %layout.config_path.display(), "store config created from template");
        }
        Ok(layout)
    }

    /// Ingest the payload's files into the store and bring the entity index
    /// in line with the new chunk list.
    ///
    /// With a vocabulary the index is rebuilt from the new chunks.  Without
    /// one, an existing index is emptied: its chunk ids named fragments of
    /// the previous ingestion.
    pub async fn build_from_documents(&self, payload: &AddDocPayload) -> Result<TaskOutcome, AppError> {
        let paths = payload.resolved_paths();
        if paths.is_empty() {
            return Err(AppError::Validation("path_list must not be empty".into()));
        }

        let layout = self.ensure_layout(&payload.feature_store_id)?;
        tokio::fs::write(&layout.desc_path, &payload.name).await?;

        let mut report = self.ingestor.ingest(&paths, &layout.workdir).await?;
        info!(
            store_id = %layout.id,
            success = report.success,
            failed = report.failed,
            skipped = report.skipped,
            chunks = report.chunks.len(),
            "ingestion finished"
        );

        let dir = layout.index_dir();
        let entities = payload.entities.clone();
        let chunks = std::mem::take(&mut report.chunks);
        let case_insensitive = self.case_insensitive;
        let relations = tokio::task::spawn_blocking(move || {
            rebuild_entity_index(&dir, &entities, &chunks, case_insensitive)
        })
        .await
        .map_err(|e| AppError::Index(format!("index rebuild join: {e}")))??;

        match relations {
            Some(relations) if !payload.entities.is_empty() => {
                info!(store_id = %layout.id, entities = payload.entities.len(), relations, "entity index rebuilt");
            }
            Some(_) => info!(store_id = %layout.id, "no vocabulary supplied; entity index emptied"),
            None => {}
        }

        let (code, status) = summarize(paths.len(), &report);
        Ok(TaskOutcome { code, status, files_state: report.files })
    }

    /// Recompute the store's rejection threshold from labelled examples.
    pub async fn update_sample(&self, payload: &UpdateSamplePayload) -> Result<TaskOutcome, AppError> {
        let positive = resolve_samples("positive", &payload.positive, payload.positive_path.as_deref())?;
        let negative = resolve_samples("negative", &payload.negative, payload.negative_path.as_deref())?;
        if positive.is_empty() || negative.is_empty() {
            return Err(AppError::Validation(
                "positive and negative samples must both be non-empty".into(),
            ));
        }

        let layout = self.built_layout(&payload.feature_store_id)?;
        let mut config = load_store_config(&layout.config_path)?;

        let threshold = self.tuner.tune(&layout, &positive, &negative).await?;
        set_key(&mut config, "feature_store", "reject_throttle", toml::Value::Float(threshold));
        save_store_config(&layout.config_path, &config)?;

        info!(store_id = %layout.id, threshold, "reject threshold updated");
        Ok(TaskOutcome::success(format!("success: reject_throttle = {threshold}")))
    }

    /// Store the web search credential in the store's config.
    pub async fn update_pipeline(&self, payload: &UpdatePipelinePayload) -> Result<TaskOutcome, AppError> {
        let layout = self.built_layout(&payload.feature_store_id)?;
        let mut config = load_store_config(&layout.config_path)?;

        if payload.web_search_token.is_empty() {
            warn!(store_id = %layout.id, "web search token is empty; web search disabled");
        }
        set_key(
            &mut config,
            "web_search",
            "x_api_key",
            toml::Value::String(payload.web_search_token.clone()),
        );
        save_store_config(&layout.config_path, &config)?;

        info!(store_id = %layout.id, "pipeline config updated");
        Ok(TaskOutcome::success("success: pipeline updated"))
    }

    fn built_layout(&self, store_id: &str) -> Result<StoreLayout, AppError> {
        let layout = self.layout(store_id)?;
        if !layout.is_built() {
            return Err(AppError::Internal(format!(
                "feature store '{store_id}' has not been built; run add_doc first"
            )));
        }
        Ok(layout)
    }
}

// ── Entity index rebuild ─────────────────────────────────────────────────────

/// Replace the vocabulary and relations in `dir` with those derived from
/// `chunks`.  Returns the number of relations written, or `None` when there
/// is no vocabulary and no index to empty.
fn rebuild_entity_index(
    dir: &Path,
    entities: &[String],
    chunks: &[TextChunk],
    case_insensitive: bool,
) -> Result<Option<usize>, AppError> {
    if entities.is_empty() && !dir.is_dir() {
        return Ok(None);
    }

    let mut index = EntityIndex::open(dir, case_insensitive)?;
    let cleared = index.clear()?;
    index.set_vocabulary(entities)?;
    debug!(dir = %dir.display(), cleared, "previous relations cleared");
    if entities.is_empty() {
        return Ok(Some(0));
    }

    let mut relations: BTreeMap<usize, Vec<u64>> = BTreeMap::new();
    for (chunk_id, chunk) in chunks.iter().enumerate() {
        for eid in index.match_entities(&chunk.text)? {
            relations.entry(eid).or_default().push(chunk_id as u64);
        }
    }

    for (eid, chunk_ids) in &relations {
        index.insert_relation(*eid, chunk_ids)?;
    }
    Ok(Some(relations.len()))
}

// ── Sample and config files ──────────────────────────────────────────────────

/// Inline samples win; otherwise read a JSON array of strings from `path`.
fn resolve_samples(label: &str, inline: &[String], path: Option<&str>) -> Result<Vec<String>, AppError> {
    if !inline.is_empty() {
        return Ok(inline.to_vec());
    }
    let Some(path) = path.filter(|p| !p.is_empty()) else {
        return Ok(Vec::new());
    };
    let raw = std::fs::read_to_string(path)
        .map_err(|e| AppError::Validation(format!("cannot read {label} samples {path}: {e}")))?;
    serde_json::from_str(&raw)
        .map_err(|e| AppError::Validation(format!("{label} samples {path} are not a JSON string array: {e}")))
}

fn load_store_config(path: &Path) -> Result<toml::Table, AppError> {
    let raw = std::fs::read_to_string(path)?;
    raw.parse::<toml::Table>()
        .map_err(|e| AppError::Config(format!("parse {}: {e}", path.display())))
}

fn save_store_config(path: &Path, config: &toml::Table) -> Result<(), AppError> {
    let rendered = toml::to_string_pretty(config)
        .map_err(|e| AppError::Config(format!("serialize {}: {e}", path.display())))?;
    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, rendered)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn set_key(config: &mut toml::Table, section: &str, key: &str, value: toml::Value) {
    let entry = config
        .entry(section.to_string())
        .or_insert_with(|| toml::Value::Table(toml::Table::new()));
    if !entry.is_table() {
        *entry = toml::Value::Table(toml::Table::new());
    }
    if let toml::Value::Table(table) = entry {
        table.insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct FakeIngestor(IngestReport);

    #[async_trait]
    impl Ingestor for FakeIngestor {
        async fn ingest(&self, _files: &[PathBuf], _workdir: &Path) -> Result<IngestReport, AppError> {
            Ok(self.0.clone())
        }
    }

    struct FixedTuner(f64);

    #[async_trait]
    impl SampleTuner for FixedTuner {
        async fn tune(&self, _: &StoreLayout, _: &[String], _: &[String]) -> Result<f64, AppError> {
            Ok(self.0)
        }
    }

    fn report(success: usize, failed: usize, skipped: usize, chunks: &[&str]) -> IngestReport {
        IngestReport {
            success,
            failed,
            skipped,
            files: Vec::new(),
            chunks: chunks
                .iter()
                .map(|t| TextChunk { text: t.to_string(), source: "doc.md".into() })
                .collect(),
        }
    }

    fn lifecycle(tmp: &TempDir, report: IngestReport) -> StoreLifecycle {
        let template = tmp.path().join("template.toml");
        std::fs::write(&template, "[feature_store]\nreject_throttle = 0.5\n").unwrap();
        StoreLifecycle::new(
            &tmp.path().join("stores"),
            &template,
            true,
            Arc::new(FakeIngestor(report)),
            Arc::new(FixedTuner(0.42)),
        )
    }

    fn add_doc(id: &str, paths: &[&str], entities: &[&str]) -> AddDocPayload {
        AddDocPayload {
            name: "docs".into(),
            feature_store_id: id.into(),
            path_list: paths.iter().map(|p| p.to_string()).collect(),
            file_abs_base: None,
            entities: entities.iter().map(|e| e.to_string()).collect(),
        }
    }

    #[test]
    fn store_ids_are_validated() {
        assert!(validate_store_id("fs-1").is_ok());
        for bad in ["", ".", "..", "a/b", "a\\b"] {
            assert!(matches!(validate_store_id(bad), Err(AppError::Validation(_))), "{bad}");
        }
    }

    #[test]
    fn ensure_layout_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let lc = lifecycle(&tmp, IngestReport::default());
        let layout = lc.ensure_layout("fs1").unwrap();
        assert!(layout.is_built());
        std::fs::write(&layout.config_path, "custom = true\n").unwrap();
        lc.ensure_layout("fs1").unwrap();
        assert_eq!(std::fs::read_to_string(&layout.config_path).unwrap(), "custom = true\n");
    }

    #[test]
    fn missing_template_is_io_error() {
        let tmp = TempDir::new().unwrap();
        let lc = StoreLifecycle::new(
            tmp.path(),
            &tmp.path().join("nope.toml"),
            true,
            Arc::new(FakeIngestor(IngestReport::default())),
            Arc::new(FixedTuner(0.1)),
        );
        assert!(matches!(lc.ensure_layout("fs1"), Err(AppError::Io(_))));
    }

    #[test]
    fn summary_classification() {
        assert_eq!(summarize(3, &report(3, 0, 0, &[])).0, StatusCode::Success);
        assert_eq!(summarize(3, &report(0, 2, 1, &[])).0, StatusCode::Failed);
        let (code, status) = summarize(3, &report(2, 1, 0, &[]));
        assert_eq!(code, StatusCode::Success);
        assert!(status.contains("2 succeeded"));
        assert!(status.contains("1 failed"));
    }

    #[tokio::test]
    async fn build_writes_desc_and_index() {
        let tmp = TempDir::new().unwrap();
        let lc = lifecycle(
            &tmp,
            report(1, 0, 0, &["Deploy with MMDeploy.", "ncnn and mmdeploy", "nothing here"]),
        );
        let outcome = lc
            .build_from_documents(&add_doc("fs1", &["/a.md"], &["mmdeploy", "ncnn"]))
            .await
            .unwrap();
        assert_eq!(outcome.code, StatusCode::Success);

        let layout = lc.layout("fs1").unwrap();
        assert_eq!(std::fs::read_to_string(&layout.desc_path).unwrap(), "docs");

        let index = EntityIndex::open(&layout.index_dir(), true).unwrap();
        assert_eq!(index.relation_count().unwrap(), 2);
        assert_eq!(index.chunks_for(&[0]).unwrap(), vec![(0, 1), (1, 1)]);
        assert_eq!(index.chunks_for(&[1]).unwrap(), vec![(1, 1)]);
    }

    #[tokio::test]
    async fn rebuild_replaces_relations() {
        let tmp = TempDir::new().unwrap();
        let lc = lifecycle(&tmp, report(1, 0, 0, &["rust"]));
        lc.build_from_documents(&add_doc("fs1", &["/a.md"], &["rust"])).await.unwrap();
        lc.build_from_documents(&add_doc("fs1", &["/a.md"], &["rust"])).await.unwrap();
        let index = EntityIndex::open(&lc.layout("fs1").unwrap().index_dir(), true).unwrap();
        assert_eq!(index.relation_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn rebuild_without_vocabulary_empties_index() {
        let tmp = TempDir::new().unwrap();
        let lc = lifecycle(&tmp, report(1, 0, 0, &["rust everywhere"]));
        lc.build_from_documents(&add_doc("fs1", &["/a.md"], &["rust"])).await.unwrap();
        lc.build_from_documents(&add_doc("fs1", &["/b.md"], &[])).await.unwrap();

        let index = EntityIndex::open(&lc.layout("fs1").unwrap().index_dir(), true).unwrap();
        assert!(index.vocabulary().is_empty());
        assert_eq!(index.relation_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn build_without_vocabulary_creates_no_index() {
        let tmp = TempDir::new().unwrap();
        let lc = lifecycle(&tmp, report(1, 0, 0, &["rust"]));
        lc.build_from_documents(&add_doc("fs1", &["/a.md"], &[])).await.unwrap();
        assert!(!lc.layout("fs1").unwrap().index_dir().exists());
    }

    #[tokio::test]
    async fn empty_path_list_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let lc = lifecycle(&tmp, IngestReport::default());
        let err = lc.build_from_documents(&add_doc("fs1", &[], &[])).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BadParameter);
    }

    #[tokio::test]
    async fn update_sample_writes_threshold() {
        let tmp = TempDir::new().unwrap();
        let lc = lifecycle(&tmp, IngestReport::default());
        let layout = lc.ensure_layout("fs1").unwrap();

        let pos = tmp.path().join("pos.json");
        std::fs::write(&pos, r#"["how to install"]"#).unwrap();
        let payload = UpdateSamplePayload {
            name: "docs".into(),
            feature_store_id: "fs1".into(),
            positive_path: Some(pos.display().to_string()),
            negative_path: None,
            positive: Vec::new(),
            negative: vec!["nice weather".into()],
        };
        lc.update_sample(&payload).await.unwrap();

        let config = load_store_config(&layout.config_path).unwrap();
        assert_eq!(config["feature_store"]["reject_throttle"].as_float(), Some(0.42));
    }

    #[tokio::test]
    async fn update_sample_on_unknown_store_is_internal() {
        let tmp = TempDir::new().unwrap();
        let lc = lifecycle(&tmp, IngestReport::default());
        let payload = UpdateSamplePayload {
            name: String::new(),
            feature_store_id: "ghost".into(),
            positive_path: None,
            negative_path: None,
            positive: vec!["a".into()],
            negative: vec!["b".into()],
        };
        let err = lc.update_sample(&payload).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::InternalError);
        assert!(!tmp.path().join("stores").join("ghost").exists());
    }

    #[tokio::test]
    async fn unreadable_sample_file_is_bad_parameter() {
        let tmp = TempDir::new().unwrap();
        let lc = lifecycle(&tmp, IngestReport::default());
        lc.ensure_layout("fs1").unwrap();
        let payload = UpdateSamplePayload {
            name: String::new(),
            feature_store_id: "fs1".into(),
            positive_path: Some("/definitely/missing.json".into()),
            negative_path: None,
            positive: Vec::new(),
            negative: vec!["b".into()],
        };
        let err = lc.update_sample(&payload).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BadParameter);
    }

    #[tokio::test]
    async fn update_pipeline_sets_token() {
        let tmp = TempDir::new().unwrap();
        let lc = lifecycle(&tmp, IngestReport::default());
        let layout = lc.ensure_layout("fs1").unwrap();
        let payload = UpdatePipelinePayload {
            name: String::new(),
            feature_store_id: "fs1".into(),
            web_search_token: "tok".into(),
        };
        lc.update_pipeline(&payload).await.unwrap();
        let config = load_store_config(&layout.config_path).unwrap();
        assert_eq!(config["web_search"]["x_api_key"].as_str(), Some("tok"));
        assert_eq!(config["feature_store"]["reject_throttle"].as_float(), Some(0.5));
    }

    #[test]
    fn set_key_replaces_non_table_section() {
        let mut t: toml::Table = "web_search = 1".parse().unwrap();
        set_key(&mut t, "web_search", "x_api_key", toml::Value::String("k".into()));
        assert_eq!(t["web_search"]["x_api_key"].as_str(), Some("k"));
    }
}
