//! Integration tests for the task dispatcher over an in-memory queue.
//!
//! Run with:
//!   cargo test --test test_dispatcher

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use featurestore_worker::config::Config;
use featurestore_worker::dispatch::task::{ChatResponse, StatusCode, TaskStatus, TaskType};
use featurestore_worker::dispatch::{QueueNames, TaskDispatcher};
use featurestore_worker::error::AppError;
use featurestore_worker::index::cache::IndexCache;
use featurestore_worker::queue::DurableQueue;
use featurestore_worker::queue::memory::MemoryQueue;
use featurestore_worker::store::plaintext::{EchoResponder, FixedThresholdTuner, PlainTextIngestor};
use featurestore_worker::store::{IngestReport, Ingestor, StoreLifecycle};

const TEMPLATE: &str = "[feature_store]\nreject_throttle = 0.5\n\n[web_search]\nx_api_key = \"\"\n";

// ── helpers ──────────────────────────────────────────────────────────────────

/// Reports a fixed `(success, failed, skipped)` triple; the first `fail_first`
/// calls return an error instead.
struct ScriptedIngestor {
    success: usize,
    failed: usize,
    skipped: usize,
    fail_first: usize,
    calls: AtomicUsize,
}

impl ScriptedIngestor {
    fn new(success: usize, failed: usize, skipped: usize) -> Self {
        Self { success, failed, skipped, fail_first: 0, calls: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl Ingestor for ScriptedIngestor {
    async fn ingest(&self, _files: &[PathBuf], _workdir: &Path) -> Result<IngestReport, AppError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err(AppError::Collaborator("parser crashed".into()));
        }
        Ok(IngestReport {
            success: self.success,
            failed: self.failed,
            skipped: self.skipped,
            ..IngestReport::default()
        })
    }
}

struct Harness {
    _tmp: TempDir,
    base: PathBuf,
    queue: Arc<MemoryQueue>,
    names: QueueNames,
    dispatcher: TaskDispatcher,
}

fn harness(ingestor: Arc<dyn Ingestor>) -> Harness {
    let tmp = TempDir::new().expect("tempdir");
    let template = tmp.path().join("store-template.toml");
    std::fs::write(&template, TEMPLATE).expect("write template");
    let config = Config::for_base_dir(&tmp.path().join("stores"), &template);

    let queue = Arc::new(MemoryQueue::new(&config.queue.namespace));
    let lifecycle = StoreLifecycle::new(
        &config.base_dir,
        &config.template_path,
        config.index.case_insensitive,
        ingestor,
        Arc::new(FixedThresholdTuner::new(0.31)),
    );
    let names = QueueNames::from(&config.queue);
    let dispatcher = TaskDispatcher::new(
        queue.clone(),
        names.clone(),
        lifecycle,
        Arc::new(EchoResponder::default()),
        IndexCache::new(config.index.cache_size, config.index.case_insensitive),
    );
    Harness { _tmp: tmp, base: config.base_dir, queue, names, dispatcher }
}

impl Harness {
    async fn statuses(&self) -> Vec<TaskStatus> {
        self.queue
            .drain_all(&self.names.response)
            .await
            .unwrap()
            .iter()
            .map(|raw| serde_json::from_str(raw).expect("status json"))
            .collect()
    }

    async fn chat_replies(&self) -> Vec<ChatResponse> {
        self.queue
            .drain_all(&self.names.chat)
            .await
            .unwrap()
            .iter()
            .map(|raw| serde_json::from_str(raw).expect("chat json"))
            .collect()
    }
}

fn add_doc(store: &str, paths: &[&str]) -> String {
    json!({
        "type": "add_doc",
        "payload": {"name": "docs", "feature_store_id": store, "path_list": paths}
    })
    .to_string()
}

// ── add_doc ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn partial_ingest_reports_success_with_counts() {
    let mut h = harness(Arc::new(ScriptedIngestor::new(2, 1, 0)));
    h.dispatcher.process(&add_doc("fs1", &["/a.md", "/b.md", "/c.md"])).await.unwrap();

    let statuses = h.statuses().await;
    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[0].code, StatusCode::WorkInProgress);
    assert_eq!(statuses[0].task_type, TaskType::AddDoc);
    assert_eq!(statuses[1].code, StatusCode::Success);
    assert_eq!(statuses[1].feature_store_id, "fs1");
    assert!(statuses[1].status.contains("2 succeeded"), "{}", statuses[1].status);
    assert!(statuses[1].status.contains("1 failed"), "{}", statuses[1].status);

    assert!(h.base.join("fs1").join("config.toml").is_file());
    assert_eq!(std::fs::read_to_string(h.base.join("fs1").join("desc")).unwrap(), "docs");
}

#[tokio::test]
async fn nothing_ingested_is_failed() {
    let mut h = harness(Arc::new(ScriptedIngestor::new(0, 2, 0)));
    h.dispatcher.process(&add_doc("fs1", &["/a.md", "/b.md"])).await.unwrap();
    let statuses = h.statuses().await;
    assert_eq!(statuses.last().unwrap().code, StatusCode::Failed);
}

#[tokio::test]
async fn handler_error_yields_one_failed_and_loop_continues() {
    let ingestor = ScriptedIngestor { fail_first: 1, ..ScriptedIngestor::new(1, 0, 0) };
    let mut h = harness(Arc::new(ingestor));

    h.dispatcher.process(&add_doc("broken", &["/a.md"])).await.unwrap();
    h.dispatcher.process(&add_doc("healthy", &["/a.md"])).await.unwrap();

    let statuses = h.statuses().await;
    let codes: Vec<(String, StatusCode)> = statuses
        .iter()
        .map(|s| (s.feature_store_id.clone(), s.code))
        .collect();
    assert_eq!(
        codes,
        vec![
            ("broken".to_string(), StatusCode::WorkInProgress),
            ("broken".to_string(), StatusCode::Failed),
            ("healthy".to_string(), StatusCode::WorkInProgress),
            ("healthy".to_string(), StatusCode::Success),
        ]
    );
    assert!(statuses[1].status.contains("parser crashed"));
}

#[tokio::test]
async fn real_ingest_attaches_file_states() {
    let mut h = harness(Arc::new(PlainTextIngestor::new(900, vec!["md".into()])));
    let doc = h._tmp.path().join("guide.md");
    std::fs::write(&doc, "# Guide\n\nInstall with cargo.\n").unwrap();
    let missing = h._tmp.path().join("missing.md");

    h.dispatcher
        .process(&add_doc("fs1", &[doc.to_str().unwrap(), missing.to_str().unwrap()]))
        .await
        .unwrap();

    let last = h.statuses().await.pop().unwrap();
    assert_eq!(last.code, StatusCode::Success);
    assert_eq!(last.files_state.len(), 2);
    assert!(last.files_state[0].status);
    assert!(!last.files_state[1].status);
}

// ── decode errors ────────────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_type_is_skipped_without_status() {
    let mut h = harness(Arc::new(ScriptedIngestor::new(1, 0, 0)));
    h.dispatcher
        .process(r#"{"type":"reindex","payload":{"feature_store_id":"fs1"}}"#)
        .await
        .unwrap();
    h.dispatcher.process("not json at all").await.unwrap();
    assert!(h.statuses().await.is_empty());
}

#[tokio::test]
async fn malformed_payload_with_store_id_is_bad_parameter() {
    let mut h = harness(Arc::new(ScriptedIngestor::new(1, 0, 0)));
    h.dispatcher
        .process(r#"{"type":"add_doc","payload":{"feature_store_id":"fs1","path_list":7}}"#)
        .await
        .unwrap();
    let statuses = h.statuses().await;
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].code, StatusCode::BadParameter);
}

// ── update_sample / update_pipeline ──────────────────────────────────────────

#[tokio::test]
async fn update_sample_with_empty_negative_is_bad_parameter() {
    let mut h = harness(Arc::new(ScriptedIngestor::new(1, 0, 0)));
    h.dispatcher.process(&add_doc("fs1", &["/a.md"])).await.unwrap();
    h.statuses().await;
    let config_path = h.base.join("fs1").join("config.toml");
    let before = std::fs::read_to_string(&config_path).unwrap();

    let task = json!({
        "type": "update_sample",
        "payload": {"name": "docs", "feature_store_id": "fs1", "positive": ["how to build"], "negative": []}
    });
    h.dispatcher.process(&task.to_string()).await.unwrap();

    let statuses = h.statuses().await;
    assert_eq!(statuses.last().unwrap().code, StatusCode::BadParameter);
    assert_eq!(std::fs::read_to_string(&config_path).unwrap(), before);
}

#[tokio::test]
async fn update_sample_writes_threshold() {
    let mut h = harness(Arc::new(ScriptedIngestor::new(1, 0, 0)));
    h.dispatcher.process(&add_doc("fs1", &["/a.md"])).await.unwrap();

    let task = json!({
        "type": "update_sample",
        "payload": {"name": "docs", "feature_store_id": "fs1", "positive": ["a"], "negative": ["b"]}
    });
    h.dispatcher.process(&task.to_string()).await.unwrap();

    assert_eq!(h.statuses().await.last().unwrap().code, StatusCode::Success);
    let config: toml::Table = std::fs::read_to_string(h.base.join("fs1").join("config.toml"))
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(config["feature_store"]["reject_throttle"].as_float(), Some(0.31));
}

#[tokio::test]
async fn update_on_unbuilt_store_is_internal_error() {
    let mut h = harness(Arc::new(ScriptedIngestor::new(1, 0, 0)));
    let task = json!({
        "type": "update_pipeline",
        "payload": {"name": "x", "feature_store_id": "ghost", "web_search_token": "t"}
    });
    h.dispatcher.process(&task.to_string()).await.unwrap();

    let statuses = h.statuses().await;
    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[1].code, StatusCode::InternalError);
    assert_eq!(statuses[1].task_type, TaskType::UpdatePipeline);
    assert!(!h.base.join("ghost").exists());
}

// ── chat ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn chat_uses_entity_boost() {
    let mut h = harness(Arc::new(PlainTextIngestor::new(900, vec!["md".into()])));
    let doc = h._tmp.path().join("deploy.md");
    std::fs::write(&doc, "MMDeploy can export models to ncnn.").unwrap();

    let build = json!({
        "type": "add_doc",
        "payload": {
            "name": "deploy",
            "feature_store_id": "fs1",
            "path_list": [doc.to_str().unwrap()],
            "entities": ["mmdeploy", "ncnn"]
        }
    });
    h.dispatcher.process(&build.to_string()).await.unwrap();
    assert_eq!(h.statuses().await.last().unwrap().code, StatusCode::Success);

    let chat = json!({
        "type": "chat",
        "payload": {
            "query_id": "q-1",
            "feature_store_id": "fs1",
            "content": "Does NCNN work?",
            "images": [],
            "history": [{"sender": 0, "content": "hi"}, {"sender": 1, "content": "hello"}]
        }
    });
    h.dispatcher.process(&chat.to_string()).await.unwrap();

    assert!(h.statuses().await.is_empty(), "chat must not emit task status");
    let replies = h.chat_replies().await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].query_id, "q-1");
    assert_eq!(replies[0].response.code, StatusCode::Success);
    assert!(replies[0].response.text.contains("MMDeploy can export"));
    assert_eq!(replies[0].response.references, vec![doc.display().to_string()]);
}

fn chat(store: &str, query_id: &str, content: &str) -> String {
    json!({
        "type": "chat",
        "payload": {"query_id": query_id, "feature_store_id": store, "content": content}
    })
    .to_string()
}

fn add_doc_with_entities(store: &str, paths: &[&PathBuf], entities: &[&str]) -> String {
    let paths: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
    json!({
        "type": "add_doc",
        "payload": {"name": "docs", "feature_store_id": store, "path_list": paths, "entities": entities}
    })
    .to_string()
}

#[tokio::test]
async fn rebuild_without_entities_drops_stale_boost() {
    let mut h = harness(Arc::new(PlainTextIngestor::new(900, vec!["md".into()])));
    let first = h._tmp.path().join("a.md");
    std::fs::write(&first, "ncnn runs on phones").unwrap();
    let second = h._tmp.path().join("b.md");
    std::fs::write(&second, "the weather is unrelated").unwrap();

    h.dispatcher.process(&add_doc_with_entities("fs1", &[&first], &["ncnn"])).await.unwrap();
    h.dispatcher.process(&chat("fs1", "q-1", "what is ncnn")).await.unwrap();
    let before = h.chat_replies().await;
    assert_eq!(before[0].response.text, "ncnn runs on phones");

    h.dispatcher.process(&add_doc_with_entities("fs1", &[&second], &[])).await.unwrap();
    assert_eq!(h.statuses().await.last().unwrap().code, StatusCode::Success);

    h.dispatcher.process(&chat("fs1", "q-2", "what is ncnn")).await.unwrap();
    let after = h.chat_replies().await;
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].response.text, "[echo] what is ncnn");
    assert!(after[0].response.references.is_empty());
}

#[tokio::test]
async fn boost_is_capped_by_limit() {
    let mut h = harness(Arc::new(PlainTextIngestor::new(900, vec!["md".into()])));
    h.dispatcher = h.dispatcher.with_boost_limit(1);
    let first = h._tmp.path().join("a.md");
    std::fs::write(&first, "ncnn on android").unwrap();
    let second = h._tmp.path().join("b.md");
    std::fs::write(&second, "ncnn on ios").unwrap();

    h.dispatcher
        .process(&add_doc_with_entities("fs1", &[&first, &second], &["ncnn"]))
        .await
        .unwrap();
    h.dispatcher.process(&chat("fs1", "q", "ncnn?")).await.unwrap();

    let replies = h.chat_replies().await;
    assert_eq!(replies[0].response.text, "ncnn on android");
    assert_eq!(replies[0].response.references, vec![first.display().to_string()]);
}

#[tokio::test]
async fn chat_on_unbuilt_store_is_bad_parameter() {
    let mut h = harness(Arc::new(ScriptedIngestor::new(1, 0, 0)));
    let chat = json!({
        "type": "chat",
        "payload": {"query_id": "q", "feature_store_id": "nowhere", "content": "hi"}
    });
    h.dispatcher.process(&chat.to_string()).await.unwrap();

    let raw: Vec<Value> = h
        .queue
        .drain_all("ChatResponse")
        .await
        .unwrap()
        .iter()
        .map(|r| serde_json::from_str(r).unwrap())
        .collect();
    assert_eq!(raw.len(), 1);
    assert_eq!(raw[0]["response"]["code"], "BAD_PARAMETER");
    assert_eq!(raw[0]["feature_store_id"], "nowhere");
}

// ── run loop ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn run_consumes_queue_until_cancelled() {
    let h = harness(Arc::new(ScriptedIngestor::new(1, 0, 0)));
    let queue = h.queue.clone();
    queue.push("Task", &add_doc("a", &["/x.md"])).await.unwrap();
    queue.push("Task", &add_doc("b", &["/x.md"])).await.unwrap();

    let shutdown = CancellationToken::new();
    let worker = tokio::spawn(h.dispatcher.run(shutdown.clone()));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while queue.size("TaskResponse").await.unwrap() < 4 {
        assert!(tokio::time::Instant::now() < deadline, "dispatcher did not finish");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    worker.await.unwrap().unwrap();

    let ids: Vec<String> = queue
        .drain_all("TaskResponse")
        .await
        .unwrap()
        .iter()
        .map(|r| serde_json::from_str::<TaskStatus>(r).unwrap().feature_store_id)
        .collect();
    assert_eq!(ids, vec!["a", "a", "b", "b"]);
    assert_eq!(queue.size("Task").await.unwrap(), 0);
}
