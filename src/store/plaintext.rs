//! Plain-text reference collaborators.
//!
//! Enough to run the worker end to end without the parsing, embedding and
//! LLM pipelines: text and markdown files are split into chunks, the tuner
//! hands back a fixed threshold, and the responder quotes the boosted
//! chunks back to the user.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use text_splitter::MarkdownSplitter;
use tracing::{debug, warn};

use super::StoreLayout;
use super::collaborators::{
    ChatAnswer, ChatRequest, ChatResponder, FileState, IngestReport, Ingestor, SampleTuner,
    TextChunk,
};
use crate::dispatch::task::StatusCode;
use crate::error::AppError;

/// Chunk listing written to the workdir after every ingestion.
pub const CHUNKS_FILENAME: &str = "chunks.jsonl";
/// Threshold proposed when no tuning pipeline is wired in.
pub const DEFAULT_REJECT_THROTTLE: f64 = 0.5;
const PREPROCESS_DIR: &str = "preprocess";

#[derive(Debug, Serialize, Deserialize)]
struct StoredChunk {
    id: u64,
    source: String,
    text: String,
}

// ── Ingestor ─────────────────────────────────────────────────────────────────

pub struct PlainTextIngestor {
    chunk_size: usize,
    extensions: Vec<String>,
}

impl PlainTextIngestor {
    pub fn new(chunk_size: usize, extensions: Vec<String>) -> Self {
        Self { chunk_size, extensions }
    }

    fn supports(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .is_some_and(|e| self.extensions.iter().any(|x| *x == e))
    }
}

fn file_state(path: &Path, status: bool, desc: impl Into<String>) -> FileState {
    FileState { file: path.display().to_string(), status, desc: desc.into() }
}

#[async_trait]
impl Ingestor for PlainTextIngestor {
    async fn ingest(&self, files: &[PathBuf], workdir: &Path) -> Result<IngestReport, AppError> {
        let preprocess = workdir.join(PREPROCESS_DIR);
        tokio::fs::create_dir_all(&preprocess).await?;

        let splitter = MarkdownSplitter::new(self.chunk_size);
        let mut report = IngestReport::default();

        for path in files {
            if !path.is_file() {
                warn!(file = %path.display(), "input file not found");
                report.failed += 1;
                report.files.push(file_state(path, false, "file not found"));
                continue;
            }
            if !self.supports(path) {
                debug!(file = %path.display(), "unsupported format, skipped");
                report.skipped += 1;
                report.files.push(file_state(path, false, "skip"));
                continue;
            }

            let content = match tokio::fs::read_to_string(path).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "cannot read input file");
                    report.failed += 1;
                    report.files.push(file_state(path, false, e.to_string()));
                    continue;
                }
            };

            let digest = hex::encode(Sha256::digest(content.as_bytes()));
            tokio::fs::write(preprocess.join(format!("{digest}.text")), &content).await?;

            let source = path.display().to_string();
            report.chunks.extend(
                splitter
                    .chunks(&content)
                    .filter(|t| !t.trim().is_empty())
                    .map(|text| TextChunk { text: text.to_string(), source: source.clone() }),
            );
            report.success += 1;
            report.files.push(file_state(path, true, "ok"));
        }

        let mut listing = String::new();
        for (id, chunk) in report.chunks.iter().enumerate() {
            let line = serde_json::to_string(&StoredChunk {
                id: id as u64,
                source: chunk.source.clone(),
                text: chunk.text.clone(),
            })
            .map_err(|e| AppError::Collaborator(format!("serialize chunk {id}: {e}")))?;
            listing.push_str(&line);
            listing.push('\n');
        }
        tokio::fs::write(workdir.join(CHUNKS_FILENAME), listing).await?;

        Ok(report)
    }
}

// ── Tuner ────────────────────────────────────────────────────────────────────

/// Always proposes the same threshold, whatever the samples say.
pub struct FixedThresholdTuner {
    threshold: f64,
}

impl FixedThresholdTuner {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

#[async_trait]
impl SampleTuner for FixedThresholdTuner {
    async fn tune(
        &self,
        layout: &StoreLayout,
        positive: &[String],
        negative: &[String],
    ) -> Result<f64, AppError> {
        debug!(
            store_id = %layout.id,
            positive = positive.len(),
            negative = negative.len(),
            threshold = self.threshold,
            "fixed threshold"
        );
        Ok(self.threshold)
    }
}

// ── Responder ────────────────────────────────────────────────────────────────

/// Answers with the text of the top boosted chunks.
pub struct EchoResponder {
    max_passages: usize,
}

impl EchoResponder {
    pub fn new(max_passages: usize) -> Self {
        Self { max_passages }
    }
}

impl Default for EchoResponder {
    fn default() -> Self {
        Self::new(3)
    }
}

async fn load_chunks(workdir: &Path) -> Result<HashMap<u64, StoredChunk>, AppError> {
    let path = workdir.join(CHUNKS_FILENAME);
    let raw = match tokio::fs::read_to_string(&path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e.into()),
    };
    raw.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            serde_json::from_str::<StoredChunk>(l)
                .map(|c| (c.id, c))
                .map_err(|e| AppError::Collaborator(format!("parse {}: {e}", path.display())))
        })
        .collect()
}

#[async_trait]
impl ChatResponder for EchoResponder {
    async fn respond(
        &self,
        layout: &StoreLayout,
        request: &ChatRequest,
    ) -> Result<ChatAnswer, AppError> {
        let chunks = load_chunks(&layout.workdir).await?;

        let mut passages = Vec::new();
        let mut references: Vec<String> = Vec::new();
        for (chunk_id, _) in request.boosted.iter().take(self.max_passages) {
            let Some(chunk) = chunks.get(chunk_id) else { continue };
            passages.push(chunk.text.trim().to_string());
            if !references.contains(&chunk.source) {
                references.push(chunk.source.clone());
            }
        }

        let text = if passages.is_empty() {
            format!("[echo] {}", request.query)
        } else {
            passages.join("\n\n")
        };
        Ok(ChatAnswer { code: StatusCode::Success, text, references })
    }
}
