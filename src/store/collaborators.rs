//! Seams to the pipeline stages the worker does not implement itself.
//!
//! Parsing documents, tuning a rejection threshold and producing a chat
//! answer all belong to external pipelines.  The lifecycle and dispatcher
//! only see these traits; [`super::plaintext`] provides plain-text reference
//! implementations.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::StoreLayout;
use crate::dispatch::task::StatusCode;
use crate::error::AppError;

/// Outcome of ingesting one input file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileState {
    pub file: String,
    pub status: bool,
    pub desc: String,
}

/// One text fragment produced by ingestion.  Its chunk id is its position in
/// [`IngestReport::chunks`].
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub text: String,
    pub source: String,
}

#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub files: Vec<FileState>,
    pub chunks: Vec<TextChunk>,
}

#[async_trait]
pub trait Ingestor: Send + Sync {
    /// Turn `files` into text chunks, writing any artefacts under `workdir`.
    /// Per-file problems are reported in the result, not as an error.
    async fn ingest(&self, files: &[PathBuf], workdir: &Path) -> Result<IngestReport, AppError>;
}

#[async_trait]
pub trait SampleTuner: Send + Sync {
    /// Compute the rejection threshold for a store from labelled examples.
    async fn tune(
        &self,
        layout: &StoreLayout,
        positive: &[String],
        negative: &[String],
    ) -> Result<f64, AppError>;
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub query_id: String,
    pub query: String,
    /// `[user, assistant]` turns, oldest first.
    pub history: Vec<(String, String)>,
    pub images: Vec<String>,
    /// Keyword-boost candidates as `(chunk_id, shared_entities)`.
    pub boosted: Vec<(u64, usize)>,
}

#[derive(Debug, Clone)]
pub struct ChatAnswer {
    pub code: StatusCode,
    pub text: String,
    pub references: Vec<String>,
}

#[async_trait]
pub trait ChatResponder: Send + Sync {
    async fn respond(&self, layout: &StoreLayout, request: &ChatRequest)
    -> Result<ChatAnswer, AppError>;
}
