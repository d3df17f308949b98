//! Task dispatcher — the single consumer of the task queue.
//!
//! Each message is handled to completion before the next pop:
//!
//! ```text
//! pop ─▶ decode ─▶ WORK_IN_PROGRESS ─▶ lifecycle op ─▶ terminal status
//! ```
//!
//! Store tasks emit exactly one `WORK_IN_PROGRESS` and one terminal status to
//! the response queue.  Chat tasks emit a single record to the chat queue.
//! A failing handler never stops the loop; only a failing queue does.

pub mod chat;
pub mod task;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::AppError;
use crate::index::cache::{self, IndexCache};
use crate::queue::DurableQueue;
use crate::store::{ChatRequest, ChatResponder, StoreLayout, StoreLifecycle, TaskOutcome};
use task::{
    ChatPayload, ChatReply, ChatResponse, DecodeError, StatusCode, Task, TaskStatus, TaskType,
};

/// Queue names the dispatcher reads from and writes to.
#[derive(Debug, Clone)]
pub struct QueueNames {
    pub task: String,
    pub response: String,
    pub chat: String,
}

impl From<&QueueConfig> for QueueNames {
    fn from(config: &QueueConfig) -> Self {
        Self {
            task: config.task_queue.clone(),
            response: config.response_queue.clone(),
            chat: config.chat_queue.clone(),
        }
    }
}

/// Keyword-boost candidates kept per chat unless configured otherwise.
pub const DEFAULT_BOOST_LIMIT: usize = 100;

pub struct TaskDispatcher {
    queue: Arc<dyn DurableQueue>,
    names: QueueNames,
    lifecycle: StoreLifecycle,
    responder: Arc<dyn ChatResponder>,
    cache: IndexCache,
    boost_limit: usize,
}

impl TaskDispatcher {
    pub fn new(
        queue: Arc<dyn DurableQueue>,
        names: QueueNames,
        lifecycle: StoreLifecycle,
        responder: Arc<dyn ChatResponder>,
        cache: IndexCache,
    ) -> Self {
        Self { queue, names, lifecycle, responder, cache, boost_limit: DEFAULT_BOOST_LIMIT }
    }

    /// Cap the keyword-boost candidates handed to the responder.
    pub fn with_boost_limit(mut self, limit: usize) -> Self {
        self.boost_limit = limit.max(1);
        self
    }

    /// Consume the task queue until `shutdown` is cancelled.
    ///
    /// Returns an error only when the queue itself fails.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), AppError> {
        info!(queue = %self.names.task, "dispatcher ready");

        loop {
            let popped = tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("dispatcher shutting down");
                    return Ok(());
                }

                popped = self.queue.pop(&self.names.task, true, None) => popped?,
            };

            if let Some(raw) = popped {
                self.process(&raw).await?;
            }
        }
    }

    /// Handle one raw task message.  Handler failures become status records;
    /// an `Err` here means a record could not be delivered.
    pub async fn process(&mut self, raw: &str) -> Result<(), AppError> {
        let task = match Task::decode(raw) {
            Ok(task) => task,
            Err(DecodeError::BadPayload { task_type, feature_store_id: Some(id), reason })
                if task_type != TaskType::Chat =>
            {
                warn!(store_id = %id, %task_type, %reason, "rejecting task with bad payload");
                let status = TaskStatus {
                    feature_store_id: id,
                    code: StatusCode::BadParameter,
                    task_type,
                    status: format!("{}: {reason}", StatusCode::BadParameter.describe()),
                    files_state: Vec::new(),
                };
                return self.emit(&status).await;
            }
            Err(e) => {
                warn!(error = %e, "skipping undecodable task");
                return Ok(());
            }
        };

        info!(
            store_id = %task.feature_store_id(),
            task_type = %task.task_type(),
            "task received"
        );

        match task {
            Task::Chat(payload) => self.handle_chat(payload).await,
            Task::AddDoc(payload) => {
                let id = payload.feature_store_id.clone();
                self.emit(&TaskStatus::in_progress(&id, TaskType::AddDoc)).await?;
                self.cache.evict(&id);
                let result = self.lifecycle.build_from_documents(&payload).await;
                self.finish(&id, TaskType::AddDoc, result).await
            }
            Task::UpdateSample(payload) => {
                let id = payload.feature_store_id.clone();
                self.emit(&TaskStatus::in_progress(&id, TaskType::UpdateSample)).await?;
                self.cache.evict(&id);
                let result = self.lifecycle.update_sample(&payload).await;
                self.finish(&id, TaskType::UpdateSample, result).await
            }
            Task::UpdatePipeline(payload) => {
                let id = payload.feature_store_id.clone();
                self.emit(&TaskStatus::in_progress(&id, TaskType::UpdatePipeline)).await?;
                let result = self.lifecycle.update_pipeline(&payload).await;
                self.finish(&id, TaskType::UpdatePipeline, result).await
            }
        }
    }

    async fn finish(
        &mut self,
        store_id: &str,
        task_type: TaskType,
        result: Result<TaskOutcome, AppError>,
    ) -> Result<(), AppError> {
        let status = match result {
            Ok(outcome) => {
                info!(%store_id, %task_type, code = ?outcome.code, status = %outcome.status, "task finished");
                TaskStatus {
                    feature_store_id: store_id.to_string(),
                    code: outcome.code,
                    task_type,
                    status: outcome.status,
                    files_state: outcome.files_state,
                }
            }
            Err(e) => {
                error!(%store_id, %task_type, error = %e, "task failed");
                TaskStatus {
                    feature_store_id: store_id.to_string(),
                    code: e.status_code(),
                    task_type,
                    status: e.to_string(),
                    files_state: Vec::new(),
                }
            }
        };
        self.emit(&status).await
    }

    async fn emit(&mut self, status: &TaskStatus) -> Result<(), AppError> {
        let json = serde_json::to_string(status)
            .map_err(|e| AppError::Queue(format!("encode task status: {e}")))?;
        debug!(queue = %self.names.response, %json, "emit status");
        self.queue.push(&self.names.response, &json).await
    }

    // ── chat ─────────────────────────────────────────────────────────────────

    async fn handle_chat(&mut self, payload: ChatPayload) -> Result<(), AppError> {
        let reply = match self.lifecycle.layout(&payload.feature_store_id) {
            Ok(layout) if layout.is_built() => self.answer(&layout, &payload).await,
            Ok(_) => {
                warn!(store_id = %payload.feature_store_id, "chat on a store that was never built");
                reply_with(StatusCode::BadParameter, "store not built")
            }
            Err(e) => reply_with(e.status_code(), &e.to_string()),
        };

        let response = ChatResponse {
            feature_store_id: payload.feature_store_id,
            query_id: payload.query_id,
            response: reply,
        };
        let json = serde_json::to_string(&response)
            .map_err(|e| AppError::Queue(format!("encode chat response: {e}")))?;
        self.queue.push(&self.names.chat, &json).await
    }

    async fn answer(&mut self, layout: &StoreLayout, payload: &ChatPayload) -> ChatReply {
        let boosted = self.keyword_boost(layout, &payload.content).await.unwrap_or_else(|e| {
            warn!(store_id = %layout.id, error = %e, "keyword boost unavailable");
            Vec::new()
        });
        debug!(store_id = %layout.id, candidates = boosted.len(), "keyword boost");

        let request = ChatRequest {
            query_id: payload.query_id.clone(),
            query: payload.content.clone(),
            history: chat::format_history(&payload.history),
            images: payload.images.clone(),
            boosted,
        };

        match self.responder.respond(layout, &request).await {
            Ok(answer) => ChatReply {
                code: answer.code,
                state: answer.code.describe().to_string(),
                text: answer.text,
                references: answer.references,
            },
            Err(e) => {
                error!(store_id = %layout.id, query_id = %payload.query_id, error = %e, "chat failed");
                reply_with(e.status_code(), &e.to_string())
            }
        }
    }

    /// Chunks sharing entities with `query`, best first, at most
    /// `boost_limit` of them.  Empty when the store has no entity index or no
    /// vocabulary.
    async fn keyword_boost(&mut self, layout: &StoreLayout, query: &str) -> Result<Vec<(u64, usize)>, AppError> {
        let dir = layout.index_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let index = self.cache.get_or_open(&layout.id, &dir).await?;
        let query = query.to_string();
        let limit = self.boost_limit;

        tokio::task::spawn_blocking(move || -> Result<Vec<(u64, usize)>, AppError> {
            let index = cache::lock(&index)?;
            if index.vocabulary().is_empty() {
                return Ok(Vec::new());
            }
            let eids = index.match_entities(&query)?;
            let mut chunks = index.chunks_for(&eids)?;
            chunks.truncate(limit);
            Ok(chunks)
        })
        .await
        .map_err(|e| AppError::Index(format!("keyword boost join: {e}")))?
    }
}

fn reply_with(code: StatusCode, state: &str) -> ChatReply {
    ChatReply {
        code,
        state: state.to_string(),
        text: String::new(),
        references: Vec::new(),
    }
}
