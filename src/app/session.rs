//! Search session state machine.
//!
//! ```text
//! Idle --start--> Running --ok--> Succeeded
//!                    |
//!                    +--error--> Failed
//! any state --reset--> Idle
//! ```
//!
//! A running session owns one progress channel and exactly one result
//! request. The channel is closed as soon as the request settles, whatever
//! the outcome, and a best-effort history refresh follows.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tracing::Instrument;

use crate::{
    config::Config,
    dedup::{filter_exact, DedupGate, DropReport, UploadFile},
    profile::{SearchResponse, SearchStage},
    progress::{ProgressChannel, ProgressTransport, StageBoard},
    projector,
    retry::{self, Backoff, WaitError},
    session_id::SessionId,
    storage::ResultSlot,
};

use super::{
    backend::{
        Collection, CollectionCreate, FaceValidator, HistoryEntry, PromptSearchRequest, SearchBackend,
        DEFAULT_USER_ID,
    },
    errors::AppError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Running,
    Succeeded,
    Failed,
}

/// Which workflow to run. Prompt modes need a resolved collection, see
/// [`SearchSessionOrchestrator::resolve_collection`].
#[derive(Debug, Clone, PartialEq)]
pub enum SearchMode {
    /// Search with the currently admitted reference photos.
    Image,
    Text {
        prompt: String,
        collection_id: Option<String>,
    },
    Generate {
        prompt: String,
        collection_id: Option<String>,
    },
}

impl SearchMode {
    fn name(&self) -> &'static str {
        match self {
            SearchMode::Image => "image",
            SearchMode::Text { .. } => "text",
            SearchMode::Generate { .. } => "generate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Please upload at least 1 positive photo.")]
    NoPositives,

    #[error("Please enter a description to search for.")]
    EmptyPrompt,

    #[error("No collection available to search in.")]
    NoCollection,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("a search is already running")]
    AlreadyRunning,

    #[error("search was reset before it finished")]
    Abandoned,

    #[error("{0}")]
    Search(String),
}

/// Tunables the session takes from [`Config`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub dedup_threshold: f32,
    pub top_k: u32,
    pub generator: String,
    pub default_collection_name: String,
    pub readiness: Backoff,
}

impl From<&Config> for SessionOptions {
    fn from(config: &Config) -> Self {
        Self {
            dedup_threshold: config.dedup_threshold,
            top_k: config.top_k,
            generator: config.generator.clone(),
            default_collection_name: config.default_collection_name.clone(),
            readiness: config.readiness.backoff(),
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Read model for rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub response: Option<SearchResponse>,
    pub error: Option<String>,
    pub stages: Vec<SearchStage>,
    pub positives: usize,
    pub negatives: usize,
}

struct SessionState {
    status: SessionStatus,
    response: Option<SearchResponse>,
    error: Option<String>,
    /// Id of the running (or last) search; cleared by reset so a late
    /// completion of an abandoned search is ignored.
    session_id: Option<SessionId>,
    positives: Vec<UploadFile>,
    negatives: Vec<UploadFile>,
    history: Vec<HistoryEntry>,
    flight: Option<Flight>,
}

/// Reset's handle on the running search.
struct Flight {
    /// Tells the search to drop its request and close its channel.
    cancel: oneshot::Sender<()>,
    /// Resolves (with an error) once the search has wound down.
    done: oneshot::Receiver<()>,
}

fn take_at(files: &mut Vec<UploadFile>, index: usize) -> Option<UploadFile> {
    (index < files.len()).then(|| files.remove(index))
}

enum PreparedRequest {
    Image {
        positives: Vec<UploadFile>,
        negatives: Vec<UploadFile>,
    },
    Text(PromptSearchRequest),
    Generate(PromptSearchRequest),
}

pub struct SearchSessionOrchestrator {
    backend: Arc<dyn SearchBackend>,
    validator: Arc<dyn FaceValidator>,
    transport: Arc<dyn ProgressTransport>,
    results: ResultSlot,
    options: SessionOptions,
    state: Mutex<SessionState>,
    // async lock: drop batches are validated strictly one after another
    gate: tokio::sync::Mutex<DedupGate>,
    stages: StageBoard,
}

impl SearchSessionOrchestrator {
    /// Create an orchestrator, restoring the last saved search if there is one.
    pub fn new(
        backend: Arc<dyn SearchBackend>,
        validator: Arc<dyn FaceValidator>,
        transport: Arc<dyn ProgressTransport>,
        results: ResultSlot,
        options: SessionOptions,
    ) -> Self {
        let restored = results.load();
        if restored.is_some() {
            log::info!("restored last search results");
        }

        Self {
            backend,
            validator,
            transport,
            results,
            gate: tokio::sync::Mutex::new(DedupGate::new(options.dedup_threshold)),
            options,
            state: Mutex::new(SessionState {
                status: if restored.is_some() {
                    SessionStatus::Succeeded
                } else {
                    SessionStatus::Idle
                },
                response: restored,
                error: None,
                session_id: None,
                positives: vec![],
                negatives: vec![],
                history: vec![],
                flight: None,
            }),
            stages: StageBoard::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> SessionStatus {
        self.lock().status
    }

    pub fn response(&self) -> Option<SearchResponse> {
        self.lock().response.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.lock().error.clone()
    }

    pub fn stages(&self) -> Vec<SearchStage> {
        self.stages.snapshot()
    }

    /// Shared handle to the live stage list, for progress rendering.
    pub fn stage_board(&self) -> StageBoard {
        self.stages.clone()
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.lock().history.clone()
    }

    pub fn positives(&self) -> Vec<UploadFile> {
        self.lock().positives.clone()
    }

    pub fn negatives(&self) -> Vec<UploadFile> {
        self.lock().negatives.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.lock();
        SessionSnapshot {
            status: state.status,
            response: state.response.clone(),
            error: state.error.clone(),
            stages: self.stages.snapshot(),
            positives: state.positives.len(),
            negatives: state.negatives.len(),
        }
    }

    /// Run newly dropped positive references through the dedup gate and
    /// append the admitted ones.
    pub async fn add_positives(&self, batch: Vec<UploadFile>) -> DropReport {
        let mut gate = self.gate.lock().await;
        let accepted = self
            .lock()
            .positives
            .iter()
            .map(UploadFile::key)
            .collect::<Vec<_>>();

        let report = gate
            .admit_positives(self.validator.as_ref(), batch, &accepted)
            .await;

        self.lock()
            .positives
            .extend(report.admitted.iter().cloned());
        report
    }

    /// Negative references only get the exact (name, size) filter.
    pub fn add_negatives(&self, batch: Vec<UploadFile>) -> DropReport {
        let mut state = self.lock();
        let accepted = state
            .negatives
            .iter()
            .map(UploadFile::key)
            .collect::<Vec<_>>();

        let report = filter_exact(batch, &accepted);
        state.negatives.extend(report.admitted.iter().cloned());
        report
    }

    pub async fn remove_positive(&self, index: usize) -> Option<UploadFile> {
        let mut gate = self.gate.lock().await;
        let removed = take_at(&mut self.lock().positives, index)?;

        gate.forget(&removed.key());
        Some(removed)
    }

    pub fn remove_negative(&self, index: usize) -> Option<UploadFile> {
        take_at(&mut self.lock().negatives, index)
    }

    /// Pick the collection prompt searches run against.
    ///
    /// `preferred` must name an existing collection; without it the first
    /// listed collection is used, and when there are none a default one is
    /// created. Returns `None` when `preferred` does not exist.
    pub async fn resolve_collection(
        &self,
        preferred: Option<&str>,
    ) -> Result<Option<String>, AppError> {
        let collections = self.backend.list_collections().await?;

        if let Some(preferred) = preferred {
            if collections.iter().any(|c| c.id == preferred) {
                return Ok(Some(preferred.to_string()));
            }
            log::warn!("collection {preferred} not found");
            return Ok(None);
        }

        if let Some(first) = collections.first() {
            return Ok(Some(first.id.clone()));
        }

        log::info!(
            "no collections yet, creating '{}'",
            self.options.default_collection_name
        );
        let created = self
            .create_collection(&self.options.default_collection_name, None)
            .await?;

        Ok(Some(created.id))
    }

    pub async fn collections(&self) -> Result<Vec<Collection>, AppError> {
        self.backend.list_collections().await
    }

    pub async fn create_collection(
        &self,
        name: &str,
        description: Option<String>,
    ) -> Result<Collection, AppError> {
        self.backend
            .create_collection(&CollectionCreate {
                name: name.to_string(),
                description,
                user_id: DEFAULT_USER_ID.to_string(),
            })
            .await
    }

    /// Probe the backend until it answers.
    pub async fn wait_until_ready(&self) -> Result<(), WaitError<AppError>> {
        retry::wait_until(
            self.options.readiness,
            || self.backend.list_collections(),
            |_| true,
        )
        .await
        .map(|_| ())
    }

    /// Best-effort refresh of the search history. Failures are logged only.
    pub async fn refresh_history(&self) {
        match self.backend.fetch_history().await {
            Ok(history) => self.lock().history = history,
            Err(err) => log::warn!("history refresh failed: {err}"),
        }
    }

    fn prompt_request(
        &self,
        prompt: String,
        collection_id: Option<String>,
        session_id: &SessionId,
        generator: Option<String>,
    ) -> Result<PromptSearchRequest, ValidationError> {
        if prompt.trim().is_empty() {
            return Err(ValidationError::EmptyPrompt);
        }
        let collection_id = collection_id
            .filter(|id| !id.is_empty())
            .ok_or(ValidationError::NoCollection)?;

        Ok(PromptSearchRequest {
            prompt,
            collection_id,
            session_id: session_id.clone(),
            top_k: self.options.top_k,
            generator,
        })
    }

    fn prepare(
        &self,
        state: &SessionState,
        mode: SearchMode,
        session_id: &SessionId,
    ) -> Result<PreparedRequest, ValidationError> {
        match mode {
            SearchMode::Image => {
                if state.positives.is_empty() {
                    return Err(ValidationError::NoPositives);
                }
                Ok(PreparedRequest::Image {
                    positives: state.positives.clone(),
                    negatives: state.negatives.clone(),
                })
            }
            SearchMode::Text {
                prompt,
                collection_id,
            } => self
                .prompt_request(prompt, collection_id, session_id, None)
                .map(PreparedRequest::Text),
            SearchMode::Generate {
                prompt,
                collection_id,
            } => self
                .prompt_request(
                    prompt,
                    collection_id,
                    session_id,
                    Some(self.options.generator.clone()),
                )
                .map(PreparedRequest::Generate),
        }
    }

    /// Start a search.
    ///
    /// Rejected without any network activity when a search is already
    /// running or the inputs for `mode` are incomplete. Otherwise opens the
    /// progress channel, issues the one result request and settles into
    /// `Succeeded` or `Failed`.
    pub async fn start(&self, mode: SearchMode) -> Result<SearchResponse, SessionError> {
        let mode_name = mode.name();
        let session_id = SessionId::new();

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        let request = {
            let mut state = self.lock();
            if state.status == SessionStatus::Running {
                log::warn!("search already running, ignoring start");
                return Err(SessionError::AlreadyRunning);
            }

            let request = match self.prepare(&state, mode, &session_id) {
                Ok(request) => request,
                Err(err) => {
                    state.error = Some(err.to_string());
                    return Err(err.into());
                }
            };

            state.status = SessionStatus::Running;
            state.response = None;
            state.error = None;
            state.session_id = Some(session_id.clone());
            state.flight = Some(Flight {
                cancel: cancel_tx,
                done: done_rx,
            });
            request
        };

        let span = tracing::info_span!("search", session_id = %session_id, mode = mode_name);
        let result = self
            .run(request, session_id, cancel_rx)
            .instrument(span)
            .await;
        drop(done_tx);
        result
    }

    async fn run(
        &self,
        request: PreparedRequest,
        session_id: SessionId,
        cancelled: oneshot::Receiver<()>,
    ) -> Result<SearchResponse, SessionError> {
        log::info!("search {session_id} started");
        self.stages.begin(&session_id);

        let channel = ProgressChannel::open(
            self.transport.clone(),
            session_id.clone(),
            self.stages.clone(),
        );

        let submit = async {
            match &request {
                PreparedRequest::Image {
                    positives,
                    negatives,
                } => {
                    self.backend
                        .submit_image_search(positives, negatives, &session_id)
                        .await
                }
                PreparedRequest::Text(body) => self.backend.submit_text_search(body).await,
                PreparedRequest::Generate(body) => {
                    self.backend.submit_generate_search(body).await
                }
            }
        };

        // reset drops the in-flight request along with its channel
        let outcome = tokio::select! {
            outcome = submit => Some(outcome),
            _ = cancelled => None,
        };

        channel.close();
        self.stages.finish(&session_id);

        let Some(outcome) = outcome else {
            log::info!("search {session_id} cancelled by reset");
            return Err(SessionError::Abandoned);
        };

        let result = self.settle(&session_id, outcome);
        if !matches!(result, Err(SessionError::Abandoned)) {
            self.refresh_history().await;
        }
        result
    }

    fn is_current(&self, session_id: &SessionId) -> bool {
        self.lock().session_id.as_ref() == Some(session_id)
    }

    fn settle(
        &self,
        session_id: &SessionId,
        outcome: Result<serde_json::Value, AppError>,
    ) -> Result<SearchResponse, SessionError> {
        if !self.is_current(session_id) {
            log::info!("search {session_id} finished after reset, dropping its outcome");
            return Err(SessionError::Abandoned);
        }

        match outcome {
            Ok(raw) => {
                let response = projector::project(&raw);
                log::info!(
                    "search {session_id} succeeded with {} results",
                    response.results.len()
                );

                if let Err(err) = self.results.save(&response) {
                    log::error!("failed to save search results: {err}");
                }

                let mut state = self.lock();
                // reset clears the slot again once this search has wound down
                if state.session_id.as_ref() != Some(session_id) {
                    return Err(SessionError::Abandoned);
                }
                state.status = SessionStatus::Succeeded;
                state.response = Some(response.clone());
                state.flight = None;
                Ok(response)
            }
            Err(err) => {
                let message = err.user_message();
                log::error!("search {session_id} failed: {err}");

                let mut state = self.lock();
                if state.session_id.as_ref() != Some(session_id) {
                    return Err(SessionError::Abandoned);
                }
                state.status = SessionStatus::Failed;
                state.error = Some(message.clone());
                state.flight = None;
                Err(SessionError::Search(message))
            }
        }
    }

    /// Back to `Idle`: drops the response, both reference lists, the face
    /// cache and the saved results.
    ///
    /// A running search is cancelled: its request is dropped, its channel
    /// closed, and `reset` returns only after it has wound down.
    pub async fn reset(&self) {
        let mut gate = self.gate.lock().await;
        gate.clear();

        let flight = {
            let mut state = self.lock();
            state.status = SessionStatus::Idle;
            state.response = None;
            state.error = None;
            state.session_id = None;
            state.positives.clear();
            state.negatives.clear();
            state.flight.take()
        };
        self.stages.clear();

        if let Some(flight) = flight {
            let _ = flight.cancel.send(());
            let _ = flight.done.await;
            log::info!("running search abandoned");
        }

        if let Err(err) = self.results.clear() {
            log::error!("failed to clear saved search results: {err}");
        }
        log::info!("session reset");
    }

    /// Number of face embeddings currently cached.
    pub async fn cached_faces(&self) -> usize {
        self.gate.lock().await.cache().len()
    }

    /// Tear the orchestrator down. Any progress channel still open belongs to
    /// a `start` future and closes when that future is dropped.
    pub fn dispose(self) {
        self.stages.clear();
        log::debug!("session orchestrator disposed");
    }
}
