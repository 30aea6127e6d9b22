//! Live search progress.
//!
//! A search's backend pipeline reports stage updates over a WebSocket keyed by
//! the session id. Updates can arrive in any order and more than once; they
//! are folded into a [`StageBoard`] that keeps one entry per stage name in
//! first-seen order.
//!
//! Progress is cosmetic: nothing in here returns an error to the search
//! session. Connection and parse failures are logged and the board simply
//! stops moving.

use std::sync::{Arc, Mutex, MutexGuard};

use futures::{future::BoxFuture, FutureExt, SinkExt, StreamExt};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::{
    profile::{SearchStage, StageStatus, StageUpdate},
    session_id::SessionId,
};

/// Buffered updates between the socket reader and the fold task.
const UPDATE_BUFFER: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    #[error("invalid progress url: {0}")]
    Url(#[from] url::ParseError),

    #[error("unsupported url scheme for progress channel: {0}")]
    Scheme(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Upsert one update into `stages`.
///
/// An existing stage keeps its name and position and takes whatever fields
/// the update carries. A new stage is appended with `running`/`0` for the
/// fields the update leaves out. Applying the same update twice is the same
/// as applying it once.
pub fn apply_update(stages: &mut Vec<SearchStage>, update: StageUpdate) {
    match stages.iter_mut().find(|s| s.name == update.stage) {
        Some(stage) => {
            if let Some(status) = update.status {
                stage.status = status;
            }
            if let Some(progress) = update.progress {
                stage.progress = progress;
            }
            if update.message.is_some() {
                stage.message = update.message;
            }
        }
        None => stages.push(SearchStage {
            name: update.stage,
            status: update.status.unwrap_or(StageStatus::Running),
            progress: update.progress.unwrap_or(0.0),
            message: update.message,
        }),
    }
}

#[derive(Default)]
struct BoardState {
    owner: Option<SessionId>,
    stages: Vec<SearchStage>,
}

/// Shared, ordered stage list of the current session.
///
/// The board belongs to at most one session at a time. Updates and releases
/// from any other session are dropped, so a channel that is still draining
/// after its search settled or was reset cannot touch a newer session's
/// stages.
#[derive(Clone, Default)]
pub struct StageBoard {
    state: Arc<Mutex<BoardState>>,
}

impl StageBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BoardState> {
        // a panic mid-upsert leaves a list that is still well formed
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hand the board to `session_id`, starting from an empty list.
    pub fn begin(&self, session_id: &SessionId) {
        let mut state = self.lock();
        state.owner = Some(session_id.clone());
        state.stages.clear();
    }

    /// Apply an update from `session_id`'s channel. Returns false when that
    /// session no longer owns the board.
    pub fn apply(&self, session_id: &SessionId, update: StageUpdate) -> bool {
        let mut state = self.lock();
        if state.owner.as_ref() != Some(session_id) {
            return false;
        }
        apply_update(&mut state.stages, update);
        true
    }

    /// Release the board if `session_id` still owns it.
    pub fn finish(&self, session_id: &SessionId) {
        let mut state = self.lock();
        if state.owner.as_ref() == Some(session_id) {
            state.owner = None;
            state.stages.clear();
        }
    }

    pub fn snapshot(&self) -> Vec<SearchStage> {
        self.lock().stages.clone()
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.owner = None;
        state.stages.clear();
    }
}

/// Drain `updates` into `board` until the source ends or the session loses
/// the board.
pub async fn fold_updates(
    mut updates: mpsc::Receiver<StageUpdate>,
    board: StageBoard,
    session_id: SessionId,
) {
    while let Some(update) = updates.recv().await {
        log::debug!("stage update: {update:?}");
        if !board.apply(&session_id, update) {
            log::debug!("session {session_id} no longer owns the stage board");
            break;
        }
    }
}

/// Something that can produce the update stream for a session.
pub trait ProgressTransport: Send + Sync {
    fn connect(
        &self,
        session_id: &SessionId,
    ) -> BoxFuture<'static, Result<mpsc::Receiver<StageUpdate>, ProgressError>>;
}

/// Handle to the live progress of one session.
///
/// Must be closed once the search settles. Closing consumes the handle; a
/// handle that is dropped without `close` (early return, cancelled future) is
/// torn down the same way.
pub struct ProgressChannel {
    session_id: SessionId,
    task: Option<JoinHandle<()>>,
}

impl ProgressChannel {
    /// Start connecting and folding in the background. Never fails; a
    /// connection error is logged and the board stays as it is.
    pub fn open(
        transport: Arc<dyn ProgressTransport>,
        session_id: SessionId,
        board: StageBoard,
    ) -> Self {
        let connect = transport.connect(&session_id);
        let id = session_id.clone();

        let task = tokio::spawn(async move {
            match connect.await {
                Ok(updates) => {
                    log::debug!("progress channel {id} connected");
                    fold_updates(updates, board, id.clone()).await;
                    log::debug!("progress channel {id} ended");
                }
                Err(err) => log::warn!("progress channel {id} unavailable: {err}"),
            }
        });

        Self {
            session_id,
            task: Some(task),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn close(mut self) {
        log::debug!("closing progress channel {}", self.session_id);
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // dropping the fold task drops the receiver, which tells the socket reader to hang up
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ProgressChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// WebSocket transport: `<base>/<session_id>`, one JSON update per text frame.
pub struct WsTransport {
    base: Url,
}

impl WsTransport {
    /// `api_addr` is the HTTP address of the backend; the scheme is mapped to
    /// `ws`/`wss` and `path` (e.g. `/ws/search`) appended.
    pub fn new(api_addr: &str, path: &str) -> Result<Self, ProgressError> {
        let mut base = Url::parse(api_addr)?;
        let scheme = match base.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(ProgressError::Scheme(other.to_string())),
        };
        base.set_scheme(scheme)
            .map_err(|_| ProgressError::Scheme(scheme.to_string()))?;
        base.set_path(path.trim_end_matches('/'));

        Ok(Self { base })
    }

    pub fn url_for(&self, session_id: &SessionId) -> String {
        format!("{}/{}", self.base.as_str().trim_end_matches('/'), session_id)
    }
}

impl ProgressTransport for WsTransport {
    fn connect(
        &self,
        session_id: &SessionId,
    ) -> BoxFuture<'static, Result<mpsc::Receiver<StageUpdate>, ProgressError>> {
        let url = self.url_for(session_id);

        async move {
            let (socket, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
            let (mut sink, mut stream) = socket.split();
            let (tx, rx) = mpsc::channel(UPDATE_BUFFER);

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tx.closed() => {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                        frame = stream.next() => match frame {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<StageUpdate>(text.as_str()) {
                                    Ok(update) => {
                                        if tx.send(update).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(err) => log::warn!("skipping malformed stage update {text:?}: {err}"),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                log::warn!("progress socket error: {err}");
                                break;
                            }
                        }
                    }
                }
                log::debug!("progress socket {url} closed");
            });

            Ok(rx)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(stage: &str, status: Option<StageStatus>, progress: Option<f64>) -> StageUpdate {
        StageUpdate {
            stage: stage.to_string(),
            status,
            progress,
            message: None,
        }
    }

    fn names(stages: &[SearchStage]) -> Vec<&str> {
        stages.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn test_new_stage_defaults() {
        let mut stages = vec![];
        apply_update(&mut stages, update("detect", None, None));

        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].status, StageStatus::Running);
        assert_eq!(stages[0].progress, 0.0);
        assert_eq!(stages[0].message, None);
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let event = StageUpdate {
            stage: "embed".to_string(),
            status: Some(StageStatus::Running),
            progress: Some(0.4),
            message: Some("3/8 faces".to_string()),
        };

        let mut once = vec![];
        apply_update(&mut once, event.clone());

        let mut twice = vec![];
        apply_update(&mut twice, event.clone());
        apply_update(&mut twice, event);

        assert_eq!(once, twice);
        assert_eq!(twice.len(), 1);
    }

    #[test]
    fn test_first_seen_order_is_stable() {
        let mut stages = vec![];
        apply_update(&mut stages, update("detect", None, Some(0.1)));
        apply_update(&mut stages, update("embed", None, Some(0.0)));
        apply_update(&mut stages, update("rank", None, Some(0.0)));
        apply_update(
            &mut stages,
            update("detect", Some(StageStatus::Completed), Some(1.0)),
        );

        assert_eq!(names(&stages), vec!["detect", "embed", "rank"]);
        assert_eq!(stages[0].status, StageStatus::Completed);
        assert_eq!(stages[0].progress, 1.0);
    }

    #[test]
    fn test_merge_keeps_omitted_fields() {
        let mut stages = vec![];
        apply_update(
            &mut stages,
            StageUpdate {
                stage: "rank".to_string(),
                status: Some(StageStatus::Running),
                progress: Some(0.5),
                message: Some("scoring".to_string()),
            },
        );
        apply_update(
            &mut stages,
            update("rank", Some(StageStatus::Other("error".to_string())), None),
        );

        assert_eq!(stages[0].progress, 0.5);
        assert_eq!(stages[0].message.as_deref(), Some("scoring"));
        assert_eq!(stages[0].status, StageStatus::Other("error".to_string()));
    }

    #[tokio::test]
    async fn test_fold_updates_until_source_ends() {
        let board = StageBoard::new();
        let id = SessionId::from("s1");
        board.begin(&id);
        let (tx, rx) = mpsc::channel(8);

        tx.send(update("detect", None, Some(0.5))).await.unwrap();
        tx.send(update("embed", None, None)).await.unwrap();
        tx.send(update("detect", None, Some(0.5))).await.unwrap();
        drop(tx);

        fold_updates(rx, board.clone(), id).await;

        let stages = board.snapshot();
        assert_eq!(names(&stages), vec!["detect", "embed"]);
        board.clear();
        assert!(board.snapshot().is_empty());
    }

    #[test]
    fn test_board_ignores_other_sessions() {
        let board = StageBoard::new();
        let old = SessionId::from("old");
        let new = SessionId::from("new");

        board.begin(&old);
        assert!(board.apply(&old, update("detect", None, Some(0.2))));

        board.begin(&new);
        assert!(board.snapshot().is_empty());
        assert!(board.apply(&new, update("rank", None, None)));
        assert!(!board.apply(&old, update("detect", None, Some(0.9))));

        // a late release from the old session keeps the new stages
        board.finish(&old);
        assert_eq!(names(&board.snapshot()), vec!["rank"]);

        board.finish(&new);
        assert!(board.snapshot().is_empty());
        assert!(!board.apply(&new, update("rank", None, Some(1.0))));
        assert!(board.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_fold_stops_once_board_is_released() {
        let board = StageBoard::new();
        let id = SessionId::from("s1");
        board.begin(&id);
        board.finish(&id);

        let (tx, rx) = mpsc::channel(8);
        tx.send(update("detect", None, Some(0.5))).await.unwrap();

        fold_updates(rx, board.clone(), id).await;
        assert!(board.snapshot().is_empty());
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn test_ws_transport_reads_frames_and_hangs_up() {
        use std::time::Duration;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            for frame in [
                r#"{"stage":"detect","progress":0.5}"#,
                "not json",
                r#"{"stage":"embed","status":"completed","message":"8 faces"}"#,
            ] {
                ws.send(Message::Text(frame.into())).await.unwrap();
            }

            // true once the client says goodbye
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(_))) | None => return true,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => return false,
                }
            }
        });

        let transport = WsTransport::new(&format!("http://{addr}"), "/ws/search").unwrap();
        let board = StageBoard::new();
        let id = SessionId::from("abc");
        board.begin(&id);
        let channel = ProgressChannel::open(Arc::new(transport), id, board.clone());

        tokio::time::timeout(Duration::from_secs(5), async {
            while board.snapshot().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let stages = board.snapshot();
        assert_eq!(names(&stages), vec!["detect", "embed"]);
        assert_eq!(stages[0].progress, 0.5);
        assert_eq!(stages[1].status, StageStatus::Completed);
        assert_eq!(stages[1].message.as_deref(), Some("8 faces"));

        channel.close();
        let closed = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert!(closed);
    }

    #[test]
    fn test_ws_url_from_api_addr() {
        let transport = WsTransport::new("http://localhost:8000", "/ws/search").unwrap();
        assert_eq!(
            transport.url_for(&SessionId::from("abc")),
            "ws://localhost:8000/ws/search/abc"
        );

        let transport = WsTransport::new("https://search.example.com/", "/ws/search/").unwrap();
        assert_eq!(
            transport.url_for(&SessionId::from("abc")),
            "wss://search.example.com/ws/search/abc"
        );

        assert!(WsTransport::new("ftp://example.com", "/ws").is_err());
    }
}
