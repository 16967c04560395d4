use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::Turn;

/// One uploaded dataset as the session tracks it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetHandle {
    pub filename: String,
    pub file_id: String,
}

#[derive(Debug, Default)]
struct SessionState {
    datasets: Vec<DatasetHandle>,
    thread_id: Option<String>,
    turns: Vec<Turn>,
    turn_in_progress: bool,
}

/// In-memory session registry. Everything here is per-process and vanishes
/// on restart.
#[derive(Clone, Default)]
pub struct SessionStore {
    inner: Arc<Mutex<HashMap<String, SessionState>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_session(&self) -> String {
        let id = Uuid::new_v4().to_string();
        let mut sessions = self.inner.lock().await;
        sessions.insert(id.clone(), SessionState::default());
        id
    }

    async fn with_session<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut SessionState) -> T,
    ) -> Result<T, AppError> {
        let mut sessions = self.inner.lock().await;
        match sessions.get_mut(id) {
            Some(session) => Ok(f(session)),
            None => Err(AppError::SessionNotFound { id: id.to_string() }),
        }
    }

    /// Append newly uploaded datasets. Handles already registered under the
    /// same remote file id are skipped, later rounds otherwise append in
    /// upload order.
    pub async fn register_datasets(
        &self,
        id: &str,
        handles: Vec<DatasetHandle>,
    ) -> Result<(), AppError> {
        self.with_session(id, |session| {
            for handle in handles {
                if session
                    .datasets
                    .iter()
                    .any(|known| known.file_id == handle.file_id)
                {
                    continue;
                }
                session.datasets.push(handle);
            }
        })
        .await
    }

    pub async fn datasets(&self, id: &str) -> Result<Vec<DatasetHandle>, AppError> {
        self.with_session(id, |session| session.datasets.clone()).await
    }

    pub async fn dataset_file_ids(&self, id: &str) -> Result<Vec<String>, AppError> {
        self.with_session(id, |session| {
            session
                .datasets
                .iter()
                .map(|handle| handle.file_id.clone())
                .collect()
        })
        .await
    }

    /// Bind the remote conversation thread. The first assignment wins;
    /// callers always get the effective thread id back.
    pub async fn assign_thread(&self, id: &str, thread_id: &str) -> Result<String, AppError> {
        self.with_session(id, |session| {
            session
                .thread_id
                .get_or_insert_with(|| thread_id.to_string())
                .clone()
        })
        .await
    }

    pub async fn thread_id(&self, id: &str) -> Result<Option<String>, AppError> {
        self.with_session(id, |session| session.thread_id.clone()).await
    }

    pub async fn append_turn(&self, id: &str, turn: Turn) -> Result<(), AppError> {
        self.with_session(id, |session| session.turns.push(turn)).await
    }

    pub async fn turns(&self, id: &str) -> Result<Vec<Turn>, AppError> {
        self.with_session(id, |session| session.turns.clone()).await
    }

    /// Claim the session's single streaming slot.
    pub async fn begin_turn(&self, id: &str) -> Result<(), AppError> {
        self.with_session(id, |session| {
            if session.turn_in_progress {
                Err(AppError::TurnInProgress)
            } else {
                session.turn_in_progress = true;
                Ok(())
            }
        })
        .await?
    }

    /// Release the streaming slot. Missing sessions are ignored so cleanup
    /// paths never fail.
    pub async fn finish_turn(&self, id: &str) {
        let mut sessions = self.inner.lock().await;
        if let Some(session) = sessions.get_mut(id) {
            session.turn_in_progress = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContentItem, Role};

    fn handle(filename: &str, file_id: &str) -> DatasetHandle {
        DatasetHandle {
            filename: filename.to_string(),
            file_id: file_id.to_string(),
        }
    }

    #[tokio::test]
    async fn datasets_accumulate_across_upload_rounds() {
        let store = SessionStore::new();
        let id = store.create_session().await;

        store
            .register_datasets(&id, vec![handle("sales.csv", "file-1"), handle("costs.csv", "file-2")])
            .await
            .unwrap();
        store
            .register_datasets(&id, vec![handle("refunds.csv", "file-3")])
            .await
            .unwrap();

        let datasets = store.datasets(&id).await.unwrap();
        assert_eq!(
            datasets.iter().map(|d| d.filename.as_str()).collect::<Vec<_>>(),
            vec!["sales.csv", "costs.csv", "refunds.csv"]
        );
        assert_eq!(
            store.dataset_file_ids(&id).await.unwrap(),
            vec!["file-1", "file-2", "file-3"]
        );
    }

    #[tokio::test]
    async fn duplicate_file_ids_register_once() {
        let store = SessionStore::new();
        let id = store.create_session().await;

        store
            .register_datasets(&id, vec![handle("sales.csv", "file-1")])
            .await
            .unwrap();
        store
            .register_datasets(&id, vec![handle("sales.csv", "file-1"), handle("other.csv", "file-2")])
            .await
            .unwrap();

        assert_eq!(store.dataset_file_ids(&id).await.unwrap(), vec!["file-1", "file-2"]);
    }

    #[tokio::test]
    async fn first_thread_assignment_wins() {
        let store = SessionStore::new();
        let id = store.create_session().await;

        assert_eq!(store.assign_thread(&id, "thread-a").await.unwrap(), "thread-a");
        assert_eq!(store.assign_thread(&id, "thread-b").await.unwrap(), "thread-a");
        assert_eq!(store.thread_id(&id).await.unwrap().as_deref(), Some("thread-a"));
    }

    #[tokio::test]
    async fn one_streaming_turn_at_a_time() {
        let store = SessionStore::new();
        let id = store.create_session().await;

        store.begin_turn(&id).await.unwrap();
        let second = store.begin_turn(&id).await.unwrap_err();
        assert!(matches!(second, AppError::TurnInProgress));

        store.finish_turn(&id).await;
        store.begin_turn(&id).await.unwrap();
    }

    #[tokio::test]
    async fn turns_keep_insertion_order() {
        let store = SessionStore::new();
        let id = store.create_session().await;

        store.append_turn(&id, Turn::user("total revenue?")).await.unwrap();
        store
            .append_turn(
                &id,
                Turn::assistant(vec![ContentItem::Text {
                    content: "12345.67".to_string(),
                }]),
            )
            .await
            .unwrap();

        let turns = store.turns(&id).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn unknown_sessions_are_reported() {
        let store = SessionStore::new();

        let err = store.turns("no-such-session").await.unwrap_err();
        assert!(err.is_not_found());

        let err = store.begin_turn("no-such-session").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
