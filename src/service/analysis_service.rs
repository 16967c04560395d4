use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::aggregator::{RenderSink, TurnAggregator};
use crate::artifacts::ArtifactResolver;
use crate::errors::AppError;
use crate::models::Turn;
use crate::openai::events::AssistantEvent;
use crate::openai::AnalysisBackend;
use crate::session::{DatasetHandle, SessionStore};

/// A claimed, moderated turn whose prompt has already reached the remote
/// thread. Produced by [`AnalysisService::prepare_turn`], consumed by
/// [`AnalysisService::run_turn`].
#[derive(Debug)]
pub struct PreparedTurn {
    session_id: String,
    thread_id: String,
}

#[derive(Clone)]
pub struct AnalysisService {
    store: SessionStore,
    backend: Arc<dyn AnalysisBackend>,
    artifacts: Arc<dyn ArtifactResolver>,
    assistant_id: String,
    stream_idle_timeout: Duration,
}

impl AnalysisService {
    pub fn new(
        store: SessionStore,
        backend: Arc<dyn AnalysisBackend>,
        artifacts: Arc<dyn ArtifactResolver>,
        assistant_id: String,
        stream_idle_timeout: Duration,
    ) -> Self {
        Self {
            store,
            backend,
            artifacts,
            assistant_id,
            stream_idle_timeout,
        }
    }

    pub async fn create_session(&self) -> String {
        self.store.create_session().await
    }

    pub async fn datasets(&self, session_id: &str) -> Result<Vec<DatasetHandle>, AppError> {
        self.store.datasets(session_id).await
    }

    pub async fn turns(&self, session_id: &str) -> Result<Vec<Turn>, AppError> {
        self.store.turns(session_id).await
    }

    /// Upload one round of datasets and register their handles.
    ///
    /// The batch is all-or-nothing for session state: every file is
    /// validated and uploaded before anything is registered, so a failed
    /// upload leaves the session exactly as it was.
    pub async fn upload_datasets(
        &self,
        session_id: &str,
        files: Vec<(String, Vec<u8>)>,
    ) -> Result<Vec<DatasetHandle>, AppError> {
        // Resolve the session before spending remote calls on a typo'd id.
        self.store.datasets(session_id).await?;

        if files.is_empty() {
            return Err(AppError::EmptyField {
                field_name: "datasets".to_string(),
            });
        }
        for (filename, bytes) in &files {
            validate_dataset(filename, bytes)?;
        }

        let mut handles = Vec::with_capacity(files.len());
        for (filename, bytes) in files {
            let file_id = self.backend.upload_dataset(&filename, bytes).await?;
            handles.push(DatasetHandle { filename, file_id });
        }

        self.store.register_datasets(session_id, handles.clone()).await?;
        info!(session_id, count = handles.len(), "Registered datasets");
        Ok(handles)
    }

    /// Validate and moderate a prompt, bind the thread, and push the prompt
    /// to the remote conversation. Claims the session's streaming slot; the
    /// slot is released here on failure, otherwise by [`Self::run_turn`].
    pub async fn prepare_turn(
        &self,
        session_id: &str,
        prompt: &str,
    ) -> Result<PreparedTurn, AppError> {
        self.store.begin_turn(session_id).await?;
        match self.prepare_inner(session_id, prompt).await {
            Ok(prepared) => Ok(prepared),
            Err(e) => {
                self.store.finish_turn(session_id).await;
                Err(e)
            }
        }
    }

    async fn prepare_inner(
        &self,
        session_id: &str,
        prompt: &str,
    ) -> Result<PreparedTurn, AppError> {
        // ── Validation ────────────────────────────────────────────────────────
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(AppError::EmptyField {
                field_name: "prompt".to_string(),
            });
        }

        // ── Moderation (fail closed) ──────────────────────────────────────────
        if self.backend.moderate(prompt).await? {
            info!(session_id, "Prompt flagged by moderation");
            return Err(AppError::ModerationFlagged);
        }

        // ── Thread + datasets ─────────────────────────────────────────────────
        let thread_id = self.ensure_thread(session_id).await?;

        // The full accumulated set rides along before every turn, so files
        // uploaded since the last prompt become visible to the interpreter.
        let file_ids = self.store.dataset_file_ids(session_id).await?;
        if !file_ids.is_empty() {
            self.backend.attach_datasets(&thread_id, &file_ids).await?;
        }

        // ── Record locally, then forward ──────────────────────────────────────
        self.store.append_turn(session_id, Turn::user(prompt)).await?;
        self.backend.append_user_message(&thread_id, prompt).await?;

        Ok(PreparedTurn {
            session_id: session_id.to_string(),
            thread_id,
        })
    }

    async fn ensure_thread(&self, session_id: &str) -> Result<String, AppError> {
        if let Some(existing) = self.store.thread_id(session_id).await? {
            return Ok(existing);
        }
        let created = self.backend.create_thread().await?;
        self.store.assign_thread(session_id, &created).await
    }

    /// Consume the prepared turn's event stream to completion, folding it
    /// into content items and mirroring each mutation to `sink`.
    ///
    /// Ends early when the sink closes (viewer gone), the stream stays
    /// silent past the idle timeout, or the run reports failure; whatever
    /// was folded by then is stored as a partial assistant turn. The
    /// streaming slot is always released.
    pub async fn run_turn(
        &self,
        prepared: PreparedTurn,
        sink: &dyn RenderSink,
    ) -> Result<(), AppError> {
        let result = self.stream_into(&prepared, sink).await;
        self.store.finish_turn(&prepared.session_id).await;
        result
    }

    async fn stream_into(
        &self,
        prepared: &PreparedTurn,
        sink: &dyn RenderSink,
    ) -> Result<(), AppError> {
        let session_id = prepared.session_id.as_str();
        let mut stream = self
            .backend
            .stream_run(&prepared.thread_id, &self.assistant_id)
            .await?;

        let mut aggregator = TurnAggregator::new();
        let mut failure: Option<String> = None;

        loop {
            if sink.is_closed() {
                info!(session_id, "Viewer disconnected, stopping the stream");
                break;
            }

            match timeout(self.stream_idle_timeout, stream.next()).await {
                // Idle timeout between events: failed-partial.
                Err(_) => {
                    warn!(session_id, "Run stream idle timeout");
                    failure = Some(format!(
                        "The analysis timed out after {}s of silence.",
                        self.stream_idle_timeout.as_secs()
                    ));
                    break;
                }
                Ok(None) | Ok(Some(Ok(AssistantEvent::Done))) => break,
                Ok(Some(Ok(AssistantEvent::RunFailed { message }))) => {
                    warn!(session_id, "Run failed: {message}");
                    failure = Some(format!("The analysis run failed: {message}"));
                    break;
                }
                Ok(Some(Err(e))) => {
                    warn!(session_id, "Run stream transport error: {e}");
                    failure = Some(e.to_string());
                    break;
                }
                Ok(Some(Ok(event))) => {
                    aggregator.apply(event, self.artifacts.as_ref(), sink).await;
                }
            }
        }

        if let Some(message) = failure {
            sink.notice(&message);
        }

        if !aggregator.is_empty() {
            let turn = Turn::assistant(aggregator.finish());
            self.store.append_turn(session_id, turn).await?;
        }
        Ok(())
    }
}

fn validate_dataset(filename: &str, bytes: &[u8]) -> Result<(), AppError> {
    let invalid = |reason: &str| AppError::InvalidDataset {
        filename: filename.to_string(),
        reason: reason.to_string(),
    };

    if filename.trim().is_empty() {
        return Err(invalid("file name is empty"));
    }
    if !filename.to_ascii_lowercase().ends_with(".csv") {
        return Err(invalid("only .csv files are accepted"));
    }
    if bytes.is_empty() {
        return Err(invalid("file is empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openai::events::decode_event;
    use crate::openai::EventStream;
    use async_trait::async_trait;
    use futures_util::stream;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeBackend {
        calls: Mutex<Vec<String>>,
        flag_prompts: bool,
        moderation_down: bool,
        fail_upload_of: Option<String>,
        events: Mutex<Vec<Result<AssistantEvent, AppError>>>,
        hang_after_events: bool,
    }

    impl FakeBackend {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn script_events(&self, events: Vec<AssistantEvent>) {
            *self.events.lock().unwrap() = events.into_iter().map(Ok).collect();
        }
    }

    #[async_trait]
    impl AnalysisBackend for FakeBackend {
        async fn upload_dataset(&self, filename: &str, _: Vec<u8>) -> Result<String, AppError> {
            self.record(format!("upload:{filename}"));
            if self.fail_upload_of.as_deref() == Some(filename) {
                return Err(AppError::UploadFailed {
                    filename: filename.to_string(),
                    message: "status 500".to_string(),
                });
            }
            Ok(format!("file-{}", self.calls.lock().unwrap().len()))
        }

        async fn moderate(&self, input: &str) -> Result<bool, AppError> {
            self.record(format!("moderate:{input}"));
            if self.moderation_down {
                return Err(AppError::ModerationUnavailable {
                    message: "connection refused".to_string(),
                });
            }
            Ok(self.flag_prompts)
        }

        async fn create_thread(&self) -> Result<String, AppError> {
            self.record("create_thread");
            Ok("thread-1".to_string())
        }

        async fn attach_datasets(&self, thread_id: &str, file_ids: &[String]) -> Result<(), AppError> {
            self.record(format!("attach:{thread_id}:{}", file_ids.join("+")));
            Ok(())
        }

        async fn append_user_message(&self, thread_id: &str, text: &str) -> Result<(), AppError> {
            self.record(format!("message:{thread_id}:{text}"));
            Ok(())
        }

        async fn stream_run(&self, thread_id: &str, assistant_id: &str) -> Result<EventStream, AppError> {
            self.record(format!("stream_run:{thread_id}:{assistant_id}"));
            let events: Vec<_> = self.events.lock().unwrap().drain(..).collect();
            let scripted = stream::iter(events);
            if self.hang_after_events {
                Ok(Box::pin(scripted.chain(stream::pending())))
            } else {
                Ok(Box::pin(scripted))
            }
        }

        async fn fetch_file_content(&self, file_id: &str) -> Result<Vec<u8>, AppError> {
            self.record(format!("fetch:{file_id}"));
            Ok(vec![1, 2, 3])
        }
    }

    struct StaticResolver;

    #[async_trait]
    impl ArtifactResolver for StaticResolver {
        async fn resolve(&self, file_id: &str) -> Result<String, AppError> {
            Ok(format!("data:image/png;base64,{file_id}"))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<String>>,
        closed: AtomicBool,
    }

    impl RecordingSink {
        fn push(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl RenderSink for RecordingSink {
        fn code_opened(&self) {
            self.push("code_opened");
        }
        fn code_updated(&self, content: &str) {
            self.push(format!("code_updated:{content}"));
        }
        fn code_closed(&self) {
            self.push("code_closed");
        }
        fn code_output(&self, content: &str) {
            self.push(format!("code_output:{content}"));
        }
        fn image_added(&self, urls: &[String]) {
            self.push(format!("image_added:{}", urls.join(",")));
        }
        fn text_opened(&self) {
            self.push("text_opened");
        }
        fn text_updated(&self, content: &str) {
            self.push(format!("text_updated:{content}"));
        }
        fn notice(&self, message: &str) {
            self.push(format!("notice:{message}"));
        }
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    fn service_with(backend: Arc<FakeBackend>) -> (AnalysisService, SessionStore) {
        let store = SessionStore::new();
        let service = AnalysisService::new(
            store.clone(),
            backend,
            Arc::new(StaticResolver),
            "asst_test".to_string(),
            Duration::from_millis(50),
        );
        (service, store)
    }

    fn step_created() -> AssistantEvent {
        let data = json!({
            "id": "step_1",
            "step_details": {"type": "tool_calls", "tool_calls": []}
        });
        decode_event("thread.run.step.created", &data.to_string())
    }

    fn code_delta(fragment: &str) -> AssistantEvent {
        let data = json!({
            "id": "step_1",
            "delta": {"step_details": {"type": "tool_calls", "tool_calls": [
                {"index": 0, "type": "code_interpreter", "code_interpreter": {"input": fragment}}
            ]}}
        });
        decode_event("thread.run.step.delta", &data.to_string())
    }

    fn step_completed_with_logs(input: &str, logs: &str) -> AssistantEvent {
        let data = json!({
            "id": "step_1",
            "step_details": {"type": "tool_calls", "tool_calls": [
                {"id": "call_1", "type": "code_interpreter",
                 "code_interpreter": {"input": input, "outputs": [{"type": "logs", "logs": logs}]}}
            ]}
        });
        decode_event("thread.run.step.completed", &data.to_string())
    }

    fn message_created() -> AssistantEvent {
        decode_event("thread.message.created", r#"{"id":"msg_1","role":"assistant"}"#)
    }

    fn text_delta(fragment: &str) -> AssistantEvent {
        let data = json!({
            "id": "msg_1",
            "delta": {"content": [{"index": 0, "type": "text", "text": {"value": fragment}}]}
        });
        decode_event("thread.message.delta", &data.to_string())
    }

    #[tokio::test]
    async fn flagged_prompts_never_reach_the_thread() {
        let backend = Arc::new(FakeBackend {
            flag_prompts: true,
            ..FakeBackend::default()
        });
        let (service, store) = service_with(backend.clone());
        let session_id = service.create_session().await;

        let err = service.prepare_turn(&session_id, "something nasty").await.unwrap_err();

        assert!(matches!(err, AppError::ModerationFlagged));
        assert_eq!(backend.calls(), vec!["moderate:something nasty"]);
        assert!(store.turns(&session_id).await.unwrap().is_empty());
        // The streaming slot was released.
        store.begin_turn(&session_id).await.unwrap();
    }

    #[tokio::test]
    async fn moderation_outage_blocks_the_prompt() {
        let backend = Arc::new(FakeBackend {
            moderation_down: true,
            ..FakeBackend::default()
        });
        let (service, store) = service_with(backend.clone());
        let session_id = service.create_session().await;

        let err = service.prepare_turn(&session_id, "is this fine?").await.unwrap_err();

        assert!(matches!(err, AppError::ModerationUnavailable { .. }));
        assert_eq!(backend.calls().len(), 1);
        assert!(store.turns(&session_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_datasets_are_rejected_before_any_upload() {
        let backend = Arc::new(FakeBackend::default());
        let (service, _) = service_with(backend.clone());
        let session_id = service.create_session().await;

        let err = service
            .upload_datasets(
                &session_id,
                vec![
                    ("sales.csv".to_string(), b"a,b\n1,2\n".to_vec()),
                    ("report.pdf".to_string(), b"%PDF".to_vec()),
                ],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::InvalidDataset { .. }));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_upload_batches_register_nothing() {
        let backend = Arc::new(FakeBackend {
            fail_upload_of: Some("costs.csv".to_string()),
            ..FakeBackend::default()
        });
        let (service, store) = service_with(backend.clone());
        let session_id = service.create_session().await;

        let err = service
            .upload_datasets(
                &session_id,
                vec![
                    ("sales.csv".to_string(), b"a,b\n".to_vec()),
                    ("costs.csv".to_string(), b"c,d\n".to_vec()),
                ],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::UploadFailed { .. }));
        assert!(store.datasets(&session_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn a_full_turn_streams_and_lands_in_history() {
        let backend = Arc::new(FakeBackend::default());
        let (service, store) = service_with(backend.clone());
        let session_id = service.create_session().await;

        service
            .upload_datasets(&session_id, vec![("sales.csv".to_string(), b"a,b\n".to_vec())])
            .await
            .unwrap();

        backend.script_events(vec![
            step_created(),
            code_delta("df['revenue']"),
            code_delta(".sum()"),
            step_completed_with_logs("df['revenue'].sum()", "12345.67"),
            message_created(),
            text_delta("Total revenue is "),
            text_delta("$12,345.67"),
            AssistantEvent::Done,
        ]);

        let sink = RecordingSink::default();
        let prepared = service
            .prepare_turn(&session_id, "What is the total revenue?")
            .await
            .unwrap();
        service.run_turn(prepared, &sink).await.unwrap();

        let calls = backend.calls();
        assert_eq!(calls[1], "moderate:What is the total revenue?");
        assert_eq!(calls[2], "create_thread");
        assert!(calls[3].starts_with("attach:thread-1:file-"));
        assert!(calls[4].starts_with("message:thread-1:"));
        assert_eq!(calls[5], "stream_run:thread-1:asst_test");

        let turns = store.turns(&session_id).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, crate::models::Role::User);
        assert_eq!(
            turns[1].items,
            vec![
                crate::models::ContentItem::CodeInput {
                    content: "df['revenue'].sum()".to_string()
                },
                crate::models::ContentItem::CodeOutput {
                    content: "12345.67".to_string()
                },
                crate::models::ContentItem::Text {
                    content: "Total revenue is $12,345.67".to_string()
                },
            ]
        );

        // Slot released: a new turn can start.
        store.begin_turn(&session_id).await.unwrap();
    }

    #[tokio::test]
    async fn the_thread_is_created_once_and_reused() {
        let backend = Arc::new(FakeBackend::default());
        let (service, _) = service_with(backend.clone());
        let session_id = service.create_session().await;

        backend.script_events(vec![AssistantEvent::Done]);
        let prepared = service.prepare_turn(&session_id, "first").await.unwrap();
        service.run_turn(prepared, &RecordingSink::default()).await.unwrap();

        backend.script_events(vec![AssistantEvent::Done]);
        let prepared = service.prepare_turn(&session_id, "second").await.unwrap();
        service.run_turn(prepared, &RecordingSink::default()).await.unwrap();

        let creates = backend.calls().iter().filter(|c| *c == "create_thread").count();
        assert_eq!(creates, 1);
    }

    #[tokio::test]
    async fn every_turn_reattaches_the_full_dataset_set() {
        let backend = Arc::new(FakeBackend::default());
        let (service, _) = service_with(backend.clone());
        let session_id = service.create_session().await;

        let first = service
            .upload_datasets(&session_id, vec![("sales.csv".to_string(), b"a,b\n".to_vec())])
            .await
            .unwrap();

        backend.script_events(vec![AssistantEvent::Done]);
        let prepared = service.prepare_turn(&session_id, "sum revenue").await.unwrap();
        service.run_turn(prepared, &RecordingSink::default()).await.unwrap();

        let second = service
            .upload_datasets(&session_id, vec![("costs.csv".to_string(), b"c,d\n".to_vec())])
            .await
            .unwrap();

        backend.script_events(vec![AssistantEvent::Done]);
        let prepared = service.prepare_turn(&session_id, "now join costs").await.unwrap();
        service.run_turn(prepared, &RecordingSink::default()).await.unwrap();

        let attaches: Vec<String> = backend
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("attach:"))
            .collect();
        assert_eq!(attaches.len(), 2);
        assert_eq!(attaches[0], format!("attach:thread-1:{}", first[0].file_id));
        // Earlier uploads ride along with the new one on the second turn.
        assert_eq!(
            attaches[1],
            format!("attach:thread-1:{}+{}", first[0].file_id, second[0].file_id)
        );
    }

    #[tokio::test]
    async fn concurrent_prompts_are_rejected_while_streaming() {
        let backend = Arc::new(FakeBackend::default());
        let (service, _) = service_with(backend.clone());
        let session_id = service.create_session().await;

        backend.script_events(vec![AssistantEvent::Done]);
        let prepared = service.prepare_turn(&session_id, "first").await.unwrap();

        let err = service.prepare_turn(&session_id, "second").await.unwrap_err();
        assert!(matches!(err, AppError::TurnInProgress));

        service.run_turn(prepared, &RecordingSink::default()).await.unwrap();
    }

    #[tokio::test]
    async fn run_failure_keeps_the_partial_turn_and_notifies() {
        let backend = Arc::new(FakeBackend::default());
        let (service, store) = service_with(backend.clone());
        let session_id = service.create_session().await;

        backend.script_events(vec![
            step_created(),
            code_delta("df.plo"),
            AssistantEvent::RunFailed {
                message: "sandbox died".to_string(),
            },
        ]);

        let sink = RecordingSink::default();
        let prepared = service.prepare_turn(&session_id, "plot it").await.unwrap();
        service.run_turn(prepared, &sink).await.unwrap();

        assert!(sink
            .calls()
            .iter()
            .any(|c| c.starts_with("notice:The analysis run failed: sandbox died")));

        let turns = store.turns(&session_id).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(
            turns[1].items,
            vec![crate::models::ContentItem::CodeInput {
                content: "df.plo".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn a_silent_stream_times_out_as_failed_partial() {
        let backend = Arc::new(FakeBackend {
            hang_after_events: true,
            ..FakeBackend::default()
        });
        let (service, store) = service_with(backend.clone());
        let session_id = service.create_session().await;

        backend.script_events(vec![step_created(), code_delta("df.head()")]);

        let sink = RecordingSink::default();
        let prepared = service.prepare_turn(&session_id, "show me").await.unwrap();
        service.run_turn(prepared, &sink).await.unwrap();

        assert!(sink.calls().iter().any(|c| c.contains("timed out")));
        let turns = store.turns(&session_id).await.unwrap();
        assert_eq!(turns.len(), 2);

        // Slot released even on timeout.
        store.begin_turn(&session_id).await.unwrap();
    }

    #[tokio::test]
    async fn a_closed_sink_stops_consumption_early() {
        let backend = Arc::new(FakeBackend::default());
        let (service, store) = service_with(backend.clone());
        let session_id = service.create_session().await;

        backend.script_events(vec![step_created(), code_delta("df.head()"), AssistantEvent::Done]);

        let sink = RecordingSink::default();
        sink.closed.store(true, Ordering::SeqCst);
        let prepared = service.prepare_turn(&session_id, "show me").await.unwrap();
        service.run_turn(prepared, &sink).await.unwrap();

        // Nothing folded, so only the user turn is stored.
        assert_eq!(store.turns(&session_id).await.unwrap().len(), 1);
        store.begin_turn(&session_id).await.unwrap();
    }

    #[tokio::test]
    async fn empty_prompts_are_rejected_locally() {
        let backend = Arc::new(FakeBackend::default());
        let (service, _) = service_with(backend.clone());
        let session_id = service.create_session().await;

        let err = service.prepare_turn(&session_id, "   ").await.unwrap_err();
        assert!(matches!(err, AppError::EmptyField { .. }));
        assert!(backend.calls().is_empty());
    }
}
