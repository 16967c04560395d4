//! Client for the hosted assistant platform (Assistants API v2).
//!
//! The rest of the crate talks to the [`AnalysisBackend`] trait, never to
//! HTTP directly, so tests can substitute a scripted backend.

pub mod events;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::stream::{self, Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::Settings;
use crate::errors::AppError;
use events::{AssistantEvent, SseDecoder};

/// Decoded run events as they arrive off the wire. Transport failures show
/// up as `Err` items so the consumer can finish the turn gracefully.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<AssistantEvent, AppError>> + Send>>;

/// Remote operations the analysis service depends on.
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    /// Upload one dataset for interpreter use; returns the remote file id.
    async fn upload_dataset(&self, filename: &str, bytes: Vec<u8>) -> Result<String, AppError>;

    /// Run text through the moderation endpoint. `true` means flagged.
    async fn moderate(&self, input: &str) -> Result<bool, AppError>;

    async fn create_thread(&self) -> Result<String, AppError>;

    /// Make the given files visible to the thread's code interpreter.
    async fn attach_datasets(&self, thread_id: &str, file_ids: &[String]) -> Result<(), AppError>;

    async fn append_user_message(&self, thread_id: &str, text: &str) -> Result<(), AppError>;

    /// Start a streamed run on the thread and hand back its event stream.
    async fn stream_run(&self, thread_id: &str, assistant_id: &str)
        -> Result<EventStream, AppError>;

    /// Download raw file content (used for generated chart images).
    async fn fetch_file_content(&self, file_id: &str) -> Result<Vec<u8>, AppError>;
}

pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(settings: &Settings) -> Result<Self, AppError> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", settings.api_key)).map_err(
            |_| AppError::Config {
                message: "OPENAI_API_KEY contains characters not valid in a header".to_string(),
            },
        )?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        // The Assistants endpoints sit behind this beta header.
        headers.insert("OpenAI-Beta", HeaderValue::from_static("assistants=v2"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| AppError::Config {
                message: format!("Failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            base_url: settings.base_url.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, AppError> {
        let response = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| AppError::api(path, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error body".to_string());
            return Err(AppError::api(path, format!("status {status}: {body}")));
        }

        response
            .json()
            .await
            .map_err(|e| AppError::api(path, format!("undecodable response: {e}")))
    }
}

#[derive(Debug, Deserialize)]
struct CreatedObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ModerationResponse {
    results: Vec<ModerationResult>,
}

#[derive(Debug, Deserialize)]
struct ModerationResult {
    flagged: bool,
}

#[async_trait]
impl AnalysisBackend for OpenAiClient {
    async fn upload_dataset(&self, filename: &str, bytes: Vec<u8>) -> Result<String, AppError> {
        let upload_err = |message: String| AppError::UploadFailed {
            filename: filename.to_string(),
            message,
        };

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str("text/csv")
            .map_err(|e| upload_err(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("purpose", "assistants")
            .part("file", part);

        let response = self
            .http
            .post(self.url("/files"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| upload_err(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(upload_err(format!("status {status}: {body}")));
        }

        let created: CreatedObject = response
            .json()
            .await
            .map_err(|e| upload_err(format!("undecodable response: {e}")))?;
        debug!(file_id = %created.id, "Uploaded dataset '{filename}'");
        Ok(created.id)
    }

    async fn moderate(&self, input: &str) -> Result<bool, AppError> {
        let unavailable = |message: String| AppError::ModerationUnavailable { message };

        let response = self
            .http
            .post(self.url("/moderations"))
            .json(&json!({ "input": input }))
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(unavailable(format!("status {status}")));
        }

        let decoded: ModerationResponse = response
            .json()
            .await
            .map_err(|e| unavailable(format!("undecodable response: {e}")))?;

        match decoded.results.first() {
            Some(result) => Ok(result.flagged),
            // No verdict is not the same as "not flagged".
            None => Err(unavailable("empty moderation result".to_string())),
        }
    }

    async fn create_thread(&self) -> Result<String, AppError> {
        let created: CreatedObject = self.post_json("/threads", &json!({})).await?;
        debug!(thread_id = %created.id, "Created analysis thread");
        Ok(created.id)
    }

    async fn attach_datasets(&self, thread_id: &str, file_ids: &[String]) -> Result<(), AppError> {
        let body = json!({
            "tool_resources": { "code_interpreter": { "file_ids": file_ids } }
        });
        let _: CreatedObject = self
            .post_json(&format!("/threads/{thread_id}"), &body)
            .await?;
        debug!(thread_id, count = file_ids.len(), "Attached datasets to thread");
        Ok(())
    }

    async fn append_user_message(&self, thread_id: &str, text: &str) -> Result<(), AppError> {
        let body = json!({ "role": "user", "content": text });
        let _: CreatedObject = self
            .post_json(&format!("/threads/{thread_id}/messages"), &body)
            .await?;
        Ok(())
    }

    async fn stream_run(
        &self,
        thread_id: &str,
        assistant_id: &str,
    ) -> Result<EventStream, AppError> {
        let path = format!("/threads/{thread_id}/runs");
        let body = json!({
            "assistant_id": assistant_id,
            "stream": true,
            "tool_choice": { "type": "code_interpreter" },
        });

        let response = self
            .http
            .post(self.url(&path))
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::api(&path, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::api(&path, format!("status {status}: {body}")));
        }

        // Scan keeps the SSE decoder alive across chunks so events split at
        // arbitrary byte boundaries reassemble correctly.
        let decoded = response
            .bytes_stream()
            .scan(SseDecoder::new(), |decoder, chunk| {
                let items: Vec<Result<AssistantEvent, AppError>> = match chunk {
                    Ok(bytes) => decoder.push(&bytes).into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(AppError::StreamTransport {
                        message: e.to_string(),
                    })],
                };
                futures_util::future::ready(Some(items))
            })
            .flat_map(stream::iter);

        Ok(Box::pin(decoded))
    }

    async fn fetch_file_content(&self, file_id: &str) -> Result<Vec<u8>, AppError> {
        let path = format!("/files/{file_id}/content");
        let response = self
            .http
            .get(self.url(&path))
            .send()
            .await
            .map_err(|e| AppError::artifact(file_id, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::artifact(file_id, format!("status {status}")));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AppError::artifact(file_id, e.to_string()))?;
        Ok(bytes.to_vec())
    }
}
