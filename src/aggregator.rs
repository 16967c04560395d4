//! Folds the ordered run-event stream for one assistant turn into typed
//! content items, mirroring every mutation to a rendering sink.

use tracing::warn;

use crate::artifacts::ArtifactResolver;
use crate::errors::AppError;
use crate::models::ContentItem;
use crate::openai::events::{AssistantEvent, CodeInterpreterOutput};

/// Live-rendering callbacks for the in-progress turn. The fold itself stays
/// pure over the items list; everything user-visible goes through here.
///
/// Update callbacks carry the full accumulated content, so repainting is
/// idempotent.
pub trait RenderSink: Send + Sync {
    fn code_opened(&self);
    fn code_updated(&self, content: &str);
    fn code_closed(&self);
    fn code_output(&self, content: &str);
    fn image_added(&self, urls: &[String]);
    fn text_opened(&self);
    fn text_updated(&self, content: &str);
    fn notice(&self, message: &str);

    /// True once the viewer is gone; the stream consumer stops early.
    fn is_closed(&self) -> bool {
        false
    }
}

/// State machine for one assistant turn.
///
/// `open` is the single mutable cursor: the index of the item currently
/// receiving deltas. Opening a new item implicitly closes the previous one.
/// A delta that arrives with no matching open item is a protocol fault on
/// the remote side; it is logged and dropped, never applied to a closed
/// item.
#[derive(Default)]
pub struct TurnAggregator {
    items: Vec<ContentItem>,
    open: Option<usize>,
}

impl TurnAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Consume the aggregator and hand back the turn's items, including a
    /// partially populated list when the stream ended early.
    pub fn finish(self) -> Vec<ContentItem> {
        self.items
    }

    pub async fn apply(
        &mut self,
        event: AssistantEvent,
        resolver: &dyn ArtifactResolver,
        sink: &dyn RenderSink,
    ) {
        match event {
            AssistantEvent::StepCreated(step) => {
                if step.is_tool_calls() {
                    self.items.push(ContentItem::empty_code_input());
                    self.open = Some(self.items.len() - 1);
                    sink.code_opened();
                }
            }
            AssistantEvent::StepDelta(delta) => {
                let Some(fragment) = delta.code_input() else {
                    return;
                };
                if fragment.is_empty() {
                    return;
                }
                match self.open_code_input() {
                    Some(content) => {
                        content.push_str(fragment);
                        sink.code_updated(content);
                    }
                    None => {
                        let fault = AppError::protocol(format!(
                            "code delta for step {} with no open code item",
                            delta.id
                        ));
                        warn!("{fault}");
                    }
                }
            }
            AssistantEvent::StepCompleted(step) => {
                let Some(call) = step.code_interpreter() else {
                    return;
                };

                match self.open_code_input() {
                    Some(content) => {
                        // The completed payload carries the full input;
                        // reconcile in case a delta was dropped mid-stream.
                        if !call.input.is_empty() && *content != call.input {
                            *content = call.input.clone();
                            sink.code_updated(content);
                        }
                        sink.code_closed();
                    }
                    None => {
                        let fault = AppError::protocol(format!(
                            "step {} completed without an open code item",
                            step.id
                        ));
                        warn!("{fault}");
                    }
                }

                if call.outputs.is_empty() {
                    sink.notice(&AppError::EmptyExecutionResult.to_string());
                    return;
                }

                let before = self.items.len();
                for output in &call.outputs {
                    match output {
                        CodeInterpreterOutput::Logs { logs } => {
                            sink.code_output(logs);
                            self.items.push(ContentItem::CodeOutput {
                                content: logs.clone(),
                            });
                        }
                        CodeInterpreterOutput::Image { image } => {
                            match resolver.resolve(&image.file_id).await {
                                Ok(url) => {
                                    let urls = vec![url];
                                    sink.image_added(&urls);
                                    self.items.push(ContentItem::Image { content: urls });
                                }
                                // One lost chart must not abort the turn.
                                Err(e) => {
                                    warn!(file_id = %image.file_id, "Chart resolution failed: {e}");
                                    let note = e.to_string();
                                    sink.code_output(&note);
                                    self.items.push(ContentItem::CodeOutput { content: note });
                                }
                            }
                        }
                        CodeInterpreterOutput::Unsupported => {}
                    }
                }
                if self.items.len() > before {
                    self.open = Some(self.items.len() - 1);
                }
            }
            AssistantEvent::MessageCreated => {
                self.items.push(ContentItem::empty_text());
                self.open = Some(self.items.len() - 1);
                sink.text_opened();
            }
            AssistantEvent::MessageDelta(delta) => {
                let Some(fragment) = delta.text_value() else {
                    return;
                };
                match self.open_text() {
                    Some(content) => {
                        content.push_str(fragment);
                        sink.text_updated(content);
                    }
                    None => {
                        let fault = AppError::protocol("text delta with no open text item");
                        warn!("{fault}");
                    }
                }
            }
            // Terminal and unrecognized events are the stream consumer's
            // concern, not the fold's.
            AssistantEvent::RunFailed { .. } | AssistantEvent::Done | AssistantEvent::Ignored => {}
        }
    }

    fn open_code_input(&mut self) -> Option<&mut String> {
        match self.open.and_then(|idx| self.items.get_mut(idx)) {
            Some(ContentItem::CodeInput { content }) => Some(content),
            _ => None,
        }
    }

    fn open_text(&mut self) -> Option<&mut String> {
        match self.open.and_then(|idx| self.items.get_mut(idx)) {
            Some(ContentItem::Text { content }) => Some(content),
            _ => None,
        }
    }
}
