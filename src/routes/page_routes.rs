use askama::Template;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};

use crate::models::{ContentItem, Turn};
use crate::service::analysis_service::AnalysisService;
use crate::session::DatasetHandle;

// ── Template structs ──────────────────────────────────────────────────────────

/// View model for one content item, flattened for askama template use.
pub struct ItemView {
    pub kind: String,
    pub content: String,
    pub images: Vec<String>,
}

impl From<&ContentItem> for ItemView {
    fn from(item: &ContentItem) -> Self {
        match item {
            ContentItem::Text { content }
            | ContentItem::CodeInput { content }
            | ContentItem::CodeOutput { content } => Self {
                kind: item.kind().to_string(),
                content: content.clone(),
                images: vec![],
            },
            ContentItem::Image { content } => Self {
                kind: item.kind().to_string(),
                content: String::new(),
                images: content.clone(),
            },
        }
    }
}

pub struct TurnView {
    pub role: String,
    pub items: Vec<ItemView>,
}

impl From<&Turn> for TurnView {
    fn from(turn: &Turn) -> Self {
        Self {
            role: turn.role.as_str().to_string(),
            items: turn.items.iter().map(ItemView::from).collect(),
        }
    }
}

#[derive(Template)]
#[template(path = "session.html")]
struct SessionTemplate {
    session_id: String,
    dataset_names: Vec<String>,
    turns: Vec<TurnView>,
}

// ── Handlers ─────────────────────────────────────────────────────────────────

/// GET `/` — start a fresh session and jump to its page.
pub async fn index_handler(State(svc): State<AnalysisService>) -> impl IntoResponse {
    let session_id = svc.create_session().await;
    Redirect::to(&format!("/session/{session_id}"))
}

/// GET `/session/{id}` — session page with history replay.
pub async fn session_handler(
    Path(id): Path<String>,
    State(svc): State<AnalysisService>,
) -> Response {
    let datasets = match svc.datasets(&id).await {
        Ok(datasets) => datasets,
        Err(e) if e.is_not_found() => {
            return (StatusCode::NOT_FOUND, "Unknown session. Visit / to start a new one.")
                .into_response()
        }
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    let turns = svc.turns(&id).await.unwrap_or_default();

    let tmpl = SessionTemplate {
        session_id: id,
        dataset_names: datasets.iter().map(|d: &DatasetHandle| d.filename.clone()).collect(),
        turns: turns.iter().map(TurnView::from).collect(),
    };
    render(tmpl)
}

// ── Static assets ─────────────────────────────────────────────────────────────

pub async fn app_js() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/javascript; charset=utf-8")],
        include_str!("../../static/app.js"),
    )
}

pub async fn style_css() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/css; charset=utf-8")],
        include_str!("../../static/style.css"),
    )
}

// ── Helper ────────────────────────────────────────────────────────────────────

fn render(tmpl: impl Template) -> Response {
    match tmpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Template error: {e}"),
        )
            .into_response(),
    }
}
