//! `/api/conversations`: paged list, detail with messages, title update,
//! soft delete, and archive management.

use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::Json;
use relay::repo::{Conversation, RepoError, StoredMessage};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{bad_request, internal, not_found, ok};
use crate::app::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub user_id: Option<String>,
    pub limit: Option<u32>,
    pub skip: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserScope {
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TitleUpdate {
    pub user_id: String,
    pub title: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveBody {
    pub user_id: String,
    pub conversation_id: String,
}

fn conversation_json(c: &Conversation) -> Value {
    json!({
        "id": c.id,
        "title": c.title,
        "messageCount": c.message_count,
        "createdAt": c.created_at.to_rfc3339(),
        "updatedAt": c.updated_at.to_rfc3339(),
        "lastAccessedAt": c.last_accessed_at.to_rfc3339(),
        "isActive": c.is_active,
        "isArchived": c.is_archived,
        "archivedAt": c.archived_at.map(|t| t.to_rfc3339()),
    })
}

fn message_json(m: &StoredMessage) -> Value {
    json!({
        "id": m.id,
        "role": m.role.as_str(),
        "content": m.content,
        "thinking": m.thinking,
        "sources": m.sources,
        "createdAt": m.created_at.to_rfc3339(),
    })
}

pub async fn list(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Response {
    let Some(user_id) = query.user_id.as_deref().filter(|s| !s.is_empty()) else {
        return bad_request("userId is required");
    };
    let limit = query.limit.unwrap_or(20).min(100);
    let skip = query.skip.unwrap_or(0);
    match state
        .services
        .conversations
        .find_by_user(user_id, limit, skip)
        .await
    {
        Ok(page) => ok(json!({
            "items": page.items.iter().map(conversation_json).collect::<Vec<_>>(),
            "total": page.total,
        })),
        Err(e) => internal(e),
    }
}

pub async fn detail(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<UserScope>,
) -> Response {
    let Some(user_id) = query.user_id.as_deref().filter(|s| !s.is_empty()) else {
        return bad_request("userId is required");
    };
    let conversation = match state.services.conversations.find_by_id(&id, user_id).await {
        Ok(Some(c)) => c,
        Ok(None) => return not_found("conversation not found"),
        Err(e) => return internal(e),
    };
    if let Err(e) = state.services.archiver.touch(&id, user_id).await {
        tracing::warn!("touch failed: {}", e);
    }
    let messages = match state
        .services
        .messages
        .find_by_conversation(&id, user_id, 200, 0)
        .await
    {
        Ok(page) => page,
        Err(e) => return internal(e),
    };
    ok(json!({
        "conversation": conversation_json(&conversation),
        "messages": messages.items.iter().map(message_json).collect::<Vec<_>>(),
        "totalMessages": messages.total,
    }))
}

pub async fn update_title(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<TitleUpdate>,
) -> Response {
    if body.title.trim().is_empty() {
        return bad_request("title must not be empty");
    }
    match state
        .services
        .conversations
        .update_title(&id, &body.user_id, body.title.trim())
        .await
    {
        Ok(()) => ok(json!({ "id": id })),
        Err(RepoError::NotFound) => not_found("conversation not found"),
        Err(e) => internal(e),
    }
}

pub async fn soft_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<UserScope>,
) -> Response {
    let Some(user_id) = query.user_id.as_deref().filter(|s| !s.is_empty()) else {
        return bad_request("userId is required");
    };
    match state.services.conversations.soft_delete(&id, user_id).await {
        Ok(()) => ok(json!({ "id": id })),
        Err(RepoError::NotFound) => not_found("conversation not found"),
        Err(e) => internal(e),
    }
}

pub async fn archive(State(state): State<AppState>, Json(body): Json<ArchiveBody>) -> Response {
    match state
        .services
        .conversations
        .find_by_id(&body.conversation_id, &body.user_id)
        .await
    {
        Ok(Some(_)) => {}
        Ok(None) => return not_found("conversation not found"),
        Err(e) => return internal(e),
    }
    match state
        .services
        .conversations
        .set_archived(&body.conversation_id, true)
        .await
    {
        Ok(()) => ok(json!({ "id": body.conversation_id })),
        Err(e) => internal(e),
    }
}

pub async fn list_archived(State(state): State<AppState>, Json(body): Json<UserScope>) -> Response {
    let Some(user_id) = body.user_id.as_deref().filter(|s| !s.is_empty()) else {
        return bad_request("userId is required");
    };
    match state.services.conversations.list_archived(user_id).await {
        Ok(items) => ok(json!({
            "items": items.iter().map(conversation_json).collect::<Vec<_>>(),
        })),
        Err(e) => internal(e),
    }
}

pub async fn restore(State(state): State<AppState>, Json(body): Json<ArchiveBody>) -> Response {
    match state
        .services
        .archiver
        .restore_archived(&body.conversation_id, &body.user_id)
        .await
    {
        Ok(()) => ok(json!({ "id": body.conversation_id })),
        Err(RepoError::NotFound) => not_found("conversation not found"),
        Err(RepoError::InvalidInput(msg)) => bad_request(msg),
        Err(e) => internal(e),
    }
}
