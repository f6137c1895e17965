//! `POST /api/chat`: admission, then a streamed chat turn.
//!
//! Replies either `200 text/event-stream` or `429` JSON with queue headers
//! (`Retry-After`, `X-Queue-Token`, `X-Queue-Position`,
//! `X-Queue-Estimated-Wait`). Identity and ownership problems surface as
//! plain JSON before the stream opens; after that, errors are in-stream.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use relay::longtext::LongTextOptions;
use relay::repo::StoredMessage;
use relay::stream::handler::ChatTurnRequest;
use relay::{
    AcquireOutcome, AdaptiveSseWriter, ChannelSink, ChatMessage, ChatRole, QueueRole, Services,
    SlotGuard, WorkflowRequest, WriterConfig,
};
use serde::Deserialize;
use serde_json::json;
use stream_event::ChatEvent;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use super::{bad_request, not_found};
use crate::app::AppState;

const CONVERSATION_TITLE_CHARS: usize = 30;
const HISTORY_LIMIT: u32 = 100;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const DISCONNECT_POLL: Duration = Duration::from_millis(500);

fn default_model_type() -> String {
    "local".to_string()
}

fn default_mode() -> String {
    "single".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBody {
    pub message: String,
    #[serde(default = "default_model_type")]
    pub model_type: String,
    pub conversation_id: Option<String>,
    pub user_id: String,
    #[allow(dead_code)]
    pub device_id: Option<String>,
    #[serde(default = "default_mode")]
    pub mode: String,
    pub client_user_message_id: Option<String>,
    pub client_assistant_message_id: Option<String>,
    pub queue_token: Option<String>,
    pub resume_from_round: Option<u32>,
    #[serde(default)]
    pub long_text_mode: bool,
    pub long_text_options: Option<LongTextOptions>,
}

pub async fn chat(State(state): State<AppState>, Json(body): Json<ChatBody>) -> Response {
    if body.user_id.trim().is_empty() {
        return bad_request("userId is required");
    }
    if body.message.trim().is_empty() {
        return bad_request("message must not be empty");
    }

    // Admission before anything expensive.
    let guard = match state
        .services
        .admission
        .acquire(&body.user_id, body.queue_token.as_deref())
    {
        AcquireOutcome::Admitted(guard) => guard,
        AcquireOutcome::Queued {
            token,
            position,
            retry_after_secs,
        } => {
            return queued_response(token, position, retry_after_secs);
        }
        AcquireOutcome::Rejected { cooldown_secs } => {
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "success": false,
                    "error": "too many invalid queue tokens, cooling down",
                })),
            )
                .into_response();
            insert_header(&mut response, header::RETRY_AFTER, &cooldown_secs.to_string());
            return response;
        }
    };

    let services = Arc::clone(&state.services);
    let Some(llm) = services.llm(&body.model_type) else {
        return bad_request(format!("unknown modelType: {}", body.model_type));
    };

    if let Err(e) = services.users.get_or_create(&body.user_id, None).await {
        return bad_request(e.to_string());
    }

    // Load or create the conversation, then persist the user message.
    let conversation = match resolve_conversation(&services, &body).await {
        Ok(c) => c,
        Err(response) => return response,
    };
    if let Err(e) = persist_user_message(&services, &body, &conversation).await {
        return super::internal(e);
    }

    let assistant_message_id = uuid::Uuid::new_v4().to_string();
    let request_id = uuid::Uuid::new_v4().to_string();
    let cancel = CancellationToken::new();

    // The SSE channel: writer task → frames → response body.
    let (frame_tx, frame_rx) = mpsc::channel::<String>(64);
    let writer = Arc::new(AdaptiveSseWriter::spawn(
        Arc::new(ChannelSink::new(frame_tx)),
        WriterConfig {
            switch_counter: Some(Arc::clone(&state.services.sse_mode_switches)),
            ..WriterConfig::default()
        },
    ));

    spawn_stream_task(
        services,
        llm,
        body,
        conversation,
        assistant_message_id,
        request_id,
        cancel,
        guard,
        writer,
    );

    let stream =
        ReceiverStream::new(frame_rx).map(|frame| Ok::<Bytes, Infallible>(Bytes::from(frame)));
    let mut response = Response::new(Body::from_stream(stream));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

fn queued_response(token: String, position: usize, retry_after_secs: u64) -> Response {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "success": false,
            "error": "server is at capacity, retry with the queue token",
        })),
    )
        .into_response();
    insert_header(&mut response, header::RETRY_AFTER, &retry_after_secs.to_string());
    insert_named_header(&mut response, "x-queue-token", &token);
    insert_named_header(&mut response, "x-queue-position", &position.to_string());
    insert_named_header(
        &mut response,
        "x-queue-estimated-wait",
        &retry_after_secs.to_string(),
    );
    response
}

fn insert_header(response: &mut Response, name: header::HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        response.headers_mut().insert(name, value);
    }
}

fn insert_named_header(response: &mut Response, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        response.headers_mut().insert(name, value);
    }
}

async fn resolve_conversation(
    services: &Arc<Services>,
    body: &ChatBody,
) -> Result<relay::repo::Conversation, Response> {
    match &body.conversation_id {
        Some(id) => match services.conversations.find_by_id(id, &body.user_id).await {
            Ok(Some(c)) => {
                if let Err(e) = services.archiver.touch(id, &body.user_id).await {
                    tracing::warn!("touch failed: {}", e);
                }
                Ok(c)
            }
            Ok(None) => Err(not_found("conversation not found")),
            Err(e) => Err(super::internal(e)),
        },
        None => {
            let title: String = body.message.chars().take(CONVERSATION_TITLE_CHARS).collect();
            let conversation = relay::repo::Conversation::new(&body.user_id, title);
            if let Err(e) = services.conversations.save(&conversation).await {
                return Err(super::internal(e));
            }
            // Event-triggered archival keeps the active count capped.
            if let Err(e) = services.archiver.archive_excess_for_user(&body.user_id).await {
                tracing::warn!("archive enforcement failed: {}", e);
            }
            Ok(conversation)
        }
    }
}

async fn persist_user_message(
    services: &Arc<Services>,
    body: &ChatBody,
    conversation: &relay::repo::Conversation,
) -> Result<(), relay::repo::RepoError> {
    let mut message = StoredMessage::new(
        &conversation.id,
        &body.user_id,
        ChatRole::User,
        body.message.trim(),
    );
    message.client_id = body.client_user_message_id.clone();
    services.messages.save(&message).await?;
    services
        .conversations
        .record_message_append(&conversation.id)
        .await?;
    Ok(())
}

async fn load_history(
    services: &Arc<Services>,
    body: &ChatBody,
    conversation: &relay::repo::Conversation,
) -> Result<Vec<ChatMessage>, Response> {
    let page = services
        .messages
        .find_by_conversation(&conversation.id, &body.user_id, HISTORY_LIMIT, 0)
        .await
        .map_err(super::internal)?;
    Ok(page
        .items
        .iter()
        .map(|m| ChatMessage {
            role: m.role,
            content: m.content.clone(),
        })
        .collect())
}

#[allow(clippy::too_many_arguments)]
fn spawn_stream_task(
    services: Arc<Services>,
    llm: Arc<dyn relay::LlmClient>,
    body: ChatBody,
    conversation: relay::repo::Conversation,
    assistant_message_id: String,
    request_id: String,
    cancel: CancellationToken,
    guard: SlotGuard,
    writer: Arc<AdaptiveSseWriter>,
) {
    tokio::spawn(async move {
        // The slot is held for the lifetime of this task and released on
        // every exit path by the guard's drop.
        let _guard = guard;

        writer.send_event(ChatEvent::Init {
            conversation_id: conversation.id.clone(),
            assistant_message_id: assistant_message_id.clone(),
        });

        let keepalive_cancel = CancellationToken::new();
        let keepalive = tokio::spawn(keepalive_loop(
            Arc::clone(&writer),
            keepalive_cancel.clone(),
            cancel.clone(),
        ));

        let request = ChatTurnRequest {
            user_id: body.user_id.clone(),
            conversation_id: conversation.id.clone(),
            assistant_message_id: assistant_message_id.clone(),
            request_id,
            messages: load_request_messages(&services, &body, &conversation).await,
            client_assistant_message_id: body.client_assistant_message_id.clone(),
            cancel: cancel.clone(),
            role: QueueRole::Single,
        };

        if body.long_text_mode {
            let options = body.long_text_options.clone().unwrap_or_default();
            services
                .longtext
                .run(&llm, &request, &body.message, &options, writer.as_ref())
                .await;
        } else if body.mode == "multi_agent" {
            let workflow_request = WorkflowRequest {
                user_id: body.user_id.clone(),
                conversation_id: conversation.id.clone(),
                assistant_message_id,
                request_id: request.request_id.clone(),
                user_query: body.message.clone(),
                resume_from_round: body.resume_from_round,
                client_assistant_message_id: body.client_assistant_message_id.clone(),
                cancel: cancel.clone(),
            };
            services
                .workflow
                .run(&llm, &workflow_request, writer.as_ref())
                .await;
        } else {
            services.handler.run(&llm, &request, writer.as_ref()).await;
        }

        keepalive_cancel.cancel();
        let _ = keepalive.await;
        writer.flush().await;
    });
}

/// The request message list is the persisted history (which already includes
/// the just-saved user message).
async fn load_request_messages(
    services: &Arc<Services>,
    body: &ChatBody,
    conversation: &relay::repo::Conversation,
) -> Vec<ChatMessage> {
    match load_history(services, body, conversation).await {
        Ok(history) if !history.is_empty() => history,
        _ => vec![ChatMessage::user(body.message.trim())],
    }
}

/// Heartbeats every 15 s; polls for client disconnect and fires the
/// request's cancellation token when the stream closes.
async fn keepalive_loop(
    writer: Arc<AdaptiveSseWriter>,
    cancel: CancellationToken,
    request_cancel: CancellationToken,
) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await;
    let mut poll = tokio::time::interval(DISCONNECT_POLL);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = heartbeat.tick() => {
                if !writer.heartbeat().await {
                    request_cancel.cancel();
                    return;
                }
            }
            _ = poll.tick() => {
                if writer.is_closed() {
                    request_cancel.cancel();
                    return;
                }
            }
        }
    }
}
