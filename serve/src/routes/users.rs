//! `/api/user`: get-or-create by subject id.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use serde::Deserialize;
use serde_json::json;

use super::{bad_request, internal, ok};
use crate::app::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserQuery {
    pub user_id: Option<String>,
    pub display_name: Option<String>,
}

/// GET and POST behave the same: identity comes from the external OIDC
/// layer, we only materialize the row and bump activity.
pub async fn get_user(State(state): State<AppState>, Query(query): Query<UserQuery>) -> Response {
    get_or_create(&state, query).await
}

/// POST variant; the same fields arrive in the JSON body.
pub async fn post_user(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<UserQuery>,
) -> Response {
    get_or_create(&state, body).await
}

async fn get_or_create(state: &AppState, query: UserQuery) -> Response {
    let Some(user_id) = query.user_id.as_deref().filter(|s| !s.trim().is_empty()) else {
        return bad_request("userId is required");
    };
    match state
        .services
        .users
        .get_or_create(user_id, query.display_name.as_deref())
        .await
    {
        Ok(user) => ok(json!({
            "id": user.id,
            "displayName": user.display_name,
            "createdAt": user.created_at.to_rfc3339(),
            "lastActiveAt": user.last_active_at.to_rfc3339(),
        })),
        Err(e) => internal(e),
    }
}

pub async fn options_user() -> StatusCode {
    StatusCode::NO_CONTENT
}
