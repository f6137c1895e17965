//! Axum app: state, router, CORS.

use std::sync::Arc;

use axum::http::{header, Method};
use axum::routing::{get, post};
use axum::Router;
use relay::Services;
use tower_http::cors::{Any, CorsLayer};

use super::routes;

#[derive(Clone)]
pub struct AppState {
    pub services: Arc<Services>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/api/chat", post(routes::chat::chat))
        .route(
            "/api/user",
            get(routes::users::get_user)
                .post(routes::users::post_user)
                .options(routes::users::options_user),
        )
        .route("/api/conversations", get(routes::conversations::list))
        .route(
            "/api/conversations/archive",
            post(routes::conversations::archive),
        )
        .route(
            "/api/conversations/unarchive",
            post(routes::conversations::restore),
        )
        .route(
            "/api/conversations/archived",
            post(routes::conversations::list_archived),
        )
        .route(
            "/api/conversations/archived/restore",
            post(routes::conversations::restore),
        )
        .route(
            "/api/conversations/:id",
            get(routes::conversations::detail)
                .put(routes::conversations::update_title)
                .delete(routes::conversations::soft_delete),
        )
        .route("/api/metrics", get(routes::admin::metrics))
        .route("/api/tool-system/status", get(routes::admin::tool_status))
        .route(
            "/api/admin/lru-status/trigger",
            post(routes::admin::trigger_lru),
        )
        .layer(cors)
        .with_state(state)
}
