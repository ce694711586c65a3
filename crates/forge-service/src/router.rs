//! Wires every handler into one `Router`. Grouped the way the external
//! interface is grouped: user-facing chat/conversations/preferences/tools,
//! `forge-admin` CRUD + config, and the unauthenticated health check.

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::common::{SharedState, MAX_BODY_BYTES};
use crate::handlers::{admin, chat, chat_sync, conversations, health, preferences, resume, tools};

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/agent-api/chat", post(chat::chat))
        .route("/agent-api/chat-sync", post(chat_sync::chat_sync))
        .route("/agent-api/chat/resume", post(resume::resume))
        .route(
            "/agent-api/user/preferences",
            get(preferences::get_preferences).put(preferences::put_preferences),
        )
        .route("/agent-api/conversations", get(conversations::list_conversations))
        .route(
            "/agent-api/conversations/:sid",
            get(conversations::get_conversation).delete(conversations::delete_conversation),
        )
        .route("/agent-api/tools", get(tools::list_tools))
        .route("/forge-admin/agents", get(admin::list_agents).post(admin::create_agent))
        .route(
            "/forge-admin/agents/:id",
            get(admin::get_agent).put(admin::update_agent).delete(admin::delete_agent),
        )
        .route("/forge-admin/agents/:id/set-default", post(admin::set_default_agent))
        .route("/forge-admin/config", get(admin::get_config).put(admin::put_config))
        .route(
            "/forge-admin/config/:section",
            get(admin::get_config_section).put(admin::put_config_section),
        )
        .route("/health", get(health::health))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
