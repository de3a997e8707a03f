pub mod api;
pub mod config;
pub mod error;
pub mod request_meta;
pub mod state;

use axum::{
    Router, middleware,
    routing::{get, post},
};

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(api::health))
        .route(
            "/api/programs",
            get(api::list_programs).post(api::create_program),
        )
        .route("/api/programs/memory", get(api::programs_memory))
        .route("/api/programs/running", get(api::running))
        .route("/api/programs/stopped", get(api::stopped))
        .route("/api/programs/refresh", post(api::refresh))
        .route("/api/programs/start", post(api::batch_start))
        .route("/api/programs/stop", post(api::batch_stop))
        .route(
            "/api/programs/:id",
            get(api::get_program)
                .put(api::update_program)
                .delete(api::delete_program),
        )
        .route("/api/programs/:id/start", post(api::start_program))
        .route("/api/programs/:id/stop", post(api::stop_program))
        .route("/api/programs/:id/memory", get(api::program_memory))
        .route("/api/status", get(api::status_all))
        .route("/api/status/:id", get(api::status_one))
        .route("/api/system/memory", get(api::system_memory))
        .route("/api/logs/:id", get(api::program_logs))
        .layer(middleware::from_fn(request_meta::request_id))
        .with_state(state)
}
