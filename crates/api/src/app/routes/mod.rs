use axum::{
    Router,
    routing::{get, post},
};

pub mod factors;
pub mod installments;
pub mod ledger;
pub mod operations;
pub mod system;

/// Router for all tenant-scoped endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .route("/read-models/rebuild", post(system::rebuild_read_models))
        .nest("/factors", factors::router())
        .nest("/installments", installments::router())
        .nest("/operations", operations::router())
        .nest("/ledger", ledger::router())
}
