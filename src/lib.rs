use std::sync::Arc;

use axum::{http::Method, middleware, routing::get, Router};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

// Public modules
pub mod config;
pub mod error;
pub mod handlers;
pub mod limits;
pub mod metrics;
pub mod models;
pub mod store;

// Re-export commonly used types
pub use error::{AppError, LedgerError, LedgerResult};
pub use handlers::AppState;
pub use limits::RequestLimits;
pub use models::{EntryKind, EntryView, LedgerEntry, ReportKind, Wallet};
pub use store::{KeyScope, LedgerStore, RetryPolicy};

/// API documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::create_wallet,
        handlers::get_wallet,
        handlers::deposit,
        handlers::withdraw,
        handlers::transfer_funds,
        handlers::report,
    ),
    components(schemas(Wallet, LedgerEntry, handlers::Ack)),
    tags(
        (name = "wallets", description = "Wallet ledger endpoints")
    )
)]
pub struct ApiDoc;

/// Build the HTTP application around a ledger store.
///
/// `/v1` is rate limited per client IP and capped at
/// `state.limits.concurrency` requests in flight.
pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(vec![Method::GET])
        .allow_headers(Any);

    let v1 = Router::new()
        .route("/createWallet", get(handlers::create_wallet))
        .route("/getWallet", get(handlers::get_wallet))
        .route("/deposit", get(handlers::deposit))
        .route("/withdraw", get(handlers::withdraw))
        .route("/transferFunds", get(handlers::transfer_funds))
        .route("/report", get(handlers::report))
        .layer(GlobalConcurrencyLimitLayer::new(state.limits.concurrency.get()))
        .layer(middleware::from_fn_with_state(
            Arc::new(limits::IpRateLimiter::new(state.limits.per_ip_per_minute)),
            limits::limit_by_ip,
        ));

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .route("/ping", get(handlers::ping))
        .route("/version", get(handlers::version))
        .route("/metrics", get(handlers::metrics))
        .nest("/v1", v1)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
