//! Router assembly and serving

use std::future::Future;

use axum::Router;
use axum::http::{HeaderName, header};
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use utoipa_scalar::{Scalar, Servable};

use crate::middleware::{TraceIdConfig, trace_id_middleware};
use crate::routes;
use crate::state::AppState;

/// Build the complete axum router with documentation at `/docs`
///
/// Layer order, outermost first: panic recovery, request correlation, CORS.
/// Responses answered by CORS itself, preflights included, still get the
/// trace header. Panics leave the correlation middleware before they are
/// turned into a 500 response, so that response has none.
pub fn build_router(state: AppState, trace: TraceIdConfig) -> Router {
    let (router, api) = routes::router().split_for_parts();
    let trace_header: HeaderName = trace.header_name.clone();

    router
        .merge(Scalar::with_url("/docs", api))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(vec![
                    header::CONTENT_TYPE,
                    header::AUTHORIZATION,
                    trace_header.clone(),
                ])
                .expose_headers(vec![trace_header]),
        )
        .layer(axum::middleware::from_fn_with_state(
            trace,
            trace_id_middleware,
        ))
        .layer(CatchPanicLayer::new())
}

/// Serve `router` until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Listening on http://{}", addr);
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
