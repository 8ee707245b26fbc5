//! Integration tests for trace ID propagation through the router

use std::io::Write;
use std::sync::{Arc, Mutex};

use axum::{Router, body::Body, routing::get};
use http::{Request, StatusCode};
use roster_core::MemoryUserStore;
use roster_core::tracing::correlation;
use roster_core::tracing::format::{EventFormatter, JsonFormatter};
use roster_http::{
    AppState, ServiceInfo, TraceIdConfig, build_router, middleware::trace_id_middleware,
};
use serde_json::Value;
use tower::ServiceExt;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::Level;

const HEADER: &str = "x-trace-id";

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Capture {
    fn records(&self) -> Vec<Value> {
        String::from_utf8(self.0.lock().unwrap().clone())
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn with_message(&self, message: &str) -> Vec<Value> {
        self.records()
            .into_iter()
            .filter(|r| r["message"] == message)
            .collect()
    }
}

/// Route every event of the current thread through the JSON formatter
fn capture_logs() -> (Capture, tracing::subscriber::DefaultGuard) {
    let capture = Capture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_writer(move || writer.clone())
        .event_format(EventFormatter::new(Arc::new(JsonFormatter::default())))
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (capture, guard)
}

fn test_app() -> Router {
    let state = AppState::new(Arc::new(MemoryUserStore::new()), ServiceInfo::default());
    build_router(state, TraceIdConfig::default())
}

fn trace_header(response: &http::Response<Body>) -> String {
    response
        .headers()
        .get(HEADER)
        .expect("trace header should be present")
        .to_str()
        .unwrap()
        .to_string()
}

async fn json_body(response: http::Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn is_trace_id(value: &str) -> bool {
    value.len() == 32 && value.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

#[tokio::test]
async fn test_trace_id_generated_without_header() {
    let app = test_app();

    let (first, second) = tokio::join!(
        app.clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap()),
        app.clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap()),
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.status(), StatusCode::OK);
    let first_id = trace_header(&first);
    let second_id = trace_header(&second);
    assert!(is_trace_id(&first_id), "{first_id}");
    assert!(is_trace_id(&second_id), "{second_id}");
    assert_ne!(first_id, second_id);

    let body = json_body(first).await;
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_valid_trace_id_is_echoed() {
    let trace_id = "4bf92f3577b34da6a3ce929d0e0e4736";
    let response = test_app()
        .oneshot(
            Request::get("/")
                .header(HEADER, trace_id)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(trace_header(&response), trace_id);
}

#[tokio::test]
async fn test_uppercase_trace_id_is_echoed_verbatim() {
    let trace_id = "4BF92F3577B34DA6A3CE929D0E0E4736";
    let response = test_app()
        .oneshot(
            Request::get("/health")
                .header(HEADER, trace_id)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(trace_header(&response), trace_id);
}

#[tokio::test]
async fn test_all_zero_trace_id_is_replaced() {
    let zero = "00000000000000000000000000000000";
    let response = test_app()
        .oneshot(
            Request::get("/health")
                .header(HEADER, zero)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let echoed = trace_header(&response);
    assert_ne!(echoed, zero);
    assert!(is_trace_id(&echoed), "{echoed}");
}

#[tokio::test]
async fn test_cors_preflight_carries_trace_id() {
    let trace_id = "4bf92f3577b34da6a3ce929d0e0e4736";
    let response = test_app()
        .oneshot(
            Request::options("/api/v1/users")
                .header("origin", "http://localhost:3000")
                .header("access-control-request-method", "POST")
                .header(HEADER, trace_id)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert!(response.status().is_success());
    assert!(response.headers().contains_key("access-control-allow-origin"));
    assert_eq!(trace_header(&response), trace_id);
}

#[tokio::test]
async fn test_malformed_trace_id_is_replaced() {
    for bad in ["not-a-trace-id", "4bf92f3577b34da6", "zzf92f3577b34da6a3ce929d0e0e4736"] {
        let response = test_app()
            .oneshot(
                Request::get("/health")
                    .header(HEADER, bad)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK, "{bad}");
        let echoed = trace_header(&response);
        assert_ne!(echoed, bad);
        assert!(is_trace_id(&echoed), "{echoed}");
    }
}

#[tokio::test]
async fn test_error_responses_keep_trace_id() {
    let trace_id = "0af7651916cd43dd8448eb211c80319c";
    let response = test_app()
        .oneshot(
            Request::get("/api/v1/users/999")
                .header(HEADER, trace_id)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(trace_header(&response), trace_id);

    let body = json_body(response).await;
    assert_eq!(body["detail"], "User not found");
    assert_eq!(body["error_code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_request_logs_carry_trace_id() {
    let (capture, _guard) = capture_logs();
    let trace_id = "4bf92f3577b34da6a3ce929d0e0e4736";

    let response = test_app()
        .oneshot(
            Request::get("/")
                .header(HEADER, trace_id)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let handler = capture.with_message("Root endpoint accessed");
    assert_eq!(handler.len(), 1);
    assert_eq!(handler[0]["trace_id"], trace_id);
    let span_id = handler[0]["span_id"].as_str().unwrap();
    assert_eq!(span_id.len(), 16);

    let processed = capture.with_message("Request processed");
    assert_eq!(processed.len(), 1);
    let record = &processed[0];
    assert_eq!(record["trace_id"], trace_id);
    assert_eq!(record["span_id"], span_id);
    assert_eq!(record["extra"]["method"], "GET");
    assert_eq!(record["extra"]["path"], "/");
    assert_eq!(record["extra"]["status_code"], 200);

    assert!(correlation::get().is_none());
}

#[tokio::test]
async fn test_concurrent_requests_do_not_share_identity() {
    let (capture, _guard) = capture_logs();
    let app = test_app();

    let create = |trace_id: &str, username: &str| {
        let body = serde_json::json!({
            "email": format!("{username}@example.com"),
            "username": username,
        });
        app.clone().oneshot(
            Request::post("/api/v1/users")
                .header(HEADER, trace_id)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
    };

    let alice_trace = "11111111111111111111111111111111";
    let bob_trace = "22222222222222222222222222222222";
    let (alice, bob) = tokio::join!(create(alice_trace, "alice"), create(bob_trace, "bob"));
    assert_eq!(alice.unwrap().status(), StatusCode::CREATED);
    assert_eq!(bob.unwrap().status(), StatusCode::CREATED);

    let created = capture.with_message("User created");
    assert_eq!(created.len(), 2);
    for record in created {
        let expected = match record["extra"]["username"].as_str().unwrap() {
            "alice" => alice_trace,
            "bob" => bob_trace,
            other => panic!("unexpected user {other}"),
        };
        assert_eq!(record["trace_id"], expected);
    }
    assert!(correlation::get().is_none());
}

#[tokio::test]
async fn test_domain_errors_pass_through() {
    let (capture, _guard) = capture_logs();
    let app = test_app();

    let request = || {
        Request::post("/api/v1/users")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"email": "dup@example.com", "username": "dup_user"}"#,
            ))
            .unwrap()
    };
    assert_eq!(
        app.clone().oneshot(request()).await.unwrap().status(),
        StatusCode::CREATED
    );

    let response = app.oneshot(request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let trace_id = trace_header(&response);

    let errors = capture.with_message("Custom exception occurred");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["trace_id"], trace_id.as_str());
    assert_eq!(errors[0]["extra"]["error_code"], "CONFLICT");

    // A handled error is still a processed request, not a handler failure
    assert!(capture.with_message("Error processing request").is_empty());
    assert_eq!(capture.with_message("Request processed").len(), 2);
}

async fn explode() -> &'static str {
    panic!("handler exploded")
}

#[tokio::test]
async fn test_handler_panic_is_logged_and_resumed() {
    let (capture, _guard) = capture_logs();
    let app = Router::new()
        .route("/boom", get(explode))
        .layer(axum::middleware::from_fn_with_state(
            TraceIdConfig::default(),
            trace_id_middleware,
        ))
        .layer(CatchPanicLayer::new());

    let trace_id = "0af7651916cd43dd8448eb211c80319c";
    let response = app
        .oneshot(
            Request::get("/boom")
                .header(HEADER, trace_id)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    // The outer layer saw the panic, so the middleware did not swallow it
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response.headers().get(HEADER).is_none());

    let errors = capture.with_message("Error processing request");
    assert_eq!(errors.len(), 1);
    let record = &errors[0];
    assert_eq!(record["level"], "ERROR");
    assert_eq!(record["trace_id"], trace_id);
    assert_eq!(record["exception"], "handler exploded");
    assert_eq!(record["extra"]["method"], "GET");
    assert_eq!(record["extra"]["path"], "/boom");
    assert!(capture.with_message("Request processed").is_empty());

    assert!(correlation::get().is_none());
}

#[cfg(feature = "otlp")]
#[tokio::test]
async fn test_logged_span_id_is_the_exported_span() {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider};
    use tracing_subscriber::layer::SubscriberExt;

    let exporter = InMemorySpanExporter::default();
    let provider = SdkTracerProvider::builder()
        .with_simple_exporter(exporter.clone())
        .build();
    let subscriber = tracing_subscriber::registry()
        .with(tracing_opentelemetry::layer().with_tracer(provider.tracer("roster-test")));
    let _guard = tracing::subscriber::set_default(subscriber);

    async fn span_id() -> String {
        correlation::current_span_id().unwrap_or_default()
    }

    let app = Router::new()
        .route("/span", get(span_id))
        .layer(axum::middleware::from_fn_with_state(
            TraceIdConfig::default(),
            trace_id_middleware,
        ));

    let trace_id = "4bf92f3577b34da6a3ce929d0e0e4736";
    let response = app
        .oneshot(
            Request::get("/span")
                .header(HEADER, trace_id)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(trace_header(&response), trace_id);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let logged = String::from_utf8(bytes.to_vec()).unwrap();

    provider.force_flush().unwrap();
    let spans = exporter.get_finished_spans().unwrap();
    let request_span = spans
        .iter()
        .find(|span| span.name == "GET /span")
        .expect("request span should be exported");

    assert_eq!(request_span.span_context.trace_id().to_string(), trace_id);
    assert_eq!(request_span.span_context.span_id().to_string(), logged);
    // The minted id only parents the exported span
    assert_ne!(request_span.parent_span_id.to_string(), logged);
}
