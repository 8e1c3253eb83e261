use crate::core::dispatch;
use axum::{
    extract::State,
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use lasso_core::{EngineError, SessionEngine};
use lasso_proto::protocol::{Command, ErrorKind, SessionSnapshot};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{error, info, warn};

#[derive(Clone)]
struct HttpState {
    engine: Arc<SessionEngine>,
}

#[derive(Deserialize)]
struct StartRequest {
    username: String,
}

#[derive(Serialize)]
struct ApiError {
    kind: ErrorKind,
    message: String,
}

struct CommandError(EngineError);

impl IntoResponse for CommandError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            ErrorKind::InvalidUsername => StatusCode::BAD_REQUEST,
            ErrorKind::UnknownUser => StatusCode::NOT_FOUND,
            ErrorKind::InvalidTransition => StatusCode::CONFLICT,
            ErrorKind::Unauthorized => StatusCode::BAD_GATEWAY,
            ErrorKind::RateLimited | ErrorKind::NetworkError | ErrorKind::Timeout => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        let body = ApiError {
            kind: self.0.kind(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult = Result<Json<SessionSnapshot>, CommandError>;

pub fn router(engine: Arc<SessionEngine>, allowed_origin: &str) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/session/start", post(start))
        .route("/api/session/pause", post(pause))
        .route("/api/session/resume", post(resume))
        .route("/api/session/stop", post(stop))
        .layer(cors_layer(allowed_origin))
        .with_state(HttpState { engine })
}

fn cors_layer(allowed_origin: &str) -> CorsLayer {
    let origin = match allowed_origin.trim() {
        "" | "*" => AllowOrigin::any(),
        origin => match HeaderValue::from_str(origin) {
            Ok(value) => AllowOrigin::exact(value),
            Err(_) => {
                warn!("Ignoring invalid allowed_origin {:?}", origin);
                AllowOrigin::any()
            }
        },
    };
    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([axum::http::header::CONTENT_TYPE])
}

pub fn start_server(
    bind_address: String,
    port: u16,
    engine: Arc<SessionEngine>,
    allowed_origin: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(engine, &allowed_origin);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn run(state: &HttpState, cmd: Command) -> ApiResult {
    dispatch(&state.engine, cmd)
        .await
        .map(Json)
        .map_err(CommandError)
}

async fn get_state(State(state): State<HttpState>) -> ApiResult {
    run(&state, Command::GetState).await
}

async fn start(State(state): State<HttpState>, Json(req): Json<StartRequest>) -> ApiResult {
    run(
        &state,
        Command::Start {
            username: req.username,
        },
    )
    .await
}

async fn pause(State(state): State<HttpState>) -> ApiResult {
    run(&state, Command::Pause).await
}

async fn resume(State(state): State<HttpState>) -> ApiResult {
    run(&state, Command::Resume).await
}

async fn stop(State(state): State<HttpState>) -> ApiResult {
    run(&state, Command::Stop).await
}
