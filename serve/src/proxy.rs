//! HTTP proxy surface.
//!
//! `POST /<tool>` per discovered tool, `GET /tools` (authenticated),
//! `GET /health`, `GET /openapi.json`, and `GET /docs` (unauthenticated).
//! Auth is a single API key in the `Authorization` header, with or without
//! the `Bearer ` prefix. CORS headers come from the configured origins and
//! OPTIONS preflight is answered by the middleware.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tracing::{info, warn};
use weft::{ErrorCode, WeftError};

use crate::catalog::ToolCatalog;

/// Shared proxy state.
pub struct ProxyState {
    pub catalog: Arc<ToolCatalog>,
    pub api_key: Option<String>,
    pub cors_origins: Vec<String>,
    pub enable_docs: bool,
    /// Pre-generated OpenAPI document (regeneration is deterministic).
    pub openapi: Value,
}

/// Builds the router, nesting under `base_path` when configured.
pub fn build_router(state: Arc<ProxyState>, base_path: Option<&str>) -> Router {
    let inner = Router::new()
        .route("/health", get(health))
        .route("/tools", get(list_tools))
        .route("/openapi.json", get(openapi_doc))
        .route("/docs", get(docs))
        .route("/{tool}", post(invoke_tool))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            cors_middleware,
        ))
        .with_state(state);

    match base_path {
        Some(prefix) if !prefix.is_empty() && prefix != "/" => {
            Router::new().nest(prefix, inner)
        }
        _ => inner,
    }
}

/// Binds and serves, with TLS when a cert/key pair is configured.
pub async fn serve_proxy(
    state: Arc<ProxyState>,
    proxy: &config::ProxyConfig,
) -> Result<(), WeftError> {
    let router = build_router(state, proxy.base_path.as_deref());
    let addr: SocketAddr = format!("{}:{}", proxy.host, proxy.port)
        .parse()
        .map_err(|e: std::net::AddrParseError| {
            WeftError::new(ErrorCode::ConfigInvalid, format!("invalid proxy address: {e}"))
        })?;

    match (&proxy.tls_cert, &proxy.tls_key) {
        (Some(cert), Some(key)) => {
            let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
                .await
                .map_err(|e| {
                    WeftError::new(ErrorCode::ConfigInvalid, "cannot load TLS cert/key")
                        .with_cause(e)
                })?;
            info!(%addr, "proxy listening (tls)");
            axum_server::bind_rustls(addr, tls)
                .serve(router.into_make_service())
                .await
        }
        _ => {
            info!(%addr, "proxy listening");
            axum_server::bind(addr)
                .serve(router.into_make_service())
                .await
        }
    }
    .map_err(|e| WeftError::new(ErrorCode::Internal, "proxy server failed").with_cause(e))
}

async fn cors_middleware(
    State(state): State<Arc<ProxyState>>,
    request: Request,
    next: Next,
) -> Response {
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors(&state, origin.as_deref(), response.headers_mut());
        response.headers_mut().insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, OPTIONS"),
        );
        response.headers_mut().insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("authorization, content-type"),
        );
        return response;
    }

    let mut response = next.run(request).await;
    apply_cors(&state, origin.as_deref(), response.headers_mut());
    response
}

fn apply_cors(state: &ProxyState, origin: Option<&str>, headers: &mut HeaderMap) {
    let allowed = if state.cors_origins.iter().any(|o| o == "*") {
        Some("*".to_string())
    } else {
        origin
            .filter(|o| state.cors_origins.iter().any(|allowed| allowed == o))
            .map(str::to_string)
    };
    if let Some(value) = allowed {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
    }
}

/// Checks the `Authorization` header against the configured key. `Bearer `
/// prefix optional.
fn authorize(state: &ProxyState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = &state.api_key else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v));

    match presented {
        Some(key) if key == expected => Ok(()),
        _ => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "unauthorized" })),
        )
            .into_response()),
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

async fn list_tools(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    let tools: Vec<Value> = state
        .catalog
        .tools()
        .iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "input_schema": tool.input_schema,
            })
        })
        .collect();
    Json(json!({ "tools": tools })).into_response()
}

async fn openapi_doc(State(state): State<Arc<ProxyState>>) -> impl IntoResponse {
    Json(state.openapi.clone())
}

async fn docs(State(state): State<Arc<ProxyState>>) -> Response {
    if !state.enable_docs {
        return StatusCode::NOT_FOUND.into_response();
    }
    Html(
        r#"<!doctype html>
<html>
  <head><title>weft proxy</title></head>
  <body>
    <redoc spec-url="openapi.json"></redoc>
    <script src="https://cdn.redoc.ly/redoc/latest/bundles/redoc.standalone.js"></script>
  </body>
</html>"#,
    )
    .into_response()
}

async fn invoke_tool(
    State(state): State<Arc<ProxyState>>,
    Path(tool): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    let arguments = if body.is_empty() {
        json!({})
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(value) => value,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({
                        "success": false,
                        "tool": tool,
                        "error": format!("invalid JSON body: {e}"),
                    })),
                )
                    .into_response();
            }
        }
    };

    match state.catalog.call(&tool, arguments).await {
        Ok(text) => {
            // Structured tool output passes through as JSON when it parses.
            let result = serde_json::from_str::<Value>(&text)
                .unwrap_or_else(|_| Value::String(text));
            Json(json!({ "success": true, "tool": tool, "result": result })).into_response()
        }
        Err(e) => {
            warn!(%tool, error = %e, "tool invocation failed");
            let status = StatusCode::from_u16(e.code.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (
                status,
                Json(json!({
                    "success": false,
                    "tool": tool,
                    "error": e.to_string(),
                })),
            )
                .into_response()
        }
    }
}
