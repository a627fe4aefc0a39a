//! HTTP surface over hosted connector contexts.
//!
//! Stateless calls go through the server pool; stateful clients open a
//! session and address it by id. Bearer tokens arrive per request in the
//! Authorization header and are stamped onto the context on every access.

use crate::store::ConfigStore;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use sagemcp_hosting::{ConnectorKey, HostingError, ServerPool, SessionManager, StatusUpdate};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

pub struct GatewayState {
    pub store: Arc<ConfigStore>,
    pub pool: Arc<ServerPool>,
    pub sessions: Arc<SessionManager>,
}

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/{tenant_id}/{connector_id}/tools", get(list_tools))
        .route("/v1/{tenant_id}/{connector_id}/tools/call", post(call_tool))
        .route("/v1/{tenant_id}/{connector_id}/resources", get(list_resources))
        .route("/v1/{tenant_id}/{connector_id}/resources/read", post(read_resource))
        .route("/v1/{tenant_id}/{connector_id}/sessions", post(open_session))
        .route("/v1/sessions/{session_id}/tools/call", post(session_call_tool))
        .route("/v1/sessions/{session_id}", axum::routing::delete(close_session))
        .route("/v1/{tenant_id}/processes", get(process_status))
        .route("/v1/{tenant_id}/{connector_id}/invalidate", post(invalidate))
        .with_state(state)
}

/// Error envelope shared by every route.
#[derive(Debug)]
struct ApiError(HostingError);

impl From<HostingError> for ApiError {
    fn from(e: HostingError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            HostingError::NotFound(_) => StatusCode::NOT_FOUND,
            HostingError::Config(_) => StatusCode::BAD_REQUEST,
            HostingError::ToolFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            HostingError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            HostingError::Spawn(_)
            | HostingError::Handshake(_)
            | HostingError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            HostingError::Rpc { .. } => StatusCode::BAD_GATEWAY,
        };
        tracing::debug!(status = %status, error = %self.0, "request failed");
        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(String::from)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn list_tools(
    State(state): State<Arc<GatewayState>>,
    Path((tenant_id, connector_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let key = ConnectorKey::new(tenant_id, connector_id);
    let context = state.pool.get_or_build(&key, bearer(&headers).as_deref()).await?;
    let tools = context.list_tools().await?;
    Ok(Json(json!({"tools": tools})))
}

#[derive(Deserialize)]
struct CallToolBody {
    name: String,
    #[serde(default)]
    arguments: Value,
}

async fn call_tool(
    State(state): State<Arc<GatewayState>>,
    Path((tenant_id, connector_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<CallToolBody>,
) -> Result<Json<Value>, ApiError> {
    let key = ConnectorKey::new(tenant_id, connector_id);
    let context = state.pool.get_or_build(&key, bearer(&headers).as_deref()).await?;
    let result = context.call_tool(&body.name, body.arguments).await?;
    Ok(Json(json!({"result": result})))
}

async fn list_resources(
    State(state): State<Arc<GatewayState>>,
    Path((tenant_id, connector_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let key = ConnectorKey::new(tenant_id, connector_id);
    let context = state.pool.get_or_build(&key, bearer(&headers).as_deref()).await?;
    let resources = context.list_resources().await?;
    Ok(Json(json!({"resources": resources})))
}

#[derive(Deserialize)]
struct ReadResourceBody {
    uri: String,
}

async fn read_resource(
    State(state): State<Arc<GatewayState>>,
    Path((tenant_id, connector_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<ReadResourceBody>,
) -> Result<Json<Value>, ApiError> {
    let key = ConnectorKey::new(tenant_id, connector_id);
    let context = state.pool.get_or_build(&key, bearer(&headers).as_deref()).await?;
    let contents = context.read_resource(&body.uri).await?;
    Ok(Json(json!({"contents": contents})))
}

#[derive(Deserialize, Default)]
struct OpenSessionBody {
    protocol_version: Option<String>,
}

#[derive(Serialize)]
struct OpenSessionResponse {
    session_id: String,
}

async fn open_session(
    State(state): State<Arc<GatewayState>>,
    Path((tenant_id, connector_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Option<Json<OpenSessionBody>>,
) -> Result<Json<OpenSessionResponse>, ApiError> {
    let key = ConnectorKey::new(tenant_id, connector_id);
    let context = state.pool.get_or_build(&key, bearer(&headers).as_deref()).await?;
    let protocol_version = body.and_then(|Json(b)| b.protocol_version);
    let session = state.sessions.create(&key, context, protocol_version);
    Ok(Json(OpenSessionResponse { session_id: session.id.clone() }))
}

async fn session_call_tool(
    State(state): State<Arc<GatewayState>>,
    Path(session_id): Path<String>,
    Json(body): Json<CallToolBody>,
) -> Result<Json<Value>, ApiError> {
    let Some(session) = state.sessions.get(&session_id) else {
        return Err(HostingError::NotFound(format!("session {session_id} not found")).into());
    };
    let result = session.context.call_tool(&body.name, body.arguments).await?;
    Ok(Json(json!({"result": result})))
}

async fn close_session(
    State(state): State<Arc<GatewayState>>,
    Path(session_id): Path<String>,
) -> StatusCode {
    state.sessions.close(&session_id);
    StatusCode::NO_CONTENT
}

#[derive(Serialize)]
struct ProcessStatusResponse {
    processes: Vec<StatusUpdate>,
}

async fn process_status(
    State(state): State<Arc<GatewayState>>,
    Path(tenant_id): Path<String>,
) -> Result<Json<ProcessStatusResponse>, ApiError> {
    if !state.store.tenant_exists(&tenant_id) {
        return Err(HostingError::NotFound(format!("tenant {tenant_id} not found")).into());
    }
    Ok(Json(ProcessStatusResponse {
        processes: state.store.statuses_for_tenant(&tenant_id),
    }))
}

/// Drop the cached context and sessions for a connector so the next
/// request rebuilds from current configuration.
async fn invalidate(
    State(state): State<Arc<GatewayState>>,
    Path((tenant_id, connector_id)): Path<(String, String)>,
) -> StatusCode {
    state.pool.invalidate(&tenant_id, &connector_id);
    state
        .sessions
        .close_for_key(&ConnectorKey::new(tenant_id, connector_id));
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use sagemcp_hosting::{DefaultContextFactory, HostingConfig, ProcessRegistry};

    fn state() -> Arc<GatewayState> {
        let config = crate::config::parse(
            r#"
tenants:
  t1:
    connectors:
      diag:
        kind: echo
"#,
        )
        .expect("parse");
        let store = Arc::new(ConfigStore::new(config));
        let hosting = HostingConfig::default();
        let registry = Arc::new(ProcessRegistry::new(
            hosting.clone(),
            Arc::clone(&store) as _,
            Arc::clone(&store) as _,
        ));
        let resolver = Arc::new(crate::resolver::HostedPluginResolver::new(
            Arc::clone(&registry),
            hosting.clone(),
        ));
        let factory = Arc::new(DefaultContextFactory::new(
            Arc::clone(&store) as _,
            resolver,
            Arc::clone(&store) as _,
        ));
        Arc::new(GatewayState {
            store: Arc::clone(&store),
            pool: Arc::new(ServerPool::new(hosting.clone(), factory)),
            sessions: Arc::new(SessionManager::new(hosting)),
        })
    }

    #[tokio::test]
    async fn tool_listing_and_calls_round_trip() {
        let state = state();

        let Json(listing) = list_tools(
            State(Arc::clone(&state)),
            Path(("t1".to_string(), "diag".to_string())),
            HeaderMap::new(),
        )
        .await
        .expect("list");
        assert_eq!(listing["tools"][0]["name"], "echo");

        let Json(result) = call_tool(
            State(state),
            Path(("t1".to_string(), "diag".to_string())),
            HeaderMap::new(),
            Json(CallToolBody { name: "echo".into(), arguments: json!({"x": 1}) }),
        )
        .await
        .expect("call");
        assert_eq!(result["result"], json!({"x": 1}));
    }

    #[tokio::test]
    async fn unknown_connector_maps_to_not_found() {
        let state = state();
        let err = list_tools(
            State(state),
            Path(("t1".to_string(), "nope".to_string())),
            HeaderMap::new(),
        )
        .await
        .expect_err("must 404");
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sessions_open_call_and_close() {
        let state = state();

        let Json(opened) = open_session(
            State(Arc::clone(&state)),
            Path(("t1".to_string(), "diag".to_string())),
            HeaderMap::new(),
            None,
        )
        .await
        .expect("open");
        let session_id = opened.session_id;

        let Json(result) = session_call_tool(
            State(Arc::clone(&state)),
            Path(session_id.clone()),
            Json(CallToolBody { name: "echo".into(), arguments: json!({"s": true}) }),
        )
        .await
        .expect("call");
        assert_eq!(result["result"], json!({"s": true}));

        let status = close_session(State(Arc::clone(&state)), Path(session_id.clone())).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let err = session_call_tool(
            State(state),
            Path(session_id),
            Json(CallToolBody { name: "echo".into(), arguments: json!({}) }),
        )
        .await
        .expect_err("closed session must 404");
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn bearer_header_is_parsed() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer tok123".parse().expect("value"));
        assert_eq!(bearer(&headers).as_deref(), Some("tok123"));

        let mut bad = HeaderMap::new();
        bad.insert(axum::http::header::AUTHORIZATION, "Basic zzz".parse().expect("value"));
        assert_eq!(bearer(&bad), None);
        assert_eq!(bearer(&HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn invalidate_closes_sessions_for_the_key() {
        let state = state();
        let Json(opened) = open_session(
            State(Arc::clone(&state)),
            Path(("t1".to_string(), "diag".to_string())),
            HeaderMap::new(),
            None,
        )
        .await
        .expect("open");

        let status = invalidate(
            State(Arc::clone(&state)),
            Path(("t1".to_string(), "diag".to_string())),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let err = session_call_tool(
            State(state),
            Path(opened.session_id),
            Json(CallToolBody { name: "echo".into(), arguments: json!({}) }),
        )
        .await
        .expect_err("session must be gone");
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }
}
