use crate::auth::{auth_middleware, AuthContext, AuthGate};
use crate::error::{AdminError, AdminResult};
use crate::notes::{NoteDraft, NoteStore};
use crate::pool_manager::PoolManager;
use crate::replace::DeviceReplacer;
use crate::stats::StatsCollector;
use crate::types::{ReplaceDevice, Zpool};
use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Default page size for `GET /api/info/audit-records`.
pub const DEFAULT_AUDIT_LIMIT: usize = 64;

#[derive(Serialize)]
struct Envelope<T> {
    status: &'static str,
    data: T,
}

fn success<T: Serialize>(data: T) -> Response {
    Json(Envelope {
        status: "success",
        data,
    })
    .into_response()
}

fn created<T: Serialize>(data: T) -> Response {
    (StatusCode::CREATED, success(data)).into_response()
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> AdminResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| AdminError::InvalidRequest {
            reason: rejection.body_text(),
        })
}

fn path<T>(param: Result<Path<T>, PathRejection>) -> AdminResult<T> {
    param
        .map(|Path(value)| value)
        .map_err(|rejection| AdminError::InvalidRequest {
            reason: rejection.body_text(),
        })
}

fn query<T>(params: Result<Query<T>, QueryRejection>) -> AdminResult<T> {
    params
        .map(|Query(value)| value)
        .map_err(|rejection| AdminError::InvalidRequest {
            reason: rejection.body_text(),
        })
}

#[derive(Debug, Default, Deserialize)]
pub struct ForceParams {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct SparesRequest {
    pub devices: Vec<String>,
}

#[derive(Clone)]
pub struct AdminApi {
    manager: Arc<PoolManager>,
    replacer: Arc<DeviceReplacer>,
    stats: Arc<StatsCollector>,
    notes: Arc<NoteStore>,
    gate: Arc<AuthGate>,
    bind_addr: SocketAddr,
}

impl AdminApi {
    pub fn new(
        manager: Arc<PoolManager>,
        stats: Arc<StatsCollector>,
        gate: Arc<AuthGate>,
        bind_addr: SocketAddr,
    ) -> Self {
        Self {
            replacer: Arc::new(DeviceReplacer::new(manager.clone())),
            manager,
            stats,
            notes: Arc::new(NoteStore::new()),
            gate,
            bind_addr,
        }
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/api/auth/login", post(login_handler))
            .route("/api/utilities/downloads/:file", get(download_handler))
            .route("/api/health", get(health_handler))
            .route("/api/zfs/pools", get(list_pools_handler).post(create_pool_handler))
            .route(
                "/api/zfs/pools/:name",
                get(get_pool_handler).delete(destroy_pool_handler),
            )
            .route("/api/zfs/pools/:name/import", post(import_pool_handler))
            .route("/api/zfs/pools/:name/export", post(export_pool_handler))
            .route("/api/zfs/pools/:name/properties", patch(set_properties_handler))
            .route("/api/zfs/pools/:name/spares", post(add_spares_handler))
            .route("/api/zfs/pools/:name/vdevs/:vdev", delete(remove_vdev_handler))
            .route("/api/zfs/pools/:name/replace-device", post(replace_device_handler))
            .route("/api/zfs/pools/:name/stats", get(pool_stats_handler))
            .route("/api/info/audit-records", get(audit_records_handler))
            .route("/api/info/audit-records/:id", get(audit_record_handler))
            .route("/api/info/notes", get(list_notes_handler).post(create_note_handler))
            .route(
                "/api/info/notes/:id",
                get(get_note_handler)
                    .put(update_note_handler)
                    .delete(delete_note_handler),
            )
            .layer(axum::middleware::from_fn_with_state(
                self.gate.clone(),
                auth_middleware,
            ))
            .layer(axum::middleware::from_fn(
                crate::security::security_headers_middleware,
            ))
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }

    pub async fn serve(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let addr = self.bind_addr;
        let router = Arc::new(self).router();

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(%addr, "admin API listening");

        axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }
}

type ApiState = State<Arc<AdminApi>>;

async fn login_handler() -> Response {
    (
        StatusCode::NOT_IMPLEMENTED,
        Json(serde_json::json!({
            "status": "error",
            "error": "login_external",
            "message": "tokens are issued by the external login service",
        })),
    )
        .into_response()
}

async fn download_handler(Path(file): Path<String>) -> AdminError {
    AdminError::NotFound {
        what: format!("download {}", file),
    }
}

async fn health_handler(State(api): ApiState) -> Response {
    success(serde_json::json!({
        "pools": api.manager.pool_names().len(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn list_pools_handler(State(api): ApiState) -> Response {
    api.manager.reconcile(None).await;
    success(api.manager.list_pools())
}

async fn create_pool_handler(
    State(api): ApiState,
    Extension(actor): Extension<AuthContext>,
    payload: Result<Json<Zpool>, JsonRejection>,
) -> AdminResult<Response> {
    let spec = body(payload)?;
    let record = api.manager.create_pool(&actor, spec).await?;
    Ok(created(record))
}

async fn get_pool_handler(
    State(api): ApiState,
    name: Result<Path<String>, PathRejection>,
) -> AdminResult<Response> {
    let name = path(name)?;
    api.manager.reconcile(None).await;
    Ok(success(api.manager.get_pool(&name)?))
}

async fn destroy_pool_handler(
    State(api): ApiState,
    Extension(actor): Extension<AuthContext>,
    name: Result<Path<String>, PathRejection>,
    params: Result<Query<ForceParams>, QueryRejection>,
) -> AdminResult<Response> {
    let name = path(name)?;
    let params = query(params)?;
    api.manager.destroy_pool(&actor, &name, params.force).await?;
    Ok(success(serde_json::json!({ "name": name })))
}

async fn import_pool_handler(
    State(api): ApiState,
    Extension(actor): Extension<AuthContext>,
    name: Result<Path<String>, PathRejection>,
    payload: Option<Json<ForceParams>>,
) -> AdminResult<Response> {
    let name = path(name)?;
    let force = payload.map(|Json(p)| p.force).unwrap_or(false);
    Ok(success(api.manager.import_pool(&actor, &name, force).await?))
}

async fn export_pool_handler(
    State(api): ApiState,
    Extension(actor): Extension<AuthContext>,
    name: Result<Path<String>, PathRejection>,
) -> AdminResult<Response> {
    let name = path(name)?;
    api.manager.export_pool(&actor, &name).await?;
    Ok(success(serde_json::json!({ "name": name })))
}

async fn set_properties_handler(
    State(api): ApiState,
    Extension(actor): Extension<AuthContext>,
    name: Result<Path<String>, PathRejection>,
    payload: Result<Json<HashMap<String, String>>, JsonRejection>,
) -> AdminResult<Response> {
    let name = path(name)?;
    let properties = body(payload)?;
    Ok(success(api.manager.set_properties(&actor, &name, properties).await?))
}

async fn add_spares_handler(
    State(api): ApiState,
    Extension(actor): Extension<AuthContext>,
    name: Result<Path<String>, PathRejection>,
    payload: Result<Json<SparesRequest>, JsonRejection>,
) -> AdminResult<Response> {
    let name = path(name)?;
    let request = body(payload)?;
    Ok(success(api.manager.add_spares(&actor, &name, request.devices).await?))
}

async fn remove_vdev_handler(
    State(api): ApiState,
    Extension(actor): Extension<AuthContext>,
    segments: Result<Path<(String, String)>, PathRejection>,
) -> AdminResult<Response> {
    let (name, vdev) = path(segments)?;
    Ok(success(api.manager.remove_vdev(&actor, &name, &vdev).await?))
}

async fn replace_device_handler(
    State(api): ApiState,
    Extension(actor): Extension<AuthContext>,
    name: Result<Path<String>, PathRejection>,
    payload: Result<Json<ReplaceDevice>, JsonRejection>,
) -> AdminResult<Response> {
    let name = path(name)?;
    let request = body(payload)?;
    Ok(success(api.replacer.replace_device(&actor, &name, request).await?))
}

async fn pool_stats_handler(
    State(api): ApiState,
    name: Result<Path<String>, PathRejection>,
    params: Result<Query<LimitParams>, QueryRejection>,
) -> AdminResult<Response> {
    let name = path(name)?;
    let params = query(params)?;
    Ok(success(api.stats.series(&name, params.limit)?))
}

async fn audit_records_handler(
    State(api): ApiState,
    params: Result<Query<LimitParams>, QueryRejection>,
) -> AdminResult<Response> {
    let params = query(params)?;
    let limit = params.limit.unwrap_or(DEFAULT_AUDIT_LIMIT);
    Ok(success(api.manager.audit().records(limit)?))
}

async fn audit_record_handler(
    State(api): ApiState,
    id: Result<Path<u64>, PathRejection>,
) -> AdminResult<Response> {
    let id = path(id)?;
    let record = api
        .manager
        .audit()
        .get(id)?
        .ok_or_else(|| AdminError::NotFound {
            what: format!("audit record {}", id),
        })?;
    Ok(success(record))
}

async fn list_notes_handler(State(api): ApiState) -> Response {
    success(api.notes.list())
}

async fn create_note_handler(
    State(api): ApiState,
    payload: Result<Json<NoteDraft>, JsonRejection>,
) -> AdminResult<Response> {
    let draft = body(payload)?;
    Ok(created(api.notes.create(draft)?))
}

async fn get_note_handler(
    State(api): ApiState,
    id: Result<Path<u64>, PathRejection>,
) -> AdminResult<Response> {
    let id = path(id)?;
    Ok(success(api.notes.get(id)?))
}

async fn update_note_handler(
    State(api): ApiState,
    id: Result<Path<u64>, PathRejection>,
    payload: Result<Json<NoteDraft>, JsonRejection>,
) -> AdminResult<Response> {
    let id = path(id)?;
    let draft = body(payload)?;
    Ok(success(api.notes.update(id, draft)?))
}

async fn delete_note_handler(
    State(api): ApiState,
    id: Result<Path<u64>, PathRejection>,
) -> AdminResult<Response> {
    let id = path(id)?;
    api.notes.delete(id)?;
    Ok(success(serde_json::json!({ "id": id })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit_trail::AuditLogger;
    use crate::mock_executor::MockExecutor;
    use crate::stats::StatsConfig;
    use crate::token_store::{token_hash, IssuedTokenStore};
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use tower::ServiceExt;

    struct Harness {
        router: Router,
        token: String,
        exec: Arc<MockExecutor>,
    }

    fn harness() -> Harness {
        let exec = Arc::new(MockExecutor::new());
        let manager = Arc::new(PoolManager::new(exec.clone(), AuditLogger::in_memory()));
        let stats = Arc::new(StatsCollector::new(manager.clone(), StatsConfig::default()));
        let tokens = Arc::new(IssuedTokenStore::new(b"api-secret"));
        let token = tokens.issue("admin", 3600).unwrap();
        let gate = Arc::new(AuthGate::new(tokens));
        let api = Arc::new(AdminApi::new(
            manager,
            stats,
            gate,
            SocketAddr::from(([127, 0, 0, 1], 0)),
        ));
        Harness {
            router: api.router(),
            token,
            exec,
        }
    }

    impl Harness {
        async fn call(
            &self,
            method: Method,
            uri: &str,
            json: Option<serde_json::Value>,
        ) -> (StatusCode, serde_json::Value) {
            let mut builder = Request::builder()
                .method(method)
                .uri(uri)
                .header(header::AUTHORIZATION, format!("Bearer {}", self.token));
            let body = match json {
                Some(value) => {
                    builder = builder.header(header::CONTENT_TYPE, "application/json");
                    Body::from(value.to_string())
                }
                None => Body::empty(),
            };
            let response = self
                .router
                .clone()
                .oneshot(builder.body(body).unwrap())
                .await
                .unwrap();
            let status = response.status();
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
            (status, value)
        }
    }

    fn tank() -> serde_json::Value {
        serde_json::json!({
            "name": "tank",
            "raidType": "mirror",
            "vdevs": [{ "devices": ["/dev/da0", "/dev/da1"] }]
        })
    }

    #[tokio::test]
    async fn test_login_is_public() {
        let h = harness();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/auth/login")
            .body(Body::empty())
            .unwrap();
        let response = h.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn test_protected_route_requires_credential() {
        let h = harness();
        let request = Request::builder()
            .uri("/api/zfs/pools")
            .body(Body::empty())
            .unwrap();
        let response = h.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
        assert_eq!(response.headers()["x-content-type-options"], "nosniff");

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["error"], "missing_credential");
    }

    #[tokio::test]
    async fn test_hash_query_authenticates() {
        let h = harness();
        let uri = format!("/api/zfs/pools?hash={}", token_hash(&h.token));
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = h.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let request = Request::builder()
            .uri("/api/zfs/pools?hash=feedface")
            .body(Body::empty())
            .unwrap();
        let response = h.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_create_get_and_list_pool() {
        let h = harness();
        let (status, json) = h.call(Method::POST, "/api/zfs/pools", Some(tank())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["status"], "success");
        assert_eq!(json["data"]["vdevs"][0]["name"], "mirror-0");

        let (status, json) = h.call(Method::GET, "/api/zfs/pools/tank", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["health"], "online");

        let (_, json) = h.call(Method::GET, "/api/zfs/pools", None).await;
        assert_eq!(json["data"].as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_undersized_raidz_is_400() {
        let h = harness();
        let spec = serde_json::json!({
            "name": "t2",
            "raidType": "raidz",
            "vdevs": [{ "devices": ["/dev/da2"] }]
        });
        let (status, json) = h.call(Method::POST, "/api/zfs/pools", Some(spec)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "topology_error");
        assert_eq!(json["detail"]["kind"], "undersized_vdev");
        assert!(h.exec.calls().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_body_is_400() {
        let h = harness();
        let (status, json) = h
            .call(Method::POST, "/api/zfs/pools", Some(serde_json::json!({ "vdevs": 3 })))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "invalid_request");
    }

    #[tokio::test]
    async fn test_replace_device_conflict_is_409() {
        let h = harness();
        h.call(Method::POST, "/api/zfs/pools", Some(tank())).await;
        let (status, json) = h
            .call(
                Method::POST,
                "/api/zfs/pools/tank/replace-device",
                Some(serde_json::json!({ "old": "/dev/da0", "new": "/dev/da1" })),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["error"], "device_already_in_use");

        let (status, json) = h
            .call(
                Method::POST,
                "/api/zfs/pools/tank/replace-device",
                Some(serde_json::json!({ "old": "/dev/da0", "new": "/dev/da4" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["states"][3], "complete");
    }

    #[tokio::test]
    async fn test_destroy_missing_pool_is_404() {
        let h = harness();
        let (status, json) = h
            .call(Method::DELETE, "/api/zfs/pools/ghost?force=true", None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "pool_not_found");
    }

    #[tokio::test]
    async fn test_audit_records_newest_first() {
        let h = harness();
        h.call(Method::POST, "/api/zfs/pools", Some(tank())).await;
        h.call(Method::POST, "/api/zfs/pools/tank/export", None).await;

        let (status, json) = h.call(Method::GET, "/api/info/audit-records", None).await;
        assert_eq!(status, StatusCode::OK);
        let records = json["data"].as_array().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["action"], "pool_export");
        assert_eq!(records[1]["action"], "pool_create");
        assert_eq!(records[0]["actor"], "admin");

        let id = records[1]["id"].as_u64().unwrap();
        let (status, json) = h
            .call(Method::GET, &format!("/api/info/audit-records/{}", id), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["target"], "tank");

        let (status, _) = h.call(Method::GET, "/api/info/audit-records/999", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_notes_crud() {
        let h = harness();
        let (status, json) = h
            .call(
                Method::POST,
                "/api/info/notes",
                Some(serde_json::json!({ "title": "rack 4", "body": "bay 2 loose" })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = json["data"]["id"].as_u64().unwrap();

        let (status, json) = h
            .call(
                Method::PUT,
                &format!("/api/info/notes/{}", id),
                Some(serde_json::json!({ "title": "rack 4b" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["title"], "rack 4b");

        let (status, _) = h
            .call(Method::DELETE, &format!("/api/info/notes/{}", id), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = h
            .call(Method::GET, &format!("/api/info/notes/{}", id), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stats_unknown_pool_is_404() {
        let h = harness();
        let (status, _) = h.call(Method::GET, "/api/zfs/pools/ghost/stats", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bad_path_id_is_enveloped_400() {
        let h = harness();
        for uri in ["/api/info/audit-records/abc", "/api/info/notes/-3"] {
            let (status, json) = h.call(Method::GET, uri, None).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
            assert_eq!(json["status"], "error");
            assert_eq!(json["error"], "invalid_request");
        }
    }

    #[tokio::test]
    async fn test_bad_query_is_enveloped_400() {
        let h = harness();
        h.call(Method::POST, "/api/zfs/pools", Some(tank())).await;

        let (status, json) = h
            .call(Method::DELETE, "/api/zfs/pools/tank?force=yes", None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "invalid_request");
        assert_eq!(h.exec.call_count("destroy:"), 0);

        let (status, json) = h
            .call(Method::GET, "/api/info/audit-records?limit=many", None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["status"], "error");
    }

    #[tokio::test]
    async fn test_option_like_spare_is_400() {
        let h = harness();
        h.call(Method::POST, "/api/zfs/pools", Some(tank())).await;
        let (status, json) = h
            .call(
                Method::POST,
                "/api/zfs/pools/tank/spares",
                Some(serde_json::json!({ "devices": ["--force"] })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["detail"]["kind"], "invalid_device_path");
        assert_eq!(h.exec.call_count("add-spares:"), 0);
    }
}
