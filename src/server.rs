//! HTTP surface
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `POST /auth/validate` | per-request authentication and authorization |
//! | `POST /admin/permissions/spec/invalidate` | permission spec changed |
//! | `POST /admin/permissions/users/{tenant_id}/{user_id}/invalidate` | one user's permissions changed |
//! | `POST /admin/permissions/tenants/{tenant_id}/invalidate` | every user of a tenant changed |
//! | `POST /admin/keys/refresh` | signing keys rotated at the origin |
//! | `GET /health` | liveness |
//!
//! Admin routes require `Authorization: Bearer <admin token>`.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, Request, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::gatekeeper::{GateRequest, Gatekeeper};
use crate::{Error, Result};

/// Shared handler state
pub struct AppState {
    /// Request-time coordinators
    pub gatekeeper: Gatekeeper,
    /// Resolved admin bearer token; admin routes are closed while `None`
    pub admin_token: Option<String>,
}

/// `POST /auth/validate` body
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ValidateBody {
    /// Access token; falls back to the `Authorization` header
    pub token: Option<String>,
    /// Refresh credential for transparent rotation
    pub refresh_token: Option<String>,
    /// Path of the proxied request
    pub path: String,
    /// Method of the proxied request
    pub method: String,
}

/// Create the router
pub fn create_router(state: Arc<AppState>, request_timeout: Duration) -> Router {
    let admin = Router::new()
        .route("/admin/permissions/spec/invalidate", post(invalidate_spec_handler))
        .route(
            "/admin/permissions/users/{tenant_id}/{user_id}/invalidate",
            post(invalidate_user_handler),
        )
        .route(
            "/admin/permissions/tenants/{tenant_id}/invalidate",
            post(invalidate_tenant_handler),
        )
        .route("/admin/keys/refresh", post(refresh_keys_handler))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), admin_auth_middleware));

    Router::new()
        .route("/health", get(health_handler))
        .route("/auth/validate", post(validate_handler))
        .merge(admin)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

/// Bind and serve until a shutdown signal arrives.
///
/// `shutdown_tx` is fired once the signal is received so background tasks can
/// stop too.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn serve(
    config: &Config,
    gatekeeper: Gatekeeper,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> Result<()> {
    let admin_token = config.admin.resolve_bearer_token();
    if admin_token.is_none() {
        warn!("No admin bearer token configured - admin routes answer 503");
    }

    let state = Arc::new(AppState {
        gatekeeper,
        admin_token,
    });
    let app = create_router(state, config.server.request_timeout);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;

    info!("============================================================");
    info!("GATEWAY AUTH v{}", env!("CARGO_PKG_VERSION"));
    info!("============================================================");
    info!(addr = %addr, origin = %config.origin.base_url, "Listening");
    info!(
        key_ttl = ?config.keys.ttl,
        coalesce = config.keys.coalesce_fetches,
        spec_ttl = ?config.permissions.spec_ttl,
        hash_ttl = ?config.permissions.hash_ttl,
        lock_lease = ?config.refresh.lock_lease,
        "Coordinator settings"
    );

    let mut stopping = shutdown_tx.subscribe();
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(shutdown_tx));
    drain_within(
        server.into_future(),
        async move {
            let _ = stopping.recv().await;
        },
        config.server.shutdown_timeout,
    )
    .await
}

/// Run `server` to completion, but once `stopping` resolves give it at most
/// `grace` to finish in-flight requests.
async fn drain_within<S, T>(server: S, stopping: T, grace: Duration) -> Result<()>
where
    S: Future<Output = std::io::Result<()>>,
    T: Future<Output = ()>,
{
    tokio::pin!(server);
    tokio::select! {
        biased;
        result = &mut server => return result.map_err(|e| Error::Internal(e.to_string())),
        () = stopping => {}
    }

    match tokio::time::timeout(grace, server).await {
        Ok(result) => result.map_err(|e| Error::Internal(e.to_string())),
        Err(_) => {
            warn!(grace = ?grace, "In-flight requests still running after shutdown timeout, abandoning them");
            Ok(())
        }
    }
}

/// Resolve on Ctrl+C or SIGTERM, then notify subscribers
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn validate_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ValidateBody>,
) -> Response {
    let access_token = body.token.or_else(|| bearer_token(&headers).map(ToString::to_string));
    let request = GateRequest {
        access_token,
        refresh_token: body.refresh_token,
        path: body.path,
        method: body.method,
    };

    match state.gatekeeper.authorize_request(&request).await {
        Ok(authorization) => {
            debug!(path = %request.path, method = %request.method, "Request authorized");
            let mut payload = json!({ "authorized": true });
            if let (Some(map), Ok(serde_json::Value::Object(detail))) =
                (payload.as_object_mut(), serde_json::to_value(&authorization))
            {
                map.extend(detail);
            }
            (StatusCode::OK, Json(payload)).into_response()
        }
        Err(e) => rejection_response(&e),
    }
}

/// Map a rejection to a status code. Denials carry no detail beyond the kind.
fn rejection_response(error: &Error) -> Response {
    let status = match error {
        e if e.is_unauthenticated() => StatusCode::UNAUTHORIZED,
        Error::PermissionDenied | Error::PermissionSpecNotFound { .. } => StatusCode::FORBIDDEN,
        Error::LockAcquisitionFailed(_) => StatusCode::CONFLICT,
        Error::KeyRefreshFailed(_)
        | Error::UpstreamRefreshFailed(_)
        | Error::PermissionLookupFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        warn!(kind = ?error.kind(), error = %error, "Validation failed");
    } else {
        debug!(kind = ?error.kind(), "Request rejected");
    }

    let body = Json(json!({
        "authorized": false,
        "error": error.kind(),
    }));
    if status == StatusCode::UNAUTHORIZED {
        (status, [(header::WWW_AUTHENTICATE, "Bearer")], body).into_response()
    } else {
        (status, body).into_response()
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(str::trim)
}

/// Admin authentication middleware
async fn admin_auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.admin_token.as_deref() else {
        return admin_error(StatusCode::SERVICE_UNAVAILABLE, "Admin API not configured");
    };

    let presented = bearer_token(request.headers()).unwrap_or_default();
    if bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
        next.run(request).await
    } else {
        warn!(path = %request.uri().path(), "Rejected admin request");
        admin_error(StatusCode::UNAUTHORIZED, "Invalid admin token")
    }
}

fn admin_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn store_failure(e: &Error) -> Response {
    warn!(error = %e, "Admin operation failed");
    admin_error(StatusCode::SERVICE_UNAVAILABLE, "Store unavailable")
}

async fn invalidate_spec_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.gatekeeper.permissions().invalidate_spec().await {
        Ok(()) => {
            info!("Permission spec invalidated by admin signal");
            Json(json!({ "invalidated": "permission_spec" })).into_response()
        }
        Err(e) => store_failure(&e),
    }
}

async fn invalidate_user_handler(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, user_id)): Path<(String, String)>,
) -> Response {
    match state
        .gatekeeper
        .permissions()
        .invalidate_user(&tenant_id, &user_id)
        .await
    {
        Ok(()) => {
            info!(tenant_id = %tenant_id, user_id = %user_id, "User permissions invalidated by admin signal");
            Json(json!({
                "invalidated": "permission_hash",
                "tenant_id": tenant_id,
                "user_id": user_id,
            }))
            .into_response()
        }
        Err(e) => store_failure(&e),
    }
}

async fn invalidate_tenant_handler(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
) -> Response {
    match state.gatekeeper.permissions().invalidate_tenant(&tenant_id).await {
        Ok(removed) => {
            info!(tenant_id = %tenant_id, removed, "Tenant permissions invalidated by admin signal");
            Json(json!({
                "invalidated": "permission_hash",
                "tenant_id": tenant_id,
                "removed": removed,
            }))
            .into_response()
        }
        Err(e) => store_failure(&e),
    }
}

async fn refresh_keys_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.gatekeeper.keys().refresh_all_keys().await {
        Ok(count) => {
            info!(count, "Public keys refreshed by admin signal");
            Json(json!({ "keys": count })).into_response()
        }
        Err(e) => {
            warn!(error = %e, "Key refresh failed");
            admin_error(StatusCode::SERVICE_UNAVAILABLE, "Key refresh failed")
        }
    }
}
