//! Admin HTTP surface (§4.6) — promoted from an external collaborator to
//! an in-process component (SPEC_FULL.md §4.6): a small `axum` router that
//! reads and writes the same desired-state table the supervisor watches,
//! so a `POST` here is observed by the supervisor on its very next tick.
//!
//! Grounded on `ZingerLittleBee-EXLO`'s `tunnl::management` for the
//! `Router`/`State<Arc<_>>`/`tower_http::trace::TraceLayer` shape, with
//! routes and status codes taken verbatim from spec.md §4.6 rather than
//! that file's own endpoint set.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::tunnel::{DesiredState, Tunnel};

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn not_found(domain: &str) -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: format!("no such tunnel: {domain}"),
        }),
    )
}

/// `GET /tunnels/` → `{domain: tunnel-dict}` (§4.6).
async fn list_tunnels(State(desired): State<Arc<DesiredState>>) -> Json<HashMap<String, Tunnel>> {
    Json(desired.snapshot().await)
}

/// `GET /tunnels/{domain}` → `200` + tunnel-dict, or `404`.
async fn get_tunnel(
    State(desired): State<Arc<DesiredState>>,
    Path(domain): Path<String>,
) -> Result<Json<Tunnel>, (StatusCode, Json<ErrorBody>)> {
    desired
        .get(&domain)
        .await
        .map(Json)
        .ok_or_else(|| not_found(&domain))
}

/// `POST /tunnels/` with an object body → replace semantics. Status is
/// `201` iff this call itself changed the table, else `200` — reproduced
/// verbatim per the resolved Open Question in §9, even though a body that
/// normalizes to the table's current contents also returns `200`. Reads
/// `replace`'s own return value rather than the shared `changed` signal:
/// stealing that signal here would swallow a concurrent IPC `add`/`del`
/// that lands between a pre-clear and the supervisor's next reconciliation
/// pass, since `take_changed` is the supervisor's single-owner consume op
/// (§4.2, §4.4 step 1).
async fn replace_tunnels(
    State(desired): State<Arc<DesiredState>>,
    Json(body): Json<HashMap<String, Tunnel>>,
) -> StatusCode {
    if desired.replace(body).await {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    }
}

/// `POST /tunnels/{domain}` with a single-tunnel body → set semantics,
/// same 201/200 rule as `replace_tunnels`.
async fn set_tunnel(
    State(desired): State<Arc<DesiredState>>,
    Path(domain): Path<String>,
    Json(mut body): Json<Tunnel>,
) -> StatusCode {
    body.domain = domain;
    if desired.set(body).await {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    }
}

/// `DELETE /tunnels/` → clear; `204`.
async fn clear_tunnels(State(desired): State<Arc<DesiredState>>) -> StatusCode {
    desired.clear().await;
    StatusCode::NO_CONTENT
}

/// `DELETE /tunnels/{domain}` → delete; `204` or `404`.
async fn delete_tunnel(
    State(desired): State<Arc<DesiredState>>,
    Path(domain): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    match desired.delete(&domain).await {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None => Err(not_found(&domain)),
    }
}

pub fn router(desired: Arc<DesiredState>) -> Router {
    Router::new()
        .route("/tunnels/", get(list_tunnels).post(replace_tunnels).delete(clear_tunnels))
        .route("/tunnels/{domain}", get(get_tunnel).post(set_tunnel).delete(delete_tunnel))
        .layer(TraceLayer::new_for_http())
        .with_state(desired)
}

/// Bind and serve the admin HTTP router until the process exits. An empty
/// `addr` means admin HTTP is disabled (§6, `ADMIN_HTTP_ADDR=`); callers
/// should not invoke this in that case.
pub async fn serve(addr: &str, desired: Arc<DesiredState>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "admin HTTP listening");
    axum::serve(listener, router(desired)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn body_json(tunnel: &Tunnel) -> String {
        serde_json::to_string(tunnel).unwrap()
    }

    #[tokio::test]
    async fn get_missing_domain_is_404() {
        let desired = Arc::new(DesiredState::new());
        let app = router(desired);
        let res = app
            .oneshot(Request::get("/tunnels/foo.com").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn set_new_tunnel_is_201() {
        let desired = Arc::new(DesiredState::new());
        let app = router(desired);
        let tunnel = Tunnel::new("foo.com", "localhost", 1337);
        let res = app
            .oneshot(
                Request::post("/tunnels/foo.com")
                    .header("content-type", "application/json")
                    .body(Body::from(body_json(&tunnel)))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn re_setting_identical_tunnel_is_200() {
        let desired = Arc::new(DesiredState::new());
        desired.set(Tunnel::new("foo.com", "localhost", 1337)).await;
        desired.take_changed().await;
        let app = router(desired);
        let tunnel = Tunnel::new("foo.com", "localhost", 1337);
        let res = app
            .oneshot(
                Request::post("/tunnels/foo.com")
                    .header("content-type", "application/json")
                    .body(Body::from(body_json(&tunnel)))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn delete_existing_then_missing() {
        let desired = Arc::new(DesiredState::new());
        desired.set(Tunnel::new("foo.com", "localhost", 1337)).await;
        let app = router(desired);

        let res = app
            .clone()
            .oneshot(Request::delete("/tunnels/foo.com").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);

        let res = app
            .oneshot(Request::delete("/tunnels/foo.com").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_reflects_table_contents() {
        let desired = Arc::new(DesiredState::new());
        desired.set(Tunnel::new("foo.com", "localhost", 1337)).await;
        let app = router(desired);
        let res = app
            .oneshot(Request::get("/tunnels/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }
}
