use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use shared::protocol::API_PREFIX;
use shared::types::ServiceEntry;
use crate::manager::{RequestError, ZeroconfHandle};
use crate::mdns::publisher::RegistrationRequest;

#[derive(Clone)]
pub struct AppState {
    pub zeroconf: ZeroconfHandle,
    pub digest_rx: watch::Receiver<String>,
}

#[derive(Serialize)]
pub struct ServicesResponse {
    pub generated_at: DateTime<Utc>,
    pub digest: String,
    pub services: Vec<ServiceEntry>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct PublishedService {
    pub name: String,
    /// Name on the wire after collision renaming
    pub effective_name: String,
}

#[derive(Deserialize)]
pub struct ServiceQuery {
    #[serde(rename = "type")]
    pub service_type: Option<String>,
}

type ApiError = (StatusCode, String);

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/services", get(get_services))
        .route("/services/hash", get(get_hash))
        .route("/published", get(get_published).post(post_published))
        .route("/published/:name", delete(delete_published));

    Router::new().nest(API_PREFIX, api).with_state(state)
}

fn status_for(err: &RequestError) -> StatusCode {
    match err {
        RequestError::Stopped => StatusCode::INTERNAL_SERVER_ERROR,
        RequestError::Zeroconf(e) if e.is_configuration() => StatusCode::CONFLICT,
        RequestError::Zeroconf(_) => StatusCode::BAD_GATEWAY,
    }
}

fn api_error(context: &str, err: RequestError) -> ApiError {
    let status = status_for(&err);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("{}: {}", context, err);
    } else {
        tracing::info!("{}: {}", context, err);
    }
    (status, err.to_string())
}

async fn get_services(
    State(state): State<AppState>,
    Query(params): Query<ServiceQuery>,
) -> Result<Json<ServicesResponse>, ApiError> {
    let services = state
        .zeroconf
        .entries(params.service_type)
        .await
        .map_err(|e| api_error("Failed to query services", e))?;

    Ok(Json(ServicesResponse {
        generated_at: Utc::now(),
        digest: state.digest_rx.borrow().clone(),
        services,
    }))
}

async fn get_hash(State(state): State<AppState>) -> String {
    state.digest_rx.borrow().clone()
}

async fn get_published(State(state): State<AppState>) -> Result<Json<Vec<PublishedService>>, ApiError> {
    let published = state
        .zeroconf
        .published()
        .await
        .map_err(|e| api_error("Failed to list published services", e))?;

    Ok(Json(
        published
            .into_iter()
            .map(|(name, effective_name)| PublishedService { name, effective_name })
            .collect(),
    ))
}

async fn post_published(
    State(state): State<AppState>,
    Json(request): Json<RegistrationRequest>,
) -> Result<(StatusCode, Json<PublishedService>), ApiError> {
    let name = request.name.clone();
    let effective_name = state
        .zeroconf
        .register(request)
        .await
        .map_err(|e| api_error("Failed to publish service", e))?;

    Ok((StatusCode::CREATED, Json(PublishedService { name, effective_name })))
}

async fn delete_published(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    let removed = state
        .zeroconf
        .unregister(&name)
        .await
        .map_err(|e| api_error("Failed to unpublish service", e))?;

    Ok(if removed { StatusCode::NO_CONTENT } else { StatusCode::NOT_FOUND })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ErrorCode;
    use crate::error::ZeroconfError;

    fn detached_state() -> AppState {
        let (_tx, digest_rx) = watch::channel("abc".to_string());
        AppState {
            zeroconf: ZeroconfHandle::detached(),
            digest_rx,
        }
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(status_for(&RequestError::Stopped), StatusCode::INTERNAL_SERVER_ERROR);
        let duplicate = RequestError::Zeroconf(ZeroconfError::Configuration("taken".to_string()));
        assert_eq!(status_for(&duplicate), StatusCode::CONFLICT);
        let exhausted = RequestError::Zeroconf(ZeroconfError::RegistrationFailed {
            name: "X".to_string(),
            attempts: 33,
        });
        assert_eq!(status_for(&exhausted), StatusCode::BAD_GATEWAY);
        let engine = RequestError::Zeroconf(ZeroconfError::Engine {
            operation: "register",
            code: ErrorCode::Unknown(-65540),
        });
        assert_eq!(status_for(&engine), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_hash_served_from_watch() {
        assert_eq!(get_hash(State(detached_state())).await, "abc");
    }

    #[tokio::test]
    async fn test_routes_mounted_under_api_prefix() {
        use axum::body::{to_bytes, Body};
        use axum::http::Request;
        use tower::ServiceExt;

        let response = router(detached_state())
            .oneshot(Request::get(format!("{}/services/hash", API_PREFIX)).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"abc");

        let response = router(detached_state())
            .oneshot(Request::get("/services/hash").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stopped_driver_is_server_error() {
        let result = get_services(State(detached_state()), Query(ServiceQuery { service_type: None })).await;
        let (status, _) = result.err().unwrap();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        let result = delete_published(State(detached_state()), Path("x".to_string())).await;
        assert_eq!(result.unwrap_err().0, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
