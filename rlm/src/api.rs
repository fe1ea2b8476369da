//! HTTP surface of the lease service.
//!
//! | Method | Path                   | Body / query                                   |
//! |--------|------------------------|------------------------------------------------|
//! | POST   | `/locks/acquire`       | `{ resourceId, scope?, type }`                 |
//! | POST   | `/locks/release`       | same, JSON, url-encoded or multipart (beacons) |
//! | GET    | `/locks/status`        | `?resourceId=&scope=`                          |
//! | GET    | `/locks/debug`         | `?resourceId=` (admin)                         |
//! | POST   | `/locks/force-release` | `{ resourceId, scope, action }`                |
//! | GET    | `/health`              |                                                |

use crate::{
    auth::{authorize, AccessPolicy, PrincipalResolver},
    lease::{LeaseScope, LeaseType, ScopeSelector},
    service::{LeaseHistory, LeaseService, LeaseStatus, ReleaseOutcome},
    time::Timestamp,
    Error, PrincipalId, ResourceId,
};
use axum::{
    async_trait,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        FromRequest, Multipart, Query, Request, State,
    },
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use std::{sync::Arc, time::Instant};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

#[derive(Debug, Clone)]
pub struct AppState {
    pub service: LeaseService,
    pub resolver: Arc<dyn PrincipalResolver>,
    pub policy: Arc<dyn AccessPolicy>,
    pub started: Instant,
}

impl AppState {
    pub fn new(
        service: LeaseService,
        resolver: Arc<dyn PrincipalResolver>,
        policy: Arc<dyn AccessPolicy>,
    ) -> Self {
        Self {
            service,
            resolver,
            policy,
            started: Instant::now(),
        }
    }

    /// Checks the already resolved caller may touch `resource`.
    async fn admit(&self, principal: &PrincipalId, resource: &ResourceId) -> Result<(), ApiError> {
        authorize(self.policy.as_ref(), principal, resource).await?;
        Ok(())
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/locks/acquire", post(acquire))
        .route("/locks/release", post(release))
        .route("/locks/status", get(status))
        .route("/locks/debug", get(debug_history))
        .route("/locks/force-release", post(force_release))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error half of every handler.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            Error::LeaseConflict { .. } => StatusCode::CONFLICT,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::PermissionDenied { .. } => StatusCode::FORBIDDEN,
            Error::Unauthenticated => StatusCode::UNAUTHORIZED,
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::StoreUnavailable(_) | Error::Timeout => StatusCode::SERVICE_UNAVAILABLE,
            Error::Io(_) | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self.0 {
            Error::LeaseConflict {
                scope,
                holder,
                acquired_at,
                expires_at,
                ..
            } => json!({
                "error": "Exclusive lock already exists",
                "scope": scope,
                "holder": holder,
                "acquiredAt": acquired_at,
                "expiresAt": expires_at,
            }),
            Error::NotFound(_)
            | Error::PermissionDenied { .. }
            | Error::Unauthenticated
            | Error::InvalidRequest(_) => json!({ "error": self.0.to_string() }),
            other => {
                // 5xx bodies stay generic.
                error!("Lease request failed: {}", other);
                json!({ "error": "Lease service temporarily unavailable" })
            }
        };
        (status, Json(body)).into_response()
    }
}

/// Body decoded from JSON, a url-encoded form or a multipart form, whichever
/// was sent. Multipart fields are read as text.
pub struct JsonOrForm<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for JsonOrForm<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if content_type.starts_with("application/json") {
            Json::<T>::from_request(req, state)
                .await
                .map(|Json(body)| Self(body))
                .map_err(|e| Error::InvalidRequest(e.body_text()).into())
        } else if content_type.starts_with("multipart/form-data") {
            let mut multipart = Multipart::from_request(req, state)
                .await
                .map_err(|e| Error::InvalidRequest(e.body_text()))?;
            let mut fields = serde_json::Map::new();
            while let Some(field) = multipart
                .next_field()
                .await
                .map_err(|e| Error::InvalidRequest(e.body_text()))?
            {
                let Some(name) = field.name().map(str::to_string) else {
                    continue;
                };
                let value = field
                    .text()
                    .await
                    .map_err(|e| Error::InvalidRequest(e.body_text()))?;
                fields.insert(name, serde_json::Value::String(value));
            }
            serde_json::from_value(serde_json::Value::Object(fields))
                .map(Self)
                .map_err(|e| Error::InvalidRequest(e.to_string()).into())
        } else {
            Form::<T>::from_request(req, state)
                .await
                .map(|Form(body)| Self(body))
                .map_err(|e| Error::InvalidRequest(e.body_text()).into())
        }
    }
}

fn invalid_query(rejection: QueryRejection) -> ApiError {
    ApiError(Error::InvalidRequest(rejection.body_text()))
}

fn parse_scope(raw: Option<&str>) -> Result<LeaseScope, Error> {
    raw.map_or(Ok(LeaseScope::default()), str::parse)
}

fn require_resource(raw: &str) -> Result<ResourceId, Error> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        Err(Error::InvalidRequest("missing resourceId".to_string()))
    } else {
        Ok(ResourceId::from(trimmed))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRequest {
    pub resource_id: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(rename = "type", alias = "lockType")]
    pub lease_type: String,
}

impl LeaseRequest {
    fn parse(&self) -> Result<(ResourceId, LeaseScope, LeaseType), Error> {
        Ok((
            require_resource(&self.resource_id)?,
            parse_scope(self.scope.as_deref())?,
            self.lease_type.parse()?,
        ))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquireResponse {
    pub acquired: bool,
    pub renewed: bool,
    pub acquired_at: Timestamp,
    pub expires_at: Timestamp,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseResponse {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub released: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub already_released: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusQuery {
    pub resource_id: String,
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugQuery {
    pub resource_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ForceReleaseAction {
    /// Every holder's leases; admin only.
    ForceReleaseAll,
    /// Only the caller's own leases.
    ForceReleaseUser,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceReleaseRequest {
    pub resource_id: String,
    pub scope: ScopeSelector,
    pub action: ForceReleaseAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceReleaseResponse {
    pub released_count: usize,
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "uptimeSeconds": state.started.elapsed().as_secs(),
    }))
}

async fn acquire(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<JsonOrForm<LeaseRequest>, ApiError>,
) -> Result<Json<AcquireResponse>, ApiError> {
    let principal = state.resolver.resolve(&headers)?;
    let JsonOrForm(request) = body?;
    let (resource, scope, lease_type) = request.parse()?;
    state.admit(&principal, &resource).await?;

    let acquired = state
        .service
        .acquire(&resource, scope, lease_type, &principal)
        .await?;
    Ok(Json(AcquireResponse {
        acquired: acquired.acquired,
        renewed: acquired.renewed,
        acquired_at: acquired.lease.acquired_at,
        expires_at: acquired.expires_at,
    }))
}

async fn release(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<JsonOrForm<LeaseRequest>, ApiError>,
) -> Result<Json<ReleaseResponse>, ApiError> {
    let principal = state.resolver.resolve(&headers)?;
    let JsonOrForm(request) = body?;
    let (resource, scope, lease_type) = request.parse()?;
    state.admit(&principal, &resource).await?;

    let outcome = state
        .service
        .release(&resource, scope, lease_type, &principal)
        .await?;
    Ok(Json(ReleaseResponse {
        released: outcome.was_released(),
        already_released: outcome == ReleaseOutcome::AlreadyReleased,
    }))
}

async fn status(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<StatusQuery>, QueryRejection>,
) -> Result<Json<LeaseStatus>, ApiError> {
    let principal = state.resolver.resolve(&headers)?;
    let Query(query) = query.map_err(invalid_query)?;
    let resource = require_resource(&query.resource_id)?;
    let scope = parse_scope(query.scope.as_deref())?;
    state.admit(&principal, &resource).await?;

    Ok(Json(state.service.status(&resource, scope, &principal).await?))
}

async fn debug_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<DebugQuery>, QueryRejection>,
) -> Result<Json<LeaseHistory>, ApiError> {
    let principal = state.resolver.resolve(&headers)?;
    let Query(query) = query.map_err(invalid_query)?;
    let resource = require_resource(&query.resource_id)?;
    if !state.policy.is_admin(&principal).await? {
        return Err(Error::PermissionDenied { principal, resource }.into());
    }

    Ok(Json(state.service.history(&resource, &principal).await?))
}

async fn force_release(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ForceReleaseRequest>, JsonRejection>,
) -> Result<Json<ForceReleaseResponse>, ApiError> {
    let principal = state.resolver.resolve(&headers)?;
    let Json(request) = body.map_err(|e| ApiError(Error::InvalidRequest(e.body_text())))?;
    let resource = require_resource(&request.resource_id)?;

    let released_count = match request.action {
        ForceReleaseAction::ForceReleaseAll => {
            if !state.policy.is_admin(&principal).await? {
                warn!("{} attempted force release on {} without admin rights", principal, resource);
                return Err(Error::PermissionDenied { principal, resource }.into());
            }
            state.service.force_release(&resource, request.scope).await?
        }
        ForceReleaseAction::ForceReleaseUser => {
            state.admit(&principal, &resource).await?;
            state
                .service
                .force_release_own(&resource, request.scope, &principal)
                .await?
        }
    };

    Ok(Json(ForceReleaseResponse { released_count }))
}
