use crate::{
    api::{
        AcquireResponse, ForceReleaseAction, ForceReleaseRequest, ForceReleaseResponse, LeaseRequest,
        ReleaseResponse,
    },
    auth::PRINCIPAL_HEADER,
    lease::{LeaseScope, LeaseType, ScopeSelector},
    service::{LeaseHistory, LeaseService, LeaseStatus},
    time::Timestamp,
    Error, PrincipalId, ResourceId, Result,
};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// What a lease controller needs from the lease service.
#[async_trait]
pub trait LeaseApi: Send + Sync + std::fmt::Debug {
    async fn status(&self, resource: &ResourceId, scope: LeaseScope) -> Result<LeaseStatus>;

    /// `Err(LeaseConflict)` when another holder has the EXCLUSIVE lease.
    async fn acquire(
        &self,
        resource: &ResourceId,
        scope: LeaseScope,
        lease_type: LeaseType,
    ) -> Result<AcquireResponse>;

    async fn release(
        &self,
        resource: &ResourceId,
        scope: LeaseScope,
        lease_type: LeaseType,
    ) -> Result<ReleaseResponse>;

    /// One-way release signal. Returns immediately; delivery is not observed.
    fn beacon_release(&self, resource: &ResourceId, scope: LeaseScope, lease_type: LeaseType);

    /// The principal this transport speaks for.
    fn principal(&self) -> &PrincipalId;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConflictBody {
    holder: PrincipalId,
    acquired_at: Timestamp,
    expires_at: Timestamp,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Talks to `rlm-server` over HTTP.
#[derive(Debug, Clone)]
pub struct HttpLeaseApi {
    http: reqwest::Client,
    base_url: String,
    principal: PrincipalId,
}

impl HttpLeaseApi {
    pub fn new(base_url: impl Into<String>, principal: PrincipalId, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Other(e.into()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            principal,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn body(resource: &ResourceId, scope: LeaseScope, lease_type: LeaseType) -> LeaseRequest {
        LeaseRequest {
            resource_id: resource.to_string(),
            scope: Some(scope.as_str().to_string()),
            lease_type: lease_type.as_str().to_string(),
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        &self,
        resource: &ResourceId,
        scope: LeaseScope,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(transport_error);
        }

        if status == StatusCode::CONFLICT {
            let body: ConflictBody = response.json().await.map_err(transport_error)?;
            return Err(Error::LeaseConflict {
                resource: resource.clone(),
                scope,
                holder: body.holder,
                acquired_at: body.acquired_at,
                expires_at: body.expires_at,
            });
        }

        let message = response
            .json::<ErrorBody>()
            .await
            .map(|body| body.error)
            .unwrap_or_else(|_| status.to_string());
        Err(match status {
            StatusCode::UNAUTHORIZED => Error::Unauthenticated,
            StatusCode::FORBIDDEN => Error::PermissionDenied {
                principal: self.principal.clone(),
                resource: resource.clone(),
            },
            StatusCode::NOT_FOUND => Error::NotFound(message),
            StatusCode::BAD_REQUEST => Error::InvalidRequest(message),
            _ => Error::StoreUnavailable(message),
        })
    }
}

impl HttpLeaseApi {
    /// Full lease history of a resource. Admin only.
    pub async fn history(&self, resource: &ResourceId) -> Result<LeaseHistory> {
        let response = self
            .http
            .get(self.url("/locks/debug"))
            .header(PRINCIPAL_HEADER, self.principal.as_str())
            .query(&[("resourceId", resource.as_str())])
            .send()
            .await
            .map_err(transport_error)?;
        self.decode(resource, LeaseScope::default(), response).await
    }

    pub async fn force_release(
        &self,
        resource: &ResourceId,
        scope: ScopeSelector,
        action: ForceReleaseAction,
    ) -> Result<usize> {
        let body = ForceReleaseRequest {
            resource_id: resource.to_string(),
            scope,
            action,
        };
        let response = self
            .http
            .post(self.url("/locks/force-release"))
            .header(PRINCIPAL_HEADER, self.principal.as_str())
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let released: ForceReleaseResponse = self
            .decode(resource, LeaseScope::default(), response)
            .await?;
        Ok(released.released_count)
    }
}

fn transport_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout
    } else {
        Error::StoreUnavailable(err.to_string())
    }
}

#[async_trait]
impl LeaseApi for HttpLeaseApi {
    async fn status(&self, resource: &ResourceId, scope: LeaseScope) -> Result<LeaseStatus> {
        let response = self
            .http
            .get(self.url("/locks/status"))
            .header(PRINCIPAL_HEADER, self.principal.as_str())
            .query(&[("resourceId", resource.as_str()), ("scope", scope.as_str())])
            .send()
            .await
            .map_err(transport_error)?;
        self.decode(resource, scope, response).await
    }

    async fn acquire(
        &self,
        resource: &ResourceId,
        scope: LeaseScope,
        lease_type: LeaseType,
    ) -> Result<AcquireResponse> {
        let response = self
            .http
            .post(self.url("/locks/acquire"))
            .header(PRINCIPAL_HEADER, self.principal.as_str())
            .json(&Self::body(resource, scope, lease_type))
            .send()
            .await
            .map_err(transport_error)?;
        self.decode(resource, scope, response).await
    }

    async fn release(
        &self,
        resource: &ResourceId,
        scope: LeaseScope,
        lease_type: LeaseType,
    ) -> Result<ReleaseResponse> {
        let response = self
            .http
            .post(self.url("/locks/release"))
            .header(PRINCIPAL_HEADER, self.principal.as_str())
            .json(&Self::body(resource, scope, lease_type))
            .send()
            .await
            .map_err(transport_error)?;
        self.decode(resource, scope, response).await
    }

    fn beacon_release(&self, resource: &ResourceId, scope: LeaseScope, lease_type: LeaseType) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime left for release beacon on {}/{}", resource, scope);
            return;
        };
        let request = self
            .http
            .post(self.url("/locks/release"))
            .header(PRINCIPAL_HEADER, self.principal.as_str())
            .form(&Self::body(resource, scope, lease_type));
        let target = format!("{resource}/{scope}");
        runtime.spawn(async move {
            if let Err(e) = request.send().await {
                debug!("Release beacon for {} lost: {}", target, e);
            }
        });
    }

    fn principal(&self) -> &PrincipalId {
        &self.principal
    }
}

/// Calls a [`LeaseService`] in the same process, as one principal.
#[derive(Debug, Clone)]
pub struct LocalLeaseApi {
    service: LeaseService,
    principal: PrincipalId,
}

impl LocalLeaseApi {
    pub fn new(service: LeaseService, principal: PrincipalId) -> Self {
        Self { service, principal }
    }
}

#[async_trait]
impl LeaseApi for LocalLeaseApi {
    async fn status(&self, resource: &ResourceId, scope: LeaseScope) -> Result<LeaseStatus> {
        self.service.status(resource, scope, &self.principal).await
    }

    async fn acquire(
        &self,
        resource: &ResourceId,
        scope: LeaseScope,
        lease_type: LeaseType,
    ) -> Result<AcquireResponse> {
        let acquired = self
            .service
            .acquire(resource, scope, lease_type, &self.principal)
            .await?;
        Ok(AcquireResponse {
            acquired: acquired.acquired,
            renewed: acquired.renewed,
            acquired_at: acquired.lease.acquired_at,
            expires_at: acquired.expires_at,
        })
    }

    async fn release(
        &self,
        resource: &ResourceId,
        scope: LeaseScope,
        lease_type: LeaseType,
    ) -> Result<ReleaseResponse> {
        let outcome = self
            .service
            .release(resource, scope, lease_type, &self.principal)
            .await?;
        Ok(ReleaseResponse {
            released: outcome.was_released(),
            already_released: !outcome.was_released(),
        })
    }

    fn beacon_release(&self, resource: &ResourceId, scope: LeaseScope, lease_type: LeaseType) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let service = self.service.clone();
        let principal = self.principal.clone();
        let resource = resource.clone();
        runtime.spawn(async move {
            if let Err(e) = service.release(&resource, scope, lease_type, &principal).await {
                debug!("Release beacon for {}/{} lost: {}", resource, scope, e);
            }
        });
    }

    fn principal(&self) -> &PrincipalId {
        &self.principal
    }
}
