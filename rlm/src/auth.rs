//! Collaborator interfaces for identity and resource authorisation.
//!
//! Authentication itself happens in front of this service (a gateway sets the
//! principal header); the policies here only decide whether a known principal
//! may touch a resource at all. Lease contention is a separate question
//! answered by [`crate::service::LeaseService`].

use crate::{Error, PrincipalId, ResourceId, Result};
use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    path::Path,
};

pub const PRINCIPAL_HEADER: &str = "x-principal-id";

pub trait PrincipalResolver: Send + Sync + std::fmt::Debug {
    fn resolve(&self, headers: &HeaderMap) -> Result<PrincipalId>;
}

/// Trusts the principal header set by the authenticating gateway.
#[derive(Debug, Clone)]
pub struct HeaderPrincipalResolver {
    header: String,
}

impl HeaderPrincipalResolver {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }
}

impl Default for HeaderPrincipalResolver {
    fn default() -> Self {
        Self::new(PRINCIPAL_HEADER)
    }
}

impl PrincipalResolver for HeaderPrincipalResolver {
    fn resolve(&self, headers: &HeaderMap) -> Result<PrincipalId> {
        headers
            .get(self.header.as_str())
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(PrincipalId::from)
            .ok_or(Error::Unauthenticated)
    }
}

#[async_trait]
pub trait AccessPolicy: Send + Sync + std::fmt::Debug {
    /// `Err(NotFound)` for unknown resources, `Err(Unauthenticated)` for
    /// unknown principals, otherwise whether access is granted.
    async fn may_access(&self, principal: &PrincipalId, resource: &ResourceId) -> Result<bool>;

    async fn is_admin(&self, principal: &PrincipalId) -> Result<bool>;
}

/// Fails with `PermissionDenied` unless the policy grants access.
pub async fn authorize(
    policy: &dyn AccessPolicy,
    principal: &PrincipalId,
    resource: &ResourceId,
) -> Result<()> {
    if policy.may_access(principal, resource).await? {
        Ok(())
    } else {
        Err(Error::PermissionDenied {
            principal: principal.clone(),
            resource: resource.clone(),
        })
    }
}

/// Everyone may touch everything; only listed principals are admins.
#[derive(Debug, Clone, Default)]
pub struct OpenAccessPolicy {
    admins: HashSet<PrincipalId>,
}

impl OpenAccessPolicy {
    pub fn new(admins: impl IntoIterator<Item = PrincipalId>) -> Self {
        Self {
            admins: admins.into_iter().collect(),
        }
    }
}

#[async_trait]
impl AccessPolicy for OpenAccessPolicy {
    async fn may_access(&self, _principal: &PrincipalId, _resource: &ResourceId) -> Result<bool> {
        Ok(true)
    }

    async fn is_admin(&self, principal: &PrincipalId) -> Result<bool> {
        Ok(self.admins.contains(principal))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    OrgAdmin,
    OrgUser,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrincipalRecord {
    pub id: PrincipalId,
    pub role: Role,
    #[serde(default)]
    pub organization: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: ResourceId,
    pub owner: PrincipalId,
    #[serde(default)]
    pub organization: Option<String>,
}

/// On-disk shape of the role policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControlList {
    #[serde(default)]
    pub principals: Vec<PrincipalRecord>,
    #[serde(default)]
    pub resources: Vec<ResourceRecord>,
}

impl AccessControlList {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::InvalidRequest(format!("bad ACL file {}: {e}", path.display())))
    }
}

/// Admins see everything, organisation roles see their organisation's
/// resources, plain users see only what they own.
#[derive(Debug, Clone, Default)]
pub struct RoleAccessPolicy {
    principals: HashMap<PrincipalId, PrincipalRecord>,
    resources: HashMap<ResourceId, ResourceRecord>,
}

impl RoleAccessPolicy {
    pub fn from_acl(acl: AccessControlList) -> Self {
        Self {
            principals: acl
                .principals
                .into_iter()
                .map(|record| (record.id.clone(), record))
                .collect(),
            resources: acl
                .resources
                .into_iter()
                .map(|record| (record.id.clone(), record))
                .collect(),
        }
    }

    fn principal(&self, id: &PrincipalId) -> Result<&PrincipalRecord> {
        self.principals.get(id).ok_or(Error::Unauthenticated)
    }
}

#[async_trait]
impl AccessPolicy for RoleAccessPolicy {
    async fn may_access(&self, principal: &PrincipalId, resource: &ResourceId) -> Result<bool> {
        let who = self.principal(principal)?;
        let what = self
            .resources
            .get(resource)
            .ok_or_else(|| Error::NotFound(format!("resource {resource}")))?;

        Ok(match who.role {
            Role::Admin => true,
            Role::User => what.owner == who.id,
            Role::OrgAdmin | Role::OrgUser => {
                who.organization.is_some() && who.organization == what.organization
            }
        })
    }

    async fn is_admin(&self, principal: &PrincipalId) -> Result<bool> {
        Ok(self.principal(principal)?.role == Role::Admin)
    }
}
