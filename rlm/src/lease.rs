use crate::{error::Error, time::Timestamp, PrincipalId, ResourceId};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Lifetime of a lease absent renewal.
pub const LEASE_TTL_MINUTES: i64 = 30;

pub fn default_ttl() -> Duration {
    Duration::minutes(LEASE_TTL_MINUTES)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(pub Uuid);

impl LeaseId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Independent lease namespace on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum LeaseScope {
    #[default]
    #[serde(rename = "ASSESS")]
    Assess,
    #[serde(rename = "EDIT")]
    Edit,
    #[serde(rename = "GOVERNANCE_EU_AI_ACT")]
    GovernanceEuAiAct,
    #[serde(rename = "GOVERNANCE_ISO_42001")]
    GovernanceIso42001,
    #[serde(rename = "GOVERNANCE_UAE_AI")]
    GovernanceUaeAi,
    #[serde(rename = "GOVERNANCE_ISO_27001")]
    GovernanceIso27001,
}

impl LeaseScope {
    pub const ALL: [LeaseScope; 6] = [
        Self::Assess,
        Self::Edit,
        Self::GovernanceEuAiAct,
        Self::GovernanceIso42001,
        Self::GovernanceUaeAi,
        Self::GovernanceIso27001,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Assess => "ASSESS",
            Self::Edit => "EDIT",
            Self::GovernanceEuAiAct => "GOVERNANCE_EU_AI_ACT",
            Self::GovernanceIso42001 => "GOVERNANCE_ISO_42001",
            Self::GovernanceUaeAi => "GOVERNANCE_UAE_AI",
            Self::GovernanceIso27001 => "GOVERNANCE_ISO_27001",
        }
    }

    pub fn is_governance(self) -> bool {
        !matches!(self, Self::Assess | Self::Edit)
    }
}

impl fmt::Display for LeaseScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeaseScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|scope| scope.as_str() == s)
            .ok_or_else(|| Error::InvalidRequest(format!("unknown scope {s:?}")))
    }
}

/// Lease flavour. SHARED leases coexist; at most one EXCLUSIVE lease is
/// active per (resource, scope).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaseType {
    Shared,
    Exclusive,
}

impl LeaseType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shared => "SHARED",
            Self::Exclusive => "EXCLUSIVE",
        }
    }
}

impl fmt::Display for LeaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeaseType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SHARED" => Ok(Self::Shared),
            "EXCLUSIVE" => Ok(Self::Exclusive),
            other => Err(Error::InvalidRequest(format!(
                "invalid lock type {other:?}, must be SHARED or EXCLUSIVE"
            ))),
        }
    }
}

/// Target of an administrative force-release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ScopeSelector {
    Scope(LeaseScope),
    All,
}

impl ScopeSelector {
    pub fn matches(self, scope: LeaseScope) -> bool {
        match self {
            Self::All => true,
            Self::Scope(selected) => selected == scope,
        }
    }
}

impl FromStr for ScopeSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "ALL" {
            Ok(Self::All)
        } else {
            s.parse().map(Self::Scope)
        }
    }
}

impl TryFrom<String> for ScopeSelector {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ScopeSelector> for String {
    fn from(value: ScopeSelector) -> Self {
        match value {
            ScopeSelector::All => "ALL".to_string(),
            ScopeSelector::Scope(scope) => scope.as_str().to_string(),
        }
    }
}

/// A single lease row. Rows are never deleted; `is_active = false` is a
/// tombstone kept for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub id: LeaseId,
    pub resource_id: ResourceId,
    pub scope: LeaseScope,
    #[serde(rename = "type")]
    pub lease_type: LeaseType,
    pub holder: PrincipalId,
    pub acquired_at: Timestamp,
    pub expires_at: Timestamp,
    pub is_active: bool,
}

impl Lease {
    pub fn new(
        resource_id: ResourceId,
        scope: LeaseScope,
        lease_type: LeaseType,
        holder: PrincipalId,
        now: Timestamp,
        ttl: Duration,
    ) -> Self {
        Self {
            id: LeaseId::new(),
            resource_id,
            scope,
            lease_type,
            holder,
            acquired_at: now,
            expires_at: now + ttl,
            is_active: true,
        }
    }

    /// Active and not yet past its expiry.
    pub fn is_live(&self, now: Timestamp) -> bool {
        self.is_active && !self.is_expired(now)
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at < now
    }

    /// Extends the row in place. The holder never changes.
    pub fn renew(&mut self, now: Timestamp, ttl: Duration) {
        self.expires_at = now + ttl;
        self.is_active = true;
    }

    pub fn time_remaining(&self, now: Timestamp) -> Duration {
        if now < self.expires_at {
            self.expires_at.signed_duration_since(now)
        } else {
            Duration::zero()
        }
    }

    pub fn is_held_by(&self, principal: &PrincipalId) -> bool {
        &self.holder == principal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn lease_at(now: Timestamp) -> Lease {
        Lease::new(
            ResourceId::from("u1"),
            LeaseScope::Assess,
            LeaseType::Exclusive,
            PrincipalId::from("alice"),
            now,
            default_ttl(),
        )
    }

    #[test]
    fn test_expiry_boundary() {
        let t0 = Utc::now();
        let lease = lease_at(t0);
        assert_eq!(lease.expires_at, t0 + Duration::minutes(30));
        assert!(lease.is_live(t0 + Duration::minutes(30)));
        assert!(!lease.is_live(t0 + Duration::minutes(31)));
        assert_eq!(lease.time_remaining(t0 + Duration::minutes(40)), Duration::zero());
    }

    #[test]
    fn test_renew_keeps_identity() {
        let t0 = Utc::now();
        let mut lease = lease_at(t0);
        let id = lease.id;
        lease.renew(t0 + Duration::minutes(10), default_ttl());
        assert_eq!(lease.id, id);
        assert_eq!(lease.acquired_at, t0);
        assert_eq!(lease.expires_at, t0 + Duration::minutes(40));
    }

    #[test]
    fn test_scope_wire_names() {
        for scope in LeaseScope::ALL {
            let json = serde_json::to_string(&scope).unwrap();
            assert_eq!(json, format!("\"{}\"", scope.as_str()));
            assert_eq!(scope.as_str().parse::<LeaseScope>().unwrap(), scope);
        }
        assert!("GOVERNANCE_MARS".parse::<LeaseScope>().is_err());
    }

    #[test]
    fn test_scope_selector_parsing() {
        assert_eq!("ALL".parse::<ScopeSelector>().unwrap(), ScopeSelector::All);
        let edit: ScopeSelector = serde_json::from_str("\"EDIT\"").unwrap();
        assert_eq!(edit, ScopeSelector::Scope(LeaseScope::Edit));
        assert!(edit.matches(LeaseScope::Edit));
        assert!(!edit.matches(LeaseScope::Assess));
        assert!(ScopeSelector::All.matches(LeaseScope::GovernanceUaeAi));
    }

    #[test]
    fn test_lease_serializes_type_field() {
        let lease = lease_at(Utc::now());
        let value = serde_json::to_value(&lease).unwrap();
        assert_eq!(value["type"], "EXCLUSIVE");
        assert_eq!(value["resourceId"], "u1");
        assert_eq!(value["isActive"], true);
    }
}
