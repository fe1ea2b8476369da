use crate::{
    auth::{AccessControlList, AccessPolicy, OpenAccessPolicy, RoleAccessPolicy},
    lease::default_ttl,
    Error, PrincipalId, Result,
};
use std::{collections::HashMap, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:7400";

/// Lease server settings, read from `RLM_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// SQLite file; `None` keeps leases in process memory.
    pub database: Option<PathBuf>,
    pub sweep_interval: Option<Duration>,
    pub acl_path: Option<PathBuf>,
    pub admins: Vec<PrincipalId>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars().collect())
    }

    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| {
            vars.get(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let bind_addr = get("RLM_BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
            .parse()
            .map_err(|e| Error::InvalidRequest(format!("RLM_BIND_ADDR: {e}")))?;

        let database = get("RLM_DATABASE")
            .filter(|path| path != ":memory:")
            .map(PathBuf::from);

        let sweep_interval = match get("RLM_SWEEP_INTERVAL_SECS") {
            None => None,
            Some(raw) => {
                let secs: u64 = raw
                    .parse()
                    .map_err(|e| Error::InvalidRequest(format!("RLM_SWEEP_INTERVAL_SECS: {e}")))?;
                (secs > 0).then(|| Duration::from_secs(secs))
            }
        };

        let admins = get("RLM_ADMINS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(PrincipalId::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            bind_addr,
            database,
            sweep_interval,
            acl_path: get("RLM_ACL").map(PathBuf::from),
            admins,
        })
    }

    /// Role policy from the ACL file when configured, open policy otherwise.
    pub fn access_policy(&self) -> Result<Arc<dyn AccessPolicy>> {
        match &self.acl_path {
            Some(path) => Ok(Arc::new(RoleAccessPolicy::from_acl(AccessControlList::load(
                path,
            )?))),
            None => Ok(Arc::new(OpenAccessPolicy::new(self.admins.iter().cloned()))),
        }
    }
}

/// Client-side lease controller timings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// How often `status` is polled.
    pub poll_interval: Duration,
    /// Local auto-release after this long without renewal.
    pub auto_release_after: Duration,
    /// Deadline for a single request to the lease service.
    pub request_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5 * 60),
            auto_release_after: default_ttl()
                .to_std()
                .unwrap_or(Duration::from_secs(30 * 60)),
            request_timeout: Duration::from_secs(10),
        }
    }
}
