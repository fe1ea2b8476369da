//! Client-side lifecycle of one `(resource, scope)` lease.
//!
//! The controller keeps a local, advisory view of the lease fresh by polling,
//! acquires on request, releases on request, on local inactivity and on
//! teardown. The server is the source of truth; every release signal sent from
//! here may be lost and the server-side TTL covers for it.

use super::transport::LeaseApi;
use crate::{
    api::ReleaseResponse,
    config::ControllerConfig,
    lease::{LeaseScope, LeaseType},
    service::LeaseStatus,
    time::Timestamp,
    Error, PrincipalId, ResourceId, Result,
};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerState {
    /// Nothing known yet.
    Idle,
    /// This principal holds the EXCLUSIVE lease.
    Held {
        acquired_at: Option<Timestamp>,
        expires_at: Option<Timestamp>,
    },
    /// Someone else holds the EXCLUSIVE lease.
    Blocked {
        holder: PrincipalId,
        acquired_at: Option<Timestamp>,
        expires_at: Option<Timestamp>,
    },
    /// No EXCLUSIVE lease; editing is shared.
    Shared { can_edit: bool },
}

/// Snapshot published to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseView {
    pub resource: ResourceId,
    pub scope: LeaseScope,
    pub state: ControllerState,
    /// Last status call failed; `state` is a permissive fallback.
    pub degraded: bool,
    pub last_error: Option<String>,
}

impl LeaseView {
    pub fn holds_lease(&self) -> bool {
        matches!(self.state, ControllerState::Held { .. })
    }

    pub fn can_edit(&self) -> bool {
        match &self.state {
            ControllerState::Held { .. } => true,
            ControllerState::Blocked { .. } => false,
            ControllerState::Shared { can_edit } => *can_edit,
            ControllerState::Idle => self.degraded,
        }
    }
}

#[derive(Debug)]
struct Inner {
    api: Arc<dyn LeaseApi>,
    resource: ResourceId,
    scope: LeaseScope,
    config: ControllerConfig,
    held: AtomicBool,
    view: watch::Sender<LeaseView>,
    auto_release: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn publish(&self, state: ControllerState, error: Option<String>) -> LeaseView {
        let view = LeaseView {
            resource: self.resource.clone(),
            scope: self.scope,
            state,
            degraded: error.is_some(),
            last_error: error,
        };
        self.view.send_replace(view.clone());
        view
    }

    fn current_state(&self) -> ControllerState {
        self.view.borrow().state.clone()
    }

    /// Folds a fresh status into local state. A status without an EXCLUSIVE
    /// lease never clears a locally known hold; another holder does. A hold
    /// first learned from status gets the same auto-release timer as one
    /// taken through `acquire`.
    fn merge(self: &Arc<Self>, status: &LeaseStatus) -> ControllerState {
        if status.has_exclusive_lock && status.is_owned_by_current_user {
            if !self.held.swap(true, Ordering::SeqCst) {
                debug!("Found existing hold on {}/{}", self.resource, self.scope);
                self.arm_auto_release();
            }
            return ControllerState::Held {
                acquired_at: status.acquired_at,
                expires_at: status.expires_at,
            };
        }

        if status.has_exclusive_lock {
            if self.held.swap(false, Ordering::SeqCst) {
                info!("Lease on {}/{} was taken over", self.resource, self.scope);
                self.cancel_auto_release();
            }
            return ControllerState::Blocked {
                holder: status.holder.clone().unwrap_or_else(|| PrincipalId::from("unknown")),
                acquired_at: status.acquired_at,
                expires_at: status.expires_at,
            };
        }

        if self.held.load(Ordering::SeqCst) {
            debug!("Status for {}/{} shows no lock; keeping local hold", self.resource, self.scope);
            return match self.current_state() {
                held @ ControllerState::Held { .. } => held,
                _ => ControllerState::Held {
                    acquired_at: None,
                    expires_at: None,
                },
            };
        }

        ControllerState::Shared {
            can_edit: status.can_edit,
        }
    }

    async fn refresh(self: &Arc<Self>) -> LeaseView {
        match self.api.status(&self.resource, self.scope).await {
            Ok(status) => {
                let state = self.merge(&status);
                self.publish(state, None)
            }
            Err(e) => {
                warn!("Lease status for {}/{} unavailable: {}", self.resource, self.scope, e);
                let state = if self.held.load(Ordering::SeqCst) {
                    self.current_state()
                } else {
                    ControllerState::Shared { can_edit: true }
                };
                self.publish(state, Some(e.to_string()))
            }
        }
    }

    async fn acquire(self: &Arc<Self>) -> Result<bool> {
        match self
            .api
            .acquire(&self.resource, self.scope, LeaseType::Exclusive)
            .await
        {
            Ok(acquired) => {
                self.held.store(true, Ordering::SeqCst);
                self.publish(
                    ControllerState::Held {
                        acquired_at: Some(acquired.acquired_at),
                        expires_at: Some(acquired.expires_at),
                    },
                    None,
                );
                self.arm_auto_release();
                Ok(true)
            }
            Err(Error::LeaseConflict {
                holder,
                acquired_at,
                expires_at,
                ..
            }) => {
                if self.held.swap(false, Ordering::SeqCst) {
                    info!("Lease on {}/{} is held by {}", self.resource, self.scope, holder);
                }
                self.cancel_auto_release();
                self.publish(
                    ControllerState::Blocked {
                        holder,
                        acquired_at: Some(acquired_at),
                        expires_at: Some(expires_at),
                    },
                    None,
                );
                Ok(false)
            }
            Err(Error::Timeout) => {
                warn!(
                    "Acquire on {}/{} timed out; reconciling with status",
                    self.resource, self.scope
                );
                let view = self.refresh().await;
                if view.holds_lease() {
                    self.arm_auto_release();
                }
                Ok(view.holds_lease())
            }
            Err(e) => {
                self.publish(self.current_state(), Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn release(self: &Arc<Self>) -> Result<ReleaseResponse> {
        match self
            .api
            .release(&self.resource, self.scope, LeaseType::Exclusive)
            .await
        {
            Ok(response) => {
                self.held.store(false, Ordering::SeqCst);
                self.refresh().await;
                Ok(response)
            }
            Err(e) => {
                self.publish(self.current_state(), Some(e.to_string()));
                Err(e)
            }
        }
    }

    fn arm_auto_release(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let after = self.config.auto_release_after;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.auto_release.lock().take();
            if inner.held.load(Ordering::SeqCst) {
                info!(
                    "Auto-releasing {}/{} after {:?} without renewal",
                    inner.resource, inner.scope, after
                );
                if let Err(e) = inner.release().await {
                    warn!("Auto-release of {}/{} failed: {}", inner.resource, inner.scope, e);
                    inner.held.store(false, Ordering::SeqCst);
                    inner.publish(ControllerState::Idle, Some(e.to_string()));
                }
            }
        });

        if let Some(previous) = self.auto_release.lock().replace(timer) {
            previous.abort();
        }
    }

    fn cancel_auto_release(&self) {
        if let Some(timer) = self.auto_release.lock().take() {
            timer.abort();
        }
    }
}

/// Keeps one principal's view of one `(resource, scope)` lease current.
#[derive(Debug)]
pub struct LeaseController {
    inner: Arc<Inner>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl LeaseController {
    pub fn new(
        api: Arc<dyn LeaseApi>,
        resource: ResourceId,
        scope: LeaseScope,
        config: ControllerConfig,
    ) -> Self {
        let (view, _) = watch::channel(LeaseView {
            resource: resource.clone(),
            scope,
            state: ControllerState::Idle,
            degraded: false,
            last_error: None,
        });
        Self {
            inner: Arc::new(Inner {
                api,
                resource,
                scope,
                config,
                held: AtomicBool::new(false),
                view,
                auto_release: Mutex::new(None),
            }),
            poller: Mutex::new(None),
        }
    }

    pub fn resource(&self) -> &ResourceId {
        &self.inner.resource
    }

    pub fn scope(&self) -> LeaseScope {
        self.inner.scope
    }

    pub fn view(&self) -> LeaseView {
        self.inner.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LeaseView> {
        self.inner.view.subscribe()
    }

    /// Loads the current status and starts periodic polling.
    pub async fn activate(&self) -> LeaseView {
        let view = self.inner.refresh().await;

        let mut poller = self.poller.lock();
        if poller.is_none() {
            let weak = Arc::downgrade(&self.inner);
            let period = self.inner.config.poll_interval;
            *poller = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                loop {
                    ticker.tick().await;
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    inner.refresh().await;
                }
            }));
        }
        view
    }

    pub async fn refresh(&self) -> LeaseView {
        self.inner.refresh().await
    }

    /// Requests (or renews) the EXCLUSIVE lease. `Ok(false)` means someone
    /// else holds it; the view then names the holder.
    pub async fn acquire(&self) -> Result<bool> {
        self.inner.acquire().await
    }

    /// Like `acquire`, but while someone else holds the lease it waits for the
    /// view to show the resource free and tries again. Needs `activate` for
    /// the view to move on its own.
    pub async fn acquire_when_free(&self) -> Result<()> {
        let mut views = self.subscribe();
        loop {
            if self.acquire().await? {
                return Ok(());
            }
            loop {
                if views.changed().await.is_err() {
                    return Err(Error::Other(anyhow::anyhow!("lease view closed")));
                }
                let view = views.borrow_and_update();
                if !view.degraded && view.state == (ControllerState::Shared { can_edit: true }) {
                    break;
                }
            }
            debug!("{}/{} looks free, retrying acquire", self.inner.resource, self.inner.scope);
        }
    }

    pub async fn release(&self) -> Result<ReleaseResponse> {
        self.inner.cancel_auto_release();
        self.inner.release().await
    }

    /// Exit-time release. Fires a one-way beacon and makes a bounded
    /// synchronous release attempt; either may be lost.
    pub async fn shutdown(self) {
        self.stop_tasks();
        if !self.inner.held.swap(false, Ordering::SeqCst) {
            return;
        }

        let inner = &self.inner;
        inner
            .api
            .beacon_release(&inner.resource, inner.scope, LeaseType::Exclusive);

        match tokio::time::timeout(
            inner.config.request_timeout,
            inner.api.release(&inner.resource, inner.scope, LeaseType::Exclusive),
        )
        .await
        {
            Ok(Ok(response)) => debug!(
                "Released {}/{} on shutdown (released={})",
                inner.resource, inner.scope, response.released
            ),
            Ok(Err(e)) => warn!("Release of {}/{} on shutdown failed: {}", inner.resource, inner.scope, e),
            Err(_) => warn!("Release of {}/{} on shutdown timed out", inner.resource, inner.scope),
        }
        inner.publish(ControllerState::Idle, None);
    }

    fn stop_tasks(&self) {
        if let Some(poller) = self.poller.lock().take() {
            poller.abort();
        }
        self.inner.cancel_auto_release();
    }
}

impl Drop for LeaseController {
    fn drop(&mut self) {
        self.stop_tasks();
        if self.inner.held.swap(false, Ordering::SeqCst) {
            self.inner
                .api
                .beacon_release(&self.inner.resource, self.inner.scope, LeaseType::Exclusive);
        }
    }
}
