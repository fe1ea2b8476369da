//! Terminal rendering of a [`LeaseView`].
//!
//! Pure functions only: the adapter reads controller views and never talks to
//! a store or the lease service itself.

use crate::{
    client::{ControllerState, LeaseView},
    time::Timestamp,
};
use chrono::Duration;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Badge {
    Editing,
    Locked,
    ViewMode,
    Available,
    Unknown,
}

impl Badge {
    pub fn label(self) -> &'static str {
        match self {
            Badge::Editing => "Editing",
            Badge::Locked => "Exclusive Lock",
            Badge::ViewMode => "View Mode",
            Badge::Available => "Available for Editing",
            Badge::Unknown => "Checking",
        }
    }
}

/// Which manual actions make sense in the current state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Affordances {
    pub can_acquire: bool,
    pub can_release: bool,
    pub can_edit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Indicator {
    pub badge: Badge,
    pub headline: String,
    pub details: Vec<String>,
    pub affordances: Affordances,
}

pub fn indicator(view: &LeaseView, now: Timestamp) -> Indicator {
    let mut details = Vec::new();
    let (badge, headline, affordances) = match &view.state {
        ControllerState::Held { expires_at, .. } => {
            if let Some(expires_at) = expires_at {
                details.push(format!(
                    "Expires at {} ({})",
                    clock_time(*expires_at),
                    remaining(*expires_at, now)
                ));
            }
            (
                Badge::Editing,
                format!("You are editing {} ({})", view.resource, view.scope),
                Affordances {
                    can_acquire: true,
                    can_release: true,
                    can_edit: true,
                },
            )
        }
        ControllerState::Blocked {
            holder,
            acquired_at,
            expires_at,
        } => {
            if let Some(acquired_at) = acquired_at {
                details.push(format!(
                    "Locked since {} on {}",
                    clock_time(*acquired_at),
                    acquired_at.format("%Y-%m-%d")
                ));
            }
            let headline = match expires_at {
                Some(expires_at) => format!(
                    "Currently being edited by {holder} until {}",
                    clock_time(*expires_at)
                ),
                None => format!("Currently being edited by {holder}"),
            };
            (
                Badge::Locked,
                headline,
                Affordances {
                    can_acquire: true,
                    can_release: false,
                    can_edit: false,
                },
            )
        }
        ControllerState::Shared { can_edit: false } => (
            Badge::ViewMode,
            "Read-only access".to_string(),
            Affordances {
                can_acquire: true,
                can_release: false,
                can_edit: false,
            },
        ),
        ControllerState::Shared { can_edit: true } => {
            details.push("Multiple users can view, but only one can edit".to_string());
            (
                Badge::Available,
                "No exclusive locks active".to_string(),
                Affordances {
                    can_acquire: true,
                    can_release: false,
                    can_edit: true,
                },
            )
        }
        ControllerState::Idle => (
            Badge::Unknown,
            "Lock state not loaded yet".to_string(),
            Affordances {
                can_acquire: true,
                can_release: false,
                can_edit: view.can_edit(),
            },
        ),
    };

    if view.degraded {
        details.push(match &view.last_error {
            Some(error) => format!("Lock service unreachable ({error}); showing last known state"),
            None => "Lock service unreachable; showing last known state".to_string(),
        });
    }

    Indicator {
        badge,
        headline,
        details,
        affordances,
    }
}

impl fmt::Display for Indicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.badge.label(), self.headline)?;
        for line in &self.details {
            write!(f, "\n  {line}")?;
        }
        Ok(())
    }
}

pub fn render(view: &LeaseView, now: Timestamp) -> String {
    indicator(view, now).to_string()
}

fn clock_time(at: Timestamp) -> String {
    at.format("%H:%M").to_string()
}

fn remaining(expires_at: Timestamp, now: Timestamp) -> String {
    let left = expires_at - now;
    if left <= Duration::zero() {
        "expired".to_string()
    } else if left < Duration::minutes(1) {
        "less than a minute left".to_string()
    } else {
        format!("{} min left", left.num_minutes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{lease::LeaseScope, PrincipalId, ResourceId};
    use chrono::{TimeZone, Utc};

    fn at(hour: u32, minute: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, minute, 0).unwrap()
    }

    fn view(state: ControllerState) -> LeaseView {
        LeaseView {
            resource: ResourceId::from("u1"),
            scope: LeaseScope::Assess,
            state,
            degraded: false,
            last_error: None,
        }
    }

    #[test]
    fn test_blocked_names_holder_and_expiry() {
        let blocked = view(ControllerState::Blocked {
            holder: PrincipalId::from("alice"),
            acquired_at: Some(at(9, 0)),
            expires_at: Some(at(9, 30)),
        });
        let indicator = indicator(&blocked, at(9, 5));
        assert_eq!(indicator.badge, Badge::Locked);
        assert_eq!(indicator.headline, "Currently being edited by alice until 09:30");
        assert!(!indicator.affordances.can_edit);
        assert!(!indicator.affordances.can_release);
        assert!(render(&blocked, at(9, 5)).contains("Locked since 09:00 on 2024-03-01"));
    }

    #[test]
    fn test_held_shows_time_left() {
        let held = view(ControllerState::Held {
            acquired_at: Some(at(9, 0)),
            expires_at: Some(at(9, 30)),
        });
        let text = render(&held, at(9, 10));
        assert!(text.starts_with("[Editing] You are editing u1 (ASSESS)"));
        assert!(text.contains("Expires at 09:30 (20 min left)"));
        assert!(indicator(&held, at(9, 10)).affordances.can_release);
        assert!(render(&held, at(9, 31)).contains("expired"));
    }

    #[test]
    fn test_shared_modes() {
        let read_only = indicator(&view(ControllerState::Shared { can_edit: false }), at(9, 0));
        assert_eq!(read_only.badge, Badge::ViewMode);
        assert_eq!(read_only.headline, "Read-only access");

        let open = indicator(&view(ControllerState::Shared { can_edit: true }), at(9, 0));
        assert_eq!(open.badge, Badge::Available);
        assert!(open.affordances.can_edit);
    }

    #[test]
    fn test_degraded_notice() {
        let mut degraded = view(ControllerState::Shared { can_edit: true });
        degraded.degraded = true;
        degraded.last_error = Some("connection refused".to_string());
        let indicator = indicator(&degraded, at(9, 0));
        assert!(indicator.affordances.can_edit);
        assert!(indicator
            .details
            .iter()
            .any(|line| line.contains("unreachable (connection refused)")));
    }
}
