//! Trust & policy checks applied before any budget or upstream traffic.
//!
//! Rules run in a fixed order and the first failing rule wins:
//! disabled → unavailable (`down`) → action not in `allowed_actions`.
//! `trust_level` is carried through for logging only; no rule keys off it.

use std::fmt;

use crate::models::service::{HealthStatus, ServiceRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    Disabled,
    Unavailable,
    ActionNotPermitted,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::Disabled => "disabled",
            DenyReason::Unavailable => "unavailable",
            DenyReason::ActionNotPermitted => "action not permitted",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

pub fn authorize(record: &ServiceRecord, action: &str) -> Decision {
    let decision = if !record.enabled {
        Decision::Deny(DenyReason::Disabled)
    } else if record.health_status == HealthStatus::Down {
        Decision::Deny(DenyReason::Unavailable)
    } else if !record.grants.permits(action) {
        Decision::Deny(DenyReason::ActionNotPermitted)
    } else {
        Decision::Allow
    };

    if let Decision::Deny(reason) = decision {
        tracing::debug!(
            service = %record.name,
            action,
            trust_level = record.trust_level.as_str(),
            reason = reason.as_str(),
            "policy denied call"
        );
    }

    decision
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::service::{action_set, NewService};
    use chrono::Utc;

    fn record() -> ServiceRecord {
        let mut new = NewService::named("screen-intelligence");
        new.endpoint = Some("http://localhost:8765".into());
        new.enabled = true;
        new.actions = action_set(["screen.describe", "screen.click"]);
        new.allowed_actions = action_set(["screen.describe"]);
        ServiceRecord::create(new, Utc::now()).unwrap()
    }

    #[test]
    fn test_allowed_action_passes() {
        assert_eq!(authorize(&record(), "screen.describe"), Decision::Allow);
    }

    #[test]
    fn test_declared_but_not_allowed_is_denied() {
        assert_eq!(
            authorize(&record(), "screen.click"),
            Decision::Deny(DenyReason::ActionNotPermitted)
        );
        assert_eq!(
            authorize(&record(), "screen.unknown"),
            Decision::Deny(DenyReason::ActionNotPermitted)
        );
    }

    #[test]
    fn test_disabled_wins_over_everything() {
        let mut r = record();
        r.enabled = false;
        r.health_status = HealthStatus::Down;
        assert_eq!(
            authorize(&r, "screen.click"),
            Decision::Deny(DenyReason::Disabled)
        );
    }

    #[test]
    fn test_down_beats_action_check() {
        let mut r = record();
        r.health_status = HealthStatus::Down;
        assert_eq!(
            authorize(&r, "screen.click"),
            Decision::Deny(DenyReason::Unavailable)
        );
    }

    #[test]
    fn test_degraded_and_unknown_still_allowed() {
        for status in [HealthStatus::Degraded, HealthStatus::Unknown, HealthStatus::Healthy] {
            let mut r = record();
            r.health_status = status;
            assert_eq!(authorize(&r, "screen.describe"), Decision::Allow);
        }
    }

    #[test]
    fn test_reason_strings() {
        assert_eq!(DenyReason::Disabled.to_string(), "disabled");
        assert_eq!(DenyReason::Unavailable.to_string(), "unavailable");
        assert_eq!(DenyReason::ActionNotPermitted.to_string(), "action not permitted");
    }
}
