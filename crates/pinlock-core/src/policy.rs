//! Decides whether a caller must re-authenticate before proceeding.

use crate::clock::duration_millis;
use std::time::Duration;

/// Freshness window used when an engine is built without one.
pub const DEFAULT_FRESHNESS_WINDOW: Duration = Duration::from_secs(300);

/// Facts a policy may consult.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlockContext {
    pub now_millis: i64,
    pub last_successful_unlock_at: Option<i64>,
    pub enrolled: bool,
}

pub trait UnlockRequirementPolicy: Send + Sync {
    fn is_required(&self, ctx: &UnlockContext) -> bool;
}

/// A successful unlock stays valid for `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    pub window: Duration,
}

impl FreshnessPolicy {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }
}

impl UnlockRequirementPolicy for FreshnessPolicy {
    fn is_required(&self, ctx: &UnlockContext) -> bool {
        is_stale(ctx.now_millis, ctx.last_successful_unlock_at, self.window)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlwaysRequired;

impl UnlockRequirementPolicy for AlwaysRequired {
    fn is_required(&self, _ctx: &UnlockContext) -> bool {
        true
    }
}

/// A missing success timestamp is infinitely stale.
pub(crate) fn is_stale(now_millis: i64, last_success: Option<i64>, window: Duration) -> bool {
    match last_success {
        None => true,
        Some(at) => now_millis.saturating_sub(at) >= duration_millis(window),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(now: i64, last: Option<i64>) -> UnlockContext {
        UnlockContext {
            now_millis: now,
            last_successful_unlock_at: last,
            enrolled: true,
        }
    }

    #[test]
    fn freshness_boundary_is_inclusive() {
        let policy = FreshnessPolicy::new(Duration::from_secs(10));
        assert!(!policy.is_required(&ctx(19_999, Some(10_000))));
        assert!(policy.is_required(&ctx(20_000, Some(10_000))));
    }

    #[test]
    fn never_unlocked_is_always_stale() {
        let policy = FreshnessPolicy::new(Duration::from_secs(3600));
        assert!(policy.is_required(&ctx(0, None)));
    }

    #[test]
    fn always_required_ignores_context() {
        assert!(AlwaysRequired.is_required(&ctx(1, Some(1))));
    }
}
