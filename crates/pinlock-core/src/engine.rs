//! PIN verification gate with time-based lockout.
//!
//! The consecutive-failure counter lives only in memory and is threaded
//! through each attempt as a [`LockoutState`]. The start of a lockout window
//! is persisted, so a window armed by one process still blocks the next.

use crate::clock::{duration_millis, Clock, SystemClock};
use crate::config::{LockPolicy, PinlockConfig};
use crate::digest::DigestScheme;
use crate::error::PinlockResult;
use crate::policy::{
    is_stale, AlwaysRequired, FreshnessPolicy, UnlockContext, UnlockRequirementPolicy,
    DEFAULT_FRESHNESS_WINDOW,
};
use crate::store::{
    CredentialStore, EnrollmentRecord, StoredValue, KEY_CREDENTIAL_HASH, KEY_FAILURE_BLOCK_START,
    KEY_LAST_UNLOCK_SUCCESS,
};
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Session-scoped failure counter. Starts at 1, as earlier releases did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutState {
    pub retry_count: u32,
}

impl Default for LockoutState {
    fn default() -> Self {
        Self { retry_count: 1 }
    }
}

impl LockoutState {
    fn bumped(self) -> Self {
        Self {
            retry_count: self.retry_count.saturating_add(1),
        }
    }

    fn exceeds(&self, policy: &LockPolicy) -> bool {
        self.retry_count > policy.max_retry_count
    }
}

/// Wait left before a locked-out gate accepts attempts again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRemaining(pub Duration);

impl fmt::Display for TimeRemaining {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.0.as_secs();
        let minutes = total / 60;
        let seconds = total % 60;
        if minutes < 1 {
            write!(f, "{seconds} seconds")
        } else {
            write!(f, "{minutes} minutes, {seconds} seconds")
        }
    }
}

/// Every routine result of an unlock attempt. None of these are faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockOutcome {
    Success,
    /// Nothing is enrolled, so there is nothing to compare against.
    NoEnrollment,
    /// A lockout window is active; the secret was not examined.
    RetryLimitExceeded { time_remaining: TimeRemaining },
    /// Wrong secret. `limit_exceeded` is set on the failure that armed a
    /// lockout window.
    MismatchFailure { limit_exceeded: bool },
}

impl UnlockOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UnlockOutcome::Success)
    }
}

impl fmt::Display for UnlockOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnlockOutcome::Success => write!(f, "unlocked"),
            UnlockOutcome::NoEnrollment => write!(f, "no matching PIN found"),
            UnlockOutcome::RetryLimitExceeded { time_remaining } => {
                write!(f, "retry limit exceeded, try again in {time_remaining}")
            }
            UnlockOutcome::MismatchFailure { .. } => write!(f, "PIN did not match"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreWrite {
    ArmFailureBlock(i64),
    ClearFailureBlock,
    RecordSuccess(i64),
}

/// Result of one step of the lockout state machine: what to report, what
/// the counter becomes, and what must be persisted first.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Transition {
    outcome: UnlockOutcome,
    next: LockoutState,
    writes: Vec<StoreWrite>,
}

/// Lockout is active while the counter is over the limit or a persisted
/// window has not run out yet.
fn locked_out(
    state: LockoutState,
    policy: &LockPolicy,
    block_started_at: Option<i64>,
    now: i64,
) -> bool {
    state.exceeds(policy) || !window_expired(policy, block_started_at, now)
}

fn window_expired(policy: &LockPolicy, block_started_at: Option<i64>, now: i64) -> bool {
    match block_started_at {
        None => true,
        Some(start) => elapsed_since(start, now) >= duration_millis(policy.failure_delay),
    }
}

/// A start time in the future counts as zero elapsed.
fn elapsed_since(start: i64, now: i64) -> i64 {
    now.saturating_sub(start).max(0)
}

fn step<F>(
    state: LockoutState,
    policy: &LockPolicy,
    block_started_at: Option<i64>,
    now: i64,
    secret_matches: F,
) -> Transition
where
    F: FnOnce() -> bool,
{
    let mut state = state;
    let mut writes = Vec::new();
    let mut block_active = block_started_at.is_some();

    if locked_out(state, policy, block_started_at, now) {
        if window_expired(policy, block_started_at, now) {
            state = LockoutState::default();
            if block_active {
                writes.push(StoreWrite::ClearFailureBlock);
                block_active = false;
            }
        } else {
            let start = block_started_at.unwrap_or(now);
            let left = duration_millis(policy.failure_delay) - elapsed_since(start, now);
            let time_remaining =
                TimeRemaining(Duration::from_millis(u64::try_from(left).unwrap_or(0)));
            // Blocked attempts still count, but never re-arm the window.
            return Transition {
                outcome: UnlockOutcome::RetryLimitExceeded { time_remaining },
                next: state.bumped(),
                writes,
            };
        }
    }

    if secret_matches() {
        if block_active {
            writes.push(StoreWrite::ClearFailureBlock);
        }
        writes.push(StoreWrite::RecordSuccess(now));
        return Transition {
            outcome: UnlockOutcome::Success,
            next: LockoutState::default(),
            writes,
        };
    }

    let next = state.bumped();
    let limit_exceeded = next.exceeds(policy);
    if limit_exceeded {
        writes.push(StoreWrite::ArmFailureBlock(now));
    }
    Transition {
        outcome: UnlockOutcome::MismatchFailure { limit_exceeded },
        next,
        writes,
    }
}

/// Stateful re-authentication gate over a [`CredentialStore`].
///
/// One engine is one logical actor: calls are expected to arrive in
/// sequence. Several engines may share a store, but their counters are
/// independent and racing attempts can both observe the same persisted
/// state. Wrap the engine in [`spawn_gate`](crate::worker::spawn_gate) or
/// a mutex when that matters.
pub struct LockPolicyEngine<S: CredentialStore> {
    store: S,
    policy: LockPolicy,
    digest: DigestScheme,
    clock: Arc<dyn Clock>,
    requirement: Box<dyn UnlockRequirementPolicy>,
    state: LockoutState,
}

impl<S: CredentialStore> LockPolicyEngine<S> {
    pub fn new(store: S, policy: LockPolicy) -> Self {
        Self {
            store,
            policy,
            digest: DigestScheme::default(),
            clock: Arc::new(SystemClock),
            requirement: Box::new(FreshnessPolicy::new(DEFAULT_FRESHNESS_WINDOW)),
            state: LockoutState::default(),
        }
    }

    /// Build an engine with thresholds, digest, and freshness taken from
    /// `config`. A config without a freshness window always requires unlock.
    pub fn from_config(config: &PinlockConfig, store: S) -> Self {
        let requirement: Box<dyn UnlockRequirementPolicy> = match config.freshness_window() {
            Some(window) => Box::new(FreshnessPolicy::new(window)),
            None => Box::new(AlwaysRequired),
        };
        Self::new(store, config.lock_policy())
            .with_digest(config.digest.scheme)
            .with_requirement_policy(requirement)
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_digest(mut self, digest: DigestScheme) -> Self {
        self.digest = digest;
        self
    }

    pub fn with_requirement_policy(mut self, requirement: Box<dyn UnlockRequirementPolicy>) -> Self {
        self.requirement = requirement;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn policy(&self) -> &LockPolicy {
        &self.policy
    }

    pub fn lockout_state(&self) -> LockoutState {
        self.state
    }

    pub fn record(&self) -> PinlockResult<EnrollmentRecord> {
        Ok(EnrollmentRecord::load(&self.store)?)
    }

    /// Store the digest of `secret`, replacing any earlier enrollment.
    pub fn enroll(&self, secret: &str) -> PinlockResult<()> {
        let hash = self.digest.digest(secret);
        self.store
            .put(KEY_CREDENTIAL_HASH, StoredValue::Text(hash))?;
        info!("enrolled new PIN");
        Ok(())
    }

    pub fn clear_enrollment(&self) -> PinlockResult<()> {
        self.store.remove(KEY_CREDENTIAL_HASH)?;
        info!("cleared PIN enrollment");
        Ok(())
    }

    pub fn is_enrolled(&self) -> PinlockResult<bool> {
        Ok(self.store.get_text(KEY_CREDENTIAL_HASH)?.is_some())
    }

    pub fn is_locked_out(&self) -> PinlockResult<bool> {
        let block_started_at = self.store.get_millis(KEY_FAILURE_BLOCK_START)?;
        Ok(locked_out(
            self.state,
            &self.policy,
            block_started_at,
            self.clock.now_millis(),
        ))
    }

    /// Verify `secret` against the enrollment, applying lockout accounting.
    pub fn attempt_unlock(&mut self, secret: &str) -> PinlockResult<UnlockOutcome> {
        let Some(expected) = self.store.get_text(KEY_CREDENTIAL_HASH)? else {
            debug!("unlock attempted with no PIN enrolled");
            return Ok(UnlockOutcome::NoEnrollment);
        };

        let block_started_at = self.store.get_millis(KEY_FAILURE_BLOCK_START)?;
        let now = self.clock.now_millis();
        let digest = self.digest;
        let transition = step(self.state, &self.policy, block_started_at, now, || {
            digest.digest(secret) == expected
        });

        self.commit(transition)
    }

    /// Accept a success reported by another credential source (for example
    /// a biometric prompt) exactly as if the correct PIN had been entered.
    pub fn record_external_success(&mut self) -> PinlockResult<()> {
        let now = self.clock.now_millis();
        let mut writes = Vec::new();
        if self.store.get_millis(KEY_FAILURE_BLOCK_START)?.is_some() {
            writes.push(StoreWrite::ClearFailureBlock);
        }
        writes.push(StoreWrite::RecordSuccess(now));
        self.commit(Transition {
            outcome: UnlockOutcome::Success,
            next: LockoutState::default(),
            writes,
        })?;
        Ok(())
    }

    /// Whether the last successful unlock is at least `window` old.
    pub fn is_unlock_required(&self, window: Duration) -> PinlockResult<bool> {
        let last = self.store.get_millis(KEY_LAST_UNLOCK_SUCCESS)?;
        Ok(is_stale(self.clock.now_millis(), last, window))
    }

    /// Whether a caller should prompt before proceeding: never when nothing
    /// is enrolled, otherwise as the requirement policy decides.
    pub fn requires_unlock(&self) -> PinlockResult<bool> {
        let ctx = self.context()?;
        Ok(ctx.enrolled && self.requirement.is_required(&ctx))
    }

    /// Like [`requires_unlock`](Self::requires_unlock) with an explicit
    /// freshness window in place of the held policy.
    pub fn should_prompt_within(&self, window: Duration) -> PinlockResult<bool> {
        let ctx = self.context()?;
        Ok(ctx.enrolled && FreshnessPolicy::new(window).is_required(&ctx))
    }

    fn context(&self) -> PinlockResult<UnlockContext> {
        let record = self.record()?;
        Ok(UnlockContext {
            now_millis: self.clock.now_millis(),
            last_successful_unlock_at: record.last_successful_unlock_at,
            enrolled: record.is_enrolled(),
        })
    }

    /// Persist the transition's writes, then adopt its counter. A failed
    /// write leaves the in-memory counter untouched. Lockout is always
    /// cleared before a success is recorded, so a failure part way never
    /// leaves a fresh unlock next to a still-armed window.
    fn commit(&mut self, transition: Transition) -> PinlockResult<UnlockOutcome> {
        for write in &transition.writes {
            match *write {
                StoreWrite::ArmFailureBlock(at) => {
                    self.store
                        .put(KEY_FAILURE_BLOCK_START, StoredValue::Millis(at))?;
                    warn!(
                        "retry limit of {} exceeded; unlock blocked for {}",
                        self.policy.max_retry_count,
                        TimeRemaining(self.policy.failure_delay)
                    );
                }
                StoreWrite::ClearFailureBlock => {
                    self.store.remove(KEY_FAILURE_BLOCK_START)?;
                    debug!("lockout window cleared");
                }
                StoreWrite::RecordSuccess(at) => {
                    self.store
                        .put(KEY_LAST_UNLOCK_SUCCESS, StoredValue::Millis(at))?;
                }
            }
        }
        self.state = transition.next;

        match transition.outcome {
            UnlockOutcome::Success => info!("unlock succeeded"),
            UnlockOutcome::MismatchFailure { .. } => {
                warn!("PIN mismatch (attempt counter {})", self.state.retry_count)
            }
            UnlockOutcome::RetryLimitExceeded { time_remaining } => {
                warn!("unlock refused while locked out ({time_remaining} remaining)")
            }
            UnlockOutcome::NoEnrollment => {}
        }
        Ok(transition.outcome)
    }
}
