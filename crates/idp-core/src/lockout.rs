//! Account lockout state machine
//!
//! Pure: callers load the [`LoginState`], evaluate, and persist the result
//! inside the same transaction.

use crate::models::{LoginState, SecuritySettings};

const MINUTE_MS: i64 = 60_000;

/// Lockout thresholds in effect for one evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutPolicy {
    max_attempts: u32,
    lock_duration_minutes: u32,
}

/// Result of evaluating a login attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginOutcome {
    /// The attempt is accepted
    pub allowed: bool,
    /// The account is locked after this attempt
    pub locked: bool,
    /// Whole minutes until the lock expires, rounded up
    pub minutes_remaining: Option<u32>,
    /// Failed attempts recorded after this attempt
    pub failed_attempts: u32,
    /// Failures left before the account locks
    pub attempts_remaining: u32,
    /// An expired lock was cleared before evaluating
    pub auto_unlocked: bool,
}

/// Pre-credential check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Credentials may be checked
    Open,
    /// Reject without checking credentials
    Locked { minutes_remaining: u32 },
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self::from_settings(&SecuritySettings::default())
    }
}

impl LockoutPolicy {
    pub fn new(max_attempts: u32, lock_duration_minutes: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            lock_duration_minutes,
        }
    }

    pub fn from_settings(settings: &SecuritySettings) -> Self {
        Self::new(
            settings.max_login_attempts,
            settings.lock_duration_minutes,
        )
    }

    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn lock_duration_ms(&self) -> i64 {
        i64::from(self.lock_duration_minutes) * MINUTE_MS
    }

    /// When the current lock ends.
    ///
    /// The stored `locked_until` wins. Rows locked before it existed fall back
    /// to `locked_at` plus the current duration. A lock with neither is
    /// treated as expired.
    pub fn lock_expires_at(&self, state: &LoginState) -> Option<i64> {
        state.locked_until.or_else(|| {
            state
                .locked_at
                .map(|locked_at| locked_at.saturating_add(self.lock_duration_ms()))
        })
    }

    /// Decide whether credentials should be checked at all.
    pub fn gate(&self, state: &LoginState, now_ms: i64) -> Gate {
        if !state.is_locked {
            return Gate::Open;
        }
        match self.lock_expires_at(state) {
            Some(expires_at) if now_ms < expires_at => Gate::Locked {
                minutes_remaining: minutes_until(expires_at, now_ms),
            },
            _ => Gate::Open,
        }
    }

    /// Apply one login attempt to `state`.
    ///
    /// Attempts inside an active lock window are rejected and leave `state`
    /// untouched regardless of `attempt_succeeded`.
    pub fn evaluate(
        &self,
        state: &mut LoginState,
        attempt_succeeded: bool,
        now_ms: i64,
    ) -> LoginOutcome {
        let mut auto_unlocked = false;
        if state.is_locked {
            if let Gate::Locked { minutes_remaining } = self.gate(state, now_ms) {
                return LoginOutcome {
                    allowed: false,
                    locked: true,
                    minutes_remaining: Some(minutes_remaining),
                    failed_attempts: state.failed_attempts,
                    attempts_remaining: 0,
                    auto_unlocked: false,
                };
            }
            state.failed_attempts = 0;
            state.is_locked = false;
            state.locked_at = None;
            state.locked_until = None;
            auto_unlocked = true;
        }

        if attempt_succeeded {
            state.failed_attempts = 0;
            state.last_login = Some(now_ms);
            return LoginOutcome {
                allowed: true,
                locked: false,
                minutes_remaining: None,
                failed_attempts: 0,
                attempts_remaining: self.max_attempts,
                auto_unlocked,
            };
        }

        state.last_failed_login = Some(now_ms);
        if state.failed_attempts.saturating_add(1) >= self.max_attempts {
            let locked_until = now_ms.saturating_add(self.lock_duration_ms());
            state.failed_attempts = self.max_attempts;
            state.is_locked = true;
            state.locked_at = Some(now_ms);
            state.locked_until = Some(locked_until);
            return LoginOutcome {
                allowed: false,
                locked: true,
                minutes_remaining: Some(minutes_until(locked_until, now_ms)),
                failed_attempts: self.max_attempts,
                attempts_remaining: 0,
                auto_unlocked,
            };
        }

        state.failed_attempts += 1;
        LoginOutcome {
            allowed: false,
            locked: false,
            minutes_remaining: None,
            failed_attempts: state.failed_attempts,
            attempts_remaining: self.max_attempts - state.failed_attempts,
            auto_unlocked,
        }
    }
}

/// Clear a lock regardless of its expiry (operator unlock).
pub fn reset(state: &mut LoginState) {
    state.failed_attempts = 0;
    state.is_locked = false;
    state.locked_at = None;
    state.locked_until = None;
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn minutes_until(expires_at: i64, now_ms: i64) -> u32 {
    let remaining = (expires_at - now_ms).max(1);
    let minutes = (remaining + MINUTE_MS - 1) / MINUTE_MS;
    minutes.min(i64::from(u32::MAX)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const NOW: i64 = 1_700_000_000_000;

    #[test]
    fn success_resets_failed_counter() {
        let policy = LockoutPolicy::new(3, 30);
        let mut state = LoginState {
            failed_attempts: 2,
            ..LoginState::default()
        };

        let outcome = policy.evaluate(&mut state, true, NOW);

        assert!(outcome.allowed);
        assert_eq!(state.failed_attempts, 0);
        assert_eq!(state.last_login, Some(NOW));
    }

    #[test]
    fn third_failure_locks_with_counter_at_threshold() {
        let policy = LockoutPolicy::new(3, 30);
        let mut state = LoginState::default();

        for attempt in 1..=2 {
            let outcome = policy.evaluate(&mut state, false, NOW + attempt);
            assert!(!outcome.locked);
            assert_eq!(outcome.attempts_remaining, 3 - u32::try_from(attempt).unwrap());
        }
        assert!(!state.is_locked);

        let outcome = policy.evaluate(&mut state, false, NOW + 3);

        assert!(outcome.locked);
        assert_eq!(outcome.minutes_remaining, Some(30));
        assert_eq!(state.failed_attempts, 3);
        assert!(state.is_locked);
        assert_eq!(state.locked_at, Some(NOW + 3));
        assert_eq!(state.locked_until, Some(NOW + 3 + 30 * MINUTE_MS));
    }

    #[test]
    fn success_before_threshold_prevents_lock() {
        let policy = LockoutPolicy::new(3, 30);
        let mut state = LoginState::default();

        policy.evaluate(&mut state, false, NOW);
        policy.evaluate(&mut state, false, NOW + 1);
        policy.evaluate(&mut state, true, NOW + 2);
        let outcome = policy.evaluate(&mut state, false, NOW + 3);

        assert!(!outcome.locked);
        assert_eq!(state.failed_attempts, 1);
    }

    #[test]
    fn attempt_inside_lock_window_is_rejected_even_with_valid_credentials() {
        let policy = LockoutPolicy::new(3, 30);
        let mut state = LoginState {
            failed_attempts: 3,
            is_locked: true,
            locked_at: Some(NOW),
            locked_until: Some(NOW + 30 * MINUTE_MS),
            ..LoginState::default()
        };
        let before = state.clone();

        let outcome = policy.evaluate(&mut state, true, NOW + 10 * MINUTE_MS + 1);

        assert!(!outcome.allowed);
        assert!(outcome.locked);
        assert_eq!(outcome.minutes_remaining, Some(20));
        assert_eq!(state, before);
    }

    #[test]
    fn remaining_minutes_round_up() {
        let policy = LockoutPolicy::new(3, 30);
        let state = LoginState {
            is_locked: true,
            locked_until: Some(NOW + 1_000),
            ..LoginState::default()
        };

        assert_eq!(
            policy.gate(&state, NOW),
            Gate::Locked {
                minutes_remaining: 1
            }
        );
    }

    #[test]
    fn expired_lock_auto_unlocks_and_judges_credentials() {
        let policy = LockoutPolicy::new(3, 30);
        let locked_at = NOW - 30 * MINUTE_MS - 1_000;
        let mut state = LoginState {
            failed_attempts: 3,
            is_locked: true,
            locked_at: Some(locked_at),
            locked_until: Some(locked_at + 30 * MINUTE_MS),
            ..LoginState::default()
        };

        assert_eq!(policy.gate(&state, NOW), Gate::Open);
        let outcome = policy.evaluate(&mut state, true, NOW);

        assert!(outcome.allowed);
        assert!(!outcome.locked);
        assert!(outcome.auto_unlocked);
        assert_eq!(state.failed_attempts, 0);
        assert!(!state.is_locked);
        assert_eq!(state.locked_at, None);
    }

    #[test]
    fn failed_attempt_after_expiry_counts_from_zero() {
        let policy = LockoutPolicy::new(3, 30);
        let mut state = LoginState {
            failed_attempts: 3,
            is_locked: true,
            locked_at: Some(NOW - 31 * MINUTE_MS),
            locked_until: Some(NOW - MINUTE_MS),
            ..LoginState::default()
        };

        let outcome = policy.evaluate(&mut state, false, NOW);

        assert!(!outcome.locked);
        assert_eq!(state.failed_attempts, 1);
    }

    #[test]
    fn stored_expiry_is_not_reinterpreted_by_new_duration() {
        let state = LoginState {
            failed_attempts: 3,
            is_locked: true,
            locked_at: Some(NOW),
            locked_until: Some(NOW + 30 * MINUTE_MS),
            ..LoginState::default()
        };

        let shorter = LockoutPolicy::new(3, 5);
        assert_eq!(
            shorter.gate(&state, NOW + 10 * MINUTE_MS),
            Gate::Locked {
                minutes_remaining: 20
            }
        );
    }

    #[test]
    fn legacy_lock_without_expiry_uses_current_duration() {
        let policy = LockoutPolicy::new(3, 15);
        let state = LoginState {
            is_locked: true,
            locked_at: Some(NOW),
            ..LoginState::default()
        };

        assert_eq!(policy.lock_expires_at(&state), Some(NOW + 15 * MINUTE_MS));
    }

    #[test]
    fn lock_without_timestamps_is_cleared() {
        let policy = LockoutPolicy::new(3, 30);
        let mut state = LoginState {
            failed_attempts: 3,
            is_locked: true,
            ..LoginState::default()
        };

        let outcome = policy.evaluate(&mut state, true, NOW);

        assert!(outcome.allowed);
        assert!(outcome.auto_unlocked);
    }

    #[test]
    fn reset_clears_lock() {
        let mut state = LoginState {
            failed_attempts: 3,
            is_locked: true,
            locked_at: Some(NOW),
            locked_until: Some(NOW + 1),
            last_failed_login: Some(NOW),
            last_login: None,
        };

        reset(&mut state);

        assert_eq!(state.failed_attempts, 0);
        assert!(!state.is_locked);
        assert_eq!(state.locked_until, None);
        assert_eq!(state.last_failed_login, Some(NOW));
    }
}
