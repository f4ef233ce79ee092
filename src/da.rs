// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Dictionary attack protection.

use crate::{
    config::DaConfig,
    error::TpmRcBase,
    handle::TPM_RH_LOCKOUT,
    util::{Reader, Writer},
};
use log::{debug, warn};

/// Failure counter, self-healing timers and lockout-authorization state.
///
/// `failed_tries`, the parameters and `lockout_auth_enabled` are
/// persistent. The timers are relative to the platform clock and restart
/// on every Startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaState {
    pub failed_tries: u32,
    pub max_tries: u32,
    pub recovery_time: u32,
    pub lockout_recovery: u32,
    pub lockout_auth_enabled: bool,
    self_heal_timer: u64,
    lockout_timer: u64,
}

impl DaState {
    #[must_use]
    pub fn new(config: &DaConfig) -> Self {
        Self {
            failed_tries: 0,
            max_tries: config.max_tries,
            recovery_time: config.recovery_time,
            lockout_recovery: config.lockout_recovery,
            lockout_auth_enabled: true,
            self_heal_timer: 0,
            lockout_timer: 0,
        }
    }

    /// The derived lockout condition for ordinary DA-protected entities.
    #[must_use]
    pub fn is_locked_out(&self) -> bool {
        self.recovery_time != 0 && self.failed_tries >= self.max_tries
    }

    /// Checks whether an authorization may be attempted.
    ///
    /// `lockout_auth` selects the check for the lockout hierarchy's own
    /// authorization.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Lockout` when the authorization is locked out.
    pub fn check_locked_out(&self, lockout_auth: bool) -> Result<(), TpmRcBase> {
        let locked = if lockout_auth {
            !self.lockout_auth_enabled
        } else {
            self.is_locked_out()
        };
        if locked {
            Err(TpmRcBase::Lockout)
        } else {
            Ok(())
        }
    }

    /// Records a failed authorization of a DA-protected entity.
    pub fn register_failure(&mut self, handle: u32, now: u64) {
        if handle == TPM_RH_LOCKOUT {
            self.lockout_auth_enabled = false;
            self.lockout_timer = now;
            warn!(target: "tpm2sim::da", "lockout authorization disabled");
        } else {
            if self.recovery_time != 0 {
                self.failed_tries = self.failed_tries.saturating_add(1);
            }
            self.self_heal_timer = now;
            debug!(target: "tpm2sim::da", "failed tries: {}", self.failed_tries);
        }
    }

    /// Applies elapsed self-healing time. Returns `true` when persistent
    /// state changed.
    pub fn self_heal(&mut self, now: u64) -> bool {
        let mut changed = false;
        if self.failed_tries != 0 && self.recovery_time != 0 {
            let elapsed_secs = now.saturating_sub(self.self_heal_timer) / 1000;
            let decrease = elapsed_secs / u64::from(self.recovery_time);
            if decrease != 0 {
                let decrease_u32 = u32::try_from(decrease).unwrap_or(u32::MAX);
                self.failed_tries = self.failed_tries.saturating_sub(decrease_u32);
                self.self_heal_timer = self.self_heal_timer.saturating_add(
                    decrease.saturating_mul(u64::from(self.recovery_time) * 1000),
                );
                changed = true;
            }
        }
        if !self.lockout_auth_enabled && self.lockout_recovery != 0 {
            let elapsed_secs = now.saturating_sub(self.lockout_timer) / 1000;
            if elapsed_secs >= u64::from(self.lockout_recovery) {
                self.lockout_auth_enabled = true;
                changed = true;
            }
        }
        changed
    }

    /// Startup processing. A shutdown that was not orderly counts as one
    /// failure.
    pub fn startup(&mut self, now: u64, orderly: bool) {
        self.self_heal_timer = now;
        self.lockout_timer = now;
        if self.lockout_recovery == 0 {
            self.lockout_auth_enabled = true;
        }
        if !orderly && self.recovery_time != 0 && self.failed_tries < self.max_tries {
            self.failed_tries += 1;
            warn!(target: "tpm2sim::da", "unorderly shutdown, failed tries: {}", self.failed_tries);
        }
    }

    /// `TPM2_DictionaryAttackLockReset`.
    pub fn lock_reset(&mut self, now: u64) {
        self.failed_tries = 0;
        self.self_heal_timer = now;
    }

    /// `TPM2_DictionaryAttackParameters`.
    pub fn set_parameters(
        &mut self,
        max_tries: u32,
        recovery_time: u32,
        lockout_recovery: u32,
        now: u64,
    ) {
        self.max_tries = max_tries;
        self.recovery_time = recovery_time;
        self.lockout_recovery = lockout_recovery;
        self.failed_tries = 0;
        self.self_heal_timer = now;
        self.lockout_timer = now;
    }

    pub(crate) fn write_to(&self, w: &mut Writer) {
        w.u32(self.failed_tries)
            .u32(self.max_tries)
            .u32(self.recovery_time)
            .u32(self.lockout_recovery)
            .u8(u8::from(self.lockout_auth_enabled));
    }

    pub(crate) fn read_from(r: &mut Reader<'_>) -> Result<Self, TpmRcBase> {
        Ok(Self {
            failed_tries: r.u32()?,
            max_tries: r.u32()?,
            recovery_time: r.u32()?,
            lockout_recovery: r.u32()?,
            lockout_auth_enabled: r.u8()? != 0,
            self_heal_timer: 0,
            lockout_timer: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn da(max_tries: u32, recovery_time: u32, lockout_recovery: u32) -> DaState {
        DaState::new(&DaConfig {
            max_tries,
            recovery_time,
            lockout_recovery,
        })
    }

    #[test]
    fn test_lockout_after_max_tries() {
        let mut state = da(3, 10, 20);
        for _ in 0..3 {
            assert!(state.check_locked_out(false).is_ok());
            state.register_failure(crate::handle::TPM_RH_OWNER, 0);
        }
        assert_eq!(state.check_locked_out(false), Err(TpmRcBase::Lockout));
        assert!(!state.self_heal(9_999));
        assert!(state.self_heal(10_000));
        assert_eq!(state.failed_tries, 2);
        assert!(state.check_locked_out(false).is_ok());
    }

    #[rstest]
    #[case(0, 1_000_000, false)]
    #[case(20, 19_999, false)]
    #[case(20, 20_000, true)]
    fn test_lockout_auth_recovery(#[case] recovery: u32, #[case] now: u64, #[case] enabled: bool) {
        let mut state = da(3, 10, recovery);
        state.register_failure(TPM_RH_LOCKOUT, 0);
        state.self_heal(now);
        assert_eq!(state.lockout_auth_enabled, enabled);
        assert_eq!(state.check_locked_out(true).is_ok(), enabled);
    }

    #[test]
    fn test_zero_recovery_time_never_counts() {
        let mut state = da(1, 0, 10);
        state.register_failure(crate::handle::TPM_RH_OWNER, 0);
        assert_eq!(state.failed_tries, 0);
        assert!(state.check_locked_out(false).is_ok());
    }

    #[test]
    fn test_unorderly_startup() {
        let mut state = da(3, 10, 10);
        state.startup(0, false);
        assert_eq!(state.failed_tries, 1);
        state.startup(0, true);
        assert_eq!(state.failed_tries, 1);
    }
}
