// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Broadcast source clock recovery.
//!
//! Live broadcast sources carry their own clock (e.g. a transport stream's
//! PCR). When policy makes the system clock the playback master, the local
//! clock must be steered to the broadcast one or buffers drain/overflow
//! over time. Observations of (source time, local arrival time) feed a
//! least-squares fit over a geometrically growing window; the slope becomes
//! the system clock adjustment, and the fitted line doubles as a source
//! clock estimator for the application. Recovery is also allowed when the
//! system clock is not master, for application use only.

use super::{CoordinatorState, OutputCoordinator};
use crate::core::error::{Result, SyncError};
use crate::core::least_squares::LeastSquaresFit;
use crate::core::policy::{Policy, PolicySource, PolicyValue};
use crate::core::rational::Rational;
use crate::core::time::{INVALID_TIME, MonotonicClock};
use serde::{Deserialize, Serialize};

pub(crate) const CLOCK_RECOVERY_MINIMUM_POINTS: u32 = 4;
pub(crate) const CLOCK_RECOVERY_MINIMUM_INTEGRATION_TIME: u64 = 2_000_000;
pub(crate) const CLOCK_RECOVERY_MAXIMUM_INTEGRATION_TIME: u64 = 512_000_000;

// 33-bit PTS wraparound detection: the top two bits flip between all-set
// and all-clear across a wrap.
const PTS_WRAP_MASK: u64 = 0x0000_0001_8000_0000;
const PTS_WRAP_OFFSET: u64 = 0x0000_0002_0000_0000;
const PTS_VALUE_MASK: u64 = 0x0000_0001_ffff_ffff;

/// Format of the source timestamps fed to clock recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeFormat {
    /// Microseconds, already normalized.
    Microseconds,
    /// Native 33-bit PTS/PCR ticks (90kHz base), wrapping.
    Pts,
}

pub(crate) struct ClockRecoveryState {
    pub initialized: bool,
    pub source_time_format: TimeFormat,

    pub last_pts: u64,
    pub pts_baseline: u64,

    pub base_source_clock: u64,
    pub base_local_clock: u64,
    pub accumulated_points: u32,
    pub fit: LeastSquaresFit,

    pub established_gradient: Rational,
    pub established_base_source: u64,
    pub established_base_local: u64,

    pub integration_time: u64,
}

impl ClockRecoveryState {
    pub fn new() -> Self {
        Self {
            initialized: false,
            source_time_format: TimeFormat::Microseconds,
            last_pts: INVALID_TIME,
            pts_baseline: 0,
            base_source_clock: INVALID_TIME,
            base_local_clock: INVALID_TIME,
            accumulated_points: 0,
            fit: LeastSquaresFit::new(),
            established_gradient: Rational::ZERO,
            established_base_source: INVALID_TIME,
            established_base_local: INVALID_TIME,
            integration_time: CLOCK_RECOVERY_MINIMUM_INTEGRATION_TIME,
        }
    }
}

impl OutputCoordinator {
    /// Reset clock recovery and begin accumulating from scratch, assuming
    /// the local clock is 1:1 with the source until learned otherwise.
    pub fn clock_recovery_initialize(&self, source_time_format: TimeFormat) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let recovery = &mut state.recovery;
        recovery.source_time_format = source_time_format;
        recovery.last_pts = INVALID_TIME;
        recovery.pts_baseline = 0;
        recovery.base_source_clock = INVALID_TIME;
        recovery.base_local_clock = INVALID_TIME;
        recovery.established_gradient = Rational::ZERO;
        recovery.established_base_source = INVALID_TIME;
        recovery.established_base_local = INVALID_TIME;
        recovery.initialized = true;
        recovery.integration_time = CLOCK_RECOVERY_MINIMUM_INTEGRATION_TIME;

        // Only a policy-master system clock gets reset here; otherwise the
        // recovered clock is informational and the playback clock stays
        // wherever the stream masters put it.
        let master_clock = self.policies.policy_value(None, Policy::MasterClock);
        if master_clock != PolicyValue::SystemClockMaster {
            tracing::warn!("performing clock recovery while the system clock is not master");
            tracing::warn!("the recovered clock is provided for application use only");
            return Ok(());
        }

        state.system_clock_adjustment_established = true;
        state.system_clock_adjustment = Rational::ONE;
        Ok(())
    }

    /// Feed one (source time, local time) observation.
    ///
    /// Once at least [`CLOCK_RECOVERY_MINIMUM_POINTS`] points span the
    /// current integration window, the fit is read out as the established
    /// source-clock model, the window doubles (up to its cap), and - when
    /// the system clock is policy master - the slope becomes the new
    /// system clock adjustment.
    pub fn clock_recovery_data_point(&self, source_time: u64, local_time: u64) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if !state.recovery.initialized {
            tracing::error!("clock recovery data point before initialization");
            return Err(SyncError::ClockRecoveryNotInitialized);
        }

        let normalized_source_time = match state.recovery.source_time_format {
            TimeFormat::Microseconds => source_time,
            TimeFormat::Pts => {
                let recovery = &mut state.recovery;
                if recovery.last_pts == INVALID_TIME {
                    recovery.last_pts = source_time;
                }

                if (recovery.last_pts & PTS_WRAP_MASK) == PTS_WRAP_MASK
                    && (source_time & PTS_WRAP_MASK) == 0
                {
                    recovery.pts_baseline = recovery.pts_baseline.wrapping_add(PTS_WRAP_OFFSET);
                } else if (recovery.last_pts & PTS_WRAP_MASK) == 0
                    && (source_time & PTS_WRAP_MASK) == PTS_WRAP_MASK
                {
                    recovery.pts_baseline = recovery.pts_baseline.wrapping_sub(PTS_WRAP_OFFSET);
                }

                recovery.last_pts = source_time;

                // 90kHz ticks to microseconds: x300/27 with rounding bias.
                recovery
                    .pts_baseline
                    .wrapping_add(source_time)
                    .wrapping_mul(300)
                    .wrapping_add(13)
                    / 27
            }
        };

        let readout = {
            let recovery = &mut state.recovery;

            if recovery.base_source_clock == INVALID_TIME {
                recovery.base_source_clock = normalized_source_time;
                recovery.base_local_clock = local_time;
                recovery.accumulated_points = 0;
                recovery.fit.reset();

                if recovery.established_base_source == INVALID_TIME {
                    // First point ever: the minimum needed to guess at the
                    // source clock is a 1:1 line through it.
                    recovery.established_gradient = Rational::ONE;
                    recovery.established_base_source = recovery.base_source_clock;
                    recovery.established_base_local = recovery.base_local_clock;
                }
            }

            // Accumulate delta-encoded, so the fit's coordinates stay small.
            let source_delta = normalized_source_time.wrapping_sub(
                recovery
                    .base_source_clock
                    .wrapping_add(recovery.fit.cumulative_y() as u64),
            ) as i64;
            let local_delta = local_time.wrapping_sub(
                recovery
                    .base_local_clock
                    .wrapping_add(recovery.fit.cumulative_x() as u64),
            ) as i64;

            recovery.fit.add(local_delta, source_delta);
            recovery.accumulated_points += 1;

            if recovery.accumulated_points >= CLOCK_RECOVERY_MINIMUM_POINTS
                && recovery.fit.cumulative_x() as u64 >= recovery.integration_time
            {
                recovery.established_gradient = recovery.fit.gradient();
                recovery.established_base_source = recovery
                    .base_source_clock
                    .wrapping_add_signed(recovery.fit.intercept().rounded());
                recovery.established_base_local = recovery.base_local_clock;

                recovery.last_pts = INVALID_TIME;
                recovery.pts_baseline = 0;
                recovery.base_source_clock = INVALID_TIME;
                recovery.base_local_clock = INVALID_TIME;

                if recovery.integration_time < CLOCK_RECOVERY_MAXIMUM_INTEGRATION_TIME {
                    recovery.integration_time *= 2;
                }

                Some(recovery.established_gradient)
            } else {
                None
            }
        };

        if let Some(gradient) = readout {
            let master_clock = self.policies.policy_value(None, Policy::MasterClock);
            if master_clock == PolicyValue::SystemClockMaster {
                state.system_clock_adjustment_established = true;
                state.system_clock_adjustment = gradient;
                tracing::debug!("clock recovery adjusted the system clock to {gradient}");
            }
        }

        Ok(())
    }

    /// Project the established source-clock model to "now".
    ///
    /// Returns `(estimated source time, local time)`, the source estimate
    /// converted back to the configured format. Rebases the model once the
    /// extrapolation grows large, to bound fixed-point range.
    pub fn clock_recovery_estimate(&self) -> Result<(u64, u64)> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if !state.recovery.initialized {
            tracing::error!("clock recovery estimate before initialization");
            return Err(SyncError::ClockRecoveryNotInitialized);
        }
        if state.recovery.established_base_source == INVALID_TIME {
            tracing::error!("no basis on which to estimate the recovered clock");
            return Err(SyncError::MappingNotEstablished);
        }

        let now = self.clock.now_us();
        let recovery = &mut state.recovery;

        let elapsed_local = now.wrapping_sub(recovery.established_base_local) as i64;
        let elapsed_source = recovery.established_gradient.scale_rounded(elapsed_local);
        let estimated_source_time = recovery
            .established_base_source
            .wrapping_add(elapsed_source as u64);

        if elapsed_source > (2i64 << 29) {
            recovery.established_base_local = now;
            recovery.established_base_source = estimated_source_time;
        }

        let source_time = match recovery.source_time_format {
            TimeFormat::Microseconds => estimated_source_time,
            TimeFormat::Pts => {
                (estimated_source_time.wrapping_mul(27).wrapping_add(150) / 300) & PTS_VALUE_MASK
            }
        };

        Ok((source_time, now))
    }
}

// Keep the raw state reachable for the rest of the coordinator.
impl CoordinatorState {
    #[cfg(test)]
    pub(crate) fn recovery(&self) -> &ClockRecoveryState {
        &self.recovery
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;

    #[test]
    fn test_data_point_requires_initialization() {
        let rig = rig();
        assert!(matches!(
            rig.coordinator.clock_recovery_data_point(0, 0),
            Err(SyncError::ClockRecoveryNotInitialized)
        ));
        assert!(matches!(
            rig.coordinator.clock_recovery_estimate(),
            Err(SyncError::ClockRecoveryNotInitialized)
        ));
    }

    #[test]
    fn test_estimate_needs_at_least_one_point() {
        let rig = rig();
        rig.coordinator
            .clock_recovery_initialize(TimeFormat::Microseconds)
            .unwrap();
        assert!(matches!(
            rig.coordinator.clock_recovery_estimate(),
            Err(SyncError::MappingNotEstablished)
        ));

        // A single point is enough for a 1:1 guess.
        rig.coordinator
            .clock_recovery_data_point(7_000_000, rig.clock.now_us())
            .unwrap();
        rig.clock.advance(250_000);
        let (source, local) = rig.coordinator.clock_recovery_estimate().unwrap();
        assert_eq!(local, rig.clock.now_us());
        assert_eq!(source, 7_250_000);
    }

    #[test]
    fn test_recovered_gradient_drives_system_clock() {
        let rig = rig();
        rig.coordinator
            .clock_recovery_initialize(TimeFormat::Microseconds)
            .unwrap();

        // Source clock runs 500 ppm fast relative to local.
        let local_start = rig.clock.now_us();
        let source_start = 40_000_000u64;
        for k in 0..5u64 {
            let local = local_start + k * 500_000;
            let source = source_start + k * 500_250;
            rig.clock.advance(if k == 0 { 0 } else { 500_000 });
            rig.coordinator
                .clock_recovery_data_point(source, local)
                .unwrap();
        }

        let state = rig.coordinator.lock_state();
        assert_eq!(
            state.system_clock_adjustment,
            Rational::new(500_250, 500_000),
            "the fitted slope becomes the system clock adjustment"
        );
        assert!(state.system_clock_adjustment_established);
        // The window doubled after the readout.
        assert_eq!(state.recovery().integration_time, 4_000_000);
        drop(state);

        // The estimator extrapolates on the fitted line.
        rig.clock.advance(1_000_000);
        let (source, _) = rig.coordinator.clock_recovery_estimate().unwrap();
        let expected = source_start + 4 * 500_250 + 1_000_500;
        assert!(
            (source as i64 - expected as i64).abs() <= 2,
            "estimated {source}, expected about {expected}"
        );
    }

    #[test]
    fn test_not_master_leaves_system_clock_alone() {
        let rig = rig();
        rig.policies
            .set_policy(None, Policy::MasterClock, PolicyValue::AudioClockMaster);
        rig.coordinator
            .clock_recovery_initialize(TimeFormat::Microseconds)
            .unwrap();

        let local_start = rig.clock.now_us();
        for k in 0..5u64 {
            rig.coordinator
                .clock_recovery_data_point(k * 510_000, local_start + k * 500_000)
                .unwrap();
        }

        let state = rig.coordinator.lock_state();
        assert!(
            state.system_clock_adjustment.is_one(),
            "recovery is informational when the system clock is not master"
        );
        // The model itself is still established for application queries.
        assert_ne!(state.recovery().established_base_source, INVALID_TIME);
    }

    #[test]
    fn test_pts_normalization_and_estimate_roundtrip() {
        let rig = rig();
        rig.coordinator
            .clock_recovery_initialize(TimeFormat::Pts)
            .unwrap();

        // 90kHz ticks advancing exactly in step with local microseconds:
        // 45000 ticks per 500ms.
        let local_start = rig.clock.now_us();
        for k in 0..5u64 {
            rig.coordinator
                .clock_recovery_data_point(90_000 + k * 45_000, local_start + k * 500_000)
                .unwrap();
        }
        rig.clock.advance(4 * 500_000);

        // Two seconds past the window start the source reads 4.5s of ticks
        // past the initial 1s worth.
        rig.clock.advance(500_000);
        let (source, _) = rig.coordinator.clock_recovery_estimate().unwrap();
        assert!(
            (source as i64 - (90_000 + 5 * 45_000) as i64).abs() <= 2,
            "estimated {source} ticks"
        );
    }

    #[test]
    fn test_pts_wraparound_is_bridged() {
        let rig = rig();
        rig.coordinator
            .clock_recovery_initialize(TimeFormat::Pts)
            .unwrap();

        // Two ticks on either side of the 33-bit wrap point.
        let local_start = rig.clock.now_us();
        let before_wrap = (1u64 << 33) - 45_000;
        rig.coordinator
            .clock_recovery_data_point(before_wrap, local_start)
            .unwrap();
        rig.coordinator
            .clock_recovery_data_point(45_000, local_start + 1_000_000)
            .unwrap();

        let state = rig.coordinator.lock_state();
        assert_eq!(
            state.recovery().pts_baseline,
            1u64 << 33,
            "crossing the wrap lifts the baseline by 2^33"
        );
    }

    #[test]
    fn test_estimate_rebases_after_long_extrapolation() {
        let rig = rig();
        rig.coordinator
            .clock_recovery_initialize(TimeFormat::Microseconds)
            .unwrap();
        rig.coordinator
            .clock_recovery_data_point(0, rig.clock.now_us())
            .unwrap();

        // Extrapolate past the rebase horizon (2^30 us).
        rig.clock.advance((2 << 29) + 1_000_000);
        let (source, local) = rig.coordinator.clock_recovery_estimate().unwrap();

        let state = rig.coordinator.lock_state();
        assert_eq!(state.recovery().established_base_local, local);
        assert_eq!(state.recovery().established_base_source, source);
    }

    #[test]
    fn test_initialize_resets_system_clock_when_master() {
        let rig = rig();
        {
            let mut state = rig.coordinator.lock_state();
            state.system_clock_adjustment = Rational::new(1_000_100, 1_000_000);
        }
        rig.coordinator
            .clock_recovery_initialize(TimeFormat::Microseconds)
            .unwrap();
        assert!(rig.coordinator.lock_state().system_clock_adjustment.is_one());
    }
}
