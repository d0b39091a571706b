// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Output-rate drift estimation.
//!
//! Once per output tick each stream reports the duration its last frame was
//! expected to occupy and the duration it actually occupied. Those deltas
//! feed a least-squares fit whose slope is the ratio between the stream's
//! output clock and the reference clock. Windows of frames are integrated,
//! read out, and geometrically doubled; each readout multiplies into the
//! stream's clock adjustment under progressively tighter ppm clamps so a
//! short noisy window can never yank the rate. The clock-master stream's
//! adjustment is inverted into the shared system clock adjustment; other
//! streams report theirs as their own output-rate correction.

use super::context::{RateAdjustmentKind, rate_parameters};
use super::OutputCoordinator;
use crate::core::error::Result;
use crate::core::handles::Scope;
use crate::core::policy::{Policy, PolicySource};
use crate::core::rational::Rational;
use crate::core::time::MonotonicClock;

// Ppm clamp never loosens past this exponent regardless of policy.
const MAX_CLOCK_PULLING_EXPONENT: u8 = 20;

// Window-size-derived clamp on a single readout, in parts per million.
const MAX_SINGLE_READOUT_PPM: i64 = 128;

// Long-term drift correction contribution, in parts per million.
const MAX_DRIFT_CORRECTION_PPM: i64 = 4;

impl OutputCoordinator {
    /// Feed one output tick's `(expected, actual)` durations and the
    /// current output error into the drift estimator.
    ///
    /// Returns `(output_rate_adjustment, system_clock_adjustment)`: the
    /// multiplier the caller should apply to its own output cadence, and
    /// the shared system-clock correction. The whole-playback scope is an
    /// identity passthrough reporting the current system adjustment.
    pub fn calculate_output_rate_adjustment(
        &self,
        scope: Scope,
        expected_duration: u64,
        actual_duration: u64,
        current_error: i64,
    ) -> Result<(Rational, Rational)> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let mut output_rate_adjustment = Rational::ONE;

        let Scope::Stream(handle) = scope else {
            return Ok((output_rate_adjustment, state.system_clock_adjustment));
        };
        let idx = state.context_index(handle)?;

        {
            let ctx = &mut state.contexts[idx];
            ctx.error_history.rotate_right(1);
            ctx.error_history[0] = current_error;
        }

        // First call decides which tuning profile this stream runs under.
        if state.contexts[idx].rate_adjustment_kind.is_none() {
            let external_mapping = self
                .policies
                .policy_value(Some(handle), Policy::ExternalTimeMapping);
            let kind = if external_mapping.applies() {
                RateAdjustmentKind::InputFollowing
            } else {
                RateAdjustmentKind::OutputDriven
            };

            let ctx = &mut state.contexts[idx];
            ctx.rate_parameters = rate_parameters(ctx.stream_type, kind);
            ctx.rate_adjustment_kind = Some(kind);
            // Non-masters wait for the system clock to settle before they
            // start attributing drift to themselves.
            ctx.integrating_clock_drift =
                ctx.clock_master && kind == RateAdjustmentKind::InputFollowing;
            ctx.frames_to_integrate_over = ctx.rate_parameters.minimum_integration_frames;
        }

        if !state.contexts[idx].clock_master {
            if !state.system_clock_adjustment_established {
                return Ok((output_rate_adjustment, state.system_clock_adjustment));
            }
            if state.contexts[idx].clock_adjustment_established {
                output_rate_adjustment = state.contexts[idx].clock_adjustment;
            }
        }

        let difference = expected_duration.wrapping_sub(actual_duration) as i64;

        state.contexts[idx].integration_count += 1;

        if state.contexts[idx].integrating_clock_drift {
            state.contexts[idx]
                .least_squares
                .add(expected_duration as i64, actual_duration as i64);

            let jitter_ok = {
                let p = &state.contexts[idx].rate_parameters;
                (-p.maximum_jitter_difference..=p.maximum_jitter_difference).contains(&difference)
            };

            if jitter_ok
                && state.contexts[idx].integration_count
                    >= state.contexts[idx].frames_to_integrate_over
            {
                let mut current_error = current_error;

                let pulling_exponent = self
                    .policies
                    .policy_value(Some(handle), Policy::ClockPullingLimit2ToTheNPartsPerMillion)
                    .exponent()
                    .min(MAX_CLOCK_PULLING_EXPONENT);
                let maximum_ppm = 1i64 << pulling_exponent;
                let maximum_rate_multiplier = Rational::new(1_000_000 + maximum_ppm, 1_000_000);
                let minimum_rate_multiplier = Rational::new(1_000_000 - maximum_ppm, 1_000_000);

                // The single-readout clamp tightens as the window grows:
                // long windows are trusted, short ones are not.
                let mut adjustment_multiplier = state.contexts[idx].least_squares.gradient();
                let window_ratio = (state.contexts[idx].rate_parameters.maximum_integration_frames
                    / state.contexts[idx].frames_to_integrate_over)
                    as i64;
                let clamp_ppm = (4 * window_ratio * window_ratio).min(MAX_SINGLE_READOUT_PPM);
                adjustment_multiplier = adjustment_multiplier.clamp_to(
                    Rational::ONE - Rational::new(clamp_ppm, 1_000_000),
                    Rational::ONE + Rational::new(clamp_ppm, 1_000_000),
                );

                {
                    let ctx = &mut state.contexts[idx];
                    ctx.clock_adjustment = if ctx.clock_adjustment_established {
                        ctx.clock_adjustment * adjustment_multiplier
                    } else {
                        adjustment_multiplier
                    };
                    ctx.clock_adjustment_established = true;
                }

                // A rate change applied from "now" leaves the error accrued
                // under the old rate in place. Smooth the discontinuity by
                // shifting the master base through half the change's effect
                // over the elapsed base period.
                if state.contexts[idx].clock_master {
                    let system_change = state.contexts[idx].clock_adjustment.recip()
                        - state.system_clock_adjustment;
                    let elapsed = self
                        .clock
                        .now_us()
                        .wrapping_sub(state.master_base_system_time)
                        as i64;
                    let jerk = system_change.scale(elapsed) / 2;
                    state.master_base_system_time =
                        state.master_base_system_time.wrapping_sub(jerk as u64);
                    current_error -= jerk;
                }

                // Long-term drift correction: once the window is mature,
                // bleed half the standing error away over the next window.
                if state.contexts[idx].frames_to_integrate_over
                    >= state.contexts[idx]
                        .rate_parameters
                        .integration_threshold_for_drift_correction
                {
                    let anticipated_drift_correction = -current_error / 2;
                    let correction_period = if state.contexts[idx].frames_to_integrate_over
                        < state.contexts[idx].rate_parameters.maximum_integration_frames
                    {
                        2 * state.contexts[idx].least_squares.cumulative_y()
                    } else {
                        state.contexts[idx].least_squares.cumulative_y()
                    };
                    if correction_period != 0 {
                        let drift_adjustment =
                            Rational::new(anticipated_drift_correction, correction_period)
                                .clamp_to(
                                    Rational::new(-MAX_DRIFT_CORRECTION_PPM, 1_000_000),
                                    Rational::new(MAX_DRIFT_CORRECTION_PPM, 1_000_000),
                                );
                        let ctx = &mut state.contexts[idx];
                        ctx.clock_adjustment = ctx.clock_adjustment + drift_adjustment;
                    }
                }

                {
                    let ctx = &mut state.contexts[idx];
                    ctx.clock_adjustment = ctx
                        .clock_adjustment
                        .clamp_to(minimum_rate_multiplier, maximum_rate_multiplier);
                }

                // Speeding a master stream up means slowing the shared
                // system clock down, and vice versa.
                if state.contexts[idx].clock_master {
                    state.system_clock_adjustment = state.contexts[idx].clock_adjustment.recip();
                    state.system_clock_adjustment_established = true;
                } else if state.system_clock_adjustment_established {
                    output_rate_adjustment = state.contexts[idx].clock_adjustment;
                }

                tracing::debug!(
                    "{} stream clock adjustment {} over {} frames (error history {:?})",
                    state.contexts[idx].stream_type.as_str(),
                    state.contexts[idx].clock_adjustment,
                    state.contexts[idx].frames_to_integrate_over,
                    state.contexts[idx].error_history,
                );

                // Set up the idle stretch before the next, longer window.
                let ctx = &mut state.contexts[idx];
                ctx.last_integration_was_restarted = false;
                ctx.integrating_clock_drift = false;
                if ctx.frames_to_integrate_over < ctx.rate_parameters.maximum_integration_frames {
                    ctx.frames_to_integrate_over *= 2;
                }
                ctx.integration_count = 0;
            }
        } else if state.contexts[idx].integration_count
            >= state.contexts[idx].rate_parameters.ignore_between_integrations
        {
            let ctx = &mut state.contexts[idx];
            ctx.integrating_clock_drift = true;
            ctx.integration_count = 0;
            ctx.least_squares.reset();
        }

        Ok((output_rate_adjustment, state.system_clock_adjustment))
    }

    /// Abort the current integration window, e.g. after a discontinuity
    /// made its samples worthless. Only a *second consecutive* forced
    /// restart shrinks the window, so spurious restarts cannot collapse it.
    pub fn restart_output_rate_integration(
        &self,
        handle: crate::core::handles::StreamHandle,
    ) -> Result<()> {
        let mut guard = self.state.lock();
        let ctx = guard.context_mut(handle)?;

        if ctx.last_integration_was_restarted {
            ctx.frames_to_integrate_over = (ctx.frames_to_integrate_over / 2)
                .max(ctx.rate_parameters.minimum_integration_frames);
        }

        ctx.integrating_clock_drift = false;
        ctx.integration_count = 0;
        ctx.last_integration_was_restarted = true;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::core::policy::PolicyValue;

    fn drift_rig() -> (Rig, crate::core::handles::StreamHandle) {
        let rig = rig();
        // Audio drives the clock, with an external mapping so the master
        // integrates from the first tick, and generous pulling headroom.
        rig.policies
            .set_policy(None, Policy::MasterClock, PolicyValue::AudioClockMaster);
        rig.policies
            .set_policy(None, Policy::ExternalTimeMapping, PolicyValue::Apply);
        rig.policies.set_policy(
            None,
            Policy::ClockPullingLimit2ToTheNPartsPerMillion,
            PolicyValue::Exponent(10),
        );
        let audio = register_audio(&rig);
        rig.coordinator
            .establish_time_mapping(Scope::Playback, 0, Some(rig.clock.now_us()))
            .unwrap();
        (rig, audio)
    }

    #[test]
    fn test_playback_scope_is_identity_passthrough() {
        let rig = rig();
        let _audio = register_audio(&rig);
        let (output, system) = rig
            .coordinator
            .calculate_output_rate_adjustment(Scope::Playback, 40_000, 40_000, 0)
            .unwrap();
        assert!(output.is_one());
        assert!(system.is_one());
    }

    #[test]
    fn test_master_converges_toward_measured_drift() {
        let (rig, audio) = drift_rig();

        // The output clock runs 1000 ppm slow: 40ms frames take 40.04ms.
        let mut readouts = Vec::new();
        let mut last_system = Rational::ONE;
        for _ in 0..1000 {
            let (_, system) = rig
                .coordinator
                .calculate_output_rate_adjustment(Scope::Stream(audio), 40_000, 40_040, 0)
                .unwrap();
            if system != last_system {
                readouts.push(system);
                last_system = system;
            }
        }

        // First window (128 frames) reads out a 128ppm-clamped step, the
        // next (256 frames after a 64-frame idle) compounds it further.
        assert!(readouts.len() >= 2, "expected at least two readouts");
        assert!(
            readouts[0] < Rational::ONE,
            "a slow output clock slows the system clock, got {}",
            readouts[0]
        );
        assert!(
            readouts[1] < readouts[0],
            "successive readouts compound toward the measured drift"
        );

        let state = rig.coordinator.lock_state();
        let ctx = state.context(audio).unwrap();
        assert!(ctx.clock_adjustment_established);
        assert!(ctx.clock_adjustment > Rational::ONE);
        assert!(ctx.clock_adjustment < Rational::new(1_001_000, 1_000_000) + Rational::new(1, 1_000_000));
        // The window doubled after each readout.
        assert!(ctx.frames_to_integrate_over >= 512);
    }

    #[test]
    fn test_first_readout_is_ppm_clamped() {
        let (rig, audio) = drift_rig();

        // A wild 10% rate mismatch must not slam the clock: the first
        // 128-frame window is clamped to 128 ppm.
        let mut system = Rational::ONE;
        for _ in 0..128 {
            (_, system) = rig
                .coordinator
                .calculate_output_rate_adjustment(Scope::Stream(audio), 40_000, 40_100, 0)
                .unwrap();
        }
        let state = rig.coordinator.lock_state();
        let ctx = state.context(audio).unwrap();
        assert_eq!(ctx.clock_adjustment, Rational::new(1_000_128, 1_000_000));
        assert_eq!(system, ctx.clock_adjustment.recip());
    }

    #[test]
    fn test_excess_jitter_defers_readout() {
        let (rig, audio) = drift_rig();

        for _ in 0..127 {
            rig.coordinator
                .calculate_output_rate_adjustment(Scope::Stream(audio), 40_000, 40_040, 0)
                .unwrap();
        }
        // The 128th sample arrives with jitter beyond the 256us tolerance:
        // the window stays open instead of reading out.
        rig.coordinator
            .calculate_output_rate_adjustment(Scope::Stream(audio), 40_000, 41_000, 0)
            .unwrap();

        let state = rig.coordinator.lock_state();
        let ctx = state.context(audio).unwrap();
        assert!(!ctx.clock_adjustment_established);
        assert!(ctx.integrating_clock_drift);
        drop(state);

        // A clean sample right after completes it.
        rig.coordinator
            .calculate_output_rate_adjustment(Scope::Stream(audio), 40_000, 40_040, 0)
            .unwrap();
        let state = rig.coordinator.lock_state();
        assert!(state.context(audio).unwrap().clock_adjustment_established);
    }

    #[test]
    fn test_standing_error_bleeds_through_drift_correction() {
        let (rig, audio) = drift_rig();

        // No rate mismatch at all, but a standing -4ms output error. The
        // long-term corrector nudges the adjustment by its clamped 4 ppm.
        for _ in 0..128 {
            rig.coordinator
                .calculate_output_rate_adjustment(Scope::Stream(audio), 40_000, 40_000, -4_000)
                .unwrap();
        }

        let state = rig.coordinator.lock_state();
        let ctx = state.context(audio).unwrap();
        assert_eq!(ctx.clock_adjustment, Rational::new(1_000_004, 1_000_000));
        assert_eq!(
            state.system_clock_adjustment,
            Rational::new(1_000_000, 1_000_004)
        );
    }

    #[test]
    fn test_non_master_reports_identity_until_established() {
        let rig = rig();
        let audio = register_audio(&rig);

        // Default policy: system clock is master, the stream is not. The
        // system adjustment is established (identity), so the stream
        // integrates its own drift: 64 idle ticks, then a 512-frame window
        // (output-driven audio profile).
        let mut output = Rational::ONE;
        for _ in 0..(64 + 512) {
            (output, _) = rig
                .coordinator
                .calculate_output_rate_adjustment(Scope::Stream(audio), 40_000, 40_040, 0)
                .unwrap();
        }

        let state = rig.coordinator.lock_state();
        let ctx = state.context(audio).unwrap();
        assert!(ctx.clock_adjustment_established);
        assert_eq!(output, ctx.clock_adjustment);
        assert!(output > Rational::ONE);
        // A non-master never touches the shared system clock.
        assert!(state.system_clock_adjustment.is_one());
    }

    #[test]
    fn test_error_history_rolls() {
        let (rig, audio) = drift_rig();
        for error in [10, 20, 30, 40, 50] {
            rig.coordinator
                .calculate_output_rate_adjustment(Scope::Stream(audio), 40_000, 40_040, error)
                .unwrap();
        }
        let state = rig.coordinator.lock_state();
        assert_eq!(state.context(audio).unwrap().error_history, [50, 40, 30, 20]);
    }

    #[test]
    fn test_restart_halves_window_only_on_second_consecutive_restart() {
        let (rig, audio) = drift_rig();
        {
            let mut state = rig.coordinator.lock_state();
            state.context_mut(audio).unwrap().frames_to_integrate_over = 512;
        }

        rig.coordinator
            .restart_output_rate_integration(audio)
            .unwrap();
        {
            let state = rig.coordinator.lock_state();
            let ctx = state.context(audio).unwrap();
            assert_eq!(ctx.frames_to_integrate_over, 512, "first restart keeps the window");
            assert!(!ctx.integrating_clock_drift);
            assert!(ctx.last_integration_was_restarted);
        }

        rig.coordinator
            .restart_output_rate_integration(audio)
            .unwrap();
        let state = rig.coordinator.lock_state();
        assert_eq!(
            state.context(audio).unwrap().frames_to_integrate_over,
            256,
            "a second consecutive restart halves it"
        );
    }

    #[test]
    fn test_restart_never_shrinks_below_minimum() {
        let (rig, audio) = drift_rig();
        for _ in 0..8 {
            rig.coordinator
                .restart_output_rate_integration(audio)
                .unwrap();
        }
        let state = rig.coordinator.lock_state();
        let ctx = state.context(audio).unwrap();
        assert_eq!(
            ctx.frames_to_integrate_over,
            ctx.rate_parameters.minimum_integration_frames
        );
    }
}
