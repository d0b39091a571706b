// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Vsync offset measurement.
//!
//! The display refreshes on its own grid; frames queued for time T actually
//! hit the glass at the next refresh at or after T. Over a fixed window of
//! frames (first half settling, second half measuring) the minimum observed
//! `actual - requested` output offset approximates the phase difference
//! between the mapping and the refresh grid. Unless the display is
//! genlocked, that phase is folded back into the shared mapping base so
//! frame deadlines land on refresh instants.

use super::OutputCoordinator;
use crate::core::error::{Result, VsyncMonitorState};
use crate::core::events::{CoordinatorEvent, EventCode};
use crate::core::handles::{Scope, StreamHandle};
use crate::core::manifestor::Manifestor;
use crate::core::policy::{Policy, PolicySource};

/// Samples in each half of the measurement window.
const VSYNC_OFFSET_INTEGRATION_COUNT: u32 = 4;

impl OutputCoordinator {
    /// Record one frame's requested vs. actual output time.
    ///
    /// Returns `Accumulating` until the window completes, then `Complete`
    /// (also for every subsequent call; the window does not re-arm until a
    /// new time mapping is established). Window completion measures the
    /// offset, applies it through the mapping base unless the vsync-locked
    /// policy forbids that, and always raises a measurement event.
    pub fn monitor_vsync_offset(
        &self,
        handle: StreamHandle,
        requested_output_time: u64,
        actual_output_time: u64,
    ) -> Result<VsyncMonitorState> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let idx = state.context_index(handle)?;

        if state.vsync_offset_integration_count >= 2 * VSYNC_OFFSET_INTEGRATION_COUNT {
            return Ok(VsyncMonitorState::Complete);
        }

        state.vsync_offset_integration_count += 1;

        if state.vsync_offset_integration_count >= VSYNC_OFFSET_INTEGRATION_COUNT {
            let offset = actual_output_time.wrapping_sub(requested_output_time) as i64;
            if offset < state.minimum_vsync_offset {
                state.minimum_vsync_offset = offset;
            }

            if state.vsync_offset_integration_count == 2 * VSYNC_OFFSET_INTEGRATION_COUNT {
                let vsync_locked = self
                    .policies
                    .policy_value(Some(handle), Policy::ExternalTimeMappingVsyncLocked);

                let reported_offset;
                if !vsync_locked.applies() {
                    // Re-query the surface in case the display mode changed
                    // since registration, then normalize the measured phase
                    // into one frame period and apply it.
                    if let Ok(surface) = state.contexts[idx].manifestor.surface_parameters() {
                        state.contexts[idx].surface = Some(surface);
                    }
                    let frame_duration = state.contexts[idx]
                        .surface
                        .map(|s| s.frame_duration_us() as i64)
                        .unwrap_or(1);

                    let minimum = state.minimum_vsync_offset;
                    let mut corrected = minimum;
                    if minimum < 0 {
                        corrected += ((-minimum) as u64).div_ceil(frame_duration as u64) as i64 * frame_duration;
                    } else if minimum >= frame_duration {
                        corrected -= (minimum / frame_duration) * frame_duration;
                    }

                    tracing::info!("vsync offset {}us (minimum observed {}us)", corrected, minimum);
                    Self::adjust_mapping_base_locked(state, Scope::Playback, corrected);
                    reported_offset = corrected;
                } else {
                    tracing::info!(
                        "vsync offset {}us measured, display is vsync locked so the mapping stays",
                        state.minimum_vsync_offset,
                    );
                    reported_offset = state.minimum_vsync_offset;
                }

                // The measurement is always reported, listener mask or not.
                self.deliver_event(
                    CoordinatorEvent::new(EventCode::VsyncOffsetMeasured, Some(handle))
                        .with_value(reported_offset),
                );

                return Ok(VsyncMonitorState::Complete);
            }
        }

        Ok(VsyncMonitorState::Accumulating)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::core::error::MappingBaseAdjustment;
    use crate::core::time::MonotonicClock;
    use crate::core::policy::PolicyValue;

    fn vsync_rig() -> (Rig, crate::core::handles::StreamHandle) {
        let rig = rig();
        let video = register_video(&rig, 25);
        rig.coordinator
            .establish_time_mapping(Scope::Playback, 0, Some(rig.clock.now_us()))
            .unwrap();
        (rig, video)
    }

    fn feed_window(
        rig: &Rig,
        video: crate::core::handles::StreamHandle,
        offsets: [i64; 8],
    ) -> Vec<VsyncMonitorState> {
        offsets
            .iter()
            .map(|&offset| {
                let requested = 1_000_000u64;
                rig.coordinator
                    .monitor_vsync_offset(video, requested, requested.wrapping_add_signed(offset))
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_window_settles_then_measures_minimum() {
        let (rig, video) = vsync_rig();
        let events = rig.events.subscribe();
        let base_before = rig.coordinator.lock_state().master_base_system_time;

        // First three samples are settling noise and must be ignored; the
        // minimum over the measured half is 12ms.
        let states = feed_window(
            &rig,
            video,
            [999_999, 999_999, 999_999, 15_000, 12_000, 17_000, 13_000, 14_000],
        );
        assert_eq!(states[6], VsyncMonitorState::Accumulating);
        assert_eq!(states[7], VsyncMonitorState::Complete);

        let state = rig.coordinator.lock_state();
        assert_eq!(state.master_base_system_time, base_before + 12_000);
        drop(state);

        let event = events.try_recv().expect("a vsync measurement event");
        assert_eq!(event.code, EventCode::VsyncOffsetMeasured);
        assert_eq!(event.value, 12_000);

        // The correction came from the playback scope, so even the
        // measuring stream is told its base moved.
        assert_eq!(
            rig.coordinator.mapping_base_adjustment_applied(video).unwrap(),
            MappingBaseAdjustment::Adjusted
        );
    }

    #[test]
    fn test_window_is_one_shot_until_new_mapping() {
        let (rig, video) = vsync_rig();
        feed_window(&rig, video, [0, 0, 0, 5_000, 5_000, 5_000, 5_000, 5_000]);

        // Consumed: further samples report completion without measuring.
        assert_eq!(
            rig.coordinator
                .monitor_vsync_offset(video, 1_000_000, 1_900_000)
                .unwrap(),
            VsyncMonitorState::Complete
        );

        // A new mapping re-arms the window.
        rig.coordinator
            .establish_time_mapping(Scope::Playback, 0, Some(rig.clock.now_us()))
            .unwrap();
        assert_eq!(
            rig.coordinator
                .monitor_vsync_offset(video, 1_000_000, 1_005_000)
                .unwrap(),
            VsyncMonitorState::Accumulating
        );
    }

    #[test]
    fn test_negative_offset_normalizes_into_frame_period() {
        let (rig, video) = vsync_rig();
        let base_before = rig.coordinator.lock_state().master_base_system_time;

        feed_window(
            &rig,
            video,
            [0, 0, 0, -10_000, -8_000, -9_000, -10_000, -9_500],
        );

        // min = -10000, frame = 40000: corrected = -10000 + 40000 = 30000.
        let state = rig.coordinator.lock_state();
        assert_eq!(state.master_base_system_time, base_before + 30_000);
    }

    #[test]
    fn test_offset_beyond_frame_period_wraps_down() {
        let (rig, video) = vsync_rig();
        let base_before = rig.coordinator.lock_state().master_base_system_time;

        feed_window(
            &rig,
            video,
            [0, 0, 0, 95_000, 97_000, 99_000, 96_000, 98_000],
        );

        // min = 95000, frame = 40000: corrected = 95000 - 2*40000 = 15000.
        let state = rig.coordinator.lock_state();
        assert_eq!(state.master_base_system_time, base_before + 15_000);
    }

    #[test]
    fn test_vsync_locked_reports_without_adjusting() {
        let (rig, video) = vsync_rig();
        rig.policies.set_policy(
            None,
            Policy::ExternalTimeMappingVsyncLocked,
            PolicyValue::Apply,
        );
        let events = rig.events.subscribe();
        let base_before = rig.coordinator.lock_state().master_base_system_time;

        feed_window(&rig, video, [0, 0, 0, 12_000, 12_000, 12_000, 12_000, 12_000]);

        let state = rig.coordinator.lock_state();
        assert_eq!(state.master_base_system_time, base_before);
        drop(state);

        let event = events.try_recv().expect("a vsync measurement event");
        assert_eq!(event.code, EventCode::VsyncOffsetMeasured);
        assert_eq!(event.value, 12_000);
        assert_eq!(event.stream, Some(video));
    }
}
