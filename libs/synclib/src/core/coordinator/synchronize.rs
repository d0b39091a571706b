// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Startup rendezvous and decode-window pacing.
//!
//! A stream with no usable time mapping calls
//! [`synchronize_streams`](OutputCoordinator::synchronize_streams) before its
//! first frame. Either it adopts a mapping someone else already established,
//! or it joins a bounded-wait barrier with the other starting streams and
//! the earliest of them anchors a fresh mapping for everyone. When audio
//! anchors and a later video stream participates, the anchor's system base
//! is jittered so the first video frame lands exactly on a frame boundary.

use super::mapping::mapping_delta_is_reasonable;
use super::{
    CoordinatorState, DEFAULT_STARTUP_DELAY_MS, MAX_SYNCHRONIZATION_WINDOW, MAX_SYNCHRONIZE_WAITS,
    MAXIMUM_STARTUP_DELAY_MS, OutputCoordinator, SYNCHRONIZE_WAIT,
};
use crate::core::error::{Result, SyncError, WaitOutcome};
use crate::core::events::{CoordinatorEvent, EventCode};
use crate::core::handles::{Scope, StreamHandle};
use crate::core::manifestor::{Manifestor, StreamType};
use crate::core::policy::{Policy, PolicySource, PolicyValue};
use crate::core::time::{INVALID_TIME, MonotonicClock, UNSPECIFIED_TIME};
use std::sync::atomic::Ordering;
use std::time::Duration;

impl OutputCoordinator {
    /// Establish (or adopt) a time mapping for a stream about to present
    /// its first frame at `normalized_playback_time`.
    ///
    /// Returns the system time at which that frame should be manifested,
    /// or [`UNSPECIFIED_TIME`] when the mapping is externally supplied.
    /// Blocks for the startup delay plus up to the rendezvous window; there
    /// is no failure path for lack of company - a stream left alone long
    /// enough anchors the mapping on itself.
    pub fn synchronize_streams(
        &self,
        handle: StreamHandle,
        normalized_playback_time: u64,
        normalized_decode_time: u64,
    ) -> Result<u64> {
        let external_mapping = self
            .policies
            .policy_value(Some(handle), Policy::ExternalTimeMapping);
        if external_mapping.applies() {
            tracing::debug!("synchronize entered while the time mapping is externally supplied");
            return Ok(UNSPECIFIED_TIME);
        }

        let mut guard = self.state.lock();
        let direction_is_forward;
        {
            let state = &mut *guard;
            let idx = state.context_index(handle)?;
            tracing::debug!(
                "sync in: {} stream, playback {:016x} decode {:016x}",
                state.contexts[idx].stream_type.as_str(),
                normalized_playback_time,
                normalized_decode_time,
            );
            state.contexts[idx].in_startup_delay = true;
            direction_is_forward = state.direction == super::PlayDirection::Forward;

            // Fast path: a master mapping exists that this context has not
            // yet picked up. Adopt it if it puts "now" within reason.
            let stale_mapping_exists = state.master_time_mapping_established
                && state.contexts[idx].based_on_master_mapping_version
                    != state.master_time_mapping_version;
            if stale_mapping_exists {
                let now = self.clock.now_us();
                let master_mapping_now = state
                    .translate_playback_time_to_system_locked(
                        Scope::Playback,
                        normalized_playback_time,
                    )?;

                if mapping_delta_is_reasonable(master_mapping_now.wrapping_sub(now)) {
                    let stream_offset = master_mapping_now.wrapping_sub(now) as i64;
                    let ctx = &mut state.contexts[idx];
                    ctx.accumulated_playback_time_jumps = 0;
                    ctx.base_system_time_adjusted.store(true, Ordering::Release);
                    ctx.base_system_time = state.master_base_system_time;
                    ctx.base_normalized_playback_time = state.master_base_normalized_playback_time;
                    ctx.time_mapping_established = true;
                    ctx.based_on_master_mapping_version = state.master_time_mapping_version;
                    ctx.stream_offset = Some(stream_offset);

                    if stream_offset < state.minimum_stream_offset {
                        state.minimum_stream_offset = stream_offset;
                    }

                    let result = state.translate_playback_time_to_system_locked(
                        Scope::Stream(handle),
                        normalized_playback_time,
                    );
                    state.contexts[idx].in_startup_delay = false;
                    self.context_released.notify_all();
                    tracing::debug!(
                        "sync adopt: master {:016x}/{:016x}, stream offset {}us",
                        state.master_base_normalized_playback_time,
                        state.master_base_system_time,
                        stream_offset,
                    );
                    return result;
                }
            }

            // No adoptable mapping. Whatever master existed is now void; a
            // fresh one will be elected below.
            state.master_time_mapping_established = false;
            state.minimum_stream_offset = 0;
        }
        drop(guard);

        // Wait while enough data decodes for smooth playback afterwards:
        // nominally PTS minus DTS in forward play, nothing in reverse, and
        // bounded in case the decode timestamp is garbage.
        let startup_delay_ms = if direction_is_forward {
            let mut delay = if normalized_decode_time != UNSPECIFIED_TIME {
                normalized_playback_time.wrapping_sub(normalized_decode_time) / 1000
            } else {
                DEFAULT_STARTUP_DELAY_MS
            };

            if normalized_decode_time != UNSPECIFIED_TIME
                && normalized_playback_time < normalized_decode_time
            {
                tracing::error!(
                    "startup delay would be negative ({:016x} - {:016x}), bad decode timestamp?",
                    normalized_playback_time,
                    normalized_decode_time,
                );
                delay = MAXIMUM_STARTUP_DELAY_MS;
            }
            if delay > MAXIMUM_STARTUP_DELAY_MS {
                tracing::error!(
                    "startup delay too large ({delay}ms) ({:016x} - {:016x})",
                    normalized_playback_time,
                    normalized_decode_time,
                );
                delay = MAXIMUM_STARTUP_DELAY_MS;
            }
            delay
        } else {
            0
        };

        if startup_delay_ms != 0 {
            std::thread::sleep(Duration::from_millis(startup_delay_ms));
        }

        // One-shot policy: a forced start waits out a single poll interval
        // at most, then the policy disarms itself.
        let max_synchronize_waits = if self
            .policies
            .policy_value(Some(handle), Policy::SyncStartImmediate)
            .applies()
        {
            self.policies
                .set_policy(None, Policy::SyncStartImmediate, PolicyValue::Disapply);
            1
        } else {
            MAX_SYNCHRONIZE_WAITS
        };

        // Join the rendezvous.
        let mut guard = self.state.lock();
        {
            let state = &mut *guard;
            let idx = state.context_index(handle)?;
            let ctx = &mut state.contexts[idx];
            ctx.in_startup_delay = false;
            ctx.in_synchronize = true;
            ctx.synchronizing_at_playback_time = normalized_playback_time;
            state.streams_in_synchronize += 1;
        }

        let mut wait_count = 0u32;
        let result = loop {
            let state = &mut *guard;
            let idx = state.context_index(handle)?;

            // Someone (possibly this iteration's election below) completed
            // the mapping: adopt it and compute our own start offset.
            if state.master_time_mapping_established {
                let stream_offset = normalized_playback_time
                    .wrapping_sub(state.master_base_normalized_playback_time)
                    .wrapping_sub(state.accumulated_playback_time_jumps as u64)
                    as i64;

                let accumulated = state.accumulated_playback_time_jumps;
                let ctx = &mut state.contexts[idx];
                ctx.accumulated_playback_time_jumps = 0;
                ctx.base_system_time_adjusted.store(true, Ordering::Release);
                ctx.base_system_time = state.master_base_system_time;
                ctx.base_normalized_playback_time = state
                    .master_base_normalized_playback_time
                    .wrapping_add(accumulated as u64);
                ctx.time_mapping_established = true;
                ctx.based_on_master_mapping_version = state.master_time_mapping_version;
                ctx.stream_offset = Some(0);

                if stream_offset != 0 {
                    if (-MAX_SYNCHRONIZATION_WINDOW..=MAX_SYNCHRONIZATION_WINDOW)
                        .contains(&stream_offset)
                    {
                        ctx.stream_offset = Some(stream_offset);
                    } else {
                        // Too far apart to lip-sync. Fold the inverted offset
                        // into the jump accounting so it plays out as a PTS
                        // jump the other streams will cascade through.
                        tracing::error!(
                            "impossible to synchronize {} stream, offset {}us; anticipating a stream jump",
                            ctx.stream_type.as_str(),
                            stream_offset,
                        );
                        let inverted = -stream_offset;
                        state.accumulated_playback_time_jumps += inverted;
                        state.master_base_normalized_playback_time = state
                            .master_base_normalized_playback_time
                            .wrapping_sub(inverted as u64);
                        state.jump_seen_at_playback_time = ctx.base_normalized_playback_time;
                        ctx.base_normalized_playback_time = ctx
                            .base_normalized_playback_time
                            .wrapping_sub(inverted as u64);
                        ctx.accumulated_playback_time_jumps =
                            state.accumulated_playback_time_jumps;
                        ctx.base_system_time_adjusted.store(true, Ordering::Release);
                    }
                }

                let final_offset = state.contexts[idx].stream_offset.unwrap_or(0);
                if final_offset < state.minimum_stream_offset {
                    state.minimum_stream_offset = final_offset;
                }

                break state.translate_playback_time_to_system_locked(
                    Scope::Stream(handle),
                    normalized_playback_time,
                );
            }

            // Can we elect? Either everyone registered is here, or we have
            // exhausted our patience waiting for them.
            if state.streams_in_synchronize == state.contexts.len() as u32
                || wait_count >= max_synchronize_waits
                || self.is_halted()
            {
                let mut earliest: Option<(usize, u64)> = None;
                let mut earliest_video: Option<(usize, u64)> = None;
                for (i, c) in state.contexts.iter().enumerate() {
                    if !c.in_synchronize {
                        continue;
                    }
                    let at = c.synchronizing_at_playback_time;
                    if c.stream_type == StreamType::Video
                        && earliest_video.is_none_or(|(_, t)| t > at)
                    {
                        earliest_video = Some((i, at));
                    }
                    if earliest.is_none_or(|(_, t)| t > at) {
                        earliest = Some((i, at));
                    }
                }

                if self
                    .policies
                    .policy_value(None, Policy::VideoStartImmediate)
                    .applies()
                    && earliest_video.is_some()
                {
                    earliest = earliest_video;
                }

                let earliest_start_time = self.restart_time(state);

                // When audio anchors, jitter the start so the first video
                // frame lands exactly on a frame boundary after restart.
                let mut start_time_jitter = 0u64;
                if let (Some((video_idx, video_at)), Some((anchor_idx, anchor_at))) =
                    (earliest_video, earliest)
                {
                    if video_idx != anchor_idx {
                        let span = video_at.wrapping_sub(anchor_at);
                        let frame = state.video_frame_duration;
                        let partial = span - frame * (span / frame);
                        start_time_jitter = frame - partial;
                    }
                }

                if let Some((_, anchor_at)) = earliest {
                    state.master_base_normalized_playback_time = anchor_at;
                    state.master_base_system_time =
                        earliest_start_time.wrapping_add(start_time_jitter);
                    state.accumulated_playback_time_jumps = 0;
                    state.jump_seen_at_playback_time = INVALID_TIME;
                    state.master_time_mapping_established = true;
                    state.master_time_mapping_version += 1;

                    let base_playback = state.master_base_normalized_playback_time;
                    let base_system = state.master_base_system_time;
                    self.raise_event(
                        CoordinatorEvent::new(EventCode::TimeMappingEstablished, None)
                            .at_playback_time(base_playback)
                            .with_value(base_system as i64),
                    );

                    // Wake everyone to come pick the mapping up.
                    self.synchronize_may_have_completed.set();
                }
                continue;
            }

            // Wait until something happens. The broadcast is reset first so
            // a stale signal from a previous round cannot satisfy this wait.
            self.synchronize_may_have_completed.reset();
            drop(guard);
            self.synchronize_may_have_completed.wait_for(SYNCHRONIZE_WAIT);
            guard = self.state.lock();
            wait_count += 1;
        };

        let state = &mut *guard;
        let idx = state.context_index(handle)?;
        state.contexts[idx].in_synchronize = false;
        state.streams_in_synchronize -= 1;
        self.context_released.notify_all();
        let offset = state.contexts[idx].stream_offset;
        drop(guard);

        tracing::debug!(
            "sync out: playback {:016x} -> system {:?} (offset {:?})",
            normalized_playback_time,
            result.as_ref().ok(),
            offset,
        );
        result
    }

    /// Earliest system time at which a coordinated restart can happen:
    /// after everything every manifestor already has queued, rounded up to
    /// the video frame grid when a video stream participates. Caches each
    /// stream's pipeline latency on first sight and captures the video
    /// frame period for the jitter arithmetic.
    pub(crate) fn restart_time(&self, state: &mut CoordinatorState) -> u64 {
        let mut video_frame_duration = 1u64;
        let now = self.clock.now_us();
        let mut latest_video_manifest_time = now;
        let mut latest_manifest_time = now;

        for ctx in &mut state.contexts {
            if ctx.stream_type == StreamType::Video && video_frame_duration == 1 {
                if let Ok(surface) = ctx.manifestor.surface_parameters() {
                    ctx.surface = Some(surface);
                    video_frame_duration = surface.frame_duration_us();
                }
            }

            let manifest_time = ctx
                .manifestor
                .next_queued_manifestation_time()
                .unwrap_or(now);
            if ctx.manifestor_latency.is_none() {
                ctx.manifestor_latency = Some(manifest_time.wrapping_sub(self.clock.now_us()));
            }

            if ctx.stream_type == StreamType::Video {
                latest_video_manifest_time = latest_video_manifest_time.max(manifest_time);
            }
            latest_manifest_time = latest_manifest_time.max(manifest_time);

            let latency = manifest_time.wrapping_sub(self.clock.now_us());
            if latency > 1_000_000 {
                tracing::warn!(
                    "long manifestation latency {}us for {} stream",
                    latency,
                    ctx.stream_type.as_str(),
                );
            }
        }

        // Round the restart point up onto the video frame grid so no frame
        // period is straddled mid-way.
        if latest_manifest_time != latest_video_manifest_time {
            let span = latest_manifest_time - latest_video_manifest_time;
            latest_manifest_time = latest_video_manifest_time
                + span.div_ceil(video_frame_duration) * video_frame_duration;
        }

        state.video_frame_duration = video_frame_duration;
        latest_manifest_time
    }

    /// Sleep until the decode window for `normalized_decode_time` opens
    /// (the translated time minus the `decode_window_porch` safety margin).
    ///
    /// Returns immediately with `Completed` when no mapping exists yet or
    /// the window is already open. The sleep is capped at the speed-scaled
    /// `maximum_allowed_sleep_time` and is cancellable: speed changes and
    /// mapping resets eject the waiter, reported as `Abandoned`.
    pub fn perform_entry_into_decode_window_wait(
        &self,
        handle: StreamHandle,
        normalized_decode_time: u64,
        decode_window_porch: u64,
        maximum_allowed_sleep_time: u64,
    ) -> Result<WaitOutcome> {
        let (abort, sleep_time) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let idx = state.context_index(handle)?;

            // Stale cancellations from a previous window must not leak in.
            let abort = state.contexts[idx].abort_decode_window_wait.clone();
            abort.reset();

            let scope = if state.contexts[idx].time_mapping_established {
                Scope::Stream(handle)
            } else {
                Scope::Playback
            };
            let system_time = match state
                .translate_playback_time_to_system_locked(scope, normalized_decode_time)
            {
                Ok(t) => t,
                Err(SyncError::MappingNotEstablished) => return Ok(WaitOutcome::Completed),
                Err(e) => return Err(e),
            };

            let window_start = system_time.wrapping_sub(decode_window_porch);
            let now = self.clock.now_us();
            if now >= window_start {
                return Ok(WaitOutcome::Completed);
            }

            let mut sleep_time = window_start - now;
            let maximum_sleep_time = state.speed_scale(maximum_allowed_sleep_time);
            if sleep_time > maximum_sleep_time {
                sleep_time = maximum_sleep_time;
            }
            (abort, sleep_time)
        };

        if abort.wait_for(Duration::from_millis(sleep_time / 1000)) {
            Ok(WaitOutcome::Abandoned)
        } else {
            Ok(WaitOutcome::Completed)
        }
    }
}
