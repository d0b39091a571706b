// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Playback-time delta handling: PTS jump detection and cascading.
//!
//! Each stream reports, per frame, the delta between the playback time it
//! expected and the one it actually saw. A delta beyond threshold is a PTS
//! discontinuity: the first stream to see it folds it into the master
//! mapping and a shared accumulated-jump counter (initiating a *cascade*),
//! and every other stream is expected to report the matching delta shortly
//! after and catch up against that counter. Streams that fail to follow in
//! time, or sources that jump repeatedly in quick succession, force a full
//! mapping reset instead.

use super::{
    OTHER_STREAMS_MUST_FOLLOW_JUMP_BY, OutputCoordinator, PLAYBACK_TIME_JUMP_ERROR, PlayDirection,
};
use crate::core::error::{Result, SyncError};
use crate::core::handles::Scope;
use crate::core::policy::{Policy, PolicySource};
use crate::core::time::valid_time;
use std::sync::atomic::Ordering;

// Exponent cap keeping the microsecond threshold inside 63 bits.
const MAX_FORWARD_JUMP_THRESHOLD_EXPONENT: u8 = 43;

impl OutputCoordinator {
    /// Examine one frame's `actual - expected` playback-time delta and
    /// drive the jump/cascade machinery. Valid only for a specific stream.
    pub fn handle_playback_time_deltas(
        &self,
        scope: Scope,
        known_jump: bool,
        expected_playback_time: u64,
        actual_playback_time: u64,
    ) -> Result<()> {
        let Scope::Stream(handle) = scope else {
            tracing::error!("playback time deltas are only handled for specific streams");
            return Err(SyncError::InvalidScope);
        };

        let threshold_exponent = self
            .policies
            .policy_value(Some(handle), Policy::PtsForwardJumpDetectionThreshold)
            .exponent()
            .min(MAX_FORWARD_JUMP_THRESHOLD_EXPONENT);
        let forward_jump_threshold = 1_000_000i64 * (1i64 << threshold_exponent);
        let reverse_jump_threshold = if self
            .policies
            .policy_value(Some(handle), Policy::SymmetricJumpDetection)
            .applies()
        {
            forward_jump_threshold
        } else {
            PLAYBACK_TIME_JUMP_ERROR
        };
        let external_mapping = self
            .policies
            .policy_value(Some(handle), Policy::ExternalTimeMapping);

        let mut guard = self.state.lock();
        let state = &mut *guard;

        if !state.master_time_mapping_established {
            return Ok(());
        }
        let idx = state.context_index(handle)?;

        let delta_playback_time = if state.direction == PlayDirection::Backward {
            expected_playback_time.wrapping_sub(actual_playback_time) as i64
        } else {
            actual_playback_time.wrapping_sub(expected_playback_time) as i64
        };

        let jumped = !(-reverse_jump_threshold..=forward_jump_threshold)
            .contains(&delta_playback_time)
            || known_jump;

        if jumped {
            tracing::debug!(
                "spotted a playback delta ({}) of {}us",
                state.contexts[idx].stream_type.as_str(),
                delta_playback_time,
            );

            if external_mapping.applies() {
                // Not ours to fix; the external mapping owner has to act.
                tracing::error!(
                    "large playback delta ({}us) on an externally timed {} stream",
                    delta_playback_time,
                    state.contexts[idx].stream_type.as_str(),
                );
            } else if state.accumulated_playback_time_jumps
                != state.contexts[idx].accumulated_playback_time_jumps
            {
                // A cascade is in flight and this is our move to catch up.
                // A rapid sequence of jumps can land as one combined delta,
                // so check whether this delta covers the whole outstanding
                // jump or only part of it.
                tracing::debug!(
                    "cascading a jump ({})",
                    state.contexts[idx].stream_type.as_str()
                );

                let ctx = &mut state.contexts[idx];
                let jump_error = state.accumulated_playback_time_jumps
                    - (ctx.accumulated_playback_time_jumps - delta_playback_time);
                if !(-PLAYBACK_TIME_JUMP_ERROR..=forward_jump_threshold).contains(&jump_error) {
                    // Partial catch-up: absorb this delta, keep tracking.
                    ctx.accumulated_playback_time_jumps -= delta_playback_time;
                    ctx.base_normalized_playback_time = ctx
                        .base_normalized_playback_time
                        .wrapping_add_signed(delta_playback_time);
                    ctx.base_system_time_adjusted.store(true, Ordering::Release);
                } else {
                    // Complete catch-up: fold the whole outstanding jump in.
                    let outstanding = ctx.accumulated_playback_time_jumps
                        - state.accumulated_playback_time_jumps;
                    ctx.base_normalized_playback_time = ctx
                        .base_normalized_playback_time
                        .wrapping_add_signed(outstanding);
                    ctx.accumulated_playback_time_jumps = state.accumulated_playback_time_jumps;
                    ctx.base_system_time_adjusted.store(true, Ordering::Release);
                }
            } else if valid_time(state.jump_seen_at_playback_time)
                && (0..=2_000_000).contains(&delta_playback_time)
                && (0..=10_000_000).contains(
                    &(expected_playback_time.wrapping_sub(state.jump_seen_at_playback_time)
                        as i64),
                )
            {
                // Spurious mini-jumps arriving back to back; chasing them
                // would never converge. Start over.
                tracing::error!(
                    "multiple jumps over a short period ({})",
                    state.contexts[idx].stream_type.as_str(),
                );
                self.reset_time_mapping_locked(state, Scope::Playback)?;
            } else {
                // First sighting: initiate a cascade for the others to follow.
                tracing::debug!(
                    "initiating a jump ({})",
                    state.contexts[idx].stream_type.as_str()
                );

                state.accumulated_playback_time_jumps -= delta_playback_time;
                state.master_base_normalized_playback_time = state
                    .master_base_normalized_playback_time
                    .wrapping_add_signed(delta_playback_time);
                state.jump_seen_at_playback_time = expected_playback_time;

                let ctx = &mut state.contexts[idx];
                ctx.base_normalized_playback_time = ctx
                    .base_normalized_playback_time
                    .wrapping_add_signed(delta_playback_time);
                ctx.accumulated_playback_time_jumps = state.accumulated_playback_time_jumps;
                ctx.base_system_time_adjusted.store(true, Ordering::Release);
            }
        }

        // Whether or not a jump was seen now: if a cascade is in progress
        // that this stream still has not joined, and its playback position
        // is well past the point where it should have, the stream is lost.
        if valid_time(state.jump_seen_at_playback_time)
            && state.accumulated_playback_time_jumps
                != state.contexts[idx].accumulated_playback_time_jumps
        {
            let past_jump = actual_playback_time
                .wrapping_sub(state.jump_seen_at_playback_time) as i64;
            if !(-forward_jump_threshold..=OTHER_STREAMS_MUST_FOLLOW_JUMP_BY).contains(&past_jump) {
                tracing::error!(
                    "{} stream failed to match a previous jump in playback times",
                    state.contexts[idx].stream_type.as_str(),
                );
                self.reset_time_mapping_locked(state, Scope::Playback)?;
            }
        }

        // Also convenient to verify here: a context still based on an old
        // master mapping whose position disagrees with the current master
        // base has missed a mapping change entirely.
        if state.contexts[idx].based_on_master_mapping_version != state.master_time_mapping_version
        {
            let from_master_base = actual_playback_time
                .wrapping_sub(state.master_base_normalized_playback_time)
                as i64;
            if !(-forward_jump_threshold..=forward_jump_threshold).contains(&from_master_base) {
                tracing::error!(
                    "{} stream failed to match a previous master mapping change",
                    state.contexts[idx].stream_type.as_str(),
                );
                self.reset_time_mapping_locked(state, Scope::Playback)?;
            }
        }

        Ok(())
    }
}
