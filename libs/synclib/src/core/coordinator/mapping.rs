// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Time mapping: translation between playback and system time, mapping
//! establishment and loss, and base adjustments.
//!
//! A mapping is the affine pair (base playback time, base system time);
//! translation scales the elapsed term by the playback speed and the shared
//! system-clock-rate correction. Translations *rebase* as a side effect
//! once the elapsed term grows large, trading a tiny rounding step for
//! bounded fixed-point range over arbitrarily long sessions - callers must
//! tolerate stored state changing under a nominal read.

use super::{
    CoordinatorState, NEGATIVE_REASONABLE_LIMIT, OutputCoordinator, POSITIVE_REASONABLE_LIMIT,
    REBASE_TIME_TRIGGER,
};
use crate::core::error::{MappingBaseAdjustment, Result, SyncError};
use crate::core::events::{CoordinatorEvent, EventCode};
use crate::core::handles::{Scope, StreamHandle};
use crate::core::policy::{Policy, PolicySource};
use crate::core::time::{INVALID_TIME, MonotonicClock};
use std::sync::atomic::Ordering;

// The two one-sided limits on either side of "now" within which an already
// established mapping is considered adoptable by a late-joining stream.
pub(crate) fn mapping_delta_is_reasonable(delta: u64) -> bool {
    delta > NEGATIVE_REASONABLE_LIMIT || delta < POSITIVE_REASONABLE_LIMIT
}

impl CoordinatorState {
    pub(crate) fn translate_playback_time_to_system_locked(
        &mut self,
        scope: Scope,
        playback_time: u64,
    ) -> Result<u64> {
        if !self.master_time_mapping_established {
            return Err(SyncError::MappingNotEstablished);
        }

        let (base_playback, base_system) = match scope {
            Scope::Playback => (
                self.master_base_normalized_playback_time,
                self.master_base_system_time,
            ),
            Scope::Stream(handle) => {
                let ctx = self.context(handle)?;
                if !ctx.time_mapping_established {
                    return Err(SyncError::MappingNotEstablished);
                }
                (ctx.base_normalized_playback_time, ctx.base_system_time)
            }
        };

        let elapsed_playback = playback_time.wrapping_sub(base_playback);
        let scaled = self.speed_scale(elapsed_playback);
        let elapsed_system = self
            .system_clock_adjustment
            .recip()
            .scale_rounded(scaled as i64) as u64;
        let system_time = base_system.wrapping_add(elapsed_system);

        if elapsed_system > REBASE_TIME_TRIGGER {
            if scope == Scope::Playback || self.master_base_system_time == base_system {
                self.master_base_normalized_playback_time = playback_time;
                self.master_base_system_time = system_time;
            }
            if let Scope::Stream(handle) = scope {
                let ctx = self.context_mut(handle)?;
                ctx.base_normalized_playback_time = playback_time;
                ctx.base_system_time = system_time;
            }
        }

        Ok(system_time)
    }

    pub(crate) fn translate_system_time_to_playback_locked(
        &self,
        scope: Scope,
        system_time: u64,
    ) -> Result<u64> {
        if !self.master_time_mapping_established {
            return Err(SyncError::MappingNotEstablished);
        }

        let (base_playback, base_system) = match scope {
            Scope::Playback => (
                self.master_base_normalized_playback_time,
                self.master_base_system_time,
            ),
            Scope::Stream(handle) => {
                let ctx = self.context(handle)?;
                if !ctx.time_mapping_established {
                    return Err(SyncError::MappingNotEstablished);
                }
                (ctx.base_normalized_playback_time, ctx.base_system_time)
            }
        };

        let elapsed_system = system_time.wrapping_sub(base_system);
        let adjusted = self
            .system_clock_adjustment
            .scale_rounded(elapsed_system as i64) as u64;
        let elapsed_playback = self.inverse_speed_scale(adjusted);

        Ok(base_playback.wrapping_add(elapsed_playback))
    }
}

impl OutputCoordinator {
    /// Translate a normalized playback time to a system time through the
    /// scope's mapping. May rebase the stored mapping as a side effect.
    pub fn translate_playback_time_to_system(
        &self,
        scope: Scope,
        playback_time: u64,
    ) -> Result<u64> {
        self.state
            .lock()
            .translate_playback_time_to_system_locked(scope, playback_time)
    }

    /// Translate a system time to a normalized playback time through the
    /// scope's mapping.
    pub fn translate_system_time_to_playback(&self, scope: Scope, system_time: u64) -> Result<u64> {
        self.state
            .lock()
            .translate_system_time_to_playback_locked(scope, system_time)
    }

    /// Drop the time mapping for the given scope and eject any stream
    /// blocked in a decode-window wait against it.
    pub fn reset_time_mapping(&self, scope: Scope) -> Result<()> {
        let mut guard = self.state.lock();
        self.reset_time_mapping_locked(&mut guard, scope)
    }

    pub(crate) fn reset_time_mapping_locked(
        &self,
        state: &mut CoordinatorState,
        scope: Scope,
    ) -> Result<()> {
        match scope {
            Scope::Playback => {
                state.master_time_mapping_established = false;
                state.accumulated_playback_time_jumps = 0;
                state.jump_seen_at_playback_time = INVALID_TIME;

                for ctx in &mut state.contexts {
                    ctx.time_mapping_established = false;
                    ctx.abort_decode_window_wait.set();
                }
            }
            Scope::Stream(handle) => {
                let ctx = state.context_mut(handle)?;
                ctx.time_mapping_established = false;
                ctx.abort_decode_window_wait.set();
            }
        }

        if self.wants_event(EventCode::TimeMappingReset) {
            let stream = match scope {
                Scope::Playback => None,
                Scope::Stream(handle) => Some(handle),
            };
            self.deliver_event(CoordinatorEvent::new(EventCode::TimeMappingReset, stream));
        }

        Ok(())
    }

    /// Pin the master mapping to the given (playback, system) pair and
    /// propagate it into the scope's contexts. `system_time` defaults to
    /// "now". Wakes any stream blocked in a rendezvous so it can adopt the
    /// new mapping.
    pub fn establish_time_mapping(
        &self,
        scope: Scope,
        playback_time: u64,
        system_time: Option<u64>,
    ) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let scope_stream = match scope {
            Scope::Playback => None,
            Scope::Stream(handle) => {
                state.context_index(handle)?;
                Some(handle)
            }
        };

        state.master_time_mapping_established = false;

        let now = self.clock.now_us();
        state.master_base_normalized_playback_time = playback_time;
        state.master_base_system_time = system_time.unwrap_or(now);

        state.accumulated_playback_time_jumps = 0;
        state.jump_seen_at_playback_time = INVALID_TIME;
        state.master_time_mapping_established = true;
        state.master_time_mapping_version += 1;

        // The vsync offset has to be re-measured against the new mapping.
        state.vsync_offset_integration_count = 0;
        state.minimum_vsync_offset = i64::MAX;

        for ctx in &mut state.contexts {
            if scope_stream.is_some_and(|h| h != ctx.handle) {
                continue;
            }
            ctx.base_system_time = state.master_base_system_time;
            ctx.base_normalized_playback_time = state.master_base_normalized_playback_time;
            ctx.accumulated_playback_time_jumps = 0;
            ctx.time_mapping_established = true;
            ctx.based_on_master_mapping_version = state.master_time_mapping_version;

            ctx.integrating_clock_drift = false;
            ctx.frames_to_integrate_over = ctx.rate_parameters.minimum_integration_frames;
            ctx.integration_count = 0;

            // No one gets to keep waiting on an out-of-date decode window.
            ctx.abort_decode_window_wait.set();
        }

        let base_playback = state.master_base_normalized_playback_time;
        let base_system = state.master_base_system_time;
        drop(guard);

        self.raise_event(
            CoordinatorEvent::new(EventCode::TimeMappingEstablished, scope_stream)
                .at_playback_time(base_playback)
                .with_value(base_system as i64),
        );

        self.synchronize_may_have_completed.set();
        Ok(())
    }

    /// Shift the shared timeline by `adjustment` microseconds.
    ///
    /// Only the privileged video stream (or the whole-playback scope) may
    /// do this; everyone else's request is ignored. Every *other* stream's
    /// edge-triggered adjusted flag is raised so its output pipeline can
    /// re-read its deadlines.
    pub fn adjust_mapping_base(&self, scope: Scope, adjustment: i64) -> Result<()> {
        if let Scope::Stream(handle) = scope {
            let external_mapping = self
                .policies
                .policy_value(Some(handle), Policy::ExternalTimeMapping);

            let mut guard = self.state.lock();
            let ctx = guard.context(handle)?;

            if external_mapping.applies() {
                tracing::debug!("mapping base not adjusted, the time mapping is external");
                return Ok(());
            }
            if !ctx.allowed_to_adjust_mapping_base {
                tracing::debug!(
                    "mapping base adjustment from {:?} ignored, caller not allowed to adjust",
                    handle
                );
                return Ok(());
            }

            Self::adjust_mapping_base_locked(&mut guard, scope, adjustment);
        } else {
            let mut guard = self.state.lock();
            Self::adjust_mapping_base_locked(&mut guard, scope, adjustment);
        }
        Ok(())
    }

    pub(crate) fn adjust_mapping_base_locked(
        state: &mut CoordinatorState,
        caller: Scope,
        adjustment: i64,
    ) {
        if state.master_time_mapping_established {
            state.master_base_system_time =
                state.master_base_system_time.wrapping_add_signed(adjustment);
        }

        for ctx in &mut state.contexts {
            if ctx.time_mapping_established {
                ctx.base_system_time = ctx.base_system_time.wrapping_add_signed(adjustment);
                // Everyone except the caller is told their base moved.
                let is_caller = caller == Scope::Stream(ctx.handle);
                ctx.base_system_time_adjusted
                    .store(!is_caller, Ordering::Release);
            }
        }
    }

    /// Edge-triggered: reports (and consumes) whether this stream's mapping
    /// base was shifted by some other party since the last call.
    pub fn mapping_base_adjustment_applied(
        &self,
        handle: StreamHandle,
    ) -> Result<MappingBaseAdjustment> {
        let guard = self.state.lock();
        let ctx = guard.context(handle)?;
        if ctx.base_system_time_adjusted.swap(false, Ordering::AcqRel) {
            Ok(MappingBaseAdjustment::Adjusted)
        } else {
            Ok(MappingBaseAdjustment::Unchanged)
        }
    }

    /// Delay between this stream's first frame and the earliest first frame
    /// in the playback group.
    pub fn get_stream_start_delay(&self, handle: StreamHandle) -> Result<u64> {
        let guard = self.state.lock();
        let ctx = guard.context(handle)?;
        let Some(offset) = ctx.stream_offset else {
            return Err(SyncError::MappingNotEstablished);
        };
        Ok((offset - guard.minimum_stream_offset) as u64)
    }
}
