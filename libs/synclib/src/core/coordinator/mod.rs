// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! The output coordinator.
//!
//! One coordinator exists per playback. Decoded elementary streams register
//! with it and then drive their own output pacing through it: a shared
//! *master time mapping* pins normalized playback time to the system clock,
//! per-stream contexts carry local refinements of that mapping, and a
//! per-stream drift estimator trims each output clock against the elected
//! master. All coordinator-wide state sits behind a single lock; blocking
//! waits (startup rendezvous, decode windows) happen outside it on
//! dedicated events.
//!
//! Module split:
//! - `context` - per-stream state and drift-estimator profiles
//! - `mapping` - time translation, mapping establishment/reset, base nudges
//! - `synchronize` - startup rendezvous and decode-window pacing
//! - `deltas` - PTS jump detection and cascade propagation
//! - `rate` - output-rate drift estimation
//! - `vsync` - vsync phase measurement
//! - `recovery` - broadcast source clock recovery

mod context;
mod deltas;
mod mapping;
mod rate;
mod recovery;
mod synchronize;
mod vsync;

pub use context::{OutputRateParameters, RateAdjustmentKind};
pub use recovery::TimeFormat;

use crate::core::error::{Result, SyncError};
use crate::core::events::{CoordinatorEvent, EventCode, EventMask, EventSink};
use crate::core::handles::{Scope, StreamHandle};
use crate::core::manifestor::{Manifestor, StreamType};
use crate::core::policy::{Policy, PolicySource, PolicyValue};
use crate::core::rational::Rational;
use crate::core::sync::ManualResetEvent;
use crate::core::time::{INVALID_TIME, MonotonicClock};
use context::StreamContext;
use parking_lot::{Condvar, Mutex};
use recovery::ClockRecoveryState;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

pub(crate) const SYNCHRONIZE_WAIT: Duration = Duration::from_millis(50);
pub(crate) const MAX_SYNCHRONIZE_WAITS: u32 = 4;

pub(crate) const MAXIMUM_STARTUP_DELAY_MS: u64 = 200;
pub(crate) const DEFAULT_STARTUP_DELAY_MS: u64 = 40;

pub(crate) const NEGATIVE_REASONABLE_LIMIT: u64 = -4_000_000i64 as u64;
pub(crate) const POSITIVE_REASONABLE_LIMIT: u64 = 4_000_000;

/// Elapsed-time magnitude past which a translation silently rebases its
/// mapping to cap fixed-point growth over long sessions.
pub(crate) const REBASE_TIME_TRIGGER: u64 = 0x1000_0000;

/// Tolerated PTS arithmetic error. Some containers carry millisecond
/// timestamps and recorders add up to ~32ms of recomputation error.
pub(crate) const PLAYBACK_TIME_JUMP_ERROR: i64 = 64_000;

/// A stream that has not matched a cascaded jump within this much playback
/// time is considered lost.
pub(crate) const OTHER_STREAMS_MUST_FOLLOW_JUMP_BY: i64 = 250_000;

/// Streams further apart than this cannot be lip-synced at all.
pub(crate) const MAX_SYNCHRONIZATION_WINDOW: i64 = 10_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayDirection {
    Forward,
    Backward,
}

pub struct OutputCoordinator {
    pub(crate) policies: Arc<dyn PolicySource>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) clock: Arc<dyn MonotonicClock>,
    pub(crate) event_mask: EventMask,

    pub(crate) state: Mutex<CoordinatorState>,
    /// Fire-and-forget broadcast: "a rendezvous may have completed, re-check".
    pub(crate) synchronize_may_have_completed: ManualResetEvent,
    /// Signalled whenever a context leaves its startup-delay or rendezvous
    /// phase; deregistration waits on this.
    pub(crate) context_released: Condvar,

    next_handle: AtomicU32,
    halted: AtomicBool,
}

pub(crate) struct CoordinatorState {
    pub contexts: Vec<StreamContext>,
    pub streams_in_synchronize: u32,

    pub master_time_mapping_established: bool,
    pub master_time_mapping_version: u32,
    pub master_base_system_time: u64,
    pub master_base_normalized_playback_time: u64,

    pub got_a_master_clock: bool,
    pub got_an_alternate_master_clock: bool,
    pub alternate_master: Option<StreamHandle>,
    pub got_a_video_stream: bool,

    pub system_clock_adjustment: Rational,
    pub system_clock_adjustment_established: bool,

    pub accumulated_playback_time_jumps: i64,
    pub jump_seen_at_playback_time: u64,

    pub speed: Rational,
    pub direction: PlayDirection,

    pub minimum_stream_offset: i64,

    pub vsync_offset_integration_count: u32,
    pub minimum_vsync_offset: i64,

    /// Frame period captured by the last restart-time scan; 1 until a video
    /// stream has been seen, so frame arithmetic stays divide-safe.
    pub video_frame_duration: u64,

    pub recovery: ClockRecoveryState,
}

impl CoordinatorState {
    fn new() -> Self {
        Self {
            contexts: Vec::new(),
            streams_in_synchronize: 0,
            master_time_mapping_established: false,
            master_time_mapping_version: 0,
            master_base_system_time: 0,
            master_base_normalized_playback_time: 0,
            got_a_master_clock: false,
            got_an_alternate_master_clock: false,
            alternate_master: None,
            got_a_video_stream: false,
            system_clock_adjustment: Rational::ONE,
            system_clock_adjustment_established: true,
            accumulated_playback_time_jumps: 0,
            jump_seen_at_playback_time: INVALID_TIME,
            speed: Rational::ONE,
            direction: PlayDirection::Forward,
            minimum_stream_offset: 0,
            vsync_offset_integration_count: 0,
            minimum_vsync_offset: i64::MAX,
            video_frame_duration: 1,
            recovery: ClockRecoveryState::new(),
        }
    }

    pub fn context_index(&self, handle: StreamHandle) -> Result<usize> {
        self.contexts
            .iter()
            .position(|c| c.handle == handle)
            .ok_or(SyncError::UnknownStream(handle))
    }

    pub fn context(&self, handle: StreamHandle) -> Result<&StreamContext> {
        self.contexts
            .iter()
            .find(|c| c.handle == handle)
            .ok_or(SyncError::UnknownStream(handle))
    }

    pub fn context_mut(&mut self, handle: StreamHandle) -> Result<&mut StreamContext> {
        self.contexts
            .iter_mut()
            .find(|c| c.handle == handle)
            .ok_or(SyncError::UnknownStream(handle))
    }

    /// Scale a playback duration into a system duration at the current
    /// speed. Backward play negates first; the argument is reinterpreted as
    /// signed so slightly-negative (wrapped) durations scale correctly.
    pub fn speed_scale(&self, t: u64) -> u64 {
        let mut v = t;
        if self.direction == PlayDirection::Backward {
            v = v.wrapping_neg();
        }
        if self.speed.is_one() {
            return v;
        }
        if self.speed.is_zero() {
            return 0;
        }
        self.speed.recip().scale(v as i64) as u64
    }

    /// Inverse of [`speed_scale`](Self::speed_scale). At zero speed every
    /// system duration maps to zero elapsed playback.
    pub fn inverse_speed_scale(&self, t: u64) -> u64 {
        let mut v = t;
        if self.direction == PlayDirection::Backward {
            v = v.wrapping_neg();
        }
        if self.speed.is_one() {
            return v;
        }
        self.speed.scale(v as i64) as u64
    }
}

impl OutputCoordinator {
    pub fn new(
        policies: Arc<dyn PolicySource>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn MonotonicClock>,
        event_mask: EventMask,
    ) -> Self {
        Self {
            policies,
            events,
            clock,
            event_mask,
            state: Mutex::new(CoordinatorState::new()),
            synchronize_may_have_completed: ManualResetEvent::new(),
            context_released: Condvar::new(),
            next_handle: AtomicU32::new(1),
            halted: AtomicBool::new(false),
        }
    }

    pub fn stream_count(&self) -> usize {
        self.state.lock().contexts.len()
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Wake everything that might be blocked so shutdown is not delayed by
    /// poll intervals. In-flight rendezvous elect immediately instead of
    /// waiting out their poll budget.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::Release);
        self.synchronize_may_have_completed.set();
        let state = self.state.lock();
        for ctx in &state.contexts {
            ctx.abort_decode_window_wait.set();
        }
    }

    /// Register a stream with the coordinator.
    ///
    /// Fails with [`SyncError::NotSupported`] when no manifestor is supplied
    /// (streams without output timing cannot be coordinated). Decides
    /// master-clock ownership: the policy-named stream type provides the
    /// master; absent one, the first stream of any non-system-clock type
    /// stands in as an alternate master until a real one arrives. The first
    /// video stream additionally gains the right to nudge the shared
    /// mapping base for vsync alignment.
    pub fn register_stream(
        &self,
        stream_type: StreamType,
        manifestor: Option<Arc<dyn Manifestor>>,
    ) -> Result<StreamHandle> {
        let handle = StreamHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));

        let Some(manifestor) = manifestor else {
            tracing::error!("streams without output timing are not supported");
            return Err(SyncError::NotSupported("no-output timing streams".into()));
        };

        let surface = if stream_type == StreamType::Video {
            match manifestor.surface_parameters() {
                Ok(surface) => Some(surface),
                Err(e) => {
                    tracing::error!("failed to obtain the output surface descriptor: {e}");
                    return Err(SyncError::Coordinator(
                        "no output surface descriptor".into(),
                    ));
                }
            }
        } else {
            None
        };

        let external_mapping = self
            .policies
            .policy_value(Some(handle), Policy::ExternalTimeMapping);
        let master_clock = self.policies.policy_value(Some(handle), Policy::MasterClock);

        let mut ctx = StreamContext::new(handle, stream_type, manifestor, surface);

        let mut guard = self.state.lock();
        let state = &mut *guard;

        if external_mapping.applies() && state.master_time_mapping_established {
            ctx.base_system_time = state.master_base_system_time;
            ctx.base_normalized_playback_time = state.master_base_normalized_playback_time;
            ctx.accumulated_playback_time_jumps = 0;
            ctx.time_mapping_established = true;
            ctx.based_on_master_mapping_version = state.master_time_mapping_version;
        }

        // Master-clock ownership. We follow what the policy names, but when
        // only the other stream type is present we let it stand in as an
        // alternate master so a clock is always being learned.
        let possible_master = (master_clock == PolicyValue::VideoClockMaster
            && stream_type == StreamType::Video)
            || (master_clock == PolicyValue::AudioClockMaster && stream_type == StreamType::Audio);
        let possible_alternate = master_clock != PolicyValue::SystemClockMaster;

        if possible_master && state.got_an_alternate_master_clock {
            // The stand-in is no longer needed; it reverts to a plain clock
            // and keeps any values it already learned.
            state.got_an_alternate_master_clock = false;
            if let Some(alternate) = state.alternate_master.take() {
                let minimum = ctx.rate_parameters.minimum_integration_frames;
                if let Ok(alt) = state.context_mut(alternate) {
                    alt.clock_master = false;
                    alt.integrating_clock_drift = false;
                    alt.frames_to_integrate_over = minimum;
                    alt.integration_count = 0;
                }
            }
        }

        if !state.got_a_master_clock && possible_master {
            state.got_a_master_clock = true;
            state.system_clock_adjustment_established = false;
            ctx.clock_master = true;
        }

        if !state.got_a_master_clock && !state.got_an_alternate_master_clock && possible_alternate {
            state.got_an_alternate_master_clock = true;
            state.alternate_master = Some(handle);
            state.system_clock_adjustment_established = false;
            ctx.clock_master = true;
        }

        // Everyone gets a settle period before drift integration starts;
        // the estimator turns itself on once the output is running.
        ctx.integrating_clock_drift = false;

        if !state.got_a_video_stream && stream_type == StreamType::Video {
            state.got_a_video_stream = true;
            ctx.allowed_to_adjust_mapping_base = true;
        }

        tracing::debug!(
            "registered {} stream {:?} (master: {}, alternate: {})",
            stream_type.as_str(),
            handle,
            ctx.clock_master && state.got_a_master_clock,
            ctx.clock_master && state.got_an_alternate_master_clock,
        );

        state.contexts.push(ctx);
        Ok(handle)
    }

    /// Remove a stream. Blocks until the stream's own thread has left any
    /// startup-delay or rendezvous phase; the coordinator side of that
    /// handshake signals [`Self::context_released`] on every exit path.
    pub fn deregister_stream(&self, handle: StreamHandle) -> Result<()> {
        let mut guard = self.state.lock();

        loop {
            let idx = guard.context_index(handle)?;
            if !guard.contexts[idx].busy() {
                break;
            }
            tracing::debug!("stream {:?} is synchronizing, deregistration waits", handle);
            self.context_released.wait(&mut guard);
        }

        let state = &mut *guard;
        let idx = state.context_index(handle)?;

        // A departing master is replaced by any surviving stream of the same
        // type. The learned clock values persist, so no alternate is sought.
        if state.contexts[idx].clock_master {
            state.got_a_master_clock = false;
            state.got_an_alternate_master_clock = false;
            state.alternate_master = None;

            let stream_type = state.contexts[idx].stream_type;
            if let Some(successor) = state
                .contexts
                .iter()
                .position(|c| c.handle != handle && c.stream_type == stream_type)
            {
                state.contexts[successor].clock_master = true;
                state.got_a_master_clock = true;
            }
        }

        if state.contexts[idx].allowed_to_adjust_mapping_base {
            state.got_a_video_stream = false;
            if let Some(successor) = state
                .contexts
                .iter()
                .position(|c| c.handle != handle && c.stream_type == StreamType::Video)
            {
                state.contexts[successor].allowed_to_adjust_mapping_base = true;
                state.got_a_video_stream = true;
            }
        }

        state.contexts.remove(idx);
        self.synchronize_may_have_completed.set();
        Ok(())
    }

    /// Change the playback speed and/or direction for the whole playback.
    ///
    /// On a running speed change every established mapping is rebased to
    /// "now" *under the old speed* before the new one is recorded, and every
    /// decode-window waiter is ejected to re-plan against the new speed.
    /// Leaving pause drops all mappings instead: they were pinned under a
    /// stopped clock and carry no usable information.
    pub fn set_playback_speed(
        &self,
        scope: Scope,
        speed: Rational,
        direction: PlayDirection,
    ) -> Result<()> {
        if scope != Scope::Playback {
            return Err(SyncError::NotSupported(
                "stream specific playback speeds".into(),
            ));
        }

        let mut guard = self.state.lock();
        let now = self.clock.now_us();

        let was_paused = guard.speed.is_zero();
        let pausing = speed.is_zero();

        if was_paused && pausing {
            // still paused, nothing to rebase
        } else if pausing {
            // entering pause, only the recording below matters
        } else if was_paused {
            drop(guard);
            self.reset_time_mapping(Scope::Playback)?;
            guard = self.state.lock();
        } else {
            let state = &mut *guard;

            if state.master_time_mapping_established {
                if let Ok(playback) = state.translate_system_time_to_playback_locked(Scope::Playback, now)
                {
                    state.master_base_normalized_playback_time = playback;
                }
                state.master_base_system_time = now;
            }

            for idx in 0..state.contexts.len() {
                if state.contexts[idx].time_mapping_established {
                    let handle = state.contexts[idx].handle;
                    if let Ok(playback) =
                        state.translate_system_time_to_playback_locked(Scope::Stream(handle), now)
                    {
                        state.contexts[idx].base_normalized_playback_time = playback;
                    }
                    state.contexts[idx].base_system_time = now;
                    state.contexts[idx]
                        .base_system_time_adjusted
                        .store(true, Ordering::Release);
                }
                state.contexts[idx].abort_decode_window_wait.set();
            }
        }

        guard.speed = speed;
        guard.direction = direction;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn lock_state(&self) -> parking_lot::MutexGuard<'_, CoordinatorState> {
        self.state.lock()
    }

    /// Construct and deliver an event if anyone listens for its code.
    pub(crate) fn raise_event(&self, event: CoordinatorEvent) {
        if !self.event_mask.contains(event.code.mask()) {
            return;
        }
        self.deliver_event(event);
    }

    /// Deliver unconditionally (for events that bypass the listener mask).
    pub(crate) fn deliver_event(&self, event: CoordinatorEvent) {
        if let Err(e) = self.events.signal_event(event) {
            tracing::error!("failed to signal event: {e}");
        }
    }

    pub(crate) fn wants_event(&self, code: EventCode) -> bool {
        self.event_mask.contains(code.mask())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::core::events::ChannelEventSink;
    use crate::core::manifestor::SurfaceParameters;
    use crate::core::policy::PolicyStore;
    use crate::core::time::MonotonicClock;
    use std::sync::atomic::AtomicU64;

    pub struct TestClock {
        now: AtomicU64,
    }

    impl TestClock {
        pub fn new(start_us: u64) -> Self {
            Self {
                now: AtomicU64::new(start_us),
            }
        }

        pub fn advance(&self, us: u64) {
            self.now.fetch_add(us, Ordering::SeqCst);
        }
    }

    impl MonotonicClock for TestClock {
        fn now_us(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }

        fn description(&self) -> &str {
            "Test Clock"
        }
    }

    pub struct TestManifestor {
        surface: SurfaceParameters,
        clock: Arc<TestClock>,
        queue_ahead_us: u64,
    }

    impl TestManifestor {
        pub fn new(surface: SurfaceParameters, clock: Arc<TestClock>, queue_ahead_us: u64) -> Self {
            Self {
                surface,
                clock,
                queue_ahead_us,
            }
        }
    }

    impl Manifestor for TestManifestor {
        fn surface_parameters(&self) -> Result<SurfaceParameters> {
            Ok(self.surface)
        }

        fn next_queued_manifestation_time(&self) -> Result<u64> {
            Ok(self.clock.now_us() + self.queue_ahead_us)
        }
    }

    pub struct Rig {
        pub coordinator: Arc<OutputCoordinator>,
        pub policies: Arc<PolicyStore>,
        pub events: Arc<ChannelEventSink>,
        pub clock: Arc<TestClock>,
    }

    pub fn rig() -> Rig {
        let policies = Arc::new(PolicyStore::new());
        let events = Arc::new(ChannelEventSink::new());
        let clock = Arc::new(TestClock::new(1_000_000_000));
        let coordinator = Arc::new(OutputCoordinator::new(
            policies.clone(),
            events.clone(),
            clock.clone(),
            EventMask::all(),
        ));
        Rig {
            coordinator,
            policies,
            events,
            clock,
        }
    }

    pub fn audio_manifestor(clock: &Arc<TestClock>) -> Arc<TestManifestor> {
        Arc::new(TestManifestor::new(
            SurfaceParameters {
                frame_rate: Rational::new(25, 1),
                progressive: true,
            },
            clock.clone(),
            0,
        ))
    }

    pub fn video_manifestor(clock: &Arc<TestClock>, fps: i64) -> Arc<TestManifestor> {
        Arc::new(TestManifestor::new(
            SurfaceParameters {
                frame_rate: Rational::new(fps, 1),
                progressive: true,
            },
            clock.clone(),
            0,
        ))
    }

    pub fn register_audio(rig: &Rig) -> StreamHandle {
        rig.coordinator
            .register_stream(StreamType::Audio, Some(audio_manifestor(&rig.clock)))
            .unwrap()
    }

    pub fn register_video(rig: &Rig, fps: i64) -> StreamHandle {
        rig.coordinator
            .register_stream(StreamType::Video, Some(video_manifestor(&rig.clock, fps)))
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_register_requires_manifestor() {
        let rig = rig();
        let result = rig.coordinator.register_stream(StreamType::Audio, None);
        assert!(matches!(result, Err(SyncError::NotSupported(_))));
        assert_eq!(rig.coordinator.stream_count(), 0);
    }

    #[test]
    fn test_register_allocates_distinct_handles() {
        let rig = rig();
        let a = register_audio(&rig);
        let v = register_video(&rig, 25);
        assert_ne!(a, v);
        assert_eq!(rig.coordinator.stream_count(), 2);
    }

    #[test]
    fn test_policy_named_master_is_elected() {
        let rig = rig();
        rig.policies
            .set_policy(None, Policy::MasterClock, PolicyValue::VideoClockMaster);

        let audio = register_audio(&rig);
        let video = register_video(&rig, 25);

        let state = rig.coordinator.lock_state();
        assert!(!state.context(audio).unwrap().clock_master);
        assert!(state.context(video).unwrap().clock_master);
        assert!(state.got_a_master_clock);
        assert!(!state.got_an_alternate_master_clock);
    }

    #[test]
    fn test_alternate_master_stands_in_and_is_demoted() {
        let rig = rig();
        rig.policies
            .set_policy(None, Policy::MasterClock, PolicyValue::VideoClockMaster);

        // Audio arrives first: not the named master, but a usable stand-in.
        let audio = register_audio(&rig);
        {
            let state = rig.coordinator.lock_state();
            assert!(state.context(audio).unwrap().clock_master);
            assert!(state.got_an_alternate_master_clock);
            assert_eq!(state.alternate_master, Some(audio));
            assert!(!state.got_a_master_clock);
        }

        // The named master arrives: the stand-in reverts to a plain clock.
        let video = register_video(&rig, 25);
        {
            let state = rig.coordinator.lock_state();
            assert!(!state.context(audio).unwrap().clock_master);
            assert!(state.context(video).unwrap().clock_master);
            assert!(state.got_a_master_clock);
            assert!(!state.got_an_alternate_master_clock);
            assert_eq!(state.alternate_master, None);
        }
    }

    #[test]
    fn test_system_clock_master_has_no_stream_master() {
        let rig = rig();
        let audio = register_audio(&rig);
        let state = rig.coordinator.lock_state();
        assert!(!state.context(audio).unwrap().clock_master);
        assert!(!state.got_a_master_clock);
        assert!(!state.got_an_alternate_master_clock);
    }

    #[test]
    fn test_first_video_stream_may_adjust_mapping_base() {
        let rig = rig();
        let v1 = register_video(&rig, 25);
        let v2 = register_video(&rig, 25);
        let state = rig.coordinator.lock_state();
        assert!(state.context(v1).unwrap().allowed_to_adjust_mapping_base);
        assert!(!state.context(v2).unwrap().allowed_to_adjust_mapping_base);
    }

    #[test]
    fn test_deregister_reelects_master_of_same_type() {
        let rig = rig();
        rig.policies
            .set_policy(None, Policy::MasterClock, PolicyValue::AudioClockMaster);

        let a1 = register_audio(&rig);
        let a2 = register_audio(&rig);
        rig.coordinator.deregister_stream(a1).unwrap();

        let state = rig.coordinator.lock_state();
        assert!(state.context(a2).unwrap().clock_master);
        assert!(state.got_a_master_clock);
    }

    #[test]
    fn test_deregister_transfers_mapping_base_privilege() {
        let rig = rig();
        let v1 = register_video(&rig, 25);
        let v2 = register_video(&rig, 25);
        rig.coordinator.deregister_stream(v1).unwrap();

        let state = rig.coordinator.lock_state();
        assert!(state.context(v2).unwrap().allowed_to_adjust_mapping_base);
        assert!(state.got_a_video_stream);
    }

    #[test]
    fn test_deregister_unknown_stream_fails() {
        let rig = rig();
        let handle = register_audio(&rig);
        rig.coordinator.deregister_stream(handle).unwrap();
        assert!(matches!(
            rig.coordinator.deregister_stream(handle),
            Err(SyncError::UnknownStream(_))
        ));
    }

    #[test]
    fn test_stream_specific_speed_is_rejected() {
        let rig = rig();
        let audio = register_audio(&rig);
        let result = rig.coordinator.set_playback_speed(
            Scope::Stream(audio),
            Rational::new(2, 1),
            PlayDirection::Forward,
        );
        assert!(matches!(result, Err(SyncError::NotSupported(_))));
    }

    #[test]
    fn test_speed_change_rebases_under_old_speed() {
        let rig = rig();
        let audio = register_audio(&rig);

        // Pin a mapping: playback 0 at system now, speed 1.
        rig.coordinator
            .establish_time_mapping(Scope::Playback, 0, Some(rig.clock.now_us()))
            .unwrap();

        // Half a second of playback elapses.
        rig.clock.advance(500_000);

        rig.coordinator
            .set_playback_speed(Scope::Playback, Rational::new(2, 1), PlayDirection::Forward)
            .unwrap();

        // The rebase must have recorded ~500ms of playback progress at the
        // old 1x speed, not 1s at the new 2x speed.
        let state = rig.coordinator.lock_state();
        assert_eq!(state.master_base_normalized_playback_time, 500_000);
        assert_eq!(state.master_base_system_time, rig.clock.now_us());
        let ctx = state.context(audio).unwrap();
        assert!(
            ctx.base_system_time_adjusted
                .load(std::sync::atomic::Ordering::Acquire)
        );
    }

    #[test]
    fn test_leaving_pause_resets_mappings() {
        let rig = rig();
        let _audio = register_audio(&rig);
        rig.coordinator
            .establish_time_mapping(Scope::Playback, 0, Some(rig.clock.now_us()))
            .unwrap();

        rig.coordinator
            .set_playback_speed(Scope::Playback, Rational::ZERO, PlayDirection::Forward)
            .unwrap();
        {
            let state = rig.coordinator.lock_state();
            assert!(state.master_time_mapping_established, "pausing keeps the mapping");
        }

        rig.coordinator
            .set_playback_speed(Scope::Playback, Rational::ONE, PlayDirection::Forward)
            .unwrap();
        let state = rig.coordinator.lock_state();
        assert!(!state.master_time_mapping_established, "resuming drops stale mappings");
        assert!(state.speed.is_one());
    }
}
