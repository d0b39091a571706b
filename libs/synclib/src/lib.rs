// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! synclib: output synchronization core for multi-stream A/V playback.
//!
//! Keeps independently decoded audio and video streams presented in
//! wall-clock synchrony: a shared master time mapping anchors normalized
//! playback time to the system clock, a startup rendezvous elects that
//! mapping from the earliest-starting stream, PTS discontinuities cascade
//! through every stream without a glitch, and per-stream least-squares
//! drift estimation trims each output clock against the elected master.
//!
//! The embedding player supplies the collaborators: a [`Manifestor`] per
//! stream (the frame output sink), a [`PolicySource`], an [`EventSink`],
//! and a [`MonotonicClock`]. Each stream's decode/output thread then calls
//! into one shared [`OutputCoordinator`]:
//!
//! ```ignore
//! use std::sync::Arc;
//! use synclib::{
//!     EventMask, NullEventSink, OutputCoordinator, PolicyStore, Scope, StandardClock,
//!     StreamType, UNSPECIFIED_TIME,
//! };
//!
//! let coordinator = Arc::new(OutputCoordinator::new(
//!     Arc::new(PolicyStore::new()),
//!     Arc::new(NullEventSink),
//!     Arc::new(StandardClock::new()),
//!     EventMask::all(),
//! ));
//!
//! let audio = coordinator.register_stream(StreamType::Audio, Some(audio_sink))?;
//!
//! // Per frame, on the stream's own thread:
//! let start = coordinator.synchronize_streams(audio, first_pts, UNSPECIFIED_TIME)?;
//! coordinator.perform_entry_into_decode_window_wait(audio, pts, porch, max_sleep)?;
//! coordinator.handle_playback_time_deltas(Scope::Stream(audio), false, expected, actual)?;
//! let (rate, _) = coordinator.calculate_output_rate_adjustment(
//!     Scope::Stream(audio), expected_duration, actual_duration, error)?;
//! ```

pub mod core;

pub use core::{
    ChannelEventSink,
    CoordinatorEvent,
    EventCode,
    EventMask,
    EventSink,
    INVALID_TIME,
    LeastSquaresFit,
    Manifestor,
    ManualResetEvent,
    MappingBaseAdjustment,
    MonotonicClock,
    NullEventSink,
    OutputCoordinator,
    OutputRateParameters,
    PlayDirection,
    Policy,
    PolicySource,
    PolicyStore,
    PolicyValue,
    Rational,
    RateAdjustmentKind,
    Result,
    Scope,
    StandardClock,
    StreamHandle,
    StreamType,
    SurfaceParameters,
    SyncError,
    TIME_NOT_APPLICABLE,
    TimeFormat,
    UNSPECIFIED_TIME,
    VsyncMonitorState,
    WaitOutcome,
    valid_time,
};
