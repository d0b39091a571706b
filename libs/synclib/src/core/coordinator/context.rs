// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Per-stream coordinator state.

use crate::core::handles::StreamHandle;
use crate::core::least_squares::LeastSquaresFit;
use crate::core::manifestor::{Manifestor, StreamType, SurfaceParameters};
use crate::core::rational::Rational;
use crate::core::sync::ManualResetEvent;
use crate::core::time::INVALID_TIME;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// Tuning set for the clock-drift estimator.
///
/// Integration windows grow geometrically between `minimum_integration_frames`
/// and `maximum_integration_frames`; between windows the estimator idles for
/// `ignore_between_integrations` frames. A window only reads out when the
/// final sample's expected/actual difference is inside
/// `maximum_jitter_difference`. Long-term drift correction engages once the
/// window has grown past `integration_threshold_for_drift_correction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputRateParameters {
    pub minimum_integration_frames: u32,
    pub maximum_integration_frames: u32,
    pub ignore_between_integrations: u32,
    pub maximum_jitter_difference: i64,
    pub integration_threshold_for_drift_correction: u32,
}

pub const INPUT_FOLLOWING_AUDIO: OutputRateParameters = OutputRateParameters {
    minimum_integration_frames: 128,
    maximum_integration_frames: 2048,
    ignore_between_integrations: 64,
    maximum_jitter_difference: 256,
    integration_threshold_for_drift_correction: 32,
};

pub const OUTPUT_DRIVEN_AUDIO: OutputRateParameters = OutputRateParameters {
    minimum_integration_frames: 512,
    maximum_integration_frames: 4096,
    ignore_between_integrations: 64,
    maximum_jitter_difference: 2048,
    integration_threshold_for_drift_correction: 32,
};

pub const INPUT_FOLLOWING_VIDEO: OutputRateParameters = OutputRateParameters {
    minimum_integration_frames: 128,
    maximum_integration_frames: 2048,
    ignore_between_integrations: 64,
    maximum_jitter_difference: 256,
    integration_threshold_for_drift_correction: 32,
};

pub const OUTPUT_DRIVEN_VIDEO: OutputRateParameters = OutputRateParameters {
    minimum_integration_frames: 2048,
    maximum_integration_frames: 8192,
    ignore_between_integrations: 64,
    maximum_jitter_difference: 8192,
    integration_threshold_for_drift_correction: 32,
};

/// How a stream's output rate is being steered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateAdjustmentKind {
    /// The mapping is externally supplied; the stream follows its input.
    InputFollowing,
    /// The coordinator owns the mapping; the output hardware drives.
    OutputDriven,
}

pub fn rate_parameters(stream_type: StreamType, kind: RateAdjustmentKind) -> OutputRateParameters {
    match (kind, stream_type) {
        (RateAdjustmentKind::InputFollowing, StreamType::Video) => INPUT_FOLLOWING_VIDEO,
        (RateAdjustmentKind::InputFollowing, StreamType::Audio) => INPUT_FOLLOWING_AUDIO,
        (RateAdjustmentKind::OutputDriven, StreamType::Video) => OUTPUT_DRIVEN_VIDEO,
        (RateAdjustmentKind::OutputDriven, StreamType::Audio) => OUTPUT_DRIVEN_AUDIO,
    }
}

/// All coordinator state for one registered stream.
///
/// Owned by the coordinator arena and only touched under the coordinator
/// lock, except for `abort_decode_window_wait` (waited on lock-free by the
/// stream's own thread) and `base_system_time_adjusted` (an edge-triggered
/// flag consumed with an atomic swap).
pub(crate) struct StreamContext {
    pub handle: StreamHandle,
    pub stream_type: StreamType,
    pub manifestor: Arc<dyn Manifestor>,
    pub surface: Option<SurfaceParameters>,

    pub base_system_time: u64,
    pub base_normalized_playback_time: u64,
    pub time_mapping_established: bool,
    pub based_on_master_mapping_version: u32,
    pub base_system_time_adjusted: AtomicBool,

    pub accumulated_playback_time_jumps: i64,

    pub clock_master: bool,
    pub allowed_to_adjust_mapping_base: bool,

    pub rate_adjustment_kind: Option<RateAdjustmentKind>,
    pub rate_parameters: OutputRateParameters,
    pub clock_adjustment: Rational,
    pub clock_adjustment_established: bool,
    pub integrating_clock_drift: bool,
    pub frames_to_integrate_over: u32,
    pub last_integration_was_restarted: bool,
    pub integration_count: u32,
    pub least_squares: LeastSquaresFit,
    pub error_history: [i64; 4],

    pub in_startup_delay: bool,
    pub in_synchronize: bool,
    pub synchronizing_at_playback_time: u64,
    pub abort_decode_window_wait: Arc<ManualResetEvent>,

    /// Start-time offset relative to the mapping this stream adopted;
    /// unset until the stream has synchronized at least once.
    pub stream_offset: Option<i64>,
    pub manifestor_latency: Option<u64>,
}

impl StreamContext {
    pub fn new(
        handle: StreamHandle,
        stream_type: StreamType,
        manifestor: Arc<dyn Manifestor>,
        surface: Option<SurfaceParameters>,
    ) -> Self {
        let parameters = rate_parameters(stream_type, RateAdjustmentKind::InputFollowing);
        Self {
            handle,
            stream_type,
            manifestor,
            surface,
            base_system_time: 0,
            base_normalized_playback_time: 0,
            time_mapping_established: false,
            based_on_master_mapping_version: 0,
            base_system_time_adjusted: AtomicBool::new(false),
            accumulated_playback_time_jumps: 0,
            clock_master: false,
            allowed_to_adjust_mapping_base: false,
            rate_adjustment_kind: None,
            rate_parameters: parameters,
            clock_adjustment: Rational::ONE,
            clock_adjustment_established: false,
            integrating_clock_drift: false,
            frames_to_integrate_over: parameters.minimum_integration_frames,
            last_integration_was_restarted: false,
            integration_count: 0,
            least_squares: LeastSquaresFit::new(),
            error_history: [0; 4],
            in_startup_delay: false,
            in_synchronize: false,
            synchronizing_at_playback_time: INVALID_TIME,
            abort_decode_window_wait: Arc::new(ManualResetEvent::new()),
            stream_offset: None,
            manifestor_latency: None,
        }
    }

    /// True while the stream's own thread is inside synchronization and the
    /// context must not be torn down.
    pub fn busy(&self) -> bool {
        self.in_startup_delay || self.in_synchronize
    }
}
