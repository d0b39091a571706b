// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Manifestor seam - the frame output sink each stream renders through.
//!
//! The coordinator never touches frames; it only asks the sink two things:
//! what surface it outputs onto (video only, for frame-period arithmetic)
//! and when its next queued frame will reach the display or DAC (to compute
//! a restart point that does not discard already-queued output).

use crate::core::error::Result;
use crate::core::rational::Rational;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamType {
    Audio,
    Video,
}

impl StreamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::Audio => "audio",
            StreamType::Video => "video",
        }
    }
}

/// Output surface description for a video stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SurfaceParameters {
    /// Display refresh rate in frames per second (e.g. 30000/1001).
    pub frame_rate: Rational,
    /// False for interlaced output, where a frame spans two display fields.
    pub progressive: bool,
}

impl SurfaceParameters {
    /// Duration of one output frame in microseconds, doubled for
    /// interlaced surfaces.
    pub fn frame_duration_us(&self) -> u64 {
        let duration = self.frame_rate.recip().scale_rounded(1_000_000);
        if self.progressive {
            duration as u64
        } else {
            2 * duration as u64
        }
    }
}

/// Frame output sink for one stream.
///
/// All methods may be called from any thread, and may be called while the
/// coordinator holds internal locks - implementations must not call back
/// into the coordinator.
pub trait Manifestor: Send + Sync {
    /// Current output surface parameters. Only meaningful for video
    /// streams; re-queried whenever frame geometry matters so mode changes
    /// are picked up.
    fn surface_parameters(&self) -> Result<SurfaceParameters>;

    /// System time (microseconds) at which the next already-queued frame
    /// will be manifested. When nothing is queued, "now" is an acceptable
    /// answer.
    fn next_queued_manifestation_time(&self) -> Result<u64>;
}
