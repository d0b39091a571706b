// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Playback policies - the knobs the embedding player exposes to the
//! coordinator.
//!
//! Policies are read at well-defined moments (registration, synchronization,
//! jump detection, rate integration) rather than cached, so an application
//! can retune behavior mid-playback. The coordinator itself only writes one
//! policy: the one-shot sync-start-immediate flag, which it clears after
//! consuming.

use crate::core::handles::StreamHandle;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-playback policy keys consulted by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Policy {
    /// Which clock drives the shared rate correction: a stream type's
    /// output clock, or the system clock itself.
    MasterClock,
    /// The time mapping is supplied externally; the coordinator must not
    /// elect or mutate one.
    ExternalTimeMapping,
    /// Under an external mapping, the display is genlocked to the source;
    /// measured vsync offsets are reported but never applied.
    ExternalTimeMappingVsyncLocked,
    /// Forward PTS jump detection threshold, as a power-of-two seconds
    /// exponent.
    PtsForwardJumpDetectionThreshold,
    /// Use the forward threshold for reverse jumps too, instead of the
    /// small fixed reverse tolerance.
    SymmetricJumpDetection,
    /// Clock-rate pulling limit, as a power-of-two parts-per-million
    /// exponent.
    ClockPullingLimit2ToTheNPartsPerMillion,
    /// One-shot: the next synchronization gives up waiting for other
    /// streams after a single poll interval. Cleared on consumption.
    SyncStartImmediate,
    /// Anchor the elected mapping on the earliest video stream even when an
    /// audio stream starts earlier.
    VideoStartImmediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyValue {
    Disapply,
    Apply,
    AudioClockMaster,
    VideoClockMaster,
    SystemClockMaster,
    /// Numeric policies (power-of-two exponents).
    Exponent(u8),
}

impl PolicyValue {
    pub fn applies(&self) -> bool {
        matches!(self, PolicyValue::Apply)
    }

    pub fn exponent(&self) -> u8 {
        match self {
            PolicyValue::Exponent(n) => *n,
            _ => 0,
        }
    }
}

/// Source of policy values, implemented by the embedding player.
///
/// `stream` scopes a query to one stream where the player differentiates;
/// `None` addresses the whole playback.
pub trait PolicySource: Send + Sync {
    fn policy_value(&self, stream: Option<StreamHandle>, policy: Policy) -> PolicyValue;

    fn set_policy(&self, stream: Option<StreamHandle>, policy: Policy, value: PolicyValue);
}

/// In-memory policy table with playback-wide defaults and optional
/// per-stream overrides. Suitable for applications that do not already have
/// a policy host, and for tests.
pub struct PolicyStore {
    values: Mutex<HashMap<(Option<StreamHandle>, Policy), PolicyValue>>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
        }
    }

    fn default_value(policy: Policy) -> PolicyValue {
        match policy {
            Policy::MasterClock => PolicyValue::SystemClockMaster,
            Policy::ExternalTimeMapping => PolicyValue::Disapply,
            Policy::ExternalTimeMappingVsyncLocked => PolicyValue::Disapply,
            Policy::PtsForwardJumpDetectionThreshold => PolicyValue::Exponent(4),
            Policy::SymmetricJumpDetection => PolicyValue::Disapply,
            Policy::ClockPullingLimit2ToTheNPartsPerMillion => PolicyValue::Exponent(7),
            Policy::SyncStartImmediate => PolicyValue::Disapply,
            Policy::VideoStartImmediate => PolicyValue::Disapply,
        }
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicySource for PolicyStore {
    fn policy_value(&self, stream: Option<StreamHandle>, policy: Policy) -> PolicyValue {
        let values = self.values.lock();
        if let Some(v) = values.get(&(stream, policy)) {
            return *v;
        }
        // Per-stream queries fall back to the playback-wide setting.
        if stream.is_some() {
            if let Some(v) = values.get(&(None, policy)) {
                return *v;
            }
        }
        Self::default_value(policy)
    }

    fn set_policy(&self, stream: Option<StreamHandle>, policy: Policy, value: PolicyValue) {
        self.values.lock().insert((stream, policy), value);
    }
}
