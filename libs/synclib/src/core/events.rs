// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Coordinator event reporting.
//!
//! The coordinator raises a small set of events toward the embedding player
//! (mapping established, mapping reset, vsync offset measured). Event
//! construction is gated on a listener mask so the hot paths pay nothing
//! when nobody subscribed. Delivery goes through the [`EventSink`] trait;
//! [`ChannelEventSink`] is a ready-made non-blocking fan-out over bounded
//! channels - a busy subscriber misses events rather than stalling the
//! coordinator.

use crate::core::error::Result;
use crate::core::handles::StreamHandle;
use bitflags::bitflags;
use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::time::TIME_NOT_APPLICABLE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCode {
    TimeMappingEstablished,
    TimeMappingReset,
    VsyncOffsetMeasured,
}

bitflags! {
    /// Which event codes anyone is listening for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventMask: u32 {
        const TIME_MAPPING_ESTABLISHED = 1 << 0;
        const TIME_MAPPING_RESET       = 1 << 1;
        const VSYNC_OFFSET_MEASURED    = 1 << 2;
    }
}

impl EventCode {
    pub fn mask(&self) -> EventMask {
        match self {
            EventCode::TimeMappingEstablished => EventMask::TIME_MAPPING_ESTABLISHED,
            EventCode::TimeMappingReset => EventMask::TIME_MAPPING_RESET,
            EventCode::VsyncOffsetMeasured => EventMask::VSYNC_OFFSET_MEASURED,
        }
    }
}

/// One raised event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorEvent {
    pub code: EventCode,
    /// The stream the event concerns; `None` addresses every stream.
    pub stream: Option<StreamHandle>,
    /// Playback time the event relates to, or
    /// [`TIME_NOT_APPLICABLE`](crate::core::time::TIME_NOT_APPLICABLE).
    pub playback_time: u64,
    /// Event-specific payload (established system base, measured offset).
    pub value: i64,
}

impl CoordinatorEvent {
    pub fn new(code: EventCode, stream: Option<StreamHandle>) -> Self {
        Self {
            code,
            stream,
            playback_time: TIME_NOT_APPLICABLE,
            value: 0,
        }
    }

    pub fn at_playback_time(mut self, playback_time: u64) -> Self {
        self.playback_time = playback_time;
        self
    }

    pub fn with_value(mut self, value: i64) -> Self {
        self.value = value;
        self
    }
}

/// Destination for coordinator events, implemented by the embedding player.
pub trait EventSink: Send + Sync {
    fn signal_event(&self, event: CoordinatorEvent) -> Result<()>;
}

/// A sink that ignores everything. Pair with an empty [`EventMask`].
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn signal_event(&self, _event: CoordinatorEvent) -> Result<()> {
        Ok(())
    }
}

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 16;

/// Non-blocking fan-out sink over bounded crossbeam channels.
///
/// Each subscriber gets its own channel. Delivery uses `try_send`: when a
/// subscriber's channel is full the event is dropped for that subscriber,
/// so a stalled listener can never block a stream thread.
pub struct ChannelEventSink {
    senders: Mutex<Vec<Sender<CoordinatorEvent>>>,
}

impl ChannelEventSink {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> Receiver<CoordinatorEvent> {
        let (tx, rx) = bounded(SUBSCRIBER_CHANNEL_CAPACITY);
        self.senders.lock().push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders.lock().len()
    }
}

impl Default for ChannelEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for ChannelEventSink {
    fn signal_event(&self, event: CoordinatorEvent) -> Result<()> {
        let mut senders = self.senders.lock();
        // Drop channels whose receiver went away, deliver to the rest.
        senders.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(crossbeam_channel::TrySendError::Full(_)) => true,
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => false,
        });
        Ok(())
    }
}
