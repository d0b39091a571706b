// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Stream addressing for coordinator operations.

use serde::{Deserialize, Serialize};

/// Opaque identifier for a registered stream.
///
/// Handles are allocated by [`register_stream`](crate::core::OutputCoordinator::register_stream)
/// and stay valid until the stream is deregistered. They are never reused
/// within the lifetime of a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamHandle(pub(crate) u32);

/// Addressing scope for coordinator operations.
///
/// Most operations can act either on a single stream or on the playback as
/// a whole (the master time mapping plus every registered stream).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// The whole playback: the master mapping and all registered streams.
    Playback,
    /// One registered stream.
    Stream(StreamHandle),
}

impl From<StreamHandle> for Scope {
    fn from(handle: StreamHandle) -> Self {
        Scope::Stream(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_from_handle() {
        let handle = StreamHandle(3);
        assert_eq!(Scope::from(handle), Scope::Stream(handle));
        assert_ne!(Scope::from(handle), Scope::Playback);
    }

    #[test]
    fn test_handle_serde_roundtrip() {
        let handle = StreamHandle(7);
        let json = serde_json::to_string(&handle).unwrap();
        let back: StreamHandle = serde_json::from_str(&json).unwrap();
        assert_eq!(handle, back);
    }
}
