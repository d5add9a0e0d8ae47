//! Save-state snapshot of the mixer.
//!
//! Only configuration scalars are persisted. Ring contents, indices and
//! fractional phase are deliberately not: undelivered audio is simply lost
//! across a save, it is not silent hardware state to replay.

use serde::{Deserialize, Serialize};

/// Persisted scalars of one source fifo.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FifoState {
    pub input_sample_rate: f64,
    /// Internal 0-256 gain, not the 0-255 API value.
    pub volume_left: i32,
    pub volume_right: i32,
}

/// Persisted mixer state: one entry per source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MixerState {
    pub dma: FifoState,
    pub streaming: FifoState,
    pub speakers: [FifoState; 4],
}
