//! Mixer construction-time configuration.
//!
//! Every speed/latency tuning constant lives here with its default rather
//! than being baked into the mixer, since these are qualitative knobs: what
//! matters is the catch-up and recovery hysteresis they drive, not the exact
//! numbers.

use serde::{Deserialize, Serialize};

/// Quality/latency trade-off for the surround decoder block size.
///
/// Higher quality means a larger analysis block and therefore more latency.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SurroundQuality {
    Lowest,
    Low,
    High,
    Highest,
}

impl SurroundQuality {
    /// Analysis block length in milliseconds before power-of-two rounding.
    pub(crate) fn block_time_ms(self) -> u32 {
        match self {
            SurroundQuality::Lowest => 10,
            SurroundQuality::Low => 20,
            SurroundQuality::High => 40,
            // Latency-heavy; kept for parity with decoders that support it
            SurroundQuality::Highest => 80,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerConfig {
    /// Host output sample rate shared by every resampling ratio.
    pub sample_rate: u32,

    /// Maximum tolerated post-mix latency, in milliseconds. When observed
    /// latency exceeds this the mixer nudges playback speed up until it
    /// returns under half of it.
    pub max_latency_ms: u32,

    /// How long the emulation may run behind the nominal speed before the
    /// mixer falls back to tracking the actual speed, in milliseconds.
    /// `0` forces actual-speed tracking at all times; negative disables the
    /// fallback entirely.
    pub speed_tolerance_ms: i32,

    /// Start with pitch-preserving time stretching enabled.
    pub stretching: bool,

    /// Nominal emulation speed target (1.0 = full speed, 0.0 = unthrottled).
    pub emulation_speed: f64,

    /// Speed multiplier applied while catching up latency without
    /// stretching. Barely audible but enough to drain the excess.
    pub direct_catch_up_speed: f64,

    /// Speed multiplier applied while catching up latency with stretching
    /// active. Pitch correction masks the change, so correct faster.
    pub stretching_catch_up_speed: f64,

    /// Relative slack below nominal speed before a frame counts towards the
    /// behind-target timer.
    pub behind_speed_slack: f64,

    /// Relative slack when deciding the average speed has recovered back to
    /// nominal.
    pub recovered_speed_slack: f64,

    /// Multiplier applied to `max_latency_ms` while running unthrottled or
    /// behind the target speed.
    pub behind_latency_scale: f64,

    /// Window, in seconds, of the speed counter's rolling average. Balances
    /// reactiveness against smoothness; backend latency should stay below
    /// this for the estimate to be useful.
    pub speed_average_window: f64,

    pub surround_quality: SurroundQuality,

    /// Feed a mono downmix to the LFE channel. Off by default: most setups
    /// run their own low-pass crossover.
    pub surround_bass_redirection: bool,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            max_latency_ms: 75,
            speed_tolerance_ms: 80,
            stretching: false,
            emulation_speed: 1.0,
            direct_catch_up_speed: 1.0175,
            stretching_catch_up_speed: 1.25,
            behind_speed_slack: 0.0,
            recovered_speed_slack: 0.001,
            behind_latency_scale: 1.0,
            speed_average_window: 0.425,
            surround_quality: SurroundQuality::Low,
            surround_bass_redirection: false,
        }
    }
}
