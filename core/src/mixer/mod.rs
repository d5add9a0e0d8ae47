//! The mixer: pulls from every source fifo, resamples against the measured
//! emulation speed, and hands finished stereo (or decoded surround) blocks
//! to the audio backend.
//!
//! Split into an owned consumer half ([`Mixer`], lives on the audio thread,
//! `&mut self`) and a cloneable producer handle ([`MixerInput`], `&self`,
//! safe to call from the emulation thread). The two halves meet in
//! [`MixerShared`]: lock-free fifos, the push-cadence speed counter, and
//! runtime settings mirrored into atomics.

mod fifo;
#[cfg(test)]
mod tests;

pub use fifo::MAX_SAMPLES;
use fifo::{FifoShared, INTERP_SAMPLES, NC, SourceFifo};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tracing::{debug, error, info, trace, warn};

use crate::atomic::AtomicF64;
use crate::config::MixerConfig;
use crate::speed::SpeedCounter;
use crate::state::{FifoState, MixerState};
use crate::stretch::{OlaStretcher, TimeStretcher};
use crate::surround::{MatrixDecoder, SURROUND_CHANNELS, SurroundDecoder};
use crate::time::{Clock, MonotonicClock};

/// Independently-routed loudspeaker channels on the emulated controller.
pub const NUM_SPEAKERS: usize = 4;

const DMA_SAMPLE_RATE: f64 = 32_000.0;
const STREAMING_SAMPLE_RATE: f64 = 48_000.0;
const SPEAKER_SAMPLE_RATE: f64 = 6_000.0;

/// Emulated samples per DMA transfer at the nominal rate.
const DMA_FRAMES_PER_PUSH: f64 = 560.0;

struct MixerShared {
    dma: Arc<FifoShared>,
    streaming: Arc<FifoShared>,
    speakers: [Arc<FifoShared>; NUM_SPEAKERS],
    speed: SpeedCounter,
    sample_rate: AtomicU32,
    /// Ratio the fifos resample by on top of their nominal rate. 1.0 while
    /// stretching (the stretcher owns tempo).
    target_speed: AtomicF64,
    /// Seconds spent mixing at a measured (non-nominal) speed, the window
    /// fed to the custom-speed average.
    time_at_custom_speed: AtomicF64,
    surround_changed: AtomicBool,

    // Runtime-adjustable settings, mirrored from MixerConfig.
    emulation_speed: AtomicF64,
    throttle_disabled: AtomicBool,
    stretching: AtomicBool,
    /// Seconds; negative disables dynamic speed, zero forces it.
    speed_tolerance: AtomicF64,
    /// Seconds of post-mix latency tolerated before catching up.
    max_latency: AtomicF64,
}

impl MixerShared {
    fn fifo_rate(&self, fifo: &FifoShared) -> f64 {
        fifo.input_sample_rate() * self.target_speed.load(Ordering::Relaxed)
            / f64::from(self.sample_rate.load(Ordering::Relaxed))
    }
}

/// Consumer half. Owns the resampling cursors, the time stretcher and the
/// surround decoder; exactly one audio thread drives it.
pub struct Mixer {
    shared: Arc<MixerShared>,
    dma: SourceFifo,
    streaming: SourceFifo,
    speakers: [SourceFifo; NUM_SPEAKERS],

    stretcher: Box<dyn TimeStretcher>,
    decoder: Box<dyn SurroundDecoder>,

    /// Pre-stretch mix buffer (stretching mode mixes at emulated pace).
    scratch: Vec<i16>,
    /// Stereo staging for surround decoding.
    surround_scratch: Vec<i16>,
    /// Byte-order-fixed ring snapshot for the interpolator.
    interp_scratch: Vec<i16>,

    /// Seconds of audio the emulation owes us; saturates at zero.
    time_behind_target_speed: f64,
    behind_target_speed: bool,
    /// Once latency exceeds the max, keep catching up until it reaches the
    /// target, not just back under the max.
    latency_catching_up: bool,
    /// Whether the stretcher still holds samples to drain after stretching
    /// was turned off.
    stretching_active: bool,

    config: MixerConfig,
}

impl Mixer {
    pub fn new(config: MixerConfig) -> Self {
        let stretcher = Box::new(OlaStretcher::new(config.sample_rate));
        let decoder = Box::new(MatrixDecoder::new(
            config.sample_rate,
            config.surround_quality,
            config.surround_bass_redirection,
        ));
        Self::with_collaborators(config, stretcher, decoder)
    }

    /// Build a mixer around replacement DSP engines. The bundled
    /// [`OlaStretcher`] and [`MatrixDecoder`] are just defaults; anything
    /// implementing the two traits can be swapped in here.
    pub fn with_collaborators(
        config: MixerConfig,
        stretcher: Box<dyn TimeStretcher>,
        decoder: Box<dyn SurroundDecoder>,
    ) -> Self {
        Self::with_clock(config, stretcher, decoder, Arc::new(MonotonicClock::new()))
    }

    pub(crate) fn with_clock(
        config: MixerConfig,
        mut stretcher: Box<dyn TimeStretcher>,
        mut decoder: Box<dyn SurroundDecoder>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let speed = SpeedCounter::new(
            config.speed_average_window,
            DMA_SAMPLE_RATE,
            DMA_FRAMES_PER_PUSH,
            clock,
        );
        // Assume full speed until real pushes arrive, so startup doesn't
        // begin with a spurious slowdown
        speed.start(true);

        stretcher.set_sample_rate(config.sample_rate);
        decoder.init_and_set_sample_rate(config.sample_rate);

        let shared = Arc::new(MixerShared {
            dma: Arc::new(FifoShared::new(DMA_SAMPLE_RATE, true, true)),
            streaming: Arc::new(FifoShared::new(STREAMING_SAMPLE_RATE, true, true)),
            speakers: std::array::from_fn(|_| {
                Arc::new(FifoShared::new(SPEAKER_SAMPLE_RATE, false, false))
            }),
            speed,
            sample_rate: AtomicU32::new(config.sample_rate),
            target_speed: AtomicF64::new(1.0),
            time_at_custom_speed: AtomicF64::new(0.0),
            surround_changed: AtomicBool::new(false),
            emulation_speed: AtomicF64::new(config.emulation_speed),
            throttle_disabled: AtomicBool::new(false),
            stretching: AtomicBool::new(config.stretching),
            speed_tolerance: AtomicF64::new(f64::from(config.speed_tolerance_ms) / 1000.0),
            max_latency: AtomicF64::new(f64::from(config.max_latency_ms) / 1000.0),
        });

        info!(sample_rate = config.sample_rate, "mixer initialized");

        Self {
            dma: SourceFifo::new(shared.dma.clone()),
            streaming: SourceFifo::new(shared.streaming.clone()),
            speakers: std::array::from_fn(|i| SourceFifo::new(shared.speakers[i].clone())),
            shared,
            stretcher,
            decoder,
            // Reserved up front so even the first callback never allocates
            scratch: Vec::with_capacity((MAX_SAMPLES * NC) as usize),
            surround_scratch: Vec::with_capacity((MAX_SAMPLES * NC) as usize),
            interp_scratch: vec![0; (MAX_SAMPLES * NC) as usize],
            time_behind_target_speed: 0.0,
            behind_target_speed: false,
            latency_catching_up: false,
            stretching_active: false,
            config,
        }
    }

    /// Producer handle for the emulation side. Cheap to clone.
    pub fn input(&self) -> MixerInput {
        MixerInput {
            shared: self.shared.clone(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.shared.sample_rate.load(Ordering::Relaxed)
    }

    /// Speed the last mix resampled at.
    pub fn current_speed(&self) -> f64 {
        self.shared.target_speed.load(Ordering::Relaxed)
    }

    /// Produce exactly `out.len() / 2` interleaved stereo frames.
    ///
    /// Always fills `out` completely (with underrun cover where needed) and
    /// returns the frame count, or returns 0 without touching `out` when
    /// paused or empty.
    pub fn mix(&mut self, out: &mut [i16]) -> usize {
        let num_frames = (out.len() / NC as usize) as u32;
        if num_frames == 0 || self.shared.speed.is_paused() {
            return 0;
        }

        let stretching = self.shared.stretching.load(Ordering::Relaxed);
        let emulation_speed = self.shared.emulation_speed.load(Ordering::Relaxed);
        let throttle_disabled = self.shared.throttle_disabled.load(Ordering::Relaxed);
        let frame_limiter = emulation_speed > 0.0 && !throttle_disabled;
        let sample_rate = self.shared.sample_rate.load(Ordering::Relaxed);
        let time_delta = f64::from(num_frames) / f64::from(sample_rate);

        let average_actual_speed = self.shared.speed.cached_average_speed(false, true, true);
        let mut predicting = true;
        let actual_speed = self.shared.speed.last_speed(&mut predicting, true);

        let mut target_speed = emulation_speed;
        if stretching {
            self.shared.target_speed.store(1.0, Ordering::Relaxed);
        }

        if !frame_limiter {
            // Unthrottled: follow the measured pace, there is no nominal one
            target_speed = self.shared.speed.cached_average_speed(true, true, true);
            let t = self.shared.time_at_custom_speed.load(Ordering::Relaxed);
            self.shared
                .time_at_custom_speed
                .store(t + time_delta, Ordering::Relaxed);
            if target_speed >= emulation_speed {
                self.time_behind_target_speed = 0.0;
                self.behind_target_speed = false;
            }
        } else {
            let tolerance = self.shared.speed_tolerance.load(Ordering::Relaxed);
            let dynamic_allowed = tolerance >= 0.0;
            let dynamic_forced = tolerance == 0.0;

            let gain_time_delta = time_delta * (1.0 - actual_speed / emulation_speed);
            self.time_behind_target_speed =
                (self.time_behind_target_speed + gain_time_delta).max(0.0);

            if actual_speed / emulation_speed < 1.0 - self.config.behind_speed_slack {
                if self.time_behind_target_speed > tolerance {
                    if !self.behind_target_speed && tolerance > 0.0 {
                        debug!(actual_speed, "emulation fell behind the target speed");
                    }
                    self.behind_target_speed = true;
                }
            } else if average_actual_speed
                >= emulation_speed - self.config.recovered_speed_slack * emulation_speed
            {
                if self.behind_target_speed && tolerance > 0.0 {
                    debug!("emulation recovered the target speed");
                }
                self.behind_target_speed = false;
                // What's lost is lost, don't try to make it up
                self.time_behind_target_speed = 0.0;
            }

            if dynamic_allowed && (dynamic_forced || self.behind_target_speed) {
                target_speed = self.shared.speed.cached_average_speed(true, true, true);
                let t = self.shared.time_at_custom_speed.load(Ordering::Relaxed);
                self.shared
                    .time_at_custom_speed
                    .store(t + time_delta, Ordering::Relaxed);
            } else {
                self.shared.time_at_custom_speed.store(0.0, Ordering::Relaxed);
            }
        }

        // Latency budget: if more audio is queued than the user asked to
        // tolerate, consume it faster than real time until back on target
        let mut max_latency = self.shared.max_latency.load(Ordering::Relaxed);
        if !frame_limiter || self.behind_target_speed {
            max_latency *= self.config.behind_latency_scale;
        }
        let (latency, target_latency, catch_up_speed) = if stretching {
            let latency = self.stretcher.processed_latency();
            let acceptable = self.stretcher.acceptable_latency() - time_delta;
            let target_latency = acceptable + max_latency * 0.5;
            max_latency += acceptable;
            (latency, target_latency, self.config.stretching_catch_up_speed)
        } else {
            let rate = self.shared.dma.input_sample_rate() * target_speed / f64::from(sample_rate);
            let post_mix = i64::from(self.shared.dma.num_frames(rate))
                - (f64::from(num_frames) * rate) as i64
                - i64::from(INTERP_SAMPLES);
            let latency = post_mix.max(0) as f64 / self.shared.dma.input_sample_rate();
            (latency, max_latency * 0.5, self.config.direct_catch_up_speed)
        };
        if latency
            > if self.latency_catching_up {
                target_latency
            } else {
                max_latency
            }
        {
            if !self.latency_catching_up {
                debug!(latency, "latency over budget, catching up");
            }
            self.latency_catching_up = true;
            target_speed *= catch_up_speed;
        } else {
            self.latency_catching_up = false;
        }

        if stretching {
            if !self.stretching_active {
                self.stretcher.clear();
                self.stretching_active = true;
            }
            // Averaging tempo changes sounds better unless the speed just
            // jumped (a prediction means a discontinuity in the cadence)
            self.stretcher.set_tempo(target_speed, predicting);

            // Mix at emulated pace: bounded by whichever active source has
            // the least audio queued, so the stretcher pads shortfalls
            // instead of the fifos
            let mut available = self
                .shared
                .dma
                .available_frames(self.shared.fifo_rate(&self.shared.dma), sample_rate)
                .min(
                    self.shared
                        .streaming
                        .available_frames(self.shared.fifo_rate(&self.shared.streaming), sample_rate),
                );
            for speaker in &self.shared.speakers {
                if speaker.currently_pushed() {
                    available = available
                        .min(speaker.available_frames(self.shared.fifo_rate(speaker), sample_rate));
                }
            }
            let available = available.min(MAX_SAMPLES) as usize;

            self.scratch.clear();
            self.scratch.resize(available * NC as usize, 0);

            self.dma
                .mix(&mut self.scratch, true, 1.0, sample_rate, &mut self.interp_scratch);
            self.streaming
                .mix(&mut self.scratch, true, 1.0, sample_rate, &mut self.interp_scratch);
            for speaker in &mut self.speakers {
                speaker.mix(&mut self.scratch, true, 1.0, sample_rate, &mut self.interp_scratch);
            }

            self.stretcher.push_samples(&self.scratch);
            out.fill(0);
            self.stretcher.stretched_samples(out, true);
        } else {
            self.shared.target_speed.store(target_speed, Ordering::Relaxed);
            out.fill(0);

            // Drain whatever the stretcher still holds before going direct,
            // so toggling stretching off doesn't drop audio
            let mut offset = 0usize;
            if self.stretching_active {
                let received = self.stretcher.stretched_samples(out, false);
                offset = received * NC as usize;
                if self.stretcher.processed_latency() <= 0.0 {
                    self.stretching_active = false;
                }
                if received > 0 {
                    trace!(frames = received, "drained stretcher backlog");
                }
            }

            self.dma.mix(
                &mut out[offset..],
                false,
                target_speed,
                sample_rate,
                &mut self.interp_scratch,
            );
            self.streaming.mix(
                &mut out[offset..],
                false,
                target_speed,
                sample_rate,
                &mut self.interp_scratch,
            );
            for speaker in &mut self.speakers {
                speaker.mix(
                    &mut out[offset..],
                    false,
                    target_speed,
                    sample_rate,
                    &mut self.interp_scratch,
                );
            }
        }

        num_frames as usize
    }

    /// Produce `out.len() / 6` frames of decoded 5.1 surround
    /// (FL, FR, C, LFE, BL, BR interleaved).
    ///
    /// Internally mixes the block-aligned amount of stereo the decoder asks
    /// for; on a shortfall (pause) outputs silence rather than feeding the
    /// decoder a partial block.
    pub fn mix_surround(&mut self, out: &mut [f32]) -> usize {
        let num_frames = out.len() / SURROUND_CHANNELS;
        out.fill(0.0);
        if num_frames == 0 {
            return 0;
        }

        let needed = self.decoder.samples_needed_for_output(num_frames);
        let mut stereo = std::mem::take(&mut self.surround_scratch);
        stereo.clear();
        stereo.resize(needed * NC as usize, 0);
        let mixed = self.mix(&mut stereo);
        if mixed != needed {
            if needed > 0 {
                error!(needed, mixed, "could not mix enough frames for surround decoding");
            }
            self.surround_scratch = stereo;
            return 0;
        }
        self.decoder.push_samples(&stereo);
        self.surround_scratch = stereo;
        self.decoder.decoded_samples(out);
        num_frames
    }

    /// Apply a backend/setting change that affects the DSP chain. Call from
    /// the audio thread between mixes.
    pub fn update_settings(&mut self, sample_rate: u32) {
        self.shared.sample_rate.store(sample_rate, Ordering::Relaxed);
        self.stretcher.set_sample_rate(sample_rate);
        if self.shared.surround_changed.swap(false, Ordering::Relaxed) {
            self.decoder
                .configure(self.config.surround_quality, self.config.surround_bass_redirection);
            self.decoder.clear();
        }
        self.decoder.init_and_set_sample_rate(sample_rate);
        debug!(sample_rate, "mixer settings updated");
    }

    pub fn set_surround_quality(&mut self, quality: crate::config::SurroundQuality) {
        self.config.surround_quality = quality;
        self.shared.surround_changed.store(true, Ordering::Relaxed);
    }

    pub fn set_surround_bass_redirection(&mut self, enabled: bool) {
        self.config.surround_bass_redirection = enabled;
        self.shared.surround_changed.store(true, Ordering::Relaxed);
    }

    /// Snapshot the producer-visible fifo configuration for savestates.
    /// Queued samples and resampling cursors are transient and excluded.
    pub fn save_state(&self) -> MixerState {
        let fifo_state = |fifo: &FifoShared| {
            let (volume_left, volume_right) = fifo.volumes();
            FifoState {
                input_sample_rate: fifo.input_sample_rate(),
                volume_left,
                volume_right,
            }
        };
        MixerState {
            dma: fifo_state(&self.shared.dma),
            streaming: fifo_state(&self.shared.streaming),
            speakers: std::array::from_fn(|i| fifo_state(&self.shared.speakers[i])),
        }
    }

    pub fn load_state(&mut self, state: &MixerState) {
        let apply = |fifo: &FifoShared, s: &FifoState| {
            fifo.set_input_sample_rate(s.input_sample_rate);
            fifo.set_volumes_raw(s.volume_left, s.volume_right);
        };
        apply(&self.shared.dma, &state.dma);
        apply(&self.shared.streaming, &state.streaming);
        for (fifo, s) in self.shared.speakers.iter().zip(&state.speakers) {
            apply(fifo, s);
        }
        self.shared
            .speed
            .set_ticks_per_second(state.dma.input_sample_rate);
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<MixerShared> {
        &self.shared
    }
}

/// Producer handle: everything the emulation thread pushes or tweaks.
/// All methods are `&self` and non-blocking.
#[derive(Clone)]
pub struct MixerInput {
    shared: Arc<MixerShared>,
}

impl MixerInput {
    /// Push interleaved big-endian stereo from the DMA source. Each push
    /// also feeds the speed counter, which is what ties resampling to the
    /// emulation's actual pace.
    pub fn push_dma_samples(&self, samples: &[i16]) {
        if samples.is_empty() {
            return;
        }
        let frames = samples.len() / NC as usize;
        self.shared.speed.update(frames as f64);
        self.shared.speed.cache_average_speed(false, -1.0);
        self.shared.speed.cache_average_speed(
            true,
            self.shared.time_at_custom_speed.load(Ordering::Relaxed),
        );
        trace!(frames, "dma push");
        self.shared
            .dma
            .push(samples, self.shared.fifo_rate(&self.shared.dma));
    }

    /// Push interleaved big-endian stereo from the streaming source.
    ///
    /// Streaming pushes arrive in lockstep with DMA pushes, so they double
    /// as the absence clock for the speaker fifos.
    pub fn push_streaming_samples(&self, samples: &[i16]) {
        if samples.is_empty() {
            return;
        }
        self.shared
            .streaming
            .push(samples, self.shared.fifo_rate(&self.shared.streaming));

        let time_delta =
            (samples.len() / NC as usize) as f64 / self.shared.streaming.input_sample_rate();
        let preseed = self.speaker_preseed_latency();
        for speaker in &self.shared.speakers {
            speaker.update_push(-time_delta, preseed, self.shared.fifo_rate(speaker));
        }
    }

    /// Push mono native-endian samples for one controller speaker; they are
    /// duplicated to both channels. `sample_rate` is the speaker's current
    /// decode rate.
    pub fn push_speaker_samples(&self, index: usize, samples: &[i16], sample_rate: u32) {
        let Some(speaker) = self.shared.speakers.get(index) else {
            warn!(index, "speaker index out of range");
            return;
        };
        if samples.is_empty() || sample_rate == 0 {
            return;
        }
        let frames = samples.len().min(MAX_SAMPLES as usize);
        speaker.set_input_sample_rate(f64::from(sample_rate));
        speaker.update_push(
            frames as f64 / f64::from(sample_rate),
            self.speaker_preseed_latency(),
            self.shared.fifo_rate(speaker),
        );

        let mut stereo = Vec::with_capacity(frames * NC as usize);
        for &s in &samples[..frames] {
            stereo.push(s);
            stereo.push(s);
        }
        speaker.push(&stereo, self.shared.fifo_rate(speaker));
    }

    fn speaker_preseed_latency(&self) -> f64 {
        if self.shared.stretching.load(Ordering::Relaxed) {
            0.0
        } else {
            self.shared.max_latency.load(Ordering::Relaxed) * 0.5
        }
    }

    pub fn set_dma_input_sample_rate(&self, rate: f64) {
        self.shared.dma.set_input_sample_rate(rate);
        self.shared.speed.set_ticks_per_second(rate);
    }

    pub fn set_streaming_input_sample_rate(&self, rate: f64) {
        self.shared.streaming.set_input_sample_rate(rate);
    }

    /// 0-255 per channel.
    pub fn set_streaming_volume(&self, left: u32, right: u32) {
        self.shared.streaming.set_volume(left.min(255), right.min(255));
    }

    /// 0-255 per channel.
    pub fn set_speaker_volume(&self, index: usize, left: u32, right: u32) {
        let Some(speaker) = self.shared.speakers.get(index) else {
            warn!(index, "speaker index out of range");
            return;
        };
        speaker.set_volume(left.min(255), right.min(255));
    }

    /// While paused the mixer outputs nothing and push cadence gaps are not
    /// counted against the measured speed.
    pub fn set_paused(&self, paused: bool) {
        self.shared.speed.set_paused(paused);
    }

    pub fn is_paused(&self) -> bool {
        self.shared.speed.is_paused()
    }

    /// Nominal speed multiplier; 0 means unthrottled.
    pub fn set_emulation_speed(&self, speed: f64) {
        self.shared.emulation_speed.store(speed, Ordering::Relaxed);
    }

    pub fn set_throttle_disabled(&self, disabled: bool) {
        self.shared.throttle_disabled.store(disabled, Ordering::Relaxed);
    }

    pub fn set_stretching(&self, enabled: bool) {
        self.shared.stretching.store(enabled, Ordering::Relaxed);
    }

    /// Negative disables dynamic speed adjustment, zero forces it on
    /// permanently, positive is the slice of fall-behind tolerated before
    /// adjusting.
    pub fn set_speed_tolerance_ms(&self, tolerance_ms: i32) {
        self.shared
            .speed_tolerance
            .store(f64::from(tolerance_ms) / 1000.0, Ordering::Relaxed);
    }

    pub fn set_max_latency_ms(&self, latency_ms: u32) {
        self.shared
            .max_latency
            .store(f64::from(latency_ms) / 1000.0, Ordering::Relaxed);
    }

    /// Most recent measured emulation speed relative to nominal.
    pub fn actual_speed(&self) -> f64 {
        self.shared.speed.average_speed(true, true, -1.0)
    }
}
