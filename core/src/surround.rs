//! Multichannel surround decoding.
//!
//! As with stretching, the mixer depends only on the [`SurroundDecoder`]
//! contract: a block-based decoder that reports how many stereo frames it
//! needs to produce a given number of decoded frames. [`MatrixDecoder`] is
//! a passive-matrix 5.1 implementation of that contract.

use std::collections::VecDeque;

use crate::config::SurroundQuality;

/// Output channels per decoded frame: FL, FR, C, LFE, BL, BR.
pub const SURROUND_CHANNELS: usize = 6;

/// Contract between the mixer and a surround decoding engine.
///
/// Stereo input slices are interleaved pairs; decoded output slices are
/// interleaved [`SURROUND_CHANNELS`]-sample frames.
pub trait SurroundDecoder: Send {
    /// (Re)initialize for `sample_rate`. Must be cheap when the rate is
    /// unchanged; buffered decoded samples survive.
    fn init_and_set_sample_rate(&mut self, sample_rate: u32);

    /// Apply a quality or bass-redirection change. Takes effect
    /// immediately; pair with [`clear`](Self::clear) to drop samples
    /// decoded under the old settings.
    fn configure(&mut self, quality: SurroundQuality, bass_redirection: bool);

    fn clear(&mut self);

    /// Stereo frames that must be pushed before `output_frames` decoded
    /// frames can be pulled. Always a whole number of analysis blocks;
    /// zero when enough decoded samples are already buffered.
    fn samples_needed_for_output(&self, output_frames: usize) -> usize;

    /// Push stereo frames. The count must be a multiple of the analysis
    /// block size, which `samples_needed_for_output` guarantees.
    fn push_samples(&mut self, samples: &[i16]);

    /// Pull `out.len() / SURROUND_CHANNELS` decoded frames.
    fn decoded_samples(&mut self, out: &mut [f32]);
}

/// Round to the nearest power of two (ties go up).
fn nearest_power_of_two(value: u32) -> u32 {
    let up = value.next_power_of_two();
    let down = up >> 1;
    if down > 0 && value - down < up - value { down } else { up }
}

/// Passive-matrix 5.1 decoder.
///
/// Front channels pass through, center and rears are derived from the
/// sum/difference signals. There is no phase-shift network, so rear
/// separation is crude compared to a proper DPL2 decoder, but the blocking
/// and latency behavior match one: input is consumed in fixed power-of-two
/// blocks sized from the quality setting.
pub struct MatrixDecoder {
    sample_rate: u32,
    block_frames: usize,
    quality: SurroundQuality,
    bass_redirection: bool,
    decoded: VecDeque<f32>,
}

impl MatrixDecoder {
    pub fn new(sample_rate: u32, quality: SurroundQuality, bass_redirection: bool) -> Self {
        let mut decoder = Self {
            sample_rate: 0,
            block_frames: 0,
            quality,
            bass_redirection,
            decoded: VecDeque::new(),
        };
        decoder.init_and_set_sample_rate(sample_rate);
        decoder
    }

    pub fn block_frames(&self) -> usize {
        self.block_frames
    }

    fn recompute_block(&mut self) {
        let frames = (f64::from(self.sample_rate) * f64::from(self.quality.block_time_ms())
            / 1000.0)
            .round();
        self.block_frames = nearest_power_of_two((frames as u32).max(2)) as usize;
    }
}

impl SurroundDecoder for MatrixDecoder {
    fn init_and_set_sample_rate(&mut self, sample_rate: u32) {
        if self.sample_rate == sample_rate {
            return;
        }
        self.sample_rate = sample_rate;
        self.recompute_block();
    }

    fn configure(&mut self, quality: SurroundQuality, bass_redirection: bool) {
        self.quality = quality;
        self.bass_redirection = bass_redirection;
        self.recompute_block();
    }

    fn clear(&mut self) {
        self.decoded.clear();
    }

    fn samples_needed_for_output(&self, output_frames: usize) -> usize {
        let buffered = self.decoded.len() / SURROUND_CHANNELS;
        if output_frames <= buffered {
            return 0;
        }
        let needed = output_frames - buffered;
        // Round up to whole blocks
        needed + self.block_frames - (needed % self.block_frames)
    }

    fn push_samples(&mut self, samples: &[i16]) {
        debug_assert_eq!((samples.len() / 2) % self.block_frames, 0);
        const SCALE: f32 = 1.0 / i16::MAX as f32;
        for frame in samples.chunks_exact(2) {
            let l = f32::from(frame[0]) * SCALE;
            let r = f32::from(frame[1]) * SCALE;
            let center = (l + r) * 0.5;
            let rear = (l - r) * 0.5;
            self.decoded.push_back(l); // FL
            self.decoded.push_back(r); // FR
            self.decoded.push_back(center); // C
            self.decoded
                .push_back(if self.bass_redirection { center } else { 0.0 }); // LFE
            self.decoded.push_back(rear); // BL
            self.decoded.push_back(-rear); // BR
        }
    }

    fn decoded_samples(&mut self, out: &mut [f32]) {
        for sample in out.iter_mut() {
            *sample = self.decoded.pop_front().unwrap_or(0.0);
        }
    }
}
