//! Pitch-preserving time stretching.
//!
//! The mixer only depends on the [`TimeStretcher`] contract: push raw mixed
//! frames at a tempo target, pull stretched frames out, and query the two
//! latencies that drive the mixer's latency budget. [`OlaStretcher`] is a
//! small overlap-add implementation of that contract; anything fancier (a
//! WSOLA or phase-vocoder engine) can be swapped in through
//! `Mixer::with_collaborators`.

use std::collections::VecDeque;

/// Contract between the mixer and a time stretching engine.
///
/// All sample slices are interleaved stereo; "frames" counts stereo pairs.
pub trait TimeStretcher: Send {
    fn set_sample_rate(&mut self, sample_rate: u32);

    /// Drop all buffered input and output and reset the tempo average.
    fn clear(&mut self);

    /// Set the tempo target for subsequently processed batches.
    ///
    /// Batches are produced at the tempo averaged over every `set_tempo`
    /// call since the previous batch, so speed oscillations between batch
    /// productions aren't lost. `reset` starts a fresh average.
    fn set_tempo(&mut self, tempo: f64, reset: bool);

    /// Feed raw mixed frames. Processing happens in batches; pushing may
    /// produce zero or more output frames internally.
    fn push_samples(&mut self, samples: &[i16]);

    /// Pull up to `out.len() / 2` stretched frames into `out`. Returns the
    /// number of genuinely produced frames; with `allow_padding` the
    /// remainder is filled by repeating the last stretched frame and the
    /// full request is returned.
    fn stretched_samples(&mut self, out: &mut [i16], allow_padding: bool) -> usize;

    /// Seconds of processed output waiting to be pulled.
    fn processed_latency(&self) -> f64;

    /// Smallest batch the engine produces, in seconds. Output latency can
    /// never be held below this since a whole batch lands at once.
    fn acceptable_latency(&self) -> f64;
}

/// Window length of one synthesis batch, in milliseconds.
const SEQUENCE_MS: u32 = 62;
/// Crossfade overlap between consecutive windows, in milliseconds.
const OVERLAP_MS: u32 = 12;

/// Overlap-add time stretcher.
///
/// Emits fixed-length synthesis windows while advancing the analysis cursor
/// by `tempo * window` input frames, crossfading each window head against
/// the tail of the previous one. No seek-window correlation search: plain
/// OLA is enough to keep the mixer contract honest and artifacts acceptable
/// at the small speed deviations the mixer produces.
pub struct OlaStretcher {
    sample_rate: u32,
    input: VecDeque<i16>,
    output: VecDeque<i16>,
    /// Tail of the previous synthesis window, crossfade source.
    tail: Vec<i16>,
    have_tail: bool,
    last_frame: [i16; 2],
    tempo: f64,
    tempo_sum: f64,
    tempo_count: u32,
}

impl OlaStretcher {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            input: VecDeque::new(),
            output: VecDeque::new(),
            tail: Vec::new(),
            have_tail: false,
            last_frame: [0; 2],
            tempo: 1.0,
            tempo_sum: 0.0,
            tempo_count: 0,
        }
    }

    fn sequence_frames(&self) -> usize {
        (self.sample_rate as usize * SEQUENCE_MS as usize) / 1000
    }

    fn overlap_frames(&self) -> usize {
        (self.sample_rate as usize * OVERLAP_MS as usize) / 1000
    }

    /// Process as many whole batches as the buffered input allows.
    /// Returns true if at least one batch was produced.
    fn process_batches(&mut self) -> bool {
        let seq = self.sequence_frames();
        let overlap = self.overlap_frames();
        let window = seq + overlap;
        let mut produced = false;

        loop {
            let hop = ((seq as f64) * self.tempo).round().max(1.0) as usize;
            let needed = window.max(hop);
            if self.input.len() < needed * 2 {
                break;
            }

            for i in 0..seq {
                let mut l = i32::from(self.input[i * 2]);
                let mut r = i32::from(self.input[i * 2 + 1]);
                if self.have_tail && i < overlap {
                    // Linear crossfade out of the previous window's tail
                    let fade_in = i as i32;
                    let fade_out = (overlap - i) as i32;
                    let tl = i32::from(self.tail[i * 2]);
                    let tr = i32::from(self.tail[i * 2 + 1]);
                    l = (l * fade_in + tl * fade_out) / overlap as i32;
                    r = (r * fade_in + tr * fade_out) / overlap as i32;
                }
                self.output.push_back(l as i16);
                self.output.push_back(r as i16);
            }

            self.tail.clear();
            for i in seq..window {
                self.tail.push(self.input[i * 2]);
                self.tail.push(self.input[i * 2 + 1]);
            }
            self.have_tail = true;

            self.input.drain(..hop.min(self.input.len() / 2) * 2);
            produced = true;
        }
        produced
    }
}

impl TimeStretcher for OlaStretcher {
    fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate;
        self.have_tail = false;
        self.tail.clear();
    }

    fn clear(&mut self) {
        self.input.clear();
        self.output.clear();
        self.tail.clear();
        self.have_tail = false;
        self.last_frame = [0; 2];
        self.tempo = 1.0;
        self.tempo_sum = 0.0;
        self.tempo_count = 0;
    }

    fn set_tempo(&mut self, tempo: f64, reset: bool) {
        if reset {
            self.tempo_sum = 0.0;
            self.tempo_count = 0;
        }
        self.tempo_sum += tempo;
        self.tempo_count += 1;
        self.tempo = self.tempo_sum / f64::from(self.tempo_count);
    }

    fn push_samples(&mut self, samples: &[i16]) {
        self.input.extend(samples.iter().copied());
        if self.process_batches() {
            // A batch consumed the tempos averaged so far, start fresh
            self.tempo_sum = 0.0;
            self.tempo_count = 0;
        }
    }

    fn stretched_samples(&mut self, out: &mut [i16], allow_padding: bool) -> usize {
        let requested = out.len() / 2;
        let available = (self.output.len() / 2).min(requested);
        for sample in out.iter_mut().take(available * 2) {
            *sample = self.output.pop_front().unwrap_or(0);
        }
        if available > 0 {
            self.last_frame = [out[available * 2 - 2], out[available * 2 - 1]];
        }

        if !allow_padding {
            return available;
        }
        for i in available..requested {
            out[i * 2] = self.last_frame[0];
            out[i * 2 + 1] = self.last_frame[1];
        }
        requested
    }

    fn processed_latency(&self) -> f64 {
        (self.output.len() / 2) as f64 / f64::from(self.sample_rate)
    }

    fn acceptable_latency(&self) -> f64 {
        self.sequence_frames() as f64 / f64::from(self.sample_rate)
    }
}
