//! Per-source ring buffer with an integrated fractional resampler.
//!
//! Each emulated source owns one fifo: a fixed-capacity power-of-two ring of
//! interleaved stereo samples plus the resampling cursor that drains it. The
//! ring is a true lock-free SPSC structure: the producer advances only
//! `index_w`, the audio thread advances only `index_r`, and both counters
//! grow monotonically and are masked on access. Sample cells are atomics so
//! no `unsafe` is needed; a torn frame is impossible and staleness is
//! tolerated by design (the consumer snapshots the write index once per
//! mix).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

use tracing::trace;

use crate::atomic::AtomicF64;

/// Ring capacity in stereo frames. Must be a power of two for the index
/// mask. High enough to hold several hundred milliseconds of backwards
/// samples to play through a stutter.
pub const MAX_SAMPLES: u32 = 16384;

/// Interleaved channels per frame.
pub(crate) const NC: u32 = 2;

const INDEX_MASK: u32 = MAX_SAMPLES * NC - 1;

/// Samples the resampler keeps unread as interpolation lookahead.
pub(crate) const INTERP_SAMPLES: u32 = 3;

/// Frames of silence injected when a source stops pushing, so the read
/// cursor never parks on an arbitrary non-zero sample.
const HALO_FRAMES: usize = (INTERP_SAMPLES + 1) as usize;

/// Catmull-Rom cubic coefficients, row per basis polynomial.
const COEFFS: [f32; 16] = [
    -0.5, 1.0, -0.5, 0.0, //
    1.5, -2.5, 0.0, 1.0, //
    -1.5, 2.0, 0.5, 0.0, //
    0.5, -0.5, 0.0, 0.0,
];

fn clamp_add(sample: i16, add: i32) -> i16 {
    (i32::from(sample) + add).clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
}

/// Read cursor one call ahead: where `index_r` will land once the pending
/// fractional phase is consumed at `rate`.
fn next_index_r(index_r: u32, rate: f64, fract: f64) -> u32 {
    if fract >= 0.0 {
        index_r.wrapping_add(NC * ((fract + rate) as u32))
    } else {
        index_r
    }
}

/// Unread sample count between the two counters, in ring samples.
/// The counters wrap the full u32 range; a masked difference of zero is
/// disambiguated into "empty" or "completely full".
fn samples_difference_at(index_w: u32, index_r: u32, rate: f64, fract: f64) -> u32 {
    let diff = index_w.wrapping_sub(next_index_r(index_r, rate, fract));
    let normalized = diff & INDEX_MASK;
    if normalized == 0 {
        if diff == 0 { 0 } else { MAX_SAMPLES * NC }
    } else {
        normalized
    }
}

/// State shared between the producer and the audio thread.
pub(crate) struct FifoShared {
    buffer: Box<[std::sync::atomic::AtomicI16]>,
    /// Samples written; next cell to write. Starts past a few frames of
    /// silence so playback blends in from zero.
    index_w: AtomicU32,
    /// Samples read minus one; the cell currently being interpolated.
    index_r: AtomicU32,
    /// Fractional read phase between two input samples; negative requests a
    /// reset. Written by the audio thread, read by the producer's free-space
    /// estimate.
    fract: AtomicF64,
    input_sample_rate: AtomicF64,
    // 0-256 internal gain
    volume_left: AtomicI32,
    volume_right: AtomicI32,
    currently_pushed: AtomicBool,
    last_push_timer: AtomicF64,
    /// Whether this source keeps pushing for the whole session (DMA,
    /// streaming) or only while its peripheral is making sound.
    pub(crate) constantly_pushed: bool,
    /// Whether pushed samples arrive in big-endian console memory order.
    big_endian: bool,
}

impl FifoShared {
    pub(crate) fn new(input_sample_rate: f64, big_endian: bool, constantly_pushed: bool) -> Self {
        let buffer = (0..(MAX_SAMPLES * NC) as usize)
            .map(|_| std::sync::atomic::AtomicI16::new(0))
            .collect();
        Self {
            buffer,
            index_w: AtomicU32::new((INTERP_SAMPLES + 1) * NC),
            index_r: AtomicU32::new(0),
            fract: AtomicF64::new(-1.0),
            input_sample_rate: AtomicF64::new(input_sample_rate),
            volume_left: AtomicI32::new(256),
            volume_right: AtomicI32::new(256),
            currently_pushed: AtomicBool::new(false),
            last_push_timer: AtomicF64::new(-1.0),
            constantly_pushed,
            big_endian,
        }
    }

    /// Producer entry point: copy interleaved frames into the ring.
    ///
    /// Never blocks and never overwrites unread data; if the push doesn't
    /// fit, the excess is dropped (it's cheaper to lose the new samples than
    /// the queued ones).
    pub(crate) fn push(&self, samples: &[i16], rate: f64) {
        if samples.is_empty() {
            return;
        }
        let index_w = self.index_w.load(Ordering::Acquire);
        let fifo_samples =
            self.samples_difference(index_w, self.index_r.load(Ordering::Acquire), rate);

        let mut num_frames = (samples.len() as u32) / NC;
        if num_frames * NC + fifo_samples > MAX_SAMPLES * NC {
            let accepted = MAX_SAMPLES - fifo_samples / NC;
            trace!(
                dropped = num_frames - accepted,
                "fifo full, truncating push"
            );
            num_frames = accepted;
        }

        for i in 0..(num_frames * NC) {
            self.buffer[(index_w.wrapping_add(i) & INDEX_MASK) as usize]
                .store(samples[i as usize], Ordering::Relaxed);
        }
        self.index_w.fetch_add(num_frames * NC, Ordering::Release);
    }

    pub(crate) fn samples_difference(&self, index_w: u32, index_r: u32, rate: f64) -> u32 {
        samples_difference_at(index_w, index_r, rate, self.fract.load(Ordering::Relaxed))
    }

    pub(crate) fn num_frames(&self, rate: f64) -> u32 {
        self.samples_difference(
            self.index_w.load(Ordering::Acquire),
            self.index_r.load(Ordering::Acquire),
            rate,
        ) / NC
    }

    /// Max frames (in output-rate terms) a mix call could currently
    /// produce. Approximate: the interpolation fract makes it off by at most
    /// one frame.
    pub(crate) fn available_frames(&self, rate: f64, out_sample_rate: u32) -> u32 {
        let frames = self.num_frames(rate);
        if frames <= INTERP_SAMPLES {
            return 0;
        }
        (f64::from(frames - INTERP_SAMPLES) * f64::from(out_sample_rate)
            / self.input_sample_rate()) as u32
    }

    pub(crate) fn input_sample_rate(&self) -> f64 {
        self.input_sample_rate.load(Ordering::Relaxed)
    }

    /// Queued samples nominally play at the old rate, but real hardware is
    /// effectively never mid-sound on a rate switch, so they are simply
    /// re-interpreted.
    pub(crate) fn set_input_sample_rate(&self, rate: f64) {
        self.input_sample_rate.store(rate, Ordering::Relaxed);
    }

    /// Expects 0-255 per channel.
    pub(crate) fn set_volume(&self, left: u32, right: u32) {
        self.volume_left
            .store((left + (left >> 7)) as i32, Ordering::Relaxed);
        self.volume_right
            .store((right + (right >> 7)) as i32, Ordering::Relaxed);
    }

    pub(crate) fn volumes(&self) -> (i32, i32) {
        (
            self.volume_left.load(Ordering::Relaxed),
            self.volume_right.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn set_volumes_raw(&self, left: i32, right: i32) {
        self.volume_left.store(left, Ordering::Relaxed);
        self.volume_right.store(right, Ordering::Relaxed);
    }

    pub(crate) fn currently_pushed(&self) -> bool {
        self.currently_pushed.load(Ordering::Relaxed)
    }

    /// Maintain the push-presence flag with hysteresis.
    ///
    /// Positive `time` credits the timer with that much pushed audio;
    /// negative `time` is elapsed absence. A single absence tick can't flip
    /// the flag, only a drained timer can, so jittery push cadence doesn't
    /// oscillate. On the started transition the fifo is pre-seeded with
    /// `preseed_latency` seconds of silence so the first real samples aren't
    /// immediately starved (skipped while stretching, where latency isn't
    /// time-bound); on the stopped transition a short halo of silence is
    /// pushed so draining ends on zero samples.
    pub(crate) fn update_push(&self, time: f64, preseed_latency: f64, rate: f64) {
        let mut timer = self.last_push_timer.load(Ordering::Relaxed);
        let currently_pushed;
        if time >= 0.0 {
            timer = timer.max(time);
            currently_pushed = timer > 0.0;
        } else if timer > 0.0 {
            timer += time;
            currently_pushed = true;
        } else {
            currently_pushed = false;
        }
        self.last_push_timer.store(timer, Ordering::Relaxed);

        if self.currently_pushed.load(Ordering::Relaxed) == currently_pushed {
            return;
        }
        self.currently_pushed
            .store(currently_pushed, Ordering::Relaxed);
        if currently_pushed {
            if preseed_latency > 0.0 {
                let frames =
                    ((preseed_latency * self.input_sample_rate()) as u32).min(MAX_SAMPLES);
                let silence = vec![0i16; (frames * NC) as usize];
                self.push(&silence, rate);
            }
        } else {
            let silence = [0i16; HALO_FRAMES * NC as usize];
            self.push(&silence, rate);
        }
    }

    #[cfg(test)]
    pub(crate) fn indices(&self) -> (u32, u32) {
        (
            self.index_w.load(Ordering::Acquire),
            self.index_r.load(Ordering::Acquire),
        )
    }

    #[cfg(test)]
    pub(crate) fn set_indices(&self, index_w: u32, index_r: u32) {
        self.index_w.store(index_w, Ordering::Release);
        self.index_r.store(index_r, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn fract(&self) -> f64 {
        self.fract.load(Ordering::Relaxed)
    }
}

/// Consumer half of a source fifo, owned by the mixer. Holds the resampling
/// state only the audio thread touches.
pub(crate) struct SourceFifo {
    pub(crate) shared: Arc<FifoShared>,
    /// Secondary cursor for backward playback during an underrun.
    backward_index_r: u32,
    backward_fract: f64,
    /// Last emitted (L, R) pair: interpolation seed and padding value. Kept
    /// as i32 because interpolation can overshoot the i16 range and the
    /// excess shouldn't be lost before accumulation.
    last_output: [i32; 2],
}

impl SourceFifo {
    pub(crate) fn new(shared: Arc<FifoShared>) -> Self {
        Self {
            shared,
            backward_index_r: 0,
            backward_fract: -1.0,
            last_output: [0; 2],
        }
    }

    /// Resample and additively mix up to `out.len() / 2` frames into `out`.
    ///
    /// Returns the number of genuinely new frames produced; the remainder of
    /// `out` is covered by backward playback (constantly pushed sources) or
    /// by repeating the last output frame, so the caller always gets a full
    /// block. In stretching mode the resampling ratio ignores the target
    /// speed (the stretcher owns tempo) and underruns are left to the
    /// stretcher's own padding.
    pub(crate) fn mix(
        &mut self,
        out: &mut [i16],
        stretching: bool,
        target_speed: f64,
        out_sample_rate: u32,
        scratch: &mut [i16],
    ) -> usize {
        let num_frames = (out.len() as u32) / NC;
        if num_frames == 0 {
            return 0;
        }

        // Snapshot both counters: the producer may keep advancing index_w
        // mid-call, the new data is simply picked up next time
        let mut index_r = self.shared.index_r.load(Ordering::Acquire);
        let index_w = self.shared.index_w.load(Ordering::Acquire);

        let in_rate = self.shared.input_sample_rate();
        let speed_factor = if stretching { 1.0 } else { target_speed };
        let rate = in_rate * speed_factor / f64::from(out_sample_rate);

        let (volume_l, volume_r) = self.shared.volumes();
        let mut fract = self.shared.fract.load(Ordering::Relaxed);
        let mut l_s = self.last_output[0];
        let mut r_s = self.last_output[1];

        let actual = cubic_interpolation(
            &self.shared,
            out,
            num_frames,
            rate,
            &mut index_r,
            index_w,
            &mut fract,
            &mut l_s,
            &mut r_s,
            volume_l,
            volume_r,
            true,
            scratch,
        );
        self.last_output = [l_s, r_s];

        if actual != num_frames {
            if actual > 0 {
                // Mirror the cursor over the interpolation reserve so the
                // first backward sample lands next to the last forward one
                self.backward_index_r = index_r.wrapping_add(INTERP_SAMPLES * NC);
                self.backward_fract = 1.0 - fract;
            }
            // Out of samples: park the read cursor at the interpolation
            // reserve below the write cursor and request a fract reset, so
            // reading resumes cleanly once the producer catches up
            index_r = index_w.wrapping_sub(INTERP_SAMPLES * NC);
            fract = -1.0;
        }

        let behind = num_frames - actual;
        if behind > 0 && self.shared.constantly_pushed && !stretching {
            // Play already-consumed samples backward rather than going
            // silent. No speed prediction here, an underrun is exactly the
            // situation where the estimate can't be trusted
            let back_rate = in_rate / f64::from(out_sample_rate);
            let mut back_index = self.backward_index_r;
            let mut back_fract = self.backward_fract;
            cubic_interpolation(
                &self.shared,
                &mut out[(actual * NC) as usize..],
                behind,
                back_rate,
                &mut back_index,
                index_w,
                &mut back_fract,
                &mut l_s,
                &mut r_s,
                volume_l,
                volume_r,
                false,
                scratch,
            );
            self.backward_index_r = back_index;
            self.backward_fract = back_fract;
        } else if behind > 0
            && (self.shared.constantly_pushed || self.shared.currently_pushed())
        {
            // Intermittent source that is (or should be) still audible: hold
            // the last frame instead of snapping to silence
            for frame in out[(actual * NC) as usize..].chunks_exact_mut(NC as usize) {
                frame[0] = clamp_add(frame[0], self.last_output[0]);
                frame[1] = clamp_add(frame[1], self.last_output[1]);
            }
        }

        self.shared.fract.store(fract, Ordering::Relaxed);
        self.shared.index_r.store(index_r, Ordering::Release);

        actual as usize
    }
}

/// Cubic 4-point resampling into `out`, additive with clamping.
///
/// Advances `index_r`/`fract` by `rate` per output frame and stops once
/// fewer than `INTERP_SAMPLES` lookahead samples remain (forward mode).
/// Backward mode reads the whole ring as history and never stops early.
/// Returns the frames written. `l_s`/`r_s` are updated to the last emitted
/// pair before volume-independent clamping.
#[allow(clippy::too_many_arguments)]
fn cubic_interpolation(
    shared: &FifoShared,
    out: &mut [i16],
    num_frames: u32,
    rate: f64,
    index_r: &mut u32,
    index_w: u32,
    fract: &mut f64,
    l_s: &mut i32,
    r_s: &mut i32,
    volume_l: i32,
    volume_r: i32,
    forwards: bool,
    scratch: &mut [i16],
) -> u32 {
    let mut available = samples_difference_at(index_w, *index_r, rate, *fract);
    let direction: i32 = if forwards { 1 } else { -1 };

    // Stage the samples this call can touch into the scratch ring, doing the
    // endianness fixup once instead of per interpolation tap
    let requested = ((rate * f64::from(num_frames)) as u32) * NC + NC; // +1 frame for fract drift
    let readable = if forwards { available } else { MAX_SAMPLES * NC };
    let samples_to_read = (requested + INTERP_SAMPLES * NC).min(readable);
    let first = next_index_r(*index_r, rate, *fract);
    let last = first.wrapping_add_signed(direction * samples_to_read as i32);
    let stop = last.wrapping_add_signed(direction * NC as i32);
    let mut k = first;
    while k != stop {
        for c in 0..NC {
            let idx = (k.wrapping_add(c) & INDEX_MASK) as usize;
            let sample = shared.buffer[idx].load(Ordering::Relaxed);
            scratch[idx] = if shared.big_endian {
                sample.swap_bytes()
            } else {
                sample
            };
        }
        k = k.wrapping_add_signed(direction * NC as i32);
    }

    // A reset phase starts the first output frame exactly on a whole sample
    if *fract < 0.0 && num_frames > 0 && (!forwards || available > INTERP_SAMPLES * NC) {
        *fract = -rate;
    }

    let mut produced = 0u32;
    let mut next_available = available;
    // Keep an interpolation reserve of INTERP_SAMPLES unread; the
    // `next_available <= available` check catches the wrap-under when the
    // cursor would overtake the write index at high rates
    while produced < num_frames
        && (!forwards || (next_available > INTERP_SAMPLES * NC && next_available <= available))
    {
        *fract += rate;
        let whole = *fract as u32;
        *fract -= f64::from(whole);
        // Advance before reading so a large rate can't push the read past
        // the write index between iterations
        *index_r = index_r.wrapping_add_signed(direction * (NC * whole) as i32);

        available = next_available;
        next_available = samples_difference_at(index_w, *index_r, rate, *fract);

        let x2 = *fract as f32;
        let x1 = x2 * x2;
        let x0 = x1 * x2;

        let y0 = COEFFS[0] * x0 + COEFFS[1] * x1 + COEFFS[2] * x2 + COEFFS[3];
        let y1 = COEFFS[4] * x0 + COEFFS[5] * x1 + COEFFS[6] * x2 + COEFFS[7];
        let y2 = COEFFS[8] * x0 + COEFFS[9] * x1 + COEFFS[10] * x2 + COEFFS[11];
        let y3 = COEFFS[12] * x0 + COEFFS[13] * x1 + COEFFS[14] * x2 + COEFFS[15];

        // Four taps around the cursor; the outer two are control points.
        // Input frames are right-major (even cells right, odd cells left)
        let p0 = *index_r;
        let p1 = index_r.wrapping_add_signed(2 * direction);
        let p2 = index_r.wrapping_add_signed(4 * direction);
        let p3 = index_r.wrapping_add_signed(6 * direction);
        let tap = |p: u32, off: u32| f32::from(scratch[(p.wrapping_add(off) & INDEX_MASK) as usize]);

        let l_f = y0 * tap(p0, 1) + y1 * tap(p1, 1) + y2 * tap(p2, 1) + y3 * tap(p3, 1);
        let r_f = y0 * tap(p0, 0) + y1 * tap(p1, 0) + y2 * tap(p2, 0) + y3 * tap(p3, 0);

        *l_s = ((l_f.round() as i32) * volume_l) >> 8;
        *r_s = ((r_f.round() as i32) * volume_r) >> 8;
        // Clamp after accumulating: an overshooting tap against an
        // opposite-signed buffer value cancels instead of being cut
        let slot = (produced * NC) as usize;
        out[slot] = clamp_add(out[slot], *l_s);
        out[slot + 1] = clamp_add(out[slot + 1], *r_s);

        produced += 1;
    }

    produced
}
