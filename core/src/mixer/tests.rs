use std::sync::Arc;

use super::fifo::{FifoShared, MAX_SAMPLES, NC, SourceFifo};
use super::*;
use crate::config::MixerConfig;
use crate::stretch::OlaStretcher;
use crate::surround::MatrixDecoder;
use crate::time::ManualClock;

const DMA_PUSH: usize = 560;

fn test_mixer(config: MixerConfig) -> (Mixer, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let stretcher = Box::new(OlaStretcher::new(config.sample_rate));
    let decoder = Box::new(MatrixDecoder::new(
        config.sample_rate,
        config.surround_quality,
        config.surround_bass_redirection,
    ));
    let mixer = Mixer::with_clock(config, stretcher, decoder, clock.clone() as Arc<dyn Clock>);
    (mixer, clock)
}

/// DMA pushes are big-endian on the wire.
fn be_frames(frames: usize, value: i16) -> Vec<i16> {
    vec![value.swap_bytes(); frames * 2]
}

fn scratch() -> Vec<i16> {
    vec![0; (MAX_SAMPLES * NC) as usize]
}

#[test]
fn constant_dma_input_comes_out_unchanged() {
    let (mut mixer, _clock) = test_mixer(MixerConfig::default());
    let input = mixer.input();
    for _ in 0..4 {
        input.push_dma_samples(&be_frames(DMA_PUSH, 1000));
    }

    let mut out = vec![0i16; 100 * 2];
    assert_eq!(mixer.mix(&mut out), 100);

    // The first few frames blend out of the initial silence; after that a
    // constant input must reproduce exactly (cubic weights sum to one and
    // full volume is a unity gain)
    for &s in &out[20 * 2..] {
        assert_eq!(s, 1000);
    }
}

#[test]
fn forced_dynamic_speed_follows_push_cadence() {
    let config = MixerConfig {
        speed_tolerance_ms: 0,
        ..MixerConfig::default()
    };
    let (mut mixer, clock) = test_mixer(config);
    let input = mixer.input();

    // Half-speed cadence: full-size pushes at twice the nominal interval,
    // long enough to displace the simulated full-speed startup window
    for _ in 0..16 {
        clock.advance_micros(35_000);
        input.push_dma_samples(&be_frames(DMA_PUSH, 500));
    }

    let mut out = vec![0i16; 100 * 2];
    mixer.mix(&mut out);
    let speed = mixer.current_speed();
    assert!((0.45..=0.55).contains(&speed), "speed {speed}");
    assert!((input.actual_speed() - 0.5).abs() < 0.05);
}

#[test]
fn unthrottled_mixer_follows_measured_speed() {
    let config = MixerConfig {
        emulation_speed: 0.0,
        ..MixerConfig::default()
    };
    let (mut mixer, clock) = test_mixer(config);
    let input = mixer.input();

    for _ in 0..4 {
        clock.advance_micros(8_750); // double speed cadence
        input.push_dma_samples(&be_frames(DMA_PUSH, 500));
    }

    let mut out = vec![0i16; 100 * 2];
    mixer.mix(&mut out);
    let speed = mixer.current_speed();
    assert!((1.8..=2.2).contains(&speed), "speed {speed}");
}

#[test]
fn excess_latency_engages_catch_up() {
    let (mut mixer, clock) = test_mixer(MixerConfig::default());
    let input = mixer.input();

    // Full-speed cadence but well over 75ms queued
    for _ in 0..12 {
        clock.advance_micros(17_500);
        input.push_dma_samples(&be_frames(DMA_PUSH, 100));
    }

    let mut out = vec![0i16; 100 * 2];
    mixer.mix(&mut out);
    let speed = mixer.current_speed();
    assert!(speed > 1.01, "speed {speed} should be catching up");
}

#[test]
fn paused_mixer_produces_nothing() {
    let (mut mixer, _clock) = test_mixer(MixerConfig::default());
    let input = mixer.input();
    input.push_dma_samples(&be_frames(DMA_PUSH, 1000));

    input.set_paused(true);
    let indices_before = mixer.shared().dma.indices();
    let fract_before = mixer.shared().dma.fract();
    let mut out = vec![7i16; 64 * 2];
    assert_eq!(mixer.mix(&mut out), 0);
    // Untouched, not zeroed: the backend decides what silence is
    assert!(out.iter().all(|&s| s == 7));
    // And the read cursor didn't move either
    assert_eq!(mixer.shared().dma.indices(), indices_before);
    assert_eq!(mixer.shared().dma.fract(), fract_before);

    input.set_paused(false);
    assert_eq!(mixer.mix(&mut out), 64);
}

#[test]
fn underrun_plays_constant_sources_backward() {
    let shared = Arc::new(FifoShared::new(32_000.0, false, true));
    let mut fifo = SourceFifo::new(shared.clone());
    let mut interp = scratch();

    // Ascending ramp on both channels
    let mut samples = Vec::new();
    for i in 0..100i16 {
        samples.push(i * 10);
        samples.push(i * 10);
    }
    shared.push(&samples, 1.0);

    let mut out = vec![0i16; 150 * 2];
    let actual = fifo.mix(&mut out, false, 1.0, 32_000, &mut interp);
    assert!((95..=105).contains(&actual), "actual {actual}");

    // The remainder runs back down the ramp instead of going silent
    let early = out[(actual + 2) * 2];
    let late = out[(actual + 20) * 2];
    assert!(early > late, "backward section not descending: {early} vs {late}");
    assert!(out[(actual + 1) * 2] > 0);

    // Exhaustion parked the cursor just under the write index
    let (index_w, index_r) = shared.indices();
    assert_eq!(index_w.wrapping_sub(index_r), super::fifo::INTERP_SAMPLES * NC);
    assert_eq!(shared.fract(), -1.0);
}

#[test]
fn underrun_pads_intermittent_sources_with_last_sample() {
    let shared = Arc::new(FifoShared::new(6_000.0, false, false));
    let mut fifo = SourceFifo::new(shared.clone());
    let mut interp = scratch();

    shared.update_push(0.5, 0.0, 1.0);
    assert!(shared.currently_pushed());
    shared.push(&vec![4000i16; 50 * 2], 1.0);

    let mut out = vec![0i16; 80 * 2];
    let actual = fifo.mix(&mut out, false, 1.0, 6_000, &mut interp);
    assert!(actual < 80);

    let pad = &out[(actual + 1) * 2..];
    let first = pad[0];
    assert_ne!(first, 0);
    assert!(pad.iter().all(|&s| s == first), "padding should hold one value");
}

#[test]
fn push_truncates_instead_of_overwriting() {
    let shared = Arc::new(FifoShared::new(32_000.0, false, true));
    let samples = vec![1i16; (MAX_SAMPLES as usize + 100) * 2];
    shared.push(&samples, 1.0);
    assert_eq!(shared.num_frames(1.0), MAX_SAMPLES);

    // A second push has no room at all
    shared.push(&[2i16; 32], 1.0);
    assert_eq!(shared.num_frames(1.0), MAX_SAMPLES);
}

#[test]
fn counters_survive_u32_wraparound() {
    let shared = Arc::new(FifoShared::new(32_000.0, false, true));
    let base = u32::MAX - 7;
    shared.set_indices(base, base);
    let mut fifo = SourceFifo::new(shared.clone());
    let mut interp = scratch();

    shared.push(&vec![3000i16; 50 * 2], 1.0);
    let mut out = vec![0i16; 20 * 2];
    let actual = fifo.mix(&mut out, false, 1.0, 32_000, &mut interp);
    assert_eq!(actual, 20);

    let (index_w, _) = shared.indices();
    assert!(index_w < base, "write index should have wrapped");
}

#[test]
fn big_endian_sources_are_byte_swapped() {
    let shared = Arc::new(FifoShared::new(32_000.0, true, true));
    let mut fifo = SourceFifo::new(shared.clone());
    let mut interp = scratch();

    shared.push(&vec![2000i16.swap_bytes(); 64 * 2], 1.0);
    let mut out = vec![0i16; 40 * 2];
    fifo.mix(&mut out, false, 1.0, 32_000, &mut interp);
    assert_eq!(out[30 * 2], 2000);
}

#[test]
fn volume_scales_each_channel_independently() {
    let shared = Arc::new(FifoShared::new(32_000.0, false, true));
    shared.set_volume(128, 255);
    let mut fifo = SourceFifo::new(shared.clone());
    let mut interp = scratch();

    shared.push(&vec![1000i16; 64 * 2], 1.0);
    let mut out = vec![0i16; 40 * 2];
    fifo.mix(&mut out, false, 1.0, 32_000, &mut interp);

    // 128 maps to gain 129/256, 255 to a full 256/256
    assert_eq!(i32::from(out[30 * 2]), (1000 * 129) >> 8);
    assert_eq!(out[30 * 2 + 1], 1000);
}

#[test]
fn sources_accumulate_additively_with_clamping() {
    let (mut mixer, _clock) = test_mixer(MixerConfig::default());
    let input = mixer.input();
    input.push_dma_samples(&be_frames(DMA_PUSH * 4, i16::MAX));
    input.push_streaming_samples(&be_frames(DMA_PUSH * 8, i16::MAX));

    let mut out = vec![0i16; 100 * 2];
    mixer.mix(&mut out);
    // Two saturated sources clamp to the rail instead of wrapping
    assert_eq!(out[50 * 2], i16::MAX);
}

#[test]
fn speaker_pushes_are_duplicated_to_stereo() {
    let (mixer, _clock) = test_mixer(MixerConfig::default());
    let input = mixer.input();

    input.push_speaker_samples(0, &[5000i16; 100], 6_000);
    let speaker = &mixer.shared().speakers[0];
    assert!(speaker.currently_pushed());
    // 100 pushed frames plus the preseeded startup latency
    let rate = 1.0;
    assert!(speaker.num_frames(rate) >= 100);

    // Out-of-range index is ignored, not a panic
    input.push_speaker_samples(9, &[1i16; 4], 6_000);
}

#[test]
fn streaming_cadence_expires_idle_speakers() {
    let (mixer, _clock) = test_mixer(MixerConfig::default());
    let input = mixer.input();

    // 0.1s of speaker audio, then 0.2s of streaming with no speaker pushes
    input.push_speaker_samples(0, &[1000i16; 600], 6_000);
    assert!(mixer.shared().speakers[0].currently_pushed());
    input.push_streaming_samples(&be_frames(4_800, 0));
    input.push_streaming_samples(&be_frames(4_800, 0));
    assert!(!mixer.shared().speakers[0].currently_pushed());
}

#[test]
fn stretching_path_produces_blended_output() {
    let config = MixerConfig {
        stretching: true,
        ..MixerConfig::default()
    };
    let (mut mixer, _clock) = test_mixer(config);
    let input = mixer.input();

    input.push_dma_samples(&be_frames(8_000, 1000));
    input.push_streaming_samples(&be_frames(12_000, 2000));

    let mut out = vec![0i16; 512 * 2];
    assert_eq!(mixer.mix(&mut out), 512);
    // Enough input was queued for whole stretch batches: the tail carries
    // the summed sources, not padding silence
    let tail = out[out.len() - 2];
    assert!(
        (i32::from(tail) - 3000).abs() <= 15,
        "tail {tail} should be near 3000"
    );
}

#[test]
fn disabling_stretching_drains_the_backlog() {
    let config = MixerConfig {
        stretching: true,
        ..MixerConfig::default()
    };
    let (mut mixer, _clock) = test_mixer(config);
    let input = mixer.input();

    input.push_dma_samples(&be_frames(8_000, 1000));
    input.push_streaming_samples(&be_frames(12_000, 1000));
    let mut out = vec![0i16; 256 * 2];
    mixer.mix(&mut out);

    // Switch to direct mixing; the stretcher's queued output plays first
    input.set_stretching(false);
    assert_eq!(mixer.mix(&mut out), 256);
    assert!(out.iter().any(|&s| s != 0), "backlog was dropped");
}

#[test]
fn surround_mixes_whole_blocks() {
    let (mut mixer, _clock) = test_mixer(MixerConfig::default());
    let input = mixer.input();
    for _ in 0..4 {
        input.push_dma_samples(&be_frames(DMA_PUSH, 8_192));
    }

    let mut out = vec![0.0f32; 256 * SURROUND_CHANNELS];
    assert_eq!(mixer.mix_surround(&mut out), 256);

    // Front channels carry the stereo signal near +-0.25 full scale
    let fl = out[200 * SURROUND_CHANNELS];
    let fr = out[200 * SURROUND_CHANNELS + 1];
    assert!((fl - 0.25).abs() < 0.02, "FL {fl}");
    assert!((fr - 0.25).abs() < 0.02, "FR {fr}");
    // Identical channels: nothing in the rears
    assert!(out[200 * SURROUND_CHANNELS + 4].abs() < 0.01);

    // The first call buffered a whole block; this one needs no new input
    assert_eq!(mixer.mix_surround(&mut out), 256);
}

#[test]
fn surround_outputs_silence_while_paused() {
    let (mut mixer, _clock) = test_mixer(MixerConfig::default());
    let input = mixer.input();
    input.set_paused(true);

    let mut out = vec![1.0f32; 64 * SURROUND_CHANNELS];
    assert_eq!(mixer.mix_surround(&mut out), 0);
    assert!(out.iter().all(|&s| s == 0.0));
}

#[test]
fn state_round_trips_through_serde() {
    let (mut mixer, _clock) = test_mixer(MixerConfig::default());
    let input = mixer.input();
    input.set_dma_input_sample_rate(48_000.0);
    input.set_streaming_volume(128, 64);
    input.set_speaker_volume(2, 200, 200);

    let state = mixer.save_state();
    assert_eq!(state.dma.input_sample_rate, 48_000.0);
    assert_eq!(state.streaming.volume_left, 128 + 1);
    assert_eq!(state.streaming.volume_right, 64);

    let json = serde_json::to_string(&state).unwrap();
    let restored: crate::state::MixerState = serde_json::from_str(&json).unwrap();
    assert_eq!(state, restored);

    let (mut other, _clock) = test_mixer(MixerConfig::default());
    other.load_state(&restored);
    assert_eq!(other.save_state(), state);
}

#[test]
fn resampler_consumes_input_in_proportion_to_rate() {
    let shared = Arc::new(FifoShared::new(32_000.0, false, true));
    let mut fifo = SourceFifo::new(shared.clone());
    let mut interp = scratch();
    shared.push(&vec![100i16; 12_000 * 2], 1.0);

    let (_, read_before) = shared.indices();
    let mut out = vec![0i16; 1_000 * 2];
    for _ in 0..3 {
        out.fill(0);
        assert_eq!(fifo.mix(&mut out, false, 1.0, 48_000, &mut interp), 1_000);
    }
    let (_, read_after) = shared.indices();

    // 3000 output frames at 32kHz->48kHz consume 2000 input frames; the
    // fractional cursor may hold back at most a frame or two
    let consumed = (read_after.wrapping_sub(read_before) / NC) as i64;
    assert!((consumed - 2_000).abs() <= 3, "consumed {consumed}");
    let fract = shared.fract();
    assert!((0.0..1.0).contains(&fract), "fract {fract}");
}

#[test]
fn padding_stays_steady_with_no_new_data() {
    let shared = Arc::new(FifoShared::new(6_000.0, false, false));
    let mut fifo = SourceFifo::new(shared.clone());
    let mut interp = scratch();

    shared.update_push(0.5, 0.0, 1.0);
    shared.push(&vec![4000i16; 50 * 2], 1.0);

    let mut out = vec![0i16; 80 * 2];
    fifo.mix(&mut out, false, 1.0, 6_000, &mut interp);
    let held = out[out.len() - 2];
    assert_ne!(held, 0);

    // No further pushes: every subsequent block repeats the held frame
    // exactly, with no fresh transients
    for _ in 0..3 {
        let mut next = vec![0i16; 80 * 2];
        assert_eq!(fifo.mix(&mut next, false, 1.0, 6_000, &mut interp), 0);
        assert!(next.iter().all(|&s| s == held));
    }
}

#[test]
fn scratch_buffers_are_preallocated() {
    let (mixer, _clock) = test_mixer(MixerConfig::default());
    assert!(mixer.scratch.capacity() >= (MAX_SAMPLES * NC) as usize);
    assert!(mixer.surround_scratch.capacity() >= (MAX_SAMPLES * NC) as usize);
}

/// Stand-in stretching engine that emits a recognizable constant.
struct FlatStretcher {
    sample_rate: u32,
    queued: usize,
}

impl TimeStretcher for FlatStretcher {
    fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate;
    }

    fn clear(&mut self) {
        self.queued = 0;
    }

    fn set_tempo(&mut self, _tempo: f64, _reset: bool) {}

    fn push_samples(&mut self, samples: &[i16]) {
        self.queued += samples.len() / 2;
    }

    fn stretched_samples(&mut self, out: &mut [i16], _allow_padding: bool) -> usize {
        out.fill(123);
        let frames = out.len() / 2;
        self.queued = self.queued.saturating_sub(frames);
        frames
    }

    fn processed_latency(&self) -> f64 {
        self.queued as f64 / f64::from(self.sample_rate)
    }

    fn acceptable_latency(&self) -> f64 {
        0.0
    }
}

#[test]
fn custom_engines_inject_through_with_collaborators() {
    let config = MixerConfig {
        stretching: true,
        ..MixerConfig::default()
    };
    let decoder = Box::new(MatrixDecoder::new(
        config.sample_rate,
        config.surround_quality,
        config.surround_bass_redirection,
    ));
    let mut mixer = Mixer::with_collaborators(
        config,
        Box::new(FlatStretcher {
            sample_rate: 0,
            queued: 0,
        }),
        decoder,
    );

    let mut out = vec![0i16; 64 * 2];
    assert_eq!(mixer.mix(&mut out), 64);
    assert!(out.iter().all(|&s| s == 123), "replacement engine not used");
}

#[test]
fn update_settings_applies_a_new_sample_rate() {
    let (mut mixer, _clock) = test_mixer(MixerConfig::default());
    mixer.set_surround_quality(crate::config::SurroundQuality::Lowest);
    mixer.update_settings(32_000);
    assert_eq!(mixer.sample_rate(), 32_000);

    // Still mixes after the rate change
    let input = mixer.input();
    input.push_dma_samples(&be_frames(DMA_PUSH, 500));
    let mut out = vec![0i16; 64 * 2];
    assert_eq!(mixer.mix(&mut out), 64);
}
