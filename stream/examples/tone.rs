//! Pushes a 440Hz tone through the mixer at emulated-hardware cadence and
//! plays it on the default output device.
//!
//! Run with `RUST_LOG=debug cargo run --example tone` to watch the mixer's
//! speed and latency decisions.

use std::f64::consts::TAU;
use std::time::Duration;

use tidemix_core::MixerConfig;
use tidemix_stream::{Backend, open_stream};
use tracing_subscriber::EnvFilter;

const DMA_RATE: f64 = 32_000.0;
const DMA_FRAMES: usize = 560;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut stream = open_stream(Backend::Cpal, MixerConfig::default(), false)?;
    stream.set_running(true)?;
    let input = stream.input();

    let mut phase = 0.0f64;
    let mut push = vec![0i16; DMA_FRAMES * 2];
    let push_interval = Duration::from_secs_f64(DMA_FRAMES as f64 / DMA_RATE);

    println!("playing a 440Hz tone for five seconds...");
    for _ in 0..(5.0 / push_interval.as_secs_f64()) as usize {
        for frame in push.chunks_exact_mut(2) {
            let sample = ((phase * TAU).sin() * 8192.0) as i16;
            // The DMA source expects big-endian samples
            frame[0] = sample.to_be();
            frame[1] = sample.to_be();
            phase = (phase + 440.0 / DMA_RATE).fract();
        }
        input.push_dma_samples(&push);
        std::thread::sleep(push_interval);
    }

    stream.set_running(false)?;
    Ok(())
}
