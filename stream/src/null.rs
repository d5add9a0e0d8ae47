//! Deviceless backend: consumes mixed audio at wall-clock pace and throws
//! it away. Keeps the mixer's latency behavior realistic in headless runs,
//! since an unconsumed mixer would otherwise report ever-growing latency.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tidemix_core::{Mixer, MixerInput};
use tracing::debug;

use crate::{SoundStream, StreamError};

/// Frames consumed per tick; small enough that pause reacts promptly.
const BLOCK_FRAMES: usize = 512;

pub struct NullStream {
    input: MixerInput,
    running: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl NullStream {
    pub fn new(mut mixer: Mixer) -> Self {
        let input = mixer.input();
        let running = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));

        let thread_running = running.clone();
        let thread_stop = stop.clone();
        let thread = std::thread::Builder::new()
            .name("tidemix-null".into())
            .spawn(move || {
                let mut block = vec![0i16; BLOCK_FRAMES * 2];
                while !thread_stop.load(Ordering::Relaxed) {
                    if thread_running.load(Ordering::Relaxed) {
                        mixer.mix(&mut block);
                    }
                    let tick = BLOCK_FRAMES as f64 / f64::from(mixer.sample_rate());
                    std::thread::sleep(Duration::from_secs_f64(tick));
                }
            })
            .ok();
        debug!("null audio stream started");

        Self {
            input,
            running,
            stop,
            thread,
        }
    }
}

impl SoundStream for NullStream {
    fn input(&self) -> MixerInput {
        self.input.clone()
    }

    fn set_running(&mut self, running: bool) -> Result<(), StreamError> {
        self.running.store(running, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for NullStream {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
