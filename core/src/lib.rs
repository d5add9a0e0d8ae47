//! Real-time audio mixing engine for emulated consoles.
//!
//! The emulation thread pushes audio from several hardware sources (a DMA
//! interface, a disc streaming unit, and up to four controller speakers) at
//! whatever pace the emulated machine actually runs; the host audio thread
//! pulls fixed-size stereo blocks at the soundcard's pace. [`Mixer`] sits
//! between the two:
//!
//! - one lock-free ring fifo per source, with an integrated cubic resampler
//! - a speed estimate derived from the DMA push cadence, so resampling
//!   tracks the emulation's real speed instead of its nominal one
//! - underrun cover (backward playback or last-sample padding) so a stutter
//!   never turns into a hard discontinuity
//! - optional pitch-preserving time stretching and passive-matrix 5.1
//!   surround decoding
//!
//! The producer side is the cloneable [`MixerInput`] handle; every method on
//! it is `&self`, non-blocking and real-time safe. The consumer side is the
//! owned [`Mixer`], driven from exactly one audio callback.
//!
//! ```no_run
//! use tidemix_core::{Mixer, MixerConfig};
//!
//! let mut mixer = Mixer::new(MixerConfig::default());
//! let input = mixer.input(); // clone freely, hand to the emulation thread
//!
//! // emulation thread, once per DMA transfer:
//! input.push_dma_samples(&[0i16; 560 * 2]);
//!
//! // audio callback:
//! let mut block = [0i16; 512 * 2];
//! mixer.mix(&mut block);
//! ```

mod atomic;
mod config;
mod mixer;
mod speed;
mod state;
mod stretch;
mod surround;
mod time;

pub use config::{MixerConfig, SurroundQuality};
pub use mixer::{MAX_SAMPLES, Mixer, MixerInput, NUM_SPEAKERS};
pub use speed::SpeedCounter;
pub use state::{FifoState, MixerState};
pub use stretch::{OlaStretcher, TimeStretcher};
pub use surround::{MatrixDecoder, SURROUND_CHANNELS, SurroundDecoder};
pub use time::{Clock, MonotonicClock};
