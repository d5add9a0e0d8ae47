//! Audio backends that feed a host device from a [`Mixer`].
//!
//! A backend owns the mixer's consumer half and drives it from its own
//! playback mechanism; the emulation keeps the cloneable [`MixerInput`]
//! handle. Two backends are provided: [`CpalStream`] for real output through
//! the host's audio stack, and [`NullStream`] which consumes audio at
//! wall-clock pace without a device, for headless runs and tests.
//!
//! [`Mixer`]: tidemix_core::Mixer
//! [`MixerInput`]: tidemix_core::MixerInput

mod cpal_stream;
mod null;

pub use cpal_stream::CpalStream;
pub use null::NullStream;

use thiserror::Error;
use tidemix_core::{Mixer, MixerConfig, MixerInput};
use tracing::warn;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("no audio output device available")]
    NoDevice,
    #[error("unsupported output configuration: {0}")]
    Unsupported(String),
    #[error(transparent)]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),
    #[error(transparent)]
    Build(#[from] cpal::BuildStreamError),
    #[error(transparent)]
    Play(#[from] cpal::PlayStreamError),
    #[error(transparent)]
    Pause(#[from] cpal::PauseStreamError),
}

/// A running audio backend. The mixer lives inside; the emulation talks to
/// it only through the producer handle.
///
/// Deliberately not `Send`: `cpal::Stream` is tied to the thread that built
/// it on some hosts. Producer handles are the part that travels.
pub trait SoundStream {
    /// Producer handle for pushing samples and changing settings.
    fn input(&self) -> MixerInput;

    /// Start or stop playback. A stopped stream consumes nothing; pair with
    /// [`MixerInput::set_paused`] if the emulation keeps pushing.
    fn set_running(&mut self, running: bool) -> Result<(), StreamError>;

    /// Whether this stream outputs decoded surround rather than stereo.
    fn surround_enabled(&self) -> bool {
        false
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Cpal,
    Null,
}

impl Backend {
    pub const ALL: [Backend; 2] = [Backend::Cpal, Backend::Null];

    pub fn name(self) -> &'static str {
        match self {
            Backend::Cpal => "cpal",
            Backend::Null => "null",
        }
    }

    /// Parse a settings-file backend name.
    pub fn from_name(name: &str) -> Option<Backend> {
        Self::ALL.into_iter().find(|b| b.name() == name)
    }
}

pub fn default_backend() -> Backend {
    Backend::Cpal
}

/// Names of every compiled-in backend, for settings UIs.
pub fn backend_names() -> Vec<&'static str> {
    Backend::ALL.iter().map(|b| b.name()).collect()
}

/// Build the requested backend, falling back to [`NullStream`] when the
/// host has no usable device. The mixer is constructed from `config` and
/// handed to the backend.
pub fn open_stream(
    backend: Backend,
    config: MixerConfig,
    surround: bool,
) -> Result<Box<dyn SoundStream>, StreamError> {
    match backend {
        Backend::Cpal => match CpalStream::new(Mixer::new(config.clone()), surround) {
            Ok(stream) => Ok(Box::new(stream)),
            Err(err @ StreamError::NoDevice) => {
                warn!(%err, "falling back to the null backend");
                Ok(Box::new(NullStream::new(Mixer::new(config))))
            }
            Err(err) => Err(err),
        },
        Backend::Null => Ok(Box::new(NullStream::new(Mixer::new(config)))),
    }
}
