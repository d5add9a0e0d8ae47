//! Real audio output through cpal.
//!
//! The mixer moves into the device callback and is pulled at the soundcard's
//! pace, which is the whole point of the design: the callback never waits on
//! the emulation, it just mixes whatever has been pushed. Control stays on
//! the outside through the producer handle.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tidemix_core::{Mixer, MixerInput, SURROUND_CHANNELS};
use tracing::{debug, error};

use crate::{SoundStream, StreamError};

pub struct CpalStream {
    input: MixerInput,
    stream: cpal::Stream,
    surround: bool,
    sample_rate: u32,
}

impl CpalStream {
    /// Open the default output device and start pulling from `mixer`.
    ///
    /// With `surround` set the device must offer at least six channels at
    /// f32; otherwise the stream is stereo in whichever of f32/i16/u16 the
    /// device prefers, mirroring the mixer's native i16 output.
    pub fn new(mut mixer: Mixer, surround: bool) -> Result<Self, StreamError> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(StreamError::NoDevice)?;
        let config = device.default_output_config()?;
        let sample_rate = config.sample_rate().0;
        let channels = config.channels() as usize;

        if surround
            && (channels != SURROUND_CHANNELS
                || config.sample_format() != cpal::SampleFormat::F32)
        {
            return Err(StreamError::Unsupported(format!(
                "surround needs {SURROUND_CHANNELS} f32 channels, device offers {channels} {:?}",
                config.sample_format()
            )));
        }
        if !surround && channels != 2 {
            return Err(StreamError::Unsupported(format!(
                "expected a stereo device, got {channels} channels"
            )));
        }

        mixer.update_settings(sample_rate);
        let input = mixer.input();

        let err_fn = |err| error!("audio stream error: {err}");
        let stream = if surround {
            let stream_config = config.into();
            device.build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    mixer.mix_surround(data);
                },
                err_fn,
                None,
            )?
        } else {
            match config.sample_format() {
                cpal::SampleFormat::I16 => {
                    let stream_config = config.into();
                    device.build_output_stream(
                        &stream_config,
                        move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                            if mixer.mix(data) == 0 {
                                data.fill(0);
                            }
                        },
                        err_fn,
                        None,
                    )?
                }
                cpal::SampleFormat::U16 => {
                    let stream_config = config.into();
                    let mut block: Vec<i16> = Vec::new();
                    device.build_output_stream(
                        &stream_config,
                        move |data: &mut [u16], _: &cpal::OutputCallbackInfo| {
                            block.clear();
                            block.resize(data.len(), 0);
                            mixer.mix(&mut block);
                            for (out, &s) in data.iter_mut().zip(&block) {
                                *out = (i32::from(s) + 32_768) as u16;
                            }
                        },
                        err_fn,
                        None,
                    )?
                }
                cpal::SampleFormat::F32 => {
                    let stream_config = config.into();
                    let mut block: Vec<i16> = Vec::new();
                    device.build_output_stream(
                        &stream_config,
                        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                            block.clear();
                            block.resize(data.len(), 0);
                            mixer.mix(&mut block);
                            for (out, &s) in data.iter_mut().zip(&block) {
                                *out = f32::from(s) / 32_768.0;
                            }
                        },
                        err_fn,
                        None,
                    )?
                }
                other => {
                    return Err(StreamError::Unsupported(format!(
                        "sample format {other:?}"
                    )));
                }
            }
        };

        stream.play()?;
        debug!(sample_rate, channels, surround, "cpal audio stream started");

        Ok(Self {
            input,
            stream,
            surround,
            sample_rate,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl SoundStream for CpalStream {
    fn input(&self) -> MixerInput {
        self.input.clone()
    }

    fn set_running(&mut self, running: bool) -> Result<(), StreamError> {
        if running {
            self.stream.play()?;
        } else {
            self.stream.pause()?;
        }
        Ok(())
    }

    fn surround_enabled(&self) -> bool {
        self.surround
    }
}
