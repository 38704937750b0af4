// SPDX-License-Identifier: MPL-2.0
//! Audio output using cpal.
//!
//! The device stream lives on a dedicated thread (cpal streams must not cross
//! threads) that answers pause/resume/shutdown commands. The device callback
//! pulls resampled blocks from the sample queue without ever blocking: on
//! contention or underrun it writes silence and tries again next buffer.
//!
//! This is also where audio drives the clock engine. After each buffer the
//! audio clock is set to the pts of the last queued-for-hardware sample minus
//! the estimated device latency, and the external clock is dragged along.

use super::session::Session;
use super::sync::AudioDiffTracker;
use super::Serial;
use crate::config::MasterSyncKind;
use crate::error::{Error, Result};
use crate::logging::Logger;
use crate::volume::MIXER_MAX;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

enum AudioCommand {
    Pause,
    Resume,
    Shutdown,
}

/// Resizes one interleaved block to `wanted_frames`: truncates when fewer
/// are wanted, repeats the final frame when more are. The caller keeps the
/// adjustment inside a small band so neither is audible.
#[must_use]
pub fn compensate_block(samples: &[f32], channels: usize, wanted_frames: usize) -> Vec<f32> {
    let frames = samples.len() / channels;
    if wanted_frames == frames || frames == 0 {
        return samples.to_vec();
    }
    if wanted_frames < frames {
        return samples[..wanted_frames * channels].to_vec();
    }
    let mut out = Vec::with_capacity(wanted_frames * channels);
    out.extend_from_slice(samples);
    let last = &samples[(frames - 1) * channels..];
    for _ in frames..wanted_frames {
        out.extend_from_slice(last);
    }
    out
}

/// State owned by the device callback.
struct CallbackState {
    session: Arc<Session>,
    tracker: Option<AudioDiffTracker>,
    cursor: usize,
    pending_serial: Serial,
    /// Pts (seconds) of the end of `pending`, NaN when the block had none.
    end_pts: f64,
    adjusted: Vec<f32>,
    channels: usize,
    rate: u32,
    /// Estimated hardware buffer, learned from the first callback.
    hw_buffer_frames: usize,
}

impl CallbackState {
    fn new(session: Arc<Session>, rate: u32, channels: u16) -> Self {
        Self {
            session,
            tracker: None,
            cursor: 0,
            pending_serial: -1,
            end_pts: f64::NAN,
            adjusted: Vec::new(),
            channels: usize::from(channels),
            rate,
            hw_buffer_frames: 0,
        }
    }

    /// Pulls the next queued block, applying sample-count compensation when
    /// audio is not the master clock.
    fn refill(&mut self) {
        let Some(frame) = self.session.sampq.poll_readable() else {
            return;
        };
        self.session.sampq.next();

        let frames_in = frame.payload.nb_frames();
        let wanted = if self.session.master_kind() == MasterSyncKind::Audio {
            frames_in
        } else {
            let diff = self.session.audclk.get() - self.session.master_clock();
            self.tracker.as_mut().map_or(frames_in, |tracker| {
                tracker.wanted_samples(diff, frames_in, self.rate, &self.session.tuning)
            })
        };
        self.adjusted = compensate_block(&frame.payload.samples, self.channels, wanted);
        self.cursor = 0;
        self.pending_serial = frame.serial;
        self.end_pts = if frame.pts.is_nan() {
            f64::NAN
        } else {
            frame.pts + frame.duration
        };
    }

    fn next_sample(&mut self) -> f32 {
        if self.cursor >= self.adjusted.len() {
            self.refill();
        }
        if self.cursor < self.adjusted.len() {
            let value = self.adjusted[self.cursor];
            self.cursor += 1;
            value
        } else {
            0.0
        }
    }

    /// Audio clock update: the sample at `end_pts` will play after everything
    /// still buffered (unconsumed block remainder plus twice the hardware
    /// buffer) has drained.
    fn publish_clock(&self) {
        if self.end_pts.is_nan() {
            return;
        }
        let unconsumed = (self.adjusted.len() - self.cursor) / self.channels;
        let latency = (2 * self.hw_buffer_frames + unconsumed) as f64 / f64::from(self.rate);
        self.session.audclk.set_at(
            self.end_pts - latency,
            self.pending_serial,
            super::clock::now_secs(),
        );
        self.session
            .extclk
            .sync_to_slave(&self.session.audclk, self.session.tuning.nosync_threshold);
    }

    fn fill<T: cpal::SizedSample + cpal::FromSample<f32>>(&mut self, data: &mut [T]) {
        if self.hw_buffer_frames == 0 && !data.is_empty() {
            self.hw_buffer_frames = data.len() / self.channels;
            let threshold = self.hw_buffer_frames as f64 / f64::from(self.rate);
            self.tracker = Some(AudioDiffTracker::new(threshold, &self.session.tuning));
        }

        if self.session.is_paused() {
            for sample in data.iter_mut() {
                *sample = T::from_sample(0.0f32);
            }
            return;
        }

        let gain = if self.session.is_muted() {
            0.0
        } else {
            self.session.mixer_level() as f32 / MIXER_MAX as f32
        };
        for sample in data.iter_mut() {
            let value = (self.next_sample() * gain).clamp(-1.0, 0.999_999_9);
            *sample = T::from_sample(value);
        }
        self.publish_clock();
    }
}

fn build_stream<T: cpal::SizedSample + cpal::FromSample<f32>>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut state: CallbackState,
    logger: Logger,
) -> Result<cpal::Stream> {
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| state.fill(data),
            move |err| logger.warn(&format!("audio output: {}", err)),
            None,
        )
        .map_err(|e| Error::ResourceCreation(format!("audio stream: {}", e)))
}

fn audio_thread(
    session: Arc<Session>,
    command_rx: mpsc::Receiver<AudioCommand>,
    ready_tx: mpsc::Sender<Result<(u32, u16)>>,
    logger: Logger,
) {
    let open = || -> Result<(cpal::Stream, u32, u16)> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::ResourceCreation("no audio output device".to_string()))?;
        let supported = device
            .default_output_config()
            .map_err(|e| Error::ResourceCreation(format!("audio config: {}", e)))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        let state = CallbackState::new(Arc::clone(&session), sample_rate, channels);

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => {
                build_stream::<f32>(&device, &supported.into(), state, logger.clone())?
            }
            cpal::SampleFormat::I16 => {
                build_stream::<i16>(&device, &supported.into(), state, logger.clone())?
            }
            cpal::SampleFormat::U16 => {
                build_stream::<u16>(&device, &supported.into(), state, logger.clone())?
            }
            other => {
                return Err(Error::ResourceCreation(format!(
                    "unsupported audio sample format {:?}",
                    other
                )))
            }
        };
        stream
            .play()
            .map_err(|e| Error::ResourceCreation(format!("audio stream start: {}", e)))?;
        Ok((stream, sample_rate, channels))
    };

    let stream = match open() {
        Ok((stream, rate, channels)) => {
            let _ = ready_tx.send(Ok((rate, channels)));
            stream
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    // The stream stays alive as long as this thread holds it.
    while let Ok(command) = command_rx.recv() {
        match command {
            AudioCommand::Pause => {
                if let Err(e) = stream.pause() {
                    logger.warn(&format!("audio pause: {}", e));
                }
            }
            AudioCommand::Resume => {
                if let Err(e) = stream.play() {
                    logger.warn(&format!("audio resume: {}", e));
                }
            }
            AudioCommand::Shutdown => break,
        }
    }
    drop(stream);
    logger.debug("audio output exiting");
}

/// Handle to the audio device thread.
pub struct AudioOutput {
    command_tx: mpsc::Sender<AudioCommand>,
    handle: Option<JoinHandle<()>>,
    sample_rate: u32,
    channels: u16,
}

impl AudioOutput {
    /// Opens the default output device and starts the stream. Returns once
    /// the device is negotiated so callers can resample to
    /// [`AudioOutput::sample_rate`] and [`AudioOutput::channels`].
    pub fn new(session: Arc<Session>, logger: Logger) -> Result<Self> {
        let (command_tx, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("reelplay-audio-out".to_string())
            .spawn(move || audio_thread(session, command_rx, ready_tx, logger))
            .map_err(|e| Error::ResourceCreation(format!("audio thread: {}", e)))?;

        let (sample_rate, channels) = match ready_rx.recv() {
            Ok(Ok(negotiated)) => negotiated,
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(Error::ResourceCreation(
                    "audio thread exited during setup".to_string(),
                ));
            }
        };

        Ok(Self {
            command_tx,
            handle: Some(handle),
            sample_rate,
            channels,
        })
    }

    pub fn pause(&self) {
        let _ = self.command_tx.send(AudioCommand::Pause);
    }

    pub fn resume(&self) {
        let _ = self.command_tx.send(AudioCommand::Resume);
    }

    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub fn channels(&self) -> u16 {
        self.channels
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        let _ = self.command_tx.send(AudioCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlayerConfig;
    use crate::engine::frame_queue::QueuedFrame;
    use crate::engine::frames::AudioSamples;

    #[test]
    fn compensate_keeps_exact_blocks() {
        let samples = vec![0.1, 0.2, 0.3, 0.4];
        assert_eq!(compensate_block(&samples, 2, 2), samples);
    }

    #[test]
    fn compensate_truncates_when_fewer_wanted() {
        let samples = vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6];
        assert_eq!(compensate_block(&samples, 2, 2), vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn compensate_repeats_last_frame_when_more_wanted() {
        let samples = vec![0.1, 0.2, 0.3, 0.4];
        assert_eq!(
            compensate_block(&samples, 2, 4),
            vec![0.1, 0.2, 0.3, 0.4, 0.3, 0.4, 0.3, 0.4]
        );
    }

    #[test]
    fn callback_outputs_silence_on_underrun() {
        let session = Arc::new(Session::new(&PlayerConfig::default(), Logger::none()));
        let mut state = CallbackState::new(Arc::clone(&session), 48_000, 2);
        let mut data = vec![1.0f32; 64];
        state.fill(&mut data);
        assert!(data.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn callback_consumes_queued_samples_and_updates_clock() {
        let session = Arc::new(Session::new(&PlayerConfig::default(), Logger::none()));
        session
            .sampq
            .push(QueuedFrame {
                payload: Arc::new(AudioSamples {
                    samples: vec![0.5f32; 128],
                    rate: 48_000,
                    channels: 2,
                }),
                pts: 1.0,
                duration: 64.0 / 48_000.0,
                pos: -1,
                serial: 3,
            })
            .unwrap();

        let mut state = CallbackState::new(Arc::clone(&session), 48_000, 2);
        let mut data = vec![0.0f32; 64];
        state.fill(&mut data);
        assert!(data.iter().all(|s| (*s - 0.5).abs() < 1e-6));
        // The audio clock now carries the block's serial.
        assert_eq!(session.audclk.serial(), 3);
    }

    #[test]
    fn callback_applies_mute() {
        let session = Arc::new(Session::new(&PlayerConfig::default(), Logger::none()));
        session.set_muted(true);
        session
            .sampq
            .push(QueuedFrame {
                payload: Arc::new(AudioSamples {
                    samples: vec![0.5f32; 64],
                    rate: 48_000,
                    channels: 2,
                }),
                pts: 0.0,
                duration: 32.0 / 48_000.0,
                pos: -1,
                serial: 1,
            })
            .unwrap();

        let mut state = CallbackState::new(Arc::clone(&session), 48_000, 2);
        let mut data = vec![1.0f32; 64];
        state.fill(&mut data);
        assert!(data.iter().all(|s| *s == 0.0));
    }
}
