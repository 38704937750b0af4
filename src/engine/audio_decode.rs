// SPDX-License-Identifier: MPL-2.0
//! Audio decode loop.
//!
//! Pulls packets from the audio queue, decodes, resamples to the output
//! device's packed f32 format and queues [`AudioSamples`] blocks for the
//! audio callback. Resampling happens here rather than in the callback so no
//! codec or resampler state ever leaves this thread.
//!
//! Frames that arrive without a pts continue gaplessly from the end of the
//! previous block, which keeps the audio clock monotonic across codecs that
//! only stamp the first frame of a packet.

use super::decoder::Decoder;
use super::demux::StreamBinding;
use super::frame_queue::QueuedFrame;
use super::frames::AudioSamples;
use super::session::Session;
use crate::error::{Error, Result};
use crate::logging::Logger;
use ffmpeg_next::software::resampling;
use ffmpeg_next::util::error::EAGAIN;
use ffmpeg_next::util::format::sample::{Sample, Type as SampleType};
use ffmpeg_next::{frame, ChannelLayout, Rational, Rescale};
use std::sync::Arc;

pub struct AudioDecodeParams {
    pub binding: StreamBinding,
    pub decoder: ffmpeg_next::decoder::Audio,
    /// Output device sample rate; everything is resampled to it.
    pub device_rate: u32,
    pub device_channels: u16,
}

/// Rescales a frame pts into `1/rate` units, falling back to the gapless
/// continuation point when the frame is unstamped.
#[must_use]
pub fn audio_frame_pts(
    frame_pts: Option<i64>,
    stream_tb: Rational,
    rate: i32,
    gapless: (Option<i64>, Rational),
) -> Option<i64> {
    let out_tb = Rational(1, rate);
    match frame_pts {
        Some(pts) => Some(pts.rescale(stream_tb, out_tb)),
        None => {
            let (pts, tb) = gapless;
            pts.map(|pts| pts.rescale(tb, out_tb))
        }
    }
}

/// Lazily built resampler, rebuilt whenever the decoded frame geometry
/// changes mid-stream.
struct Resampler {
    context: Option<resampling::Context>,
    in_format: Sample,
    in_layout: ChannelLayout,
    in_rate: u32,
    out_layout: ChannelLayout,
    out_rate: u32,
}

impl Resampler {
    fn new(device_rate: u32, device_channels: u16) -> Self {
        Self {
            context: None,
            in_format: Sample::None,
            in_layout: ChannelLayout::empty(),
            in_rate: 0,
            out_layout: ChannelLayout::default(i32::from(device_channels)),
            out_rate: device_rate,
        }
    }

    fn run(&mut self, decoded: &frame::Audio) -> Result<frame::Audio> {
        let format = decoded.format();
        let layout = decoded.channel_layout();
        let rate = decoded.rate();
        if self.context.is_none()
            || format != self.in_format
            || layout != self.in_layout
            || rate != self.in_rate
        {
            self.context = Some(
                resampling::Context::get(
                    format,
                    layout,
                    rate,
                    Sample::F32(SampleType::Packed),
                    self.out_layout,
                    self.out_rate,
                )
                .map_err(|e| Error::ResourceCreation(format!("resampler: {}", e)))?,
            );
            self.in_format = format;
            self.in_layout = layout;
            self.in_rate = rate;
        }
        let mut output = frame::Audio::empty();
        self.context
            .as_mut()
            .expect("resampler built above")
            .run(decoded, &mut output)?;
        Ok(output)
    }
}

fn queue_frame(
    session: &Session,
    params: &AudioDecodeParams,
    resampler: &mut Resampler,
    decoded: &frame::Audio,
    pts: Option<i64>,
    serial: super::Serial,
) -> Result<()> {
    let resampled = resampler.run(decoded)?;
    let nb = resampled.samples();
    if nb == 0 {
        return Ok(());
    }
    let channels = usize::from(params.device_channels);
    let bytes = &resampled.data(0)[..nb * channels * std::mem::size_of::<f32>()];
    let samples: Vec<f32> = bytemuck::cast_slice(bytes).to_vec();

    let rate = f64::from(decoded.rate());
    let pts_secs = pts.map_or(f64::NAN, |pts| pts as f64 / rate);
    let duration = decoded.samples() as f64 / rate;
    session.sampq.push(QueuedFrame {
        payload: Arc::new(AudioSamples {
            samples,
            rate: params.device_rate,
            channels: params.device_channels,
        }),
        pts: pts_secs,
        duration,
        pos: -1,
        serial,
    })
}

/// The audio decode background loop. Exits on session abort.
pub fn run(session: &Arc<Session>, mut params: AudioDecodeParams, logger: Logger) {
    let mut dec = Decoder::new(params.binding.start_time, params.binding.time_base);
    let mut resampler = Resampler::new(params.device_rate, params.device_channels);
    let stream_tb = params.binding.time_base;

    'outer: loop {
        let fetched = match dec.fetch(&session.audioq, session) {
            Ok(fetched) => fetched,
            Err(_) => break,
        };
        if fetched.serial_changed {
            params.decoder.flush();
            resampler.context = None;
        }

        let draining = fetched.packet.is_none();
        let send_result = match &fetched.packet {
            Some(packet) => params.decoder.send_packet(packet),
            None => params.decoder.send_eof(),
        };
        match send_result {
            Ok(()) => {}
            Err(ffmpeg_next::Error::Other { errno }) if errno == EAGAIN => {
                // Codec wants draining first; resend after that.
                if let Some(packet) = fetched.packet {
                    dec.push_pending(packet);
                }
            }
            Err(e) => {
                logger.warn(&format!("audio decode: {}", e));
                continue;
            }
        }

        let mut frame = frame::Audio::empty();
        loop {
            match params.decoder.receive_frame(&mut frame) {
                Ok(()) => {
                    let rate = frame.rate() as i32;
                    let pts = audio_frame_pts(frame.pts(), stream_tb, rate, dec.next_pts());
                    if let Some(pts) = pts {
                        dec.set_next_pts(pts + frame.samples() as i64, Rational(1, rate));
                    }
                    match queue_frame(session, &params, &mut resampler, &frame, pts, fetched.serial)
                    {
                        Ok(()) => {}
                        Err(Error::Aborted) => break 'outer,
                        Err(e) => logger.warn(&format!("audio resample: {}", e)),
                    }
                }
                Err(ffmpeg_next::Error::Eof) => {
                    params.decoder.flush();
                    dec.mark_finished();
                    session
                        .audio_finished
                        .store(dec.finished_serial(), std::sync::atomic::Ordering::Release);
                    break;
                }
                Err(_) => break,
            }
        }

        if draining && session.is_aborted() {
            break;
        }
    }

    logger.debug("audio decoder exiting");
}
