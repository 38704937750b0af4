// SPDX-License-Identifier: MPL-2.0
//! Video decode loop.
//!
//! Decodes, converts to packed RGBA and queues [`VideoPicture`]s for the
//! refresh loop. Frames that are already behind the master clock when they
//! leave the codec are dropped here (the "early" drop site), before paying
//! for colorspace conversion.

use super::decoder::{video_frame_pts, Decoder};
use super::demux::StreamBinding;
use super::frame_queue::QueuedFrame;
use super::frames::VideoPicture;
use super::session::Session;
use crate::config::{FrameDropPolicy, PtsReorderPolicy, Tuning};
use crate::error::{Error, Result};
use crate::logging::Logger;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling;
use ffmpeg_next::util::error::EAGAIN;
use ffmpeg_next::{frame, Rational};
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub struct VideoDecodeParams {
    pub binding: StreamBinding,
    pub decoder: ffmpeg_next::decoder::Video,
    pub frame_drop: FrameDropPolicy,
    pub pts_policy: PtsReorderPolicy,
}

/// Nominal duration of one frame from the stream's average frame rate, 0.0
/// when the container does not declare one.
#[must_use]
pub fn nominal_frame_duration(avg_frame_rate: Rational) -> f64 {
    if avg_frame_rate.numerator() > 0 && avg_frame_rate.denominator() > 0 {
        f64::from(avg_frame_rate.denominator()) / f64::from(avg_frame_rate.numerator())
    } else {
        0.0
    }
}

/// Early-drop decision for a freshly decoded frame. `diff` is frame pts minus
/// master clock; only slightly-late frames are dropped, and only while more
/// input is queued behind them.
#[must_use]
pub fn should_drop_early(
    diff: f64,
    policy: FrameDropPolicy,
    video_is_master: bool,
    queued_packets: usize,
    tuning: &Tuning,
) -> bool {
    policy.allows_drop(video_is_master)
        && !diff.is_nan()
        && diff.abs() < tuning.nosync_threshold
        && diff < 0.0
        && queued_packets > 0
}

/// Packed RGBA copy of a scaled frame, honoring the scaler's row padding.
fn extract_rgba(frame: &frame::Video) -> Vec<u8> {
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let stride = frame.stride(0);
    let data = frame.data(0);
    let row_bytes = width * 4;
    let mut rgba = Vec::with_capacity(row_bytes * height);
    for y in 0..height {
        let start = y * stride;
        rgba.extend_from_slice(&data[start..start + row_bytes]);
    }
    rgba
}

/// Lazily built RGBA scaler, rebuilt when the decoded geometry changes.
struct Scaler {
    context: Option<scaling::Context>,
    format: Pixel,
    width: u32,
    height: u32,
}

impl Scaler {
    fn new() -> Self {
        Self {
            context: None,
            format: Pixel::None,
            width: 0,
            height: 0,
        }
    }

    fn run(&mut self, decoded: &frame::Video) -> Result<frame::Video> {
        let (format, width, height) = (decoded.format(), decoded.width(), decoded.height());
        if self.context.is_none()
            || format != self.format
            || width != self.width
            || height != self.height
        {
            self.context = Some(
                scaling::Context::get(
                    format,
                    width,
                    height,
                    Pixel::RGBA,
                    width,
                    height,
                    scaling::Flags::BILINEAR,
                )
                .map_err(|e| Error::ResourceCreation(format!("scaler: {}", e)))?,
            );
            self.format = format;
            self.width = width;
            self.height = height;
        }
        let mut output = frame::Video::empty();
        self.context
            .as_mut()
            .expect("scaler built above")
            .run(decoded, &mut output)?;
        Ok(output)
    }
}

/// The video decode background loop. Exits on session abort.
pub fn run(session: &Arc<Session>, mut params: VideoDecodeParams, logger: Logger) {
    let mut dec = Decoder::new(params.binding.start_time, params.binding.time_base);
    let mut scaler = Scaler::new();
    let tb = params.binding.time_base;
    let tb_secs = f64::from(tb.numerator()) / f64::from(tb.denominator());
    let frame_duration = nominal_frame_duration(params.binding.avg_frame_rate);

    'outer: loop {
        let fetched = match dec.fetch(&session.videoq, session) {
            Ok(fetched) => fetched,
            Err(_) => break,
        };
        if fetched.serial_changed {
            params.decoder.flush();
        }

        let send_result = match &fetched.packet {
            Some(packet) => params.decoder.send_packet(packet),
            None => params.decoder.send_eof(),
        };
        match send_result {
            Ok(()) => {}
            Err(ffmpeg_next::Error::Other { errno }) if errno == EAGAIN => {
                if let Some(packet) = fetched.packet {
                    dec.push_pending(packet);
                }
            }
            Err(e) => {
                logger.warn(&format!("video decode: {}", e));
                continue;
            }
        }

        let mut frame = frame::Video::empty();
        loop {
            match params.decoder.receive_frame(&mut frame) {
                Ok(()) => {
                    let pts = video_frame_pts(&frame, params.pts_policy);
                    let dpts = pts.map_or(f64::NAN, |pts| pts as f64 * tb_secs);

                    let video_is_master =
                        session.master_kind() == crate::config::MasterSyncKind::Video;
                    let diff = dpts - session.master_clock();
                    if should_drop_early(
                        diff,
                        params.frame_drop,
                        video_is_master,
                        session.videoq.nb_packets(),
                        &session.tuning,
                    ) && fetched.serial == session.videoq.serial()
                    {
                        session.frame_drops_early.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }

                    let scaled = match scaler.run(&frame) {
                        Ok(scaled) => scaled,
                        Err(e) => {
                            logger.warn(&format!("video scale: {}", e));
                            continue;
                        }
                    };
                    let picture = VideoPicture {
                        rgba: extract_rgba(&scaled),
                        width: scaled.width(),
                        height: scaled.height(),
                        transform: session.current_transform(),
                    };
                    let queued = session.pictq.push(QueuedFrame {
                        payload: Arc::new(picture),
                        pts: dpts,
                        duration: frame_duration,
                        pos: -1,
                        serial: fetched.serial,
                    });
                    if queued.is_err() {
                        break 'outer;
                    }
                }
                Err(ffmpeg_next::Error::Eof) => {
                    params.decoder.flush();
                    dec.mark_finished();
                    session
                        .video_finished
                        .store(dec.finished_serial(), Ordering::Release);
                    break;
                }
                Err(_) => break,
            }
        }
    }

    logger.debug("video decoder exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::assert_abs_diff_eq;

    #[test]
    fn frame_duration_from_average_rate() {
        assert_abs_diff_eq!(nominal_frame_duration(Rational(25, 1)), 0.04);
        assert_abs_diff_eq!(
            nominal_frame_duration(Rational(30_000, 1001)),
            1001.0 / 30_000.0
        );
        assert_abs_diff_eq!(nominal_frame_duration(Rational(0, 1)), 0.0);
    }

    #[test]
    fn late_frames_drop_only_with_queued_backlog() {
        let t = Tuning::default();
        assert!(should_drop_early(-0.1, FrameDropPolicy::Auto, false, 5, &t));
        // Nothing queued behind: show it anyway.
        assert!(!should_drop_early(-0.1, FrameDropPolicy::Auto, false, 0, &t));
    }

    #[test]
    fn early_frames_and_unstamped_frames_are_kept() {
        let t = Tuning::default();
        assert!(!should_drop_early(0.1, FrameDropPolicy::Auto, false, 5, &t));
        assert!(!should_drop_early(
            f64::NAN,
            FrameDropPolicy::Auto,
            false,
            5,
            &t
        ));
    }

    #[test]
    fn drop_policy_gates_the_decision() {
        let t = Tuning::default();
        // Auto never drops when video is the master clock.
        assert!(!should_drop_early(-0.1, FrameDropPolicy::Auto, true, 5, &t));
        assert!(should_drop_early(-0.1, FrameDropPolicy::Always, true, 5, &t));
        assert!(!should_drop_early(-0.1, FrameDropPolicy::Never, false, 5, &t));
    }

    #[test]
    fn wildly_desynced_frames_are_not_dropped() {
        let t = Tuning::default();
        assert!(!should_drop_early(-60.0, FrameDropPolicy::Auto, false, 5, &t));
    }
}
