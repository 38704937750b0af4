// SPDX-License-Identifier: MPL-2.0
//! Container open and the demux reader loop.
//!
//! [`open_media`] opens the input, selects one stream per media type and
//! builds the opened decoders; [`run_reader`] is the background loop that
//! routes packets into the per-stream queues, executes pending seeks,
//! enforces backpressure and handles end-of-media (loop restart or drain).

use super::packet_queue::PacketQueue;
use super::session::{SeekRequest, Session};
use crate::config::{MediaOptions, PlayerConfig, SeekByBytes};
use crate::error::{Error, Result};
use crate::logging::Logger;
use crate::player::PlayerEvent;
use ffmpeg_next::format::context::Input;
use ffmpeg_next::format::stream::Disposition;
use ffmpeg_next::media::Type;
use ffmpeg_next::packet::Mut;
use ffmpeg_next::{ffi, format, Packet, Rational};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Facts about one selected stream, shared by the reader and its decode loop.
#[derive(Debug, Clone, Copy)]
pub struct StreamBinding {
    pub index: usize,
    pub time_base: Rational,
    /// Stream start in time-base units, if the container declares one.
    pub start_time: Option<i64>,
    pub avg_frame_rate: Rational,
    pub is_attached_pic: bool,
}

/// Everything produced by a successful open. The decode stages take the
/// decoder halves; the demux stage takes the input and bindings.
pub struct OpenedMedia {
    pub input: Input,
    pub url: String,
    pub audio: Option<(StreamBinding, ffmpeg_next::decoder::Audio)>,
    pub video: Option<(StreamBinding, ffmpeg_next::decoder::Video)>,
    pub subtitle: Option<(StreamBinding, ffmpeg_next::decoder::Subtitle)>,
    pub duration_ms: Option<i64>,
    pub realtime: bool,
    pub seek_by_bytes: bool,
    /// Above this, pts gaps are treated as timestamp discontinuities.
    pub max_frame_duration: f64,
}

/// The reader half of [`OpenedMedia`], moved into the demux thread.
pub struct ReaderSetup {
    pub input: Input,
    pub audio: Option<StreamBinding>,
    pub video: Option<StreamBinding>,
    pub subtitle: Option<StreamBinding>,
    pub seek_by_bytes: bool,
    pub start_time_ms: i64,
    pub play_duration_ms: Option<i64>,
}

/// True for transports where buffering ahead is impossible or unwanted.
#[must_use]
pub fn is_realtime(format_name: &str, url: &str) -> bool {
    matches!(format_name, "rtp" | "rtsp" | "sdp")
        || url.starts_with("rtp:")
        || url.starts_with("udp:")
}

/// Play-range filter: a packet is admitted when no play duration is set or
/// its timestamp falls within `play_duration` of the configured start.
#[must_use]
pub fn packet_in_play_range(
    pkt_ts: Option<i64>,
    stream_start: Option<i64>,
    time_base: Rational,
    start_time_ms: i64,
    play_duration_ms: Option<i64>,
) -> bool {
    let Some(play_duration_ms) = play_duration_ms else {
        return true;
    };
    let Some(ts) = pkt_ts else {
        // Untimed packets always pass.
        return true;
    };
    let tb = f64::from(time_base.numerator()) / f64::from(time_base.denominator());
    let relative = (ts - stream_start.unwrap_or(0)) as f64 * tb - start_time_ms as f64 / 1000.0;
    relative <= play_duration_ms as f64 / 1000.0
}

fn binding_for(stream: &format::stream::Stream) -> StreamBinding {
    let start_time = stream.start_time();
    StreamBinding {
        index: stream.index(),
        time_base: stream.time_base(),
        start_time: (start_time != ffi::AV_NOPTS_VALUE).then_some(start_time),
        avg_frame_rate: stream.avg_frame_rate(),
        is_attached_pic: stream.disposition().contains(Disposition::ATTACHED_PIC),
    }
}

fn select_stream<'a>(
    input: &'a Input,
    kind: Type,
    explicit: Option<usize>,
) -> Result<Option<format::stream::Stream<'a>>> {
    if let Some(index) = explicit {
        let stream = input.streams().nth(index).ok_or_else(|| {
            Error::InvalidParameter(format!("stream index {} does not exist", index))
        })?;
        if stream.parameters().medium() != kind {
            return Err(Error::InvalidParameter(format!(
                "stream {} is not a {:?} stream",
                index, kind
            )));
        }
        return Ok(Some(stream));
    }
    Ok(input.streams().best(kind))
}

/// Resolves a hardware device type name ("vaapi", "cuda", ...), `None` when
/// the backend does not know it.
fn hw_device_kind(name: &str) -> Option<ffi::AVHWDeviceType> {
    let c_name = std::ffi::CString::new(name).ok()?;
    let kind = unsafe { ffi::av_hwdevice_find_type_by_name(c_name.as_ptr()) };
    (kind != ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_NONE).then_some(kind)
}

/// Best-effort hardware decode setup. Failure at any step leaves the context
/// untouched so decoding stays in software.
fn attach_hw_device(context: &mut ffmpeg_next::codec::context::Context, name: &str, logger: &Logger) {
    let Some(kind) = hw_device_kind(name) else {
        logger.warn(&format!(
            "unknown hardware device type '{}', decoding in software",
            name
        ));
        return;
    };
    let mut device: *mut ffi::AVBufferRef = std::ptr::null_mut();
    let ret = unsafe {
        ffi::av_hwdevice_ctx_create(
            &mut device,
            kind,
            std::ptr::null(),
            std::ptr::null_mut(),
            0,
        )
    };
    if ret < 0 {
        logger.warn(&format!(
            "hardware device '{}' unavailable ({}), decoding in software",
            name, ret
        ));
        return;
    }
    // The codec context takes ownership of the device reference.
    unsafe {
        (*context.as_mut_ptr()).hw_device_ctx = device;
    }
}

fn decoder_for(
    stream: &format::stream::Stream,
    forced_codec: Option<&str>,
    hw_accel: Option<&str>,
    fast_decode: bool,
    logger: &Logger,
) -> Result<ffmpeg_next::codec::decoder::Opened> {
    let mut context = ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())
        .map_err(|e| Error::ResourceCreation(format!("codec context: {}", e)))?;
    if fast_decode {
        // Allow non-spec-compliant speedups; not exposed by the wrapper.
        unsafe {
            (*context.as_mut_ptr()).flags2 |= ffi::AV_CODEC_FLAG2_FAST as i32;
        }
    }
    if let Some(name) = hw_accel {
        attach_hw_device(&mut context, name, logger);
    }
    let codec = match forced_codec {
        Some(name) => ffmpeg_next::decoder::find_by_name(name)
            .ok_or_else(|| Error::ResourceCreation(format!("decoder '{}' not found", name)))?,
        None => ffmpeg_next::decoder::find(context.id())
            .ok_or_else(|| Error::ResourceCreation(format!("no decoder for {:?}", context.id())))?,
    };
    context
        .decoder()
        .open_as(codec)
        .map_err(|e| Error::ResourceCreation(format!("open decoder: {}", e)))
}

/// Opens the container, probes it, selects streams and opens decoders.
pub fn open_media(
    url: &str,
    config: &PlayerConfig,
    options: &MediaOptions,
    logger: &Logger,
) -> Result<OpenedMedia> {
    ffmpeg_next::init().map_err(|e| Error::ResourceCreation(format!("ffmpeg init: {}", e)))?;

    let mut input =
        format::input(&url).map_err(|e| Error::OpenFailure(format!("{}: {}", url, e)))?;

    if config.generate_missing_pts {
        // Not exposed by the wrapper; affects all subsequent reads.
        unsafe {
            (*input.as_mut_ptr()).flags |= ffi::AVFMT_FLAG_GENPTS as i32;
        }
    }

    let format_name = input.format().name().to_string();
    let ts_discont = unsafe {
        ((*(*input.as_ptr()).iformat).flags as u32) & (ffi::AVFMT_TS_DISCONT as u32) != 0
    };

    let seek_by_bytes = match config.seek_by_bytes {
        SeekByBytes::On => true,
        SeekByBytes::Off => false,
        SeekByBytes::Auto => ts_discont && format_name != "ogg",
    };
    let max_frame_duration = if ts_discont { 10.0 } else { 3600.0 };

    let duration = input.duration();
    let duration_ms = (duration > 0).then(|| duration / 1000);
    let realtime = is_realtime(&format_name, url);

    if config.find_stream_info {
        logger.debug(&format!(
            "{}: format '{}', {} streams, duration {:?} ms",
            url,
            format_name,
            input.streams().count(),
            duration_ms
        ));
    }

    let mut audio = None;
    if !config.disable_audio {
        if let Some(stream) = select_stream(&input, Type::Audio, options.audio_stream)? {
            let binding = binding_for(&stream);
            let decoder = decoder_for(
                &stream,
                options.forced_audio_codec.as_deref(),
                None,
                options.fast_decode,
                logger,
            )?
            .audio()
            .map_err(|e| Error::ResourceCreation(format!("audio decoder: {}", e)))?;
            audio = Some((binding, decoder));
        }
    }

    let mut video = None;
    if !config.disable_video {
        if let Some(stream) = select_stream(&input, Type::Video, options.video_stream)? {
            let binding = binding_for(&stream);
            let decoder = decoder_for(
                &stream,
                options.forced_video_codec.as_deref(),
                options.hw_accel.as_deref(),
                options.fast_decode,
                logger,
            )?
            .video()
            .map_err(|e| Error::ResourceCreation(format!("video decoder: {}", e)))?;
            video = Some((binding, decoder));
        }
    }

    let mut subtitle = None;
    if !config.disable_subtitles {
        if let Some(stream) = select_stream(&input, Type::Subtitle, options.subtitle_stream)? {
            let binding = binding_for(&stream);
            let decoder = decoder_for(
                &stream,
                options.forced_subtitle_codec.as_deref(),
                None,
                options.fast_decode,
                logger,
            )?
            .subtitle()
            .map_err(|e| Error::ResourceCreation(format!("subtitle decoder: {}", e)))?;
            subtitle = Some((binding, decoder));
        }
    }

    if audio.is_none() && video.is_none() {
        return Err(Error::OpenFailure(format!(
            "{}: no usable audio or video stream",
            url
        )));
    }

    logger.info(&format!(
        "opened {} (audio: {}, video: {}, subtitles: {})",
        url,
        audio.as_ref().map_or(-1, |(b, _)| b.index as i64),
        video.as_ref().map_or(-1, |(b, _)| b.index as i64),
        subtitle.as_ref().map_or(-1, |(b, _)| b.index as i64),
    ));

    Ok(OpenedMedia {
        input,
        url: url.to_string(),
        audio,
        video,
        subtitle,
        duration_ms,
        realtime,
        seek_by_bytes,
        max_frame_duration,
    })
}

/// Timestamp seek with an explicit window, or a byte seek for containers
/// without usable timestamps.
fn seek_input(input: &mut Input, min: i64, target: i64, max: i64, by_bytes: bool) -> Result<()> {
    let flags = if by_bytes { ffi::AVSEEK_FLAG_BYTE } else { 0 };
    let ret = unsafe { ffi::avformat_seek_file(input.as_mut_ptr(), -1, min, target, max, flags) };
    if ret < 0 {
        Err(Error::SeekFailure(format!(
            "avformat_seek_file returned {}",
            ret
        )))
    } else {
        Ok(())
    }
}

fn byte_position_for_ms(input: &Input, target_ms: i64, duration_ms: Option<i64>) -> Option<i64> {
    let duration_ms = duration_ms.filter(|d| *d > 0)?;
    let pb = unsafe { (*input.as_ptr()).pb };
    if pb.is_null() {
        return None;
    }
    let size = unsafe { ffi::avio_size(pb) };
    (size > 0).then(|| size * target_ms / duration_ms)
}

fn attached_picture(input: &Input, stream_index: usize) -> Option<Packet> {
    let stream = input.streams().nth(stream_index)?;
    let mut packet = Packet::empty();
    let ret = unsafe { ffi::av_packet_ref(packet.as_mut_ptr(), &(*stream.as_ptr()).attached_pic) };
    (ret >= 0).then_some(packet)
}

/// Queues a cover-art packet followed by the drain marker, so the decoder
/// produces its single frame without waiting for container end of file.
fn queue_attached(queue: &PacketQueue, packet: Packet) {
    let _ = queue.put(packet);
    let _ = queue.put_eof();
}

fn tb_secs(binding: Option<&StreamBinding>) -> f64 {
    binding.map_or(0.0, |b| {
        f64::from(b.time_base.numerator()) / f64::from(b.time_base.denominator())
    })
}

fn queue_for<'a>(
    session: &'a Session,
    setup: &ReaderSetup,
    stream_index: usize,
) -> Option<(&'a PacketQueue, StreamBinding)> {
    if let Some(b) = setup.audio.filter(|b| b.index == stream_index) {
        return Some((&session.audioq, b));
    }
    if let Some(b) = setup.video.filter(|b| b.index == stream_index) {
        return Some((&session.videoq, b));
    }
    if let Some(b) = setup.subtitle.filter(|b| b.index == stream_index) {
        return Some((&session.subtitleq, b));
    }
    None
}

/// The demux reader background loop. Runs until the session aborts or the
/// media drains without a loop restart.
pub fn run_reader(session: &Arc<Session>, mut setup: ReaderSetup, logger: Logger) {
    let wait = Duration::from_secs_f64(session.tuning.reader_wait_interval);
    let audio_tb = tb_secs(setup.audio.as_ref());
    let video_tb = tb_secs(setup.video.as_ref());
    let subtitle_tb = tb_secs(setup.subtitle.as_ref());
    let video_attached_pic = setup.video.is_some_and(|b| b.is_attached_pic);
    let mut queue_attachment = video_attached_pic;
    let mut eof_queued = false;

    loop {
        if session.is_aborted() {
            break;
        }

        // Propagate pause/resume to network protocols that care.
        let paused = session.is_paused();
        if paused != session.last_paused.load(Ordering::Relaxed) {
            session.last_paused.store(paused, Ordering::Relaxed);
            let result = if paused {
                setup.input.pause()
            } else {
                setup.input.play()
            };
            if let Err(e) = result {
                // Most file demuxers do not implement read_pause.
                logger.debug(&format!("read pause/resume: {}", e));
            }
        }

        if let Some(request) = session.take_seek() {
            let target_us = request.target_ms.saturating_mul(1000);
            let seek_result = if setup.seek_by_bytes {
                match byte_position_for_ms(&setup.input, request.target_ms, session.duration_ms()) {
                    Some(pos) => seek_input(&mut setup.input, i64::MIN, pos, i64::MAX, true),
                    None => seek_input(&mut setup.input, i64::MIN, target_us, i64::MAX, false),
                }
            } else if request.accurate {
                let window = (session.tuning.accurate_seek_window * 1_000_000.0) as i64;
                seek_input(
                    &mut setup.input,
                    target_us.saturating_sub(window),
                    target_us,
                    target_us,
                    false,
                )
            } else {
                seek_input(&mut setup.input, i64::MIN, target_us, i64::MAX, false)
            };

            match seek_result {
                Ok(()) => {
                    session.audioq.flush();
                    session.videoq.flush();
                    session.subtitleq.flush();
                    if setup.seek_by_bytes {
                        session.extclk.set(f64::NAN, 0);
                    } else {
                        session.extclk.set(target_us as f64 / 1_000_000.0, 0);
                    }
                    session.seek_count.fetch_add(1, Ordering::Release);
                    session.fire_event(PlayerEvent::Buffering);
                    session.set_eof(false);
                    eof_queued = false;
                    queue_attachment = video_attached_pic;
                    if session.is_paused() {
                        session.step_to_next_frame();
                    }
                }
                Err(e) => {
                    logger.warn(&format!("seek to {} ms failed: {}", request.target_ms, e));
                    session.fire_event(PlayerEvent::Error {
                        code: e.code(),
                        message: e.to_string(),
                    });
                }
            }
        }

        if queue_attachment {
            if let Some(binding) = setup.video.filter(|b| b.is_attached_pic) {
                if let Some(packet) = attached_picture(&setup.input, binding.index) {
                    queue_attached(&session.videoq, packet);
                }
            }
            queue_attachment = false;
        }

        if session.queues_full(audio_tb, video_tb, subtitle_tb, video_attached_pic) {
            session.reader_wait(wait);
            continue;
        }

        // End of media with everything drained: loop around or idle out.
        if !paused
            && session.is_eof()
            && session.all_decoders_finished()
            && session.sampq.nb_remaining() == 0
            && session.pictq.nb_remaining() == 0
        {
            if session.consume_loop() {
                let start_ms = session.start_time_ms.load(Ordering::Relaxed);
                session.request_seek(SeekRequest {
                    target_ms: start_ms,
                    accurate: false,
                });
                continue;
            } else if session.auto_exit.load(Ordering::Relaxed) {
                break;
            }
            session.reader_wait(wait);
            continue;
        }

        let item = setup.input.packets().next().map(|(s, p)| (s.index(), p));
        match item {
            Some((index, packet)) => {
                eof_queued = false;
                let Some((queue, binding)) = queue_for(session, &setup, index) else {
                    continue;
                };
                let in_range = packet_in_play_range(
                    packet.pts().or(packet.dts()),
                    binding.start_time,
                    binding.time_base,
                    setup.start_time_ms,
                    setup.play_duration_ms,
                );
                if in_range && !binding.is_attached_pic {
                    let _ = queue.put(packet);
                }
            }
            None => {
                // The packet iterator conflates end-of-file with read errors;
                // both mean "no more data right now".
                if !eof_queued {
                    let _ = session.audioq.put_eof();
                    let _ = session.videoq.put_eof();
                    let _ = session.subtitleq.put_eof();
                    session.set_eof(true);
                    eof_queued = true;
                }
                session.reader_wait(wait);
            }
        }
    }

    logger.debug("demux reader exiting");
}
