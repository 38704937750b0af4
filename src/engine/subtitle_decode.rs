// SPDX-License-Identifier: MPL-2.0
//! Subtitle decode loop.
//!
//! Subtitles decode synchronously (one packet in, at most one cue out), so
//! this loop is simpler than the audio/video ones: no drain phase, no resend
//! protocol. Bitmap subtitles are skipped; text and ASS cues become
//! [`SubtitleEntry`] values with absolute display windows in seconds.

use super::decoder::Decoder;
use super::demux::StreamBinding;
use super::frame_queue::QueuedFrame;
use super::frames::SubtitleEntry;
use super::session::Session;
use crate::logging::Logger;
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub struct SubtitleDecodeParams {
    pub binding: StreamBinding,
    pub decoder: ffmpeg_next::decoder::Subtitle,
}

/// Extracts the dialogue text from an ASS event line.
///
/// Event lines carry eight metadata fields before the text; the text itself
/// may contain commas, so only the first eight are split off. `\N` soft
/// breaks become real newlines and override blocks are stripped.
#[must_use]
pub fn ass_dialogue_text(line: &str) -> String {
    let text = line.splitn(9, ',').nth(8).unwrap_or(line);
    let mut out = String::with_capacity(text.len());
    let mut in_override = false;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' => in_override = true,
            '}' => in_override = false,
            '\\' if !in_override && matches!(chars.peek(), Some('N' | 'n')) => {
                chars.next();
                out.push('\n');
            }
            _ if !in_override => out.push(c),
            _ => {}
        }
    }
    out.trim().to_string()
}

fn entry_from(
    subtitle: &ffmpeg_next::Subtitle,
    packet_pts: Option<i64>,
    tb_secs: f64,
) -> Option<SubtitleEntry> {
    let mut lines = Vec::new();
    for rect in subtitle.rects() {
        match rect {
            ffmpeg_next::subtitle::Rect::Text(text) => {
                let text = text.get().trim();
                if !text.is_empty() {
                    lines.push(text.to_string());
                }
            }
            ffmpeg_next::subtitle::Rect::Ass(ass) => {
                let text = ass_dialogue_text(ass.get());
                if !text.is_empty() {
                    lines.push(text);
                }
            }
            // Bitmap subtitles would need compositing; out of reach for a
            // packed-RGBA text pipeline.
            _ => {}
        }
    }
    if lines.is_empty() {
        return None;
    }
    let base = packet_pts.map_or(0.0, |pts| pts as f64 * tb_secs);
    Some(SubtitleEntry {
        lines,
        start: base + f64::from(subtitle.start()) / 1000.0,
        end: base + f64::from(subtitle.end()) / 1000.0,
    })
}

/// The subtitle decode background loop. Exits on session abort.
pub fn run(session: &Arc<Session>, mut params: SubtitleDecodeParams, logger: Logger) {
    let mut dec = Decoder::new(params.binding.start_time, params.binding.time_base);
    let tb = params.binding.time_base;
    let tb_secs = f64::from(tb.numerator()) / f64::from(tb.denominator());

    loop {
        let fetched = match dec.fetch(&session.subtitleq, session) {
            Ok(fetched) => fetched,
            Err(_) => break,
        };
        if fetched.serial_changed {
            params.decoder.flush();
        }

        let Some(packet) = fetched.packet else {
            dec.mark_finished();
            session
                .subtitle_finished
                .store(dec.finished_serial(), Ordering::Release);
            continue;
        };

        // decode() wraps avcodec_decode_subtitle2, which consumes the whole
        // packet in one call; the partial-send resend round trip the audio
        // and video loops need does not apply here.
        let mut subtitle = ffmpeg_next::Subtitle::new();
        match params.decoder.decode(&packet, &mut subtitle) {
            Ok(true) => {
                if let Some(entry) = entry_from(&subtitle, packet.pts(), tb_secs) {
                    let queued = session.subq.push(QueuedFrame {
                        pts: entry.start,
                        duration: entry.end - entry.start,
                        payload: Arc::new(entry),
                        pos: -1,
                        serial: fetched.serial,
                    });
                    if queued.is_err() {
                        break;
                    }
                }
            }
            Ok(false) => {}
            Err(e) => logger.warn(&format!("subtitle decode: {}", e)),
        }
    }

    logger.debug("subtitle decoder exiting");
}
