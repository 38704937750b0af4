// SPDX-License-Identifier: MPL-2.0
//! Video refresh loop.
//!
//! Paces frame presentation against the master clock: each iteration decides
//! whether the queued frame is due, still early (sleep the difference) or
//! already stale (drop it, the "late" drop site). The loop also owns the
//! subtitle display window, the position callback and end-of-media
//! completion, so it runs even for audio-only media.

use super::clock::now_secs;
use super::frames::{SubtitleEntry, VideoPicture};
use super::session::Session;
use super::sync::{compute_target_delay, external_clock_speed, frame_display_duration};
use crate::config::{FrameDropPolicy, MasterSyncKind};
use crate::logging::Logger;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Render target for decoded video. Implementations receive packed RGBA
/// pictures on the refresh thread and draw them however they like.
pub trait VideoOutput: Send + Sync {
    fn display(&self, picture: &VideoPicture);
    fn show_subtitle(&self, _entry: &SubtitleEntry) {}
    fn clear_subtitle(&self) {}
}

/// What to do with the subtitle cue at the head of the queue, given the
/// current video position.
#[derive(Debug, PartialEq, Eq)]
pub enum SubtitleAction {
    /// Stale generation or past its end: discard (and clear if showing).
    Drop,
    /// Inside its display window: show it.
    Show,
    /// Not due yet: leave it queued.
    Keep,
}

#[must_use]
pub fn subtitle_action(
    cue_serial: super::Serial,
    queue_serial: super::Serial,
    start: f64,
    end: f64,
    video_pts: f64,
) -> SubtitleAction {
    if cue_serial != queue_serial || (video_pts.is_finite() && video_pts > end) {
        SubtitleAction::Drop
    } else if video_pts.is_finite() && video_pts >= start {
        SubtitleAction::Show
    } else {
        SubtitleAction::Keep
    }
}

/// Monotonic position reporting with a reset whenever a seek lands. Without
/// the clamp the master clock can briefly read backwards right after a frame
/// queue flush.
pub struct PositionReporter {
    last_reported: i64,
    last_seek_count: u32,
}

impl PositionReporter {
    #[must_use]
    pub fn new(seek_count: u32) -> Self {
        Self {
            last_reported: -1,
            last_seek_count: seek_count,
        }
    }

    /// Returns the position to report, or `None` when nothing changed.
    pub fn update(&mut self, position_ms: i64, seek_count: u32) -> Option<i64> {
        if seek_count != self.last_seek_count {
            self.last_seek_count = seek_count;
            self.last_reported = -1;
        }
        let position_ms = position_ms.max(self.last_reported);
        if position_ms == self.last_reported {
            return None;
        }
        self.last_reported = position_ms;
        Some(position_ms)
    }
}

fn refresh_subtitles(session: &Session, video_out: Option<&Arc<dyn VideoOutput>>, video_pts: f64) {
    while let Some(cue) = session.subq.peek() {
        match subtitle_action(
            cue.serial,
            session.subtitleq.serial(),
            cue.payload.start,
            cue.payload.end,
            video_pts,
        ) {
            SubtitleAction::Drop => {
                if let Some(out) = video_out {
                    out.clear_subtitle();
                }
                session.subq.next();
            }
            SubtitleAction::Show => {
                if let Some(out) = video_out {
                    out.show_subtitle(&cue.payload);
                }
                return;
            }
            SubtitleAction::Keep => return,
        }
    }
}

/// One pass over the picture queue. Returns the updated sleep budget.
fn refresh_video(
    session: &Arc<Session>,
    video_out: Option<&Arc<dyn VideoOutput>>,
    frame_drop: FrameDropPolicy,
    mut remaining_time: f64,
) -> f64 {
    let tuning = &session.tuning;
    let max_frame_duration = session.max_frame_duration();

    loop {
        if session.pictq.nb_remaining() == 0 {
            return remaining_time;
        }
        let Some(current) = session.pictq.peek() else {
            return remaining_time;
        };
        let last = session.pictq.peek_last();

        if current.serial != session.videoq.serial() {
            // Leftover from before a flush.
            session.pictq.next();
            continue;
        }
        if last.as_ref().map(|l| l.serial) != Some(current.serial) {
            session.set_frame_timer(now_secs());
        }
        if session.is_paused() && !session.step_pending() {
            return remaining_time;
        }

        let last_duration = last
            .as_ref()
            .map_or(0.0, |l| frame_display_duration(l, &current, max_frame_duration));
        let video_is_master = session.master_kind() == MasterSyncKind::Video;
        let diff = if video_is_master {
            0.0
        } else {
            session.vidclk.get() - session.master_clock()
        };
        let delay = compute_target_delay(last_duration, diff, max_frame_duration, tuning)
            / session.speed();

        let time = now_secs();
        let frame_timer = session.frame_timer();
        if time < frame_timer + delay {
            // Not due yet: sleep until it is (or the next tick).
            return (frame_timer + delay - time).min(remaining_time);
        }
        session.set_frame_timer(frame_timer + delay);
        if delay > 0.0 && time - session.frame_timer() > tuning.sync_threshold_max {
            // Timer fell too far behind wall time, re-anchor.
            session.set_frame_timer(time);
        }

        if !current.pts.is_nan() {
            session.vidclk.set(current.pts, current.serial);
            session
                .extclk
                .sync_to_slave(&session.vidclk, tuning.nosync_threshold);
        }

        if let Some(next) = session.pictq.peek_next() {
            let duration = frame_display_duration(&current, &next, max_frame_duration);
            if !session.step_pending()
                && frame_drop.allows_drop(video_is_master)
                && time > session.frame_timer() + duration
            {
                session.frame_drops_late.fetch_add(1, Ordering::Relaxed);
                session.pictq.next();
                continue;
            }
        }

        refresh_subtitles(session, video_out, current.pts);

        session.pictq.next();
        if let Some(out) = video_out {
            out.display(&current.payload);
        }
        if session.step_pending() && !session.is_paused() {
            session.clear_step();
            session.toggle_pause();
        }
        return remaining_time;
    }
}

fn playback_complete(session: &Session) -> bool {
    if !session.is_eof() || session.is_looping() || !session.all_decoders_finished() {
        return false;
    }
    if session.sampq.nb_remaining() != 0 || session.pictq.nb_remaining() != 0 {
        return false;
    }
    match (session.position_ms(), session.duration_ms()) {
        (Some(position), Some(duration)) => {
            (duration - position).abs() <= session.tuning.completion_epsilon_ms
        }
        // No duration to compare against: the drain alone decides.
        _ => true,
    }
}

/// The refresh background loop. Exits on session abort.
pub fn run(
    session: &Arc<Session>,
    video_out: Option<Arc<dyn VideoOutput>>,
    frame_drop: FrameDropPolicy,
    logger: Logger,
) {
    let mut remaining_time = 0.0f64;
    let mut reporter = PositionReporter::new(session.seek_count.load(Ordering::Acquire));
    let mut completed_fired = false;
    let mut completed_seek_count = session.seek_count.load(Ordering::Acquire);

    loop {
        if session.is_aborted() {
            break;
        }
        if remaining_time > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(remaining_time));
        }
        remaining_time = session.tuning.refresh_interval;

        if session.realtime.load(Ordering::Relaxed)
            && session.master_kind() == MasterSyncKind::External
        {
            let video = session
                .has_video
                .load(Ordering::Relaxed)
                .then(|| session.videoq.nb_packets());
            let audio = session
                .has_audio
                .load(Ordering::Relaxed)
                .then(|| session.audioq.nb_packets());
            let speed =
                external_clock_speed(session.extclk.speed(), video, audio, &session.tuning);
            if speed != session.extclk.speed() {
                session.extclk.set_speed(speed);
            }
        }

        if session.has_video.load(Ordering::Relaxed) {
            remaining_time =
                refresh_video(session, video_out.as_ref(), frame_drop, remaining_time);
        }

        let seek_count = session.seek_count.load(Ordering::Acquire);
        if let Some(position) = session.position_ms() {
            if let Some(report) = reporter.update(position, seek_count) {
                let duration = session.duration_ms().unwrap_or(-1);
                session.fire_position(report, duration);
            }
        }

        if seek_count != completed_seek_count {
            completed_seek_count = seek_count;
            completed_fired = false;
        }
        if !completed_fired && !session.is_paused() && playback_complete(session) {
            completed_fired = true;
            session.fire_completed();
        }
    }

    logger.debug("refresh loop exiting");
}
